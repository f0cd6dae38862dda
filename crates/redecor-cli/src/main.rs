mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use redecor_contracts::config::{Device, EngineKind, ServiceConfig};
use redecor_contracts::events::EventWriter;
use redecor_engine::{GenerationPipeline, UploadRequest};
use serde_json::{json, Map, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "redecor",
    version,
    about = "Room re-design by structure-conditioned image generation"
)]
struct Cli {
    /// JSON config file; `REDECOR_*` environment variables and flags override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP service.
    Serve(ServeArgs),
    /// Run one request from a local image and print the response.
    Generate(GenerateArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long)]
    bind: Option<String>,
    #[arg(long)]
    public_url: Option<String>,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    prompt: String,
    #[command(flatten)]
    overrides: ConfigOverrides,
}

#[derive(Debug, Args)]
struct ConfigOverrides {
    #[arg(long)]
    storage_root: Option<PathBuf>,
    #[arg(long)]
    engine: Option<EngineKind>,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    device: Option<Device>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    steps: Option<u32>,
}

impl ConfigOverrides {
    fn apply(&self, config: &mut ServiceConfig) {
        if let Some(root) = &self.storage_root {
            config.storage.root = root.clone();
        }
        if let Some(engine) = self.engine {
            config.generation.engine = engine;
        }
        if let Some(endpoint) = &self.endpoint {
            config.generation.endpoint = Some(endpoint.clone());
        }
        if let Some(device) = self.device {
            config.generation.device = device;
        }
        if let Some(seed) = self.seed {
            config.generation.seed = seed;
        }
        if let Some(steps) = self.steps {
            config.generation.steps = steps;
        }
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("redecor error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let env = |key: &str| std::env::var(key).ok();
    match cli.command {
        Command::Serve(args) => {
            let mut config = resolve_config(cli.config.as_deref(), env, &args.overrides)?;
            if let Some(bind) = args.bind {
                config.server.bind = bind;
            }
            if let Some(public_url) = args.public_url {
                config.server.public_base_url = public_url;
            }
            run_serve(config)
        }
        Command::Generate(args) => {
            let config = resolve_config(cli.config.as_deref(), env, &args.overrides)?;
            run_generate(config, args)
        }
    }
}

/// Defaults, then the config file, then environment, then command-line flags.
fn resolve_config(
    path: Option<&Path>,
    env: impl Fn(&str) -> Option<String>,
    overrides: &ConfigOverrides,
) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load(path, env)?;
    overrides.apply(&mut config);
    Ok(config)
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Loads the engine once and opens the shared event log.
fn build_pipeline(config: &ServiceConfig) -> Result<Arc<GenerationPipeline>> {
    let pipeline = GenerationPipeline::from_config(config).context("failed to start pipeline")?;
    let events = EventWriter::new(config.storage.events_path(), session_id());
    let payload = json!({
        "engine": pipeline.engine_name(),
        "device": pipeline.device(),
        "storage_root": config.storage.root.to_string_lossy(),
        "seed": config.generation.seed,
        "steps": config.generation.steps,
    });
    if let Err(err) = events.emit("service_started", map_object(payload)) {
        warn!("failed writing service_started event: {err:#}");
    }
    Ok(Arc::new(pipeline.with_events(events)))
}

fn run_serve(config: ServiceConfig) -> Result<i32> {
    // built outside the runtime: the http engine owns a blocking client
    let pipeline = build_pipeline(&config)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("redecor-http")
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(server::serve(config.server.clone(), pipeline))?;
    Ok(0)
}

fn run_generate(config: ServiceConfig, args: GenerateArgs) -> Result<i32> {
    let pipeline = build_pipeline(&config)?;
    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("failed reading {}", args.image.display()))?;

    match pipeline.run(UploadRequest::new(bytes, args.prompt)) {
        Ok(outcome) => {
            let response = outcome.response(&pipeline.settings().public_base_url);
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(0)
        }
        Err(err) => {
            let payload = json!({
                "detail": err.message,
                "kind": err.kind,
                "stage": err.stage,
                "request_id": err.request_id,
                "upload_id": err.upload_id,
            });
            eprintln!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(if err.kind.is_client_error() { 2 } else { 1 })
        }
    }
}

fn session_id() -> String {
    format!("session-{}-{}", unix_epoch_millis(), std::process::id())
}

fn unix_epoch_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
