use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_NEGATIVE_PROMPT: &str = "not a room, no people, no cartoon, no text";

/// Compute device handed to the generation engine at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Mps,
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Mps => "mps",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            other => bail!("unknown device '{other}' (expected cpu, cuda or mps)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Dryrun,
    Http,
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dryrun" => Ok(Self::Dryrun),
            "http" => Ok(Self::Http),
            other => bail!("unknown engine '{other}' (expected dryrun or http)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub generation: GenerationConfig,
    pub conditioning: ConditioningConfig,
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub public_base_url: String,
    pub max_body_bytes: usize,
    /// Browser origins allowed to call the API; `*` allows any.
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            public_base_url: "http://127.0.0.1:8000".to_string(),
            max_body_bytes: 25 * 1024 * 1024,
            cors_allowed_origins: vec!["*".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub uploads_dir: String,
    pub generated_dir: String,
    pub events_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            uploads_dir: "uploads".to_string(),
            generated_dir: "generated_images".to_string(),
            events_file: "events.jsonl".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn events_path(&self) -> PathBuf {
        self.root.join(&self.events_file)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub engine: EngineKind,
    pub device: Device,
    pub endpoint: Option<String>,
    pub negative_prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub max_steps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::Dryrun,
            device: Device::Cpu,
            endpoint: None,
            negative_prompt: DEFAULT_NEGATIVE_PROMPT.to_string(),
            seed: 0,
            steps: 30,
            max_steps: 150,
            width: 512,
            height: 512,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditioningConfig {
    pub detect_resolution: u32,
    pub edge_threshold: f32,
    /// Upper bound on either side of the detection raster.
    pub max_detect_side: u32,
}

impl Default for ConditioningConfig {
    fn default() -> Self {
        Self {
            detect_resolution: 512,
            edge_threshold: 0.1,
            max_detect_side: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_upload_bytes: usize,
    pub max_prompt_chars: usize,
    /// Largest accepted width or height of a decoded upload.
    pub max_image_side: u32,
    pub lock_wait_secs: u64,
    pub generation_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: 20 * 1024 * 1024,
            max_prompt_chars: 2000,
            max_image_side: 8192,
            lock_wait_secs: 300,
            generation_timeout_secs: 600,
        }
    }
}

impl LimitsConfig {
    /// `None` means wait without bound.
    pub fn lock_wait(&self) -> Option<Duration> {
        (self.lock_wait_secs > 0).then(|| Duration::from_secs(self.lock_wait_secs))
    }

    pub fn generation_timeout(&self) -> Option<Duration> {
        (self.generation_timeout_secs > 0)
            .then(|| Duration::from_secs(self.generation_timeout_secs))
    }
}

impl ServiceConfig {
    /// Defaults, then the optional JSON file, then `REDECOR_*` variables read
    /// through `lookup`.
    pub fn load(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing config {}", path.display()))
    }

    /// Applies `REDECOR_*` overrides read through `lookup`. Blank values are
    /// treated as unset.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let non_empty_env = |key: &str| non_empty(lookup(key));
        if let Some(value) = non_empty_env("REDECOR_BIND") {
            self.server.bind = value;
        }
        if let Some(value) = non_empty_env("REDECOR_PUBLIC_URL") {
            self.server.public_base_url = value;
        }
        if let Some(value) = non_empty_env("REDECOR_CORS_ORIGINS") {
            self.server.cors_allowed_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = non_empty_env("REDECOR_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(value);
        }
        if let Some(value) = non_empty_env("REDECOR_ENGINE") {
            self.generation.engine = value.parse()?;
        }
        if let Some(value) = non_empty_env("REDECOR_ENGINE_ENDPOINT") {
            self.generation.endpoint = Some(value);
        }
        if let Some(value) = non_empty_env("REDECOR_DEVICE") {
            self.generation.device = value.parse()?;
        }
        if let Some(value) = non_empty_env("REDECOR_SEED") {
            self.generation.seed = value
                .parse()
                .with_context(|| format!("REDECOR_SEED is not an integer: {value}"))?;
        }
        if let Some(value) = non_empty_env("REDECOR_STEPS") {
            self.generation.steps = value
                .parse()
                .with_context(|| format!("REDECOR_STEPS is not an integer: {value}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let generation = &self.generation;
        if generation.steps == 0 {
            bail!("generation.steps must be at least 1");
        }
        if generation.steps > generation.max_steps {
            bail!(
                "generation.steps ({}) exceeds generation.max_steps ({})",
                generation.steps,
                generation.max_steps
            );
        }
        for (name, value) in [("width", generation.width), ("height", generation.height)] {
            if value == 0 || value % 8 != 0 {
                bail!("generation.{name} must be a positive multiple of 8, got {value}");
            }
        }
        if generation.engine == EngineKind::Http
            && generation
                .endpoint
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .is_empty()
        {
            bail!("generation.endpoint is required for the http engine");
        }
        if self.conditioning.detect_resolution < 64 {
            bail!("conditioning.detect_resolution must be at least 64");
        }
        if self.conditioning.max_detect_side < self.conditioning.detect_resolution {
            bail!("conditioning.max_detect_side must be at least conditioning.detect_resolution");
        }
        if !(0.0..1.0).contains(&self.conditioning.edge_threshold) {
            bail!("conditioning.edge_threshold must be in [0, 1)");
        }
        if self.limits.max_upload_bytes == 0 {
            bail!("limits.max_upload_bytes must be positive");
        }
        if self.limits.max_image_side == 0 {
            bail!("limits.max_image_side must be positive");
        }
        if self
            .server
            .cors_allowed_origins
            .iter()
            .any(|origin| origin.trim().is_empty())
        {
            bail!("server.cors_allowed_origins must not contain blank entries");
        }
        if self.storage.uploads_dir == self.storage.generated_dir {
            bail!("storage.uploads_dir and storage.generated_dir must differ");
        }
        Ok(())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::env;

    use super::*;

    #[test]
    fn defaults_match_service_contract() -> anyhow::Result<()> {
        let config = ServiceConfig::default();
        config.validate()?;
        assert_eq!(config.generation.steps, 30);
        assert_eq!(config.generation.seed, 0);
        assert_eq!(config.generation.negative_prompt, DEFAULT_NEGATIVE_PROMPT);
        assert_eq!(config.generation.device, Device::Cpu);
        assert_eq!(config.storage.uploads_dir, "uploads");
        assert_eq!(config.storage.generated_dir, "generated_images");
        Ok(())
    }

    #[test]
    fn partial_file_keeps_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("redecor.json");
        std::fs::write(
            &path,
            r#"{"generation": {"device": "cuda", "steps": 12}, "limits": {"lock_wait_secs": 0}}"#,
        )?;
        let config = ServiceConfig::from_file(&path)?;
        assert_eq!(config.generation.device, Device::Cuda);
        assert_eq!(config.generation.steps, 12);
        assert_eq!(config.generation.width, 512);
        assert_eq!(config.limits.lock_wait(), None);
        assert_eq!(
            config.limits.generation_timeout(),
            Some(Duration::from_secs(600))
        );
        Ok(())
    }

    #[test]
    fn validate_rejects_bad_steps_and_dims() {
        let mut config = ServiceConfig::default();
        config.generation.steps = 0;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.generation.steps = 151;
        assert!(config.validate().is_err());

        let mut config = ServiceConfig::default();
        config.generation.width = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn http_engine_requires_endpoint() {
        let mut config = ServiceConfig::default();
        config.generation.engine = EngineKind::Http;
        assert!(config.validate().is_err());
        config.generation.endpoint = Some("http://127.0.0.1:7860/generate".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_file_and_blank_values_are_ignored() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("redecor.json");
        std::fs::write(
            &path,
            r#"{"generation": {"seed": 7, "steps": 12}, "server": {"bind": "0.0.0.0:9000"}}"#,
        )?;
        let mut config = ServiceConfig::from_file(&path)?;

        let env: HashMap<&str, &str> = [
            ("REDECOR_STEPS", "20"),
            ("REDECOR_SEED", "   "),
            ("REDECOR_BIND", ""),
            ("REDECOR_DEVICE", "gpu"),
            ("REDECOR_CORS_ORIGINS", "http://localhost:3000, ,https://app.example"),
        ]
        .into_iter()
        .collect();
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()))?;

        assert_eq!(config.generation.steps, 20);
        assert_eq!(config.generation.seed, 7);
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.generation.device, Device::Cuda);
        assert_eq!(
            config.server.cors_allowed_origins,
            vec!["http://localhost:3000", "https://app.example"]
        );
        Ok(())
    }

    #[test]
    fn malformed_env_number_is_an_error() {
        let mut config = ServiceConfig::default();
        let result = config.apply_overrides(|key| {
            (key == "REDECOR_STEPS").then(|| "thirty".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn process_env_blank_value_reads_as_unset() -> anyhow::Result<()> {
        // keys are unique to this test so parallel tests never observe them
        env::set_var("REDECOR_TEST_BLANK_SEED_53917", "  ");
        env::set_var("REDECOR_TEST_REAL_SEED_53917", " 11 ");
        assert_eq!(non_empty(env::var("REDECOR_TEST_BLANK_SEED_53917").ok()), None);
        assert_eq!(
            non_empty(env::var("REDECOR_TEST_REAL_SEED_53917").ok()),
            Some("11".to_string())
        );
        assert_eq!(non_empty(env::var("REDECOR_TEST_UNSET_53917").ok()), None);
        Ok(())
    }

    #[test]
    fn detection_cap_below_resolution_is_rejected() {
        let mut config = ServiceConfig::default();
        config.conditioning.max_detect_side = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn device_parses_aliases() -> anyhow::Result<()> {
        assert_eq!("GPU".parse::<Device>()?, Device::Cuda);
        assert_eq!(" cpu ".parse::<Device>()?, Device::Cpu);
        assert!("tpu".parse::<Device>().is_err());
        Ok(())
    }
}
