use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redecor_contracts::artifacts::{Artifact, ArtifactKind, GenerationResponse};
use redecor_contracts::config::{Device, ServiceConfig};
use redecor_contracts::errors::{error_chain_text, ErrorKind, PipelineError, PipelineStage};
use redecor_contracts::events::EventWriter;
use redecor_contracts::receipts::{
    write_receipt, GenerationReceipt, ReceiptEngine, ReceiptRequest, RECEIPT_SCHEMA_VERSION,
};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::conditioning::{ConditioningExtractor, LineDetector};
use crate::decoder::ImageDecoder;
use crate::generation::{load_engine, GenerationEngine, GenerationRequest};
use crate::raster::OutputImage;
use crate::store::ArtifactStore;

const ERROR_TEXT_MAX_CHARS: usize = 1024;

/// One incoming call: raw upload bytes plus the prompt.
///
/// `seed` and `steps` override the configured defaults for this request only.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub image_bytes: Vec<u8>,
    pub prompt: String,
    pub seed: Option<u64>,
    pub steps: Option<u32>,
}

impl UploadRequest {
    pub fn new(image_bytes: Vec<u8>, prompt: impl Into<String>) -> Self {
        Self {
            image_bytes,
            prompt: prompt.into(),
            seed: None,
            steps: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub negative_prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub max_steps: u32,
    pub max_prompt_chars: usize,
    /// How long a request may queue for the engine. `None` waits forever.
    pub lock_wait: Option<Duration>,
    /// How long a request waits for a started generation. `None` waits forever.
    pub generation_timeout: Option<Duration>,
    pub public_base_url: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&ServiceConfig::default())
    }
}

impl PipelineSettings {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            negative_prompt: config.generation.negative_prompt.clone(),
            seed: config.generation.seed,
            steps: config.generation.steps,
            max_steps: config.generation.max_steps,
            max_prompt_chars: config.limits.max_prompt_chars,
            lock_wait: config.limits.lock_wait(),
            generation_timeout: config.limits.generation_timeout(),
            public_base_url: config.server.public_base_url.clone(),
        }
    }
}

/// Artifacts of a request that reached `Completed`.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub request_id: String,
    pub upload: Artifact,
    pub conditioning: Artifact,
    pub output: Artifact,
    pub receipt_path: Option<PathBuf>,
}

impl GenerationOutcome {
    pub fn response(&self, base_url: &str) -> GenerationResponse {
        GenerationResponse {
            request_id: self.request_id.clone(),
            original_image_url: self.upload.url(base_url),
            conditioning_image_url: self.conditioning.url(base_url),
            generated_image_url: self.output.url(base_url),
        }
    }
}

enum WorkerMessage {
    Started,
    LockTimedOut,
    Finished(anyhow::Result<OutputImage>),
}

/// Runs upload → decode → condition → generate → persist for one request.
///
/// Every stage except generation runs on the caller's thread and may overlap
/// with other requests. The engine sits behind a process-wide mutex and each
/// `generate` call runs on its own worker thread that holds the lock for the
/// whole call, so at most one generation is in flight even when a caller
/// stops waiting.
pub struct GenerationPipeline {
    decoder: ImageDecoder,
    extractor: Box<dyn ConditioningExtractor>,
    engine: Arc<Mutex<Box<dyn GenerationEngine>>>,
    engine_name: String,
    device: Device,
    store: ArtifactStore,
    events: Option<EventWriter>,
    settings: PipelineSettings,
}

impl GenerationPipeline {
    pub fn new(
        decoder: ImageDecoder,
        extractor: Box<dyn ConditioningExtractor>,
        engine: Box<dyn GenerationEngine>,
        store: ArtifactStore,
        settings: PipelineSettings,
    ) -> Self {
        let engine_name = engine.name().to_string();
        let device = engine.device();
        Self {
            decoder,
            extractor,
            engine: Arc::new(Mutex::new(engine)),
            engine_name,
            device,
            store,
            events: None,
            settings,
        }
    }

    /// Wires the default decoder, line detector, configured engine and store.
    pub fn from_config(config: &ServiceConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let engine = load_engine(&config.generation, config.limits.generation_timeout())?;
        let store = ArtifactStore::new(&config.storage)?;
        Ok(Self::new(
            ImageDecoder::new(config.limits.max_upload_bytes)
                .with_max_side(config.limits.max_image_side),
            Box::new(LineDetector::from_config(&config.conditioning)),
            engine,
            store,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn engine_name(&self) -> &str {
        &self.engine_name
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn run(&self, upload: UploadRequest) -> Result<GenerationOutcome, PipelineError> {
        let request_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        debug!(%request_id, bytes = upload.image_bytes.len(), "request received");
        self.emit(
            "request_received",
            json!({
                "request_id": request_id,
                "upload_bytes": upload.image_bytes.len(),
                "prompt_chars": upload.prompt.chars().count(),
            }),
        );

        let result = self.execute(&request_id, upload);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(outcome) => {
                info!(
                    %request_id,
                    upload_id = %outcome.upload.id,
                    output_id = %outcome.output.id,
                    elapsed_ms,
                    "request completed"
                );
                self.emit(
                    "request_completed",
                    json!({
                        "request_id": request_id,
                        "upload_id": outcome.upload.id,
                        "output_id": outcome.output.id,
                        "elapsed_ms": elapsed_ms,
                    }),
                );
            }
            Err(err) => {
                if err.kind.is_client_error() {
                    info!(%request_id, kind = %err.kind, "request rejected: {}", err.message);
                } else {
                    warn!(
                        %request_id,
                        kind = %err.kind,
                        stage = %err.stage,
                        upload_id = err.upload_id.as_deref().unwrap_or("-"),
                        "request failed: {}",
                        err.message
                    );
                }
                self.emit(
                    "request_failed",
                    json!({
                        "request_id": request_id,
                        "kind": err.kind,
                        "stage": err.stage,
                        "upload_id": err.upload_id,
                        "message": err.message,
                        "elapsed_ms": elapsed_ms,
                    }),
                );
            }
        }
        result
    }

    fn execute(
        &self,
        request_id: &str,
        upload: UploadRequest,
    ) -> Result<GenerationOutcome, PipelineError> {
        let fail = |kind: ErrorKind, stage: PipelineStage, message: String| {
            PipelineError::new(kind, stage, request_id, message)
        };
        let mut timings = BTreeMap::new();

        // Received: reject client mistakes before touching anything heavy.
        let prompt = upload.prompt.trim().to_string();
        if prompt.is_empty() {
            return Err(fail(
                ErrorKind::InvalidInput,
                PipelineStage::Received,
                "prompt must not be blank".to_string(),
            ));
        }
        let prompt_chars = prompt.chars().count();
        if prompt_chars > self.settings.max_prompt_chars {
            return Err(fail(
                ErrorKind::InvalidInput,
                PipelineStage::Received,
                format!(
                    "prompt is {prompt_chars} characters, limit is {}",
                    self.settings.max_prompt_chars
                ),
            ));
        }
        let steps = upload.steps.unwrap_or(self.settings.steps);
        if steps == 0 || steps > self.settings.max_steps {
            return Err(fail(
                ErrorKind::InvalidInput,
                PipelineStage::Received,
                format!("steps must be between 1 and {}, got {steps}", self.settings.max_steps),
            ));
        }
        let seed = upload.seed.unwrap_or(self.settings.seed);

        let stage_started = Instant::now();
        let canonical = self
            .decoder
            .decode(&upload.image_bytes)
            .map_err(|err| fail(err.kind(), PipelineStage::Received, err.to_string()))?;
        drop(upload);
        record(&mut timings, "decode", stage_started);

        // Decoded
        let stage_started = Instant::now();
        let upload_artifact = self
            .store
            .save(canonical.as_rgb(), ArtifactKind::Upload, None)
            .map_err(|err| {
                fail(
                    ErrorKind::StorageFailure,
                    PipelineStage::Decoded,
                    error_chain_text(&err, ERROR_TEXT_MAX_CHARS),
                )
            })?;
        record(&mut timings, "persist_upload", stage_started);
        self.artifact_created(request_id, &upload_artifact);
        let upload_id = Some(upload_artifact.id.as_str());

        let stage_started = Instant::now();
        let conditioning = self.extractor.extract(&canonical).map_err(|err| {
            fail(
                ErrorKind::ExtractionFailure,
                PipelineStage::Decoded,
                error_chain_text(&err, ERROR_TEXT_MAX_CHARS),
            )
            .with_upload(upload_id)
        })?;
        drop(canonical);
        record(&mut timings, "extract", stage_started);

        // Conditioned
        let stage_started = Instant::now();
        let control_id = format!("{}-control", upload_artifact.id);
        let conditioning_artifact = self
            .store
            .save(conditioning.as_rgb(), ArtifactKind::Conditioning, Some(&control_id))
            .map_err(|err| {
                fail(
                    ErrorKind::StorageFailure,
                    PipelineStage::Conditioned,
                    error_chain_text(&err, ERROR_TEXT_MAX_CHARS),
                )
                .with_upload(upload_id)
            })?;
        record(&mut timings, "persist_conditioning", stage_started);
        self.artifact_created(request_id, &conditioning_artifact);

        let generation = GenerationRequest {
            prompt: prompt.clone(),
            negative_prompt: self.settings.negative_prompt.clone(),
            conditioning,
            seed,
            steps,
        };
        let stage_started = Instant::now();
        let output = self
            .generate_exclusive(request_id, generation)
            .map_err(|(kind, message)| {
                fail(kind, PipelineStage::Conditioned, message).with_upload(upload_id)
            })?;
        record(&mut timings, "generate", stage_started);

        // Generated
        let stage_started = Instant::now();
        let output_artifact = self
            .store
            .save(output.as_rgb(), ArtifactKind::Output, None)
            .map_err(|err| {
                fail(
                    ErrorKind::StorageFailure,
                    PipelineStage::Generated,
                    error_chain_text(&err, ERROR_TEXT_MAX_CHARS),
                )
                .with_upload(upload_id)
            })?;
        record(&mut timings, "persist_output", stage_started);
        self.artifact_created(request_id, &output_artifact);

        // Persisted
        let receipt = GenerationReceipt {
            schema_version: RECEIPT_SCHEMA_VERSION,
            request_id: request_id.to_string(),
            created_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, false),
            request: ReceiptRequest {
                prompt,
                negative_prompt: self.settings.negative_prompt.clone(),
                seed,
                steps,
            },
            engine: ReceiptEngine {
                name: self.engine_name.clone(),
                device: self.device.to_string(),
            },
            upload: upload_artifact.clone(),
            conditioning: conditioning_artifact.clone(),
            output: output_artifact.clone(),
            output_sha256: hex::encode(Sha256::digest(output.as_rgb().as_raw())),
            timings_ms: timings,
        };
        let receipt_path = self.store.sidecar_path(&output_artifact);
        let receipt_path = match write_receipt(&receipt_path, &receipt) {
            Ok(()) => Some(receipt_path),
            Err(err) => {
                warn!(%request_id, "failed writing receipt {}: {err:#}", receipt_path.display());
                None
            }
        };

        Ok(GenerationOutcome {
            request_id: request_id.to_string(),
            upload: upload_artifact,
            conditioning: conditioning_artifact,
            output: output_artifact,
            receipt_path,
        })
    }

    /// Runs one `generate` under the engine lock on a dedicated worker.
    fn generate_exclusive(
        &self,
        request_id: &str,
        request: GenerationRequest,
    ) -> Result<OutputImage, (ErrorKind, String)> {
        let engine = Arc::clone(&self.engine);
        let lock_wait = self.settings.lock_wait;
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("redecor-generate".to_string())
            .spawn(move || {
                let guard = match lock_wait {
                    Some(wait) => engine.try_lock_for(wait),
                    None => Some(engine.lock()),
                };
                let Some(mut guard) = guard else {
                    let _ = tx.send(WorkerMessage::LockTimedOut);
                    return;
                };
                let _ = tx.send(WorkerMessage::Started);
                let result = guard.generate(&request);
                drop(guard);
                let _ = tx.send(WorkerMessage::Finished(result));
            })
            .map_err(|err| {
                (
                    ErrorKind::GenerationFailure,
                    format!("failed to spawn generation worker: {err}"),
                )
            })?;

        match rx.recv() {
            Ok(WorkerMessage::Started) => {}
            Ok(WorkerMessage::LockTimedOut) => {
                let waited = lock_wait.map(|wait| wait.as_secs_f64()).unwrap_or_default();
                return Err((
                    ErrorKind::Timeout,
                    format!("engine busy, gave up after waiting {waited:.1}s for exclusive access"),
                ));
            }
            Ok(WorkerMessage::Finished(_)) | Err(_) => {
                return Err((
                    ErrorKind::GenerationFailure,
                    "generation worker exited before acquiring the engine".to_string(),
                ));
            }
        }

        self.emit(
            "generation_started",
            json!({"request_id": request_id, "engine": self.engine_name, "device": self.device}),
        );
        let started = Instant::now();
        let finished = match self.settings.generation_timeout {
            Some(timeout) => rx.recv_timeout(timeout),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let result = match finished {
            Ok(WorkerMessage::Finished(Ok(image))) => Ok(image),
            Ok(WorkerMessage::Finished(Err(err))) => Err((
                ErrorKind::GenerationFailure,
                error_chain_text(&err, ERROR_TEXT_MAX_CHARS),
            )),
            Ok(WorkerMessage::Started | WorkerMessage::LockTimedOut) => Err((
                ErrorKind::GenerationFailure,
                "generation worker sent an unexpected message".to_string(),
            )),
            // the worker keeps the lock until the engine returns
            Err(RecvTimeoutError::Timeout) => Err((
                ErrorKind::Timeout,
                format!("generation did not finish within {elapsed_ms}ms"),
            )),
            Err(RecvTimeoutError::Disconnected) => Err((
                ErrorKind::GenerationFailure,
                "engine panicked during generation".to_string(),
            )),
        };
        self.emit(
            "generation_finished",
            json!({
                "request_id": request_id,
                "ok": result.is_ok(),
                "elapsed_ms": elapsed_ms,
            }),
        );
        result
    }

    fn artifact_created(&self, request_id: &str, artifact: &Artifact) {
        debug!(
            %request_id,
            artifact_id = %artifact.id,
            kind = %artifact.kind,
            "artifact persisted"
        );
        self.emit(
            "artifact_created",
            json!({
                "request_id": request_id,
                "artifact_id": artifact.id,
                "kind": artifact.kind,
                "location": artifact.location,
            }),
        );
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let Some(events) = &self.events else {
            return;
        };
        let payload: Map<String, Value> = payload.as_object().cloned().unwrap_or_default();
        if let Err(err) = events.emit(event_type, payload) {
            warn!("failed writing {event_type} event: {err:#}");
        }
    }
}

fn record(timings: &mut BTreeMap<String, u64>, stage: &str, started: Instant) {
    timings.insert(stage.to_string(), started.elapsed().as_millis() as u64);
}
