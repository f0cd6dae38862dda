mod dryrun;
mod http;

use std::time::Duration;

use anyhow::{Context, Result};
use redecor_contracts::config::{Device, EngineKind, GenerationConfig};

use crate::raster::{ConditioningImage, OutputImage};

pub use dryrun::DryrunEngine;
pub use http::HttpEngine;

/// Everything that determines an output image.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub conditioning: ConditioningImage,
    pub seed: u64,
    pub steps: u32,
}

/// The shared conditional generative model.
///
/// Engines are loaded once at startup and are **not reentrant**: `generate`
/// takes `&mut self` and callers must hold exclusive access for the whole
/// call. Identical requests must produce identical outputs; engines may not
/// draw randomness from anywhere but `request.seed`.
pub trait GenerationEngine: Send {
    fn name(&self) -> &str;
    fn device(&self) -> Device;
    fn generate(&mut self, request: &GenerationRequest) -> Result<OutputImage>;
}

/// Builds the configured engine on its device.
pub fn load_engine(
    config: &GenerationConfig,
    timeout: Option<Duration>,
) -> Result<Box<dyn GenerationEngine>> {
    match config.engine {
        EngineKind::Dryrun => Ok(Box::new(DryrunEngine::new(
            config.device,
            config.width,
            config.height,
        ))),
        EngineKind::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .context("generation.endpoint is required for the http engine")?;
            let engine = HttpEngine::new(
                endpoint,
                config.device,
                config.width,
                config.height,
                timeout,
            )?;
            Ok(Box::new(engine))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_engine_defaults_to_dryrun_on_configured_device() -> anyhow::Result<()> {
        let config = GenerationConfig {
            device: Device::Cuda,
            ..GenerationConfig::default()
        };
        let engine = load_engine(&config, None)?;
        assert_eq!(engine.name(), "dryrun");
        assert_eq!(engine.device(), Device::Cuda);
        Ok(())
    }

    #[test]
    fn load_engine_http_requires_endpoint() {
        let config = GenerationConfig {
            engine: EngineKind::Http,
            endpoint: Some("   ".to_string()),
            ..GenerationConfig::default()
        };
        assert!(load_engine(&config, None).is_err());
    }
}
