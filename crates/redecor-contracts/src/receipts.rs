use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::artifacts::Artifact;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// The exact inputs that determine an output image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: u64,
    pub steps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEngine {
    pub name: String,
    pub device: String,
}

/// Sidecar record written next to every generated output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReceipt {
    pub schema_version: u64,
    pub request_id: String,
    pub created_at: String,
    pub request: ReceiptRequest,
    pub engine: ReceiptEngine,
    pub upload: Artifact,
    pub conditioning: Artifact,
    pub output: Artifact,
    pub output_sha256: String,
    /// Milliseconds spent in each stage, keyed by stage name.
    #[serde(default)]
    pub timings_ms: BTreeMap<String, u64>,
}

impl GenerationReceipt {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

pub fn write_receipt(path: &Path, receipt: &GenerationReceipt) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(receipt)?)?;
    Ok(())
}
