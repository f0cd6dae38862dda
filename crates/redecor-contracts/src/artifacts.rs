use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Upload,
    Conditioning,
    Output,
}

impl ArtifactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Conditioning => "conditioning",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted image. Immutable once created.
///
/// `location` is relative to the public root (`uploads/<id>.png`), so it can
/// be joined onto any base URL; `path` is where the bytes live on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub kind: ArtifactKind,
    pub location: String,
    pub path: PathBuf,
}

impl Artifact {
    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.location.trim_start_matches('/')
        )
    }
}

/// What the caller receives when a request reaches `Completed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub request_id: String,
    pub original_image_url: String,
    pub conditioning_image_url: String,
    pub generated_image_url: String,
}
