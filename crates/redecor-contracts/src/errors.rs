use std::fmt;

use serde::{Deserialize, Serialize};

/// Failure taxonomy for a single generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    UnsupportedFormat,
    ExtractionFailure,
    GenerationFailure,
    StorageFailure,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::UnsupportedFormat => "unsupported_format",
            Self::ExtractionFailure => "extraction_failure",
            Self::GenerationFailure => "generation_failure",
            Self::StorageFailure => "storage_failure",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_client_error(self) -> bool {
        matches!(self, Self::InvalidInput | Self::UnsupportedFormat)
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidInput | Self::UnsupportedFormat => 400,
            Self::ExtractionFailure | Self::GenerationFailure | Self::StorageFailure => 500,
            Self::Timeout => 504,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a request in the pipeline state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Received,
    Decoded,
    Conditioned,
    Generated,
    Persisted,
    Completed,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Decoded => "decoded",
            Self::Conditioned => "conditioned",
            Self::Generated => "generated",
            Self::Persisted => "persisted",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a pipeline invocation.
///
/// `stage` is the last state the request reached before failing. Artifacts
/// persisted before the failure are kept, and `upload_id` points at the upload
/// when one exists.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} at stage {stage}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub stage: PipelineStage,
    pub request_id: String,
    pub upload_id: Option<String>,
    pub message: String,
}

impl PipelineError {
    pub fn new(
        kind: ErrorKind,
        stage: PipelineStage,
        request_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            stage,
            request_id: request_id.into(),
            upload_id: None,
            message: message.into(),
        }
    }

    pub fn with_upload(mut self, upload_id: Option<&str>) -> Self {
        self.upload_id = upload_id.map(str::to_string);
        self
    }

    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}

/// Renders an anyhow chain as `outer: inner: root`, capped at `max_chars`.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut text = String::new();
    for (idx, cause) in err.chain().enumerate() {
        if idx > 0 {
            text.push_str(": ");
        }
        text.push_str(&cause.to_string());
    }
    if text.chars().count() > max_chars {
        let truncated: String = text.chars().take(max_chars).collect();
        return format!("{truncated}...");
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_400() {
        assert_eq!(ErrorKind::InvalidInput.http_status(), 400);
        assert_eq!(ErrorKind::UnsupportedFormat.http_status(), 400);
        assert!(ErrorKind::InvalidInput.is_client_error());
        assert!(!ErrorKind::StorageFailure.is_client_error());
    }

    #[test]
    fn server_faults_map_to_5xx() {
        for kind in [
            ErrorKind::ExtractionFailure,
            ErrorKind::GenerationFailure,
            ErrorKind::StorageFailure,
        ] {
            assert_eq!(kind.http_status(), 500);
        }
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
    }

    #[test]
    fn display_names_kind_and_stage() {
        let err = PipelineError::new(
            ErrorKind::GenerationFailure,
            PipelineStage::Conditioned,
            "req-1",
            "out of memory",
        )
        .with_upload(Some("u-1"));
        assert_eq!(
            err.to_string(),
            "generation_failure at stage conditioned: out of memory"
        );
        assert_eq!(err.upload_id.as_deref(), Some("u-1"));
    }

    #[test]
    fn error_chain_text_joins_and_truncates() {
        let err = anyhow::anyhow!("root cause").context("while saving");
        assert_eq!(error_chain_text(&err, 200), "while saving: root cause");
        assert_eq!(error_chain_text(&err, 5), "while...");
    }
}
