use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("invalid snapshot `{path}`: {message}")]
    Snapshot { path: String, message: String },
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn snapshot(path: &Path, message: impl Into<String>) -> Self {
        Self::Snapshot {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}
