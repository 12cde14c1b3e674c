use thiserror::Error;

use crate::{cache::QueryError, config::LoadError, infra::error::InfraError};

/// Top-level error of the `storefront-query` binary.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_sources_transparently() {
        let err = AppError::from(QueryError::missing_fetch_fn(r#"["cart"]"#));
        assert_eq!(err.to_string(), r#"no fetch function is known for query ["cart"]"#);

        let err = AppError::from(InfraError::telemetry("already set"));
        assert_eq!(err.to_string(), "telemetry initialization failed: already set");
    }

    #[test]
    fn validation_message() {
        let err = AppError::validation("bad key");
        assert_eq!(err.to_string(), "validation failed: bad key");
    }
}
