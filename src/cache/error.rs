use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Error returned by a caller-supplied fetch function.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors surfaced by the query client.
///
/// Cloneable so one fetch outcome can be handed to every de-duplicated caller
/// and stored in the entry state at the same time.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// `fetch` was asked to load a key without a fetch function and none is
    /// remembered for it.
    #[error("no fetch function is known for query {key}")]
    MissingFetchFn { key: String },
    /// The fetch function failed on every attempt.
    #[error("fetch failed after {attempts} attempt(s): {source}")]
    Fetch {
        attempts: u32,
        #[source]
        source: Arc<dyn StdError + Send + Sync + 'static>,
    },
    /// The fetch task was aborted, or no tokio runtime was available to run it.
    #[error("fetch task failed: {0}")]
    TaskFailed(String),
}

impl QueryError {
    pub fn missing_fetch_fn(key: impl Into<String>) -> Self {
        Self::MissingFetchFn { key: key.into() }
    }

    pub fn fetch(attempts: u32, source: BoxError) -> Self {
        Self::Fetch {
            attempts,
            source: Arc::from(source),
        }
    }

    /// True for errors raised synchronously because the call itself was
    /// misconfigured, as opposed to a failed fetch.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::MissingFetchFn { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_keeps_source_message() {
        let err = QueryError::fetch(3, "upstream returned 503".into());
        assert_eq!(
            err.to_string(),
            "fetch failed after 3 attempt(s): upstream returned 503"
        );
        assert!(err.source().is_some());
        assert!(!err.is_configuration());
    }

    #[test]
    fn missing_fetch_fn_is_configuration_error() {
        let err = QueryError::missing_fetch_fn(r#"["cart"]"#);
        assert!(err.is_configuration());
        assert!(err.to_string().contains(r#"["cart"]"#));
    }
}
