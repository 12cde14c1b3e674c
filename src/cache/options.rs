//! Per-query options and their resolution against global defaults.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::config::CacheConfig;
use super::error::QueryError;

/// A staleness or garbage-collection window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Window {
    Finite(Duration),
    Infinite,
}

impl Window {
    pub const ZERO: Window = Window::Finite(Duration::ZERO);

    pub fn from_millis(ms: u64) -> Self {
        Window::Finite(Duration::from_millis(ms))
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Window::Infinite)
    }

    /// True if `elapsed` still falls inside the window.
    pub fn contains(&self, elapsed: Duration) -> bool {
        match self {
            Window::Finite(limit) => elapsed <= *limit,
            Window::Infinite => true,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Window::Finite(limit) => Some(*limit),
            Window::Infinite => None,
        }
    }
}

impl From<Duration> for Window {
    fn from(duration: Duration) -> Self {
        Window::Finite(duration)
    }
}

pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&QueryError) + Send + Sync>;
pub type SettledCallback<T> = Arc<dyn Fn(Result<&T, &QueryError>) + Send + Sync>;

/// Options for one query. Unset fields fall through to the next layer:
/// global defaults, then prefix defaults, then options remembered on the
/// entry, then options passed with the call.
pub struct QueryOptions<T> {
    pub stale_time: Option<Window>,
    pub gc_time: Option<Window>,
    pub retry_count: Option<u32>,
    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub on_settled: Option<SettledCallback<T>>,
}

impl<T> QueryOptions<T> {
    pub fn new() -> Self {
        Self {
            stale_time: None,
            gc_time: None,
            retry_count: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    pub fn with_stale_time(mut self, stale_time: impl Into<Window>) -> Self {
        self.stale_time = Some(stale_time.into());
        self
    }

    pub fn with_gc_time(mut self, gc_time: impl Into<Window>) -> Self {
        self.gc_time = Some(gc_time.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&QueryError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn on_settled(
        mut self,
        callback: impl Fn(Result<&T, &QueryError>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(callback));
        self
    }

    /// Layer `overrides` on top of `self`; fields set in `overrides` win.
    pub fn merged(&self, overrides: &QueryOptions<T>) -> QueryOptions<T> {
        QueryOptions {
            stale_time: overrides.stale_time.or(self.stale_time),
            gc_time: overrides.gc_time.or(self.gc_time),
            retry_count: overrides.retry_count.or(self.retry_count),
            on_success: overrides
                .on_success
                .clone()
                .or_else(|| self.on_success.clone()),
            on_error: overrides.on_error.clone().or_else(|| self.on_error.clone()),
            on_settled: overrides
                .on_settled
                .clone()
                .or_else(|| self.on_settled.clone()),
        }
    }

    /// Fill every unset field from the global defaults.
    pub fn resolve(&self, defaults: &CacheConfig) -> ResolvedOptions<T> {
        ResolvedOptions {
            stale_time: self.stale_time.unwrap_or(defaults.stale_time),
            gc_time: self.gc_time.unwrap_or(defaults.gc_time),
            retry_count: self.retry_count.unwrap_or(defaults.retry_count),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T> Default for QueryOptions<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        QueryOptions::new().merged(self)
    }
}

impl<T> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("stale_time", &self.stale_time)
            .field("gc_time", &self.gc_time)
            .field("retry_count", &self.retry_count)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

/// Fully resolved options, captured when a fetch starts.
pub struct ResolvedOptions<T> {
    pub stale_time: Window,
    pub gc_time: Window,
    pub retry_count: u32,
    pub on_success: Option<SuccessCallback<T>>,
    pub on_error: Option<ErrorCallback>,
    pub on_settled: Option<SettledCallback<T>>,
}

impl<T> ResolvedOptions<T> {
    /// Run the callbacks for a settled, non-superseded fetch.
    pub(crate) fn notify_settled(&self, outcome: &Result<T, QueryError>) {
        match outcome {
            Ok(data) => {
                if let Some(callback) = &self.on_success {
                    callback(data);
                }
            }
            Err(err) => {
                if let Some(callback) = &self.on_error {
                    callback(err);
                }
            }
        }
        if let Some(callback) = &self.on_settled {
            callback(outcome.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn overrides_win_over_base() {
        let base = QueryOptions::<u32>::new()
            .with_stale_time(Duration::from_secs(10))
            .with_retry_count(1);
        let call = QueryOptions::<u32>::new().with_retry_count(4);

        let merged = base.merged(&call);
        assert_eq!(merged.stale_time, Some(Window::from_millis(10_000)));
        assert_eq!(merged.retry_count, Some(4));
        assert_eq!(merged.gc_time, None);
    }

    #[test]
    fn resolve_falls_back_to_global_defaults() {
        let defaults = CacheConfig {
            stale_time: Window::from_millis(250),
            gc_time: Window::Infinite,
            retry_count: 2,
        };
        let resolved = QueryOptions::<u32>::new()
            .with_gc_time(Duration::from_millis(5))
            .resolve(&defaults);

        assert_eq!(resolved.stale_time, Window::from_millis(250));
        assert_eq!(resolved.gc_time, Window::from_millis(5));
        assert_eq!(resolved.retry_count, 2);
    }

    #[test]
    fn window_contains() {
        assert!(Window::ZERO.contains(Duration::ZERO));
        assert!(!Window::ZERO.contains(Duration::from_millis(1)));
        assert!(Window::Infinite.contains(Duration::from_secs(86_400)));
        assert!(Window::from_millis(1000).contains(Duration::from_millis(1000)));
    }

    #[test]
    fn settled_callbacks_fire_once_per_outcome() {
        let successes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));
        let settled = Arc::new(AtomicUsize::new(0));

        let options = {
            let successes = successes.clone();
            let errors = errors.clone();
            let settled = settled.clone();
            QueryOptions::<u32>::new()
                .on_success(move |_| {
                    successes.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |_| {
                    errors.fetch_add(1, Ordering::SeqCst);
                })
                .on_settled(move |_| {
                    settled.fetch_add(1, Ordering::SeqCst);
                })
        };
        let resolved = options.resolve(&CacheConfig::default());

        resolved.notify_settled(&Ok(7));
        resolved.notify_settled(&Err(QueryError::TaskFailed("boom".into())));

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(settled.load(Ordering::SeqCst), 2);
    }
}
