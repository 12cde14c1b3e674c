//! Global query defaults.
//!
//! Populated from the `[query]` table of `storefront-query.toml` (see
//! `crate::config`) or constructed directly by embedding code and tests.

use std::time::Duration;

use super::options::Window;

const DEFAULT_STALE_TIME: Duration = Duration::ZERO;
const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);
const DEFAULT_RETRY_COUNT: u32 = 0;

/// Lowest-precedence options applied to every query of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// How long fetched data counts as fresh.
    pub stale_time: Window,
    /// How long an unobserved entry is kept before eviction.
    pub gc_time: Window,
    /// Extra attempts after a failed fetch.
    pub retry_count: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            stale_time: Window::Finite(DEFAULT_STALE_TIME),
            gc_time: Window::Finite(DEFAULT_GC_TIME),
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }
}

impl From<&crate::config::QuerySettings> for CacheConfig {
    fn from(settings: &crate::config::QuerySettings) -> Self {
        Self {
            stale_time: settings.stale_time,
            gc_time: settings.gc_time,
            retry_count: settings.retry_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuerySettings;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.stale_time, Window::ZERO);
        assert_eq!(config.gc_time, Window::from_millis(300_000));
        assert_eq!(config.retry_count, 0);
    }

    #[test]
    fn converts_from_settings() {
        let settings = QuerySettings {
            stale_time: Window::Infinite,
            gc_time: Window::from_millis(100),
            retry_count: 3,
        };
        let config = CacheConfig::from(&settings);
        assert!(config.stale_time.is_infinite());
        assert_eq!(config.gc_time, Window::from_millis(100));
        assert_eq!(config.retry_count, 3);
    }
}
