//! Reactive query cache.
//!
//! Caches the results of asynchronous reads under structured [`QueryKey`]s:
//!
//! - **Staleness**: fresh data is served without I/O; stale or invalidated
//!   data triggers a fetch.
//! - **De-duplication**: concurrent loads of one key share a single fetch.
//! - **Retry**: failed fetches are retried a configured number of times.
//! - **Garbage collection**: unobserved entries are evicted after their
//!   collection window.
//! - **Notification**: observers see every state change synchronously, in
//!   registration order.
//!
//! ## Configuration
//!
//! Global defaults come from the `[query]` section of the settings file:
//!
//! ```toml
//! [query]
//! stale_time_ms = 0
//! gc_time_ms = 300000     # or "infinite"
//! retry_count = 0
//! ```

mod client;
mod config;
mod entry;
mod error;
mod fetch;
mod keys;
mod lock;
mod metrics;
mod observer;
mod options;
mod state;

pub use client::{QueryClient, QueryFilter, Subscription, Updater};
pub use config::CacheConfig;
pub use entry::{EntrySnapshot, Epoch};
pub use error::{BoxError, QueryError};
pub use fetch::{Completion, FetchFn, FetchHandle, FetchPolicy, FetchResult, FetchSource};
pub use keys::{QueryHash, QueryKey, canonicalize, matches};
pub use self::metrics::{
    METRIC_CACHE_HIT_TOTAL, METRIC_ENTRIES, METRIC_FETCH_DEDUPLICATED_TOTAL,
    METRIC_FETCH_ERROR_TOTAL, METRIC_FETCH_MS, METRIC_FETCH_RETRY_TOTAL,
    METRIC_FETCH_STARTED_TOTAL, METRIC_FETCH_SUPERSEDED_TOTAL, METRIC_GC_EVICT_TOTAL,
    describe_metrics,
};
pub use observer::{QueryObserver, SubscriptionId};
pub use options::{
    ErrorCallback, QueryOptions, ResolvedOptions, SettledCallback, SuccessCallback, Window,
};
pub use state::{QueryState, QueryStatus};
