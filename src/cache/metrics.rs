//! Metric names emitted by the query cache, and their descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

pub const METRIC_CACHE_HIT_TOTAL: &str = "storefront_query_cache_hit_total";
pub const METRIC_FETCH_STARTED_TOTAL: &str = "storefront_query_fetch_started_total";
pub const METRIC_FETCH_DEDUPLICATED_TOTAL: &str = "storefront_query_fetch_deduplicated_total";
pub const METRIC_FETCH_RETRY_TOTAL: &str = "storefront_query_fetch_retry_total";
pub const METRIC_FETCH_ERROR_TOTAL: &str = "storefront_query_fetch_error_total";
pub const METRIC_FETCH_SUPERSEDED_TOTAL: &str = "storefront_query_fetch_superseded_total";
pub const METRIC_GC_EVICT_TOTAL: &str = "storefront_query_gc_evict_total";
pub const METRIC_FETCH_MS: &str = "storefront_query_fetch_ms";
pub const METRIC_ENTRIES: &str = "storefront_query_entries";

static DESCRIBED: Once = Once::new();

/// Describe the query cache metrics to the installed recorder. Call after
/// installing a recorder; later calls do nothing.
pub fn describe_metrics() {
    DESCRIBED.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT_TOTAL,
            Unit::Count,
            "Fetches answered from fresh cached data."
        );
        describe_counter!(METRIC_FETCH_STARTED_TOTAL, Unit::Count, "Fetches started.");
        describe_counter!(
            METRIC_FETCH_DEDUPLICATED_TOTAL,
            Unit::Count,
            "Fetch requests joined onto a fetch already in flight."
        );
        describe_counter!(
            METRIC_FETCH_RETRY_TOTAL,
            Unit::Count,
            "Fetch attempts retried after a failure or panic."
        );
        describe_counter!(
            METRIC_FETCH_ERROR_TOTAL,
            Unit::Count,
            "Fetches that failed after exhausting their retries."
        );
        describe_counter!(
            METRIC_FETCH_SUPERSEDED_TOTAL,
            Unit::Count,
            "Fetch results discarded because a cancel or newer fetch superseded them."
        );
        describe_counter!(
            METRIC_GC_EVICT_TOTAL,
            Unit::Count,
            "Unobserved entries evicted when their collection window elapsed."
        );
        describe_histogram!(
            METRIC_FETCH_MS,
            Unit::Milliseconds,
            "Wall time of a fetch across all attempts."
        );
        describe_gauge!(METRIC_ENTRIES, Unit::Count, "Entries currently cached.");
    });
}
