use std::collections::HashSet;
use std::convert::Infallible;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use storefront_query::cache::{
    CacheConfig, FetchFn, FetchPolicy, QueryClient, QueryFilter, QueryOptions, Window,
};
use storefront_query::query_key;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let client = QueryClient::<u32>::new(CacheConfig {
        gc_time: Window::from_millis(100),
        ..CacheConfig::default()
    });
    let fresh = QueryOptions::new().with_stale_time(Window::Infinite);

    // Fetch started, de-duplicated join, then a cache hit.
    let loader = FetchFn::new(|| async {
        sleep(Duration::from_millis(10)).await;
        Ok::<_, Infallible>(1_u32)
    });
    let started = client
        .fetch(query_key!["products"], Some(loader), fresh.clone(), FetchPolicy::IfStale)
        .expect("fetch starts");
    let joined = client
        .fetch(query_key!["products"], None, fresh.clone(), FetchPolicy::IfStale)
        .expect("fetch joins");
    joined.await.expect("joined result");
    started.await.expect("started result");
    client
        .fetch(query_key!["products"], None, fresh, FetchPolicy::IfStale)
        .expect("cache hit")
        .await
        .expect("cached value");

    // Retry and final failure.
    let broken = FetchFn::new(|| async { Err::<u32, _>("catalog unavailable") });
    let outcome = client
        .fetch(
            query_key!["cart"],
            Some(broken),
            QueryOptions::new().with_retry_count(1),
            FetchPolicy::IfStale,
        )
        .expect("fetch starts")
        .await;
    assert!(outcome.is_err());

    // Superseded result.
    let slow = FetchFn::new(|| async {
        sleep(Duration::from_millis(50)).await;
        Ok::<_, Infallible>(2_u32)
    });
    let superseded = client
        .fetch(query_key!["orders"], Some(slow), QueryOptions::new(), FetchPolicy::Force)
        .expect("fetch starts");
    client.cancel(QueryFilter::exact(query_key!["orders"]));
    superseded.await.expect("underlying work completes");

    // Garbage collection of the unobserved entries.
    sleep(Duration::from_millis(500)).await;
    assert!(client.is_empty());

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "storefront_query_cache_hit_total",
        "storefront_query_fetch_started_total",
        "storefront_query_fetch_deduplicated_total",
        "storefront_query_fetch_retry_total",
        "storefront_query_fetch_error_total",
        "storefront_query_fetch_superseded_total",
        "storefront_query_gc_evict_total",
        "storefront_query_fetch_ms",
        "storefront_query_entries",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
