//! Fetch functions, the retry loop and the handles callers await.

use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use metrics::counter;
use tracing::debug;

use super::error::{BoxError, QueryError};
use super::keys::QueryKey;
use super::metrics::METRIC_FETCH_RETRY_TOTAL;

pub type FetchResult<T> = Result<T, QueryError>;

/// Caller-supplied asynchronous loader for one query.
///
/// Retained by the entry so invalidation and `refetch` can run it again.
pub struct FetchFn<T>(Arc<dyn Fn() -> BoxFuture<'static, Result<T, BoxError>> + Send + Sync>);

impl<T: Send + 'static> FetchFn<T> {
    pub fn new<F, Fut, E>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        Self(Arc::new(move || {
            f().map(|res| res.map_err(Into::<BoxError>::into)).boxed()
        }))
    }
}

impl<T> FetchFn<T> {
    fn call(&self) -> BoxFuture<'static, Result<T, BoxError>> {
        (self.0)()
    }
}

impl<T> Clone for FetchFn<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> fmt::Debug for FetchFn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FetchFn")
    }
}

/// Whether `fetch` may answer from fresh cached data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPolicy {
    /// Serve fresh, non-invalidated data from the cache.
    #[default]
    IfStale,
    /// Always load, unless a fetch for the entry is already in flight.
    Force,
}

/// Where a [`FetchHandle`] gets its result from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    /// Fresh data already in the cache; no I/O was started.
    Cache,
    /// Joined a fetch that was already running for the entry.
    InFlight,
    /// This call started a new fetch.
    Started,
}

type SharedFetch<T> = Shared<BoxFuture<'static, FetchResult<T>>>;

/// Deferred outcome of a `fetch`. Every caller de-duplicated onto the same
/// fetch awaits the same outcome.
pub struct FetchHandle<T> {
    source: FetchSource,
    inner: SharedFetch<T>,
}

impl<T: Clone + Send + Sync + 'static> FetchHandle<T> {
    pub(crate) fn cached(data: T) -> Self {
        Self {
            source: FetchSource::Cache,
            inner: futures::future::ready(Ok(data)).boxed().shared(),
        }
    }

    pub(crate) fn spawned(task: tokio::task::JoinHandle<FetchResult<T>>) -> Self {
        let inner = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => Err(QueryError::TaskFailed(err.to_string())),
            }
        }
        .boxed()
        .shared();
        Self {
            source: FetchSource::Started,
            inner,
        }
    }

    /// Another handle on the same fetch, marked as a de-duplicated join.
    pub(crate) fn joined(&self) -> Self {
        Self {
            source: FetchSource::InFlight,
            inner: self.inner.clone(),
        }
    }

    pub fn source(&self) -> FetchSource {
        self.source
    }
}

impl<T: Clone> IntoFuture for FetchHandle<T> {
    type Output = FetchResult<T>;
    type IntoFuture = SharedFetch<T>;

    fn into_future(self) -> Self::IntoFuture {
        self.inner
    }
}

impl<T> fmt::Debug for FetchHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchHandle")
            .field("source", &self.source)
            .finish()
    }
}

/// Combined handle over the fetches started by a bulk operation.
pub struct Completion<T> {
    handles: Vec<(QueryKey, FetchHandle<T>)>,
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    pub(crate) fn new(handles: Vec<(QueryKey, FetchHandle<T>)>) -> Self {
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
        self.handles.iter().map(|(key, _)| key)
    }
}

impl<T: Clone + Send + Sync + 'static> IntoFuture for Completion<T> {
    type Output = Vec<(QueryKey, FetchResult<T>)>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        let (keys, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();
        async move {
            let outcomes = join_all(handles.into_iter().map(IntoFuture::into_future)).await;
            keys.into_iter().zip(outcomes).collect()
        }
        .boxed()
    }
}

/// Run `fetch_fn` once plus up to `retry_count` more times until it succeeds.
///
/// Each attempt calls the fetch function from scratch. Returns the outcome and
/// the number of attempts made.
pub(crate) async fn run_with_retry<T>(
    fetch_fn: &FetchFn<T>,
    retry_count: u32,
    key: &str,
) -> (FetchResult<T>, u32) {
    let mut attempts = 0_u32;
    loop {
        attempts += 1;
        match attempt(fetch_fn).await {
            Ok(data) => return (Ok(data), attempts),
            Err(err) if attempts <= retry_count => {
                counter!(METRIC_FETCH_RETRY_TOTAL).increment(1);
                debug!(
                    query = key,
                    attempt = attempts,
                    retry_count,
                    error = %err,
                    "Query fetch failed, retrying"
                );
            }
            Err(err) => return (Err(QueryError::fetch(attempts, err)), attempts),
        }
    }
}

/// One call of the fetch function. A panic counts as a failed attempt so the
/// entry still settles.
async fn attempt<T>(fetch_fn: &FetchFn<T>) -> Result<T, BoxError> {
    match AssertUnwindSafe(async { fetch_fn.call().await })
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(payload) => Err(panic_message(payload.as_ref()).into()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    format!("fetch function panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn counting_fetch(fail_first: u32) -> (FetchFn<u32>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let fetch_fn = FetchFn::new(move || {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call <= fail_first {
                    Err(format!("attempt {call} failed"))
                } else {
                    Ok(call)
                }
            }
        });
        (fetch_fn, calls)
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let (fetch_fn, calls) = counting_fetch(0);
        let (outcome, attempts) = run_with_retry(&fetch_fn, 3, "[\"a\"]").await;
        assert_eq!(outcome.expect("fetch succeeds"), 1);
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let (fetch_fn, calls) = counting_fetch(2);
        let (outcome, attempts) = run_with_retry(&fetch_fn, 2, "[\"a\"]").await;
        assert_eq!(outcome.expect("third attempt succeeds"), 3);
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_budget() {
        let (fetch_fn, calls) = counting_fetch(u32::MAX);
        let (outcome, attempts) = run_with_retry(&fetch_fn, 2, "[\"a\"]").await;
        match outcome {
            Err(QueryError::Fetch { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "attempt 3 failed");
            }
            other => panic!("expected fetch error, got {other:?}"),
        }
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cached_handle_resolves_immediately() {
        let handle = FetchHandle::cached(5_u32);
        assert_eq!(handle.source(), FetchSource::Cache);
        assert_eq!(handle.await.expect("cached value"), 5);
    }

    #[tokio::test]
    async fn joined_handles_share_one_outcome() {
        let task = tokio::spawn(async { Ok::<u32, QueryError>(11) });
        let first = FetchHandle::spawned(task);
        let second = first.joined();

        assert_eq!(second.source(), FetchSource::InFlight);
        assert_eq!(second.await.expect("shared outcome"), 11);
        assert_eq!(first.await.expect("shared outcome"), 11);
    }

    #[tokio::test]
    async fn panicking_attempt_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let fetch_fn = FetchFn::new(move || {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call == 1 {
                    panic!("catalog decoder crashed");
                }
                Ok::<_, String>(call)
            }
        });

        let (outcome, attempts) = run_with_retry(&fetch_fn, 1, "[\"a\"]").await;
        assert_eq!(outcome.expect("second attempt succeeds"), 2);
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn panic_becomes_fetch_error() {
        let fetch_fn: FetchFn<u32> =
            FetchFn::new(|| -> futures::future::Ready<Result<u32, String>> {
                panic!("loader exploded")
            });

        let (outcome, attempts) = run_with_retry(&fetch_fn, 0, "[\"a\"]").await;
        match outcome {
            Err(QueryError::Fetch { attempts, source }) => {
                assert_eq!(attempts, 1);
                assert_eq!(source.to_string(), "fetch function panicked: loader exploded");
            }
            other => panic!("expected fetch error, got {other:?}"),
        }
        assert_eq!(attempts, 1);
    }
}
