//! One cache entry per canonical key hash.

use serde::Serialize;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::error::QueryError;
use super::fetch::{FetchFn, FetchHandle};
use super::keys::{QueryHash, QueryKey};
use super::observer::{Notification, ObserverSet};
use super::options::{QueryOptions, Window};
use super::state::{QueryState, QueryStatus};

/// Fetch generation. Drawn from a client-wide monotonic counter, so a larger
/// epoch always belongs to a later fetch or cancellation.
pub type Epoch = u64;

/// A pending garbage-collection task for an entry.
pub(crate) struct GcTimer {
    pub(crate) token: u64,
    abort: AbortHandle,
}

impl GcTimer {
    pub(crate) fn new(token: u64, abort: AbortHandle) -> Self {
        Self { token, abort }
    }

    pub(crate) fn cancel(self) {
        self.abort.abort();
    }
}

pub(crate) struct CacheEntry<T> {
    pub(crate) hash: QueryHash,
    pub(crate) key: QueryKey,
    pub(crate) state: QueryState<T>,
    pub(crate) options: QueryOptions<T>,
    pub(crate) observers: ObserverSet<T>,
    pub(crate) in_flight: Option<FetchHandle<T>>,
    pub(crate) epoch: Epoch,
    /// Epoch drawn by the latest invalidation.
    pub(crate) invalidated_at: Epoch,
    pub(crate) fetch_fn: Option<FetchFn<T>>,
    pub(crate) updated_at: Option<Instant>,
    pub(crate) gc: Option<GcTimer>,
}

impl<T: Clone> CacheEntry<T> {
    pub(crate) fn new(key: QueryKey) -> Self {
        Self {
            hash: key.hash(),
            key,
            state: QueryState::idle(),
            options: QueryOptions::new(),
            observers: ObserverSet::new(),
            in_flight: None,
            epoch: 0,
            invalidated_at: 0,
            fetch_fn: None,
            updated_at: None,
            gc: None,
        }
    }

    /// Fresh entries can be served without a fetch.
    pub(crate) fn is_fresh(&self, now: Instant, stale_time: Window) -> bool {
        if self.state.status == QueryStatus::Idle || self.state.is_invalidated {
            return false;
        }
        if stale_time == Window::ZERO {
            return false;
        }
        self.updated_at
            .is_some_and(|at| stale_time.contains(now.saturating_duration_since(at)))
    }

    /// Unobserved and not fetching, so eligible for a collection timer.
    pub(crate) fn is_collectable(&self) -> bool {
        self.observers.is_empty() && self.in_flight.is_none()
    }

    pub(crate) fn cancel_gc(&mut self) {
        if let Some(timer) = self.gc.take() {
            timer.cancel();
        }
    }

    pub(crate) fn begin_fetch(&mut self, epoch: Epoch, handle: FetchHandle<T>) {
        self.cancel_gc();
        self.epoch = epoch;
        if self.state.data.is_none() {
            self.state.status = QueryStatus::Loading;
        }
        self.state.is_fetching = true;
        self.in_flight = Some(handle);
    }

    /// Commit the result of the fetch started at `self.epoch`. An
    /// invalidation made after that fetch began stays in effect.
    pub(crate) fn commit_success(&mut self, data: T, now: Instant) {
        let invalidated_since_start = self.invalidated_at > self.epoch;
        self.write_data(data, now);
        self.state.is_invalidated = invalidated_since_start;
        self.finish_fetch();
    }

    pub(crate) fn commit_error(&mut self, error: QueryError, attempts: u32) {
        self.state.status = QueryStatus::Error;
        self.state.error = Some(error);
        self.state.failure_count = attempts;
        self.finish_fetch();
    }

    /// Drop the in-flight fetch; its result will be discarded on arrival.
    pub(crate) fn cancel_fetch(&mut self, epoch: Epoch) {
        self.epoch = epoch;
        self.finish_fetch();
        if self.state.status == QueryStatus::Loading && self.state.data.is_none() {
            self.state.status = QueryStatus::Idle;
        }
    }

    pub(crate) fn write_data(&mut self, data: T, now: Instant) {
        self.state.status = QueryStatus::Success;
        self.state.data = Some(data);
        self.state.error = None;
        self.state.is_invalidated = false;
        self.state.failure_count = 0;
        self.state.data_update_count += 1;
        self.updated_at = Some(now);
    }

    pub(crate) fn invalidate(&mut self, epoch: Epoch) {
        self.state.is_invalidated = true;
        self.invalidated_at = epoch;
    }

    pub(crate) fn notification(&self) -> Notification<T> {
        Notification::new(self.observers.snapshot(), self.state.clone())
    }

    pub(crate) fn snapshot(&self, now: Instant, stale_time: Window) -> EntrySnapshot<T> {
        EntrySnapshot {
            key: self.key.clone(),
            hash: self.hash.clone(),
            state: self.state.clone(),
            observer_count: self.observers.len(),
            is_stale: !self.is_fresh(now, stale_time),
            has_fetch_fn: self.fetch_fn.is_some(),
            data_age_ms: self.updated_at.map(|at| {
                u64::try_from(now.saturating_duration_since(at).as_millis()).unwrap_or(u64::MAX)
            }),
        }
    }

    fn finish_fetch(&mut self) {
        self.in_flight = None;
        self.state.is_fetching = false;
    }
}

/// Read-only view of one entry for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot<T> {
    pub key: QueryKey,
    pub hash: QueryHash,
    pub state: QueryState<T>,
    pub observer_count: usize,
    pub is_stale: bool,
    pub has_fetch_fn: bool,
    pub data_age_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::query_key;

    fn entry() -> CacheEntry<u32> {
        CacheEntry::new(query_key!["products", 1])
    }

    #[tokio::test]
    async fn first_fetch_enters_loading() {
        let mut entry = entry();
        entry.begin_fetch(1, FetchHandle::cached(0));

        assert_eq!(entry.state.status, QueryStatus::Loading);
        assert!(entry.state.is_fetching);
        assert!(entry.in_flight.is_some());
    }

    #[tokio::test]
    async fn refetch_keeps_status_of_existing_data() {
        let mut entry = entry();
        entry.write_data(4, Instant::now());
        entry.begin_fetch(1, FetchHandle::cached(0));

        assert_eq!(entry.state.status, QueryStatus::Success);
        assert!(entry.state.is_fetching);
    }

    #[tokio::test]
    async fn success_clears_fetch_and_invalidation() {
        let mut entry = entry();
        entry.invalidate(1);
        entry.begin_fetch(2, FetchHandle::cached(0));
        entry.commit_success(8, Instant::now());

        assert_eq!(entry.state.data, Some(8));
        assert!(!entry.state.is_fetching);
        assert!(!entry.state.is_invalidated);
        assert!(entry.in_flight.is_none());
        assert_eq!(entry.state.data_update_count, 1);
    }

    #[tokio::test]
    async fn invalidation_during_fetch_survives_commit() {
        let mut entry = entry();
        entry.begin_fetch(1, FetchHandle::cached(0));
        entry.invalidate(2);
        entry.commit_success(8, Instant::now());

        assert_eq!(entry.state.data, Some(8));
        assert!(entry.state.is_invalidated);
        assert!(!entry.is_fresh(Instant::now(), Window::Infinite));
    }

    #[tokio::test]
    async fn error_keeps_previous_data() {
        let mut entry = entry();
        entry.write_data(4, Instant::now());
        entry.begin_fetch(2, FetchHandle::cached(0));
        entry.commit_error(QueryError::TaskFailed("boom".into()), 3);

        assert_eq!(entry.state.status, QueryStatus::Error);
        assert_eq!(entry.state.data, Some(4));
        assert_eq!(entry.state.failure_count, 3);
        assert!(!entry.state.is_fetching);
    }

    #[tokio::test]
    async fn cancel_reverts_first_load_to_idle() {
        let mut entry = entry();
        entry.begin_fetch(1, FetchHandle::cached(0));
        entry.cancel_fetch(2);

        assert_eq!(entry.state.status, QueryStatus::Idle);
        assert_eq!(entry.epoch, 2);
        assert!(!entry.state.is_fetching);
        assert!(entry.in_flight.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn freshness_follows_stale_time() {
        let mut entry = entry();
        let window = Window::from_millis(1000);
        assert!(!entry.is_fresh(Instant::now(), window));

        entry.write_data(1, Instant::now());
        assert!(entry.is_fresh(Instant::now(), window));
        assert!(!entry.is_fresh(Instant::now(), Window::ZERO));

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!entry.is_fresh(Instant::now(), window));
        assert!(entry.is_fresh(Instant::now(), Window::Infinite));

        entry.invalidate(1);
        assert!(!entry.is_fresh(Instant::now(), Window::Infinite));
    }
}
