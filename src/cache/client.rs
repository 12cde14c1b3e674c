//! Query client: owns the entry table and implements fetch orchestration,
//! the cache mutation surface, subscriptions and garbage collection.
//!
//! All table mutations happen under one client-wide mutex. Observer
//! notifications are queued while the lock is held and delivered in that
//! order after it is released, so listeners may call back into the client.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use metrics::{counter, gauge, histogram};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::config::CacheConfig;
use super::entry::{CacheEntry, EntrySnapshot, Epoch, GcTimer};
use super::error::QueryError;
use super::fetch::{
    Completion, FetchFn, FetchHandle, FetchPolicy, FetchResult, FetchSource, run_with_retry,
};
use super::keys::{self, QueryHash, QueryKey};
use super::lock::mutex_lock;
use super::metrics::{
    METRIC_CACHE_HIT_TOTAL, METRIC_ENTRIES, METRIC_FETCH_DEDUPLICATED_TOTAL,
    METRIC_FETCH_ERROR_TOTAL, METRIC_FETCH_MS, METRIC_FETCH_STARTED_TOTAL,
    METRIC_FETCH_SUPERSEDED_TOTAL, METRIC_GC_EVICT_TOTAL,
};
use super::observer::{
    Notification, NotificationQueue, QueryObserver, SharedObserver, SubscriptionId,
};
use super::options::{QueryOptions, ResolvedOptions, Window};
use super::state::QueryState;

const SOURCE: &str = "cache::client";

/// Selects the entries a bulk operation applies to.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    /// Key or key prefix; `None` selects every entry.
    pub key: Option<QueryKey>,
    /// Require the whole key to match rather than a prefix.
    pub exact: bool,
}

impl QueryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn prefix(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            exact: false,
        }
    }

    pub fn exact(key: impl Into<QueryKey>) -> Self {
        Self {
            key: Some(key.into()),
            exact: true,
        }
    }

    pub fn matches(&self, key: &QueryKey) -> bool {
        keys::matches(key, self.key.as_ref(), self.exact)
    }
}

impl fmt::Display for QueryFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.key, self.exact) {
            (None, _) => f.write_str("all"),
            (Some(key), true) => write!(f, "exact:{key}"),
            (Some(key), false) => write!(f, "prefix:{key}"),
        }
    }
}

/// New data for `set_data`: a literal value or a pure function of the
/// previous value.
pub enum Updater<T> {
    Value(T),
    Transform(Box<dyn FnOnce(Option<&T>) -> T + Send>),
}

impl<T> Updater<T> {
    /// The transform runs while the entry table is locked; it must not call
    /// back into the client.
    pub fn with(transform: impl FnOnce(Option<&T>) -> T + Send + 'static) -> Self {
        Updater::Transform(Box::new(transform))
    }

    fn apply(self, previous: Option<&T>) -> T {
        match self {
            Updater::Value(value) => value,
            Updater::Transform(transform) => transform(previous),
        }
    }
}

impl<T> From<T> for Updater<T> {
    fn from(value: T) -> Self {
        Updater::Value(value)
    }
}

/// Disposer returned by [`QueryClient::subscribe`]. Unsubscribes when
/// [`Subscription::unsubscribe`] is called or when dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: SubscriptionId,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

struct Table<T> {
    entries: HashMap<QueryHash, CacheEntry<T>>,
    prefix_defaults: Vec<(QueryKey, QueryOptions<T>)>,
}

/// Global defaults, then matching prefix defaults in registration order,
/// then the options remembered on the entry.
fn resolve_options<T>(
    config: &CacheConfig,
    prefix_defaults: &[(QueryKey, QueryOptions<T>)],
    entry: &CacheEntry<T>,
) -> ResolvedOptions<T> {
    prefix_defaults
        .iter()
        .filter(|(prefix, _)| entry.key.matches(prefix, false))
        .fold(QueryOptions::new(), |layered, (_, options)| {
            layered.merged(options)
        })
        .merged(&entry.options)
        .resolve(config)
}

fn entry_for<'a, T: Clone>(
    entries: &'a mut HashMap<QueryHash, CacheEntry<T>>,
    key: &QueryKey,
) -> &'a mut CacheEntry<T> {
    let len_if_created = entries.len() + 1;
    let entry = entries.entry(key.hash()).or_insert_with(|| {
        gauge!(METRIC_ENTRIES).set(len_if_created as f64);
        debug!(query = %key, "Created query cache entry");
        CacheEntry::new(key.clone())
    });
    // Semantically equal keys may arrive as structurally different values.
    entry.key = key.clone();
    entry
}

struct ClientInner<T> {
    config: CacheConfig,
    table: Mutex<Table<T>>,
    notifications: NotificationQueue<T>,
    epochs: AtomicU64,
    subscriptions: AtomicU64,
    gc_tokens: AtomicU64,
}

impl<T> ClientInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn next_epoch(&self) -> Epoch {
        self.epochs.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Join the entry's in-flight fetch or start a new one with its
    /// remembered fetch function.
    fn fetch_locked(
        self: &Arc<Self>,
        entry: &mut CacheEntry<T>,
        resolved: ResolvedOptions<T>,
    ) -> Result<FetchHandle<T>, QueryError> {
        if let Some(in_flight) = &entry.in_flight {
            counter!(METRIC_FETCH_DEDUPLICATED_TOTAL).increment(1);
            debug!(query = %entry.hash, "Joined in-flight query fetch");
            return Ok(in_flight.joined());
        }
        let Some(fetch_fn) = entry.fetch_fn.clone() else {
            return Err(QueryError::missing_fetch_fn(entry.key.to_string()));
        };

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| QueryError::TaskFailed(format!("no tokio runtime: {err}")))?;

        let epoch = self.next_epoch();
        let task = runtime.spawn(Arc::clone(self).run_fetch(
            entry.hash.clone(),
            epoch,
            fetch_fn,
            resolved,
        ));
        let handle = FetchHandle::spawned(task);
        entry.begin_fetch(epoch, handle.joined());

        counter!(METRIC_FETCH_STARTED_TOTAL).increment(1);
        debug!(query = %entry.hash, epoch, "Started query fetch");
        Ok(handle)
    }

    async fn run_fetch(
        self: Arc<Self>,
        hash: QueryHash,
        epoch: Epoch,
        fetch_fn: FetchFn<T>,
        resolved: ResolvedOptions<T>,
    ) -> FetchResult<T> {
        let started_at = Instant::now();
        let (outcome, attempts) =
            run_with_retry(&fetch_fn, resolved.retry_count, hash.as_str()).await;
        histogram!(METRIC_FETCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        if let Err(err) = &outcome {
            counter!(METRIC_FETCH_ERROR_TOTAL).increment(1);
            warn!(query = %hash, attempts, error = %err, "Query fetch failed");
        }

        if self.settle(&hash, epoch, &outcome, attempts) {
            resolved.notify_settled(&outcome);
        }
        outcome
    }

    /// Commit a fetch outcome unless a newer fetch or a cancellation has
    /// superseded it. Returns true if the outcome was committed.
    fn settle(
        self: &Arc<Self>,
        hash: &QueryHash,
        epoch: Epoch,
        outcome: &FetchResult<T>,
        attempts: u32,
    ) -> bool {
        {
            let mut table = mutex_lock(&self.table, SOURCE, "settle");
            let Table {
                entries,
                prefix_defaults,
            } = &mut *table;

            let Some(entry) = entries.get_mut(hash).filter(|entry| entry.epoch == epoch) else {
                counter!(METRIC_FETCH_SUPERSEDED_TOTAL).increment(1);
                debug!(query = %hash, epoch, "Discarded superseded query result");
                return false;
            };

            match outcome {
                Ok(data) => entry.commit_success(data.clone(), Instant::now()),
                Err(err) => entry.commit_error(err.clone(), attempts),
            }
            let gc_time = resolve_options(&self.config, prefix_defaults, entry).gc_time;
            self.refresh_gc(entry, gc_time);
            self.notifications.push(entry.notification());
        }

        self.notifications.drain();
        true
    }

    /// Cancel any pending collection timer and, if the entry is unobserved
    /// and idle, start a new one for its garbage-collection window.
    fn refresh_gc(self: &Arc<Self>, entry: &mut CacheEntry<T>, gc_time: Window) {
        entry.cancel_gc();
        if !entry.is_collectable() {
            return;
        }
        let Some(delay) = gc_time.as_duration() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(query = %entry.hash, "No tokio runtime, garbage collection not scheduled");
            return;
        };

        let token = self.gc_tokens.fetch_add(1, Ordering::SeqCst);
        let weak = Arc::downgrade(self);
        let hash = entry.hash.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.collect(&hash, token);
            }
        });
        entry.gc = Some(GcTimer::new(token, task.abort_handle()));
        debug!(query = %entry.hash, gc_time = ?delay, "Scheduled query garbage collection");
    }

    fn collect(&self, hash: &QueryHash, token: u64) {
        let mut table = mutex_lock(&self.table, SOURCE, "collect");
        let armed = table
            .entries
            .get(hash)
            .and_then(|entry| entry.gc.as_ref())
            .is_some_and(|timer| timer.token == token);
        if !armed {
            return;
        }

        table.entries.remove(hash);
        counter!(METRIC_GC_EVICT_TOTAL).increment(1);
        gauge!(METRIC_ENTRIES).set(table.entries.len() as f64);
        debug!(query = %hash, "Garbage-collected query cache entry");
    }

    fn unsubscribe(self: &Arc<Self>, hash: &QueryHash, id: SubscriptionId) {
        let mut table = mutex_lock(&self.table, SOURCE, "unsubscribe");
        let Table {
            entries,
            prefix_defaults,
        } = &mut *table;

        let Some(entry) = entries.get_mut(hash) else {
            return;
        };
        if entry.observers.remove(id) && entry.observers.is_empty() {
            let gc_time = resolve_options(&self.config, prefix_defaults, entry).gc_time;
            self.refresh_gc(entry, gc_time);
        }
    }
}

/// In-process cache of asynchronous read results.
///
/// Cloning is cheap and yields a handle on the same cache. Operations that
/// start fetches or schedule garbage collection must run inside a tokio
/// runtime.
pub struct QueryClient<T> {
    inner: Arc<ClientInner<T>>,
}

impl<T> Clone for QueryClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for QueryClient<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<T> QueryClient<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                table: Mutex::new(Table {
                    entries: HashMap::new(),
                    prefix_defaults: Vec::new(),
                }),
                notifications: NotificationQueue::new(),
                epochs: AtomicU64::new(0),
                subscriptions: AtomicU64::new(0),
                gc_tokens: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Register options for every key under `prefix`. Registering the same
    /// prefix again replaces its options.
    pub fn set_query_defaults(&self, prefix: impl Into<QueryKey>, options: QueryOptions<T>) {
        let prefix = prefix.into();
        let hash = prefix.hash();
        let mut table = mutex_lock(&self.inner.table, SOURCE, "set_query_defaults");
        let existing = table
            .prefix_defaults
            .iter()
            .position(|(registered, _)| registered.hash() == hash);
        match existing {
            Some(index) => table.prefix_defaults[index].1 = options,
            None => table.prefix_defaults.push((prefix, options)),
        }
    }

    /// Load `key`, serving fresh data from the cache and joining a fetch that
    /// is already in flight.
    ///
    /// `fetch_fn` may be omitted once a fetch function is known for the key.
    /// Returns [`QueryError::MissingFetchFn`] synchronously when a fetch is
    /// needed and none is known.
    pub fn fetch(
        &self,
        key: impl Into<QueryKey>,
        fetch_fn: Option<FetchFn<T>>,
        options: QueryOptions<T>,
        policy: FetchPolicy,
    ) -> Result<FetchHandle<T>, QueryError> {
        let key = key.into();
        let handle = {
            let mut table = mutex_lock(&self.inner.table, SOURCE, "fetch");
            let Table {
                entries,
                prefix_defaults,
            } = &mut *table;

            let existed = entries.contains_key(&key.hash());
            if fetch_fn.is_none() && !existed {
                return Err(QueryError::missing_fetch_fn(key.to_string()));
            }

            let entry = entry_for(entries, &key);
            if let Some(fetch_fn) = fetch_fn {
                entry.fetch_fn = Some(fetch_fn);
            }
            entry.options = entry.options.merged(&options);
            let resolved = resolve_options(&self.inner.config, prefix_defaults, entry);

            if policy == FetchPolicy::IfStale
                && entry.is_fresh(Instant::now(), resolved.stale_time)
                && let Some(data) = entry.state.data.clone()
            {
                counter!(METRIC_CACHE_HIT_TOTAL).increment(1);
                debug!(query = %entry.hash, "Served query from cache");
                self.inner.refresh_gc(entry, resolved.gc_time);
                return Ok(FetchHandle::cached(data));
            }

            let gc_time = resolved.gc_time;
            let handle = match self.inner.fetch_locked(entry, resolved) {
                Ok(handle) => handle,
                Err(err) if existed => {
                    self.inner.refresh_gc(entry, gc_time);
                    return Err(err);
                }
                Err(err) => {
                    // Nothing observes or caches the entry this call created.
                    entries.remove(&key.hash());
                    gauge!(METRIC_ENTRIES).set(entries.len() as f64);
                    return Err(err);
                }
            };
            if handle.source() == FetchSource::Started {
                self.inner.notifications.push(entry.notification());
            }
            handle
        };

        self.inner.notifications.drain();
        Ok(handle)
    }

    /// Start a forced fetch to warm the cache. The result is only delivered
    /// through the cache and its observers.
    pub fn prefetch(
        &self,
        key: impl Into<QueryKey>,
        fetch_fn: FetchFn<T>,
        options: QueryOptions<T>,
    ) -> Result<(), QueryError> {
        self.fetch(key, Some(fetch_fn), options, FetchPolicy::Force)
            .map(|_| ())
    }

    pub fn get_data(&self, key: impl Into<QueryKey>) -> Option<T> {
        self.read(key.into(), "get_data", |entry| entry.state.data.clone())
            .flatten()
    }

    pub fn get_state(&self, key: impl Into<QueryKey>) -> Option<QueryState<T>> {
        self.read(key.into(), "get_state", |entry| entry.state.clone())
    }

    fn read<R>(
        &self,
        key: QueryKey,
        op: &'static str,
        f: impl FnOnce(&CacheEntry<T>) -> R,
    ) -> Option<R> {
        let mut table = mutex_lock(&self.inner.table, SOURCE, op);
        let Table {
            entries,
            prefix_defaults,
        } = &mut *table;
        let entry = entries.get_mut(&key.hash())?;
        let gc_time = resolve_options(&self.inner.config, prefix_defaults, entry).gc_time;
        self.inner.refresh_gc(entry, gc_time);
        Some(f(entry))
    }

    /// Write data directly into the cache and notify observers. Creates the
    /// entry if needed; no fetch function runs.
    pub fn set_data(&self, key: impl Into<QueryKey>, updater: impl Into<Updater<T>>) -> T {
        let key = key.into();
        let data = {
            let mut table = mutex_lock(&self.inner.table, SOURCE, "set_data");
            let Table {
                entries,
                prefix_defaults,
            } = &mut *table;

            let entry = entry_for(entries, &key);
            let data = updater.into().apply(entry.state.data.as_ref());
            entry.write_data(data.clone(), Instant::now());
            let gc_time = resolve_options(&self.inner.config, prefix_defaults, entry).gc_time;
            self.inner.refresh_gc(entry, gc_time);
            self.inner.notifications.push(entry.notification());
            data
        };

        self.inner.notifications.drain();
        data
    }

    /// Mark matching entries stale. Entries that are observed and have a
    /// known fetch function are refetched right away, superseding any fetch
    /// already in flight; the returned completion covers those fetches.
    #[instrument(skip_all, fields(filter = %filter))]
    pub fn invalidate(&self, filter: QueryFilter) -> Completion<T> {
        let mut notifications = Vec::new();
        let mut handles = Vec::new();
        let mut matched = 0_usize;
        {
            let mut table = mutex_lock(&self.inner.table, SOURCE, "invalidate");
            let Table {
                entries,
                prefix_defaults,
            } = &mut *table;

            for entry in entries.values_mut().filter(|entry| filter.matches(&entry.key)) {
                matched += 1;
                entry.invalidate(self.inner.next_epoch());
                notifications.push(entry.notification());

                let resolved = resolve_options(&self.inner.config, prefix_defaults, entry);
                if entry.observers.is_empty() || entry.fetch_fn.is_none() {
                    self.inner.refresh_gc(entry, resolved.gc_time);
                    continue;
                }

                // The running fetch may have read data from before the
                // invalidation; its result is discarded on arrival.
                entry.in_flight = None;
                match self.inner.fetch_locked(entry, resolved) {
                    Ok(handle) => {
                        if handle.source() == FetchSource::Started {
                            notifications.push(entry.notification());
                        }
                        handles.push((entry.key.clone(), handle));
                    }
                    Err(err) => warn!(
                        query = %entry.hash,
                        error = %err,
                        "Could not refetch invalidated query"
                    ),
                }
            }
            self.inner.notifications.extend(notifications);
        }

        info!(matched, refetching = handles.len(), "Invalidated queries");
        self.inner.notifications.drain();
        Completion::new(handles)
    }

    /// Refetch every matching entry with a known fetch function, regardless
    /// of staleness.
    #[instrument(skip_all, fields(filter = %filter))]
    pub fn refetch(&self, filter: QueryFilter) -> Completion<T> {
        let mut notifications = Vec::new();
        let mut handles = Vec::new();
        {
            let mut table = mutex_lock(&self.inner.table, SOURCE, "refetch");
            let Table {
                entries,
                prefix_defaults,
            } = &mut *table;

            for entry in entries.values_mut().filter(|entry| filter.matches(&entry.key)) {
                if entry.fetch_fn.is_none() {
                    debug!(query = %entry.hash, "Skipped refetch without fetch function");
                    continue;
                }
                let resolved = resolve_options(&self.inner.config, prefix_defaults, entry);
                match self.inner.fetch_locked(entry, resolved) {
                    Ok(handle) => {
                        if handle.source() == FetchSource::Started {
                            notifications.push(entry.notification());
                        }
                        handles.push((entry.key.clone(), handle));
                    }
                    Err(err) => warn!(query = %entry.hash, error = %err, "Could not refetch query"),
                }
            }
            self.inner.notifications.extend(notifications);
        }

        info!(refetching = handles.len(), "Refetching queries");
        self.inner.notifications.drain();
        Completion::new(handles)
    }

    /// Discard the results of in-flight fetches for matching entries. The
    /// underlying work keeps running; only its result is ignored.
    #[instrument(skip_all, fields(filter = %filter))]
    pub fn cancel(&self, filter: QueryFilter) -> usize {
        let mut notifications = Vec::new();
        let canceled = {
            let mut table = mutex_lock(&self.inner.table, SOURCE, "cancel");
            let Table {
                entries,
                prefix_defaults,
            } = &mut *table;

            for entry in entries.values_mut().filter(|entry| filter.matches(&entry.key)) {
                entry.cancel_fetch(self.inner.next_epoch());
                let gc_time = resolve_options(&self.inner.config, prefix_defaults, entry).gc_time;
                self.inner.refresh_gc(entry, gc_time);
                notifications.push(entry.notification());
            }
            let canceled = notifications.len();
            self.inner.notifications.extend(notifications);
            canceled
        };

        info!(canceled, "Canceled queries");
        self.inner.notifications.drain();
        canceled
    }

    /// Delete matching entries now, regardless of observers.
    #[instrument(skip_all, fields(filter = %filter))]
    pub fn remove(&self, filter: QueryFilter) -> usize {
        let mut table = mutex_lock(&self.inner.table, SOURCE, "remove");
        let hashes: Vec<QueryHash> = table
            .entries
            .values()
            .filter(|entry| filter.matches(&entry.key))
            .map(|entry| entry.hash.clone())
            .collect();

        for hash in &hashes {
            if let Some(mut entry) = table.entries.remove(hash) {
                entry.cancel_gc();
            }
        }
        gauge!(METRIC_ENTRIES).set(table.entries.len() as f64);

        info!(removed = hashes.len(), "Removed queries");
        hashes.len()
    }

    /// Delete every entry.
    pub fn clear(&self) {
        let mut table = mutex_lock(&self.inner.table, SOURCE, "clear");
        let removed = table.entries.len();
        for entry in table.entries.values_mut() {
            entry.cancel_gc();
        }
        table.entries.clear();
        gauge!(METRIC_ENTRIES).set(0.0);
        info!(removed, "Cleared query cache");
    }

    /// Register `observer` for `key`. The observer is called once right away
    /// with the current state and then on every change. If another thread is
    /// delivering notifications at the time, that thread makes the first call
    /// after the ones already queued.
    pub fn subscribe(
        &self,
        key: impl Into<QueryKey>,
        observer: impl QueryObserver<T> + 'static,
    ) -> Subscription {
        let key = key.into();
        let id = SubscriptionId(self.inner.subscriptions.fetch_add(1, Ordering::SeqCst));
        let observer: SharedObserver<T> = Arc::new(observer);

        let hash = {
            let mut table = mutex_lock(&self.inner.table, SOURCE, "subscribe");
            let entry = entry_for(&mut table.entries, &key);
            entry.cancel_gc();
            entry.observers.insert(id, Arc::clone(&observer));
            self.inner
                .notifications
                .push(Notification::new(vec![observer], entry.state.clone()));
            entry.hash.clone()
        };

        self.inner.notifications.drain();

        let weak: Weak<ClientInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            id,
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.unsubscribe(&hash, id);
                }
            })),
        }
    }

    /// Diagnostic view of every entry, ordered by hash.
    pub fn inspect_all(&self) -> Vec<EntrySnapshot<T>> {
        let table = mutex_lock(&self.inner.table, SOURCE, "inspect_all");
        let now = Instant::now();
        let mut snapshots: Vec<EntrySnapshot<T>> = table
            .entries
            .values()
            .map(|entry| {
                let stale_time =
                    resolve_options(&self.inner.config, &table.prefix_defaults, entry).stale_time;
                entry.snapshot(now, stale_time)
            })
            .collect();
        snapshots.sort_by(|a, b| a.hash.cmp(&b.hash));
        snapshots
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.table, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
