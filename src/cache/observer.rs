//! Observer registry and synchronous change notification.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use super::lock::mutex_lock;
use super::state::QueryState;

const SOURCE: &str = "cache::observer";

/// Receives every state change of the queries it subscribed to.
///
/// Implemented for any `Fn(&QueryState<T>)` closure.
pub trait QueryObserver<T>: Send + Sync {
    fn on_state_change(&self, state: &QueryState<T>);
}

impl<T, F> QueryObserver<T> for F
where
    F: Fn(&QueryState<T>) + Send + Sync,
{
    fn on_state_change(&self, state: &QueryState<T>) {
        self(state)
    }
}

/// Handle identifying one registration. Ids are handed out in increasing
/// order, so iterating an [`ObserverSet`] follows registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub(crate) u64);

pub(crate) type SharedObserver<T> = Arc<dyn QueryObserver<T>>;

/// Observers of one cache entry.
pub(crate) struct ObserverSet<T> {
    observers: BTreeMap<SubscriptionId, SharedObserver<T>>,
}

impl<T> ObserverSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            observers: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, id: SubscriptionId, observer: SharedObserver<T>) {
        self.observers.insert(id, observer);
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) -> bool {
        self.observers.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.observers.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Observers in registration order, detached from the set so they can be
    /// called after the table lock is released.
    pub(crate) fn snapshot(&self) -> Vec<SharedObserver<T>> {
        self.observers.values().cloned().collect()
    }
}

/// A state snapshot paired with the observers that must receive it.
pub(crate) struct Notification<T> {
    observers: Vec<SharedObserver<T>>,
    state: QueryState<T>,
}

impl<T> Notification<T> {
    pub(crate) fn new(observers: Vec<SharedObserver<T>>, state: QueryState<T>) -> Self {
        Self { observers, state }
    }

    pub(crate) fn dispatch(self) {
        for observer in &self.observers {
            observer.on_state_change(&self.state);
        }
    }
}

/// Client-wide delivery queue.
///
/// Mutations push notifications while they hold the entry table lock, so the
/// queue order is the mutation order. Whichever caller finds the queue idle
/// becomes the drainer and delivers everything queued, including
/// notifications pushed by other threads or by re-entrant listeners while it
/// drains. Listeners run with no lock held.
pub(crate) struct NotificationQueue<T> {
    inner: Mutex<QueueState<T>>,
}

struct QueueState<T> {
    pending: VecDeque<Notification<T>>,
    draining: bool,
}

impl<T> NotificationQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(QueueState {
                pending: VecDeque::new(),
                draining: false,
            }),
        }
    }

    pub(crate) fn push(&self, notification: Notification<T>) {
        mutex_lock(&self.inner, SOURCE, "push")
            .pending
            .push_back(notification);
    }

    pub(crate) fn extend(&self, notifications: impl IntoIterator<Item = Notification<T>>) {
        mutex_lock(&self.inner, SOURCE, "extend")
            .pending
            .extend(notifications);
    }

    /// Deliver queued notifications in order, unless another caller is
    /// already draining.
    pub(crate) fn drain(&self) {
        {
            let mut queue = mutex_lock(&self.inner, SOURCE, "drain");
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        let _drainer = Drainer(self);
        loop {
            let next = {
                let mut queue = mutex_lock(&self.inner, SOURCE, "drain");
                let next = queue.pending.pop_front();
                if next.is_none() {
                    queue.draining = false;
                }
                next
            };
            match next {
                Some(notification) => notification.dispatch(),
                None => return,
            }
        }
    }
}

/// Releases the drainer role if a listener panics mid-delivery.
struct Drainer<'a, T>(&'a NotificationQueue<T>);

impl<T> Drop for Drainer<'_, T> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            mutex_lock(&self.0.inner, SOURCE, "release").draining = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::cache::state::QueryStatus;

    #[test]
    fn dispatch_follows_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut set: ObserverSet<u32> = ObserverSet::new();

        for id in [3_u64, 1, 2] {
            let calls = calls.clone();
            set.insert(
                SubscriptionId(id),
                Arc::new(move |state: &QueryState<u32>| {
                    calls.lock().unwrap().push((id, state.data));
                }),
            );
        }

        let mut state = QueryState::idle();
        state.status = QueryStatus::Success;
        state.data = Some(9);
        Notification::new(set.snapshot(), state).dispatch();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![(1, Some(9)), (2, Some(9)), (3, Some(9))]
        );
    }

    #[test]
    fn remove_reports_membership() {
        let mut set: ObserverSet<u32> = ObserverSet::new();
        set.insert(SubscriptionId(1), Arc::new(|_: &QueryState<u32>| {}));

        assert_eq!(set.len(), 1);
        assert!(set.remove(SubscriptionId(1)));
        assert!(!set.remove(SubscriptionId(1)));
        assert!(set.is_empty());
    }

    #[test]
    fn reentrant_pushes_are_delivered_after_the_current_one() {
        let queue: Arc<NotificationQueue<u32>> = Arc::new(NotificationQueue::new());
        let calls = Arc::new(Mutex::new(Vec::new()));

        let inner_calls = calls.clone();
        let inner: SharedObserver<u32> = Arc::new(move |state: &QueryState<u32>| {
            inner_calls.lock().unwrap().push(("inner", state.data));
        });

        let outer_calls = calls.clone();
        let outer_queue = queue.clone();
        let outer: SharedObserver<u32> = Arc::new(move |state: &QueryState<u32>| {
            outer_calls.lock().unwrap().push(("outer", state.data));
            let mut next = QueryState::idle();
            next.data = Some(2);
            outer_queue.push(Notification::new(vec![inner.clone()], next));
            outer_queue.drain();
            outer_calls.lock().unwrap().push(("outer done", state.data));
        });

        let mut first = QueryState::idle();
        first.data = Some(1);
        queue.push(Notification::new(vec![outer], first));
        queue.drain();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![("outer", Some(1)), ("outer done", Some(1)), ("inner", Some(2))]
        );
    }
}
