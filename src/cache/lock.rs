use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock one of the client's mutexes, recovering the guard if a listener or
/// fetch callback panicked while another thread held it.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                hint = "entry state may be stale after panic in another thread",
                "Recovered from poisoned query cache lock"
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    #[test]
    fn recovers_from_poisoned_mutex() {
        let lock = Mutex::new(vec![1]);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = lock.lock().expect("lock should be acquired");
            panic!("poison the table lock");
        }));

        assert!(lock.is_poisoned());
        mutex_lock(&lock, "cache::lock::tests", "push").push(2);
        assert_eq!(*mutex_lock(&lock, "cache::lock::tests", "read"), vec![1, 2]);
    }
}
