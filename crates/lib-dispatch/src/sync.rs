//! Small synchronization helpers.

use std::sync::{Mutex, MutexGuard};

/// Helper trait to recover from poisoned mutexes.
///
/// A panic in a sink worker or a caller thread must not wedge the runtime's
/// bookkeeping, so the guarded data is used as-is after a poisoning panic.
pub(crate) trait RecoverMutex<T> {
    fn lock_recover(&self) -> MutexGuard<'_, T>;
}

impl<T> RecoverMutex<T> for Mutex<T> {
    fn lock_recover(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Mutex was poisoned, recovering data");
            poisoned.into_inner()
        })
    }
}
