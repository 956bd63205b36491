//! Small helpers shared across the crate.
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::error;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
///
/// Callbacks that run under a lock are isolated with [`isolate`], so a
/// poisoned mutex still guards consistent state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs a user supplied callback, catching and logging any panic.
///
/// Returns `false` if the callback panicked.
pub(crate) fn isolate<F: FnOnce()>(context: &str, f: F) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(panic) => {
            error!("[{context}] callback failed: {}", panic_message(&panic));
            false
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolate_reports_success() {
        let mut ran = false;
        assert!(isolate("test", || ran = true));
        assert!(ran);
    }

    #[test]
    fn isolate_swallows_panics() {
        assert!(!isolate("test", || panic!("boom")));
    }

    #[test]
    fn lock_recovers_poisoned_mutex() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let clone = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }
}
