//! Single-resolution future with continuation passing.
//!
//! A [`Deferred`] is resolved at most once, either with a success value or a
//! failure value. At most one success and one failure continuation may be
//! registered at a time. Continuations never run in the frame of the caller
//! that registered them or resolved the deferred: they are always dispatched
//! on the [`Scheduler`], and a panic inside one is caught and logged by the
//! worker that runs it.
use std::{
    fmt,
    sync::{Arc, Mutex, mpsc},
    time::Duration,
};

use log::{trace, warn};
use thiserror::Error;

use super::thread::Scheduler;
use crate::utilities::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeferredError {
    #[error("a continuation of this kind is already registered")]
    DuplicateHandler,
    #[error("deferred already resolved")]
    AlreadyResolved,
    #[error("timed out waiting for resolution")]
    Timeout,
    #[error("deferred dropped before resolution")]
    Dropped,
    #[error("deferred cancelled by its consumer")]
    Cancelled,
}

enum Handler<A> {
    Empty,
    Waiting(Box<dyn FnOnce(A) + Send>),
    Fired,
}

impl<A> Handler<A> {
    fn is_set(&self) -> bool {
        !matches!(self, Handler::Empty)
    }
}

struct Slot<T, E> {
    outcome: Option<Result<T, E>>,
    resolved: bool,
    cancelled: bool,
    success: Handler<T>,
    failure: Handler<E>,
}

/// Handle to a single-resolution asynchronous outcome.
pub struct Deferred<T, E> {
    slot: Arc<Mutex<Slot<T, E>>>,
    scheduler: Scheduler,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = lock(&self.slot);
        f.debug_struct("Deferred")
            .field("resolved", &slot.resolved)
            .field("cancelled", &slot.cancelled)
            .field("pending", &slot.outcome.is_some())
            .finish()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new(scheduler: &Scheduler) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                outcome: None,
                resolved: false,
                cancelled: false,
                success: Handler::Empty,
                failure: Handler::Empty,
            })),
            scheduler: scheduler.clone(),
        }
    }

    pub fn succeeded(scheduler: &Scheduler, value: T) -> Self {
        let deferred = Self::new(scheduler);
        lock(&deferred.slot).resolve(Ok(value));
        deferred
    }

    pub fn failed(scheduler: &Scheduler, error: E) -> Self {
        let deferred = Self::new(scheduler);
        lock(&deferred.slot).resolve(Err(error));
        deferred
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// True once resolved or cancelled.
    pub fn is_resolved(&self) -> bool {
        lock(&self.slot).resolved
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.slot).cancelled
    }

    /// Marks the outcome as unwanted. Registered continuations are dropped
    /// and later resolutions are refused with [`DeferredError::Cancelled`].
    ///
    /// Returns `false` if the deferred was already resolved.
    pub fn cancel(&self) -> bool {
        let mut slot = lock(&self.slot);
        if slot.resolved {
            return false;
        }
        slot.cancel();
        true
    }

    /// Registers the success continuation.
    ///
    /// Fails with [`DeferredError::DuplicateHandler`] if one is already
    /// registered and has not been cleared.
    pub fn on_success<F>(&self, f: F) -> Result<&Self, DeferredError>
    where
        F: FnOnce(T) + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if slot.success.is_set() {
            return Err(DeferredError::DuplicateHandler);
        }
        match slot.outcome.take() {
            Some(Ok(value)) => {
                slot.success = Handler::Fired;
                drop(slot);
                self.dispatch(f, value);
            }
            other => {
                slot.outcome = other;
                slot.success = Handler::Waiting(Box::new(f));
            }
        }
        Ok(self)
    }

    /// Registers the failure continuation.
    pub fn on_failure<F>(&self, f: F) -> Result<&Self, DeferredError>
    where
        F: FnOnce(E) + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        if slot.failure.is_set() {
            return Err(DeferredError::DuplicateHandler);
        }
        match slot.outcome.take() {
            Some(Err(error)) => {
                slot.failure = Handler::Fired;
                drop(slot);
                self.dispatch(f, error);
            }
            other => {
                slot.outcome = other;
                slot.failure = Handler::Waiting(Box::new(f));
            }
        }
        Ok(self)
    }

    pub fn clear_success(&self) {
        lock(&self.slot).success = Handler::Empty;
    }

    pub fn clear_failure(&self) {
        lock(&self.slot).failure = Handler::Empty;
    }

    pub fn resolve_success(&self, value: T) -> Result<(), DeferredError> {
        let mut slot = lock(&self.slot);
        slot.check_open()?;
        match slot.resolve(Ok(value)) {
            Some(Fire::Success(f, value)) => {
                drop(slot);
                self.dispatch(f, value);
            }
            Some(Fire::Failure(..)) | None => {}
        }
        Ok(())
    }

    /// Resolves with `value` unless already resolved or cancelled, in which
    /// case `value` is handed back.
    pub fn offer(&self, value: T) -> Result<(), T> {
        let mut slot = lock(&self.slot);
        if slot.resolved {
            return Err(value);
        }
        if let Some(Fire::Success(f, value)) = slot.resolve(Ok(value)) {
            drop(slot);
            self.dispatch(f, value);
        }
        Ok(())
    }

    pub fn resolve_failure(&self, error: E) -> Result<(), DeferredError> {
        let mut slot = lock(&self.slot);
        slot.check_open()?;
        match slot.resolve(Err(error)) {
            Some(Fire::Failure(f, error)) => {
                drop(slot);
                self.dispatch(f, error);
            }
            Some(Fire::Success(..)) | None => {}
        }
        Ok(())
    }

    /// Forwards the eventual outcome of `other` into this deferred.
    ///
    /// Used by retry loops: each attempt produces a fresh deferred whose
    /// outcome reaches the original caller through the chain.
    pub fn chain(&self, other: &Deferred<T, E>) -> Result<(), DeferredError> {
        let target = self.clone();
        other.on_success(move |value| {
            if let Err(e) = target.resolve_success(value) {
                warn!("chained success dropped: {e}");
            }
        })?;
        let target = self.clone();
        other.on_failure(move |error| {
            if let Err(e) = target.resolve_failure(error) {
                warn!("chained failure dropped: {e}");
            }
        })?;
        Ok(())
    }

    /// Blocks the calling thread until the deferred resolves.
    ///
    /// Registers both continuations. On timeout the deferred is cancelled, so
    /// a resolver learns that nobody is waiting any more.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Result<T, E>, DeferredError> {
        let (tx, rx) = mpsc::channel();
        let failure_tx = tx.clone();
        self.on_success(move |value| {
            let _ = tx.send(Ok(value));
        })?;
        if let Err(e) = self.on_failure(move |error| {
            let _ = failure_tx.send(Err(error));
        }) {
            self.clear_success();
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(outcome) => Ok(outcome),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                let mut slot = lock(&self.slot);
                if !slot.resolved {
                    slot.cancel();
                    return Err(DeferredError::Timeout);
                }
                // Resolved just now; the outcome is on its way.
                if matches!(slot.success, Handler::Waiting(_)) {
                    slot.success = Handler::Empty;
                }
                if matches!(slot.failure, Handler::Waiting(_)) {
                    slot.failure = Handler::Empty;
                }
                drop(slot);
                rx.recv().map_err(|_| DeferredError::Dropped)
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(DeferredError::Dropped),
        }
    }

    fn dispatch<A, F>(&self, f: F, arg: A)
    where
        A: Send + 'static,
        F: FnOnce(A) + Send + 'static,
    {
        trace!("dispatching continuation");
        self.scheduler.execute(move || f(arg));
    }
}

enum Fire<T, E> {
    Success(Box<dyn FnOnce(T) + Send>, T),
    Failure(Box<dyn FnOnce(E) + Send>, E),
}

impl<T, E> Slot<T, E> {
    fn check_open(&self) -> Result<(), DeferredError> {
        if self.cancelled {
            Err(DeferredError::Cancelled)
        } else if self.resolved {
            Err(DeferredError::AlreadyResolved)
        } else {
            Ok(())
        }
    }

    fn cancel(&mut self) {
        self.resolved = true;
        self.cancelled = true;
        self.outcome = None;
        self.success = Handler::Empty;
        self.failure = Handler::Empty;
    }

    /// Records the outcome, returning the continuation to fire if one waits.
    fn resolve(&mut self, outcome: Result<T, E>) -> Option<Fire<T, E>> {
        self.resolved = true;
        match outcome {
            Ok(value) => match std::mem::replace(&mut self.success, Handler::Fired) {
                Handler::Waiting(f) => Some(Fire::Success(f, value)),
                previous => {
                    self.success = previous;
                    self.outcome = Some(Ok(value));
                    None
                }
            },
            Err(error) => match std::mem::replace(&mut self.failure, Handler::Fired) {
                Handler::Waiting(f) => Some(Fire::Failure(f, error)),
                previous => {
                    self.failure = previous;
                    self.outcome = Some(Err(error));
                    None
                }
            },
        }
    }
}
