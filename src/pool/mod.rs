//! Asynchronous, backpressured connection pool.
//!
//! # Overview
//!
//! A [`Pool`] hands out connections created by a [`Connector`]. Leasing never
//! blocks: [`Pool::lease`] returns a [`Deferred`] that resolves once a
//! connection is available. Requests that cannot be served right away queue up
//! as waiters, bounded by `max_waiting`; beyond that a lease fails immediately
//! with [`PoolError::Saturated`] so overload is shed instead of piling up.
//!
//! Connections are provisioned on the scheduler, up to `max_size` at a time.
//! A returned connection goes straight to the oldest waiter if there is one,
//! otherwise back onto the free list. A background reclaimer periodically
//! closes idle connections beyond the peak demand seen since its last run.
//!
//! A waiter that gives up (its [`Deferred`] is cancelled, for instance by a
//! timed out [`Deferred::recv_timeout`]) is skipped and no longer counts
//! towards `max_waiting`.
//!
//! # Provisioning failures
//!
//! - [`ConnectError::AuthenticationFailed`] fails the oldest waiter.
//! - [`ConnectError::DatabaseMissing`] is retried every `rediscover_interval`
//!   while within `wait_for_database` of the first failure, then fails the
//!   oldest waiter.
//! - Any other failure fails the oldest waiter without retry. Another
//!   connection is then provisioned for the waiters still queued.
//!
//! When authentication fails or the database stays missing and no other
//! connection is open or being opened, every queued waiter fails with the
//! same error.
//!
//! # See Also
//!
//! - [`registry`]: Process-scoped registry of pools.
//! - [`query`](crate::query): Runs queries on leased connections.
pub mod registry;

use std::{
    cmp,
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, Weak, mpsc},
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    runtime::{Deferred, Scheduler},
    utilities::lock,
};

pub use registry::PoolRegistry;

/// Classified failure reported by a [`Connector`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    /// The database has not been created (yet).
    #[error("database does not exist: {0}")]
    DatabaseMissing(String),
    #[error("connection failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("[{label}] lease queue full ({max_waiting} requests waiting)")]
    Saturated { label: String, max_waiting: usize },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("database does not exist: {0}")]
    DatabaseMissing(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("[{0}] pool closed")]
    Closed(String),
    #[error("cannot start pool task: {0}")]
    Spawn(String),
}

/// Opens and closes the connections a [`Pool`] manages.
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> Result<Self::Connection, ConnectError>;

    fn close(&self, connection: Self::Connection) {
        drop(connection);
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name used in log messages.
    pub label: String,
    pub max_size: usize,
    pub max_waiting: usize,
    /// How long to keep retrying while the database does not exist.
    pub wait_for_database: Option<Duration>,
    pub rediscover_interval: Duration,
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            label: "pool".into(),
            max_size: 4,
            max_waiting: 10,
            wait_for_database: None,
            rediscover_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(10),
        }
    }
}

/// Point-in-time counters of a [`Pool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections currently open, leased or idle, including ones being opened.
    pub provisioned: usize,
    /// Connections handed out and not yet returned.
    pub outstanding: usize,
    /// Peak of `outstanding` since the last reclamation.
    pub highwater: usize,
    pub idle: usize,
    pub waiting: usize,
}

struct PoolState<R> {
    free: VecDeque<R>,
    waiting: VecDeque<Deferred<R, PoolError>>,
    provisioned: usize,
    outstanding: usize,
    highwater: usize,
    missing_since: Option<Instant>,
    closed: bool,
}

impl<R> PoolState<R> {
    fn checkout(&mut self) {
        self.outstanding += 1;
        self.highwater = cmp::max(self.highwater, self.outstanding);
    }

    /// Oldest waiter still interested in a connection.
    fn next_waiter(&mut self) -> Option<Deferred<R, PoolError>>
    where
        R: Send + 'static,
    {
        while let Some(waiter) = self.waiting.pop_front() {
            if !waiter.is_resolved() {
                return Some(waiter);
            }
        }
        None
    }
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    scheduler: Scheduler,
    state: Mutex<PoolState<C::Connection>>,
    stop: Mutex<Option<mpsc::Sender<()>>>,
}

/// Shared handle to a connection pool.
pub struct Pool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("label", &self.inner.config.label)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: Connector> Pool<C> {
    /// Creates a pool and starts its reclaimer thread.
    pub fn new(connector: C, config: PoolConfig, scheduler: &Scheduler) -> Result<Self, PoolError> {
        let inner = Arc::new(PoolInner {
            connector,
            config,
            scheduler: scheduler.clone(),
            state: Mutex::new(PoolState {
                free: VecDeque::new(),
                waiting: VecDeque::new(),
                provisioned: 0,
                outstanding: 0,
                highwater: 0,
                missing_since: None,
                closed: false,
            }),
            stop: Mutex::new(None),
        });
        start_reclaimer(&inner)?;
        debug!(
            "[{}] pool created (max_size={}, max_waiting={})",
            inner.config.label, inner.config.max_size, inner.config.max_waiting
        );
        Ok(Self { inner })
    }

    pub fn label(&self) -> &str {
        &self.inner.config.label
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        PoolStats {
            provisioned: state.provisioned,
            outstanding: state.outstanding,
            highwater: state.highwater,
            idle: state.free.len(),
            waiting: state.waiting.len(),
        }
    }

    /// Requests a connection.
    pub fn lease(&self) -> Deferred<C::Connection, PoolError> {
        let deferred = Deferred::new(&self.inner.scheduler);
        let config = &self.inner.config;
        let mut state = lock(&self.inner.state);

        if state.closed {
            drop(state);
            let _ = deferred.resolve_failure(PoolError::Closed(config.label.clone()));
            return deferred;
        }

        if let Some(connection) = state.free.pop_front() {
            state.checkout();
            drop(state);
            let _ = deferred.resolve_success(connection);
            return deferred;
        }

        state.waiting.retain(|waiter| !waiter.is_resolved());
        if state.waiting.len() >= config.max_waiting {
            let waiting = state.waiting.len();
            drop(state);
            warn!("[{}] lease rejected, {waiting} request(s) already waiting", config.label);
            let _ = deferred.resolve_failure(PoolError::Saturated {
                label: config.label.clone(),
                max_waiting: config.max_waiting,
            });
            return deferred;
        }

        state.waiting.push_back(deferred.clone());
        let waiting = state.waiting.len();
        let pct = 100 * waiting / config.max_waiting.max(1);
        if pct >= 75 {
            warn!(
                "[{}] lease queue has reached {pct}% capacity ({waiting}/{})",
                config.label, config.max_waiting
            );
        } else {
            debug!("[{}] lease requests pending: {waiting} ({pct}%)", config.label);
        }

        let provision = state.provisioned < config.max_size;
        if provision {
            state.provisioned += 1;
        }
        drop(state);

        if provision {
            self.provision();
        }
        deferred
    }

    /// Returns a leased connection.
    pub fn release(&self, connection: C::Connection) {
        self.hand_over(connection, false);
    }

    /// Seeds the pool with an externally opened connection.
    pub fn add(&self, connection: C::Connection) {
        lock(&self.inner.state).provisioned += 1;
        self.hand_over(connection, true);
    }

    /// Closes a leased connection known to be broken instead of returning it.
    pub fn discard(&self, connection: C::Connection) {
        let replace = {
            let mut state = lock(&self.inner.state);
            state.outstanding = state.outstanding.saturating_sub(1);
            state.provisioned = state.provisioned.saturating_sub(1);
            let replace = !state.closed
                && !state.waiting.is_empty()
                && state.provisioned < self.inner.config.max_size;
            if replace {
                state.provisioned += 1;
            }
            replace
        };
        warn!("[{}] discarding broken connection", self.inner.config.label);
        self.inner.connector.close(connection);
        if replace {
            self.provision();
        }
    }

    /// Closes idle connections beyond the peak demand since the last call and
    /// resets that peak. Returns the number of connections closed.
    pub fn reclaim(&self) -> usize {
        let config = &self.inner.config;
        let mut closing = Vec::new();
        {
            let mut state = lock(&self.inner.state);
            if state.provisioned > 0 {
                let excess = state.provisioned.saturating_sub(state.highwater);
                while closing.len() < excess {
                    let Some(connection) = state.free.pop_front() else {
                        break;
                    };
                    closing.push(connection);
                }
                state.provisioned -= closing.len();
                if !closing.is_empty() {
                    info!(
                        "[{}] closing {} out of {} connection(s)",
                        config.label,
                        closing.len(),
                        state.provisioned + closing.len()
                    );
                }
                debug!("[{}] maintaining {} connection(s)", config.label, state.provisioned);
            }
            state.highwater = 0;
        }

        let closed = closing.len();
        for connection in closing {
            self.inner.connector.close(connection);
        }
        closed
    }

    /// Fails all waiters, closes idle connections and stops the reclaimer.
    /// Connections released later are closed on return.
    pub fn close(&self) {
        let label = &self.inner.config.label;
        let (waiters, idle) = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<_> = state.free.drain(..).collect();
            state.provisioned -= idle.len();
            (state.waiting.drain(..).collect::<Vec<_>>(), idle)
        };
        lock(&self.inner.stop).take();

        info!("[{label}] closing pool ({} waiter(s), {} idle)", waiters.len(), idle.len());
        for waiter in waiters {
            let _ = waiter.resolve_failure(PoolError::Closed(label.clone()));
        }
        for connection in idle {
            self.inner.connector.close(connection);
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    fn hand_over(&self, mut connection: C::Connection, newly_provisioned: bool) {
        let mut state = lock(&self.inner.state);
        if !newly_provisioned {
            state.outstanding = state.outstanding.saturating_sub(1);
        }
        if state.closed {
            state.provisioned = state.provisioned.saturating_sub(1);
            drop(state);
            self.inner.connector.close(connection);
            return;
        }

        // Reused directly, without parking it on the free list.
        while let Some(waiter) = state.next_waiter() {
            match waiter.offer(connection) {
                Ok(()) => {
                    state.checkout();
                    return;
                }
                Err(refused) => connection = refused,
            }
        }
        state.free.push_back(connection);
    }

    fn provision(&self) {
        let pool = Arc::downgrade(&self.inner);
        self.inner.scheduler.execute(move || {
            if let Some(inner) = pool.upgrade() {
                Pool { inner }.connect();
            }
        });
    }

    fn connect(&self) {
        let config = &self.inner.config;
        debug!("[{}] opening new connection", config.label);
        let error = match self.inner.connector.connect() {
            Ok(connection) => {
                info!("[{}] connected", config.label);
                lock(&self.inner.state).missing_since = None;
                self.hand_over(connection, true);
                return;
            }
            Err(ConnectError::AuthenticationFailed(msg)) => PoolError::AuthenticationFailed(msg),
            Err(ConnectError::Other(msg)) => PoolError::ConnectionFailed(msg),
            Err(ConnectError::DatabaseMissing(msg)) => {
                if self.within_database_wait() {
                    debug!(
                        "[{}] database missing, retrying in {:?}",
                        config.label, config.rediscover_interval
                    );
                    match self.retry_connect() {
                        Ok(()) => return,
                        Err(e) => e,
                    }
                } else {
                    PoolError::DatabaseMissing(msg)
                }
            }
        };
        self.provision_failed(error);
    }

    fn within_database_wait(&self) -> bool {
        let mut state = lock(&self.inner.state);
        if state.closed {
            return false;
        }
        let since = *state.missing_since.get_or_insert_with(Instant::now);
        match self.inner.config.wait_for_database {
            Some(wait) => since.elapsed() < wait,
            None => false,
        }
    }

    fn retry_connect(&self) -> Result<(), PoolError> {
        let pool: Weak<PoolInner<C>> = Arc::downgrade(&self.inner);
        self.inner
            .scheduler
            .execute_after(self.inner.config.rediscover_interval, move || {
                if let Some(inner) = pool.upgrade() {
                    Pool { inner }.connect();
                }
            })
            .map_err(|e| PoolError::Spawn(e.to_string()))
    }

    fn provision_failed(&self, error: PoolError) {
        let config = &self.inner.config;
        let terminal = !matches!(error, PoolError::ConnectionFailed(_));
        let (failed, reprovision) = {
            let mut state = lock(&self.inner.state);
            state.provisioned = state.provisioned.saturating_sub(1);
            let mut failed: Vec<_> = state.next_waiter().into_iter().collect();
            let mut reprovision = false;
            if terminal {
                // Nothing left that could serve the queue.
                if state.provisioned == 0 {
                    failed.extend(state.waiting.drain(..));
                }
            } else if !state.closed
                && !state.waiting.is_empty()
                && state.provisioned < config.max_size
            {
                state.provisioned += 1;
                reprovision = true;
            }
            (failed, reprovision)
        };

        warn!(
            "[{}] provisioning failed, failing {} waiter(s): {error}",
            config.label,
            failed.len()
        );
        for waiter in failed {
            let _ = waiter.resolve_failure(error.clone());
        }
        if reprovision {
            self.provision();
        }
    }
}

impl<C: Connector> Drop for PoolInner<C> {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for connection in state.free.drain(..) {
            self.connector.close(connection);
        }
    }
}

fn start_reclaimer<C: Connector>(inner: &Arc<PoolInner<C>>) -> Result<(), PoolError> {
    let (stop, stopped) = mpsc::channel::<()>();
    let pool = Arc::downgrade(inner);
    let interval = inner.config.cleanup_interval;

    thread::Builder::new()
        .name(format!("{}-reclaimer", inner.config.label))
        .spawn(move || {
            // Runs until stopped or until the pool is gone.
            while let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                Pool { inner }.reclaim();
            }
            debug!("reclaimer stopped");
        })
        .map_err(|e| {
            error!("[{}] cannot start reclaimer: {e}", inner.config.label);
            PoolError::Spawn(e.to_string())
        })?;

    *lock(&inner.stop) = Some(stop);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    struct MockConnector {
        counters: Arc<Counters>,
        script: Mutex<VecDeque<ConnectError>>,
    }

    impl MockConnector {
        fn new(failures: Vec<ConnectError>) -> (Self, Arc<Counters>) {
            let counters = Arc::new(Counters::default());
            let connector = Self {
                counters: counters.clone(),
                script: Mutex::new(failures.into()),
            };
            (connector, counters)
        }
    }

    impl Connector for MockConnector {
        type Connection = usize;

        fn connect(&self) -> Result<usize, ConnectError> {
            let n = self.counters.connects.fetch_add(1, Ordering::SeqCst);
            match self.script.lock().unwrap().pop_front() {
                Some(error) => Err(error),
                None => Ok(n),
            }
        }

        fn close(&self, _: usize) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(config: PoolConfig, failures: Vec<ConnectError>) -> (Pool<MockConnector>, Arc<Counters>) {
        let scheduler = Scheduler::new(2).unwrap();
        let (connector, counters) = MockConnector::new(failures);
        (Pool::new(connector, config, &scheduler).unwrap(), counters)
    }

    fn config(max_size: usize, max_waiting: usize) -> PoolConfig {
        PoolConfig {
            label: "test".into(),
            max_size,
            max_waiting,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn lease_provisions_and_release_reuses() {
        let (pool, counters) = pool(config(2, 10), vec![]);
        let conn = pool.lease().recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(pool.stats().outstanding, 1);
        pool.release(conn);
        assert_eq!(pool.stats().idle, 1);

        let again = pool.lease().recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(again, conn);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn waiters_are_served_in_order() {
        let (pool, counters) = pool(config(1, 10), vec![]);
        let conn = pool.lease().recv_timeout(WAIT).unwrap().unwrap();

        let (tx, rx) = mpsc::channel();
        for n in [2, 3] {
            let (tx, handle) = (tx.clone(), pool.clone());
            pool.lease()
                .on_success(move |c| {
                    tx.send(n).unwrap();
                    handle.release(c);
                })
                .unwrap();
        }
        assert_eq!(pool.stats().waiting, 2);
        pool.release(conn);

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 2);
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 3);
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_queue_rejects_lease() {
        let (pool, _) = pool(config(1, 1), vec![]);
        let _held = pool.lease().recv_timeout(WAIT).unwrap().unwrap();
        let _queued = pool.lease();

        let rejected = pool.lease().recv_timeout(WAIT).unwrap();
        assert!(matches!(rejected, Err(PoolError::Saturated { max_waiting: 1, .. })));
    }

    #[test]
    fn authentication_failure_fails_lease() {
        let (pool, _) = pool(config(1, 10), vec![ConnectError::AuthenticationFailed("bad password".into())]);
        let outcome = pool.lease().recv_timeout(WAIT).unwrap();
        assert_eq!(outcome, Err(PoolError::AuthenticationFailed("bad password".into())));
        assert_eq!(pool.stats().provisioned, 0);
    }

    #[test]
    fn authentication_failure_fails_every_waiter() {
        let bad = ConnectError::AuthenticationFailed("bad password".into());
        let (pool, _) = pool(config(1, 10), vec![bad.clone(), bad]);
        let first = pool.lease();
        let second = pool.lease();

        let expected = Err(PoolError::AuthenticationFailed("bad password".into()));
        assert_eq!(first.recv_timeout(WAIT).unwrap(), expected);
        assert_eq!(second.recv_timeout(WAIT).unwrap(), expected);
        assert_eq!(pool.stats().waiting, 0);
        assert_eq!(pool.stats().provisioned, 0);
    }

    #[test]
    fn generic_failure_reprovisions_for_queued_waiters() {
        let (pool, counters) = pool(config(1, 10), vec![ConnectError::Other("refused".into())]);
        let first = pool.lease();
        let second = pool.lease();

        assert_eq!(first.recv_timeout(WAIT).unwrap(), Err(PoolError::ConnectionFailed("refused".into())));
        assert!(second.recv_timeout(WAIT).unwrap().is_ok());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn abandoned_waiter_does_not_take_connection() {
        let (pool, _) = pool(config(1, 1), vec![]);
        let conn = pool.lease().recv_timeout(WAIT).unwrap().unwrap();

        let gave_up = pool.lease();
        assert_eq!(
            gave_up.recv_timeout(Duration::from_millis(20)),
            Err(crate::runtime::DeferredError::Timeout)
        );
        pool.release(conn);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().outstanding, 0);

        let again = pool.lease().recv_timeout(WAIT).unwrap().unwrap();
        assert_eq!(again, conn);
        assert_eq!(pool.stats().waiting, 0);
    }

    #[test]
    fn abandoned_waiter_frees_queue_slot() {
        let (pool, _) = pool(config(1, 1), vec![]);
        let _held = pool.lease().recv_timeout(WAIT).unwrap().unwrap();
        let gave_up = pool.lease();
        assert!(gave_up.cancel());

        let queued = pool.lease();
        assert!(!queued.is_resolved());
        assert_eq!(pool.stats().waiting, 1);
    }

    #[test]
    fn generic_failure_is_not_retried() {
        let (pool, counters) = pool(config(1, 10), vec![ConnectError::Other("refused".into())]);
        let outcome = pool.lease().recv_timeout(WAIT).unwrap();
        assert_eq!(outcome, Err(PoolError::ConnectionFailed("refused".into())));
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_database_is_retried_within_window() {
        let missing = ConnectError::DatabaseMissing("exp1".into());
        let cfg = PoolConfig {
            wait_for_database: Some(Duration::from_secs(5)),
            rediscover_interval: Duration::from_millis(10),
            ..config(1, 10)
        };
        let (pool, counters) = pool(cfg, vec![missing.clone(), missing]);

        assert!(pool.lease().recv_timeout(WAIT).unwrap().is_ok());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn missing_database_without_window_fails() {
        let (pool, _) = pool(config(1, 10), vec![ConnectError::DatabaseMissing("exp1".into())]);
        let outcome = pool.lease().recv_timeout(WAIT).unwrap();
        assert_eq!(outcome, Err(PoolError::DatabaseMissing("exp1".into())));
    }

    #[test]
    fn reclaim_tracks_recent_peak() {
        let (pool, counters) = pool(config(4, 10), vec![]);
        for id in 100..103 {
            pool.add(id);
        }
        let conn = pool.lease().recv_timeout(WAIT).unwrap().unwrap();
        pool.release(conn);
        assert_eq!(pool.stats().highwater, 1);

        assert_eq!(pool.reclaim(), 2);
        assert_eq!(pool.stats().provisioned, 1);
        assert_eq!(pool.stats().highwater, 0);

        assert_eq!(pool.reclaim(), 1);
        assert_eq!(pool.stats().provisioned, 0);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn reclaimer_runs_periodically() {
        let cfg = PoolConfig {
            cleanup_interval: Duration::from_millis(20),
            ..config(2, 10)
        };
        let (pool, _) = pool(cfg, vec![]);
        pool.add(1);
        pool.add(2);

        let deadline = Instant::now() + WAIT;
        while pool.stats().provisioned > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.stats().provisioned, 0);
    }

    #[test]
    fn discard_replaces_connection_for_waiters() {
        let (pool, counters) = pool(config(1, 10), vec![]);
        let conn = pool.lease().recv_timeout(WAIT).unwrap().unwrap();
        let waiter = pool.lease();
        pool.discard(conn);

        assert!(waiter.recv_timeout(WAIT).unwrap().is_ok());
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_fails_waiters_and_later_leases() {
        let (pool, counters) = pool(config(1, 10), vec![]);
        let conn = pool.lease().recv_timeout(WAIT).unwrap().unwrap();
        let waiter = pool.lease();
        pool.close();

        assert_eq!(waiter.recv_timeout(WAIT).unwrap(), Err(PoolError::Closed("test".into())));
        assert_eq!(pool.lease().recv_timeout(WAIT).unwrap(), Err(PoolError::Closed("test".into())));

        pool.release(conn);
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().provisioned, 0);
    }
}
