//! Incremental row polling from a query into a table.
//!
//! A [`TableFeed`] repeatedly fetches the next `limit` rows of a query and
//! appends them to a [`Table`]. While full batches arrive it fetches again
//! right away; otherwise it waits `check_interval` before looking for new
//! rows, or finishes if no interval is set. Stopping is cooperative: the
//! running flag is checked before every fetch.
//!
//! A [`FeedRegistry`] keeps feeds by table name and remembers when each was
//! last looked up, so feeds nobody reads from any more can be swept.
use std::{
    collections::HashMap,
    fmt, io,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};

use super::{QueryConnection, QueryError, QuerySource};
use crate::{
    pool::Connector,
    storage::{Row, Schema, Table},
    utilities::lock,
};

#[derive(Debug, Clone, Copy)]
pub struct FeedOptions {
    /// Rows per fetch; 0 fetches everything at once.
    pub limit: usize,
    /// First row to fetch. Negative values start that many rows before the
    /// current end of the result.
    pub offset: i64,
    /// Pause between polls once caught up. `None` fetches until caught up once.
    pub check_interval: Option<Duration>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            limit: 1000,
            offset: 0,
            check_interval: None,
        }
    }
}

struct FeedInner {
    table: Table,
    running: AtomicBool,
    fetched: AtomicUsize,
    position: AtomicUsize,
    last_access: Mutex<Instant>,
}

/// Handle to a running (or finished) feed.
#[derive(Clone)]
pub struct TableFeed {
    inner: Arc<FeedInner>,
}

impl TableFeed {
    fn new(table: Table) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                table,
                running: AtomicBool::new(true),
                fetched: AtomicUsize::new(0),
                position: AtomicUsize::new(0),
                last_access: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.table.name()
    }

    /// The fed table. Counts as an access.
    pub fn table(&self) -> &Table {
        self.touch();
        &self.inner.table
    }

    pub fn touch(&self) {
        *lock(&self.inner.last_access) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.inner.last_access).elapsed()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            debug!("[{}] feed stopped", self.name());
        }
    }

    pub fn rows_fetched(&self) -> usize {
        self.inner.fetched.load(Ordering::Relaxed)
    }

    /// Offset of the next fetch.
    pub fn position(&self) -> usize {
        self.inner.position.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TableFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableFeed")
            .field("table", &self.name())
            .field("running", &self.is_running())
            .field("position", &self.position())
            .finish()
    }
}

impl<C> QuerySource<C>
where
    C: Connector,
    C::Connection: QueryConnection,
{
    /// Starts feeding the rows of `query` into `table`.
    ///
    /// Fetched rows are cast to the table's row schema before insertion.
    pub fn feed(&self, query: &str, table: Table, options: FeedOptions) -> TableFeed {
        let schema = Arc::new(table.row_schema());
        let feed = TableFeed::new(table);
        info!("[{}] feeding from '{}'", feed.name(), query.trim());
        Poller {
            source: self.clone(),
            feed: feed.clone(),
            query: Arc::from(query.trim()),
            schema,
            options,
        }
        .start();
        feed
    }
}

struct Poller<C: Connector> {
    source: QuerySource<C>,
    feed: TableFeed,
    query: Arc<str>,
    schema: Arc<Schema>,
    options: FeedOptions,
}

impl<C: Connector> Clone for Poller<C> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            feed: self.feed.clone(),
            query: Arc::clone(&self.query),
            schema: Arc::clone(&self.schema),
            options: self.options,
        }
    }
}

impl<C> Poller<C>
where
    C: Connector,
    C::Connection: QueryConnection,
{
    fn start(self) {
        let offset = self.options.offset;
        if offset >= 0 {
            return self.fetch(offset as usize);
        }

        let counting = self.source.run_count_query(&self.query);
        let feed = self.feed.clone();
        let registered = counting
            .on_success(move |total| {
                let start = total.saturating_add(offset).max(0) as usize;
                debug!("[{}] {total} row(s) available, starting at {start}", self.feed.name());
                self.fetch(start);
            })
            .and_then(|counting| {
                counting.on_failure(move |e| {
                    warn!("[{}] cannot count rows: {e}", feed.name());
                    feed.stop();
                })
            });
        if let Err(e) = registered {
            error!("cannot wait for row count: {e}");
        }
    }

    fn fetch(self, offset: usize) {
        if !self.feed.is_running() {
            return;
        }
        self.feed.inner.position.store(offset, Ordering::Relaxed);

        let pending = self.source.run_query(
            &self.query,
            self.options.limit,
            offset,
            Some(self.schema.as_ref()),
        );
        let poller = self.clone();
        let registered = pending
            .on_success(move |rows| poller.deliver(offset, rows))
            .and_then(|pending| pending.on_failure(move |e| self.retry(offset, e)));
        if let Err(e) = registered {
            error!("cannot wait for rows: {e}");
        }
    }

    fn deliver(self, offset: usize, rows: Vec<Row>) {
        if !self.feed.is_running() {
            return;
        }
        let count = rows.len();
        if count > 0 {
            if let Err(e) = self.feed.inner.table.add_rows(rows) {
                warn!("[{}] fetched rows rejected: {e}", self.feed.name());
                self.feed.stop();
                return;
            }
            self.feed.inner.fetched.fetch_add(count, Ordering::Relaxed);
            debug!("[{}] fetched {count} row(s) at offset {offset}", self.feed.name());
        }

        let next = offset + count;
        self.feed.inner.position.store(next, Ordering::Relaxed);
        if self.options.limit > 0 && count >= self.options.limit {
            self.fetch(next);
        } else {
            self.resume_later(next);
        }
    }

    fn retry(self, offset: usize, error: QueryError) {
        warn!("[{}] fetch at offset {offset} failed: {error}", self.feed.name());
        if self.options.check_interval.is_none() {
            self.feed.stop();
            return;
        }
        self.resume_later(offset);
    }

    fn resume_later(self, offset: usize) {
        let Some(interval) = self.options.check_interval else {
            debug!("[{}] caught up at offset {offset}", self.feed.name());
            self.feed.stop();
            return;
        };
        let feed = self.feed.clone();
        let scheduler = self.source.pool().scheduler().clone();
        if let Err(e) = scheduler.execute_after(interval, move || self.fetch(offset)) {
            warn!("[{}] cannot schedule next poll: {e}", feed.name());
            feed.stop();
        }
    }
}

/// Feeds by table name, with last-access tracking.
#[derive(Clone, Default)]
pub struct FeedRegistry {
    feeds: Arc<Mutex<HashMap<String, TableFeed>>>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `feed` under its table name, stopping any feed it replaces.
    pub fn register(&self, feed: TableFeed) {
        let replaced = lock(&self.feeds).insert(feed.name().to_string(), feed);
        if let Some(old) = replaced {
            old.stop();
        }
    }

    /// Table fed under `name`; marks the feed as accessed.
    pub fn table(&self, name: &str) -> Option<Table> {
        lock(&self.feeds).get(name).map(|feed| feed.table().clone())
    }

    pub fn get(&self, name: &str) -> Option<TableFeed> {
        lock(&self.feeds).get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> bool {
        let removed = lock(&self.feeds).remove(name);
        removed.map(|feed| feed.stop()).is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.feeds).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.feeds).is_empty()
    }

    /// Stops and drops every feed not accessed within `max_idle`.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let mut idle = Vec::new();
        lock(&self.feeds).retain(|_, feed| {
            let keep = feed.idle_for() <= max_idle;
            if !keep {
                idle.push(feed.clone());
            }
            keep
        });
        for feed in &idle {
            info!("[{}] no recent access, stopping feed", feed.name());
            feed.stop();
        }
        idle.len()
    }

    /// Sweeps every `interval` on a background thread until the returned
    /// [`Sweeper`] is stopped or dropped.
    pub fn start_sweeper(&self, interval: Duration, max_idle: Duration) -> io::Result<Sweeper> {
        let (stop, stopped) = mpsc::channel::<()>();
        let feeds = Arc::downgrade(&self.feeds);
        let thread = thread::Builder::new()
            .name("feed-sweeper".into())
            .spawn(move || {
                while let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    let Some(feeds) = feeds.upgrade() else {
                        break;
                    };
                    FeedRegistry { feeds }.sweep(max_idle);
                }
            })?;
        Ok(Sweeper {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

/// Background sweeper of a [`FeedRegistry`].
pub struct Sweeper {
    stop: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Sweeper {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("feed sweeper panicked");
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
