//! Queries against a pooled relational store.
//!
//! A [`QuerySource`] runs SQL on connections leased from a [`Pool`] and reports
//! rows through a [`Deferred`]. The connection collaborator classifies its
//! failures into [`QueryError`] variants, which decide what happens next:
//!
//! - [`QueryError::RelationNotFound`]: the producer has not created the
//!   relation yet. Within `wait_for_tables` of the first failure for that
//!   relation the query is retried every `rediscover_interval`, and the
//!   caller's deferred is chained to the retry.
//! - [`QueryError::ConnectionBad`]: the connection is discarded instead of
//!   being returned to the pool.
//! - Anything else fails the caller's deferred.
//!
//! [`feed`] builds incremental row polling into tables on top of this.
pub mod feed;

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::{
    pool::{Connector, Pool, PoolError},
    runtime::Deferred,
    storage::{Row, Schema, StorageError, Value},
    utilities::lock,
};

pub use feed::{FeedOptions, FeedRegistry, Sweeper, TableFeed};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error("relation '{0}' does not exist")]
    RelationNotFound(String),

    #[error("bad connection: {0}")]
    ConnectionBad(String),

    #[error("query failed: {0}")]
    Other(String),

    #[error("cannot derive a count query from '{0}'")]
    InvalidQuery(String),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A pooled connection able to run SQL.
pub trait QueryConnection: Send + 'static {
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, QueryError>;
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// How long to keep retrying queries against a missing relation.
    pub wait_for_tables: Option<Duration>,
    pub rediscover_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            wait_for_tables: None,
            rediscover_interval: Duration::from_secs(10),
        }
    }
}

struct SourceInner<C: Connector> {
    pool: Pool<C>,
    config: SourceConfig,
    missing_since: Mutex<HashMap<String, Instant>>,
}

pub struct QuerySource<C: Connector> {
    inner: Arc<SourceInner<C>>,
}

impl<C: Connector> Clone for QuerySource<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> fmt::Debug for QuerySource<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuerySource")
            .field("pool", &self.inner.pool)
            .field("config", &self.inner.config)
            .finish()
    }
}

impl<C> QuerySource<C>
where
    C: Connector,
    C::Connection: QueryConnection,
{
    pub fn new(pool: Pool<C>, config: SourceConfig) -> Self {
        Self {
            inner: Arc::new(SourceInner {
                pool,
                config,
                missing_since: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.inner.pool
    }

    pub fn config(&self) -> &SourceConfig {
        &self.inner.config
    }

    /// Runs `query`, optionally windowed by `limit` and `offset` (0 means
    /// unbounded). With a `schema`, string cells are cast to the column types.
    pub fn run_query(
        &self,
        query: &str,
        limit: usize,
        offset: usize,
        schema: Option<&Schema>,
    ) -> Deferred<Vec<Row>, QueryError> {
        let sql = normalize(query, limit, offset);
        trace!("query: {sql}");
        self.submit(Arc::from(sql), schema.cloned().map(Arc::new), None)
    }

    /// Counts the rows `query` would return.
    pub fn run_count_query(&self, query: &str) -> Deferred<i64, QueryError> {
        let result = Deferred::new(self.inner.pool.scheduler());
        let Some(sql) = count_query(query) else {
            let _ = result.resolve_failure(QueryError::InvalidQuery(query.to_string()));
            return result;
        };

        let pending = self.run_query(&sql, 0, 0, None);
        let (counted, failed) = (result.clone(), result.clone());
        let registered = pending
            .on_success(move |rows| {
                let count = rows.first().and_then(|row| row.first()).and_then(Value::as_i64);
                let _ = match count {
                    Some(n) => counted.resolve_success(n),
                    None => counted.resolve_failure(QueryError::Other(
                        "count query returned no rows".into(),
                    )),
                };
            })
            .and_then(|pending| {
                pending.on_failure(move |e| {
                    let _ = failed.resolve_failure(e);
                })
            });
        if let Err(e) = registered {
            error!("cannot wait for count query: {e}");
        }
        result
    }

    /// `retrying` names the missing relation a retried query is waiting for.
    fn submit(
        &self,
        sql: Arc<str>,
        schema: Option<Arc<Schema>>,
        retrying: Option<String>,
    ) -> Deferred<Vec<Row>, QueryError> {
        let result = Deferred::new(self.inner.pool.scheduler());
        let lease = self.inner.pool.lease();
        let (source, target, failed) = (self.clone(), result.clone(), result.clone());
        let registered = lease
            .on_success(move |connection| source.execute(connection, sql, schema, retrying, target))
            .and_then(|lease| {
                lease.on_failure(move |e| {
                    let _ = failed.resolve_failure(QueryError::Pool(e));
                })
            });
        if let Err(e) = registered {
            error!("cannot wait for a connection: {e}");
        }
        result
    }

    fn execute(
        &self,
        mut connection: C::Connection,
        sql: Arc<str>,
        schema: Option<Arc<Schema>>,
        retrying: Option<String>,
        result: Deferred<Vec<Row>, QueryError>,
    ) {
        let pool = &self.inner.pool;
        let outcome = connection.query(&sql);
        if let Some(relation) = retrying {
            match &outcome {
                Err(QueryError::RelationNotFound(missing)) if *missing == relation => {}
                _ => self.forget_missing(&relation),
            }
        }
        let rows = match outcome {
            Ok(rows) => {
                pool.release(connection);
                rows
            }
            Err(QueryError::ConnectionBad(msg)) => {
                pool.discard(connection);
                let _ = result.resolve_failure(QueryError::ConnectionBad(msg));
                return;
            }
            Err(QueryError::RelationNotFound(relation)) => {
                pool.release(connection);
                self.retry_or_fail(relation, sql, schema, result);
                return;
            }
            Err(e) => {
                pool.release(connection);
                warn!("query '{sql}' failed: {e}");
                let _ = result.resolve_failure(e);
                return;
            }
        };

        let typed = match schema {
            Some(schema) => rows
                .into_iter()
                .map(|row| schema.coerce_row(row))
                .collect::<Result<Vec<_>, _>>()
                .map_err(QueryError::from),
            None => Ok(rows),
        };
        let _ = match typed {
            Ok(rows) => result.resolve_success(rows),
            Err(e) => result.resolve_failure(e),
        };
    }

    fn retry_or_fail(
        &self,
        relation: String,
        sql: Arc<str>,
        schema: Option<Arc<Schema>>,
        result: Deferred<Vec<Row>, QueryError>,
    ) {
        let interval = self.inner.config.rediscover_interval;
        if self.within_table_wait(&relation) {
            debug!("relation '{relation}' does not exist yet, retrying in {interval:?}");
            let (source, target, relation) = (self.clone(), result.clone(), relation.clone());
            let scheduled = self.inner.pool.scheduler().execute_after(interval, move || {
                let retry = source.submit(sql, schema, Some(relation));
                if let Err(e) = target.chain(&retry) {
                    warn!("cannot forward retried query: {e}");
                }
            });
            match scheduled {
                Ok(()) => return,
                Err(e) => warn!("cannot schedule retry: {e}"),
            }
        } else {
            warn!("relation '{relation}' does not exist");
        }
        self.forget_missing(&relation);
        let _ = result.resolve_failure(QueryError::RelationNotFound(relation));
    }

    fn within_table_wait(&self, relation: &str) -> bool {
        let Some(wait) = self.inner.config.wait_for_tables else {
            return false;
        };
        let mut missing = lock(&self.inner.missing_since);
        let since = *missing
            .entry(relation.to_string())
            .or_insert_with(Instant::now);
        since.elapsed() < wait
    }

    fn forget_missing(&self, relation: &str) {
        lock(&self.inner.missing_since).remove(relation);
    }
}

fn normalize(query: &str, limit: usize, offset: usize) -> String {
    let mut sql = query.trim().trim_end_matches(';').trim_end().to_string();
    if limit > 0 {
        sql.push_str(&format!(" LIMIT {limit}"));
    }
    if offset > 0 {
        sql.push_str(&format!(" OFFSET {offset}"));
    }
    sql
}

/// `SELECT ... FROM rest` becomes `SELECT count(*) FROM rest`, minus any
/// trailing `ORDER BY`.
fn count_query(query: &str) -> Option<String> {
    let flat = query.trim().trim_end_matches(';').replace(['\n', '\r', '\t'], " ");
    // ASCII lowercasing keeps byte offsets aligned with `flat`.
    let lower = flat.to_ascii_lowercase();
    if !lower.starts_with("select ") {
        return None;
    }
    let from = lower.find(" from ")? + " from ".len();
    let end = lower.rfind(" order by ").filter(|&i| i > from).unwrap_or(flat.len());
    let rest = flat[from..end].trim();
    if rest.is_empty() {
        return None;
    }
    Some(format!("SELECT count(*) FROM {rest}"))
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        pool::{ConnectError, PoolConfig},
        runtime::Scheduler,
    };

    #[derive(Default)]
    struct MockState {
        relations: HashMap<String, Vec<Row>>,
        log: Vec<String>,
        break_next: bool,
    }

    /// In-memory stand-in for a relational store.
    #[derive(Clone, Default)]
    pub(crate) struct MockDatabase {
        state: Arc<Mutex<MockState>>,
    }

    impl MockDatabase {
        pub(crate) fn insert(&self, relation: &str, rows: Vec<Row>) {
            let mut state = self.state.lock().unwrap();
            state.relations.entry(relation.into()).or_default().extend(rows);
        }

        pub(crate) fn drop_relation(&self, relation: &str) {
            self.state.lock().unwrap().relations.remove(relation);
        }

        pub(crate) fn queries(&self) -> Vec<String> {
            self.state.lock().unwrap().log.clone()
        }

        pub(crate) fn break_next(&self) {
            self.state.lock().unwrap().break_next = true;
        }

        pub(crate) fn source(&self, config: SourceConfig) -> QuerySource<MockDatabase> {
            let scheduler = Scheduler::new(2).unwrap();
            let pool = Pool::new(self.clone(), PoolConfig::default(), &scheduler).unwrap();
            QuerySource::new(pool, config)
        }
    }

    pub(crate) struct MockConnection {
        db: MockDatabase,
    }

    impl Connector for MockDatabase {
        type Connection = MockConnection;

        fn connect(&self) -> Result<MockConnection, ConnectError> {
            Ok(MockConnection { db: self.clone() })
        }
    }

    impl QueryConnection for MockConnection {
        fn query(&mut self, sql: &str) -> Result<Vec<Row>, QueryError> {
            let mut state = self.db.state.lock().unwrap();
            state.log.push(sql.to_string());
            if std::mem::take(&mut state.break_next) {
                return Err(QueryError::ConnectionBad("server closed the connection".into()));
            }

            let tokens: Vec<&str> = sql.split_whitespace().collect();
            let after = |keyword: &str| {
                let i = tokens.iter().position(|t| t.eq_ignore_ascii_case(keyword))?;
                tokens.get(i + 1).copied()
            };
            let relation = after("from").ok_or_else(|| QueryError::Other(format!("syntax error: {sql}")))?;
            let rows = state
                .relations
                .get(relation)
                .ok_or_else(|| QueryError::RelationNotFound(relation.to_string()))?;

            if sql.starts_with("SELECT count(*)") {
                return Ok(vec![vec![Value::Integer(rows.len() as i64)]]);
            }
            let offset = after("OFFSET").and_then(|n| n.parse().ok()).unwrap_or(0);
            let limit = after("LIMIT").and_then(|n| n.parse().ok()).unwrap_or(usize::MAX);
            Ok(rows.iter().skip(offset).take(limit).cloned().collect())
        }
    }

    /// Rows of `(seq, reading)` as the store would return them: all text.
    pub(crate) fn readings(range: std::ops::Range<i64>) -> Vec<Row> {
        range
            .map(|i| vec![Value::from(i.to_string()), Value::from(format!("{i}.5"))])
            .collect()
    }
}
