//! Observable, bounded row store.
//!
//! A [`Table`] is a cheap, clonable handle to shared table state. All mutations
//! (`add_row`, `add_rows`, `set_rows`, `clear`) run under the table's exclusive
//! lock and deliver at most one `Removed` batch followed by at most one `Added`
//! batch to every registered [`ContentObserver`].
//!
//! Retention follows one of two policies, fixed at construction:
//!
//! - **bounded**: rows are kept in insertion order; once `max_size` is exceeded
//!   the oldest rows are evicted and [`Table::offset`] grows accordingly.
//! - **indexed**: only the latest row per distinct value of a key column is kept;
//!   replacing a row reports the prior row as removed.
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use log::{debug, trace};

use super::{
    Row,
    error::StorageError,
    schema::{ColumnRef, ID_COLUMN, Schema},
    value::Value,
};
use crate::utilities::{isolate, lock};

/// Kind of change reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Added,
    Removed,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Added => write!(f, "added"),
            Action::Removed => write!(f, "removed"),
        }
    }
}

/// Receiver of table content changes.
pub trait ContentObserver: Send + Sync {
    fn on_content_changed(&self, action: Action, rows: &[Row]);
}

impl<F> ContentObserver for F
where
    F: Fn(Action, &[Row]) + Send + Sync,
{
    fn on_content_changed(&self, action: Action, rows: &[Row]) {
        self(action, rows)
    }
}

/// Filter applied to every row before it is stored. Returning `None` drops
/// the row.
pub type BeforeRowAdded = Arc<dyn Fn(Row) -> Option<Row> + Send + Sync>;

/// Construction options for a [`Table`].
#[derive(Clone, Default)]
pub struct TableOptions {
    /// Keep at most this many rows, evicting the oldest. `None` or `0` is unbounded.
    pub max_size: Option<usize>,
    /// Do not maintain the synthetic `__id__` column.
    pub suppress_index: bool,
    /// Keep only the latest row per distinct value of this column.
    pub index: Option<ColumnRef>,
    pub before_row_added: Option<BeforeRowAdded>,
}

impl TableOptions {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn with_suppressed_index(mut self) -> Self {
        self.suppress_index = true;
        self
    }

    pub fn indexed_by(mut self, column: impl Into<ColumnRef>) -> Self {
        self.index = Some(column.into());
        self
    }

    pub fn with_before_row_added<F>(mut self, filter: F) -> Self
    where
        F: Fn(Row) -> Option<Row> + Send + Sync + 'static,
    {
        self.before_row_added = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for TableOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableOptions")
            .field("max_size", &self.max_size)
            .field("suppress_index", &self.suppress_index)
            .field("index", &self.index)
            .field("before_row_added", &self.before_row_added.is_some())
            .finish()
    }
}

pub(crate) struct TableInner {
    name: String,
    schema: Schema,
    has_id: bool,
    released: AtomicBool,
    views: AtomicUsize,
    state: Mutex<TableState>,
}

struct KeyIndex {
    column: usize,
    slots: HashMap<Value, usize>,
}

impl KeyIndex {
    fn rebuild(&mut self, rows: &VecDeque<Row>) {
        self.slots.clear();
        for (slot, row) in rows.iter().enumerate() {
            self.slots.insert(row[self.column].clone(), slot);
        }
    }
}

#[derive(Default)]
struct Change {
    added: Vec<Row>,
    removed: Vec<Row>,
}

struct TableState {
    rows: VecDeque<Row>,
    last_id: i64,
    offset: usize,
    max_size: Option<usize>,
    keys: Option<KeyIndex>,
    observers: HashMap<String, Arc<dyn ContentObserver>>,
    before_row_added: Option<BeforeRowAdded>,
}

impl TableState {
    fn assign_id(&mut self, mut row: Row, has_id: bool) -> Row {
        if has_id {
            self.last_id += 1;
            row.insert(0, Value::Integer(self.last_id));
        }
        row
    }

    fn store(&mut self, rows: Vec<Row>, has_id: bool) -> Change {
        match self.keys.take() {
            Some(mut keys) => {
                let change = self.store_indexed(&mut keys, rows, has_id);
                self.keys = Some(keys);
                change
            }
            None => self.store_bounded(rows, has_id),
        }
    }

    fn store_bounded(&mut self, rows: Vec<Row>, has_id: bool) -> Change {
        let before = self.rows.len();
        let count = rows.len();
        let mut evicted = Vec::new();

        for row in rows {
            let row = self.assign_id(row, has_id);
            self.rows.push_back(row);
            if let Some(max) = self.max_size.filter(|m| *m > 0) {
                while self.rows.len() > max {
                    let Some(old) = self.rows.pop_front() else {
                        break;
                    };
                    evicted.push(old);
                    self.offset += 1;
                }
            }
        }

        // Rows added and evicted within the same call are never reported.
        evicted.truncate(before);
        let kept = count.min(self.rows.len());
        let added = self
            .rows
            .iter()
            .skip(self.rows.len() - kept)
            .cloned()
            .collect();

        Change {
            added,
            removed: evicted,
        }
    }

    fn store_indexed(&mut self, keys: &mut KeyIndex, rows: Vec<Row>, has_id: bool) -> Change {
        let id_width = usize::from(has_id);
        let before = self.rows.len();
        let mut change = Change::default();
        let mut replaced = HashSet::new();
        let mut seen = HashSet::new();
        let mut touched = Vec::new();

        for row in rows {
            let existing = match keys.column.checked_sub(id_width) {
                Some(col) => keys.slots.get(&row[col]).copied(),
                None => None,
            };
            if let Some(slot) = existing {
                if self.rows[slot][id_width..] == row[..] {
                    continue;
                }
            }

            let row = self.assign_id(row, has_id);
            let slot = match existing {
                Some(slot) => {
                    let prior = std::mem::replace(&mut self.rows[slot], row);
                    if slot < before && replaced.insert(slot) {
                        change.removed.push(prior);
                    }
                    slot
                }
                None => {
                    let slot = self.rows.len();
                    keys.slots.insert(row[keys.column].clone(), slot);
                    self.rows.push_back(row);
                    slot
                }
            };
            if seen.insert(slot) {
                touched.push(slot);
            }
        }

        change.added = touched.iter().map(|slot| self.rows[*slot].clone()).collect();
        change
    }

    /// Replaces the content, reusing stored rows whose payload reappears.
    fn replace(&mut self, payloads: Vec<Row>, has_id: bool) -> Change {
        let id_width = usize::from(has_id);
        let payloads: Vec<Row> = match &self.keys {
            Some(keys) if keys.column >= id_width => {
                let col = keys.column - id_width;
                let mut order = Vec::new();
                let mut latest: HashMap<Value, Row> = HashMap::new();
                for payload in payloads {
                    let key = payload[col].clone();
                    if !latest.contains_key(&key) {
                        order.push(key.clone());
                    }
                    latest.insert(key, payload);
                }
                order.into_iter().filter_map(|k| latest.remove(&k)).collect()
            }
            Some(_) => payloads,
            None => match self.max_size.filter(|m| *m > 0) {
                Some(max) if payloads.len() > max => {
                    let dropped = payloads.len() - max;
                    self.offset += dropped;
                    payloads.into_iter().skip(dropped).collect()
                }
                _ => payloads,
            },
        };

        let old: Vec<Row> = self.rows.drain(..).collect();
        let mut reusable: HashMap<Row, VecDeque<usize>> = HashMap::new();
        for (i, row) in old.iter().enumerate() {
            reusable
                .entry(row[id_width..].to_vec())
                .or_default()
                .push_back(i);
        }

        let mut used = vec![false; old.len()];
        let mut added = Vec::new();
        for payload in payloads {
            let row = match reusable.get_mut(&payload).and_then(VecDeque::pop_front) {
                Some(i) => {
                    used[i] = true;
                    old[i].clone()
                }
                None => {
                    let row = self.assign_id(payload, has_id);
                    added.push(row.clone());
                    row
                }
            };
            self.rows.push_back(row);
        }

        if let Some(keys) = &mut self.keys {
            keys.rebuild(&self.rows);
        }

        let removed = old
            .into_iter()
            .zip(used)
            .filter(|(_, used)| !used)
            .map(|(row, _)| row)
            .collect();
        Change { added, removed }
    }

    fn notify(&self, table: &str, change: &Change) {
        if !change.removed.is_empty() {
            self.deliver(table, Action::Removed, &change.removed);
        }
        if !change.added.is_empty() {
            self.deliver(table, Action::Added, &change.added);
        }
    }

    fn deliver(&self, table: &str, action: Action, rows: &[Row]) {
        trace!("[{table}] notify {} observer(s): {action} {} row(s)", self.observers.len(), rows.len());
        for (key, observer) in &self.observers {
            isolate(&format!("{table}/{key}"), || {
                observer.on_content_changed(action, rows)
            });
        }
    }
}

/// Ordered, schema-typed row store with change notification.
#[derive(Clone)]
pub struct Table {
    pub(crate) inner: Arc<TableInner>,
}

impl Table {
    /// Creates a table. Unless `suppress_index` is set, an `__id__` column is
    /// prepended to the schema (if not already present) and every stored row
    /// receives a monotonically increasing id.
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        options: TableOptions,
    ) -> Result<Self, StorageError> {
        let name = name.into();
        let mut schema = schema;
        let has_id = !options.suppress_index;
        if has_id && !schema.has_id_column() {
            schema.insert_column_at(0, (ID_COLUMN, "integer"))?;
        }

        let keys = match options.index {
            Some(column) => Some(KeyIndex {
                column: schema.index_for(column)?,
                slots: HashMap::new(),
            }),
            None => None,
        };

        debug!("created table '{name}' ({schema}, options: max_size={:?}, indexed={})", options.max_size, keys.is_some());
        Ok(Self {
            inner: Arc::new(TableInner {
                name,
                schema,
                has_id,
                released: AtomicBool::new(false),
                views: AtomicUsize::new(0),
                state: Mutex::new(TableState {
                    rows: VecDeque::new(),
                    last_id: 0,
                    offset: 0,
                    max_size: options.max_size,
                    keys,
                    observers: HashMap::new(),
                    before_row_added: options.before_row_added,
                }),
            }),
        })
    }

    /// Creates a table from a JSON schema descriptor.
    pub fn from_descriptor(
        name: impl Into<String>,
        descriptor: &str,
        options: TableOptions,
    ) -> Result<Self, StorageError> {
        Self::new(name, Schema::from_json(descriptor)?, options)
    }

    pub(crate) fn downgrade(&self) -> Weak<TableInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<TableInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    /// Schema of the rows callers hand to `add_row`, i.e. without `__id__`.
    pub fn row_schema(&self) -> Schema {
        if self.inner.has_id {
            self.inner.schema.without_id()
        } else {
            self.inner.schema.clone()
        }
    }

    pub fn has_id(&self) -> bool {
        self.inner.has_id
    }

    pub fn is_indexed(&self) -> bool {
        lock(&self.inner.state).keys.is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.state).rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of rows discarded at the head since the table was created.
    pub fn offset(&self) -> usize {
        lock(&self.inner.state).offset
    }

    pub fn max_size(&self) -> Option<usize> {
        lock(&self.inner.state).max_size
    }

    /// Takes effect with the next insertion.
    pub fn set_max_size(&self, max_size: Option<usize>) {
        lock(&self.inner.state).max_size = max_size;
    }

    /// Snapshot of the stored rows.
    pub fn rows(&self) -> Vec<Row> {
        lock(&self.inner.state).rows.iter().cloned().collect()
    }

    pub fn on_before_row_added<F>(&self, filter: F)
    where
        F: Fn(Row) -> Option<Row> + Send + Sync + 'static,
    {
        lock(&self.inner.state).before_row_added = Some(Arc::new(filter));
    }

    /// Adds a row of typed values (without `__id__`).
    ///
    /// Returns the stored row, or `None` if the row was dropped by the
    /// `before_row_added` filter or left an indexed table unchanged.
    pub fn add_row(&self, row: Row) -> Result<Option<Row>, StorageError> {
        Ok(self.insert(vec![row])?.pop())
    }

    /// Casts raw text fields through the schema, then adds them as a row.
    pub fn add_raw_row<S: AsRef<str>>(&self, raw: &[S]) -> Result<Option<Row>, StorageError> {
        let row = self.inner.schema.cast_row(raw, self.inner.has_id)?;
        self.add_row(row)
    }

    /// Adds a name-keyed record.
    pub fn add_record(
        &self,
        record: &HashMap<String, Value>,
        allow_missing: bool,
    ) -> Result<Option<Row>, StorageError> {
        let row = self.inner.schema.hash_to_row(record, allow_missing)?;
        self.add_row(row)
    }

    /// Adds several rows with a single notification per action. Nothing is
    /// stored if any row fails validation. Returns the number of rows stored.
    pub fn add_rows(&self, rows: Vec<Row>) -> Result<usize, StorageError> {
        Ok(self.insert(rows)?.len())
    }

    pub fn add_raw_rows<S: AsRef<str>>(&self, rows: &[Vec<S>]) -> Result<usize, StorageError> {
        let rows = rows
            .iter()
            .map(|raw| self.inner.schema.cast_row(raw, self.inner.has_id))
            .collect::<Result<Vec<Row>, _>>()?;
        self.add_rows(rows)
    }

    /// Replaces the whole content. Observers are told only about rows that
    /// actually disappeared or appeared; rows whose values are unchanged keep
    /// their id.
    pub fn set_rows(&self, rows: Vec<Row>) -> Result<(), StorageError> {
        let mut state = lock(&self.inner.state);
        let prepared = self.prepare(&state, rows)?;
        let change = state.replace(prepared, self.inner.has_id);
        debug!("[{}] set rows: +{} -{}", self.inner.name, change.added.len(), change.removed.len());
        state.notify(&self.inner.name, &change);
        Ok(())
    }

    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        let removed: Vec<Row> = state.rows.drain(..).collect();
        match &mut state.keys {
            Some(keys) => keys.slots.clear(),
            None => state.offset += removed.len(),
        }
        let change = Change {
            added: Vec::new(),
            removed,
        };
        state.notify(&self.inner.name, &change);
    }

    /// Registers `observer` under `key`, replacing any observer with the same key.
    ///
    /// With `replay_from`, rows currently stored from that position on are
    /// delivered as one `Added` batch before any later notification.
    pub fn on_content_changed<O>(&self, key: impl Into<String>, replay_from: Option<usize>, observer: O)
    where
        O: ContentObserver + 'static,
    {
        let key = key.into();
        let observer: Arc<dyn ContentObserver> = Arc::new(observer);
        let mut state = lock(&self.inner.state);

        if let Some(from) = replay_from {
            let rows: Vec<Row> = state.rows.iter().skip(from).cloned().collect();
            if !rows.is_empty() {
                isolate(&format!("{}/{key}", self.inner.name), || {
                    observer.on_content_changed(Action::Added, &rows)
                });
            }
        }

        if state.observers.insert(key.clone(), observer).is_some() {
            debug!("[{}] replaced content observer '{key}'", self.inner.name);
        }
    }

    pub fn remove_content_observer(&self, key: &str) -> bool {
        lock(&self.inner.state).observers.remove(key).is_some()
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner.state).observers.len()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    pub(crate) fn mark_released(&self) -> bool {
        !self.inner.released.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn next_view_id(&self) -> usize {
        self.inner.views.fetch_add(1, Ordering::Relaxed)
    }

    fn insert(&self, rows: Vec<Row>) -> Result<Vec<Row>, StorageError> {
        let mut state = lock(&self.inner.state);
        let prepared = self.prepare(&state, rows)?;
        if prepared.is_empty() {
            return Ok(Vec::new());
        }
        let change = state.store(prepared, self.inner.has_id);
        state.notify(&self.inner.name, &change);
        Ok(change.added)
    }

    fn prepare(&self, state: &TableState, rows: Vec<Row>) -> Result<Vec<Row>, StorageError> {
        let id_width = usize::from(self.inner.has_id);
        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let row = match &state.before_row_added {
                Some(filter) => match filter(row) {
                    Some(row) => row,
                    None => {
                        trace!("[{}] row dropped by filter", self.inner.name);
                        continue;
                    }
                },
                None => row,
            };
            let actual = row.len() + id_width;
            if actual != self.inner.schema.len() {
                return Err(StorageError::RowWidthMismatch {
                    table: self.inner.name.clone(),
                    expected: self.inner.schema.len(),
                    actual,
                });
            }
            prepared.push(row);
        }
        Ok(prepared)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.inner.name)
            .field("schema", &self.inner.schema.to_string())
            .field("rows", &self.len())
            .finish()
    }
}
