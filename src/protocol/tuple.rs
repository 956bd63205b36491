//! Typed tuple streams.
//!
//! A [`Stream`] is created for every schema declared on an OML connection. Each
//! data row received for it becomes a [`Tuple`] handed to the stream's
//! observers. Tuples keep the raw text fields and cast them lazily, so
//! observers that only look at a couple of columns pay only for those.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, warn};

use crate::{
    storage::{ColumnRef, Row, Schema, StorageError, Table, TableOptions, Value},
    utilities::{isolate, lock},
};

/// Timestamp column injected into every declared stream schema.
pub const TS_COLUMN: &str = "oml_ts";
/// Sender id column injected into every declared stream schema.
pub const SENDER_COLUMN: &str = "sender_id";
/// Sequence number column injected into every declared stream schema.
pub const SEQ_NO_COLUMN: &str = "oml_seq_no";

pub type TupleObserver = Arc<dyn Fn(&Tuple) + Send + Sync>;

/// Named, schema-typed sequence of tuples.
#[derive(Clone)]
pub struct Stream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    name: String,
    index: usize,
    schema: Arc<Schema>,
    observers: Mutex<HashMap<String, TupleObserver>>,
    seen: AtomicU64,
}

impl Stream {
    /// Creates a stream declared at the 0-based wire `index`.
    pub fn new(name: impl Into<String>, index: usize, schema: Schema) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                name: name.into(),
                index,
                schema: Arc::new(schema),
                observers: Mutex::new(HashMap::new()),
                seen: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn tuples_seen(&self) -> u64 {
        self.inner.seen.load(Ordering::Relaxed)
    }

    /// Registers `f` to be called for every new tuple, replacing any observer
    /// registered under the same key.
    pub fn on_new_tuple<F>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(&Tuple) + Send + Sync + 'static,
    {
        lock(&self.inner.observers).insert(key.into(), Arc::new(f));
    }

    pub fn remove_tuple_observer(&self, key: &str) -> bool {
        lock(&self.inner.observers).remove(key).is_some()
    }

    /// Wraps raw fields into a tuple and hands it to every observer.
    pub fn parse_tuple(&self, raw: Vec<String>) -> Tuple {
        self.inner.seen.fetch_add(1, Ordering::Relaxed);
        let tuple = Tuple {
            stream: self.clone(),
            raw,
        };

        let observers: Vec<(String, TupleObserver)> = lock(&self.inner.observers)
            .iter()
            .map(|(key, f)| (key.clone(), Arc::clone(f)))
            .collect();
        for (key, f) in observers {
            isolate(&format!("{}/{key}", self.inner.name), || f(&tuple));
        }
        tuple
    }

    /// Creates a table with this stream's schema and feeds every new tuple
    /// into it.
    pub fn create_table(
        &self,
        name: impl Into<String>,
        options: TableOptions,
    ) -> Result<Table, StorageError> {
        let table = Table::new(name, self.schema().clone(), options)?;
        let target = table.clone();
        self.on_new_tuple(table.name(), move |tuple: &Tuple| {
            let stored = tuple.to_row().and_then(|row| target.add_row(row));
            if let Err(e) = stored {
                warn!("[{}] dropped tuple from '{}': {e}", target.name(), tuple.stream().name());
            }
        });
        debug!("stream '{}' feeds table '{}'", self.name(), table.name());
        Ok(table)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.inner.name)
            .field("index", &self.inner.index)
            .field("schema", &self.inner.schema.to_string())
            .finish()
    }
}

/// One measurement record of a [`Stream`], kept in its raw text form.
#[derive(Debug, Clone)]
pub struct Tuple {
    stream: Stream,
    raw: Vec<String>,
}

impl Tuple {
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn schema(&self) -> &Schema {
        self.stream.schema()
    }

    pub fn raw(&self) -> &[String] {
        &self.raw
    }

    /// Typed value of a single column.
    pub fn get(&self, column: impl Into<ColumnRef>) -> Result<Value, StorageError> {
        self.schema().cast_col(column, &self.raw)
    }

    /// Typed values of the given columns, in the order requested.
    pub fn select<I, C>(&self, columns: I) -> Result<Row, StorageError>
    where
        I: IntoIterator<Item = C>,
        C: Into<ColumnRef>,
    {
        columns.into_iter().map(|c| self.get(c)).collect()
    }

    pub fn to_row(&self) -> Result<Row, StorageError> {
        self.schema().cast_row(&self.raw, false)
    }

    pub fn ts(&self) -> Option<f64> {
        self.raw.first()?.trim().parse().ok()
    }

    pub fn sender_id(&self) -> Option<&str> {
        self.raw.get(1).map(String::as_str)
    }

    pub fn seq_no(&self) -> Option<i64> {
        let index = self.schema().index_for(SEQ_NO_COLUMN).ok()?;
        self.raw.get(index)?.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        let schema = Schema::parse([
            (TS_COLUMN, "double"),
            (SENDER_COLUMN, "string"),
            (SEQ_NO_COLUMN, "integer"),
            ("temp", "float"),
        ])
        .unwrap();
        Stream::new("weather", 0, schema)
    }

    fn raw(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn observers_receive_tuples() {
        let s = stream();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        s.on_new_tuple("temps", move |t: &Tuple| {
            sink.lock().unwrap().push(t.get("temp").unwrap());
        });

        s.parse_tuple(raw(&["0.5", "node1", "1", "21.5"]));
        s.parse_tuple(raw(&["1.5", "node1", "2", "22.0"]));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Value::Float(21.5), Value::Float(22.0)]
        );
        assert_eq!(s.tuples_seen(), 2);
    }

    #[test]
    fn removed_observer_stops_receiving() {
        let s = stream();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        s.on_new_tuple("count", move |_: &Tuple| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        s.parse_tuple(raw(&["0.5", "node1", "1", "21.5"]));
        assert!(s.remove_tuple_observer("count"));
        s.parse_tuple(raw(&["1.5", "node1", "2", "22.0"]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tuple_accessors() {
        let t = stream().parse_tuple(raw(&["2.25", "node7", "42", "19.5"]));
        assert_eq!(t.ts(), Some(2.25));
        assert_eq!(t.sender_id(), Some("node7"));
        assert_eq!(t.seq_no(), Some(42));
        assert_eq!(
            t.select(["temp", SENDER_COLUMN]).unwrap(),
            vec![Value::Float(19.5), Value::from("node7")]
        );
        assert_eq!(t.to_row().unwrap().len(), 4);
    }

    #[test]
    #[should_panic(expected = "Conversion")]
    fn tuple_get_with_bad_value() {
        let t = stream().parse_tuple(raw(&["2.25", "node7", "42", "warm"]));
        t.get(3).unwrap();
    }

    #[test]
    fn create_table_feeds_rows() {
        let s = stream();
        let table = s
            .create_table("weather", TableOptions::default().with_max_size(2))
            .unwrap();
        for seq in 1..=3 {
            s.parse_tuple(raw(&["0.5", "node1", seq.to_string().as_str(), "20.0"]));
        }
        // malformed tuples are dropped without affecting the table
        s.parse_tuple(raw(&["0.5", "node1"]));

        let rows = table.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Integer(2));
        assert_eq!(rows[1][3], Value::Integer(3));
        assert_eq!(table.offset(), 1);
    }

    #[test]
    fn failing_observer_is_isolated() {
        let s = stream();
        fn broken(_: &Tuple) {
            panic!("observer failure");
        }
        s.on_new_tuple("broken", broken);
        let table = s.create_table("t", TableOptions::default()).unwrap();
        s.parse_tuple(raw(&["0.5", "node1", "1", "20.0"]));
        assert_eq!(table.len(), 1);
    }
}
