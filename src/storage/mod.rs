//! In-memory, schema-typed table storage.
//!
//! This module holds the storage engine that OML streams and SQL sources feed
//! into. Tables keep an ordered sequence of typed rows, bounded either by a
//! maximum size (oldest rows are evicted first) or by a key column (only the
//! latest row per key value is retained), and fan every change out to
//! registered observers.
//!
//! # Key Components
//!
//! - [`Schema`]: Typed column layout, parsed from descriptors.
//! - [`Value`]: A single typed cell.
//! - [`Table`]: Observable, bounded row store guarded by a per-table lock.
//! - [`DerivedTable`]: Sliced or key-indexed view over another table that
//!   tracks its source through a weak back-reference.
//!
//! # Notifications
//!
//! Observers are invoked synchronously, inside the table's critical section, in
//! the order mutations were applied. They must return promptly and must not
//! call back into the table that notifies them; a slow observer stalls every
//! writer of that table.
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): Feeds tuples received over the network into tables.
//! - [`query`](crate::query): Feeds rows fetched from a relational store into tables.
pub mod derived;
pub mod schema;
pub mod table;
pub mod value;

pub use derived::DerivedTable;
pub use schema::{Column, ColumnRef, ColumnSpec, ID_COLUMN, OML_INTERNALS, Schema};
pub use table::{Action, BeforeRowAdded, ContentObserver, Table, TableOptions};
pub use value::{ColumnType, Value};

/// Ordered sequence of typed values conforming to a schema.
pub type Row = Vec<Value>;

pub mod error {
    use thiserror::Error;

    use super::value::ColumnType;

    #[derive(Debug, Clone, PartialEq, Eq, Error)]
    pub enum StorageError {
        #[error("unknown column '{0}'")]
        UnknownColumn(String),

        #[error("duplicate column '{0}'")]
        DuplicateColumn(String),

        #[error("row has {actual} fields but {schema} expects {expected}")]
        SchemaMismatch {
            expected: usize,
            actual: usize,
            schema: String,
        },

        #[error("missing record element '{0}'")]
        MissingField(String),

        #[error("[table {table}] row width {actual} does not match schema width {expected}")]
        RowWidthMismatch {
            table: String,
            expected: usize,
            actual: usize,
        },

        #[error("cannot convert '{value}' into {column_type} for column '{column}'")]
        Conversion {
            column: String,
            value: String,
            column_type: ColumnType,
        },

        #[error("invalid schema descriptor: {0}")]
        InvalidDescriptor(String),
    }
}

pub use error::StorageError;
