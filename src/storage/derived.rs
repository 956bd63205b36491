//! Sliced and key-indexed views over another table.
//!
//! A [`DerivedTable`] is a [`Table`] fed by a content observer registered on
//! its source. The view holds the source only through a weak reference, used
//! to look it up and to de-register the observer on [`DerivedTable::release`];
//! the source likewise reaches the view only weakly through that observer.
//! Dropping either side therefore never keeps the other alive.
use std::{ops::Deref, sync::Weak};

use log::{debug, warn};

use super::{
    Row,
    error::StorageError,
    schema::ColumnRef,
    table::{Action, Table, TableInner, TableOptions},
    value::Value,
};

/// A view that mirrors rows of a source table.
///
/// Dereferences to the underlying [`Table`]. Releasing the view (explicitly or
/// by dropping it) detaches it from the source; rows already stored remain.
pub struct DerivedTable {
    table: Table,
    source: Weak<TableInner>,
    key: String,
}

impl DerivedTable {
    /// The source table, if it is still alive.
    pub fn source(&self) -> Option<Table> {
        Table::upgrade(&self.source)
    }

    /// Key under which the view observes its source.
    pub fn observer_key(&self) -> &str {
        &self.key
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn is_released(&self) -> bool {
        self.table.is_released()
    }

    /// Stops mirroring the source. Later notifications are ignored.
    pub fn release(&self) {
        if !self.table.mark_released() {
            return;
        }
        if let Some(source) = self.source() {
            source.remove_content_observer(&self.key);
        }
        debug!("released view '{}' ({})", self.table.name(), self.key);
    }
}

impl Deref for DerivedTable {
    type Target = Table;

    fn deref(&self) -> &Self::Target {
        &self.table
    }
}

impl Drop for DerivedTable {
    fn drop(&mut self) {
        self.release();
    }
}

impl Table {
    /// Creates a view holding the rows whose `column` equals `value`.
    ///
    /// The view has the source's row schema with its own `__id__` sequence;
    /// rows currently in the source are copied over immediately. Removals in
    /// the source are not mirrored.
    pub fn create_sliced_table(
        &self,
        column: impl Into<ColumnRef>,
        value: Value,
        options: TableOptions,
    ) -> Result<DerivedTable, StorageError> {
        let index = self.schema().index_for(column)?;
        let name = format!("{}_slice_{}", self.name(), self.next_view_id());
        let options = TableOptions {
            suppress_index: !self.has_id(),
            ..options
        };
        let view = Table::new(name.clone(), self.row_schema(), options)?;

        let strip = usize::from(self.has_id());
        self.derive(view, name, move |rows| {
            rows.iter()
                .filter(|row| row[index] == value)
                .map(|row| row[strip..].to_vec())
                .collect()
        })
    }

    /// Creates a view keeping only the latest row per distinct `column` value.
    pub fn indexed_by(&self, column: impl Into<ColumnRef>) -> Result<DerivedTable, StorageError> {
        let index = self.schema().index_for(column)?;
        let column = self.schema().name_at(index)?.to_string();
        let name = format!("{}+{column}", self.name());
        let key = format!("{name}#{}", self.next_view_id());
        let options = TableOptions {
            suppress_index: !self.has_id(),
            ..TableOptions::default()
        }
        .indexed_by(column);
        let view = Table::new(name, self.row_schema(), options)?;

        let strip = usize::from(self.has_id());
        self.derive(view, key, move |rows| {
            rows.iter().map(|row| row[strip..].to_vec()).collect()
        })
    }

    fn derive<F>(&self, view: Table, key: String, select: F) -> Result<DerivedTable, StorageError>
    where
        F: Fn(&[Row]) -> Vec<Row> + Send + Sync + 'static,
    {
        let target = view.downgrade();
        self.on_content_changed(key.clone(), Some(0), move |action: Action, rows: &[Row]| {
            if action != Action::Added {
                return;
            }
            let Some(view) = Table::upgrade(&target) else {
                return;
            };
            if view.is_released() {
                return;
            }
            let rows = select(rows);
            if rows.is_empty() {
                return;
            }
            if let Err(e) = view.add_rows(rows) {
                warn!("[{}] dropped mirrored rows: {e}", view.name());
            }
        });

        debug!("view '{}' observes '{}' as '{key}'", view.name(), self.name());
        Ok(DerivedTable {
            source: self.downgrade(),
            table: view,
            key,
        })
    }
}
