//! Column-typed schema descriptors.
//!
//! A [`Schema`] is an ordered list of [`Column`]s. Every column carries a name
//! (unique within the schema), a normalised [`ColumnType`] and a human readable
//! title. Schemas are values: cloning yields an independent copy.
//!
//! # Descriptors
//!
//! Schemas are built from [`ColumnSpec`]s, which mirror the descriptor shapes
//! accepted on the wire and from collaborators:
//!
//! - a bare column name (typed as `string`),
//! - a `[name, type]` or `[name, type, title]` tuple,
//! - a `{ "name": .., "type": .., "title": .. }` map.
//!
//! Type strings are normalised through [`ColumnType::from_alias`]. Unknown or
//! missing types fall back to `string` and emit a warning.
//!
//! # Example
//! ```rust
//! use omlstore::storage::{ColumnType, Schema};
//!
//! let schema = Schema::from_json(r#"[["ts", "double"], ["temp", "real", "Temperature"]]"#).unwrap();
//! assert_eq!(schema.type_at(1), Some(ColumnType::Float));
//! assert_eq!(schema.columns()[0].title, "Ts");
//! ```
use std::{collections::HashMap, fmt};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{
    Row,
    error::StorageError,
    value::{ColumnType, Value},
};

/// Name of the synthetic row-id column tables prepend to their schema.
pub const ID_COLUMN: &str = "__id__";

/// Bookkeeping columns OML adds to every measurement table.
pub const OML_INTERNALS: [&str; 5] = [
    "oml_sender",
    "oml_sender_id",
    "oml_seq",
    "oml_ts_client",
    "oml_ts_server",
];

/// One column of a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    pub title: String,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        let name = name.into();
        let title = default_title(&name);
        Self {
            name,
            column_type,
            title,
        }
    }

    /// Converts the text form of a value of this column.
    pub fn cast(&self, raw: &str) -> Result<Value, StorageError> {
        self.column_type
            .cast(raw)
            .map_err(|e| e.into_error(&self.name, raw, self.column_type))
    }
}

/// Descriptor for a single column, before type normalisation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    Name(String),
    Tuple(Vec<String>),
    Map {
        name: String,
        #[serde(rename = "type", default)]
        column_type: Option<String>,
        #[serde(default)]
        title: Option<String>,
    },
}

impl ColumnSpec {
    pub fn typed(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        ColumnSpec::Map {
            name: name.into(),
            column_type: Some(column_type.into()),
            title: None,
        }
    }

    fn into_column(self) -> Result<Column, StorageError> {
        let (name, declared, title) = match self {
            ColumnSpec::Name(name) => (name, None, None),
            ColumnSpec::Tuple(parts) => {
                let mut parts = parts.into_iter();
                match (parts.next(), parts.next(), parts.next(), parts.next()) {
                    (Some(name), t, title, None) => (name, t, title),
                    _ => {
                        return Err(StorageError::InvalidDescriptor(
                            "column tuple must be [name, type?, title?]".into(),
                        ));
                    }
                }
            }
            ColumnSpec::Map {
                name,
                column_type,
                title,
            } => (name, column_type, title),
        };

        if name.is_empty() {
            return Err(StorageError::InvalidDescriptor("empty column name".into()));
        }

        let column_type = match declared {
            Some(t) => ColumnType::from_alias(&t).unwrap_or_else(|| {
                warn!("unknown type definition '{t}' for column '{name}', default to 'string'");
                ColumnType::String
            }),
            None => {
                warn!("missing type definition for column '{name}', default to 'string'");
                ColumnType::String
            }
        };
        let title = title.unwrap_or_else(|| default_title(&name));

        Ok(Column {
            name,
            column_type,
            title,
        })
    }
}

impl From<&str> for ColumnSpec {
    fn from(value: &str) -> Self {
        ColumnSpec::Name(value.to_string())
    }
}

impl From<(&str, &str)> for ColumnSpec {
    fn from((name, t): (&str, &str)) -> Self {
        ColumnSpec::typed(name, t)
    }
}

impl From<(&str, &str, &str)> for ColumnSpec {
    fn from((name, t, title): (&str, &str, &str)) -> Self {
        ColumnSpec::Map {
            name: name.to_string(),
            column_type: Some(t.to_string()),
            title: Some(title.to_string()),
        }
    }
}

impl From<Column> for ColumnSpec {
    fn from(value: Column) -> Self {
        ColumnSpec::Map {
            name: value.name,
            column_type: Some(value.column_type.to_string()),
            title: Some(value.title),
        }
    }
}

/// Reference to a column by name or position.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnRef {
    Name(String),
    Index(usize),
}

impl From<&str> for ColumnRef {
    fn from(value: &str) -> Self {
        ColumnRef::Name(value.to_string())
    }
}

impl From<String> for ColumnRef {
    fn from(value: String) -> Self {
        ColumnRef::Name(value)
    }
}

impl From<usize> for ColumnRef {
    fn from(value: usize) -> Self {
        ColumnRef::Index(value)
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnRef::Name(name) => write!(f, "{name}"),
            ColumnRef::Index(i) => write!(f, "#{i}"),
        }
    }
}

/// Ordered, typed column layout shared by all rows of a stream or table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    /// Builds a schema from column descriptors.
    pub fn parse<I, S>(descriptor: I) -> Result<Self, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: Into<ColumnSpec>,
    {
        let mut schema = Schema::default();
        for spec in descriptor {
            let index = schema.len();
            schema.insert_column_at(index, spec)?;
        }
        debug!("schema: {schema}");
        Ok(schema)
    }

    /// Builds a schema from a JSON array of column descriptors.
    pub fn from_json(descriptor: &str) -> Result<Self, StorageError> {
        let specs: Vec<ColumnSpec> = serde_json::from_str(descriptor)
            .map_err(|e| StorageError::InvalidDescriptor(e.to_string()))?;
        Self::parse(specs)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn name_at(&self, index: usize) -> Result<&str, StorageError> {
        self.columns
            .get(index)
            .map(|c| c.name.as_str())
            .ok_or_else(|| out_of_bounds(index, self.len()))
    }

    pub fn type_at(&self, index: usize) -> Option<ColumnType> {
        self.columns.get(index).map(|c| c.column_type)
    }

    /// Whether position 0 holds the synthetic row-id column.
    pub fn has_id_column(&self) -> bool {
        self.columns.first().is_some_and(|c| c.name == ID_COLUMN)
    }

    /// Resolves a column reference to its position.
    pub fn index_for(&self, column: impl Into<ColumnRef>) -> Result<usize, StorageError> {
        match column.into() {
            ColumnRef::Index(index) if index < self.len() => Ok(index),
            ColumnRef::Index(index) => Err(out_of_bounds(index, self.len())),
            ColumnRef::Name(name) => self
                .columns
                .iter()
                .position(|c| c.name == name)
                .ok_or(StorageError::UnknownColumn(name)),
        }
    }

    pub fn insert_column_at(
        &mut self,
        index: usize,
        spec: impl Into<ColumnSpec>,
    ) -> Result<(), StorageError> {
        let column = spec.into().into_column()?;
        if self.columns.iter().any(|c| c.name == column.name) {
            return Err(StorageError::DuplicateColumn(column.name));
        }
        if index > self.len() {
            return Err(out_of_bounds(index, self.len()));
        }
        self.columns.insert(index, column);
        Ok(())
    }

    pub fn replace_column_at(
        &mut self,
        index: usize,
        spec: impl Into<ColumnSpec>,
    ) -> Result<(), StorageError> {
        let column = spec.into().into_column()?;
        if index >= self.len() {
            return Err(out_of_bounds(index, self.len()));
        }
        let duplicate = self
            .columns
            .iter()
            .enumerate()
            .any(|(i, c)| i != index && c.name == column.name);
        if duplicate {
            return Err(StorageError::DuplicateColumn(column.name));
        }
        self.columns[index] = column;
        Ok(())
    }

    /// Converts raw text fields into typed values, column by column.
    ///
    /// With `skip_first` the first schema column (usually `__id__`) has no
    /// counterpart in `raw`.
    pub fn cast_row<S: AsRef<str>>(&self, raw: &[S], skip_first: bool) -> Result<Row, StorageError> {
        let start = usize::from(skip_first);
        let expected = self.len().saturating_sub(start);
        if raw.len() != expected {
            return Err(StorageError::SchemaMismatch {
                expected,
                actual: raw.len(),
                schema: self.to_string(),
            });
        }
        self.columns[start..]
            .iter()
            .zip(raw)
            .map(|(column, raw)| column.cast(raw.as_ref()))
            .collect()
    }

    /// Converts a single named column of a raw row.
    pub fn cast_col<S: AsRef<str>>(
        &self,
        column: impl Into<ColumnRef>,
        raw: &[S],
    ) -> Result<Value, StorageError> {
        let index = self.index_for(column)?;
        let value = raw.get(index).ok_or_else(|| StorageError::SchemaMismatch {
            expected: self.len(),
            actual: raw.len(),
            schema: self.to_string(),
        })?;
        self.columns[index].cast(value.as_ref())
    }

    /// Brings typed values in line with the column types.
    ///
    /// String cells in non-string columns are cast; everything else is kept.
    pub fn coerce_row(&self, row: Row) -> Result<Row, StorageError> {
        if row.len() != self.len() {
            return Err(StorageError::SchemaMismatch {
                expected: self.len(),
                actual: row.len(),
                schema: self.to_string(),
            });
        }
        row.into_iter()
            .zip(&self.columns)
            .map(|(value, column)| match value {
                Value::Str(s)
                    if !matches!(column.column_type, ColumnType::String | ColumnType::Key) =>
                {
                    column.cast(&s)
                }
                v => Ok(v),
            })
            .collect()
    }

    /// Turns a name-keyed record into positional form, skipping `__id__`.
    pub fn hash_to_row(
        &self,
        record: &HashMap<String, Value>,
        allow_missing: bool,
    ) -> Result<Row, StorageError> {
        self.columns
            .iter()
            .filter(|c| c.name != ID_COLUMN)
            .map(|c| match record.get(&c.name) {
                Some(v) => Ok(v.clone()),
                None if allow_missing => Ok(Value::Null),
                None => Err(StorageError::MissingField(c.name.clone())),
            })
            .collect()
    }

    /// Copy of this schema without the OML bookkeeping columns.
    pub fn without_internals(&self) -> Schema {
        Schema {
            columns: self
                .columns
                .iter()
                .filter(|c| !OML_INTERNALS.contains(&c.name.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Copy of this schema without the synthetic `__id__` column.
    pub fn without_id(&self) -> Schema {
        Schema {
            columns: self
                .columns
                .iter()
                .filter(|c| c.name != ID_COLUMN)
                .cloned()
                .collect(),
        }
    }

    pub fn describe(&self) -> &[Column] {
        &self.columns
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.columns).unwrap_or_else(|_| "[]".into())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cols = self
            .columns
            .iter()
            .map(|c| format!("{}:{}", c.name, c.column_type))
            .collect::<Vec<_>>();
        write!(f, "Schema: {}", cols.join(", "))
    }
}

fn out_of_bounds(index: usize, width: usize) -> StorageError {
    StorageError::UnknownColumn(format!("index {index} out of bounds for width {width}"))
}

fn default_title(name: &str) -> String {
    name.split('_')
        .filter(|s| !s.is_empty())
        .map(|s| {
            let mut chars = s.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema::parse([("ts", "double"), ("name", "text"), ("count", "int")]).unwrap()
    }

    #[test]
    fn parse_normalises_types() {
        let schema = sample();
        assert_eq!(schema.names(), vec!["ts", "name", "count"]);
        assert_eq!(schema.type_at(0), Some(ColumnType::Float));
        assert_eq!(schema.type_at(1), Some(ColumnType::String));
        assert_eq!(schema.type_at(2), Some(ColumnType::Integer));
    }

    #[test]
    fn unknown_type_defaults_to_string() {
        let schema = Schema::parse([("shape", "geometry")]).unwrap();
        assert_eq!(schema.type_at(0), Some(ColumnType::String));
    }

    #[test]
    fn parse_json_descriptor_shapes() {
        let schema = Schema::from_json(
            r#"["plain", ["speed_kmh", "float"], {"name": "ok", "type": "boolean", "title": "OK?"}]"#,
        )
        .unwrap();
        assert_eq!(schema.type_at(0), Some(ColumnType::String));
        assert_eq!(schema.columns()[1].title, "Speed Kmh");
        assert_eq!(schema.type_at(2), Some(ColumnType::Bool));
        assert_eq!(schema.columns()[2].title, "OK?");
    }

    #[test]
    #[should_panic(expected = "InvalidDescriptor")]
    fn parse_rejects_long_tuples() {
        Schema::from_json(r#"[["a", "int", "A", "extra"]]"#).unwrap();
    }

    #[test]
    #[should_panic(expected = "DuplicateColumn")]
    fn parse_rejects_duplicate_names() {
        Schema::parse(["a", "a"]).unwrap();
    }

    #[test]
    fn index_for_resolves_names_and_positions() {
        let schema = sample();
        assert_eq!(schema.index_for("count").unwrap(), 2);
        assert_eq!(schema.index_for(1).unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "UnknownColumn")]
    fn index_for_unknown_name() {
        sample().index_for("missing").unwrap();
    }

    #[test]
    #[should_panic(expected = "UnknownColumn")]
    fn index_for_out_of_bounds() {
        sample().index_for(3).unwrap();
    }

    #[test]
    fn cast_row_types_fields() {
        let row = sample().cast_row(&["1.5", "probe", "7"], false).unwrap();
        assert_eq!(
            row,
            vec![Value::Float(1.5), Value::Str("probe".into()), Value::Integer(7)]
        );
    }

    #[test]
    fn cast_row_skips_first_column() {
        let mut schema = sample();
        schema.insert_column_at(0, (ID_COLUMN, "int")).unwrap();
        let row = schema.cast_row(&["1.5", "probe", "7"], true).unwrap();
        assert_eq!(row.len(), 3);
    }

    #[test]
    #[should_panic(expected = "SchemaMismatch")]
    fn cast_row_length_mismatch() {
        sample().cast_row(&["1.5", "probe"], false).unwrap();
    }

    #[test]
    fn cast_col_by_name() {
        let v = sample().cast_col("count", &["1.5", "probe", "7"]).unwrap();
        assert_eq!(v, Value::Integer(7));
    }

    #[test]
    fn hash_to_row_orders_and_skips_id() {
        let mut schema = sample();
        schema.insert_column_at(0, (ID_COLUMN, "int")).unwrap();
        let record = HashMap::from([
            ("count".to_string(), Value::Integer(3)),
            ("ts".to_string(), Value::Float(0.5)),
            ("name".to_string(), Value::from("a")),
        ]);
        let row = schema.hash_to_row(&record, false).unwrap();
        assert_eq!(
            row,
            vec![Value::Float(0.5), Value::from("a"), Value::Integer(3)]
        );
    }

    #[test]
    fn hash_to_row_fills_missing_when_allowed() {
        let record = HashMap::from([("ts".to_string(), Value::Float(0.5))]);
        let row = sample().hash_to_row(&record, true).unwrap();
        assert_eq!(row, vec![Value::Float(0.5), Value::Null, Value::Null]);
    }

    #[test]
    #[should_panic(expected = "MissingField")]
    fn hash_to_row_missing_field() {
        sample().hash_to_row(&HashMap::new(), false).unwrap();
    }

    #[test]
    fn clone_is_independent() {
        let schema = sample();
        let mut copy = schema.clone();
        copy.replace_column_at(1, ("label", "string")).unwrap();
        assert_eq!(schema.name_at(1).unwrap(), "name");
        assert_eq!(copy.name_at(1).unwrap(), "label");
    }

    #[test]
    fn without_internals_strips_oml_columns() {
        let schema =
            Schema::parse([("oml_sender_id", "int"), ("oml_seq", "int"), ("value", "float")])
                .unwrap();
        assert_eq!(schema.without_internals().names(), vec!["value"]);
    }

    #[test]
    fn coerce_row_casts_text_cells() {
        let row = sample()
            .coerce_row(vec![Value::from("2.5"), Value::from("x"), Value::Integer(1)])
            .unwrap();
        assert_eq!(row[0], Value::Float(2.5));
        assert_eq!(row[1], Value::from("x"));
    }

    #[test]
    fn describe_serialises_to_json() {
        let json = Schema::parse([("temp", "real")]).unwrap().to_json();
        assert_eq!(json, r#"[{"name":"temp","type":"float","title":"Temp"}]"#);
    }
}
