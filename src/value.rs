use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};

/// A single cell value as read from, or written to, SQLite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }

    /// Stable textual encoding used for hashing keys and persisting cursors.
    pub fn canonical(&self) -> String {
        match self {
            Value::Null => "n:".to_string(),
            Value::Bool(v) => format!("b:{}", *v as u8),
            Value::Integer(v) => format!("i:{v}"),
            Value::Real(v) => format!("r:{v:?}"),
            Value::Text(v) => format!("t:{v}"),
            Value::Blob(v) => format!("x:{}", hex(v)),
        }
    }

    /// Ordering that mirrors SQLite's: NULL < numbers < text < blob.
    pub fn sql_cmp(&self, other: &Value) -> Ordering {
        fn rank(v: &Value) -> u8 {
            match v {
                Value::Null => 0,
                Value::Bool(_) | Value::Integer(_) | Value::Real(_) => 1,
                Value::Text(_) => 2,
                Value::Blob(_) => 3,
            }
        }
        match (self, other) {
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (a, b) if rank(a) == 1 && rank(b) == 1 => {
                let (x, y) = (a.as_f64().unwrap_or_default(), b.as_f64().unwrap_or_default());
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (a, b) => rank(a).cmp(&rank(b)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Real(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Blob(v) => write!(f, "x'{}'", hex(v)),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

/// One source row: its primary key plus every column by name.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub key: Value,
    pub values: BTreeMap<String, Value>,
}

impl SourceRow {
    pub fn new(key: Value, values: BTreeMap<String, Value>) -> Self {
        Self { key, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Decode every column of a SQLite row; `key_column` must be present.
    pub fn from_sqlite(row: &SqliteRow, key_column: &str) -> Result<Self, sqlx::Error> {
        let values = decode_row(row)?;
        let key = values
            .get(key_column)
            .cloned()
            .ok_or_else(|| sqlx::Error::ColumnNotFound(key_column.to_string()))?;
        Ok(Self { key, values })
    }
}

/// Decode a SQLite row into a column-name keyed map using the storage class of
/// each value.
pub fn decode_row(row: &SqliteRow) -> Result<BTreeMap<String, Value>, sqlx::Error> {
    let mut values = BTreeMap::new();
    for (idx, column) in row.columns().iter().enumerate() {
        values.insert(column.name().to_string(), decode_column(row, idx)?);
    }
    Ok(values)
}

pub fn decode_column(row: &SqliteRow, idx: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();
    let value = match storage.as_str() {
        "INTEGER" | "INT" | "INT8" | "BIGINT" | "BOOLEAN" => {
            Value::Integer(row.try_get_unchecked::<i64, _>(idx)?)
        }
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => Value::Real(row.try_get_unchecked::<f64, _>(idx)?),
        "BLOB" => Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        // Text that is not valid UTF-8 keeps its raw bytes; coercing it into
        // a text column then fails for this row alone.
        _ => match row.try_get_unchecked::<String, _>(idx) {
            Ok(text) => Value::Text(text),
            Err(sqlx::Error::ColumnDecode { .. }) => {
                Value::Blob(row.try_get_unchecked::<Vec<u8>, _>(idx)?)
            }
            Err(err) => return Err(err),
        },
    };
    Ok(value)
}

pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bind a value to a query, mapping `Value::Null` to SQL NULL.
pub fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(Option::<i64>::None),
        Value::Bool(v) => query.bind(*v),
        Value::Integer(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Blob(v) => query.bind(v.clone()),
    }
}
