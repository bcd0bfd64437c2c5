use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::info;

use crate::derive::DerivationError;
use crate::error::codes;
use crate::value::{hex, Value};
use crate::{AppError, AppResult};

static IDENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("table {0} does not exist")]
    MissingTable(String),
    #[error("table {table} is missing column {column}")]
    MissingColumn { table: String, column: String },
    #[error("column {table}.{column} has affinity {found}, expected {expected}")]
    AffinityMismatch {
        table: String,
        column: String,
        expected: String,
        found: String,
    },
    #[error("column {table}.{column} must be the primary key")]
    PrimaryKeyMismatch { table: String, column: String },
    #[error("column {table}.{column} is NOT NULL without default and is not described")]
    UndescribedRequiredColumn { table: String, column: String },
}

impl From<SchemaError> for AppError {
    fn from(error: SchemaError) -> Self {
        let code = match error {
            SchemaError::MissingTable(_) => codes::SCHEMA_MISSING_TABLE,
            SchemaError::InvalidIdentifier(_) => codes::PLAN_INVALID,
            _ => codes::SCHEMA_MISMATCH,
        };
        AppError::new(code, error.to_string())
    }
}

pub fn validate_ident(name: &str) -> Result<(), SchemaError> {
    if IDENT_RE.is_match(name) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}

/// Double-quote an identifier that already passed `validate_ident`.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(v) => (if *v { "1" } else { "0" }).to_string(),
        Value::Integer(v) => v.to_string(),
        Value::Real(v) => format!("{v:?}"),
        Value::Text(v) => format!("'{}'", v.replace('\'', "''")),
        Value::Blob(v) => format!("X'{}'", hex(v)),
    }
}

/// Logical column types understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
    Json,
    Timestamp,
    Blob,
}

/// SQLite type affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Real,
    Text,
    Numeric,
    Blob,
}

impl Affinity {
    /// Affinity of a declared column type, following SQLite's rules.
    pub fn of_declared(decl: &str) -> Affinity {
        let upper = decl.to_ascii_uppercase();
        if upper.contains("INT") {
            Affinity::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Affinity::Text
        } else if upper.contains("BLOB") || upper.trim().is_empty() {
            Affinity::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Affinity::Real
        } else {
            Affinity::Numeric
        }
    }
}

impl ColumnType {
    pub fn sql_type(self) -> &'static str {
        match self {
            ColumnType::Integer | ColumnType::Boolean => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text | ColumnType::Json | ColumnType::Timestamp => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }

    pub fn affinity(self) -> Affinity {
        Affinity::of_declared(self.sql_type())
    }

    pub fn name(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Text => "text",
            ColumnType::Boolean => "boolean",
            ColumnType::Json => "json",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Blob => "blob",
        }
    }

    /// Convert a value into this type's canonical representation. NULL passes
    /// through; nullability is checked by `ColumnDef::coerce`.
    pub fn coerce(self, column: &str, value: Value) -> Result<Value, DerivationError> {
        let mismatch = |found: &Value| DerivationError::Coercion {
            column: column.to_string(),
            expected: self.name().to_string(),
            found: format!("{} {}", found.type_name(), found),
        };
        match (self, value) {
            (_, Value::Null) => Ok(Value::Null),

            (ColumnType::Integer, Value::Integer(v)) => Ok(Value::Integer(v)),
            (ColumnType::Integer, Value::Bool(v)) => Ok(Value::Integer(v as i64)),
            (ColumnType::Integer, Value::Real(v)) if is_integral(v) => Ok(Value::Integer(v as i64)),
            (ColumnType::Integer, Value::Text(ref s)) => {
                let trimmed = s.trim();
                if let Ok(v) = trimmed.parse::<i64>() {
                    return Ok(Value::Integer(v));
                }
                match trimmed.parse::<f64>() {
                    Ok(v) if is_integral(v) => Ok(Value::Integer(v as i64)),
                    _ => Err(mismatch(&Value::Text(s.clone()))),
                }
            }

            (ColumnType::Real, Value::Real(v)) => Ok(Value::Real(v)),
            (ColumnType::Real, Value::Integer(v)) => Ok(Value::Real(v as f64)),
            (ColumnType::Real, Value::Text(ref s)) => s
                .trim()
                .parse::<f64>()
                .map(Value::Real)
                .map_err(|_| mismatch(&Value::Text(s.clone()))),

            (ColumnType::Text, Value::Text(s)) => Ok(Value::Text(s)),
            (ColumnType::Text, Value::Blob(ref bytes)) => Err(mismatch(&Value::Blob(bytes.clone()))),
            (ColumnType::Text, other) => Ok(Value::Text(other.to_string())),

            (ColumnType::Blob, Value::Blob(bytes)) => Ok(Value::Blob(bytes)),
            (ColumnType::Blob, Value::Text(s)) => Ok(Value::Blob(s.into_bytes())),

            (ColumnType::Boolean, Value::Bool(v)) => Ok(Value::Bool(v)),
            (ColumnType::Boolean, Value::Integer(0)) => Ok(Value::Bool(false)),
            (ColumnType::Boolean, Value::Integer(1)) => Ok(Value::Bool(true)),
            (ColumnType::Boolean, Value::Text(ref s)) => {
                match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "t" | "1" | "yes" => Ok(Value::Bool(true)),
                    "false" | "f" | "0" | "no" => Ok(Value::Bool(false)),
                    _ => Err(mismatch(&Value::Text(s.clone()))),
                }
            }

            (ColumnType::Json, Value::Text(ref s)) => serde_json::from_str::<serde_json::Value>(s)
                .map(|parsed| Value::Text(parsed.to_string()))
                .map_err(|_| mismatch(&Value::Text(s.clone()))),
            (ColumnType::Json, Value::Bool(v)) => Ok(Value::Text(v.to_string())),
            (ColumnType::Json, Value::Integer(v)) => Ok(Value::Text(v.to_string())),
            (ColumnType::Json, Value::Real(v)) => serde_json::Number::from_f64(v)
                .map(|n| Value::Text(n.to_string()))
                .ok_or_else(|| mismatch(&Value::Real(v))),

            (ColumnType::Timestamp, Value::Integer(ms)) => DateTime::<Utc>::from_timestamp_millis(ms)
                .map(|dt| Value::Text(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
                .ok_or_else(|| mismatch(&Value::Integer(ms))),
            (ColumnType::Timestamp, Value::Text(ref s)) => normalize_timestamp(s)
                .map(Value::Text)
                .ok_or_else(|| mismatch(&Value::Text(s.clone()))),

            (_, other) => Err(mismatch(&other)),
        }
    }
}

/// Whole and inside the i64 range, so the cast neither rounds nor saturates.
fn is_integral(v: f64) -> bool {
    v.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(&v)
}

fn normalize_timestamp(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(
            dt.with_timezone(&Utc)
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(naive.and_utc().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
    }
    None
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// NOT NULL with no default: some mapping must always produce it.
    pub fn is_required(&self) -> bool {
        !self.nullable && self.default.is_none()
    }

    /// Coerce a derived value into this column, applying the default for NULL.
    pub fn coerce(&self, value: Value) -> Result<Value, DerivationError> {
        let value = match (value, &self.default) {
            (Value::Null, Some(default)) => default.clone(),
            (value, _) => value,
        };
        let coerced = self.ty.coerce(&self.name, value)?;
        if coerced.is_null() && !self.nullable {
            return Err(DerivationError::NullViolation {
                column: self.name.clone(),
            });
        }
        Ok(coerced)
    }

    fn definition_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.ty.sql_type());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&sql_literal(default));
        }
        sql
    }
}

/// Typed description of a table: its columns and primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn validate_identifiers(&self) -> Result<(), SchemaError> {
        validate_ident(&self.name)?;
        validate_ident(&self.primary_key)?;
        for column in &self.columns {
            validate_ident(&column.name)?;
        }
        Ok(())
    }

    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnDef::definition_sql).collect();
        parts.push(format!("PRIMARY KEY ({})", quote_ident(&self.primary_key)));
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote_ident(&self.name),
            parts.join(", ")
        )
    }

    /// Check an existing table against this description.
    pub fn conforms(&self, existing: &IntrospectedTable) -> Result<(), SchemaError> {
        for column in &self.columns {
            let found = existing.column(&column.name).ok_or_else(|| SchemaError::MissingColumn {
                table: self.name.clone(),
                column: column.name.clone(),
            })?;
            let found_affinity = Affinity::of_declared(&found.declared_type);
            if found_affinity != column.ty.affinity() {
                return Err(SchemaError::AffinityMismatch {
                    table: self.name.clone(),
                    column: column.name.clone(),
                    expected: format!("{:?}", column.ty.affinity()),
                    found: format!("{found_affinity:?}"),
                });
            }
        }
        let pk_ok = existing
            .column(&self.primary_key)
            .map(|c| c.primary_key)
            .unwrap_or(false);
        if !pk_ok {
            return Err(SchemaError::PrimaryKeyMismatch {
                table: self.name.clone(),
                column: self.primary_key.clone(),
            });
        }
        for extra in &existing.columns {
            if self.column(&extra.name).is_none() && extra.not_null && !extra.has_default {
                return Err(SchemaError::UndescribedRequiredColumn {
                    table: self.name.clone(),
                    column: extra.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectedColumn {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub has_default: bool,
    pub primary_key: bool,
}

/// Columns of a live table as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectedTable {
    pub name: String,
    pub columns: Vec<IntrospectedColumn>,
}

impl IntrospectedTable {
    pub fn column(&self, name: &str) -> Option<&IntrospectedColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

pub async fn introspect(pool: &SqlitePool, table: &str) -> AppResult<Option<IntrospectedTable>> {
    validate_ident(table)?;
    let rows = sqlx::query(
        "SELECT name, type, \"notnull\" AS not_null, dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
    )
    .bind(table)
    .fetch_all(pool)
    .await
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "schema_introspect")
            .with_context("table", table.to_string())
    })?;
    if rows.is_empty() {
        return Ok(None);
    }
    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let dflt: Option<String> = row.try_get("dflt_value")?;
        columns.push(IntrospectedColumn {
            name: row.try_get("name")?,
            declared_type: row.try_get::<Option<String>, _>("type")?.unwrap_or_default(),
            not_null: row.try_get::<i64, _>("not_null")? != 0,
            has_default: dflt.is_some(),
            primary_key: row.try_get::<i64, _>("pk")? > 0,
        });
    }
    Ok(Some(IntrospectedTable {
        name: table.to_string(),
        columns,
    }))
}

/// Create the target table if missing, or check that the existing one
/// conforms to the description.
pub async fn ensure_table(pool: &SqlitePool, schema: &TableSchema) -> AppResult<()> {
    schema.validate_identifiers()?;
    match introspect(pool, &schema.name).await? {
        Some(existing) => {
            schema.conforms(&existing).map_err(|err| {
                AppError::from(err).with_context("table", schema.name.clone())
            })?;
            info!(target: "tableshift", event = "target_table_conforms", table = %schema.name);
        }
        None => {
            let sql = schema.create_sql();
            sqlx::query(&sql).execute(pool).await.map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "schema_create_table")
                    .with_context("table", schema.name.clone())
            })?;
            info!(target: "tableshift", event = "target_table_created", table = %schema.name);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listings_v2() -> TableSchema {
        TableSchema {
            name: "listings_v2".into(),
            primary_key: "id".into(),
            columns: vec![
                ColumnDef::new("id", ColumnType::Text).not_null(),
                ColumnDef::new("host_id", ColumnType::Text).not_null(),
                ColumnDef::new("garage_number", ColumnType::Integer),
                ColumnDef::new("has_yard", ColumnType::Boolean)
                    .not_null()
                    .with_default(false),
                ColumnDef::new("country", ColumnType::Text)
                    .not_null()
                    .with_default("United States"),
            ],
        }
    }

    #[test]
    fn create_sql_renders_constraints_and_defaults() {
        let sql = listings_v2().create_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"listings_v2\""));
        assert!(sql.contains("\"has_yard\" INTEGER NOT NULL DEFAULT 0"));
        assert!(sql.contains("\"country\" TEXT NOT NULL DEFAULT 'United States'"));
        assert!(sql.ends_with("PRIMARY KEY (\"id\"))"));
    }

    #[test]
    fn required_columns_exclude_defaults() {
        let schema = listings_v2();
        let required: Vec<_> = schema
            .columns
            .iter()
            .filter(|c| c.is_required())
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(required, vec!["id", "host_id"]);
    }

    #[test]
    fn coercion_normalises_values() {
        assert_eq!(
            ColumnType::Boolean.coerce("b", Value::Integer(1)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            ColumnType::Real.coerce("r", Value::Integer(3)).unwrap(),
            Value::Real(3.0)
        );
        assert_eq!(
            ColumnType::Integer.coerce("i", Value::Text(" 42 ".into())).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            ColumnType::Timestamp
                .coerce("t", Value::Text("2024-01-02 03:04:05".into()))
                .unwrap(),
            Value::Text("2024-01-02T03:04:05.000Z".into())
        );
        assert_eq!(
            ColumnType::Json.coerce("j", Value::Text("[ \"wifi\", \"pool\" ]".into())).unwrap(),
            Value::Text("[\"wifi\",\"pool\"]".into())
        );
    }

    #[test]
    fn coercion_failures_are_reported() {
        let err = ColumnType::Integer
            .coerce("square_feet", Value::Text("big".into()))
            .unwrap_err();
        assert!(matches!(err, DerivationError::Coercion { ref column, .. } if column == "square_feet"));
        assert!(ColumnType::Integer.coerce("x", Value::Real(1.5)).is_err());
    }

    #[test]
    fn out_of_range_reals_do_not_saturate() {
        for v in [1e30, -1e30, 9_223_372_036_854_775_808.0, f64::INFINITY, f64::NAN] {
            assert!(
                matches!(
                    ColumnType::Integer.coerce("n", Value::Real(v)),
                    Err(DerivationError::Coercion { .. })
                ),
                "{v} should not coerce"
            );
        }
        assert!(ColumnType::Integer.coerce("n", Value::Text("1e30".into())).is_err());
        assert_eq!(
            ColumnType::Integer.coerce("n", Value::Real(-9_223_372_036_854_775_808.0)).unwrap(),
            Value::Integer(i64::MIN)
        );
    }

    #[test]
    fn blobs_never_become_text() {
        let bytes = vec![0x00, 0xff, 0x10];
        assert!(matches!(
            ColumnType::Text.coerce("payload", Value::Blob(bytes.clone())),
            Err(DerivationError::Coercion { ref found, .. }) if found == "blob x'00ff10'"
        ));
        assert_eq!(
            ColumnType::Blob.coerce("payload", Value::Blob(bytes.clone())).unwrap(),
            Value::Blob(bytes)
        );
        assert_eq!(sql_literal(&Value::Blob(vec![0xab])), "X'ab'");
    }

    #[test]
    fn column_coerce_applies_default_and_null_rules() {
        let schema = listings_v2();
        let country = schema.column("country").unwrap();
        assert_eq!(
            country.coerce(Value::Null).unwrap(),
            Value::Text("United States".into())
        );
        let host = schema.column("host_id").unwrap();
        assert!(matches!(
            host.coerce(Value::Null),
            Err(DerivationError::NullViolation { .. })
        ));
    }

    #[test]
    fn identifiers_are_validated() {
        assert!(validate_ident("listings_v2").is_ok());
        assert!(validate_ident("drop table;").is_err());
        assert!(validate_ident("1abc").is_err());
    }

    #[test]
    fn conformance_detects_affinity_and_pk_problems() {
        let schema = listings_v2();
        let mut existing = IntrospectedTable {
            name: "listings_v2".into(),
            columns: schema
                .columns
                .iter()
                .map(|c| IntrospectedColumn {
                    name: c.name.clone(),
                    declared_type: c.ty.sql_type().into(),
                    not_null: !c.nullable,
                    has_default: c.default.is_some(),
                    primary_key: c.name == "id",
                })
                .collect(),
        };
        assert!(schema.conforms(&existing).is_ok());

        existing.columns[2].declared_type = "TEXT".into();
        assert!(matches!(
            schema.conforms(&existing),
            Err(SchemaError::AffinityMismatch { .. })
        ));
        existing.columns[2].declared_type = "INTEGER".into();
        existing.columns[0].primary_key = false;
        assert!(matches!(
            schema.conforms(&existing),
            Err(SchemaError::PrimaryKeyMismatch { .. })
        ));
    }
}
