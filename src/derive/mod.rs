//! Pure derivation of target column values from a source row.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::codes;
use crate::value::{SourceRow, Value};
use crate::AppError;

pub mod predicate;
pub mod seeded;

pub use predicate::{Condition, Guard, Outcome, PredicateRow, PredicateTable};

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivationError {
    #[error("source row is missing required field {column}")]
    MissingField { column: String },
    #[error("cannot coerce {found} into {expected} for column {column}")]
    Coercion {
        column: String,
        expected: String,
        found: String,
    },
    #[error("rule {rule} rejected {column}: {detail}")]
    DomainViolation {
        rule: String,
        column: String,
        detail: String,
    },
    #[error("column {column} is NOT NULL but derived NULL")]
    NullViolation { column: String },
}

impl From<DerivationError> for AppError {
    fn from(error: DerivationError) -> Self {
        AppError::new(codes::DERIVATION, error.to_string())
    }
}

/// How a target column gets its value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DerivationRule {
    /// The mapping's source column, with an optional substitute for NULL.
    Copy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    Constant { value: Value },
    Computed { table: PredicateTable },
    /// Bernoulli(`probability`) draw seeded by `(row key, rule_id)`, taken only
    /// when `when` holds. A hit yields `value`; every other row uses `otherwise`.
    RandomizedConditional {
        rule_id: String,
        when: Condition,
        probability: f64,
        value: Value,
        otherwise: Box<DerivationRule>,
    },
}

impl DerivationRule {
    pub fn copy() -> Self {
        DerivationRule::Copy { default: None }
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        DerivationRule::Constant {
            value: value.into(),
        }
    }

    pub fn computed(table: PredicateTable) -> Self {
        DerivationRule::Computed { table }
    }

    pub fn is_randomized(&self) -> bool {
        matches!(self, DerivationRule::RandomizedConditional { .. })
    }

    /// Rule ids of every randomized rule nested in this one.
    pub fn random_rule_ids(&self) -> Vec<&str> {
        match self {
            DerivationRule::RandomizedConditional {
                rule_id, otherwise, ..
            } => {
                let mut ids = vec![rule_id.as_str()];
                ids.extend(otherwise.random_rule_ids());
                ids
            }
            _ => Vec::new(),
        }
    }

    /// Source columns read by this rule, other than the mapping's own
    /// source column.
    pub fn referenced_columns(&self) -> Vec<&str> {
        match self {
            DerivationRule::Copy { .. } | DerivationRule::Constant { .. } => Vec::new(),
            DerivationRule::Computed { table } => table.columns(),
            DerivationRule::RandomizedConditional {
                when, otherwise, ..
            } => {
                let mut cols = when.columns();
                cols.extend(otherwise.referenced_columns());
                cols
            }
        }
    }

    fn evaluate(
        &self,
        row: &SourceRow,
        source_column: Option<&str>,
        target_column: &str,
    ) -> Result<Value, DerivationError> {
        match self {
            DerivationRule::Copy { default } => {
                let column = source_column.unwrap_or(target_column);
                let found = row.get(column).ok_or_else(|| DerivationError::MissingField {
                    column: column.to_string(),
                })?;
                match (found, default) {
                    (Value::Null, Some(default)) => Ok(default.clone()),
                    (found, _) => Ok(found.clone()),
                }
            }
            DerivationRule::Constant { value } => Ok(value.clone()),
            DerivationRule::Computed { table } => table.evaluate(row, target_column),
            DerivationRule::RandomizedConditional {
                rule_id,
                when,
                probability,
                value,
                otherwise,
            } => {
                if when.evaluate(row)? && seeded::bernoulli(&row.key, rule_id, *probability) {
                    Ok(value.clone())
                } else {
                    otherwise.evaluate(row, None, target_column)
                }
            }
        }
    }
}

/// One target column and the rule producing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_column: Option<String>,
    pub target_column: String,
    pub derivation: DerivationRule,
}

impl ColumnMapping {
    pub fn copy(source: &str, target: &str) -> Self {
        Self {
            source_column: Some(source.to_string()),
            target_column: target.to_string(),
            derivation: DerivationRule::copy(),
        }
    }

    pub fn derived(target: &str, derivation: DerivationRule) -> Self {
        Self {
            source_column: None,
            target_column: target.to_string(),
            derivation,
        }
    }
}

/// Derive the value of one mapped column from a source row. Pure: the result
/// depends only on the row and the mapping.
pub fn derive(row: &SourceRow, mapping: &ColumnMapping) -> Result<Value, DerivationError> {
    mapping
        .derivation
        .evaluate(row, mapping.source_column.as_deref(), &mapping.target_column)
}
