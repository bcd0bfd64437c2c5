use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::DerivationError;
use crate::value::{SourceRow, Value};

/// A boolean test over a source row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Eq { column: String, value: Value },
    Ne { column: String, value: Value },
    In { column: String, values: Vec<Value> },
    Gt { column: String, value: Value },
    Ge { column: String, value: Value },
    Lt { column: String, value: Value },
    Le { column: String, value: Value },
    IsNull { column: String },
    NotNull { column: String },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

fn lookup<'r>(row: &'r SourceRow, column: &str) -> Result<&'r Value, DerivationError> {
    row.get(column).ok_or_else(|| DerivationError::MissingField {
        column: column.to_string(),
    })
}

/// Equality across numeric storage classes (2 == 2.0), exact otherwise.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for range tests; NULL and cross-class comparisons never match.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

impl Condition {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Condition::Eq {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn one_of<V: Into<Value>>(column: &str, values: impl IntoIterator<Item = V>) -> Self {
        Condition::In {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn gt(column: &str, value: impl Into<Value>) -> Self {
        Condition::Gt {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn ge(column: &str, value: impl Into<Value>) -> Self {
        Condition::Ge {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Condition::All { conditions }
    }

    pub fn evaluate(&self, row: &SourceRow) -> Result<bool, DerivationError> {
        let range = |column: &str, value: &Value, accept: fn(Ordering) -> bool| {
            lookup(row, column).map(|found| compare(found, value).map(accept).unwrap_or(false))
        };
        match self {
            Condition::Eq { column, value } => Ok(values_equal(lookup(row, column)?, value)),
            Condition::Ne { column, value } => {
                let found = lookup(row, column)?;
                Ok(!found.is_null() && !values_equal(found, value))
            }
            Condition::In { column, values } => {
                let found = lookup(row, column)?;
                Ok(values.iter().any(|candidate| values_equal(found, candidate)))
            }
            Condition::Gt { column, value } => range(column, value, Ordering::is_gt),
            Condition::Ge { column, value } => range(column, value, Ordering::is_ge),
            Condition::Lt { column, value } => range(column, value, Ordering::is_lt),
            Condition::Le { column, value } => range(column, value, Ordering::is_le),
            Condition::IsNull { column } => Ok(lookup(row, column)?.is_null()),
            Condition::NotNull { column } => Ok(!lookup(row, column)?.is_null()),
            Condition::All { conditions } => {
                for condition in conditions {
                    if !condition.evaluate(row)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Any { conditions } => {
                for condition in conditions {
                    if condition.evaluate(row)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { condition } => Ok(!condition.evaluate(row)?),
        }
    }

    /// Source columns this condition reads.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            Condition::Eq { column, .. }
            | Condition::Ne { column, .. }
            | Condition::In { column, .. }
            | Condition::Gt { column, .. }
            | Condition::Ge { column, .. }
            | Condition::Lt { column, .. }
            | Condition::Le { column, .. }
            | Condition::IsNull { column }
            | Condition::NotNull { column } => vec![column.as_str()],
            Condition::All { conditions } | Condition::Any { conditions } => {
                conditions.iter().flat_map(Condition::columns).collect()
            }
            Condition::Not { condition } => condition.columns(),
        }
    }
}

/// What a matching predicate row produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Literal { value: Value },
    Column { name: String },
    /// `column * factor`; NULL stays NULL.
    Scaled { column: String, factor: f64 },
}

impl Outcome {
    pub fn literal(value: impl Into<Value>) -> Self {
        Outcome::Literal {
            value: value.into(),
        }
    }

    fn produce(&self, row: &SourceRow, rule: &str) -> Result<Value, DerivationError> {
        match self {
            Outcome::Literal { value } => Ok(value.clone()),
            Outcome::Column { name } => lookup(row, name).cloned(),
            Outcome::Scaled { column, factor } => {
                let found = lookup(row, column)?;
                if found.is_null() {
                    return Ok(Value::Null);
                }
                let base = found.as_f64().ok_or_else(|| DerivationError::Coercion {
                    column: column.clone(),
                    expected: "number".into(),
                    found: format!("{} {}", found.type_name(), found),
                })?;
                let scaled = base * factor;
                if !scaled.is_finite() {
                    return Err(DerivationError::DomainViolation {
                        rule: rule.to_string(),
                        column: column.clone(),
                        detail: "scaled value is not finite".into(),
                    });
                }
                Ok(Value::Real(scaled))
            }
        }
    }

    fn columns(&self) -> Vec<&str> {
        match self {
            Outcome::Literal { .. } => Vec::new(),
            Outcome::Column { name } => vec![name.as_str()],
            Outcome::Scaled { column, .. } => vec![column.as_str()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateRow {
    pub when: Condition,
    pub then: Outcome,
}

/// Guard that must hold for every row; a failing guard is a domain violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Guard {
    pub condition: Condition,
    pub message: String,
}

/// Ordered `condition -> outcome` table; the first matching row wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateTable {
    #[serde(default)]
    pub guards: Vec<Guard>,
    pub rows: Vec<PredicateRow>,
    pub otherwise: Outcome,
}

impl PredicateTable {
    pub fn new(rows: Vec<PredicateRow>, otherwise: Outcome) -> Self {
        Self {
            guards: Vec::new(),
            rows,
            otherwise,
        }
    }

    pub fn with_guard(mut self, condition: Condition, message: impl Into<String>) -> Self {
        self.guards.push(Guard {
            condition,
            message: message.into(),
        });
        self
    }

    pub fn evaluate(&self, row: &SourceRow, rule: &str) -> Result<Value, DerivationError> {
        for guard in &self.guards {
            if !guard.condition.evaluate(row)? {
                return Err(DerivationError::DomainViolation {
                    rule: rule.to_string(),
                    column: guard.condition.columns().join(","),
                    detail: guard.message.clone(),
                });
            }
        }
        for entry in &self.rows {
            if entry.when.evaluate(row)? {
                return entry.then.produce(row, rule);
            }
        }
        self.otherwise.produce(row, rule)
    }

    pub fn columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = self
            .guards
            .iter()
            .flat_map(|g| g.condition.columns())
            .collect();
        for entry in &self.rows {
            cols.extend(entry.when.columns());
            cols.extend(entry.then.columns());
        }
        cols.extend(self.otherwise.columns());
        cols.sort_unstable();
        cols.dedup();
        cols
    }
}
