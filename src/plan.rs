use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::derive::{ColumnMapping, DerivationRule};
use crate::error::codes;
use crate::schema::{validate_ident, IntrospectedTable, SchemaError, TableSchema};
use crate::value::Value;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTable {
    pub table: String,
    pub primary_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    AddFk,
    DropFk,
    AddCheck,
    DropCheck,
}

impl ConstraintKind {
    pub fn is_add(self) -> bool {
        matches!(self, ConstraintKind::AddFk | ConstraintKind::AddCheck)
    }

    pub fn is_fk(self) -> bool {
        matches!(self, ConstraintKind::AddFk | ConstraintKind::DropFk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    Restrict,
    SetNull,
    #[default]
    NoAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

/// Row predicate enforced by an `add_check` change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckPredicate {
    NotNull,
    Range {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    OneOf { values: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintChange {
    pub kind: ConstraintKind,
    pub table: String,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignKeyRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<OnDelete>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckPredicate>,
}

impl ConstraintChange {
    pub fn add_fk(table: &str, column: &str, parent: &str, parent_column: &str, on_delete: OnDelete) -> Self {
        Self {
            kind: ConstraintKind::AddFk,
            table: table.into(),
            column: column.into(),
            references: Some(ForeignKeyRef {
                table: parent.into(),
                column: parent_column.into(),
            }),
            on_delete: Some(on_delete),
            check: None,
        }
    }

    pub fn add_check(table: &str, column: &str, check: CheckPredicate) -> Self {
        Self {
            kind: ConstraintKind::AddCheck,
            table: table.into(),
            column: column.into(),
            references: None,
            on_delete: None,
            check: Some(check),
        }
    }

    /// Short human label, e.g. `add_fk listings_v2.host_id -> profiles.id`.
    pub fn label(&self) -> String {
        let kind = match self.kind {
            ConstraintKind::AddFk => "add_fk",
            ConstraintKind::DropFk => "drop_fk",
            ConstraintKind::AddCheck => "add_check",
            ConstraintKind::DropCheck => "drop_check",
        };
        match &self.references {
            Some(parent) => format!(
                "{kind} {}.{} -> {}.{}",
                self.table, self.column, parent.table, parent.column
            ),
            None => format!("{kind} {}.{}", self.table, self.column),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("batch_size must be at least 1")]
    BatchSize,
    #[error("required target column {0} has no mapping")]
    UnmappedRequiredColumn(String),
    #[error("target column {0} is mapped more than once")]
    DuplicateMapping(String),
    #[error("target column {0} does not exist in the target schema")]
    UnknownTargetColumn(String),
    #[error("target primary key {target_key} must be a copy of source primary key {source_key}")]
    PrimaryKeyNotCopied { source_key: String, target_key: String },
    #[error("randomized rule id {0} is used more than once")]
    DuplicateRuleId(String),
    #[error("randomized rule for {0} must not name a source column")]
    RandomizedWithSource(String),
    #[error("randomized rule for {0} targets a column that exists in the source table")]
    RandomizedShadowsSource(String),
    #[error("probability {probability} for rule {rule} is outside [0, 1]")]
    Probability { rule: String, probability: String },
    #[error("source column {0} does not exist")]
    UnknownSourceColumn(String),
    #[error("source primary key {0} is not the primary key of the source table")]
    SourceKeyMismatch(String),
    #[error("source and target must be different tables, both are {0}")]
    SameTable(String),
    #[error("constraint {0}: {1}")]
    Constraint(String, String),
}

impl From<PlanError> for AppError {
    fn from(error: PlanError) -> Self {
        match error {
            PlanError::Schema(inner) => inner.into(),
            other => AppError::new(codes::PLAN_INVALID, other.to_string()),
        }
    }
}

/// Immutable description of one source to target migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub source: SourceTable,
    pub target: TableSchema,
    /// Name readers resolve through the router; defaults to the source table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_name: Option<String>,
    pub mappings: Vec<ColumnMapping>,
    #[serde(default)]
    pub constraints: Vec<ConstraintChange>,
    pub batch_size: u32,
}

impl MigrationPlan {
    pub fn from_json_str(raw: &str) -> AppResult<Self> {
        let plan: MigrationPlan = serde_json::from_str(raw)
            .map_err(|err| AppError::new(codes::PLAN_INVALID, err.to_string()))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "plan_load")
                .with_context("path", path.display().to_string())
        })?;
        Self::from_json_str(&raw)
            .map_err(|err| err.with_context("path", path.display().to_string()))
    }

    pub fn logical_name(&self) -> &str {
        self.logical_name.as_deref().unwrap_or(&self.source.table)
    }

    pub fn mapping_for(&self, target_column: &str) -> Option<&ColumnMapping> {
        self.mappings.iter().find(|m| m.target_column == target_column)
    }

    /// Constraint changes that add enforcement.
    pub fn added_constraints(&self) -> impl Iterator<Item = &ConstraintChange> {
        self.constraints.iter().filter(|c| c.kind.is_add())
    }

    /// Structural checks that need no database.
    pub fn validate(&self) -> Result<(), PlanError> {
        validate_ident(&self.source.table)?;
        validate_ident(&self.source.primary_key)?;
        self.target.validate_identifiers()?;
        if let Some(name) = &self.logical_name {
            validate_ident(name)?;
        }
        if self.batch_size == 0 {
            return Err(PlanError::BatchSize);
        }
        if self.source.table == self.target.name {
            return Err(PlanError::SameTable(self.target.name.clone()));
        }

        let mut mapped = HashSet::new();
        let mut rule_ids = HashSet::new();
        for mapping in &self.mappings {
            validate_ident(&mapping.target_column)?;
            if let Some(source) = &mapping.source_column {
                validate_ident(source)?;
            }
            if !mapped.insert(mapping.target_column.as_str()) {
                return Err(PlanError::DuplicateMapping(mapping.target_column.clone()));
            }
            if self.target.column(&mapping.target_column).is_none() {
                return Err(PlanError::UnknownTargetColumn(mapping.target_column.clone()));
            }
            if mapping.derivation.is_randomized() && mapping.source_column.is_some() {
                return Err(PlanError::RandomizedWithSource(mapping.target_column.clone()));
            }
            check_probabilities(&mapping.derivation)?;
            for id in mapping.derivation.random_rule_ids() {
                if !rule_ids.insert(id) {
                    return Err(PlanError::DuplicateRuleId(id.to_string()));
                }
            }
        }

        for column in self.target.columns.iter().filter(|c| c.is_required()) {
            if !mapped.contains(column.name.as_str()) {
                return Err(PlanError::UnmappedRequiredColumn(column.name.clone()));
            }
        }

        let pk_copied = self.mapping_for(&self.target.primary_key).is_some_and(|m| {
            matches!(m.derivation, DerivationRule::Copy { default: None })
                && m.source_column.as_deref() == Some(self.source.primary_key.as_str())
        });
        if !pk_copied {
            return Err(PlanError::PrimaryKeyNotCopied {
                source_key: self.source.primary_key.clone(),
                target_key: self.target.primary_key.clone(),
            });
        }

        for change in &self.constraints {
            self.validate_constraint(change)?;
        }
        Ok(())
    }

    fn validate_constraint(&self, change: &ConstraintChange) -> Result<(), PlanError> {
        let fail = |detail: &str| -> Result<(), PlanError> {
            Err(PlanError::Constraint(change.label(), detail.to_string()))
        };
        validate_ident(&change.table)?;
        validate_ident(&change.column)?;
        if change.table != self.target.name {
            return fail("constraints may only be attached to the target table");
        }
        if change.kind.is_add() && self.target.column(&change.column).is_none() {
            return fail("column is not part of the target schema");
        }
        match change.kind {
            ConstraintKind::AddFk => {
                let Some(parent) = &change.references else {
                    return fail("add_fk requires references");
                };
                validate_ident(&parent.table)?;
                validate_ident(&parent.column)?;
                let nullable = self.target.column(&change.column).is_some_and(|c| c.nullable);
                if change.on_delete == Some(OnDelete::SetNull) && !nullable {
                    return fail("on_delete set_null requires a nullable column");
                }
            }
            ConstraintKind::AddCheck => {
                if change.check.is_none() {
                    return fail("add_check requires a check predicate");
                }
                if let Some(CheckPredicate::Range { min: Some(lo), max: Some(hi) }) = &change.check {
                    if lo > hi {
                        return fail("range min exceeds max");
                    }
                }
            }
            ConstraintKind::DropFk | ConstraintKind::DropCheck => {}
        }
        Ok(())
    }

    /// Checks against the live source table.
    pub fn validate_against_source(&self, source: &IntrospectedTable) -> Result<(), PlanError> {
        let key_is_pk = source
            .column(&self.source.primary_key)
            .is_some_and(|c| c.primary_key);
        if !key_is_pk {
            return Err(PlanError::SourceKeyMismatch(self.source.primary_key.clone()));
        }
        for mapping in &self.mappings {
            if let Some(column) = &mapping.source_column {
                if !source.has_column(column) {
                    return Err(PlanError::UnknownSourceColumn(column.clone()));
                }
            } else if matches!(mapping.derivation, DerivationRule::Copy { .. })
                && !source.has_column(&mapping.target_column)
            {
                return Err(PlanError::UnknownSourceColumn(mapping.target_column.clone()));
            }
            for column in mapping.derivation.referenced_columns() {
                if !source.has_column(column) {
                    return Err(PlanError::UnknownSourceColumn(column.to_string()));
                }
            }
            if mapping.derivation.is_randomized() && source.has_column(&mapping.target_column) {
                return Err(PlanError::RandomizedShadowsSource(mapping.target_column.clone()));
            }
        }
        Ok(())
    }
}

fn check_probabilities(rule: &DerivationRule) -> Result<(), PlanError> {
    if let DerivationRule::RandomizedConditional {
        rule_id,
        probability,
        otherwise,
        ..
    } = rule
    {
        if !(0.0..=1.0).contains(probability) {
            return Err(PlanError::Probability {
                rule: rule_id.clone(),
                probability: probability.to_string(),
            });
        }
        check_probabilities(otherwise)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::{Condition, Outcome, PredicateTable};
    use crate::schema::{ColumnDef, ColumnType, IntrospectedColumn};

    fn plan() -> MigrationPlan {
        MigrationPlan {
            source: SourceTable {
                table: "listings".into(),
                primary_key: "id".into(),
            },
            target: TableSchema {
                name: "listings_v2".into(),
                primary_key: "id".into(),
                columns: vec![
                    ColumnDef::new("id", ColumnType::Integer).not_null(),
                    ColumnDef::new("host_id", ColumnType::Text).not_null(),
                    ColumnDef::new("has_yard", ColumnType::Boolean).not_null(),
                    ColumnDef::new("country", ColumnType::Text)
                        .not_null()
                        .with_default("United States"),
                ],
            },
            logical_name: None,
            mappings: vec![
                ColumnMapping::copy("id", "id"),
                ColumnMapping::copy("host_id", "host_id"),
                ColumnMapping::derived(
                    "has_yard",
                    DerivationRule::RandomizedConditional {
                        rule_id: "townhouse_yard".into(),
                        when: Condition::eq("property_type", "Townhouse"),
                        probability: 0.7,
                        value: Value::Bool(true),
                        otherwise: Box::new(DerivationRule::computed(PredicateTable::new(
                            Vec::new(),
                            Outcome::literal(false),
                        ))),
                    },
                ),
            ],
            constraints: vec![ConstraintChange::add_fk(
                "listings_v2",
                "host_id",
                "profiles",
                "id",
                OnDelete::Cascade,
            )],
            batch_size: 100,
        }
    }

    fn source_table(columns: &[&str]) -> IntrospectedTable {
        IntrospectedTable {
            name: "listings".into(),
            columns: columns
                .iter()
                .map(|name| IntrospectedColumn {
                    name: name.to_string(),
                    declared_type: "TEXT".into(),
                    not_null: false,
                    has_default: false,
                    primary_key: *name == "id",
                })
                .collect(),
        }
    }

    #[test]
    fn valid_plan_passes_both_stages() {
        let plan = plan();
        plan.validate().unwrap();
        plan.validate_against_source(&source_table(&["id", "host_id", "property_type"]))
            .unwrap();
        assert_eq!(plan.logical_name(), "listings");
    }

    #[test]
    fn required_column_without_mapping_is_rejected() {
        let mut plan = plan();
        plan.mappings.retain(|m| m.target_column != "host_id");
        assert_eq!(
            plan.validate(),
            Err(PlanError::UnmappedRequiredColumn("host_id".into()))
        );
    }

    #[test]
    fn defaulted_column_may_stay_unmapped() {
        let plan = plan();
        assert!(plan.mapping_for("country").is_none());
        plan.validate().unwrap();
    }

    #[test]
    fn duplicate_mapping_is_rejected() {
        let mut plan = plan();
        plan.mappings.push(ColumnMapping::copy("host_id", "host_id"));
        assert_eq!(plan.validate(), Err(PlanError::DuplicateMapping("host_id".into())));
    }

    #[test]
    fn primary_key_must_be_copied() {
        let mut plan = plan();
        plan.mappings[0] = ColumnMapping::derived("id", DerivationRule::constant(1));
        assert!(matches!(plan.validate(), Err(PlanError::PrimaryKeyNotCopied { .. })));
    }

    #[test]
    fn randomized_column_must_not_exist_in_source() {
        let plan = plan();
        let err = plan
            .validate_against_source(&source_table(&["id", "host_id", "property_type", "has_yard"]))
            .unwrap_err();
        assert_eq!(err, PlanError::RandomizedShadowsSource("has_yard".into()));
    }

    #[test]
    fn unknown_source_column_is_rejected() {
        let plan = plan();
        let err = plan
            .validate_against_source(&source_table(&["id", "host_id"]))
            .unwrap_err();
        assert_eq!(err, PlanError::UnknownSourceColumn("property_type".into()));
    }

    #[test]
    fn bad_identifiers_and_batch_size() {
        let mut plan = plan();
        plan.batch_size = 0;
        assert_eq!(plan.validate(), Err(PlanError::BatchSize));
        let mut plan = self::plan();
        plan.target.name = "listings_v2; DROP TABLE x".into();
        assert!(matches!(plan.validate(), Err(PlanError::Schema(_))));
    }

    #[test]
    fn plan_json_round_trip_and_error_code() {
        let raw = serde_json::to_string(&plan()).unwrap();
        let parsed = MigrationPlan::from_json_str(&raw).unwrap();
        assert_eq!(parsed, plan());
        let err = MigrationPlan::from_json_str("{\"batch_size\": 1}").unwrap_err();
        assert_eq!(err.code(), codes::PLAN_INVALID);
    }
}
