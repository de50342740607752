//! Schema reconciler for tenant replica tables.
//!
//! Every replica table is the upstream column list plus two local columns:
//! a surrogate `row_id` key and an `updated_at` audit timestamp.

use sea_query::{ColumnDef, Expr, PostgresQueryBuilder, Table};
use std::collections::HashSet;

use crate::executor::DbError;
use crate::sync::error::SyncError;
use crate::sync::replica::ReplicaSession;
use crate::sync::types::{map_column, ColumnMapping, UpstreamColumn};

pub const ROW_ID: &str = "row_id";
pub const UPDATED_AT: &str = "updated_at";

/// Local columns that never come from upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditColumn {
    RowId,
    UpdatedAt,
}

impl AuditColumn {
    pub const ALL: [AuditColumn; 2] = [AuditColumn::RowId, AuditColumn::UpdatedAt];

    pub fn name(self) -> &'static str {
        match self {
            AuditColumn::RowId => ROW_ID,
            AuditColumn::UpdatedAt => UPDATED_AT,
        }
    }

    fn column_def(self) -> ColumnDef {
        let mut def = ColumnDef::new(self.name());
        match self {
            AuditColumn::RowId => {
                def.integer().not_null().auto_increment().primary_key();
            }
            AuditColumn::UpdatedAt => {
                def.timestamp().default(Expr::current_timestamp());
            }
        }
        def
    }
}

/// Local shape of one replicated table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnMapping>,
}

impl TableSpec {
    pub fn from_upstream(name: &str, columns: &[UpstreamColumn]) -> Self {
        Self {
            name: name.to_string(),
            columns: columns.iter().map(map_column).collect(),
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn fallback_count(&self) -> usize {
        self.columns.iter().filter(|c| c.fallback).count()
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == column)
    }

    /// `CREATE TABLE` with `row_id`, the mapped columns, then `updated_at`.
    pub fn create_statement(&self) -> String {
        let mut table = Table::create();
        table.table(self.name.clone()).if_not_exists();
        table.col(&mut AuditColumn::RowId.column_def());
        for column in &self.columns {
            table.col(&mut column.column_def());
        }
        table.col(&mut AuditColumn::UpdatedAt.column_def());
        table.build(PostgresQueryBuilder)
    }

    pub fn drop_statement(&self) -> String {
        Table::drop()
            .table(self.name.clone())
            .if_exists()
            .build(PostgresQueryBuilder)
    }
}

/// `ALTER TABLE .. ADD COLUMN` for a missing audit column.
pub fn add_audit_column_statement(table: &str, column: AuditColumn) -> String {
    Table::alter()
        .table(table.to_string())
        .add_column(&mut column.column_def())
        .build(PostgresQueryBuilder)
}

/// Columns missing locally and columns present only locally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnDiff {
    pub missing: Vec<String>,
    pub extra: Vec<String>,
}

impl ColumnDiff {
    pub fn compute(spec: &TableSpec, local_columns: &[String]) -> Self {
        let local: HashSet<&str> = local_columns.iter().map(String::as_str).collect();
        let upstream: HashSet<&str> = spec.column_names().collect();

        let missing = spec
            .column_names()
            .filter(|c| !local.contains(c))
            .map(str::to_string)
            .collect();
        let extra = local_columns
            .iter()
            .filter(|c| !upstream.contains(c.as_str()))
            .filter(|c| c.as_str() != ROW_ID && c.as_str() != UPDATED_AT)
            .cloned()
            .collect();
        Self { missing, extra }
    }

    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// Create the table if it does not exist. Returns whether it was created.
///
/// # Errors
///
/// Returns `DbError` if introspection or DDL fails.
pub fn create_if_absent(session: &mut dyn ReplicaSession, spec: &TableSpec) -> Result<bool, DbError> {
    if session.table_exists(&spec.name)? {
        return Ok(false);
    }
    session.create_table(spec)?;
    log::info!("created replica table {} ({} columns)", spec.name, spec.columns.len());
    Ok(true)
}

/// Drop and create the table from scratch. Full-rebuild runs only.
///
/// # Errors
///
/// Returns `DbError` if either statement fails.
pub fn drop_and_recreate(session: &mut dyn ReplicaSession, spec: &TableSpec) -> Result<(), DbError> {
    session.drop_table(&spec.name)?;
    session.create_table(spec)?;
    log::info!("recreated replica table {}", spec.name);
    Ok(())
}

/// Add `row_id` / `updated_at` to replicas created before they existed.
///
/// # Errors
///
/// Returns `DbError` if introspection or DDL fails.
pub fn ensure_audit_columns(
    session: &mut dyn ReplicaSession,
    table: &str,
) -> Result<Vec<AuditColumn>, DbError> {
    let existing = session.column_names(table)?;
    let mut added = Vec::new();
    for column in AuditColumn::ALL {
        if !existing.iter().any(|c| c == column.name()) {
            session.add_audit_column(table, column)?;
            log::info!("added audit column {} to {table}", column.name());
            added.push(column);
        }
    }
    Ok(added)
}

/// Check the local column set against upstream.
///
/// # Errors
///
/// Returns `SyncError::SchemaDrift` listing missing and extra columns, or
/// `SyncError::Local` if introspection fails.
pub fn validate(session: &mut dyn ReplicaSession, spec: &TableSpec) -> Result<(), SyncError> {
    let local = session.column_names(&spec.name).map_err(|source| SyncError::Local {
        table: spec.name.clone(),
        source,
    })?;
    let diff = ColumnDiff::compute(spec, &local);
    if diff.is_empty() {
        Ok(())
    } else {
        Err(SyncError::SchemaDrift {
            table: spec.name.clone(),
            missing: diff.missing,
            extra: diff.extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TableSpec {
        TableSpec::from_upstream(
            "comCustomer",
            &[
                UpstreamColumn::new("Flag", "char").with_length(1),
                UpstreamColumn::new("ID", "nvarchar").with_length(10),
                UpstreamColumn::new("Memo", "ntext"),
            ],
        )
    }

    #[test]
    fn test_create_statement_wraps_upstream_columns() {
        let sql = spec().create_statement();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"comCustomer\""), "{sql}");
        let row_id = sql.find("\"row_id\"").unwrap();
        let flag = sql.find("\"Flag\"").unwrap();
        let updated_at = sql.find("\"updated_at\"").unwrap();
        assert!(row_id < flag && flag < updated_at, "{sql}");
        assert!(sql.contains("PRIMARY KEY"), "{sql}");
        assert!(sql.contains("CURRENT_TIMESTAMP"), "{sql}");
    }

    #[test]
    fn test_drop_statement() {
        assert_eq!(spec().drop_statement(), "DROP TABLE IF EXISTS \"comCustomer\"");
    }

    #[test]
    fn test_add_audit_column_statement() {
        let sql = add_audit_column_statement("ordBillMain", AuditColumn::UpdatedAt);
        assert!(sql.starts_with("ALTER TABLE \"ordBillMain\" ADD COLUMN"), "{sql}");
        assert!(sql.contains("\"updated_at\""), "{sql}");
    }

    #[test]
    fn test_diff_ignores_audit_columns() {
        let local = vec![
            "row_id".to_string(),
            "Flag".to_string(),
            "ID".to_string(),
            "Memo".to_string(),
            "updated_at".to_string(),
        ];
        assert!(ColumnDiff::compute(&spec(), &local).is_empty());
    }

    #[test]
    fn test_diff_reports_missing_and_extra() {
        let local = vec!["row_id".to_string(), "Flag".to_string(), "Fax".to_string()];
        let diff = ColumnDiff::compute(&spec(), &local);
        assert_eq!(diff.missing, vec!["ID".to_string(), "Memo".to_string()]);
        assert_eq!(diff.extra, vec!["Fax".to_string()]);
    }
}
