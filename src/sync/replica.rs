//! Tenant replica store.
//!
//! A [`ReplicaSession`] is the local side of one sync run: one connection to
//! the tenant's replica database, a transaction per table and a savepoint
//! per row.

use crate::config::LocalConfig;
use crate::connection::connect;
use crate::executor::{DbError, Executor, PgExecutor};
use crate::raw_sql::{placeholders, query_value, quote_ident, quote_idents};
use crate::sync::codec::LocalValue;
use crate::sync::schema::{add_audit_column_statement, AuditColumn, TableSpec, ROW_ID};
use crate::tenant::Tenant;
use crate::transaction::Transaction;
use may_postgres::types::ToSql;

/// Local replica operations used by the sync executor.
pub trait ReplicaSession {
    fn table_exists(&mut self, table: &str) -> Result<bool, DbError>;

    /// Column names in ordinal order.
    fn column_names(&mut self, table: &str) -> Result<Vec<String>, DbError>;

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), DbError>;

    fn drop_table(&mut self, table: &str) -> Result<(), DbError>;

    fn add_audit_column(&mut self, table: &str, column: AuditColumn) -> Result<(), DbError>;

    fn begin(&mut self) -> Result<(), DbError>;

    fn commit(&mut self) -> Result<(), DbError>;

    fn rollback(&mut self) -> Result<(), DbError>;

    fn savepoint(&mut self) -> Result<(), DbError>;

    fn release_savepoint(&mut self) -> Result<(), DbError>;

    fn rollback_to_savepoint(&mut self) -> Result<(), DbError>;

    /// `row_id` of the row whose key columns equal `key` (NULL matches NULL).
    fn find_row_id(&mut self, table: &str, key: &[(&str, &LocalValue)]) -> Result<Option<i32>, DbError>;

    /// Insert and return the new `row_id`.
    fn insert_row(&mut self, table: &str, columns: &[String], values: &[LocalValue]) -> Result<i32, DbError>;

    fn update_row(
        &mut self,
        table: &str,
        row_id: i32,
        columns: &[String],
        values: &[LocalValue],
    ) -> Result<u64, DbError>;

    fn count_rows(&mut self, table: &str) -> Result<i64, DbError>;
}

/// Opens replica sessions for tenants.
pub trait ReplicaConnector: Send + Sync {
    fn open(&self, tenant: &Tenant) -> Result<Box<dyn ReplicaSession>, DbError>;
}

/// Replica databases on the local PostgreSQL server.
pub struct PgReplicaConnector {
    local: LocalConfig,
}

impl PgReplicaConnector {
    pub fn new(local: LocalConfig) -> Self {
        Self { local }
    }
}

impl ReplicaConnector for PgReplicaConnector {
    fn open(&self, tenant: &Tenant) -> Result<Box<dyn ReplicaSession>, DbError> {
        let conn = self.local.connection_string(&tenant.local_database)?;
        let client = connect(&conn)?;
        Ok(Box::new(PgReplica::new(PgExecutor::new(client))))
    }
}

/// `ReplicaSession` over one `may_postgres` connection.
pub struct PgReplica {
    executor: PgExecutor,
    table_tx: Option<Transaction>,
    row_tx: Option<Transaction>,
}

impl PgReplica {
    pub fn new(executor: PgExecutor) -> Self {
        Self {
            executor,
            table_tx: None,
            row_tx: None,
        }
    }

    /// Innermost open scope: row savepoint, table transaction, or the bare connection.
    fn current(&self) -> &dyn Executor {
        if let Some(tx) = &self.row_tx {
            tx
        } else if let Some(tx) = &self.table_tx {
            tx
        } else {
            &self.executor
        }
    }
}

fn as_params(values: &[LocalValue]) -> Vec<&dyn ToSql> {
    values.iter().map(|v| v as &dyn ToSql).collect()
}

pub(crate) fn insert_sql(table: &str, columns: &[String]) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
        quote_ident(table),
        quote_idents(columns),
        placeholders(1, columns.len()),
        quote_ident(ROW_ID)
    )
}

pub(crate) fn update_sql(table: &str, columns: &[String]) -> String {
    let sets = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {sets} WHERE {} = ${}",
        quote_ident(table),
        quote_ident(ROW_ID),
        columns.len() + 1
    )
}

pub(crate) fn find_sql(table: &str, key_columns: &[&str]) -> String {
    let predicate = key_columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} IS NOT DISTINCT FROM ${}", quote_ident(c), i + 1))
        .collect::<Vec<_>>()
        .join(" AND ");
    format!(
        "SELECT {} FROM {} WHERE {predicate} ORDER BY {} LIMIT 1",
        quote_ident(ROW_ID),
        quote_ident(table),
        quote_ident(ROW_ID)
    )
}

impl ReplicaSession for PgReplica {
    fn table_exists(&mut self, table: &str) -> Result<bool, DbError> {
        query_value(
            self.current(),
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
            &[&table],
        )
    }

    fn column_names(&mut self, table: &str) -> Result<Vec<String>, DbError> {
        let rows = self.current().query_all(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 ORDER BY ordinal_position",
            &[&table],
        )?;
        rows.iter()
            .map(|r| {
                r.try_get::<usize, String>(0)
                    .map_err(|e| DbError::Parse(format!("column name: {e}")))
            })
            .collect()
    }

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), DbError> {
        self.current().execute(&spec.create_statement(), &[])?;
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> Result<(), DbError> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(table));
        self.current().execute(&sql, &[])?;
        Ok(())
    }

    fn add_audit_column(&mut self, table: &str, column: AuditColumn) -> Result<(), DbError> {
        self.current().execute(&add_audit_column_statement(table, column), &[])?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), DbError> {
        if self.table_tx.is_some() {
            return Err(DbError::Other("table transaction already open".to_string()));
        }
        self.table_tx = Some(self.executor.begin()?);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.row_tx = None;
        match self.table_tx.take() {
            Some(tx) => Ok(tx.commit()?),
            None => Err(DbError::Other("no open table transaction".to_string())),
        }
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        // Dropping the savepoint first keeps the rollback order inner to outer.
        self.row_tx = None;
        match self.table_tx.take() {
            Some(tx) => Ok(tx.rollback()?),
            None => Ok(()),
        }
    }

    fn savepoint(&mut self) -> Result<(), DbError> {
        let tx = self
            .table_tx
            .as_mut()
            .ok_or_else(|| DbError::Other("savepoint outside a table transaction".to_string()))?;
        self.row_tx = Some(tx.begin_nested()?);
        Ok(())
    }

    fn release_savepoint(&mut self) -> Result<(), DbError> {
        match self.row_tx.take() {
            Some(sp) => Ok(sp.commit()?),
            None => Err(DbError::Other("no open savepoint".to_string())),
        }
    }

    fn rollback_to_savepoint(&mut self) -> Result<(), DbError> {
        match self.row_tx.take() {
            Some(sp) => Ok(sp.rollback()?),
            None => Err(DbError::Other("no open savepoint".to_string())),
        }
    }

    fn find_row_id(&mut self, table: &str, key: &[(&str, &LocalValue)]) -> Result<Option<i32>, DbError> {
        let columns: Vec<&str> = key.iter().map(|(c, _)| *c).collect();
        let params: Vec<&dyn ToSql> = key.iter().map(|(_, v)| *v as &dyn ToSql).collect();
        let row = self.current().query_opt(&find_sql(table, &columns), &params)?;
        row.map(|r| {
            r.try_get::<usize, i32>(0)
                .map_err(|e| DbError::Parse(format!("row_id: {e}")))
        })
        .transpose()
    }

    fn insert_row(&mut self, table: &str, columns: &[String], values: &[LocalValue]) -> Result<i32, DbError> {
        let row = self
            .current()
            .query_one(&insert_sql(table, columns), &as_params(values))?;
        row.try_get::<usize, i32>(0)
            .map_err(|e| DbError::Parse(format!("row_id: {e}")))
    }

    fn update_row(
        &mut self,
        table: &str,
        row_id: i32,
        columns: &[String],
        values: &[LocalValue],
    ) -> Result<u64, DbError> {
        let mut params = as_params(values);
        params.push(&row_id);
        self.current().execute(&update_sql(table, columns), &params)
    }

    fn count_rows(&mut self, table: &str) -> Result<i64, DbError> {
        query_value(
            self.current(),
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            &[],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_sql_returns_row_id() {
        let sql = insert_sql("comCustomer", &["Flag".into(), "ID".into(), "updated_at".into()]);
        assert_eq!(
            sql,
            "INSERT INTO \"comCustomer\" (\"Flag\", \"ID\", \"updated_at\") VALUES ($1, $2, $3) RETURNING \"row_id\""
        );
    }

    #[test]
    fn test_update_sql_binds_row_id_last() {
        let sql = update_sql("comCustomer", &["Name".into(), "updated_at".into()]);
        assert_eq!(
            sql,
            "UPDATE \"comCustomer\" SET \"Name\" = $1, \"updated_at\" = $2 WHERE \"row_id\" = $3"
        );
    }

    #[test]
    fn test_find_sql_is_null_safe() {
        let sql = find_sql("TraBillSub", &["Flag", "BillNo", "RowNo"]);
        assert!(sql.contains("\"Flag\" IS NOT DISTINCT FROM $1"));
        assert!(sql.contains("\"RowNo\" IS NOT DISTINCT FROM $3"));
        assert!(sql.ends_with("LIMIT 1"));
    }
}
