//! Upstream ERP database access.
//!
//! The sync executor only needs a few reads from upstream: the change
//! tracking versions, the column list of a table, all rows of a table, and
//! the rows whose key changed after a version. [`UpstreamSession`] is that
//! surface; the tiberius implementation lives in `sync::mssql`.

use std::fmt;

use crate::sync::codec::UpstreamRow;
use crate::sync::types::UpstreamColumn;
use crate::tenant::UpstreamCredential;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    /// Connect, TLS or login failure, including handshake timeouts.
    Connect(String),
    /// Query failed on an established connection.
    Query(String),
    /// Value of a type the bridge cannot read.
    Unsupported(String),
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpstreamError::Connect(s) => write!(f, "connect failed: {s}"),
            UpstreamError::Query(s) => write!(f, "query failed: {s}"),
            UpstreamError::Unsupported(s) => write!(f, "unsupported value: {s}"),
        }
    }
}

impl std::error::Error for UpstreamError {}

/// Read-only session against one upstream database.
pub trait UpstreamSession {
    /// `CHANGE_TRACKING_CURRENT_VERSION()`; `None` when change tracking is off.
    fn current_version(&mut self) -> Result<Option<i64>, UpstreamError>;

    /// `CHANGE_TRACKING_MIN_VALID_VERSION` of `table`: changes at or below
    /// it have been purged. `None` when the table is not tracked.
    fn min_valid_version(&mut self, table: &str) -> Result<Option<i64>, UpstreamError>;

    /// Columns from the information schema, in ordinal order. Empty when the
    /// table does not exist.
    fn columns(&mut self, table: &str) -> Result<Vec<UpstreamColumn>, UpstreamError>;

    /// Every current row, values ordered like `columns`.
    fn select_all(&mut self, table: &str, columns: &[UpstreamColumn]) -> Result<Vec<UpstreamRow>, UpstreamError>;

    /// Current rows whose key changed after `from_version`, joined back on
    /// `key`. An empty key yields every current row.
    fn select_changed(
        &mut self,
        table: &str,
        columns: &[UpstreamColumn],
        key: &[String],
        from_version: i64,
    ) -> Result<Vec<UpstreamRow>, UpstreamError>;
}

/// Opens upstream sessions.
pub trait UpstreamConnector: Send + Sync {
    fn connect(
        &self,
        credential: &UpstreamCredential,
        database: &str,
    ) -> Result<Box<dyn UpstreamSession>, UpstreamError>;
}

/// Bracket-quote a T-SQL identifier.
pub fn bracket(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

pub const CURRENT_VERSION_SQL: &str = "SELECT CHANGE_TRACKING_CURRENT_VERSION()";

pub const MIN_VALID_VERSION_SQL: &str = "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(OBJECT_ID(@P1))";

pub const COLUMNS_SQL: &str = "SELECT COLUMN_NAME, DATA_TYPE, CHARACTER_MAXIMUM_LENGTH, \
     NUMERIC_PRECISION, NUMERIC_SCALE \
     FROM INFORMATION_SCHEMA.COLUMNS WHERE TABLE_NAME = @P1 ORDER BY ORDINAL_POSITION";

fn select_list(columns: &[UpstreamColumn]) -> String {
    columns
        .iter()
        .map(|c| format!("t.{}", bracket(&c.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn select_all_sql(table: &str, columns: &[UpstreamColumn]) -> String {
    format!("SELECT {} FROM {} AS t", select_list(columns), bracket(table))
}

/// Change enumeration joined back to the current row.
///
/// Key values come from the current row `t`, so a key updated upstream is
/// replicated under its new value. The version is bound as `@P1`.
pub fn changes_sql(table: &str, columns: &[UpstreamColumn], key: &[String]) -> String {
    let join = if key.is_empty() {
        "1 = 1".to_string()
    } else {
        key.iter()
            .map(|k| format!("t.{col} = ct.{col}", col = bracket(k)))
            .collect::<Vec<_>>()
            .join(" AND ")
    };
    format!(
        "SELECT {} FROM CHANGETABLE(CHANGES {}, @P1) AS ct JOIN {} AS t ON {join}",
        select_list(columns),
        bracket(table),
        bracket(table)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols() -> Vec<UpstreamColumn> {
        vec![
            UpstreamColumn::new("Flag", "char").with_length(1),
            UpstreamColumn::new("ID", "nvarchar").with_length(10),
            UpstreamColumn::new("Name", "nvarchar").with_length(50),
        ]
    }

    #[test]
    fn test_bracket_escapes() {
        assert_eq!(bracket("comCustomer"), "[comCustomer]");
        assert_eq!(bracket("odd]name"), "[odd]]name]");
    }

    #[test]
    fn test_select_all_sql() {
        assert_eq!(
            select_all_sql("comCustomer", &cols()),
            "SELECT t.[Flag], t.[ID], t.[Name] FROM [comCustomer] AS t"
        );
    }

    #[test]
    fn test_changes_sql_joins_on_key() {
        let sql = changes_sql("comCustomer", &cols(), &["Flag".into(), "ID".into()]);
        assert_eq!(
            sql,
            "SELECT t.[Flag], t.[ID], t.[Name] FROM CHANGETABLE(CHANGES [comCustomer], @P1) AS ct \
             JOIN [comCustomer] AS t ON t.[Flag] = ct.[Flag] AND t.[ID] = ct.[ID]"
        );
    }

    #[test]
    fn test_changes_sql_without_key_cross_joins() {
        let sql = changes_sql("comCustomer", &cols(), &[]);
        assert!(sql.ends_with("ON 1 = 1"));
    }
}
