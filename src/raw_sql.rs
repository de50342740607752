//! Helpers for hand-written SQL.
//!
//! Replica tables carry upstream names verbatim (mixed case, sometimes
//! reserved words), so every identifier goes through [`quote_ident`].

use crate::executor::{DbError, Executor};
use may_postgres::types::{FromSqlOwned, ToSql};

/// Double-quote a PostgreSQL identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comma-separated quoted identifiers.
pub fn quote_idents<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `$start, $start+1, ...` for `count` parameters.
pub fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Run a query returning one row and read its first column.
///
/// # Errors
///
/// Returns `DbError` if the query fails or the value cannot be read as `T`.
///
/// # Examples
///
/// ```no_run
/// use shopfloor::connection::connect;
/// use shopfloor::raw_sql::query_value;
/// use shopfloor::{DbError, PgExecutor};
///
/// # fn main() -> Result<(), DbError> {
/// let executor = PgExecutor::new(connect("host=localhost user=postgres dbname=erp_10")?);
/// let rows: i64 = query_value(&executor, "SELECT COUNT(*) FROM \"comCustomer\"", &[])?;
/// # Ok(())
/// # }
/// ```
pub fn query_value<T: FromSqlOwned>(
    executor: &dyn Executor,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<T, DbError> {
    let row = executor.query_one(sql, params)?;
    row.try_get::<usize, T>(0)
        .map_err(|e| DbError::Parse(format!("Failed to extract value: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("comCustomer"), "\"comCustomer\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident("Order"), "\"Order\"");
    }

    #[test]
    fn test_quote_idents_and_placeholders() {
        assert_eq!(quote_idents(&["Flag", "ID"]), "\"Flag\", \"ID\"");
        assert_eq!(placeholders(1, 3), "$1, $2, $3");
        assert_eq!(placeholders(4, 2), "$4, $5");
        assert_eq!(placeholders(1, 0), "");
    }
}
