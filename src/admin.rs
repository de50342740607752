//! Tenant database administration.
//!
//! Replica databases are created and dropped over an admin connection to the
//! maintenance database. Names are validated as plain identifiers before
//! they reach any statement.

use std::fmt;

use crate::config::LocalConfig;
use crate::connection::{connect, validate_database_name, ConnectionError};
use crate::executor::{DbError, Executor, PgExecutor};
use crate::raw_sql::{query_value, quote_ident};
use crate::tenant::{OperationLogEntry, Tenant, TenantStore};

#[derive(Debug)]
pub enum AdminError {
    InvalidName(ConnectionError),
    Database(DbError),
    UnknownTenant(String),
}

impl fmt::Display for AdminError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdminError::InvalidName(e) => write!(f, "{e}"),
            AdminError::Database(e) => write!(f, "Database administration failed: {e}"),
            AdminError::UnknownTenant(code) => write!(f, "Unknown tenant '{code}'"),
        }
    }
}

impl std::error::Error for AdminError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdminError::InvalidName(e) => Some(e),
            AdminError::Database(e) => Some(e),
            AdminError::UnknownTenant(_) => None,
        }
    }
}

impl From<DbError> for AdminError {
    fn from(e: DbError) -> Self {
        AdminError::Database(e)
    }
}

impl From<ConnectionError> for AdminError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::InvalidDatabaseName(_) => AdminError::InvalidName(e),
            other => AdminError::Database(DbError::Connection(other)),
        }
    }
}

pub(crate) fn create_database_sql(name: &str) -> Result<String, ConnectionError> {
    validate_database_name(name)?;
    Ok(format!("CREATE DATABASE {} ENCODING 'UTF8'", quote_ident(name)))
}

pub(crate) fn drop_database_sql(name: &str) -> Result<String, ConnectionError> {
    validate_database_name(name)?;
    Ok(format!("DROP DATABASE IF EXISTS {}", quote_ident(name)))
}

/// Creates and drops tenant replica databases.
pub struct DatabaseAdmin {
    local: LocalConfig,
}

impl DatabaseAdmin {
    pub fn new(local: LocalConfig) -> Self {
        Self { local }
    }

    fn maintenance(&self) -> Result<PgExecutor, AdminError> {
        let conn = self.local.connection_string(&self.local.maintenance_database)?;
        Ok(PgExecutor::new(connect(&conn)?))
    }

    /// # Errors
    ///
    /// Returns `AdminError::Database` if the catalog query fails.
    pub fn database_exists(&self, name: &str) -> Result<bool, AdminError> {
        validate_database_name(name)?;
        let executor = self.maintenance()?;
        Ok(query_value(
            &executor,
            "SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)",
            &[&name],
        )?)
    }

    /// # Errors
    ///
    /// Returns `AdminError::InvalidName` before any statement runs when the
    /// name is not a plain identifier.
    pub fn create_database(&self, name: &str) -> Result<(), AdminError> {
        let sql = create_database_sql(name)?;
        self.maintenance()?.execute(&sql, &[])?;
        log::info!("created database {name}");
        Ok(())
    }

    /// Drop a database, disconnecting any sessions still attached to it.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::InvalidName` or `AdminError::Database`.
    pub fn drop_database(&self, name: &str) -> Result<(), AdminError> {
        let sql = drop_database_sql(name)?;
        let executor = self.maintenance()?;
        executor.query_all(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
            &[&name],
        )?;
        executor.execute(&sql, &[])?;
        log::info!("dropped database {name}");
        Ok(())
    }

    /// Register a tenant and create its replica database if absent.
    /// Returns whether the database was created.
    ///
    /// # Errors
    ///
    /// Returns `AdminError` if the name is invalid or either side fails.
    pub fn provision_tenant(&self, store: &dyn TenantStore, tenant: &Tenant, actor: &str) -> Result<bool, AdminError> {
        validate_database_name(&tenant.local_database)?;
        let created = if self.database_exists(&tenant.local_database)? {
            false
        } else {
            self.create_database(&tenant.local_database)?;
            true
        };
        store.save_tenant(tenant)?;
        store.append_operation_log(&OperationLogEntry::new(
            actor,
            format!(
                "provisioned tenant {} ({}) with database {}",
                tenant.company_code, tenant.company_name, tenant.local_database
            ),
            chrono::Local::now().naive_local(),
        ))?;
        Ok(created)
    }

    /// Drop a tenant's replica database and remove it from the registry.
    ///
    /// # Errors
    ///
    /// Returns `AdminError::UnknownTenant` if the code is not registered.
    pub fn decommission_tenant(&self, store: &dyn TenantStore, company_code: &str, actor: &str) -> Result<(), AdminError> {
        let tenant = store
            .tenant(company_code)?
            .ok_or_else(|| AdminError::UnknownTenant(company_code.to_string()))?;
        self.drop_database(&tenant.local_database)?;
        store.remove_tenant(company_code)?;
        store.append_operation_log(&OperationLogEntry::new(
            actor,
            format!("decommissioned tenant {company_code}, dropped database {}", tenant.local_database),
            chrono::Local::now().naive_local(),
        ))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_database_sql_quotes_name() {
        assert_eq!(
            create_database_sql("erp_10").unwrap(),
            "CREATE DATABASE \"erp_10\" ENCODING 'UTF8'"
        );
    }

    #[test]
    fn test_invalid_names_never_reach_sql() {
        assert!(create_database_sql("erp-10").is_err());
        assert!(drop_database_sql("x; DROP DATABASE mes").is_err());
        let err: AdminError = create_database_sql("").unwrap_err().into();
        assert!(matches!(err, AdminError::InvalidName(_)));
    }

    #[test]
    fn test_drop_database_sql() {
        assert_eq!(drop_database_sql("erp_20").unwrap(), "DROP DATABASE IF EXISTS \"erp_20\"");
    }
}
