//! Tenant registry.
//!
//! A tenant is one company: its upstream ERP database, its local replica
//! database, the tables it replicates and its sync watermark. The registry
//! also holds the single upstream credential and the append-only operation
//! log.

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::executor::{DbError, Executor, PgExecutor};

/// Operation log messages are cut to this many characters.
pub const MAX_ACTION_CHARS: usize = 900;

/// One company and its replication settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Tenant {
    pub company_code: String,
    pub company_name: String,
    pub upstream_database: String,
    pub local_database: String,
    /// Tables to replicate, in run order.
    pub sync_tables: Vec<String>,
    pub last_sync_version: Option<i64>,
    pub last_sync_time: Option<NaiveDateTime>,
    /// Zero disables scheduled runs.
    pub sync_interval_minutes: u32,
}

impl Tenant {
    /// Split a comma-separated table list, dropping blanks.
    pub fn parse_table_list(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Whether a scheduled incremental run is due at `now`.
    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        if self.sync_interval_minutes == 0 {
            return false;
        }
        match self.last_sync_time {
            None => true,
            Some(last) => now - last >= ChronoDuration::minutes(i64::from(self.sync_interval_minutes)),
        }
    }
}

/// Host and login for every upstream ERP database.
#[derive(Clone, PartialEq)]
pub struct UpstreamCredential {
    pub host: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredential")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationLogEntry {
    pub actor: String,
    pub action: String,
    pub at: NaiveDateTime,
}

impl OperationLogEntry {
    pub fn new(actor: &str, action: impl Into<String>, at: NaiveDateTime) -> Self {
        let action: String = action.into();
        let action = if action.chars().count() > MAX_ACTION_CHARS {
            action.chars().take(MAX_ACTION_CHARS).collect()
        } else {
            action
        };
        Self {
            actor: actor.to_string(),
            action,
            at,
        }
    }
}

/// Two-way index between company codes and company names.
///
/// Reports carry the company name, work orders and dispatches the code.
#[derive(Debug, Clone, Default)]
pub struct TenantDirectory {
    name_by_code: HashMap<String, String>,
    code_by_name: HashMap<String, String>,
}

impl TenantDirectory {
    pub fn from_pairs<I, C, N>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (C, N)>,
        C: Into<String>,
        N: Into<String>,
    {
        let mut directory = Self::default();
        for (code, name) in pairs {
            let (code, name) = (code.into(), name.into());
            directory.code_by_name.insert(name.clone(), code.clone());
            directory.name_by_code.insert(code, name);
        }
        directory
    }

    pub fn from_tenants(tenants: &[Tenant]) -> Self {
        Self::from_pairs(
            tenants
                .iter()
                .map(|t| (t.company_code.clone(), t.company_name.clone())),
        )
    }

    pub fn name_for(&self, company_code: &str) -> Option<&str> {
        self.name_by_code.get(company_code).map(String::as_str)
    }

    pub fn code_for(&self, company_name: &str) -> Option<&str> {
        self.code_by_name.get(company_name.trim()).map(String::as_str)
    }

    /// Company code a report belongs to: its own code if set, else its name
    /// looked up here.
    pub fn resolve(&self, company_code: Option<&str>, company_name: &str) -> Option<String> {
        match company_code.map(str::trim).filter(|c| !c.is_empty()) {
            Some(code) => Some(code.to_string()),
            None => self.code_for(company_name).map(str::to_string),
        }
    }
}

/// Persistence for tenants, the upstream credential and the operation log.
pub trait TenantStore: Send + Sync {
    fn list_tenants(&self) -> Result<Vec<Tenant>, DbError>;

    fn tenant(&self, company_code: &str) -> Result<Option<Tenant>, DbError>;

    /// Insert or replace a tenant's settings. The watermark is kept.
    fn save_tenant(&self, tenant: &Tenant) -> Result<(), DbError>;

    /// Delete a tenant's settings. Returns whether it existed.
    fn remove_tenant(&self, company_code: &str) -> Result<bool, DbError>;

    fn upstream_credential(&self) -> Result<Option<UpstreamCredential>, DbError>;

    fn save_upstream_credential(&self, credential: &UpstreamCredential) -> Result<(), DbError>;

    /// Move the watermark forward; a lower version never replaces a higher one.
    fn advance_watermark(&self, company_code: &str, version: i64, at: NaiveDateTime) -> Result<(), DbError>;

    fn append_operation_log(&self, entry: &OperationLogEntry) -> Result<(), DbError>;

    fn operation_log(&self, limit: usize) -> Result<Vec<OperationLogEntry>, DbError>;

    /// Take the sync lock for a tenant. Returns false when another run,
    /// in this process or any other, already holds it.
    fn try_lock_tenant(&self, company_code: &str) -> Result<bool, DbError>;

    fn unlock_tenant(&self, company_code: &str) -> Result<(), DbError>;
}

const TENANT_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS erp_config (
        id INTEGER PRIMARY KEY DEFAULT 1 CHECK (id = 1),
        server VARCHAR(255) NOT NULL,
        username VARCHAR(255) NOT NULL,
        password VARCHAR(255) NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS company_config (
        id SERIAL PRIMARY KEY,
        company_code VARCHAR(20) NOT NULL UNIQUE,
        company_name VARCHAR(100) NOT NULL,
        mssql_database VARCHAR(100) NOT NULL,
        mes_database VARCHAR(100) NOT NULL,
        sync_tables TEXT NOT NULL DEFAULT '',
        last_sync_version BIGINT,
        last_sync_time TIMESTAMP,
        sync_interval_minutes INTEGER NOT NULL DEFAULT 0 CHECK (sync_interval_minutes >= 0)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS erp_operation_log (
        id BIGSERIAL PRIMARY KEY,
        actor VARCHAR(150) NOT NULL,
        action VARCHAR(1000) NOT NULL,
        created_at TIMESTAMP NOT NULL
    )
    "#,
];

/// Create the registry tables if missing.
///
/// # Errors
///
/// Returns `DbError` if any statement fails.
pub fn ensure_tenant_tables(executor: &dyn Executor) -> Result<(), DbError> {
    for sql in TENANT_TABLES {
        executor.execute(sql, &[])?;
    }
    Ok(())
}

const TENANT_COLUMNS: &str = "company_code, company_name, mssql_database, mes_database, sync_tables, \
     last_sync_version, last_sync_time, sync_interval_minutes";

fn tenant_from_row(row: &may_postgres::Row) -> Result<Tenant, DbError> {
    let parse = |e: may_postgres::Error| DbError::Parse(format!("company_config row: {e}"));
    let interval: i32 = row.try_get(7).map_err(parse)?;
    let tables: String = row.try_get(4).map_err(parse)?;
    Ok(Tenant {
        company_code: row.try_get(0).map_err(parse)?,
        company_name: row.try_get(1).map_err(parse)?,
        upstream_database: row.try_get(2).map_err(parse)?,
        local_database: row.try_get(3).map_err(parse)?,
        sync_tables: Tenant::parse_table_list(&tables),
        last_sync_version: row.try_get(5).map_err(parse)?,
        last_sync_time: row.try_get(6).map_err(parse)?,
        sync_interval_minutes: u32::try_from(interval).unwrap_or(0),
    })
}

/// Registry tables in the local MES database.
///
/// Tenant sync locks are session-level advisory locks on the registry
/// connection. Advisory locks are reentrant within a session, so the codes
/// this store holds are also tracked locally.
pub struct PgTenantStore {
    executor: Mutex<PgExecutor>,
    locked: Mutex<HashSet<String>>,
}

impl PgTenantStore {
    pub fn new(executor: PgExecutor) -> Self {
        Self {
            executor: Mutex::new(executor),
            locked: Mutex::new(HashSet::new()),
        }
    }

    fn locked_codes(&self) -> Result<MutexGuard<'_, HashSet<String>>, DbError> {
        self.locked
            .lock()
            .map_err(|_| DbError::Other("tenant lock set poisoned".to_string()))
    }

    fn with_executor<T>(&self, f: impl FnOnce(&PgExecutor) -> Result<T, DbError>) -> Result<T, DbError> {
        let guard = self
            .executor
            .lock()
            .map_err(|_| DbError::Other("tenant store connection poisoned".to_string()))?;
        f(&guard)
    }
}

impl TenantStore for PgTenantStore {
    fn list_tenants(&self) -> Result<Vec<Tenant>, DbError> {
        self.with_executor(|ex| {
            let sql = format!("SELECT {TENANT_COLUMNS} FROM company_config ORDER BY company_code");
            ex.query_all(&sql, &[])?.iter().map(tenant_from_row).collect()
        })
    }

    fn tenant(&self, company_code: &str) -> Result<Option<Tenant>, DbError> {
        self.with_executor(|ex| {
            let sql = format!("SELECT {TENANT_COLUMNS} FROM company_config WHERE company_code = $1");
            ex.query_opt(&sql, &[&company_code])?
                .as_ref()
                .map(tenant_from_row)
                .transpose()
        })
    }

    fn save_tenant(&self, tenant: &Tenant) -> Result<(), DbError> {
        let tables = tenant.sync_tables.join(",");
        let interval = i32::try_from(tenant.sync_interval_minutes).unwrap_or(i32::MAX);
        self.with_executor(|ex| {
            ex.execute(
                "INSERT INTO company_config \
                 (company_code, company_name, mssql_database, mes_database, sync_tables, sync_interval_minutes) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (company_code) DO UPDATE SET \
                 company_name = EXCLUDED.company_name, mssql_database = EXCLUDED.mssql_database, \
                 mes_database = EXCLUDED.mes_database, sync_tables = EXCLUDED.sync_tables, \
                 sync_interval_minutes = EXCLUDED.sync_interval_minutes",
                &[
                    &tenant.company_code,
                    &tenant.company_name,
                    &tenant.upstream_database,
                    &tenant.local_database,
                    &tables,
                    &interval,
                ],
            )?;
            Ok(())
        })
    }

    fn remove_tenant(&self, company_code: &str) -> Result<bool, DbError> {
        self.with_executor(|ex| {
            let deleted = ex.execute("DELETE FROM company_config WHERE company_code = $1", &[&company_code])?;
            Ok(deleted > 0)
        })
    }

    fn upstream_credential(&self) -> Result<Option<UpstreamCredential>, DbError> {
        self.with_executor(|ex| {
            let row = ex.query_opt("SELECT server, username, password FROM erp_config WHERE id = 1", &[])?;
            row.map(|r| {
                let parse = |e: may_postgres::Error| DbError::Parse(format!("erp_config row: {e}"));
                Ok(UpstreamCredential {
                    host: r.try_get(0).map_err(parse)?,
                    user: r.try_get(1).map_err(parse)?,
                    password: r.try_get(2).map_err(parse)?,
                })
            })
            .transpose()
        })
    }

    fn save_upstream_credential(&self, credential: &UpstreamCredential) -> Result<(), DbError> {
        self.with_executor(|ex| {
            ex.execute(
                "INSERT INTO erp_config (id, server, username, password) VALUES (1, $1, $2, $3) \
                 ON CONFLICT (id) DO UPDATE SET server = EXCLUDED.server, \
                 username = EXCLUDED.username, password = EXCLUDED.password",
                &[&credential.host, &credential.user, &credential.password],
            )?;
            Ok(())
        })
    }

    fn advance_watermark(&self, company_code: &str, version: i64, at: NaiveDateTime) -> Result<(), DbError> {
        self.with_executor(|ex| {
            let updated = ex.execute(
                "UPDATE company_config \
                 SET last_sync_version = GREATEST(COALESCE(last_sync_version, 0), $2), last_sync_time = $3 \
                 WHERE company_code = $1",
                &[&company_code, &version, &at],
            )?;
            if updated == 0 {
                return Err(DbError::Query(format!("unknown tenant {company_code}")));
            }
            Ok(())
        })
    }

    fn append_operation_log(&self, entry: &OperationLogEntry) -> Result<(), DbError> {
        self.with_executor(|ex| {
            ex.execute(
                "INSERT INTO erp_operation_log (actor, action, created_at) VALUES ($1, $2, $3)",
                &[&entry.actor, &entry.action, &entry.at],
            )?;
            Ok(())
        })
    }

    fn operation_log(&self, limit: usize) -> Result<Vec<OperationLogEntry>, DbError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_executor(|ex| {
            ex.query_all(
                "SELECT actor, action, created_at FROM erp_operation_log ORDER BY id DESC LIMIT $1",
                &[&limit],
            )?
            .iter()
            .map(|r| {
                let parse = |e: may_postgres::Error| DbError::Parse(format!("erp_operation_log row: {e}"));
                Ok(OperationLogEntry {
                    actor: r.try_get(0).map_err(parse)?,
                    action: r.try_get(1).map_err(parse)?,
                    at: r.try_get(2).map_err(parse)?,
                })
            })
            .collect()
        })
    }

    fn try_lock_tenant(&self, company_code: &str) -> Result<bool, DbError> {
        let mut locked = self.locked_codes()?;
        if locked.contains(company_code) {
            return Ok(false);
        }
        let acquired = self.with_executor(|ex| {
            let row = ex.query_one(
                "SELECT pg_try_advisory_lock(hashtext('shopfloor.sync'), hashtext($1))",
                &[&company_code],
            )?;
            row.try_get::<_, bool>(0)
                .map_err(|e| DbError::Parse(format!("advisory lock result: {e}")))
        })?;
        if acquired {
            locked.insert(company_code.to_string());
        }
        Ok(acquired)
    }

    fn unlock_tenant(&self, company_code: &str) -> Result<(), DbError> {
        let mut locked = self.locked_codes()?;
        if !locked.remove(company_code) {
            return Ok(());
        }
        self.with_executor(|ex| {
            ex.query_one(
                "SELECT pg_advisory_unlock(hashtext('shopfloor.sync'), hashtext($1))",
                &[&company_code],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn tenant(interval: u32, last: Option<NaiveDateTime>) -> Tenant {
        Tenant {
            company_code: "10".into(),
            company_name: "Acme".into(),
            upstream_database: "ERP10".into(),
            local_database: "erp_10".into(),
            sync_tables: vec!["comCustomer".into()],
            last_sync_version: None,
            last_sync_time: last,
            sync_interval_minutes: interval,
        }
    }

    #[test]
    fn test_parse_table_list() {
        assert_eq!(
            Tenant::parse_table_list(" comCustomer, ordBillMain,,  "),
            vec!["comCustomer".to_string(), "ordBillMain".to_string()]
        );
        assert!(Tenant::parse_table_list("").is_empty());
    }

    #[test]
    fn test_is_due() {
        assert!(!tenant(0, None).is_due(at(9, 0)));
        assert!(tenant(15, None).is_due(at(9, 0)));
        assert!(!tenant(15, Some(at(9, 0))).is_due(at(9, 14)));
        assert!(tenant(15, Some(at(9, 0))).is_due(at(9, 15)));
    }

    #[test]
    fn test_operation_log_truncates_on_char_boundary() {
        let long = "同步".repeat(600);
        let entry = OperationLogEntry::new("admin", long, at(8, 0));
        assert_eq!(entry.action.chars().count(), MAX_ACTION_CHARS);
    }

    #[test]
    fn test_directory_resolution() {
        let directory = TenantDirectory::from_pairs([("10", "Acme"), ("20", "Globex")]);
        assert_eq!(directory.name_for("20"), Some("Globex"));
        assert_eq!(directory.code_for(" Acme "), Some("10"));
        assert_eq!(directory.resolve(Some("20"), "Acme"), Some("20".to_string()));
        assert_eq!(directory.resolve(None, "Acme"), Some("10".to_string()));
        assert_eq!(directory.resolve(Some("  "), "Globex"), Some("20".to_string()));
        assert_eq!(directory.resolve(None, "Initech"), None);
    }

    #[test]
    fn test_credential_debug_redacts() {
        let c = UpstreamCredential {
            host: "erp.local".into(),
            user: "sa".into(),
            password: "pw".into(),
        };
        assert!(!format!("{c:?}").contains("\"pw\""));
    }

    #[test]
    fn test_registry_tables_created_idempotently() {
        let executor = crate::test_helpers::RecordingExecutor::new();
        ensure_tenant_tables(&executor).unwrap();
        let statements = executor.statements();
        assert_eq!(statements.len(), TENANT_TABLES.len());
        assert!(statements.iter().all(|sql| sql.starts_with("CREATE TABLE IF NOT EXISTS")));
        assert!(statements.iter().any(|sql| sql.contains("erp_operation_log")));
    }
}
