//! Sync executor: one run for one tenant.
//!
//! A run opens one upstream session and one replica session, then walks the
//! accepted tables in order. Each table gets its own local transaction and
//! each row its own savepoint, so a bad row never takes the table down and a
//! bad table never takes the run down.

use chrono::{Local, NaiveDateTime};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

use crate::config::SyncConfig;
use crate::connection::validate_database_name;
use crate::executor::DbError;
use crate::sync::changefeed::{changes_retained, changes_since, current_version};
use crate::sync::codec::{LocalValue, RowCodec, UpstreamRow};
use crate::sync::error::SyncError;
use crate::sync::keys::KeyRegistry;
use crate::sync::replica::{ReplicaConnector, ReplicaSession};
use crate::sync::schema::{self, TableSpec, UPDATED_AT};
use crate::sync::types::UpstreamColumn;
use crate::sync::upstream::{UpstreamConnector, UpstreamSession};
use crate::sync::whitelist::TableWhitelist;
use crate::tenant::{OperationLogEntry, Tenant, TenantStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Drop, recreate and reload every table.
    Full,
    /// Apply change-tracked rows since the watermark.
    Incremental,
}

impl SyncMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(SyncMode::Full),
            "incremental" | "incr" => Ok(SyncMode::Incremental),
            other => Err(format!("unknown sync mode '{other}'")),
        }
    }
}

/// "Run sync for tenant T, mode M, actor U".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub tenant_code: String,
    pub mode: SyncMode,
    pub actor: String,
    /// Subset of the tenant's tables; `None` runs all of them.
    pub tables: Option<Vec<String>>,
}

impl SyncRequest {
    pub fn new(tenant_code: impl Into<String>, mode: SyncMode, actor: impl Into<String>) -> Self {
        Self {
            tenant_code: tenant_code.into(),
            mode,
            actor: actor.into(),
            tables: None,
        }
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables = Some(tables);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    /// Incremental run found nothing past the watermark; nothing was written.
    UpToDate,
}

/// A row that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// Key values, or the row's position when there is no key.
    pub row: String,
    pub kind: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableResult {
    pub table: String,
    pub key_columns: Vec<String>,
    /// No key: the table was rebuilt from every current row.
    pub degraded: bool,
    /// Upstream had purged changes past the watermark, so the table was rebuilt.
    pub history_expired: bool,
    pub created: bool,
    pub rows_succeeded: u64,
    pub rows_failed: u64,
    pub row_failures: Vec<RowFailure>,
    pub type_fallbacks: usize,
    /// Set when the table as a whole failed and its transaction rolled back.
    pub error: Option<String>,
}

impl TableResult {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            key_columns: Vec::new(),
            degraded: false,
            history_expired: false,
            created: false,
            rows_succeeded: 0,
            rows_failed: 0,
            row_failures: Vec::new(),
            type_fallbacks: 0,
            error: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Counts and failures of one run, as shown to the admin surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub tenant: String,
    pub mode: SyncMode,
    pub outcome: SyncOutcome,
    pub from_version: Option<i64>,
    pub to_version: i64,
    pub tables: Vec<TableResult>,
    /// Tables outside the tenant list or the whitelist.
    pub refused_tables: Vec<String>,
    pub watermark_advanced: bool,
    pub started_at: NaiveDateTime,
    pub finished_at: NaiveDateTime,
}

impl SyncReport {
    pub fn tables_attempted(&self) -> usize {
        self.tables.len()
    }

    pub fn tables_succeeded(&self) -> usize {
        self.tables.iter().filter(|t| t.succeeded()).count()
    }

    pub fn tables_failed(&self) -> usize {
        self.tables_attempted() - self.tables_succeeded()
    }

    pub fn failed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| !t.succeeded())
            .map(|t| t.table.as_str())
            .collect()
    }

    pub fn rows_affected(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_succeeded).sum()
    }

    pub fn rows_failed(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_failed).sum()
    }

    pub fn type_fallbacks(&self) -> usize {
        self.tables.iter().map(|t| t.type_fallbacks).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableResult> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// One-line summary for the operation log.
    pub fn summary(&self) -> String {
        match self.outcome {
            SyncOutcome::UpToDate => format!(
                "{} sync of {}: up to date at version {}",
                self.mode.as_str(),
                self.tenant,
                self.to_version
            ),
            SyncOutcome::Completed if self.tables_failed() == 0 => format!(
                "{} sync of {} succeeded: {} tables, {} rows, version {}",
                self.mode.as_str(),
                self.tenant,
                self.tables_succeeded(),
                self.rows_affected(),
                self.to_version
            ),
            SyncOutcome::Completed => format!(
                "{} sync of {} partially succeeded: {}/{} tables, {} rows, {} rows failed; failed tables: {}",
                self.mode.as_str(),
                self.tenant,
                self.tables_succeeded(),
                self.tables_attempted(),
                self.rows_affected(),
                self.rows_failed(),
                self.failed_tables().join(", ")
            ),
        }
    }
}

/// Where the table whitelist comes from.
#[derive(Debug, Clone)]
pub enum WhitelistSource {
    /// Re-read on every run so edits apply without a restart.
    File(PathBuf),
    Fixed(TableWhitelist),
}

impl WhitelistSource {
    fn load(&self) -> Result<TableWhitelist, SyncError> {
        match self {
            WhitelistSource::File(path) => TableWhitelist::load(path),
            WhitelistSource::Fixed(list) => Ok(list.clone()),
        }
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Registry-level sync lock on one tenant, released on drop.
pub struct TenantClaim {
    tenants: Arc<dyn TenantStore>,
    company_code: String,
}

impl TenantClaim {
    pub fn company_code(&self) -> &str {
        &self.company_code
    }
}

impl Drop for TenantClaim {
    fn drop(&mut self) {
        if let Err(e) = self.tenants.unlock_tenant(&self.company_code) {
            log::warn!("could not release sync lock for tenant {}: {e}", self.company_code);
        }
    }
}

/// Runs tenant syncs against injected stores and connectors.
pub struct SyncExecutor {
    tenants: Arc<dyn TenantStore>,
    upstream: Arc<dyn UpstreamConnector>,
    replicas: Arc<dyn ReplicaConnector>,
    whitelist: WhitelistSource,
    keys: KeyRegistry,
}

impl SyncExecutor {
    pub fn new(
        tenants: Arc<dyn TenantStore>,
        upstream: Arc<dyn UpstreamConnector>,
        replicas: Arc<dyn ReplicaConnector>,
        whitelist: WhitelistSource,
        keys: KeyRegistry,
    ) -> Self {
        Self {
            tenants,
            upstream,
            replicas,
            whitelist,
            keys,
        }
    }

    /// Executor configured from the `[sync]` section.
    pub fn from_config(
        config: &SyncConfig,
        tenants: Arc<dyn TenantStore>,
        upstream: Arc<dyn UpstreamConnector>,
        replicas: Arc<dyn ReplicaConnector>,
    ) -> Self {
        Self::new(
            tenants,
            upstream,
            replicas,
            WhitelistSource::File(config.tables_config.clone()),
            KeyRegistry::with_overrides(&config.primary_keys),
        )
    }

    pub fn tenants(&self) -> &Arc<dyn TenantStore> {
        &self.tenants
    }

    /// Take the registry sync lock for `company_code`. The lock is shared
    /// by every process using the same registry.
    ///
    /// # Errors
    ///
    /// `TenantSerializationConflict` if it is already held, `Registry` if
    /// the registry cannot be reached.
    pub fn claim(&self, company_code: &str) -> Result<TenantClaim, SyncError> {
        if !self
            .tenants
            .try_lock_tenant(company_code)
            .map_err(SyncError::Registry)?
        {
            return Err(SyncError::TenantSerializationConflict {
                tenant: company_code.to_string(),
            });
        }
        Ok(TenantClaim {
            tenants: Arc::clone(&self.tenants),
            company_code: company_code.to_string(),
        })
    }

    /// Run one sync.
    ///
    /// Row and table failures are folded into the report. Errors are
    /// returned only when the run cannot start or cannot reach either side;
    /// in that case the watermark is untouched.
    ///
    /// # Errors
    ///
    /// `TenantSerializationConflict` when another run holds the tenant's
    /// sync lock, otherwise `ConfigInvalid`, `UpstreamUnavailable`,
    /// `ChangeTrackingDisabled`, `LocalUnavailable` or `Registry`.
    pub fn run(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::sync_run_span(&request.tenant_code, request.mode.as_str()).entered();

        let started = Instant::now();
        let result = self
            .claim(&request.tenant_code)
            .and_then(|_claim| self.run_inner(request));

        if let Err(e) = &result {
            log::error!("{} sync of {} failed: {e}", request.mode.as_str(), request.tenant_code);
            // The error already carries the cause; a log write failure is only logged.
            let entry = OperationLogEntry::new(
                &request.actor,
                format!("{} sync of {} failed: {e}", request.mode.as_str(), request.tenant_code),
                now(),
            );
            if let Err(log_err) = self.tenants.append_operation_log(&entry) {
                log::warn!("could not record failed run in the operation log: {log_err}");
            }
        }

        #[cfg(feature = "metrics")]
        METRICS.record_sync_run(&request.tenant_code, request.mode.as_str(), started.elapsed());
        #[cfg(not(feature = "metrics"))]
        let _ = started;

        result
    }

    fn run_inner(&self, request: &SyncRequest) -> Result<SyncReport, SyncError> {
        let started_at = now();
        let tenant = self
            .tenants
            .tenant(&request.tenant_code)
            .map_err(SyncError::Registry)?
            .ok_or_else(|| SyncError::ConfigInvalid(format!("unknown tenant '{}'", request.tenant_code)))?;

        validate_database_name(&tenant.local_database)
            .map_err(|e| SyncError::ConfigInvalid(format!("tenant {}: {e}", tenant.company_code)))?;

        let (accepted, refused) = self.select_tables(&tenant, request)?;
        if !refused.is_empty() {
            log::warn!("tenant {}: refusing tables {}", tenant.company_code, refused.join(", "));
        }
        if accepted.is_empty() {
            return Err(SyncError::ConfigInvalid(format!(
                "tenant {} has no whitelisted tables to sync",
                tenant.company_code
            )));
        }

        let credential = self
            .tenants
            .upstream_credential()
            .map_err(SyncError::Registry)?
            .ok_or_else(|| SyncError::ConfigInvalid("upstream credential is not configured".to_string()))?;

        let mut upstream = self
            .upstream
            .connect(&credential, &tenant.upstream_database)
            .map_err(|e| SyncError::UpstreamUnavailable {
                tenant: tenant.company_code.clone(),
                reason: e.to_string(),
            })?;
        let version = current_version(upstream.as_mut(), &tenant.company_code)?;

        let mut report = SyncReport {
            tenant: tenant.company_code.clone(),
            mode: request.mode,
            outcome: SyncOutcome::Completed,
            from_version: tenant.last_sync_version,
            to_version: version,
            tables: Vec::new(),
            refused_tables: refused,
            watermark_advanced: false,
            started_at,
            finished_at: started_at,
        };

        let last = tenant.last_sync_version.unwrap_or(0);
        if request.mode == SyncMode::Incremental && version <= last {
            log::info!(
                "tenant {} is up to date (upstream {version}, watermark {last})",
                tenant.company_code
            );
            report.outcome = SyncOutcome::UpToDate;
            report.to_version = last;
            report.finished_at = now();
            return Ok(report);
        }

        let mut replica = self
            .replicas
            .open(&tenant)
            .map_err(|e| SyncError::LocalUnavailable {
                tenant: tenant.company_code.clone(),
                reason: e.to_string(),
            })?;

        log::info!(
            "{} sync of {} started: {} tables, versions {last}..{version}",
            request.mode.as_str(),
            tenant.company_code,
            accepted.len()
        );

        for table in &accepted {
            let result = self.sync_table(
                &tenant,
                upstream.as_mut(),
                replica.as_mut(),
                table,
                request.mode,
                last,
                version,
            );
            if let Some(reason) = &result.error {
                log::error!("tenant {} table {table} failed: {reason}", tenant.company_code);
                #[cfg(feature = "metrics")]
                METRICS.record_table_failure(&tenant.company_code);
                let entry = OperationLogEntry::new(
                    &request.actor,
                    format!("sync of {}.{table} failed: {reason}", tenant.company_code),
                    now(),
                );
                self.tenants.append_operation_log(&entry).map_err(SyncError::Registry)?;
            }
            #[cfg(feature = "metrics")]
            METRICS.record_rows(&tenant.company_code, result.rows_succeeded, result.rows_failed);
            report.tables.push(result);
        }

        report.finished_at = now();
        if report.tables_succeeded() > 0 {
            self.tenants
                .advance_watermark(&tenant.company_code, version, report.finished_at)
                .map_err(SyncError::Registry)?;
            report.watermark_advanced = true;
        } else {
            log::warn!(
                "tenant {}: every table failed, watermark stays at {:?}",
                tenant.company_code,
                tenant.last_sync_version
            );
        }

        log::info!("{}", report.summary());
        let entry = OperationLogEntry::new(&request.actor, report.summary(), report.finished_at);
        self.tenants.append_operation_log(&entry).map_err(SyncError::Registry)?;
        Ok(report)
    }

    /// Requested tables ∩ tenant list ∩ whitelist, in request order.
    fn select_tables(&self, tenant: &Tenant, request: &SyncRequest) -> Result<(Vec<String>, Vec<String>), SyncError> {
        let whitelist = self.whitelist.load()?;
        let mut refused = Vec::new();
        let wanted: Vec<String> = match &request.tables {
            None => tenant.sync_tables.clone(),
            Some(tables) => tables
                .iter()
                .filter(|t| {
                    let allowed = tenant.sync_tables.contains(t);
                    if !allowed {
                        refused.push((*t).clone());
                    }
                    allowed
                })
                .cloned()
                .collect(),
        };
        let (accepted, mut rejected) = whitelist.filter(&wanted);
        refused.append(&mut rejected);
        Ok((accepted, refused))
    }

    #[allow(clippy::too_many_arguments)]
    fn sync_table(
        &self,
        tenant: &Tenant,
        upstream: &mut dyn UpstreamSession,
        replica: &mut dyn ReplicaSession,
        table: &str,
        mode: SyncMode,
        from_version: i64,
        to_version: i64,
    ) -> TableResult {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::sync_table_span(&tenant.company_code, table).entered();

        let mut result = TableResult::new(table);
        if let Err(e) = replica.begin() {
            result.error = Some(format!("begin failed: {e}"));
            return result;
        }

        let outcome = match mode {
            SyncMode::Full => self.rebuild_table(upstream, replica, table, &mut result),
            SyncMode::Incremental => {
                self.apply_changes(tenant, upstream, replica, table, from_version, to_version, &mut result)
            }
        };

        match outcome.and_then(|()| {
            replica.commit().map_err(|source| SyncError::Local {
                table: table.to_string(),
                source,
            })
        }) {
            Ok(()) => {
                log::info!(
                    "tenant {} table {table}: {} rows written, {} rows skipped",
                    tenant.company_code,
                    result.rows_succeeded,
                    result.rows_failed
                );
            }
            Err(e) => {
                if let Err(rollback_err) = replica.rollback() {
                    log::warn!("rollback of {table} failed: {rollback_err}");
                }
                result.rows_succeeded = 0;
                result.error = Some(e.to_string());
            }
        }
        result
    }

    fn table_spec(
        &self,
        upstream: &mut dyn UpstreamSession,
        table: &str,
        result: &mut TableResult,
    ) -> Result<(TableSpec, Vec<UpstreamColumn>), SyncError> {
        let columns = upstream.columns(table).map_err(|source| SyncError::Upstream {
            table: table.to_string(),
            source,
        })?;
        if columns.is_empty() {
            return Err(SyncError::ConfigInvalid(format!("table {table} does not exist upstream")));
        }
        let spec = TableSpec::from_upstream(table, &columns);
        result.type_fallbacks = spec.fallback_count();
        let names: Vec<String> = spec.column_names().map(str::to_string).collect();
        let key = self.keys.resolve(table, &names);
        result.degraded = key.is_degraded();
        result.key_columns = key.columns;
        Ok((spec, columns))
    }

    fn rebuild_table(
        &self,
        upstream: &mut dyn UpstreamSession,
        replica: &mut dyn ReplicaSession,
        table: &str,
        result: &mut TableResult,
    ) -> Result<(), SyncError> {
        let (spec, columns) = self.table_spec(upstream, table, result)?;
        self.reload(upstream, replica, &spec, &columns, result)
    }

    /// Drop, create, validate, then insert every current row.
    fn reload(
        &self,
        upstream: &mut dyn UpstreamSession,
        replica: &mut dyn ReplicaSession,
        spec: &TableSpec,
        columns: &[UpstreamColumn],
        result: &mut TableResult,
    ) -> Result<(), SyncError> {
        let local = |source| SyncError::Local {
            table: spec.name.clone(),
            source,
        };
        schema::drop_and_recreate(replica, spec).map_err(local)?;
        result.created = true;
        schema::validate(replica, spec)?;

        let rows = upstream
            .select_all(&spec.name, columns)
            .map_err(|source| SyncError::Upstream {
                table: spec.name.clone(),
                source,
            })?;
        let codec = RowCodec::new(spec);
        let names = codec.column_names();
        for (index, row) in rows.into_iter().enumerate() {
            let label = format!("#{}", index + 1);
            self.write_row(replica, spec, &codec, &names, row, &[], label, result)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_changes(
        &self,
        tenant: &Tenant,
        upstream: &mut dyn UpstreamSession,
        replica: &mut dyn ReplicaSession,
        table: &str,
        from_version: i64,
        to_version: i64,
        result: &mut TableResult,
    ) -> Result<(), SyncError> {
        let (spec, columns) = self.table_spec(upstream, table, result)?;
        if result.degraded {
            log::warn!(
                "tenant {} table {table}: no key columns, rebuilding instead of applying changes",
                tenant.company_code
            );
            return self.reload(upstream, replica, &spec, &columns, result);
        }
        if from_version < to_version && !changes_retained(upstream, table, from_version)? {
            log::warn!(
                "tenant {} table {table}: changes after version {from_version} were purged upstream, rebuilding",
                tenant.company_code
            );
            result.history_expired = true;
            return self.reload(upstream, replica, &spec, &columns, result);
        }

        let local = |source| SyncError::Local {
            table: table.to_string(),
            source,
        };
        result.created = schema::create_if_absent(replica, &spec).map_err(local)?;
        schema::ensure_audit_columns(replica, table).map_err(local)?;
        schema::validate(replica, &spec)?;

        let changes = changes_since(upstream, table, &columns, &result.key_columns, from_version, to_version)?;
        let codec = RowCodec::new(&spec);
        let names = codec.column_names();
        let key = result.key_columns.clone();
        for (index, row) in changes.rows.into_iter().enumerate() {
            let label = format!("#{}", index + 1);
            self.write_row(replica, &spec, &codec, &names, row, &key, label, result)?;
        }
        Ok(())
    }

    /// Decode and upsert one row under its own savepoint.
    ///
    /// Row failures are recorded in `result`; only a failure to manage the
    /// savepoint itself aborts the table.
    #[allow(clippy::too_many_arguments)]
    fn write_row(
        &self,
        replica: &mut dyn ReplicaSession,
        spec: &TableSpec,
        codec: &RowCodec,
        names: &[String],
        row: UpstreamRow,
        key: &[String],
        label: String,
        result: &mut TableResult,
    ) -> Result<(), SyncError> {
        let table = spec.name.as_str();
        let values = match codec.decode(row, now()) {
            Ok(values) => values,
            Err(e) => {
                log::warn!("{table} row {label}: {e}; skipped");
                #[cfg(feature = "metrics")]
                METRICS.record_decode_failure();
                result.rows_failed += 1;
                result.row_failures.push(RowFailure {
                    row: label,
                    kind: "row_decode_failure",
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        let key_values: Vec<(&str, &LocalValue)> = key
            .iter()
            .filter_map(|k| spec.position(k).map(|i| (k.as_str(), &values[i])))
            .collect();
        let row_label = if key_values.is_empty() {
            label
        } else {
            key_values
                .iter()
                .map(|(_, v)| v.display_short())
                .collect::<Vec<_>>()
                .join("/")
        };

        let local = |source| SyncError::Local {
            table: table.to_string(),
            source,
        };
        replica.savepoint().map_err(local)?;
        match upsert(replica, table, names, &values, &key_values) {
            Ok(()) => {
                replica.release_savepoint().map_err(local)?;
                result.rows_succeeded += 1;
            }
            Err(e) => {
                replica.rollback_to_savepoint().map_err(local)?;
                log::warn!("{table} row {row_label}: write failed: {e}; skipped");
                result.rows_failed += 1;
                result.row_failures.push(RowFailure {
                    row: row_label,
                    kind: "row_write_failure",
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Update the row matching `key` (non-key columns and `updated_at`), or insert it.
fn upsert(
    replica: &mut dyn ReplicaSession,
    table: &str,
    names: &[String],
    values: &[LocalValue],
    key: &[(&str, &LocalValue)],
) -> Result<(), DbError> {
    let existing = if key.is_empty() {
        None
    } else {
        replica.find_row_id(table, key)?
    };
    match existing {
        Some(row_id) => {
            let (columns, update_values): (Vec<String>, Vec<LocalValue>) = names
                .iter()
                .zip(values)
                .filter(|(name, _)| name.as_str() == UPDATED_AT || !key.iter().any(|(k, _)| *k == name.as_str()))
                .map(|(name, value)| (name.clone(), value.clone()))
                .unzip();
            replica.update_row(table, row_id, &columns, &update_values)?;
        }
        None => {
            replica.insert_row(table, names, values)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::codec::UpstreamValue;
    use crate::test_helpers::{MemoryReplicaConnector, MemoryTenantStore, MemoryUpstream};
    use chrono::NaiveDate;
    use std::collections::HashMap;

    fn report(results: Vec<TableResult>) -> SyncReport {
        let at = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
        SyncReport {
            tenant: "10".into(),
            mode: SyncMode::Incremental,
            outcome: SyncOutcome::Completed,
            from_version: Some(3),
            to_version: 7,
            tables: results,
            refused_tables: Vec::new(),
            watermark_advanced: true,
            started_at: at,
            finished_at: at,
        }
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("FULL".parse::<SyncMode>().unwrap(), SyncMode::Full);
        assert_eq!("incremental".parse::<SyncMode>().unwrap(), SyncMode::Incremental);
        assert!("sideways".parse::<SyncMode>().is_err());
    }

    #[test]
    fn test_report_counts() {
        let mut ok = TableResult::new("comCustomer");
        ok.rows_succeeded = 3;
        ok.rows_failed = 1;
        let mut failed = TableResult::new("ordBillMain");
        failed.error = Some("schema drift".into());
        let report = report(vec![ok, failed]);

        assert_eq!(report.tables_attempted(), 2);
        assert_eq!(report.tables_succeeded(), 1);
        assert_eq!(report.tables_failed(), 1);
        assert_eq!(report.rows_affected(), 3);
        assert_eq!(report.rows_failed(), 1);
        assert_eq!(report.failed_tables(), vec!["ordBillMain"]);
        assert!(report.summary().contains("partially succeeded"));
        assert!(report.summary().contains("ordBillMain"));
    }

    #[test]
    fn test_up_to_date_summary() {
        let mut report = report(Vec::new());
        report.outcome = SyncOutcome::UpToDate;
        assert_eq!(report.tables_attempted(), 0);
        assert!(report.summary().contains("up to date"));
    }

    // Runs against the in-memory registry, upstream and replica.

    const ERP: &str = "ERP10";
    const LOCAL: &str = "mes_10";

    struct Fixture {
        upstream: MemoryUpstream,
        replicas: MemoryReplicaConnector,
        tenants: MemoryTenantStore,
        executor: SyncExecutor,
    }

    fn text(s: &str) -> UpstreamValue {
        UpstreamValue::Text(s.to_string())
    }

    /// Tenant 10 replicating `comCustomer` and the keyless `stkLog`.
    fn fixture() -> Fixture {
        let upstream = MemoryUpstream::new();
        upstream.create_table(
            ERP,
            "comCustomer",
            vec![
                UpstreamColumn::new("Flag", "char").with_length(1),
                UpstreamColumn::new("ID", "nvarchar").with_length(10),
                UpstreamColumn::new("Name", "nvarchar").with_length(40),
            ],
            &["Flag", "ID"],
        );
        upstream.upsert(ERP, "comCustomer", vec![text("T"), text("C001"), text("Acme Trading")]);
        upstream.create_table(
            ERP,
            "stkLog",
            vec![UpstreamColumn::new("Note", "nvarchar").with_length(80)],
            &[],
        );
        upstream.upsert(ERP, "stkLog", vec![text("opening stock")]);

        let tenants = MemoryTenantStore::with_tenants([Tenant {
            company_code: "10".to_string(),
            company_name: "Acme".to_string(),
            upstream_database: ERP.to_string(),
            local_database: LOCAL.to_string(),
            sync_tables: vec!["comCustomer".to_string(), "stkLog".to_string()],
            last_sync_version: None,
            last_sync_time: None,
            sync_interval_minutes: 0,
        }]);
        let mut keyless = HashMap::new();
        keyless.insert("stkLog".to_string(), Vec::new());
        let replicas = MemoryReplicaConnector::new();
        let executor = SyncExecutor::new(
            Arc::new(tenants.clone()),
            Arc::new(upstream.clone()),
            Arc::new(replicas.clone()),
            WhitelistSource::Fixed(TableWhitelist::new(["comCustomer", "stkLog"])),
            KeyRegistry::with_overrides(&keyless),
        );
        Fixture {
            upstream,
            replicas,
            tenants,
            executor,
        }
    }

    impl Fixture {
        fn run(&self, mode: SyncMode) -> SyncReport {
            self.executor
                .run(&SyncRequest::new("10", mode, "admin"))
                .expect("Failed to run sync")
        }

        fn watermark(&self) -> Option<i64> {
            self.tenants
                .tenant("10")
                .expect("Failed to read tenant")
                .and_then(|t| t.last_sync_version)
        }
    }

    #[test]
    fn test_locked_tenant_is_refused_without_side_effects() {
        let f = fixture();
        assert!(f.tenants.try_lock_tenant("10").unwrap());

        let err = f
            .executor
            .run(&SyncRequest::new("10", SyncMode::Full, "admin"))
            .unwrap_err();
        assert!(matches!(err, SyncError::TenantSerializationConflict { ref tenant } if tenant == "10"));
        assert_eq!(f.watermark(), None);
        assert_eq!(f.replicas.row_count(LOCAL, "comCustomer"), 0);
        assert_eq!(f.upstream.connections(), 0);

        f.tenants.unlock_tenant("10").unwrap();
        let report = f.run(SyncMode::Full);
        assert!(report.watermark_advanced);
        assert!(!f.tenants.is_locked("10"), "lock must be released after the run");
    }

    #[test]
    fn test_incremental_at_watermark_is_up_to_date() {
        let f = fixture();
        f.run(SyncMode::Full);
        let watermark = f.watermark();

        let report = f.run(SyncMode::Incremental);
        assert_eq!(report.outcome, SyncOutcome::UpToDate);
        assert!(report.tables.is_empty());
        assert_eq!(Some(report.to_version), watermark);
        assert!(!report.watermark_advanced);
        assert_eq!(f.watermark(), watermark);
    }

    #[test]
    fn test_keyless_table_is_rebuilt_on_incremental() {
        let f = fixture();
        f.run(SyncMode::Full);
        f.upstream.upsert(ERP, "stkLog", vec![text("received 40")]);

        let report = f.run(SyncMode::Incremental);
        let log = report.table("stkLog").unwrap();
        assert!(log.degraded);
        assert!(log.succeeded());
        assert_eq!(log.rows_succeeded, 2);
        assert_eq!(f.replicas.row_count(LOCAL, "stkLog"), 2, "rows must not be duplicated");
        assert!(!report.table("comCustomer").unwrap().degraded);
        assert_eq!(f.watermark(), Some(f.upstream.version(ERP)));
    }

    #[test]
    fn test_purged_change_history_forces_reload() {
        let f = fixture();
        f.run(SyncMode::Full);
        f.upstream
            .upsert(ERP, "comCustomer", vec![text("T"), text("C002"), text("Globex")]);
        f.upstream.purge_changes(ERP, "comCustomer", f.upstream.version(ERP));

        let report = f.run(SyncMode::Incremental);
        let customers = report.table("comCustomer").unwrap();
        assert!(customers.history_expired);
        assert!(customers.succeeded());
        assert_eq!(f.replicas.row_count(LOCAL, "comCustomer"), 2);
        assert!(report.watermark_advanced);
    }

    #[test]
    fn test_watermark_stays_when_every_table_fails() {
        let f = fixture();
        f.run(SyncMode::Full);
        let watermark = f.watermark();
        f.upstream
            .upsert(ERP, "comCustomer", vec![text("T"), text("C002"), text("Globex")]);
        f.replicas.create_bare_table(LOCAL, "comCustomer", &["Flag", "ID", "Fax"]);

        let request = SyncRequest::new("10", SyncMode::Incremental, "admin").with_tables(vec!["comCustomer".into()]);
        let report = f.executor.run(&request).expect("Failed to run sync");
        assert_eq!(report.tables_attempted(), 1);
        assert_eq!(report.tables_succeeded(), 0);
        assert!(!report.watermark_advanced);
        assert_eq!(f.watermark(), watermark);
        assert!(f
            .tenants
            .log_entries()
            .iter()
            .any(|e| e.action.contains("10.comCustomer failed")));
    }
}
