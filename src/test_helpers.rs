//! In-memory stores and connectors for tests.
//!
//! Every store keeps its data behind an `Arc<Mutex<_>>`, so a test can keep a
//! clone, run the code under test and then look at what was written.
//! Transactions are snapshots: `begin` and `savepoint` push a copy of the
//! data, rollbacks restore it. Sessions are not isolated from each other.

use chrono::NaiveDateTime;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use may_postgres::types::ToSql;
use may_postgres::Row;

use crate::executor::{DbError, Executor};
use crate::mes::model::{
    ApprovalStatus, Assignment, CompletedProcess, CompletedWorkOrder, Dispatch, DispatchProcess, DispatchStatistics,
    DispatchStatus, Finding, FindingKind, OnsiteReport, OnsiteStatus, OrderIdentity, ProcessStatus,
    ProductionRecord, Report, ReportPatch, WorkOrder, WorkOrderProcess, WorkOrderStatus,
};
use crate::mes::store::{FixRecord, MesSession, MesStore};
use crate::sync::codec::{LocalValue, UpstreamRow, UpstreamValue};
use crate::sync::replica::{ReplicaConnector, ReplicaSession};
use crate::sync::schema::{AuditColumn, TableSpec, ROW_ID, UPDATED_AT};
use crate::sync::types::UpstreamColumn;
use crate::sync::upstream::{UpstreamConnector, UpstreamError, UpstreamSession};
use crate::tenant::{OperationLogEntry, Tenant, TenantDirectory, TenantStore, UpstreamCredential};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transaction and savepoint copies of one session's data.
#[derive(Debug)]
struct Snapshots<T> {
    stack: Vec<T>,
}

impl<T: Clone> Snapshots<T> {
    fn new() -> Self {
        Self { stack: Vec::new() }
    }

    fn begin(&mut self, current: &T) -> Result<(), DbError> {
        if !self.stack.is_empty() {
            return Err(DbError::Other("transaction already open".to_string()));
        }
        self.stack.push(current.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        if self.stack.is_empty() {
            return Err(DbError::Other("no transaction to commit".to_string()));
        }
        self.stack.clear();
        Ok(())
    }

    fn rollback(&mut self, current: &mut T) -> Result<(), DbError> {
        if self.stack.is_empty() {
            return Err(DbError::Other("no transaction to roll back".to_string()));
        }
        *current = self.stack.swap_remove(0);
        self.stack.clear();
        Ok(())
    }

    fn savepoint(&mut self, current: &T) -> Result<(), DbError> {
        if self.stack.is_empty() {
            return Err(DbError::Other("savepoint outside a transaction".to_string()));
        }
        self.stack.push(current.clone());
        Ok(())
    }

    fn release(&mut self) -> Result<(), DbError> {
        if self.stack.len() < 2 {
            return Err(DbError::Other("no savepoint to release".to_string()));
        }
        self.stack.pop();
        Ok(())
    }

    fn rollback_to_savepoint(&mut self, current: &mut T) -> Result<(), DbError> {
        if self.stack.len() < 2 {
            return Err(DbError::Other("no savepoint to roll back to".to_string()));
        }
        if let Some(saved) = self.stack.pop() {
            *current = saved;
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        !self.stack.is_empty()
    }
}

// Tenant registry

#[derive(Debug, Default)]
struct TenantState {
    tenants: BTreeMap<String, Tenant>,
    credential: Option<UpstreamCredential>,
    log: Vec<OperationLogEntry>,
    locked: HashSet<String>,
}

/// Tenant registry kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryTenantStore {
    state: Arc<Mutex<TenantState>>,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `tenants` and a placeholder upstream credential.
    pub fn with_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        let store = Self::new();
        {
            let mut state = lock(&store.state);
            for tenant in tenants {
                state.tenants.insert(tenant.company_code.clone(), tenant);
            }
            state.credential = Some(UpstreamCredential {
                host: "erp.local".to_string(),
                user: "sync".to_string(),
                password: "secret".to_string(),
            });
        }
        store
    }

    pub fn clear_credential(&self) {
        lock(&self.state).credential = None;
    }

    /// Operation log, oldest first.
    pub fn log_entries(&self) -> Vec<OperationLogEntry> {
        lock(&self.state).log.clone()
    }

    pub fn is_locked(&self, company_code: &str) -> bool {
        lock(&self.state).locked.contains(company_code)
    }
}

impl TenantStore for MemoryTenantStore {
    fn list_tenants(&self) -> Result<Vec<Tenant>, DbError> {
        Ok(lock(&self.state).tenants.values().cloned().collect())
    }

    fn tenant(&self, company_code: &str) -> Result<Option<Tenant>, DbError> {
        Ok(lock(&self.state).tenants.get(company_code).cloned())
    }

    fn save_tenant(&self, tenant: &Tenant) -> Result<(), DbError> {
        let mut state = lock(&self.state);
        let mut saved = tenant.clone();
        if let Some(existing) = state.tenants.get(&tenant.company_code) {
            saved.last_sync_version = existing.last_sync_version;
            saved.last_sync_time = existing.last_sync_time;
        }
        state.tenants.insert(saved.company_code.clone(), saved);
        Ok(())
    }

    fn remove_tenant(&self, company_code: &str) -> Result<bool, DbError> {
        Ok(lock(&self.state).tenants.remove(company_code).is_some())
    }

    fn upstream_credential(&self) -> Result<Option<UpstreamCredential>, DbError> {
        Ok(lock(&self.state).credential.clone())
    }

    fn save_upstream_credential(&self, credential: &UpstreamCredential) -> Result<(), DbError> {
        lock(&self.state).credential = Some(credential.clone());
        Ok(())
    }

    fn advance_watermark(&self, company_code: &str, version: i64, at: NaiveDateTime) -> Result<(), DbError> {
        let mut state = lock(&self.state);
        let tenant = state
            .tenants
            .get_mut(company_code)
            .ok_or_else(|| DbError::Query(format!("unknown tenant {company_code}")))?;
        tenant.last_sync_version = Some(tenant.last_sync_version.unwrap_or(0).max(version));
        tenant.last_sync_time = Some(at);
        Ok(())
    }

    fn append_operation_log(&self, entry: &OperationLogEntry) -> Result<(), DbError> {
        lock(&self.state).log.push(entry.clone());
        Ok(())
    }

    fn operation_log(&self, limit: usize) -> Result<Vec<OperationLogEntry>, DbError> {
        Ok(lock(&self.state).log.iter().rev().take(limit).cloned().collect())
    }

    fn try_lock_tenant(&self, company_code: &str) -> Result<bool, DbError> {
        Ok(lock(&self.state).locked.insert(company_code.to_string()))
    }

    fn unlock_tenant(&self, company_code: &str) -> Result<(), DbError> {
        lock(&self.state).locked.remove(company_code);
        Ok(())
    }
}

// Upstream

#[derive(Debug, Clone)]
struct UpstreamTable {
    columns: Vec<UpstreamColumn>,
    key: Vec<String>,
    /// Rows with the version of their last change.
    rows: Vec<(i64, UpstreamRow)>,
    min_valid: i64,
}

#[derive(Debug, Clone, Default)]
struct UpstreamDatabase {
    version: i64,
    change_tracking: bool,
    tables: BTreeMap<String, UpstreamTable>,
}

#[derive(Debug, Default)]
struct UpstreamState {
    databases: HashMap<String, UpstreamDatabase>,
    unreachable: Option<String>,
    connections: usize,
}

/// Upstream ERP server with change tracking, kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryUpstream {
    state: Arc<Mutex<UpstreamState>>,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `table` in `database` (with change tracking on). `key` names
    /// the columns rows are matched on when they change.
    pub fn create_table(&self, database: &str, table: &str, columns: Vec<UpstreamColumn>, key: &[&str]) {
        let mut state = lock(&self.state);
        let db = state
            .databases
            .entry(database.to_string())
            .or_insert_with(|| UpstreamDatabase {
                change_tracking: true,
                ..UpstreamDatabase::default()
            });
        db.tables.insert(
            table.to_string(),
            UpstreamTable {
                columns,
                key: key.iter().map(|k| (*k).to_string()).collect(),
                rows: Vec::new(),
                min_valid: 0,
            },
        );
    }

    /// Insert a row, or replace the row with the same key, as one change.
    ///
    /// # Panics
    ///
    /// When the table does not exist.
    pub fn upsert(&self, database: &str, table: &str, values: Vec<UpstreamValue>) {
        let mut state = lock(&self.state);
        let db = state
            .databases
            .get_mut(database)
            .unwrap_or_else(|| panic!("no upstream database {database}"));
        db.version += 1;
        let version = db.version;
        let t = db
            .tables
            .get_mut(table)
            .unwrap_or_else(|| panic!("no upstream table {table}"));
        let positions: Vec<usize> = t
            .key
            .iter()
            .filter_map(|k| t.columns.iter().position(|c| c.name == *k))
            .collect();
        let same_key = |row: &UpstreamRow| {
            !positions.is_empty() && positions.iter().all(|&i| row.values.get(i) == values.get(i))
        };
        match t.rows.iter_mut().find(|(_, row)| same_key(row)) {
            Some(existing) => *existing = (version, UpstreamRow::new(values)),
            None => t.rows.push((version, UpstreamRow::new(values))),
        }
    }

    /// Purge change history of `table` up to `min_valid`.
    pub fn purge_changes(&self, database: &str, table: &str, min_valid: i64) {
        if let Some(t) = lock(&self.state)
            .databases
            .get_mut(database)
            .and_then(|db| db.tables.get_mut(table))
        {
            t.min_valid = min_valid;
        }
    }

    pub fn disable_change_tracking(&self, database: &str) {
        if let Some(db) = lock(&self.state).databases.get_mut(database) {
            db.change_tracking = false;
        }
    }

    pub fn version(&self, database: &str) -> i64 {
        lock(&self.state).databases.get(database).map_or(0, |db| db.version)
    }

    pub fn row_count(&self, database: &str, table: &str) -> usize {
        lock(&self.state)
            .databases
            .get(database)
            .and_then(|db| db.tables.get(table))
            .map_or(0, |t| t.rows.len())
    }

    /// Make every connect fail with `reason`, or succeed again with `None`.
    pub fn set_unreachable(&self, reason: Option<&str>) {
        lock(&self.state).unreachable = reason.map(str::to_string);
    }

    pub fn connections(&self) -> usize {
        lock(&self.state).connections
    }
}

impl UpstreamConnector for MemoryUpstream {
    fn connect(
        &self,
        _credential: &UpstreamCredential,
        database: &str,
    ) -> Result<Box<dyn UpstreamSession>, UpstreamError> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.unreachable {
            return Err(UpstreamError::Connect(reason.clone()));
        }
        if !state.databases.contains_key(database) {
            return Err(UpstreamError::Connect(format!("cannot open database \"{database}\"")));
        }
        state.connections += 1;
        Ok(Box::new(MemoryUpstreamSession {
            state: Arc::clone(&self.state),
            database: database.to_string(),
        }))
    }
}

struct MemoryUpstreamSession {
    state: Arc<Mutex<UpstreamState>>,
    database: String,
}

impl MemoryUpstreamSession {
    fn rows(
        &self,
        table: &str,
        columns: &[UpstreamColumn],
        after: Option<i64>,
    ) -> Result<Vec<UpstreamRow>, UpstreamError> {
        let state = lock(&self.state);
        let t = state
            .databases
            .get(&self.database)
            .and_then(|db| db.tables.get(table))
            .ok_or_else(|| UpstreamError::Query(format!("invalid object name '{table}'")))?;
        let positions: Vec<Option<usize>> = columns
            .iter()
            .map(|c| t.columns.iter().position(|u| u.name == c.name))
            .collect();
        Ok(t.rows
            .iter()
            .filter(|(version, _)| after.map_or(true, |from| *version > from))
            .map(|(_, row)| {
                UpstreamRow::new(
                    positions
                        .iter()
                        .map(|p| p.and_then(|i| row.values.get(i).cloned()).unwrap_or(UpstreamValue::Null))
                        .collect(),
                )
            })
            .collect())
    }
}

impl UpstreamSession for MemoryUpstreamSession {
    fn current_version(&mut self) -> Result<Option<i64>, UpstreamError> {
        let state = lock(&self.state);
        Ok(state
            .databases
            .get(&self.database)
            .filter(|db| db.change_tracking)
            .map(|db| db.version))
    }

    fn min_valid_version(&mut self, table: &str) -> Result<Option<i64>, UpstreamError> {
        let state = lock(&self.state);
        Ok(state
            .databases
            .get(&self.database)
            .filter(|db| db.change_tracking)
            .and_then(|db| db.tables.get(table))
            .map(|t| t.min_valid))
    }

    fn columns(&mut self, table: &str) -> Result<Vec<UpstreamColumn>, UpstreamError> {
        let state = lock(&self.state);
        Ok(state
            .databases
            .get(&self.database)
            .and_then(|db| db.tables.get(table))
            .map(|t| t.columns.clone())
            .unwrap_or_default())
    }

    fn select_all(&mut self, table: &str, columns: &[UpstreamColumn]) -> Result<Vec<UpstreamRow>, UpstreamError> {
        self.rows(table, columns, None)
    }

    fn select_changed(
        &mut self,
        table: &str,
        columns: &[UpstreamColumn],
        key: &[String],
        from_version: i64,
    ) -> Result<Vec<UpstreamRow>, UpstreamError> {
        if key.is_empty() {
            return self.rows(table, columns, None);
        }
        self.rows(table, columns, Some(from_version))
    }
}

// Replica

#[derive(Debug, Clone, Default)]
struct ReplicaTable {
    columns: Vec<String>,
    rows: BTreeMap<i32, HashMap<String, LocalValue>>,
    next_row_id: i32,
}

type ReplicaDatabase = BTreeMap<String, ReplicaTable>;

#[derive(Debug, Default)]
struct ReplicaState {
    databases: HashMap<String, ReplicaDatabase>,
    rejected_text: HashSet<String>,
    unavailable: Option<String>,
}

/// Local replica databases kept in memory, created on first open.
#[derive(Debug, Clone, Default)]
pub struct MemoryReplicaConnector {
    state: Arc<Mutex<ReplicaState>>,
}

impl MemoryReplicaConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes of any row holding this text value fail.
    pub fn reject_text(&self, value: &str) {
        lock(&self.state).rejected_text.insert(value.to_string());
    }

    pub fn set_unavailable(&self, reason: Option<&str>) {
        lock(&self.state).unavailable = reason.map(str::to_string);
    }

    /// A table as an older release created it, without audit columns.
    pub fn create_bare_table(&self, database: &str, table: &str, columns: &[&str]) {
        lock(&self.state).databases.entry(database.to_string()).or_default().insert(
            table.to_string(),
            ReplicaTable {
                columns: columns.iter().map(|c| (*c).to_string()).collect(),
                ..ReplicaTable::default()
            },
        );
    }

    pub fn columns(&self, database: &str, table: &str) -> Vec<String> {
        lock(&self.state)
            .databases
            .get(database)
            .and_then(|db| db.get(table))
            .map(|t| t.columns.clone())
            .unwrap_or_default()
    }

    pub fn row_count(&self, database: &str, table: &str) -> usize {
        lock(&self.state)
            .databases
            .get(database)
            .and_then(|db| db.get(table))
            .map_or(0, |t| t.rows.len())
    }

    /// Rows in `row_id` order.
    pub fn rows(&self, database: &str, table: &str) -> Vec<HashMap<String, LocalValue>> {
        lock(&self.state)
            .databases
            .get(database)
            .and_then(|db| db.get(table))
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl ReplicaConnector for MemoryReplicaConnector {
    fn open(&self, tenant: &Tenant) -> Result<Box<dyn ReplicaSession>, DbError> {
        let mut state = lock(&self.state);
        if let Some(reason) = &state.unavailable {
            return Err(DbError::Other(reason.clone()));
        }
        state.databases.entry(tenant.local_database.clone()).or_default();
        Ok(Box::new(MemoryReplicaSession {
            state: Arc::clone(&self.state),
            database: tenant.local_database.clone(),
            snapshots: Snapshots::new(),
        }))
    }
}

struct MemoryReplicaSession {
    state: Arc<Mutex<ReplicaState>>,
    database: String,
    snapshots: Snapshots<ReplicaDatabase>,
}

impl MemoryReplicaSession {
    fn with_db<T>(&mut self, f: impl FnOnce(&mut ReplicaDatabase, &HashSet<String>) -> Result<T, DbError>) -> Result<T, DbError> {
        let mut state = lock(&self.state);
        let state = &mut *state;
        let db = state.databases.entry(self.database.clone()).or_default();
        f(db, &state.rejected_text)
    }

    fn with_snapshots(
        &mut self,
        f: impl FnOnce(&mut Snapshots<ReplicaDatabase>, &mut ReplicaDatabase) -> Result<(), DbError>,
    ) -> Result<(), DbError> {
        let mut state = lock(&self.state);
        let db = state.databases.entry(self.database.clone()).or_default();
        f(&mut self.snapshots, db)
    }
}

fn table_mut<'a>(db: &'a mut ReplicaDatabase, table: &str) -> Result<&'a mut ReplicaTable, DbError> {
    db.get_mut(table)
        .ok_or_else(|| DbError::Query(format!("relation \"{table}\" does not exist")))
}

fn check_values(
    table: &ReplicaTable,
    name: &str,
    columns: &[String],
    values: &[LocalValue],
    rejected: &HashSet<String>,
) -> Result<(), DbError> {
    if columns.len() != values.len() {
        return Err(DbError::Query(format!("{name}: {} columns, {} values", columns.len(), values.len())));
    }
    if let Some(missing) = columns.iter().find(|c| !table.columns.contains(c)) {
        return Err(DbError::Query(format!("column \"{missing}\" of relation \"{name}\" does not exist")));
    }
    if let Some(bad) = values.iter().filter_map(LocalValue::as_text).find(|t| rejected.contains(*t)) {
        return Err(DbError::Query(format!("value '{bad}' rejected by {name}")));
    }
    Ok(())
}

impl ReplicaSession for MemoryReplicaSession {
    fn table_exists(&mut self, table: &str) -> Result<bool, DbError> {
        self.with_db(|db, _| Ok(db.contains_key(table)))
    }

    fn column_names(&mut self, table: &str) -> Result<Vec<String>, DbError> {
        self.with_db(|db, _| Ok(db.get(table).map(|t| t.columns.clone()).unwrap_or_default()))
    }

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), DbError> {
        self.with_db(|db, _| {
            db.entry(spec.name.clone()).or_insert_with(|| ReplicaTable {
                columns: std::iter::once(ROW_ID.to_string())
                    .chain(spec.column_names().map(str::to_string))
                    .chain(std::iter::once(UPDATED_AT.to_string()))
                    .collect(),
                ..ReplicaTable::default()
            });
            Ok(())
        })
    }

    fn drop_table(&mut self, table: &str) -> Result<(), DbError> {
        self.with_db(|db, _| {
            db.remove(table);
            Ok(())
        })
    }

    fn add_audit_column(&mut self, table: &str, column: AuditColumn) -> Result<(), DbError> {
        self.with_db(|db, _| {
            let t = table_mut(db, table)?;
            if !t.columns.iter().any(|c| c == column.name()) {
                t.columns.push(column.name().to_string());
            }
            Ok(())
        })
    }

    fn begin(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, db| s.begin(db))
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, _| s.commit())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, db| s.rollback(db))
    }

    fn savepoint(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, db| s.savepoint(db))
    }

    fn release_savepoint(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, _| s.release())
    }

    fn rollback_to_savepoint(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, db| s.rollback_to_savepoint(db))
    }

    fn find_row_id(&mut self, table: &str, key: &[(&str, &LocalValue)]) -> Result<Option<i32>, DbError> {
        self.with_db(|db, _| {
            let t = table_mut(db, table)?;
            Ok(t.rows
                .iter()
                .find(|(_, row)| {
                    key.iter()
                        .all(|(column, value)| row.get(*column).unwrap_or(&LocalValue::Null) == *value)
                })
                .map(|(id, _)| *id))
        })
    }

    fn insert_row(&mut self, table: &str, columns: &[String], values: &[LocalValue]) -> Result<i32, DbError> {
        self.with_db(|db, rejected| {
            let t = table_mut(db, table)?;
            check_values(t, table, columns, values, rejected)?;
            t.next_row_id += 1;
            let row_id = t.next_row_id;
            let mut row: HashMap<String, LocalValue> = columns.iter().cloned().zip(values.iter().cloned()).collect();
            if t.columns.iter().any(|c| c == ROW_ID) {
                row.insert(ROW_ID.to_string(), LocalValue::I32(row_id));
            }
            t.rows.insert(row_id, row);
            Ok(row_id)
        })
    }

    fn update_row(
        &mut self,
        table: &str,
        row_id: i32,
        columns: &[String],
        values: &[LocalValue],
    ) -> Result<u64, DbError> {
        self.with_db(|db, rejected| {
            let t = table_mut(db, table)?;
            check_values(t, table, columns, values, rejected)?;
            let Some(row) = t.rows.get_mut(&row_id) else {
                return Ok(0);
            };
            for (column, value) in columns.iter().zip(values) {
                row.insert(column.clone(), value.clone());
            }
            Ok(1)
        })
    }

    fn count_rows(&mut self, table: &str) -> Result<i64, DbError> {
        self.with_db(|db, _| Ok(table_mut(db, table)?.rows.len() as i64))
    }
}

// Statement capture

/// Executor that records every statement and returns `rows_affected` for
/// each `execute`. Queries that must return rows fail.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    statements: Mutex<Vec<String>>,
    rows_affected: u64,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn affecting(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    /// Statements seen so far, whitespace collapsed.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.statements).clone()
    }

    fn record(&self, query: &str) {
        lock(&self.statements).push(query.split_whitespace().collect::<Vec<_>>().join(" "));
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, query: &str, _params: &[&dyn ToSql]) -> Result<u64, DbError> {
        self.record(query);
        Ok(self.rows_affected)
    }

    fn query_one(&self, query: &str, _params: &[&dyn ToSql]) -> Result<Row, DbError> {
        self.record(query);
        Err(DbError::Other("recording executor returns no rows".to_string()))
    }

    fn query_all(&self, query: &str, _params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        self.record(query);
        Ok(Vec::new())
    }
}

// Shop-floor records

/// Everything a [`MemoryMesStore`] holds. Fields are public so tests can
/// seed and inspect records directly.
#[derive(Debug, Clone, Default)]
pub struct MesData {
    /// (company_code, company_name) pairs of the tenant registry.
    pub tenants: Vec<(String, String)>,
    pub work_orders: Vec<WorkOrder>,
    pub processes: Vec<WorkOrderProcess>,
    pub assignments: Vec<Assignment>,
    pub production_records: Vec<ProductionRecord>,
    pub dispatches: Vec<Dispatch>,
    pub dispatch_processes: Vec<DispatchProcess>,
    pub reports: Vec<Report>,
    pub onsite_reports: Vec<OnsiteReport>,
    pub routes: HashMap<String, Vec<String>>,
    pub findings: Vec<Finding>,
    pub completed: Vec<CompletedWorkOrder>,
    pub completed_processes: Vec<CompletedProcess>,
    /// (work_order_id, company_code) of analysis rows.
    pub analysis: Vec<(i64, String)>,
    /// Report ids whose patches fail.
    pub failing_patches: HashSet<i64>,
    /// Dispatch ids whose row lock times out.
    pub locked_dispatches: HashSet<i64>,
    next_id: i64,
}

impl MesData {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Shop-floor store kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryMesStore {
    data: Arc<Mutex<MesData>>,
}

impl MemoryMesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenants<C: Into<String>, N: Into<String>>(pairs: impl IntoIterator<Item = (C, N)>) -> Self {
        let store = Self::new();
        lock(&store.data).tenants = pairs.into_iter().map(|(c, n)| (c.into(), n.into())).collect();
        store
    }

    /// Copy of the current data.
    pub fn snapshot(&self) -> MesData {
        lock(&self.data).clone()
    }

    /// Change the data outside any session.
    pub fn update<T>(&self, f: impl FnOnce(&mut MesData) -> T) -> T {
        f(&mut lock(&self.data))
    }
}

impl MesStore for MemoryMesStore {
    fn open(&self) -> Result<Box<dyn MesSession>, DbError> {
        Ok(Box::new(MemoryMesSession {
            data: Arc::clone(&self.data),
            snapshots: Snapshots::new(),
        }))
    }
}

struct MemoryMesSession {
    data: Arc<Mutex<MesData>>,
    snapshots: Snapshots<MesData>,
}

impl MemoryMesSession {
    fn read<T>(&self, f: impl FnOnce(&MesData) -> T) -> Result<T, DbError> {
        Ok(f(&lock(&self.data)))
    }

    fn write<T>(&mut self, f: impl FnOnce(&mut MesData) -> Result<T, DbError>) -> Result<T, DbError> {
        f(&mut lock(&self.data))
    }

    fn with_snapshots(
        &mut self,
        f: impl FnOnce(&mut Snapshots<MesData>, &mut MesData) -> Result<(), DbError>,
    ) -> Result<(), DbError> {
        let mut data = lock(&self.data);
        f(&mut self.snapshots, &mut data)
    }
}

fn duplicate(table: &str, identity: &OrderIdentity) -> DbError {
    DbError::Query(format!("duplicate key value violates unique constraint on {table}: {identity}"))
}

fn count(n: usize) -> u64 {
    n as u64
}

impl MesSession for MemoryMesSession {
    fn begin(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, d| s.begin(d))
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, _| s.commit())
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, d| s.rollback(d))
    }

    fn savepoint(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, d| s.savepoint(d))
    }

    fn release_savepoint(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, _| s.release())
    }

    fn rollback_to_savepoint(&mut self) -> Result<(), DbError> {
        self.with_snapshots(|s, d| s.rollback_to_savepoint(d))
    }

    fn tenant_directory(&mut self) -> Result<TenantDirectory, DbError> {
        self.read(|d| TenantDirectory::from_pairs(d.tenants.clone()))
    }

    fn work_orders(&mut self) -> Result<Vec<WorkOrder>, DbError> {
        self.read(|d| d.work_orders.clone())
    }

    fn work_order_for(&mut self, identity: &OrderIdentity) -> Result<Option<WorkOrder>, DbError> {
        self.read(|d| d.work_orders.iter().find(|w| w.identity == *identity).cloned())
    }

    fn insert_work_order(&mut self, work_order: &WorkOrder) -> Result<i64, DbError> {
        self.write(|d| {
            if d.work_orders.iter().any(|w| w.identity == work_order.identity) {
                return Err(duplicate("work_orders", &work_order.identity));
            }
            let id = d.next_id();
            d.work_orders.push(WorkOrder {
                id,
                ..work_order.clone()
            });
            Ok(id)
        })
    }

    fn set_work_order_status(
        &mut self,
        id: i64,
        status: WorkOrderStatus,
        completed_at: Option<NaiveDateTime>,
    ) -> Result<(), DbError> {
        self.write(|d| {
            if let Some(w) = d.work_orders.iter_mut().find(|w| w.id == id) {
                w.status = status;
                w.completed_at = completed_at;
            }
            Ok(())
        })
    }

    fn reopen_work_order(&mut self, id: i64, planned_quantity: i64) -> Result<(), DbError> {
        self.write(|d| {
            if let Some(w) = d.work_orders.iter_mut().find(|w| w.id == id) {
                w.status = WorkOrderStatus::InProgress;
                w.completed_at = None;
                w.planned_quantity = planned_quantity;
            }
            Ok(())
        })
    }

    fn delete_work_order(&mut self, id: i64) -> Result<u64, DbError> {
        self.write(|d| {
            let before = d.work_orders.len();
            d.work_orders.retain(|w| w.id != id);
            d.processes.retain(|p| p.work_order_id != id);
            d.assignments.retain(|a| a.work_order_id != id);
            d.production_records.retain(|r| r.work_order_id != id);
            Ok(count(before - d.work_orders.len()))
        })
    }

    fn processes_for(&mut self, work_order_id: i64) -> Result<Vec<WorkOrderProcess>, DbError> {
        self.read(|d| {
            let mut found: Vec<WorkOrderProcess> = d
                .processes
                .iter()
                .filter(|p| p.work_order_id == work_order_id)
                .cloned()
                .collect();
            found.sort_by_key(|p| (p.sequence, p.id));
            found
        })
    }

    fn insert_process(&mut self, process: &WorkOrderProcess) -> Result<i64, DbError> {
        self.write(|d| {
            let id = d.next_id();
            d.processes.push(WorkOrderProcess {
                id,
                ..process.clone()
            });
            Ok(id)
        })
    }

    fn reopen_process(&mut self, id: i64) -> Result<(), DbError> {
        self.write(|d| {
            if let Some(p) = d.processes.iter_mut().find(|p| p.id == id) {
                p.status = ProcessStatus::InProgress;
                p.end_date = None;
            }
            Ok(())
        })
    }

    fn assignments_for(&mut self, work_order_id: i64) -> Result<Vec<Assignment>, DbError> {
        self.read(|d| {
            d.assignments
                .iter()
                .filter(|a| a.work_order_id == work_order_id)
                .cloned()
                .collect()
        })
    }

    fn insert_assignment(&mut self, assignment: &Assignment) -> Result<i64, DbError> {
        self.write(|d| {
            let id = d.next_id();
            d.assignments.push(Assignment {
                id,
                ..assignment.clone()
            });
            Ok(id)
        })
    }

    fn production_record(&mut self, work_order_id: i64) -> Result<Option<ProductionRecord>, DbError> {
        self.read(|d| {
            d.production_records
                .iter()
                .find(|r| r.work_order_id == work_order_id)
                .cloned()
        })
    }

    fn save_production_record(&mut self, record: &ProductionRecord) -> Result<(), DbError> {
        self.write(|d| {
            d.production_records.retain(|r| r.work_order_id != record.work_order_id);
            d.production_records.push(record.clone());
            Ok(())
        })
    }

    fn dispatches(&mut self) -> Result<Vec<Dispatch>, DbError> {
        self.read(|d| d.dispatches.clone())
    }

    fn dispatch(&mut self, id: i64) -> Result<Option<Dispatch>, DbError> {
        self.read(|d| d.dispatches.iter().find(|x| x.id == id).cloned())
    }

    fn lock_dispatch(&mut self, id: i64, _wait: Duration) -> Result<Option<Dispatch>, DbError> {
        if !self.snapshots.in_transaction() {
            return Err(DbError::Other("row lock outside a transaction".to_string()));
        }
        self.read(|d| {
            if d.locked_dispatches.contains(&id) {
                return Err(DbError::LockTimeout(format!("dispatch {id}")));
            }
            Ok(d.dispatches.iter().find(|x| x.id == id).cloned())
        })?
    }

    fn dispatch_for(&mut self, identity: &OrderIdentity) -> Result<Option<Dispatch>, DbError> {
        self.read(|d| d.dispatches.iter().find(|x| x.identity == *identity).cloned())
    }

    fn dispatch_ids_by_status(&mut self, status: DispatchStatus) -> Result<Vec<i64>, DbError> {
        self.read(|d| d.dispatches.iter().filter(|x| x.status == status).map(|x| x.id).collect())
    }

    fn insert_dispatch(&mut self, dispatch: &Dispatch) -> Result<i64, DbError> {
        self.write(|d| {
            if d.dispatches.iter().any(|x| x.identity == dispatch.identity) {
                return Err(duplicate("dispatches", &dispatch.identity));
            }
            let id = d.next_id();
            let mut saved = Dispatch {
                id,
                ..dispatch.clone()
            };
            if saved.stats_updated_at.is_none() {
                saved.stats = DispatchStatistics::default();
            }
            d.dispatches.push(saved);
            Ok(id)
        })
    }

    fn set_dispatch_status(&mut self, id: i64, status: DispatchStatus) -> Result<(), DbError> {
        self.write(|d| {
            if let Some(x) = d.dispatches.iter_mut().find(|x| x.id == id) {
                x.status = status;
            }
            Ok(())
        })
    }

    fn write_dispatch_statistics(
        &mut self,
        id: i64,
        stats: &DispatchStatistics,
        status: DispatchStatus,
        at: NaiveDateTime,
    ) -> Result<(), DbError> {
        self.write(|d| {
            let x = d
                .dispatches
                .iter_mut()
                .find(|x| x.id == id)
                .ok_or_else(|| DbError::Query(format!("dispatch {id} vanished")))?;
            x.stats = stats.clone();
            x.status = status;
            x.stats_updated_at = Some(at);
            Ok(())
        })
    }

    fn dispatch_processes(&mut self, dispatch_id: i64) -> Result<Vec<DispatchProcess>, DbError> {
        self.read(|d| {
            d.dispatch_processes
                .iter()
                .filter(|p| p.dispatch_id == dispatch_id)
                .cloned()
                .collect()
        })
    }

    fn insert_dispatch_process(&mut self, process: &DispatchProcess) -> Result<i64, DbError> {
        self.write(|d| {
            let id = d.next_id();
            d.dispatch_processes.push(DispatchProcess {
                id,
                ..process.clone()
            });
            Ok(id)
        })
    }

    fn reopen_dispatch_process(&mut self, id: i64) -> Result<(), DbError> {
        self.write(|d| {
            if let Some(p) = d.dispatch_processes.iter_mut().find(|p| p.id == id) {
                p.status = ProcessStatus::InProgress;
                p.end_date = None;
            }
            Ok(())
        })
    }

    fn reports(&mut self) -> Result<Vec<Report>, DbError> {
        self.read(|d| d.reports.clone())
    }

    fn report(&mut self, id: i64) -> Result<Option<Report>, DbError> {
        self.read(|d| d.reports.iter().find(|r| r.id == id).cloned())
    }

    fn reports_for(&mut self, order_number: &str, product_code: &str) -> Result<Vec<Report>, DbError> {
        self.read(|d| {
            d.reports
                .iter()
                .filter(|r| r.order_number == order_number && r.product_code == product_code)
                .cloned()
                .collect()
        })
    }

    fn insert_report(&mut self, report: &Report) -> Result<i64, DbError> {
        self.write(|d| {
            let id = d.next_id();
            d.reports.push(Report {
                id,
                ..report.clone()
            });
            Ok(id)
        })
    }

    fn patch_report(&mut self, id: i64, patch: &ReportPatch, at: NaiveDateTime) -> Result<u64, DbError> {
        self.write(|d| {
            if d.failing_patches.contains(&id) {
                return Err(DbError::Query(format!("report {id} is locked for editing")));
            }
            let Some(report) = d.reports.iter_mut().find(|r| r.id == id) else {
                return Ok(0);
            };
            patch.apply(report);
            report.updated_at = at;
            Ok(1)
        })
    }

    fn set_report_approval(
        &mut self,
        id: i64,
        approval: ApprovalStatus,
        approved_by: Option<&str>,
        approved_at: Option<NaiveDateTime>,
    ) -> Result<u64, DbError> {
        self.write(|d| {
            let Some(report) = d.reports.iter_mut().find(|r| r.id == id) else {
                return Ok(0);
            };
            report.approval = approval;
            report.approved_by = approved_by.map(str::to_string);
            report.approved_at = approved_at;
            Ok(1)
        })
    }

    fn set_report_completed(&mut self, id: i64, completed: bool) -> Result<u64, DbError> {
        self.write(|d| {
            let Some(report) = d.reports.iter_mut().find(|r| r.id == id) else {
                return Ok(0);
            };
            report.is_completed = completed;
            Ok(1)
        })
    }

    fn delete_report(&mut self, id: i64) -> Result<u64, DbError> {
        self.write(|d| {
            let before = d.reports.len();
            d.reports.retain(|r| r.id != id);
            Ok(count(before - d.reports.len()))
        })
    }

    fn onsite_reports_for(&mut self, order_number: &str, product_code: &str) -> Result<Vec<OnsiteReport>, DbError> {
        self.read(|d| {
            d.onsite_reports
                .iter()
                .filter(|r| r.identity.order_number == order_number && r.identity.product_code == product_code)
                .cloned()
                .collect()
        })
    }

    fn insert_onsite_report(&mut self, report: &OnsiteReport) -> Result<i64, DbError> {
        self.write(|d| {
            let id = d.next_id();
            d.onsite_reports.push(OnsiteReport {
                id,
                ..report.clone()
            });
            Ok(id)
        })
    }

    fn set_onsite_status(
        &mut self,
        order_number: &str,
        product_code: &str,
        status: OnsiteStatus,
    ) -> Result<u64, DbError> {
        self.write(|d| {
            let mut updated = 0;
            for r in d
                .onsite_reports
                .iter_mut()
                .filter(|r| r.identity.order_number == order_number && r.identity.product_code == product_code)
            {
                r.status = status;
                updated += 1;
            }
            Ok(updated)
        })
    }

    fn process_route_len(&mut self, product_code: &str) -> Result<i64, DbError> {
        self.read(|d| d.routes.get(product_code).map_or(0, |r| r.len() as i64))
    }

    fn save_process_route(&mut self, product_code: &str, operations: &[String]) -> Result<(), DbError> {
        self.write(|d| {
            d.routes.insert(product_code.to_string(), operations.to_vec());
            Ok(())
        })
    }

    fn clear_findings(&mut self, kind: FindingKind) -> Result<u64, DbError> {
        self.write(|d| {
            let before = d.findings.len();
            d.findings.retain(|f| f.kind != kind);
            Ok(count(before - d.findings.len()))
        })
    }

    fn insert_finding(&mut self, finding: &Finding) -> Result<i64, DbError> {
        self.write(|d| {
            let id = d.next_id();
            d.findings.push(Finding {
                id,
                ..finding.clone()
            });
            Ok(id)
        })
    }

    fn findings(&mut self, kind: Option<FindingKind>) -> Result<Vec<Finding>, DbError> {
        self.read(|d| {
            let mut found: Vec<Finding> = d
                .findings
                .iter()
                .filter(|f| kind.map_or(true, |k| f.kind == k))
                .cloned()
                .collect();
            found.sort_by_key(|f| (f.is_fixed, f.id));
            found
        })
    }

    fn finding(&mut self, id: i64) -> Result<Option<Finding>, DbError> {
        self.read(|d| d.findings.iter().find(|f| f.id == id).cloned())
    }

    fn mark_finding_fixed(&mut self, id: i64, fix: &FixRecord<'_>) -> Result<u64, DbError> {
        self.write(|d| {
            let Some(finding) = d.findings.iter_mut().find(|f| f.id == id) else {
                return Ok(0);
            };
            finding.is_fixed = true;
            finding.fixed_by = Some(fix.fixed_by.to_string());
            finding.fixed_at = Some(fix.fixed_at);
            finding.fix_method = Some(fix.method.to_string());
            Ok(1)
        })
    }

    fn completed_work_order(&mut self, id: i64) -> Result<Option<CompletedWorkOrder>, DbError> {
        self.read(|d| d.completed.iter().find(|c| c.id == id).cloned())
    }

    fn completed_work_order_for(&mut self, identity: &OrderIdentity) -> Result<Option<CompletedWorkOrder>, DbError> {
        self.read(|d| d.completed.iter().rev().find(|c| c.identity == *identity).cloned())
    }

    fn completed_processes(&mut self, completed_id: i64) -> Result<Vec<CompletedProcess>, DbError> {
        self.read(|d| {
            let mut found: Vec<CompletedProcess> = d
                .completed_processes
                .iter()
                .filter(|p| p.completed_work_order_id == completed_id)
                .cloned()
                .collect();
            found.sort_by_key(|p| (p.sequence, p.id));
            found
        })
    }

    fn insert_completed_work_order(
        &mut self,
        completed: &CompletedWorkOrder,
        processes: &[CompletedProcess],
    ) -> Result<i64, DbError> {
        self.write(|d| {
            let id = d.next_id();
            d.completed.push(CompletedWorkOrder {
                id,
                ..completed.clone()
            });
            for process in processes {
                let process_id = d.next_id();
                d.completed_processes.push(CompletedProcess {
                    id: process_id,
                    completed_work_order_id: id,
                    ..process.clone()
                });
            }
            Ok(id)
        })
    }

    fn delete_completed_work_order(&mut self, completed: &CompletedWorkOrder) -> Result<(), DbError> {
        self.write(|d| {
            d.completed_processes.retain(|p| p.completed_work_order_id != completed.id);
            d.analysis.retain(|(work_order_id, code)| {
                !(*work_order_id == completed.work_order_id && *code == completed.identity.company_code)
            });
            d.completed.retain(|c| c.id != completed.id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_rollback_keeps_earlier_writes() {
        let store = MemoryMesStore::new();
        let mut session = store.open().unwrap();
        session.begin().unwrap();
        session.save_process_route("P1", &["cutting".to_string()]).unwrap();
        session.savepoint().unwrap();
        session.save_process_route("P2", &["cutting".to_string()]).unwrap();
        session.rollback_to_savepoint().unwrap();
        session.commit().unwrap();

        let data = store.snapshot();
        assert!(data.routes.contains_key("P1"));
        assert!(!data.routes.contains_key("P2"));
    }

    #[test]
    fn test_rollback_restores_transaction_start() {
        let store = MemoryMesStore::new();
        let mut session = store.open().unwrap();
        session.begin().unwrap();
        session.save_process_route("P1", &[]).unwrap();
        session.rollback().unwrap();
        assert!(store.snapshot().routes.is_empty());
        assert!(session.commit().is_err());
    }

    #[test]
    fn test_upstream_replaces_row_by_key() {
        let upstream = MemoryUpstream::new();
        upstream.create_table(
            "erp",
            "comCustomer",
            vec![UpstreamColumn::new("ID", "nvarchar"), UpstreamColumn::new("Name", "nvarchar")],
            &["ID"],
        );
        let text = |s: &str| UpstreamValue::Text(s.to_string());
        upstream.upsert("erp", "comCustomer", vec![text("C1"), text("Acme")]);
        upstream.upsert("erp", "comCustomer", vec![text("C1"), text("Acme Ltd")]);
        assert_eq!(upstream.row_count("erp", "comCustomer"), 1);
        assert_eq!(upstream.version("erp"), 2);
    }
}
