//! Storage seam for the shop-floor records.
//!
//! Services hold a [`MesStore`] and open one [`MesSession`] per operation.
//! A session is one local connection; `begin`/`commit`/`rollback` bracket
//! the operation and savepoints isolate single records inside it.

use chrono::NaiveDateTime;
use std::time::Duration;

use crate::executor::DbError;
use crate::mes::model::{
    ApprovalStatus, Assignment, CompletedProcess, CompletedWorkOrder, Dispatch, DispatchProcess, DispatchStatistics,
    DispatchStatus, Finding, FindingKind, OnsiteReport, OnsiteStatus, OrderIdentity, ProductionRecord, Report,
    ReportPatch, WorkOrder, WorkOrderProcess, WorkOrderStatus,
};
use crate::tenant::TenantDirectory;

/// How a finding was dealt with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixRecord<'a> {
    pub fixed_by: &'a str,
    pub fixed_at: NaiveDateTime,
    pub method: &'a str,
}

pub trait MesSession {
    fn begin(&mut self) -> Result<(), DbError>;

    fn commit(&mut self) -> Result<(), DbError>;

    fn rollback(&mut self) -> Result<(), DbError>;

    fn savepoint(&mut self) -> Result<(), DbError>;

    fn release_savepoint(&mut self) -> Result<(), DbError>;

    fn rollback_to_savepoint(&mut self) -> Result<(), DbError>;

    /// Company code and name pairs from the tenant registry.
    fn tenant_directory(&mut self) -> Result<TenantDirectory, DbError>;

    // Work orders

    fn work_orders(&mut self) -> Result<Vec<WorkOrder>, DbError>;

    fn work_order_for(&mut self, identity: &OrderIdentity) -> Result<Option<WorkOrder>, DbError>;

    fn insert_work_order(&mut self, work_order: &WorkOrder) -> Result<i64, DbError>;

    fn set_work_order_status(
        &mut self,
        id: i64,
        status: WorkOrderStatus,
        completed_at: Option<NaiveDateTime>,
    ) -> Result<(), DbError>;

    /// Back to in-progress with the completion time cleared.
    fn reopen_work_order(&mut self, id: i64, planned_quantity: i64) -> Result<(), DbError>;

    /// Delete a work order with its processes, assignments and production record.
    fn delete_work_order(&mut self, id: i64) -> Result<u64, DbError>;

    fn processes_for(&mut self, work_order_id: i64) -> Result<Vec<WorkOrderProcess>, DbError>;

    fn insert_process(&mut self, process: &WorkOrderProcess) -> Result<i64, DbError>;

    /// Status in-progress, end date cleared.
    fn reopen_process(&mut self, id: i64) -> Result<(), DbError>;

    fn assignments_for(&mut self, work_order_id: i64) -> Result<Vec<Assignment>, DbError>;

    fn insert_assignment(&mut self, assignment: &Assignment) -> Result<i64, DbError>;

    fn production_record(&mut self, work_order_id: i64) -> Result<Option<ProductionRecord>, DbError>;

    fn save_production_record(&mut self, record: &ProductionRecord) -> Result<(), DbError>;

    // Dispatches

    fn dispatches(&mut self) -> Result<Vec<Dispatch>, DbError>;

    fn dispatch(&mut self, id: i64) -> Result<Option<Dispatch>, DbError>;

    /// Read the dispatch under a row lock held until the transaction ends,
    /// waiting at most `wait`.
    ///
    /// # Errors
    ///
    /// `DbError::LockTimeout` when the wait runs out.
    fn lock_dispatch(&mut self, id: i64, wait: Duration) -> Result<Option<Dispatch>, DbError>;

    fn dispatch_for(&mut self, identity: &OrderIdentity) -> Result<Option<Dispatch>, DbError>;

    fn dispatch_ids_by_status(&mut self, status: DispatchStatus) -> Result<Vec<i64>, DbError>;

    fn insert_dispatch(&mut self, dispatch: &Dispatch) -> Result<i64, DbError>;

    fn set_dispatch_status(&mut self, id: i64, status: DispatchStatus) -> Result<(), DbError>;

    fn write_dispatch_statistics(
        &mut self,
        id: i64,
        stats: &DispatchStatistics,
        status: DispatchStatus,
        at: NaiveDateTime,
    ) -> Result<(), DbError>;

    fn dispatch_processes(&mut self, dispatch_id: i64) -> Result<Vec<DispatchProcess>, DbError>;

    fn insert_dispatch_process(&mut self, process: &DispatchProcess) -> Result<i64, DbError>;

    fn reopen_dispatch_process(&mut self, id: i64) -> Result<(), DbError>;

    // Reports

    fn reports(&mut self) -> Result<Vec<Report>, DbError>;

    fn report(&mut self, id: i64) -> Result<Option<Report>, DbError>;

    /// Every report naming the order and product, whatever its company.
    fn reports_for(&mut self, order_number: &str, product_code: &str) -> Result<Vec<Report>, DbError>;

    fn insert_report(&mut self, report: &Report) -> Result<i64, DbError>;

    fn patch_report(&mut self, id: i64, patch: &ReportPatch, at: NaiveDateTime) -> Result<u64, DbError>;

    fn set_report_approval(
        &mut self,
        id: i64,
        approval: ApprovalStatus,
        approved_by: Option<&str>,
        approved_at: Option<NaiveDateTime>,
    ) -> Result<u64, DbError>;

    fn set_report_completed(&mut self, id: i64, completed: bool) -> Result<u64, DbError>;

    fn delete_report(&mut self, id: i64) -> Result<u64, DbError>;

    fn onsite_reports_for(&mut self, order_number: &str, product_code: &str) -> Result<Vec<OnsiteReport>, DbError>;

    fn insert_onsite_report(&mut self, report: &OnsiteReport) -> Result<i64, DbError>;

    fn set_onsite_status(
        &mut self,
        order_number: &str,
        product_code: &str,
        status: OnsiteStatus,
    ) -> Result<u64, DbError>;

    /// Number of steps in the product's process route.
    fn process_route_len(&mut self, product_code: &str) -> Result<i64, DbError>;

    fn save_process_route(&mut self, product_code: &str, operations: &[String]) -> Result<(), DbError>;

    // Findings

    fn clear_findings(&mut self, kind: FindingKind) -> Result<u64, DbError>;

    fn insert_finding(&mut self, finding: &Finding) -> Result<i64, DbError>;

    /// Findings of `kind` (all kinds when `None`), unfixed first.
    fn findings(&mut self, kind: Option<FindingKind>) -> Result<Vec<Finding>, DbError>;

    fn finding(&mut self, id: i64) -> Result<Option<Finding>, DbError>;

    fn mark_finding_fixed(&mut self, id: i64, fix: &FixRecord<'_>) -> Result<u64, DbError>;

    // Completed archive

    fn completed_work_order(&mut self, id: i64) -> Result<Option<CompletedWorkOrder>, DbError>;

    fn completed_work_order_for(&mut self, identity: &OrderIdentity) -> Result<Option<CompletedWorkOrder>, DbError>;

    fn completed_processes(&mut self, completed_id: i64) -> Result<Vec<CompletedProcess>, DbError>;

    fn insert_completed_work_order(
        &mut self,
        completed: &CompletedWorkOrder,
        processes: &[CompletedProcess],
    ) -> Result<i64, DbError>;

    /// Delete the archived row, its processes and production reports, and
    /// the analysis rows of the work order.
    fn delete_completed_work_order(&mut self, completed: &CompletedWorkOrder) -> Result<(), DbError>;
}

/// Opens sessions against the registry database.
pub trait MesStore: Send + Sync {
    /// # Errors
    ///
    /// `DbError::Connection` when the database cannot be reached.
    fn open(&self) -> Result<Box<dyn MesSession>, DbError>;
}

/// Run `f` in a transaction on `session`, committing on success and rolling
/// back on any error.
///
/// # Errors
///
/// The error from `f`, or from begin/commit.
pub fn in_transaction<T, E>(
    session: &mut dyn MesSession,
    f: impl FnOnce(&mut dyn MesSession) -> Result<T, E>,
) -> Result<T, E>
where
    E: From<DbError>,
{
    session.begin()?;
    match f(session) {
        Ok(value) => {
            session.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = session.rollback() {
                log::warn!("rollback after failed operation also failed: {rollback}");
            }
            Err(e)
        }
    }
}

