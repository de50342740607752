//! Dispatch statistics.
//!
//! A recomputation reads every report naming the dispatch's order and
//! product, keeps the ones whose company resolves to the dispatch's company,
//! and rewrites the dispatch rollups in one transaction. The work order's
//! status follows the result: completed once packaging covers the plan,
//! in progress while anything has been produced, pending otherwise.
//!
//! Recomputations of one dispatch are serialized twice over: an in-process
//! [`DispatchLocks`] entry and a `FOR UPDATE` row lock with a bounded wait,
//! so two engines sharing a database still take turns.

use chrono::{Local, NaiveDateTime};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use may::sync::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

use crate::config::StatisticsConfig;
use crate::executor::DbError;
use crate::mes::model::{
    ApprovalStatus, Dispatch, DispatchStatistics, DispatchStatus, OnsiteReport, OnsiteStatus, OrderIdentity, Report,
    WorkOrderStatus,
};
use crate::mes::store::{in_transaction, MesSession, MesStore};
use crate::tenant::TenantDirectory;

#[derive(Debug)]
pub enum StatsError {
    DispatchNotFound(i64),
    /// The dispatch stayed locked by another recomputation for the whole wait.
    LockTimeout(i64),
    Store(DbError),
}

impl fmt::Display for StatsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatsError::DispatchNotFound(id) => write!(f, "Dispatch {id} does not exist"),
            StatsError::LockTimeout(id) => write!(f, "Timed out waiting for the lock on dispatch {id}"),
            StatsError::Store(e) => write!(f, "Dispatch statistics failed: {e}"),
        }
    }
}

impl std::error::Error for StatsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatsError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for StatsError {
    fn from(e: DbError) -> Self {
        StatsError::Store(e)
    }
}

/// In-process set of dispatches being recomputed.
///
/// Built on may's primitives, so a coroutine waiting for a dispatch parks
/// only itself and not the worker thread it runs on.
pub struct DispatchLocks {
    held: Mutex<HashSet<i64>>,
    released: Condvar,
}

impl Default for DispatchLocks {
    fn default() -> Self {
        Self {
            held: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }
}

/// Holds one dispatch until dropped.
pub struct DispatchLockGuard<'a> {
    locks: &'a DispatchLocks,
    dispatch_id: i64,
}

impl DispatchLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `wait` for `dispatch_id` to be free, then hold it.
    ///
    /// # Errors
    ///
    /// `StatsError::LockTimeout` when the wait runs out.
    pub fn acquire(&self, dispatch_id: i64, wait: Duration) -> Result<DispatchLockGuard<'_>, StatsError> {
        let deadline = Instant::now() + wait;
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while held.contains(&dispatch_id) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StatsError::LockTimeout(dispatch_id));
            }
            held = match self.released.wait_timeout(held, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        held.insert(dispatch_id);
        Ok(DispatchLockGuard {
            locks: self,
            dispatch_id,
        })
    }

    pub fn is_held(&self, dispatch_id: i64) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&dispatch_id))
            .unwrap_or(false)
    }
}

impl Drop for DispatchLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.dispatch_id);
        drop(held);
        self.locks.released.notify_all();
    }
}

/// Whether `report` belongs to the dispatch of `company_code`.
///
/// The report's own company code wins when present; otherwise its company
/// name must resolve through the directory. Unresolvable reports belong to
/// no dispatch.
pub fn report_in_scope(report: &Report, company_code: &str, directory: &TenantDirectory) -> bool {
    directory
        .resolve(report.company_code.as_deref(), &report.company_name)
        .is_some_and(|code| code == company_code)
}

// Quantities stay far below 2^53.
#[allow(clippy::cast_precision_loss)]
fn percent(quantity: i64, planned: i64) -> f64 {
    if planned > 0 {
        quantity as f64 * 100.0 / planned as f64
    } else {
        0.0
    }
}

/// Rollups for `dispatch` from the reports and on-site reports of its
/// order and product. Out-of-scope rows are ignored here.
pub fn compute_statistics(
    dispatch: &Dispatch,
    directory: &TenantDirectory,
    reports: &[Report],
    onsite: &[OnsiteReport],
    route_len: i64,
    packaging_operation: &str,
) -> DispatchStatistics {
    let company = dispatch.identity.company_code.as_str();
    let scoped: Vec<&Report> = reports
        .iter()
        .filter(|r| {
            r.order_number == dispatch.identity.order_number
                && r.product_code == dispatch.identity.product_code
                && report_in_scope(r, company, directory)
        })
        .collect();
    let approved: Vec<&Report> = scoped
        .iter()
        .copied()
        .filter(|r| r.approval == ApprovalStatus::Approved)
        .collect();

    let mut stats = DispatchStatistics {
        report_count: scoped.len() as i64,
        approved_count: approved.len() as i64,
        pending_count: scoped.iter().filter(|r| r.approval == ApprovalStatus::Pending).count() as i64,
        ..DispatchStatistics::default()
    };

    for r in &approved {
        stats.total_work_hours += r.work_hours;
        stats.total_overtime_hours += r.overtime_hours;
        stats.total_good_quantity += r.produced_quantity;
        stats.total_defect_quantity += r.defect_quantity;
        if r.operation == packaging_operation {
            stats.packaging_good_quantity += r.produced_quantity;
            stats.packaging_defect_quantity += r.defect_quantity;
        }
    }
    stats.total_all_hours = stats.total_work_hours + stats.total_overtime_hours;
    stats.total_quantity = stats.total_good_quantity + stats.total_defect_quantity;
    stats.last_fillwork_update = approved.iter().map(|r| r.updated_at).max();

    let scoped_onsite: Vec<&OnsiteReport> = onsite.iter().filter(|o| o.identity == dispatch.identity).collect();
    for o in &scoped_onsite {
        if o.status == OnsiteStatus::Completed && o.operation == packaging_operation {
            stats.packaging_good_quantity += o.produced_quantity;
            stats.packaging_defect_quantity += o.defect_quantity;
        }
    }
    stats.packaging_total_quantity = stats.packaging_good_quantity + stats.packaging_defect_quantity;
    stats.onsite_report_count = scoped_onsite.len() as i64;
    stats.onsite_completed_count = scoped_onsite
        .iter()
        .filter(|o| o.status == OnsiteStatus::Completed)
        .count() as i64;
    stats.last_onsite_update = scoped_onsite.iter().map(|o| o.updated_at).max();

    let operations: BTreeSet<&str> = approved.iter().map(|r| r.operation.as_str()).collect();
    stats.total_processes = route_len;
    stats.completed_processes = operations.len() as i64;
    stats.pending_processes = (route_len - stats.completed_processes).max(0);

    let planned = dispatch.planned_quantity;
    stats.completion_rate = percent(stats.total_quantity, planned);
    stats.packaging_completion_rate = percent(stats.packaging_total_quantity, planned);
    stats.can_complete = planned > 0 && stats.packaging_total_quantity >= planned;
    stats.completion_threshold_met = stats.can_complete;

    stats
}

/// Work order status after a recomputation, and its completion time.
/// `None` when nothing changes. A completion time already set is kept.
pub fn next_work_order_status(
    status: WorkOrderStatus,
    completed_at: Option<NaiveDateTime>,
    stats: &DispatchStatistics,
    now: NaiveDateTime,
) -> Option<(WorkOrderStatus, Option<NaiveDateTime>)> {
    if stats.can_complete {
        if status == WorkOrderStatus::Completed {
            return None;
        }
        return Some((WorkOrderStatus::Completed, Some(completed_at.unwrap_or(now))));
    }
    match status {
        WorkOrderStatus::Pending if stats.total_quantity > 0 => Some((WorkOrderStatus::InProgress, completed_at)),
        WorkOrderStatus::InProgress if stats.total_quantity == 0 => Some((WorkOrderStatus::Pending, completed_at)),
        _ => None,
    }
}

/// Dispatch status that goes with the work order's.
pub fn dispatch_status_for(current: DispatchStatus, work_order: Option<WorkOrderStatus>, stats: &DispatchStatistics) -> DispatchStatus {
    match work_order {
        Some(WorkOrderStatus::Completed) => DispatchStatus::Completed,
        _ if stats.total_quantity > 0 => DispatchStatus::InProduction,
        _ => current,
    }
}

/// What one recomputation wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct Recomputation {
    pub dispatch_id: i64,
    pub identity: OrderIdentity,
    pub stats: DispatchStatistics,
    pub dispatch_status: DispatchStatus,
    /// Work order transition, when one happened.
    pub work_order_transition: Option<(WorkOrderStatus, WorkOrderStatus)>,
}

/// Totals from [`StatisticsEngine::recompute_all_in_production`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub updated: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct StatisticsEngine {
    store: Arc<dyn MesStore>,
    locks: Arc<DispatchLocks>,
    packaging_operation: String,
    lock_timeout: Duration,
}

impl StatisticsEngine {
    pub fn new(store: Arc<dyn MesStore>, config: &StatisticsConfig) -> Self {
        Self {
            store,
            locks: Arc::new(DispatchLocks::new()),
            packaging_operation: config.packaging_operation.clone(),
            lock_timeout: config.lock_timeout(),
        }
    }

    pub fn store(&self) -> &Arc<dyn MesStore> {
        &self.store
    }

    pub fn locks(&self) -> &DispatchLocks {
        &self.locks
    }

    /// Recompute one dispatch and propagate the work order status.
    ///
    /// # Errors
    ///
    /// `DispatchNotFound`, `LockTimeout`, or `Store`. On error nothing is
    /// written.
    pub fn recompute(&self, dispatch_id: i64) -> Result<Recomputation, StatsError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::recompute_span(dispatch_id).entered();

        let result = self.recompute_locked(dispatch_id);

        #[cfg(feature = "metrics")]
        METRICS.record_recomputation(match &result {
            Ok(_) => "updated",
            Err(StatsError::LockTimeout(_)) => "lock_timeout",
            Err(_) => "failed",
        });

        match &result {
            Ok(r) => log::debug!(
                "dispatch {} ({}) recomputed: total {}, packaging {}/{}",
                r.dispatch_id,
                r.identity,
                r.stats.total_quantity,
                r.stats.packaging_total_quantity,
                r.stats.can_complete
            ),
            Err(e) => log::error!("dispatch {dispatch_id} recomputation failed: {e}"),
        }
        result
    }

    fn recompute_locked(&self, dispatch_id: i64) -> Result<Recomputation, StatsError> {
        let _guard = self.locks.acquire(dispatch_id, self.lock_timeout)?;
        let mut session = self.store.open()?;
        in_transaction(session.as_mut(), |s| self.recompute_in(s, dispatch_id)).map_err(|e| match e {
            StatsError::Store(db) if db.is_lock_timeout() => StatsError::LockTimeout(dispatch_id),
            other => other,
        })
    }

    /// Recompute inside an open transaction on `session`.
    ///
    /// # Errors
    ///
    /// As [`recompute`](Self::recompute).
    pub fn recompute_in(&self, session: &mut dyn MesSession, dispatch_id: i64) -> Result<Recomputation, StatsError> {
        let dispatch = session
            .lock_dispatch(dispatch_id, self.lock_timeout)?
            .ok_or(StatsError::DispatchNotFound(dispatch_id))?;
        let identity = dispatch.identity.clone();

        let directory = session.tenant_directory()?;
        let reports = session.reports_for(&identity.order_number, &identity.product_code)?;
        let onsite = session.onsite_reports_for(&identity.order_number, &identity.product_code)?;
        let route_len = session.process_route_len(&identity.product_code)?;
        let stats = compute_statistics(&dispatch, &directory, &reports, &onsite, route_len, &self.packaging_operation);

        let now = Local::now().naive_local();
        let mut transition = None;
        let work_order = session.work_order_for(&identity)?;
        let work_order_status = match &work_order {
            Some(wo) => match next_work_order_status(wo.status, wo.completed_at, &stats, now) {
                Some((status, completed_at)) => {
                    session.set_work_order_status(wo.id, status, completed_at)?;
                    log::info!("work order {identity} {} -> {status}", wo.status);
                    transition = Some((wo.status, status));
                    Some(status)
                }
                None => Some(wo.status),
            },
            None => {
                log::debug!("dispatch {dispatch_id} has no work order {identity}");
                None
            }
        };

        let dispatch_status = dispatch_status_for(dispatch.status, work_order_status, &stats);
        session.write_dispatch_statistics(dispatch_id, &stats, dispatch_status, now)?;

        Ok(Recomputation {
            dispatch_id,
            identity,
            stats,
            dispatch_status,
            work_order_transition: transition,
        })
    }

    /// Recompute the dispatch of `identity`, if there is one.
    ///
    /// # Errors
    ///
    /// As [`recompute`](Self::recompute).
    pub fn recompute_for(&self, identity: &OrderIdentity) -> Result<Option<Recomputation>, StatsError> {
        let dispatch = self.store.open()?.dispatch_for(identity)?;
        match dispatch {
            Some(d) => self.recompute(d.id).map(Some),
            None => {
                log::debug!("no dispatch for {identity}, nothing to recompute");
                Ok(None)
            }
        }
    }

    /// Recompute every in-production dispatch, one coroutine each.
    ///
    /// # Errors
    ///
    /// `Store` if the dispatch list cannot be read. Failures of single
    /// dispatches are counted, not returned.
    pub fn recompute_all_in_production(&self) -> Result<BatchSummary, StatsError> {
        let ids = self.store.open()?.dispatch_ids_by_status(DispatchStatus::InProduction)?;
        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                let engine = self.clone();
                may::go!(move || engine.recompute(id).is_ok())
            })
            .collect();

        let mut summary = BatchSummary::default();
        for handle in handles {
            match handle.join() {
                Ok(true) => summary.updated += 1,
                Ok(false) | Err(_) => summary.errors += 1,
            }
        }
        log::info!(
            "batch dispatch recomputation: {} updated, {} failed",
            summary.updated,
            summary.errors
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal::Decimal;

    const PACKAGING: &str = "出貨包裝";

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    fn directory() -> TenantDirectory {
        TenantDirectory::from_pairs([("10", "Acme"), ("20", "Globex")])
    }

    fn dispatch(planned: i64) -> Dispatch {
        Dispatch {
            id: 1,
            identity: OrderIdentity::new("10", "W1", "P1"),
            company_name: "Acme".into(),
            planned_quantity: planned,
            status: DispatchStatus::InProduction,
            stats: DispatchStatistics::default(),
            stats_updated_at: None,
        }
    }

    fn report(company: &str, operation: &str, good: i64, defect: i64, approval: ApprovalStatus) -> Report {
        Report {
            id: 0,
            operator: "Lin".into(),
            work_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            operation: operation.into(),
            equipment: None,
            company_name: company.into(),
            company_code: None,
            order_number: "W1".into(),
            product_code: "P1".into(),
            produced_quantity: good,
            defect_quantity: defect,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            work_hours: Decimal::new(4, 0),
            overtime_hours: Decimal::new(5, 1),
            approval,
            approved_by: None,
            approved_at: None,
            is_completed: false,
            updated_at: at(12),
        }
    }

    #[test]
    fn test_totals_count_approved_in_scope_only() {
        let reports = vec![
            report("Acme", "cutting", 40, 2, ApprovalStatus::Approved),
            report("Acme", "cutting", 10, 0, ApprovalStatus::Pending),
            report("Globex", "cutting", 99, 0, ApprovalStatus::Approved),
            report("Unknown Co", "cutting", 99, 0, ApprovalStatus::Approved),
        ];
        let stats = compute_statistics(&dispatch(100), &directory(), &reports, &[], 3, PACKAGING);
        assert_eq!(stats.total_quantity, 42);
        assert_eq!(stats.report_count, 2);
        assert_eq!(stats.approved_count, 1);
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.total_all_hours, Decimal::new(45, 1));
        assert_eq!(stats.completed_processes, 1);
        assert_eq!(stats.pending_processes, 2);
        assert!((stats.completion_rate - 42.0).abs() < f64::EPSILON);
        assert!(!stats.can_complete);
    }

    #[test]
    fn test_packaging_closes_dispatch() {
        let reports = vec![
            report("Acme", PACKAGING, 40, 0, ApprovalStatus::Approved),
            report("Acme", PACKAGING, 30, 0, ApprovalStatus::Approved),
            report("Acme", PACKAGING, 30, 0, ApprovalStatus::Approved),
        ];
        let stats = compute_statistics(&dispatch(100), &directory(), &reports, &[], 0, PACKAGING);
        assert_eq!(stats.packaging_total_quantity, 100);
        assert!(stats.can_complete);
        assert!(stats.completion_threshold_met);
    }

    #[test]
    fn test_completed_onsite_packaging_counts() {
        let onsite = vec![
            OnsiteReport {
                id: 1,
                identity: OrderIdentity::new("10", "W1", "P1"),
                operation: PACKAGING.into(),
                produced_quantity: 60,
                defect_quantity: 0,
                status: OnsiteStatus::Completed,
                updated_at: at(9),
            },
            OnsiteReport {
                id: 2,
                identity: OrderIdentity::new("10", "W1", "P1"),
                operation: PACKAGING.into(),
                produced_quantity: 50,
                defect_quantity: 0,
                status: OnsiteStatus::InProgress,
                updated_at: at(10),
            },
        ];
        let stats = compute_statistics(&dispatch(100), &directory(), &[], &onsite, 0, PACKAGING);
        assert_eq!(stats.packaging_total_quantity, 60);
        assert_eq!(stats.onsite_report_count, 2);
        assert_eq!(stats.onsite_completed_count, 1);
        assert_eq!(stats.last_onsite_update, Some(at(10)));
    }

    #[test]
    fn test_zero_plan_never_completes() {
        let reports = vec![report("Acme", PACKAGING, 40, 0, ApprovalStatus::Approved)];
        let stats = compute_statistics(&dispatch(0), &directory(), &reports, &[], 0, PACKAGING);
        assert_eq!(stats.completion_rate, 0.0);
        assert_eq!(stats.packaging_completion_rate, 0.0);
        assert!(!stats.can_complete);
    }

    #[test]
    fn test_own_company_code_wins_over_name() {
        let mut r = report("Globex", "cutting", 5, 0, ApprovalStatus::Approved);
        r.company_code = Some("10".into());
        assert!(report_in_scope(&r, "10", &directory()));
        assert!(!report_in_scope(&report("Nobody", "cutting", 1, 0, ApprovalStatus::Approved), "10", &directory()));
    }

    #[test]
    fn test_status_transitions() {
        let mut stats = DispatchStatistics::default();
        assert_eq!(next_work_order_status(WorkOrderStatus::Pending, None, &stats, at(8)), None);
        assert_eq!(
            next_work_order_status(WorkOrderStatus::InProgress, None, &stats, at(8)),
            Some((WorkOrderStatus::Pending, None))
        );

        stats.total_quantity = 5;
        assert_eq!(
            next_work_order_status(WorkOrderStatus::Pending, None, &stats, at(8)),
            Some((WorkOrderStatus::InProgress, None))
        );

        stats.can_complete = true;
        assert_eq!(
            next_work_order_status(WorkOrderStatus::InProgress, None, &stats, at(8)),
            Some((WorkOrderStatus::Completed, Some(at(8))))
        );
        assert_eq!(
            next_work_order_status(WorkOrderStatus::InProgress, Some(at(7)), &stats, at(8)),
            Some((WorkOrderStatus::Completed, Some(at(7))))
        );
        assert_eq!(next_work_order_status(WorkOrderStatus::Completed, Some(at(7)), &stats, at(9)), None);
    }

    #[test]
    fn test_completed_work_order_is_not_reverted() {
        let stats = DispatchStatistics::default();
        assert_eq!(next_work_order_status(WorkOrderStatus::Completed, Some(at(7)), &stats, at(9)), None);
    }

    #[test]
    fn test_dispatch_lock_times_out_while_held() {
        let locks = DispatchLocks::new();
        let guard = locks.acquire(7, Duration::from_millis(10)).unwrap();
        assert!(locks.is_held(7));
        assert!(matches!(
            locks.acquire(7, Duration::from_millis(20)),
            Err(StatsError::LockTimeout(7))
        ));
        assert!(locks.acquire(8, Duration::from_millis(10)).is_ok());
        drop(guard);
        assert!(!locks.is_held(7));
        assert!(locks.acquire(7, Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_waiting_coroutine_gets_dispatch_after_release() {
        let locks = Arc::new(DispatchLocks::new());
        let guard = locks.acquire(7, Duration::from_millis(10)).unwrap();
        let waiter = {
            let locks = Arc::clone(&locks);
            may::go!(move || locks.acquire(7, Duration::from_secs(5)).map(|_| ()).is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        drop(guard);
        assert!(waiter.join().expect("waiting coroutine panicked"));
        assert!(!locks.is_held(7));
    }
}
