//! Fill-work report write path.
//!
//! Every committed change to a report calls [`ReportService::on_report_committed`],
//! which recomputes the dispatch the report belongs to.

use chrono::{Local, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use std::fmt;
use std::sync::Arc;

use crate::executor::DbError;
use crate::mes::model::{ApprovalStatus, OrderIdentity, Report};
use crate::mes::statistics::{Recomputation, StatisticsEngine, StatsError};
use crate::mes::store::{in_transaction, MesStore};
use crate::mes::worktime::split_hours;

#[derive(Debug)]
pub enum ReportError {
    NotFound(i64),
    Invalid(String),
    Store(DbError),
    /// The report change committed but its dispatch could not be recomputed.
    Statistics { report_id: i64, source: StatsError },
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::NotFound(id) => write!(f, "Report {id} does not exist"),
            ReportError::Invalid(reason) => write!(f, "Invalid report: {reason}"),
            ReportError::Store(e) => write!(f, "Report store failed: {e}"),
            ReportError::Statistics { report_id, source } => {
                write!(f, "Report {report_id} saved but statistics were not updated: {source}")
            }
        }
    }
}

impl std::error::Error for ReportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReportError::Store(e) => Some(e),
            ReportError::Statistics { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<DbError> for ReportError {
    fn from(e: DbError) -> Self {
        ReportError::Store(e)
    }
}

/// A report as the operator files it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReport {
    pub operator: String,
    pub work_date: NaiveDate,
    pub operation: String,
    pub equipment: Option<String>,
    pub company_name: String,
    pub company_code: Option<String>,
    pub order_number: String,
    pub product_code: String,
    pub produced_quantity: i64,
    pub defect_quantity: i64,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub break_hours: Option<Decimal>,
}

impl NewReport {
    fn validate(&self) -> Result<(), ReportError> {
        if self.order_number.trim().is_empty() || self.product_code.trim().is_empty() {
            return Err(ReportError::Invalid("order number and product code are required".to_string()));
        }
        if self.produced_quantity < 0 || self.defect_quantity < 0 {
            return Err(ReportError::Invalid("quantities must not be negative".to_string()));
        }
        if self.break_hours.is_some_and(|b| b < Decimal::ZERO) {
            return Err(ReportError::Invalid("break must not be negative".to_string()));
        }
        Ok(())
    }
}

/// Result of a report write.
#[derive(Debug, Clone, PartialEq)]
pub struct Committed {
    pub report: Report,
    /// `None` when the report resolves to no dispatch.
    pub recomputation: Option<Recomputation>,
}

pub struct ReportService {
    store: Arc<dyn MesStore>,
    engine: StatisticsEngine,
}

impl ReportService {
    pub fn new(engine: StatisticsEngine) -> Self {
        Self {
            store: Arc::clone(engine.store()),
            engine,
        }
    }

    /// File a new pending report with its work hours worked out.
    ///
    /// # Errors
    ///
    /// `Invalid` before anything is written, `Store` if the insert fails,
    /// `Statistics` if the insert committed but the recomputation did not.
    pub fn submit(&self, new: NewReport) -> Result<Committed, ReportError> {
        new.validate()?;
        let hours = split_hours(new.start_time, new.end_time, new.break_hours);
        let mut report = Report {
            id: 0,
            operator: new.operator,
            work_date: new.work_date,
            operation: new.operation,
            equipment: new.equipment,
            company_name: new.company_name,
            company_code: new.company_code,
            order_number: new.order_number,
            product_code: new.product_code,
            produced_quantity: new.produced_quantity,
            defect_quantity: new.defect_quantity,
            start_time: new.start_time,
            end_time: new.end_time,
            work_hours: hours.regular,
            overtime_hours: hours.overtime,
            approval: ApprovalStatus::Pending,
            approved_by: None,
            approved_at: None,
            is_completed: false,
            updated_at: Local::now().naive_local(),
        };
        let mut session = self.store.open()?;
        report.id = in_transaction(session.as_mut(), |s| s.insert_report(&report))?;
        log::info!(
            "report {} filed by {} for {}/{}",
            report.id,
            report.operator,
            report.order_number,
            report.product_code
        );
        self.after_commit(report)
    }

    /// # Errors
    ///
    /// `NotFound`, `Store` or `Statistics`.
    pub fn approve(&self, report_id: i64, actor: &str) -> Result<Committed, ReportError> {
        self.set_approval(report_id, ApprovalStatus::Approved, Some(actor))
    }

    /// # Errors
    ///
    /// `NotFound`, `Store` or `Statistics`.
    pub fn reject(&self, report_id: i64, actor: &str) -> Result<Committed, ReportError> {
        self.set_approval(report_id, ApprovalStatus::Rejected, Some(actor))
    }

    /// Put an approved or rejected report back to pending.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Store` or `Statistics`.
    pub fn unapprove(&self, report_id: i64) -> Result<Committed, ReportError> {
        self.set_approval(report_id, ApprovalStatus::Pending, None)
    }

    fn set_approval(
        &self,
        report_id: i64,
        approval: ApprovalStatus,
        actor: Option<&str>,
    ) -> Result<Committed, ReportError> {
        let at = actor.map(|_| Local::now().naive_local());
        let mut session = self.store.open()?;
        let report = in_transaction(session.as_mut(), |s| {
            if s.set_report_approval(report_id, approval, actor, at)? == 0 {
                return Err(ReportError::NotFound(report_id));
            }
            s.report(report_id)?.ok_or(ReportError::NotFound(report_id))
        })?;
        log::info!("report {report_id} set to {approval} by {}", actor.unwrap_or("-"));
        self.after_commit(report)
    }

    fn after_commit(&self, report: Report) -> Result<Committed, ReportError> {
        match self.on_report_committed(&report) {
            Ok(recomputation) => Ok(Committed { report, recomputation }),
            Err(source) => Err(ReportError::Statistics {
                report_id: report.id,
                source,
            }),
        }
    }

    /// Recompute the dispatch `report` belongs to. Reports whose company
    /// does not resolve are left to the consistency checks.
    ///
    /// # Errors
    ///
    /// Whatever the recomputation returns.
    pub fn on_report_committed(&self, report: &Report) -> Result<Option<Recomputation>, StatsError> {
        let directory = self.store.open()?.tenant_directory()?;
        let Some(company_code) = directory.resolve(report.company_code.as_deref(), &report.company_name) else {
            log::warn!(
                "report {} names unknown company '{}', statistics not updated",
                report.id,
                report.company_name
            );
            return Ok(None);
        };
        let identity = OrderIdentity::new(company_code, &report.order_number, &report.product_code);
        self.engine.recompute_for(&identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StatisticsConfig;
    use crate::mes::model::{Dispatch, DispatchStatistics, DispatchStatus, WorkOrder, WorkOrderSource, WorkOrderStatus};
    use crate::test_helpers::MemoryMesStore;
    use chrono::NaiveDateTime;

    fn packaging() -> String {
        StatisticsConfig::default().packaging_operation
    }

    fn identity() -> OrderIdentity {
        OrderIdentity::new("10", "W1", "P1")
    }

    fn at(h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 4, 1).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    /// Store with tenant 10, one pending work order and its dispatch.
    fn service(planned: i64) -> (ReportService, MemoryMesStore) {
        let store = MemoryMesStore::with_tenants([("10", "Acme")]);
        let mut session = store.open().expect("Failed to open session");
        session
            .insert_work_order(&WorkOrder {
                id: 0,
                identity: identity(),
                planned_quantity: planned,
                status: WorkOrderStatus::Pending,
                source: WorkOrderSource::ErpSync,
                created_at: at(7),
                completed_at: None,
            })
            .expect("Failed to insert work order");
        session
            .insert_dispatch(&Dispatch {
                id: 0,
                identity: identity(),
                company_name: "Acme".to_string(),
                planned_quantity: planned,
                status: DispatchStatus::Pending,
                stats: DispatchStatistics::default(),
                stats_updated_at: None,
            })
            .expect("Failed to insert dispatch");
        let engine = StatisticsEngine::new(Arc::new(store.clone()), &StatisticsConfig::default());
        (ReportService::new(engine), store)
    }

    fn filed(service: &ReportService, company: &str, quantity: i64) -> Committed {
        service
            .submit(NewReport {
                operator: "Lin".to_string(),
                work_date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
                operation: packaging(),
                equipment: None,
                company_name: company.to_string(),
                company_code: None,
                order_number: "W1".to_string(),
                product_code: "P1".to_string(),
                produced_quantity: quantity,
                defect_quantity: 0,
                start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                break_hours: None,
            })
            .expect("Failed to submit report")
    }

    fn work_order(store: &MemoryMesStore) -> WorkOrder {
        store
            .snapshot()
            .work_orders
            .into_iter()
            .find(|w| w.identity == identity())
            .expect("work order missing")
    }

    #[test]
    fn test_pending_report_is_not_counted() {
        let (service, store) = service(100);
        let committed = filed(&service, "Acme", 40);

        let recomputed = committed.recomputation.expect("dispatch not recomputed");
        assert_eq!(recomputed.stats.report_count, 1);
        assert_eq!(recomputed.stats.pending_count, 1);
        assert_eq!(recomputed.stats.approved_count, 0);
        assert_eq!(recomputed.stats.total_quantity, 0);
        assert_eq!(recomputed.work_order_transition, None);
        assert_eq!(work_order(&store).status, WorkOrderStatus::Pending);
    }

    #[test]
    fn test_reject_drops_quantity_and_reverts_work_order() {
        let (service, store) = service(100);
        let report = filed(&service, "Acme", 40).report;
        let approved = service.approve(report.id, "supervisor").unwrap();
        assert_eq!(approved.recomputation.unwrap().stats.packaging_total_quantity, 40);
        assert_eq!(work_order(&store).status, WorkOrderStatus::InProgress);

        let rejected = service.reject(report.id, "supervisor").unwrap();
        assert_eq!(rejected.report.approval, ApprovalStatus::Rejected);
        let recomputed = rejected.recomputation.expect("dispatch not recomputed");
        assert_eq!(recomputed.stats.approved_count, 0);
        assert_eq!(recomputed.stats.pending_count, 0);
        assert_eq!(recomputed.stats.total_quantity, 0);
        assert_eq!(recomputed.stats.packaging_total_quantity, 0);
        assert_eq!(recomputed.stats.total_work_hours, Decimal::ZERO);
        assert_eq!(
            recomputed.work_order_transition,
            Some((WorkOrderStatus::InProgress, WorkOrderStatus::Pending))
        );
        assert_eq!(work_order(&store).status, WorkOrderStatus::Pending);
    }

    #[test]
    fn test_unapprove_returns_report_to_pending_counts() {
        let (service, store) = service(100);
        let report = filed(&service, "Acme", 40).report;
        service.approve(report.id, "supervisor").unwrap();

        let reopened = service.unapprove(report.id).unwrap();
        assert_eq!(reopened.report.approval, ApprovalStatus::Pending);
        assert_eq!(reopened.report.approved_by, None);
        let recomputed = reopened.recomputation.expect("dispatch not recomputed");
        assert_eq!(recomputed.stats.pending_count, 1);
        assert_eq!(recomputed.stats.approved_count, 0);
        assert_eq!(recomputed.stats.total_quantity, 0);
        assert_eq!(
            recomputed.work_order_transition,
            Some((WorkOrderStatus::InProgress, WorkOrderStatus::Pending))
        );
        assert_eq!(work_order(&store).status, WorkOrderStatus::Pending);
    }

    #[test]
    fn test_reject_after_completion_keeps_completed_at() {
        let (service, store) = service(10);
        let report = filed(&service, "Acme", 10).report;
        let approved = service.approve(report.id, "supervisor").unwrap();
        assert!(approved.recomputation.unwrap().stats.can_complete);
        let completed = work_order(&store);
        assert_eq!(completed.status, WorkOrderStatus::Completed);
        assert!(completed.completed_at.is_some());

        let recomputed = service
            .reject(report.id, "supervisor")
            .unwrap()
            .recomputation
            .expect("dispatch not recomputed");
        assert!(!recomputed.stats.can_complete);
        assert_eq!(recomputed.work_order_transition, None);
        let after = work_order(&store);
        assert_eq!(after.status, WorkOrderStatus::Completed);
        assert_eq!(after.completed_at, completed.completed_at);
    }

    #[test]
    fn test_unknown_company_skips_recompute() {
        let (service, _) = service(100);
        let committed = filed(&service, "Nobody Ltd", 40);
        assert_eq!(committed.recomputation, None);
        assert!(matches!(service.reject(9999, "supervisor"), Err(ReportError::NotFound(9999))));
    }
}
