//! Reopen a completed work order from its archived snapshot.

use chrono::{Local, NaiveDateTime};
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

use crate::executor::DbError;
use crate::mes::model::{
    ApprovalStatus, Assignment, CompletedProcess, CompletedWorkOrder, Dispatch, DispatchProcess, DispatchStatistics,
    DispatchStatus, OnsiteStatus, ProcessStatus, ProductionRecord, WorkOrder, WorkOrderProcess, WorkOrderSource,
    WorkOrderStatus,
};
use crate::mes::statistics::{report_in_scope, StatisticsEngine};
use crate::mes::store::{in_transaction, MesSession, MesStore};

#[derive(Debug)]
pub enum RollbackError {
    NotFound(i64),
    /// A work order with the same identity is already in progress.
    AlreadyInProgress(String),
    Store(DbError),
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RollbackError::NotFound(id) => write!(f, "Completed work order {id} does not exist"),
            RollbackError::AlreadyInProgress(identity) => {
                write!(f, "Work order {identity} is already in progress")
            }
            RollbackError::Store(e) => write!(f, "Rollback failed: {e}"),
        }
    }
}

impl std::error::Error for RollbackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RollbackError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for RollbackError {
    fn from(e: DbError) -> Self {
        RollbackError::Store(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackCheck {
    pub allowed: bool,
    pub reason: String,
}

/// What a rollback rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RollbackOutcome {
    pub work_order_id: i64,
    pub dispatch_id: i64,
    pub processes_created: usize,
    pub processes_reopened: usize,
    pub assignments_created: usize,
    pub reports_reset: u64,
    pub onsite_reopened: u64,
}

pub struct RollbackService {
    store: Arc<dyn MesStore>,
    statistics: Option<StatisticsEngine>,
}

impl RollbackService {
    pub fn new(store: Arc<dyn MesStore>) -> Self {
        Self { store, statistics: None }
    }

    /// Recompute the reopened dispatch once the rollback commits.
    pub fn with_statistics(mut self, engine: StatisticsEngine) -> Self {
        self.statistics = Some(engine);
        self
    }

    /// Whether `completed_id` can be rolled back, without changing anything.
    ///
    /// # Errors
    ///
    /// `Store` when the lookup itself fails.
    pub fn can_rollback(&self, completed_id: i64) -> Result<RollbackCheck, RollbackError> {
        let mut session = self.store.open()?;
        Ok(match precondition(session.as_mut(), completed_id) {
            Ok(_) => RollbackCheck {
                allowed: true,
                reason: "work order can be rolled back".to_string(),
            },
            Err(RollbackError::Store(e)) => return Err(RollbackError::Store(e)),
            Err(e) => RollbackCheck {
                allowed: false,
                reason: e.to_string(),
            },
        })
    }

    /// Reopen the archived work order `completed_id` in one transaction.
    /// With `keep_approval` false every report of the work order goes back
    /// to pending.
    ///
    /// # Errors
    ///
    /// `NotFound`, `AlreadyInProgress` or `Store`; nothing is changed on error.
    pub fn rollback(&self, completed_id: i64, keep_approval: bool, actor: &str) -> Result<RollbackOutcome, RollbackError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::work_order_rollback_span(completed_id).entered();

        let mut session = self.store.open()?;
        let now = Local::now().naive_local();
        let (outcome, identity) = in_transaction(session.as_mut(), |s| {
            let completed = precondition(s, completed_id)?;
            let outcome = reopen(s, &completed, keep_approval, now)?;
            s.delete_completed_work_order(&completed)?;
            Ok::<_, RollbackError>((outcome, completed.identity))
        })?;
        log::info!(
            "{actor} rolled back completed work order {completed_id} ({identity}): {} processes recreated, {} reopened, {} reports reset",
            outcome.processes_created,
            outcome.processes_reopened,
            outcome.reports_reset
        );

        if let Some(engine) = &self.statistics {
            if let Err(e) = engine.recompute(outcome.dispatch_id) {
                log::warn!("dispatch {} not refreshed after rollback: {e}", outcome.dispatch_id);
            }
        }
        Ok(outcome)
    }
}

fn precondition(session: &mut dyn MesSession, completed_id: i64) -> Result<CompletedWorkOrder, RollbackError> {
    let completed = session
        .completed_work_order(completed_id)?
        .ok_or(RollbackError::NotFound(completed_id))?;
    if let Some(existing) = session.work_order_for(&completed.identity)? {
        if existing.status == WorkOrderStatus::InProgress {
            return Err(RollbackError::AlreadyInProgress(completed.identity.to_string()));
        }
    }
    Ok(completed)
}

fn reopen(
    session: &mut dyn MesSession,
    completed: &CompletedWorkOrder,
    keep_approval: bool,
    now: NaiveDateTime,
) -> Result<RollbackOutcome, DbError> {
    let mut outcome = RollbackOutcome::default();
    let archived = session.completed_processes(completed.id)?;

    outcome.work_order_id = match session.work_order_for(&completed.identity)? {
        Some(existing) => {
            session.reopen_work_order(existing.id, completed.planned_quantity)?;
            existing.id
        }
        None => session.insert_work_order(&WorkOrder {
            id: 0,
            identity: completed.identity.clone(),
            planned_quantity: completed.planned_quantity,
            status: WorkOrderStatus::InProgress,
            source: WorkOrderSource::ErpSync,
            created_at: completed.created_at,
            completed_at: None,
        })?,
    };
    let work_order_id = outcome.work_order_id;

    let production_start = match session.production_record(work_order_id)? {
        Some(record) => record.production_start,
        None => Some(completed.started_at.unwrap_or(completed.created_at)),
    };
    session.save_production_record(&ProductionRecord {
        work_order_id,
        status: DispatchStatus::InProduction,
        production_start,
        production_end: None,
    })?;

    let existing = session.processes_for(work_order_id)?;
    for process in &archived {
        match existing.iter().find(|p| p.operation == process.operation) {
            Some(found) => {
                session.reopen_process(found.id)?;
                outcome.processes_reopened += 1;
            }
            None => {
                session.insert_process(&work_order_process(work_order_id, process))?;
                outcome.processes_created += 1;
            }
        }
    }

    let assignments = session.assignments_for(work_order_id)?;
    for process in &archived {
        let Some(operator) = process.assigned_operator.as_deref().filter(|o| !o.is_empty()) else {
            continue;
        };
        if assignments
            .iter()
            .any(|a| a.operation == process.operation && a.operator == operator)
        {
            continue;
        }
        session.insert_assignment(&Assignment {
            id: 0,
            work_order_id,
            operation: process.operation.clone(),
            operator: operator.to_string(),
            equipment: process.assigned_equipment.clone(),
            assigned_date: process.start_date.unwrap_or_else(|| now.date()),
        })?;
        outcome.assignments_created += 1;
    }

    outcome.dispatch_id = match session.dispatch_for(&completed.identity)? {
        Some(dispatch) => {
            session.set_dispatch_status(dispatch.id, DispatchStatus::InProduction)?;
            dispatch.id
        }
        None => session.insert_dispatch(&Dispatch {
            id: 0,
            identity: completed.identity.clone(),
            company_name: completed.company_name.clone(),
            planned_quantity: completed.planned_quantity,
            status: DispatchStatus::InProduction,
            stats: DispatchStatistics::default(),
            stats_updated_at: None,
        })?,
    };
    let dispatch_id = outcome.dispatch_id;

    let dispatch_processes = session.dispatch_processes(dispatch_id)?;
    for process in &archived {
        match dispatch_processes.iter().find(|p| p.operation == process.operation) {
            Some(found) => session.reopen_dispatch_process(found.id)?,
            None => {
                session.insert_dispatch_process(&DispatchProcess {
                    id: 0,
                    dispatch_id,
                    operation: process.operation.clone(),
                    planned_quantity: process.planned_quantity,
                    completed_quantity: process.completed_quantity,
                    status: ProcessStatus::InProgress,
                    end_date: None,
                })?;
            }
        }
    }

    let directory = session.tenant_directory()?;
    let identity = &completed.identity;
    for report in session.reports_for(&identity.order_number, &identity.product_code)? {
        if !report_in_scope(&report, &identity.company_code, &directory) {
            continue;
        }
        session.set_report_completed(report.id, false)?;
        if !keep_approval {
            session.set_report_approval(report.id, ApprovalStatus::Pending, None, None)?;
        }
        outcome.reports_reset += 1;
    }
    outcome.onsite_reopened =
        session.set_onsite_status(&identity.order_number, &identity.product_code, OnsiteStatus::InProgress)?;

    Ok(outcome)
}

fn work_order_process(work_order_id: i64, archived: &CompletedProcess) -> WorkOrderProcess {
    WorkOrderProcess {
        id: 0,
        work_order_id,
        sequence: archived.sequence,
        operation: archived.operation.clone(),
        planned_quantity: archived.planned_quantity,
        completed_quantity: archived.completed_quantity,
        status: ProcessStatus::InProgress,
        assigned_operator: archived.assigned_operator.clone(),
        assigned_equipment: archived.assigned_equipment.clone(),
        start_date: archived.start_date,
        end_date: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_rebuilt_process_is_in_progress() {
        let archived = CompletedProcess {
            id: 3,
            completed_work_order_id: 1,
            sequence: 2,
            operation: "shipping packaging".into(),
            planned_quantity: 100,
            completed_quantity: 100,
            assigned_operator: Some("Chen".into()),
            assigned_equipment: None,
            start_date: NaiveDate::from_ymd_opt(2024, 4, 1),
        };
        let process = work_order_process(9, &archived);
        assert_eq!(process.work_order_id, 9);
        assert_eq!(process.status, ProcessStatus::InProgress);
        assert_eq!(process.end_date, None);
        assert_eq!(process.sequence, 2);
    }

    #[test]
    fn test_error_messages_name_the_work_order() {
        let e = RollbackError::AlreadyInProgress("10/W1/P1".into());
        assert_eq!(e.to_string(), "Work order 10/W1/P1 is already in progress");
        assert_eq!(RollbackError::NotFound(4).to_string(), "Completed work order 4 does not exist");
    }
}
