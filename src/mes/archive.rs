//! Move completed work orders into the completed archive.
//!
//! The archive keeps a snapshot of the work order and its processes; the
//! live work order and its children are removed. [`RollbackService`]
//! reverses this.
//!
//! [`RollbackService`]: crate::mes::rollback::RollbackService

use chrono::{Local, NaiveDateTime};
use std::fmt;
use std::sync::Arc;

use crate::executor::DbError;
use crate::mes::model::{CompletedProcess, CompletedWorkOrder, OrderIdentity, WorkOrderStatus};
use crate::mes::statistics::BatchSummary;
use crate::mes::store::{in_transaction, MesSession, MesStore};

#[derive(Debug)]
pub enum ArchiveError {
    NotFound(String),
    NotCompleted(String),
    Store(DbError),
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveError::NotFound(identity) => write!(f, "Work order {identity} does not exist"),
            ArchiveError::NotCompleted(identity) => write!(f, "Work order {identity} is not completed"),
            ArchiveError::Store(e) => write!(f, "Archive failed: {e}"),
        }
    }
}

impl std::error::Error for ArchiveError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ArchiveError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for ArchiveError {
    fn from(e: DbError) -> Self {
        ArchiveError::Store(e)
    }
}

pub struct ArchiveService {
    store: Arc<dyn MesStore>,
}

impl ArchiveService {
    pub fn new(store: Arc<dyn MesStore>) -> Self {
        Self { store }
    }

    /// Archive the completed work order `identity` in one transaction.
    /// Archiving a work order twice returns the first snapshot.
    ///
    /// # Errors
    ///
    /// `NotFound`, `NotCompleted` or `Store`; nothing is changed on error.
    pub fn archive(&self, identity: &OrderIdentity, actor: &str) -> Result<CompletedWorkOrder, ArchiveError> {
        let mut session = self.store.open()?;
        let now = Local::now().naive_local();
        let archived = in_transaction(session.as_mut(), |s| archive_in(s, identity, now))?;
        log::info!("{actor} archived work order {identity} as completed record {}", archived.id);
        Ok(archived)
    }

    /// Archive every completed work order still in the live tables.
    ///
    /// # Errors
    ///
    /// `Store` if the work order list cannot be read. Single failures are
    /// counted.
    pub fn archive_all_completed(&self, actor: &str) -> Result<BatchSummary, ArchiveError> {
        let completed: Vec<OrderIdentity> = self
            .store
            .open()?
            .work_orders()?
            .into_iter()
            .filter(|w| w.status == WorkOrderStatus::Completed)
            .map(|w| w.identity)
            .collect();

        let mut summary = BatchSummary::default();
        for identity in &completed {
            match self.archive(identity, actor) {
                Ok(_) => summary.updated += 1,
                Err(e) => {
                    log::error!("work order {identity} not archived: {e}");
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }
}

fn archive_in(
    session: &mut dyn MesSession,
    identity: &OrderIdentity,
    now: NaiveDateTime,
) -> Result<CompletedWorkOrder, ArchiveError> {
    let work_order = session
        .work_order_for(identity)?
        .ok_or_else(|| ArchiveError::NotFound(identity.to_string()))?;
    if work_order.status != WorkOrderStatus::Completed {
        return Err(ArchiveError::NotCompleted(identity.to_string()));
    }
    if let Some(existing) = session.completed_work_order_for(identity)? {
        if existing.work_order_id == work_order.id {
            log::warn!("work order {identity} was already archived");
            return Ok(existing);
        }
    }

    let directory = session.tenant_directory()?;
    let started_at = session
        .production_record(work_order.id)?
        .and_then(|r| r.production_start);
    let mut snapshot = CompletedWorkOrder {
        id: 0,
        work_order_id: work_order.id,
        identity: identity.clone(),
        company_name: directory
            .name_for(&identity.company_code)
            .unwrap_or_default()
            .to_string(),
        planned_quantity: work_order.planned_quantity,
        created_at: work_order.created_at,
        started_at,
        completed_at: work_order.completed_at.unwrap_or(now),
    };
    let processes: Vec<CompletedProcess> = session
        .processes_for(work_order.id)?
        .into_iter()
        .map(|p| CompletedProcess {
            id: 0,
            completed_work_order_id: 0,
            sequence: p.sequence,
            operation: p.operation,
            planned_quantity: p.planned_quantity,
            completed_quantity: p.completed_quantity,
            assigned_operator: p.assigned_operator,
            assigned_equipment: p.assigned_equipment,
            start_date: p.start_date,
        })
        .collect();

    snapshot.id = session.insert_completed_work_order(&snapshot, &processes)?;
    session.delete_work_order(work_order.id)?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mes::model::{ProcessStatus, WorkOrder, WorkOrderProcess, WorkOrderSource};
    use crate::test_helpers::MemoryMesStore;
    use chrono::NaiveDate;

    fn seed(store: &MemoryMesStore, status: WorkOrderStatus) -> OrderIdentity {
        let identity = OrderIdentity::new("10", "W1", "P1");
        let at = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap().and_hms_opt(8, 0, 0).unwrap();
        let mut session = store.open().unwrap();
        let id = session
            .insert_work_order(&WorkOrder {
                id: 0,
                identity: identity.clone(),
                planned_quantity: 100,
                status,
                source: WorkOrderSource::ErpSync,
                created_at: at,
                completed_at: (status == WorkOrderStatus::Completed).then_some(at),
            })
            .unwrap();
        session
            .insert_process(&WorkOrderProcess {
                id: 0,
                work_order_id: id,
                sequence: 1,
                operation: "cutting".into(),
                planned_quantity: 100,
                completed_quantity: 100,
                status: ProcessStatus::Completed,
                assigned_operator: Some("Lin".into()),
                assigned_equipment: None,
                start_date: Some(at.date()),
                end_date: Some(at.date()),
            })
            .unwrap();
        identity
    }

    #[test]
    fn test_archive_moves_work_order() {
        let store = MemoryMesStore::with_tenants([("10", "Acme")]);
        let identity = seed(&store, WorkOrderStatus::Completed);
        let service = ArchiveService::new(Arc::new(store.clone()));

        let archived = service.archive(&identity, "admin").unwrap();
        assert_eq!(archived.company_name, "Acme");

        let data = store.snapshot();
        assert!(data.work_orders.is_empty());
        assert!(data.processes.is_empty());
        assert_eq!(data.completed.len(), 1);
        assert_eq!(data.completed_processes.len(), 1);
        assert_eq!(data.completed_processes[0].operation, "cutting");
    }

    #[test]
    fn test_in_progress_work_order_is_refused() {
        let store = MemoryMesStore::new();
        let identity = seed(&store, WorkOrderStatus::InProgress);
        let service = ArchiveService::new(Arc::new(store.clone()));

        let err = service.archive(&identity, "admin").unwrap_err();
        assert!(matches!(err, ArchiveError::NotCompleted(_)));
        assert_eq!(store.snapshot().work_orders.len(), 1);
        assert!(store.snapshot().completed.is_empty());
    }
}
