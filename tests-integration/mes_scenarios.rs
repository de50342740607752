//! Shop-floor scenarios against the in-memory store.
//!
//! Test flow:
//! 1. Seed a tenant, a work order and its dispatch
//! 2. File and approve reports through `ReportService`
//! 3. Run consistency checks, corrections, archive and rollback
//! 4. Check dispatch statistics and work order state after each step

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;

use shopfloor::config::{ConsistencyConfig, StatisticsConfig};
use shopfloor::mes::model::{ProcessStatus, WorkOrderProcess, WorkOrderSource};
use shopfloor::mes::{
    ApprovalStatus, ArchiveService, ConsistencyService, Dispatch, DispatchStatistics, DispatchStatus, FindingKind,
    MesStore, NewReport, OrderIdentity, Report, ReportService, RollbackService, StatisticsEngine, StatsError,
    WorkOrder, WorkOrderStatus,
};
use shopfloor::test_helpers::MemoryMesStore;

const PACKAGING: &str = "shipping packaging";

struct Floor {
    store: MemoryMesStore,
    engine: StatisticsEngine,
    reports: ReportService,
}

impl Floor {
    fn new() -> Self {
        let store = MemoryMesStore::with_tenants([("10", "Acme")]);
        let engine = StatisticsEngine::new(
            Arc::new(store.clone()),
            &StatisticsConfig {
                packaging_operation: PACKAGING.to_string(),
                ..StatisticsConfig::default()
            },
        );
        let reports = ReportService::new(engine.clone());
        Self { store, engine, reports }
    }

    /// Work order, its dispatch and the given processes. Returns the dispatch id.
    fn work_order(&self, identity: &OrderIdentity, planned: i64, operations: &[&str]) -> i64 {
        let mut session = self.store.open().expect("Failed to open session");
        let work_order_id = session
            .insert_work_order(&WorkOrder {
                id: 0,
                identity: identity.clone(),
                planned_quantity: planned,
                status: WorkOrderStatus::Pending,
                source: WorkOrderSource::ErpSync,
                created_at: at(8),
                completed_at: None,
            })
            .expect("Failed to insert work order");
        for (n, operation) in operations.iter().enumerate() {
            session
                .insert_process(&WorkOrderProcess {
                    id: 0,
                    work_order_id,
                    sequence: n as i32 + 1,
                    operation: (*operation).to_string(),
                    planned_quantity: planned,
                    completed_quantity: 0,
                    status: ProcessStatus::Pending,
                    assigned_operator: Some("Lin".to_string()),
                    assigned_equipment: None,
                    start_date: Some(day()),
                    end_date: None,
                })
                .expect("Failed to insert process");
        }
        session
            .insert_dispatch(&Dispatch {
                id: 0,
                identity: identity.clone(),
                company_name: "Acme".to_string(),
                planned_quantity: planned,
                status: DispatchStatus::Pending,
                stats: DispatchStatistics::default(),
                stats_updated_at: None,
            })
            .expect("Failed to insert dispatch")
    }

    /// File and approve one report by company name.
    fn approved(&self, company: &str, order: &str, product: &str, operation: &str, quantity: i64) -> Report {
        let filed = self
            .reports
            .submit(NewReport {
                operator: "Lin".to_string(),
                work_date: day(),
                operation: operation.to_string(),
                equipment: None,
                company_name: company.to_string(),
                company_code: None,
                order_number: order.to_string(),
                product_code: product.to_string(),
                produced_quantity: quantity,
                defect_quantity: 0,
                start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
                break_hours: Some(Decimal::ONE),
            })
            .expect("Failed to submit report");
        self.reports
            .approve(filed.report.id, "supervisor")
            .expect("Failed to approve report")
            .report
    }

    fn work_order_for(&self, identity: &OrderIdentity) -> Option<WorkOrder> {
        self.store
            .snapshot()
            .work_orders
            .into_iter()
            .find(|w| w.identity == *identity)
    }

    fn consistency(&self) -> ConsistencyService {
        ConsistencyService::new(Arc::new(self.store.clone()), ConsistencyConfig::default())
            .with_statistics(self.engine.clone())
    }
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, 1).unwrap()
}

fn at(hour: u32) -> NaiveDateTime {
    day().and_hms_opt(hour, 0, 0).unwrap()
}

#[test]
fn test_packaging_completes_work_order() {
    let floor = Floor::new();
    let identity = OrderIdentity::new("10", "W1", "P1");
    let dispatch_id = floor.work_order(&identity, 100, &["cutting", PACKAGING]);

    for quantity in [40, 30, 30] {
        floor.approved("Acme", "W1", "P1", PACKAGING, quantity);
    }

    let recomputed = floor.engine.recompute(dispatch_id).expect("Failed to recompute");
    assert_eq!(recomputed.stats.packaging_total_quantity, 100);
    assert_eq!(recomputed.stats.approved_count, 3);
    assert!(recomputed.stats.can_complete);
    assert_eq!(recomputed.dispatch_status, DispatchStatus::Completed);

    let work_order = floor.work_order_for(&identity).expect("work order missing");
    assert_eq!(work_order.status, WorkOrderStatus::Completed);
    let completed_at = work_order.completed_at.expect("completion time not set");

    let again = floor.engine.recompute(dispatch_id).expect("Failed to recompute");
    assert_eq!(again.work_order_transition, None);
    assert_eq!(floor.work_order_for(&identity).unwrap().completed_at, Some(completed_at));
}

#[test]
fn test_partial_packaging_keeps_work_order_in_progress() {
    let floor = Floor::new();
    let identity = OrderIdentity::new("10", "W1", "P1");
    let dispatch_id = floor.work_order(&identity, 100, &[PACKAGING]);

    floor.approved("Acme", "W1", "P1", PACKAGING, 40);

    let stats = floor.engine.recompute(dispatch_id).unwrap().stats;
    assert!(!stats.can_complete);
    assert!((stats.packaging_completion_rate - 40.0).abs() < f64::EPSILON);
    assert_eq!(floor.work_order_for(&identity).unwrap().status, WorkOrderStatus::InProgress);
}

#[test]
fn test_zero_plan_never_completes() {
    let floor = Floor::new();
    let identity = OrderIdentity::new("10", "W0", "P0");
    let dispatch_id = floor.work_order(&identity, 0, &[PACKAGING]);

    floor.approved("Acme", "W0", "P0", PACKAGING, 10);

    let stats = floor.engine.recompute(dispatch_id).unwrap().stats;
    assert!(!stats.can_complete);
    assert_eq!(stats.completion_rate, 0.0);
    assert_eq!(stats.packaging_completion_rate, 0.0);
    assert_eq!(floor.work_order_for(&identity).unwrap().status, WorkOrderStatus::InProgress);
}

#[test]
fn test_reports_of_another_company_are_ignored() {
    let floor = Floor::new();
    floor.store.update(|d| d.tenants.push(("20".to_string(), "Globex".to_string())));
    let identity = OrderIdentity::new("10", "W1", "P1");
    let dispatch_id = floor.work_order(&identity, 100, &[PACKAGING]);

    floor.approved("Globex", "W1", "P1", PACKAGING, 100);

    let stats = floor.engine.recompute(dispatch_id).unwrap().stats;
    assert_eq!(stats.report_count, 0);
    assert_eq!(stats.packaging_total_quantity, 0);
    assert_eq!(floor.work_order_for(&identity).unwrap().status, WorkOrderStatus::Pending);
}

#[test]
fn test_locked_dispatch_times_out_unchanged() {
    let floor = Floor::new();
    let identity = OrderIdentity::new("10", "W1", "P1");
    let dispatch_id = floor.work_order(&identity, 100, &[PACKAGING]);
    floor.store.update(|d| d.locked_dispatches.insert(dispatch_id));

    let err = floor.engine.recompute(dispatch_id).unwrap_err();

    assert!(matches!(err, StatsError::LockTimeout(id) if id == dispatch_id));
    let dispatch = floor
        .store
        .snapshot()
        .dispatches
        .into_iter()
        .find(|d| d.id == dispatch_id)
        .unwrap();
    assert_eq!(dispatch.stats, DispatchStatistics::default());
    assert_eq!(dispatch.stats_updated_at, None);
    assert!(!floor.engine.locks().is_held(dispatch_id));
}

#[test]
fn test_wrong_product_is_found_and_corrected() {
    let floor = Floor::new();
    floor.work_order(&OrderIdentity::new("10", "W2", "P-CORRECT"), 50, &[PACKAGING]);
    let report = floor.approved("Acme", "W2", "P-WRONG", PACKAGING, 5);
    let service = floor.consistency();

    let summary = service.run_check(FindingKind::WrongProduct).unwrap();
    assert_eq!(summary.findings, 1);
    let finding = &floor.store.snapshot().findings[0];
    assert_eq!(finding.report_id, report.id);
    assert_eq!(
        finding.correct.as_ref().map(|c| c.product_code.as_str()),
        Some("P-CORRECT")
    );

    let corrected = service.correct(FindingKind::WrongProduct, false, "admin").unwrap();
    assert_eq!(corrected.total_corrected, 1);
    assert_eq!(corrected.corrections[0].old_value, "P-WRONG");
    assert_eq!(corrected.corrections[0].new_value, "P-CORRECT");

    let data = floor.store.snapshot();
    let patched = data.reports.iter().find(|r| r.id == report.id).unwrap();
    assert_eq!(patched.product_code, "P-CORRECT");
    assert!(data.findings.iter().all(|f| f.is_fixed));

    let recheck = service.run_check(FindingKind::WrongProduct).unwrap();
    assert_eq!(recheck.findings, 0);
}

#[test]
fn test_dry_run_changes_nothing() {
    let floor = Floor::new();
    floor.work_order(&OrderIdentity::new("10", "W2", "P-CORRECT"), 50, &[PACKAGING]);
    let report = floor.approved("Acme", "W2", "P-WRONG", PACKAGING, 5);
    let service = floor.consistency();
    service.run_check(FindingKind::WrongProduct).unwrap();

    let planned = service.correct(FindingKind::WrongProduct, true, "admin").unwrap();

    assert!(planned.dry_run);
    assert_eq!(planned.corrections.len(), 1);
    let data = floor.store.snapshot();
    assert_eq!(
        data.reports.iter().find(|r| r.id == report.id).unwrap().product_code,
        "P-WRONG"
    );
    assert!(data.findings.iter().all(|f| !f.is_fixed));
}

#[test]
fn test_unresolved_company_yields_one_missing_dispatch() {
    let floor = Floor::new();
    floor.approved("Unknown Co", "W9", "P9", PACKAGING, 5);

    let results = floor.consistency().run_all_checks().unwrap();

    let total: usize = results.iter().map(|(_, s)| s.findings).sum();
    assert_eq!(total, 1);
    let findings = floor.store.snapshot().findings;
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].kind, FindingKind::MissingDispatch);
    assert_eq!(findings[0].wrong.company_code, "");
    assert_eq!(findings[0].wrong_company_name, "Unknown Co");
}

#[test]
fn test_archive_then_rollback_reopens_work_order() {
    let floor = Floor::new();
    let identity = OrderIdentity::new("10", "W3", "P3");
    let dispatch_id = floor.work_order(&identity, 100, &["cutting", PACKAGING]);
    floor.approved("Acme", "W3", "P3", PACKAGING, 100);
    assert_eq!(floor.work_order_for(&identity).unwrap().status, WorkOrderStatus::Completed);

    let store: Arc<dyn MesStore> = Arc::new(floor.store.clone());
    let archived = ArchiveService::new(Arc::clone(&store))
        .archive(&identity, "admin")
        .expect("Failed to archive work order");
    assert!(floor.work_order_for(&identity).is_none());

    let rollback = RollbackService::new(store);
    assert!(rollback.can_rollback(archived.id).unwrap().allowed);
    let outcome = rollback.rollback(archived.id, false, "admin").expect("Failed to roll back");
    assert_eq!(outcome.dispatch_id, dispatch_id);
    assert_eq!(outcome.processes_created, 2);
    assert_eq!(outcome.reports_reset, 1);

    let data = floor.store.snapshot();
    let reopened: Vec<_> = data.work_orders.iter().filter(|w| w.identity == identity).collect();
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened[0].status, WorkOrderStatus::InProgress);
    assert_eq!(reopened[0].completed_at, None);

    let processes: Vec<_> = data
        .processes
        .iter()
        .filter(|p| p.work_order_id == reopened[0].id)
        .collect();
    assert_eq!(processes.len(), 2);
    assert!(processes
        .iter()
        .all(|p| p.status == ProcessStatus::InProgress && p.end_date.is_none()));

    assert!(data.completed.is_empty());
    assert!(data.completed_processes.is_empty());
    assert!(data.reports.iter().all(|r| r.approval == ApprovalStatus::Pending));

    let dispatch = data.dispatches.iter().find(|d| d.id == dispatch_id).unwrap();
    assert_eq!(dispatch.planned_quantity, reopened[0].planned_quantity);
    assert_eq!(dispatch.status, DispatchStatus::InProduction);

    assert!(!rollback.can_rollback(archived.id).unwrap().allowed);
}

#[test]
fn test_rollback_keeping_approval_restores_statistics() {
    let floor = Floor::new();
    let identity = OrderIdentity::new("10", "W4", "P4");
    let dispatch_id = floor.work_order(&identity, 60, &[PACKAGING]);
    floor.approved("Acme", "W4", "P4", PACKAGING, 60);
    let before = floor.engine.recompute(dispatch_id).unwrap().stats;

    let store: Arc<dyn MesStore> = Arc::new(floor.store.clone());
    let archived = ArchiveService::new(Arc::clone(&store)).archive(&identity, "admin").unwrap();
    RollbackService::new(store)
        .rollback(archived.id, true, "admin")
        .expect("Failed to roll back");

    let after = floor.engine.recompute(dispatch_id).unwrap();
    assert_eq!(after.stats, before);
    assert_eq!(
        after.work_order_transition,
        Some((WorkOrderStatus::InProgress, WorkOrderStatus::Completed))
    );
}

#[test]
fn test_wrong_work_order_is_corrected_and_rechecks_clean() {
    let floor = Floor::new();
    floor.work_order(&OrderIdentity::new("10", "W5", "P5"), 50, &[PACKAGING]);
    floor.work_order(&OrderIdentity::new("10", "W7", "P7"), 50, &[PACKAGING]);
    floor.work_order(&OrderIdentity::new("10", "W8", "P7"), 50, &[PACKAGING]);
    let typo = floor.approved("Acme", "W-TYPO", "P5", PACKAGING, 5);
    let unclear = floor.approved("Acme", "W-X", "P7", PACKAGING, 5);
    let service = floor.consistency();

    let summary = service.run_check(FindingKind::WrongWorkorder).unwrap();
    assert_eq!(summary.findings, 1);
    assert_eq!(summary.ambiguous, 1);

    let corrected = service.correct(FindingKind::WrongWorkorder, false, "admin").unwrap();
    assert_eq!(corrected.total_corrected, 1);
    assert_eq!(corrected.corrections[0].field, "order_number");
    assert_eq!(corrected.corrections[0].old_value, "W-TYPO");
    assert_eq!(corrected.corrections[0].new_value, "W5");

    let data = floor.store.snapshot();
    let patched = data.reports.iter().find(|r| r.id == typo.id).unwrap();
    assert_eq!(patched.order_number, "W5");
    assert_eq!(patched.product_code, "P5");
    assert_eq!(patched.company_name, "Acme");
    let untouched = data.reports.iter().find(|r| r.id == unclear.id).unwrap();
    assert_eq!(untouched.order_number, "W-X");

    let recheck = service.run_check(FindingKind::WrongWorkorder).unwrap();
    assert_eq!(recheck.findings, 0);
    assert_eq!(recheck.ambiguous, 1);
}

#[test]
fn test_wrong_company_is_corrected_and_rechecks_clean() {
    let floor = Floor::new();
    floor.store.update(|d| {
        d.tenants.push(("20".to_string(), "Globex".to_string()));
        d.tenants.push(("30".to_string(), "Initech".to_string()));
    });
    floor.work_order(&OrderIdentity::new("20", "W9", "P9"), 50, &[PACKAGING]);
    floor.work_order(&OrderIdentity::new("20", "W10", "P10"), 50, &[PACKAGING]);
    floor.work_order(&OrderIdentity::new("30", "W10", "P10"), 50, &[PACKAGING]);
    let misfiled = floor.approved("Acme", "W9", "P9", PACKAGING, 5);
    let unclear = floor.approved("Acme", "W10", "P10", PACKAGING, 5);
    let service = floor.consistency();

    let summary = service.run_check(FindingKind::WrongCompany).unwrap();
    assert_eq!(summary.findings, 1);
    assert_eq!(summary.ambiguous, 1);
    let finding = &floor.store.snapshot().findings[0];
    assert_eq!(finding.correct_company_name.as_deref(), Some("Globex"));

    let corrected = service.correct(FindingKind::WrongCompany, false, "admin").unwrap();
    assert_eq!(corrected.total_corrected, 1);
    assert_eq!(corrected.corrections[0].field, "company_name");
    assert_eq!(corrected.corrections[0].old_value, "Acme");
    assert_eq!(corrected.corrections[0].new_value, "Globex");

    let data = floor.store.snapshot();
    let patched = data.reports.iter().find(|r| r.id == misfiled.id).unwrap();
    assert_eq!(patched.company_name, "Globex");
    assert_eq!(patched.company_code, None, "a report filed by name stays filed by name");
    assert_eq!(patched.order_number, "W9");
    assert_eq!(patched.product_code, "P9");
    assert_eq!(
        data.reports.iter().find(|r| r.id == unclear.id).unwrap().company_name,
        "Acme"
    );

    let recheck = service.run_check(FindingKind::WrongCompany).unwrap();
    assert_eq!(recheck.findings, 0);
    assert_eq!(recheck.ambiguous, 1);
}
