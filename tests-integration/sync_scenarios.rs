//! End-to-end sync runs against the in-memory upstream, replica and registry.
//!
//! Test flow:
//! 1. Seed an upstream ERP database with change tracking on
//! 2. Register a tenant whose table list names the seeded tables
//! 3. Run full and incremental syncs through `SyncExecutor`
//! 4. Check the replica rows, the run report and the tenant watermark

use std::sync::Arc;

use shopfloor::sync::{
    KeyRegistry, LocalValue, SyncExecutor, SyncMode, SyncOutcome, SyncRequest, TableWhitelist, UpstreamColumn,
    UpstreamValue, WhitelistSource,
};
use shopfloor::test_helpers::{MemoryReplicaConnector, MemoryTenantStore, MemoryUpstream};
use shopfloor::{Tenant, TenantStore};

const ERP: &str = "ERP10";
const LOCAL: &str = "mes_10";

struct Harness {
    upstream: MemoryUpstream,
    replicas: MemoryReplicaConnector,
    tenants: MemoryTenantStore,
    executor: SyncExecutor,
}

impl Harness {
    fn new(whitelist: &[&str]) -> Self {
        let upstream = MemoryUpstream::new();
        let replicas = MemoryReplicaConnector::new();
        let tenants = MemoryTenantStore::with_tenants([Tenant {
            company_code: "10".to_string(),
            company_name: "Acme".to_string(),
            upstream_database: ERP.to_string(),
            local_database: LOCAL.to_string(),
            sync_tables: vec!["comCustomer".to_string(), "ordBillMain".to_string()],
            last_sync_version: None,
            last_sync_time: None,
            sync_interval_minutes: 0,
        }]);
        let executor = SyncExecutor::new(
            Arc::new(tenants.clone()),
            Arc::new(upstream.clone()),
            Arc::new(replicas.clone()),
            WhitelistSource::Fixed(TableWhitelist::new(whitelist.iter().copied())),
            KeyRegistry::new(),
        );
        Self {
            upstream,
            replicas,
            tenants,
            executor,
        }
    }

    /// 3 customers and 5 orders.
    fn seed(&self) {
        self.upstream.create_table(
            ERP,
            "comCustomer",
            vec![
                UpstreamColumn::new("Flag", "char").with_length(1),
                UpstreamColumn::new("ID", "nvarchar").with_length(10),
                UpstreamColumn::new("ShortName", "nvarchar").with_length(40),
            ],
            &["Flag", "ID"],
        );
        for (id, name) in [("C001", "Acme Trading"), ("C002", "Globex"), ("C003", "Initech")] {
            self.customer(id, name);
        }

        self.upstream.create_table(
            ERP,
            "ordBillMain",
            vec![
                UpstreamColumn::new("Flag", "char").with_length(1),
                UpstreamColumn::new("BillNO", "nvarchar").with_length(20),
                UpstreamColumn::new("CustID", "nvarchar").with_length(10),
                UpstreamColumn::new("Quantity", "int"),
            ],
            &["Flag", "BillNO"],
        );
        for n in 1..=5 {
            self.upstream.upsert(
                ERP,
                "ordBillMain",
                vec![
                    text("O"),
                    text(&format!("SO-{n:04}")),
                    text("C001"),
                    UpstreamValue::I32(n * 10),
                ],
            );
        }
    }

    fn customer(&self, id: &str, name: &str) {
        self.upstream
            .upsert(ERP, "comCustomer", vec![text("T"), text(id), text(name)]);
    }

    fn run(&self, mode: SyncMode) -> shopfloor::sync::SyncReport {
        self.executor
            .run(&SyncRequest::new("10", mode, "admin"))
            .expect("sync run failed")
    }

    fn watermark(&self) -> Option<i64> {
        self.tenants.tenant("10").expect("registry read failed").and_then(|t| t.last_sync_version)
    }
}

fn text(s: &str) -> UpstreamValue {
    UpstreamValue::Text(s.to_string())
}

fn local_text(s: &str) -> LocalValue {
    LocalValue::Text(s.to_string())
}

#[test]
fn test_fresh_tenant_full_sync() {
    let h = Harness::new(&["comCustomer", "ordBillMain"]);
    h.seed();
    let version_at_start = h.upstream.version(ERP);

    let report = h.run(SyncMode::Full);

    assert_eq!(report.outcome, SyncOutcome::Completed);
    assert_eq!(report.tables_succeeded(), 2);
    assert_eq!(report.rows_affected(), 8);
    assert_eq!(h.replicas.row_count(LOCAL, "comCustomer"), 3);
    assert_eq!(h.replicas.row_count(LOCAL, "ordBillMain"), 5);
    for table in ["comCustomer", "ordBillMain"] {
        let columns = h.replicas.columns(LOCAL, table);
        assert!(columns.iter().any(|c| c == "row_id"), "{table} has no surrogate key");
        assert!(columns.iter().any(|c| c == "updated_at"), "{table} has no updated_at");
        assert_eq!(
            h.replicas.row_count(LOCAL, table),
            h.upstream.row_count(ERP, table),
            "{table} row count differs from upstream"
        );
    }
    assert_eq!(h.watermark(), Some(version_at_start));
    assert!(report.watermark_advanced);
}

#[test]
fn test_incremental_with_no_changes() {
    let h = Harness::new(&["comCustomer", "ordBillMain"]);
    h.seed();
    h.run(SyncMode::Full);
    let before = h.tenants.tenant("10").unwrap().unwrap();

    let report = h.run(SyncMode::Incremental);

    assert_eq!(report.outcome, SyncOutcome::UpToDate);
    assert_eq!(report.tables_attempted(), 0);
    assert_eq!(report.rows_affected(), 0);
    assert!(!report.watermark_advanced);
    let after = h.tenants.tenant("10").unwrap().unwrap();
    assert_eq!(after.last_sync_version, before.last_sync_version);
    assert_eq!(after.last_sync_time, before.last_sync_time);
}

#[test]
fn test_incremental_applies_one_update() {
    let h = Harness::new(&["comCustomer", "ordBillMain"]);
    h.seed();
    h.run(SyncMode::Full);
    let before = h.watermark().unwrap();

    h.customer("C001", "Acme Trading Ltd");
    let report = h.run(SyncMode::Incremental);

    let customers = report.table("comCustomer").expect("comCustomer not attempted");
    assert_eq!(customers.rows_succeeded, 1);
    assert_eq!(customers.rows_failed, 0);
    assert_eq!(report.table("ordBillMain").map(|t| t.rows_succeeded), Some(0));
    assert_eq!(h.replicas.row_count(LOCAL, "comCustomer"), 3);

    let rows = h.replicas.rows(LOCAL, "comCustomer");
    let updated: Vec<_> = rows
        .iter()
        .filter(|r| r.get("Flag") == Some(&local_text("T")) && r.get("ID") == Some(&local_text("C001")))
        .collect();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].get("ShortName"), Some(&local_text("Acme Trading Ltd")));
    assert!(h.watermark().unwrap() > before);
}

#[test]
fn test_watermark_never_moves_back() {
    let h = Harness::new(&["comCustomer", "ordBillMain"]);
    h.seed();
    let mut last = h.watermark().unwrap_or(0);
    let modes = [SyncMode::Full, SyncMode::Incremental, SyncMode::Incremental, SyncMode::Full];
    for (n, mode) in modes.into_iter().enumerate() {
        if n % 2 == 1 {
            h.customer(&format!("N{n:03}"), "New customer");
        }
        h.run(mode);
        let now = h.watermark().unwrap_or(0);
        assert!(now >= last, "watermark went from {last} to {now}");
        last = now;
    }
    assert_eq!(h.replicas.row_count(LOCAL, "comCustomer"), h.upstream.row_count(ERP, "comCustomer"));
}

#[test]
fn test_tables_outside_whitelist_are_refused() {
    let h = Harness::new(&["comCustomer"]);
    h.seed();

    let report = h.run(SyncMode::Full);

    assert_eq!(report.refused_tables, vec!["ordBillMain".to_string()]);
    assert_eq!(report.tables_attempted(), 1);
    assert_eq!(h.replicas.row_count(LOCAL, "ordBillMain"), 0);
}

#[test]
fn test_schema_drift_fails_only_that_table() {
    let h = Harness::new(&["comCustomer", "ordBillMain"]);
    h.seed();
    h.replicas
        .create_bare_table(LOCAL, "comCustomer", &["Flag", "ID", "Fax"]);

    let report = h.run(SyncMode::Incremental);

    let customers = report.table("comCustomer").unwrap();
    assert!(customers.error.as_deref().is_some_and(|e| e.contains("ShortName")));
    assert!(report.table("ordBillMain").unwrap().succeeded());
    assert_eq!(h.replicas.row_count(LOCAL, "ordBillMain"), 5);
    assert!(report.watermark_advanced);
    assert!(h
        .tenants
        .log_entries()
        .iter()
        .any(|e| e.action.contains("10.comCustomer failed")));
}

#[test]
fn test_rejected_row_is_skipped() {
    let h = Harness::new(&["comCustomer"]);
    h.seed();
    h.replicas.reject_text("Globex");

    let report = h.run(SyncMode::Full);

    let customers = report.table("comCustomer").unwrap();
    assert!(customers.succeeded());
    assert_eq!(customers.rows_succeeded, 2);
    assert_eq!(customers.rows_failed, 1);
    assert_eq!(customers.row_failures[0].kind, "row_write_failure");
    assert_eq!(h.replicas.row_count(LOCAL, "comCustomer"), 2);
}

#[test]
fn test_change_tracking_disabled_aborts_run() {
    let h = Harness::new(&["comCustomer"]);
    h.seed();
    h.upstream.disable_change_tracking(ERP);

    let err = h
        .executor
        .run(&SyncRequest::new("10", SyncMode::Incremental, "admin"))
        .unwrap_err();

    assert_eq!(err.kind(), "change_tracking_disabled");
    assert_eq!(h.watermark(), None);
    assert_eq!(h.replicas.row_count(LOCAL, "comCustomer"), 0);
}

#[test]
fn test_unreachable_upstream_aborts_run() {
    let h = Harness::new(&["comCustomer"]);
    h.seed();
    h.upstream.set_unreachable(Some("login failed for user 'sync'"));

    let err = h.executor.run(&SyncRequest::new("10", SyncMode::Full, "admin")).unwrap_err();

    assert_eq!(err.kind(), "upstream_unavailable");
    assert_eq!(h.watermark(), None);
    let log = h.tenants.log_entries();
    assert_eq!(log.len(), 1);
    assert!(log[0].action.contains("login failed"));
}
