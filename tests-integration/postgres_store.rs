//! Registry and shop-floor stores against a throwaway PostgreSQL container.
//!
//! Needs a Docker daemon, so every test is ignored by default:
//!
//! ```text
//! cargo test -p shopfloor-integration-tests --test postgres_store -- --ignored
//! ```
//!
//! Test flow:
//! 1. Start `postgres` in a container and point a `LocalConfig` at it
//! 2. Create the registry and shop-floor tables
//! 3. Drive `PgTenantStore` and `PgMesStore` through real SQL

use std::sync::Arc;

use chrono::{Local, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use testcontainers::clients;
use testcontainers_modules::postgres::Postgres;

use shopfloor::config::{LocalConfig, StatisticsConfig};
use shopfloor::connection::connect;
use shopfloor::mes::model::WorkOrderSource;
use shopfloor::mes::{
    ensure_mes_tables, Dispatch, DispatchStatistics, DispatchStatus, MesStore, NewReport, OrderIdentity,
    PgMesStore, ReportService, StatisticsEngine, WorkOrder, WorkOrderStatus,
};
use shopfloor::tenant::{ensure_tenant_tables, OperationLogEntry, UpstreamCredential};
use shopfloor::{PgExecutor, PgTenantStore, Tenant, TenantStore};

fn local_config(port: u16) -> LocalConfig {
    LocalConfig {
        host: "127.0.0.1".to_string(),
        port,
        admin_user: "postgres".to_string(),
        admin_password: "postgres".to_string(),
        registry_database: "postgres".to_string(),
        maintenance_database: "postgres".to_string(),
    }
}

fn registry(local: &LocalConfig) -> PgExecutor {
    let url = local
        .connection_string(&local.registry_database)
        .expect("Failed to build connection string");
    PgExecutor::new(connect(&url).expect("Failed to connect to container"))
}

fn prepare(local: &LocalConfig) {
    let executor = registry(local);
    ensure_tenant_tables(&executor).expect("Failed to create registry tables");
    ensure_mes_tables(&executor).expect("Failed to create shop-floor tables");
}

fn tenant() -> Tenant {
    Tenant {
        company_code: "10".to_string(),
        company_name: "Acme".to_string(),
        upstream_database: "ERP10".to_string(),
        local_database: "mes_10".to_string(),
        sync_tables: vec!["comCustomer".to_string(), "ordBillMain".to_string()],
        last_sync_version: None,
        last_sync_time: None,
        sync_interval_minutes: 30,
    }
}

#[test]
#[ignore = "needs docker"]
fn test_tenant_registry_round_trip() {
    let docker = clients::Cli::default();
    let node = docker.run(Postgres::default());
    let local = local_config(node.get_host_port_ipv4(5432));
    prepare(&local);
    let store = PgTenantStore::new(registry(&local));

    store.save_tenant(&tenant()).expect("Failed to save tenant");
    let saved = store.tenant("10").expect("Failed to read tenant").expect("tenant missing");
    assert_eq!(saved.sync_tables, tenant().sync_tables);
    assert_eq!(saved.last_sync_version, None);

    let now = Local::now().naive_local();
    store.advance_watermark("10", 42, now).expect("Failed to advance watermark");
    store.advance_watermark("10", 7, now).expect("Failed to advance watermark");
    assert_eq!(store.tenant("10").unwrap().unwrap().last_sync_version, Some(42));

    store.save_tenant(&tenant()).expect("Failed to save tenant");
    assert_eq!(
        store.tenant("10").unwrap().unwrap().last_sync_version,
        Some(42),
        "saving settings must keep the watermark"
    );

    store
        .save_upstream_credential(&UpstreamCredential {
            host: "erp.local".to_string(),
            user: "sync".to_string(),
            password: "secret".to_string(),
        })
        .expect("Failed to save credential");
    assert_eq!(store.upstream_credential().unwrap().map(|c| c.user), Some("sync".to_string()));

    store
        .append_operation_log(&OperationLogEntry::new("admin", "provisioned 10", now))
        .expect("Failed to append log");
    assert_eq!(store.operation_log(10).unwrap().len(), 1);

    assert!(store.remove_tenant("10").unwrap());
    assert!(!store.remove_tenant("10").unwrap());
}

#[test]
#[ignore = "needs docker"]
fn test_tenant_lock_spans_connections() {
    let docker = clients::Cli::default();
    let node = docker.run(Postgres::default());
    let local = local_config(node.get_host_port_ipv4(5432));
    prepare(&local);
    let first = PgTenantStore::new(registry(&local));
    let second = PgTenantStore::new(registry(&local));

    assert!(first.try_lock_tenant("10").expect("Failed to take lock"));
    assert!(!first.try_lock_tenant("10").unwrap(), "same store must not lock twice");
    assert!(!second.try_lock_tenant("10").unwrap(), "other session must be refused");
    assert!(second.try_lock_tenant("20").unwrap());

    first.unlock_tenant("10").expect("Failed to release lock");
    assert!(second.try_lock_tenant("10").unwrap());
}

#[test]
#[ignore = "needs docker"]
fn test_report_recomputes_dispatch() {
    let docker = clients::Cli::default();
    let node = docker.run(Postgres::default());
    let local = local_config(node.get_host_port_ipv4(5432));
    prepare(&local);
    PgTenantStore::new(registry(&local))
        .save_tenant(&tenant())
        .expect("Failed to save tenant");

    let store: Arc<dyn MesStore> = Arc::new(PgMesStore::new(local.clone()));
    let identity = OrderIdentity::new("10", "W1", "P1");
    let dispatch_id = {
        let mut session = store.open().expect("Failed to open session");
        session
            .insert_work_order(&WorkOrder {
                id: 0,
                identity: identity.clone(),
                planned_quantity: 20,
                status: WorkOrderStatus::Pending,
                source: WorkOrderSource::ErpSync,
                created_at: Local::now().naive_local(),
                completed_at: None,
            })
            .expect("Failed to insert work order");
        session
            .insert_dispatch(&Dispatch {
                id: 0,
                identity: identity.clone(),
                company_name: "Acme".to_string(),
                planned_quantity: 20,
                status: DispatchStatus::Pending,
                stats: DispatchStatistics::default(),
                stats_updated_at: None,
            })
            .expect("Failed to insert dispatch")
    };

    let engine = StatisticsEngine::new(Arc::clone(&store), &StatisticsConfig::default());
    let reports = ReportService::new(engine.clone());
    let filed = reports
        .submit(NewReport {
            operator: "Lin".to_string(),
            work_date: NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            operation: StatisticsConfig::default().packaging_operation,
            equipment: None,
            company_name: "Acme".to_string(),
            company_code: None,
            order_number: "W1".to_string(),
            product_code: "P1".to_string(),
            produced_quantity: 20,
            defect_quantity: 0,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            break_hours: None,
        })
        .expect("Failed to submit report");
    assert_eq!(filed.report.work_hours, Decimal::from(4));

    let approved = reports.approve(filed.report.id, "supervisor").expect("Failed to approve");
    let recomputed = approved.recomputation.expect("dispatch not recomputed");
    assert_eq!(recomputed.dispatch_id, dispatch_id);
    assert!(recomputed.stats.can_complete);

    let mut session = store.open().unwrap();
    let work_order = session.work_order_for(&identity).unwrap().unwrap();
    assert_eq!(work_order.status, WorkOrderStatus::Completed);
    assert!(work_order.completed_at.is_some());
    let dispatch = session.dispatch(dispatch_id).unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Completed);
    assert_eq!(dispatch.stats.packaging_total_quantity, 20);
}
