//! Registry-database tables for the shop-floor records.

use crate::executor::{DbError, Executor};

const MES_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS work_orders (
        id BIGSERIAL PRIMARY KEY,
        company_code VARCHAR(20) NOT NULL,
        order_number VARCHAR(100) NOT NULL,
        product_code VARCHAR(100) NOT NULL,
        planned_quantity BIGINT NOT NULL DEFAULT 0,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        source VARCHAR(20) NOT NULL DEFAULT 'manual',
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        completed_at TIMESTAMP,
        UNIQUE (company_code, order_number, product_code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS work_order_processes (
        id BIGSERIAL PRIMARY KEY,
        work_order_id BIGINT NOT NULL REFERENCES work_orders (id) ON DELETE CASCADE,
        sequence INTEGER NOT NULL DEFAULT 0,
        operation VARCHAR(100) NOT NULL,
        planned_quantity BIGINT NOT NULL DEFAULT 0,
        completed_quantity BIGINT NOT NULL DEFAULT 0,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        assigned_operator VARCHAR(100),
        assigned_equipment VARCHAR(100),
        start_date DATE,
        end_date DATE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS work_order_assignments (
        id BIGSERIAL PRIMARY KEY,
        work_order_id BIGINT NOT NULL REFERENCES work_orders (id) ON DELETE CASCADE,
        operation VARCHAR(100) NOT NULL,
        operator VARCHAR(100) NOT NULL,
        equipment VARCHAR(100),
        assigned_date DATE NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS production_records (
        work_order_id BIGINT PRIMARY KEY REFERENCES work_orders (id) ON DELETE CASCADE,
        status VARCHAR(20) NOT NULL,
        production_start TIMESTAMP,
        production_end TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dispatches (
        id BIGSERIAL PRIMARY KEY,
        company_code VARCHAR(20) NOT NULL,
        company_name VARCHAR(100) NOT NULL DEFAULT '',
        order_number VARCHAR(100) NOT NULL,
        product_code VARCHAR(100) NOT NULL,
        planned_quantity BIGINT NOT NULL DEFAULT 0,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        total_good_quantity BIGINT NOT NULL DEFAULT 0,
        total_defect_quantity BIGINT NOT NULL DEFAULT 0,
        total_quantity BIGINT NOT NULL DEFAULT 0,
        packaging_good_quantity BIGINT NOT NULL DEFAULT 0,
        packaging_defect_quantity BIGINT NOT NULL DEFAULT 0,
        packaging_total_quantity BIGINT NOT NULL DEFAULT 0,
        total_work_hours NUMERIC(12,2) NOT NULL DEFAULT 0,
        total_overtime_hours NUMERIC(12,2) NOT NULL DEFAULT 0,
        total_all_hours NUMERIC(12,2) NOT NULL DEFAULT 0,
        report_count BIGINT NOT NULL DEFAULT 0,
        approved_count BIGINT NOT NULL DEFAULT 0,
        pending_count BIGINT NOT NULL DEFAULT 0,
        onsite_report_count BIGINT NOT NULL DEFAULT 0,
        onsite_completed_count BIGINT NOT NULL DEFAULT 0,
        total_processes BIGINT NOT NULL DEFAULT 0,
        completed_processes BIGINT NOT NULL DEFAULT 0,
        pending_processes BIGINT NOT NULL DEFAULT 0,
        completion_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
        packaging_completion_rate DOUBLE PRECISION NOT NULL DEFAULT 0,
        completion_threshold_met BOOLEAN NOT NULL DEFAULT FALSE,
        can_complete BOOLEAN NOT NULL DEFAULT FALSE,
        last_fillwork_update TIMESTAMP,
        last_onsite_update TIMESTAMP,
        stats_updated_at TIMESTAMP,
        UNIQUE (company_code, order_number, product_code)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dispatch_processes (
        id BIGSERIAL PRIMARY KEY,
        dispatch_id BIGINT NOT NULL REFERENCES dispatches (id) ON DELETE CASCADE,
        operation VARCHAR(100) NOT NULL,
        planned_quantity BIGINT NOT NULL DEFAULT 0,
        completed_quantity BIGINT NOT NULL DEFAULT 0,
        status VARCHAR(20) NOT NULL DEFAULT 'pending',
        end_date DATE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS fill_work_reports (
        id BIGSERIAL PRIMARY KEY,
        operator VARCHAR(100) NOT NULL,
        work_date DATE NOT NULL,
        operation VARCHAR(100) NOT NULL,
        equipment VARCHAR(100),
        company_name VARCHAR(100) NOT NULL DEFAULT '',
        company_code VARCHAR(20),
        order_number VARCHAR(100) NOT NULL,
        product_code VARCHAR(100) NOT NULL,
        produced_quantity BIGINT NOT NULL DEFAULT 0,
        defect_quantity BIGINT NOT NULL DEFAULT 0,
        start_time TIME NOT NULL,
        end_time TIME NOT NULL,
        work_hours NUMERIC(10,2) NOT NULL DEFAULT 0,
        overtime_hours NUMERIC(10,2) NOT NULL DEFAULT 0,
        approval_status VARCHAR(20) NOT NULL DEFAULT 'pending',
        approved_by VARCHAR(100),
        approved_at TIMESTAMP,
        is_completed BOOLEAN NOT NULL DEFAULT FALSE,
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS fill_work_reports_order_product ON fill_work_reports (order_number, product_code)",
    r#"
    CREATE TABLE IF NOT EXISTS onsite_reports (
        id BIGSERIAL PRIMARY KEY,
        company_code VARCHAR(20) NOT NULL,
        order_number VARCHAR(100) NOT NULL,
        product_code VARCHAR(100) NOT NULL,
        operation VARCHAR(100) NOT NULL,
        produced_quantity BIGINT NOT NULL DEFAULT 0,
        defect_quantity BIGINT NOT NULL DEFAULT 0,
        status VARCHAR(20) NOT NULL DEFAULT 'in_progress',
        updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS product_process_routes (
        id BIGSERIAL PRIMARY KEY,
        product_code VARCHAR(100) NOT NULL,
        step_order INTEGER NOT NULL,
        operation VARCHAR(100) NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS consistency_findings (
        id BIGSERIAL PRIMARY KEY,
        kind VARCHAR(30) NOT NULL,
        report_id BIGINT NOT NULL,
        correct_company_code VARCHAR(20),
        correct_order_number VARCHAR(100),
        correct_product_code VARCHAR(100),
        correct_company_name VARCHAR(100),
        wrong_company_code VARCHAR(20) NOT NULL DEFAULT '',
        wrong_order_number VARCHAR(100) NOT NULL,
        wrong_product_code VARCHAR(100) NOT NULL,
        wrong_company_name VARCHAR(100) NOT NULL DEFAULT '',
        operator VARCHAR(100) NOT NULL DEFAULT '',
        work_date DATE NOT NULL,
        is_fixed BOOLEAN NOT NULL DEFAULT FALSE,
        fixed_by VARCHAR(100),
        fixed_at TIMESTAMP,
        fix_method VARCHAR(50),
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS completed_work_orders (
        id BIGSERIAL PRIMARY KEY,
        work_order_id BIGINT NOT NULL,
        company_code VARCHAR(20) NOT NULL,
        order_number VARCHAR(100) NOT NULL,
        product_code VARCHAR(100) NOT NULL,
        company_name VARCHAR(100) NOT NULL DEFAULT '',
        planned_quantity BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL,
        started_at TIMESTAMP,
        completed_at TIMESTAMP NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS completed_work_order_processes (
        id BIGSERIAL PRIMARY KEY,
        completed_work_order_id BIGINT NOT NULL REFERENCES completed_work_orders (id) ON DELETE CASCADE,
        sequence INTEGER NOT NULL DEFAULT 0,
        operation VARCHAR(100) NOT NULL,
        planned_quantity BIGINT NOT NULL DEFAULT 0,
        completed_quantity BIGINT NOT NULL DEFAULT 0,
        assigned_operator VARCHAR(100),
        assigned_equipment VARCHAR(100),
        start_date DATE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS completed_production_reports (
        id BIGSERIAL PRIMARY KEY,
        completed_work_order_id BIGINT NOT NULL REFERENCES completed_work_orders (id) ON DELETE CASCADE,
        report_date DATE NOT NULL,
        operation VARCHAR(100) NOT NULL,
        operator VARCHAR(100) NOT NULL DEFAULT '',
        produced_quantity BIGINT NOT NULL DEFAULT 0,
        defect_quantity BIGINT NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS completed_work_order_analysis (
        id BIGSERIAL PRIMARY KEY,
        work_order_id BIGINT NOT NULL,
        company_code VARCHAR(20) NOT NULL,
        total_quantity BIGINT NOT NULL DEFAULT 0,
        total_hours NUMERIC(12,2) NOT NULL DEFAULT 0,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
];

/// Create the shop-floor tables if missing.
///
/// # Errors
///
/// Returns `DbError` if any statement fails.
pub fn ensure_mes_tables(executor: &dyn Executor) -> Result<(), DbError> {
    for sql in MES_TABLES {
        executor.execute(sql, &[])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_tables_are_unique_on_triple() {
        for table in ["work_orders", "dispatches"] {
            let ddl = MES_TABLES
                .iter()
                .find(|sql| sql.contains(&format!("CREATE TABLE IF NOT EXISTS {table} ")))
                .unwrap();
            assert!(ddl.contains("UNIQUE (company_code, order_number, product_code)"), "{table}");
        }
    }

    #[test]
    fn test_ensure_runs_every_statement() {
        let executor = crate::test_helpers::RecordingExecutor::new();
        ensure_mes_tables(&executor).unwrap();
        assert_eq!(executor.statements().len(), MES_TABLES.len());
    }
}
