//! `PostgreSQL` shop-floor store on the registry database.

use chrono::NaiveDateTime;
use may_postgres::types::{FromSql, ToSql};
use may_postgres::Row;
use std::time::Duration;

use crate::config::LocalConfig;
use crate::connection::connect;
use crate::executor::{DbError, Executor, PgExecutor};
use crate::mes::model::{
    ApprovalStatus, Assignment, CompletedProcess, CompletedWorkOrder, Dispatch, DispatchProcess, DispatchStatistics,
    DispatchStatus, Finding, FindingKind, OnsiteReport, OnsiteStatus, OrderIdentity, ProcessStatus, ProductionRecord,
    Report, ReportPatch, WorkOrder, WorkOrderProcess, WorkOrderSource, WorkOrderStatus,
};
use crate::mes::store::{FixRecord, MesSession, MesStore};
use crate::tenant::TenantDirectory;
use crate::transaction::Transaction;

const WORK_ORDER_COLUMNS: &str =
    "id, company_code, order_number, product_code, planned_quantity, status, source, created_at, completed_at";

const PROCESS_COLUMNS: &str = "id, work_order_id, sequence, operation, planned_quantity, completed_quantity, status, \
     assigned_operator, assigned_equipment, start_date, end_date";

const ASSIGNMENT_COLUMNS: &str = "id, work_order_id, operation, operator, equipment, assigned_date";

const DISPATCH_COLUMNS: &str = "id, company_code, order_number, product_code, company_name, planned_quantity, status, \
     total_good_quantity, total_defect_quantity, total_quantity, \
     packaging_good_quantity, packaging_defect_quantity, packaging_total_quantity, \
     total_work_hours, total_overtime_hours, total_all_hours, \
     report_count, approved_count, pending_count, onsite_report_count, onsite_completed_count, \
     total_processes, completed_processes, pending_processes, \
     completion_rate, packaging_completion_rate, completion_threshold_met, can_complete, \
     last_fillwork_update, last_onsite_update, stats_updated_at";

const DISPATCH_PROCESS_COLUMNS: &str =
    "id, dispatch_id, operation, planned_quantity, completed_quantity, status, end_date";

const REPORT_COLUMNS: &str = "id, operator, work_date, operation, equipment, company_name, company_code, \
     order_number, product_code, produced_quantity, defect_quantity, start_time, end_time, \
     work_hours, overtime_hours, approval_status, approved_by, approved_at, is_completed, updated_at";

const ONSITE_COLUMNS: &str =
    "id, company_code, order_number, product_code, operation, produced_quantity, defect_quantity, status, updated_at";

const FINDING_COLUMNS: &str = "id, kind, report_id, correct_company_code, correct_order_number, correct_product_code, \
     correct_company_name, wrong_company_code, wrong_order_number, wrong_product_code, wrong_company_name, \
     operator, work_date, is_fixed, fixed_by, fixed_at, fix_method, created_at";

const COMPLETED_COLUMNS: &str = "id, work_order_id, company_code, order_number, product_code, company_name, \
     planned_quantity, created_at, started_at, completed_at";

const COMPLETED_PROCESS_COLUMNS: &str = "id, completed_work_order_id, sequence, operation, planned_quantity, \
     completed_quantity, assigned_operator, assigned_equipment, start_date";

fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize, table: &str) -> Result<T, DbError> {
    row.try_get(idx)
        .map_err(|e| DbError::Parse(format!("{table} column {idx}: {e}")))
}

fn label<T>(raw: &str, parse: fn(&str) -> Option<T>, table: &str) -> Result<T, DbError> {
    parse(raw).ok_or_else(|| DbError::Parse(format!("{table}: unknown status '{raw}'")))
}

fn identity(row: &Row, first: usize, table: &str) -> Result<OrderIdentity, DbError> {
    Ok(OrderIdentity {
        company_code: get(row, first, table)?,
        order_number: get(row, first + 1, table)?,
        product_code: get(row, first + 2, table)?,
    })
}

fn work_order_from_row(row: &Row) -> Result<WorkOrder, DbError> {
    const T: &str = "work_orders";
    Ok(WorkOrder {
        id: get(row, 0, T)?,
        identity: identity(row, 1, T)?,
        planned_quantity: get(row, 4, T)?,
        status: label(get(row, 5, T)?, WorkOrderStatus::parse, T)?,
        source: label(get(row, 6, T)?, WorkOrderSource::parse, T)?,
        created_at: get(row, 7, T)?,
        completed_at: get(row, 8, T)?,
    })
}

fn process_from_row(row: &Row) -> Result<WorkOrderProcess, DbError> {
    const T: &str = "work_order_processes";
    Ok(WorkOrderProcess {
        id: get(row, 0, T)?,
        work_order_id: get(row, 1, T)?,
        sequence: get(row, 2, T)?,
        operation: get(row, 3, T)?,
        planned_quantity: get(row, 4, T)?,
        completed_quantity: get(row, 5, T)?,
        status: label(get(row, 6, T)?, ProcessStatus::parse, T)?,
        assigned_operator: get(row, 7, T)?,
        assigned_equipment: get(row, 8, T)?,
        start_date: get(row, 9, T)?,
        end_date: get(row, 10, T)?,
    })
}

fn assignment_from_row(row: &Row) -> Result<Assignment, DbError> {
    const T: &str = "work_order_assignments";
    Ok(Assignment {
        id: get(row, 0, T)?,
        work_order_id: get(row, 1, T)?,
        operation: get(row, 2, T)?,
        operator: get(row, 3, T)?,
        equipment: get(row, 4, T)?,
        assigned_date: get(row, 5, T)?,
    })
}

fn dispatch_from_row(row: &Row) -> Result<Dispatch, DbError> {
    const T: &str = "dispatches";
    Ok(Dispatch {
        id: get(row, 0, T)?,
        identity: identity(row, 1, T)?,
        company_name: get(row, 4, T)?,
        planned_quantity: get(row, 5, T)?,
        status: label(get(row, 6, T)?, DispatchStatus::parse, T)?,
        stats: DispatchStatistics {
            total_good_quantity: get(row, 7, T)?,
            total_defect_quantity: get(row, 8, T)?,
            total_quantity: get(row, 9, T)?,
            packaging_good_quantity: get(row, 10, T)?,
            packaging_defect_quantity: get(row, 11, T)?,
            packaging_total_quantity: get(row, 12, T)?,
            total_work_hours: get(row, 13, T)?,
            total_overtime_hours: get(row, 14, T)?,
            total_all_hours: get(row, 15, T)?,
            report_count: get(row, 16, T)?,
            approved_count: get(row, 17, T)?,
            pending_count: get(row, 18, T)?,
            onsite_report_count: get(row, 19, T)?,
            onsite_completed_count: get(row, 20, T)?,
            total_processes: get(row, 21, T)?,
            completed_processes: get(row, 22, T)?,
            pending_processes: get(row, 23, T)?,
            completion_rate: get(row, 24, T)?,
            packaging_completion_rate: get(row, 25, T)?,
            completion_threshold_met: get(row, 26, T)?,
            can_complete: get(row, 27, T)?,
            last_fillwork_update: get(row, 28, T)?,
            last_onsite_update: get(row, 29, T)?,
        },
        stats_updated_at: get(row, 30, T)?,
    })
}

fn dispatch_process_from_row(row: &Row) -> Result<DispatchProcess, DbError> {
    const T: &str = "dispatch_processes";
    Ok(DispatchProcess {
        id: get(row, 0, T)?,
        dispatch_id: get(row, 1, T)?,
        operation: get(row, 2, T)?,
        planned_quantity: get(row, 3, T)?,
        completed_quantity: get(row, 4, T)?,
        status: label(get(row, 5, T)?, ProcessStatus::parse, T)?,
        end_date: get(row, 6, T)?,
    })
}

fn report_from_row(row: &Row) -> Result<Report, DbError> {
    const T: &str = "fill_work_reports";
    Ok(Report {
        id: get(row, 0, T)?,
        operator: get(row, 1, T)?,
        work_date: get(row, 2, T)?,
        operation: get(row, 3, T)?,
        equipment: get(row, 4, T)?,
        company_name: get(row, 5, T)?,
        company_code: get(row, 6, T)?,
        order_number: get(row, 7, T)?,
        product_code: get(row, 8, T)?,
        produced_quantity: get(row, 9, T)?,
        defect_quantity: get(row, 10, T)?,
        start_time: get(row, 11, T)?,
        end_time: get(row, 12, T)?,
        work_hours: get(row, 13, T)?,
        overtime_hours: get(row, 14, T)?,
        approval: label(get(row, 15, T)?, ApprovalStatus::parse, T)?,
        approved_by: get(row, 16, T)?,
        approved_at: get(row, 17, T)?,
        is_completed: get(row, 18, T)?,
        updated_at: get(row, 19, T)?,
    })
}

fn onsite_from_row(row: &Row) -> Result<OnsiteReport, DbError> {
    const T: &str = "onsite_reports";
    Ok(OnsiteReport {
        id: get(row, 0, T)?,
        identity: identity(row, 1, T)?,
        operation: get(row, 4, T)?,
        produced_quantity: get(row, 5, T)?,
        defect_quantity: get(row, 6, T)?,
        status: label(get(row, 7, T)?, OnsiteStatus::parse, T)?,
        updated_at: get(row, 8, T)?,
    })
}

fn finding_from_row(row: &Row) -> Result<Finding, DbError> {
    const T: &str = "consistency_findings";
    let correct_code: Option<String> = get(row, 3, T)?;
    let correct_order: Option<String> = get(row, 4, T)?;
    let correct_product: Option<String> = get(row, 5, T)?;
    let correct = match (correct_code, correct_order, correct_product) {
        (Some(c), Some(o), Some(p)) => Some(OrderIdentity::new(c, o, p)),
        _ => None,
    };
    Ok(Finding {
        id: get(row, 0, T)?,
        kind: label(get(row, 1, T)?, FindingKind::parse, T)?,
        report_id: get(row, 2, T)?,
        correct,
        correct_company_name: get(row, 6, T)?,
        wrong: identity(row, 7, T)?,
        wrong_company_name: get(row, 10, T)?,
        operator: get(row, 11, T)?,
        work_date: get(row, 12, T)?,
        is_fixed: get(row, 13, T)?,
        fixed_by: get(row, 14, T)?,
        fixed_at: get(row, 15, T)?,
        fix_method: get(row, 16, T)?,
        created_at: get(row, 17, T)?,
    })
}

fn completed_from_row(row: &Row) -> Result<CompletedWorkOrder, DbError> {
    const T: &str = "completed_work_orders";
    Ok(CompletedWorkOrder {
        id: get(row, 0, T)?,
        work_order_id: get(row, 1, T)?,
        identity: identity(row, 2, T)?,
        company_name: get(row, 5, T)?,
        planned_quantity: get(row, 6, T)?,
        created_at: get(row, 7, T)?,
        started_at: get(row, 8, T)?,
        completed_at: get(row, 9, T)?,
    })
}

fn completed_process_from_row(row: &Row) -> Result<CompletedProcess, DbError> {
    const T: &str = "completed_work_order_processes";
    Ok(CompletedProcess {
        id: get(row, 0, T)?,
        completed_work_order_id: get(row, 1, T)?,
        sequence: get(row, 2, T)?,
        operation: get(row, 3, T)?,
        planned_quantity: get(row, 4, T)?,
        completed_quantity: get(row, 5, T)?,
        assigned_operator: get(row, 6, T)?,
        assigned_equipment: get(row, 7, T)?,
        start_date: get(row, 8, T)?,
    })
}

fn returned_id(row: &Row, table: &str) -> Result<i64, DbError> {
    get(row, 0, table)
}

/// Opens [`PgMesSession`]s on the registry database.
pub struct PgMesStore {
    local: LocalConfig,
}

impl PgMesStore {
    pub fn new(local: LocalConfig) -> Self {
        Self { local }
    }
}

impl MesStore for PgMesStore {
    fn open(&self) -> Result<Box<dyn MesSession>, DbError> {
        let conn = self.local.connection_string(&self.local.registry_database)?;
        Ok(Box::new(PgMesSession::new(PgExecutor::new(connect(&conn)?))))
    }
}

/// One registry connection with an optional open transaction and savepoint.
pub struct PgMesSession {
    executor: PgExecutor,
    tx: Option<Transaction>,
    savepoint: Option<Transaction>,
}

impl PgMesSession {
    pub fn new(executor: PgExecutor) -> Self {
        Self {
            executor,
            tx: None,
            savepoint: None,
        }
    }

    fn current(&self) -> &dyn Executor {
        if let Some(sp) = &self.savepoint {
            sp
        } else if let Some(tx) = &self.tx {
            tx
        } else {
            &self.executor
        }
    }

    fn all<T>(&self, sql: &str, params: &[&dyn ToSql], map: fn(&Row) -> Result<T, DbError>) -> Result<Vec<T>, DbError> {
        self.current().query_all(sql, params)?.iter().map(map).collect()
    }

    fn opt<T>(&self, sql: &str, params: &[&dyn ToSql], map: fn(&Row) -> Result<T, DbError>) -> Result<Option<T>, DbError> {
        self.current().query_opt(sql, params)?.as_ref().map(map).transpose()
    }
}

impl MesSession for PgMesSession {
    fn begin(&mut self) -> Result<(), DbError> {
        if self.tx.is_some() {
            return Err(DbError::Other("transaction already open".to_string()));
        }
        self.tx = Some(self.executor.begin()?);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), DbError> {
        self.savepoint = None;
        match self.tx.take() {
            Some(tx) => Ok(tx.commit()?),
            None => Err(DbError::Other("no open transaction".to_string())),
        }
    }

    fn rollback(&mut self) -> Result<(), DbError> {
        self.savepoint = None;
        match self.tx.take() {
            Some(tx) => Ok(tx.rollback()?),
            None => Ok(()),
        }
    }

    fn savepoint(&mut self) -> Result<(), DbError> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| DbError::Other("savepoint outside a transaction".to_string()))?;
        self.savepoint = Some(tx.begin_nested()?);
        Ok(())
    }

    fn release_savepoint(&mut self) -> Result<(), DbError> {
        match self.savepoint.take() {
            Some(sp) => Ok(sp.commit()?),
            None => Err(DbError::Other("no open savepoint".to_string())),
        }
    }

    fn rollback_to_savepoint(&mut self) -> Result<(), DbError> {
        match self.savepoint.take() {
            Some(sp) => Ok(sp.rollback()?),
            None => Err(DbError::Other("no open savepoint".to_string())),
        }
    }

    fn tenant_directory(&mut self) -> Result<TenantDirectory, DbError> {
        let rows = self
            .current()
            .query_all("SELECT company_code, company_name FROM company_config", &[])?;
        let pairs = rows
            .iter()
            .map(|r| Ok((get::<String>(r, 0, "company_config")?, get::<String>(r, 1, "company_config")?)))
            .collect::<Result<Vec<_>, DbError>>()?;
        Ok(TenantDirectory::from_pairs(pairs))
    }

    fn work_orders(&mut self) -> Result<Vec<WorkOrder>, DbError> {
        let sql = format!("SELECT {WORK_ORDER_COLUMNS} FROM work_orders ORDER BY id");
        self.all(&sql, &[], work_order_from_row)
    }

    fn work_order_for(&mut self, identity: &OrderIdentity) -> Result<Option<WorkOrder>, DbError> {
        let sql = format!(
            "SELECT {WORK_ORDER_COLUMNS} FROM work_orders \
             WHERE company_code = $1 AND order_number = $2 AND product_code = $3"
        );
        self.opt(
            &sql,
            &[&identity.company_code, &identity.order_number, &identity.product_code],
            work_order_from_row,
        )
    }

    fn insert_work_order(&mut self, wo: &WorkOrder) -> Result<i64, DbError> {
        let row = self.current().query_one(
            "INSERT INTO work_orders \
             (company_code, order_number, product_code, planned_quantity, status, source, created_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            &[
                &wo.identity.company_code,
                &wo.identity.order_number,
                &wo.identity.product_code,
                &wo.planned_quantity,
                &wo.status.as_str(),
                &wo.source.as_str(),
                &wo.created_at,
                &wo.completed_at,
            ],
        )?;
        returned_id(&row, "work_orders")
    }

    fn set_work_order_status(
        &mut self,
        id: i64,
        status: WorkOrderStatus,
        completed_at: Option<NaiveDateTime>,
    ) -> Result<(), DbError> {
        self.current().execute(
            "UPDATE work_orders SET status = $2, completed_at = $3 WHERE id = $1",
            &[&id, &status.as_str(), &completed_at],
        )?;
        Ok(())
    }

    fn reopen_work_order(&mut self, id: i64, planned_quantity: i64) -> Result<(), DbError> {
        self.current().execute(
            "UPDATE work_orders SET status = 'in_progress', completed_at = NULL, planned_quantity = $2 WHERE id = $1",
            &[&id, &planned_quantity],
        )?;
        Ok(())
    }

    fn delete_work_order(&mut self, id: i64) -> Result<u64, DbError> {
        self.current().execute("DELETE FROM work_orders WHERE id = $1", &[&id])
    }

    fn processes_for(&mut self, work_order_id: i64) -> Result<Vec<WorkOrderProcess>, DbError> {
        let sql = format!("SELECT {PROCESS_COLUMNS} FROM work_order_processes WHERE work_order_id = $1 ORDER BY sequence, id");
        self.all(&sql, &[&work_order_id], process_from_row)
    }

    fn insert_process(&mut self, p: &WorkOrderProcess) -> Result<i64, DbError> {
        let row = self.current().query_one(
            "INSERT INTO work_order_processes \
             (work_order_id, sequence, operation, planned_quantity, completed_quantity, status, \
              assigned_operator, assigned_equipment, start_date, end_date) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING id",
            &[
                &p.work_order_id,
                &p.sequence,
                &p.operation,
                &p.planned_quantity,
                &p.completed_quantity,
                &p.status.as_str(),
                &p.assigned_operator,
                &p.assigned_equipment,
                &p.start_date,
                &p.end_date,
            ],
        )?;
        returned_id(&row, "work_order_processes")
    }

    fn reopen_process(&mut self, id: i64) -> Result<(), DbError> {
        self.current().execute(
            "UPDATE work_order_processes SET status = 'in_progress', end_date = NULL WHERE id = $1",
            &[&id],
        )?;
        Ok(())
    }

    fn assignments_for(&mut self, work_order_id: i64) -> Result<Vec<Assignment>, DbError> {
        let sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM work_order_assignments WHERE work_order_id = $1 ORDER BY id");
        self.all(&sql, &[&work_order_id], assignment_from_row)
    }

    fn insert_assignment(&mut self, a: &Assignment) -> Result<i64, DbError> {
        let row = self.current().query_one(
            "INSERT INTO work_order_assignments (work_order_id, operation, operator, equipment, assigned_date) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
            &[&a.work_order_id, &a.operation, &a.operator, &a.equipment, &a.assigned_date],
        )?;
        returned_id(&row, "work_order_assignments")
    }

    fn production_record(&mut self, work_order_id: i64) -> Result<Option<ProductionRecord>, DbError> {
        self.opt(
            "SELECT work_order_id, status, production_start, production_end \
             FROM production_records WHERE work_order_id = $1",
            &[&work_order_id],
            |row| {
                const T: &str = "production_records";
                Ok(ProductionRecord {
                    work_order_id: get(row, 0, T)?,
                    status: label(get(row, 1, T)?, DispatchStatus::parse, T)?,
                    production_start: get(row, 2, T)?,
                    production_end: get(row, 3, T)?,
                })
            },
        )
    }

    fn save_production_record(&mut self, record: &ProductionRecord) -> Result<(), DbError> {
        self.current().execute(
            "INSERT INTO production_records (work_order_id, status, production_start, production_end) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (work_order_id) DO UPDATE SET status = EXCLUDED.status, \
             production_start = EXCLUDED.production_start, production_end = EXCLUDED.production_end",
            &[
                &record.work_order_id,
                &record.status.as_str(),
                &record.production_start,
                &record.production_end,
            ],
        )?;
        Ok(())
    }

    fn dispatches(&mut self) -> Result<Vec<Dispatch>, DbError> {
        let sql = format!("SELECT {DISPATCH_COLUMNS} FROM dispatches ORDER BY id");
        self.all(&sql, &[], dispatch_from_row)
    }

    fn dispatch(&mut self, id: i64) -> Result<Option<Dispatch>, DbError> {
        let sql = format!("SELECT {DISPATCH_COLUMNS} FROM dispatches WHERE id = $1");
        self.opt(&sql, &[&id], dispatch_from_row)
    }

    fn lock_dispatch(&mut self, id: i64, wait: Duration) -> Result<Option<Dispatch>, DbError> {
        if self.tx.is_none() {
            return Err(DbError::Other("dispatch lock outside a transaction".to_string()));
        }
        // SET does not take parameters; the value is a plain integer.
        let set = format!("SET LOCAL lock_timeout = '{}ms'", wait.as_millis().max(1));
        self.current().execute(&set, &[])?;
        let sql = format!("SELECT {DISPATCH_COLUMNS} FROM dispatches WHERE id = $1 FOR UPDATE");
        self.opt(&sql, &[&id], dispatch_from_row).map_err(|e| {
            if e.is_lock_timeout() {
                DbError::LockTimeout(format!("dispatch {id}"))
            } else {
                e
            }
        })
    }

    fn dispatch_for(&mut self, identity: &OrderIdentity) -> Result<Option<Dispatch>, DbError> {
        let sql = format!(
            "SELECT {DISPATCH_COLUMNS} FROM dispatches \
             WHERE company_code = $1 AND order_number = $2 AND product_code = $3"
        );
        self.opt(
            &sql,
            &[&identity.company_code, &identity.order_number, &identity.product_code],
            dispatch_from_row,
        )
    }

    fn dispatch_ids_by_status(&mut self, status: DispatchStatus) -> Result<Vec<i64>, DbError> {
        self.all(
            "SELECT id FROM dispatches WHERE status = $1 ORDER BY id",
            &[&status.as_str()],
            |row| get(row, 0, "dispatches"),
        )
    }

    fn insert_dispatch(&mut self, d: &Dispatch) -> Result<i64, DbError> {
        let row = self.current().query_one(
            "INSERT INTO dispatches (company_code, order_number, product_code, company_name, planned_quantity, status) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            &[
                &d.identity.company_code,
                &d.identity.order_number,
                &d.identity.product_code,
                &d.company_name,
                &d.planned_quantity,
                &d.status.as_str(),
            ],
        )?;
        let id = returned_id(&row, "dispatches")?;
        if let Some(at) = d.stats_updated_at {
            self.write_dispatch_statistics(id, &d.stats, d.status, at)?;
        }
        Ok(id)
    }

    fn set_dispatch_status(&mut self, id: i64, status: DispatchStatus) -> Result<(), DbError> {
        self.current()
            .execute("UPDATE dispatches SET status = $2 WHERE id = $1", &[&id, &status.as_str()])?;
        Ok(())
    }

    fn write_dispatch_statistics(
        &mut self,
        id: i64,
        s: &DispatchStatistics,
        status: DispatchStatus,
        at: NaiveDateTime,
    ) -> Result<(), DbError> {
        let updated = self.current().execute(
            "UPDATE dispatches SET \
             total_good_quantity = $2, total_defect_quantity = $3, total_quantity = $4, \
             packaging_good_quantity = $5, packaging_defect_quantity = $6, packaging_total_quantity = $7, \
             total_work_hours = $8, total_overtime_hours = $9, total_all_hours = $10, \
             report_count = $11, approved_count = $12, pending_count = $13, \
             onsite_report_count = $14, onsite_completed_count = $15, \
             total_processes = $16, completed_processes = $17, pending_processes = $18, \
             completion_rate = $19, packaging_completion_rate = $20, \
             completion_threshold_met = $21, can_complete = $22, \
             last_fillwork_update = $23, last_onsite_update = $24, \
             status = $25, stats_updated_at = $26 \
             WHERE id = $1",
            &[
                &id,
                &s.total_good_quantity,
                &s.total_defect_quantity,
                &s.total_quantity,
                &s.packaging_good_quantity,
                &s.packaging_defect_quantity,
                &s.packaging_total_quantity,
                &s.total_work_hours,
                &s.total_overtime_hours,
                &s.total_all_hours,
                &s.report_count,
                &s.approved_count,
                &s.pending_count,
                &s.onsite_report_count,
                &s.onsite_completed_count,
                &s.total_processes,
                &s.completed_processes,
                &s.pending_processes,
                &s.completion_rate,
                &s.packaging_completion_rate,
                &s.completion_threshold_met,
                &s.can_complete,
                &s.last_fillwork_update,
                &s.last_onsite_update,
                &status.as_str(),
                &at,
            ],
        )?;
        if updated == 0 {
            return Err(DbError::Query(format!("dispatch {id} does not exist")));
        }
        Ok(())
    }

    fn dispatch_processes(&mut self, dispatch_id: i64) -> Result<Vec<DispatchProcess>, DbError> {
        let sql = format!("SELECT {DISPATCH_PROCESS_COLUMNS} FROM dispatch_processes WHERE dispatch_id = $1 ORDER BY id");
        self.all(&sql, &[&dispatch_id], dispatch_process_from_row)
    }

    fn insert_dispatch_process(&mut self, p: &DispatchProcess) -> Result<i64, DbError> {
        let row = self.current().query_one(
            "INSERT INTO dispatch_processes \
             (dispatch_id, operation, planned_quantity, completed_quantity, status, end_date) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
            &[
                &p.dispatch_id,
                &p.operation,
                &p.planned_quantity,
                &p.completed_quantity,
                &p.status.as_str(),
                &p.end_date,
            ],
        )?;
        returned_id(&row, "dispatch_processes")
    }

    fn reopen_dispatch_process(&mut self, id: i64) -> Result<(), DbError> {
        self.current().execute(
            "UPDATE dispatch_processes SET status = 'in_progress', end_date = NULL WHERE id = $1",
            &[&id],
        )?;
        Ok(())
    }

    fn reports(&mut self) -> Result<Vec<Report>, DbError> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM fill_work_reports ORDER BY id");
        self.all(&sql, &[], report_from_row)
    }

    fn report(&mut self, id: i64) -> Result<Option<Report>, DbError> {
        let sql = format!("SELECT {REPORT_COLUMNS} FROM fill_work_reports WHERE id = $1");
        self.opt(&sql, &[&id], report_from_row)
    }

    fn reports_for(&mut self, order_number: &str, product_code: &str) -> Result<Vec<Report>, DbError> {
        let sql = format!(
            "SELECT {REPORT_COLUMNS} FROM fill_work_reports \
             WHERE order_number = $1 AND product_code = $2 ORDER BY id"
        );
        self.all(&sql, &[&order_number, &product_code], report_from_row)
    }

    fn insert_report(&mut self, r: &Report) -> Result<i64, DbError> {
        let row = self.current().query_one(
            "INSERT INTO fill_work_reports \
             (operator, work_date, operation, equipment, company_name, company_code, order_number, product_code, \
              produced_quantity, defect_quantity, start_time, end_time, work_hours, overtime_hours, \
              approval_status, approved_by, approved_at, is_completed, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19) \
             RETURNING id",
            &[
                &r.operator,
                &r.work_date,
                &r.operation,
                &r.equipment,
                &r.company_name,
                &r.company_code,
                &r.order_number,
                &r.product_code,
                &r.produced_quantity,
                &r.defect_quantity,
                &r.start_time,
                &r.end_time,
                &r.work_hours,
                &r.overtime_hours,
                &r.approval.as_str(),
                &r.approved_by,
                &r.approved_at,
                &r.is_completed,
                &r.updated_at,
            ],
        )?;
        returned_id(&row, "fill_work_reports")
    }

    fn patch_report(&mut self, id: i64, patch: &ReportPatch, at: NaiveDateTime) -> Result<u64, DbError> {
        if patch.is_empty() {
            return Ok(0);
        }
        let mut sets = Vec::new();
        let mut params: Vec<&dyn ToSql> = vec![&id, &at];
        for (column, value) in [
            ("company_name", &patch.company_name),
            ("company_code", &patch.company_code),
            ("order_number", &patch.order_number),
            ("product_code", &patch.product_code),
        ] {
            if let Some(value) = value {
                params.push(value);
                sets.push(format!("{column} = ${}", params.len()));
            }
        }
        let sql = format!(
            "UPDATE fill_work_reports SET {}, updated_at = $2 WHERE id = $1",
            sets.join(", ")
        );
        self.current().execute(&sql, &params)
    }

    fn set_report_approval(
        &mut self,
        id: i64,
        approval: ApprovalStatus,
        approved_by: Option<&str>,
        approved_at: Option<NaiveDateTime>,
    ) -> Result<u64, DbError> {
        self.current().execute(
            "UPDATE fill_work_reports SET approval_status = $2, approved_by = $3, approved_at = $4 WHERE id = $1",
            &[&id, &approval.as_str(), &approved_by, &approved_at],
        )
    }

    fn set_report_completed(&mut self, id: i64, completed: bool) -> Result<u64, DbError> {
        self.current().execute(
            "UPDATE fill_work_reports SET is_completed = $2 WHERE id = $1",
            &[&id, &completed],
        )
    }

    fn delete_report(&mut self, id: i64) -> Result<u64, DbError> {
        self.current()
            .execute("DELETE FROM fill_work_reports WHERE id = $1", &[&id])
    }

    fn onsite_reports_for(&mut self, order_number: &str, product_code: &str) -> Result<Vec<OnsiteReport>, DbError> {
        let sql = format!(
            "SELECT {ONSITE_COLUMNS} FROM onsite_reports WHERE order_number = $1 AND product_code = $2 ORDER BY id"
        );
        self.all(&sql, &[&order_number, &product_code], onsite_from_row)
    }

    fn insert_onsite_report(&mut self, r: &OnsiteReport) -> Result<i64, DbError> {
        let row = self.current().query_one(
            "INSERT INTO onsite_reports \
             (company_code, order_number, product_code, operation, produced_quantity, defect_quantity, status, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
            &[
                &r.identity.company_code,
                &r.identity.order_number,
                &r.identity.product_code,
                &r.operation,
                &r.produced_quantity,
                &r.defect_quantity,
                &r.status.as_str(),
                &r.updated_at,
            ],
        )?;
        returned_id(&row, "onsite_reports")
    }

    fn set_onsite_status(
        &mut self,
        order_number: &str,
        product_code: &str,
        status: OnsiteStatus,
    ) -> Result<u64, DbError> {
        self.current().execute(
            "UPDATE onsite_reports SET status = $3 WHERE order_number = $1 AND product_code = $2",
            &[&order_number, &product_code, &status.as_str()],
        )
    }

    fn process_route_len(&mut self, product_code: &str) -> Result<i64, DbError> {
        let row = self.current().query_one(
            "SELECT COUNT(*) FROM product_process_routes WHERE product_code = $1",
            &[&product_code],
        )?;
        get(&row, 0, "product_process_routes")
    }

    fn save_process_route(&mut self, product_code: &str, operations: &[String]) -> Result<(), DbError> {
        let ex = self.current();
        ex.execute(
            "DELETE FROM product_process_routes WHERE product_code = $1",
            &[&product_code],
        )?;
        for (step, operation) in (1_i32..).zip(operations) {
            ex.execute(
                "INSERT INTO product_process_routes (product_code, step_order, operation) VALUES ($1, $2, $3)",
                &[&product_code, &step, operation],
            )?;
        }
        Ok(())
    }

    fn clear_findings(&mut self, kind: FindingKind) -> Result<u64, DbError> {
        self.current()
            .execute("DELETE FROM consistency_findings WHERE kind = $1", &[&kind.as_str()])
    }

    fn insert_finding(&mut self, f: &Finding) -> Result<i64, DbError> {
        let correct_code = f.correct.as_ref().map(|c| c.company_code.as_str());
        let correct_order = f.correct.as_ref().map(|c| c.order_number.as_str());
        let correct_product = f.correct.as_ref().map(|c| c.product_code.as_str());
        let row = self.current().query_one(
            "INSERT INTO consistency_findings \
             (kind, report_id, correct_company_code, correct_order_number, correct_product_code, correct_company_name, \
              wrong_company_code, wrong_order_number, wrong_product_code, wrong_company_name, \
              operator, work_date, is_fixed, fixed_by, fixed_at, fix_method, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17) RETURNING id",
            &[
                &f.kind.as_str(),
                &f.report_id,
                &correct_code,
                &correct_order,
                &correct_product,
                &f.correct_company_name,
                &f.wrong.company_code,
                &f.wrong.order_number,
                &f.wrong.product_code,
                &f.wrong_company_name,
                &f.operator,
                &f.work_date,
                &f.is_fixed,
                &f.fixed_by,
                &f.fixed_at,
                &f.fix_method,
                &f.created_at,
            ],
        )?;
        returned_id(&row, "consistency_findings")
    }

    fn findings(&mut self, kind: Option<FindingKind>) -> Result<Vec<Finding>, DbError> {
        match kind {
            Some(kind) => {
                let sql = format!(
                    "SELECT {FINDING_COLUMNS} FROM consistency_findings WHERE kind = $1 ORDER BY is_fixed, id"
                );
                self.all(&sql, &[&kind.as_str()], finding_from_row)
            }
            None => {
                let sql = format!("SELECT {FINDING_COLUMNS} FROM consistency_findings ORDER BY is_fixed, id");
                self.all(&sql, &[], finding_from_row)
            }
        }
    }

    fn finding(&mut self, id: i64) -> Result<Option<Finding>, DbError> {
        let sql = format!("SELECT {FINDING_COLUMNS} FROM consistency_findings WHERE id = $1");
        self.opt(&sql, &[&id], finding_from_row)
    }

    fn mark_finding_fixed(&mut self, id: i64, fix: &FixRecord<'_>) -> Result<u64, DbError> {
        self.current().execute(
            "UPDATE consistency_findings SET is_fixed = TRUE, fixed_by = $2, fixed_at = $3, fix_method = $4 \
             WHERE id = $1",
            &[&id, &fix.fixed_by, &fix.fixed_at, &fix.method],
        )
    }

    fn completed_work_order(&mut self, id: i64) -> Result<Option<CompletedWorkOrder>, DbError> {
        let sql = format!("SELECT {COMPLETED_COLUMNS} FROM completed_work_orders WHERE id = $1");
        self.opt(&sql, &[&id], completed_from_row)
    }

    fn completed_work_order_for(&mut self, identity: &OrderIdentity) -> Result<Option<CompletedWorkOrder>, DbError> {
        let sql = format!(
            "SELECT {COMPLETED_COLUMNS} FROM completed_work_orders \
             WHERE company_code = $1 AND order_number = $2 AND product_code = $3 \
             ORDER BY id DESC LIMIT 1"
        );
        self.opt(
            &sql,
            &[&identity.company_code, &identity.order_number, &identity.product_code],
            completed_from_row,
        )
    }

    fn completed_processes(&mut self, completed_id: i64) -> Result<Vec<CompletedProcess>, DbError> {
        let sql = format!(
            "SELECT {COMPLETED_PROCESS_COLUMNS} FROM completed_work_order_processes \
             WHERE completed_work_order_id = $1 ORDER BY sequence, id"
        );
        self.all(&sql, &[&completed_id], completed_process_from_row)
    }

    fn insert_completed_work_order(
        &mut self,
        c: &CompletedWorkOrder,
        processes: &[CompletedProcess],
    ) -> Result<i64, DbError> {
        let ex = self.current();
        let row = ex.query_one(
            "INSERT INTO completed_work_orders \
             (work_order_id, company_code, order_number, product_code, company_name, planned_quantity, \
              created_at, started_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING id",
            &[
                &c.work_order_id,
                &c.identity.company_code,
                &c.identity.order_number,
                &c.identity.product_code,
                &c.company_name,
                &c.planned_quantity,
                &c.created_at,
                &c.started_at,
                &c.completed_at,
            ],
        )?;
        let id = returned_id(&row, "completed_work_orders")?;
        for p in processes {
            ex.execute(
                "INSERT INTO completed_work_order_processes \
                 (completed_work_order_id, sequence, operation, planned_quantity, completed_quantity, \
                  assigned_operator, assigned_equipment, start_date) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &id,
                    &p.sequence,
                    &p.operation,
                    &p.planned_quantity,
                    &p.completed_quantity,
                    &p.assigned_operator,
                    &p.assigned_equipment,
                    &p.start_date,
                ],
            )?;
        }
        Ok(id)
    }

    fn delete_completed_work_order(&mut self, c: &CompletedWorkOrder) -> Result<(), DbError> {
        let ex = self.current();
        ex.execute(
            "DELETE FROM completed_production_reports WHERE completed_work_order_id = $1",
            &[&c.id],
        )?;
        ex.execute(
            "DELETE FROM completed_work_order_processes WHERE completed_work_order_id = $1",
            &[&c.id],
        )?;
        ex.execute(
            "DELETE FROM completed_work_order_analysis WHERE work_order_id = $1 AND company_code = $2",
            &[&c.work_order_id, &c.identity.company_code],
        )?;
        ex.execute("DELETE FROM completed_work_orders WHERE id = $1", &[&c.id])?;
        Ok(())
    }
}
