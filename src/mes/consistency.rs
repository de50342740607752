//! Consistency checks between reports and work orders.
//!
//! Every report should name the (company, order, product) of exactly one
//! work order. The checks find reports that do not, and the correctors
//! rewrite the one field that is wrong when the work orders leave a single
//! candidate. Several candidates are never guessed between: the report is
//! skipped and listed as ambiguous.

use chrono::{Local, NaiveDateTime};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;
#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

use crate::config::ConsistencyConfig;
use crate::executor::DbError;
use crate::mes::model::{Dispatch, Finding, FindingKind, OrderIdentity, Report, ReportPatch, WorkOrder};
use crate::mes::statistics::StatisticsEngine;
use crate::mes::store::{in_transaction, FixRecord, MesSession, MesStore};
use crate::tenant::TenantDirectory;

/// Fix method recorded when a corrector rewrites a report.
pub const AUTO_CORRECT_METHOD: &str = "auto_correct";

#[derive(Debug)]
pub enum ConsistencyError {
    FindingNotFound(i64),
    ReportNotFound(i64),
    /// No automatic corrector exists for this kind.
    NotCorrectable(FindingKind),
    Invalid(String),
    Store(DbError),
}

impl fmt::Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsistencyError::FindingNotFound(id) => write!(f, "Finding {id} does not exist"),
            ConsistencyError::ReportNotFound(id) => write!(f, "Report {id} does not exist"),
            ConsistencyError::NotCorrectable(kind) => write!(f, "Findings of kind {kind} have no corrector"),
            ConsistencyError::Invalid(reason) => write!(f, "Invalid resolution: {reason}"),
            ConsistencyError::Store(e) => write!(f, "Consistency store failed: {e}"),
        }
    }
}

impl std::error::Error for ConsistencyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConsistencyError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DbError> for ConsistencyError {
    fn from(e: DbError) -> Self {
        ConsistencyError::Store(e)
    }
}

/// Work orders indexed by each pair of identity fields.
pub struct WorkOrderIndex {
    exact: HashSet<OrderIdentity>,
    by_company_order: HashMap<(String, String), Vec<OrderIdentity>>,
    by_order_product: HashMap<(String, String), Vec<OrderIdentity>>,
    by_company_product: HashMap<(String, String), Vec<OrderIdentity>>,
}

impl WorkOrderIndex {
    pub fn new(work_orders: &[WorkOrder]) -> Self {
        let mut index = Self {
            exact: HashSet::new(),
            by_company_order: HashMap::new(),
            by_order_product: HashMap::new(),
            by_company_product: HashMap::new(),
        };
        for wo in work_orders {
            let id = &wo.identity;
            if !index.exact.insert(id.clone()) {
                continue;
            }
            index
                .by_company_order
                .entry((id.company_code.clone(), id.order_number.clone()))
                .or_default()
                .push(id.clone());
            index
                .by_order_product
                .entry((id.order_number.clone(), id.product_code.clone()))
                .or_default()
                .push(id.clone());
            index
                .by_company_product
                .entry((id.company_code.clone(), id.product_code.clone()))
                .or_default()
                .push(id.clone());
        }
        index
    }

    pub fn contains(&self, identity: &OrderIdentity) -> bool {
        self.exact.contains(identity)
    }

    fn lookup(map: &HashMap<(String, String), Vec<OrderIdentity>>, a: &str, b: &str) -> Vec<OrderIdentity> {
        map.get(&(a.to_string(), b.to_string())).cloned().unwrap_or_default()
    }

    /// Work orders the report could have meant for `kind`, given the
    /// company the report resolves to. Empty when the report already
    /// matches a work order exactly.
    pub fn candidates(&self, kind: FindingKind, report: &Report, company: Option<&str>) -> Vec<OrderIdentity> {
        if let Some(code) = company {
            if self.contains(&OrderIdentity::new(code, &report.order_number, &report.product_code)) {
                return Vec::new();
            }
        }
        match (kind, company) {
            (FindingKind::WrongProduct, Some(code)) => {
                Self::lookup(&self.by_company_order, code, &report.order_number)
            }
            (FindingKind::WrongWorkorder, Some(code)) => {
                Self::lookup(&self.by_company_product, code, &report.product_code)
            }
            (FindingKind::WrongCompany, _) => {
                Self::lookup(&self.by_order_product, &report.order_number, &report.product_code)
                    .into_iter()
                    .filter(|wo| Some(wo.company_code.as_str()) != company)
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

/// Dispatch identities, with an (order, product) index for reports that
/// carry no company at all.
pub struct DispatchIndex {
    exact: HashSet<OrderIdentity>,
    order_product: HashSet<(String, String)>,
}

impl DispatchIndex {
    pub fn new(dispatches: &[Dispatch]) -> Self {
        Self {
            exact: dispatches.iter().map(|d| d.identity.clone()).collect(),
            order_product: dispatches
                .iter()
                .map(|d| (d.identity.order_number.clone(), d.identity.product_code.clone()))
                .collect(),
        }
    }

    /// Whether the report has a dispatch. A report with neither company
    /// code nor name matches on order and product alone; a company name
    /// that does not resolve matches nothing.
    pub fn has_dispatch(&self, report: &Report, company: Option<&str>) -> bool {
        match company {
            Some(code) => self
                .exact
                .contains(&OrderIdentity::new(code, &report.order_number, &report.product_code)),
            None if has_no_company(report) => self
                .order_product
                .contains(&(report.order_number.clone(), report.product_code.clone())),
            None => false,
        }
    }
}

fn has_no_company(report: &Report) -> bool {
    report.company_name.trim().is_empty() && report.company_code.as_deref().map_or(true, |c| c.trim().is_empty())
}

/// Totals of one check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub checked: usize,
    pub findings: usize,
    pub ambiguous: usize,
}

/// A report skipped because more than one work order fits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ambiguity {
    pub report_id: i64,
    pub candidates: Vec<OrderIdentity>,
}

/// One planned or applied rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    pub finding_id: i64,
    pub report_id: i64,
    pub field: &'static str,
    pub old_value: String,
    pub new_value: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionError {
    pub finding_id: i64,
    pub report_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionReport {
    pub kind: FindingKind,
    pub dry_run: bool,
    pub total_checked: usize,
    pub total_corrected: usize,
    pub total_skipped: usize,
    pub corrections: Vec<Correction>,
    pub errors: Vec<CorrectionError>,
    pub ambiguous: Vec<Ambiguity>,
}

impl CorrectionReport {
    fn new(kind: FindingKind, dry_run: bool) -> Self {
        Self {
            kind,
            dry_run,
            total_checked: 0,
            total_corrected: 0,
            total_skipped: 0,
            corrections: Vec::new(),
            errors: Vec::new(),
            ambiguous: Vec::new(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} correction{}: checked {}, corrected {}, skipped {}, errors {}, ambiguous {}",
            self.kind,
            if self.dry_run { " (dry run)" } else { "" },
            self.total_checked,
            self.total_corrected,
            self.total_skipped,
            self.errors.len(),
            self.ambiguous.len()
        )
    }
}

/// How an operator settles a finding by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixMethod {
    DeleteReport,
    UpdateReport(ReportPatch),
    MarkOnly,
}

impl FixMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixMethod::DeleteReport => "delete_report",
            FixMethod::UpdateReport(_) => "update_report",
            FixMethod::MarkOnly => "mark_only",
        }
    }
}

fn correction_field(kind: FindingKind) -> Option<&'static str> {
    match kind {
        FindingKind::WrongProduct => Some("product_code"),
        FindingKind::WrongWorkorder => Some("order_number"),
        FindingKind::WrongCompany => Some("company_name"),
        FindingKind::MissingDispatch => None,
    }
}

pub struct ConsistencyService {
    store: Arc<dyn MesStore>,
    config: ConsistencyConfig,
    statistics: Option<StatisticsEngine>,
}

impl ConsistencyService {
    pub fn new(store: Arc<dyn MesStore>, config: ConsistencyConfig) -> Self {
        Self {
            store,
            config,
            statistics: None,
        }
    }

    /// Recompute affected dispatches after corrections and resolutions commit.
    pub fn with_statistics(mut self, engine: StatisticsEngine) -> Self {
        self.statistics = Some(engine);
        self
    }

    /// R&D sample reports are outside every check.
    pub fn is_rd_sample(&self, report: &Report) -> bool {
        self.config
            .rd_sample_markers
            .iter()
            .any(|m| *m == report.order_number || *m == report.product_code)
    }

    /// Reports correctors must leave alone.
    pub fn is_protected(&self, report: &Report) -> bool {
        self.is_rd_sample(report)
            || (!self.config.rd_order_fragment.is_empty() && report.order_number.contains(&self.config.rd_order_fragment))
            || self.config.protected_products.iter().any(|p| *p == report.product_code)
    }

    /// Findings of `kind` over the given records, without touching storage.
    pub fn detect(
        &self,
        kind: FindingKind,
        reports: &[Report],
        work_orders: &WorkOrderIndex,
        dispatches: &DispatchIndex,
        directory: &TenantDirectory,
        now: NaiveDateTime,
    ) -> (Vec<Finding>, CheckSummary) {
        let mut summary = CheckSummary::default();
        let mut findings = Vec::new();
        for report in reports.iter().filter(|r| !self.is_rd_sample(r)) {
            summary.checked += 1;
            let company = directory.resolve(report.company_code.as_deref(), &report.company_name);
            let wrong = OrderIdentity::new(
                company.clone().unwrap_or_default(),
                &report.order_number,
                &report.product_code,
            );
            let finding = |correct: Option<OrderIdentity>| Finding {
                id: 0,
                kind,
                report_id: report.id,
                correct_company_name: correct
                    .as_ref()
                    .and_then(|c| directory.name_for(&c.company_code))
                    .map(str::to_string),
                correct,
                wrong: wrong.clone(),
                wrong_company_name: report.company_name.clone(),
                operator: report.operator.clone(),
                work_date: report.work_date,
                is_fixed: false,
                fixed_by: None,
                fixed_at: None,
                fix_method: None,
                created_at: now,
            };

            if kind == FindingKind::MissingDispatch {
                if !dispatches.has_dispatch(report, company.as_deref()) {
                    findings.push(finding(None));
                }
                continue;
            }

            let candidates = work_orders.candidates(kind, report, company.as_deref());
            match candidates.len() {
                0 => {}
                1 => findings.push(finding(candidates.into_iter().next())),
                _ => {
                    summary.ambiguous += 1;
                    log::warn!(
                        "{kind}: report {} fits {} work orders, not recorded",
                        report.id,
                        candidates.len()
                    );
                }
            }
        }
        summary.findings = findings.len();
        (findings, summary)
    }

    /// Run the check for `kind`, replacing its previous findings.
    ///
    /// # Errors
    ///
    /// `Store`; the previous findings stay in place.
    pub fn run_check(&self, kind: FindingKind) -> Result<CheckSummary, ConsistencyError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::consistency_span(kind.as_str()).entered();

        let mut session = self.store.open()?;
        let summary = in_transaction(session.as_mut(), |s| self.check_in(s, kind))?;
        log::info!(
            "{kind} check: {} reports, {} findings, {} ambiguous",
            summary.checked,
            summary.findings,
            summary.ambiguous
        );
        Ok(summary)
    }

    fn check_in(&self, session: &mut dyn MesSession, kind: FindingKind) -> Result<CheckSummary, ConsistencyError> {
        let reports = session.reports()?;
        let work_orders = WorkOrderIndex::new(&session.work_orders()?);
        let dispatches = DispatchIndex::new(&session.dispatches()?);
        let directory = session.tenant_directory()?;
        let (findings, summary) = self.detect(
            kind,
            &reports,
            &work_orders,
            &dispatches,
            &directory,
            Local::now().naive_local(),
        );
        session.clear_findings(kind)?;
        for finding in &findings {
            session.insert_finding(finding)?;
        }
        Ok(summary)
    }

    /// Run all four checks; each is its own transaction.
    ///
    /// # Errors
    ///
    /// The first failing check's error. Checks already run keep their results.
    pub fn run_all_checks(&self) -> Result<Vec<(FindingKind, CheckSummary)>, ConsistencyError> {
        let mut results = Vec::with_capacity(FindingKind::ALL.len());
        for kind in FindingKind::ALL {
            results.push((kind, self.run_check(kind)?));
        }
        let total: usize = results.iter().map(|(_, s)| s.findings).sum();
        log::info!("consistency checks finished, {total} findings");
        Ok(results)
    }

    /// Correct the open findings of `kind` in one transaction. A dry run
    /// plans the same corrections and rolls everything back.
    ///
    /// # Errors
    ///
    /// `NotCorrectable` for missing-dispatch findings, `Store` if the
    /// transaction itself fails. Errors on single reports are collected in
    /// the report instead.
    pub fn correct(&self, kind: FindingKind, dry_run: bool, actor: &str) -> Result<CorrectionReport, ConsistencyError> {
        let field = correction_field(kind).ok_or(ConsistencyError::NotCorrectable(kind))?;

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::consistency_span(kind.as_str()).entered();

        let mut session = self.store.open()?;
        session.begin()?;
        let result = self.correct_in(session.as_mut(), kind, field, dry_run, actor);
        let report = match result {
            Ok(report) if !dry_run => {
                session.commit()?;
                report
            }
            Ok(report) => {
                session.rollback()?;
                report
            }
            Err(e) => {
                if let Err(rollback) = session.rollback() {
                    log::warn!("rollback after failed correction also failed: {rollback}");
                }
                return Err(e);
            }
        };

        #[cfg(feature = "metrics")]
        if !dry_run {
            METRICS.record_corrections(kind.as_str(), report.total_corrected as u64);
        }
        log::info!("{}", report.summary());

        if !dry_run {
            self.recompute_after(session.as_mut(), &report.corrections);
        }
        Ok(report)
    }

    fn correct_in(
        &self,
        session: &mut dyn MesSession,
        kind: FindingKind,
        field: &'static str,
        dry_run: bool,
        actor: &str,
    ) -> Result<CorrectionReport, ConsistencyError> {
        let mut report = CorrectionReport::new(kind, dry_run);
        let work_orders = WorkOrderIndex::new(&session.work_orders()?);
        let directory = session.tenant_directory()?;
        let now = Local::now().naive_local();

        for finding in session.findings(Some(kind))?.into_iter().filter(|f| !f.is_fixed) {
            report.total_checked += 1;
            let Some(target) = session.report(finding.report_id)? else {
                report.total_skipped += 1;
                continue;
            };
            if self.is_protected(&target) {
                report.total_skipped += 1;
                continue;
            }

            let company = directory.resolve(target.company_code.as_deref(), &target.company_name);
            let mut candidates = work_orders.candidates(kind, &target, company.as_deref());
            if candidates.len() > 1 {
                log::warn!("{kind}: report {} fits {} work orders, skipped", target.id, candidates.len());
                report.total_skipped += 1;
                report.ambiguous.push(Ambiguity {
                    report_id: target.id,
                    candidates,
                });
                continue;
            }
            let Some(correct) = candidates.pop() else {
                report.total_skipped += 1;
                continue;
            };

            let (patch, old_value, new_value) = match kind {
                FindingKind::WrongProduct => (
                    ReportPatch {
                        product_code: Some(correct.product_code.clone()),
                        ..ReportPatch::default()
                    },
                    target.product_code.clone(),
                    correct.product_code.clone(),
                ),
                FindingKind::WrongWorkorder => (
                    ReportPatch {
                        order_number: Some(correct.order_number.clone()),
                        ..ReportPatch::default()
                    },
                    target.order_number.clone(),
                    correct.order_number.clone(),
                ),
                _ => {
                    let Some(name) = directory.name_for(&correct.company_code) else {
                        report.errors.push(CorrectionError {
                            finding_id: finding.id,
                            report_id: target.id,
                            reason: format!("no tenant named for company {}", correct.company_code),
                        });
                        continue;
                    };
                    (
                        ReportPatch {
                            company_name: Some(name.to_string()),
                            company_code: target.company_code.as_ref().map(|_| correct.company_code.clone()),
                            ..ReportPatch::default()
                        },
                        target.company_name.clone(),
                        name.to_string(),
                    )
                }
            };

            let fix = FixRecord {
                fixed_by: actor,
                fixed_at: now,
                method: AUTO_CORRECT_METHOD,
            };
            session.savepoint()?;
            let applied = session
                .patch_report(target.id, &patch, now)
                .and_then(|_| session.mark_finding_fixed(finding.id, &fix));
            match applied {
                Ok(_) => {
                    session.release_savepoint()?;
                    report.total_corrected += 1;
                    report.corrections.push(Correction {
                        finding_id: finding.id,
                        report_id: target.id,
                        field,
                        old_value,
                        new_value,
                        reason: format!("single work order {correct} matches the other two fields"),
                    });
                }
                Err(e) => {
                    session.rollback_to_savepoint()?;
                    log::error!("{kind}: correcting report {} failed: {e}", target.id);
                    report.errors.push(CorrectionError {
                        finding_id: finding.id,
                        report_id: target.id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    /// Settle one finding by hand.
    ///
    /// # Errors
    ///
    /// `FindingNotFound`, `ReportNotFound` for an update of a deleted
    /// report, `Invalid` for an empty update, or `Store`.
    pub fn resolve_finding(&self, finding_id: i64, method: &FixMethod, actor: &str) -> Result<Finding, ConsistencyError> {
        if let FixMethod::UpdateReport(patch) = method {
            if patch.is_empty() {
                return Err(ConsistencyError::Invalid("update_report needs at least one field".to_string()));
            }
        }
        let mut session = self.store.open()?;
        let (finding, touched) = in_transaction(session.as_mut(), |s| {
            let finding = s
                .finding(finding_id)?
                .ok_or(ConsistencyError::FindingNotFound(finding_id))?;
            let before = s.report(finding.report_id)?;
            let now = Local::now().naive_local();
            match method {
                FixMethod::DeleteReport => {
                    let deleted = s.delete_report(finding.report_id)?;
                    log::info!("finding {finding_id}: deleted report {} ({deleted} row)", finding.report_id);
                }
                FixMethod::UpdateReport(patch) => {
                    if s.patch_report(finding.report_id, patch, now)? == 0 {
                        return Err(ConsistencyError::ReportNotFound(finding.report_id));
                    }
                }
                FixMethod::MarkOnly => {}
            }
            let after = s.report(finding.report_id)?;
            s.mark_finding_fixed(
                finding_id,
                &FixRecord {
                    fixed_by: actor,
                    fixed_at: now,
                    method: method.as_str(),
                },
            )?;
            let finding = s
                .finding(finding_id)?
                .ok_or(ConsistencyError::FindingNotFound(finding_id))?;
            Ok((finding, [before, after]))
        })?;
        log::info!("finding {finding_id} resolved by {actor} with {}", method.as_str());

        if *method != FixMethod::MarkOnly {
            self.recompute_reports(session.as_mut(), touched.iter().flatten());
        }
        Ok(finding)
    }

    fn recompute_after(&self, session: &mut dyn MesSession, corrections: &[Correction]) {
        let ids: HashSet<i64> = corrections.iter().map(|c| c.report_id).collect();
        let mut reports = Vec::new();
        for id in ids {
            match session.report(id) {
                Ok(Some(report)) => reports.push(report),
                Ok(None) => {}
                Err(e) => log::warn!("cannot reload corrected report {id}: {e}"),
            }
        }
        self.recompute_reports(session, reports.iter());
    }

    /// Best effort: the corrections already committed.
    fn recompute_reports<'a>(&self, session: &mut dyn MesSession, reports: impl Iterator<Item = &'a Report>) {
        let Some(engine) = &self.statistics else {
            return;
        };
        let directory = match session.tenant_directory() {
            Ok(d) => d,
            Err(e) => {
                log::warn!("dispatch statistics not refreshed: {e}");
                return;
            }
        };
        let identities: HashSet<OrderIdentity> = reports
            .filter_map(|r| {
                directory
                    .resolve(r.company_code.as_deref(), &r.company_name)
                    .map(|code| OrderIdentity::new(code, &r.order_number, &r.product_code))
            })
            .collect();
        for identity in identities {
            if let Err(e) = engine.recompute_for(&identity) {
                log::warn!("dispatch {identity} not refreshed after correction: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mes::model::{ApprovalStatus, DispatchStatistics, DispatchStatus, WorkOrderSource, WorkOrderStatus};
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal::Decimal;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 2).unwrap().and_hms_opt(9, 0, 0).unwrap()
    }

    fn work_order(code: &str, order: &str, product: &str) -> WorkOrder {
        WorkOrder {
            id: 1,
            identity: OrderIdentity::new(code, order, product),
            planned_quantity: 100,
            status: WorkOrderStatus::InProgress,
            source: WorkOrderSource::ErpSync,
            created_at: now(),
            completed_at: None,
        }
    }

    fn dispatch(code: &str, order: &str, product: &str) -> Dispatch {
        Dispatch {
            id: 1,
            identity: OrderIdentity::new(code, order, product),
            company_name: String::new(),
            planned_quantity: 100,
            status: DispatchStatus::InProduction,
            stats: DispatchStatistics::default(),
            stats_updated_at: None,
        }
    }

    fn report(id: i64, company: &str, order: &str, product: &str) -> Report {
        Report {
            id,
            operator: "Lin".into(),
            work_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            operation: "cutting".into(),
            equipment: None,
            company_name: company.into(),
            company_code: None,
            order_number: order.into(),
            product_code: product.into(),
            produced_quantity: 1,
            defect_quantity: 0,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            work_hours: Decimal::ONE,
            overtime_hours: Decimal::ZERO,
            approval: ApprovalStatus::Approved,
            approved_by: None,
            approved_at: None,
            is_completed: false,
            updated_at: now(),
        }
    }

    struct NoStore;

    impl MesStore for NoStore {
        fn open(&self) -> Result<Box<dyn MesSession>, DbError> {
            Err(DbError::Other("no store in unit tests".into()))
        }
    }

    fn service() -> ConsistencyService {
        ConsistencyService::new(Arc::new(NoStore), ConsistencyConfig::default())
    }

    fn directory() -> TenantDirectory {
        TenantDirectory::from_pairs([("10", "Acme"), ("20", "Globex")])
    }

    fn detect(kind: FindingKind, reports: &[Report], wos: &[WorkOrder], ds: &[Dispatch]) -> (Vec<Finding>, CheckSummary) {
        service().detect(
            kind,
            reports,
            &WorkOrderIndex::new(wos),
            &DispatchIndex::new(ds),
            &directory(),
            now(),
        )
    }

    #[test]
    fn test_wrong_product_single_candidate() {
        let wos = [work_order("10", "W2", "P-CORRECT")];
        let (findings, summary) = detect(FindingKind::WrongProduct, &[report(1, "Acme", "W2", "P-WRONG")], &wos, &[]);
        assert_eq!(summary.findings, 1);
        let f = &findings[0];
        assert_eq!(f.correct, Some(OrderIdentity::new("10", "W2", "P-CORRECT")));
        assert_eq!(f.correct_company_name.as_deref(), Some("Acme"));
        assert_eq!(f.wrong, OrderIdentity::new("10", "W2", "P-WRONG"));
    }

    #[test]
    fn test_exact_match_is_not_a_finding() {
        let wos = [work_order("10", "W2", "P1"), work_order("10", "W2", "P2")];
        let (findings, summary) = detect(FindingKind::WrongProduct, &[report(1, "Acme", "W2", "P1")], &wos, &[]);
        assert!(findings.is_empty());
        assert_eq!(summary.ambiguous, 0);
    }

    #[test]
    fn test_two_candidates_are_ambiguous() {
        let wos = [work_order("10", "W2", "P1"), work_order("10", "W2", "P2")];
        let (findings, summary) = detect(FindingKind::WrongProduct, &[report(1, "Acme", "W2", "P9")], &wos, &[]);
        assert!(findings.is_empty());
        assert_eq!(summary.ambiguous, 1);
    }

    #[test]
    fn test_wrong_company_and_wrong_workorder() {
        let wos = [work_order("10", "W1", "P1")];
        let (findings, _) = detect(FindingKind::WrongCompany, &[report(1, "Globex", "W1", "P1")], &wos, &[]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].wrong.company_code, "20");

        let (findings, _) = detect(FindingKind::WrongWorkorder, &[report(2, "Acme", "W9", "P1")], &wos, &[]);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].correct.as_ref().unwrap().order_number, "W1");
    }

    #[test]
    fn test_unresolved_company_is_one_missing_dispatch() {
        let ds = [dispatch("10", "W1", "P1")];
        let reports = [report(1, "Nobody Ltd", "W1", "P1")];
        let (findings, _) = detect(FindingKind::MissingDispatch, &reports, &[], &ds);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].wrong.company_code, "");
        assert_eq!(findings[0].wrong_company_name, "Nobody Ltd");
    }

    #[test]
    fn test_no_company_falls_back_to_order_and_product() {
        let ds = [dispatch("10", "W1", "P1")];
        let (findings, _) = detect(FindingKind::MissingDispatch, &[report(1, "", "W1", "P1")], &[], &ds);
        assert!(findings.is_empty());
        let (findings, _) = detect(FindingKind::MissingDispatch, &[report(2, "", "W1", "P2")], &[], &ds);
        assert_eq!(findings.len(), 1);
    }

    #[test]
    fn test_rd_samples_are_skipped() {
        let (findings, summary) = detect(FindingKind::MissingDispatch, &[report(1, "Acme", "RD樣品", "P1")], &[], &[]);
        assert!(findings.is_empty());
        assert_eq!(summary.checked, 0);
    }

    #[test]
    fn test_protected_reports() {
        let svc = service();
        assert!(svc.is_protected(&report(1, "Acme", "RD-2024-01", "P1")));
        assert!(svc.is_protected(&report(2, "Acme", "W1", "PFP-CCT")));
        assert!(!svc.is_protected(&report(3, "Acme", "W1", "P1")));
    }

    #[test]
    fn test_missing_dispatch_has_no_corrector() {
        assert!(matches!(
            service().correct(FindingKind::MissingDispatch, true, "qa"),
            Err(ConsistencyError::NotCorrectable(FindingKind::MissingDispatch))
        ));
    }
}
