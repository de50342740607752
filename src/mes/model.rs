//! Shop-floor records: work orders, dispatches, reports and their archive.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use std::fmt;

/// Declares a status enum stored as its snake_case label.
macro_rules! labelled_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }

            pub fn parse(label: &str) -> Option<Self> {
                match label {
                    $($label => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

labelled_enum!(
    /// Work orders only move forward, except for an explicit rollback.
    WorkOrderStatus {
        Pending => "pending",
        InProgress => "in_progress",
        Completed => "completed",
    }
);

labelled_enum!(WorkOrderSource {
    ErpSync => "erp_sync",
    Manual => "manual",
    RdSample => "rd_sample",
});

labelled_enum!(DispatchStatus {
    Pending => "pending",
    InProduction => "in_production",
    Completed => "completed",
});

labelled_enum!(ProcessStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
});

labelled_enum!(ApprovalStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

labelled_enum!(OnsiteStatus {
    InProgress => "in_progress",
    Completed => "completed",
});

labelled_enum!(
    /// Consistency violation kinds, one per detector.
    FindingKind {
        MissingDispatch => "missing_dispatch",
        WrongProduct => "wrong_product",
        WrongCompany => "wrong_company",
        WrongWorkorder => "wrong_workorder",
    }
);

impl FindingKind {
    pub const ALL: [FindingKind; 4] = [
        FindingKind::MissingDispatch,
        FindingKind::WrongProduct,
        FindingKind::WrongCompany,
        FindingKind::WrongWorkorder,
    ];
}

/// (company_code, order_number, product_code): the key shared by a work
/// order, its dispatch and every report against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderIdentity {
    pub company_code: String,
    pub order_number: String,
    pub product_code: String,
}

impl OrderIdentity {
    pub fn new(company_code: impl Into<String>, order_number: impl Into<String>, product_code: impl Into<String>) -> Self {
        Self {
            company_code: company_code.into(),
            order_number: order_number.into(),
            product_code: product_code.into(),
        }
    }
}

impl fmt::Display for OrderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.company_code, self.order_number, self.product_code)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkOrder {
    pub id: i64,
    pub identity: OrderIdentity,
    pub planned_quantity: i64,
    pub status: WorkOrderStatus,
    pub source: WorkOrderSource,
    pub created_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkOrderProcess {
    pub id: i64,
    pub work_order_id: i64,
    pub sequence: i32,
    pub operation: String,
    pub planned_quantity: i64,
    pub completed_quantity: i64,
    pub status: ProcessStatus,
    pub assigned_operator: Option<String>,
    pub assigned_equipment: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub id: i64,
    pub work_order_id: i64,
    pub operation: String,
    pub operator: String,
    pub equipment: Option<String>,
    pub assigned_date: NaiveDate,
}

/// Derived rollups of one dispatch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DispatchStatistics {
    pub total_good_quantity: i64,
    pub total_defect_quantity: i64,
    pub total_quantity: i64,
    pub packaging_good_quantity: i64,
    pub packaging_defect_quantity: i64,
    pub packaging_total_quantity: i64,
    pub total_work_hours: Decimal,
    pub total_overtime_hours: Decimal,
    pub total_all_hours: Decimal,
    pub report_count: i64,
    pub approved_count: i64,
    pub pending_count: i64,
    pub onsite_report_count: i64,
    pub onsite_completed_count: i64,
    pub total_processes: i64,
    pub completed_processes: i64,
    pub pending_processes: i64,
    pub completion_rate: f64,
    pub packaging_completion_rate: f64,
    pub completion_threshold_met: bool,
    pub can_complete: bool,
    pub last_fillwork_update: Option<NaiveDateTime>,
    pub last_onsite_update: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub id: i64,
    pub identity: OrderIdentity,
    pub company_name: String,
    pub planned_quantity: i64,
    pub status: DispatchStatus,
    pub stats: DispatchStatistics,
    pub stats_updated_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchProcess {
    pub id: i64,
    pub dispatch_id: i64,
    pub operation: String,
    pub planned_quantity: i64,
    pub completed_quantity: i64,
    pub status: ProcessStatus,
    pub end_date: Option<NaiveDate>,
}

/// Fill-work report. Carries the company name; the code is often empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub id: i64,
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
    pub work_hours: Decimal,
    pub overtime_hours: Decimal,
    pub approval: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<NaiveDateTime>,
    pub is_completed: bool,
    pub updated_at: NaiveDateTime,
}

/// New identity fields for a report, written by correctors and resolutions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReportPatch {
    pub company_name: Option<String>,
    pub company_code: Option<String>,
    pub order_number: Option<String>,
    pub product_code: Option<String>,
}

impl ReportPatch {
    pub fn is_empty(&self) -> bool {
        self.company_name.is_none()
            && self.company_code.is_none()
            && self.order_number.is_none()
            && self.product_code.is_none()
    }

    pub fn apply(&self, report: &mut Report) {
        if let Some(name) = &self.company_name {
            report.company_name = name.clone();
        }
        if let Some(code) = &self.company_code {
            report.company_code = Some(code.clone());
        }
        if let Some(order) = &self.order_number {
            report.order_number = order.clone();
        }
        if let Some(product) = &self.product_code {
            report.product_code = product.clone();
        }
    }
}

/// On-site report from the parallel shop-floor terminal stream.
#[derive(Debug, Clone, PartialEq)]
pub struct OnsiteReport {
    pub id: i64,
    pub identity: OrderIdentity,
    pub operation: String,
    pub produced_quantity: i64,
    pub defect_quantity: i64,
    pub status: OnsiteStatus,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductionRecord {
    pub work_order_id: i64,
    pub status: DispatchStatus,
    pub production_start: Option<NaiveDateTime>,
    pub production_end: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub id: i64,
    pub kind: FindingKind,
    pub report_id: i64,
    /// Identity of the authoritative work order, when one was found.
    pub correct: Option<OrderIdentity>,
    pub correct_company_name: Option<String>,
    /// Identity as it appears on the report; the company code is the
    /// resolved one, or empty when the name does not resolve.
    pub wrong: OrderIdentity,
    pub wrong_company_name: String,
    pub operator: String,
    pub work_date: NaiveDate,
    pub is_fixed: bool,
    pub fixed_by: Option<String>,
    pub fixed_at: Option<NaiveDateTime>,
    pub fix_method: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Archived snapshot of a completed work order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedWorkOrder {
    pub id: i64,
    pub work_order_id: i64,
    pub identity: OrderIdentity,
    pub company_name: String,
    pub planned_quantity: i64,
    pub created_at: NaiveDateTime,
    pub started_at: Option<NaiveDateTime>,
    pub completed_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedProcess {
    pub id: i64,
    pub completed_work_order_id: i64,
    pub sequence: i32,
    pub operation: String,
    pub planned_quantity: i64,
    pub completed_quantity: i64,
    pub assigned_operator: Option<String>,
    pub assigned_equipment: Option<String>,
    pub start_date: Option<NaiveDate>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_round_trip() {
        for kind in FindingKind::ALL {
            assert_eq!(FindingKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(WorkOrderStatus::parse("in_progress"), Some(WorkOrderStatus::InProgress));
        assert_eq!(DispatchStatus::parse("done"), None);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(OrderIdentity::new("10", "W1", "P1").to_string(), "10/W1/P1");
    }

    #[test]
    fn test_patch_apply() {
        let mut report = Report {
            id: 1,
            operator: "Lin".into(),
            work_date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            operation: "cutting".into(),
            equipment: None,
            company_name: "Acme".into(),
            company_code: None,
            order_number: "W2".into(),
            product_code: "P-WRONG".into(),
            produced_quantity: 5,
            defect_quantity: 0,
            start_time: NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            work_hours: Decimal::new(4, 0),
            overtime_hours: Decimal::ZERO,
            approval: ApprovalStatus::Approved,
            approved_by: None,
            approved_at: None,
            is_completed: false,
            updated_at: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(12, 0, 0).unwrap(),
        };
        let patch = ReportPatch {
            product_code: Some("P-CORRECT".into()),
            ..ReportPatch::default()
        };
        assert!(!patch.is_empty());
        patch.apply(&mut report);
        assert_eq!(report.product_code, "P-CORRECT");
        assert_eq!(report.order_number, "W2");
    }
}
