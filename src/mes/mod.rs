//! Work-order reconciliation over the shop-floor records.
//!
//! Dispatch statistics are recomputed from approved reports whenever a
//! report changes, consistency checks find reports whose identity does not
//! match a work order, and completed work orders are archived and can be
//! reopened from the archive.

pub mod archive;
pub mod consistency;
pub mod model;
pub mod pg;
pub mod reports;
pub mod rollback;
pub mod schema;
pub mod statistics;
pub mod store;
pub mod worktime;

pub use archive::{ArchiveError, ArchiveService};
pub use consistency::{
    CheckSummary, Correction, CorrectionReport, ConsistencyError, ConsistencyService, FixMethod,
};
pub use model::{
    ApprovalStatus, Dispatch, DispatchStatistics, DispatchStatus, Finding, FindingKind, OrderIdentity, Report,
    ReportPatch, WorkOrder, WorkOrderStatus,
};
pub use pg::PgMesStore;
pub use reports::{NewReport, ReportError, ReportService};
pub use rollback::{RollbackCheck, RollbackError, RollbackOutcome, RollbackService};
pub use schema::ensure_mes_tables;
pub use statistics::{BatchSummary, Recomputation, StatisticsEngine, StatsError};
pub use store::{in_transaction, MesSession, MesStore};
pub use worktime::{split_hours, WorkHours};
