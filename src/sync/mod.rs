//! ERP change-tracking synchronizer.
//!
//! Replicates whitelisted tables from each tenant's upstream ERP database
//! into the tenant's local replica, either as a full rebuild or as the
//! change-tracked delta since the tenant watermark.

pub mod changefeed;
pub mod codec;
pub mod error;
pub mod executor;
pub mod keys;
#[cfg(feature = "mssql")]
pub mod mssql;
pub mod replica;
pub mod scheduler;
pub mod schema;
pub mod types;
pub mod upstream;
pub mod whitelist;

pub use changefeed::ChangeSet;
pub use codec::{LocalValue, RowCodec, UpstreamRow, UpstreamValue};
pub use error::SyncError;
pub use executor::{
    RowFailure, SyncExecutor, SyncMode, SyncOutcome, SyncReport, SyncRequest, TableResult, TenantClaim,
    WhitelistSource,
};
pub use keys::{KeyRegistry, KeyResolution, KeySource};
#[cfg(feature = "mssql")]
pub use mssql::MssqlConnector;
pub use replica::{PgReplica, PgReplicaConnector, ReplicaConnector, ReplicaSession};
pub use scheduler::{SchedulerHandle, TenantScheduler};
pub use schema::{AuditColumn, ColumnDiff, TableSpec};
pub use types::{map_column, ColumnMapping, LocalType, UpstreamColumn};
pub use upstream::{UpstreamConnector, UpstreamError, UpstreamSession};
pub use whitelist::TableWhitelist;
