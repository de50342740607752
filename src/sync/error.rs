//! Sync error kinds.

use std::fmt;

use crate::executor::DbError;
use crate::sync::upstream::UpstreamError;

/// Errors raised while preparing or running a tenant sync.
///
/// Row-level kinds (`RowDecodeFailure`, `RowWriteFailure`) and `SchemaDrift`
/// are normally caught and folded into the run report; they surface as
/// errors only from the per-table and per-row helpers.
#[derive(Debug)]
pub enum SyncError {
    /// Missing whitelist file, malformed JSON, bad database name, unknown tenant.
    ConfigInvalid(String),
    /// Upstream connection or login failed.
    UpstreamUnavailable { tenant: String, reason: String },
    /// Local replica database could not be opened.
    LocalUnavailable { tenant: String, reason: String },
    /// Upstream database does not report a change-tracking version.
    ChangeTrackingDisabled { tenant: String },
    /// Local column set differs from upstream.
    SchemaDrift {
        table: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },
    RowDecodeFailure {
        table: String,
        column: String,
        reason: String,
    },
    RowWriteFailure {
        table: String,
        row: String,
        reason: String,
    },
    /// A run for this tenant is already in progress.
    TenantSerializationConflict { tenant: String },
    /// Upstream query failed after the connection was established.
    Upstream { table: String, source: UpstreamError },
    /// Local statement failed outside a row write.
    Local { table: String, source: DbError },
    /// Registry read or write failed.
    Registry(DbError),
    /// Worker thread could not be started or panicked.
    Internal(String),
}

impl SyncError {
    /// Short label used in run reports and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::ConfigInvalid(_) => "config_invalid",
            SyncError::UpstreamUnavailable { .. } => "upstream_unavailable",
            SyncError::LocalUnavailable { .. } => "local_unavailable",
            SyncError::ChangeTrackingDisabled { .. } => "change_tracking_disabled",
            SyncError::SchemaDrift { .. } => "schema_drift",
            SyncError::RowDecodeFailure { .. } => "row_decode_failure",
            SyncError::RowWriteFailure { .. } => "row_write_failure",
            SyncError::TenantSerializationConflict { .. } => "tenant_serialization_conflict",
            SyncError::Upstream { .. } => "upstream_query",
            SyncError::Local { .. } => "local_query",
            SyncError::Registry(_) => "registry",
            SyncError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::ConfigInvalid(s) => write!(f, "Invalid configuration: {s}"),
            SyncError::UpstreamUnavailable { tenant, reason } => {
                write!(f, "Upstream unavailable for tenant {tenant}: {reason}")
            }
            SyncError::LocalUnavailable { tenant, reason } => {
                write!(f, "Local database unavailable for tenant {tenant}: {reason}")
            }
            SyncError::ChangeTrackingDisabled { tenant } => {
                write!(f, "Change tracking is not enabled on the upstream database of tenant {tenant}")
            }
            SyncError::SchemaDrift { table, missing, extra } => write!(
                f,
                "Schema drift on {table}: missing [{}], extra [{}]",
                missing.join(", "),
                extra.join(", ")
            ),
            SyncError::RowDecodeFailure { table, column, reason } => {
                write!(f, "Cannot decode {table}.{column}: {reason}")
            }
            SyncError::RowWriteFailure { table, row, reason } => {
                write!(f, "Cannot write {table} row {row}: {reason}")
            }
            SyncError::TenantSerializationConflict { tenant } => {
                write!(f, "A sync run for tenant {tenant} is already in progress")
            }
            SyncError::Upstream { table, source } => write!(f, "Upstream query on {table} failed: {source}"),
            SyncError::Local { table, source } => write!(f, "Local statement on {table} failed: {source}"),
            SyncError::Registry(e) => write!(f, "Tenant registry error: {e}"),
            SyncError::Internal(s) => write!(f, "Internal error: {s}"),
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Upstream { source, .. } => Some(source),
            SyncError::Local { source, .. } => Some(source),
            SyncError::Registry(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_drift_display_lists_columns() {
        let err = SyncError::SchemaDrift {
            table: "comCustomer".into(),
            missing: vec!["Tel".into()],
            extra: vec!["Fax".into(), "Memo".into()],
        };
        let s = err.to_string();
        assert!(s.contains("comCustomer"));
        assert!(s.contains("missing [Tel]"));
        assert!(s.contains("extra [Fax, Memo]"));
        assert_eq!(err.kind(), "schema_drift");
    }

    #[test]
    fn test_conflict_names_tenant() {
        let err = SyncError::TenantSerializationConflict { tenant: "10".into() };
        assert!(err.to_string().contains("tenant 10"));
        assert_eq!(err.kind(), "tenant_serialization_conflict");
    }
}
