//! Change feed reader over upstream change tracking.

use crate::sync::codec::UpstreamRow;
use crate::sync::error::SyncError;
use crate::sync::types::UpstreamColumn;
use crate::sync::upstream::UpstreamSession;

/// Rows changed in one table between two versions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub rows: Vec<UpstreamRow>,
    /// Joined without a key; every current row is returned.
    pub degraded: bool,
    /// The window was empty and upstream was not queried.
    pub no_changes: bool,
}

/// Upstream-wide change tracking version.
///
/// # Errors
///
/// `ChangeTrackingDisabled` when upstream reports no version, or
/// `UpstreamUnavailable` when the query itself fails.
pub fn current_version(session: &mut dyn UpstreamSession, tenant: &str) -> Result<i64, SyncError> {
    match session.current_version() {
        Ok(Some(version)) => Ok(version),
        Ok(None) => Err(SyncError::ChangeTrackingDisabled {
            tenant: tenant.to_string(),
        }),
        Err(e) => Err(SyncError::UpstreamUnavailable {
            tenant: tenant.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Whether upstream still holds every change of `table` after `from_version`.
///
/// An untracked table counts as retained; the change query reports it.
///
/// # Errors
///
/// Returns `SyncError::Upstream` if the query fails.
pub fn changes_retained(session: &mut dyn UpstreamSession, table: &str, from_version: i64) -> Result<bool, SyncError> {
    let min_valid = session
        .min_valid_version(table)
        .map_err(|source| SyncError::Upstream {
            table: table.to_string(),
            source,
        })?;
    Ok(min_valid.map_or(true, |min| from_version >= min))
}

/// Current rows of `table` whose key changed in `(from_version, current_version]`.
///
/// # Errors
///
/// Returns `SyncError::Upstream` if the change query fails.
pub fn changes_since(
    session: &mut dyn UpstreamSession,
    table: &str,
    columns: &[UpstreamColumn],
    key: &[String],
    from_version: i64,
    current_version: i64,
) -> Result<ChangeSet, SyncError> {
    if from_version >= current_version {
        return Ok(ChangeSet {
            no_changes: true,
            ..ChangeSet::default()
        });
    }

    let degraded = key.is_empty();
    if degraded {
        log::warn!("{table}: no key columns, change feed falls back to every current row");
    }

    let rows = session
        .select_changed(table, columns, key, from_version)
        .map_err(|source| SyncError::Upstream {
            table: table.to_string(),
            source,
        })?;
    log::debug!("{table}: {} changed rows since version {from_version}", rows.len());

    Ok(ChangeSet {
        rows,
        degraded,
        no_changes: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::codec::UpstreamValue;
    use crate::sync::upstream::UpstreamError;

    struct Fixed {
        version: Option<i64>,
        calls: usize,
    }

    impl UpstreamSession for Fixed {
        fn current_version(&mut self) -> Result<Option<i64>, UpstreamError> {
            Ok(self.version)
        }

        fn min_valid_version(&mut self, _table: &str) -> Result<Option<i64>, UpstreamError> {
            Ok(self.version.map(|v| v - 4))
        }

        fn columns(&mut self, _table: &str) -> Result<Vec<UpstreamColumn>, UpstreamError> {
            Ok(Vec::new())
        }

        fn select_all(&mut self, _table: &str, _columns: &[UpstreamColumn]) -> Result<Vec<UpstreamRow>, UpstreamError> {
            Ok(Vec::new())
        }

        fn select_changed(
            &mut self,
            _table: &str,
            _columns: &[UpstreamColumn],
            _key: &[String],
            _from_version: i64,
        ) -> Result<Vec<UpstreamRow>, UpstreamError> {
            self.calls += 1;
            Ok(vec![UpstreamRow::new(vec![UpstreamValue::I32(1)])])
        }
    }

    #[test]
    fn test_disabled_change_tracking() {
        let mut session = Fixed { version: None, calls: 0 };
        let err = current_version(&mut session, "10").unwrap_err();
        assert_eq!(err.kind(), "change_tracking_disabled");
    }

    #[test]
    fn test_empty_window_skips_query() {
        let mut session = Fixed {
            version: Some(5),
            calls: 0,
        };
        let changes = changes_since(&mut session, "comCustomer", &[], &["ID".into()], 5, 5).unwrap();
        assert!(changes.no_changes);
        assert!(changes.rows.is_empty());
        assert_eq!(session.calls, 0);
    }

    #[test]
    fn test_empty_key_is_degraded() {
        let mut session = Fixed {
            version: Some(9),
            calls: 0,
        };
        let changes = changes_since(&mut session, "stkLog", &[], &[], 3, 9).unwrap();
        assert!(changes.degraded);
        assert_eq!(changes.rows.len(), 1);
    }

    #[test]
    fn test_purged_window_is_not_retained() {
        let mut session = Fixed {
            version: Some(9),
            calls: 0,
        };
        assert!(changes_retained(&mut session, "comCustomer", 5).unwrap());
        assert!(!changes_retained(&mut session, "comCustomer", 4).unwrap());
        let mut untracked = Fixed { version: None, calls: 0 };
        assert!(changes_retained(&mut untracked, "comCustomer", 0).unwrap());
    }
}
