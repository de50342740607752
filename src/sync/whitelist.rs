//! System-wide table whitelist.

use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

use crate::sync::error::SyncError;

#[derive(Debug, Deserialize)]
struct WhitelistFile {
    allowed_tables: Vec<String>,
}

/// Tables any tenant may replicate, from `{"allowed_tables": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableWhitelist {
    tables: BTreeSet<String>,
}

impl TableWhitelist {
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables
                .into_iter()
                .map(Into::into)
                .map(|t: String| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    /// Read the whitelist file.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::ConfigInvalid` if the file is missing or is not
    /// the expected JSON shape.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncError::ConfigInvalid(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&raw).map_err(|e| SyncError::ConfigInvalid(format!("{}: {e}", path.display())))
    }

    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let file: WhitelistFile = serde_json::from_str(raw)?;
        Ok(Self::new(file.allowed_tables))
    }

    /// Sorted, de-duplicated table names.
    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    /// Split a tenant's table list into accepted (in order) and refused.
    pub fn filter(&self, tables: &[String]) -> (Vec<String>, Vec<String>) {
        let mut accepted = Vec::new();
        let mut refused = Vec::new();
        for table in tables {
            if accepted.contains(table) || refused.contains(table) {
                continue;
            }
            if self.contains(table) {
                accepted.push(table.clone());
            } else {
                refused.push(table.clone());
            }
        }
        (accepted, refused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sorts_and_dedups() {
        let list = TableWhitelist::parse(r#"{"allowed_tables": ["ordBillMain", "comCustomer", "ordBillMain", " "]}"#)
            .unwrap();
        assert_eq!(list.tables().collect::<Vec<_>>(), vec!["comCustomer", "ordBillMain"]);
    }

    #[test]
    fn test_malformed_json_is_config_invalid() {
        let dir = std::env::temp_dir().join(format!("shopfloor-whitelist-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tables.json");
        std::fs::write(&path, "{\"tables\": 1}").unwrap();
        let err = TableWhitelist::load(&path).unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_config_invalid() {
        let err = TableWhitelist::load("/nonexistent/shopfloor/tables.json").unwrap_err();
        assert!(matches!(err, SyncError::ConfigInvalid(_)));
    }

    #[test]
    fn test_filter_keeps_tenant_order() {
        let list = TableWhitelist::new(["comCustomer", "ordBillMain"]);
        let (accepted, refused) = list.filter(&[
            "ordBillMain".to_string(),
            "stkSecret".to_string(),
            "comCustomer".to_string(),
            "ordBillMain".to_string(),
        ]);
        assert_eq!(accepted, vec!["ordBillMain".to_string(), "comCustomer".to_string()]);
        assert_eq!(refused, vec!["stkSecret".to_string()]);
    }
}
