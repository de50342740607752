//! Primary-key registry for change tracking joins.
//!
//! Upstream tables do not reliably declare a key usable by `CHANGETABLE`, so
//! the key tuple per table comes from this registry. Tables it does not know
//! get a heuristic key from their column names.

use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Built-in key tuples for the ERP tables the plant replicates.
static BUILTIN_KEYS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let entries: [(&str, &[&str]); 13] = [
        ("TraBillMain", &["Flag", "BillNo"]),
        ("TraBillSub", &["Flag", "BillNo", "RowNo"]),
        ("comCustomer", &["Flag", "ID"]),
        ("ordBillMain", &["Flag", "BillNO"]),
        ("ordBillSub", &["Flag", "BillNO", "RowNO"]),
        ("impPurchaseMain", &["Flag", "PurchaseNo"]),
        ("impPurchaseMergeSub", &["PurchaseNo", "RowNo"]),
        ("impPurchaseSub", &["Flag", "PurchaseNo", "RowNo"]),
        ("prdMKOrdMain", &["Flag", "MKOrdNO"]),
        ("prdMkOrdMats", &["MkOrdNO", "RowNO"]),
        ("stkBorrowSub", &["Flag", "BorrowNO", "RowNo"]),
        ("stkYearMonthQty", &["ProdID", "WareID", "YearMonth"]),
        ("comProduct", &["ProdID"]),
    ];
    entries.into_iter().collect()
});

/// Column names tried, in this order of preference, for unregistered tables.
const HEURISTIC_NAMES: &[&str] = &[
    "ID", "Code", "Key", "BillNO", "RowNO", "Flag", "Seq", "Number", "WareID", "YearMonth",
];

const HEURISTIC_FALLBACK_WIDTH: usize = 3;

/// Where a resolved key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySource {
    Registry,
    Configured,
    Heuristic,
    /// First columns of the table.
    Positional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyResolution {
    /// Key columns spelled as the table spells them.
    pub columns: Vec<String>,
    pub source: KeySource,
    /// Registered key columns the table does not have.
    pub dropped: Vec<String>,
}

impl KeyResolution {
    /// True when no key applies and changes join on every row.
    pub fn is_degraded(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Key tuples per table: built-ins overlaid with configured overrides.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    overrides: HashMap<String, Vec<String>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides from configuration, matched case-insensitively. An empty
    /// list marks a table with no usable key.
    pub fn with_overrides(overrides: &HashMap<String, Vec<String>>) -> Self {
        Self {
            overrides: overrides
                .iter()
                .map(|(table, key)| (table.to_lowercase(), key.clone()))
                .collect(),
        }
    }

    /// Registered key for `table`, if any.
    pub fn registered(&self, table: &str) -> Option<(Vec<String>, KeySource)> {
        if let Some(key) = self.overrides.get(&table.to_lowercase()) {
            return Some((key.clone(), KeySource::Configured));
        }
        BUILTIN_KEYS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map(|(_, key)| (key.iter().map(|k| k.to_string()).collect(), KeySource::Registry))
    }

    /// Resolve the key for `table` against its actual columns.
    pub fn resolve(&self, table: &str, columns: &[String]) -> KeyResolution {
        let find = |wanted: &str| columns.iter().find(|c| c.eq_ignore_ascii_case(wanted)).cloned();

        if let Some((key, source)) = self.registered(table) {
            if key.is_empty() {
                return KeyResolution {
                    columns: Vec::new(),
                    source,
                    dropped: Vec::new(),
                };
            }
            let mut present = Vec::new();
            let mut dropped = Vec::new();
            for k in &key {
                match find(k) {
                    Some(actual) => present.push(actual),
                    None => dropped.push(k.clone()),
                }
            }
            if !dropped.is_empty() {
                log::warn!("{table}: registered key columns not found upstream: {}", dropped.join(", "));
            }
            if present.is_empty() {
                present.extend(columns.first().cloned());
            }
            return KeyResolution {
                columns: present,
                source,
                dropped,
            };
        }

        let heuristic: Vec<String> = columns
            .iter()
            .filter(|c| HEURISTIC_NAMES.iter().any(|h| h.eq_ignore_ascii_case(c)))
            .cloned()
            .collect();
        if !heuristic.is_empty() {
            log::info!("{table}: no registered key, using {}", heuristic.join(", "));
            return KeyResolution {
                columns: heuristic,
                source: KeySource::Heuristic,
                dropped: Vec::new(),
            };
        }

        let positional: Vec<String> = columns.iter().take(HEURISTIC_FALLBACK_WIDTH).cloned().collect();
        log::warn!("{table}: no registered or recognisable key, using first columns {}", positional.join(", "));
        KeyResolution {
            columns: positional,
            source: KeySource::Positional,
            dropped: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_registered_key_uses_table_spelling() {
        let registry = KeyRegistry::new();
        let resolved = registry.resolve("ordBillSub", &cols(&["flag", "BillNo", "RowNo", "Qty"]));
        assert_eq!(resolved.columns, cols(&["flag", "BillNo", "RowNo"]));
        assert_eq!(resolved.source, KeySource::Registry);
        assert!(resolved.dropped.is_empty());
    }

    #[test]
    fn test_missing_registered_columns_are_dropped() {
        let registry = KeyRegistry::new();
        let resolved = registry.resolve("TraBillSub", &cols(&["Flag", "BillNo", "Qty"]));
        assert_eq!(resolved.columns, cols(&["Flag", "BillNo"]));
        assert_eq!(resolved.dropped, cols(&["RowNo"]));
    }

    #[test]
    fn test_no_registered_column_present_uses_first() {
        let registry = KeyRegistry::new();
        let resolved = registry.resolve("comProduct", &cols(&["Code2", "Name"]));
        assert_eq!(resolved.columns, cols(&["Code2"]));
    }

    #[test]
    fn test_override_beats_builtin() {
        let mut overrides = HashMap::new();
        overrides.insert("COMCUSTOMER".to_string(), cols(&["ID"]));
        let registry = KeyRegistry::with_overrides(&overrides);
        let resolved = registry.resolve("comCustomer", &cols(&["Flag", "ID", "Name"]));
        assert_eq!(resolved.columns, cols(&["ID"]));
        assert_eq!(resolved.source, KeySource::Configured);
    }

    #[test]
    fn test_empty_override_degrades() {
        let mut overrides = HashMap::new();
        overrides.insert("stkLog".to_string(), Vec::new());
        let registry = KeyRegistry::with_overrides(&overrides);
        assert!(registry.resolve("stkLog", &cols(&["A", "B"])).is_degraded());
    }

    #[test]
    fn test_heuristic_keeps_column_order() {
        let registry = KeyRegistry::new();
        let resolved = registry.resolve("misc", &cols(&["Name", "seq", "Id"]));
        assert_eq!(resolved.columns, cols(&["seq", "Id"]));
        assert_eq!(resolved.source, KeySource::Heuristic);
    }

    #[test]
    fn test_positional_fallback_takes_three() {
        let registry = KeyRegistry::new();
        let resolved = registry.resolve("misc", &cols(&["A", "B", "C", "D"]));
        assert_eq!(resolved.columns, cols(&["A", "B", "C"]));
        assert_eq!(resolved.source, KeySource::Positional);
    }
}
