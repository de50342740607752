//! Upstream to local column type bridge.
//!
//! Maps an upstream column description (as listed by
//! `INFORMATION_SCHEMA.COLUMNS`) to a local PostgreSQL column type and a
//! sea-query [`ColumnDef`] for DDL.

use sea_query::ColumnDef;
use std::fmt;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// One column as described by the upstream information schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamColumn {
    pub name: String,
    /// Upstream type name, e.g. `nvarchar`, `decimal`, `datetime2`.
    pub data_type: String,
    /// `CHARACTER_MAXIMUM_LENGTH`; `-1` for `(max)`.
    pub max_length: Option<i32>,
    pub precision: Option<u8>,
    pub scale: Option<i32>,
}

impl UpstreamColumn {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            max_length: None,
            precision: None,
            scale: None,
        }
    }

    pub fn with_length(mut self, length: i32) -> Self {
        self.max_length = Some(length);
        self
    }

    pub fn with_precision(mut self, precision: u8, scale: i32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// Local column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalType {
    Bytes,
    Boolean,
    /// Fixed-length text, `CHAR(n)`.
    Char(u32),
    /// Bounded text, `VARCHAR(n)`.
    VarChar(u32),
    Text,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal { precision: u32, scale: u32 },
    Timestamp,
    Date,
    Time,
    Uuid,
}

impl LocalType {
    /// Apply this type to a sea-query column definition.
    pub fn apply(&self, def: &mut ColumnDef) {
        match *self {
            LocalType::Bytes => {
                def.binary();
            }
            LocalType::Boolean => {
                def.boolean();
            }
            LocalType::Char(n) => {
                def.char_len(n);
            }
            LocalType::VarChar(n) => {
                def.string_len(n);
            }
            LocalType::Text => {
                def.text();
            }
            LocalType::SmallInt => {
                def.small_integer();
            }
            LocalType::Integer => {
                def.integer();
            }
            LocalType::BigInt => {
                def.big_integer();
            }
            LocalType::Real => {
                def.float();
            }
            LocalType::Double => {
                def.double();
            }
            LocalType::Decimal { precision, scale } => {
                def.decimal_len(precision, scale);
            }
            LocalType::Timestamp => {
                def.timestamp();
            }
            LocalType::Date => {
                def.date();
            }
            LocalType::Time => {
                def.time();
            }
            LocalType::Uuid => {
                def.uuid();
            }
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, LocalType::Char(_) | LocalType::VarChar(_) | LocalType::Text)
    }
}

impl fmt::Display for LocalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalType::Bytes => write!(f, "BYTEA"),
            LocalType::Boolean => write!(f, "BOOLEAN"),
            LocalType::Char(n) => write!(f, "CHAR({n})"),
            LocalType::VarChar(n) => write!(f, "VARCHAR({n})"),
            LocalType::Text => write!(f, "TEXT"),
            LocalType::SmallInt => write!(f, "SMALLINT"),
            LocalType::Integer => write!(f, "INTEGER"),
            LocalType::BigInt => write!(f, "BIGINT"),
            LocalType::Real => write!(f, "REAL"),
            LocalType::Double => write!(f, "DOUBLE PRECISION"),
            LocalType::Decimal { precision, scale } => write!(f, "NUMERIC({precision},{scale})"),
            LocalType::Timestamp => write!(f, "TIMESTAMP"),
            LocalType::Date => write!(f, "DATE"),
            LocalType::Time => write!(f, "TIME"),
            LocalType::Uuid => write!(f, "UUID"),
        }
    }
}

/// Result of mapping one upstream column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    pub name: String,
    pub source_type: String,
    pub local: LocalType,
    /// Mapped to `TEXT` because the upstream type was unknown or under-specified.
    pub fallback: bool,
}

impl ColumnMapping {
    /// Nullable sea-query column definition; upstream nullability is not mirrored.
    pub fn column_def(&self) -> ColumnDef {
        let mut def = ColumnDef::new(self.name.clone());
        self.local.apply(&mut def);
        def.null();
        def
    }
}

/// Map an upstream column to its local declaration.
///
/// Unknown types and decimals without precision and scale map to `TEXT`;
/// those fallbacks are logged and counted.
pub fn map_column(column: &UpstreamColumn) -> ColumnMapping {
    let source_type = column.data_type.trim().to_ascii_lowercase();
    let sized = |sized: fn(u32) -> LocalType| match column.max_length {
        Some(len) if len > 0 => sized(len.unsigned_abs()),
        _ => LocalType::Text,
    };

    let mapped = match source_type.as_str() {
        "binary" | "varbinary" | "image" | "timestamp" | "rowversion" => Some(LocalType::Bytes),
        "bit" => Some(LocalType::Boolean),
        "char" | "nchar" => Some(sized(LocalType::Char)),
        "varchar" | "nvarchar" => Some(sized(LocalType::VarChar)),
        "text" | "ntext" | "xml" => Some(LocalType::Text),
        "tinyint" | "smallint" => Some(LocalType::SmallInt),
        "int" => Some(LocalType::Integer),
        "bigint" => Some(LocalType::BigInt),
        "real" => Some(LocalType::Real),
        "float" => Some(LocalType::Double),
        "money" => Some(LocalType::Decimal { precision: 19, scale: 4 }),
        "smallmoney" => Some(LocalType::Decimal { precision: 10, scale: 4 }),
        "decimal" | "numeric" => match (column.precision, column.scale) {
            (Some(p), Some(s)) if p > 0 && s >= 0 => Some(LocalType::Decimal {
                precision: u32::from(p),
                scale: s.unsigned_abs(),
            }),
            _ => None,
        },
        "datetime" | "datetime2" | "smalldatetime" => Some(LocalType::Timestamp),
        "date" => Some(LocalType::Date),
        "time" => Some(LocalType::Time),
        "uniqueidentifier" => Some(LocalType::Uuid),
        _ => None,
    };

    match mapped {
        Some(local) => ColumnMapping {
            name: column.name.clone(),
            source_type,
            local,
            fallback: false,
        },
        None => {
            log::warn!(
                "column {} has unsupported or under-specified type {} (precision {:?}, scale {:?}); storing as TEXT",
                column.name,
                column.data_type,
                column.precision,
                column.scale
            );
            #[cfg(feature = "metrics")]
            METRICS.record_type_fallback(&source_type);
            ColumnMapping {
                name: column.name.clone(),
                source_type,
                local: LocalType::Text,
                fallback: true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_query::{PostgresQueryBuilder, Table};

    fn local(column: UpstreamColumn) -> LocalType {
        map_column(&column).local
    }

    #[test]
    fn test_mapping_table() {
        assert_eq!(local(UpstreamColumn::new("Photo", "image")), LocalType::Bytes);
        assert_eq!(local(UpstreamColumn::new("Raw", "varbinary").with_length(-1)), LocalType::Bytes);
        assert_eq!(local(UpstreamColumn::new("Flag", "bit")), LocalType::Boolean);
        assert_eq!(local(UpstreamColumn::new("Flag", "char").with_length(1)), LocalType::Char(1));
        assert_eq!(local(UpstreamColumn::new("Name", "nvarchar").with_length(50)), LocalType::VarChar(50));
        assert_eq!(local(UpstreamColumn::new("Memo", "nvarchar").with_length(-1)), LocalType::Text);
        assert_eq!(local(UpstreamColumn::new("Memo", "ntext")), LocalType::Text);
        assert_eq!(local(UpstreamColumn::new("N", "tinyint")), LocalType::SmallInt);
        assert_eq!(local(UpstreamColumn::new("N", "smallint")), LocalType::SmallInt);
        assert_eq!(local(UpstreamColumn::new("N", "int")), LocalType::Integer);
        assert_eq!(local(UpstreamColumn::new("N", "bigint")), LocalType::BigInt);
        assert_eq!(local(UpstreamColumn::new("R", "real")), LocalType::Real);
        assert_eq!(local(UpstreamColumn::new("R", "float")), LocalType::Double);
        assert_eq!(
            local(UpstreamColumn::new("Qty", "decimal").with_precision(18, 6)),
            LocalType::Decimal { precision: 18, scale: 6 }
        );
        assert_eq!(local(UpstreamColumn::new("Amt", "money")), LocalType::Decimal { precision: 19, scale: 4 });
        assert_eq!(local(UpstreamColumn::new("Amt", "smallmoney")), LocalType::Decimal { precision: 10, scale: 4 });
        assert_eq!(local(UpstreamColumn::new("At", "datetime2")), LocalType::Timestamp);
        assert_eq!(local(UpstreamColumn::new("At", "smalldatetime")), LocalType::Timestamp);
        assert_eq!(local(UpstreamColumn::new("D", "date")), LocalType::Date);
        assert_eq!(local(UpstreamColumn::new("T", "time")), LocalType::Time);
        assert_eq!(local(UpstreamColumn::new("G", "uniqueidentifier")), LocalType::Uuid);
    }

    #[test]
    fn test_fallbacks_are_flagged() {
        let unknown = map_column(&UpstreamColumn::new("V", "sql_variant"));
        assert_eq!(unknown.local, LocalType::Text);
        assert!(unknown.fallback);

        let no_precision = map_column(&UpstreamColumn::new("Qty", "numeric"));
        assert_eq!(no_precision.local, LocalType::Text);
        assert!(no_precision.fallback);

        let max_text = map_column(&UpstreamColumn::new("Memo", "varchar").with_length(-1));
        assert_eq!(max_text.local, LocalType::Text);
        assert!(!max_text.fallback);
    }

    #[test]
    fn test_type_names_are_case_insensitive() {
        assert_eq!(local(UpstreamColumn::new("N", "INT")), LocalType::Integer);
        assert_eq!(local(UpstreamColumn::new("N", " NVarChar ").with_length(8)), LocalType::VarChar(8));
    }

    #[test]
    fn test_column_def_renders() {
        let mapping = map_column(&UpstreamColumn::new("Amount", "money"));
        let sql = Table::create()
            .table("t")
            .col(&mut mapping.column_def())
            .build(PostgresQueryBuilder);
        assert!(sql.contains("\"Amount\""), "{sql}");
        assert!(sql.to_lowercase().contains("decimal(19, 4)"), "{sql}");
    }
}
