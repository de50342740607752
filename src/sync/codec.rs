//! Row codec.
//!
//! Each replica column gets a [`ColumnCodec`] chosen once from its
//! [`LocalType`]; rows are then decoded by running the precompiled codecs in
//! column order. Decoded values are [`LocalValue`]s, which bind directly as
//! statement parameters.

use bytes::BytesMut;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use encoding_rs::{BIG5, UTF_16LE};
use postgres_types::{to_sql_checked, IsNull, ToSql, Type};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::error::Error;
use std::fmt;
use uuid::Uuid;

use crate::sync::schema::{TableSpec, UPDATED_AT};
use crate::sync::types::LocalType;

/// A value as read from the upstream driver.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamValue {
    Null,
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(Uuid),
}

impl UpstreamValue {
    fn type_name(&self) -> &'static str {
        match self {
            UpstreamValue::Null => "null",
            UpstreamValue::Bool(_) => "bool",
            UpstreamValue::U8(_) => "u8",
            UpstreamValue::I16(_) => "i16",
            UpstreamValue::I32(_) => "i32",
            UpstreamValue::I64(_) => "i64",
            UpstreamValue::F32(_) => "f32",
            UpstreamValue::F64(_) => "f64",
            UpstreamValue::Decimal(_) => "decimal",
            UpstreamValue::Text(_) => "text",
            UpstreamValue::Bytes(_) => "bytes",
            UpstreamValue::Timestamp(_) => "timestamp",
            UpstreamValue::Date(_) => "date",
            UpstreamValue::Time(_) => "time",
            UpstreamValue::Uuid(_) => "uuid",
        }
    }

    /// Short rendering for logs and failure reasons.
    pub fn display_short(&self) -> String {
        let full = match self {
            UpstreamValue::Null => "NULL".to_string(),
            UpstreamValue::Bool(v) => v.to_string(),
            UpstreamValue::U8(v) => v.to_string(),
            UpstreamValue::I16(v) => v.to_string(),
            UpstreamValue::I32(v) => v.to_string(),
            UpstreamValue::I64(v) => v.to_string(),
            UpstreamValue::F32(v) => v.to_string(),
            UpstreamValue::F64(v) => v.to_string(),
            UpstreamValue::Decimal(v) => v.to_string(),
            UpstreamValue::Text(v) => v.clone(),
            UpstreamValue::Bytes(v) => format!("<{} bytes>", v.len()),
            UpstreamValue::Timestamp(v) => v.to_string(),
            UpstreamValue::Date(v) => v.to_string(),
            UpstreamValue::Time(v) => v.to_string(),
            UpstreamValue::Uuid(v) => v.to_string(),
        };
        full.chars().take(40).collect()
    }
}

/// One upstream row, values in column order.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRow {
    pub values: Vec<UpstreamValue>,
}

impl UpstreamRow {
    pub fn new(values: Vec<UpstreamValue>) -> Self {
        Self { values }
    }
}

/// A value ready to bind against a replica column.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(Uuid),
}

impl LocalValue {
    pub fn is_null(&self) -> bool {
        matches!(self, LocalValue::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            LocalValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn display_short(&self) -> String {
        let full = match self {
            LocalValue::Null => "NULL".to_string(),
            LocalValue::Bool(v) => v.to_string(),
            LocalValue::I16(v) => v.to_string(),
            LocalValue::I32(v) => v.to_string(),
            LocalValue::I64(v) => v.to_string(),
            LocalValue::F32(v) => v.to_string(),
            LocalValue::F64(v) => v.to_string(),
            LocalValue::Decimal(v) => v.to_string(),
            LocalValue::Text(v) => v.clone(),
            LocalValue::Bytes(v) => format!("<{} bytes>", v.len()),
            LocalValue::Timestamp(v) => v.to_string(),
            LocalValue::Date(v) => v.to_string(),
            LocalValue::Time(v) => v.to_string(),
            LocalValue::Uuid(v) => v.to_string(),
        };
        full.chars().take(40).collect()
    }
}

impl ToSql for LocalValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            LocalValue::Null => Ok(IsNull::Yes),
            LocalValue::Bool(v) => v.to_sql_checked(ty, out),
            LocalValue::I16(v) => v.to_sql_checked(ty, out),
            LocalValue::I32(v) => v.to_sql_checked(ty, out),
            LocalValue::I64(v) => v.to_sql_checked(ty, out),
            LocalValue::F32(v) => v.to_sql_checked(ty, out),
            LocalValue::F64(v) => v.to_sql_checked(ty, out),
            LocalValue::Decimal(v) => v.to_sql_checked(ty, out),
            LocalValue::Text(v) => v.to_sql_checked(ty, out),
            LocalValue::Bytes(v) => v.to_sql_checked(ty, out),
            LocalValue::Timestamp(v) => v.to_sql_checked(ty, out),
            LocalValue::Date(v) => v.to_sql_checked(ty, out),
            LocalValue::Time(v) => v.to_sql_checked(ty, out),
            LocalValue::Uuid(v) => v.to_sql_checked(ty, out),
        }
    }

    // The variant is fixed per column at schema time; the inner value checks the type.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Why a single value could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub column: String,
    pub reason: String,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "column {}: {}", self.column, self.reason)
    }
}

impl Error for DecodeError {}

/// Per-column conversion, selected once from the local column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnCodec {
    Bytes,
    Text,
    Boolean,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Decimal,
    Timestamp,
    Date,
    Time,
    Uuid,
}

impl ColumnCodec {
    pub fn for_type(local: &LocalType) -> Self {
        match local {
            LocalType::Bytes => ColumnCodec::Bytes,
            LocalType::Char(_) | LocalType::VarChar(_) | LocalType::Text => ColumnCodec::Text,
            LocalType::Boolean => ColumnCodec::Boolean,
            LocalType::SmallInt => ColumnCodec::SmallInt,
            LocalType::Integer => ColumnCodec::Integer,
            LocalType::BigInt => ColumnCodec::BigInt,
            LocalType::Real => ColumnCodec::Real,
            LocalType::Double => ColumnCodec::Double,
            LocalType::Decimal { .. } => ColumnCodec::Decimal,
            LocalType::Timestamp => ColumnCodec::Timestamp,
            LocalType::Date => ColumnCodec::Date,
            LocalType::Time => ColumnCodec::Time,
            LocalType::Uuid => ColumnCodec::Uuid,
        }
    }

    /// Convert one upstream value. The error carries a reason only; the row
    /// codec adds the column name.
    pub fn decode(&self, value: UpstreamValue) -> Result<LocalValue, String> {
        use UpstreamValue as U;

        if matches!(value, U::Null) {
            return Ok(LocalValue::Null);
        }

        let mismatch = |v: &UpstreamValue| format!("unexpected {} value for {:?} column", v.type_name(), self);

        match self {
            ColumnCodec::Bytes => match value {
                U::Bytes(b) => Ok(LocalValue::Bytes(b)),
                U::Text(s) => Ok(LocalValue::Bytes(s.into_bytes())),
                other => Err(mismatch(&other)),
            },
            ColumnCodec::Text => match value {
                U::Text(s) => Ok(LocalValue::Text(strip_nul(&s))),
                U::Bytes(b) => Ok(LocalValue::Text(decode_text_bytes(&b))),
                U::Uuid(u) => Ok(LocalValue::Text(u.to_string())),
                other => Ok(LocalValue::Text(other.display_full())),
            },
            ColumnCodec::Boolean => match value {
                U::Bool(b) => Ok(LocalValue::Bool(b)),
                U::U8(n) => Ok(LocalValue::Bool(n != 0)),
                U::I16(n) => Ok(LocalValue::Bool(n != 0)),
                U::I32(n) => Ok(LocalValue::Bool(n != 0)),
                other => Err(mismatch(&other)),
            },
            ColumnCodec::SmallInt => integer(value, &mismatch).and_then(|n| {
                i16::try_from(n)
                    .map(LocalValue::I16)
                    .map_err(|_| format!("{n} out of range for SMALLINT"))
            }),
            ColumnCodec::Integer => integer(value, &mismatch).and_then(|n| {
                i32::try_from(n)
                    .map(LocalValue::I32)
                    .map_err(|_| format!("{n} out of range for INTEGER"))
            }),
            ColumnCodec::BigInt => integer(value, &mismatch).map(LocalValue::I64),
            ColumnCodec::Real => match value {
                U::F32(f) => Ok(LocalValue::F32(f)),
                U::F64(f) => Ok(LocalValue::F32(f as f32)),
                U::Decimal(d) => d
                    .to_f32()
                    .map(LocalValue::F32)
                    .ok_or_else(|| format!("{d} not representable as REAL")),
                other => integer(other, &mismatch).map(|n| LocalValue::F32(n as f32)),
            },
            ColumnCodec::Double => match value {
                U::F32(f) => Ok(LocalValue::F64(f64::from(f))),
                U::F64(f) => Ok(LocalValue::F64(f)),
                U::Decimal(d) => d
                    .to_f64()
                    .map(LocalValue::F64)
                    .ok_or_else(|| format!("{d} not representable as DOUBLE PRECISION")),
                other => integer(other, &mismatch).map(|n| LocalValue::F64(n as f64)),
            },
            ColumnCodec::Decimal => match value {
                U::Decimal(d) => Ok(LocalValue::Decimal(d)),
                U::F64(f) => Decimal::from_f64(f)
                    .map(LocalValue::Decimal)
                    .ok_or_else(|| format!("{f} not representable as NUMERIC")),
                U::F32(f) => Decimal::from_f32(f)
                    .map(LocalValue::Decimal)
                    .ok_or_else(|| format!("{f} not representable as NUMERIC")),
                U::Text(s) => s
                    .trim()
                    .parse::<Decimal>()
                    .map(LocalValue::Decimal)
                    .map_err(|e| format!("'{s}' is not a number: {e}")),
                other => integer(other, &mismatch).map(|n| LocalValue::Decimal(Decimal::from(n))),
            },
            ColumnCodec::Timestamp => match value {
                U::Timestamp(t) => Ok(LocalValue::Timestamp(t)),
                U::Date(d) => Ok(LocalValue::Timestamp(d.and_time(NaiveTime::MIN))),
                other => Err(mismatch(&other)),
            },
            ColumnCodec::Date => match value {
                U::Date(d) => Ok(LocalValue::Date(d)),
                U::Timestamp(t) => Ok(LocalValue::Date(t.date())),
                other => Err(mismatch(&other)),
            },
            ColumnCodec::Time => match value {
                U::Time(t) => Ok(LocalValue::Time(t)),
                U::Timestamp(t) => Ok(LocalValue::Time(t.time())),
                other => Err(mismatch(&other)),
            },
            ColumnCodec::Uuid => match value {
                U::Uuid(u) => Ok(LocalValue::Uuid(u)),
                U::Text(s) => Uuid::parse_str(s.trim())
                    .map(LocalValue::Uuid)
                    .map_err(|e| format!("'{s}' is not a UUID: {e}")),
                other => Err(mismatch(&other)),
            },
        }
    }
}

impl UpstreamValue {
    fn display_full(&self) -> String {
        match self {
            UpstreamValue::Text(s) => s.clone(),
            UpstreamValue::Decimal(d) => d.to_string(),
            UpstreamValue::Timestamp(t) => t.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
            other => other.display_short(),
        }
    }
}

fn integer(value: UpstreamValue, mismatch: &dyn Fn(&UpstreamValue) -> String) -> Result<i64, String> {
    match value {
        UpstreamValue::U8(n) => Ok(i64::from(n)),
        UpstreamValue::I16(n) => Ok(i64::from(n)),
        UpstreamValue::I32(n) => Ok(i64::from(n)),
        UpstreamValue::I64(n) => Ok(n),
        UpstreamValue::Bool(b) => Ok(i64::from(b)),
        UpstreamValue::Decimal(d) if d.fract().is_zero() => {
            d.to_i64().ok_or_else(|| format!("{d} out of range for an integer column"))
        }
        other => Err(mismatch(&other)),
    }
}

/// Remove embedded NUL characters, which PostgreSQL text cannot store.
pub fn strip_nul(s: &str) -> String {
    if s.contains('\0') {
        s.replace('\0', "")
    } else {
        s.to_string()
    }
}

/// Decode a byte payload from a text column.
///
/// Tries UTF-16LE first; odd-length input or malformed surrogates fall back
/// to Big5 (code page 950) with replacement characters.
pub fn decode_text_bytes(bytes: &[u8]) -> String {
    if bytes.len() % 2 == 0 {
        let (text, had_errors) = UTF_16LE.decode_without_bom_handling(bytes);
        if !had_errors {
            return strip_nul(&text);
        }
    }
    let (text, _, _) = BIG5.decode(bytes);
    strip_nul(&text)
}

/// Decoder for one replica table: codecs in upstream column order plus the
/// trailing `updated_at`.
#[derive(Debug, Clone)]
pub struct RowCodec {
    columns: Vec<(String, ColumnCodec)>,
}

impl RowCodec {
    pub fn new(spec: &TableSpec) -> Self {
        Self {
            columns: spec
                .columns
                .iter()
                .map(|c| (c.name.clone(), ColumnCodec::for_type(&c.local)))
                .collect(),
        }
    }

    /// Column names written per row, `updated_at` last.
    pub fn column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|(name, _)| name.clone())
            .chain(std::iter::once(UPDATED_AT.to_string()))
            .collect()
    }

    /// Decode one row, appending `now` as `updated_at`.
    ///
    /// # Errors
    ///
    /// Returns `DecodeError` naming the first column that failed, or a width
    /// mismatch between the row and the table.
    pub fn decode(&self, row: UpstreamRow, now: NaiveDateTime) -> Result<Vec<LocalValue>, DecodeError> {
        if row.values.len() != self.columns.len() {
            return Err(DecodeError {
                column: "*".to_string(),
                reason: format!("row has {} values, table has {} columns", row.values.len(), self.columns.len()),
            });
        }

        let mut out = Vec::with_capacity(self.columns.len() + 1);
        for ((name, codec), value) in self.columns.iter().zip(row.values) {
            let decoded = codec.decode(value).map_err(|reason| DecodeError {
                column: name.clone(),
                reason,
            })?;
            out.push(decoded);
        }
        out.push(LocalValue::Timestamp(now));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::schema::TableSpec;
    use crate::sync::types::UpstreamColumn;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn utf16le(s: &str) -> Vec<u8> {
        s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
    }

    #[test]
    fn test_null_passes_through_every_codec() {
        for codec in [ColumnCodec::Bytes, ColumnCodec::Text, ColumnCodec::Decimal, ColumnCodec::Uuid] {
            assert_eq!(codec.decode(UpstreamValue::Null), Ok(LocalValue::Null));
        }
    }

    #[test]
    fn test_bytes_pass_through_unchanged() {
        let raw = vec![0u8, 159, 146, 150, 0];
        assert_eq!(
            ColumnCodec::Bytes.decode(UpstreamValue::Bytes(raw.clone())),
            Ok(LocalValue::Bytes(raw))
        );
    }

    #[test]
    fn test_text_bytes_decode_utf16le() {
        let decoded = ColumnCodec::Text.decode(UpstreamValue::Bytes(utf16le("客戶A"))).unwrap();
        assert_eq!(decoded, LocalValue::Text("客戶A".to_string()));
    }

    #[test]
    fn test_text_bytes_fall_back_to_big5() {
        // "測試" in Big5 plus a trailing ASCII byte makes the length odd.
        let mut big5 = vec![0xB4, 0xFA, 0xB8, 0xD5];
        big5.push(b'1');
        let decoded = ColumnCodec::Text.decode(UpstreamValue::Bytes(big5)).unwrap();
        assert_eq!(decoded, LocalValue::Text("測試1".to_string()));
    }

    #[test]
    fn test_nul_is_stripped_from_text() {
        let decoded = ColumnCodec::Text
            .decode(UpstreamValue::Text("AB\0C\0".to_string()))
            .unwrap();
        assert_eq!(decoded, LocalValue::Text("ABC".to_string()));

        let decoded = ColumnCodec::Text.decode(UpstreamValue::Bytes(utf16le("X\0Y"))).unwrap();
        assert_eq!(decoded, LocalValue::Text("XY".to_string()));
    }

    #[test]
    fn test_integer_widths() {
        assert_eq!(ColumnCodec::SmallInt.decode(UpstreamValue::U8(200)), Ok(LocalValue::I16(200)));
        assert_eq!(ColumnCodec::BigInt.decode(UpstreamValue::I32(-5)), Ok(LocalValue::I64(-5)));
        assert!(ColumnCodec::SmallInt.decode(UpstreamValue::I32(70_000)).is_err());
        assert!(ColumnCodec::Integer.decode(UpstreamValue::Text("x".into())).is_err());
    }

    #[test]
    fn test_decimal_and_bit() {
        let d: Decimal = "12.3400".parse().unwrap();
        assert_eq!(ColumnCodec::Decimal.decode(UpstreamValue::Decimal(d)), Ok(LocalValue::Decimal(d)));
        assert_eq!(ColumnCodec::Boolean.decode(UpstreamValue::U8(1)), Ok(LocalValue::Bool(true)));
    }

    #[test]
    fn test_row_codec_appends_updated_at() {
        let spec = TableSpec::from_upstream(
            "comCustomer",
            &[
                UpstreamColumn::new("Flag", "char").with_length(1),
                UpstreamColumn::new("ID", "nvarchar").with_length(10),
                UpstreamColumn::new("Credit", "money"),
            ],
        );
        let codec = RowCodec::new(&spec);
        assert_eq!(codec.column_names(), vec!["Flag", "ID", "Credit", "updated_at"]);

        let values = codec
            .decode(
                UpstreamRow::new(vec![
                    UpstreamValue::Text("T".into()),
                    UpstreamValue::Text("C001".into()),
                    UpstreamValue::Null,
                ]),
                now(),
            )
            .unwrap();
        assert_eq!(values.len(), 4);
        assert_eq!(values[3], LocalValue::Timestamp(now()));
    }

    #[test]
    fn test_row_codec_reports_failing_column() {
        let spec = TableSpec::from_upstream("t", &[UpstreamColumn::new("Qty", "int")]);
        let err = RowCodec::new(&spec)
            .decode(UpstreamRow::new(vec![UpstreamValue::Text("many".into())]), now())
            .unwrap_err();
        assert_eq!(err.column, "Qty");

        let err = RowCodec::new(&spec).decode(UpstreamRow::new(vec![]), now()).unwrap_err();
        assert!(err.reason.contains("0 values"));
    }

    #[test]
    fn test_local_value_binds_typed() {
        let mut buf = BytesMut::new();
        let is_null = LocalValue::I32(7).to_sql_checked(&Type::INT4, &mut buf).unwrap();
        assert!(matches!(is_null, IsNull::No));
        assert_eq!(&buf[..], &7i32.to_be_bytes());

        let mut buf = BytesMut::new();
        assert!(matches!(LocalValue::Null.to_sql_checked(&Type::TEXT, &mut buf).unwrap(), IsNull::Yes));

        let mut buf = BytesMut::new();
        assert!(LocalValue::I16(1).to_sql_checked(&Type::TEXT, &mut buf).is_err());
    }
}
