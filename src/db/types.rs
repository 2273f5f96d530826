//! Row decoding.
//!
//! Converts backend rows into the column names and JSON values a [`ResultSet`]
//! carries. Each column's declared type is first classified into a
//! [`TypeCategory`]; the backend decoder then tries the Rust types that category
//! admits, in order, and takes the first that decodes.
//!
//! Exact numerics are returned as strings so no precision is lost. Temporal values
//! are returned as ISO-8601 strings.
//!
//! [`ResultSet`]: crate::models::ResultSet

use crate::models::{DatabaseType, ResultSet};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};
use std::fmt::Write as _;

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Temporal,
    Binary,
    Json,
    Uuid,
    /// Text and anything unrecognised; decoded as a string.
    Text,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite NUMERIC affinity stores floats
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    // Before the integer check: "interval" contains "int"
    if lower == "interval" {
        return TypeCategory::Text;
    }

    if lower.starts_with("timestamp")
        || lower == "datetime"
        || lower == "date"
        || lower.starts_with("time")
    {
        // SQLite keeps dates as text; return them as stored.
        return if db == DatabaseType::SQLite {
            TypeCategory::Text
        } else {
            TypeCategory::Temporal
        };
    }

    if (lower.contains("int") && lower != "point") || lower.contains("serial") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    TypeCategory::Text
}

// =============================================================================
// Exact Numerics
// =============================================================================

/// DECIMAL/NUMERIC value kept as its exact decimal text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        // MySQL sends DECIMAL as text in both protocols.
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name().eq_ignore_ascii_case("numeric")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => pg_numeric_to_string(value.as_bytes()?).map(RawDecimal),
        }
    }
}

/// Render a PostgreSQL binary NUMERIC as decimal text.
///
/// Layout: digit count, weight, sign and display scale as 16-bit big-endian
/// integers, followed by base-10000 digits. `weight` is the power of 10000 of the
/// first digit.
fn pg_numeric_to_string(buf: &[u8]) -> Result<String, BoxDynError> {
    const NEGATIVE: u16 = 0x4000;
    const NAN: u16 = 0xC000;
    const POS_INF: u16 = 0xD000;
    const NEG_INF: u16 = 0xF000;

    let read = |at: usize| -> Result<u16, BoxDynError> {
        buf.get(at..at + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };

    let ndigits = read(0)? as usize;
    let weight = read(2)? as i16 as i64;
    let sign = read(4)?;
    let dscale = read(6)? as usize;

    match sign {
        NAN => return Ok("NaN".to_string()),
        POS_INF => return Ok("Infinity".to_string()),
        NEG_INF => return Ok("-Infinity".to_string()),
        _ => {}
    }

    let digits = (0..ndigits)
        .map(|i| read(8 + i * 2))
        .collect::<Result<Vec<u16>, _>>()?;
    let digit = |group: i64| -> u16 {
        usize::try_from(group)
            .ok()
            .and_then(|g| digits.get(g).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NEGATIVE && ndigits > 0 {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        write!(out, "{}", digit(0))?;
        for group in 1..=weight {
            write!(out, "{:04}", digit(group))?;
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut group = weight + 1;
        while fraction.len() < dscale {
            write!(fraction, "{:04}", digit(group))?;
            group += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}

// =============================================================================
// Value Conversion
// =============================================================================

/// Encode binary column data as a base64 JSON string.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Try each listed type in order; the first one compatible with the column wins.
/// A NULL in a compatible column reads as JSON null.
macro_rules! decode_first {
    ($row:expr, $idx:expr, $($ty:ty => $convert:expr),+ $(,)?) => {{
        let mut decoded: Option<JsonValue> = None;
        $(
            if decoded.is_none() {
                match $row.try_get::<Option<$ty>, _>($idx) {
                    Ok(Some(v)) => decoded = Some(($convert)(v)),
                    Ok(None) => decoded = Some(JsonValue::Null),
                    Err(_) => {}
                }
            }
        )+
        decoded.unwrap_or(JsonValue::Null)
    }};
}

/// Trait for converting backend rows into column names and JSON values.
pub trait RowDecode {
    fn column_names(&self) -> Vec<String>;
    fn to_values(&self) -> Vec<JsonValue>;
}

macro_rules! impl_row_decode {
    ($row:ty, $db:expr, $decoder:path) => {
        impl RowDecode for $row {
            fn column_names(&self) -> Vec<String> {
                self.columns()
                    .iter()
                    .map(|col| col.name().to_string())
                    .collect()
            }

            fn to_values(&self) -> Vec<JsonValue> {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| $decoder(self, idx, categorize_type(col.type_info().name(), $db)))
                    .collect()
            }
        }
    };
}

impl_row_decode!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_row_decode!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_row_decode!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

/// Collect decoded rows into a result set. Column names come from the first row.
pub fn into_result_set<R: RowDecode>(rows: Vec<R>) -> ResultSet {
    let columns = rows.first().map(RowDecode::column_names).unwrap_or_default();
    let values = rows.iter().map(RowDecode::to_values).collect();
    ResultSet::new(columns, values)
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => {
                decode_first!(row, idx, RawDecimal => |v: RawDecimal| JsonValue::String(v.0))
            }
            TypeCategory::Integer => decode_first!(row, idx,
                i64 => JsonValue::from,
                u64 => JsonValue::from,
                i32 => JsonValue::from,
                i8 => JsonValue::from,
            ),
            TypeCategory::Boolean => decode_first!(row, idx,
                bool => JsonValue::Bool,
                i8 => |v: i8| JsonValue::Bool(v != 0),
            ),
            TypeCategory::Float => decode_first!(row, idx,
                f64 => float_value,
                f32 => |v: f32| float_value(v as f64),
            ),
            TypeCategory::Temporal => decode_first!(row, idx,
                DateTime<Utc> => |v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()),
                NaiveDateTime => |v: NaiveDateTime| JsonValue::String(v.to_string()),
                NaiveDate => |v: NaiveDate| JsonValue::String(v.to_string()),
                NaiveTime => |v: NaiveTime| JsonValue::String(v.to_string()),
                String => JsonValue::String,
            ),
            TypeCategory::Binary => {
                decode_first!(row, idx, Vec<u8> => |v: Vec<u8>| encode_binary_value(&v))
            }
            TypeCategory::Json => decode_first!(row, idx,
                JsonValue => |v: JsonValue| v,
                String => JsonValue::String,
            ),
            TypeCategory::Uuid | TypeCategory::Text => decode_first!(row, idx,
                String => JsonValue::String,
                Vec<u8> => |v: Vec<u8>| match String::from_utf8(v) {
                    Ok(s) => JsonValue::String(s),
                    Err(e) => encode_binary_value(e.as_bytes()),
                },
            ),
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Decimal => {
                decode_first!(row, idx, RawDecimal => |v: RawDecimal| JsonValue::String(v.0))
            }
            TypeCategory::Integer => decode_first!(row, idx,
                i64 => JsonValue::from,
                i32 => JsonValue::from,
                i16 => JsonValue::from,
            ),
            TypeCategory::Boolean => decode_first!(row, idx, bool => JsonValue::Bool),
            TypeCategory::Float => decode_first!(row, idx,
                f64 => float_value,
                f32 => |v: f32| float_value(v as f64),
            ),
            TypeCategory::Temporal => decode_first!(row, idx,
                DateTime<Utc> => |v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()),
                NaiveDateTime => |v: NaiveDateTime| JsonValue::String(v.to_string()),
                NaiveDate => |v: NaiveDate| JsonValue::String(v.to_string()),
                NaiveTime => |v: NaiveTime| JsonValue::String(v.to_string()),
            ),
            TypeCategory::Binary => {
                decode_first!(row, idx, Vec<u8> => |v: Vec<u8>| encode_binary_value(&v))
            }
            TypeCategory::Json => decode_first!(row, idx, JsonValue => |v: JsonValue| v),
            TypeCategory::Uuid => {
                decode_first!(row, idx, uuid::Uuid => |v: uuid::Uuid| JsonValue::String(v.to_string()))
            }
            TypeCategory::Text => decode_first!(row, idx, String => JsonValue::String),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => decode_first!(row, idx, i64 => JsonValue::from),
            TypeCategory::Boolean => decode_first!(row, idx, bool => JsonValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => {
                decode_first!(row, idx, f64 => float_value)
            }
            TypeCategory::Binary => {
                decode_first!(row, idx, Vec<u8> => |v: Vec<u8>| encode_binary_value(&v))
            }
            TypeCategory::Json => decode_first!(row, idx,
                String => |v: String| serde_json::from_str(&v).unwrap_or(JsonValue::String(v)),
            ),
            _ => decode_first!(row, idx,
                String => JsonValue::String,
                i64 => JsonValue::from,
                f64 => float_value,
                Vec<u8> => |v: Vec<u8>| encode_binary_value(&v),
            ),
        }
    }
}
