//! Typed row values for table copies.

use crate::error::{MigrateError, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tiberius::{Row, ToSql};
use uuid::Uuid;

/// SQL value enum for type-safe row handling.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null(SqlNullType),
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Date(NaiveDate),
    Time(NaiveTime),
}

/// Type hint for NULL values so the parameter is sent with a compatible type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlNullType {
    Bool,
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }
}

/// Convert a value to a boxed tiberius parameter.
pub fn to_sql_param(value: &SqlValue) -> Box<dyn ToSql> {
    match value {
        SqlValue::Null(null_type) => null_param(*null_type),
        SqlValue::Bool(b) => Box::new(*b),
        SqlValue::U8(v) => Box::new(*v),
        SqlValue::I16(i) => Box::new(*i),
        SqlValue::I32(i) => Box::new(*i),
        SqlValue::I64(i) => Box::new(*i),
        SqlValue::F32(f) => Box::new(*f),
        SqlValue::F64(f) => Box::new(*f),
        SqlValue::String(s) => Box::new(s.clone()),
        SqlValue::Bytes(b) => Box::new(b.clone()),
        SqlValue::Uuid(u) => Box::new(*u),
        SqlValue::Decimal(d) => Box::new(*d),
        SqlValue::DateTime(dt) => Box::new(*dt),
        SqlValue::DateTimeOffset(dto) => Box::new(*dto),
        SqlValue::Date(d) => Box::new(*d),
        SqlValue::Time(t) => Box::new(*t),
    }
}

// Binary columns reject an NVARCHAR NULL, so NULLs carry their column type.
fn null_param(null_type: SqlNullType) -> Box<dyn ToSql> {
    match null_type {
        SqlNullType::Bool => Box::new(Option::<bool>::None),
        SqlNullType::U8 => Box::new(Option::<u8>::None),
        SqlNullType::I16 => Box::new(Option::<i16>::None),
        SqlNullType::I32 => Box::new(Option::<i32>::None),
        SqlNullType::I64 => Box::new(Option::<i64>::None),
        SqlNullType::F32 => Box::new(Option::<f32>::None),
        SqlNullType::F64 => Box::new(Option::<f64>::None),
        SqlNullType::String => Box::new(Option::<String>::None),
        SqlNullType::Bytes => Box::new(Option::<Vec<u8>>::None),
        SqlNullType::Uuid => Box::new(Option::<Uuid>::None),
        SqlNullType::Decimal => Box::new(Option::<Decimal>::None),
        SqlNullType::DateTime => Box::new(Option::<NaiveDateTime>::None),
        SqlNullType::DateTimeOffset => Box::new(Option::<DateTime<FixedOffset>>::None),
        SqlNullType::Date => Box::new(Option::<NaiveDate>::None),
        SqlNullType::Time => Box::new(Option::<NaiveTime>::None),
    }
}

/// Whether a column of this type can be read and written by the row mover.
pub fn is_supported_type(data_type: &str) -> bool {
    !matches!(
        data_type.to_lowercase().as_str(),
        "sql_variant" | "geography" | "geometry" | "hierarchyid" | "timestamp" | "rowversion"
    )
}

/// Whether a column of this type may appear in an ORDER BY.
pub fn is_orderable_type(data_type: &str) -> bool {
    is_supported_type(data_type)
        && !matches!(
            data_type.to_lowercase().as_str(),
            "text" | "ntext" | "image" | "xml"
        )
}

/// Read column `idx` of a row according to its SQL Server base type.
///
/// Type mismatches are errors rather than silent NULLs, since a copy must not
/// lose data.
pub fn convert_row_value(row: &Row, idx: usize, data_type: &str) -> Result<SqlValue> {
    let dt = data_type.to_lowercase();
    let mismatch = |e: tiberius::error::Error| {
        MigrateError::transfer(
            format!("column {}", idx),
            format!("cannot read {} value: {}", dt, e),
        )
    };

    let value = match dt.as_str() {
        "bit" => row
            .try_get::<bool, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::Bool)
            .unwrap_or(SqlValue::Null(SqlNullType::Bool)),
        "tinyint" => row
            .try_get::<u8, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::U8)
            .unwrap_or(SqlValue::Null(SqlNullType::U8)),
        "smallint" => row
            .try_get::<i16, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::I16)
            .unwrap_or(SqlValue::Null(SqlNullType::I16)),
        "int" => row
            .try_get::<i32, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::I32)
            .unwrap_or(SqlValue::Null(SqlNullType::I32)),
        "bigint" => row
            .try_get::<i64, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::I64)
            .unwrap_or(SqlValue::Null(SqlNullType::I64)),
        "real" => row
            .try_get::<f32, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::F32)
            .unwrap_or(SqlValue::Null(SqlNullType::F32)),
        "float" => row
            .try_get::<f64, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::F64)
            .unwrap_or(SqlValue::Null(SqlNullType::F64)),
        "money" | "smallmoney" => row
            .try_get::<f64, _>(idx)
            .map_err(mismatch)?
            .map(|f| {
                Decimal::try_from(f)
                    .map(SqlValue::Decimal)
                    .unwrap_or(SqlValue::F64(f))
            })
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        "decimal" | "numeric" => row
            .try_get::<Decimal, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::Decimal)
            .unwrap_or(SqlValue::Null(SqlNullType::Decimal)),
        "uniqueidentifier" => row
            .try_get::<Uuid, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::Uuid)
            .unwrap_or(SqlValue::Null(SqlNullType::Uuid)),
        "datetime" | "datetime2" | "smalldatetime" => row
            .try_get::<NaiveDateTime, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::DateTime)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTime)),
        "datetimeoffset" => row
            .try_get::<DateTime<FixedOffset>, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::DateTimeOffset)
            .unwrap_or(SqlValue::Null(SqlNullType::DateTimeOffset)),
        "date" => row
            .try_get::<NaiveDate, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::Date)
            .unwrap_or(SqlValue::Null(SqlNullType::Date)),
        "time" => row
            .try_get::<NaiveTime, _>(idx)
            .map_err(mismatch)?
            .map(SqlValue::Time)
            .unwrap_or(SqlValue::Null(SqlNullType::Time)),
        "binary" | "varbinary" | "image" => row
            .try_get::<&[u8], _>(idx)
            .map_err(mismatch)?
            .map(|v| SqlValue::Bytes(v.to_vec()))
            .unwrap_or(SqlValue::Null(SqlNullType::Bytes)),
        other if !is_supported_type(other) => {
            return Err(MigrateError::transfer(
                format!("column {}", idx),
                format!("unsupported column type {}", other),
            ));
        }
        _ => row
            .try_get::<&str, _>(idx)
            .map_err(mismatch)?
            .map(|s| SqlValue::String(s.to_string()))
            .unwrap_or(SqlValue::Null(SqlNullType::String)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_support() {
        assert!(is_supported_type("nvarchar"));
        assert!(is_supported_type("XML"));
        assert!(!is_supported_type("timestamp"));
        assert!(!is_supported_type("geography"));
        assert!(is_orderable_type("int"));
        assert!(!is_orderable_type("ntext"));
        assert!(!is_orderable_type("xml"));
    }

    #[test]
    fn test_is_null() {
        assert!(SqlValue::Null(SqlNullType::Bytes).is_null());
        assert!(!SqlValue::I32(0).is_null());
    }
}
