//! Conversions between [`SqlValue`]/[`Row`] and PostgreSQL wire types.

use crate::storage::value::{Row, SqlValue};
use base64::Engine as _;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type, to_sql_checked};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(b) => b.to_sql(ty, out),
            Self::Integer(i) => integer_to_sql(*i, ty, out),
            Self::Real(f) => real_to_sql(*f, ty, out),
            Self::Text(s) => text_to_sql(s, ty, out),
            Self::Blob(b) => b.as_slice().to_sql(ty, out),
        }
    }

    // Conversion is decided per value in `to_sql`.
    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn integer_to_sql(value: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::INT2 {
        i16::try_from(value)?.to_sql(ty, out)
    } else if *ty == Type::INT4 {
        i32::try_from(value)?.to_sql(ty, out)
    } else if *ty == Type::FLOAT4 || *ty == Type::FLOAT8 {
        #[allow(clippy::cast_precision_loss)]
        real_to_sql(value as f64, ty, out)
    } else if *ty == Type::BOOL {
        (value != 0).to_sql(ty, out)
    } else if is_text(ty) {
        value.to_string().to_sql(ty, out)
    } else {
        value.to_sql(ty, out)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn real_to_sql(value: f64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::FLOAT4 {
        (value as f32).to_sql(ty, out)
    } else {
        value.to_sql(ty, out)
    }
}

fn text_to_sql(value: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if *ty == Type::JSON || *ty == Type::JSONB {
        serde_json::from_str::<Value>(value)?.to_sql(ty, out)
    } else if *ty == Type::TIMESTAMPTZ {
        DateTime::parse_from_rfc3339(value)?
            .with_timezone(&Utc)
            .to_sql(ty, out)
    } else if *ty == Type::TIMESTAMP {
        value.parse::<NaiveDateTime>()?.to_sql(ty, out)
    } else if *ty == Type::DATE {
        value.parse::<NaiveDate>()?.to_sql(ty, out)
    } else if *ty == Type::INT2 || *ty == Type::INT4 || *ty == Type::INT8 {
        integer_to_sql(value.trim().parse::<i64>()?, ty, out)
    } else {
        value.to_sql(ty, out)
    }
}

fn is_text(ty: &Type) -> bool {
    [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME, Type::UNKNOWN].contains(ty)
}

fn get<'a, T: FromSql<'a>>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T> {
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Converts a driver row into a column-name keyed map.
///
/// Types without a JSON mapping (`NUMERIC`, ranges, arrays) come back as `null`;
/// cast them in SQL when they are needed.
#[must_use]
pub fn row_to_json(row: &tokio_postgres::Row) -> Row {
    let mut mapped = Row::new();
    for (idx, column) in row.columns().iter().enumerate() {
        mapped.insert(column.name().to_string(), column_to_json(row, idx, column.type_()));
    }
    mapped
}

fn column_to_json(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> Value {
    let value = if *ty == Type::BOOL {
        get::<bool>(row, idx).map(Value::from)
    } else if *ty == Type::INT2 {
        get::<i16>(row, idx).map(Value::from)
    } else if *ty == Type::INT4 {
        get::<i32>(row, idx).map(Value::from)
    } else if *ty == Type::INT8 {
        get::<i64>(row, idx).map(Value::from)
    } else if *ty == Type::OID {
        get::<u32>(row, idx).map(Value::from)
    } else if *ty == Type::FLOAT4 {
        get::<f32>(row, idx).map(|f| Value::from(f64::from(f)))
    } else if *ty == Type::FLOAT8 {
        get::<f64>(row, idx).map(Value::from)
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        get::<Value>(row, idx)
    } else if *ty == Type::TIMESTAMPTZ {
        get::<DateTime<Utc>>(row, idx).map(|t| Value::from(t.to_rfc3339()))
    } else if *ty == Type::TIMESTAMP {
        get::<NaiveDateTime>(row, idx).map(|t| Value::from(t.to_string()))
    } else if *ty == Type::DATE {
        get::<NaiveDate>(row, idx).map(|d| Value::from(d.to_string()))
    } else if *ty == Type::BYTEA {
        get::<Vec<u8>>(row, idx)
            .map(|b| Value::from(base64::engine::general_purpose::STANDARD.encode(b)))
    } else {
        get::<String>(row, idx).map(Value::from)
    };

    value.unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: &SqlValue, ty: &Type) -> Result<(IsNull, Vec<u8>), BoxError> {
        let mut buf = BytesMut::new();
        let is_null = value.to_sql(ty, &mut buf)?;
        Ok((is_null, buf.to_vec()))
    }

    #[test]
    fn test_integer_narrows_to_column_width() {
        let (_, int4) = encode(&SqlValue::Integer(7), &Type::INT4).expect("int4");
        assert_eq!(int4, 7_i32.to_be_bytes());

        let (_, int8) = encode(&SqlValue::Integer(7), &Type::INT8).expect("int8");
        assert_eq!(int8, 7_i64.to_be_bytes());
    }

    #[test]
    fn test_integer_overflow_is_an_error() {
        assert!(encode(&SqlValue::Integer(i64::MAX), &Type::INT4).is_err());
    }

    #[test]
    fn test_null_encodes_as_null() {
        let (is_null, bytes) = encode(&SqlValue::Null, &Type::TEXT).expect("null");
        assert!(matches!(is_null, IsNull::Yes));
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_text_into_jsonb_is_parsed() {
        let (_, jsonb) = encode(&SqlValue::Text(r#"{"a":1}"#.into()), &Type::JSONB).expect("jsonb");
        // JSONB binary format: version byte followed by the text.
        assert_eq!(jsonb[0], 1);
        assert!(encode(&SqlValue::Text("not json".into()), &Type::JSONB).is_err());
    }

    #[test]
    fn test_text_into_timestamptz() {
        let value = SqlValue::Text("2024-03-01T08:00:00+08:00".into());
        assert!(encode(&value, &Type::TIMESTAMPTZ).is_ok());
    }
}
