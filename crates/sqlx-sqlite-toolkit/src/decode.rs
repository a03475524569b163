//! Conversion between JSON values and SQLite values

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow, SqliteValueRef};
use sqlx::{Column, Row, Sqlite, TypeInfo, Value, ValueRef};

use crate::{Error, Result};

/// A decoded row: column name to JSON value, in result-set column order.
pub type JsonRow = IndexMap<String, JsonValue>;

/// Bind a JSON value to a SQLx query.
///
/// Integers keep their precision by binding as `i64` whenever they fit.
/// Arrays and objects are stored as JSON text.
pub(crate) fn bind_value<'q>(
   query: Query<'q, Sqlite, SqliteArguments<'q>>,
   value: JsonValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
   match value {
      JsonValue::Null => query.bind(None::<String>),
      JsonValue::Bool(flag) => query.bind(flag),
      JsonValue::String(text) => query.bind(text),
      JsonValue::Number(number) => {
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if let Some(uint_val) = number.as_u64() {
            // Too large for SQLite's INTEGER; bind as REAL and accept precision loss
            query.bind(uint_val as f64)
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

/// Decode a single SQLite value to JSON based on its runtime storage class.
///
/// BLOBs are returned as base64 strings.
pub fn to_json(value: SqliteValueRef<'_>) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = value.type_info().name().to_string();
   let owned = ValueRef::to_owned(&value);

   let decoded = match type_name.as_str() {
      "INTEGER" | "BOOLEAN" => owned.try_decode_unchecked::<i64>().map(JsonValue::from),
      "REAL" | "NUMERIC" => owned.try_decode_unchecked::<f64>().map(JsonValue::from),
      "TEXT" | "DATE" | "TIME" | "DATETIME" => {
         owned.try_decode_unchecked::<String>().map(JsonValue::from)
      }
      "BLOB" => owned
         .try_decode_unchecked::<Vec<u8>>()
         .map(|bytes| JsonValue::from(BASE64.encode(bytes))),
      "NULL" => return Ok(JsonValue::Null),
      _ => return Err(Error::UnsupportedDatatype(type_name)),
   };

   Ok(decoded?)
}

/// Decode SQLite rows to JSON rows.
pub(crate) fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<JsonRow>> {
   let mut values = Vec::with_capacity(rows.len());
   for row in rows {
      let mut value = IndexMap::with_capacity(row.columns().len());
      for (i, column) in row.columns().iter().enumerate() {
         let v = row.try_get_raw(i)?;
         value.insert(column.name().to_string(), to_json(v)?);
      }
      values.push(value);
   }
   Ok(values)
}
