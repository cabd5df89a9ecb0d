//! Row decoding.
//!
//! Rows are decoded into [`Row`] snapshots (column name to JSON value) so that the
//! transaction and versioning layers stay database-agnostic.
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Database-specific decoders handle the actual value extraction

use crate::models::{DatabaseType, Row};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Text,
    Binary,
    Timestamp,
    Json,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.contains("int") || lower.contains("serial") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "numeric" && db == DatabaseType::SQLite {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    // SQLite stores datetimes as text; only server databases have native timestamps
    if db != DatabaseType::SQLite && (lower.contains("timestamp") || lower == "datetime") {
        return TypeCategory::Timestamp;
    }
    TypeCategory::Text
}

/// Encode binary column data for a JSON snapshot.
pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

/// Decode binary data previously produced by [`encode_binary`].
pub fn decode_binary(value: &JsonValue) -> Option<Vec<u8>> {
    value.as_str().and_then(|s| STANDARD.decode(s).ok())
}

/// Convert a driver row into a JSON snapshot.
pub trait RowToJson {
    fn to_json_row(&self) -> Row;
}

macro_rules! impl_row_to_json {
    ($row:ty, $db:expr, $decode:path) => {
        impl RowToJson for $row {
            fn to_json_row(&self) -> Row {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let category = categorize_type(col.type_info().name(), $db);
                        (col.name().to_string(), $decode(self, idx, category))
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_row_to_json!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_row_to_json!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn text_value(v: String, category: TypeCategory) -> JsonValue {
    if category == TypeCategory::Json {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
            return json;
        }
    }
    JsonValue::String(v)
}

// =============================================================================
// Database-Specific Decoders
// =============================================================================

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => {
                if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                    return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
                }
                row.try_get::<Option<u64>, _>(idx)
                    .ok()
                    .flatten()
                    .map(JsonValue::from)
                    .unwrap_or(JsonValue::Null)
            }
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| encode_binary(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Timestamp => {
                if let Ok(Some(v)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
                    return JsonValue::String(v.to_rfc3339());
                }
                row.try_get::<Option<NaiveDateTime>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|v| JsonValue::String(v.and_utc().to_rfc3339()))
                    .unwrap_or(JsonValue::Null)
            }
            TypeCategory::Text | TypeCategory::Json => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(|v| text_value(v, category))
                .unwrap_or(JsonValue::Null),
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => {
                if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
                    return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
                }
                if let Ok(v) = row.try_get::<Option<i32>, _>(idx) {
                    return v.map(JsonValue::from).unwrap_or(JsonValue::Null);
                }
                row.try_get::<Option<i16>, _>(idx)
                    .ok()
                    .flatten()
                    .map(JsonValue::from)
                    .unwrap_or(JsonValue::Null)
            }
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => {
                if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
                    return v.map(float_value).unwrap_or(JsonValue::Null);
                }
                row.try_get::<Option<f32>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|v| float_value(v as f64))
                    .unwrap_or(JsonValue::Null)
            }
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| encode_binary(&v))
                .unwrap_or(JsonValue::Null),
            TypeCategory::Timestamp => {
                if let Ok(Some(v)) = row.try_get::<Option<DateTime<Utc>>, _>(idx) {
                    return JsonValue::String(v.to_rfc3339());
                }
                row.try_get::<Option<NaiveDateTime>, _>(idx)
                    .ok()
                    .flatten()
                    .map(|v| JsonValue::String(v.and_utc().to_rfc3339()))
                    .unwrap_or(JsonValue::Null)
            }
            TypeCategory::Json => row
                .try_get::<Option<JsonValue>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null),
            TypeCategory::Text => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::String)
                .unwrap_or(JsonValue::Null),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::from)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map(JsonValue::Bool)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Float => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map(float_value)
                .unwrap_or(JsonValue::Null),
            TypeCategory::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map(|v| encode_binary(&v))
                .unwrap_or(JsonValue::Null),
            _ => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map(|v| text_value(v, category))
                .unwrap_or(JsonValue::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_type() {
        assert_eq!(
            categorize_type("INTEGER", DatabaseType::SQLite),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BIGINT UNSIGNED", DatabaseType::MySQL),
            TypeCategory::Integer
        );
        assert_eq!(
            categorize_type("BLOB", DatabaseType::SQLite),
            TypeCategory::Binary
        );
        assert_eq!(
            categorize_type("TIMESTAMPTZ", DatabaseType::PostgreSQL),
            TypeCategory::Timestamp
        );
        assert_eq!(
            categorize_type("DATETIME", DatabaseType::SQLite),
            TypeCategory::Text
        );
        assert_eq!(
            categorize_type("jsonb", DatabaseType::PostgreSQL),
            TypeCategory::Json
        );
        assert_eq!(
            categorize_type("VARCHAR", DatabaseType::MySQL),
            TypeCategory::Text
        );
    }

    #[test]
    fn test_binary_roundtrip() {
        let encoded = encode_binary(&[0, 0, 1, 255]);
        assert_eq!(decode_binary(&encoded), Some(vec![0, 0, 1, 255]));
        assert_eq!(decode_binary(&JsonValue::Null), None);
    }
}
