//! SQLite-backed record source
//!
//! Full-table scans with column-complete rows. Values are converted by
//! their SQLite storage class; BLOBs become base64 strings.

use std::path::Path;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64_STANDARD};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

use super::{RecordSource, Row};
use crate::error::{AppError, SourceError};

/// Read-only view over the marketplace SQLite database
#[derive(Clone)]
pub struct SqliteRecordSource {
    pool: SqlitePool,
}

impl SqliteRecordSource {
    /// Open `path` read-only.
    pub async fn open(path: &Path) -> Result<Self, AppError> {
        let connection_string = format!("sqlite:{}?mode=ro", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordSource for SqliteRecordSource {
    async fn fetch_all(&self, collection: &str) -> Result<Vec<Row>, SourceError> {
        validate_identifier(collection)?;

        let rows = sqlx::query(&format!("SELECT * FROM \"{}\"", collection))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify_error(collection, e))?;

        rows.iter()
            .map(|row| row_to_json(row).map_err(|e| classify_error(collection, e)))
            .collect()
    }
}

fn validate_identifier(name: &str) -> Result<(), SourceError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SourceError::Invalid(format!(
            "invalid collection name: {:?}",
            name
        )))
    }
}

fn classify_error(collection: &str, error: sqlx::Error) -> SourceError {
    let message = error.to_string();
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("no such table") {
        SourceError::NotFound(collection.to_string())
    } else if lowered.contains("not authorized")
        || lowered.contains("permission denied")
        || lowered.contains("access denied")
    {
        SourceError::Denied {
            collection: collection.to_string(),
            message,
        }
    } else {
        SourceError::Query(message)
    }
}

fn row_to_json(row: &SqliteRow) -> Result<Row, sqlx::Error> {
    let mut out = Row::new();
    for column in row.columns() {
        let index = column.ordinal();
        let raw = row.try_get_raw(index)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage_class = raw.type_info().name().to_ascii_uppercase();
            match storage_class.as_str() {
                "INTEGER" | "INT" | "BIGINT" | "INT8" => {
                    Value::from(row.try_get_unchecked::<i64, _>(index)?)
                }
                "BOOLEAN" => Value::Bool(row.try_get_unchecked::<i64, _>(index)? != 0),
                "REAL" | "FLOAT" | "DOUBLE" => {
                    serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
                "BLOB" => Value::String(
                    BASE64_STANDARD.encode(row.try_get_unchecked::<Vec<u8>, _>(index)?),
                ),
                _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}
