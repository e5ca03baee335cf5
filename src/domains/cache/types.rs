use crate::domains::sync::types::{parse_datetime, parse_optional_datetime};
use crate::errors::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Envelope for cached values: arbitrary JSON (string, number, boolean,
/// array, object or null) stored under a stable wrapper so the column is
/// always a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheValue {
    pub value: serde_json::Value,
}

/// A cached key/value row.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: i64,
    pub key: String,
    pub value: Option<CacheValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Raw table image. Journal post-images are built from this so the wire
/// carries exactly what the store holds.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct CacheRow {
    pub id: i64,
    pub key: String,
    pub value: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl TryFrom<CacheRow> for CacheEntry {
    type Error = DomainError;

    fn try_from(row: CacheRow) -> Result<Self, Self::Error> {
        let value = row
            .value
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| {
                    DomainError::Internal(format!("invalid JSON in caches.value: {}", e))
                })
            })
            .transpose()?;
        Ok(Self {
            id: row.id,
            key: row.key,
            value,
            created_at: parse_datetime(&row.created_at, "caches.created_at")?,
            updated_at: parse_datetime(&row.updated_at, "caches.updated_at")?,
            deleted_at: parse_optional_datetime(row.deleted_at, "caches.deleted_at")?,
        })
    }
}
