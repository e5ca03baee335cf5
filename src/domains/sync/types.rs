use crate::errors::{DomainError, DomainResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::HashMap;

/// The operation carried by a journal entry. SAVE covers both create and
/// update; either way the entry carries the full row post-image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Save,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Save => "SAVE",
            ChangeOperation::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "SAVE" => Some(ChangeOperation::Save),
            "DELETE" => Some(ChangeOperation::Delete),
            _ => None,
        }
    }
}

impl From<ChangeOperation> for String {
    fn from(op: ChangeOperation) -> Self {
        op.as_str().to_string()
    }
}

/// The coalescing key of the local journal and the remote change-blob
/// naming: `<table>-<row-id>-<op>`.
pub fn change_id(table: &str, row_id: &str, op: ChangeOperation) -> String {
    format!("{}-{}-{}", table, row_id, op.as_str())
}

/// Default sync cursor for a device that has never synced.
pub fn sync_epoch() -> DateTime<Utc> {
    // 2000-01-01T00:00:00Z
    DateTime::from_timestamp(946_684_800, 0).unwrap_or_default()
}

/// Remote timestamps are second-granular; the cursor is stored truncated.
pub fn truncate_to_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or_else(sync_epoch)
}

pub(crate) fn parse_datetime(s: &str, field: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::Internal(format!("invalid RFC3339 in {}: {} ({})", field, s, e)))
}

pub(crate) fn parse_optional_datetime(
    s: Option<String>,
    field: &str,
) -> DomainResult<Option<DateTime<Utc>>> {
    s.map(|v| parse_datetime(&v, field)).transpose()
}

/// A pending entry of the local change journal.
#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub id: i64,
    pub change_id: String,
    pub table_name: String,
    pub row_id: String,
    pub operation: ChangeOperation,
    pub new_data: serde_json::Value,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChangeLogRow {
    pub id: i64,
    pub change_id: String,
    pub table_name: String,
    pub row_id: String,
    pub operation: String,
    pub new_data: String,
    pub synced: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<ChangeLogRow> for ChangeLogEntry {
    type Error = DomainError;

    fn try_from(row: ChangeLogRow) -> Result<Self, Self::Error> {
        let operation = ChangeOperation::from_str(&row.operation).ok_or_else(|| {
            DomainError::Internal(format!("invalid operation in change_log: {}", row.operation))
        })?;
        let new_data = serde_json::from_str(&row.new_data).map_err(|e| {
            DomainError::Internal(format!("invalid JSON in change_log.new_data: {}", e))
        })?;
        Ok(Self {
            id: row.id,
            change_id: row.change_id,
            table_name: row.table_name,
            row_id: row.row_id,
            operation,
            new_data,
            synced: row.synced != 0,
            created_at: parse_datetime(&row.created_at, "change_log.created_at")?,
            updated_at: parse_datetime(&row.updated_at, "change_log.updated_at")?,
        })
    }
}

/// Wire encoding of a change blob body. Field names are part of the remote
/// format shared by every device; do not rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "ChangeID")]
    pub change_id: String,
    #[serde(rename = "TableName")]
    pub table_name: String,
    #[serde(rename = "RowID")]
    pub row_id: String,
    #[serde(rename = "Operation")]
    pub operation: ChangeOperation,
    #[serde(rename = "NewData")]
    pub new_data: serde_json::Value,
    #[serde(rename = "CreatedAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "UpdatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl From<&ChangeLogEntry> for ChangeRecord {
    fn from(entry: &ChangeLogEntry) -> Self {
        Self {
            change_id: entry.change_id.clone(),
            table_name: entry.table_name.clone(),
            row_id: entry.row_id.clone(),
            operation: entry.operation,
            new_data: entry.new_data.clone(),
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        }
    }
}

/// Metadata of a blob in the shared remote folder, as reported by the
/// remote itself. `created_at` is the authoritative ordering key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// The set of rows touched during a worker pass, `{table -> [row-id]}`,
/// handed to the success callback so the UI can refresh selectively.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AffectedTables(HashMap<String, Vec<String>>);

impl AffectedTables {
    pub fn record(&mut self, table: &str, row_id: &str) {
        let rows = self.0.entry(table.to_string()).or_default();
        if !rows.iter().any(|r| r == row_id) {
            rows.push(row_id.to_string());
        }
    }

    pub fn merge(&mut self, other: AffectedTables) {
        for (table, rows) in other.0 {
            for row in rows {
                self.record(&table, &row);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn rows(&self, table: &str) -> &[String] {
        self.0.get(table).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn into_inner(self) -> HashMap<String, Vec<String>> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_id_composition() {
        assert_eq!(
            change_id("pages", "p1", ChangeOperation::Save),
            "pages-p1-SAVE"
        );
        assert_eq!(
            change_id("caches", "recent-files", ChangeOperation::Delete),
            "caches-recent-files-DELETE"
        );
    }

    #[test]
    fn operation_round_trip() {
        for op in [ChangeOperation::Save, ChangeOperation::Delete] {
            assert_eq!(ChangeOperation::from_str(op.as_str()), Some(op));
        }
        assert_eq!(ChangeOperation::from_str("UPSERT"), None);
    }

    #[test]
    fn change_record_wire_field_names() {
        let record = ChangeRecord {
            change_id: "pages-p1-SAVE".into(),
            table_name: "pages".into(),
            row_id: "p1".into(),
            operation: ChangeOperation::Save,
            new_data: serde_json::json!({"id": "p1", "title": "B"}),
            created_at: sync_epoch(),
            updated_at: sync_epoch(),
        };
        let value = serde_json::to_value(&record).unwrap();
        let obj = value.as_object().unwrap();
        for key in ["ChangeID", "TableName", "RowID", "Operation", "NewData"] {
            assert!(obj.contains_key(key), "missing wire field {}", key);
        }
        assert_eq!(obj["Operation"], "SAVE");
        assert_eq!(obj["NewData"]["title"], "B");
    }

    #[test]
    fn truncation_and_epoch() {
        let t = DateTime::parse_from_rfc3339("2026-03-01T10:20:30.750Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            truncate_to_seconds(t).to_rfc3339(),
            "2026-03-01T10:20:30+00:00"
        );
        assert_eq!(sync_epoch().to_rfc3339(), "2000-01-01T00:00:00+00:00");
    }

    #[test]
    fn affected_tables_dedup_and_merge() {
        let mut a = AffectedTables::default();
        a.record("pages", "p1");
        a.record("pages", "p1");
        a.record("pages", "p2");

        let mut b = AffectedTables::default();
        b.record("pages", "p2");
        b.record("caches", "recent");

        a.merge(b);
        assert_eq!(a.rows("pages"), ["p1", "p2"]);
        assert_eq!(a.rows("caches"), ["recent"]);
    }
}
