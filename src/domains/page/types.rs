use crate::domains::sync::types::{parse_datetime, parse_optional_datetime};
use crate::errors::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A note page (or folder) in the page tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub id: String,
    pub title: String,
    pub html_content: String,
    /// Opaque structured editor blocks.
    pub blocks: Option<serde_json::Value>,
    pub is_folder: bool,
    pub expanded: bool,
    pub sort_order: i64,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Page {
    pub fn new(title: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            html_content: String::new(),
            blocks: None,
            is_folder: false,
            expanded: false,
            sort_order: 0,
            parent_id: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn new_folder(title: &str) -> Self {
        let mut page = Self::new(title);
        page.is_folder = true;
        page
    }
}

/// Raw table image. Journal post-images are built from this so the wire
/// carries exactly what the store holds.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PageRow {
    pub id: String,
    pub title: String,
    pub html_content: String,
    pub blocks: Option<String>,
    pub is_folder: i64,
    pub expanded: i64,
    pub sort_order: i64,
    pub parent_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl TryFrom<PageRow> for Page {
    type Error = DomainError;

    fn try_from(row: PageRow) -> Result<Self, Self::Error> {
        let blocks = row
            .blocks
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| DomainError::Internal(format!("invalid JSON in pages.blocks: {}", e)))
            })
            .transpose()?;
        Ok(Self {
            id: row.id,
            title: row.title,
            html_content: row.html_content,
            blocks,
            is_folder: row.is_folder != 0,
            expanded: row.expanded != 0,
            sort_order: row.sort_order,
            parent_id: row.parent_id,
            created_at: parse_datetime(&row.created_at, "pages.created_at")?,
            updated_at: parse_datetime(&row.updated_at, "pages.updated_at")?,
            deleted_at: parse_optional_datetime(row.deleted_at, "pages.deleted_at")?,
        })
    }
}
