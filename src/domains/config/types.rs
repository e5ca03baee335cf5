use crate::domains::sync::types::{parse_datetime, parse_optional_datetime};
use crate::errors::DomainError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

/// Where dictation audio is transcribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriberSource {
    Local,
    OpenAi,
    Groq,
}

impl TranscriberSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriberSource::Local => "local",
            TranscriberSource::OpenAi => "openai",
            TranscriberSource::Groq => "groq",
        }
    }
}

impl FromStr for TranscriberSource {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(TranscriberSource::Local),
            "openai" => Ok(TranscriberSource::OpenAi),
            "groq" => Ok(TranscriberSource::Groq),
            _ => Err(DomainError::Internal(format!(
                "invalid transcriber source: {}",
                s
            ))),
        }
    }
}

/// Application configuration. A single replicated row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub id: i64,
    pub notion_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub transcriber_source: TranscriberSource,
    pub whisper_model_name: Option<String>,
    pub use_gpu: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Config {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: 1,
            notion_api_key: None,
            openai_api_key: None,
            transcriber_source: TranscriberSource::Local,
            whisper_model_name: None,
            use_gpu: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw table image. Journal post-images are built from this so the wire
/// carries exactly what the store holds.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConfigRow {
    pub id: i64,
    pub notion_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub transcriber_source: String,
    pub whisper_model_name: Option<String>,
    pub use_gpu: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl TryFrom<ConfigRow> for Config {
    type Error = DomainError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            notion_api_key: row.notion_api_key,
            openai_api_key: row.openai_api_key,
            transcriber_source: TranscriberSource::from_str(&row.transcriber_source)?,
            whisper_model_name: row.whisper_model_name,
            use_gpu: row.use_gpu != 0,
            created_at: parse_datetime(&row.created_at, "config.created_at")?,
            updated_at: parse_datetime(&row.updated_at, "config.updated_at")?,
            deleted_at: parse_optional_datetime(row.deleted_at, "config.deleted_at")?,
        })
    }
}
