use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Refresh when less than this much of the token's lifetime remains.
const REFRESH_MARGIN_SECONDS: i64 = 60;

/// OAuth token for the remote drive folder, persisted as a LOCAL-store
/// singleton.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub user_email: Option<String>,
}

impl DriveToken {
    /// Pure refresh decision: (saved token, current time) -> refresh or not.
    /// Missing expiry means the token's lifetime is unknown; refresh.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => expires_at - now < Duration::seconds(REFRESH_MARGIN_SECONDS),
        }
    }
}

/// Application OAuth credentials, embedded at build time in a read-only
/// `credentials/` directory. Absence means sync is disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct DriveCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub token_endpoint: String,
}

impl DriveCredentials {
    pub const FILE_NAME: &'static str = "drive.json";

    /// Load from `<dir>/drive.json`; `None` when the file is absent or
    /// unreadable.
    pub fn load(dir: &Path) -> Option<Self> {
        let raw = fs::read_to_string(dir.join(Self::FILE_NAME)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(credentials) => Some(credentials),
            Err(e) => {
                log::error!("malformed {}: {}", Self::FILE_NAME, e);
                None
            }
        }
    }
}
