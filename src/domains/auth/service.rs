use crate::domains::auth::repository::SqliteDriveTokenRepository;
use crate::domains::auth::types::{DriveCredentials, DriveToken};
use crate::errors::{DomainError, DomainResult, SyncError};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

/// Hands out bearer tokens for remote calls, refreshing opportunistically
/// against the OAuth token endpoint. The stored singleton is rewritten
/// whenever the refresh-token value changes. Connectivity is not checked
/// here; the scheduler's offline probe gates whether a refresh is
/// attempted at all.
pub struct TokenProvider {
    repo: SqliteDriveTokenRepository,
    credentials: Option<DriveCredentials>,
    client: reqwest::Client,
    cached: Mutex<Option<DriveToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

fn auth_err(msg: String) -> DomainError {
    DomainError::Sync(SyncError::Auth(msg))
}

impl TokenProvider {
    pub fn new(repo: SqliteDriveTokenRepository, credentials: Option<DriveCredentials>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            repo,
            credentials,
            client,
            cached: Mutex::new(None),
        }
    }

    /// A currently valid access token, refreshed if the stored one is
    /// expiring.
    pub async fn bearer(&self) -> DomainResult<String> {
        let now = Utc::now();

        let cached = self
            .cached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(token) = cached {
            if !token.needs_refresh(now) {
                return Ok(token.access_token);
            }
        }

        let stored = self
            .repo
            .get()
            .await?
            .ok_or_else(|| auth_err("no stored drive token; authorize first".to_string()))?;
        if !stored.needs_refresh(now) {
            *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(stored.clone());
            return Ok(stored.access_token);
        }

        let refreshed = self.refresh(&stored).await?;
        let access_token = refreshed.access_token.clone();
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = Some(refreshed);
        Ok(access_token)
    }

    async fn refresh(&self, current: &DriveToken) -> DomainResult<DriveToken> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| auth_err("no application credentials configured".to_string()))?;
        let refresh_token = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| auth_err("stored token has no refresh token".to_string()))?;

        let response = self
            .client
            .post(&credentials.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &credentials.client_id),
                ("client_secret", &credentials.client_secret),
            ])
            .send()
            .await
            .map_err(|e| DomainError::Sync(SyncError::Network(format!("token refresh: {}", e))))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(auth_err(format!("token refresh rejected: {} {}", status, body)));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| auth_err(format!("malformed token response: {}", e)))?;

        let refreshed = DriveToken {
            access_token: parsed.access_token,
            refresh_token: parsed
                .refresh_token
                .clone()
                .or_else(|| current.refresh_token.clone()),
            expires_at: parsed.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
            user_email: current.user_email.clone(),
        };

        if refreshed.refresh_token != current.refresh_token {
            self.repo.save(&refreshed).await?;
        }
        Ok(refreshed)
    }
}
