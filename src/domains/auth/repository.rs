use crate::domains::auth::types::DriveToken;
use crate::domains::sync::types::parse_optional_datetime;
use crate::errors::{DbError, DomainError, DomainResult};
use chrono::Utc;
use sqlx::SqlitePool;

/// Persistence for the drive OAuth token singleton in the LOCAL store.
#[derive(Clone)]
pub struct SqliteDriveTokenRepository {
    pool: SqlitePool,
}

fn db_err(e: sqlx::Error) -> DomainError {
    DomainError::Database(DbError::from(e))
}

impl SqliteDriveTokenRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self) -> DomainResult<Option<DriveToken>> {
        let row: Option<(String, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT access_token, refresh_token, expires_at, user_email
                 FROM drive_auth_tokens WHERE id = 1",
            )
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|(access_token, refresh_token, expires_at, user_email)| {
            Ok(DriveToken {
                access_token,
                refresh_token,
                expires_at: parse_optional_datetime(expires_at, "drive_auth_tokens.expires_at")?,
                user_email,
            })
        })
        .transpose()
    }

    pub async fn save(&self, token: &DriveToken) -> DomainResult<()> {
        sqlx::query(
            r#"
            INSERT INTO drive_auth_tokens
                (id, access_token, refresh_token, expires_at, user_email, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                user_email = excluded.user_email,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(token.expires_at.map(|t| t.to_rfc3339()))
        .bind(&token.user_email)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Drop the stored token; the device must be re-authorized.
    pub async fn delete(&self) -> DomainResult<()> {
        sqlx::query("DELETE FROM drive_auth_tokens WHERE id = 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_util::open_test_stores;

    #[tokio::test]
    async fn token_singleton_round_trips() {
        let stores = open_test_stores().await;
        let repo = SqliteDriveTokenRepository::new(stores.local.clone());

        assert!(repo.get().await.unwrap().is_none());

        let token = DriveToken {
            access_token: "at-1".into(),
            refresh_token: Some("rt-1".into()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
            user_email: Some("user@example.test".into()),
        };
        repo.save(&token).await.unwrap();

        let stored = repo.get().await.unwrap().unwrap();
        assert_eq!(stored.access_token, "at-1");
        assert_eq!(stored.refresh_token.as_deref(), Some("rt-1"));

        let replacement = DriveToken {
            access_token: "at-2".into(),
            ..token
        };
        repo.save(&replacement).await.unwrap();
        assert_eq!(repo.get().await.unwrap().unwrap().access_token, "at-2");

        repo.delete().await.unwrap();
        assert!(repo.get().await.unwrap().is_none());
    }
}
