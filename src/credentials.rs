//! Credential store and refresh collaborator for the catalog API.
//!
//! Tokens live on the user row; the fetcher only sees the `Credentials`
//! seam so tests can script expiry without a token endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::{info, instrument};

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone)]
pub struct Credential {
    pub access_token: String,
}

#[async_trait]
pub trait Credentials: Send + Sync {
    /// The user's currently cached access credential.
    async fn current(&self, user_id: i64) -> SyncResult<Credential>;

    /// Exchange the stored refresh token for a new access credential and
    /// persist it. Called at most once per logical fetch.
    async fn refresh(&self, user_id: i64) -> SyncResult<Credential>;
}

/// Production store: tokens on the user row, refresh grant POSTed to the
/// configured token endpoint.
#[derive(Clone)]
pub struct StoredCredentials {
    pool: SqlitePool,
    http: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
}

impl StoredCredentials {
    pub fn new(
        pool: SqlitePool,
        token_url: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        let http = Client::builder()
            .user_agent("tunesync/0.1")
            .build()
            .expect("reqwest client");
        Self {
            pool,
            http,
            token_url,
            client_id,
            client_secret,
        }
    }
}

#[async_trait]
impl Credentials for StoredCredentials {
    #[instrument(skip_all, fields(user_id))]
    async fn current(&self, user_id: i64) -> SyncResult<Credential> {
        let token: Option<String> =
            sqlx::query_scalar("SELECT access_token FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();
        match token {
            Some(access_token) => Ok(Credential { access_token }),
            None => Err(SyncError::Validation(format!(
                "user {user_id} has no access token"
            ))),
        }
    }

    #[instrument(skip_all, fields(user_id))]
    async fn refresh(&self, user_id: i64) -> SyncResult<Credential> {
        let refresh_token: Option<String> =
            sqlx::query_scalar("SELECT refresh_token FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .flatten();
        let Some(refresh_token) = refresh_token else {
            return Err(SyncError::Validation(format!(
                "user {user_id} has no refresh token"
            )));
        };

        let res = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SyncError::RemoteApi {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = res.json().await?;
        sqlx::query(
            "UPDATE users SET access_token = ?, refresh_token = COALESCE(?, refresh_token) WHERE id = ?",
        )
        .bind(&token.access_token)
        .bind(&token.refresh_token)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        info!(user_id, "refreshed access token");

        Ok(Credential {
            access_token: token.access_token,
        })
    }
}
