//! Client credentials — expiry tracking and the refresh contract.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("credential refresh failed: {0}")]
    RefreshFailed(String),
}

/// The access/refresh pair held by one client session.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry, milliseconds since Unix epoch.
    pub expires_at: i64,
}

impl Credentials {
    /// Whether the access token is inside the refresh buffer (or past
    /// expiry) at `now_ms`.
    #[must_use]
    pub fn needs_refresh(&self, now_ms: i64, buffer: Duration) -> bool {
        let buffer_ms = i64::try_from(buffer.as_millis()).unwrap_or(i64::MAX);
        self.expires_at - now_ms <= buffer_ms
    }
}

/// Exchanges a refresh token for a new credential pair.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, AuthError>;
}

// =============================================================================
// HTTP IMPLEMENTATION
// =============================================================================

pub struct HttpTokenRefresher {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTokenRefresher {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), base_url: base_url.into() }
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: String,
    expires_at: i64,
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<Credentials, AuthError> {
        let url = format!("{}/api/auth/refresh", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuthError::RefreshFailed(format!("HTTP {}", status.as_u16())));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| AuthError::RefreshFailed(e.to_string()))?;

        Ok(Credentials {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at: body.expires_at,
        })
    }
}
