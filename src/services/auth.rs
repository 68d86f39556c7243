//! Token service — bearer credential issuance, validation, and rotation.
//!
//! ARCHITECTURE
//! ============
//! Clients hold an access/refresh token pair. The access token rides the
//! websocket upgrade as a query parameter and is validated against its
//! SQL-side expiry; the refresh token is exchanged exactly once for a new
//! pair through `/api/auth/refresh`.
//!
//! TRADE-OFFS
//! ==========
//! Refresh consumption is destructive (`DELETE ... RETURNING`) so a stolen
//! refresh token races its owner instead of minting pairs forever; the
//! losing side surfaces as a fatal, user-visible session failure.

use std::fmt::Write;

use rand::Rng;
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a cryptographically random 32-byte hex token.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}

/// An access/refresh pair handed to a client.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token expiry, milliseconds since Unix epoch.
    pub expires_at: i64,
}

/// Issue a fresh credential pair for the given user.
pub async fn issue_credentials(pool: &PgPool, user_id: Uuid) -> Result<CredentialPair, sqlx::Error> {
    let access_token = generate_token();
    let refresh_token = generate_token();

    let row = sqlx::query(
        "INSERT INTO auth_tokens (access_token, refresh_token, user_id, access_expires_at, refresh_expires_at)
         VALUES ($1, $2, $3, now() + interval '15 minutes', now() + interval '30 days')
         RETURNING (extract(epoch FROM access_expires_at) * 1000)::bigint AS expires_at",
    )
    .bind(&access_token)
    .bind(&refresh_token)
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    Ok(CredentialPair { access_token, refresh_token, expires_at: row.get("expires_at") })
}

/// Validate an access token and return the owning user, if still valid.
pub async fn verify_access_token(pool: &PgPool, token: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT user_id FROM auth_tokens WHERE access_token = $1 AND access_expires_at > now()",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.get("user_id")))
}

/// Rotate a credential pair: consume the refresh token atomically and issue
/// a new pair. Returns `None` when the refresh token is unknown or expired.
pub async fn rotate_credentials(pool: &PgPool, refresh_token: &str) -> Result<Option<CredentialPair>, sqlx::Error> {
    let row = sqlx::query(
        "DELETE FROM auth_tokens WHERE refresh_token = $1 AND refresh_expires_at > now() RETURNING user_id",
    )
    .bind(refresh_token)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let pair = issue_credentials(pool, row.get("user_id")).await?;
    Ok(Some(pair))
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
