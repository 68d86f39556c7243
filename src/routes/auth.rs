//! Auth routes — credential refresh and dev login.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RefreshRequest {
    refresh_token: String,
}

/// `POST /api/auth/refresh` — exchange a refresh token for a new pair.
///
/// The old pair is consumed atomically; replaying a refresh token yields 401.
pub async fn refresh(State(state): State<AppState>, Json(body): Json<RefreshRequest>) -> Response {
    match services::auth::rotate_credentials(&state.pool, &body.refresh_token).await {
        Ok(Some(pair)) => {
            info!("auth: credentials rotated");
            Json(pair).into_response()
        }
        Ok(None) => {
            warn!("auth: refresh token rejected");
            (StatusCode::UNAUTHORIZED, "invalid or expired refresh token").into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "auth: rotation failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "credential rotation error").into_response()
        }
    }
}

#[derive(Deserialize, Default)]
pub struct DevLoginRequest {
    #[serde(default)]
    user_id: Option<Uuid>,
}

/// `POST /api/auth/dev-login` — issue an initial pair without an identity
/// provider. Only enabled when `DEV_LOGIN=1`; production deployments obtain
/// pairs from the account service.
pub async fn dev_login(State(state): State<AppState>, Json(body): Json<DevLoginRequest>) -> Response {
    if std::env::var("DEV_LOGIN").as_deref() != Ok("1") {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    let user_id = body.user_id.unwrap_or_else(Uuid::new_v4);

    match services::auth::issue_credentials(&state.pool, user_id).await {
        Ok(pair) => {
            info!(%user_id, "auth: dev credentials issued");
            Json(serde_json::json!({
                "user_id": user_id,
                "access_token": pair.access_token,
                "refresh_token": pair.refresh_token,
                "expires_at": pair.expires_at,
            }))
            .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "auth: dev credential issue failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "credential issue error").into_response()
        }
    }
}
