use axum::{
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    Extension, Json,
};
use std::net::SocketAddr;

use crate::error::{ApiResponse, AppError, Result};
use crate::handlers::client_ip;
use crate::models::{
    CurrentUser, PasskeyAuthFinishRequest, PasskeyAuthOptionsResponse, PasskeyRegisterFinishRequest,
    PasskeySummary, RenamePasskeyRequest, TokenResponse,
};
use crate::services::audit::{actions, AuditEvent, AuditService};
use crate::services::auth::AuthService;
use crate::services::passkey::PasskeyService;
use crate::services::rate_limit::{RateLimitService, PASSKEY_MAX_ATTEMPTS, WINDOW_SECONDS};
use crate::AppState;

/// Start a passkey login ceremony
/// POST /api/security/passkey/authenticate-options
pub async fn authenticate_options(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<PasskeyAuthOptionsResponse>>> {
    let ip = client_ip(&headers, &addr);
    let (allowed, _) =
        RateLimitService::check(&state.db, &ip, "passkey", PASSKEY_MAX_ATTEMPTS, WINDOW_SECONDS)
            .await;
    if !allowed {
        return Err(AppError::RateLimited(WINDOW_SECONDS / 60));
    }

    let (options, session_id) = PasskeyService::begin_authenticate(&state.db, &state.config).await?;
    Ok(Json(ApiResponse::success(PasskeyAuthOptionsResponse {
        options,
        session_id,
    })))
}

/// Finish a passkey login ceremony and issue tokens
/// POST /api/security/passkey/authenticate
pub async fn authenticate(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<PasskeyAuthFinishRequest>,
) -> Result<Json<ApiResponse<TokenResponse>>> {
    let ip = client_ip(&headers, &addr);
    let (allowed, _) =
        RateLimitService::check(&state.db, &ip, "passkey", PASSKEY_MAX_ATTEMPTS, WINDOW_SECONDS)
            .await;
    if !allowed {
        return Err(AppError::RateLimited(WINDOW_SECONDS / 60));
    }

    let user =
        match PasskeyService::finish_authenticate(&state.db, &state.config, &req.session_id, req.credential)
            .await
        {
            Ok(user) => user,
            Err(e) => {
                RateLimitService::record(&state.db, &ip, "passkey", false).await;
                AuditService::log(
                    &state.db,
                    actions::LOGIN_FAILED,
                    AuditEvent::failed()
                        .ip(&ip)
                        .details(serde_json::json!({"reason": "passkey_assertion_failed"})),
                )
                .await;
                return Err(e);
            }
        };

    RateLimitService::record(&state.db, &ip, "passkey", true).await;
    let tokens = AuthService::issue_tokens(&state.db, &state.config, &user, &ip).await?;
    AuditService::log(
        &state.db,
        actions::LOGIN_SUCCESS,
        AuditEvent::ok()
            .user(&user.id, &user.email)
            .ip(&ip)
            .details(serde_json::json!({"method": "passkey"})),
    )
    .await;
    Ok(Json(ApiResponse::success(tokens)))
}

/// Start registering a new passkey for the current user
/// GET /api/security/passkey/register-options
pub async fn register_options(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<webauthn_rs::prelude::CreationChallengeResponse>>> {
    let user = AuthService::find_by_email(&state.db, &current.email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    let options = PasskeyService::begin_register(&state.db, &state.config, &user).await?;
    Ok(Json(ApiResponse::success(options)))
}

/// Finish registering a new passkey
/// POST /api/security/passkey/register
pub async fn register(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<PasskeyRegisterFinishRequest>,
) -> Result<Json<ApiResponse<PasskeySummary>>> {
    let user = AuthService::find_by_email(&state.db, &current.email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    let credential =
        PasskeyService::finish_register(&state.db, &state.config, &user, req.credential, req.name)
            .await?;
    Ok(Json(ApiResponse::success(credential.into())))
}

/// List the current user's passkeys
/// GET /api/security/passkey/list
pub async fn list(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<Vec<PasskeySummary>>>> {
    let credentials = PasskeyService::list(&state.db, &current.id).await?;
    let summaries = credentials.into_iter().map(PasskeySummary::from).collect();
    Ok(Json(ApiResponse::success(summaries)))
}

/// Rename a passkey
/// PUT /api/security/passkey/{id}
pub async fn rename(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<String>,
    Json(req): Json<RenamePasskeyRequest>,
) -> Result<Json<ApiResponse<()>>> {
    PasskeyService::rename(&state.db, &current.id, &id, &req.name).await?;
    Ok(Json(ApiResponse::<()>::success_message("Passkey renamed")))
}

/// Delete a passkey
/// DELETE /api/security/passkey/{id}
pub async fn delete(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<()>>> {
    let user = AuthService::find_by_email(&state.db, &current.email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    PasskeyService::delete(&state.db, &user, &id).await?;
    Ok(Json(ApiResponse::<()>::success_message("Passkey deleted")))
}
