use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    Extension, Json,
};
use std::net::SocketAddr;

use crate::error::{ApiResponse, AppError, Result};
use crate::handlers::client_ip;
use crate::models::{
    ChangePasswordRequest, CreateUserRequest, CurrentUser, LoginRequest, LoginResponse,
    LoginTotpRequest, MfaCheckRequest, MfaCheckResponse, RefreshRequest, RefreshResponse,
    TokenResponse, UserResponse,
};
use crate::services::auth::AuthService;
use crate::services::settings::SettingsService;
use crate::AppState;

/// Whether the instance still needs its first admin account
/// GET /api/auth/setup-status
pub async fn setup_status(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<serde_json::Value>>> {
    let needs_setup = AuthService::needs_setup(&state.db).await?;
    Ok(Json(ApiResponse::success(
        serde_json::json!({ "needs_setup": needs_setup }),
    )))
}

/// One-time creation of the first admin account
/// POST /api/auth/setup
pub async fn setup(
    State(state): State<AppState>,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<ApiResponse<UserResponse>>> {
    let user = AuthService::initial_setup(&state.db, req).await?;
    Ok(Json(ApiResponse::success(user.into())))
}

/// Password login, first step
/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<Json<ApiResponse<LoginResponse>>> {
    let ip = client_ip(&headers, &addr);
    let response = AuthService::login(&state.db, &state.config, req, &ip).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Password + TOTP login, single round trip
/// POST /api/auth/login/totp
pub async fn login_totp(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<LoginTotpRequest>,
) -> Result<Json<ApiResponse<TokenResponse>>> {
    let ip = client_ip(&headers, &addr);
    let response = AuthService::login_totp(&state.db, &state.config, req, &ip).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Exchange a refresh token for a new access token
/// POST /api/auth/refresh
pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<ApiResponse<RefreshResponse>>> {
    let response = AuthService::refresh(&state.db, &state.config, &req.refresh_token).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Current authenticated user profile
/// GET /api/auth/me
pub async fn me(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<UserResponse>>> {
    let user = AuthService::find_by_email(&state.db, &current.email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    Ok(Json(ApiResponse::success(user.into())))
}

/// Change the current user's password
/// POST /api/security/change-password
pub async fn change_password(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<ApiResponse<()>>> {
    let user = AuthService::find_by_email(&state.db, &current.email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    AuthService::change_password(&state.db, &user, &req.current_password, &req.new_password)
        .await?;
    Ok(Json(ApiResponse::<()>::success_message("Password changed")))
}

/// Which second factors the login page should offer. Reports the global
/// factor flags only, so the answer is identical for any email asked about.
/// POST /api/security/mfa/check
pub async fn mfa_check(
    State(state): State<AppState>,
    Json(_req): Json<MfaCheckRequest>,
) -> Result<Json<ApiResponse<MfaCheckResponse>>> {
    let settings = SettingsService::security_settings(&state.db).await?;
    let mfa_required =
        settings.email_otp_enabled || settings.totp_enabled || settings.passkey_enabled;
    Ok(Json(ApiResponse::success(MfaCheckResponse {
        mfa_required,
        email_otp_enabled: settings.email_otp_enabled,
        totp_enabled: settings.totp_enabled,
        passkey_enabled: settings.passkey_enabled,
    })))
}
