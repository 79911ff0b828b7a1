use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    Extension, Json,
};
use std::net::SocketAddr;

use crate::error::{ApiResponse, AppError, Result};
use crate::handlers::client_ip;
use crate::models::{
    CurrentUser, OtpSendRequest, OtpSendResponse, OtpVerifyRequest, OtpVerifyResponse,
    TotpCodeRequest, TotpSetupResponse, TotpVerifyRequest,
};
use crate::services::auth::AuthService;
use crate::services::email_otp::EmailOtpService;
use crate::services::rate_limit::{RateLimitService, TOTP_MAX_ATTEMPTS, WINDOW_SECONDS};
use crate::services::two_factor::TwoFactorService;
use crate::AppState;

/// Send an email OTP challenge
/// POST /api/security/otp/send
pub async fn otp_send(
    State(state): State<AppState>,
    Json(req): Json<OtpSendRequest>,
) -> Result<Json<ApiResponse<OtpSendResponse>>> {
    let response = match EmailOtpService::send(&state.db, &req.email).await? {
        Some((session_token, masked_recipient)) => OtpSendResponse {
            required: true,
            session_token: Some(session_token),
            message: format!("Verification code sent to {}", masked_recipient),
        },
        None => OtpSendResponse {
            required: false,
            session_token: None,
            message: "Email verification is not enabled".to_string(),
        },
    };
    Ok(Json(ApiResponse::success(response)))
}

/// Verify an email OTP challenge
/// POST /api/security/otp/verify
pub async fn otp_verify(
    State(state): State<AppState>,
    Json(req): Json<OtpVerifyRequest>,
) -> Result<Json<ApiResponse<OtpVerifyResponse>>> {
    let response = EmailOtpService::verify(&state.db, &req.session_token, &req.otp_code).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Standalone TOTP verification for the MFA step of the login UI. Guarded by
/// the stricter totp rate limit since codes have only a million states.
/// POST /api/security/totp/verify
pub async fn totp_verify(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(req): Json<TotpVerifyRequest>,
) -> Result<Json<ApiResponse<OtpVerifyResponse>>> {
    let ip = client_ip(&headers, &addr);

    let (allowed, _) =
        RateLimitService::check(&state.db, &ip, "totp", TOTP_MAX_ATTEMPTS, WINDOW_SECONDS).await;
    if !allowed {
        return Err(AppError::RateLimited(WINDOW_SECONDS / 60));
    }

    let user = AuthService::find_by_email(&state.db, &req.email).await?;
    let verified = match &user {
        Some(user) if user.has_totp() => {
            TwoFactorService::verify_for_user(&state.db, &state.config, user, &req.totp_code)
                .await?
        }
        _ => false,
    };

    RateLimitService::record(&state.db, &ip, "totp", verified).await;
    if !verified {
        return Err(AppError::InvalidCredentials);
    }

    Ok(Json(ApiResponse::success(OtpVerifyResponse {
        verified: true,
        email: req.email,
    })))
}

/// Begin TOTP enrollment for the current user
/// GET /api/security/totp/setup
pub async fn totp_setup(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<TotpSetupResponse>>> {
    let user = AuthService::find_by_email(&state.db, &current.email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    let response = TwoFactorService::begin_setup(&state.db, &state.config, &user).await?;
    Ok(Json(ApiResponse::success(response)))
}

/// Confirm enrollment with a code from the authenticator app
/// POST /api/security/totp/enable
pub async fn totp_enable(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Json(req): Json<TotpCodeRequest>,
) -> Result<Json<ApiResponse<()>>> {
    let user = AuthService::find_by_email(&state.db, &current.email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    TwoFactorService::confirm_setup(&state.db, &state.config, &user, &req.totp_code).await?;
    Ok(Json(ApiResponse::<()>::success_message("TOTP enabled")))
}

/// Turn TOTP off for the current user
/// DELETE /api/security/totp
pub async fn totp_disable(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<()>>> {
    let user = AuthService::find_by_email(&state.db, &current.email)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    TwoFactorService::disable(&state.db, &user).await?;
    Ok(Json(ApiResponse::<()>::success_message("TOTP disabled")))
}
