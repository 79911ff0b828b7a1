use axum::{
    extract::{Query, State},
    Extension, Json,
};
use serde::Deserialize;

use crate::error::{ApiResponse, AppError, Result};
use crate::models::{AuditLogEntry, CleanupResponse, CurrentUser, SecuritySettings, SmtpConfig};
use crate::services::audit::{actions, AuditEvent, AuditService};
use crate::services::email_otp::EmailOtpService;
use crate::services::passkey::PasskeyService;
use crate::services::rate_limit::RateLimitService;
use crate::services::settings::SettingsService;
use crate::AppState;

const PASSWORD_MASK: &str = "********";

/// Current security settings
/// GET /api/security/settings
pub async fn get_settings(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<SecuritySettings>>> {
    let settings = SettingsService::security_settings(&state.db).await?;
    Ok(Json(ApiResponse::success(settings)))
}

/// Replace the security settings
/// PUT /api/security/settings
pub async fn update_settings(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Json(settings): Json<SecuritySettings>,
) -> Result<Json<ApiResponse<SecuritySettings>>> {
    SettingsService::save_security_settings(&state.db, &settings).await?;
    AuditService::log(
        &state.db,
        actions::SECURITY_SETTINGS_UPDATED,
        AuditEvent::ok()
            .user(&current.id, &current.email)
            .details(serde_json::json!({
                "email_otp_enabled": settings.email_otp_enabled,
                "totp_enabled": settings.totp_enabled,
                "passkey_enabled": settings.passkey_enabled,
            })),
    )
    .await;
    let stored = SettingsService::security_settings(&state.db).await?;
    Ok(Json(ApiResponse::success(stored)))
}

/// SMTP relay settings, password redacted
/// GET /api/security/smtp-config
pub async fn get_smtp_config(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Option<SmtpConfig>>>> {
    let config = SettingsService::smtp_config(&state.db).await?.map(|mut c| {
        if !c.smtp_password.is_empty() {
            c.smtp_password = PASSWORD_MASK.to_string();
        }
        c
    });
    Ok(Json(ApiResponse::success(config)))
}

/// Replace the SMTP relay settings. A masked password in the payload means
/// "keep the stored one".
/// POST /api/security/smtp-config
pub async fn update_smtp_config(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
    Json(mut config): Json<SmtpConfig>,
) -> Result<Json<ApiResponse<()>>> {
    if config.smtp_password == PASSWORD_MASK {
        if let Some(existing) = SettingsService::smtp_config(&state.db).await? {
            config.smtp_password = existing.smtp_password;
        }
    }
    SettingsService::save_smtp_config(&state.db, &config).await?;
    AuditService::log(
        &state.db,
        actions::SMTP_CONFIG_UPDATED,
        AuditEvent::ok()
            .user(&current.id, &current.email)
            .details(serde_json::json!({"smtp_host": config.smtp_host})),
    )
    .await;
    Ok(Json(ApiResponse::<()>::success_message("SMTP configuration saved")))
}

/// Send a test message over the stored relay to the caller's own address
/// POST /api/security/smtp-test
pub async fn smtp_test(
    State(state): State<AppState>,
    Extension(current): Extension<CurrentUser>,
) -> Result<Json<ApiResponse<()>>> {
    let smtp = SettingsService::smtp_config(&state.db).await?.ok_or_else(|| {
        AppError::ServiceUnavailable("Email delivery is not configured".to_string())
    })?;
    EmailOtpService::send_test_message(&smtp, &current.email).await?;
    Ok(Json(ApiResponse::<()>::success_message(
        "Test message sent; check your inbox",
    )))
}

/// Sweep expired ceremony state, OTP challenges and stale rate-limit rows
/// POST /api/security/cleanup/challenges
pub async fn cleanup_challenges(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CleanupResponse>>> {
    let challenges_deleted = PasskeyService::cleanup_expired_challenges(&state.db).await;
    let otp_codes_deleted = EmailOtpService::cleanup_expired(&state.db).await;
    let rate_limits_deleted = RateLimitService::cleanup(&state.db).await;

    Ok(Json(ApiResponse::success(CleanupResponse {
        message: "Cleanup completed".to_string(),
        challenges_deleted,
        otp_codes_deleted,
        rate_limits_deleted,
    })))
}

#[derive(Debug, Deserialize)]
pub struct AuditLogQuery {
    /// Dot-separated action prefix, e.g. "auth." or "auth.login".
    pub action: Option<String>,
    #[serde(default = "default_audit_limit")]
    pub limit: i64,
}

fn default_audit_limit() -> i64 {
    100
}

/// Read the audit trail, newest first
/// GET /api/security/audit-logs
pub async fn audit_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditLogQuery>,
) -> Result<Json<ApiResponse<Vec<AuditLogEntry>>>> {
    let entries = AuditService::query(&state.db, query.action.as_deref(), query.limit).await?;
    Ok(Json(ApiResponse::success(entries)))
}
