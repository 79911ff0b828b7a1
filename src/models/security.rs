use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Security settings singleton (feature flags for the second factors)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SecuritySettings {
    #[serde(skip)]
    #[sqlx(default)]
    pub id: i64,
    pub email_otp_enabled: bool,
    pub totp_enabled: bool,
    pub passkey_enabled: bool,
    pub admin_email: String,
    #[serde(skip_deserializing)]
    pub updated_at: Option<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            id: 1,
            email_otp_enabled: false,
            totp_enabled: false,
            passkey_enabled: false,
            admin_email: String::new(),
            updated_at: None,
        }
    }
}

/// Outbound email relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SmtpConfig {
    #[serde(skip)]
    #[sqlx(default)]
    pub id: i64,
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: i64,
    pub smtp_email: String,
    pub smtp_password: String,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    #[serde(skip_deserializing)]
    pub updated_at: Option<String>,
}

fn default_smtp_port() -> i64 {
    587
}

fn default_use_tls() -> bool {
    true
}

/// One email OTP challenge, session-bound and single-use
#[derive(Debug, Clone, FromRow)]
pub struct OtpChallenge {
    pub session_token: String,
    pub email: String,
    pub otp_hash: Option<String>,
    /// Legacy plaintext column from before the hash migration.
    pub otp_code: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    pub used: bool,
}

/// Pending TOTP enrollment, one outstanding row per user
#[derive(Debug, Clone, FromRow)]
pub struct TotpPendingSetup {
    pub user_id: String,
    pub secret_encrypted: String,
    /// Plaintext copy kept only until enrollment is confirmed or abandoned.
    pub secret_plain: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpSendRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct OtpSendResponse {
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct OtpVerifyRequest {
    pub otp_code: String,
    pub session_token: String,
}

#[derive(Debug, Serialize)]
pub struct OtpVerifyResponse {
    pub verified: bool,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct TotpSetupResponse {
    pub secret: String,
    pub uri: String,
    pub qr_code: String,
}

#[derive(Debug, Deserialize)]
pub struct TotpCodeRequest {
    pub totp_code: String,
}

#[derive(Debug, Deserialize)]
pub struct TotpVerifyRequest {
    pub email: String,
    pub totp_code: String,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub message: String,
    pub challenges_deleted: u64,
    pub otp_codes_deleted: u64,
    pub rate_limits_deleted: u64,
}

#[derive(Debug, Deserialize)]
pub struct MfaCheckRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct MfaCheckResponse {
    pub mfa_required: bool,
    pub email_otp_enabled: bool,
    pub totp_enabled: bool,
    pub passkey_enabled: bool,
}
