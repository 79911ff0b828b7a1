use chrono::{DateTime, Duration, Utc};
use lettre::message::{header::ContentType, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{OtpChallenge, OtpVerifyResponse, SmtpConfig};
use crate::services::crypto::{generate_numeric_otp, generate_session_token, hash_otp_code, verify_otp_hash};
use crate::services::settings::SettingsService;

/// Email one-time-code factor.
///
/// Codes are stored salted-hashed against an opaque session token and expire
/// after five minutes. A successful verification burns the challenge; a wrong
/// code may be retried until the rate limiter or the expiry stops it.
pub struct EmailOtpService;

const OTP_TTL_MINUTES: i64 = 5;

impl EmailOtpService {
    /// Create a challenge row and return (session token, plaintext code).
    /// The plaintext code exists only long enough to send the email.
    pub async fn create_challenge(db: &Database, email: &str) -> Result<(String, String)> {
        let session_token = generate_session_token();
        let code = generate_numeric_otp();
        let otp_hash = hash_otp_code(&code, &session_token);
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO otp_codes (session_token, email, otp_hash, otp_code, created_at, expires_at, used)
            VALUES (?, ?, ?, NULL, ?, ?, 0)
            "#,
        )
        .bind(&session_token)
        .bind(email)
        .bind(&otp_hash)
        .bind(now.to_rfc3339())
        .bind((now + Duration::minutes(OTP_TTL_MINUTES)).to_rfc3339())
        .execute(db.pool())
        .await?;

        Ok((session_token, code))
    }

    /// Full send flow: check the factor is enabled and the account exists,
    /// mint a challenge, and dispatch the code over the configured relay.
    /// Returns (session token, masked recipient). Codes go to the configured
    /// admin address when one is set, otherwise to the account's own address.
    pub async fn send(db: &Database, email: &str) -> Result<Option<(String, String)>> {
        let settings = SettingsService::security_settings(db).await?;
        if !settings.email_otp_enabled {
            return Ok(None);
        }

        let exists: Option<(String,)> =
            sqlx::query_as("SELECT id FROM users WHERE email = ? AND is_admin = 1")
                .bind(email)
                .fetch_optional(db.pool())
                .await?;
        if exists.is_none() {
            return Err(AppError::NotFound("Admin user not found".to_string()));
        }

        let smtp = SettingsService::smtp_config(db).await?.ok_or_else(|| {
            AppError::ServiceUnavailable("Email delivery is not configured".to_string())
        })?;

        let recipient = if settings.admin_email.trim().is_empty() {
            email
        } else {
            settings.admin_email.trim()
        };

        let (session_token, code) = Self::create_challenge(db, email).await?;

        Self::dispatch_code(&smtp, recipient, &code).await?;
        let masked = mask_email(recipient);
        tracing::info!("OTP code sent to {}", masked);

        Ok(Some((session_token, masked)))
    }

    /// Verify a code against its challenge. Consumes the challenge on
    /// success; expired and already-used challenges are indistinguishable to
    /// the caller.
    pub async fn verify(db: &Database, session_token: &str, code: &str) -> Result<OtpVerifyResponse> {
        let challenge: Option<OtpChallenge> =
            sqlx::query_as("SELECT * FROM otp_codes WHERE session_token = ? AND used = 0")
                .bind(session_token)
                .fetch_optional(db.pool())
                .await?;
        let challenge = challenge.ok_or(AppError::InvalidChallenge)?;

        let expires_at = DateTime::parse_from_rfc3339(&challenge.expires_at)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| AppError::InvalidChallenge)?;
        if Utc::now() > expires_at {
            return Err(AppError::InvalidChallenge);
        }

        let matches = match (&challenge.otp_hash, &challenge.otp_code) {
            (Some(hash), _) => verify_otp_hash(code, session_token, hash),
            // Legacy rows from before the hash migration stored the code as-is.
            (None, Some(plain)) => plain == code,
            (None, None) => false,
        };
        if !matches {
            return Err(AppError::InvalidChallenge);
        }

        sqlx::query("UPDATE otp_codes SET used = 1 WHERE session_token = ?")
            .bind(session_token)
            .execute(db.pool())
            .await?;

        Ok(OtpVerifyResponse {
            verified: true,
            email: challenge.email,
        })
    }

    /// Sweep expired and consumed challenges.
    pub async fn cleanup_expired(db: &Database) -> u64 {
        let now = Utc::now().to_rfc3339();
        match sqlx::query("DELETE FROM otp_codes WHERE expires_at < ? OR used = 1")
            .bind(&now)
            .execute(db.pool())
            .await
        {
            Ok(r) => r.rows_affected(),
            Err(e) => {
                tracing::warn!("OTP cleanup error: {:?}", e);
                0
            }
        }
    }

    async fn dispatch_code(smtp: &SmtpConfig, recipient: &str, code: &str) -> Result<()> {
        let message = Self::build_message(smtp, recipient, code)?;
        let mailer = Self::build_transport(smtp)?;

        mailer.send(message).await.map_err(|e| {
            tracing::error!("SMTP send failed: {:?}", e);
            AppError::ServiceUnavailable("Failed to send verification email".to_string())
        })?;
        Ok(())
    }

    /// Send a throwaway message to validate relay settings before saving them.
    pub async fn send_test_message(smtp: &SmtpConfig, recipient: &str) -> Result<()> {
        let from: Mailbox = smtp
            .smtp_email
            .parse()
            .map_err(|_| AppError::BadRequest("Invalid sender address".to_string()))?;
        let to: Mailbox = recipient
            .parse()
            .map_err(|_| AppError::BadRequest("Invalid recipient address".to_string()))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject("SMTP configuration test")
            .singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_PLAIN)
                    .body(String::from(
                        "This is a test message confirming your SMTP settings work.",
                    )),
            )
            .map_err(|e| AppError::Internal(format!("Message build failed: {}", e)))?;

        let mailer = Self::build_transport(smtp)?;
        mailer.send(message).await.map_err(|e| {
            AppError::ServiceUnavailable(format!("SMTP test failed: {}", e))
        })?;
        Ok(())
    }

    fn build_message(smtp: &SmtpConfig, recipient: &str, code: &str) -> Result<Message> {
        let from: Mailbox = smtp
            .smtp_email
            .parse()
            .map_err(|_| AppError::Internal("Invalid configured sender address".to_string()))?;
        let to: Mailbox = recipient
            .parse()
            .map_err(|_| AppError::BadRequest("Invalid recipient address".to_string()))?;

        let plain = format!(
            "Your verification code is: {}\n\nIt expires in {} minutes. \
             If you did not request this code, ignore this message.",
            code, OTP_TTL_MINUTES
        );
        let html = format!(
            "<p>Your verification code is:</p>\
             <p style=\"font-size:24px;font-weight:bold;letter-spacing:4px\">{}</p>\
             <p>It expires in {} minutes. If you did not request this code, ignore this message.</p>",
            code, OTP_TTL_MINUTES
        );

        Message::builder()
            .from(from)
            .to(to)
            .subject("Your login verification code")
            .multipart(MultiPart::alternative_plain_html(plain, html))
            .map_err(|e| AppError::Internal(format!("Message build failed: {}", e)))
    }

    fn build_transport(smtp: &SmtpConfig) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let builder = if smtp.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.smtp_host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.smtp_host)
        }
        .map_err(|e| AppError::ServiceUnavailable(format!("SMTP relay setup failed: {}", e)))?;

        Ok(builder
            .port(smtp.smtp_port as u16)
            .credentials(Credentials::new(
                smtp.smtp_email.clone(),
                smtp.smtp_password.clone(),
            ))
            .timeout(Some(std::time::Duration::from_secs(30)))
            .build())
    }
}

/// Redact the local part for logs: "ab***@example.com".
fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let kept: String = local.chars().take(2).collect();
            format!("{}***@{}", kept, domain)
        }
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;

    #[tokio::test]
    async fn test_challenge_verify_round_trip() {
        let (db, _guard) = test_db().await;

        let (token, code) = EmailOtpService::create_challenge(&db, "a@x.com").await.unwrap();

        // Stored as a hash, never as the code itself.
        let stored_hash: Option<String> =
            sqlx::query_scalar("SELECT otp_hash FROM otp_codes WHERE session_token = ?")
                .bind(&token)
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_ne!(stored_hash.as_deref(), Some(code.as_str()));

        let result = EmailOtpService::verify(&db, &token, &code).await.unwrap();
        assert!(result.verified);
        assert_eq!(result.email, "a@x.com");

        // Single use.
        let replay = EmailOtpService::verify(&db, &token, &code).await;
        assert!(matches!(replay, Err(AppError::InvalidChallenge)));
    }

    #[tokio::test]
    async fn test_wrong_code_and_wrong_session() {
        let (db, _guard) = test_db().await;

        let (token, code) = EmailOtpService::create_challenge(&db, "a@x.com").await.unwrap();

        let wrong = EmailOtpService::verify(&db, &token, "000000").await;
        assert!(matches!(wrong, Err(AppError::InvalidChallenge)));

        // A wrong code does not burn the challenge.
        let ok = EmailOtpService::verify(&db, &token, &code).await.unwrap();
        assert!(ok.verified);

        let missing = EmailOtpService::verify(&db, "no-such-session", &code).await;
        assert!(matches!(missing, Err(AppError::InvalidChallenge)));
    }

    #[tokio::test]
    async fn test_expired_challenge_rejected() {
        let (db, _guard) = test_db().await;

        let (token, code) = EmailOtpService::create_challenge(&db, "a@x.com").await.unwrap();
        let past = (Utc::now() - Duration::minutes(1)).to_rfc3339();
        sqlx::query("UPDATE otp_codes SET expires_at = ? WHERE session_token = ?")
            .bind(&past)
            .bind(&token)
            .execute(db.pool())
            .await
            .unwrap();

        let result = EmailOtpService::verify(&db, &token, &code).await;
        assert!(matches!(result, Err(AppError::InvalidChallenge)));
    }

    #[tokio::test]
    async fn test_legacy_plaintext_row_verifies() {
        let (db, _guard) = test_db().await;

        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO otp_codes (session_token, email, otp_hash, otp_code, created_at, expires_at, used)
            VALUES ('legacy-session', 'a@x.com', NULL, '424242', ?, ?, 0)
            "#,
        )
        .bind(now.to_rfc3339())
        .bind((now + Duration::minutes(5)).to_rfc3339())
        .execute(db.pool())
        .await
        .unwrap();

        let result = EmailOtpService::verify(&db, "legacy-session", "424242").await.unwrap();
        assert!(result.verified);
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_expired_and_used() {
        let (db, _guard) = test_db().await;

        let (token, code) = EmailOtpService::create_challenge(&db, "a@x.com").await.unwrap();
        EmailOtpService::verify(&db, &token, &code).await.unwrap();

        let (expired_token, _) = EmailOtpService::create_challenge(&db, "b@x.com").await.unwrap();
        let past = (Utc::now() - Duration::minutes(1)).to_rfc3339();
        sqlx::query("UPDATE otp_codes SET expires_at = ? WHERE session_token = ?")
            .bind(&past)
            .bind(&expired_token)
            .execute(db.pool())
            .await
            .unwrap();

        let (_live_token, _) = EmailOtpService::create_challenge(&db, "c@x.com").await.unwrap();

        let deleted = EmailOtpService::cleanup_expired(&db).await;
        assert_eq!(deleted, 2);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM otp_codes")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn test_mask_email() {
        assert_eq!(mask_email("alice@example.com"), "al***@example.com");
        assert_eq!(mask_email("a@example.com"), "a***@example.com");
        assert_eq!(mask_email("not-an-email"), "***");
    }
}
