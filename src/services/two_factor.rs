use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{TotpPendingSetup, TotpSetupResponse, User};
use crate::services::audit::{actions, AuditEvent, AuditService};
use crate::services::crypto::{SecretCodec, SecretValue};
use crate::services::settings::SettingsService;

/// TOTP factor. State machine per user: disabled -> pending-setup -> enabled.
pub struct TwoFactorService;

impl TwoFactorService {
    /// RFC 6238 verifier: SHA-1, 6 digits, 30s step, one step of skew. The
    /// skew window means a code stays valid for up to 90s; accepted risk.
    fn totp_from_base32(config: &Config, secret_base32: &str, account: &str) -> Result<TOTP> {
        let secret = Secret::Encoded(secret_base32.to_string())
            .to_bytes()
            .map_err(|_| AppError::Internal("Invalid TOTP secret encoding".to_string()))?;
        let issuer = config.webauthn.rp_name.trim();
        let issuer = if issuer.is_empty() { "Portfolio Admin" } else { issuer };
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret,
            Some(issuer.to_string()),
            account.to_string(),
        )
        .map_err(|e| AppError::Internal(format!("TOTP init failed: {:?}", e)))
    }

    fn check_code(config: &Config, secret_base32: &str, account: &str, code: &str) -> Result<bool> {
        let totp = Self::totp_from_base32(config, secret_base32, account)?;
        totp.check_current(code)
            .map_err(|_| AppError::Internal("System clock error".to_string()))
    }

    /// Start enrollment: fresh 160-bit secret, stored encrypted plus a
    /// plaintext transient copy the confirm step verifies against. Overwrites
    /// any prior pending setup for the user.
    pub async fn begin_setup(db: &Database, config: &Config, user: &User) -> Result<TotpSetupResponse> {
        let mut raw = [0u8; 20];
        OsRng.fill_bytes(&mut raw);
        let secret_base32 = Secret::Raw(raw.to_vec()).to_encoded().to_string();

        let totp = Self::totp_from_base32(config, &secret_base32, &user.email)?;
        let uri = totp.get_url();
        let qr_base64 = totp
            .get_qr_base64()
            .map_err(|e| AppError::Internal(format!("QR generation failed: {}", e)))?;

        let secret_encrypted = SecretCodec::encrypt(config, &secret_base32)?;
        sqlx::query(
            r#"
            INSERT INTO totp_setup (user_id, secret_encrypted, secret_plain, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                secret_encrypted = excluded.secret_encrypted,
                secret_plain = excluded.secret_plain,
                created_at = excluded.created_at
            "#,
        )
        .bind(&user.id)
        .bind(&secret_encrypted)
        .bind(&secret_base32)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await?;

        Ok(TotpSetupResponse {
            secret: secret_base32,
            uri,
            qr_code: format!("data:image/png;base64,{}", qr_base64),
        })
    }

    /// Confirm enrollment against the pending secret. On success the encrypted
    /// copy is promoted onto the user record and the pending row is deleted;
    /// on failure the pending row stays so the caller may retry.
    pub async fn confirm_setup(db: &Database, config: &Config, user: &User, code: &str) -> Result<()> {
        let pending: Option<TotpPendingSetup> =
            sqlx::query_as("SELECT * FROM totp_setup WHERE user_id = ?")
                .bind(&user.id)
                .fetch_optional(db.pool())
                .await?;
        let pending =
            pending.ok_or_else(|| AppError::BadRequest("No TOTP setup in progress".to_string()))?;

        if !Self::check_code(config, &pending.secret_plain, &user.email, code)? {
            return Err(AppError::BadRequest("Invalid TOTP code".to_string()));
        }

        sqlx::query("UPDATE users SET totp_secret = ?, totp_enabled = 1 WHERE id = ?")
            .bind(&pending.secret_encrypted)
            .bind(&user.id)
            .execute(db.pool())
            .await?;

        SettingsService::set_flag(db, "totp_enabled", true).await?;

        sqlx::query("DELETE FROM totp_setup WHERE user_id = ?")
            .bind(&user.id)
            .execute(db.pool())
            .await?;

        AuditService::log(
            db,
            actions::TOTP_ENABLED,
            AuditEvent::ok().user(&user.id, &user.email),
        )
        .await;

        Ok(())
    }

    /// Verify a code against the user's stored secret. Legacy unencrypted
    /// rows are rewritten to the encrypted form on first successful use.
    pub async fn verify_for_user(db: &Database, config: &Config, user: &User, code: &str) -> Result<bool> {
        let stored = user
            .totp_secret
            .as_deref()
            .ok_or_else(|| AppError::BadRequest("TOTP not configured for this user".to_string()))?;

        let secret = SecretValue::parse(stored);
        let secret_base32 = secret.reveal(config)?;

        let ok = Self::check_code(config, &secret_base32, &user.email, code)?;

        if ok && secret.is_legacy() {
            let migrated = SecretCodec::encrypt(config, &secret_base32)?;
            sqlx::query("UPDATE users SET totp_secret = ? WHERE id = ?")
                .bind(&migrated)
                .bind(&user.id)
                .execute(db.pool())
                .await?;
            tracing::info!("Migrated legacy TOTP secret to encrypted form for {}", user.email);
        }

        Ok(ok)
    }

    pub async fn disable(db: &Database, user: &User) -> Result<()> {
        sqlx::query("UPDATE users SET totp_secret = NULL, totp_enabled = 0 WHERE id = ?")
            .bind(&user.id)
            .execute(db.pool())
            .await?;

        SettingsService::set_flag(db, "totp_enabled", false).await?;

        AuditService::log(
            db,
            actions::TOTP_DISABLED,
            AuditEvent::ok().user(&user.id, &user.email),
        )
        .await;

        Ok(())
    }
}

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// Current valid code for a base32 secret, for driving login-flow tests.
    pub fn current_code(config: &Config, secret_base32: &str, account: &str) -> String {
        TwoFactorService::totp_from_base32(config, secret_base32, account)
            .unwrap()
            .generate_current()
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;
    use crate::services::auth::AuthService;

    async fn seed_admin(db: &Database) -> User {
        AuthService::initial_setup(
            db,
            crate::models::CreateUserRequest {
                email: "admin@x.com".to_string(),
                name: "Admin".to_string(),
                password: "Passw0rd!".to_string(),
            },
        )
        .await
        .unwrap();
        AuthService::find_by_email(db, "admin@x.com").await.unwrap().unwrap()
    }

    fn current_code(config: &Config, secret_base32: &str) -> String {
        test_helpers::current_code(config, secret_base32, "admin@x.com")
    }

    #[tokio::test]
    async fn test_enrollment_round_trip() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        let user = seed_admin(&db).await;

        let setup = TwoFactorService::begin_setup(&db, &config, &user).await.unwrap();
        assert!(setup.uri.starts_with("otpauth://totp/"));
        assert!(setup.qr_code.starts_with("data:image/png;base64,"));

        // Wrong code leaves the pending row intact.
        let err = TwoFactorService::confirm_setup(&db, &config, &user, "000000").await;
        assert!(err.is_err());
        let pending: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM totp_setup WHERE user_id = ?")
                .bind(&user.id)
                .fetch_optional(db.pool())
                .await
                .unwrap();
        assert!(pending.is_some());

        let code = current_code(&config, &setup.secret);
        TwoFactorService::confirm_setup(&db, &config, &user, &code).await.unwrap();

        let user = AuthService::find_by_email(&db, "admin@x.com").await.unwrap().unwrap();
        assert!(user.has_totp());
        assert!(user.totp_secret.as_deref().unwrap().starts_with("enc$"));

        // Pending row consumed exactly once.
        let pending: Option<String> =
            sqlx::query_scalar("SELECT user_id FROM totp_setup WHERE user_id = ?")
                .bind(&user.id)
                .fetch_optional(db.pool())
                .await
                .unwrap();
        assert!(pending.is_none());

        let code = current_code(&config, &setup.secret);
        assert!(TwoFactorService::verify_for_user(&db, &config, &user, &code).await.unwrap());
        assert!(!TwoFactorService::verify_for_user(&db, &config, &user, "999999").await.unwrap());
    }

    #[tokio::test]
    async fn test_begin_setup_overwrites_prior_pending() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        let user = seed_admin(&db).await;

        let first = TwoFactorService::begin_setup(&db, &config, &user).await.unwrap();
        let second = TwoFactorService::begin_setup(&db, &config, &user).await.unwrap();
        assert_ne!(first.secret, second.secret);

        // Only the latest secret can confirm.
        let stale = current_code(&config, &first.secret);
        assert!(TwoFactorService::confirm_setup(&db, &config, &user, &stale).await.is_err());

        let code = current_code(&config, &second.secret);
        TwoFactorService::confirm_setup(&db, &config, &user, &code).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_codes_outside_skew_window() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        let user = seed_admin(&db).await;

        let setup = TwoFactorService::begin_setup(&db, &config, &user).await.unwrap();
        let totp = TwoFactorService::totp_from_base32(&config, &setup.secret, &user.email).unwrap();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        // One step away verifies under +-1 skew.
        let adjacent = totp.generate(now - 30);
        assert!(totp.check(&adjacent, now));

        // Three steps away does not.
        let distant = totp.generate(now - 90);
        assert!(!totp.check(&distant, now));
    }

    #[tokio::test]
    async fn test_legacy_plaintext_secret_migrates_on_use() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        let user = seed_admin(&db).await;

        let mut raw = [0u8; 20];
        OsRng.fill_bytes(&mut raw);
        let secret_base32 = Secret::Raw(raw.to_vec()).to_encoded().to_string();

        // Pre-migration row: unencrypted secret straight in the column.
        sqlx::query("UPDATE users SET totp_secret = ?, totp_enabled = 1 WHERE id = ?")
            .bind(&secret_base32)
            .bind(&user.id)
            .execute(db.pool())
            .await
            .unwrap();
        let user = AuthService::find_by_email(&db, "admin@x.com").await.unwrap().unwrap();

        let code = current_code(&config, &secret_base32);
        assert!(TwoFactorService::verify_for_user(&db, &config, &user, &code).await.unwrap());

        let stored: String = sqlx::query_scalar("SELECT totp_secret FROM users WHERE id = ?")
            .bind(&user.id)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert!(stored.starts_with("enc$"));
        assert_eq!(SecretCodec::decrypt(&config, &stored).unwrap(), secret_base32);
    }

    #[tokio::test]
    async fn test_disable_clears_secret_and_flag() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        let user = seed_admin(&db).await;

        let setup = TwoFactorService::begin_setup(&db, &config, &user).await.unwrap();
        let code = current_code(&config, &setup.secret);
        TwoFactorService::confirm_setup(&db, &config, &user, &code).await.unwrap();

        let user = AuthService::find_by_email(&db, "admin@x.com").await.unwrap().unwrap();
        TwoFactorService::disable(&db, &user).await.unwrap();

        let user = AuthService::find_by_email(&db, "admin@x.com").await.unwrap().unwrap();
        assert!(!user.has_totp());
        assert!(user.totp_secret.is_none());

        let settings = SettingsService::security_settings(&db).await.unwrap();
        assert!(!settings.totp_enabled);
    }
}
