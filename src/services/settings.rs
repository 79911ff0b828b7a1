use chrono::Utc;

use crate::db::Database;
use crate::error::Result;
use crate::models::{SecuritySettings, SmtpConfig};

/// Singleton security settings and SMTP relay configuration rows.
pub struct SettingsService;

impl SettingsService {
    pub async fn security_settings(db: &Database) -> Result<SecuritySettings> {
        let settings: Option<SecuritySettings> =
            sqlx::query_as("SELECT * FROM security_settings WHERE id = 1")
                .fetch_optional(db.pool())
                .await?;
        Ok(settings.unwrap_or_default())
    }

    pub async fn save_security_settings(db: &Database, settings: &SecuritySettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO security_settings (id, email_otp_enabled, totp_enabled, passkey_enabled, admin_email, updated_at)
            VALUES (1, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email_otp_enabled = excluded.email_otp_enabled,
                totp_enabled = excluded.totp_enabled,
                passkey_enabled = excluded.passkey_enabled,
                admin_email = excluded.admin_email,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(settings.email_otp_enabled)
        .bind(settings.totp_enabled)
        .bind(settings.passkey_enabled)
        .bind(&settings.admin_email)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await?;
        Ok(())
    }

    /// Flip a single factor flag, preserving the rest of the row.
    pub async fn set_flag(db: &Database, flag: &str, value: bool) -> Result<()> {
        let mut settings = Self::security_settings(db).await?;
        match flag {
            "email_otp_enabled" => settings.email_otp_enabled = value,
            "totp_enabled" => settings.totp_enabled = value,
            "passkey_enabled" => settings.passkey_enabled = value,
            _ => return Ok(()),
        }
        Self::save_security_settings(db, &settings).await
    }

    pub async fn smtp_config(db: &Database) -> Result<Option<SmtpConfig>> {
        let config: Option<SmtpConfig> = sqlx::query_as("SELECT * FROM smtp_config WHERE id = 1")
            .fetch_optional(db.pool())
            .await?;
        Ok(config)
    }

    pub async fn save_smtp_config(db: &Database, config: &SmtpConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO smtp_config (id, smtp_host, smtp_port, smtp_email, smtp_password, use_tls, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                smtp_host = excluded.smtp_host,
                smtp_port = excluded.smtp_port,
                smtp_email = excluded.smtp_email,
                smtp_password = excluded.smtp_password,
                use_tls = excluded.use_tls,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.smtp_host)
        .bind(config.smtp_port)
        .bind(&config.smtp_email)
        .bind(&config.smtp_password)
        .bind(config.use_tls)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await?;
        Ok(())
    }
}
