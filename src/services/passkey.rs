use base64::Engine;
use chrono::{Duration, Utc};
use uuid::Uuid;
use webauthn_rs::prelude::*;

use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{PasskeyCredential, User, WebAuthnChallenge};
use crate::services::audit::{actions, AuditEvent, AuditService};
use crate::services::settings::SettingsService;

/// WebAuthn (passkey) factor: registration and authentication ceremonies with
/// serialized intermediate state persisted between the two round trips.
pub struct PasskeyService;

const AUTH_CHALLENGE_TTL_SECS: i64 = 300;
const REGISTER_CHALLENGE_TTL_SECS: i64 = 300;

/// Signature counter acceptance: a fresh assertion must advance the stored
/// counter. Authenticators that never increment report zero on both sides,
/// which is the one permitted non-advancing case.
pub fn counter_advanced(stored: i64, reported: u32) -> bool {
    if stored == 0 && reported == 0 {
        return true;
    }
    i64::from(reported) > stored
}

impl PasskeyService {
    fn webauthn_from_config(config: &Config) -> Result<Webauthn> {
        let rp_origin_raw = config.webauthn.rp_origin.trim();
        let rp_origin = url::Url::parse(rp_origin_raw).or_else(|_| {
            if rp_origin_raw.contains("://") {
                Err(url::ParseError::RelativeUrlWithoutBase)
            } else {
                url::Url::parse(&format!("http://{}", rp_origin_raw))
            }
        });
        let rp_origin = rp_origin.map_err(|_| {
            AppError::BadRequest(format!(
                "Invalid rp_origin: {} (expected like http://localhost:3000)",
                rp_origin_raw
            ))
        })?;
        let builder = WebauthnBuilder::new(&config.webauthn.rp_id, &rp_origin).map_err(|_| {
            AppError::BadRequest(format!(
                "Invalid WebAuthn config (rp_id={}, rp_origin={})",
                config.webauthn.rp_id, rp_origin
            ))
        })?;
        let builder = builder.rp_name(&config.webauthn.rp_name);
        builder
            .build()
            .map_err(|e| AppError::Internal(format!("WebAuthn build error: {:?}", e)))
    }

    async fn credentials_for_user(db: &Database, user_id: &str) -> Result<Vec<PasskeyCredential>> {
        let creds = sqlx::query_as("SELECT * FROM passkey_credentials WHERE user_id = ?")
            .bind(user_id)
            .fetch_all(db.pool())
            .await?;
        Ok(creds)
    }

    fn deserialize_passkey(credential_json: &str) -> Result<Passkey> {
        serde_json::from_str(credential_json)
            .map_err(|_| AppError::Internal("Deserialize passkey failed".to_string()))
    }

    /// Start registration. Existing credential ids are excluded so the
    /// browser refuses to re-enroll the same authenticator. At most one
    /// registration ceremony is outstanding per user; a new one replaces it.
    pub async fn begin_register(
        db: &Database,
        config: &Config,
        user: &User,
    ) -> Result<CreationChallengeResponse> {
        let webauthn = Self::webauthn_from_config(config)?;

        let mut exclude: Vec<CredentialID> = Vec::new();
        for c in Self::credentials_for_user(db, &user.id).await? {
            exclude.push(Self::deserialize_passkey(&c.credential_json)?.cred_id().clone());
        }
        let exclude = if exclude.is_empty() { None } else { Some(exclude) };

        let uid = Uuid::parse_str(&user.id).unwrap_or_else(|_| Uuid::new_v4());
        let (ccr, reg_state) = webauthn
            .start_passkey_registration(uid, &user.email, &user.name, exclude)
            .map_err(|e| AppError::BadRequest(format!("start registration failed: {:?}", e)))?;

        let state_json = serde_json::to_string(&reg_state)
            .map_err(|_| AppError::Internal("Serialize registration state failed".to_string()))?;

        sqlx::query("DELETE FROM webauthn_challenges WHERE user_id = ? AND flow = 'register'")
            .bind(&user.id)
            .execute(db.pool())
            .await?;
        Self::store_challenge(db, Some(&user.id), "register", state_json, REGISTER_CHALLENGE_TTL_SECS)
            .await?;

        Ok(ccr)
    }

    /// Complete registration with the attestation response from the browser.
    pub async fn finish_register(
        db: &Database,
        config: &Config,
        user: &User,
        credential: RegisterPublicKeyCredential,
        name: Option<String>,
    ) -> Result<PasskeyCredential> {
        let challenge: Option<WebAuthnChallenge> = sqlx::query_as(
            "SELECT * FROM webauthn_challenges WHERE user_id = ? AND flow = 'register'",
        )
        .bind(&user.id)
        .fetch_optional(db.pool())
        .await?;
        let challenge = challenge.ok_or(AppError::InvalidChallenge)?;
        Self::ensure_not_expired(&challenge)?;

        let reg_state: PasskeyRegistration = serde_json::from_str(&challenge.state_json)
            .map_err(|_| AppError::Internal("Deserialize registration state failed".to_string()))?;

        let webauthn = Self::webauthn_from_config(config)?;
        let passkey = webauthn
            .finish_passkey_registration(&credential, &reg_state)
            .map_err(|e| AppError::BadRequest(format!("finish registration failed: {:?}", e)))?;

        sqlx::query("DELETE FROM webauthn_challenges WHERE id = ?")
            .bind(&challenge.id)
            .execute(db.pool())
            .await?;

        let cred_id_b64 =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(passkey.cred_id());
        let credential_json = serde_json::to_string(&passkey)
            .map_err(|_| AppError::Internal("Serialize passkey failed".to_string()))?;
        let now = Utc::now().to_rfc3339();
        let id = Uuid::new_v4().to_string();
        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "Passkey".to_string());

        sqlx::query(
            r#"
            INSERT INTO passkey_credentials
                (id, user_id, credential_id, credential_json, sign_count, name, created_at, last_used)
            VALUES (?, ?, ?, ?, 0, ?, ?, NULL)
            "#,
        )
        .bind(&id)
        .bind(&user.id)
        .bind(&cred_id_b64)
        .bind(&credential_json)
        .bind(&name)
        .bind(&now)
        .execute(db.pool())
        .await?;

        SettingsService::set_flag(db, "passkey_enabled", true).await?;
        AuditService::log(
            db,
            actions::PASSKEY_REGISTERED,
            AuditEvent::ok()
                .user(&user.id, &user.email)
                .resource("passkey", &id),
        )
        .await;

        Ok(PasskeyCredential {
            id,
            user_id: user.id.clone(),
            credential_id: cred_id_b64,
            credential_json,
            sign_count: 0,
            name,
            created_at: now,
            last_used: None,
        })
    }

    /// Start authentication against every enrolled admin credential. The
    /// ceremony is anonymous until the assertion resolves a credential, so
    /// the state is keyed by a fresh opaque session id.
    pub async fn begin_authenticate(
        db: &Database,
        config: &Config,
    ) -> Result<(RequestChallengeResponse, String)> {
        let creds: Vec<PasskeyCredential> = sqlx::query_as(
            r#"
            SELECT p.* FROM passkey_credentials p
            JOIN users u ON u.id = p.user_id
            WHERE u.is_admin = 1
            ORDER BY p.last_used DESC, p.created_at DESC
            LIMIT 200
            "#,
        )
        .fetch_all(db.pool())
        .await?;

        let mut passkeys: Vec<Passkey> = Vec::with_capacity(creds.len());
        for c in &creds {
            passkeys.push(Self::deserialize_passkey(&c.credential_json)?);
        }
        if passkeys.is_empty() {
            return Err(AppError::BadRequest("No passkeys registered".to_string()));
        }

        let webauthn = Self::webauthn_from_config(config)?;
        let (req, auth_state) = webauthn
            .start_passkey_authentication(&passkeys)
            .map_err(|e| AppError::BadRequest(format!("start authentication failed: {:?}", e)))?;

        let state_json = serde_json::to_string(&auth_state)
            .map_err(|_| AppError::Internal("Serialize authentication state failed".to_string()))?;
        let session_id =
            Self::store_challenge(db, None, "auth", state_json, AUTH_CHALLENGE_TTL_SECS).await?;

        Ok((req, session_id))
    }

    /// Verify the assertion, enforce counter monotonicity, and resolve the
    /// owning user. The challenge is consumed whatever the outcome.
    pub async fn finish_authenticate(
        db: &Database,
        config: &Config,
        session_id: &str,
        credential: PublicKeyCredential,
    ) -> Result<User> {
        let challenge: Option<WebAuthnChallenge> =
            sqlx::query_as("SELECT * FROM webauthn_challenges WHERE id = ? AND flow = 'auth'")
                .bind(session_id)
                .fetch_optional(db.pool())
                .await?;
        let challenge = challenge.ok_or(AppError::InvalidChallenge)?;

        sqlx::query("DELETE FROM webauthn_challenges WHERE id = ?")
            .bind(&challenge.id)
            .execute(db.pool())
            .await?;

        Self::ensure_not_expired(&challenge)?;

        let auth_state: PasskeyAuthentication = serde_json::from_str(&challenge.state_json)
            .map_err(|_| AppError::Internal("Deserialize authentication state failed".to_string()))?;

        let webauthn = Self::webauthn_from_config(config)?;
        let result = webauthn
            .finish_passkey_authentication(&credential, &auth_state)
            .map_err(|_| AppError::InvalidCredentials)?;

        let cred_id_b64 =
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(result.cred_id());
        let mut stored: PasskeyCredential =
            sqlx::query_as("SELECT * FROM passkey_credentials WHERE credential_id = ?")
                .bind(&cred_id_b64)
                .fetch_optional(db.pool())
                .await?
                .ok_or(AppError::InvalidCredentials)?;

        if !counter_advanced(stored.sign_count, result.counter()) {
            tracing::warn!(
                "Passkey counter did not advance (stored={}, reported={}), possible cloned credential: {}",
                stored.sign_count,
                result.counter(),
                stored.id
            );
            return Err(AppError::InvalidCredentials);
        }

        let mut passkey = Self::deserialize_passkey(&stored.credential_json)?;
        if passkey.update_credential(&result) == Some(true) {
            stored.credential_json = serde_json::to_string(&passkey)
                .map_err(|_| AppError::Internal("Serialize passkey failed".to_string()))?;
        }

        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "UPDATE passkey_credentials SET credential_json = ?, sign_count = ?, last_used = ? WHERE id = ?",
        )
        .bind(&stored.credential_json)
        .bind(i64::from(result.counter()))
        .bind(&now)
        .bind(&stored.id)
        .execute(db.pool())
        .await?;

        let user: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(&stored.user_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or(AppError::InvalidCredentials)?;

        Ok(user)
    }

    pub async fn list(db: &Database, user_id: &str) -> Result<Vec<PasskeyCredential>> {
        let creds = sqlx::query_as(
            "SELECT * FROM passkey_credentials WHERE user_id = ? ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(db.pool())
        .await?;
        Ok(creds)
    }

    pub async fn rename(db: &Database, user_id: &str, credential_id: &str, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::BadRequest("Name cannot be empty".to_string()));
        }
        let result =
            sqlx::query("UPDATE passkey_credentials SET name = ? WHERE id = ? AND user_id = ?")
                .bind(name)
                .bind(credential_id)
                .bind(user_id)
                .execute(db.pool())
                .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Passkey not found".to_string()));
        }
        Ok(())
    }

    /// Remove a credential. When the last one goes, the factor flag is
    /// switched off so login stops offering the passkey option.
    pub async fn delete(db: &Database, user: &User, credential_id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM passkey_credentials WHERE id = ? AND user_id = ?")
            .bind(credential_id)
            .bind(&user.id)
            .execute(db.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Passkey not found".to_string()));
        }

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM passkey_credentials")
            .fetch_one(db.pool())
            .await?;
        if remaining == 0 {
            SettingsService::set_flag(db, "passkey_enabled", false).await?;
        }

        AuditService::log(
            db,
            actions::PASSKEY_DELETED,
            AuditEvent::ok()
                .user(&user.id, &user.email)
                .resource("passkey", credential_id),
        )
        .await;
        Ok(())
    }

    /// Sweep expired ceremony state.
    pub async fn cleanup_expired_challenges(db: &Database) -> u64 {
        let now = Utc::now().to_rfc3339();
        match sqlx::query("DELETE FROM webauthn_challenges WHERE expires_at < ?")
            .bind(&now)
            .execute(db.pool())
            .await
        {
            Ok(r) => r.rows_affected(),
            Err(e) => {
                tracing::warn!("Challenge cleanup error: {:?}", e);
                0
            }
        }
    }

    async fn store_challenge(
        db: &Database,
        user_id: Option<&str>,
        flow: &str,
        state_json: String,
        ttl_secs: i64,
    ) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO webauthn_challenges (id, user_id, flow, state_json, expires_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(flow)
        .bind(&state_json)
        .bind((now + Duration::seconds(ttl_secs)).to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(db.pool())
        .await?;
        Ok(id)
    }

    fn ensure_not_expired(challenge: &WebAuthnChallenge) -> Result<()> {
        let expires_at = chrono::DateTime::parse_from_rfc3339(&challenge.expires_at)
            .map_err(|_| AppError::InvalidChallenge)?;
        if expires_at < Utc::now() {
            return Err(AppError::InvalidChallenge);
        }
        Ok(())
    }
}
