use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::{
    Claims, CreateUserRequest, LoginRequest, LoginResponse, LoginTotpRequest, RefreshResponse,
    TokenResponse, User,
};
use crate::services::audit::{actions, AuditEvent, AuditService};
use crate::services::crypto::validate_password_strength;
use crate::services::lockout::{LockoutService, LOCKOUT_DURATION_MINUTES, MAX_FAILURES_BEFORE_LOCKOUT};
use crate::services::rate_limit::{
    RateLimitService, LOGIN_MAX_ATTEMPTS, TOTP_MAX_ATTEMPTS, WINDOW_SECONDS,
};
use crate::services::two_factor::TwoFactorService;

/// Password factor, token issuance, and the login orchestration that ties the
/// abuse controls and second factors together.
pub struct AuthService;

impl AuthService {
    pub fn hash_password(password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::default();
        let hash = argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Password hashing failed: {}", e)))?;
        Ok(hash.to_string())
    }

    pub fn verify_password(password: &str, hash: &str) -> bool {
        match PasswordHash::new(hash) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(_) => false,
        }
    }

    pub fn create_access_token(config: &Config, email: &str) -> Result<String> {
        Self::create_token(
            config,
            email,
            "access",
            Duration::minutes(config.jwt.access_token_expire_minutes as i64),
        )
    }

    pub fn create_refresh_token(config: &Config, email: &str) -> Result<String> {
        Self::create_token(
            config,
            email,
            "refresh",
            Duration::days(config.jwt.refresh_token_expire_days as i64),
        )
    }

    fn create_token(config: &Config, email: &str, kind: &str, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: email.to_string(),
            kind: kind.to_string(),
            exp: (now + ttl).timestamp() as usize,
            iat: now.timestamp() as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt.secret.as_bytes()),
        )?;
        Ok(token)
    }

    /// Decode and validate a token, returning the subject email only when the
    /// signature, expiry and token kind all check out.
    pub fn decode_token(config: &Config, token: &str, expected_kind: &str) -> Option<String> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(config.jwt.secret.as_bytes()),
            &Validation::default(),
        )
        .ok()?;
        if decoded.claims.kind != expected_kind {
            return None;
        }
        Some(decoded.claims.sub)
    }

    /// Verify a primary credential pair. Unknown user and wrong password are
    /// one code path: for missing accounts an equivalent hash verification is
    /// burned so response timing does not reveal whether the account exists.
    async fn check_credentials(db: &Database, email: &str, password: &str) -> Result<Option<User>> {
        match Self::find_by_email(db, email).await? {
            Some(user) if Self::verify_password(password, &user.password_hash) => Ok(Some(user)),
            Some(_) => Ok(None),
            None => {
                let _ = Self::verify_password(password, DUMMY_HASH);
                Ok(None)
            }
        }
    }

    pub async fn find_by_email(db: &Database, email: &str) -> Result<Option<User>> {
        let user = sqlx::query_as("SELECT * FROM users WHERE email = ?")
            .bind(email)
            .fetch_optional(db.pool())
            .await?;
        Ok(user)
    }

    /// True until the first admin account exists.
    pub async fn needs_setup(db: &Database) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(db.pool())
            .await?;
        Ok(count == 0)
    }

    /// One-time bootstrap of the first (admin) account. Refuses to run again.
    pub async fn initial_setup(db: &Database, req: CreateUserRequest) -> Result<User> {
        if !Self::needs_setup(db).await? {
            return Err(AppError::Forbidden(
                "Setup already completed. Admin user exists.".to_string(),
            ));
        }
        validate_password_strength(&req.password).map_err(AppError::WeakPassword)?;

        let id = Uuid::new_v4().to_string();
        let password_hash = Self::hash_password(&req.password)?;
        sqlx::query(
            r#"
            INSERT INTO users (id, email, name, password_hash, is_admin, created_at)
            VALUES (?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.email)
        .bind(&req.name)
        .bind(&password_hash)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await?;

        AuditService::log(db, actions::USER_CREATED, AuditEvent::ok().user(&id, &req.email)).await;
        tracing::info!("Initial admin account created: {}", req.email);

        let user = Self::find_by_email(db, &req.email)
            .await?
            .ok_or_else(|| AppError::Internal("Setup insert vanished".to_string()))?;
        Ok(user)
    }

    /// Primary login. Gate order is lockout, then rate limit, then the
    /// credential check itself; each gate that refuses leaves its own trace.
    pub async fn login(
        db: &Database,
        config: &Config,
        req: LoginRequest,
        client_ip: &str,
    ) -> Result<LoginResponse> {
        if let (true, Some(unlock_at)) = LockoutService::check(db, &req.email).await {
            AuditService::log(
                db,
                actions::LOGIN_FAILED,
                AuditEvent::failed()
                    .email(&req.email)
                    .ip(client_ip)
                    .details(serde_json::json!({"reason": "account_locked"})),
            )
            .await;
            return Err(AppError::AccountLocked(
                unlock_at.format("%H:%M UTC").to_string(),
            ));
        }

        let (allowed, _) =
            RateLimitService::check(db, client_ip, "login", LOGIN_MAX_ATTEMPTS, WINDOW_SECONDS)
                .await;
        if !allowed {
            return Err(AppError::RateLimited(WINDOW_SECONDS / 60));
        }

        let user = Self::check_credentials(db, &req.email, &req.password).await?;
        let user = match user {
            Some(user) => user,
            None => {
                RateLimitService::record(db, client_ip, "login", false).await;
                LockoutService::increment_failure(
                    db,
                    &req.email,
                    MAX_FAILURES_BEFORE_LOCKOUT,
                    LOCKOUT_DURATION_MINUTES,
                )
                .await;
                AuditService::log(
                    db,
                    actions::LOGIN_FAILED,
                    AuditEvent::failed()
                        .email(&req.email)
                        .ip(client_ip)
                        .details(serde_json::json!({"reason": "invalid_credentials"})),
                )
                .await;
                return Err(AppError::InvalidCredentials);
            }
        };

        RateLimitService::record(db, client_ip, "login", true).await;
        LockoutService::clear_failures(db, &req.email).await;

        if user.has_totp() {
            return Ok(LoginResponse::TotpRequired {
                requires_totp: true,
                email: user.email,
                message: "TOTP code required".to_string(),
            });
        }

        let tokens = Self::issue_tokens(db, config, &user, client_ip).await?;
        AuditService::log(
            db,
            actions::LOGIN_SUCCESS,
            AuditEvent::ok()
                .user(&user.id, &user.email)
                .ip(client_ip)
                .details(serde_json::json!({"method": "password"})),
        )
        .await;
        Ok(LoginResponse::Tokens(tokens))
    }

    /// Second step of TOTP login. The password is verified again together
    /// with the code because no partial-auth state is kept between steps.
    pub async fn login_totp(
        db: &Database,
        config: &Config,
        req: LoginTotpRequest,
        client_ip: &str,
    ) -> Result<TokenResponse> {
        if let (true, Some(unlock_at)) = LockoutService::check(db, &req.email).await {
            return Err(AppError::AccountLocked(
                unlock_at.format("%H:%M UTC").to_string(),
            ));
        }

        let (allowed, _) =
            RateLimitService::check(db, client_ip, "totp", TOTP_MAX_ATTEMPTS, WINDOW_SECONDS).await;
        if !allowed {
            return Err(AppError::RateLimited(WINDOW_SECONDS / 60));
        }

        let user = Self::check_credentials(db, &req.email, &req.password).await?;
        let user = match user {
            Some(user) => user,
            None => {
                RateLimitService::record(db, client_ip, "totp", false).await;
                LockoutService::increment_failure(
                    db,
                    &req.email,
                    MAX_FAILURES_BEFORE_LOCKOUT,
                    LOCKOUT_DURATION_MINUTES,
                )
                .await;
                return Err(AppError::InvalidCredentials);
            }
        };

        if !user.has_totp() {
            return Err(AppError::BadRequest(
                "TOTP is not enabled for this account".to_string(),
            ));
        }

        let code_ok = TwoFactorService::verify_for_user(db, config, &user, &req.totp_code).await?;
        if !code_ok {
            RateLimitService::record(db, client_ip, "totp", false).await;
            AuditService::log(
                db,
                actions::LOGIN_FAILED,
                AuditEvent::failed()
                    .user(&user.id, &user.email)
                    .ip(client_ip)
                    .details(serde_json::json!({"reason": "invalid_totp_code"})),
            )
            .await;
            return Err(AppError::InvalidCredentials);
        }

        RateLimitService::record(db, client_ip, "totp", true).await;
        LockoutService::clear_failures(db, &req.email).await;

        let tokens = Self::issue_tokens(db, config, &user, client_ip).await?;
        AuditService::log(
            db,
            actions::LOGIN_SUCCESS,
            AuditEvent::ok()
                .user(&user.id, &user.email)
                .ip(client_ip)
                .details(serde_json::json!({"method": "totp"})),
        )
        .await;
        Ok(tokens)
    }

    /// Mint the token pair and roll the login bookkeeping: the previous
    /// login's time and address are returned so the UI can show "last seen".
    pub async fn issue_tokens(
        db: &Database,
        config: &Config,
        user: &User,
        client_ip: &str,
    ) -> Result<TokenResponse> {
        let access_token = Self::create_access_token(config, &user.email)?;
        let refresh_token = Self::create_refresh_token(config, &user.email)?;

        let previous_login = user.last_login.clone();
        let previous_login_ip = user.last_login_ip.clone();

        sqlx::query(
            r#"
            UPDATE users SET
                previous_login = last_login,
                previous_login_ip = last_login_ip,
                last_login = ?,
                last_login_ip = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(client_ip)
        .bind(&user.id)
        .execute(db.pool())
        .await?;

        Ok(TokenResponse {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
            last_login: previous_login,
            last_login_ip: previous_login_ip,
        })
    }

    /// Exchange a refresh token for a fresh access token. The account must
    /// still exist; deleting a user revokes its refresh tokens implicitly.
    pub async fn refresh(db: &Database, config: &Config, refresh_token: &str) -> Result<RefreshResponse> {
        let email = Self::decode_token(config, refresh_token, "refresh")
            .ok_or(AppError::InvalidChallenge)?;
        let user = Self::find_by_email(db, &email)
            .await?
            .ok_or(AppError::InvalidChallenge)?;

        let access_token = Self::create_access_token(config, &user.email)?;
        Ok(RefreshResponse {
            access_token,
            token_type: "bearer".to_string(),
        })
    }

    pub async fn change_password(
        db: &Database,
        user: &User,
        current_password: &str,
        new_password: &str,
    ) -> Result<()> {
        if !Self::verify_password(current_password, &user.password_hash) {
            AuditService::log(
                db,
                actions::PASSWORD_CHANGED,
                AuditEvent::failed()
                    .user(&user.id, &user.email)
                    .details(serde_json::json!({"reason": "current_password_mismatch"})),
            )
            .await;
            return Err(AppError::BadRequest("Current password is incorrect".to_string()));
        }
        validate_password_strength(new_password).map_err(AppError::WeakPassword)?;
        if current_password == new_password {
            return Err(AppError::BadRequest(
                "New password must differ from the current one".to_string(),
            ));
        }

        let password_hash = Self::hash_password(new_password)?;
        sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
            .bind(&password_hash)
            .bind(&user.id)
            .execute(db.pool())
            .await?;

        AuditService::log(
            db,
            actions::PASSWORD_CHANGED,
            AuditEvent::ok().user(&user.id, &user.email),
        )
        .await;
        Ok(())
    }
}

/// Valid argon2 hash of an unknowable password, used to equalize timing for
/// login attempts against nonexistent accounts.
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$GVSb0BIdeGbRkJ3ASGRvK3uqJumvSEdJ9p9QXjNhHhE";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;

    fn setup_req() -> CreateUserRequest {
        CreateUserRequest {
            email: "admin@x.com".to_string(),
            name: "Admin".to_string(),
            password: "Str0ng!passw".to_string(),
        }
    }

    #[tokio::test]
    async fn test_initial_setup_runs_once() {
        let (db, _guard) = test_db().await;

        assert!(AuthService::needs_setup(&db).await.unwrap());
        AuthService::initial_setup(&db, setup_req()).await.unwrap();
        assert!(!AuthService::needs_setup(&db).await.unwrap());

        let again = AuthService::initial_setup(&db, setup_req()).await;
        assert!(matches!(again, Err(AppError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_initial_setup_rejects_weak_password() {
        let (db, _guard) = test_db().await;

        let mut req = setup_req();
        req.password = "weak".to_string();
        let result = AuthService::initial_setup(&db, req).await;
        assert!(matches!(result, Err(AppError::WeakPassword(_))));
        assert!(AuthService::needs_setup(&db).await.unwrap());
    }

    #[test]
    fn test_password_hash_round_trip() {
        let hash = AuthService::hash_password("Str0ng!passw").unwrap();
        assert!(AuthService::verify_password("Str0ng!passw", &hash));
        assert!(!AuthService::verify_password("wrong", &hash));
        assert!(!AuthService::verify_password("Str0ng!passw", "not-a-hash"));
    }

    #[test]
    fn test_token_kinds_are_enforced() {
        let config = Config::for_tests();
        let access = AuthService::create_access_token(&config, "a@x.com").unwrap();
        let refresh = AuthService::create_refresh_token(&config, "a@x.com").unwrap();

        assert_eq!(
            AuthService::decode_token(&config, &access, "access").as_deref(),
            Some("a@x.com")
        );
        assert!(AuthService::decode_token(&config, &access, "refresh").is_none());
        assert!(AuthService::decode_token(&config, &refresh, "access").is_none());
        assert_eq!(
            AuthService::decode_token(&config, &refresh, "refresh").as_deref(),
            Some("a@x.com")
        );

        // Wrong signing key.
        let mut other = Config::for_tests();
        other.jwt.secret = "another-secret-entirely-0123456789".to_string();
        assert!(AuthService::decode_token(&other, &access, "access").is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = Config::for_tests();
        let now = Utc::now();
        let claims = Claims {
            sub: "a@x.com".to_string(),
            kind: "access".to_string(),
            exp: (now - Duration::minutes(10)).timestamp() as usize,
            iat: (now - Duration::hours(5)).timestamp() as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(config.jwt.secret.as_bytes()),
        )
        .unwrap();
        assert!(AuthService::decode_token(&config, &token, "access").is_none());
    }

    #[tokio::test]
    async fn test_login_issues_tokens_and_rolls_last_seen() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        AuthService::initial_setup(&db, setup_req()).await.unwrap();

        let req = LoginRequest {
            email: "admin@x.com".to_string(),
            password: "Str0ng!passw".to_string(),
        };
        let first = AuthService::login(&db, &config, req, "198.51.100.1").await.unwrap();
        let tokens = match first {
            LoginResponse::Tokens(t) => t,
            other => panic!("expected tokens, got {:?}", other),
        };
        // First ever login has no previous-login metadata.
        assert!(tokens.last_login.is_none());
        assert_eq!(
            AuthService::decode_token(&config, &tokens.access_token, "access").as_deref(),
            Some("admin@x.com")
        );

        let req = LoginRequest {
            email: "admin@x.com".to_string(),
            password: "Str0ng!passw".to_string(),
        };
        let second = AuthService::login(&db, &config, req, "198.51.100.2").await.unwrap();
        let tokens = match second {
            LoginResponse::Tokens(t) => t,
            other => panic!("expected tokens, got {:?}", other),
        };
        assert!(tokens.last_login.is_some());
        assert_eq!(tokens.last_login_ip.as_deref(), Some("198.51.100.1"));
    }

    #[tokio::test]
    async fn test_login_unknown_user_and_wrong_password_look_identical() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        AuthService::initial_setup(&db, setup_req()).await.unwrap();

        let unknown = AuthService::login(
            &db,
            &config,
            LoginRequest {
                email: "ghost@x.com".to_string(),
                password: "Str0ng!passw".to_string(),
            },
            "198.51.100.3",
        )
        .await
        .unwrap_err();
        let wrong = AuthService::login(
            &db,
            &config,
            LoginRequest {
                email: "admin@x.com".to_string(),
                password: "Wrong!passw0rd".to_string(),
            },
            "198.51.100.3",
        )
        .await
        .unwrap_err();

        assert_eq!(unknown.to_string(), wrong.to_string());
        assert!(matches!(unknown, AppError::InvalidCredentials));
        assert!(matches!(wrong, AppError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_login_rate_limited_after_five_failures() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        AuthService::initial_setup(&db, setup_req()).await.unwrap();

        for _ in 0..5 {
            let result = AuthService::login(
                &db,
                &config,
                LoginRequest {
                    email: "admin@x.com".to_string(),
                    password: "Wrong!passw0rd".to_string(),
                },
                "198.51.100.4",
            )
            .await;
            assert!(matches!(result, Err(AppError::InvalidCredentials)));
        }

        // Sixth attempt is refused before credentials are even checked.
        let result = AuthService::login(
            &db,
            &config,
            LoginRequest {
                email: "admin@x.com".to_string(),
                password: "Str0ng!passw".to_string(),
            },
            "198.51.100.4",
        )
        .await;
        assert!(matches!(result, Err(AppError::RateLimited(_))));

        // A different source address is unaffected.
        let result = AuthService::login(
            &db,
            &config,
            LoginRequest {
                email: "admin@x.com".to_string(),
                password: "Str0ng!passw".to_string(),
            },
            "198.51.100.5",
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_login_with_totp_enabled_demands_second_factor() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        AuthService::initial_setup(&db, setup_req()).await.unwrap();
        let user = AuthService::find_by_email(&db, "admin@x.com").await.unwrap().unwrap();

        let setup = TwoFactorService::begin_setup(&db, &config, &user).await.unwrap();
        let code = crate::services::two_factor::test_helpers::current_code(&config, &setup.secret, &user.email);
        TwoFactorService::confirm_setup(&db, &config, &user, &code).await.unwrap();

        let result = AuthService::login(
            &db,
            &config,
            LoginRequest {
                email: "admin@x.com".to_string(),
                password: "Str0ng!passw".to_string(),
            },
            "198.51.100.6",
        )
        .await
        .unwrap();
        assert!(matches!(result, LoginResponse::TotpRequired { .. }));

        // Wrong code on the second step fails closed and counts against the
        // stricter totp limit.
        let result = AuthService::login_totp(
            &db,
            &config,
            LoginTotpRequest {
                email: "admin@x.com".to_string(),
                password: "Str0ng!passw".to_string(),
                totp_code: "000000".to_string(),
            },
            "198.51.100.6",
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidCredentials)));

        let code = crate::services::two_factor::test_helpers::current_code(&config, &setup.secret, &user.email);
        let tokens = AuthService::login_totp(
            &db,
            &config,
            LoginTotpRequest {
                email: "admin@x.com".to_string(),
                password: "Str0ng!passw".to_string(),
                totp_code: code,
            },
            "198.51.100.6",
        )
        .await
        .unwrap();
        assert_eq!(
            AuthService::decode_token(&config, &tokens.access_token, "access").as_deref(),
            Some("admin@x.com")
        );
    }

    #[tokio::test]
    async fn test_refresh_flow() {
        let (db, _guard) = test_db().await;
        let config = Config::for_tests();
        AuthService::initial_setup(&db, setup_req()).await.unwrap();

        let refresh_token = AuthService::create_refresh_token(&config, "admin@x.com").unwrap();
        let refreshed = AuthService::refresh(&db, &config, &refresh_token).await.unwrap();
        assert_eq!(
            AuthService::decode_token(&config, &refreshed.access_token, "access").as_deref(),
            Some("admin@x.com")
        );

        // An access token is not accepted as a refresh token.
        let access_token = AuthService::create_access_token(&config, "admin@x.com").unwrap();
        let result = AuthService::refresh(&db, &config, &access_token).await;
        assert!(matches!(result, Err(AppError::InvalidChallenge)));

        // Tokens for deleted accounts are dead.
        let ghost_refresh = AuthService::create_refresh_token(&config, "ghost@x.com").unwrap();
        let result = AuthService::refresh(&db, &config, &ghost_refresh).await;
        assert!(matches!(result, Err(AppError::InvalidChallenge)));
    }

    #[tokio::test]
    async fn test_change_password() {
        let (db, _guard) = test_db().await;
        AuthService::initial_setup(&db, setup_req()).await.unwrap();
        let user = AuthService::find_by_email(&db, "admin@x.com").await.unwrap().unwrap();

        let wrong = AuthService::change_password(&db, &user, "nope", "N3w!passwrd").await;
        assert!(matches!(wrong, Err(AppError::BadRequest(_))));

        let weak = AuthService::change_password(&db, &user, "Str0ng!passw", "weak").await;
        assert!(matches!(weak, Err(AppError::WeakPassword(_))));

        let same = AuthService::change_password(&db, &user, "Str0ng!passw", "Str0ng!passw").await;
        assert!(matches!(same, Err(AppError::BadRequest(_))));

        AuthService::change_password(&db, &user, "Str0ng!passw", "N3w!passwrd").await.unwrap();
        let user = AuthService::find_by_email(&db, "admin@x.com").await.unwrap().unwrap();
        assert!(AuthService::verify_password("N3w!passwrd", &user.password_hash));
        assert!(!AuthService::verify_password("Str0ng!passw", &user.password_hash));
    }
}
