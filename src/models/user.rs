use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// User model
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub is_admin: bool,
    pub totp_enabled: i64,
    pub totp_secret: Option<String>,
    pub last_login: Option<String>,
    pub last_login_ip: Option<String>,
    pub previous_login: Option<String>,
    pub previous_login_ip: Option<String>,
    pub created_at: String,
}

impl User {
    pub fn has_totp(&self) -> bool {
        self.totp_enabled != 0 && self.totp_secret.is_some()
    }
}

/// User response (without sensitive data)
#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: String,
    pub email: String,
    pub name: String,
    pub is_admin: bool,
    pub totp_enabled: bool,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            name: user.name,
            is_admin: user.is_admin,
            totp_enabled: user.totp_enabled != 0,
            created_at: user.created_at,
        }
    }
}

/// Initial setup / user creation request
#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    pub name: String,
    pub password: String,
}

/// Login request
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// TOTP login request: the password is re-verified together with the code
/// because no partial-auth state is kept server-side between the two steps.
#[derive(Debug, Deserialize)]
pub struct LoginTotpRequest {
    pub email: String,
    pub password: String,
    pub totp_code: String,
}

/// Successful login: tokens plus previous-login metadata ("last seen").
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_login_ip: Option<String>,
}

/// Login outcome: tokens, or a second-factor demand
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum LoginResponse {
    TotpRequired {
        requires_totp: bool,
        email: String,
        message: String,
    },
    Tokens(TokenResponse),
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub token_type: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub current_password: String,
    pub new_password: String,
}

/// Current authenticated user (extracted from JWT)
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
    pub is_admin: bool,
}

/// JWT Claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user email
    pub kind: String, // "access" | "refresh"
    pub exp: usize,
    pub iat: usize,
}
