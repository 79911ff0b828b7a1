use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored WebAuthn credential. `sign_count` is monotonic: a non-increasing
/// value on verification is treated as a replayed assertion.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PasskeyCredential {
    pub id: String,
    pub user_id: String,
    pub credential_id: String,
    pub credential_json: String,
    pub sign_count: i64,
    pub name: String,
    pub created_at: String,
    pub last_used: Option<String>,
}

/// Outstanding WebAuthn ceremony state. Registration challenges are keyed by
/// the enrolling user; authentication challenges are anonymous and keyed by a
/// fresh random id until the credential response resolves an owner.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebAuthnChallenge {
    pub id: String,
    pub user_id: Option<String>,
    pub flow: String, // "register" | "auth"
    pub state_json: String,
    pub expires_at: String,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
pub struct PasskeySummary {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub last_used: Option<String>,
}

impl From<PasskeyCredential> for PasskeySummary {
    fn from(c: PasskeyCredential) -> Self {
        Self {
            id: c.id,
            name: c.name,
            created_at: c.created_at,
            last_used: c.last_used,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RenamePasskeyRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct PasskeyRegisterFinishRequest {
    pub credential: webauthn_rs::prelude::RegisterPublicKeyCredential,
    pub name: Option<String>,
}

/// Assertion response plus the opaque ceremony session id handed out by the
/// options endpoint.
#[derive(Debug, Deserialize)]
pub struct PasskeyAuthFinishRequest {
    pub session_id: String,
    pub credential: webauthn_rs::prelude::PublicKeyCredential,
}

#[derive(Debug, Serialize)]
pub struct PasskeyAuthOptionsResponse {
    pub options: webauthn_rs::prelude::RequestChallengeResponse,
    pub session_id: String,
}
