use serde::Serialize;
use sqlx::FromRow;

/// Append-only audit record; never mutated or deleted in normal operation.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditLogEntry {
    pub id: String,
    pub action: String,
    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub ip_address: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub details: String,
    pub success: bool,
    pub timestamp: String,
}
