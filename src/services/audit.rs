use chrono::Utc;
use uuid::Uuid;

use crate::db::Database;
use crate::error::Result;
use crate::models::AuditLogEntry;

/// Audit action names, dot-separated so prefix queries select a family.
pub mod actions {
    pub const LOGIN_SUCCESS: &str = "auth.login.success";
    pub const LOGIN_FAILED: &str = "auth.login.failed";
    pub const LOGOUT: &str = "auth.logout";
    pub const PASSWORD_CHANGED: &str = "auth.password.changed";
    pub const TOTP_ENABLED: &str = "auth.totp.enabled";
    pub const TOTP_DISABLED: &str = "auth.totp.disabled";
    pub const PASSKEY_REGISTERED: &str = "auth.passkey.registered";
    pub const PASSKEY_DELETED: &str = "auth.passkey.deleted";
    pub const USER_CREATED: &str = "user.created";
    pub const SECURITY_SETTINGS_UPDATED: &str = "security.settings.updated";
    pub const SMTP_CONFIG_UPDATED: &str = "security.smtp.updated";
}

/// Fields for one audit event; the builder keeps call sites readable.
#[derive(Default)]
pub struct AuditEvent<'a> {
    pub user_id: Option<&'a str>,
    pub user_email: Option<&'a str>,
    pub ip_address: Option<&'a str>,
    pub resource_type: Option<&'a str>,
    pub resource_id: Option<&'a str>,
    pub details: Option<serde_json::Value>,
    pub success: bool,
}

impl<'a> AuditEvent<'a> {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            ..Default::default()
        }
    }

    pub fn user(mut self, id: &'a str, email: &'a str) -> Self {
        self.user_id = Some(id);
        self.user_email = Some(email);
        self
    }

    pub fn email(mut self, email: &'a str) -> Self {
        self.user_email = Some(email);
        self
    }

    pub fn ip(mut self, ip: &'a str) -> Self {
        self.ip_address = Some(ip);
        self
    }

    pub fn resource(mut self, kind: &'a str, id: &'a str) -> Self {
        self.resource_type = Some(kind);
        self.resource_id = Some(id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Append-only security audit trail, written best-effort: a store failure is
/// logged internally and never surfaces to the calling flow.
pub struct AuditService;

impl AuditService {
    pub async fn log(db: &Database, action: &str, event: AuditEvent<'_>) {
        let details = event
            .details
            .unwrap_or_else(|| serde_json::json!({}))
            .to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO audit_logs
                (id, action, user_id, user_email, ip_address, resource_type, resource_id, details, success, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(action)
        .bind(event.user_id)
        .bind(event.user_email)
        .bind(event.ip_address)
        .bind(event.resource_type)
        .bind(event.resource_id)
        .bind(&details)
        .bind(event.success)
        .bind(Utc::now().to_rfc3339())
        .execute(db.pool())
        .await;

        if let Err(e) = result {
            tracing::error!("Failed to write audit log: {:?}", e);
            return;
        }

        // Mirror to the application log for immediate visibility.
        if event.success {
            tracing::info!(
                "AUDIT: {} | user={:?} | success=true",
                action,
                event.user_email
            );
        } else {
            tracing::warn!(
                "AUDIT: {} | user={:?} | success=false",
                action,
                event.user_email
            );
        }
    }

    /// Query the trail, newest first; `action_prefix` narrows to one family.
    pub async fn query(
        db: &Database,
        action_prefix: Option<&str>,
        limit: i64,
    ) -> Result<Vec<AuditLogEntry>> {
        let limit = limit.clamp(1, 1000);
        let entries = match action_prefix {
            Some(prefix) => {
                let pattern = format!("{}%", prefix.replace('%', "").replace('_', ""));
                sqlx::query_as(
                    "SELECT * FROM audit_logs WHERE action LIKE ? ORDER BY timestamp DESC LIMIT ?",
                )
                .bind(pattern)
                .bind(limit)
                .fetch_all(db.pool())
                .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM audit_logs ORDER BY timestamp DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(db.pool())
                    .await?
            }
        };
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;

    #[tokio::test]
    async fn test_log_and_query_by_prefix() {
        let (db, _guard) = test_db().await;

        AuditService::log(
            &db,
            actions::LOGIN_SUCCESS,
            AuditEvent::ok().email("a@x.com").ip("198.51.100.9"),
        )
        .await;
        AuditService::log(
            &db,
            actions::LOGIN_FAILED,
            AuditEvent::failed()
                .email("a@x.com")
                .details(serde_json::json!({"reason": "invalid_credentials"})),
        )
        .await;
        AuditService::log(&db, actions::USER_CREATED, AuditEvent::ok().email("a@x.com")).await;

        let all = AuditService::query(&db, None, 100).await.unwrap();
        assert_eq!(all.len(), 3);

        let auth_only = AuditService::query(&db, Some("auth."), 100).await.unwrap();
        assert_eq!(auth_only.len(), 2);

        let failed = auth_only
            .iter()
            .find(|e| e.action == actions::LOGIN_FAILED)
            .unwrap();
        assert!(!failed.success);
        assert!(failed.details.contains("invalid_credentials"));
    }

    #[tokio::test]
    async fn test_query_limit() {
        let (db, _guard) = test_db().await;

        for _ in 0..5 {
            AuditService::log(&db, actions::LOGIN_FAILED, AuditEvent::failed()).await;
        }
        let limited = AuditService::query(&db, None, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }
}
