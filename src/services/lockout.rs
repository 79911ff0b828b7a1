use chrono::{DateTime, Duration, Utc};

use crate::db::Database;

/// Per-account lockout tracker.
///
/// A second, coarser anti-abuse layer on top of IP rate limiting: it protects
/// a single account even when an attacker rotates source addresses. Like the
/// rate limiter, it fails open on store errors.
pub struct LockoutService;

pub const MAX_FAILURES_BEFORE_LOCKOUT: i64 = 10;
pub const LOCKOUT_DURATION_MINUTES: i64 = 30;

impl LockoutService {
    /// Returns (locked, unlock time). Expired lockout rows are deleted
    /// opportunistically on read.
    pub async fn check(db: &Database, email: &str) -> (bool, Option<DateTime<Utc>>) {
        let row: Result<Option<(String,)>, sqlx::Error> =
            sqlx::query_as("SELECT unlock_at FROM account_lockouts WHERE email = ?")
                .bind(email)
                .fetch_optional(db.pool())
                .await;

        let unlock_at = match row {
            Ok(Some((unlock_at,))) => unlock_at,
            Ok(None) => return (false, None),
            Err(e) => {
                tracing::error!("Account lockout check error: {:?}", e);
                return (false, None);
            }
        };

        let unlock_at = match DateTime::parse_from_rfc3339(&unlock_at) {
            Ok(t) => t.with_timezone(&Utc),
            Err(_) => {
                tracing::error!("Malformed unlock_at for {}", email);
                return (false, None);
            }
        };

        if Utc::now() < unlock_at {
            return (true, Some(unlock_at));
        }

        // Lockout expired; self-expiring row is removed on the read path.
        if let Err(e) = sqlx::query("DELETE FROM account_lockouts WHERE email = ?")
            .bind(email)
            .execute(db.pool())
            .await
        {
            tracing::warn!("Expired lockout delete error: {:?}", e);
        }
        (false, None)
    }

    /// Increment the failure counter; on crossing the threshold, replace the
    /// counter with a timed lockout row.
    pub async fn increment_failure(
        db: &Database,
        email: &str,
        max_failures: i64,
        lockout_minutes: i64,
    ) {
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            r#"
            INSERT INTO login_failures (email, count, last_attempt) VALUES (?, 1, ?)
            ON CONFLICT(email) DO UPDATE SET count = count + 1, last_attempt = excluded.last_attempt
            "#,
        )
        .bind(email)
        .bind(&now)
        .execute(db.pool())
        .await;

        if let Err(e) = result {
            tracing::error!("Failure count increment error: {:?}", e);
            return;
        }

        let count: i64 =
            match sqlx::query_scalar("SELECT count FROM login_failures WHERE email = ?")
                .bind(email)
                .fetch_one(db.pool())
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failure count read error: {:?}", e);
                    return;
                }
            };

        if count >= max_failures {
            let unlock_at = (Utc::now() + Duration::minutes(lockout_minutes)).to_rfc3339();
            let result = sqlx::query(
                r#"
                INSERT INTO account_lockouts (email, locked_at, unlock_at) VALUES (?, ?, ?)
                ON CONFLICT(email) DO UPDATE SET locked_at = excluded.locked_at, unlock_at = excluded.unlock_at
                "#,
            )
            .bind(email)
            .bind(&now)
            .bind(&unlock_at)
            .execute(db.pool())
            .await;

            if let Err(e) = result {
                tracing::error!("Lockout insert error: {:?}", e);
                return;
            }

            if let Err(e) = sqlx::query("DELETE FROM login_failures WHERE email = ?")
                .bind(email)
                .execute(db.pool())
                .await
            {
                tracing::warn!("Failure counter reset error: {:?}", e);
            }

            tracing::warn!("Account locked until {}: {}", unlock_at, email);
        }
    }

    /// Clear the failure counter. Called on any successful primary-credential
    /// verification, independent of the MFA outcome.
    pub async fn clear_failures(db: &Database, email: &str) {
        if let Err(e) = sqlx::query("DELETE FROM login_failures WHERE email = ?")
            .bind(email)
            .execute(db.pool())
            .await
        {
            tracing::error!("Clear failure count error: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;

    #[tokio::test]
    async fn test_locks_after_threshold() {
        let (db, _guard) = test_db().await;

        for _ in 0..2 {
            LockoutService::increment_failure(&db, "a@x.com", 3, 30).await;
        }
        let (locked, _) = LockoutService::check(&db, "a@x.com").await;
        assert!(!locked);

        LockoutService::increment_failure(&db, "a@x.com", 3, 30).await;
        let (locked, unlock_at) = LockoutService::check(&db, "a@x.com").await;
        assert!(locked);
        assert!(unlock_at.unwrap() > Utc::now());

        // Counter was replaced by the lockout row.
        let counter: Option<i64> =
            sqlx::query_scalar("SELECT count FROM login_failures WHERE email = ?")
                .bind("a@x.com")
                .fetch_optional(db.pool())
                .await
                .unwrap();
        assert!(counter.is_none());
    }

    #[tokio::test]
    async fn test_clear_resets_counter() {
        let (db, _guard) = test_db().await;

        LockoutService::increment_failure(&db, "b@x.com", 3, 30).await;
        LockoutService::increment_failure(&db, "b@x.com", 3, 30).await;
        LockoutService::clear_failures(&db, "b@x.com").await;

        // Two more failures are below the threshold again.
        LockoutService::increment_failure(&db, "b@x.com", 3, 30).await;
        LockoutService::increment_failure(&db, "b@x.com", 3, 30).await;
        let (locked, _) = LockoutService::check(&db, "b@x.com").await;
        assert!(!locked);
    }

    #[tokio::test]
    async fn test_expired_lockout_is_removed_on_read() {
        let (db, _guard) = test_db().await;

        let past = (Utc::now() - Duration::minutes(1)).to_rfc3339();
        sqlx::query("INSERT INTO account_lockouts (email, locked_at, unlock_at) VALUES (?, ?, ?)")
            .bind("c@x.com")
            .bind(&past)
            .bind(&past)
            .execute(db.pool())
            .await
            .unwrap();

        let (locked, _) = LockoutService::check(&db, "c@x.com").await;
        assert!(!locked);

        let remaining: Option<String> =
            sqlx::query_scalar("SELECT email FROM account_lockouts WHERE email = ?")
                .bind("c@x.com")
                .fetch_optional(db.pool())
                .await
                .unwrap();
        assert!(remaining.is_none());
    }

    #[tokio::test]
    async fn test_unrelated_accounts_unaffected() {
        let (db, _guard) = test_db().await;

        for _ in 0..3 {
            LockoutService::increment_failure(&db, "d@x.com", 3, 30).await;
        }
        let (locked, _) = LockoutService::check(&db, "d@x.com").await;
        assert!(locked);
        let (locked, _) = LockoutService::check(&db, "e@x.com").await;
        assert!(!locked);
    }
}
