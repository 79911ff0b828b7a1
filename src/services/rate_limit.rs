use chrono::{Duration, Utc};

use crate::db::Database;

/// Persistent sliding-window rate limiter.
///
/// Attempt rows survive process restarts and are shared across instances.
/// Policy is fail-open: an unreachable store must not turn the abuse gate
/// into an availability outage.
pub struct RateLimitService;

/// Shared window for the auth-flow limit types.
pub const WINDOW_SECONDS: u64 = 300;
pub const LOGIN_MAX_ATTEMPTS: i64 = 5;
pub const TOTP_MAX_ATTEMPTS: i64 = 3; // stricter for second-factor guesses
pub const PASSKEY_MAX_ATTEMPTS: i64 = 5;

/// Records older than this are dead weight and swept by cleanup.
const SWEEP_HORIZON_SECONDS: i64 = 3600;

impl RateLimitService {
    /// Returns (allowed, remaining attempts).
    pub async fn check(
        db: &Database,
        identifier: &str,
        limit_type: &str,
        max_attempts: i64,
        window_seconds: u64,
    ) -> (bool, i64) {
        let window_start =
            (Utc::now() - Duration::seconds(window_seconds as i64)).to_rfc3339();

        let count: Result<(i64,), sqlx::Error> = sqlx::query_as(
            "SELECT COUNT(*) FROM rate_limits WHERE identifier = ? AND limit_type = ? AND timestamp >= ?",
        )
        .bind(identifier)
        .bind(limit_type)
        .bind(&window_start)
        .fetch_one(db.pool())
        .await;

        match count {
            Ok((count,)) => {
                let remaining = (max_attempts - count).max(0);
                (count < max_attempts, remaining)
            }
            Err(e) => {
                tracing::warn!("Rate limit check error, failing open: {:?}", e);
                (true, max_attempts)
            }
        }
    }

    /// On success, reset the counter for the pair; on failure, append one
    /// attempt row. Store errors are swallowed.
    pub async fn record(db: &Database, identifier: &str, limit_type: &str, success: bool) {
        let result = if success {
            sqlx::query("DELETE FROM rate_limits WHERE identifier = ? AND limit_type = ?")
                .bind(identifier)
                .bind(limit_type)
                .execute(db.pool())
                .await
        } else {
            sqlx::query(
                "INSERT INTO rate_limits (identifier, limit_type, timestamp) VALUES (?, ?, ?)",
            )
            .bind(identifier)
            .bind(limit_type)
            .bind(Utc::now().to_rfc3339())
            .execute(db.pool())
            .await
        };

        if let Err(e) = result {
            tracing::error!("Rate limit record error: {:?}", e);
        }
    }

    /// Delete attempt rows older than the sweep horizon. Idempotent; meant to
    /// be invoked by an external timer or the cleanup endpoint.
    pub async fn cleanup(db: &Database) -> u64 {
        let cutoff = (Utc::now() - Duration::seconds(SWEEP_HORIZON_SECONDS)).to_rfc3339();
        match sqlx::query("DELETE FROM rate_limits WHERE timestamp < ?")
            .bind(&cutoff)
            .execute(db.pool())
            .await
        {
            Ok(r) => r.rows_affected(),
            Err(e) => {
                tracing::warn!("Rate limit cleanup error: {:?}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::test_db;

    #[tokio::test]
    async fn test_allows_up_to_max_attempts() {
        let (db, _guard) = test_db().await;

        for i in 0..3 {
            let (allowed, remaining) =
                RateLimitService::check(&db, "198.51.100.1", "login", 3, 300).await;
            assert!(allowed, "attempt {} should be allowed", i);
            assert_eq!(remaining, 3 - i);
            RateLimitService::record(&db, "198.51.100.1", "login", false).await;
        }

        let (allowed, remaining) =
            RateLimitService::check(&db, "198.51.100.1", "login", 3, 300).await;
        assert!(!allowed);
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn test_success_resets_counter() {
        let (db, _guard) = test_db().await;

        for _ in 0..3 {
            RateLimitService::record(&db, "198.51.100.2", "login", false).await;
        }
        let (allowed, _) = RateLimitService::check(&db, "198.51.100.2", "login", 3, 300).await;
        assert!(!allowed);

        RateLimitService::record(&db, "198.51.100.2", "login", true).await;
        let (allowed, remaining) =
            RateLimitService::check(&db, "198.51.100.2", "login", 3, 300).await;
        assert!(allowed);
        assert_eq!(remaining, 3);
    }

    #[tokio::test]
    async fn test_limit_types_are_independent() {
        let (db, _guard) = test_db().await;

        for _ in 0..3 {
            RateLimitService::record(&db, "198.51.100.3", "totp", false).await;
        }
        let (allowed, _) = RateLimitService::check(&db, "198.51.100.3", "totp", 3, 300).await;
        assert!(!allowed);

        let (allowed, _) = RateLimitService::check(&db, "198.51.100.3", "login", 5, 300).await;
        assert!(allowed);
    }

    #[tokio::test]
    async fn test_window_excludes_old_attempts() {
        let (db, _guard) = test_db().await;

        // Insert an attempt stamped outside the window.
        let stale = (Utc::now() - Duration::seconds(400)).to_rfc3339();
        sqlx::query("INSERT INTO rate_limits (identifier, limit_type, timestamp) VALUES (?, ?, ?)")
            .bind("198.51.100.4")
            .bind("login")
            .bind(&stale)
            .execute(db.pool())
            .await
            .unwrap();

        let (allowed, remaining) =
            RateLimitService::check(&db, "198.51.100.4", "login", 1, 300).await;
        assert!(allowed);
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn test_cleanup_sweeps_old_rows_only() {
        let (db, _guard) = test_db().await;

        let stale = (Utc::now() - Duration::seconds(7200)).to_rfc3339();
        sqlx::query("INSERT INTO rate_limits (identifier, limit_type, timestamp) VALUES (?, ?, ?)")
            .bind("198.51.100.5")
            .bind("login")
            .bind(&stale)
            .execute(db.pool())
            .await
            .unwrap();
        RateLimitService::record(&db, "198.51.100.5", "login", false).await;

        let deleted = RateLimitService::cleanup(&db).await;
        assert_eq!(deleted, 1);

        let (_, remaining) = RateLimitService::check(&db, "198.51.100.5", "login", 5, 300).await;
        assert_eq!(remaining, 4);
    }
}
