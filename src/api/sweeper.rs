//! Periodic reclamation of expired authentication state.
//!
//! Expired sessions, refresh tokens, pending 2FA setups, reset and security
//! codes are never purged on the request path; this task sweeps them on a
//! fixed cadence, along with stale login attempts and resolved alerts.

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, info_span, Instrument};

#[derive(Clone, Copy, Debug)]
pub struct SweeperConfig {
    interval: Duration,
    attempt_retention_days: i64,
    alert_retention_days: i64,
}

impl SweeperConfig {
    /// Default sweeper config: hourly sweep, 90 days of login attempts,
    /// 180 days of resolved alerts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            attempt_retention_days: 90,
            alert_retention_days: 180,
        }
    }

    #[must_use]
    pub fn with_interval_seconds(mut self, seconds: u64) -> Self {
        self.interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_attempt_retention_days(mut self, days: i64) -> Self {
        self.attempt_retention_days = days;
        self
    }

    #[must_use]
    pub fn with_alert_retention_days(mut self, days: i64) -> Self {
        self.alert_retention_days = days;
        self
    }

    /// Clamp degenerate values so the sweeper never spins or drops history.
    #[must_use]
    pub fn normalize(self) -> Self {
        Self {
            interval: if self.interval < Duration::from_secs(60) {
                Duration::from_secs(60)
            } else {
                self.interval
            },
            attempt_retention_days: self.attempt_retention_days.max(1),
            alert_retention_days: self.alert_retention_days.max(1),
        }
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn attempt_retention_days(&self) -> i64 {
        self.attempt_retention_days
    }

    #[must_use]
    pub fn alert_retention_days(&self) -> i64 {
        self.alert_retention_days
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the background sweep loop.
pub fn spawn_sweeper(pool: PgPool, config: SweeperConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();

        loop {
            if let Err(err) = sweep_once(&pool, &config).await {
                error!("sweep failed: {err}");
            }

            sleep(config.interval()).await;
        }
    })
}

async fn sweep_once(pool: &PgPool, config: &SweeperConfig) -> Result<()> {
    let sessions = delete_rows(
        pool,
        "DELETE FROM user_sessions WHERE expires_at <= NOW()",
    )
    .await?;
    let tokens = delete_rows(
        pool,
        "DELETE FROM refresh_tokens WHERE expires_at <= NOW()",
    )
    .await?;
    let codes = clear_expired_codes(pool).await?;
    let attempts = prune_by_age(
        pool,
        "DELETE FROM login_attempts WHERE created_at < NOW() - ($1 * INTERVAL '1 day')",
        config.attempt_retention_days(),
    )
    .await?;
    let alerts = prune_by_age(
        pool,
        "DELETE FROM security_alerts WHERE resolved AND created_at < NOW() - ($1 * INTERVAL '1 day')",
        config.alert_retention_days(),
    )
    .await?;

    if sessions + tokens + codes + attempts + alerts > 0 {
        info!(
            sessions,
            tokens, codes, attempts, alerts, "swept expired auth state"
        );
    }

    Ok(())
}

async fn delete_rows(pool: &PgPool, query: &'static str) -> Result<u64> {
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .execute(pool)
        .instrument(span)
        .await
        .context("sweep delete failed")?;
    Ok(result.rows_affected())
}

async fn prune_by_age(pool: &PgPool, query: &'static str, days: i64) -> Result<u64> {
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(days)
        .execute(pool)
        .instrument(span)
        .await
        .context("sweep prune failed")?;
    Ok(result.rows_affected())
}

/// Null out lapsed pending-TOTP, reset, and security codes in one pass.
async fn clear_expired_codes(pool: &PgPool) -> Result<u64> {
    let query = r"
        UPDATE users
        SET totp_pending_secret = CASE
                WHEN totp_pending_expires_at <= NOW() THEN NULL
                ELSE totp_pending_secret END,
            totp_pending_expires_at = CASE
                WHEN totp_pending_expires_at <= NOW() THEN NULL
                ELSE totp_pending_expires_at END,
            reset_code_hash = CASE
                WHEN reset_code_expires_at <= NOW() THEN NULL
                ELSE reset_code_hash END,
            reset_code_expires_at = CASE
                WHEN reset_code_expires_at <= NOW() THEN NULL
                ELSE reset_code_expires_at END,
            security_code_hash = CASE
                WHEN security_code_expires_at <= NOW() THEN NULL
                ELSE security_code_hash END,
            security_code_expires_at = CASE
                WHEN security_code_expires_at <= NOW() THEN NULL
                ELSE security_code_expires_at END,
            updated_at = NOW()
        WHERE totp_pending_expires_at <= NOW()
           OR reset_code_expires_at <= NOW()
           OR security_code_expires_at <= NOW()
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .execute(pool)
        .instrument(span)
        .await
        .context("sweep code expiry failed")?;
    Ok(result.rows_affected())
}
