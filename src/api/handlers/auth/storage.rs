//! Database helpers for accounts, sessions, and security events.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use tracing::Instrument;
use uuid::Uuid;

use super::utils::is_unique_violation;
use crate::security::PriorLogin;

/// Outcome when attempting to create a new account.
#[derive(Debug)]
pub(super) enum SignupOutcome {
    Created,
    DuplicateVerified,
    DuplicatePending { user_id: Uuid },
    /// The account row was rolled back because the activation email could
    /// not be queued. Nothing persists; the caller may retry.
    MessagingFailed,
}

/// Outcome of an atomic refresh token rotation.
#[derive(Debug)]
pub(super) enum RotateOutcome {
    Rotated(RefreshRecord),
    Expired,
    Missing,
    /// The owning account is locked; the presented token was left unburned.
    Locked,
}

/// How to treat an account lock at authentication time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum LockDisposition {
    Unlocked,
    /// Timed lock whose window has passed; clear it and let the caller in.
    Lapsed,
    Held,
}

pub(super) fn lock_disposition(
    locked: bool,
    locked_until: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> LockDisposition {
    if !locked {
        return LockDisposition::Unlocked;
    }
    match locked_until {
        Some(until) if until <= now => LockDisposition::Lapsed,
        // No expiry means the lock holds until lifted by an operator.
        _ => LockDisposition::Held,
    }
}

/// Row claimed from `refresh_tokens` during rotation or logout.
#[derive(Debug)]
pub(super) struct RefreshRecord {
    pub(super) user_id: Uuid,
    pub(super) session_id: Option<Uuid>,
    pub(super) device: String,
    pub(super) origin: String,
    pub(super) expires_at: DateTime<Utc>,
}

pub(super) struct UserRecord {
    pub(super) id: Uuid,
    pub(super) email: String,
    pub(super) password_hash: Option<String>,
    pub(super) display_name: String,
    pub(super) avatar_url: Option<String>,
    pub(super) email_verified_at: Option<DateTime<Utc>>,
    pub(super) locked: bool,
    pub(super) locked_until: Option<DateTime<Utc>>,
    pub(super) failed_logins: i32,
    pub(super) totp_secret: Option<String>,
    pub(super) totp_enabled: bool,
    pub(super) totp_pending_secret: Option<String>,
    pub(super) totp_pending_expires_at: Option<DateTime<Utc>>,
    pub(super) reset_code_hash: Option<Vec<u8>>,
    pub(super) reset_code_expires_at: Option<DateTime<Utc>>,
    pub(super) security_code_hash: Option<Vec<u8>>,
    pub(super) security_code_expires_at: Option<DateTime<Utc>>,
    pub(super) max_sessions: i32,
    pub(super) tz_offset_minutes: i32,
}

pub(super) struct SessionRow {
    pub(super) id: Uuid,
    pub(super) device: String,
    pub(super) origin: String,
    pub(super) created_at: DateTime<Utc>,
    pub(super) last_active_at: DateTime<Utc>,
    pub(super) expires_at: DateTime<Utc>,
}

pub(super) struct BackupCodeRow {
    pub(super) id: Uuid,
    pub(super) code_hash: String,
}

pub(super) struct NewSession<'a> {
    pub(super) user_id: Uuid,
    pub(super) device: &'a str,
    pub(super) origin: &'a str,
    pub(super) refresh_token_hash: &'a [u8],
    pub(super) refresh_ttl_seconds: i64,
    pub(super) max_sessions: i32,
}

pub(super) struct SuspiciousLogin<'a> {
    pub(super) user_id: Uuid,
    pub(super) email: &'a str,
    pub(super) origin: &'a str,
    pub(super) device: &'a str,
    pub(super) location: &'a str,
    pub(super) patterns: &'a [String],
    pub(super) code_hash: &'a [u8],
    pub(super) code_ttl_seconds: i64,
    pub(super) lock_seconds: Option<i64>,
    pub(super) template: &'a str,
    pub(super) payload: &'a serde_json::Value,
}

pub(super) struct FederatedLink<'a> {
    pub(super) provider: &'a str,
    pub(super) external_id: &'a str,
    pub(super) email: &'a str,
    pub(super) display_name: &'a str,
    pub(super) avatar_url: Option<&'a str>,
    pub(super) default_role: &'a str,
}

pub(super) struct FederatedUser {
    pub(super) user_id: Uuid,
    pub(super) created: bool,
}

fn user_from_row(row: &PgRow) -> UserRecord {
    UserRecord {
        id: row.get("id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        display_name: row.get("display_name"),
        avatar_url: row.get("avatar_url"),
        email_verified_at: row.get("email_verified_at"),
        locked: row.get("locked"),
        locked_until: row.get("locked_until"),
        failed_logins: row.get("failed_logins"),
        totp_secret: row.get("totp_secret"),
        totp_enabled: row.get("totp_enabled"),
        totp_pending_secret: row.get("totp_pending_secret"),
        totp_pending_expires_at: row.get("totp_pending_expires_at"),
        reset_code_hash: row.get("reset_code_hash"),
        reset_code_expires_at: row.get("reset_code_expires_at"),
        security_code_hash: row.get("security_code_hash"),
        security_code_expires_at: row.get("security_code_expires_at"),
        max_sessions: row.get("max_sessions"),
        tz_offset_minutes: row.get("tz_offset_minutes"),
    }
}

pub(super) async fn fetch_user_by_email(pool: &PgPool, email: &str) -> Result<Option<UserRecord>> {
    let query = r"
        SELECT id, email, password_hash, display_name, avatar_url,
               email_verified_at, locked, locked_until, failed_logins,
               totp_secret, totp_enabled, totp_pending_secret, totp_pending_expires_at,
               reset_code_hash, reset_code_expires_at,
               security_code_hash, security_code_expires_at,
               max_sessions, tz_offset_minutes
        FROM users
        WHERE email = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(email)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by email")?;

    Ok(row.map(|row| user_from_row(&row)))
}

pub(super) async fn fetch_user_by_id(pool: &PgPool, user_id: Uuid) -> Result<Option<UserRecord>> {
    let query = r"
        SELECT id, email, password_hash, display_name, avatar_url,
               email_verified_at, locked, locked_until, failed_logins,
               totp_secret, totp_enabled, totp_pending_secret, totp_pending_expires_at,
               reset_code_hash, reset_code_expires_at,
               security_code_hash, security_code_expires_at,
               max_sessions, tz_offset_minutes
        FROM users
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup user by id")?;

    Ok(row.map(|row| user_from_row(&row)))
}

/// Create an account and queue its activation email in one transaction.
///
/// The caller pre-generates the id so the activation token can be minted
/// before the row exists.
pub(super) async fn create_user_with_activation(
    pool: &PgPool,
    user_id: Uuid,
    email: &str,
    password_hash: &str,
    display_name: &str,
    template: &str,
    payload: &serde_json::Value,
) -> Result<SignupOutcome> {
    let mut tx = pool.begin().await.context("begin signup transaction")?;

    let query = r"
        INSERT INTO users (id, email, password_hash, display_name)
        VALUES ($1, $2, $3, $4)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let inserted = sqlx::query(query)
        .bind(user_id)
        .bind(email)
        .bind(password_hash)
        .bind(display_name)
        .execute(&mut *tx)
        .instrument(span)
        .await;

    if let Err(err) = inserted {
        if !is_unique_violation(&err) {
            return Err(err).context("failed to insert user");
        }
        let _ = tx.rollback().await;

        let query = "SELECT id, email_verified_at FROM users WHERE email = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email)
            .fetch_one(pool)
            .instrument(span)
            .await
            .context("failed to lookup conflicting user")?;

        let verified: Option<DateTime<Utc>> = row.get("email_verified_at");
        if verified.is_some() {
            return Ok(SignupOutcome::DuplicateVerified);
        }
        return Ok(SignupOutcome::DuplicatePending {
            user_id: row.get("id"),
        });
    }

    if let Err(err) = enqueue_email_tx(&mut tx, email, template, payload).await {
        let _ = tx.rollback().await;
        tracing::error!("failed to queue activation email: {err}");
        return Ok(SignupOutcome::MessagingFailed);
    }

    tx.commit().await.context("commit signup transaction")?;

    Ok(SignupOutcome::Created)
}

/// Verify the address and attach the default role, both idempotent.
pub(super) async fn mark_email_verified(
    pool: &PgPool,
    user_id: Uuid,
    default_role: &str,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin verify transaction")?;

    let query = r"
        UPDATE users
        SET email_verified_at = COALESCE(email_verified_at, NOW()),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to mark email verified")?;

    let query = r"
        INSERT INTO user_roles (user_id, role_id)
        SELECT $1, id FROM roles WHERE name = $2
        ON CONFLICT DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(default_role)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to assign default role")?;

    tx.commit().await.context("commit verify transaction")?;
    Ok(())
}

/// Clear a lapsed lock along with the failure counter.
pub(super) async fn clear_lock(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let query = r"
        UPDATE users
        SET locked = FALSE,
            locked_until = NULL,
            failed_logins = 0,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to clear account lock")?;
    Ok(())
}

/// Count a failed password attempt and lock the account once the limit is
/// reached, in a single statement so concurrent failures cannot skip the
/// lock.
pub(super) async fn record_failed_password_login(
    pool: &PgPool,
    user_id: Uuid,
    limit: i32,
    lockout_seconds: i64,
) -> Result<i32> {
    let query = r"
        UPDATE users
        SET failed_logins = failed_logins + 1,
            locked = CASE WHEN failed_logins + 1 >= $2 THEN TRUE ELSE locked END,
            locked_until = CASE
                WHEN failed_logins + 1 >= $2 THEN NOW() + ($3 * INTERVAL '1 second')
                ELSE locked_until
            END,
            updated_at = NOW()
        WHERE id = $1
        RETURNING failed_logins
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(limit)
        .bind(lockout_seconds)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to record failed login")?;
    Ok(row.get("failed_logins"))
}

pub(super) async fn linked_providers(pool: &PgPool, user_id: Uuid) -> Result<Vec<String>> {
    let query = r"
        SELECT provider
        FROM federated_identities
        WHERE user_id = $1
        ORDER BY provider
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list federated identities")?;
    Ok(rows.iter().map(|row| row.get("provider")).collect())
}

/// Baseline for anomaly comparison: the most recent successful attempt.
pub(super) async fn latest_successful_attempt(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<Option<PriorLogin>> {
    let query = r"
        SELECT origin, device, location
        FROM login_attempts
        WHERE user_id = $1
          AND successful
        ORDER BY created_at DESC
        LIMIT 1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_optional(pool)
        .instrument(span)
        .await
        .context("failed to lookup latest successful attempt")?;

    Ok(row.map(|row| PriorLogin {
        origin: row.get("origin"),
        device: row.get("device"),
        location: row.get("location"),
    }))
}

/// Attempts of any outcome inside the burst window.
pub(super) async fn count_recent_attempts(
    pool: &PgPool,
    user_id: Uuid,
    window_seconds: i64,
) -> Result<i64> {
    let query = r"
        SELECT COUNT(*) AS attempts
        FROM login_attempts
        WHERE user_id = $1
          AND created_at > NOW() - ($2 * INTERVAL '1 second')
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .bind(window_seconds)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to count recent attempts")?;
    Ok(row.get("attempts"))
}

pub(super) async fn record_login_attempt(
    pool: &PgPool,
    user_id: Uuid,
    origin: &str,
    device: &str,
    location: &str,
    successful: bool,
    patterns: &[String],
) -> Result<()> {
    let query = r"
        INSERT INTO login_attempts (user_id, origin, device, location, successful, patterns)
        VALUES ($1, $2, $3, $4, $5, $6)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(origin)
        .bind(device)
        .bind(location)
        .bind(successful)
        .bind(patterns)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to record login attempt")?;
    Ok(())
}

/// Persist everything a suspicious login produces in one transaction:
/// the alert, the flagged attempt, the step-up code, the optional
/// escalation lock, and the notification email.
pub(super) async fn record_suspicious_login(
    pool: &PgPool,
    suspicious: SuspiciousLogin<'_>,
) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("begin suspicious login transaction")?;

    let details = serde_json::json!({
        "patterns": suspicious.patterns,
        "origin": suspicious.origin,
        "device": suspicious.device,
        "location": suspicious.location,
    });
    let details_text =
        serde_json::to_string(&details).context("failed to serialize alert details")?;

    let query = r"
        INSERT INTO security_alerts (user_id, alert_type, details)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(suspicious.user_id)
        .bind(crate::security::ALERT_SUSPICIOUS_LOGIN)
        .bind(details_text)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert security alert")?;

    let query = r"
        INSERT INTO login_attempts (user_id, origin, device, location, successful, patterns)
        VALUES ($1, $2, $3, $4, FALSE, $5)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(suspicious.user_id)
        .bind(suspicious.origin)
        .bind(suspicious.device)
        .bind(suspicious.location)
        .bind(suspicious.patterns)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to record suspicious attempt")?;

    let query = r"
        UPDATE users
        SET security_code_hash = $2,
            security_code_expires_at = NOW() + ($3 * INTERVAL '1 second'),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(suspicious.user_id)
        .bind(suspicious.code_hash)
        .bind(suspicious.code_ttl_seconds)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to store security code")?;

    if let Some(lock_seconds) = suspicious.lock_seconds {
        let query = r"
            UPDATE users
            SET locked = TRUE,
                locked_until = NOW() + ($2 * INTERVAL '1 second'),
                updated_at = NOW()
            WHERE id = $1
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(suspicious.user_id)
            .bind(lock_seconds)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to lock suspicious account")?;
    }

    enqueue_email_tx(&mut tx, suspicious.email, suspicious.template, suspicious.payload).await?;

    tx.commit()
        .await
        .context("commit suspicious login transaction")?;
    Ok(())
}

/// Clear the step-up code and resolve the newest open alert.
pub(super) async fn clear_security_challenge(
    pool: &PgPool,
    user_id: Uuid,
    note: &str,
) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("begin security challenge transaction")?;

    let query = r"
        UPDATE users
        SET security_code_hash = NULL,
            security_code_expires_at = NULL,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to clear security code")?;

    let query = r"
        UPDATE security_alerts
        SET resolved = TRUE,
            resolution_note = $3
        WHERE id = (
            SELECT id
            FROM security_alerts
            WHERE user_id = $1
              AND alert_type = $2
              AND NOT resolved
            ORDER BY created_at DESC
            LIMIT 1
        )
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(crate::security::ALERT_SUSPICIOUS_LOGIN)
        .bind(note)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to resolve security alert")?;

    tx.commit()
        .await
        .context("commit security challenge transaction")?;
    Ok(())
}

/// Create a session plus its refresh token, evicting the least recently
/// active sessions over the per-account cap. Evicted sessions lose their
/// refresh tokens in the same transaction.
pub(super) async fn create_session(pool: &PgPool, new: NewSession<'_>) -> Result<Uuid> {
    let mut tx = pool.begin().await.context("begin session transaction")?;

    let query = r"
        INSERT INTO user_sessions (user_id, device, origin, expires_at)
        VALUES ($1, $2, $3, NOW() + ($4 * INTERVAL '1 second'))
        RETURNING id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(new.user_id)
        .bind(new.device)
        .bind(new.origin)
        .bind(new.refresh_ttl_seconds)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert session")?;
    let session_id: Uuid = row.get("id");

    let query = r"
        SELECT id
        FROM user_sessions
        WHERE user_id = $1
        ORDER BY last_active_at DESC, created_at DESC
        OFFSET $2
        FOR UPDATE
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let evicted: Vec<Uuid> = sqlx::query(query)
        .bind(new.user_id)
        .bind(i64::from(new.max_sessions.max(1)))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to select sessions over cap")?
        .iter()
        .map(|row| row.get("id"))
        .collect();

    if !evicted.is_empty() {
        let query = r"
            UPDATE refresh_tokens
            SET revoked_at = NOW()
            WHERE session_id = ANY($1)
              AND revoked_at IS NULL
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&evicted)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to revoke evicted refresh tokens")?;

        let query = "DELETE FROM user_sessions WHERE id = ANY($1)";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&evicted)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to delete evicted sessions")?;
    }

    let query = r"
        INSERT INTO refresh_tokens (token_hash, user_id, session_id, device, origin, expires_at)
        VALUES ($1, $2, $3, $4, $5, NOW() + ($6 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(new.refresh_token_hash)
        .bind(new.user_id)
        .bind(session_id)
        .bind(new.device)
        .bind(new.origin)
        .bind(new.refresh_ttl_seconds)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert refresh token")?;

    tx.commit().await.context("commit session transaction")?;
    Ok(session_id)
}

/// Atomically claim the presented token and insert its successor.
///
/// The claim revokes the row even when the token turns out to be expired,
/// so a stale token can never be claimed twice. A held account lock aborts
/// before the claim, leaving the token intact for after the lock lifts; a
/// lapsed timed lock is cleared in the same transaction.
pub(super) async fn rotate_refresh_token(
    pool: &PgPool,
    old_token_hash: &[u8],
    new_token_hash: &[u8],
    refresh_ttl_seconds: i64,
) -> Result<RotateOutcome> {
    let mut tx = pool.begin().await.context("begin rotation transaction")?;

    let query = r"
        SELECT u.id AS user_id, u.locked, u.locked_until
        FROM refresh_tokens t
        JOIN users u ON u.id = t.user_id
        WHERE t.token_hash = $1
          AND t.revoked_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let owner = sqlx::query(query)
        .bind(old_token_hash)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to look up refresh token owner")?;

    let Some(owner) = owner else {
        let _ = tx.rollback().await;
        return Ok(RotateOutcome::Missing);
    };

    match lock_disposition(owner.get("locked"), owner.get("locked_until"), Utc::now()) {
        LockDisposition::Held => {
            let _ = tx.rollback().await;
            return Ok(RotateOutcome::Locked);
        }
        LockDisposition::Lapsed => {
            let user_id: Uuid = owner.get("user_id");
            let query = r"
                UPDATE users
                SET locked = FALSE,
                    locked_until = NULL,
                    failed_logins = 0,
                    updated_at = NOW()
                WHERE id = $1
            ";
            let span = tracing::info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(user_id)
                .execute(&mut *tx)
                .instrument(span)
                .await
                .context("failed to clear lapsed lock during rotation")?;
        }
        LockDisposition::Unlocked => {}
    }

    let query = r"
        UPDATE refresh_tokens
        SET revoked_at = NOW()
        WHERE token_hash = $1
          AND revoked_at IS NULL
        RETURNING user_id, session_id, device, origin, expires_at
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(old_token_hash)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to claim refresh token")?;

    let Some(row) = row else {
        let _ = tx.rollback().await;
        return Ok(RotateOutcome::Missing);
    };

    let record = RefreshRecord {
        user_id: row.get("user_id"),
        session_id: row.get("session_id"),
        device: row.get("device"),
        origin: row.get("origin"),
        expires_at: row.get("expires_at"),
    };

    if record.expires_at <= Utc::now() {
        // Keep the revocation: an expired token stays burned.
        tx.commit().await.context("commit expired claim")?;
        return Ok(RotateOutcome::Expired);
    }

    let Some(session_id) = record.session_id else {
        tx.commit().await.context("commit orphaned claim")?;
        return Ok(RotateOutcome::Missing);
    };

    let query = r"
        INSERT INTO refresh_tokens (token_hash, user_id, session_id, device, origin, expires_at)
        VALUES ($1, $2, $3, $4, $5, NOW() + ($6 * INTERVAL '1 second'))
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(new_token_hash)
        .bind(record.user_id)
        .bind(session_id)
        .bind(&record.device)
        .bind(&record.origin)
        .bind(refresh_ttl_seconds)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert rotated refresh token")?;

    let query = r"
        UPDATE user_sessions
        SET last_active_at = NOW(),
            expires_at = GREATEST(expires_at, NOW() + ($2 * INTERVAL '1 second'))
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(refresh_ttl_seconds)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to touch rotated session")?;

    tx.commit().await.context("commit rotation transaction")?;
    Ok(RotateOutcome::Rotated(record))
}

/// Revoke the presented refresh token and drop its session. Idempotent.
pub(super) async fn logout_session(pool: &PgPool, token_hash: &[u8]) -> Result<bool> {
    let mut tx = pool.begin().await.context("begin logout transaction")?;

    let query = r"
        UPDATE refresh_tokens
        SET revoked_at = NOW()
        WHERE token_hash = $1
          AND revoked_at IS NULL
        RETURNING session_id
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(token_hash)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to revoke refresh token")?;

    let Some(row) = row else {
        let _ = tx.rollback().await;
        return Ok(false);
    };

    let session_id: Option<Uuid> = row.get("session_id");
    if let Some(session_id) = session_id {
        let query = "DELETE FROM user_sessions WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(session_id)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to delete session")?;
    }

    tx.commit().await.context("commit logout transaction")?;
    Ok(true)
}

pub(super) async fn list_sessions(pool: &PgPool, user_id: Uuid) -> Result<Vec<SessionRow>> {
    let query = r"
        SELECT id, device, origin, created_at, last_active_at, expires_at
        FROM user_sessions
        WHERE user_id = $1
          AND expires_at > NOW()
        ORDER BY last_active_at DESC
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list sessions")?;

    Ok(rows
        .iter()
        .map(|row| SessionRow {
            id: row.get("id"),
            device: row.get("device"),
            origin: row.get("origin"),
            created_at: row.get("created_at"),
            last_active_at: row.get("last_active_at"),
            expires_at: row.get("expires_at"),
        })
        .collect())
}

/// Drop one session owned by the user and revoke its refresh tokens.
pub(super) async fn revoke_session(pool: &PgPool, user_id: Uuid, session_id: Uuid) -> Result<bool> {
    let mut tx = pool.begin().await.context("begin revoke transaction")?;

    let query = r"
        UPDATE refresh_tokens
        SET revoked_at = NOW()
        WHERE session_id = $1
          AND user_id = $2
          AND revoked_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(session_id)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to revoke session tokens")?;

    let query = "DELETE FROM user_sessions WHERE id = $1 AND user_id = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(session_id)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete session")?;

    tx.commit().await.context("commit revoke transaction")?;
    Ok(result.rows_affected() > 0)
}

/// Revoke every refresh token and drop every session for the user.
pub(super) async fn revoke_all_sessions(pool: &PgPool, user_id: Uuid) -> Result<u64> {
    let mut tx = pool.begin().await.context("begin revoke-all transaction")?;

    let query = r"
        UPDATE refresh_tokens
        SET revoked_at = NOW()
        WHERE user_id = $1
          AND revoked_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to revoke refresh tokens")?;

    let query = "DELETE FROM user_sessions WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete sessions")?;

    tx.commit().await.context("commit revoke-all transaction")?;
    Ok(result.rows_affected())
}

/// Role names and the union of their permissions, both sorted and deduped.
pub(super) async fn load_roles_and_permissions(
    pool: &PgPool,
    user_id: Uuid,
) -> Result<(Vec<String>, Vec<String>)> {
    let query = r"
        SELECT roles.name AS role, role_permissions.permission
        FROM user_roles
        JOIN roles ON roles.id = user_roles.role_id
        LEFT JOIN role_permissions ON role_permissions.role_id = roles.id
        WHERE user_roles.user_id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to load roles and permissions")?;

    let mut roles = BTreeSet::new();
    let mut permissions = BTreeSet::new();
    for row in &rows {
        let role: String = row.get("role");
        roles.insert(role);
        let permission: Option<String> = row.get("permission");
        if let Some(permission) = permission {
            permissions.insert(permission);
        }
    }

    Ok((
        roles.into_iter().collect(),
        permissions.into_iter().collect(),
    ))
}

/// Idempotently seed a role and its permission set.
pub(crate) async fn ensure_role(pool: &PgPool, name: &str, permissions: &[&str]) -> Result<()> {
    let mut tx = pool.begin().await.context("begin role transaction")?;

    let query = r"
        INSERT INTO roles (name)
        VALUES ($1)
        ON CONFLICT (name) DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(name)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert role")?;

    let query = "SELECT id FROM roles WHERE name = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(name)
        .fetch_one(&mut *tx)
        .instrument(span)
        .await
        .context("failed to lookup role id")?;
    let role_id: Uuid = row.get("id");

    let grants: Vec<String> = permissions.iter().map(ToString::to_string).collect();
    let query = r"
        INSERT INTO role_permissions (role_id, permission)
        SELECT $1, unnest($2::text[])
        ON CONFLICT DO NOTHING
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(role_id)
        .bind(&grants)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to insert role permissions")?;

    tx.commit().await.context("commit role transaction")?;
    Ok(())
}

pub(super) async fn store_reset_code(
    pool: &PgPool,
    user_id: Uuid,
    code_hash: &[u8],
    ttl_seconds: i64,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET reset_code_hash = $2,
            reset_code_expires_at = NOW() + ($3 * INTERVAL '1 second'),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(code_hash)
        .bind(ttl_seconds)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to store reset code")?;
    Ok(())
}

/// Apply a password reset: new hash, cleared codes and lock counters,
/// every session revoked, and the change notification queued, atomically.
pub(super) async fn reset_password(
    pool: &PgPool,
    user_id: Uuid,
    email: &str,
    new_password_hash: &str,
    template: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin reset transaction")?;

    let query = r"
        UPDATE users
        SET password_hash = $2,
            reset_code_hash = NULL,
            reset_code_expires_at = NULL,
            security_code_hash = NULL,
            security_code_expires_at = NULL,
            failed_logins = 0,
            locked = FALSE,
            locked_until = NULL,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(new_password_hash)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to update password")?;

    let query = r"
        UPDATE refresh_tokens
        SET revoked_at = NOW()
        WHERE user_id = $1
          AND revoked_at IS NULL
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to revoke refresh tokens")?;

    let query = "DELETE FROM user_sessions WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete sessions")?;

    enqueue_email_tx(&mut tx, email, template, payload).await?;

    tx.commit().await.context("commit reset transaction")?;
    Ok(())
}

pub(super) async fn store_pending_totp(
    pool: &PgPool,
    user_id: Uuid,
    secret: &str,
    ttl_seconds: i64,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET totp_pending_secret = $2,
            totp_pending_expires_at = NOW() + ($3 * INTERVAL '1 second'),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(secret)
        .bind(ttl_seconds)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to store pending totp secret")?;
    Ok(())
}

/// Promote the pending secret and replace the backup code set.
pub(super) async fn enable_totp(
    pool: &PgPool,
    user_id: Uuid,
    secret: &str,
    code_hashes: &[String],
) -> Result<()> {
    let mut tx = pool.begin().await.context("begin enable transaction")?;

    let query = r"
        UPDATE users
        SET totp_secret = $2,
            totp_enabled = TRUE,
            totp_pending_secret = NULL,
            totp_pending_expires_at = NULL,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(secret)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to enable totp")?;

    insert_backup_codes_tx(&mut tx, user_id, code_hashes).await?;

    tx.commit().await.context("commit enable transaction")?;
    Ok(())
}

pub(super) async fn disable_totp(pool: &PgPool, user_id: Uuid) -> Result<()> {
    let mut tx = pool.begin().await.context("begin disable transaction")?;

    let query = r"
        UPDATE users
        SET totp_secret = NULL,
            totp_enabled = FALSE,
            totp_pending_secret = NULL,
            totp_pending_expires_at = NULL,
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to disable totp")?;

    let query = "DELETE FROM backup_codes WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut *tx)
        .instrument(span)
        .await
        .context("failed to delete backup codes")?;

    tx.commit().await.context("commit disable transaction")?;
    Ok(())
}

pub(super) async fn replace_backup_codes(
    pool: &PgPool,
    user_id: Uuid,
    code_hashes: &[String],
) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("begin backup code transaction")?;
    insert_backup_codes_tx(&mut tx, user_id, code_hashes).await?;
    tx.commit().await.context("commit backup code transaction")?;
    Ok(())
}

async fn insert_backup_codes_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    code_hashes: &[String],
) -> Result<()> {
    let query = "DELETE FROM backup_codes WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to delete old backup codes")?;

    let query = r"
        INSERT INTO backup_codes (user_id, code_hash)
        SELECT $1, unnest($2::text[])
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(code_hashes)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert backup codes")?;
    Ok(())
}

pub(super) async fn list_backup_codes(pool: &PgPool, user_id: Uuid) -> Result<Vec<BackupCodeRow>> {
    let query = r"
        SELECT id, code_hash
        FROM backup_codes
        WHERE user_id = $1
        ORDER BY created_at
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(user_id)
        .fetch_all(pool)
        .instrument(span)
        .await
        .context("failed to list backup codes")?;

    Ok(rows
        .iter()
        .map(|row| BackupCodeRow {
            id: row.get("id"),
            code_hash: row.get("code_hash"),
        })
        .collect())
}

/// Burn one matched backup code. Single use comes from the deletion.
/// Burn a backup code. The delete is the claim: `false` means a concurrent
/// login already consumed the row, and the presented code must be rejected.
pub(super) async fn consume_backup_code(
    pool: &PgPool,
    user_id: Uuid,
    code_id: Uuid,
) -> Result<bool> {
    let query = "DELETE FROM backup_codes WHERE id = $1 AND user_id = $2";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "DELETE",
        db.statement = query
    );
    let result = sqlx::query(query)
        .bind(code_id)
        .bind(user_id)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to consume backup code")?;
    Ok(result.rows_affected() > 0)
}

pub(super) async fn count_backup_codes(pool: &PgPool, user_id: Uuid) -> Result<i64> {
    let query = "SELECT COUNT(*) AS remaining FROM backup_codes WHERE user_id = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(user_id)
        .fetch_one(pool)
        .instrument(span)
        .await
        .context("failed to count backup codes")?;
    Ok(row.get("remaining"))
}

enum LinkAttempt {
    Linked(FederatedUser),
    Race,
}

/// Attach a federated identity to its account, creating the account when
/// neither the identity nor the email exists yet. Unique-violation losers
/// retry once and land on the winner's rows.
pub(super) async fn link_or_create_federated(
    pool: &PgPool,
    link: FederatedLink<'_>,
) -> Result<FederatedUser> {
    for _ in 0..2 {
        match try_link_or_create(pool, &link).await? {
            LinkAttempt::Linked(user) => return Ok(user),
            LinkAttempt::Race => {}
        }
    }

    Err(anyhow!("conflicting federated identity updates"))
}

async fn try_link_or_create(pool: &PgPool, link: &FederatedLink<'_>) -> Result<LinkAttempt> {
    let mut tx = pool.begin().await.context("begin federated transaction")?;

    let query = r"
        SELECT user_id
        FROM federated_identities
        WHERE provider = $1
          AND external_id = $2
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let row = sqlx::query(query)
        .bind(link.provider)
        .bind(link.external_id)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to lookup federated identity")?;

    if let Some(row) = row {
        let user_id: Uuid = row.get("user_id");
        backfill_federated_profile(&mut tx, user_id, link).await?;
        tx.commit().await.context("commit federated transaction")?;
        return Ok(LinkAttempt::Linked(FederatedUser {
            user_id,
            created: false,
        }));
    }

    let query = "SELECT id FROM users WHERE email = $1";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let existing = sqlx::query(query)
        .bind(link.email)
        .fetch_optional(&mut *tx)
        .instrument(span)
        .await
        .context("failed to lookup user for federated link")?;

    let (user_id, created) = if let Some(row) = existing {
        (row.get("id"), false)
    } else {
        let query = r"
            INSERT INTO users (email, display_name, avatar_url, email_verified_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING id
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let inserted = sqlx::query(query)
            .bind(link.email)
            .bind(link.display_name)
            .bind(link.avatar_url)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await;

        match inserted {
            Ok(row) => (row.get("id"), true),
            Err(err) if is_unique_violation(&err) => {
                let _ = tx.rollback().await;
                return Ok(LinkAttempt::Race);
            }
            Err(err) => return Err(err).context("failed to insert federated user"),
        }
    };

    let query = r"
        INSERT INTO federated_identities (user_id, provider, external_id)
        VALUES ($1, $2, $3)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    let identity = sqlx::query(query)
        .bind(user_id)
        .bind(link.provider)
        .bind(link.external_id)
        .execute(&mut *tx)
        .instrument(span)
        .await;

    if let Err(err) = identity {
        if is_unique_violation(&err) {
            let _ = tx.rollback().await;
            return Ok(LinkAttempt::Race);
        }
        return Err(err).context("failed to insert federated identity");
    }

    if created {
        let query = r"
            INSERT INTO user_roles (user_id, role_id)
            SELECT $1, id FROM roles WHERE name = $2
            ON CONFLICT DO NOTHING
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(user_id)
            .bind(link.default_role)
            .execute(&mut *tx)
            .instrument(span)
            .await
            .context("failed to assign federated default role")?;
    } else {
        backfill_federated_profile(&mut tx, user_id, link).await?;
    }

    tx.commit().await.context("commit federated transaction")?;
    Ok(LinkAttempt::Linked(FederatedUser { user_id, created }))
}

/// Fill profile gaps from the provider without touching the password hash.
async fn backfill_federated_profile(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    user_id: Uuid,
    link: &FederatedLink<'_>,
) -> Result<()> {
    let query = r"
        UPDATE users
        SET avatar_url = COALESCE(avatar_url, $2),
            display_name = CASE WHEN display_name = '' THEN $3 ELSE display_name END,
            email_verified_at = COALESCE(email_verified_at, NOW()),
            updated_at = NOW()
        WHERE id = $1
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(user_id)
        .bind(link.avatar_url)
        .bind(link.display_name)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to backfill federated profile")?;
    Ok(())
}

pub(super) async fn enqueue_email(
    pool: &PgPool,
    to_email: &str,
    template: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let payload_text =
        serde_json::to_string(payload).context("failed to serialize email payload")?;

    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .execute(pool)
        .instrument(span)
        .await
        .context("failed to insert email outbox row")?;
    Ok(())
}

pub(super) async fn enqueue_email_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    to_email: &str,
    template: &str,
    payload: &serde_json::Value,
) -> Result<()> {
    let payload_text =
        serde_json::to_string(payload).context("failed to serialize email payload")?;

    let query = r"
        INSERT INTO email_outbox (to_email, template, payload_json)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(to_email)
        .bind(template)
        .bind(payload_text)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to insert email outbox row")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        lock_disposition, LockDisposition, RefreshRecord, RotateOutcome, SessionRow, SignupOutcome,
    };
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    #[test]
    fn signup_outcome_debug_names() {
        assert_eq!(format!("{:?}", SignupOutcome::Created), "Created");
        assert_eq!(
            format!("{:?}", SignupOutcome::DuplicateVerified),
            "DuplicateVerified"
        );
        let pending = SignupOutcome::DuplicatePending {
            user_id: Uuid::nil(),
        };
        assert!(format!("{pending:?}").starts_with("DuplicatePending"));
    }

    #[test]
    fn rotate_outcome_debug_names() {
        assert_eq!(format!("{:?}", RotateOutcome::Expired), "Expired");
        assert_eq!(format!("{:?}", RotateOutcome::Missing), "Missing");
        assert_eq!(format!("{:?}", RotateOutcome::Locked), "Locked");
    }

    #[test]
    fn unlocked_account_has_no_disposition() {
        let now = Utc::now();
        assert_eq!(
            lock_disposition(false, None, now),
            LockDisposition::Unlocked
        );
        // A stale expiry without the flag stays unlocked.
        assert_eq!(
            lock_disposition(false, Some(now - Duration::hours(1)), now),
            LockDisposition::Unlocked
        );
    }

    #[test]
    fn timed_lock_lapses_once_the_window_passes() {
        let now = Utc::now();
        assert_eq!(
            lock_disposition(true, Some(now - Duration::seconds(1)), now),
            LockDisposition::Lapsed
        );
        assert_eq!(
            lock_disposition(true, Some(now + Duration::minutes(30)), now),
            LockDisposition::Held
        );
    }

    #[test]
    fn untimed_lock_is_held_until_lifted() {
        assert_eq!(
            lock_disposition(true, None, Utc::now()),
            LockDisposition::Held
        );
    }

    #[test]
    fn refresh_record_holds_values() {
        let record = RefreshRecord {
            user_id: Uuid::nil(),
            session_id: None,
            device: "Mozilla/5.0".to_string(),
            origin: "203.0.113.7".to_string(),
            expires_at: Utc::now(),
        };
        assert_eq!(record.user_id, Uuid::nil());
        assert!(record.session_id.is_none());
        assert_eq!(record.device, "Mozilla/5.0");
    }

    #[test]
    fn session_row_holds_values() {
        let now = Utc::now();
        let row = SessionRow {
            id: Uuid::nil(),
            device: "Mozilla/5.0".to_string(),
            origin: "203.0.113.7".to_string(),
            created_at: now,
            last_active_at: now,
            expires_at: now,
        };
        assert_eq!(row.id, Uuid::nil());
        assert_eq!(row.origin, "203.0.113.7");
    }
}
