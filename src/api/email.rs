//! Email outbox worker and delivery abstractions.
//!
//! Every flow that notifies a user writes a row into `email_outbox`, most of
//! them inside the same transaction as the state change they announce. A
//! background task polls the table, claims a batch with
//! `FOR UPDATE SKIP LOCKED`, and hands each row to an [`EmailSender`].
//! Failed rows are retried with exponential backoff and jitter until
//! `max_attempts`, then parked as `failed`.
//!
//! The default sender for local dev is [`LogEmailSender`], which logs the
//! payload and reports success.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Template for the account-activation email sent on signup and resend.
pub(crate) const TEMPLATE_ACTIVATION: &str = "account-activation";

/// Template for the step-up security code sent on a suspicious login.
pub(crate) const TEMPLATE_SECURITY_CODE: &str = "security-code";

/// Template for the password-reset code.
pub(crate) const TEMPLATE_RESET_CODE: &str = "password-reset-code";

/// Template confirming a completed password reset.
pub(crate) const TEMPLATE_PASSWORD_CHANGED: &str = "password-changed";

#[derive(Clone, Debug)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

/// Delivery abstraction used by the outbox worker. Implementations decide
/// how a message leaves the system (SMTP, HTTP API, broker).
pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error to schedule a retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs the payload instead of sending real email.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %message.to_email,
            template = %message.template,
            payload = %message.payload_json,
            "email outbox send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmailWorkerConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailWorkerConfig {
    /// Default worker config: 5s poll interval, 10 messages per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    /// Clamp degenerate values so the worker never busy-loops or stalls.
    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let batch_size = if self.batch_size == 0 {
            1
        } else {
            self.batch_size
        };
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            poll_interval,
            batch_size,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        self.backoff_base
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        self.backoff_max
    }
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn a background task that drains the email outbox.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    let worker = OutboxWorker {
        pool,
        sender,
        config: config.normalize(),
    };
    tokio::spawn(worker.run())
}

struct OutboxWorker {
    pool: PgPool,
    sender: Arc<dyn EmailSender>,
    config: EmailWorkerConfig,
}

impl OutboxWorker {
    async fn run(self) {
        loop {
            if let Err(err) = self.drain_batch().await {
                error!("email outbox batch failed: {err}");
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// One claim-deliver-settle pass over due rows, all in one transaction.
    async fn drain_batch(&self) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("begin outbox batch")?;

        let claimed = claim_batch(&mut tx, self.config.batch_size()).await?;
        let count = claimed.len();
        for email in claimed {
            let attempts = email.attempts.saturating_add(1);
            let outcome = dispose(self.sender.send(&email.message), attempts, &self.config);
            settle(&mut tx, email.id, attempts, outcome).await?;
        }

        tx.commit().await.context("commit outbox batch")?;
        Ok(count)
    }
}

struct ClaimedEmail {
    id: Uuid,
    attempts: u32,
    message: EmailMessage,
}

/// What to write back for a claimed row after a delivery attempt.
#[derive(Debug)]
enum Delivery {
    Sent,
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

fn dispose(result: Result<()>, attempts: u32, config: &EmailWorkerConfig) -> Delivery {
    match result {
        Ok(()) => Delivery::Sent,
        Err(err) if attempts >= config.max_attempts() => Delivery::Failed {
            error: err.to_string(),
        },
        Err(err) => Delivery::Retry {
            delay: backoff_delay(attempts, config.backoff_base(), config.backoff_max()),
            error: err.to_string(),
        },
    }
}

/// Claim due rows with `FOR UPDATE SKIP LOCKED` so several workers can run
/// without double-sending.
async fn claim_batch(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    batch_size: usize,
) -> Result<Vec<ClaimedEmail>> {
    let query = r"
        SELECT id, to_email, template, payload_json::text AS payload_json, attempts
        FROM email_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(batch_size).unwrap_or(0))
        .fetch_all(&mut **tx)
        .instrument(span)
        .await
        .context("failed to claim email outbox batch")?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let attempts: i32 = row.get("attempts");
            ClaimedEmail {
                id: row.get("id"),
                attempts: u32::try_from(attempts).unwrap_or(0),
                message: EmailMessage {
                    to_email: row.get("to_email"),
                    template: row.get("template"),
                    payload_json: row.get("payload_json"),
                },
            }
        })
        .collect())
}

/// Write back one claimed row. A single statement covers all three
/// outcomes, keyed on the new status and retry delay.
async fn settle(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
    outcome: Delivery,
) -> Result<()> {
    let (status, last_error, delay_ms) = match outcome {
        Delivery::Sent => ("sent", None, 0_i64),
        Delivery::Failed { error } => ("failed", Some(error), 0_i64),
        Delivery::Retry { delay, error } => (
            "pending",
            Some(error),
            i64::try_from(delay.as_millis()).unwrap_or(i64::MAX),
        ),
    };

    let query = r"
        UPDATE email_outbox
        SET status = $2,
            attempts = $3,
            last_error = $4,
            sent_at = CASE WHEN $2 = 'sent' THEN NOW() ELSE sent_at END,
            next_attempt_at = NOW() + ($5 * INTERVAL '1 millisecond')
        WHERE id = $1
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "UPDATE",
        db.statement = query
    );
    sqlx::query(query)
        .bind(id)
        .bind(status)
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .bind(last_error)
        .bind(delay_ms)
        .execute(&mut **tx)
        .instrument(span)
        .await
        .context("failed to settle email outbox row")?;
    Ok(())
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = EmailWorkerConfig::new();
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.batch_size(), 10);
        assert_eq!(config.max_attempts(), 5);
        assert_eq!(config.backoff_base(), Duration::from_secs(5));
        assert_eq!(config.backoff_max(), Duration::from_secs(300));
    }

    #[test]
    fn config_builders_override() {
        let config = EmailWorkerConfig::new()
            .with_poll_interval_seconds(1)
            .with_batch_size(25)
            .with_max_attempts(3)
            .with_backoff_base_seconds(2)
            .with_backoff_max_seconds(60);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 25);
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.backoff_base(), Duration::from_secs(2));
        assert_eq!(config.backoff_max(), Duration::from_secs(60));
    }

    #[test]
    fn normalize_clamps_degenerate_values() {
        let config = EmailWorkerConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0)
            .with_backoff_base_seconds(0)
            .with_backoff_max_seconds(0)
            .normalize();
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.batch_size(), 1);
        assert_eq!(config.max_attempts(), 1);
        assert_eq!(config.backoff_base(), Duration::from_secs(1));
        assert!(config.backoff_max() >= config.backoff_base());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);

        // Jitter keeps the delay in [half, full] of the capped value.
        let first = backoff_delay(1, base, max);
        assert!(first >= Duration::from_millis(2_500));
        assert!(first <= base);

        let deep = backoff_delay(30, base, max);
        assert!(deep >= Duration::from_millis(150_000));
        assert!(deep <= max);
    }

    #[test]
    fn dispose_sent_retry_failed() {
        let config = EmailWorkerConfig::new();

        assert!(matches!(dispose(Ok(()), 1, &config), Delivery::Sent));

        match dispose(Err(anyhow::anyhow!("smtp down")), 1, &config) {
            Delivery::Retry { delay, error } => {
                assert!(delay >= Duration::from_millis(2_500));
                assert!(delay <= config.backoff_base());
                assert!(error.contains("smtp down"));
            }
            other => panic!("expected retry, got {other:?}"),
        }

        let exhausted = dispose(
            Err(anyhow::anyhow!("smtp down")),
            config.max_attempts(),
            &config,
        );
        assert!(matches!(exhausted, Delivery::Failed { .. }));
    }

    #[test]
    fn jitter_passes_tiny_delays_through() {
        assert_eq!(jitter_delay(Duration::from_millis(1)), Duration::from_millis(1));
    }

    #[test]
    fn log_sender_always_succeeds() {
        let message = EmailMessage {
            to_email: "alice@example.com".to_string(),
            template: TEMPLATE_ACTIVATION.to_string(),
            payload_json: "{}".to_string(),
        };
        assert!(LogEmailSender.send(&message).is_ok());
    }
}
