//! Job Queue — durable, at-least-once background work over Postgres.
//!
//! An HTTP handler enqueues a named job; a worker process claims it with
//! `FOR UPDATE SKIP LOCKED` so each job is delivered to exactly one active
//! handler invocation at a time. A handler error requeues the job with
//! exponential backoff until its attempt budget is exhausted, after which the
//! row is kept with status 'failed' for inspection. Completed and cancelled
//! jobs are deleted.
//!
//! Two independent `Worker` instances run in the worker binary: one for the
//! generation phases, one for document ingestion.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One claimed job as seen by a handler. `attempts` is incremented at claim
/// time, so it is 1 during the first delivery.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
    pub max_attempts: i32,
    pub backoff_base_ms: i64,
}

impl Job {
    /// Zero-based index of the execution currently running.
    pub fn attempt(&self) -> u32 {
        (self.attempts - 1).max(0) as u32
    }

    /// Deliveries left after the current one fails.
    pub fn attempts_remaining(&self) -> u32 {
        (self.max_attempts - self.attempts).max(0) as u32
    }
}

/// Terminal result of a successful handler invocation. Cancellation is a
/// first-class outcome, not an error: it must never trigger the retry path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Error)]
pub enum JobError {
    /// Transient failure; the job is requeued with backoff until attempts run out.
    #[error("retryable job error: {0}")]
    Retryable(String),

    /// Unrecoverable failure (malformed payload, missing report or dictionary);
    /// the job fails immediately instead of burning the remaining attempts.
    #[error("fatal job error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            backoff_base_ms: 2000,
        }
    }
}

/// Durably schedules a job. Returns the job id, which the caller records as
/// the report's `active_job_id`.
pub async fn enqueue(
    pool: &PgPool,
    job_type: &str,
    payload: serde_json::Value,
    opts: EnqueueOptions,
) -> sqlx::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO jobs (id, job_type, payload, status, attempts, max_attempts, backoff_base_ms, run_at)
        VALUES ($1, $2, $3, 'queued', 0, $4, $5, now())
        "#,
    )
    .bind(id)
    .bind(job_type)
    .bind(&payload)
    .bind(opts.max_attempts as i32)
    .bind(opts.backoff_base_ms as i64)
    .execute(pool)
    .await?;

    info!("Enqueued {job_type} job {id}");
    Ok(id)
}

/// Delay before redelivery after the `attempt`-th failed delivery (1-based):
/// base, 2*base, 4*base, ... The shift is capped so large attempt counts
/// cannot overflow.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    Duration::from_millis(base_ms.saturating_mul(1 << exponent))
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;
    async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError>;
}

/// Polls for claimable jobs of its registered types and dispatches them.
pub struct Worker {
    pool: PgPool,
    name: &'static str,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(pool: PgPool, name: &'static str, shutdown: CancellationToken) -> Self {
        Self {
            pool,
            name,
            handlers: HashMap::new(),
            shutdown,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    pub async fn run(self) {
        let job_types: Vec<String> = self.handlers.keys().map(|t| t.to_string()).collect();
        info!(
            "Worker '{}' started, handling {:?}",
            self.name, job_types
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.claim(&job_types).await {
                Ok(Some(job)) => self.dispatch(job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!("Worker '{}' failed to claim a job: {e}", self.name);
                    tokio::select! {
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
            }
        }

        info!("Worker '{}' stopped", self.name);
    }

    /// Claims at most one due job. `SKIP LOCKED` guarantees no two workers
    /// ever hold the same job id concurrently.
    async fn claim(&self, job_types: &[String]) -> sqlx::Result<Option<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1, updated_at = now()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued' AND run_at <= now() AND job_type = ANY($1)
                ORDER BY run_at, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, job_type, payload, attempts, max_attempts, backoff_base_ms
            "#,
        )
        .bind(job_types)
        .fetch_optional(&self.pool)
        .await
    }

    async fn dispatch(&self, job: Job) {
        let Some(handler) = self.handlers.get(job.job_type.as_str()) else {
            // Can only happen if a claim query and registry disagree.
            warn!("No handler registered for job type '{}'", job.job_type);
            self.mark_failed(&job, "no handler registered").await;
            return;
        };

        info!(
            "Dispatching {} job {} (attempt {}/{})",
            job.job_type, job.id, job.attempts, job.max_attempts
        );

        match handler.execute(&job).await {
            Ok(JobOutcome::Completed) => self.delete(&job).await,
            Ok(JobOutcome::Cancelled) => {
                info!("Job {} cancelled; discarding", job.id);
                self.delete(&job).await;
            }
            Err(JobError::Fatal(msg)) => {
                error!("Job {} failed fatally: {msg}", job.id);
                self.mark_failed(&job, &msg).await;
            }
            Err(JobError::Retryable(msg)) => {
                if job.attempts >= job.max_attempts {
                    error!(
                        "Job {} exhausted {} attempts: {msg}",
                        job.id, job.max_attempts
                    );
                    self.mark_failed(&job, &msg).await;
                } else {
                    let delay = backoff_delay(job.backoff_base_ms as u64, job.attempts as u32);
                    warn!(
                        "Job {} attempt {} failed, requeueing in {}ms: {msg}",
                        job.id,
                        job.attempts,
                        delay.as_millis()
                    );
                    self.requeue(&job, delay, &msg).await;
                }
            }
        }
    }

    async fn delete(&self, job: &Job) {
        if let Err(e) = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job.id)
            .execute(&self.pool)
            .await
        {
            error!("Failed to delete job {}: {e}", job.id);
        }
    }

    async fn requeue(&self, job: &Job, delay: Duration, last_error: &str) {
        let run_at = chrono::Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
        if let Err(e) = sqlx::query(
            "UPDATE jobs SET status = 'queued', run_at = $2, last_error = $3, updated_at = now() WHERE id = $1",
        )
        .bind(job.id)
        .bind(run_at)
        .bind(last_error)
        .execute(&self.pool)
        .await
        {
            error!("Failed to requeue job {}: {e}", job.id);
        }
    }

    /// Failed jobs are retained for inspection.
    async fn mark_failed(&self, job: &Job, last_error: &str) {
        if let Err(e) = sqlx::query(
            "UPDATE jobs SET status = 'failed', last_error = $2, updated_at = now() WHERE id = $1",
        )
        .bind(job.id)
        .bind(last_error)
        .execute(&self.pool)
        .await
        {
            error!("Failed to mark job {} failed: {e}", job.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(attempts: i32, max_attempts: i32) -> Job {
        Job {
            id: Uuid::new_v4(),
            job_type: "generate-phase-1".to_string(),
            payload: serde_json::json!({}),
            attempts,
            max_attempts,
            backoff_base_ms: 2000,
        }
    }

    #[test]
    fn test_attempt_is_zero_based() {
        assert_eq!(job(1, 6).attempt(), 0);
        assert_eq!(job(4, 6).attempt(), 3);
    }

    #[test]
    fn test_attempts_remaining() {
        assert_eq!(job(1, 6).attempts_remaining(), 5);
        assert_eq!(job(6, 6).attempts_remaining(), 0);
        // Defensive: never underflows even if counters drift.
        assert_eq!(job(7, 6).attempts_remaining(), 0);
    }

    #[test]
    fn test_backoff_doubles_per_attempt() {
        assert_eq!(backoff_delay(2000, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2000, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(2000, 3), Duration::from_millis(8000));
        assert_eq!(backoff_delay(2000, 5), Duration::from_millis(32000));
    }

    #[test]
    fn test_backoff_shift_is_capped() {
        // Very large attempt counts must not overflow the shift.
        let d = backoff_delay(1000, 200);
        assert_eq!(d, Duration::from_millis(1000 * (1 << 16)));
    }

    #[test]
    fn test_enqueue_options_default() {
        let opts = EnqueueOptions::default();
        assert_eq!(opts.max_attempts, 6);
        assert_eq!(opts.backoff_base_ms, 2000);
    }
}
