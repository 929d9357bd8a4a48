//! The generation pipeline: three phase orchestrators behind the job queue,
//! plus the cancellation, coercion, and matching machinery they share.
//!
//! Error taxonomy, which the queue's retry policy keys off:
//! - `Cancelled` is control flow, not failure — terminal CANCELLED, never
//!   retried, never marks the report FAILED;
//! - `MissingData`/`Payload` are configuration errors — fail fast instead of
//!   burning attempts;
//! - everything else is transient and rides the queue's backoff.

pub mod cancel;
pub mod coerce;
pub mod evidence;
pub mod judgment;
pub mod kb_match;
pub mod prompts;
pub mod summary;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::events::{
    phase_payload, EventChannel, EVT_GENERATION_CANCELLED, EVT_GENERATION_FAILED,
    EVT_GENERATION_RETRY,
};
use crate::llm_client::{CompletionBackend, ProviderError};
use crate::models::report::{Phase, ReportStatus};
use crate::pipeline::cancel::{CancelReason, CancellationMonitor};
use crate::queue::{Job, JobError, JobHandler, JobOutcome};
use crate::store;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("{0}")]
    MissingData(String),

    #[error("malformed job payload: {0}")]
    Payload(String),

    #[error("malformed model output: {0}")]
    Malformed(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// Payload of the three generation job types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationJob {
    pub report_id: Uuid,
    pub user_id: Uuid,
}

impl GenerationJob {
    pub fn from_payload(payload: &serde_json::Value) -> Result<Self, PipelineError> {
        serde_json::from_value(payload.clone())
            .map_err(|e| PipelineError::Payload(e.to_string()))
    }
}

/// Everything a phase orchestrator needs, constructed once at worker startup
/// and passed by reference — no ambient singletons.
pub struct PipelineCtx {
    pub db: PgPool,
    pub llm: Arc<dyn CompletionBackend>,
    pub events: EventChannel,
    pub config: Config,
}

impl PipelineCtx {
    pub fn monitor(&self) -> CancellationMonitor {
        CancellationMonitor::new(
            self.db.clone(),
            Duration::from_millis(self.config.cancel_poll_ms),
        )
    }
}

/// Attempts 0..ceil(n/2) use the main model; the rest use the backup model.
/// Repeated failures suggest a main-provider outage, so later tries switch
/// providers instead of re-asking the same one.
pub fn model_for_attempt(config: &Config, attempt: u32) -> &str {
    let main_tries = config.job_attempts.div_ceil(2);
    if attempt < main_tries {
        &config.main_model
    } else {
        &config.backup_model
    }
}

/// Queue handler for one generation phase: runs the orchestrator, then maps
/// its result onto report status, user events, and the queue's retry policy.
pub struct PhaseJobHandler {
    ctx: Arc<PipelineCtx>,
    phase: Phase,
}

impl PhaseJobHandler {
    pub fn new(ctx: Arc<PipelineCtx>, phase: Phase) -> Self {
        Self { ctx, phase }
    }
}

#[async_trait]
impl JobHandler for PhaseJobHandler {
    fn job_type(&self) -> &'static str {
        self.phase.job_type()
    }

    async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let result = match self.phase {
            Phase::Evidence => evidence::run_evidence_extraction(&self.ctx, job).await,
            Phase::Analysis => judgment::run_level_judgment(&self.ctx, job).await,
            Phase::Summary => summary::run_executive_summary(&self.ctx, job).await,
        };
        conclude(&self.ctx, self.phase, job, result).await
    }
}

/// Terminal handling shared by all three phases.
async fn conclude(
    ctx: &PipelineCtx,
    phase: Phase,
    job: &Job,
    result: Result<(), PipelineError>,
) -> Result<JobOutcome, JobError> {
    let payload = GenerationJob::from_payload(&job.payload).ok();

    match result {
        Ok(()) => Ok(JobOutcome::Completed),

        Err(PipelineError::Cancelled(reason)) => {
            info!("{} job {} cancelled: {reason}", phase.label(), job.id);
            if let Some(p) = payload {
                ctx.events
                    .publish(
                        p.user_id,
                        EVT_GENERATION_CANCELLED,
                        phase_payload(p.report_id, phase, "CANCELLED", &reason.to_string()),
                    )
                    .await;
            }
            Ok(JobOutcome::Cancelled)
        }

        Err(PipelineError::Payload(msg)) => Err(JobError::Fatal(msg)),

        Err(PipelineError::MissingData(msg)) => {
            error!("{} job {} failed on missing data: {msg}", phase.label(), job.id);
            if let Some(p) = payload {
                fail_report(ctx, phase, &p, &msg).await;
            }
            Err(JobError::Fatal(msg))
        }

        Err(e) => {
            let msg = e.to_string();
            if let Some(p) = payload {
                if job.attempts_remaining() > 0 {
                    warn!(
                        "{} job {} attempt {} failed, will retry: {msg}",
                        phase.label(),
                        job.id,
                        job.attempt()
                    );
                    ctx.events
                        .publish(
                            p.user_id,
                            EVT_GENERATION_RETRY,
                            serde_json::json!({
                                "reportId": p.report_id,
                                "phase": phase.number(),
                                "attempt": job.attempt(),
                                "message": msg.as_str(),
                            }),
                        )
                        .await;
                } else {
                    error!(
                        "{} job {} exhausted its attempts: {msg}",
                        phase.label(),
                        job.id
                    );
                    fail_report(ctx, phase, &p, &msg).await;
                }
            }
            Err(JobError::Retryable(msg))
        }
    }
}

async fn fail_report(ctx: &PipelineCtx, phase: Phase, payload: &GenerationJob, message: &str) {
    if let Err(e) = store::set_status(&ctx.db, payload.report_id, ReportStatus::Failed).await {
        error!("Failed to mark report {} FAILED: {e}", payload.report_id);
    }
    ctx.events
        .publish(
            payload.user_id,
            EVT_GENERATION_FAILED,
            phase_payload(payload.report_id, phase, "FAILED", message),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            database_url: String::new(),
            redis_url: String::new(),
            s3_bucket: String::new(),
            s3_endpoint: String::new(),
            aws_access_key_id: String::new(),
            aws_secret_access_key: String::new(),
            anthropic_api_key: String::new(),
            port: 8080,
            rust_log: "info".to_string(),
            main_model: "main-model".to_string(),
            backup_model: "backup-model".to_string(),
            pass_threshold: 0.5,
            cancel_poll_ms: 1500,
            job_attempts: 6,
            backoff_base_ms: 2000,
        }
    }

    #[test]
    fn test_model_escalation_boundary_with_six_attempts() {
        let config = config();
        for attempt in 0..=2 {
            assert_eq!(model_for_attempt(&config, attempt), "main-model");
        }
        for attempt in 3..=5 {
            assert_eq!(model_for_attempt(&config, attempt), "backup-model");
        }
    }

    #[test]
    fn test_model_escalation_with_odd_attempt_budget() {
        let mut config = config();
        config.job_attempts = 5;
        assert_eq!(model_for_attempt(&config, 2), "main-model");
        assert_eq!(model_for_attempt(&config, 3), "backup-model");
    }

    #[test]
    fn test_generation_job_payload_uses_camel_case() {
        let report_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let payload = serde_json::json!({"reportId": report_id, "userId": user_id});

        let job = GenerationJob::from_payload(&payload).unwrap();
        assert_eq!(job.report_id, report_id);
        assert_eq!(job.user_id, user_id);

        let round_trip = serde_json::to_value(&job).unwrap();
        assert!(round_trip.get("reportId").is_some());
    }

    #[test]
    fn test_generation_job_rejects_malformed_payload() {
        let payload = serde_json::json!({"reportId": "not-a-uuid"});
        assert!(matches!(
            GenerationJob::from_payload(&payload),
            Err(PipelineError::Payload(_))
        ));
    }
}
