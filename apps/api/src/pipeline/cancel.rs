//! Cancellation Monitor — the authoritative "should I still be running" check.
//!
//! The persisted report row is the single source of truth: a job must stop
//! when the status moves away from PROCESSING, the row disappears, or a newer
//! job has installed itself as `active_job_id` (zombie detection).
//!
//! Two tiers bound cancellation latency: orchestrators call `check` before
//! every discrete unit of work, and hold a `watchdog` while a completion call
//! is in flight so the underlying HTTP stream is aborted within one poll
//! interval instead of running to completion.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::pipeline::PipelineError;
use crate::store::{self, ControlState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The report's status is no longer PROCESSING.
    StatusChanged(String),
    /// The report row is gone.
    ReportDeleted,
    /// A newer job has taken over `active_job_id`.
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::StatusChanged(status) => {
                write!(f, "report status changed to {status}")
            }
            CancelReason::ReportDeleted => write!(f, "report no longer exists"),
            CancelReason::Superseded => write!(f, "superseded by a newer job"),
        }
    }
}

/// Pure decision: given the polled control state, should job `job_id` stop?
pub fn cancel_reason(state: Option<&ControlState>, job_id: Uuid) -> Option<CancelReason> {
    let Some(state) = state else {
        return Some(CancelReason::ReportDeleted);
    };
    if state.status != "PROCESSING" {
        return Some(CancelReason::StatusChanged(state.status.clone()));
    }
    match state.active_job_id {
        Some(active) if active == job_id => None,
        _ => Some(CancelReason::Superseded),
    }
}

#[derive(Clone)]
pub struct CancellationMonitor {
    pool: PgPool,
    poll_interval: Duration,
}

impl CancellationMonitor {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    /// Coarse checkpoint, called between units of work.
    pub async fn check(&self, report_id: Uuid, job_id: Uuid) -> Result<(), PipelineError> {
        let state = store::control_state(&self.pool, report_id).await?;
        match cancel_reason(state.as_ref(), job_id) {
            Some(reason) => Err(PipelineError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    /// Fine checkpoint: spawns a poll loop for the duration of one completion
    /// call. When the loop observes a stop condition it fires the token, which
    /// aborts the in-flight HTTP request, and records the reason for the
    /// orchestrator to read back via `disarm`.
    pub fn watchdog(&self, report_id: Uuid, job_id: Uuid) -> Watchdog {
        let token = CancellationToken::new();
        let reason: Arc<Mutex<Option<CancelReason>>> = Arc::new(Mutex::new(None));

        let pool = self.pool.clone();
        let poll = self.poll_interval;
        let loop_token = token.clone();
        let loop_reason = reason.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match store::control_state(&pool, report_id).await {
                    Ok(state) => {
                        if let Some(found) = cancel_reason(state.as_ref(), job_id) {
                            if let Ok(mut slot) = loop_reason.lock() {
                                *slot = Some(found);
                            }
                            loop_token.cancel();
                            break;
                        }
                    }
                    // A transient poll failure must not kill the job; keep polling.
                    Err(e) => warn!("Cancellation poll failed for report {report_id}: {e}"),
                }
            }
        });

        Watchdog {
            token,
            reason,
            task,
        }
    }
}

/// Handle over one watchdog poll loop. Must be disarmed after the guarded
/// completion call returns.
pub struct Watchdog {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
    task: JoinHandle<()>,
}

impl Watchdog {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Stops the poll loop and returns the cancellation reason, if one fired.
    pub async fn disarm(self) -> Option<CancelReason> {
        self.task.abort();
        self.reason.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(status: &str, active_job_id: Option<Uuid>) -> ControlState {
        ControlState {
            status: status.to_string(),
            active_job_id,
        }
    }

    #[test]
    fn test_processing_with_matching_job_keeps_running() {
        let job = Uuid::new_v4();
        assert_eq!(cancel_reason(Some(&state("PROCESSING", Some(job))), job), None);
    }

    #[test]
    fn test_status_flip_cancels() {
        let job = Uuid::new_v4();
        assert_eq!(
            cancel_reason(Some(&state("CREATED", Some(job))), job),
            Some(CancelReason::StatusChanged("CREATED".to_string()))
        );
    }

    #[test]
    fn test_missing_report_cancels() {
        assert_eq!(
            cancel_reason(None, Uuid::new_v4()),
            Some(CancelReason::ReportDeleted)
        );
    }

    #[test]
    fn test_zombie_job_cancels_even_while_processing() {
        let stale = Uuid::new_v4();
        let newer = Uuid::new_v4();
        assert_eq!(
            cancel_reason(Some(&state("PROCESSING", Some(newer))), stale),
            Some(CancelReason::Superseded)
        );
    }

    #[test]
    fn test_cleared_active_job_id_cancels() {
        let job = Uuid::new_v4();
        assert_eq!(
            cancel_reason(Some(&state("PROCESSING", None)), job),
            Some(CancelReason::Superseded)
        );
    }

    #[test]
    fn test_reason_display_is_user_readable() {
        assert_eq!(
            CancelReason::StatusChanged("FAILED".to_string()).to_string(),
            "report status changed to FAILED"
        );
        assert_eq!(
            CancelReason::Superseded.to_string(),
            "superseded by a newer job"
        );
    }
}
