//! Event Channel — cross-process fan-out of user-facing progress events.
//!
//! The worker that talks to the completion provider runs in a separate
//! process from the one terminating the user's live connection, so events go
//! through redis pub/sub: the worker publishes to a per-user channel and the
//! HTTP process bridges subscribed messages out over SSE.
//!
//! Delivery is best-effort / at-most-once. If no client is connected the
//! event is dropped; the UI re-syncs with a full refetch on reconnect.

use redis::AsyncCommands;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::models::report::Phase;

pub const EVT_AI_STREAM: &str = "ai-stream";
pub const EVT_EVIDENCE_BATCH_SAVED: &str = "evidence-batch-saved";
pub const EVT_ANALYSIS_PROGRESS: &str = "analysis-progress";
pub const EVT_GENERATION_COMPLETE: &str = "generation-complete";
pub const EVT_GENERATION_FAILED: &str = "generation-failed";
pub const EVT_GENERATION_CANCELLED: &str = "generation-cancelled";
pub const EVT_GENERATION_RETRY: &str = "generation-retry";
pub const EVT_DOCUMENT_READY: &str = "document-ready";

#[derive(Clone)]
pub struct EventChannel {
    client: redis::Client,
}

impl EventChannel {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    fn channel_name(user_id: Uuid) -> String {
        format!("calibra:events:{user_id}")
    }

    /// Publishes one event to every live session of `user_id`.
    /// Failures are logged and swallowed: a dropped progress event must never
    /// fail the job that produced it.
    pub async fn publish(&self, user_id: Uuid, event: &str, payload: Value) {
        if let Err(e) = self.try_publish(user_id, event, payload).await {
            warn!("Failed to publish '{event}' for user {user_id}: {e}");
        }
    }

    async fn try_publish(&self, user_id: Uuid, event: &str, payload: Value) -> redis::RedisResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let envelope = json!({"event": event, "payload": payload}).to_string();
        let _receivers: i64 = conn.publish(Self::channel_name(user_id), envelope).await?;
        Ok(())
    }

    /// Subscribes to a user's channel. Used by the SSE route in the HTTP process.
    pub async fn subscribe(&self, user_id: Uuid) -> redis::RedisResult<redis::aio::PubSub> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.subscribe(Self::channel_name(user_id)).await?;
        Ok(pubsub)
    }
}

/// Splits a published envelope back into (event name, payload).
pub fn split_envelope(raw: &str) -> Option<(String, Value)> {
    let value: Value = serde_json::from_str(raw).ok()?;
    let event = value.get("event")?.as_str()?.to_string();
    let payload = value.get("payload").cloned().unwrap_or(Value::Null);
    Some((event, payload))
}

/// Standard payload for generation-complete / generation-failed /
/// generation-cancelled events.
pub fn phase_payload(report_id: Uuid, phase: Phase, status: &str, message: &str) -> Value {
    json!({
        "reportId": report_id,
        "phase": phase.number(),
        "status": status,
        "message": message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_envelope_round_trip() {
        let raw = json!({"event": EVT_AI_STREAM, "payload": {"reportId": "r1", "chunk": "Hel"}})
            .to_string();
        let (event, payload) = split_envelope(&raw).unwrap();
        assert_eq!(event, "ai-stream");
        assert_eq!(payload["chunk"], "Hel");
    }

    #[test]
    fn test_split_envelope_rejects_garbage() {
        assert!(split_envelope("not json").is_none());
        assert!(split_envelope("{\"payload\": {}}").is_none());
    }

    #[test]
    fn test_phase_payload_shape() {
        let report_id = Uuid::new_v4();
        let payload = phase_payload(report_id, Phase::Analysis, "FAILED", "provider outage");
        assert_eq!(payload["phase"], 2);
        assert_eq!(payload["status"], "FAILED");
        assert_eq!(payload["reportId"], json!(report_id));
    }
}
