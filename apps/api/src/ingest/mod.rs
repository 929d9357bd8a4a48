//! Document ingestion — consumes the file queue.
//!
//! Uploaded documents are stored raw in S3; this handler downloads the
//! object, extracts plain text, and marks the document ready for Phase 1.
//! It runs on its own queue so a burst of uploads never starves generation
//! jobs (and vice versa).

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventChannel, EVT_DOCUMENT_READY};
use crate::models::document::DOC_STATUS_FAILED;
use crate::queue::{Job, JobError, JobHandler, JobOutcome};
use crate::store;

pub const INGEST_JOB_TYPE: &str = "ingest-document";

/// Payload of an `ingest-document` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestJob {
    pub file_id: Uuid,
    pub path: String,
    pub user_id: Uuid,
}

pub struct IngestHandler {
    db: PgPool,
    s3: S3Client,
    bucket: String,
    events: EventChannel,
}

impl IngestHandler {
    pub fn new(db: PgPool, s3: S3Client, bucket: String, events: EventChannel) -> Self {
        Self {
            db,
            s3,
            bucket,
            events,
        }
    }
}

#[async_trait]
impl JobHandler for IngestHandler {
    fn job_type(&self) -> &'static str {
        INGEST_JOB_TYPE
    }

    async fn execute(&self, job: &Job) -> Result<JobOutcome, JobError> {
        let payload: IngestJob = serde_json::from_value(job.payload.clone())
            .map_err(|e| JobError::Fatal(format!("malformed ingest payload: {e}")))?;

        let document = store::get_document(&self.db, payload.file_id)
            .await
            .map_err(|e| JobError::Retryable(e.to_string()))?
            .ok_or_else(|| JobError::Fatal(format!("document {} not found", payload.file_id)))?;

        let object = self
            .s3
            .get_object()
            .bucket(&self.bucket)
            .key(&payload.path)
            .send()
            .await
            .map_err(|e| JobError::Retryable(format!("S3 download failed: {e}")))?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| JobError::Retryable(format!("S3 body read failed: {e}")))?
            .into_bytes();

        let text = match extract_text(&document.filename, &bytes) {
            Ok(text) => text,
            Err(e) => {
                // A corrupt or unsupported file will not get better on retry.
                warn!("Text extraction failed for document {}: {e}", document.id);
                if let Err(e) = store::set_document_status(&self.db, document.id, DOC_STATUS_FAILED).await {
                    warn!("Failed to mark document {} failed: {e}", document.id);
                }
                return Err(JobError::Fatal(format!("text extraction failed: {e}")));
            }
        };

        store::set_document_text(&self.db, document.id, &text)
            .await
            .map_err(|e| JobError::Retryable(e.to_string()))?;

        self.events
            .publish(
                payload.user_id,
                EVT_DOCUMENT_READY,
                json!({"fileId": payload.file_id}),
            )
            .await;

        info!(
            "Ingested document {} ({} chars extracted)",
            document.id,
            text.len()
        );
        Ok(JobOutcome::Completed)
    }
}

/// PDF text extraction for .pdf files; everything else is treated as UTF-8
/// text (transcripts commonly arrive as .txt or .md exports).
fn extract_text(filename: &str, bytes: &[u8]) -> anyhow::Result<String> {
    if filename.to_lowercase().ends_with(".pdf") {
        Ok(pdf_extract::extract_text_from_mem(bytes)?)
    } else {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_payload_uses_camel_case() {
        let payload = json!({
            "fileId": Uuid::new_v4(),
            "path": "reports/r1/transcript.txt",
            "userId": Uuid::new_v4(),
        });
        let job: IngestJob = serde_json::from_value(payload).unwrap();
        assert_eq!(job.path, "reports/r1/transcript.txt");
    }

    #[test]
    fn test_extract_text_passthrough_for_plain_text() {
        let text = extract_text("notes.txt", "Observed strong analysis.".as_bytes()).unwrap();
        assert_eq!(text, "Observed strong analysis.");
    }

    #[test]
    fn test_extract_text_rejects_corrupt_pdf() {
        assert!(extract_text("broken.pdf", b"not a pdf").is_err());
    }
}
