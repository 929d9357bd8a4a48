//! Uploaded source documents (candidate transcripts, observation notes).

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

pub const DOC_STATUS_UPLOADED: &str = "uploaded";
pub const DOC_STATUS_READY: &str = "ready";
pub const DOC_STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DocumentRow {
    pub id: Uuid,
    pub report_id: Uuid,
    pub filename: String,
    /// Simulation-method label chosen at upload time, copied onto evidence rows.
    pub source_tag: String,
    pub storage_key: String,
    /// Filled by the ingestion job once text extraction succeeds.
    pub extracted_text: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}
