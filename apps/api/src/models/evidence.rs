//! Evidence — one row per (competency, level, key-behavior match, source document).
//! Produced by Phase 1 or by manual user highlighting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct EvidenceRow {
    pub id: Uuid,
    pub report_id: Uuid,
    pub competency: String,
    pub level: i16,
    pub key_behavior: String,
    pub quote: String,
    /// Simulation-method label of the source document (e.g. "Case Study").
    pub source_tag: String,
    pub document_id: Option<Uuid>,
    pub reasoning: Option<String>,
    pub is_ai_generated: bool,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A not-yet-persisted evidence row. The pipeline builds these from parsed
/// LLM output; the manual-highlight endpoint builds them from user input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvidence {
    pub competency: String,
    pub level: i16,
    pub key_behavior: String,
    pub quote: String,
    pub source_tag: String,
    pub document_id: Option<Uuid>,
    pub reasoning: Option<String>,
    /// Defaults to false so manual-highlight requests need not send it.
    #[serde(default)]
    pub is_ai_generated: bool,
}
