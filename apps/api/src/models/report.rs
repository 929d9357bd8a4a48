//! Report — the root entity of one assessment write-up.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Report lifecycle status. Stored as TEXT; the pipeline is the only writer
/// of PROCESSING/COMPLETED/FAILED transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Created => "CREATED",
            ReportStatus::Processing => "PROCESSING",
            ReportStatus::Completed => "COMPLETED",
            ReportStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(ReportStatus::Created),
            "PROCESSING" => Some(ReportStatus::Processing),
            "COMPLETED" => Some(ReportStatus::Completed),
            "FAILED" => Some(ReportStatus::Failed),
            _ => None,
        }
    }
}

/// The three generation phases. `target_phase` on a report configures how far
/// the pipeline should run; each phase is triggered as its own job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Evidence,
    Analysis,
    Summary,
}

impl Phase {
    pub fn number(self) -> i16 {
        match self {
            Phase::Evidence => 1,
            Phase::Analysis => 2,
            Phase::Summary => 3,
        }
    }

    pub fn from_number(n: i16) -> Option<Self> {
        match n {
            1 => Some(Phase::Evidence),
            2 => Some(Phase::Analysis),
            3 => Some(Phase::Summary),
            _ => None,
        }
    }

    /// Queue job-type name for this phase.
    pub fn job_type(self) -> &'static str {
        match self {
            Phase::Evidence => "generate-phase-1",
            Phase::Analysis => "generate-phase-2",
            Phase::Summary => "generate-phase-3",
        }
    }

    /// Short label used in events and log lines.
    pub fn label(self) -> &'static str {
        match self {
            Phase::Evidence => "evidence",
            Phase::Analysis => "analysis",
            Phase::Summary => "summary",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReportRow {
    pub id: Uuid,
    pub title: String,
    pub project_id: Uuid,
    pub created_by: Uuid,
    pub status: String,
    pub target_phase: i16,
    /// JSONB map of competency name -> target level.
    pub target_levels: serde_json::Value,
    pub specific_context: Option<String>,
    pub dictionary_id: Uuid,
    /// Id of the job currently authoritative for this report. A running job
    /// whose id differs has been superseded and must self-cancel.
    pub active_job_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReportRow {
    pub fn status(&self) -> Option<ReportStatus> {
        ReportStatus::parse(&self.status)
    }

    /// Parses the target_levels JSONB into a name -> level map.
    /// Non-numeric values are skipped rather than failing the whole report.
    pub fn target_levels(&self) -> HashMap<String, i16> {
        match self.target_levels.as_object() {
            Some(map) => map
                .iter()
                .filter_map(|(k, v)| v.as_i64().map(|n| (k.clone(), n as i16)))
                .collect(),
            None => HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for s in [
            ReportStatus::Created,
            ReportStatus::Processing,
            ReportStatus::Completed,
            ReportStatus::Failed,
        ] {
            assert_eq!(ReportStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ReportStatus::parse("DRAFT"), None);
    }

    #[test]
    fn test_phase_numbers_and_job_types() {
        assert_eq!(Phase::from_number(1), Some(Phase::Evidence));
        assert_eq!(Phase::from_number(3), Some(Phase::Summary));
        assert_eq!(Phase::from_number(4), None);
        assert_eq!(Phase::Analysis.job_type(), "generate-phase-2");
        assert_eq!(Phase::Analysis.number(), 2);
    }

    #[test]
    fn test_target_levels_skips_non_numeric_values() {
        let row = ReportRow {
            id: Uuid::new_v4(),
            title: "Q3 assessment".to_string(),
            project_id: Uuid::new_v4(),
            created_by: Uuid::new_v4(),
            status: "CREATED".to_string(),
            target_phase: 3,
            target_levels: serde_json::json!({"Problem Solving": 3, "Leadership": "high"}),
            specific_context: None,
            dictionary_id: Uuid::new_v4(),
            active_job_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let levels = row.target_levels();
        assert_eq!(levels.get("Problem Solving"), Some(&3));
        assert!(!levels.contains_key("Leadership"));
    }
}
