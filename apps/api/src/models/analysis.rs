//! Competency analyses (Phase 2 output) and executive summaries (Phase 3 output).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One entry of the flattened judgment trail: a single key behavior at a
/// single level, with the model's verdict and the quotes it relied on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyBehaviorStatus {
    pub level: i16,
    pub key_behavior: String,
    pub fulfilled: bool,
    pub explanation: String,
    #[serde(default)]
    pub quotes: Vec<String>,
}

/// Recommendations split into the three fixed categories the UI renders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevelopmentRecommendations {
    #[serde(default)]
    pub personal_development: Vec<String>,
    #[serde(default)]
    pub assignment: Vec<String>,
    #[serde(default)]
    pub training: Vec<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CompetencyAnalysisRow {
    pub id: Uuid,
    pub report_id: Uuid,
    pub competency: String,
    pub level_achieved: i16,
    pub explanation: String,
    pub development_recommendations: serde_json::Value,
    pub key_behaviors_status: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A not-yet-persisted analysis. Phase 2 accumulates one per competency and
/// replaces the report's full set in one transaction.
#[derive(Debug, Clone, Serialize)]
pub struct NewAnalysis {
    pub competency: String,
    pub level_achieved: i16,
    pub explanation: String,
    pub development_recommendations: DevelopmentRecommendations,
    pub key_behaviors_status: Vec<KeyBehaviorStatus>,
}

/// Executive summary shape shared by the LLM contract and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutiveSummary {
    pub overview: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ExecutiveSummaryRow {
    pub id: Uuid,
    pub report_id: Uuid,
    pub overview: String,
    pub strengths: serde_json::Value,
    pub weaknesses: serde_json::Value,
    pub recommendations: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recommendations_default_to_empty_categories() {
        let recs: DevelopmentRecommendations = serde_json::from_str("{}").unwrap();
        assert!(recs.personal_development.is_empty());
        assert!(recs.assignment.is_empty());
        assert!(recs.training.is_empty());
    }

    #[test]
    fn test_executive_summary_tolerates_missing_lists() {
        let summary: ExecutiveSummary =
            serde_json::from_value(serde_json::json!({"overview": "Solid overall."})).unwrap();
        assert_eq!(summary.overview, "Solid overall.");
        assert!(summary.strengths.is_empty());
    }

    #[test]
    fn test_key_behavior_status_round_trip() {
        let status = KeyBehaviorStatus {
            level: 2,
            key_behavior: "Weighs trade-offs".to_string(),
            fulfilled: true,
            explanation: "Compared three vendor options before deciding.".to_string(),
            quotes: vec!["I listed the costs of each option".to_string()],
        };
        let json = serde_json::to_string(&status).unwrap();
        let back: KeyBehaviorStatus = serde_json::from_str(&json).unwrap();
        assert!(back.fulfilled);
        assert_eq!(back.quotes.len(), 1);
    }
}
