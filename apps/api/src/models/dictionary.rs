//! Competency dictionary — the versioned tree that structures both evidence
//! extraction and level judgment: competency -> ordered levels -> key behaviors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelDefinition {
    pub level: i16,
    pub definition: String,
    pub key_behaviors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Competency {
    pub name: String,
    pub levels: Vec<LevelDefinition>,
}

impl Competency {
    pub fn level(&self, level: i16) -> Option<&LevelDefinition> {
        self.levels.iter().find(|l| l.level == level)
    }

    /// Highest level defined for this competency, or 0 for an empty ladder.
    pub fn max_level(&self) -> i16 {
        self.levels.iter().map(|l| l.level).max().unwrap_or(0)
    }
}

/// The parsed dictionary tree. Ordering of `competencies` and of each
/// competency's `levels` is the canonical processing order for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompetencyDictionary {
    pub competencies: Vec<Competency>,
}

impl CompetencyDictionary {
    pub fn competency(&self, name: &str) -> Option<&Competency> {
        self.competencies.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DictionaryRow {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl DictionaryRow {
    pub fn parse(&self) -> Result<CompetencyDictionary, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CompetencyDictionary {
        serde_json::from_value(serde_json::json!({
            "competencies": [
                {
                    "name": "Problem Solving",
                    "levels": [
                        {"level": 1, "definition": "Solves routine problems", "key_behaviors": ["Identifies the core issue", "Gathers relevant facts"]},
                        {"level": 2, "definition": "Solves novel problems", "key_behaviors": ["Generates alternatives", "Weighs trade-offs"]}
                    ]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_dictionary_parses_and_preserves_order() {
        let dict = sample();
        let comp = dict.competency("Problem Solving").unwrap();
        assert_eq!(comp.levels[0].level, 1);
        assert_eq!(comp.levels[1].key_behaviors[1], "Weighs trade-offs");
        assert_eq!(comp.max_level(), 2);
    }

    #[test]
    fn test_missing_competency_is_none() {
        let dict = sample();
        assert!(dict.competency("Leadership").is_none());
        assert!(dict.competency("Problem Solving").unwrap().level(3).is_none());
    }
}
