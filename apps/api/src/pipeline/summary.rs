//! Phase 3 — Executive Summary.
//!
//! Two sequential model calls over the full analysis set: a drafter, then a
//! critic that checks the draft for self-contradiction between the overview
//! and the strengths/weaknesses lists. Neither call streams to the UI, but
//! both are guarded by the cancellation watchdog so a stop request aborts a
//! long-running call instead of waiting it out.

use tracing::info;

use crate::events::{phase_payload, EVT_GENERATION_COMPLETE};
use crate::llm_client::CompletionRequest;
use crate::models::analysis::{CompetencyAnalysisRow, ExecutiveSummary};
use crate::models::report::{Phase, ReportStatus};
use crate::pipeline::coerce::{lowercase_keys, parse_llm_json};
use crate::pipeline::judgment::resolve_call;
use crate::pipeline::prompts::{
    SUMMARY_CRITIQUE_SYSTEM, SUMMARY_CRITIQUE_TEMPLATE, SUMMARY_DRAFT_SYSTEM,
    SUMMARY_DRAFT_TEMPLATE, SUMMARY_TEMPERATURE,
};
use crate::pipeline::{model_for_attempt, GenerationJob, PipelineCtx, PipelineError};
use crate::queue::Job;
use crate::store;

pub async fn run_executive_summary(ctx: &PipelineCtx, job: &Job) -> Result<(), PipelineError> {
    let payload = GenerationJob::from_payload(&job.payload)?;
    let report_id = payload.report_id;
    let monitor = ctx.monitor();
    monitor.check(report_id, job.id).await?;

    store::get_report(&ctx.db, report_id)
        .await?
        .ok_or_else(|| PipelineError::MissingData(format!("report {report_id} not found")))?;

    let analyses = store::list_analyses(&ctx.db, report_id).await?;
    if analyses.is_empty() {
        return Err(PipelineError::MissingData(format!(
            "report {report_id} has no competency analyses; run the analysis phase first"
        )));
    }

    let model = model_for_attempt(&ctx.config, job.attempt());
    let analyses_json = render_analyses(&analyses);
    info!(
        "Phase 3 for report {report_id}: drafting summary over {} analyses, model {model}",
        analyses.len()
    );

    // Draft pass.
    let draft_prompt = SUMMARY_DRAFT_TEMPLATE.replace("{analyses_json}", &analyses_json);
    let request = CompletionRequest {
        model,
        system: SUMMARY_DRAFT_SYSTEM,
        prompt: &draft_prompt,
        temperature: SUMMARY_TEMPERATURE,
    };
    let watchdog = monitor.watchdog(report_id, job.id);
    let result = ctx.llm.complete(&request, watchdog.token()).await;
    let draft_text = resolve_call(result, watchdog).await?;
    let draft = parse_summary(&draft_text)?;

    // Critique pass.
    monitor.check(report_id, job.id).await?;
    let draft_json = serde_json::to_string_pretty(&draft)
        .map_err(|e| PipelineError::Malformed(format!("failed to serialize draft: {e}")))?;
    let critique_prompt = SUMMARY_CRITIQUE_TEMPLATE
        .replace("{draft_json}", &draft_json)
        .replace("{analyses_json}", &analyses_json);
    let request = CompletionRequest {
        model,
        system: SUMMARY_CRITIQUE_SYSTEM,
        prompt: &critique_prompt,
        temperature: SUMMARY_TEMPERATURE,
    };
    let watchdog = monitor.watchdog(report_id, job.id);
    let result = ctx.llm.complete(&request, watchdog.token()).await;
    let final_text = resolve_call(result, watchdog).await?;
    let summary = parse_summary(&final_text)?;

    monitor.check(report_id, job.id).await?;
    store::upsert_summary(&ctx.db, report_id, &summary).await?;
    store::set_status(&ctx.db, report_id, ReportStatus::Completed).await?;

    ctx.events
        .publish(
            payload.user_id,
            EVT_GENERATION_COMPLETE,
            phase_payload(
                report_id,
                Phase::Summary,
                "COMPLETED",
                "Executive summary generated",
            ),
        )
        .await;

    info!("Phase 3 for report {report_id} completed");
    Ok(())
}

fn render_analyses(analyses: &[CompetencyAnalysisRow]) -> String {
    serde_json::to_string_pretty(
        &analyses
            .iter()
            .map(|a| {
                serde_json::json!({
                    "competency": a.competency,
                    "level_achieved": a.level_achieved,
                    "explanation": a.explanation,
                    "development_recommendations": a.development_recommendations,
                })
            })
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".to_string())
}

/// Validates the summary schema, retrying once with a lowercased-key remap
/// (models occasionally capitalize the top-level keys) before giving up.
pub fn parse_summary(text: &str) -> Result<ExecutiveSummary, PipelineError> {
    let value = parse_llm_json(text)
        .map_err(|e| PipelineError::Malformed(format!("summary output: {e}")))?;

    serde_json::from_value::<ExecutiveSummary>(value.clone())
        .or_else(|_| serde_json::from_value(lowercase_keys(&value)))
        .map_err(|e| PipelineError::Malformed(format!("summary output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_summary_happy_path() {
        let text = r#"{"overview": "Strong analyst, uneven delegation.", "strengths": ["analysis"], "weaknesses": ["delegation"], "recommendations": ["promote with coaching"]}"#;
        let summary = parse_summary(text).unwrap();
        assert_eq!(summary.strengths, vec!["analysis"]);
    }

    #[test]
    fn test_parse_summary_remaps_capitalized_keys() {
        let text = r#"{"Overview": "o", "Strengths": ["s"], "Weaknesses": [], "Recommendations": []}"#;
        let summary = parse_summary(text).unwrap();
        assert_eq!(summary.overview, "o");
        assert_eq!(summary.strengths, vec!["s"]);
    }

    #[test]
    fn test_parse_summary_strips_fences() {
        let text = "```json\n{\"overview\": \"o\"}\n```";
        let summary = parse_summary(text).unwrap();
        assert_eq!(summary.overview, "o");
        assert!(summary.strengths.is_empty());
    }

    #[test]
    fn test_parse_summary_rejects_wrong_shape() {
        assert!(parse_summary(r#"["not", "an", "object"]"#).is_err());
        assert!(parse_summary("prose, not json").is_err());
    }
}
