//! Phase 2 — Competency-Level Judgment.
//!
//! For each competency with a configured target level the orchestrator walks
//! the ladder: judge the target first, always sweep the foundation down to
//! level 1, then probe upward only while levels keep passing. The achieved
//! level obeys prefix closure — the highest N with levels 1..N all passed —
//! so a candidate is never certified above a failed foundational level.
//!
//! Persistence is report-scoped: the full analysis set is replaced in one
//! transaction after all competencies finish. The walk makes level outcomes
//! interdependent, so partial resume at sub-report granularity would be
//! unsound; a retry redoes the whole phase.

use std::collections::BTreeMap;
use std::future::Future;

use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::events::{EVT_ANALYSIS_PROGRESS, EVT_GENERATION_COMPLETE};
use crate::llm_client::prompts::SCOPE_INSTRUCTION;
use crate::llm_client::{CompletionRequest, ProviderError};
use crate::models::analysis::{DevelopmentRecommendations, KeyBehaviorStatus, NewAnalysis};
use crate::models::dictionary::{Competency, LevelDefinition};
use crate::models::evidence::EvidenceRow;
use crate::models::report::{Phase, ReportStatus};
use crate::pipeline::cancel::{CancelReason, CancellationMonitor, Watchdog};
use crate::pipeline::coerce::{coerce_array, get_str_ci, lowercase_keys, parse_llm_json};
use crate::pipeline::prompts::{
    ANOMALY_NOTE, JUDGMENT_PROMPT_TEMPLATE, JUDGMENT_SYSTEM, JUDGMENT_TEMPERATURE,
    NARRATIVE_PROMPT_TEMPLATE, NARRATIVE_SYSTEM, NARRATIVE_TEMPERATURE,
};
use crate::pipeline::{model_for_attempt, GenerationJob, PipelineCtx, PipelineError};
use crate::queue::Job;
use crate::store;

/// One key behavior's verdict at one level.
#[derive(Debug, Clone)]
pub struct KbEvaluation {
    pub key_behavior: String,
    pub fulfilled: bool,
    pub reasoning: String,
    pub quotes: Vec<String>,
}

/// Outcome of judging one level of one competency.
#[derive(Debug, Clone)]
pub struct LevelOutcome {
    pub level: i16,
    pub pass_ratio: f64,
    pub passed: bool,
    pub evaluations: Vec<KbEvaluation>,
}

/// Walks the competency ladder. Evaluation order: the target level first,
/// then every level below it down to 1 (the foundation sweep always runs),
/// then — only if the target passed — successively higher levels until the
/// first failure caps the ceiling.
pub async fn walk_levels<F, Fut>(
    target: i16,
    max_level: i16,
    mut evaluate: F,
) -> Result<BTreeMap<i16, LevelOutcome>, PipelineError>
where
    F: FnMut(i16) -> Fut,
    Fut: Future<Output = Result<LevelOutcome, PipelineError>>,
{
    let mut outcomes = BTreeMap::new();

    let target_outcome = evaluate(target).await?;
    let target_passed = target_outcome.passed;
    outcomes.insert(target, target_outcome);

    for level in (1..target).rev() {
        let outcome = evaluate(level).await?;
        outcomes.insert(level, outcome);
    }

    if target_passed {
        let mut level = target + 1;
        while level <= max_level {
            let outcome = evaluate(level).await?;
            let passed = outcome.passed;
            outcomes.insert(level, outcome);
            if !passed {
                break;
            }
            level += 1;
        }
    }

    Ok(outcomes)
}

/// The achieved level is the largest N such that every level 1..N passed —
/// not the highest individually-passing level.
pub fn final_level(outcomes: &BTreeMap<i16, LevelOutcome>) -> i16 {
    let mut level = 0;
    while let Some(outcome) = outcomes.get(&(level + 1)) {
        if !outcome.passed {
            break;
        }
        level += 1;
    }
    level
}

/// True when any lower level failed while some higher level passed. Such a
/// trail must surface as an inconsistency instead of silently inflating the
/// score.
pub fn has_anomaly(outcomes: &BTreeMap<i16, LevelOutcome>) -> bool {
    let mut seen_failure = false;
    for outcome in outcomes.values() {
        if !outcome.passed {
            seen_failure = true;
        } else if seen_failure {
            return true;
        }
    }
    false
}

/// Aligns the model's evaluations with the official key-behavior list:
/// exactly one entry per defined key behavior, in dictionary order. A key
/// behavior the model did not address counts as unfulfilled.
pub fn align_evaluations(parsed: Vec<KbEvaluation>, official: &[String]) -> Vec<KbEvaluation> {
    official
        .iter()
        .map(|kb| {
            parsed
                .iter()
                .find(|e| {
                    crate::pipeline::kb_match::normalize_kb(&e.key_behavior)
                        == crate::pipeline::kb_match::normalize_kb(kb)
                })
                .map(|e| KbEvaluation {
                    key_behavior: kb.clone(),
                    fulfilled: e.fulfilled,
                    reasoning: e.reasoning.clone(),
                    quotes: e.quotes.clone(),
                })
                .unwrap_or_else(|| KbEvaluation {
                    key_behavior: kb.clone(),
                    fulfilled: false,
                    reasoning: "Not addressed by the evaluation output.".to_string(),
                    quotes: Vec::new(),
                })
        })
        .collect()
}

/// Fraction of key behaviors marked fulfilled.
pub fn pass_ratio(evaluations: &[KbEvaluation]) -> f64 {
    if evaluations.is_empty() {
        return 0.0;
    }
    let fulfilled = evaluations.iter().filter(|e| e.fulfilled).count();
    fulfilled as f64 / evaluations.len() as f64
}

/// Prepends a deterministic inconsistency marker so the anomaly survives in
/// the persisted explanation even if the narrative model downplays it.
pub fn compose_explanation(anomaly: bool, narrative: &str) -> String {
    if anomaly {
        format!(
            "Scoring inconsistency: at least one level below a passed level did not meet its threshold. {narrative}"
        )
    } else {
        narrative.to_string()
    }
}

pub async fn run_level_judgment(ctx: &PipelineCtx, job: &Job) -> Result<(), PipelineError> {
    let payload = GenerationJob::from_payload(&job.payload)?;
    let report_id = payload.report_id;
    let monitor = ctx.monitor();
    monitor.check(report_id, job.id).await?;

    let report = store::get_report(&ctx.db, report_id)
        .await?
        .ok_or_else(|| PipelineError::MissingData(format!("report {report_id} not found")))?;

    let dictionary_row = store::get_dictionary(&ctx.db, report.dictionary_id)
        .await?
        .ok_or_else(|| {
            PipelineError::MissingData(format!("dictionary {} not found", report.dictionary_id))
        })?;
    let dictionary = dictionary_row.parse().map_err(|e| {
        PipelineError::MissingData(format!("dictionary {} is malformed: {e}", dictionary_row.id))
    })?;

    let targets = report.target_levels();
    if targets.is_empty() {
        return Err(PipelineError::MissingData(format!(
            "report {report_id} has no target levels configured"
        )));
    }

    let model = model_for_attempt(&ctx.config, job.attempt());
    let threshold = ctx.config.pass_threshold;
    info!(
        "Phase 2 for report {report_id}: {} targeted competencies, threshold {threshold}, model {model}",
        targets.len()
    );

    let mut analyses: Vec<NewAnalysis> = Vec::new();

    // Dictionary order, not target-map order: progress must be deterministic.
    for competency in &dictionary.competencies {
        let Some(&raw_target) = targets.get(&competency.name) else {
            continue;
        };
        monitor.check(report_id, job.id).await?;

        let max_level = competency.max_level();
        if max_level == 0 {
            return Err(PipelineError::MissingData(format!(
                "competency '{}' has no levels defined",
                competency.name
            )));
        }
        let target = raw_target.clamp(1, max_level);

        let monitor_ref = &monitor;
        let payload_ref = &payload;
        let outcomes = walk_levels(target, max_level, move |level| {
            evaluate_level(ctx, monitor_ref, job, payload_ref, competency, level, model, threshold)
        })
        .await?;

        let level_achieved = final_level(&outcomes);
        let anomaly = has_anomaly(&outcomes);
        let trail: Vec<KeyBehaviorStatus> = outcomes
            .values()
            .flat_map(|outcome| {
                outcome.evaluations.iter().map(|e| KeyBehaviorStatus {
                    level: outcome.level,
                    key_behavior: e.key_behavior.clone(),
                    fulfilled: e.fulfilled,
                    explanation: e.reasoning.clone(),
                    quotes: e.quotes.clone(),
                })
            })
            .collect();

        monitor.check(report_id, job.id).await?;
        let narrative = generate_narrative(
            ctx,
            &monitor,
            job,
            &payload,
            &competency.name,
            target,
            level_achieved,
            anomaly,
            &trail,
            model,
        )
        .await?;

        analyses.push(NewAnalysis {
            competency: competency.name.clone(),
            level_achieved,
            explanation: compose_explanation(anomaly, &narrative.explanation),
            development_recommendations: narrative.development_recommendations,
            key_behaviors_status: trail,
        });

        ctx.events
            .publish(
                payload.user_id,
                EVT_ANALYSIS_PROGRESS,
                json!({"reportId": report_id, "competency": competency.name}),
            )
            .await;
        info!(
            "Phase 2: '{}' achieved level {level_achieved} (target {target}, anomaly {anomaly})",
            competency.name
        );
    }

    if analyses.is_empty() {
        return Err(PipelineError::MissingData(format!(
            "report {report_id} targets no competency present in dictionary {}",
            report.dictionary_id
        )));
    }

    monitor.check(report_id, job.id).await?;
    store::replace_analyses(&ctx.db, report_id, &analyses).await?;
    store::set_status(&ctx.db, report_id, ReportStatus::Completed).await?;

    ctx.events
        .publish(
            payload.user_id,
            EVT_GENERATION_COMPLETE,
            crate::events::phase_payload(
                report_id,
                Phase::Analysis,
                "COMPLETED",
                &format!("Analyzed {} competencies", analyses.len()),
            ),
        )
        .await;

    info!("Phase 2 for report {report_id} completed: {} analyses", analyses.len());
    Ok(())
}

/// Judges every key behavior of one level against the collected evidence.
#[allow(clippy::too_many_arguments)]
async fn evaluate_level(
    ctx: &PipelineCtx,
    monitor: &CancellationMonitor,
    job: &Job,
    payload: &GenerationJob,
    competency: &Competency,
    level: i16,
    model: &str,
    threshold: f64,
) -> Result<LevelOutcome, PipelineError> {
    let level_def = competency.level(level).ok_or_else(|| {
        PipelineError::MissingData(format!(
            "competency '{}' has a gap at level {level}",
            competency.name
        ))
    })?;

    let evidence =
        store::evidence_for_level(&ctx.db, payload.report_id, &competency.name, level).await?;
    let prompt = build_judgment_prompt(&competency.name, level_def, &evidence);
    let request = CompletionRequest {
        model,
        system: JUDGMENT_SYSTEM,
        prompt: &prompt,
        temperature: JUDGMENT_TEMPERATURE,
    };

    let watchdog = monitor.watchdog(payload.report_id, job.id);
    let result = ctx.llm.complete(&request, watchdog.token()).await;
    let text = resolve_call(result, watchdog).await?;

    let parsed = parse_evaluations(&text)?;
    let evaluations = align_evaluations(parsed, &level_def.key_behaviors);
    let ratio = pass_ratio(&evaluations);

    Ok(LevelOutcome {
        level,
        pass_ratio: ratio,
        passed: ratio >= threshold,
        evaluations,
    })
}

/// Output shape of the narrative call.
#[derive(Debug, Deserialize)]
pub struct NarrativeOutput {
    pub explanation: String,
    #[serde(default)]
    pub development_recommendations: DevelopmentRecommendations,
}

#[allow(clippy::too_many_arguments)]
async fn generate_narrative(
    ctx: &PipelineCtx,
    monitor: &CancellationMonitor,
    job: &Job,
    payload: &GenerationJob,
    competency: &str,
    target: i16,
    level_achieved: i16,
    anomaly: bool,
    trail: &[KeyBehaviorStatus],
    model: &str,
) -> Result<NarrativeOutput, PipelineError> {
    let trail_json = serde_json::to_string_pretty(trail)
        .map_err(|e| PipelineError::Malformed(format!("failed to serialize trail: {e}")))?;

    let prompt = NARRATIVE_PROMPT_TEMPLATE
        .replace("{competency}", competency)
        .replace("{target_level}", &target.to_string())
        .replace("{level_achieved}", &level_achieved.to_string())
        .replace("{anomaly_note}", if anomaly { ANOMALY_NOTE } else { "" })
        .replace("{trail_json}", &trail_json);

    let request = CompletionRequest {
        model,
        system: NARRATIVE_SYSTEM,
        prompt: &prompt,
        temperature: NARRATIVE_TEMPERATURE,
    };

    let watchdog = monitor.watchdog(payload.report_id, job.id);
    let result = ctx.llm.complete(&request, watchdog.token()).await;
    let text = resolve_call(result, watchdog).await?;

    parse_narrative(&text)
}

/// Maps an aborted provider call back to the cancellation reason the
/// watchdog recorded.
pub(crate) async fn resolve_call(
    result: Result<String, ProviderError>,
    watchdog: Watchdog,
) -> Result<String, PipelineError> {
    let cancel_hit = watchdog.disarm().await;
    match result {
        Ok(text) => Ok(text),
        Err(ProviderError::Aborted) => Err(PipelineError::Cancelled(
            cancel_hit.unwrap_or(CancelReason::StatusChanged("unknown".to_string())),
        )),
        Err(e) => Err(e.into()),
    }
}

fn build_judgment_prompt(
    competency: &str,
    level_def: &LevelDefinition,
    evidence: &[EvidenceRow],
) -> String {
    let key_behaviors_list = level_def
        .key_behaviors
        .iter()
        .map(|kb| format!("- {kb}"))
        .collect::<Vec<_>>()
        .join("\n");

    let evidence_json = serde_json::to_string_pretty(
        &evidence
            .iter()
            .map(|e| {
                json!({
                    "key_behavior": e.key_behavior,
                    "quote": e.quote,
                    "source": e.source_tag,
                    "reasoning": e.reasoning,
                })
            })
            .collect::<Vec<_>>(),
    )
    .unwrap_or_else(|_| "[]".to_string());

    JUDGMENT_PROMPT_TEMPLATE
        .replace("{scope}", SCOPE_INSTRUCTION)
        .replace("{competency}", competency)
        .replace("{level}", &level_def.level.to_string())
        .replace("{definition}", &level_def.definition)
        .replace("{key_behaviors}", &key_behaviors_list)
        .replace("{evidence_json}", &evidence_json)
}

/// Parses the judgment response into evaluations. Tolerates the wrapper
/// variants handled by `coerce` plus missing quotes arrays.
fn parse_evaluations(text: &str) -> Result<Vec<KbEvaluation>, PipelineError> {
    let value = parse_llm_json(text)
        .map_err(|e| PipelineError::Malformed(format!("judgment output: {e}")))?;
    let items = coerce_array(&value, "evaluations")
        .map_err(|e| PipelineError::Malformed(format!("judgment output: {e}")))?;

    let mut evaluations = Vec::new();
    for item in &items {
        let Some(key_behavior) = get_str_ci(item, "key_behavior") else {
            continue;
        };
        let fulfilled = item
            .get("fulfilled")
            .or_else(|| item.get("Fulfilled"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let quotes = item
            .get("quotes")
            .or_else(|| item.get("Quotes"))
            .and_then(serde_json::Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(|q| q.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        evaluations.push(KbEvaluation {
            key_behavior: key_behavior.to_string(),
            fulfilled,
            reasoning: get_str_ci(item, "reasoning").unwrap_or("").to_string(),
            quotes,
        });
    }

    if evaluations.is_empty() && !items.is_empty() {
        return Err(PipelineError::Malformed(
            "judgment output contained no usable evaluations".to_string(),
        ));
    }
    Ok(evaluations)
}

/// Parses the narrative response, falling back to a lowercased-key remap of
/// the same value before giving up.
fn parse_narrative(text: &str) -> Result<NarrativeOutput, PipelineError> {
    let value = parse_llm_json(text)
        .map_err(|e| PipelineError::Malformed(format!("narrative output: {e}")))?;

    serde_json::from_value::<NarrativeOutput>(value.clone())
        .or_else(|_| serde_json::from_value(lowercase_keys(&value)))
        .map_err(|e| PipelineError::Malformed(format!("narrative output: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn outcome(level: i16, passed: bool) -> LevelOutcome {
        LevelOutcome {
            level,
            pass_ratio: if passed { 1.0 } else { 0.0 },
            passed,
            evaluations: Vec::new(),
        }
    }

    /// Builds a stub evaluator over a pass/fail table indexed by level 1..=n,
    /// recording evaluation order.
    fn stub<'a>(
        passes: &'a [bool],
        order: &'a Mutex<Vec<i16>>,
        calls: &'a AtomicUsize,
    ) -> impl FnMut(i16) -> std::future::Ready<Result<LevelOutcome, PipelineError>> + 'a {
        move |level: i16| {
            calls.fetch_add(1, Ordering::SeqCst);
            order.lock().unwrap().push(level);
            let passed = passes[(level - 1) as usize];
            std::future::ready(Ok(outcome(level, passed)))
        }
    }

    #[tokio::test]
    async fn test_walk_evaluates_target_then_foundation_then_growth() {
        let order = Mutex::new(Vec::new());
        let calls = AtomicUsize::new(0);
        let passes = [true, true, true, true, false];

        let outcomes = walk_levels(3, 5, stub(&passes, &order, &calls)).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1, 4, 5]);
        assert_eq!(outcomes.len(), 5);
        assert_eq!(final_level(&outcomes), 4);
        assert!(!has_anomaly(&outcomes));
    }

    #[tokio::test]
    async fn test_walk_foundation_runs_even_when_target_fails() {
        let order = Mutex::new(Vec::new());
        let calls = AtomicUsize::new(0);
        let passes = [true, true, false, true, true];

        let outcomes = walk_levels(3, 5, stub(&passes, &order, &calls)).await.unwrap();

        // No growth probing above a failed target.
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(final_level(&outcomes), 2);
    }

    #[tokio::test]
    async fn test_walk_growth_stops_at_first_failure() {
        let order = Mutex::new(Vec::new());
        let calls = AtomicUsize::new(0);
        // Level 3 fails: growth from target 1 must stop there, never reach 4/5.
        let passes = [true, true, false, true, true];

        let outcomes = walk_levels(1, 5, stub(&passes, &order, &calls)).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(final_level(&outcomes), 2);
    }

    #[test]
    fn test_final_level_is_prefix_closed() {
        // pass = [T, T, F, T, T] -> final level 2 even though 4 and 5 passed.
        let outcomes: BTreeMap<i16, LevelOutcome> = [
            (1, true),
            (2, true),
            (3, false),
            (4, true),
            (5, true),
        ]
        .into_iter()
        .map(|(level, passed)| (level, outcome(level, passed)))
        .collect();

        assert_eq!(final_level(&outcomes), 2);
        assert!(has_anomaly(&outcomes));
    }

    #[test]
    fn test_final_level_zero_when_level_one_fails() {
        let outcomes: BTreeMap<i16, LevelOutcome> =
            [(1, false), (2, true)].into_iter().map(|(l, p)| (l, outcome(l, p))).collect();
        assert_eq!(final_level(&outcomes), 0);
        assert!(has_anomaly(&outcomes), "lower fail under higher pass must flag");
    }

    #[test]
    fn test_no_anomaly_for_clean_descending_trail() {
        let outcomes: BTreeMap<i16, LevelOutcome> =
            [(1, true), (2, true), (3, false)].into_iter().map(|(l, p)| (l, outcome(l, p))).collect();
        assert!(!has_anomaly(&outcomes));
        assert_eq!(final_level(&outcomes), 2);
    }

    #[test]
    fn test_pass_ratio_and_threshold_scenario() {
        // 2/2, 2/2, 0/2 at threshold 0.5 -> level 2, no anomaly.
        let eval = |fulfilled: bool| KbEvaluation {
            key_behavior: "kb".to_string(),
            fulfilled,
            reasoning: String::new(),
            quotes: Vec::new(),
        };
        let full = vec![eval(true), eval(true)];
        let none = vec![eval(false), eval(false)];
        assert_eq!(pass_ratio(&full), 1.0);
        assert_eq!(pass_ratio(&none), 0.0);

        let threshold = 0.5;
        let outcomes: BTreeMap<i16, LevelOutcome> = [
            (1, pass_ratio(&full)),
            (2, pass_ratio(&full)),
            (3, pass_ratio(&none)),
        ]
        .into_iter()
        .map(|(level, ratio)| {
            (
                level,
                LevelOutcome {
                    level,
                    pass_ratio: ratio,
                    passed: ratio >= threshold,
                    evaluations: Vec::new(),
                },
            )
        })
        .collect();

        assert_eq!(final_level(&outcomes), 2);
        assert!(!has_anomaly(&outcomes));
    }

    #[test]
    fn test_align_evaluations_fills_missing_and_reorders() {
        let official = vec!["Identifies the core issue".to_string(), "Gathers relevant facts".to_string()];
        let parsed = vec![KbEvaluation {
            key_behavior: "2. gathers relevant facts".to_string(),
            fulfilled: true,
            reasoning: "r".to_string(),
            quotes: vec!["q".to_string()],
        }];

        let aligned = align_evaluations(parsed, &official);
        assert_eq!(aligned.len(), 2);
        assert_eq!(aligned[0].key_behavior, "Identifies the core issue");
        assert!(!aligned[0].fulfilled);
        assert_eq!(aligned[1].key_behavior, "Gathers relevant facts");
        assert!(aligned[1].fulfilled);
    }

    #[test]
    fn test_parse_evaluations_tolerates_variants() {
        let text = r#"{"Evaluations": [{"Key_behavior": "kb", "Fulfilled": true, "Reasoning": "r"}]}"#;
        let evaluations = parse_evaluations(text).unwrap();
        assert_eq!(evaluations.len(), 1);
        assert!(evaluations[0].fulfilled);
        assert!(evaluations[0].quotes.is_empty());
    }

    #[test]
    fn test_parse_narrative_remaps_capitalized_keys() {
        let text = r#"{"Explanation": "solid", "Development_recommendations": {"Personal_development": ["read"], "Assignment": ["lead"], "Training": ["course"]}}"#;
        let narrative = parse_narrative(text).unwrap();
        assert_eq!(narrative.explanation, "solid");
        assert_eq!(narrative.development_recommendations.assignment, vec!["lead"]);
    }

    #[test]
    fn test_compose_explanation_embeds_anomaly_marker() {
        let text = compose_explanation(true, "The candidate showed strong analysis.");
        assert!(text.contains("Scoring inconsistency"));
        assert!(text.ends_with("The candidate showed strong analysis."));
        assert_eq!(compose_explanation(false, "x"), "x");
    }
}
