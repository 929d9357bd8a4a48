//! Phase 1 — Evidence Extraction.
//!
//! Iterates competency × level × source document, asking the model for
//! verbatim quotes per key behavior, streaming tokens out to the user as they
//! arrive. The phase is idempotent across retries: units already persisted by
//! a previous attempt are skipped via their evidence signatures, and each
//! unit's rows are replaced inside one transaction.

use std::collections::{HashMap, HashSet};

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::{EventChannel, EVT_AI_STREAM, EVT_EVIDENCE_BATCH_SAVED, EVT_GENERATION_COMPLETE};
use crate::llm_client::prompts::{QUOTE_FIDELITY_INSTRUCTION, SCOPE_INSTRUCTION};
use crate::llm_client::{CompletionRequest, ProviderError};
use crate::models::dictionary::CompetencyDictionary;
use crate::models::document::DocumentRow;
use crate::models::evidence::NewEvidence;
use crate::models::report::{Phase, ReportStatus};
use crate::pipeline::cancel::{CancelReason, CancellationMonitor};
use crate::pipeline::coerce::{coerce_array, get_str_ci, parse_llm_json, CoerceError};
use crate::pipeline::kb_match::canonicalize;
use crate::pipeline::prompts::{EVIDENCE_PROMPT_TEMPLATE, EVIDENCE_SYSTEM, EVIDENCE_TEMPERATURE};
use crate::pipeline::{model_for_attempt, GenerationJob, PipelineCtx, PipelineError};
use crate::queue::Job;
use crate::store;

/// One unit of extraction work: a single competency at a single level against
/// a single source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitKey {
    pub competency: String,
    pub level: i16,
    pub document_id: Uuid,
}

/// Enumerates the remaining units in the canonical order: dictionary order for
/// competencies, ladder order for levels, upload order for documents. The
/// ordering is fixed so progress events and partial evidence are deterministic
/// across resumes.
pub fn plan_units(
    dictionary: &CompetencyDictionary,
    documents: &[DocumentRow],
    completed: &HashSet<String>,
) -> Vec<UnitKey> {
    let mut units = Vec::new();
    for competency in &dictionary.competencies {
        for level in &competency.levels {
            for document in documents {
                let signature = store::unit_signature(&competency.name, level.level, document.id);
                if completed.contains(&signature) {
                    continue;
                }
                units.push(UnitKey {
                    competency: competency.name.clone(),
                    level: level.level,
                    document_id: document.id,
                });
            }
        }
    }
    units
}

pub async fn run_evidence_extraction(ctx: &PipelineCtx, job: &Job) -> Result<(), PipelineError> {
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

    let documents = store::list_ready_documents(&ctx.db, report_id).await?;
    if documents.is_empty() {
        return Err(PipelineError::MissingData(format!(
            "report {report_id} has no ingested documents"
        )));
    }
    let documents_by_id: HashMap<Uuid, &DocumentRow> =
        documents.iter().map(|d| (d.id, d)).collect();

    let knowledge = store::list_knowledge_contexts(&ctx.db, report.project_id).await?;

    let model = model_for_attempt(&ctx.config, job.attempt());
    let completed = store::ai_evidence_signatures(&ctx.db, report_id).await?;
    let units = plan_units(&dictionary, &documents, &completed);
    info!(
        "Phase 1 for report {report_id}: {} units remaining ({} already persisted), model {model}",
        units.len(),
        completed.len()
    );

    let mut skipped_units = 0usize;

    for unit in &units {
        monitor.check(report_id, job.id).await?;

        // plan_units only emits keys that exist in the dictionary and document set.
        let Some(competency) = dictionary.competency(&unit.competency) else {
            continue;
        };
        let Some(level) = competency.level(unit.level) else {
            continue;
        };
        let Some(document) = documents_by_id.get(&unit.document_id) else {
            continue;
        };

        let prompt = build_evidence_prompt(
            &unit.competency,
            level.level,
            &level.definition,
            &level.key_behaviors,
            document,
            report.specific_context.as_deref(),
            &knowledge,
        );
        let request = CompletionRequest {
            model,
            system: EVIDENCE_SYSTEM,
            prompt: &prompt,
            temperature: EVIDENCE_TEMPERATURE,
        };

        let (chunk_tx, forwarder) = spawn_stream_forwarder(&ctx.events, payload.user_id, report_id);
        let mut on_chunk = {
            let chunk_tx = chunk_tx.clone();
            move |fragment: &str| {
                let _ = chunk_tx.send(fragment.to_string());
            }
        };

        let watchdog = monitor.watchdog(report_id, job.id);
        let result = ctx
            .llm
            .complete_streaming(&request, watchdog.token(), &mut on_chunk)
            .await;
        let cancel_hit = watchdog.disarm().await;

        drop(on_chunk);
        drop(chunk_tx);
        let _ = forwarder.await;

        let text = match result {
            Ok(text) => text,
            Err(ProviderError::Aborted) => {
                return Err(PipelineError::Cancelled(cancel_hit.unwrap_or(
                    CancelReason::StatusChanged("unknown".to_string()),
                )));
            }
            Err(e) => return Err(e.into()),
        };

        // A single malformed response must not abort the whole phase; the
        // unit stays incomplete and a later retry picks it up again.
        match parse_evidence_response(&text, unit, &level.key_behaviors, &document.source_tag) {
            Ok(rows) => {
                let count = store::replace_unit_evidence(
                    &ctx.db,
                    report_id,
                    &unit.competency,
                    unit.level,
                    unit.document_id,
                    &rows,
                )
                .await?;
                ctx.events
                    .publish(
                        payload.user_id,
                        EVT_EVIDENCE_BATCH_SAVED,
                        json!({
                            "reportId": report_id,
                            "competency": unit.competency,
                            "count": count,
                        }),
                    )
                    .await;
            }
            Err(e) => {
                warn!(
                    "Phase 1 unit {}|{}|{} returned malformed output, skipping: {e}",
                    unit.competency, unit.level, unit.document_id
                );
                skipped_units += 1;
            }
        }
    }

    monitor.check(report_id, job.id).await?;

    let total = store::count_evidence(&ctx.db, report_id).await?;
    store::set_status(&ctx.db, report_id, ReportStatus::Completed).await?;

    let message = if skipped_units == 0 {
        format!("Evidence extraction finished with {total} evidence items")
    } else {
        format!(
            "Evidence extraction finished with {total} evidence items ({skipped_units} units skipped after malformed output; re-run to retry them)"
        )
    };
    ctx.events
        .publish(
            payload.user_id,
            EVT_GENERATION_COMPLETE,
            json!({
                "reportId": report_id,
                "phase": Phase::Evidence.number(),
                "status": "COMPLETED",
                "message": message,
                "count": total,
            }),
        )
        .await;

    info!("Phase 1 for report {report_id} completed: {total} evidence rows");
    Ok(())
}

/// Forwards streamed fragments to the Event Channel without blocking the
/// stream consumer on redis round-trips.
fn spawn_stream_forwarder(
    events: &EventChannel,
    user_id: Uuid,
    report_id: Uuid,
) -> (
    tokio::sync::mpsc::UnboundedSender<String>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let events = events.clone();
    let handle = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            events
                .publish(
                    user_id,
                    EVT_AI_STREAM,
                    json!({"reportId": report_id, "chunk": chunk}),
                )
                .await;
        }
    });
    (tx, handle)
}

fn build_evidence_prompt(
    competency: &str,
    level: i16,
    definition: &str,
    key_behaviors: &[String],
    document: &DocumentRow,
    specific_context: Option<&str>,
    knowledge: &[String],
) -> String {
    let key_behaviors_list = key_behaviors
        .iter()
        .map(|kb| format!("- {kb}"))
        .collect::<Vec<_>>()
        .join("\n");

    let mut extra_context = String::new();
    if let Some(context) = specific_context {
        if !context.trim().is_empty() {
            extra_context.push_str(&format!("\nASSESSMENT CONTEXT:\n{context}\n"));
        }
    }
    if !knowledge.is_empty() {
        extra_context.push_str(&format!("\nBACKGROUND KNOWLEDGE:\n{}\n", knowledge.join("\n\n")));
    }

    EVIDENCE_PROMPT_TEMPLATE
        .replace("{quote_fidelity}", QUOTE_FIDELITY_INSTRUCTION)
        .replace("{scope}", SCOPE_INSTRUCTION)
        .replace("{competency}", competency)
        .replace("{level}", &level.to_string())
        .replace("{definition}", definition)
        .replace("{key_behaviors}", &key_behaviors_list)
        .replace("{source_tag}", &document.source_tag)
        .replace("{document_text}", document.extracted_text.as_deref().unwrap_or(""))
        .replace("{extra_context}", &extra_context)
}

/// Parses one unit's extraction response into evidence rows. Key behaviors
/// are canonicalized against the dictionary text where a tolerant match
/// exists; items without a usable quote are dropped.
fn parse_evidence_response(
    text: &str,
    unit: &UnitKey,
    official_kbs: &[String],
    source_tag: &str,
) -> Result<Vec<NewEvidence>, CoerceError> {
    let value = parse_llm_json(text)?;
    let items = coerce_array(&value, "evidence")?;

    let mut rows = Vec::new();
    for item in &items {
        let Some(raw_kb) = get_str_ci(item, "key_behavior") else {
            continue;
        };
        let Some(quote) = get_str_ci(item, "quote").filter(|q| !q.trim().is_empty()) else {
            continue;
        };
        let key_behavior = canonicalize(raw_kb, official_kbs)
            .unwrap_or(raw_kb)
            .to_string();

        rows.push(NewEvidence {
            competency: unit.competency.clone(),
            level: unit.level,
            key_behavior,
            quote: quote.to_string(),
            source_tag: source_tag.to_string(),
            document_id: Some(unit.document_id),
            reasoning: get_str_ci(item, "reasoning").map(str::to_string),
            is_ai_generated: true,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn dictionary() -> CompetencyDictionary {
        serde_json::from_value(json!({
            "competencies": [
                {
                    "name": "Problem Solving",
                    "levels": [
                        {"level": 1, "definition": "d1", "key_behaviors": ["Identifies the core issue", "Gathers relevant facts"]},
                        {"level": 2, "definition": "d2", "key_behaviors": ["Generates alternatives", "Weighs trade-offs"]}
                    ]
                },
                {
                    "name": "Communication",
                    "levels": [
                        {"level": 1, "definition": "d1", "key_behaviors": ["Listens actively"]}
                    ]
                }
            ]
        }))
        .unwrap()
    }

    fn document(id: Uuid) -> DocumentRow {
        DocumentRow {
            id,
            report_id: Uuid::new_v4(),
            filename: "transcript.pdf".to_string(),
            source_tag: "Case Study".to_string(),
            storage_key: "reports/x/transcript.pdf".to_string(),
            extracted_text: Some("I listed the costs of each option.".to_string()),
            status: "ready".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_plan_units_orders_competency_level_document() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let docs = vec![document(doc_a), document(doc_b)];
        let units = plan_units(&dictionary(), &docs, &HashSet::new());

        assert_eq!(units.len(), 6); // (2 levels * 2 docs) + (1 level * 2 docs)
        assert_eq!(units[0].competency, "Problem Solving");
        assert_eq!(units[0].level, 1);
        assert_eq!(units[0].document_id, doc_a);
        assert_eq!(units[1].document_id, doc_b);
        assert_eq!(units[2].level, 2);
        assert_eq!(units[4].competency, "Communication");
    }

    #[test]
    fn test_plan_units_skips_completed_signatures() {
        let doc = Uuid::new_v4();
        let docs = vec![document(doc)];
        let mut completed = HashSet::new();
        completed.insert(store::unit_signature("Problem Solving", 1, doc));

        let units = plan_units(&dictionary(), &docs, &completed);
        assert_eq!(units.len(), 2);
        assert!(units
            .iter()
            .all(|u| !(u.competency == "Problem Solving" && u.level == 1)));
    }

    #[test]
    fn test_plan_units_empty_when_everything_done() {
        let doc = Uuid::new_v4();
        let docs = vec![document(doc)];
        let completed: HashSet<String> = [
            store::unit_signature("Problem Solving", 1, doc),
            store::unit_signature("Problem Solving", 2, doc),
            store::unit_signature("Communication", 1, doc),
        ]
        .into_iter()
        .collect();

        assert!(plan_units(&dictionary(), &docs, &completed).is_empty());
    }

    fn unit() -> UnitKey {
        UnitKey {
            competency: "Problem Solving".to_string(),
            level: 2,
            document_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_parse_evidence_canonicalizes_key_behaviors() {
        let official = vec!["Weighs trade-offs".to_string()];
        let text = r#"{"evidence": [{"key_behavior": "1. weighs trade-offs", "quote": "I listed the costs", "reasoning": "compares options"}]}"#;
        let rows = parse_evidence_response(text, &unit(), &official, "Case Study").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key_behavior, "Weighs trade-offs");
        assert!(rows[0].is_ai_generated);
        assert_eq!(rows[0].source_tag, "Case Study");
    }

    #[test]
    fn test_parse_evidence_keeps_raw_kb_when_no_match() {
        let official = vec!["Weighs trade-offs".to_string()];
        let text = r#"{"evidence": [{"key_behavior": "Delegates effectively", "quote": "q"}]}"#;
        let rows = parse_evidence_response(text, &unit(), &official, "Case Study").unwrap();
        assert_eq!(rows[0].key_behavior, "Delegates effectively");
        assert!(rows[0].reasoning.is_none());
    }

    #[test]
    fn test_parse_evidence_drops_items_without_quotes() {
        let official = vec!["Weighs trade-offs".to_string()];
        let text = r#"{"evidence": [
            {"key_behavior": "Weighs trade-offs", "quote": ""},
            {"key_behavior": "Weighs trade-offs"},
            {"key_behavior": "Weighs trade-offs", "quote": "kept"}
        ]}"#;
        let rows = parse_evidence_response(text, &unit(), &official, "Case Study").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quote, "kept");
    }

    #[test]
    fn test_parse_evidence_tolerates_capitalized_wrapper_and_fences() {
        let official = vec!["Weighs trade-offs".to_string()];
        let text = "```json\n{\"Evidence\": [{\"Key_behavior\": \"Weighs trade-offs\", \"Quote\": \"q\"}]}\n```";
        let rows = parse_evidence_response(text, &unit(), &official, "Case Study").unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_parse_evidence_empty_list_is_a_valid_result() {
        let rows =
            parse_evidence_response(r#"{"evidence": []}"#, &unit(), &[], "Case Study").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_parse_evidence_garbage_is_an_error() {
        assert!(parse_evidence_response("the model rambled", &unit(), &[], "Case Study").is_err());
    }
}
