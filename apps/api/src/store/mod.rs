//! ReportStore — persistence operations the pipeline reasons about.
//!
//! Writes come in two scopes, and the difference is load-bearing:
//! - Evidence is replaced per (competency, level, document) unit inside one
//!   transaction, never touching sibling units. This is what makes Phase 1
//!   resume-after-crash safe.
//! - Analyses and the executive summary are replaced report-scoped, because
//!   their generation is all-or-nothing per report.

use std::collections::HashSet;

use sqlx::PgPool;
use uuid::Uuid;

use crate::models::analysis::{CompetencyAnalysisRow, ExecutiveSummary, ExecutiveSummaryRow, NewAnalysis};
use crate::models::dictionary::DictionaryRow;
use crate::models::document::DocumentRow;
use crate::models::evidence::{EvidenceRow, NewEvidence};
use crate::models::report::{ReportRow, ReportStatus};

/// The two fields the Cancellation Monitor polls.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ControlState {
    pub status: String,
    pub active_job_id: Option<Uuid>,
}

pub async fn get_report(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<ReportRow>> {
    sqlx::query_as("SELECT * FROM reports WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn control_state(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<ControlState>> {
    sqlx::query_as("SELECT status, active_job_id FROM reports WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn set_status(pool: &PgPool, id: Uuid, status: ReportStatus) -> sqlx::Result<()> {
    sqlx::query("UPDATE reports SET status = $2, updated_at = now() WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

/// Marks a report PROCESSING and installs the new job as authoritative.
/// Any older job still running will see the mismatched id and self-cancel.
pub async fn set_processing(pool: &PgPool, id: Uuid, job_id: Uuid) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE reports SET status = 'PROCESSING', active_job_id = $2, updated_at = now() WHERE id = $1",
    )
    .bind(id)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_dictionary(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<DictionaryRow>> {
    sqlx::query_as("SELECT * FROM competency_dictionaries WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// Documents with extracted text, in upload order. The ordering is part of
/// the pipeline contract: progress events and resume signatures must be
/// deterministic across retries.
pub async fn list_ready_documents(pool: &PgPool, report_id: Uuid) -> sqlx::Result<Vec<DocumentRow>> {
    sqlx::query_as(
        "SELECT * FROM documents WHERE report_id = $1 AND status = 'ready' ORDER BY created_at, id",
    )
    .bind(report_id)
    .fetch_all(pool)
    .await
}

pub async fn get_document(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<DocumentRow>> {
    sqlx::query_as("SELECT * FROM documents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn set_document_text(pool: &PgPool, id: Uuid, text: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE documents SET extracted_text = $2, status = $3 WHERE id = $1")
        .bind(id)
        .bind(text)
        .bind(crate::models::document::DOC_STATUS_READY)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_document_status(pool: &PgPool, id: Uuid, status: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE documents SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn list_knowledge_contexts(pool: &PgPool, project_id: Uuid) -> sqlx::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT content FROM knowledge_contexts WHERE project_id = $1 ORDER BY created_at, id",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(content,)| content).collect())
}

/// Canonical resume-set key for one Phase 1 unit.
pub fn unit_signature(competency: &str, level: i16, document_id: Uuid) -> String {
    format!("{competency}|{level}|{document_id}")
}

/// Signatures of units already completed by a previous attempt. Only
/// AI-generated rows count; manual highlights never suppress extraction.
pub async fn ai_evidence_signatures(pool: &PgPool, report_id: Uuid) -> sqlx::Result<HashSet<String>> {
    let rows: Vec<(String, i16, Option<Uuid>)> = sqlx::query_as(
        r#"
        SELECT DISTINCT competency, level, document_id
        FROM evidence
        WHERE report_id = $1 AND is_ai_generated = TRUE
        "#,
    )
    .bind(report_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(competency, level, document_id)| {
            document_id.map(|id| unit_signature(&competency, level, id))
        })
        .collect())
}

/// Replaces the AI evidence of exactly one (competency, level, document) unit.
/// Delete and insert share a transaction, so a crash mid-unit leaves either
/// the old rows or the new rows — never a mix, never duplicates.
pub async fn replace_unit_evidence(
    pool: &PgPool,
    report_id: Uuid,
    competency: &str,
    level: i16,
    document_id: Uuid,
    rows: &[NewEvidence],
) -> sqlx::Result<usize> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        DELETE FROM evidence
        WHERE report_id = $1 AND competency = $2 AND level = $3
          AND document_id = $4 AND is_ai_generated = TRUE
        "#,
    )
    .bind(report_id)
    .bind(competency)
    .bind(level)
    .bind(document_id)
    .execute(&mut *tx)
    .await?;

    for row in rows {
        sqlx::query(
            r#"
            INSERT INTO evidence
                (id, report_id, competency, level, key_behavior, quote, source_tag,
                 document_id, reasoning, is_ai_generated, is_archived)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(report_id)
        .bind(&row.competency)
        .bind(row.level)
        .bind(&row.key_behavior)
        .bind(&row.quote)
        .bind(&row.source_tag)
        .bind(row.document_id)
        .bind(&row.reasoning)
        .bind(row.is_ai_generated)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(rows.len())
}

pub async fn count_evidence(pool: &PgPool, report_id: Uuid) -> sqlx::Result<i64> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM evidence WHERE report_id = $1 AND is_archived = FALSE")
            .bind(report_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn list_evidence(pool: &PgPool, report_id: Uuid) -> sqlx::Result<Vec<EvidenceRow>> {
    sqlx::query_as(
        "SELECT * FROM evidence WHERE report_id = $1 ORDER BY competency, level, created_at",
    )
    .bind(report_id)
    .fetch_all(pool)
    .await
}

/// Active (non-archived) evidence feeding the Phase 2 judgment of one level.
pub async fn evidence_for_level(
    pool: &PgPool,
    report_id: Uuid,
    competency: &str,
    level: i16,
) -> sqlx::Result<Vec<EvidenceRow>> {
    sqlx::query_as(
        r#"
        SELECT * FROM evidence
        WHERE report_id = $1 AND competency = $2 AND level = $3 AND is_archived = FALSE
        ORDER BY created_at, id
        "#,
    )
    .bind(report_id)
    .bind(competency)
    .bind(level)
    .fetch_all(pool)
    .await
}

pub async fn insert_manual_evidence(
    pool: &PgPool,
    report_id: Uuid,
    row: &NewEvidence,
) -> sqlx::Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO evidence
            (id, report_id, competency, level, key_behavior, quote, source_tag,
             document_id, reasoning, is_ai_generated, is_archived)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, FALSE)
        "#,
    )
    .bind(id)
    .bind(report_id)
    .bind(&row.competency)
    .bind(row.level)
    .bind(&row.key_behavior)
    .bind(&row.quote)
    .bind(&row.source_tag)
    .bind(row.document_id)
    .bind(&row.reasoning)
    .execute(pool)
    .await?;
    Ok(id)
}

/// Replaces the full analysis set for a report in one transaction.
pub async fn replace_analyses(
    pool: &PgPool,
    report_id: Uuid,
    analyses: &[NewAnalysis],
) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM competency_analyses WHERE report_id = $1")
        .bind(report_id)
        .execute(&mut *tx)
        .await?;

    for analysis in analyses {
        sqlx::query(
            r#"
            INSERT INTO competency_analyses
                (id, report_id, competency, level_achieved, explanation,
                 development_recommendations, key_behaviors_status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(report_id)
        .bind(&analysis.competency)
        .bind(analysis.level_achieved)
        .bind(&analysis.explanation)
        .bind(serde_json::to_value(&analysis.development_recommendations).unwrap_or_default())
        .bind(serde_json::to_value(&analysis.key_behaviors_status).unwrap_or_default())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

pub async fn list_analyses(pool: &PgPool, report_id: Uuid) -> sqlx::Result<Vec<CompetencyAnalysisRow>> {
    sqlx::query_as("SELECT * FROM competency_analyses WHERE report_id = $1 ORDER BY competency")
        .bind(report_id)
        .fetch_all(pool)
        .await
}

/// Wholly replaces the report's executive summary.
pub async fn upsert_summary(
    pool: &PgPool,
    report_id: Uuid,
    summary: &ExecutiveSummary,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO executive_summaries
            (id, report_id, overview, strengths, weaknesses, recommendations)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (report_id) DO UPDATE SET
            overview = EXCLUDED.overview,
            strengths = EXCLUDED.strengths,
            weaknesses = EXCLUDED.weaknesses,
            recommendations = EXCLUDED.recommendations,
            updated_at = now()
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(report_id)
    .bind(&summary.overview)
    .bind(serde_json::to_value(&summary.strengths).unwrap_or_default())
    .bind(serde_json::to_value(&summary.weaknesses).unwrap_or_default())
    .bind(serde_json::to_value(&summary.recommendations).unwrap_or_default())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_summary(pool: &PgPool, report_id: Uuid) -> sqlx::Result<Option<ExecutiveSummaryRow>> {
    sqlx::query_as("SELECT * FROM executive_summaries WHERE report_id = $1")
        .bind(report_id)
        .fetch_optional(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_signature_format() {
        let doc = Uuid::nil();
        assert_eq!(
            unit_signature("Problem Solving", 2, doc),
            format!("Problem Solving|2|{doc}")
        );
    }

    #[test]
    fn test_unit_signature_distinguishes_levels_and_documents() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut set = HashSet::new();
        set.insert(unit_signature("C", 1, a));
        assert!(!set.contains(&unit_signature("C", 2, a)));
        assert!(!set.contains(&unit_signature("C", 1, b)));
        assert!(set.contains(&unit_signature("C", 1, a)));
    }
}
