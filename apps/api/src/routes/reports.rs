//! Report endpoints: CRUD-light surface plus the pipeline trigger/cancel pair.
//!
//! Triggering is the only place `status` and `active_job_id` are written from
//! the HTTP side; everything after that belongs to the pipeline.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::analysis::{CompetencyAnalysisRow, ExecutiveSummaryRow};
use crate::models::evidence::{EvidenceRow, NewEvidence};
use crate::models::report::{Phase, ReportRow, ReportStatus};
use crate::queue::{self, EnqueueOptions};
use crate::state::AppState;
use crate::store;

#[derive(Debug, Deserialize)]
pub struct CreateReportRequest {
    pub title: String,
    pub project_id: Uuid,
    pub created_by: Uuid,
    pub dictionary_id: Uuid,
    /// Competency name -> target level.
    pub target_levels: serde_json::Value,
    #[serde(default)]
    pub specific_context: Option<String>,
    /// How far the pipeline should run; defaults to the full pipeline.
    #[serde(default)]
    pub target_phase: Option<i16>,
}

/// POST /api/v1/reports
pub async fn handle_create_report(
    State(state): State<AppState>,
    Json(req): Json<CreateReportRequest>,
) -> Result<(StatusCode, Json<ReportRow>), AppError> {
    if !req.target_levels.is_object() {
        return Err(AppError::Validation(
            "target_levels must be an object mapping competency names to levels".to_string(),
        ));
    }
    let target_phase = req.target_phase.unwrap_or(3);
    if Phase::from_number(target_phase).is_none() {
        return Err(AppError::Validation(format!(
            "target_phase must be 1, 2 or 3, got {target_phase}"
        )));
    }

    let report: ReportRow = sqlx::query_as(
        r#"
        INSERT INTO reports
            (id, title, project_id, created_by, status, target_phase,
             target_levels, specific_context, dictionary_id)
        VALUES ($1, $2, $3, $4, 'CREATED', $5, $6, $7, $8)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&req.title)
    .bind(req.project_id)
    .bind(req.created_by)
    .bind(target_phase)
    .bind(&req.target_levels)
    .bind(&req.specific_context)
    .bind(req.dictionary_id)
    .fetch_one(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(report)))
}

/// GET /api/v1/reports/:id
pub async fn handle_get_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReportRow>, AppError> {
    let report = store::get_report(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Report {id} not found")))?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    /// Phase to run; defaults to the report's target_phase.
    #[serde(default)]
    pub phase: Option<i16>,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub job_id: Uuid,
    pub phase: i16,
    pub status: String,
}

/// POST /api/v1/reports/:id/generate
///
/// Enqueues the phase job and installs it as the report's authoritative job.
/// A report already PROCESSING is rejected; cancel it first.
pub async fn handle_generate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<GenerateRequest>,
) -> Result<(StatusCode, Json<GenerateResponse>), AppError> {
    let report = store::get_report(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Report {id} not found")))?;

    if report.status() == Some(ReportStatus::Processing) {
        return Err(AppError::Conflict(
            "Report is already processing; cancel the running job first".to_string(),
        ));
    }

    let phase_number = req.phase.unwrap_or(report.target_phase);
    let phase = Phase::from_number(phase_number).ok_or_else(|| {
        AppError::Validation(format!("phase must be 1, 2 or 3, got {phase_number}"))
    })?;

    let payload = json!({"reportId": report.id, "userId": report.created_by});
    let job_id = queue::enqueue(
        &state.db,
        phase.job_type(),
        payload,
        EnqueueOptions {
            max_attempts: state.config.job_attempts,
            backoff_base_ms: state.config.backoff_base_ms,
        },
    )
    .await
    .map_err(|e| AppError::Queue(e.to_string()))?;

    store::set_processing(&state.db, report.id, job_id).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerateResponse {
            job_id,
            phase: phase.number(),
            status: ReportStatus::Processing.as_str().to_string(),
        }),
    ))
}

/// POST /api/v1/reports/:id/cancel
///
/// Flips the status away from PROCESSING; the running job's cancellation
/// monitor observes the change within one poll interval and stops.
pub async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let result = sqlx::query(
        "UPDATE reports SET status = 'CREATED', updated_at = now() WHERE id = $1 AND status = 'PROCESSING'",
    )
    .bind(id)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::Conflict(
            "Report is not processing; nothing to cancel".to_string(),
        ));
    }
    Ok(StatusCode::ACCEPTED)
}

/// GET /api/v1/reports/:id/evidence
pub async fn handle_list_evidence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<EvidenceRow>>, AppError> {
    Ok(Json(store::list_evidence(&state.db, id).await?))
}

/// POST /api/v1/reports/:id/evidence — manual highlighting.
/// Manual rows never carry the AI flag, so they are invisible to Phase 1's
/// resume logic and survive unit reprocessing.
pub async fn handle_create_evidence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(mut req): Json<NewEvidence>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    if req.quote.trim().is_empty() {
        return Err(AppError::Validation("quote must not be empty".to_string()));
    }
    req.is_ai_generated = false;
    let evidence_id = store::insert_manual_evidence(&state.db, id, &req).await?;
    Ok((StatusCode::CREATED, Json(json!({"id": evidence_id}))))
}

#[derive(Debug, Deserialize)]
pub struct UpdateEvidenceRequest {
    #[serde(default)]
    pub quote: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub is_archived: Option<bool>,
}

/// PATCH /api/v1/evidence/:id
pub async fn handle_update_evidence(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateEvidenceRequest>,
) -> Result<StatusCode, AppError> {
    let result = sqlx::query(
        r#"
        UPDATE evidence
        SET quote = COALESCE($2, quote),
            reasoning = COALESCE($3, reasoning),
            is_archived = COALESCE($4, is_archived),
            updated_at = now()
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(&req.quote)
    .bind(&req.reasoning)
    .bind(req.is_archived)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Evidence {id} not found")));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/reports/:id/analyses
pub async fn handle_list_analyses(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<CompetencyAnalysisRow>>, AppError> {
    Ok(Json(store::list_analyses(&state.db, id).await?))
}

/// GET /api/v1/reports/:id/summary
pub async fn handle_get_summary(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutiveSummaryRow>, AppError> {
    let summary = store::get_summary(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No summary for report {id}")))?;
    Ok(Json(summary))
}
