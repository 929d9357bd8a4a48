//! Document upload and listing. The raw file goes to S3; text extraction
//! happens asynchronously on the ingestion queue.

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::errors::AppError;
use crate::ingest::INGEST_JOB_TYPE;
use crate::models::document::{DocumentRow, DOC_STATUS_UPLOADED};
use crate::queue::{self, EnqueueOptions};
use crate::state::AppState;
use crate::store;

/// POST /api/v1/reports/:id/documents (multipart: `file`, `source_tag`)
pub async fn handle_upload_document(
    State(state): State<AppState>,
    Path(report_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let report = store::get_report(&state.db, report_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Report {report_id} not found")))?;

    let mut filename: Option<String> = None;
    let mut bytes: Option<bytes::Bytes> = None;
    let mut source_tag: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(str::to_string);
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| AppError::Validation(format!("failed to read file: {e}")))?,
                );
            }
            Some("source_tag") => {
                source_tag = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| AppError::Validation(format!("invalid source_tag: {e}")))?,
                );
            }
            _ => {}
        }
    }

    let filename =
        filename.ok_or_else(|| AppError::Validation("missing 'file' field".to_string()))?;
    let bytes = bytes.ok_or_else(|| AppError::Validation("empty 'file' field".to_string()))?;
    let source_tag =
        source_tag.ok_or_else(|| AppError::Validation("missing 'source_tag' field".to_string()))?;

    let document_id = Uuid::new_v4();
    let storage_key = format!("reports/{report_id}/{document_id}/{filename}");

    state
        .s3
        .put_object()
        .bucket(&state.config.s3_bucket)
        .key(&storage_key)
        .body(bytes.to_vec().into())
        .send()
        .await
        .map_err(|e| AppError::S3(e.to_string()))?;

    sqlx::query(
        r#"
        INSERT INTO documents (id, report_id, filename, source_tag, storage_key, status)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(document_id)
    .bind(report_id)
    .bind(&filename)
    .bind(&source_tag)
    .bind(&storage_key)
    .bind(DOC_STATUS_UPLOADED)
    .execute(&state.db)
    .await?;

    queue::enqueue(
        &state.db,
        INGEST_JOB_TYPE,
        json!({"fileId": document_id, "path": storage_key, "userId": report.created_by}),
        EnqueueOptions::default(),
    )
    .await
    .map_err(|e| AppError::Queue(e.to_string()))?;

    Ok((
        StatusCode::CREATED,
        Json(json!({"id": document_id, "status": "uploaded"})),
    ))
}

/// GET /api/v1/reports/:id/documents
pub async fn handle_list_documents(
    State(state): State<AppState>,
    Path(report_id): Path<Uuid>,
) -> Result<Json<Vec<DocumentRow>>, AppError> {
    let documents: Vec<DocumentRow> =
        sqlx::query_as("SELECT * FROM documents WHERE report_id = $1 ORDER BY created_at, id")
            .bind(report_id)
            .fetch_all(&state.db)
            .await?;
    Ok(Json(documents))
}
