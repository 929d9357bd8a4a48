pub mod documents;
pub mod events;
pub mod health;
pub mod reports;

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Reports
        .route("/api/v1/reports", post(reports::handle_create_report))
        .route("/api/v1/reports/:id", get(reports::handle_get_report))
        .route(
            "/api/v1/reports/:id/generate",
            post(reports::handle_generate),
        )
        .route("/api/v1/reports/:id/cancel", post(reports::handle_cancel))
        // Evidence
        .route(
            "/api/v1/reports/:id/evidence",
            get(reports::handle_list_evidence).post(reports::handle_create_evidence),
        )
        .route(
            "/api/v1/evidence/:id",
            patch(reports::handle_update_evidence),
        )
        // Phase 2 / 3 results
        .route(
            "/api/v1/reports/:id/analyses",
            get(reports::handle_list_analyses),
        )
        .route(
            "/api/v1/reports/:id/summary",
            get(reports::handle_get_summary),
        )
        // Documents
        .route(
            "/api/v1/reports/:id/documents",
            post(documents::handle_upload_document).get(documents::handle_list_documents),
        )
        // Live event stream
        .route("/api/v1/events", get(events::handle_events))
        .with_state(state)
}
