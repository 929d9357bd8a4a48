//! SSE bridge: subscribes to the user's redis channel and forwards published
//! events to the browser. Worker processes publish; this process relays.

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::events::split_envelope;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

/// GET /api/v1/events?user_id=
pub async fn handle_events(
    State(state): State<AppState>,
    Query(params): Query<UserIdQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let pubsub = state
        .events
        .subscribe(params.user_id)
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("redis subscribe failed: {e}")))?;

    let stream = pubsub.into_on_message().filter_map(|msg| async move {
        let raw: String = msg.get_payload().ok()?;
        let (event, payload) = split_envelope(&raw)?;
        Some(Ok::<_, Infallible>(
            Event::default().event(event).data(payload.to_string()),
        ))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
