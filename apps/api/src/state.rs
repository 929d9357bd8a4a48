use aws_sdk_s3::Client as S3Client;
use sqlx::PgPool;

use crate::config::Config;
use crate::events::EventChannel;

/// Shared application state injected into all route handlers via Axum extractors.
/// The LLM client lives only in the worker process; the HTTP process never
/// talks to the completion provider directly.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub events: EventChannel,
    pub s3: S3Client,
    pub config: Config,
}
