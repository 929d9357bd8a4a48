//! Worker process: claims jobs from the two queues and runs the pipeline.
//! May be scaled independently of the HTTP process; progress reaches users
//! through the redis-backed event channel.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api::config::Config;
use api::db::create_pool;
use api::events::EventChannel;
use api::ingest::IngestHandler;
use api::llm_client::AnthropicClient;
use api::models::report::Phase;
use api::pipeline::{PhaseJobHandler, PipelineCtx};
use api::queue::Worker;
use api::s3::build_s3_client;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Calibra worker v{}", env!("CARGO_PKG_VERSION"));

    let db = create_pool(&config.database_url).await?;

    let redis = redis::Client::open(config.redis_url.clone())?;
    let events = EventChannel::new(redis);
    info!("Event channel initialized");

    let s3 = build_s3_client(&config).await;
    info!("S3 client initialized");

    let llm = Arc::new(AnthropicClient::new(config.anthropic_api_key.clone()));
    info!(
        "LLM client initialized (main: {}, backup: {})",
        config.main_model, config.backup_model
    );

    // Constructed once here and passed by reference — no ambient singletons.
    let ctx = Arc::new(PipelineCtx {
        db: db.clone(),
        llm,
        events: events.clone(),
        config: config.clone(),
    });

    let shutdown = CancellationToken::new();

    // Generation and ingestion run as independent queues so a burst of
    // uploads never starves generation jobs, and vice versa.
    let mut generation = Worker::new(db.clone(), "generation", shutdown.clone());
    generation.register(Arc::new(PhaseJobHandler::new(ctx.clone(), Phase::Evidence)));
    generation.register(Arc::new(PhaseJobHandler::new(ctx.clone(), Phase::Analysis)));
    generation.register(Arc::new(PhaseJobHandler::new(ctx.clone(), Phase::Summary)));

    let mut ingestion = Worker::new(db.clone(), "ingestion", shutdown.clone());
    ingestion.register(Arc::new(IngestHandler::new(
        db.clone(),
        s3,
        config.s3_bucket.clone(),
        events,
    )));

    let generation_task = tokio::spawn(generation.run());
    let ingestion_task = tokio::spawn(ingestion.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining workers...");
    shutdown.cancel();
    let _ = tokio::join!(generation_task, ingestion_task);

    Ok(())
}
