use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Required variables fail fast at startup; pipeline tunables have defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub anthropic_api_key: String,
    pub port: u16,
    pub rust_log: String,

    /// Model used for the first half of a job's attempts.
    pub main_model: String,
    /// Model used once the main-model attempts are exhausted.
    pub backup_model: String,
    /// Fraction of key behaviors that must be fulfilled for a level to pass.
    pub pass_threshold: f64,
    /// Interval between cancellation polls while a completion call is in flight.
    pub cancel_poll_ms: u64,
    /// Max delivery attempts per generation job.
    pub job_attempts: u32,
    /// Base delay for the queue's exponential backoff.
    pub backoff_base_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            s3_bucket: require_env("S3_BUCKET")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            port: parse_env("PORT", "8080")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            main_model: std::env::var("MAIN_MODEL")
                .unwrap_or_else(|_| "claude-sonnet-4-5".to_string()),
            backup_model: std::env::var("BACKUP_MODEL")
                .unwrap_or_else(|_| "claude-3-5-haiku-latest".to_string()),
            pass_threshold: parse_env("PASS_THRESHOLD", "0.5")?,
            cancel_poll_ms: parse_env("CANCEL_POLL_MS", "1500")?,
            job_attempts: parse_env("JOB_ATTEMPTS", "6")?,
            backoff_base_ms: parse_env("BACKOFF_BASE_MS", "2000")?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T>(key: &str, default: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
        .with_context(|| format!("'{key}' must be a valid value"))
}
