use crate::error::{AppError, Result};

pub const KEEPA_API_URL: &str = "https://api.keepa.com";
pub const SLACK_API_URL: &str = "https://slack.com/api";

/// Maximum ASINs per Keepa /product call — amortizes the per-call overhead.
pub const MAX_GROUP_SIZE: usize = 100;

/// Keepa domain id for amazon.com.
pub const KEEPA_DOMAIN_US: u8 = 1;

/// Keepa charges $1 per 1000 tokens; 1 token per ASIN.
pub const TOKEN_COST_CENTS_PER_1000: i64 = 100;

/// Minimum gap between upstream fetch calls (milliseconds).
pub const FETCH_SPACING_MS: u64 = 1_000;

/// A run that finds at least this many transitions triggers a system alert.
pub const HIGH_ACTIVITY_THRESHOLD: usize = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub keepa_api_url: String,
    pub slack_api_url: String,
    /// Keepa API access key (KEEPA_API_KEY, required).
    pub keepa_api_key: String,
    /// Slack bot token (SLACK_BOT_TOKEN, required).
    pub slack_bot_token: String,
    /// Slack channel for alerts (SLACK_CHANNEL_ID).
    pub slack_channel_id: String,
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Minutes between scheduled batch runs (CHECK_INTERVAL_MINUTES).
    pub check_interval_minutes: u64,
    /// ASINs per upstream fetch call (BATCH_GROUP_SIZE, capped at MAX_GROUP_SIZE).
    pub batch_group_size: usize,
    /// Bounded retry attempts for fetch and notify (MAX_RETRIES).
    pub max_retries: u32,
    /// Backoff base delay in milliseconds (RETRY_BASE_DELAY_MS); doubles per attempt.
    pub retry_base_delay_ms: u64,
    /// Backoff cap in milliseconds (RETRY_MAX_DELAY_MS).
    pub retry_max_delay_ms: u64,
    /// Per-request timeout for Keepa and Slack calls (API_TIMEOUT_SECS).
    pub api_timeout_secs: u64,
    /// ASINs to seed into tracking on boot (TRACKED_ASINS, comma-separated).
    /// Example: "B0088PUEPK,B09B8V1LZ3"
    pub seed_asins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let keepa_api_key = std::env::var("KEEPA_API_KEY")
            .map_err(|_| AppError::Config("KEEPA_API_KEY is required".to_string()))?;
        let slack_bot_token = std::env::var("SLACK_BOT_TOKEN")
            .map_err(|_| AppError::Config("SLACK_BOT_TOKEN is required".to_string()))?;

        Ok(Self {
            keepa_api_url: std::env::var("KEEPA_API_URL")
                .unwrap_or_else(|_| KEEPA_API_URL.to_string()),
            slack_api_url: std::env::var("SLACK_API_URL")
                .unwrap_or_else(|_| SLACK_API_URL.to_string()),
            keepa_api_key,
            slack_bot_token,
            slack_channel_id: std::env::var("SLACK_CHANNEL_ID")
                .unwrap_or_else(|_| "#bestseller-alerts".to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "tracker.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            check_interval_minutes: std::env::var("CHECK_INTERVAL_MINUTES")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .unwrap_or(60),
            batch_group_size: std::env::var("BATCH_GROUP_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse::<usize>()
                .unwrap_or(MAX_GROUP_SIZE)
                .min(MAX_GROUP_SIZE),
            max_retries: std::env::var("MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse::<u32>()
                .unwrap_or(3),
            retry_base_delay_ms: std::env::var("RETRY_BASE_DELAY_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse::<u64>()
                .unwrap_or(500),
            retry_max_delay_ms: std::env::var("RETRY_MAX_DELAY_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse::<u64>()
                .unwrap_or(30_000),
            api_timeout_secs: std::env::var("API_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse::<u64>()
                .unwrap_or(30),
            seed_asins: std::env::var("TRACKED_ASINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}
