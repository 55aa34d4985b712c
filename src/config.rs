use std::time::Duration;

use crate::error::{AppError, Result};

/// Public mini-sidechain observer used when no API URL is configured.
pub const DEFAULT_API_URL: &str = "https://mini.p2pool.observer";
pub const DEFAULT_PRICE_API_URL: &str = "https://api.coingecko.com/api/v3";

/// Per-call timeout for upstream requests.
pub const FETCH_TIMEOUT_SECS: u64 = 10;

/// Retry defaults: 3 retries after the first attempt, 1s doubling up to 10s.
pub const RETRY_MAX_RETRIES: u32 = 3;
pub const RETRY_BASE_DELAY_MS: u64 = 1_000;
pub const RETRY_MAX_DELAY_MS: u64 = 10_000;
pub const RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Channel capacity for fetch notices. Notices are dropped when full.
pub const NOTICE_CHANNEL_CAPACITY: usize = 256;

/// Polling intervals (seconds) per entity volatility.
pub mod poll_intervals {
    pub const POOL_INFO_SECS: u64 = 30;
    pub const SHARES_SECS: u64 = 30;
    pub const FOUND_BLOCKS_SECS: u64 = 30;
    pub const MINER_INFO_SECS: u64 = 30;
    pub const MINER_SHARES_SECS: u64 = 30;
    pub const MINER_BLOCKS_SECS: u64 = 30;
    pub const WINDOW_SHARES_SECS: u64 = 30;
    pub const PAYOUTS_SECS: u64 = 120;
    pub const PRICE_SECS: u64 = 300;
}

/// Initial page sizes for list entities and the `load_more` step.
pub const DEFAULT_SHARES_LIMIT: usize = 50;
pub const DEFAULT_BLOCKS_LIMIT: usize = 50;
pub const DEFAULT_PAYOUTS_LIMIT: usize = 50;
pub const DEFAULT_MINER_LIMIT: usize = 50;
pub const LOAD_MORE_INCREMENT: usize = 50;

/// Cache retention per partition (seconds). Metadata is never cleaned.
pub mod retention {
    const DAY: u64 = 24 * 3_600;
    pub const POOL_INFO_SECS: u64 = DAY;
    pub const MINER_INFO_SECS: u64 = 7 * DAY;
    pub const SHARES_SECS: u64 = 30 * DAY;
    pub const BLOCKS_SECS: u64 = 365 * DAY;
    pub const PAYOUTS_SECS: u64 = 365 * DAY;
}

/// Cache cleanup cadence: once shortly after startup, then hourly.
pub const CACHE_CLEANUP_STARTUP_DELAY_SECS: u64 = 5;
pub const CACHE_CLEANUP_INTERVAL_SECS: u64 = 3_600;

/// Miner-scoped reconstruction bounds for the historical path.
pub mod reconstruction {
    pub const INITIAL_BATCH_SIZE: usize = 200;
    pub const BATCH_GROWTH_FACTOR: usize = 2;
    pub const MAX_BATCH_SIZE: usize = 2_000;
    pub const MAX_ATTEMPTS: usize = 5;
}

/// Price older than this is logged as stale.
pub const PRICE_STALE_SECS: u64 = 600;

/// How often the status reporter logs a summary line.
pub const STATUS_REPORT_INTERVAL_SECS: u64 = 60;

/// Well-known preference keys in the metadata partition.
pub const PREF_ADDRESS_KEY: &str = "p2pool_address";
pub const PREF_API_URL_KEY: &str = "p2pool_api_url";

#[derive(Debug, Clone)]
pub struct Config {
    /// Observer API base URL (P2POOL_API_URL). None = restore from cache or default.
    pub api_url: Option<String>,
    /// Tracked miner address (MINER_ADDRESS). None = restore from cache.
    pub miner_address: Option<String>,
    pub price_api_url: String,
    pub log_level: String,
    pub db_path: String,
    pub relay_port: u16,
    pub fetch_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_url: non_empty_var("P2POOL_API_URL").map(|u| normalize_base_url(&u)),
            miner_address: non_empty_var("MINER_ADDRESS"),
            price_api_url: std::env::var("PRICE_API_URL")
                .map(|u| normalize_base_url(&u))
                .unwrap_or_else(|_| DEFAULT_PRICE_API_URL.to_string()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "observer-cache.db".to_string()),
            relay_port: std::env::var("RELAY_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("RELAY_PORT must be a valid port number".to_string()))?,
            fetch_timeout: Duration::from_secs(
                std::env::var("FETCH_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .filter(|s| *s > 0)
                    .unwrap_or(FETCH_TIMEOUT_SECS),
            ),
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Trim whitespace and trailing slashes so cache keys built from the URL are stable.
pub fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        assert_eq!(normalize_base_url(" https://mini.p2pool.observer/ "), "https://mini.p2pool.observer");
        assert_eq!(normalize_base_url("http://x//"), "http://x");
    }
}
