use anyhow::{Context, Result};
use std::env;

/// Everything the worker process needs at startup. Mirrors the
/// `.env`-backed `from_env()` shape the rest of the workspace uses:
/// required external credentials fail loudly, intervals/bounds fall back to
/// conservative defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,
    pub alpaca_base_url: String,
    pub trigger_scan_interval_seconds: u64,
    pub monitor_poll_interval_seconds: u64,
    pub janitor_sweep_interval_seconds: u64,
    pub approval_sweep_interval_seconds: u64,
    pub max_concurrent_executions: usize,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:engine.db".to_string()),
            alpaca_api_key: env::var("ALPACA_API_KEY").context("ALPACA_API_KEY not set")?,
            alpaca_secret_key: env::var("ALPACA_SECRET_KEY").context("ALPACA_SECRET_KEY not set")?,
            alpaca_base_url: env::var("ALPACA_BASE_URL")
                .unwrap_or_else(|_| "https://paper-api.alpaca.markets".to_string()),
            trigger_scan_interval_seconds: env::var("TRIGGER_SCAN_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("TRIGGER_SCAN_INTERVAL_SECONDS must be an integer")?,
            monitor_poll_interval_seconds: env::var("MONITOR_POLL_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("MONITOR_POLL_INTERVAL_SECONDS must be an integer")?,
            janitor_sweep_interval_seconds: env::var("JANITOR_SWEEP_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()
                .context("JANITOR_SWEEP_INTERVAL_SECONDS must be an integer")?,
            approval_sweep_interval_seconds: env::var("APPROVAL_SWEEP_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .context("APPROVAL_SWEEP_INTERVAL_SECONDS must be an integer")?,
            max_concurrent_executions: env::var("MAX_CONCURRENT_EXECUTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("MAX_CONCURRENT_EXECUTIONS must be an integer")?,
        })
    }
}
