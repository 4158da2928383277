//! Narrow read-only interface the core consumes for quotes, candles, and
//! computed indicators. How any of these are actually fetched or computed is
//! explicitly out of scope for the execution engine — this crate carries the
//! trait only, with no concrete implementation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub at: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorSet {
    pub symbol: String,
    pub timeframe: String,
    pub values: HashMap<String, f64>,
}

/// Read-only market-data surface. Implementations live outside the core
/// (quote caches, indicator services); the engine only ever depends on this
/// trait.
#[async_trait]
pub trait MarketDataClient: Send + Sync {
    async fn quote(&self, symbol: &str) -> Result<Quote>;

    async fn candles(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>>;

    async fn indicators(
        &self,
        symbol: &str,
        timeframe: &str,
        set: &[String],
        params: &HashMap<String, f64>,
    ) -> Result<IndicatorSet>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCompletion {
    pub text: String,
    pub usage: LlmUsage,
}

/// Per-agent LLM access. Model choice, prompt construction, and parsing of
/// the response are entirely the calling agent's concern and out of scope
/// here.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        prompt: &str,
        model: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<LlmCompletion>;
}
