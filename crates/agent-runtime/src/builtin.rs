use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use broker_trait::BrokerOrderRequest;
use rust_decimal::prelude::*;
use serde_json::{json, Value};
use state_store::PipelineState;

use crate::agent::Agent;
use crate::error::{AgentError, Result};
use crate::metadata::{AgentCategory, AgentMetadata, ConfigSchema, FieldSchema};
use crate::tools::{BrokerTool, MarketDataTool, Tool};

fn schema(properties: &[(&str, Option<Value>)], required: &[&str]) -> ConfigSchema {
    ConfigSchema {
        properties: properties
            .iter()
            .map(|(name, default)| ((*name).to_string(), FieldSchema { default: default.clone() }))
            .collect(),
        required: required.iter().map(|s| s.to_string()).collect(),
    }
}

fn cfg_bool(config: &HashMap<String, Value>, key: &str, default: bool) -> bool {
    config.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

fn cfg_f64(config: &HashMap<String, Value>, key: &str, default: f64) -> f64 {
    config.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn cfg_i64(config: &HashMap<String, Value>, key: &str, default: i64) -> i64 {
    config.get(key).and_then(|v| v.as_i64()).unwrap_or(default)
}

/// Checks a periodic/always-on trigger condition. Anything more elaborate
/// (signal scanners, cron expressions) is external to the core; this is the
/// minimal trigger the executor needs to exercise suspension-free pipelines.
pub struct TimeTriggerAgent;

#[async_trait]
impl Agent for TimeTriggerAgent {
    fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            agent_type: "time_trigger".to_string(),
            name: "Time Trigger".to_string(),
            description: "Fires unconditionally or on a configured always-on schedule".to_string(),
            category: AgentCategory::Trigger,
            version: "1.0.0".to_string(),
            requires_timeframes: vec![],
            requires_market_data: false,
            requires_position: false,
            can_initiate_trades: false,
            can_close_positions: false,
            critical: false,
            config_schema: schema(&[("always", Some(json!(true)))], &[]),
        }
    }

    async fn process(
        &self,
        config: &HashMap<String, Value>,
        _tools: &HashMap<String, Arc<dyn Tool>>,
        mut state: PipelineState,
    ) -> Result<PipelineState> {
        if cfg_bool(config, "always", true) {
            state.trigger_met = true;
            state.trigger_reason = Some("always-on trigger".to_string());
            state.add_log("time_trigger", "trigger condition met", "info");
            Ok(state)
        } else {
            Err(AgentError::TriggerNotMet("trigger condition not met".to_string()))
        }
    }
}

/// Fetches a quote through the market-data tool and stamps it onto the
/// state. Critical: its failure aborts the execution, since nothing
/// downstream can run without a price.
pub struct MarketDataAgent;

#[async_trait]
impl Agent for MarketDataAgent {
    fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            agent_type: "market_data_agent".to_string(),
            name: "Market Data".to_string(),
            description: "Fetches the latest quote for the execution's symbol".to_string(),
            category: AgentCategory::Data,
            version: "1.0.0".to_string(),
            requires_timeframes: vec![],
            requires_market_data: false,
            requires_position: false,
            can_initiate_trades: false,
            can_close_positions: false,
            critical: true,
            config_schema: schema(&[], &[]),
        }
    }

    async fn process(
        &self,
        _config: &HashMap<String, Value>,
        tools: &HashMap<String, Arc<dyn Tool>>,
        mut state: PipelineState,
    ) -> Result<PipelineState> {
        if !state.trigger_met {
            return Ok(state);
        }

        let tool = tools
            .get("market_data")
            .and_then(|t| t.as_any().downcast_ref::<MarketDataTool>())
            .ok_or_else(|| AgentError::InsufficientData("no market_data tool configured".to_string()))?;

        let quote = tool
            .client
            .quote(&state.symbol)
            .await
            .map_err(|e| AgentError::InsufficientData(format!("quote fetch failed: {e}")))?;

        state.market_data = Some(json!({
            "price": quote.price,
            "bid": quote.bid,
            "ask": quote.ask,
            "at": quote.at,
            "timeframes": {},
        }));
        state.add_cost("market_data_agent", 0.0);
        state.add_log("market_data_agent", format!("fetched quote at {:.2}", quote.price), "info");

        Ok(state)
    }
}

/// Validates a proposed trade's risk/reward against the configured minimum
/// and stamps `risk_assessment`. Critical.
pub struct RiskManagerAgent;

#[async_trait]
impl Agent for RiskManagerAgent {
    fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            agent_type: "risk_manager_agent".to_string(),
            name: "Risk Manager".to_string(),
            description: "Validates a proposed trade's risk/reward ratio and sizes the position".to_string(),
            category: AgentCategory::Risk,
            version: "1.0.0".to_string(),
            requires_timeframes: vec![],
            requires_market_data: true,
            requires_position: false,
            can_initiate_trades: false,
            can_close_positions: false,
            critical: true,
            config_schema: schema(
                &[
                    ("min_risk_reward", Some(json!(2.0))),
                    ("max_position_percent", Some(json!(5.0))),
                ],
                &[],
            ),
        }
    }

    async fn process(
        &self,
        config: &HashMap<String, Value>,
        _tools: &HashMap<String, Arc<dyn Tool>>,
        mut state: PipelineState,
    ) -> Result<PipelineState> {
        if !state.trigger_met {
            return Ok(state);
        }

        let strategy = state
            .strategy
            .clone()
            .ok_or_else(|| AgentError::InsufficientData("no strategy to assess".to_string()))?;

        let entry = strategy.get("entry_price").and_then(Value::as_f64).unwrap_or(0.0);
        let stop = strategy.get("stop_loss").and_then(Value::as_f64).unwrap_or(0.0);
        let target = strategy.get("take_profit").and_then(Value::as_f64).unwrap_or(0.0);
        let min_rr = cfg_f64(config, "min_risk_reward", 2.0);

        let risk = (entry - stop).abs();
        let reward = (target - entry).abs();
        let risk_reward = if risk > 0.0 { reward / risk } else { 0.0 };
        let approved = risk > 0.0 && risk_reward >= min_rr;

        let reasoning = if approved {
            format!("risk/reward {risk_reward:.2} meets minimum {min_rr:.2}")
        } else {
            format!("risk/reward {risk_reward:.2} below minimum {min_rr:.2}")
        };

        if !approved {
            state.warnings.push(format!("risk_manager_agent: {reasoning}"));
        }

        state.risk_assessment = Some(json!({
            "approved": approved,
            "reasoning": reasoning,
            "risk_reward": risk_reward,
            "max_position_percent": cfg_f64(config, "max_position_percent", 5.0),
        }));
        state.add_cost("risk_manager_agent", 0.0);
        state.add_log("risk_manager_agent", reasoning, "info");

        Ok(state)
    }
}

/// Places the order and, if configured, hands the execution to the
/// monitoring phase. Assumes the executor has already resolved the
/// approval gate (suspend-before-call, not agent-internal) and that
/// `risk_assessment.approved` is true — the executor skips this agent
/// otherwise.
pub struct TradeManagerAgent;

#[async_trait]
impl Agent for TradeManagerAgent {
    fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            agent_type: "trade_manager_agent".to_string(),
            name: "Trade Manager".to_string(),
            description: "Places the order at the broker and arms position monitoring".to_string(),
            category: AgentCategory::Execution,
            version: "1.0.0".to_string(),
            requires_timeframes: vec![],
            requires_market_data: true,
            requires_position: false,
            can_initiate_trades: true,
            can_close_positions: true,
            critical: true,
            config_schema: schema(
                &[
                    ("requires_approval", Some(json!(false))),
                    ("monitor_interval_seconds", Some(json!(300))),
                    ("enable_monitoring", Some(json!(true))),
                ],
                &[],
            ),
        }
    }

    async fn process(
        &self,
        config: &HashMap<String, Value>,
        tools: &HashMap<String, Arc<dyn Tool>>,
        mut state: PipelineState,
    ) -> Result<PipelineState> {
        let strategy = state
            .strategy
            .clone()
            .ok_or_else(|| AgentError::InsufficientData("no strategy to execute".to_string()))?;

        let broker = tools
            .get("broker")
            .and_then(|t| t.as_any().downcast_ref::<BrokerTool>())
            .ok_or_else(|| AgentError::InsufficientData("no broker tool configured".to_string()))?;

        let side = strategy.get("side").and_then(Value::as_str).unwrap_or("buy");
        let qty = strategy
            .get("quantity")
            .and_then(Value::as_f64)
            .and_then(rust_decimal::Decimal::from_f64)
            .unwrap_or(rust_decimal::Decimal::ONE);

        let request = if side.eq_ignore_ascii_case("sell") {
            BrokerOrderRequest::sell(state.symbol.clone(), qty)
        } else {
            BrokerOrderRequest::buy(state.symbol.clone(), qty)
        };

        let order = broker
            .client
            .submit_market_order(request)
            .await
            .map_err(|e| AgentError::AgentProcessing(format!("order submission failed: {e}")))?;

        state.trade_execution = Some(json!({
            "status": order.status,
            "order_id": order.id,
            "filled_avg_price": order.filled_avg_price,
            "filled_qty": order.filled_qty,
            "side": side,
            "requires_approval": cfg_bool(config, "requires_approval", false),
        }));
        state.add_cost("trade_manager_agent", 0.0);
        state.add_log("trade_manager_agent", format!("order {} submitted", order.id), "info");

        if cfg_bool(config, "enable_monitoring", true) {
            state.execution_phase = state_store::ExecutionPhase::Monitoring;
            state.monitor_interval_seconds = Some(cfg_i64(config, "monitor_interval_seconds", 300));
        }

        Ok(state)
    }
}

/// Non-critical agent used for post-hoc reporting; its failures are
/// recorded and the execution continues.
pub struct ReportingAgent;

#[async_trait]
impl Agent for ReportingAgent {
    fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            agent_type: "reporting_agent".to_string(),
            name: "Reporting".to_string(),
            description: "Records a summary report for the execution".to_string(),
            category: AgentCategory::Monitoring,
            version: "1.0.0".to_string(),
            requires_timeframes: vec![],
            requires_market_data: false,
            requires_position: false,
            can_initiate_trades: false,
            can_close_positions: false,
            critical: false,
            config_schema: schema(&[], &[]),
        }
    }

    async fn process(
        &self,
        _config: &HashMap<String, Value>,
        _tools: &HashMap<String, Arc<dyn Tool>>,
        mut state: PipelineState,
    ) -> Result<PipelineState> {
        state.add_log("reporting_agent", "execution summary recorded", "info");
        Ok(state)
    }
}

/// Generic LLM-backed bias/strategy step. The prompt/response handling is a
/// non-goal; this stands in for whatever concrete analysis agents a pipeline
/// attaches (bias_agent, strategy_agent) by writing a deterministic
/// placeholder into `state.strategy` when one isn't already present, so the
/// downstream risk/trade agents always have something to evaluate in tests
/// that don't wire a real LLM tool.
pub struct AnalysisAgent;

#[async_trait]
impl Agent for AnalysisAgent {
    fn metadata(&self) -> AgentMetadata {
        AgentMetadata {
            agent_type: "analysis_agent".to_string(),
            name: "Analysis".to_string(),
            description: "Produces bias/strategy output ahead of risk assessment".to_string(),
            category: AgentCategory::Analysis,
            version: "1.0.0".to_string(),
            requires_timeframes: vec![],
            requires_market_data: true,
            requires_position: false,
            can_initiate_trades: false,
            can_close_positions: false,
            critical: false,
            config_schema: schema(
                &[
                    ("side", Some(json!("buy"))),
                    ("stop_loss_percent", Some(json!(2.0))),
                    ("take_profit_percent", Some(json!(4.0))),
                    ("quantity", Some(json!(1.0))),
                ],
                &[],
            ),
        }
    }

    async fn process(
        &self,
        config: &HashMap<String, Value>,
        _tools: &HashMap<String, Arc<dyn Tool>>,
        mut state: PipelineState,
    ) -> Result<PipelineState> {
        if !state.trigger_met || state.strategy.is_some() {
            return Ok(state);
        }

        let Some(market_data) = &state.market_data else {
            return Err(AgentError::InsufficientData("no market data for analysis".to_string()));
        };
        let price = market_data.get("price").and_then(Value::as_f64).unwrap_or(0.0);
        let side = config.get("side").and_then(Value::as_str).unwrap_or("buy").to_string();
        let sl_pct = cfg_f64(config, "stop_loss_percent", 2.0) / 100.0;
        let tp_pct = cfg_f64(config, "take_profit_percent", 4.0) / 100.0;

        let (stop_loss, take_profit) = if side == "buy" {
            (price * (1.0 - sl_pct), price * (1.0 + tp_pct))
        } else {
            (price * (1.0 + sl_pct), price * (1.0 - tp_pct))
        };

        state.strategy = Some(json!({
            "side": side,
            "entry_price": price,
            "stop_loss": stop_loss,
            "take_profit": take_profit,
            "quantity": cfg_f64(config, "quantity", 1.0),
        }));
        state.add_log("analysis_agent", "strategy generated", "info");

        Ok(state)
    }
}

/// Registers every built-in agent type onto `registry`.
pub fn register_builtins(registry: &mut crate::agent::AgentRegistry) {
    registry.register("time_trigger", || Box::new(TimeTriggerAgent));
    registry.register("market_data_agent", || Box::new(MarketDataAgent));
    registry.register("analysis_agent", || Box::new(AnalysisAgent));
    registry.register("risk_manager_agent", || Box::new(RiskManagerAgent));
    registry.register("trade_manager_agent", || Box::new(TradeManagerAgent));
    registry.register("reporting_agent", || Box::new(ReportingAgent));
}
