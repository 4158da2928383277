use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Where an agent falls in the trigger < data < analysis < risk < execution <
/// monitoring total order the executor uses as a Kahn's-algorithm tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCategory {
    Trigger,
    Data,
    Analysis,
    Risk,
    Execution,
    Monitoring,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    #[serde(default)]
    pub properties: HashMap<String, FieldSchema>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// Describes an agent type: its declared inputs, capability flags, and
/// config schema. Returned by a constant/classmethod-like accessor so it can
/// be inspected without instantiating the agent, mirroring the Python
/// registry's `get_metadata()` classmethod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub agent_type: String,
    pub name: String,
    pub description: String,
    pub category: AgentCategory,
    pub version: String,
    #[serde(default)]
    pub requires_timeframes: Vec<String>,
    #[serde(default)]
    pub requires_market_data: bool,
    #[serde(default)]
    pub requires_position: bool,
    #[serde(default)]
    pub can_initiate_trades: bool,
    #[serde(default)]
    pub can_close_positions: bool,
    /// Whether this agent's failure must abort the execution (the
    /// `market_data`, `risk_manager`, `trade_manager` types).
    pub critical: bool,
    pub config_schema: ConfigSchema,
}

/// Per-instance agent configuration: the node id from the pipeline graph,
/// its filled-in config map, and its tool attachments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub agent_id: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tool_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
}

fn default_true() -> bool {
    true
}

/// Fills missing fields from `schema`'s per-field defaults, then rejects if
/// any `required` field is still unset. Mirrors `BaseAgent._validate_config`.
pub fn validate_config(schema: &ConfigSchema, config: &mut HashMap<String, Value>) -> Result<(), String> {
    for (field, field_schema) in &schema.properties {
        if !config.contains_key(field) {
            if let Some(default) = &field_schema.default {
                config.insert(field.clone(), default.clone());
            }
        }
    }

    for field in &schema.required {
        if !config.contains_key(field) {
            return Err(format!("missing required configuration field: {field}"));
        }
    }

    Ok(())
}
