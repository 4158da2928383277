use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use broker_trait::BrokerClient;
use market_data_client::{LlmClient, MarketDataClient};
use serde_json::Value;

use crate::metadata::ToolConfig;

/// A loaded tool instance, type-erased. Agents downcast to the concrete type
/// they expect (`as_broker`, `as_market_data`, `as_llm`); tools are never
/// agents and agents are never tools, per the tooling-as-composition design
/// note.
pub trait Tool: Send + Sync {
    fn tool_type(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

pub struct BrokerTool {
    pub client: Arc<dyn BrokerClient>,
}

impl Tool for BrokerTool {
    fn tool_type(&self) -> &str {
        "broker"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct MarketDataTool {
    pub client: Arc<dyn MarketDataClient>,
}

impl Tool for MarketDataTool {
    fn tool_type(&self) -> &str {
        "market_data"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct LlmTool {
    pub client: Arc<dyn LlmClient>,
}

impl Tool for LlmTool {
    fn tool_type(&self) -> &str {
        "llm"
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
}

type ToolFactory = dyn Fn(&Value) -> anyhow::Result<Arc<dyn Tool>> + Send + Sync;

/// Maps a `tool_type` string to a constructor. The engine binary registers
/// concrete factories at startup (one broker adapter, one market-data
/// client, one LLM client); agents never construct tools themselves.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    factories: HashMap<String, Arc<ToolFactory>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        tool_type: impl Into<String>,
        factory: impl Fn(&Value) -> anyhow::Result<Arc<dyn Tool>> + Send + Sync + 'static,
    ) {
        self.factories.insert(tool_type.into(), Arc::new(factory));
    }

    /// Instantiates every enabled tool in `configs`. An individual tool's
    /// construction failure is logged and skipped, not propagated — matching
    /// `BaseAgent._load_tools`'s per-tool try/except.
    pub fn load(&self, agent_id: &str, configs: &[ToolConfig]) -> HashMap<String, Arc<dyn Tool>> {
        let mut tools = HashMap::new();

        for tool_config in configs {
            if !tool_config.enabled {
                continue;
            }

            let Some(factory) = self.factories.get(&tool_config.tool_type) else {
                tracing::warn!(agent_id, tool_type = %tool_config.tool_type, "no factory registered for tool type");
                continue;
            };

            match factory(&tool_config.config) {
                Ok(tool) => {
                    tracing::info!(agent_id, tool_type = %tool_config.tool_type, "tool loaded");
                    tools.insert(tool_config.tool_type.clone(), tool);
                }
                Err(e) => {
                    tracing::error!(agent_id, tool_type = %tool_config.tool_type, error = %e, "failed to load tool");
                }
            }
        }

        tools
    }
}
