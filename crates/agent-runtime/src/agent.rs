use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use state_store::PipelineState;

use crate::error::{AgentError, Result};
use crate::metadata::{validate_config, AgentConfig, AgentMetadata, ToolConfig};
use crate::tools::{Tool, ToolRegistry};

/// Uniform capability set every agent implements: `{metadata, process}`.
/// Concrete agent kinds are plain structs registered by type string — a
/// tagged-variant surface rather than a deep inheritance tree.
#[async_trait]
pub trait Agent: Send + Sync {
    fn metadata(&self) -> AgentMetadata;

    async fn process(
        &self,
        config: &HashMap<String, Value>,
        tools: &HashMap<String, Arc<dyn Tool>>,
        state: PipelineState,
    ) -> Result<PipelineState>;
}

/// Checks that `state` carries the inputs this agent's metadata declares it
/// requires. Mirrors `BaseAgent.validate_input`.
pub fn validate_input(metadata: &AgentMetadata, state: &PipelineState) -> bool {
    if !metadata.requires_timeframes.is_empty() {
        let Some(market_data) = &state.market_data else {
            return false;
        };
        let timeframes = market_data.get("timeframes").and_then(|v| v.as_object());
        let Some(timeframes) = timeframes else {
            return false;
        };
        for tf in &metadata.requires_timeframes {
            if !timeframes.contains_key(tf) {
                return false;
            }
        }
    }

    if metadata.requires_market_data && state.market_data.is_none() {
        return false;
    }

    if metadata.requires_position && state.current_position.is_none() {
        return false;
    }

    true
}

/// A constructed agent bound to one node: its id, its validated config, and
/// its loaded tools.
pub struct AgentInstance {
    pub agent_id: String,
    pub metadata: AgentMetadata,
    config: HashMap<String, Value>,
    tools: HashMap<String, Arc<dyn Tool>>,
    inner: Box<dyn Agent>,
}

impl AgentInstance {
    pub fn validate_input(&self, state: &PipelineState) -> bool {
        validate_input(&self.metadata, state)
    }

    pub async fn process(&self, state: PipelineState) -> Result<PipelineState> {
        self.inner.process(&self.config, &self.tools, state).await
    }
}

type AgentConstructor = dyn Fn() -> Box<dyn Agent> + Send + Sync;

/// Central registry mapping `agent_type` strings to constructors, per the
/// polymorphic-agent-surface design note.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    constructors: HashMap<String, Arc<AgentConstructor>>,
    tool_registry: ToolRegistry,
}

impl AgentRegistry {
    pub fn new(tool_registry: ToolRegistry) -> Self {
        Self {
            constructors: HashMap::new(),
            tool_registry,
        }
    }

    pub fn register(
        &mut self,
        agent_type: impl Into<String>,
        ctor: impl Fn() -> Box<dyn Agent> + Send + Sync + 'static,
    ) {
        self.constructors.insert(agent_type.into(), Arc::new(ctor));
    }

    pub fn metadata_for(&self, agent_type: &str) -> Option<AgentMetadata> {
        self.constructors.get(agent_type).map(|ctor| ctor().metadata())
    }

    /// Builds an `AgentInstance`: fills config defaults, rejects missing
    /// required fields, loads tools (logging but not failing on individual
    /// tool-load errors). Mirrors `BaseAgent.__init__`.
    pub fn create(&self, agent_type: &str, config: AgentConfig) -> Result<AgentInstance> {
        let ctor = self
            .constructors
            .get(agent_type)
            .ok_or_else(|| AgentError::UnknownAgentType(agent_type.to_string()))?;

        let agent = ctor();
        let metadata = agent.metadata();

        let mut filled_config = config.config;
        validate_config(&metadata.config_schema, &mut filled_config)
            .map_err(AgentError::InvalidConfig)?;

        let tools = self.tool_registry.load(&config.agent_id, &config.tools);

        tracing::info!(agent_id = %config.agent_id, agent_type, "agent initialized");

        Ok(AgentInstance {
            agent_id: config.agent_id,
            metadata,
            config: filled_config,
            tools,
            inner: agent,
        })
    }
}

/// Node shape as it appears in a pipeline's `nodes` array; also used to
/// resolve tool configs before calling `AgentRegistry::create`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct PipelineNode {
    pub id: String,
    pub agent_type: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
}

impl PipelineNode {
    pub fn to_agent_config(&self) -> AgentConfig {
        AgentConfig {
            agent_id: self.id.clone(),
            config: self.config.clone(),
            tools: self.tools.clone(),
        }
    }
}
