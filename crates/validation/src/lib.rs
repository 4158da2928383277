//! Pipeline-config validation: the checks a `PipelineConfig` must pass before
//! the dispatcher will register it. Split out from the graph/execution
//! machinery so a control plane can validate a draft config without
//! constructing an `Executor`.

use std::collections::HashMap;

use agent_runtime::AgentRegistry;
use pipeline_executor::{topological_sort, PipelineConfig};

/// Minimum gap required between a pipeline's monitoring poll interval and the
/// janitor's stale-monitoring reclaim window. A monitoring execution that
/// polls right up against `MAX_AGE_MONITORING_MINUTES` risks the janitor
/// failing it mid-poll on ordinary scheduling jitter; this margin keeps at
/// least one extra poll cycle inside the window.
pub const MIN_MONITOR_INTERVAL_MARGIN_SECONDS: i64 = 5 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("pipeline has no nodes")]
    EmptyPipeline,
    #[error("node '{0}' has unknown agent_type '{1}'")]
    UnknownAgentType(String, String),
    #[error("node '{node}' config invalid: {reason}")]
    InvalidNodeConfig { node: String, reason: String },
    #[error("graph structure invalid: {0}")]
    InvalidGraph(String),
    #[error(
        "monitor_interval_seconds ({interval}) must be at least {margin}s below the janitor's \
         stale-monitoring reclaim window ({max_age}s), got a gap of {gap}s"
    )]
    MonitorIntervalTooClose {
        interval: i64,
        max_age: i64,
        margin: i64,
        gap: i64,
    },
}

/// Validates a pipeline definition before it is handed to the dispatcher.
///
/// Checks, in order: (1) the graph has at least one node; (2) every node's
/// `agent_type` is registered and its `config` satisfies that agent's schema
/// (via [`agent_runtime::validate_config`], run against a scratch copy so
/// defaults-filling here doesn't mutate the caller's config); (3) the graph's
/// edges reference only known nodes and contain no cycle, by reusing
/// [`pipeline_executor::topological_sort`] rather than re-deriving the same
/// check; (4) `monitor_interval_seconds` leaves enough headroom below the
/// janitor's reclaim window.
pub fn validate_pipeline(
    config: &PipelineConfig,
    registry: &AgentRegistry,
    monitor_interval_seconds: i64,
) -> Result<(), ValidationError> {
    if config.nodes.is_empty() {
        return Err(ValidationError::EmptyPipeline);
    }

    for node in &config.nodes {
        let metadata = registry
            .metadata_for(&node.agent_type)
            .ok_or_else(|| ValidationError::UnknownAgentType(node.id.clone(), node.agent_type.clone()))?;

        let mut scratch: HashMap<String, serde_json::Value> = node.config.clone();
        agent_runtime::validate_config(&metadata.config_schema, &mut scratch).map_err(|reason| {
            ValidationError::InvalidNodeConfig { node: node.id.clone(), reason }
        })?;
    }

    topological_sort(config, registry).map_err(|e| ValidationError::InvalidGraph(e.to_string()))?;

    let max_age_seconds = janitor::MAX_AGE_MONITORING_MINUTES * 60;
    let gap = max_age_seconds - monitor_interval_seconds;
    if gap < MIN_MONITOR_INTERVAL_MARGIN_SECONDS {
        return Err(ValidationError::MonitorIntervalTooClose {
            interval: monitor_interval_seconds,
            max_age: max_age_seconds,
            margin: MIN_MONITOR_INTERVAL_MARGIN_SECONDS,
            gap,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_runtime::{builtin::register_builtins, PipelineNode, ToolRegistry};
    use pipeline_executor::Edge;
    use uuid::Uuid;

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new(ToolRegistry::new());
        register_builtins(&mut registry);
        registry
    }

    fn market_data_node() -> PipelineNode {
        PipelineNode {
            id: "md".to_string(),
            agent_type: "market_data_agent".to_string(),
            config: HashMap::new(),
            tools: Vec::new(),
        }
    }

    #[test]
    fn rejects_empty_pipeline() {
        let config = PipelineConfig {
            pipeline_id: Uuid::new_v4(),
            nodes: Vec::new(),
            edges: Vec::new(),
            approval_ttl_seconds: 3600,
        };
        assert!(matches!(
            validate_pipeline(&config, &registry(), 300),
            Err(ValidationError::EmptyPipeline)
        ));
    }

    #[test]
    fn rejects_unknown_agent_type() {
        let config = PipelineConfig {
            pipeline_id: Uuid::new_v4(),
            nodes: vec![PipelineNode {
                id: "n1".to_string(),
                agent_type: "not_a_real_agent".to_string(),
                config: HashMap::new(),
                tools: Vec::new(),
            }],
            edges: Vec::new(),
            approval_ttl_seconds: 3600,
        };
        assert!(matches!(
            validate_pipeline(&config, &registry(), 300),
            Err(ValidationError::UnknownAgentType(_, _))
        ));
    }

    #[test]
    fn rejects_edge_to_unknown_node() {
        let config = PipelineConfig {
            pipeline_id: Uuid::new_v4(),
            nodes: vec![market_data_node()],
            edges: vec![Edge { from: "md".to_string(), to: "missing".to_string() }],
            approval_ttl_seconds: 3600,
        };
        assert!(matches!(
            validate_pipeline(&config, &registry(), 300),
            Err(ValidationError::InvalidGraph(_))
        ));
    }

    #[test]
    fn rejects_monitor_interval_too_close_to_janitor_reclaim() {
        let config = PipelineConfig {
            pipeline_id: Uuid::new_v4(),
            nodes: vec![market_data_node()],
            edges: Vec::new(),
            approval_ttl_seconds: 3600,
        };
        let max_age_seconds = janitor::MAX_AGE_MONITORING_MINUTES * 60;
        let too_close = max_age_seconds - 60;
        assert!(matches!(
            validate_pipeline(&config, &registry(), too_close),
            Err(ValidationError::MonitorIntervalTooClose { .. })
        ));
    }

    #[test]
    fn accepts_well_formed_pipeline() {
        let config = PipelineConfig {
            pipeline_id: Uuid::new_v4(),
            nodes: vec![market_data_node()],
            edges: Vec::new(),
            approval_ttl_seconds: 3600,
        };
        assert!(validate_pipeline(&config, &registry(), 300).is_ok());
    }
}
