pub mod agent;
pub mod builtin;
pub mod error;
pub mod metadata;
pub mod tools;

pub use agent::{validate_input, Agent, AgentInstance, AgentRegistry, PipelineNode};
pub use error::{AgentError, Result};
pub use metadata::{validate_config, AgentCategory, AgentConfig, AgentMetadata, ConfigSchema, FieldSchema, ToolConfig};
pub use tools::{BrokerTool, LlmTool, MarketDataTool, Tool, ToolRegistry};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use state_store::{ExecutionMode, PipelineState};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn registry() -> AgentRegistry {
        let mut registry = AgentRegistry::new(ToolRegistry::new());
        builtin::register_builtins(&mut registry);
        registry
    }

    fn state() -> PipelineState {
        PipelineState::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper)
    }

    #[tokio::test]
    async fn time_trigger_fires_when_always_true() {
        let registry = registry();
        let config = AgentConfig {
            agent_id: "n1".to_string(),
            config: HashMap::from([("always".to_string(), json!(true))]),
            tools: vec![],
        };
        let instance = registry.create("time_trigger", config).unwrap();
        let result = instance.process(state()).await.unwrap();
        assert!(result.trigger_met);
    }

    #[tokio::test]
    async fn time_trigger_raises_trigger_not_met() {
        let registry = registry();
        let config = AgentConfig {
            agent_id: "n1".to_string(),
            config: HashMap::from([("always".to_string(), json!(false))]),
            tools: vec![],
        };
        let instance = registry.create("time_trigger", config).unwrap();
        let err = instance.process(state()).await.unwrap_err();
        assert!(matches!(err, AgentError::TriggerNotMet(_)));
    }

    #[tokio::test]
    async fn risk_manager_rejects_poor_risk_reward() {
        let registry = registry();
        let config = AgentConfig {
            agent_id: "n1".to_string(),
            config: HashMap::new(),
            tools: vec![],
        };
        let instance = registry.create("risk_manager_agent", config).unwrap();

        let mut s = state();
        s.trigger_met = true;
        s.strategy = Some(json!({
            "side": "buy", "entry_price": 100.0, "stop_loss": 98.0, "take_profit": 101.0
        }));

        let result = instance.process(s).await.unwrap();
        let approved = result.risk_assessment.unwrap()["approved"].as_bool().unwrap();
        assert!(!approved);
    }

    #[tokio::test]
    async fn risk_manager_approves_good_risk_reward() {
        let registry = registry();
        let config = AgentConfig {
            agent_id: "n1".to_string(),
            config: HashMap::new(),
            tools: vec![],
        };
        let instance = registry.create("risk_manager_agent", config).unwrap();

        let mut s = state();
        s.trigger_met = true;
        s.strategy = Some(json!({
            "side": "buy", "entry_price": 100.0, "stop_loss": 98.0, "take_profit": 104.0
        }));

        let result = instance.process(s).await.unwrap();
        let approved = result.risk_assessment.unwrap()["approved"].as_bool().unwrap();
        assert!(approved);
    }

    #[test]
    fn unknown_agent_type_is_rejected() {
        let registry = registry();
        let config = AgentConfig {
            agent_id: "n1".to_string(),
            config: HashMap::new(),
            tools: vec![],
        };
        let err = registry.create("not_a_real_agent", config).unwrap_err();
        assert!(matches!(err, AgentError::UnknownAgentType(_)));
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let mut config = HashMap::new();
        let schema = ConfigSchema {
            properties: HashMap::from([(
                "min_risk_reward".to_string(),
                FieldSchema { default: Some(json!(2.0)) },
            )]),
            required: vec![],
        };
        validate_config(&schema, &mut config).unwrap();
        assert_eq!(config.get("min_risk_reward").unwrap(), &json!(2.0));
    }

    #[test]
    fn config_missing_required_field_errors() {
        let mut config = HashMap::new();
        let schema = ConfigSchema {
            properties: HashMap::new(),
            required: vec!["api_key".to_string()],
        };
        assert!(validate_config(&schema, &mut config).is_err());
    }
}
