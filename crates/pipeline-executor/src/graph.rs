use agent_runtime::{AgentCategory, AgentRegistry, PipelineNode};
use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

/// A pipeline's graph as it arrives from the orchestration control plane:
/// agent nodes and their data-dependency edges. Tool attachments live inside
/// each node's config, not as separate graph nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_id: uuid::Uuid,
    pub nodes: Vec<PipelineNode>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default = "default_approval_ttl")]
    pub approval_ttl_seconds: i64,
}

fn default_approval_ttl() -> i64 {
    3600
}

impl PipelineConfig {
    pub fn find_by_type(&self, agent_type: &str) -> Option<&PipelineNode> {
        self.nodes.iter().find(|n| n.agent_type == agent_type)
    }
}

/// Orders `nodes` leaves-first by Kahn's algorithm; when more than one node
/// is ready, the one in the earliest category (trigger < data < analysis <
/// risk < execution < monitoring) goes first, so the linearization is
/// deterministic even though the graph only constrains data dependencies.
pub fn topological_sort(config: &PipelineConfig, registry: &AgentRegistry) -> Result<Vec<PipelineNode>> {
    use std::collections::{HashMap, HashSet};

    let node_ids: HashSet<&str> = config.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut indegree: HashMap<&str, usize> = config.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();

    for edge in &config.edges {
        if !node_ids.contains(edge.from.as_str()) || !node_ids.contains(edge.to.as_str()) {
            return Err(ExecutorError::InvalidGraph(format!(
                "edge references unknown node: {} -> {}",
                edge.from, edge.to
            )));
        }
        adjacency.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
        *indegree.get_mut(edge.to.as_str()).unwrap() += 1;
    }

    let category_of = |node: &PipelineNode| -> AgentCategory {
        registry
            .metadata_for(&node.agent_type)
            .map(|m| m.category)
            .unwrap_or(AgentCategory::Analysis)
    };

    let mut ready: Vec<&PipelineNode> = config
        .nodes
        .iter()
        .filter(|n| indegree[n.id.as_str()] == 0)
        .collect();

    let mut ordered = Vec::with_capacity(config.nodes.len());
    let by_id: HashMap<&str, &PipelineNode> = config.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    while !ready.is_empty() {
        ready.sort_by(|a, b| category_of(a).cmp(&category_of(b)).then_with(|| a.id.cmp(&b.id)));
        let next = ready.remove(0);
        ordered.push(next.clone());

        if let Some(successors) = adjacency.get(next.id.as_str()) {
            for &succ in successors {
                let entry = indegree.get_mut(succ).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    ready.push(by_id[succ]);
                }
            }
        }
    }

    if ordered.len() != config.nodes.len() {
        return Err(ExecutorError::InvalidGraph("pipeline graph contains a cycle".to_string()));
    }

    Ok(ordered)
}
