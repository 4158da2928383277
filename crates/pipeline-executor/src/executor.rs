use std::sync::Arc;

use agent_runtime::{AgentCategory, AgentError, AgentRegistry, PipelineNode};
use chrono::{Duration, Utc};
use event_bus::{Event, EventBus, EventType};
use state_store::{
    ApprovalStatus, AgentStateEntry, Execution, ExecutionPhase, ExecutionStatus, StateStore,
};
use uuid::Uuid;

use crate::error::{ExecutorError, Result};
use crate::graph::{topological_sort, PipelineConfig};

/// Outcome of one `run`/`resume_after_approval` call: either the execution
/// reached a stopping point (terminal, suspended for approval, or handed off
/// to monitoring) in this call, or it ran to normal completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Suspended,
    Monitoring,
    Failed,
    Skipped,
}

/// Walks a pipeline's agent graph against one execution, persisting after
/// every node via optimistic concurrency. Owns no state itself beyond the
/// shared handles; every call re-reads the execution it's about to progress,
/// so a crash mid-walk just means the next poll picks it up again.
pub struct Executor {
    store: Arc<StateStore>,
    registry: Arc<AgentRegistry>,
    events: Arc<EventBus>,
}

impl Executor {
    pub fn new(store: Arc<StateStore>, registry: Arc<AgentRegistry>, events: Arc<EventBus>) -> Self {
        Self { store, registry, events }
    }

    /// Drives a `pending` execution from its first ready node through to a
    /// stopping point: completion, a non-critical or trigger-not-met skip, a
    /// critical failure, a suspension for approval, or a handoff to
    /// monitoring after a filled order.
    pub async fn run(&self, execution_id: Uuid, config: &PipelineConfig) -> Result<StepOutcome> {
        let mut execution = self.store.load(execution_id).await?;
        let order = topological_sort(config, &self.registry)?;

        if execution.status == ExecutionStatus::Pending {
            execution.status = ExecutionStatus::Running;
            execution.started_at = Some(Utc::now());
            let expected = execution.version;
            self.store.compare_and_save(&mut execution, expected).await?;
        }

        self.walk(execution, &order).await
    }

    /// Resumes a suspended execution after the approval gate has recorded an
    /// `approved` decision. Re-enters the graph at the `trade_manager_agent`
    /// node rather than re-walking it from the top: every upstream agent had
    /// already run before suspending, and their outputs are intact in
    /// `pipeline_state`. The trade_manager node itself never ran its body on
    /// the suspending pass — `walk` gates the approval check before calling
    /// `process`, not after — so this is its first and only invocation.
    pub async fn resume_after_approval(&self, execution_id: Uuid, config: &PipelineConfig) -> Result<StepOutcome> {
        let execution = self.store.load(execution_id).await?;

        if execution.approval_status != ApprovalStatus::Approved {
            return Err(ExecutorError::NotAwaitingApproval(execution_id));
        }

        let node = config
            .find_by_type("trade_manager_agent")
            .ok_or_else(|| ExecutorError::NodeNotFound("trade_manager_agent".to_string()))?
            .clone();

        let full_order = topological_sort(config, &self.registry)?;
        let resume_index = full_order
            .iter()
            .position(|n| n.id == node.id)
            .ok_or_else(|| ExecutorError::NodeNotFound("trade_manager_agent".to_string()))?;

        self.walk(execution, &full_order[resume_index..]).await
    }

    /// Runs `nodes` in order against `execution`, persisting after each one.
    async fn walk(&self, mut execution: Execution, nodes: &[PipelineNode]) -> Result<StepOutcome> {
        for node in nodes {
            let metadata = self
                .registry
                .metadata_for(&node.agent_type)
                .ok_or_else(|| ExecutorError::NodeNotFound(node.agent_type.clone()))?;

            let is_gated_trade_node = metadata.category == AgentCategory::Execution
                && metadata.can_initiate_trades
                && node_requires_approval(node)
                && execution.approval_status != ApprovalStatus::Approved;

            self.mark_running(&mut execution, node);

            if is_gated_trade_node {
                return self.suspend_for_approval(execution, config_approval_ttl(node)).await;
            }

            let instance = self.registry.create(&node.agent_type, node.to_agent_config())?;

            let state = execution
                .pipeline_state
                .clone()
                .ok_or(ExecutorError::MissingState(execution.id))?;

            match instance.process(state).await {
                Ok(new_state) => {
                    let cost = new_state.agent_costs.get(&node.id).copied().unwrap_or(0.0);
                    self.record_node_result(&mut execution, &node.id, "completed", cost, None);
                    execution.cost_breakdown = new_state.agent_costs.clone();
                    execution.pipeline_state = Some(new_state.clone());

                    self.save(&mut execution).await?;
                    self.emit(&execution, EventType::ExecutionUpdate, serde_json::json!({ "node": node.id }));

                    if metadata.category == AgentCategory::Risk {
                        let approved = new_state
                            .risk_assessment
                            .as_ref()
                            .and_then(|r| r.get("approved"))
                            .and_then(|v| v.as_bool())
                            .unwrap_or(true);

                        if !approved {
                            return self.finish_skipped(execution, "risk manager rejected the trade").await;
                        }
                    }

                    if metadata.category == AgentCategory::Execution
                        && metadata.can_initiate_trades
                        && new_state.execution_phase == ExecutionPhase::Monitoring
                    {
                        return self.transition_to_monitoring(execution, &new_state).await;
                    }
                }
                Err(AgentError::TriggerNotMet(reason)) => {
                    self.record_node_result(&mut execution, &node.id, "skipped", 0.0, Some(reason.clone()));
                    return self.finish_skipped(execution, &reason).await;
                }
                Err(e) if metadata.critical => {
                    self.record_node_result(&mut execution, &node.id, "failed", 0.0, Some(e.to_string()));
                    return self.finish_failed(execution, e.to_string()).await;
                }
                Err(e) => {
                    // Non-critical agent failure: record it and keep walking.
                    self.record_node_result(&mut execution, &node.id, "failed", 0.0, Some(e.to_string()));
                    self.save(&mut execution).await?;
                }
            }
        }

        self.finish_completed(execution).await
    }

    /// Pushes a `running` entry for `node`, unless one is already there from
    /// an earlier pass over the same node (the suspend-then-resume path for a
    /// gated trade node walks it twice: once to suspend, once to process).
    fn mark_running(&self, execution: &mut Execution, node: &PipelineNode) {
        let already_running = execution
            .agent_states
            .iter()
            .rev()
            .find(|e| e.agent_id == node.id)
            .is_some_and(|e| e.status == "running");
        if already_running {
            return;
        }
        execution.agent_states.push(AgentStateEntry {
            agent_id: node.id.clone(),
            agent_type: node.agent_type.clone(),
            status: "running".to_string(),
            started_at: Some(Utc::now()),
            completed_at: None,
            cost: 0.0,
            error: None,
        });
    }

    fn record_node_result(&self, execution: &mut Execution, node_id: &str, status: &str, cost: f64, error: Option<String>) {
        if let Some(entry) = execution.agent_states.iter_mut().rev().find(|e| e.agent_id == node_id) {
            entry.status = status.to_string();
            entry.completed_at = Some(Utc::now());
            entry.cost = cost;
            entry.error = error;
        }
    }

    async fn save(&self, execution: &mut Execution) -> Result<()> {
        let expected = execution.version;
        self.store.compare_and_save(execution, expected).await?;
        Ok(())
    }

    fn emit(&self, execution: &Execution, event_type: EventType, payload: serde_json::Value) {
        self.events.publish(Event::new(event_type, execution.id, execution.user_id, payload));
    }

    async fn suspend_for_approval(&self, mut execution: Execution, ttl_seconds: i64) -> Result<StepOutcome> {
        execution.status = ExecutionStatus::AwaitingApproval;
        execution.approval_status = ApprovalStatus::Pending;
        execution.approval_token = Some(Uuid::new_v4().to_string());
        execution.approval_expires_at = Some(Utc::now() + Duration::seconds(ttl_seconds));
        self.save(&mut execution).await?;
        self.emit(&execution, EventType::ApprovalRequested, serde_json::json!({ "expires_at": execution.approval_expires_at }));
        Ok(StepOutcome::Suspended)
    }

    async fn transition_to_monitoring(&self, mut execution: Execution, state: &state_store::PipelineState) -> Result<StepOutcome> {
        let interval = state.monitor_interval_seconds.unwrap_or(300);
        execution.status = ExecutionStatus::Monitoring;
        execution.execution_phase = ExecutionPhase::Monitoring;
        execution.monitor_interval_seconds = interval;
        execution.next_check_at = Some(Utc::now() + Duration::seconds(interval));
        self.save(&mut execution).await?;
        self.emit(&execution, EventType::ExecutionUpdate, serde_json::json!({ "phase": "monitoring" }));
        Ok(StepOutcome::Monitoring)
    }

    async fn finish_completed(&self, mut execution: Execution) -> Result<StepOutcome> {
        execution.status = ExecutionStatus::Completed;
        execution.completed_at = Some(Utc::now());
        if let Some(state) = &execution.pipeline_state {
            execution.result = Some(serde_json::json!({
                "strategy": state.strategy,
                "risk_assessment": state.risk_assessment,
                "trade_execution": state.trade_execution,
            }));
        }
        self.save(&mut execution).await?;
        self.emit(&execution, EventType::ExecutionComplete, serde_json::json!({ "status": "completed" }));
        Ok(StepOutcome::Completed)
    }

    async fn finish_skipped(&self, mut execution: Execution, reason: &str) -> Result<StepOutcome> {
        execution.status = ExecutionStatus::Skipped;
        execution.completed_at = Some(Utc::now());
        execution.error_message = Some(reason.to_string());
        self.save(&mut execution).await?;
        self.emit(&execution, EventType::ExecutionComplete, serde_json::json!({ "status": "skipped", "reason": reason }));
        Ok(StepOutcome::Skipped)
    }

    async fn finish_failed(&self, mut execution: Execution, reason: String) -> Result<StepOutcome> {
        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(Utc::now());
        execution.error_message = Some(reason.clone());
        self.save(&mut execution).await?;
        self.emit(&execution, EventType::PipelineFailed, serde_json::json!({ "error_message": reason }));
        Ok(StepOutcome::Failed)
    }
}

/// Whether this node's static config demands human approval before it runs.
/// Checked against the node's config, not its output: the gate has to decide
/// *before* invoking the agent, since invoking it is exactly what places the
/// order.
fn node_requires_approval(node: &PipelineNode) -> bool {
    node.config
        .get("requires_approval")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

fn config_approval_ttl(node: &PipelineNode) -> i64 {
    node.config
        .get("approval_ttl_seconds")
        .and_then(|v| v.as_i64())
        .unwrap_or(3600)
}
