//! The two terminal transitions out of `awaiting_approval`: a user (or
//! anyone holding the `approval_token`) approving or rejecting a suspended
//! trade, plus the periodic timeout sweep that auto-rejects an execution
//! nobody responded to in time.
//!
//! The atomic precondition check the original orchestration implements as a
//! single conditional `UPDATE ... WHERE status = ? AND approval_status = ?`
//! is implemented here with the version-based compare-and-save this
//! workspace already uses as its sole write path: load, check the
//! preconditions in memory, then `compare_and_save` with the version just
//! read. A concurrent approve/reject/timeout racing in between fails the
//! version check exactly as it would fail the status-conditioned `UPDATE`,
//! so the refusal semantics are identical without a second write primitive.

use std::sync::Arc;

use chrono::Utc;
use event_bus::{Event, EventBus, EventType};
use pipeline_executor::{Executor, PipelineConfig};
use state_store::{AgentStateEntry, ApprovalStatus, Execution, ExecutionFilter, ExecutionStatus, StateStore};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("execution {0} is not awaiting approval")]
    NotAwaitingApproval(Uuid),
    #[error("approval token does not match")]
    TokenMismatch,
    #[error("approval window has expired")]
    Expired,
    #[error(transparent)]
    State(#[from] state_store::StateStoreError),
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

pub struct ApprovalGate {
    store: Arc<StateStore>,
    executor: Arc<Executor>,
    events: Arc<EventBus>,
}

impl ApprovalGate {
    pub fn new(store: Arc<StateStore>, executor: Arc<Executor>, events: Arc<EventBus>) -> Self {
        Self { store, executor, events }
    }

    /// Approves a suspended trade and hands the execution back to the
    /// executor's resume path. Preconditions: the execution is still
    /// `awaiting_approval`/`pending`, `token` matches, and the approval
    /// window hasn't expired.
    pub async fn approve(&self, execution_id: Uuid, token: &str, config: PipelineConfig) -> Result<()> {
        let mut execution = self.store.load(execution_id).await?;
        self.check_preconditions(&execution, token)?;

        execution.approval_status = ApprovalStatus::Approved;
        execution.approval_responded_at = Some(Utc::now());

        let expected = execution.version;
        self.store.compare_and_save(&mut execution, expected).await?;

        let executor = self.executor.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.resume_after_approval(execution_id, &config).await {
                tracing::error!(execution_id = %execution_id, error = %e, "approval-gate: resume after approval failed");
            }
        });

        Ok(())
    }

    /// Rejects a suspended trade. Forces the execution to `completed` with
    /// the trade_manager node recorded as skipped, rather than leaving it
    /// dangling in `awaiting_approval`.
    pub async fn reject(&self, execution_id: Uuid, token: &str, reason: &str) -> Result<()> {
        let mut execution = self.store.load(execution_id).await?;
        self.check_preconditions(&execution, token)?;

        self.finalize_unapproved(&mut execution, ApprovalStatus::Rejected, reason).await?;
        Ok(())
    }

    /// Auto-rejects every execution still `awaiting_approval`/`pending`
    /// whose `approval_expires_at` has passed. Run on a periodic sweep (the
    /// same idiom the janitor and monitor loop already use) rather than a
    /// one-shot timer per suspension, since nothing in this workspace owns a
    /// per-task delayed-execution scheduler.
    pub async fn sweep_timeouts(&self, now: chrono::DateTime<Utc>) -> Result<usize> {
        let candidates = self
            .store
            .list_by(&ExecutionFilter { status: Some(ExecutionStatus::AwaitingApproval), ..Default::default() })
            .await?;

        let mut timed_out = 0;
        for mut execution in candidates {
            if execution.approval_status != ApprovalStatus::Pending {
                continue;
            }
            let Some(expires_at) = execution.approval_expires_at else { continue };
            if now < expires_at {
                continue;
            }

            self.finalize_unapproved(&mut execution, ApprovalStatus::TimedOut, "Approval timed out").await?;
            timed_out += 1;
        }

        Ok(timed_out)
    }

    fn check_preconditions(&self, execution: &Execution, token: &str) -> Result<()> {
        if execution.status != ExecutionStatus::AwaitingApproval || execution.approval_status != ApprovalStatus::Pending {
            return Err(ApprovalError::NotAwaitingApproval(execution.id));
        }
        if execution.approval_token.as_deref() != Some(token) {
            return Err(ApprovalError::TokenMismatch);
        }
        if let Some(expires_at) = execution.approval_expires_at {
            if Utc::now() >= expires_at {
                return Err(ApprovalError::Expired);
            }
        }
        Ok(())
    }

    async fn finalize_unapproved(&self, execution: &mut Execution, approval_status: ApprovalStatus, reason: &str) -> Result<()> {
        let now = Utc::now();
        execution.approval_status = approval_status;
        execution.approval_responded_at = Some(now);
        execution.status = ExecutionStatus::Completed;
        execution.completed_at = Some(now);

        if let Some(entry) = execution.agent_states.iter_mut().rev().find(|e| e.agent_type == "trade_manager_agent") {
            entry.status = "skipped".to_string();
            entry.completed_at = Some(now);
            entry.error = Some(reason.to_string());
        } else {
            execution.agent_states.push(AgentStateEntry {
                agent_id: "trade_manager_agent".to_string(),
                agent_type: "trade_manager_agent".to_string(),
                status: "skipped".to_string(),
                started_at: None,
                completed_at: Some(now),
                cost: 0.0,
                error: Some(reason.to_string()),
            });
        }

        let mut result = execution.result.clone().unwrap_or_else(|| serde_json::json!({}));
        result["trade_outcome"] = serde_json::json!("rejected");
        result["exit_reason"] = serde_json::json!(reason);
        execution.result = Some(result);

        let expected = execution.version;
        self.store.compare_and_save(execution, expected).await?;

        self.events.publish(Event::new(
            EventType::ExecutionComplete,
            execution.id,
            execution.user_id,
            serde_json::json!({ "status": "completed", "approval_status": approval_status.as_str(), "reason": reason }),
        ));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_runtime::{builtin, AgentRegistry, ToolRegistry};
    use chrono::Duration;
    use state_store::ExecutionMode;

    fn executor(store: Arc<StateStore>, events: Arc<EventBus>) -> Arc<Executor> {
        let mut registry = AgentRegistry::new(ToolRegistry::new());
        builtin::register_builtins(&mut registry);
        Arc::new(Executor::new(store, Arc::new(registry), events))
    }

    async fn awaiting_execution(store: &StateStore, ttl: Duration) -> Execution {
        let mut execution = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper, 300);
        execution.status = ExecutionStatus::AwaitingApproval;
        execution.approval_status = ApprovalStatus::Pending;
        execution.approval_token = Some("tok-123".to_string());
        execution.approval_expires_at = Some(Utc::now() + ttl);
        execution.agent_states.push(AgentStateEntry {
            agent_id: "tm".to_string(),
            agent_type: "trade_manager_agent".to_string(),
            status: "running".to_string(),
            started_at: Some(Utc::now()),
            completed_at: None,
            cost: 0.0,
            error: None,
        });
        store.create(&execution).await.unwrap();
        execution
    }

    #[tokio::test]
    async fn reject_completes_execution_and_skips_trade_manager() {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let events = Arc::new(EventBus::new());
        let gate = ApprovalGate::new(store.clone(), executor(store.clone(), events.clone()), events);

        let execution = awaiting_execution(&store, Duration::minutes(10)).await;
        gate.reject(execution.id, "tok-123", "user declined").await.unwrap();

        let reloaded = store.load(execution.id).await.unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::Completed);
        assert_eq!(reloaded.approval_status, ApprovalStatus::Rejected);
        assert_eq!(reloaded.agent_states[0].status, "skipped");
    }

    #[tokio::test]
    async fn reject_refuses_wrong_token() {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let events = Arc::new(EventBus::new());
        let gate = ApprovalGate::new(store.clone(), executor(store.clone(), events.clone()), events);

        let execution = awaiting_execution(&store, Duration::minutes(10)).await;
        let err = gate.reject(execution.id, "wrong-token", "nope").await.unwrap_err();
        assert!(matches!(err, ApprovalError::TokenMismatch));

        let reloaded = store.load(execution.id).await.unwrap();
        assert_eq!(reloaded.status, ExecutionStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn reject_refuses_expired_window() {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let events = Arc::new(EventBus::new());
        let gate = ApprovalGate::new(store.clone(), executor(store.clone(), events.clone()), events);

        let execution = awaiting_execution(&store, Duration::minutes(-1)).await;
        let err = gate.reject(execution.id, "tok-123", "too late").await.unwrap_err();
        assert!(matches!(err, ApprovalError::Expired));
    }

    #[tokio::test]
    async fn sweep_times_out_expired_pending_approvals_only() {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let events = Arc::new(EventBus::new());
        let gate = ApprovalGate::new(store.clone(), executor(store.clone(), events.clone()), events);

        let expired = awaiting_execution(&store, Duration::minutes(-1)).await;
        let fresh = awaiting_execution(&store, Duration::minutes(30)).await;

        let timed_out = gate.sweep_timeouts(Utc::now()).await.unwrap();
        assert_eq!(timed_out, 1);

        let expired_reloaded = store.load(expired.id).await.unwrap();
        assert_eq!(expired_reloaded.approval_status, ApprovalStatus::TimedOut);
        assert_eq!(expired_reloaded.status, ExecutionStatus::Completed);

        let fresh_reloaded = store.load(fresh.id).await.unwrap();
        assert_eq!(fresh_reloaded.status, ExecutionStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn sweep_is_idempotent_against_already_resolved_executions() {
        let store = Arc::new(StateStore::connect("sqlite::memory:").await.unwrap());
        let events = Arc::new(EventBus::new());
        let gate = ApprovalGate::new(store.clone(), executor(store.clone(), events.clone()), events);

        let execution = awaiting_execution(&store, Duration::minutes(-1)).await;
        gate.sweep_timeouts(Utc::now()).await.unwrap();
        let second = gate.sweep_timeouts(Utc::now()).await.unwrap();
        assert_eq!(second, 0);
        let _ = execution;
    }
}
