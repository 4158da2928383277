pub mod error;
pub mod models;
pub mod store;

pub use error::{Result, StateStoreError};
pub use models::{
    AgentReport, AgentReportMetric, AgentStateEntry, ApprovalStatus, Execution, ExecutionMode,
    ExecutionPhase, ExecutionStatus, LogEntry, PipelineState,
};
pub use store::{ExecutionFilter, StateStore};

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn memory_store() -> StateStore {
        StateStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn create_and_load_round_trips() {
        let store = memory_store().await;
        let execution = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper, 300);
        store.create(&execution).await.unwrap();

        let loaded = store.load(execution.id).await.unwrap();
        assert_eq!(loaded.id, execution.id);
        assert_eq!(loaded.symbol, "AAPL");
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.status, ExecutionStatus::Pending);
        // invariant 2: pipeline_state.execution_id == Execution.id
        assert_eq!(loaded.pipeline_state.unwrap().execution_id, execution.id);
    }

    #[tokio::test]
    async fn compare_and_save_rejects_stale_version() {
        let store = memory_store().await;
        let mut execution = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "MSFT", ExecutionMode::Paper, 300);
        store.create(&execution).await.unwrap();

        // First writer succeeds at version 0 -> 1.
        execution.status = ExecutionStatus::Running;
        store.compare_and_save(&mut execution, 0).await.unwrap();
        assert_eq!(execution.version, 1);

        // A second writer still holding version 0 must be refused.
        let mut stale = store.load(execution.id).await.unwrap();
        stale.version = 1; // pretend we still think we're at 1... actually we are
        stale.status = ExecutionStatus::Failed;
        let err = store.compare_and_save(&mut stale, 0).await.unwrap_err();
        assert!(matches!(err, StateStoreError::StaleWrite { .. }));
    }

    #[tokio::test]
    async fn retry_helper_converges_after_conflict() {
        let store = memory_store().await;
        let execution = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "TSLA", ExecutionMode::Paper, 300);
        store.create(&execution).await.unwrap();

        let result = store
            .compare_and_save_with_retry(execution.id, 3, |e| {
                e.status = ExecutionStatus::Running;
            })
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Running);
        assert_eq!(result.version, 1);
    }

    #[tokio::test]
    async fn delete_terminal_older_than_skips_non_terminal() {
        let store = memory_store().await;
        let mut running = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper, 300);
        running.status = ExecutionStatus::Running;
        store.create(&running).await.unwrap();

        let mut done = Execution::new_pending(Uuid::new_v4(), Uuid::new_v4(), "AAPL", ExecutionMode::Paper, 300);
        done.status = ExecutionStatus::Completed;
        done.completed_at = Some(chrono::Utc::now() - chrono::Duration::days(40));
        store.create(&done).await.unwrap();

        let deleted = store
            .delete_terminal_older_than(chrono::Utc::now() - chrono::Duration::days(30))
            .await
            .unwrap();

        assert_eq!(deleted, 1);
        assert!(store.load(running.id).await.is_ok());
        assert!(store.load(done.id).await.is_err());
    }
}
