/// Errors surfaced at the executor's public boundary.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid pipeline graph: {0}")]
    InvalidGraph(String),

    #[error("pipeline has no node of agent_type {0}")]
    NodeNotFound(String),

    #[error("execution {0} is not awaiting approval")]
    NotAwaitingApproval(uuid::Uuid),

    #[error("execution {0} has no pipeline_state to resume from")]
    MissingState(uuid::Uuid),

    #[error(transparent)]
    Agent(#[from] agent_runtime::AgentError),

    #[error(transparent)]
    State(#[from] state_store::StateStoreError),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
