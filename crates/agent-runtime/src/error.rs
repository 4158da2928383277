/// Errors an agent's `process` call can raise. Mirrors the exception
/// hierarchy the rest of the pipeline taxonomy uses: most are terminal for
/// the execution, `TriggerNotMet` is normal control flow.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// Not an error condition — the trigger agent says "not now". The
    /// execution must be marked `skipped`, not `failed`.
    #[error("trigger not met: {0}")]
    TriggerNotMet(String),

    #[error("budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("agent processing failed: {0}")]
    AgentProcessing(String),

    #[error("invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown agent type: {0}")]
    UnknownAgentType(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
