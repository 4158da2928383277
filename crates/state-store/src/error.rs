/// Errors surfaced at the state store's public boundary.
#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error("execution {0} not found")]
    NotFound(uuid::Uuid),

    #[error("stale write on execution {id}: expected version {expected}, row is at a different version")]
    StaleWrite { id: uuid::Uuid, expected: i64 },

    #[error("execution {0} has no pipeline_state and no legacy derivative view to reconstruct from")]
    StateUnrecoverable(uuid::Uuid),

    #[error("malformed timestamp in stored row: {0}")]
    TimestampParse(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StateStoreError>;
