use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("asset params not found: {0}")]
    ParamsNotFound(String),

    #[error("asset instance not found: {0}")]
    InstanceNotFound(String),

    #[error("asset materialization not found: {0}")]
    MaterializationNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal store error: {0}")]
    Internal(String),

    /// Returned when an advisory lock is already held by another holder.
    #[error("advisory lock conflict: {key} already held")]
    LockConflict { key: String },

    /// An as-of read was asked to rewind past the instance's checkpoint, or
    /// the checkpoint is itself missing where the invariant requires one.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
}
