//! The engine-observable error taxonomy, composed from the lower
//! crates via `#[from]` the same way `nclav_reconciler::ReconcileError`
//! composes `DomainError` / `GraphError` / `StoreError` / `DriverError`.

use segment_domain::ParamsError;
use segment_registry::RegistryError;
use segment_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid params: {0}")]
    InvalidParams(#[from] ParamsError),

    #[error("asset instance not found: {0}")]
    InstanceMissing(String),

    #[error("asset params not found: {0}")]
    ParamsMissing(String),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    #[error("internal engine error: {0}")]
    Internal(String),
}
