//! The closed vocabulary of planner decisions. Shared between the
//! store (which persists decision log rows) and the engine (which emits
//! them), so neither crate needs to depend on the other for this type.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    InstanceMissing,
    ParamsMissing,
    ValidationError,
    ValidationWarning,
    DependencyFailed,
    IngestLockTimeout,
    IngestRateLimited,
    IngestFailed,
    LockTimeout,
    MaterializationError,
    CheckpointRepair,
    FanoutSourceUnavailable,
    FanoutSourceMissing,
    FanoutTargetInvalid,
    FanoutTargetError,
    /// Not a failure path, but still a non-trivial planner action worth a
    /// log row.
    Skipped,
    Materialized,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::InstanceMissing => "instance_missing",
            Decision::ParamsMissing => "params_missing",
            Decision::ValidationError => "validation_error",
            Decision::ValidationWarning => "validation_warning",
            Decision::DependencyFailed => "dependency_failed",
            Decision::IngestLockTimeout => "ingest_lock_timeout",
            Decision::IngestRateLimited => "ingest_rate_limited",
            Decision::IngestFailed => "ingest_failed",
            Decision::LockTimeout => "lock_timeout",
            Decision::MaterializationError => "materialization_error",
            Decision::CheckpointRepair => "checkpoint_repair",
            Decision::FanoutSourceUnavailable => "fanout_source_unavailable",
            Decision::FanoutSourceMissing => "fanout_source_missing",
            Decision::FanoutTargetInvalid => "fanout_target_invalid",
            Decision::FanoutTargetError => "fanout_target_error",
            Decision::Skipped => "skipped",
            Decision::Materialized => "materialized",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
