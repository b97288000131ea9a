//! The shapes the engine API returns to hosts.

use segment_domain::{AssetInstanceId, AssetMaterializationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    Skipped,
    Error,
}

/// Result of materializing a single instance, returned by every public
/// engine entry point (`tick`'s internal resolution, `materialize_instance_by_id`,
/// `materialize_params`).
#[derive(Debug, Clone)]
pub struct MaterializeOutcome {
    pub instance_id: AssetInstanceId,
    pub materialization_id: Option<AssetMaterializationId>,
    pub output_revision: Option<i64>,
    pub status: OutcomeStatus,
    pub error_message: Option<String>,
}

impl MaterializeOutcome {
    pub fn is_usable_dependency(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success | OutcomeStatus::Skipped)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaterializeOptions {
    pub trigger_reason: Option<String>,
}

/// Summary of one `tick()` pass — every root and fanout root attempted, with
/// their individual outcomes. Errors for one root never prevent the others
/// from being attempted.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub planner_run_id: uuid::Uuid,
    pub root_outcomes: Vec<MaterializeOutcome>,
    pub fanout_target_outcomes: Vec<MaterializeOutcome>,
}
