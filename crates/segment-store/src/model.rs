//! Semantic rendering of the engine's core entities. These are plain data
//! structs — persistence-format-agnostic — shared by every [`crate::Repository`]
//! implementation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use segment_domain::{
    AssetInstanceId, AssetMaterializationId, AssetParams, AssetParamsId, AssetSlug, Decision, PostId, UserId,
};

/// A minted, canonical parameter record. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetParamsRow {
    pub id: AssetParamsId,
    pub params: AssetParams,
    pub params_hash: String,
    pub params_hash_version: i32,
}

/// Identity anchor for a parameterized asset, and the pointer to its current
/// membership checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInstance {
    pub id: AssetInstanceId,
    pub params_id: AssetParamsId,
    pub asset_slug: AssetSlug,
    pub params_hash: String,
    pub params_hash_version: i32,
    pub current_membership_materialization_id: Option<AssetMaterializationId>,
}

/// Operator intent to keep an instance materialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInstanceRoot {
    pub instance_id: AssetInstanceId,
    pub enabled_at: DateTime<Utc>,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl AssetInstanceRoot {
    pub fn is_enabled(&self) -> bool {
        self.disabled_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutMode {
    GlobalPerItem,
    ScopedBySource,
}

/// Operator intent to derive child instances from a source instance's
/// membership, one per member item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetInstanceFanoutRoot {
    pub source_instance_id: AssetInstanceId,
    pub target_asset_slug: AssetSlug,
    pub fanout_mode: FanoutMode,
    pub enabled_at: DateTime<Utc>,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl AssetInstanceFanoutRoot {
    pub fn is_enabled(&self) -> bool {
        self.disabled_at.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializationStatus {
    InProgress,
    Success,
    Error,
}

/// A serialized, truncated error payload persisted on a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializationErrorPayload {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

/// An immutable run record. Inserted `in_progress`, updated exactly once on
/// completion, never otherwise mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetMaterialization {
    pub id: AssetMaterializationId,
    pub asset_instance_id: AssetInstanceId,
    pub asset_slug: AssetSlug,
    pub inputs_hash: String,
    pub inputs_hash_version: i32,
    pub dependency_revisions_hash: String,
    pub dependency_revisions_hash_version: i32,
    pub status: MaterializationStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output_revision: i64,
    pub error: Option<MaterializationErrorPayload>,
    pub trigger_reason: String,
}

impl AssetMaterialization {
    /// Ordering key establishing the canonical per-instance event clock:
    /// `(completed_at ASC, id ASC)`.
    pub fn order_key(&self) -> (DateTime<Utc>, AssetMaterializationId) {
        (
            self.completed_at.unwrap_or(self.started_at),
            self.id,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Enter,
    Exit,
}

/// One enter/exit toggle for a user-item asset, keyed uniquely by
/// `(materialization_id, user_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEvent {
    pub materialization_id: AssetMaterializationId,
    pub user_id: UserId,
    pub event_type: EventType,
    pub is_first_appearance: Option<bool>,
}

/// One enter/exit toggle for a post-item asset, keyed uniquely by
/// `(materialization_id, post_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostCorpusEvent {
    pub materialization_id: AssetMaterializationId,
    pub post_id: PostId,
    pub event_type: EventType,
    pub is_first_appearance: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Success,
    Error,
}

/// The slice of an upstream ingest run the engine actually consults:
/// freshness and mode selection for a `(target, ingest_kind)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSyncRunSummary {
    pub status: SyncRunStatus,
    pub sync_mode: Option<SyncMode>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A structured, append-only planner event, keyed by `planner_run_id` for
/// correlation across a single tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionLogEntry {
    pub planner_run_id: uuid::Uuid,
    pub job_id: uuid::Uuid,
    pub target_id: Option<AssetInstanceId>,
    pub target_params: Option<String>,
    pub decision: Decision,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}
