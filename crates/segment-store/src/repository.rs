use std::collections::BTreeSet;

use async_trait::async_trait;

use segment_domain::{
    AssetInstanceId, AssetMaterializationId, AssetParams, AssetParamsId, AssetSlug, PostId, UserId,
};

use crate::error::StoreError;
use crate::model::{
    AssetInstance, AssetInstanceFanoutRoot, AssetInstanceRoot, AssetMaterialization, AssetParamsRow,
    DecisionLogEntry, FanoutMode, IngestSyncRunSummary, MaterializationErrorPayload,
    PostCorpusEvent, SegmentEvent, SyncMode, SyncRunStatus,
};

/// Fields captured at the start of a materialization run.
#[derive(Debug, Clone)]
pub struct NewMaterialization {
    pub asset_instance_id: AssetInstanceId,
    pub asset_slug: AssetSlug,
    pub inputs_hash: String,
    pub inputs_hash_version: i32,
    pub dependency_revisions_hash: String,
    pub dependency_revisions_hash_version: i32,
    pub trigger_reason: String,
}

/// The one allowed update to a materialization row after insert — a single
/// completion transition to `success` or `error`.
#[derive(Debug, Clone)]
pub enum MaterializationCompletion {
    Success {
        output_revision: i64,
    },
    Error {
        error: MaterializationErrorPayload,
    },
}

/// The provenance, event, and snapshot writes a single materialization
/// performs once its `in_progress` row exists — everything that must commit
/// or roll back together, with the row itself surviving either way. A
/// concrete [`Repository`] hands one of these out per materialization via
/// [`Repository::begin_materialization_transaction`]; [`commit`] and
/// [`rollback`] consume it so a caller cannot accidentally reuse a closed
/// transaction.
///
/// [`commit`]: MaterializationTransaction::commit
/// [`rollback`]: MaterializationTransaction::rollback
#[async_trait]
pub trait MaterializationTransaction: Send + Sync {
    async fn insert_materialization_dependencies(
        &self,
        materialization_id: AssetMaterializationId,
        dependency_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError>;
    async fn insert_materialization_requests(
        &self,
        materialization_id: AssetMaterializationId,
        requested_by_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError>;
    async fn list_successful_materializations(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Vec<AssetMaterialization>, StoreError>;
    async fn rebuild_segment_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError>;
    async fn rebuild_post_corpus_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError>;
    async fn list_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError>;
    async fn list_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError>;
    async fn list_segment_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError>;
    async fn list_post_corpus_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError>;
    async fn insert_segment_events(&self, events: &[SegmentEvent]) -> Result<(), StoreError>;
    async fn insert_post_corpus_events(&self, events: &[PostCorpusEvent]) -> Result<(), StoreError>;
    async fn replace_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<UserId>,
    ) -> Result<(), StoreError>;
    async fn replace_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<PostId>,
    ) -> Result<(), StoreError>;

    /// Commit every write issued through this handle. Consumes the
    /// transaction so it cannot be reused afterward.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    /// Discard every write issued through this handle, leaving the store
    /// exactly as it was before [`Repository::begin_materialization_transaction`]
    /// was called.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// The narrow set of operations the engine requires from its persistence
/// layer. Non-transactional calls commit individually; the nine-step
/// materialization run instead opens one [`MaterializationTransaction`] via
/// [`begin_materialization_transaction`] and threads every step 2-9 write
/// through it, so they land atomically alongside the run row's own
/// completion update — see [`crate::lease::LeaseManager`] for the other
/// piece of cross-call coordination the engine needs (the materialization
/// lease spans the whole resolve, including the transaction).
///
/// [`begin_materialization_transaction`]: Repository::begin_materialization_transaction
#[async_trait]
pub trait Repository: Send + Sync {
    // ── Asset params ──────────────────────────────────────────────────────
    async fn get_or_create_asset_params(&self, params: &AssetParams) -> Result<AssetParamsRow, StoreError>;
    async fn get_asset_params_by_id(&self, id: AssetParamsId) -> Result<Option<AssetParamsRow>, StoreError>;
    async fn get_asset_params_by_instance_id(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Option<AssetParamsRow>, StoreError>;
    async fn get_asset_params_by_slug_hash(
        &self,
        slug: AssetSlug,
        params_hash_version: i32,
        params_hash: &str,
    ) -> Result<Option<AssetParamsRow>, StoreError>;

    // ── Asset instances ───────────────────────────────────────────────────
    async fn get_or_create_asset_instance(&self, params_id: AssetParamsId) -> Result<AssetInstance, StoreError>;
    async fn get_asset_instance_by_id(&self, id: AssetInstanceId) -> Result<Option<AssetInstance>, StoreError>;

    // ── Roots ─────────────────────────────────────────────────────────────
    async fn enable_asset_instance_root(&self, instance_id: AssetInstanceId) -> Result<(), StoreError>;
    async fn disable_asset_instance_root(&self, instance_id: AssetInstanceId) -> Result<(), StoreError>;
    async fn enable_asset_instance_fanout_root(
        &self,
        source_instance_id: AssetInstanceId,
        target_asset_slug: AssetSlug,
        fanout_mode: FanoutMode,
    ) -> Result<(), StoreError>;
    async fn disable_asset_instance_fanout_root(
        &self,
        source_instance_id: AssetInstanceId,
        target_asset_slug: AssetSlug,
    ) -> Result<(), StoreError>;
    async fn list_enabled_roots(&self) -> Result<Vec<AssetInstanceRoot>, StoreError>;
    async fn list_enabled_fanout_roots(&self) -> Result<Vec<AssetInstanceFanoutRoot>, StoreError>;

    // ── Materializations ──────────────────────────────────────────────────
    async fn create_asset_materialization(
        &self,
        new: NewMaterialization,
    ) -> Result<AssetMaterialization, StoreError>;
    async fn update_asset_materialization(
        &self,
        id: AssetMaterializationId,
        completion: MaterializationCompletion,
    ) -> Result<AssetMaterialization, StoreError>;
    async fn get_latest_successful_materialization(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Option<AssetMaterialization>, StoreError>;
    async fn get_asset_materialization_by_id(
        &self,
        id: AssetMaterializationId,
    ) -> Result<Option<AssetMaterialization>, StoreError>;

    /// All successful materializations of `instance_id`, ascending by the
    /// canonical `(completed_at, id)` order key — the ground truth for
    /// membership history.
    async fn list_successful_materializations(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Vec<AssetMaterialization>, StoreError>;

    // ── Provenance ────────────────────────────────────────────────────────
    async fn insert_materialization_dependencies(
        &self,
        materialization_id: AssetMaterializationId,
        dependency_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError>;
    async fn insert_materialization_requests(
        &self,
        materialization_id: AssetMaterializationId,
        requested_by_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError>;

    // ── Events ────────────────────────────────────────────────────────────
    async fn insert_segment_events(&self, events: &[SegmentEvent]) -> Result<(), StoreError>;
    async fn insert_post_corpus_events(&self, events: &[PostCorpusEvent]) -> Result<(), StoreError>;

    // ── Membership snapshots ──────────────────────────────────────────────
    async fn list_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError>;
    async fn list_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError>;
    async fn replace_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<UserId>,
    ) -> Result<(), StoreError>;
    async fn replace_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<PostId>,
    ) -> Result<(), StoreError>;
    async fn list_segment_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError>;
    async fn list_post_corpus_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError>;
    async fn get_segment_membership_as_of(
        &self,
        instance_id: AssetInstanceId,
        target_materialization_id: AssetMaterializationId,
    ) -> Result<BTreeSet<UserId>, StoreError>;
    async fn get_post_corpus_membership_as_of(
        &self,
        instance_id: AssetInstanceId,
        target_materialization_id: AssetMaterializationId,
    ) -> Result<BTreeSet<PostId>, StoreError>;
    async fn rebuild_segment_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError>;
    async fn rebuild_post_corpus_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError>;

    // ── Advisory locks ────────────────────────────────────────────────────
    async fn acquire_advisory_lock(&self, key: &str, timeout_ms: u64) -> Result<bool, StoreError>;
    async fn release_advisory_lock(&self, key: &str) -> Result<(), StoreError>;

    // ── Ingest sync run summaries (ingest layer's persisted artifacts) ────
    async fn get_latest_followers_sync_run(
        &self,
        target_user_id: UserId,
        status: Option<SyncRunStatus>,
        sync_mode: Option<SyncMode>,
    ) -> Result<Option<IngestSyncRunSummary>, StoreError>;
    async fn get_latest_followings_sync_run(
        &self,
        target_user_id: UserId,
        status: Option<SyncRunStatus>,
        sync_mode: Option<SyncMode>,
    ) -> Result<Option<IngestSyncRunSummary>, StoreError>;
    async fn get_latest_posts_sync_run(
        &self,
        target_user_id: UserId,
        status: Option<SyncRunStatus>,
    ) -> Result<Option<IngestSyncRunSummary>, StoreError>;
    async fn link_posts_sync_run_to_materializations(
        &self,
        sync_run_id: uuid::Uuid,
        materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError>;

    // ── Decision log ──────────────────────────────────────────────────────
    async fn record_planner_event(&self, entry: DecisionLogEntry) -> Result<(), StoreError>;

    // ── Operator-owned inputs (segment_specified_users) ───────────────────
    async fn get_specified_user_ids(&self, instance_id: AssetInstanceId) -> Result<Vec<UserId>, StoreError>;
    async fn set_specified_user_ids(
        &self,
        instance_id: AssetInstanceId,
        user_ids: &[UserId],
    ) -> Result<(), StoreError>;

    // ── Hydrated graph reads (hydration is an ingest-layer precondition) ──
    async fn graph_followers_of(&self, subject: UserId) -> Result<BTreeSet<UserId>, StoreError>;
    async fn graph_followed_by(&self, subject: UserId) -> Result<BTreeSet<UserId>, StoreError>;
    async fn posts_authored_by(&self, user_ids: &[UserId]) -> Result<BTreeSet<PostId>, StoreError>;

    // ── Transaction boundary for the nine-step materialization run ────────
    /// Open a transaction scoping the provenance, event, and snapshot writes
    /// of one materialization (steps 2-8). The `in_progress` row created by
    /// `create_asset_materialization` is *not* part of this transaction —
    /// it, and its eventual success/error update, survive a rollback so the
    /// run's own history always reflects what actually happened.
    async fn begin_materialization_transaction(
        &self,
    ) -> Result<Box<dyn MaterializationTransaction>, StoreError>;
}
