//! In-memory [`Repository`] implementation. All data is lost on process
//! exit; backs every unit test so no test requires a live database, mirroring
//! `nclav-store::InMemoryStore`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use segment_domain::{
    AssetInstanceId, AssetMaterializationId, AssetParams, AssetParamsId, AssetSlug, PostId, UserId,
};

use crate::error::StoreError;
use crate::model::{
    AssetInstance, AssetInstanceFanoutRoot, AssetInstanceRoot, AssetMaterialization, AssetParamsRow,
    DecisionLogEntry, EventType, FanoutMode, IngestSyncRunSummary, MaterializationStatus, PostCorpusEvent,
    SegmentEvent, SyncMode, SyncRunStatus,
};
use crate::repository::{MaterializationCompletion, MaterializationTransaction, NewMaterialization, Repository};

#[derive(Clone, Default)]
struct Inner {
    next_params_id: i64,
    next_instance_id: i64,
    next_materialization_id: i64,

    params_by_id: HashMap<AssetParamsId, AssetParamsRow>,
    params_id_by_hash: HashMap<(AssetSlug, i32, String), AssetParamsId>,

    instances_by_id: HashMap<AssetInstanceId, AssetInstance>,
    instance_id_by_params: HashMap<AssetParamsId, AssetInstanceId>,

    roots: HashMap<AssetInstanceId, AssetInstanceRoot>,
    fanout_roots: HashMap<(AssetInstanceId, AssetSlug), AssetInstanceFanoutRoot>,

    materializations: HashMap<AssetMaterializationId, AssetMaterialization>,
    dependency_links: HashMap<AssetMaterializationId, Vec<AssetMaterializationId>>,
    request_links: HashMap<AssetMaterializationId, Vec<AssetMaterializationId>>,

    segment_events: Vec<SegmentEvent>,
    post_corpus_events: Vec<PostCorpusEvent>,

    segment_snapshots: HashMap<AssetInstanceId, BTreeMap<UserId, AssetMaterializationId>>,
    post_corpus_snapshots: HashMap<AssetInstanceId, BTreeMap<PostId, AssetMaterializationId>>,

    advisory_locks: HashSet<String>,

    followers_sync_runs: HashMap<UserId, Vec<IngestSyncRunSummary>>,
    followings_sync_runs: HashMap<UserId, Vec<IngestSyncRunSummary>>,
    posts_sync_runs: HashMap<UserId, Vec<IngestSyncRunSummary>>,

    decision_log: Vec<DecisionLogEntry>,

    specified_user_ids: HashMap<AssetInstanceId, Vec<UserId>>,

    graph_followers: HashMap<UserId, BTreeSet<UserId>>,
    graph_followed: HashMap<UserId, BTreeSet<UserId>>,
    authored_posts: HashMap<UserId, BTreeSet<PostId>>,
}

/// In-memory implementation of [`Repository`].
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/fixture seam: register hydrated graph edges as if an upstream
    /// ingest had already synced them.
    pub async fn seed_graph_followers(&self, subject: UserId, followers: impl IntoIterator<Item = UserId>) {
        let mut guard = self.inner.write().await;
        guard.graph_followers.entry(subject).or_default().extend(followers);
    }

    pub async fn seed_graph_followed(&self, subject: UserId, followed: impl IntoIterator<Item = UserId>) {
        let mut guard = self.inner.write().await;
        guard.graph_followed.entry(subject).or_default().extend(followed);
    }

    pub async fn seed_authored_posts(&self, author: UserId, posts: impl IntoIterator<Item = PostId>) {
        let mut guard = self.inner.write().await;
        guard.authored_posts.entry(author).or_default().extend(posts);
    }

    /// Test/fixture seam: record a sync run summary as if the ingest layer
    /// had just completed it.
    pub async fn seed_followers_sync_run(&self, target: UserId, summary: IngestSyncRunSummary) {
        let mut guard = self.inner.write().await;
        guard.followers_sync_runs.entry(target).or_default().push(summary);
    }

    pub async fn seed_followings_sync_run(&self, target: UserId, summary: IngestSyncRunSummary) {
        let mut guard = self.inner.write().await;
        guard.followings_sync_runs.entry(target).or_default().push(summary);
    }

    pub async fn seed_posts_sync_run(&self, target: UserId, summary: IngestSyncRunSummary) {
        let mut guard = self.inner.write().await;
        guard.posts_sync_runs.entry(target).or_default().push(summary);
    }

    /// Replay every successful materialization's events in ascending
    /// `(completed_at, id)` order, applying enter/exit sequentially. Shared
    /// by both the segment and post-corpus rebuild/as-of paths — each calls
    /// it with its own projection of "events for this materialization".
    fn ordered_successful(&self, guard: &Inner, instance_id: AssetInstanceId) -> Vec<AssetMaterialization> {
        ordered_successful_inner(guard, instance_id)
    }
}

/// Free-function twin of [`InMemoryRepository::ordered_successful`] usable
/// against a borrowed [`Inner`] without going through the repository's own
/// lock — the materialization transaction already holds the write guard and
/// would deadlock re-entering it.
fn ordered_successful_inner(guard: &Inner, instance_id: AssetInstanceId) -> Vec<AssetMaterialization> {
    let mut mats: Vec<AssetMaterialization> = guard
        .materializations
        .values()
        .filter(|m| m.asset_instance_id == instance_id && m.status == MaterializationStatus::Success)
        .cloned()
        .collect();
    mats.sort_by_key(|m| m.order_key());
    mats
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn get_or_create_asset_params(&self, params: &AssetParams) -> Result<AssetParamsRow, StoreError> {
        let (params_hash, params_hash_version) = params.params_hash_v1();
        let slug = params.slug();
        let mut guard = self.inner.write().await;
        let key = (slug, params_hash_version, params_hash.clone());
        if let Some(id) = guard.params_id_by_hash.get(&key).copied() {
            return Ok(guard.params_by_id[&id].clone());
        }
        guard.next_params_id += 1;
        let id = AssetParamsId(guard.next_params_id);
        let row = AssetParamsRow {
            id,
            params: params.clone(),
            params_hash,
            params_hash_version,
        };
        guard.params_by_id.insert(id, row.clone());
        guard.params_id_by_hash.insert(key, id);
        Ok(row)
    }

    async fn get_asset_params_by_id(&self, id: AssetParamsId) -> Result<Option<AssetParamsRow>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.params_by_id.get(&id).cloned())
    }

    async fn get_asset_params_by_instance_id(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Option<AssetParamsRow>, StoreError> {
        let guard = self.inner.read().await;
        let Some(instance) = guard.instances_by_id.get(&instance_id) else {
            return Ok(None);
        };
        Ok(guard.params_by_id.get(&instance.params_id).cloned())
    }

    async fn get_asset_params_by_slug_hash(
        &self,
        slug: AssetSlug,
        params_hash_version: i32,
        params_hash: &str,
    ) -> Result<Option<AssetParamsRow>, StoreError> {
        let guard = self.inner.read().await;
        let key = (slug, params_hash_version, params_hash.to_string());
        Ok(guard
            .params_id_by_hash
            .get(&key)
            .and_then(|id| guard.params_by_id.get(id))
            .cloned())
    }

    async fn get_or_create_asset_instance(&self, params_id: AssetParamsId) -> Result<AssetInstance, StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(id) = guard.instance_id_by_params.get(&params_id).copied() {
            return Ok(guard.instances_by_id[&id].clone());
        }
        let params_row = guard
            .params_by_id
            .get(&params_id)
            .cloned()
            .ok_or_else(|| StoreError::ParamsNotFound(params_id.to_string()))?;
        guard.next_instance_id += 1;
        let id = AssetInstanceId(guard.next_instance_id);
        let instance = AssetInstance {
            id,
            params_id,
            asset_slug: params_row.params.slug(),
            params_hash: params_row.params_hash,
            params_hash_version: params_row.params_hash_version,
            current_membership_materialization_id: None,
        };
        guard.instances_by_id.insert(id, instance.clone());
        guard.instance_id_by_params.insert(params_id, id);
        Ok(instance)
    }

    async fn get_asset_instance_by_id(&self, id: AssetInstanceId) -> Result<Option<AssetInstance>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.instances_by_id.get(&id).cloned())
    }

    async fn enable_asset_instance_root(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let now = Utc::now();
        guard
            .roots
            .entry(instance_id)
            .and_modify(|r| r.disabled_at = None)
            .or_insert(AssetInstanceRoot {
                instance_id,
                enabled_at: now,
                disabled_at: None,
            });
        Ok(())
    }

    async fn disable_asset_instance_root(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(root) = guard.roots.get_mut(&instance_id) {
            root.disabled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn enable_asset_instance_fanout_root(
        &self,
        source_instance_id: AssetInstanceId,
        target_asset_slug: AssetSlug,
        fanout_mode: FanoutMode,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let now = Utc::now();
        let key = (source_instance_id, target_asset_slug);
        guard
            .fanout_roots
            .entry(key)
            .and_modify(|r| r.disabled_at = None)
            .or_insert(AssetInstanceFanoutRoot {
                source_instance_id,
                target_asset_slug,
                fanout_mode,
                enabled_at: now,
                disabled_at: None,
            });
        Ok(())
    }

    async fn disable_asset_instance_fanout_root(
        &self,
        source_instance_id: AssetInstanceId,
        target_asset_slug: AssetSlug,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if let Some(root) = guard.fanout_roots.get_mut(&(source_instance_id, target_asset_slug)) {
            root.disabled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_enabled_roots(&self) -> Result<Vec<AssetInstanceRoot>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.roots.values().filter(|r| r.is_enabled()).cloned().collect())
    }

    async fn list_enabled_fanout_roots(&self) -> Result<Vec<AssetInstanceFanoutRoot>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .fanout_roots
            .values()
            .filter(|r| r.is_enabled())
            .cloned()
            .collect())
    }

    async fn create_asset_materialization(
        &self,
        new: NewMaterialization,
    ) -> Result<AssetMaterialization, StoreError> {
        let mut guard = self.inner.write().await;
        guard.next_materialization_id += 1;
        let id = AssetMaterializationId(guard.next_materialization_id);
        let mat = AssetMaterialization {
            id,
            asset_instance_id: new.asset_instance_id,
            asset_slug: new.asset_slug,
            inputs_hash: new.inputs_hash,
            inputs_hash_version: new.inputs_hash_version,
            dependency_revisions_hash: new.dependency_revisions_hash,
            dependency_revisions_hash_version: new.dependency_revisions_hash_version,
            status: MaterializationStatus::InProgress,
            started_at: Utc::now(),
            completed_at: None,
            output_revision: 0,
            error: None,
            trigger_reason: new.trigger_reason,
        };
        guard.materializations.insert(id, mat.clone());
        Ok(mat)
    }

    async fn update_asset_materialization(
        &self,
        id: AssetMaterializationId,
        completion: MaterializationCompletion,
    ) -> Result<AssetMaterialization, StoreError> {
        let mut guard = self.inner.write().await;
        let mat = guard
            .materializations
            .get_mut(&id)
            .ok_or_else(|| StoreError::MaterializationNotFound(id.to_string()))?;
        mat.completed_at = Some(Utc::now());
        match completion {
            MaterializationCompletion::Success { output_revision } => {
                mat.status = MaterializationStatus::Success;
                mat.output_revision = output_revision;
                mat.error = None;
            }
            MaterializationCompletion::Error { error } => {
                mat.status = MaterializationStatus::Error;
                mat.error = Some(error);
            }
        }
        Ok(mat.clone())
    }

    async fn get_latest_successful_materialization(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Option<AssetMaterialization>, StoreError> {
        let guard = self.inner.read().await;
        Ok(self.ordered_successful(&guard, instance_id).into_iter().last())
    }

    async fn get_asset_materialization_by_id(
        &self,
        id: AssetMaterializationId,
    ) -> Result<Option<AssetMaterialization>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.materializations.get(&id).cloned())
    }

    async fn list_successful_materializations(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Vec<AssetMaterialization>, StoreError> {
        let guard = self.inner.read().await;
        Ok(self.ordered_successful(&guard, instance_id))
    }

    async fn insert_materialization_dependencies(
        &self,
        materialization_id: AssetMaterializationId,
        dependency_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .dependency_links
            .entry(materialization_id)
            .or_default()
            .extend(dependency_materialization_ids.iter().copied());
        Ok(())
    }

    async fn insert_materialization_requests(
        &self,
        materialization_id: AssetMaterializationId,
        requested_by_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard
            .request_links
            .entry(materialization_id)
            .or_default()
            .extend(requested_by_materialization_ids.iter().copied());
        Ok(())
    }

    async fn insert_segment_events(&self, events: &[SegmentEvent]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.segment_events.extend(events.iter().copied());
        Ok(())
    }

    async fn insert_post_corpus_events(&self, events: &[PostCorpusEvent]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.post_corpus_events.extend(events.iter().copied());
        Ok(())
    }

    async fn list_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .segment_snapshots
            .get(&instance_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn list_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .post_corpus_snapshots
            .get(&instance_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn replace_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<UserId>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let snapshot = items.iter().map(|id| (*id, materialization_id)).collect();
        guard.segment_snapshots.insert(instance_id, snapshot);
        if let Some(instance) = guard.instances_by_id.get_mut(&instance_id) {
            instance.current_membership_materialization_id = Some(materialization_id);
        }
        Ok(())
    }

    async fn replace_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<PostId>,
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let snapshot = items.iter().map(|id| (*id, materialization_id)).collect();
        guard.post_corpus_snapshots.insert(instance_id, snapshot);
        if let Some(instance) = guard.instances_by_id.get_mut(&instance_id) {
            instance.current_membership_materialization_id = Some(materialization_id);
        }
        Ok(())
    }

    async fn list_segment_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let guard = self.inner.read().await;
        let mat_ids: HashSet<AssetMaterializationId> = guard
            .materializations
            .values()
            .filter(|m| m.asset_instance_id == instance_id && m.status == MaterializationStatus::Success)
            .map(|m| m.id)
            .collect();
        Ok(guard
            .segment_events
            .iter()
            .filter(|e| mat_ids.contains(&e.materialization_id) && e.event_type == EventType::Enter)
            .map(|e| e.user_id)
            .collect())
    }

    async fn list_post_corpus_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError> {
        let guard = self.inner.read().await;
        let mat_ids: HashSet<AssetMaterializationId> = guard
            .materializations
            .values()
            .filter(|m| m.asset_instance_id == instance_id && m.status == MaterializationStatus::Success)
            .map(|m| m.id)
            .collect();
        Ok(guard
            .post_corpus_events
            .iter()
            .filter(|e| mat_ids.contains(&e.materialization_id) && e.event_type == EventType::Enter)
            .map(|e| e.post_id)
            .collect())
    }

    async fn get_segment_membership_as_of(
        &self,
        instance_id: AssetInstanceId,
        target_materialization_id: AssetMaterializationId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let guard = self.inner.read().await;
        let instance = guard
            .instances_by_id
            .get(&instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let Some(checkpoint_id) = instance.current_membership_materialization_id else {
            return Err(StoreError::InvariantViolated(format!(
                "instance {instance_id} has no checkpoint to rewind from"
            )));
        };
        if target_materialization_id == checkpoint_id {
            return self.list_segment_membership_snapshot(instance_id).await;
        }

        let ordered = self.ordered_successful(&guard, instance_id);
        let target_pos = ordered
            .iter()
            .position(|m| m.id == target_materialization_id)
            .ok_or_else(|| {
                StoreError::InvariantViolated(format!(
                    "materialization {target_materialization_id} is not a successful run of instance {instance_id}"
                ))
            })?;
        let checkpoint_pos = ordered
            .iter()
            .position(|m| m.id == checkpoint_id)
            .ok_or_else(|| StoreError::InvariantViolated("checkpoint materialization missing".to_string()))?;
        if target_pos > checkpoint_pos {
            return Err(StoreError::InvariantViolated(format!(
                "target materialization {target_materialization_id} is newer than the checkpoint"
            )));
        }

        // Toggle set: items with an odd count of successful events in
        // (target, checkpoint].
        let rewind_mats: HashSet<AssetMaterializationId> =
            ordered[target_pos + 1..=checkpoint_pos].iter().map(|m| m.id).collect();
        let mut toggle_counts: HashMap<UserId, u32> = HashMap::new();
        for event in guard
            .segment_events
            .iter()
            .filter(|e| rewind_mats.contains(&e.materialization_id))
        {
            *toggle_counts.entry(event.user_id).or_insert(0) += 1;
        }

        let current_snapshot = self.list_segment_membership_snapshot(instance_id).await?;
        let mut result = current_snapshot;
        for (user_id, count) in toggle_counts {
            if count % 2 == 1 {
                if !result.remove(&user_id) {
                    result.insert(user_id);
                }
            }
        }
        Ok(result)
    }

    async fn get_post_corpus_membership_as_of(
        &self,
        instance_id: AssetInstanceId,
        target_materialization_id: AssetMaterializationId,
    ) -> Result<BTreeSet<PostId>, StoreError> {
        let guard = self.inner.read().await;
        let instance = guard
            .instances_by_id
            .get(&instance_id)
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let Some(checkpoint_id) = instance.current_membership_materialization_id else {
            return Err(StoreError::InvariantViolated(format!(
                "instance {instance_id} has no checkpoint to rewind from"
            )));
        };
        if target_materialization_id == checkpoint_id {
            return self.list_post_corpus_membership_snapshot(instance_id).await;
        }

        let ordered = self.ordered_successful(&guard, instance_id);
        let target_pos = ordered
            .iter()
            .position(|m| m.id == target_materialization_id)
            .ok_or_else(|| {
                StoreError::InvariantViolated(format!(
                    "materialization {target_materialization_id} is not a successful run of instance {instance_id}"
                ))
            })?;
        let checkpoint_pos = ordered
            .iter()
            .position(|m| m.id == checkpoint_id)
            .ok_or_else(|| StoreError::InvariantViolated("checkpoint materialization missing".to_string()))?;
        if target_pos > checkpoint_pos {
            return Err(StoreError::InvariantViolated(format!(
                "target materialization {target_materialization_id} is newer than the checkpoint"
            )));
        }

        let rewind_mats: HashSet<AssetMaterializationId> =
            ordered[target_pos + 1..=checkpoint_pos].iter().map(|m| m.id).collect();
        let mut toggle_counts: HashMap<PostId, u32> = HashMap::new();
        for event in guard
            .post_corpus_events
            .iter()
            .filter(|e| rewind_mats.contains(&e.materialization_id))
        {
            *toggle_counts.entry(event.post_id).or_insert(0) += 1;
        }

        let current_snapshot = self.list_post_corpus_membership_snapshot(instance_id).await?;
        let mut result = current_snapshot;
        for (post_id, count) in toggle_counts {
            if count % 2 == 1 {
                if !result.remove(&post_id) {
                    result.insert(post_id);
                }
            }
        }
        Ok(result)
    }

    async fn rebuild_segment_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let (ordered, events) = {
            let guard = self.inner.read().await;
            (self.ordered_successful(&guard, instance_id), guard.segment_events.clone())
        };
        let mut membership: BTreeSet<UserId> = BTreeSet::new();
        let mut last_mat_id = None;
        for mat in &ordered {
            for event in events.iter().filter(|e| e.materialization_id == mat.id) {
                match event.event_type {
                    EventType::Enter => {
                        membership.insert(event.user_id);
                    }
                    EventType::Exit => {
                        membership.remove(&event.user_id);
                    }
                }
            }
            last_mat_id = Some(mat.id);
        }
        if let Some(mat_id) = last_mat_id {
            self.replace_segment_membership_snapshot(instance_id, mat_id, &membership).await?;
        }
        Ok(())
    }

    async fn rebuild_post_corpus_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let (ordered, events) = {
            let guard = self.inner.read().await;
            (
                self.ordered_successful(&guard, instance_id),
                guard.post_corpus_events.clone(),
            )
        };
        let mut membership: BTreeSet<PostId> = BTreeSet::new();
        let mut last_mat_id = None;
        for mat in &ordered {
            for event in events.iter().filter(|e| e.materialization_id == mat.id) {
                match event.event_type {
                    EventType::Enter => {
                        membership.insert(event.post_id);
                    }
                    EventType::Exit => {
                        membership.remove(&event.post_id);
                    }
                }
            }
            last_mat_id = Some(mat.id);
        }
        if let Some(mat_id) = last_mat_id {
            self.replace_post_corpus_membership_snapshot(instance_id, mat_id, &membership).await?;
        }
        Ok(())
    }

    async fn acquire_advisory_lock(&self, key: &str, _timeout_ms: u64) -> Result<bool, StoreError> {
        // The in-memory repository never contends with another process, so
        // a single attempt (no polling) exercises the same acquire/release
        // contract real callers rely on.
        let mut guard = self.inner.write().await;
        if guard.advisory_locks.contains(key) {
            return Ok(false);
        }
        guard.advisory_locks.insert(key.to_string());
        Ok(true)
    }

    async fn release_advisory_lock(&self, key: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.advisory_locks.remove(key);
        Ok(())
    }

    async fn get_latest_followers_sync_run(
        &self,
        target_user_id: UserId,
        status: Option<SyncRunStatus>,
        sync_mode: Option<SyncMode>,
    ) -> Result<Option<IngestSyncRunSummary>, StoreError> {
        let guard = self.inner.read().await;
        Ok(latest_matching(guard.followers_sync_runs.get(&target_user_id), status, sync_mode))
    }

    async fn get_latest_followings_sync_run(
        &self,
        target_user_id: UserId,
        status: Option<SyncRunStatus>,
        sync_mode: Option<SyncMode>,
    ) -> Result<Option<IngestSyncRunSummary>, StoreError> {
        let guard = self.inner.read().await;
        Ok(latest_matching(guard.followings_sync_runs.get(&target_user_id), status, sync_mode))
    }

    async fn get_latest_posts_sync_run(
        &self,
        target_user_id: UserId,
        status: Option<SyncRunStatus>,
    ) -> Result<Option<IngestSyncRunSummary>, StoreError> {
        let guard = self.inner.read().await;
        Ok(latest_matching(guard.posts_sync_runs.get(&target_user_id), status, None))
    }

    async fn link_posts_sync_run_to_materializations(
        &self,
        _sync_run_id: uuid::Uuid,
        _materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        // Provenance linking for posts sync runs is owned by the ingest
        // layer's own store; this repository only needs to accept the call
        // without erroring so the engine's call site stays uniform.
        Ok(())
    }

    async fn record_planner_event(&self, entry: DecisionLogEntry) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.decision_log.push(entry);
        Ok(())
    }

    async fn get_specified_user_ids(&self, instance_id: AssetInstanceId) -> Result<Vec<UserId>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.specified_user_ids.get(&instance_id).cloned().unwrap_or_default())
    }

    async fn set_specified_user_ids(
        &self,
        instance_id: AssetInstanceId,
        user_ids: &[UserId],
    ) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.specified_user_ids.insert(instance_id, user_ids.to_vec());
        Ok(())
    }

    async fn graph_followers_of(&self, subject: UserId) -> Result<BTreeSet<UserId>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.graph_followers.get(&subject).cloned().unwrap_or_default())
    }

    async fn graph_followed_by(&self, subject: UserId) -> Result<BTreeSet<UserId>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard.graph_followed.get(&subject).cloned().unwrap_or_default())
    }

    async fn posts_authored_by(&self, user_ids: &[UserId]) -> Result<BTreeSet<PostId>, StoreError> {
        let guard = self.inner.read().await;
        let mut posts = BTreeSet::new();
        for user_id in user_ids {
            if let Some(authored) = guard.authored_posts.get(user_id) {
                posts.extend(authored.iter().copied());
            }
        }
        Ok(posts)
    }

    async fn begin_materialization_transaction(
        &self,
    ) -> Result<Box<dyn MaterializationTransaction>, StoreError> {
        // Holding the write guard for the transaction's whole lifetime gives
        // isolation for free — no concurrent caller can observe a partially
        // applied run. Rollback just restores the pre-transaction snapshot
        // into the still-held guard; the snapshot is the only undo log this
        // needs since nothing outside the guard can have changed meanwhile.
        let guard = self.inner.clone().write_owned().await;
        let snapshot = (*guard).clone();
        Ok(Box::new(InMemoryMaterializationTransaction {
            state: tokio::sync::Mutex::new(Some(InMemoryTxState { guard, snapshot })),
        }))
    }
}

struct InMemoryTxState {
    guard: tokio::sync::OwnedRwLockWriteGuard<Inner>,
    snapshot: Inner,
}

/// `MaterializationTransaction` for [`InMemoryRepository`]. The trait's `&self`
/// methods need to mutate the staged [`Inner`], so the state lives behind a
/// [`tokio::sync::Mutex`] rather than `&mut self` — the same interior-
/// mutability shape the repository itself uses around its `RwLock`.
struct InMemoryMaterializationTransaction {
    state: tokio::sync::Mutex<Option<InMemoryTxState>>,
}

#[async_trait]
impl MaterializationTransaction for InMemoryMaterializationTransaction {
    async fn insert_materialization_dependencies(
        &self,
        materialization_id: AssetMaterializationId,
        dependency_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().expect("transaction used after commit/rollback");
        state
            .guard
            .dependency_links
            .entry(materialization_id)
            .or_default()
            .extend(dependency_materialization_ids.iter().copied());
        Ok(())
    }

    async fn insert_materialization_requests(
        &self,
        materialization_id: AssetMaterializationId,
        requested_by_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().expect("transaction used after commit/rollback");
        state
            .guard
            .request_links
            .entry(materialization_id)
            .or_default()
            .extend(requested_by_materialization_ids.iter().copied());
        Ok(())
    }

    async fn list_successful_materializations(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Vec<AssetMaterialization>, StoreError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().expect("transaction used after commit/rollback");
        Ok(ordered_successful_inner(&state.guard, instance_id))
    }

    async fn rebuild_segment_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let (ordered, events) = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().expect("transaction used after commit/rollback");
            (
                ordered_successful_inner(&state.guard, instance_id),
                state.guard.segment_events.clone(),
            )
        };
        let mut membership: BTreeSet<UserId> = BTreeSet::new();
        let mut last_mat_id = None;
        for mat in &ordered {
            for event in events.iter().filter(|e| e.materialization_id == mat.id) {
                match event.event_type {
                    EventType::Enter => {
                        membership.insert(event.user_id);
                    }
                    EventType::Exit => {
                        membership.remove(&event.user_id);
                    }
                }
            }
            last_mat_id = Some(mat.id);
        }
        if let Some(mat_id) = last_mat_id {
            self.replace_segment_membership_snapshot(instance_id, mat_id, &membership).await?;
        }
        Ok(())
    }

    async fn rebuild_post_corpus_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let (ordered, events) = {
            let guard = self.state.lock().await;
            let state = guard.as_ref().expect("transaction used after commit/rollback");
            (
                ordered_successful_inner(&state.guard, instance_id),
                state.guard.post_corpus_events.clone(),
            )
        };
        let mut membership: BTreeSet<PostId> = BTreeSet::new();
        let mut last_mat_id = None;
        for mat in &ordered {
            for event in events.iter().filter(|e| e.materialization_id == mat.id) {
                match event.event_type {
                    EventType::Enter => {
                        membership.insert(event.post_id);
                    }
                    EventType::Exit => {
                        membership.remove(&event.post_id);
                    }
                }
            }
            last_mat_id = Some(mat.id);
        }
        if let Some(mat_id) = last_mat_id {
            self.replace_post_corpus_membership_snapshot(instance_id, mat_id, &membership).await?;
        }
        Ok(())
    }

    async fn list_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().expect("transaction used after commit/rollback");
        Ok(state
            .guard
            .segment_snapshots
            .get(&instance_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn list_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError> {
        let guard = self.state.lock().await;
        let state = guard.as_ref().expect("transaction used after commit/rollback");
        Ok(state
            .guard
            .post_corpus_snapshots
            .get(&instance_id)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn list_segment_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let guard = self.state.lock().await;
        let inner = &guard.as_ref().expect("transaction used after commit/rollback").guard;
        let mat_ids: HashSet<AssetMaterializationId> = inner
            .materializations
            .values()
            .filter(|m| m.asset_instance_id == instance_id && m.status == MaterializationStatus::Success)
            .map(|m| m.id)
            .collect();
        Ok(inner
            .segment_events
            .iter()
            .filter(|e| mat_ids.contains(&e.materialization_id) && e.event_type == EventType::Enter)
            .map(|e| e.user_id)
            .collect())
    }

    async fn list_post_corpus_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError> {
        let guard = self.state.lock().await;
        let inner = &guard.as_ref().expect("transaction used after commit/rollback").guard;
        let mat_ids: HashSet<AssetMaterializationId> = inner
            .materializations
            .values()
            .filter(|m| m.asset_instance_id == instance_id && m.status == MaterializationStatus::Success)
            .map(|m| m.id)
            .collect();
        Ok(inner
            .post_corpus_events
            .iter()
            .filter(|e| mat_ids.contains(&e.materialization_id) && e.event_type == EventType::Enter)
            .map(|e| e.post_id)
            .collect())
    }

    async fn insert_segment_events(&self, events: &[SegmentEvent]) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().expect("transaction used after commit/rollback");
        state.guard.segment_events.extend(events.iter().copied());
        Ok(())
    }

    async fn insert_post_corpus_events(&self, events: &[PostCorpusEvent]) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().expect("transaction used after commit/rollback");
        state.guard.post_corpus_events.extend(events.iter().copied());
        Ok(())
    }

    async fn replace_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<UserId>,
    ) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().expect("transaction used after commit/rollback");
        let snapshot = items.iter().map(|id| (*id, materialization_id)).collect();
        state.guard.segment_snapshots.insert(instance_id, snapshot);
        if let Some(instance) = state.guard.instances_by_id.get_mut(&instance_id) {
            instance.current_membership_materialization_id = Some(materialization_id);
        }
        Ok(())
    }

    async fn replace_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<PostId>,
    ) -> Result<(), StoreError> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().expect("transaction used after commit/rollback");
        let snapshot = items.iter().map(|id| (*id, materialization_id)).collect();
        state.guard.post_corpus_snapshots.insert(instance_id, snapshot);
        if let Some(instance) = state.guard.instances_by_id.get_mut(&instance_id) {
            instance.current_membership_materialization_id = Some(materialization_id);
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        // The guard already holds every write; dropping the state without
        // restoring the snapshot releases the lock with the writes intact.
        drop(self.state.into_inner());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        if let Some(mut state) = self.state.into_inner() {
            *state.guard = state.snapshot;
        }
        Ok(())
    }
}

fn latest_matching(
    runs: Option<&Vec<IngestSyncRunSummary>>,
    status: Option<SyncRunStatus>,
    sync_mode: Option<SyncMode>,
) -> Option<IngestSyncRunSummary> {
    runs?
        .iter()
        .filter(|r| status.map_or(true, |s| r.status == s))
        .filter(|r| sync_mode.map_or(true, |m| r.sync_mode == Some(m)))
        .max_by_key(|r| r.completed_at)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::NewMaterialization;

    fn followers_params(subject: u64) -> AssetParams {
        AssetParams::SegmentFollowers {
            subject_user_id: UserId(subject),
            fanout_source_params_hash: None,
        }
    }

    #[tokio::test]
    async fn get_or_create_asset_params_is_idempotent_by_hash() {
        let repo = InMemoryRepository::new();
        let a = repo.get_or_create_asset_params(&followers_params(1)).await.unwrap();
        let b = repo.get_or_create_asset_params(&followers_params(1)).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.params_hash, b.params_hash);
    }

    #[tokio::test]
    async fn get_or_create_asset_instance_is_idempotent_by_params() {
        let repo = InMemoryRepository::new();
        let params = repo.get_or_create_asset_params(&followers_params(7)).await.unwrap();
        let i1 = repo.get_or_create_asset_instance(params.id).await.unwrap();
        let i2 = repo.get_or_create_asset_instance(params.id).await.unwrap();
        assert_eq!(i1.id, i2.id);
    }

    #[tokio::test]
    async fn enable_and_disable_root_round_trip() {
        let repo = InMemoryRepository::new();
        let params = repo.get_or_create_asset_params(&followers_params(9)).await.unwrap();
        let instance = repo.get_or_create_asset_instance(params.id).await.unwrap();

        assert!(repo.list_enabled_roots().await.unwrap().is_empty());
        repo.enable_asset_instance_root(instance.id).await.unwrap();
        let roots = repo.list_enabled_roots().await.unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].instance_id, instance.id);

        repo.disable_asset_instance_root(instance.id).await.unwrap();
        assert!(repo.list_enabled_roots().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn materialization_lifecycle_tracks_latest_success() {
        let repo = InMemoryRepository::new();
        let params = repo.get_or_create_asset_params(&followers_params(3)).await.unwrap();
        let instance = repo.get_or_create_asset_instance(params.id).await.unwrap();

        let mat = repo
            .create_asset_materialization(NewMaterialization {
                asset_instance_id: instance.id,
                asset_slug: AssetSlug::SegmentFollowers,
                inputs_hash: "h1".to_string(),
                inputs_hash_version: 1,
                dependency_revisions_hash: "d1".to_string(),
                dependency_revisions_hash_version: 1,
                trigger_reason: "test".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(mat.status, MaterializationStatus::InProgress);
        assert!(repo
            .get_latest_successful_materialization(instance.id)
            .await
            .unwrap()
            .is_none());

        let completed = repo
            .update_asset_materialization(mat.id, MaterializationCompletion::Success { output_revision: 1 })
            .await
            .unwrap();
        assert_eq!(completed.status, MaterializationStatus::Success);

        let latest = repo
            .get_latest_successful_materialization(instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, mat.id);
    }

    #[tokio::test]
    async fn segment_membership_snapshot_round_trips() {
        let repo = InMemoryRepository::new();
        let params = repo.get_or_create_asset_params(&followers_params(5)).await.unwrap();
        let instance = repo.get_or_create_asset_instance(params.id).await.unwrap();
        let mat = repo
            .create_asset_materialization(NewMaterialization {
                asset_instance_id: instance.id,
                asset_slug: AssetSlug::SegmentFollowers,
                inputs_hash: "h".to_string(),
                inputs_hash_version: 1,
                dependency_revisions_hash: "d".to_string(),
                dependency_revisions_hash_version: 1,
                trigger_reason: "test".to_string(),
            })
            .await
            .unwrap();

        let members: BTreeSet<UserId> = [UserId(1), UserId(2)].into_iter().collect();
        repo.replace_segment_membership_snapshot(instance.id, mat.id, &members)
            .await
            .unwrap();
        let snapshot = repo.list_segment_membership_snapshot(instance.id).await.unwrap();
        assert_eq!(snapshot, members);

        let fetched_instance = repo.get_asset_instance_by_id(instance.id).await.unwrap().unwrap();
        assert_eq!(fetched_instance.current_membership_materialization_id, Some(mat.id));
    }

    #[tokio::test]
    async fn advisory_lock_excludes_concurrent_holder() {
        let repo = InMemoryRepository::new();
        assert!(repo.acquire_advisory_lock("instance:1", 0).await.unwrap());
        assert!(!repo.acquire_advisory_lock("instance:1", 0).await.unwrap());
        repo.release_advisory_lock("instance:1").await.unwrap();
        assert!(repo.acquire_advisory_lock("instance:1", 0).await.unwrap());
    }

    #[tokio::test]
    async fn hydrated_graph_reads_reflect_seeded_edges() {
        let repo = InMemoryRepository::new();
        repo.seed_graph_followers(UserId(1), [UserId(2), UserId(3)]).await;
        repo.seed_authored_posts(UserId(2), [PostId(100)]).await;

        let followers = repo.graph_followers_of(UserId(1)).await.unwrap();
        assert_eq!(followers, [UserId(2), UserId(3)].into_iter().collect());

        let posts = repo.posts_authored_by(&[UserId(2), UserId(3)]).await.unwrap();
        assert_eq!(posts, [PostId(100)].into_iter().collect());
    }

    #[tokio::test]
    async fn segment_membership_as_of_rewinds_to_prior_checkpoint() {
        let repo = InMemoryRepository::new();
        let params = repo.get_or_create_asset_params(&followers_params(11)).await.unwrap();
        let instance = repo.get_or_create_asset_instance(params.id).await.unwrap();

        let mat1 = repo
            .create_asset_materialization(NewMaterialization {
                asset_instance_id: instance.id,
                asset_slug: AssetSlug::SegmentFollowers,
                inputs_hash: "h1".to_string(),
                inputs_hash_version: 1,
                dependency_revisions_hash: "d1".to_string(),
                dependency_revisions_hash_version: 1,
                trigger_reason: "test".to_string(),
            })
            .await
            .unwrap();
        repo.update_asset_materialization(mat1.id, MaterializationCompletion::Success { output_revision: 1 })
            .await
            .unwrap();
        repo.insert_segment_events(&[SegmentEvent {
            materialization_id: mat1.id,
            user_id: UserId(1),
            event_type: EventType::Enter,
            is_first_appearance: Some(true),
        }])
        .await
        .unwrap();
        let after_first: BTreeSet<UserId> = [UserId(1)].into_iter().collect();
        repo.replace_segment_membership_snapshot(instance.id, mat1.id, &after_first)
            .await
            .unwrap();

        let mat2 = repo
            .create_asset_materialization(NewMaterialization {
                asset_instance_id: instance.id,
                asset_slug: AssetSlug::SegmentFollowers,
                inputs_hash: "h2".to_string(),
                inputs_hash_version: 1,
                dependency_revisions_hash: "d2".to_string(),
                dependency_revisions_hash_version: 1,
                trigger_reason: "test".to_string(),
            })
            .await
            .unwrap();
        repo.update_asset_materialization(mat2.id, MaterializationCompletion::Success { output_revision: 2 })
            .await
            .unwrap();
        repo.insert_segment_events(&[SegmentEvent {
            materialization_id: mat2.id,
            user_id: UserId(2),
            event_type: EventType::Enter,
            is_first_appearance: Some(true),
        }])
        .await
        .unwrap();
        let after_second: BTreeSet<UserId> = [UserId(1), UserId(2)].into_iter().collect();
        repo.replace_segment_membership_snapshot(instance.id, mat2.id, &after_second)
            .await
            .unwrap();

        let as_of_first = repo
            .get_segment_membership_as_of(instance.id, mat1.id)
            .await
            .unwrap();
        assert_eq!(as_of_first, after_first);

        let as_of_second = repo
            .get_segment_membership_as_of(instance.id, mat2.id)
            .await
            .unwrap();
        assert_eq!(as_of_second, after_second);
    }
}
