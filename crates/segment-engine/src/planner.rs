//! The core planner/runner: per-tick memoization, leaf-first
//! dependency resolution, hash computation, skip decision, and the
//! lease-guarded nine-step materialization transaction.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use segment_domain::{
    hash_parts_v1, AssetInstanceId, AssetMaterializationId, AssetParams, Decision, ItemId, ItemKind,
};
use segment_registry::{AssetDefinition, AssetRegistry, Dependency, ResolvedDependency, ValidationSeverity};
use segment_store::{
    DecisionLogEntry, LeaseManager, MaterializationCompletion, MaterializationErrorPayload, MaterializationTransaction,
    NewMaterialization, Repository,
};

use crate::config::EngineConfig;
use crate::context::RepositoryAssetContext;
use crate::error::EngineError;
use crate::ingest_planner::{IngestPlanner, IngestPrerequisiteFailure};
use crate::outcome::{MaterializeOutcome, OutcomeStatus};

/// A stable sentinel for an instance with no dependencies, distinguishable
/// from any real dependency set since the hashed parts always contain the
/// `empty` marker for a fixed part list.
fn empty_dependency_revisions_hash() -> (String, i32) {
    hash_parts_v1(["kind=dependency_revisions_hash:v1", "empty"])
}

fn dependency_revisions_hash(resolved: &[ResolvedDependency]) -> (String, i32) {
    if resolved.is_empty() {
        return empty_dependency_revisions_hash();
    }
    let mut sorted: Vec<&ResolvedDependency> = resolved.iter().collect();
    sorted.sort_by(|a, b| {
        let (hash_a, version_a) = a.dependency.params.params_hash_v1();
        let (hash_b, version_b) = b.dependency.params.params_hash_v1();
        (a.dependency.asset_slug.as_str(), version_a, hash_a).cmp(&(b.dependency.asset_slug.as_str(), version_b, hash_b))
    });
    let mut parts = vec!["kind=dependency_revisions_hash:v1".to_string()];
    for dep in sorted {
        let (hash, version) = dep.dependency.params.params_hash_v1();
        parts.push(format!(
            "dep={}:{}:{}:rev={}",
            dep.dependency.asset_slug, version, hash, dep.output_revision
        ));
    }
    hash_parts_v1(parts)
}

/// Holds everything a single `tick()` (or on-demand materialization call)
/// needs: the fresh `planner_run_id`, the shared dependency memoization map,
/// and the collaborators wired at `AssetEngine` construction.
pub struct PlannerRun {
    pub repo: Arc<dyn Repository>,
    pub registry: Arc<AssetRegistry>,
    pub ctx: Arc<RepositoryAssetContext>,
    pub ingest_planner: Arc<IngestPlanner>,
    pub leases: LeaseManager,
    pub config: EngineConfig,
    pub planner_run_id: Uuid,
    memo: Mutex<HashMap<AssetInstanceId, MaterializeOutcome>>,
}

impl PlannerRun {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<AssetRegistry>,
        ctx: Arc<RepositoryAssetContext>,
        ingest_planner: Arc<IngestPlanner>,
        config: EngineConfig,
    ) -> Self {
        let leases = LeaseManager::new(repo.clone());
        PlannerRun {
            repo,
            registry,
            ctx,
            ingest_planner,
            leases,
            config,
            planner_run_id: Uuid::new_v4(),
            memo: Mutex::new(HashMap::new()),
        }
    }

    async fn log(&self, target_id: Option<AssetInstanceId>, target_params: Option<String>, decision: Decision, reason: String) {
        let entry = DecisionLogEntry {
            planner_run_id: self.planner_run_id,
            job_id: self.planner_run_id,
            target_id,
            target_params,
            decision,
            reason,
            created_at: Utc::now(),
        };
        if let Err(err) = self.repo.record_planner_event(entry).await {
            warn!(error = %err, "failed to persist decision log entry");
        }
    }

    async fn memoize(&self, instance_id: AssetInstanceId, outcome: MaterializeOutcome) -> MaterializeOutcome {
        self.memo.lock().await.insert(instance_id, outcome.clone());
        outcome
    }

    fn error_outcome(instance_id: AssetInstanceId, message: impl Into<String>) -> MaterializeOutcome {
        MaterializeOutcome {
            instance_id,
            materialization_id: None,
            output_revision: None,
            status: OutcomeStatus::Error,
            error_message: Some(message.into()),
        }
    }

    /// Mint (or fetch) the params row and instance row for `params`, then
    /// resolve it. `requested_by` records materializations that explicitly
    /// asked for this instance (nonempty only for fanout targets — ordinary
    /// dependency edges are recorded via `insert_materialization_dependencies`
    /// once the depending instance's own materialization row exists).
    pub fn resolve_params<'a>(
        &'a self,
        params: AssetParams,
        requested_by: Vec<AssetMaterializationId>,
        trigger_reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<MaterializeOutcome, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            let params_row = self.repo.get_or_create_asset_params(&params).await?;
            let instance = self.repo.get_or_create_asset_instance(params_row.id).await?;
            self.resolve_instance(instance.id, requested_by, trigger_reason).await
        })
    }

    /// Resolve an already-minted instance id: the leaf-first recursive core.
    pub fn resolve_instance<'a>(
        &'a self,
        instance_id: AssetInstanceId,
        requested_by: Vec<AssetMaterializationId>,
        trigger_reason: String,
    ) -> Pin<Box<dyn Future<Output = Result<MaterializeOutcome, EngineError>> + Send + 'a>> {
        Box::pin(async move {
            if let Some(cached) = self.memo.lock().await.get(&instance_id).cloned() {
                return Ok(cached);
            }

            let Some(instance) = self.repo.get_asset_instance_by_id(instance_id).await? else {
                self.log(Some(instance_id), None, Decision::InstanceMissing, "instance not found".to_string())
                    .await;
                let outcome = Self::error_outcome(instance_id, "instance missing");
                return Ok(self.memoize(instance_id, outcome).await);
            };

            let definition = self.registry.get(instance.asset_slug)?;

            let Some(params_row) = self.repo.get_asset_params_by_instance_id(instance_id).await? else {
                self.log(Some(instance_id), None, Decision::ParamsMissing, "params not found for instance".to_string())
                    .await;
                let outcome = Self::error_outcome(instance_id, "params missing");
                return Ok(self.memoize(instance_id, outcome).await);
            };
            let params = params_row.params.clone();

            // ── leaf-first dependency resolution ──────────────────────────
            let deps: Vec<Dependency> = definition.dependencies(&params)?;
            let mut resolved_deps = Vec::with_capacity(deps.len());
            for dep in deps {
                let dep_outcome = self
                    .resolve_params(dep.params.clone(), Vec::new(), format!("dependency of {}", instance.asset_slug))
                    .await?;
                if !dep_outcome.is_usable_dependency() {
                    self.log(
                        Some(instance_id),
                        Some(params.format()),
                        Decision::DependencyFailed,
                        format!("dependency '{}' ({}) failed", dep.name, dep.asset_slug),
                    )
                    .await;
                    let outcome = Self::error_outcome(instance_id, format!("dependency '{}' failed", dep.name));
                    return Ok(self.memoize(instance_id, outcome).await);
                }
                resolved_deps.push(ResolvedDependency {
                    dependency: dep,
                    instance_id: dep_outcome.instance_id,
                    materialization_id: dep_outcome
                        .materialization_id
                        .expect("usable dependency outcome always carries a materialization id"),
                    output_revision: dep_outcome.output_revision.unwrap_or(0),
                });
            }

            // ── ingest prerequisites ──────────────────────────────────────
            let ingest_reqs = definition
                .ingest_requirements(&params, &resolved_deps, self.ctx.as_ref())
                .await?;
            if !ingest_reqs.is_empty() {
                if let Some(failure) = self.ingest_planner.satisfy(ingest_reqs).await? {
                    let (decision, reason) = match failure {
                        IngestPrerequisiteFailure::LockTimeout { key } => {
                            (Decision::IngestLockTimeout, format!("lease '{key}' timed out"))
                        }
                        IngestPrerequisiteFailure::RateLimited { kind, target } => {
                            (Decision::IngestRateLimited, format!("{kind} sync for {target} rate limited"))
                        }
                        IngestPrerequisiteFailure::Failed { kind, target, message } => {
                            (Decision::IngestFailed, format!("{kind} sync for {target} failed: {message}"))
                        }
                    };
                    self.log(Some(instance_id), Some(params.format()), decision, reason.clone()).await;
                    let outcome = Self::error_outcome(instance_id, reason);
                    return Ok(self.memoize(instance_id, outcome).await);
                }
            }

            // ── validation ─────────────────────────────────────────────────
            let issues = definition.validate_inputs(&params, instance_id, self.ctx.as_ref()).await?;
            let mut has_error = false;
            for issue in &issues {
                match issue.severity {
                    ValidationSeverity::Error => {
                        has_error = true;
                        self.log(Some(instance_id), Some(params.format()), Decision::ValidationError, issue.message.clone())
                            .await;
                    }
                    ValidationSeverity::Warning => {
                        self.log(Some(instance_id), Some(params.format()), Decision::ValidationWarning, issue.message.clone())
                            .await;
                    }
                }
            }
            if has_error {
                let outcome = Self::error_outcome(instance_id, "validation failed");
                return Ok(self.memoize(instance_id, outcome).await);
            }

            // ── inputs hash ────────────────────────────────────────────────
            let mut inputs_parts = vec![
                "kind=inputs_hash:v1".to_string(),
                format!("asset_slug={}", instance.asset_slug),
                format!("params_hash_version={}", params_row.params_hash_version),
                format!("params_hash={}", params_row.params_hash),
            ];
            inputs_parts.extend(
                definition
                    .inputs_hash_parts(&params, instance_id, self.ctx.as_ref())
                    .await?,
            );
            let (inputs_hash, inputs_hash_version) = hash_parts_v1(inputs_parts);
            let (dependency_revisions_hash, dependency_revisions_hash_version) =
                dependency_revisions_hash(&resolved_deps);

            // ── skip decision ──────────────────────────────────────────────
            let latest = self.repo.get_latest_successful_materialization(instance_id).await?;
            if let Some(latest) = &latest {
                if latest.inputs_hash_version == inputs_hash_version
                    && latest.inputs_hash == inputs_hash
                    && latest.dependency_revisions_hash_version == dependency_revisions_hash_version
                    && latest.dependency_revisions_hash == dependency_revisions_hash
                {
                    self.log(Some(instance_id), Some(params.format()), Decision::Skipped, "inputs unchanged".to_string())
                        .await;
                    let outcome = MaterializeOutcome {
                        instance_id,
                        materialization_id: Some(latest.id),
                        output_revision: Some(latest.output_revision),
                        status: OutcomeStatus::Skipped,
                        error_message: None,
                    };
                    return Ok(self.memoize(instance_id, outcome).await);
                }
            }

            // ── lease-guarded transaction ────────────────────────────────
            let lease_key = format!("instance:{instance_id}");
            let Some(_guard) = self.leases.acquire(&lease_key, self.config.lock_timeout_ms).await? else {
                self.log(Some(instance_id), Some(params.format()), Decision::LockTimeout, format!("lease '{lease_key}' timed out"))
                    .await;
                let outcome = Self::error_outcome(instance_id, "lock timeout");
                return Ok(self.memoize(instance_id, outcome).await);
            };

            let outcome = self
                .run_materialization_transaction(
                    &instance,
                    &params,
                    &resolved_deps,
                    &requested_by,
                    inputs_hash,
                    inputs_hash_version,
                    dependency_revisions_hash,
                    dependency_revisions_hash_version,
                    latest.as_ref().map(|m| m.output_revision),
                    trigger_reason,
                    definition.output_item_kind(),
                    definition.as_ref(),
                )
                .await?;
            Ok(self.memoize(instance_id, outcome).await)
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_materialization_transaction(
        &self,
        instance: &segment_store::AssetInstance,
        params: &AssetParams,
        resolved_deps: &[ResolvedDependency],
        requested_by: &[AssetMaterializationId],
        inputs_hash: String,
        inputs_hash_version: i32,
        dependency_revisions_hash: String,
        dependency_revisions_hash_version: i32,
        prior_output_revision: Option<i64>,
        trigger_reason: String,
        item_kind: ItemKind,
        definition: &dyn segment_registry::AssetDefinition,
    ) -> Result<MaterializeOutcome, EngineError> {
        let instance_id = instance.id;

        // Step 1: insert in_progress row.
        let materialization = self
            .repo
            .create_asset_materialization(NewMaterialization {
                asset_instance_id: instance_id,
                asset_slug: instance.asset_slug,
                inputs_hash,
                inputs_hash_version,
                dependency_revisions_hash,
                dependency_revisions_hash_version,
                trigger_reason,
            })
            .await?;
        let materialization_id = materialization.id;

        // Steps 2-8 run inside one transaction so provenance, events, and the
        // snapshot replace either all land or none do; the in_progress row
        // above and its completion update below sit outside it on purpose —
        // a rollback must still leave behind a row recording the failed run.
        let tx = self.repo.begin_materialization_transaction().await?;
        let result = self
            .run_materialization_body(
                tx.as_ref(),
                instance,
                params,
                resolved_deps,
                requested_by,
                prior_output_revision,
                item_kind,
                definition,
                materialization_id,
            )
            .await;

        let result = match result {
            Ok(output_revision) => match tx.commit().await {
                Ok(()) => Ok(output_revision),
                Err(err) => Err(EngineError::from(err)),
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "failed to roll back materialization transaction");
                }
                Err(err)
            }
        };

        match result {
            Ok(output_revision) => {
                self.repo
                    .update_asset_materialization(materialization_id, MaterializationCompletion::Success { output_revision })
                    .await?;
                self.log(
                    Some(instance_id),
                    Some(params.format()),
                    Decision::Materialized,
                    format!("materialization {materialization_id} output_revision={output_revision}"),
                )
                .await;
                info!(instance_id = %instance_id, materialization_id = %materialization_id, "materialized");
                Ok(MaterializeOutcome {
                    instance_id,
                    materialization_id: Some(materialization_id),
                    output_revision: Some(output_revision),
                    status: OutcomeStatus::Success,
                    error_message: None,
                })
            }
            Err(err) => {
                let payload = MaterializationErrorPayload {
                    name: "MaterializationError".to_string(),
                    message: err.to_string(),
                    stack: None,
                };
                if let Err(update_err) = self
                    .repo
                    .update_asset_materialization(materialization_id, MaterializationCompletion::Error { error: payload })
                    .await
                {
                    warn!(error = %update_err, "failed to mark materialization row as errored");
                }
                self.log(Some(instance_id), Some(params.format()), Decision::MaterializationError, err.to_string())
                    .await;
                Ok(Self::error_outcome(instance_id, err.to_string()))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_materialization_body(
        &self,
        tx: &dyn MaterializationTransaction,
        instance: &segment_store::AssetInstance,
        params: &AssetParams,
        resolved_deps: &[ResolvedDependency],
        requested_by: &[AssetMaterializationId],
        prior_output_revision: Option<i64>,
        item_kind: ItemKind,
        definition: &dyn segment_registry::AssetDefinition,
        materialization_id: AssetMaterializationId,
    ) -> Result<i64, EngineError> {
        let instance_id = instance.id;

        // Step 2: dependency provenance + requested-by provenance.
        if !resolved_deps.is_empty() {
            let dep_mat_ids: Vec<AssetMaterializationId> = resolved_deps.iter().map(|d| d.materialization_id).collect();
            tx.insert_materialization_dependencies(materialization_id, &dep_mat_ids).await?;
        }
        tx.insert_materialization_requests(materialization_id, requested_by).await?;

        // Step 3: checkpoint repair.
        if instance.current_membership_materialization_id.is_none() {
            let has_prior = !tx.list_successful_materializations(instance_id).await?.is_empty();
            if has_prior {
                match item_kind {
                    ItemKind::User => tx.rebuild_segment_membership_snapshot(instance_id).await?,
                    ItemKind::Post => tx.rebuild_post_corpus_membership_snapshot(instance_id).await?,
                }
                self.log(Some(instance_id), Some(params.format()), Decision::CheckpointRepair, "rebuilt snapshot from event history".to_string())
                    .await;
            }
        }

        // Step 4: compute membership.
        let new_members = definition
            .compute_membership(params, instance_id, resolved_deps, self.ctx.as_ref())
            .await?;

        // Step 5: diff against the current snapshot.
        let (old_items, new_items): (BTreeSet<ItemId>, BTreeSet<ItemId>) = match item_kind {
            ItemKind::User => {
                let old = tx.list_segment_membership_snapshot(instance_id).await?;
                let old: BTreeSet<ItemId> = old.into_iter().map(ItemId::User).collect();
                (old, new_members)
            }
            ItemKind::Post => {
                let old = tx.list_post_corpus_membership_snapshot(instance_id).await?;
                let old: BTreeSet<ItemId> = old.into_iter().map(ItemId::Post).collect();
                (old, new_members)
            }
        };
        let entered: BTreeSet<ItemId> = new_items.difference(&old_items).copied().collect();
        let exited: BTreeSet<ItemId> = old_items.difference(&new_items).copied().collect();

        let ever_entered: BTreeSet<ItemId> = match item_kind {
            ItemKind::User => tx
                .list_segment_entered_item_ids(instance_id)
                .await?
                .into_iter()
                .map(ItemId::User)
                .collect(),
            ItemKind::Post => tx
                .list_post_corpus_entered_item_ids(instance_id)
                .await?
                .into_iter()
                .map(ItemId::Post)
                .collect(),
        };

        // Step 6: insert event rows.
        match item_kind {
            ItemKind::User => {
                let mut events = Vec::with_capacity(entered.len() + exited.len());
                for item in &entered {
                    let ItemId::User(user_id) = item else { continue };
                    events.push(segment_store::SegmentEvent {
                        materialization_id,
                        user_id: *user_id,
                        event_type: segment_store::EventType::Enter,
                        is_first_appearance: Some(!ever_entered.contains(item)),
                    });
                }
                for item in &exited {
                    let ItemId::User(user_id) = item else { continue };
                    events.push(segment_store::SegmentEvent {
                        materialization_id,
                        user_id: *user_id,
                        event_type: segment_store::EventType::Exit,
                        is_first_appearance: None,
                    });
                }
                tx.insert_segment_events(&events).await?;
            }
            ItemKind::Post => {
                let mut events = Vec::with_capacity(entered.len() + exited.len());
                for item in &entered {
                    let ItemId::Post(post_id) = item else { continue };
                    events.push(segment_store::PostCorpusEvent {
                        materialization_id,
                        post_id: *post_id,
                        event_type: segment_store::EventType::Enter,
                        is_first_appearance: Some(!ever_entered.contains(item)),
                    });
                }
                for item in &exited {
                    let ItemId::Post(post_id) = item else { continue };
                    events.push(segment_store::PostCorpusEvent {
                        materialization_id,
                        post_id: *post_id,
                        event_type: segment_store::EventType::Exit,
                        is_first_appearance: None,
                    });
                }
                tx.insert_post_corpus_events(&events).await?;
            }
        }

        // Step 7: replace the snapshot (also moves the instance pointer).
        match item_kind {
            ItemKind::User => {
                let users: BTreeSet<segment_domain::UserId> = new_items
                    .iter()
                    .filter_map(|item| match item {
                        ItemId::User(u) => Some(*u),
                        ItemId::Post(_) => None,
                    })
                    .collect();
                tx.replace_segment_membership_snapshot(instance_id, materialization_id, &users)
                    .await?;
            }
            ItemKind::Post => {
                let posts: BTreeSet<segment_domain::PostId> = new_items
                    .iter()
                    .filter_map(|item| match item {
                        ItemId::Post(p) => Some(*p),
                        ItemId::User(_) => None,
                    })
                    .collect();
                tx.replace_post_corpus_membership_snapshot(instance_id, materialization_id, &posts)
                    .await?;
            }
        }

        // Step 8: output revision.
        let prior_revision = prior_output_revision.unwrap_or(0);
        let output_revision = if entered.is_empty() && exited.is_empty() {
            prior_revision
        } else {
            prior_revision + 1
        };

        Ok(output_revision)
    }
}
