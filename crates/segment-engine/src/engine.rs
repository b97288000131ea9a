//! Public engine API consumed by hosts: construction, a single
//! tick over every enabled root and fanout root, and on-demand
//! materialization. Mirrors the shape of `nclav_reconciler::reconcile`'s
//! top-level orchestration function, generalized into a long-lived struct
//! since this engine is driven repeatedly rather than once per CLI
//! invocation.

use std::sync::Arc;

use chrono::Utc;
use segment_domain::{AssetParams, Decision, ItemId, ItemKind};
use segment_registry::{AssetDefinition, AssetRegistry};
use segment_store::{DecisionLogEntry, FanoutMode, Repository};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancellation::CancellationSignal;
use crate::config::EngineConfig;
use crate::context::RepositoryAssetContext;
use crate::error::EngineError;
use crate::ingest::IngestClient;
use crate::ingest_planner::IngestPlanner;
use crate::outcome::{MaterializeOptions, MaterializeOutcome, TickReport};
use crate::planner::PlannerRun;

/// Long-lived planner/runner over a repository, registry, and ingest client.
pub struct AssetEngine {
    repo: Arc<dyn Repository>,
    registry: Arc<AssetRegistry>,
    ingest: Arc<dyn IngestClient>,
    config: EngineConfig,
}

impl AssetEngine {
    pub fn new(
        repo: Arc<dyn Repository>,
        registry: Arc<AssetRegistry>,
        ingest: Arc<dyn IngestClient>,
        config: EngineConfig,
    ) -> Self {
        AssetEngine {
            repo,
            registry,
            ingest,
            config,
        }
    }

    fn new_planner_run(&self) -> PlannerRun {
        let ctx = Arc::new(RepositoryAssetContext {
            repo: self.repo.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        });
        let ingest_planner = Arc::new(IngestPlanner {
            repo: self.repo.clone(),
            ingest: self.ingest.clone(),
            leases: segment_store::LeaseManager::new(self.repo.clone()),
            config: self.config.clone(),
        });
        PlannerRun::new(self.repo.clone(), self.registry.clone(), ctx, ingest_planner, self.config.clone())
    }

    /// One planner pass over every enabled root and fanout root. Errors for
    /// one root are captured in its outcome and the decision log; they never
    /// prevent the remaining roots from being attempted.
    pub async fn tick(&self, signal: &CancellationSignal) -> Result<TickReport, EngineError> {
        let planner = self.new_planner_run();
        let planner_run_id = planner.planner_run_id;
        info!(planner_run_id = %planner_run_id, "tick started");

        let mut root_outcomes = Vec::new();
        let roots = self.repo.list_enabled_roots().await?;
        for root in roots {
            if signal.is_cancelled() {
                break;
            }
            let outcome = planner
                .resolve_instance(root.instance_id, Vec::new(), "root tick".to_string())
                .await?;
            root_outcomes.push(outcome);
        }

        let mut fanout_target_outcomes = Vec::new();
        let fanout_roots = self.repo.list_enabled_fanout_roots().await?;
        for fanout_root in fanout_roots {
            if signal.is_cancelled() {
                break;
            }
            let outcomes = self.run_fanout_root(&planner, &fanout_root, signal).await?;
            fanout_target_outcomes.extend(outcomes);
        }

        info!(
            planner_run_id = %planner_run_id,
            roots = root_outcomes.len(),
            fanout_targets = fanout_target_outcomes.len(),
            "tick finished"
        );

        Ok(TickReport {
            planner_run_id,
            root_outcomes,
            fanout_target_outcomes,
        })
    }

    /// Fanout root execution: resolve the source instance, then
    /// mint and materialize one target per member item. A target's failure
    /// is logged but never aborts its siblings.
    async fn run_fanout_root(
        &self,
        planner: &PlannerRun,
        fanout_root: &segment_store::AssetInstanceFanoutRoot,
        signal: &CancellationSignal,
    ) -> Result<Vec<MaterializeOutcome>, EngineError> {
        let source_instance_id = fanout_root.source_instance_id;
        let mut outcomes = Vec::new();

        let Some(source_instance) = self.repo.get_asset_instance_by_id(source_instance_id).await? else {
            self.log_fanout(planner.planner_run_id, Decision::FanoutSourceMissing, "source instance not found".to_string())
                .await;
            return Ok(outcomes);
        };

        let source_outcome = planner
            .resolve_instance(source_instance_id, Vec::new(), "fanout source".to_string())
            .await?;
        if !source_outcome.is_usable_dependency() {
            self.log_fanout(
                planner.planner_run_id,
                Decision::FanoutSourceUnavailable,
                format!("source instance {source_instance_id} did not materialize"),
            )
            .await;
            return Ok(outcomes);
        }

        let source_definition = self.registry.get(source_instance.asset_slug)?;
        let item_kind = source_definition.output_item_kind();
        let members: Vec<ItemId> = match item_kind {
            ItemKind::User => self
                .repo
                .list_segment_membership_snapshot(source_instance_id)
                .await?
                .into_iter()
                .map(ItemId::User)
                .collect(),
            ItemKind::Post => self
                .repo
                .list_post_corpus_membership_snapshot(source_instance_id)
                .await?
                .into_iter()
                .map(ItemId::Post)
                .collect(),
        };

        let fanout_source_params_hash = match fanout_root.fanout_mode {
            FanoutMode::ScopedBySource => Some(source_instance.params_hash.clone()),
            FanoutMode::GlobalPerItem => None,
        };

        let target_definition = self.registry.get(fanout_root.target_asset_slug)?;
        let source_materialization_id = source_outcome
            .materialization_id
            .expect("usable source outcome always carries a materialization id");

        for member in members {
            if signal.is_cancelled() {
                break;
            }
            let target_params = match target_definition.params_from_fanout_item(
                item_kind,
                member,
                fanout_source_params_hash.clone(),
            ) {
                Ok(params) => params,
                Err(err) => {
                    self.log_fanout(
                        planner.planner_run_id,
                        Decision::FanoutTargetInvalid,
                        format!("member {member}: {err}"),
                    )
                    .await;
                    continue;
                }
            };

            if let Err(err) = self.seed_fanout_target_inputs(&target_params, member).await {
                warn!(member = %member, error = %err, "failed to seed fanout target inputs");
                self.log_fanout(
                    planner.planner_run_id,
                    Decision::FanoutTargetError,
                    format!("member {member}: {err}"),
                )
                .await;
                continue;
            }

            match planner
                .resolve_params(
                    target_params,
                    vec![source_materialization_id],
                    format!("fanout from {source_instance_id}"),
                )
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(member = %member, error = %err, "fanout target failed");
                    self.log_fanout(
                        planner.planner_run_id,
                        Decision::FanoutTargetError,
                        format!("member {member}: {err}"),
                    )
                    .await;
                }
            }
        }

        Ok(outcomes)
    }

    /// Some fanout targets (e.g. `post_corpus_for_segment`) wrap the fanned-
    /// out member in a synthetic single-member `segment_specified_users`
    /// dependency rather than referencing the member directly in their own
    /// params. That dependency's specified-user row is operator input as far
    /// as the registry is concerned, so the fanout minting path — standing
    /// in for the operator here — seeds it before the target is resolved.
    async fn seed_fanout_target_inputs(&self, target_params: &AssetParams, member: ItemId) -> Result<(), EngineError> {
        if let AssetParams::PostCorpusForSegment {
            source_segment_params,
            ..
        } = target_params
        {
            if let AssetParams::SegmentSpecifiedUsers { .. } = source_segment_params.as_ref() {
                let ItemId::User(member_user_id) = member else {
                    return Ok(());
                };
                let params_row = self.repo.get_or_create_asset_params(source_segment_params).await?;
                let nested_instance = self.repo.get_or_create_asset_instance(params_row.id).await?;
                self.repo
                    .set_specified_user_ids(nested_instance.id, &[member_user_id])
                    .await?;
            }
        }
        Ok(())
    }

    async fn log_fanout(&self, planner_run_id: Uuid, decision: Decision, reason: String) {
        let entry = DecisionLogEntry {
            planner_run_id,
            job_id: planner_run_id,
            target_id: None,
            target_params: None,
            decision,
            reason,
            created_at: Utc::now(),
        };
        if let Err(err) = self.repo.record_planner_event(entry).await {
            warn!(error = %err, "failed to persist fanout decision log entry");
        }
    }

    /// Materialize a single instance on demand.
    pub async fn materialize_instance_by_id(
        &self,
        instance_id: segment_domain::AssetInstanceId,
        options: MaterializeOptions,
    ) -> Result<MaterializeOutcome, EngineError> {
        let planner = self.new_planner_run();
        let trigger_reason = options.trigger_reason.unwrap_or_else(|| "on-demand".to_string());
        planner.resolve_instance(instance_id, Vec::new(), trigger_reason).await
    }

    /// Ensure params/instance exist, then materialize.
    pub async fn materialize_params(
        &self,
        params: segment_domain::AssetParams,
        options: MaterializeOptions,
    ) -> Result<MaterializeOutcome, EngineError> {
        let planner = self.new_planner_run();
        let trigger_reason = options.trigger_reason.unwrap_or_else(|| "on-demand".to_string());
        planner.resolve_params(params, Vec::new(), trigger_reason).await
    }
}

/// End-to-end exercises of the engine's core scenarios, run entirely against
/// [`segment_store::InMemoryRepository`] so none of them need a live
/// database. Mirrors `nclav_reconciler::reconcile`'s own test module, which
/// drives the whole reconcile loop against `InMemoryStore` + `LocalDriver`
/// rather than mocking at the call-boundary level.
#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use segment_domain::{AssetParams, UserId};
    use segment_registry::build_registry;
    use segment_store::{FanoutMode, IngestSyncRunSummary, InMemoryRepository, SyncMode, SyncRunStatus};

    use super::*;
    use crate::ingest::{IngestClient, IngestOutcome};

    /// An ingest client that always succeeds immediately, recording a sync
    /// run summary on the same in-memory repository the engine reads
    /// freshness from — standing in for the external ingest layer the
    /// engine only ever consumes through the [`IngestClient`] trait.
    struct StubIngestClient {
        repo: Arc<InMemoryRepository>,
    }

    #[async_trait]
    impl IngestClient for StubIngestClient {
        async fn sync_followers(&self, target_user_id: UserId, mode: SyncMode) -> IngestOutcome {
            let completed_at = Utc::now();
            self.repo
                .seed_followers_sync_run(
                    target_user_id,
                    IngestSyncRunSummary {
                        status: SyncRunStatus::Success,
                        sync_mode: Some(mode),
                        completed_at: Some(completed_at),
                    },
                )
                .await;
            IngestOutcome::Completed {
                sync_run_id: Uuid::new_v4(),
                completed_at,
            }
        }

        async fn sync_followings(&self, target_user_id: UserId, mode: SyncMode) -> IngestOutcome {
            let completed_at = Utc::now();
            self.repo
                .seed_followings_sync_run(
                    target_user_id,
                    IngestSyncRunSummary {
                        status: SyncRunStatus::Success,
                        sync_mode: Some(mode),
                        completed_at: Some(completed_at),
                    },
                )
                .await;
            IngestOutcome::Completed {
                sync_run_id: Uuid::new_v4(),
                completed_at,
            }
        }

        async fn sync_posts(&self, target_user_ids: &[UserId], _max_query_length: usize) -> IngestOutcome {
            let completed_at = Utc::now();
            for target in target_user_ids {
                self.repo
                    .seed_posts_sync_run(
                        *target,
                        IngestSyncRunSummary {
                            status: SyncRunStatus::Success,
                            sync_mode: None,
                            completed_at: Some(completed_at),
                        },
                    )
                    .await;
            }
            IngestOutcome::Completed {
                sync_run_id: Uuid::new_v4(),
                completed_at,
            }
        }
    }

    fn test_engine(repo: Arc<InMemoryRepository>, lock_timeout_ms: u64) -> AssetEngine {
        let registry = Arc::new(build_registry().expect("registry is acyclic"));
        let ingest: Arc<dyn IngestClient> = Arc::new(StubIngestClient { repo: repo.clone() });
        let config = EngineConfig {
            lock_timeout_ms,
            ..EngineConfig::default()
        };
        AssetEngine::new(repo, registry, ingest, config)
    }

    fn specified_users_params(stable_key: &str) -> AssetParams {
        AssetParams::SegmentSpecifiedUsers {
            stable_key: stable_key.to_string(),
            fanout_source_params_hash: None,
        }
    }

    /// Scenario 1: a `segment_specified_users` instance toggles as its
    /// operator-supplied inputs change, with correct `is_first_appearance`
    /// and a monotone `output_revision`.
    #[tokio::test]
    async fn specified_users_toggle_produces_enter_exit_events_and_advances_revision() {
        let repo = Arc::new(InMemoryRepository::new());
        let engine = test_engine(repo.clone(), 10_000);

        let params = specified_users_params("toggle-scenario");
        let params_row = repo.get_or_create_asset_params(&params).await.unwrap();
        let instance = repo.get_or_create_asset_instance(params_row.id).await.unwrap();
        repo.set_specified_user_ids(instance.id, &[UserId(101), UserId(102)])
            .await
            .unwrap();

        let outcome1 = engine
            .materialize_instance_by_id(instance.id, MaterializeOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome1.status, OutcomeStatus::Success);
        assert_eq!(outcome1.output_revision, Some(1));
        let snapshot1 = repo.list_segment_membership_snapshot(instance.id).await.unwrap();
        assert_eq!(snapshot1, [UserId(101), UserId(102)].into_iter().collect());

        repo.set_specified_user_ids(instance.id, &[UserId(102), UserId(103)])
            .await
            .unwrap();
        let outcome2 = engine
            .materialize_instance_by_id(instance.id, MaterializeOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome2.status, OutcomeStatus::Success);
        assert_eq!(outcome2.output_revision, Some(2));
        let snapshot2 = repo.list_segment_membership_snapshot(instance.id).await.unwrap();
        assert_eq!(snapshot2, [UserId(102), UserId(103)].into_iter().collect());

        let refetched = repo.get_asset_instance_by_id(instance.id).await.unwrap().unwrap();
        assert_eq!(refetched.current_membership_materialization_id, outcome2.materialization_id);

        // Re-running with unchanged inputs is a no-op (skip), pointer unchanged.
        let outcome3 = engine
            .materialize_instance_by_id(instance.id, MaterializeOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome3.status, OutcomeStatus::Skipped);
        assert_eq!(outcome3.materialization_id, outcome2.materialization_id);
        assert_eq!(outcome3.output_revision, Some(2));
    }

    /// Scenario 2: rewinding membership as-of earlier successful
    /// materializations reproduces their snapshot at the time, regardless of
    /// later toggles.
    #[tokio::test]
    async fn membership_as_of_rewinds_through_multiple_toggles() {
        let repo = Arc::new(InMemoryRepository::new());
        let engine = test_engine(repo.clone(), 10_000);

        let params = specified_users_params("as-of-scenario");
        let params_row = repo.get_or_create_asset_params(&params).await.unwrap();
        let instance = repo.get_or_create_asset_instance(params_row.id).await.unwrap();

        repo.set_specified_user_ids(instance.id, &[UserId(101), UserId(102)])
            .await
            .unwrap();
        let m1 = engine
            .materialize_instance_by_id(instance.id, MaterializeOptions::default())
            .await
            .unwrap();

        repo.set_specified_user_ids(instance.id, &[UserId(102), UserId(103)])
            .await
            .unwrap();
        let m2 = engine
            .materialize_instance_by_id(instance.id, MaterializeOptions::default())
            .await
            .unwrap();

        repo.set_specified_user_ids(instance.id, &[UserId(101), UserId(103)])
            .await
            .unwrap();
        let m3 = engine
            .materialize_instance_by_id(instance.id, MaterializeOptions::default())
            .await
            .unwrap();

        let as_of_m1 = repo
            .get_segment_membership_as_of(instance.id, m1.materialization_id.unwrap())
            .await
            .unwrap();
        assert_eq!(as_of_m1, [UserId(101), UserId(102)].into_iter().collect());

        let as_of_m2 = repo
            .get_segment_membership_as_of(instance.id, m2.materialization_id.unwrap())
            .await
            .unwrap();
        assert_eq!(as_of_m2, [UserId(102), UserId(103)].into_iter().collect());

        let as_of_m3 = repo
            .get_segment_membership_as_of(instance.id, m3.materialization_id.unwrap())
            .await
            .unwrap();
        let current = repo.list_segment_membership_snapshot(instance.id).await.unwrap();
        assert_eq!(as_of_m3, current);
        assert_eq!(as_of_m3, [UserId(101), UserId(103)].into_iter().collect());
    }

    /// Scenario 3: a lease already held by another session causes
    /// `materialize_instance_by_id` to fail with no side effects, rather
    /// than blocking forever or mutating state.
    #[tokio::test]
    async fn lock_timeout_produces_error_outcome_with_no_side_effects() {
        let repo = Arc::new(InMemoryRepository::new());
        let engine = test_engine(repo.clone(), 50);

        let params = specified_users_params("lock-timeout-scenario");
        let params_row = repo.get_or_create_asset_params(&params).await.unwrap();
        let instance = repo.get_or_create_asset_instance(params_row.id).await.unwrap();
        repo.set_specified_user_ids(instance.id, &[UserId(1)]).await.unwrap();

        let lease_key = format!("instance:{}", instance.id);
        assert!(repo.acquire_advisory_lock(&lease_key, 0).await.unwrap());

        let outcome = engine
            .materialize_instance_by_id(instance.id, MaterializeOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert!(outcome.materialization_id.is_none());

        let snapshot = repo.list_segment_membership_snapshot(instance.id).await.unwrap();
        assert!(snapshot.is_empty(), "a lock timeout must not write a snapshot");
    }

    /// Scenario 5: an instance whose pointer was lost (but whose event
    /// history survives) gets its snapshot rebuilt in-line with the next
    /// materialization that actually needs to run.
    #[tokio::test]
    async fn checkpoint_repair_rebuilds_snapshot_before_materializing() {
        let repo = Arc::new(InMemoryRepository::new());
        let engine = test_engine(repo.clone(), 10_000);

        let params = specified_users_params("checkpoint-repair-scenario");
        let params_row = repo.get_or_create_asset_params(&params).await.unwrap();
        let instance = repo.get_or_create_asset_instance(params_row.id).await.unwrap();
        repo.set_specified_user_ids(instance.id, &[UserId(201)]).await.unwrap();

        // Simulate a prior successful run whose pointer never got set —
        // e.g. a crash between the event insert and the pointer update.
        let prior = repo
            .create_asset_materialization(segment_store::NewMaterialization {
                asset_instance_id: instance.id,
                asset_slug: segment_domain::AssetSlug::SegmentSpecifiedUsers,
                inputs_hash: "stale-hash".to_string(),
                inputs_hash_version: 1,
                dependency_revisions_hash: "stale-dep-hash".to_string(),
                dependency_revisions_hash_version: 1,
                trigger_reason: "seed".to_string(),
            })
            .await
            .unwrap();
        repo.update_asset_materialization(
            prior.id,
            segment_store::MaterializationCompletion::Success { output_revision: 1 },
        )
        .await
        .unwrap();
        repo.insert_segment_events(&[segment_store::SegmentEvent {
            materialization_id: prior.id,
            user_id: UserId(201),
            event_type: segment_store::EventType::Enter,
            is_first_appearance: Some(true),
        }])
        .await
        .unwrap();
        assert!(repo
            .get_asset_instance_by_id(instance.id)
            .await
            .unwrap()
            .unwrap()
            .current_membership_materialization_id
            .is_none());

        // Change the inputs so the skip decision can't short-circuit before
        // the repair step runs.
        repo.set_specified_user_ids(instance.id, &[UserId(201), UserId(202)])
            .await
            .unwrap();

        let outcome = engine
            .materialize_instance_by_id(instance.id, MaterializeOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Success);
        // Repaired snapshot {201} plus the new member {202} entering: one
        // revision bump over the repaired baseline.
        assert_eq!(outcome.output_revision, Some(2));

        let snapshot = repo.list_segment_membership_snapshot(instance.id).await.unwrap();
        assert_eq!(snapshot, [UserId(201), UserId(202)].into_iter().collect());
    }

    /// Scenario 6: a `scoped_by_source` fanout root mints one target
    /// instance per source member, each scoped to the source's params hash.
    #[tokio::test]
    async fn scoped_by_source_fanout_mints_one_target_per_member() {
        let repo = Arc::new(InMemoryRepository::new());
        let engine = test_engine(repo.clone(), 10_000);

        let source_params = specified_users_params("fanout-source");
        let source_params_row = repo.get_or_create_asset_params(&source_params).await.unwrap();
        let source_instance = repo.get_or_create_asset_instance(source_params_row.id).await.unwrap();
        repo.set_specified_user_ids(source_instance.id, &[UserId(1001), UserId(1002)])
            .await
            .unwrap();

        repo.enable_asset_instance_fanout_root(
            source_instance.id,
            segment_domain::AssetSlug::PostCorpusForSegment,
            FanoutMode::ScopedBySource,
        )
        .await
        .unwrap();

        let signal = CancellationSignal::new();
        let report = engine.tick(&signal).await.unwrap();

        assert_eq!(report.fanout_target_outcomes.len(), 2);
        for target_outcome in &report.fanout_target_outcomes {
            assert_eq!(target_outcome.status, OutcomeStatus::Success);
            let target_params = repo
                .get_asset_params_by_instance_id(target_outcome.instance_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                target_params.params.slug(),
                segment_domain::AssetSlug::PostCorpusForSegment
            );
            match &target_params.params {
                AssetParams::PostCorpusForSegment {
                    source_segment_params,
                    ..
                } => {
                    assert_eq!(source_segment_params.slug(), segment_domain::AssetSlug::SegmentSpecifiedUsers);
                }
                other => panic!("expected post_corpus_for_segment params, got {other:?}"),
            }
            assert_eq!(
                target_params.params.fanout_source_params_hash(),
                Some(source_params_row.params_hash.as_str())
            );
        }

        // A second, global_per_item source fans the same members out to
        // targets with no fanout_source_params_hash, distinguishing the two
        // modes on the same asset slug. One of its members (1001) overlaps
        // with the scoped source above, so the global_per_item target for
        // 1001 lands on the same nested single-member segment either way —
        // scoping by fanout_source_params_hash is what keeps the two modes'
        // post corpora distinct.
        let other_source_params = specified_users_params("fanout-source-2");
        let other_source_row = repo.get_or_create_asset_params(&other_source_params).await.unwrap();
        let other_source_instance = repo.get_or_create_asset_instance(other_source_row.id).await.unwrap();
        repo.set_specified_user_ids(other_source_instance.id, &[UserId(1001)])
            .await
            .unwrap();
        repo.enable_asset_instance_fanout_root(
            other_source_instance.id,
            segment_domain::AssetSlug::PostCorpusForSegment,
            FanoutMode::GlobalPerItem,
        )
        .await
        .unwrap();

        let report2 = engine.tick(&signal).await.unwrap();
        let global_outcome = report2
            .fanout_target_outcomes
            .iter()
            .find(|o| o.status == OutcomeStatus::Success)
            .expect("global_per_item fanout root should mint and materialize one target");
        let global_params = repo
            .get_asset_params_by_instance_id(global_outcome.instance_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(global_params.params.slug(), segment_domain::AssetSlug::PostCorpusForSegment);
        assert_eq!(global_params.params.fanout_source_params_hash(), None);
    }
}
