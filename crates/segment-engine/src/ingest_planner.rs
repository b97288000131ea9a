//! Ingest prerequisite sub-planner: dedupe requirements, select a
//! sync mode for followers/followings, coalesce posts requirements into one
//! batched call, and invoke each under a per-target lease.

use std::collections::BTreeMap;
use std::sync::Arc;

use segment_domain::{AssetMaterializationId, UserId};
use segment_registry::{IngestKind, IngestRequirement};
use segment_store::{LeaseManager, Repository, SyncMode, SyncRunStatus};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::freshness::{is_satisfied, select_sync_mode};
use crate::ingest::{IngestClient, IngestOutcome};

/// Why the sub-planner could not guarantee every requirement was met, so the
/// caller can pick the matching [`segment_domain::Decision`] and abort.
#[derive(Debug)]
pub enum IngestPrerequisiteFailure {
    LockTimeout { key: String },
    RateLimited { kind: IngestKind, target: UserId },
    Failed { kind: IngestKind, target: UserId, message: String },
}

pub struct IngestPlanner {
    pub repo: Arc<dyn Repository>,
    pub ingest: Arc<dyn IngestClient>,
    pub leases: LeaseManager,
    pub config: EngineConfig,
}

impl IngestPlanner {
    /// Deduplicate `requirements` by `(kind, target)`, satisfy each, and
    /// return on the first unmet requirement. Posts requirements are
    /// coalesced into a single lease-guarded call over their full target set.
    pub async fn satisfy(
        &self,
        requirements: Vec<IngestRequirement>,
    ) -> Result<Option<IngestPrerequisiteFailure>, EngineError> {
        let mut deduped: BTreeMap<(u8, UserId), IngestRequirement> = BTreeMap::new();
        for req in requirements {
            let key = (kind_rank(req.ingest_kind), req.target_user_id);
            deduped
                .entry(key)
                .and_modify(|existing| {
                    existing
                        .requested_by_materialization_ids
                        .extend(req.requested_by_materialization_ids.iter().copied());
                    existing.freshness_ms = narrower(existing.freshness_ms, req.freshness_ms);
                })
                .or_insert(req);
        }

        let mut followers = Vec::new();
        let mut followings = Vec::new();
        let mut posts = Vec::new();
        for req in deduped.into_values() {
            match req.ingest_kind {
                IngestKind::Followers => followers.push(req),
                IngestKind::Followings => followings.push(req),
                IngestKind::Posts => posts.push(req),
            }
        }

        for req in followers {
            if let Some(failure) = self.satisfy_graph_requirement(req, IngestKind::Followers).await? {
                return Ok(Some(failure));
            }
        }
        for req in followings {
            if let Some(failure) = self.satisfy_graph_requirement(req, IngestKind::Followings).await? {
                return Ok(Some(failure));
            }
        }
        if !posts.is_empty() {
            if let Some(failure) = self.satisfy_posts_requirements(posts).await? {
                return Ok(Some(failure));
            }
        }
        Ok(None)
    }

    async fn satisfy_graph_requirement(
        &self,
        req: IngestRequirement,
        kind: IngestKind,
    ) -> Result<Option<IngestPrerequisiteFailure>, EngineError> {
        let target = req.target_user_id;
        let now = chrono::Utc::now();

        let (latest_success, latest_full_success) = match kind {
            IngestKind::Followers => (
                self.repo
                    .get_latest_followers_sync_run(target, Some(SyncRunStatus::Success), None)
                    .await?,
                self.repo
                    .get_latest_followers_sync_run(target, Some(SyncRunStatus::Success), Some(SyncMode::Full))
                    .await?,
            ),
            IngestKind::Followings => (
                self.repo
                    .get_latest_followings_sync_run(target, Some(SyncRunStatus::Success), None)
                    .await?,
                self.repo
                    .get_latest_followings_sync_run(target, Some(SyncRunStatus::Success), Some(SyncMode::Full))
                    .await?,
            ),
            IngestKind::Posts => unreachable!("posts requirements are handled by satisfy_posts_requirements"),
        };

        if is_satisfied(latest_success.and_then(|s| s.completed_at), req.freshness_ms, now) {
            debug!(kind = %kind, target = %target, "ingest requirement already fresh, skipping sync");
            return Ok(None);
        }

        let mode = select_sync_mode(latest_full_success.is_some());
        let key = format!("ingest:{kind}:{target}");
        let Some(outcome) = self
            .leases
            .with_lease(&key, self.config.lock_timeout_ms, || async {
                Ok(match kind {
                    IngestKind::Followers => self.ingest.sync_followers(target, mode).await,
                    IngestKind::Followings => self.ingest.sync_followings(target, mode).await,
                    IngestKind::Posts => unreachable!(),
                })
            })
            .await?
        else {
            return Ok(Some(IngestPrerequisiteFailure::LockTimeout { key }));
        };

        match outcome {
            IngestOutcome::Completed { .. } => Ok(None),
            IngestOutcome::RateLimited { .. } => {
                warn!(kind = %kind, target = %target, "ingest rate limited");
                Ok(Some(IngestPrerequisiteFailure::RateLimited { kind, target }))
            }
            IngestOutcome::Failed { message } => {
                warn!(kind = %kind, target = %target, error = %message, "ingest failed");
                Ok(Some(IngestPrerequisiteFailure::Failed { kind, target, message }))
            }
        }
    }

    async fn satisfy_posts_requirements(
        &self,
        reqs: Vec<IngestRequirement>,
    ) -> Result<Option<IngestPrerequisiteFailure>, EngineError> {
        let now = chrono::Utc::now();
        let mut unsatisfied: Vec<UserId> = Vec::new();
        let mut requested_by: Vec<AssetMaterializationId> = Vec::new();
        let mut all_targets: Vec<UserId> = Vec::new();
        for req in &reqs {
            all_targets.push(req.target_user_id);
            requested_by.extend(req.requested_by_materialization_ids.iter().copied());
            let latest = self
                .repo
                .get_latest_posts_sync_run(req.target_user_id, Some(SyncRunStatus::Success))
                .await?;
            if !is_satisfied(latest.and_then(|s| s.completed_at), req.freshness_ms, now) {
                unsatisfied.push(req.target_user_id);
            }
        }
        if unsatisfied.is_empty() {
            debug!("all posts ingest requirements already fresh, skipping sync");
            return Ok(None);
        }
        unsatisfied.sort();
        unsatisfied.dedup();
        all_targets.sort();
        all_targets.dedup();

        let key = format!(
            "ingest:posts:{}",
            all_targets.iter().map(UserId::to_string).collect::<Vec<_>>().join(",")
        );
        let max_query_length = self.config.posts_max_query_length;
        let Some(outcome) = self
            .leases
            .with_lease(&key, self.config.lock_timeout_ms, || async {
                Ok(self.ingest.sync_posts(&unsatisfied, max_query_length).await)
            })
            .await?
        else {
            return Ok(Some(IngestPrerequisiteFailure::LockTimeout { key }));
        };

        match outcome {
            IngestOutcome::Completed { sync_run_id, .. } => {
                if !requested_by.is_empty() {
                    self.repo
                        .link_posts_sync_run_to_materializations(sync_run_id, &requested_by)
                        .await?;
                }
                Ok(None)
            }
            IngestOutcome::RateLimited { .. } => {
                warn!(targets = unsatisfied.len(), "posts ingest rate limited");
                Ok(Some(IngestPrerequisiteFailure::RateLimited {
                    kind: IngestKind::Posts,
                    target: unsatisfied[0],
                }))
            }
            IngestOutcome::Failed { message } => {
                warn!(targets = unsatisfied.len(), error = %message, "posts ingest failed");
                Ok(Some(IngestPrerequisiteFailure::Failed {
                    kind: IngestKind::Posts,
                    target: unsatisfied[0],
                    message,
                }))
            }
        }
    }
}

fn kind_rank(kind: IngestKind) -> u8 {
    match kind {
        IngestKind::Followers => 0,
        IngestKind::Followings => 1,
        IngestKind::Posts => 2,
    }
}

fn narrower(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (None, x) | (x, None) => x,
        (Some(a), Some(b)) => Some(a.min(b)),
    }
}
