//! The narrow ingest capability the engine consumes. No transport lives
//! here — the host supplies a concrete [`IngestClient`] the same way `nclav_reconciler`
//! consumes `nclav_driver::Driver` as a trait without knowing about any
//! particular cloud's wire format.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use segment_domain::UserId;
use segment_store::SyncMode;
use uuid::Uuid;

/// Result of invoking one ingest sync call.
#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Completed {
        sync_run_id: Uuid,
        completed_at: DateTime<Utc>,
    },
    RateLimited {
        retry_after_ms: Option<u64>,
    },
    Failed {
        message: String,
    },
}

/// Upstream graph/posts sync, consumed as a capability. Implementations
/// surface rate-limit and terminal errors through [`IngestOutcome`] rather
/// than panicking or retrying internally — retry policy belongs to the
/// engine's per-tick re-evaluation, not the client.
#[async_trait]
pub trait IngestClient: Send + Sync {
    async fn sync_followers(&self, target_user_id: UserId, mode: SyncMode) -> IngestOutcome;

    async fn sync_followings(&self, target_user_id: UserId, mode: SyncMode) -> IngestOutcome;

    /// Posts requirements use a single mode and are coalesced across targets
    /// by the caller before this is invoked — `target_user_ids` is already
    /// deduplicated and sorted.
    async fn sync_posts(&self, target_user_ids: &[UserId], max_query_length: usize) -> IngestOutcome;
}
