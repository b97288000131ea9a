//! Configuration recognized by the engine. A plain struct built
//! by the host — config *loading* (files, env vars) is the excluded
//! collaborator, matching how `nclav_reconciler::ReconcileRequest` is built
//! by the CLI layer rather than read from disk by the reconciler itself.

/// Upper bound for all lease acquisitions, in milliseconds, unless a caller
/// overrides it via [`MaterializeOptions`](crate::outcome::MaterializeOptions).
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound for all lease acquisitions (instance and ingest leases).
    pub lock_timeout_ms: u64,
    /// Max characters in the composed posts search query the posts ingest
    /// prerequisite builds when coalescing multiple target users.
    pub posts_max_query_length: usize,
    /// Upper bound for persisted upstream response bodies on ingest failures.
    pub http_snapshot_max_bytes: usize,
    /// Default freshness window applied to `followers` ingest requirements
    /// when an asset definition does not specify one more precisely.
    pub default_followers_freshness_ms: Option<u64>,
    /// Default freshness window applied to `followings` ingest requirements.
    pub default_followings_freshness_ms: Option<u64>,
    /// Default freshness window applied to `posts` ingest requirements.
    pub default_posts_freshness_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            posts_max_query_length: 512,
            http_snapshot_max_bytes: 64 * 1024,
            default_followers_freshness_ms: None,
            default_followings_freshness_ms: None,
            default_posts_freshness_ms: None,
        }
    }
}
