//! Scoped advisory leases with timeout.
//!
//! Modeled on `nclav-store::postgres_store::lock_tf_state` / `unlock_tf_state`'s
//! `tf_locks` table: an atomic `INSERT ... ON CONFLICT DO NOTHING` acquire and
//! an explicit release, here wrapped in an RAII guard so every acquisition is
//! paired with release on all exit paths — including early return or error.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::repository::Repository;

/// Cooperative named lock manager bound to a [`Repository`]'s advisory lock
/// primitive. Keys are plain strings (e.g. `instance:<id>`,
/// `ingest:followers:<userId>`, `ingest:posts:<sorted-csv>`); at most one
/// holder of a given key exists at a time across the whole system.
pub struct LeaseManager {
    repo: Arc<dyn Repository>,
}

impl LeaseManager {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        LeaseManager { repo }
    }

    /// Acquire `key`, run `action`, then release — guaranteed on every exit
    /// path, including `action` returning an error. Returns `Ok(None)` if
    /// the lease could not be acquired within `timeout_ms` (no side effects
    /// occurred; `action` never ran).
    pub async fn with_lease<F, Fut, T>(
        &self,
        key: &str,
        timeout_ms: u64,
        action: F,
    ) -> Result<Option<T>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let Some(guard) = self.acquire(key, timeout_ms).await? else {
            debug!(key, timeout_ms, "lease not acquired within timeout");
            return Ok(None);
        };
        let result = action().await;
        drop(guard); // release runs here regardless of `result`
        result.map(Some)
    }

    /// Acquire `key`, bounded by `timeout_ms`. Returns `None` on timeout
    /// without mutating any state. Delegates the actual blocking-with-
    /// timeout semantics to the repository's advisory lock primitive (the
    /// database's cooperative lock bound to a session/transaction); this
    /// manager only adds the guaranteed-release guard on top.
    pub async fn acquire(&self, key: &str, timeout_ms: u64) -> Result<Option<LeaseGuard>, StoreError> {
        if self.repo.acquire_advisory_lock(key, timeout_ms).await? {
            Ok(Some(LeaseGuard {
                repo: self.repo.clone(),
                key: key.to_string(),
            }))
        } else {
            Ok(None)
        }
    }
}

/// RAII guard releasing its lease on drop. Release is an async DB call, so
/// drop spawns it onto the runtime rather than blocking — this guarantees
/// release fires on every exit path (normal return, early return, or error
/// unwind) without requiring callers to remember an explicit release step.
pub struct LeaseGuard {
    repo: Arc<dyn Repository>,
    key: String,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        let repo = self.repo.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            if let Err(err) = repo.release_advisory_lock(&key).await {
                warn!(key, error = %err, "lease release failed on drop");
            }
        });
    }
}
