//! Pure-time freshness and sync-mode policy. Kept as plain
//! functions over `DateTime<Utc>` with no I/O, so a reviewer does not have
//! to separate the one real clock call (`Utc::now()`) from the logic that
//! consumes it.

use chrono::{DateTime, Utc};

use segment_store::SyncMode;

/// A requirement is satisfied iff a successful run exists and either the
/// requirement tolerates any age (`freshness_ms = None`) or the run
/// completed within `freshness_ms` of `now`.
pub fn is_satisfied(latest_success: Option<DateTime<Utc>>, freshness_ms: Option<u64>, now: DateTime<Utc>) -> bool {
    let Some(completed_at) = latest_success else {
        return false;
    };
    match freshness_ms {
        None => true,
        Some(window_ms) => {
            let age_ms = (now - completed_at).num_milliseconds();
            age_ms >= 0 && age_ms <= window_ms as i64
        }
    }
}

/// Mode selection for `followers`/`followings` ingest requirements: if any
/// prior successful full-refresh run exists, a fresh sync can go
/// incremental; otherwise it must be a full refresh. Posts requirements
/// never call this — they use a single mode.
pub fn select_sync_mode(any_prior_full_refresh_success: bool) -> SyncMode {
    if any_prior_full_refresh_success {
        SyncMode::Incremental
    } else {
        SyncMode::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn unsatisfied_when_no_success_exists() {
        assert!(!is_satisfied(None, Some(1_000), Utc::now()));
    }

    #[test]
    fn satisfied_when_freshness_is_any() {
        let old = Utc::now() - Duration::days(365);
        assert!(is_satisfied(Some(old), None, Utc::now()));
    }

    #[test]
    fn satisfied_within_window() {
        let now = Utc::now();
        let completed = now - Duration::hours(1);
        assert!(is_satisfied(Some(completed), Some(Duration::hours(24).num_milliseconds() as u64), now));
    }

    #[test]
    fn unsatisfied_outside_window() {
        let now = Utc::now();
        let completed = now - Duration::hours(25);
        assert!(!is_satisfied(Some(completed), Some(Duration::hours(24).num_milliseconds() as u64), now));
    }

    #[test]
    fn mode_selection_prefers_incremental_after_a_full_refresh() {
        assert_eq!(select_sync_mode(true), SyncMode::Incremental);
        assert_eq!(select_sync_mode(false), SyncMode::Full);
    }
}
