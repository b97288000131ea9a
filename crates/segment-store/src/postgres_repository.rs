//! [`Repository`] backed by PostgreSQL, grounded on
//! `nclav-store::postgres_store::PostgresStore`: one connection pool, one
//! idempotent migration run at connect time, JSONB for structured payloads.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use segment_domain::{
    AssetInstanceId, AssetMaterializationId, AssetParams, AssetParamsId, AssetSlug, Decision, PostId, UserId,
    parse_asset_params,
};

use crate::error::StoreError;
use crate::model::{
    AssetInstance, AssetInstanceFanoutRoot, AssetInstanceRoot, AssetMaterialization, AssetParamsRow,
    DecisionLogEntry, EventType, FanoutMode, IngestSyncRunSummary, MaterializationErrorPayload,
    MaterializationStatus, PostCorpusEvent, SegmentEvent, SyncMode, SyncRunStatus,
};
use crate::repository::{MaterializationCompletion, MaterializationTransaction, NewMaterialization, Repository};

const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS asset_params (
    id                  BIGSERIAL PRIMARY KEY,
    asset_slug          TEXT NOT NULL,
    params_hash         TEXT NOT NULL,
    params_hash_version INT NOT NULL,
    params              JSONB NOT NULL,
    UNIQUE (asset_slug, params_hash_version, params_hash)
);

CREATE TABLE IF NOT EXISTS asset_instances (
    id                                   BIGSERIAL PRIMARY KEY,
    params_id                            BIGINT NOT NULL REFERENCES asset_params (id),
    asset_slug                           TEXT NOT NULL,
    params_hash                          TEXT NOT NULL,
    params_hash_version                  INT NOT NULL,
    current_membership_materialization_id BIGINT,
    UNIQUE (params_id)
);

CREATE TABLE IF NOT EXISTS asset_instance_roots (
    instance_id BIGINT PRIMARY KEY REFERENCES asset_instances (id),
    enabled_at  TIMESTAMPTZ NOT NULL,
    disabled_at TIMESTAMPTZ
);

CREATE TABLE IF NOT EXISTS asset_instance_fanout_roots (
    source_instance_id BIGINT NOT NULL REFERENCES asset_instances (id),
    target_asset_slug  TEXT NOT NULL,
    fanout_mode        TEXT NOT NULL,
    enabled_at         TIMESTAMPTZ NOT NULL,
    disabled_at        TIMESTAMPTZ,
    PRIMARY KEY (source_instance_id, target_asset_slug)
);

CREATE TABLE IF NOT EXISTS asset_materializations (
    id                                 BIGSERIAL PRIMARY KEY,
    asset_instance_id                  BIGINT NOT NULL REFERENCES asset_instances (id),
    asset_slug                        TEXT NOT NULL,
    inputs_hash                        TEXT NOT NULL,
    inputs_hash_version                INT NOT NULL,
    dependency_revisions_hash          TEXT NOT NULL,
    dependency_revisions_hash_version   INT NOT NULL,
    status                             TEXT NOT NULL,
    started_at                         TIMESTAMPTZ NOT NULL,
    completed_at                       TIMESTAMPTZ,
    output_revision                    BIGINT NOT NULL DEFAULT 0,
    error                              JSONB,
    trigger_reason                     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_asset_materializations_instance
    ON asset_materializations (asset_instance_id, completed_at, id);

CREATE TABLE IF NOT EXISTS materialization_dependencies (
    materialization_id            BIGINT NOT NULL REFERENCES asset_materializations (id),
    dependency_materialization_id BIGINT NOT NULL REFERENCES asset_materializations (id),
    PRIMARY KEY (materialization_id, dependency_materialization_id)
);

CREATE TABLE IF NOT EXISTS materialization_requests (
    materialization_id              BIGINT NOT NULL REFERENCES asset_materializations (id),
    requested_by_materialization_id BIGINT NOT NULL REFERENCES asset_materializations (id),
    PRIMARY KEY (materialization_id, requested_by_materialization_id)
);

CREATE TABLE IF NOT EXISTS segment_events (
    materialization_id  BIGINT NOT NULL REFERENCES asset_materializations (id),
    user_id             BIGINT NOT NULL,
    event_type          TEXT NOT NULL,
    is_first_appearance BOOLEAN,
    PRIMARY KEY (materialization_id, user_id)
);

CREATE TABLE IF NOT EXISTS post_corpus_events (
    materialization_id  BIGINT NOT NULL REFERENCES asset_materializations (id),
    post_id             BIGINT NOT NULL,
    event_type          TEXT NOT NULL,
    is_first_appearance BOOLEAN,
    PRIMARY KEY (materialization_id, post_id)
);

CREATE TABLE IF NOT EXISTS segment_membership_snapshot (
    instance_id         BIGINT NOT NULL REFERENCES asset_instances (id),
    user_id             BIGINT NOT NULL,
    materialization_id  BIGINT NOT NULL REFERENCES asset_materializations (id),
    PRIMARY KEY (instance_id, user_id)
);

CREATE TABLE IF NOT EXISTS post_corpus_membership_snapshot (
    instance_id         BIGINT NOT NULL REFERENCES asset_instances (id),
    post_id             BIGINT NOT NULL,
    materialization_id  BIGINT NOT NULL REFERENCES asset_materializations (id),
    PRIMARY KEY (instance_id, post_id)
);

CREATE TABLE IF NOT EXISTS advisory_locks (
    key        TEXT PRIMARY KEY,
    locked_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS followers_sync_runs (
    target_user_id BIGINT NOT NULL,
    status         TEXT NOT NULL,
    sync_mode      TEXT,
    completed_at   TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_followers_sync_runs_target
    ON followers_sync_runs (target_user_id, completed_at DESC);

CREATE TABLE IF NOT EXISTS followings_sync_runs (
    target_user_id BIGINT NOT NULL,
    status         TEXT NOT NULL,
    sync_mode      TEXT,
    completed_at   TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_followings_sync_runs_target
    ON followings_sync_runs (target_user_id, completed_at DESC);

CREATE TABLE IF NOT EXISTS posts_sync_runs (
    sync_run_id    UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    target_user_id BIGINT NOT NULL,
    status         TEXT NOT NULL,
    completed_at   TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS idx_posts_sync_runs_target
    ON posts_sync_runs (target_user_id, completed_at DESC);

CREATE TABLE IF NOT EXISTS posts_sync_run_materializations (
    sync_run_id        UUID NOT NULL REFERENCES posts_sync_runs (sync_run_id),
    materialization_id BIGINT NOT NULL REFERENCES asset_materializations (id),
    PRIMARY KEY (sync_run_id, materialization_id)
);

CREATE TABLE IF NOT EXISTS decision_log (
    seq             BIGSERIAL PRIMARY KEY,
    planner_run_id  UUID NOT NULL,
    job_id          UUID NOT NULL,
    target_id       BIGINT,
    target_params   TEXT,
    decision        TEXT NOT NULL,
    reason          TEXT NOT NULL,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS idx_decision_log_planner_run
    ON decision_log (planner_run_id);

CREATE TABLE IF NOT EXISTS segment_specified_users (
    instance_id BIGINT NOT NULL REFERENCES asset_instances (id),
    user_id     BIGINT NOT NULL,
    PRIMARY KEY (instance_id, user_id)
);

CREATE TABLE IF NOT EXISTS graph_followers (
    subject_user_id  BIGINT NOT NULL,
    follower_user_id BIGINT NOT NULL,
    PRIMARY KEY (subject_user_id, follower_user_id)
);

CREATE TABLE IF NOT EXISTS graph_followed (
    subject_user_id BIGINT NOT NULL,
    followed_user_id BIGINT NOT NULL,
    PRIMARY KEY (subject_user_id, followed_user_id)
);

CREATE TABLE IF NOT EXISTS authored_posts (
    user_id BIGINT NOT NULL,
    post_id BIGINT NOT NULL,
    PRIMARY KEY (user_id, post_id)
);
"#;

/// Repository backed by a PostgreSQL connection pool.
///
/// All tables are created automatically on first connect via
/// [`PostgresRepository::connect`]. Structured payloads (`AssetParams`,
/// materialization errors) are stored as JSONB; every other column is a
/// plain scalar so filtering and ordering stay in SQL.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| StoreError::Internal(format!("postgres connect: {e}")))?;
        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(MIGRATIONS)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(format!("migration: {e}")))?;
        Ok(())
    }
}

fn to_json<T: serde::Serialize>(v: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(v).map_err(StoreError::Serialization)
}

fn row_to_params(raw: serde_json::Value, slug: &str) -> Result<AssetParams, StoreError> {
    let slug = AssetSlug::parse(slug).map_err(|e| StoreError::Internal(e.to_string()))?;
    parse_asset_params(slug, &raw).map_err(|e| StoreError::Internal(e.to_string()))
}

fn status_to_str(status: MaterializationStatus) -> &'static str {
    match status {
        MaterializationStatus::InProgress => "in_progress",
        MaterializationStatus::Success => "success",
        MaterializationStatus::Error => "error",
    }
}

fn str_to_status(s: &str) -> MaterializationStatus {
    match s {
        "success" => MaterializationStatus::Success,
        "error" => MaterializationStatus::Error,
        _ => MaterializationStatus::InProgress,
    }
}

fn event_type_to_str(t: EventType) -> &'static str {
    match t {
        EventType::Enter => "enter",
        EventType::Exit => "exit",
    }
}

fn str_to_event_type(s: &str) -> EventType {
    if s == "enter" {
        EventType::Enter
    } else {
        EventType::Exit
    }
}

fn sync_mode_to_str(mode: SyncMode) -> &'static str {
    match mode {
        SyncMode::Full => "full",
        SyncMode::Incremental => "incremental",
    }
}

fn str_to_sync_mode(s: &str) -> SyncMode {
    if s == "full" {
        SyncMode::Full
    } else {
        SyncMode::Incremental
    }
}

fn sync_status_to_str(status: SyncRunStatus) -> &'static str {
    match status {
        SyncRunStatus::Success => "success",
        SyncRunStatus::Error => "error",
    }
}

fn str_to_sync_status(s: &str) -> SyncRunStatus {
    if s == "success" {
        SyncRunStatus::Success
    } else {
        SyncRunStatus::Error
    }
}

fn fanout_mode_to_str(mode: FanoutMode) -> &'static str {
    match mode {
        FanoutMode::GlobalPerItem => "global_per_item",
        FanoutMode::ScopedBySource => "scoped_by_source",
    }
}

fn str_to_fanout_mode(s: &str) -> FanoutMode {
    if s == "scoped_by_source" {
        FanoutMode::ScopedBySource
    } else {
        FanoutMode::GlobalPerItem
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn get_or_create_asset_params(&self, params: &AssetParams) -> Result<AssetParamsRow, StoreError> {
        let (params_hash, params_hash_version) = params.params_hash_v1();
        let slug = params.slug();
        let json = to_json(params)?;

        let row = sqlx::query(
            "INSERT INTO asset_params (asset_slug, params_hash, params_hash_version, params)
             VALUES ($1, $2, $3, $4::jsonb)
             ON CONFLICT (asset_slug, params_hash_version, params_hash) DO UPDATE SET asset_slug = EXCLUDED.asset_slug
             RETURNING id, asset_slug, params_hash, params_hash_version, params",
        )
        .bind(slug.as_str())
        .bind(&params_hash)
        .bind(params_hash_version)
        .bind(&json)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;

        Ok(AssetParamsRow {
            id: AssetParamsId(row.try_get::<i64, _>("id").map_err(|e| StoreError::Internal(e.to_string()))?),
            params: row_to_params(
                row.try_get("params").map_err(|e| StoreError::Internal(e.to_string()))?,
                row.try_get("asset_slug").map_err(|e| StoreError::Internal(e.to_string()))?,
            )?,
            params_hash: row.try_get("params_hash").map_err(|e| StoreError::Internal(e.to_string()))?,
            params_hash_version: row
                .try_get("params_hash_version")
                .map_err(|e| StoreError::Internal(e.to_string()))?,
        })
    }

    async fn get_asset_params_by_id(&self, id: AssetParamsId) -> Result<Option<AssetParamsRow>, StoreError> {
        let row = sqlx::query("SELECT id, asset_slug, params_hash, params_hash_version, params FROM asset_params WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(AssetParamsRow {
            id: AssetParamsId(row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?),
            params: row_to_params(
                row.try_get("params").map_err(|e| StoreError::Internal(e.to_string()))?,
                row.try_get("asset_slug").map_err(|e| StoreError::Internal(e.to_string()))?,
            )?,
            params_hash: row.try_get("params_hash").map_err(|e| StoreError::Internal(e.to_string()))?,
            params_hash_version: row
                .try_get("params_hash_version")
                .map_err(|e| StoreError::Internal(e.to_string()))?,
        }))
    }

    async fn get_asset_params_by_instance_id(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Option<AssetParamsRow>, StoreError> {
        let row = sqlx::query(
            "SELECT p.id, p.asset_slug, p.params_hash, p.params_hash_version, p.params
             FROM asset_params p JOIN asset_instances i ON i.params_id = p.id
             WHERE i.id = $1",
        )
        .bind(instance_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(AssetParamsRow {
            id: AssetParamsId(row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?),
            params: row_to_params(
                row.try_get("params").map_err(|e| StoreError::Internal(e.to_string()))?,
                row.try_get("asset_slug").map_err(|e| StoreError::Internal(e.to_string()))?,
            )?,
            params_hash: row.try_get("params_hash").map_err(|e| StoreError::Internal(e.to_string()))?,
            params_hash_version: row
                .try_get("params_hash_version")
                .map_err(|e| StoreError::Internal(e.to_string()))?,
        }))
    }

    async fn get_asset_params_by_slug_hash(
        &self,
        slug: AssetSlug,
        params_hash_version: i32,
        params_hash: &str,
    ) -> Result<Option<AssetParamsRow>, StoreError> {
        let row = sqlx::query(
            "SELECT id, asset_slug, params_hash, params_hash_version, params FROM asset_params
             WHERE asset_slug = $1 AND params_hash_version = $2 AND params_hash = $3",
        )
        .bind(slug.as_str())
        .bind(params_hash_version)
        .bind(params_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(AssetParamsRow {
            id: AssetParamsId(row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?),
            params: row_to_params(
                row.try_get("params").map_err(|e| StoreError::Internal(e.to_string()))?,
                row.try_get("asset_slug").map_err(|e| StoreError::Internal(e.to_string()))?,
            )?,
            params_hash: row.try_get("params_hash").map_err(|e| StoreError::Internal(e.to_string()))?,
            params_hash_version: row
                .try_get("params_hash_version")
                .map_err(|e| StoreError::Internal(e.to_string()))?,
        }))
    }

    async fn get_or_create_asset_instance(&self, params_id: AssetParamsId) -> Result<AssetInstance, StoreError> {
        let params_row = self
            .get_asset_params_by_id(params_id)
            .await?
            .ok_or_else(|| StoreError::ParamsNotFound(params_id.to_string()))?;

        let row = sqlx::query(
            "INSERT INTO asset_instances (params_id, asset_slug, params_hash, params_hash_version)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (params_id) DO UPDATE SET params_id = EXCLUDED.params_id
             RETURNING id, params_id, asset_slug, params_hash, params_hash_version, current_membership_materialization_id",
        )
        .bind(params_id.0)
        .bind(params_row.params.slug().as_str())
        .bind(&params_row.params_hash)
        .bind(params_row.params_hash_version)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;

        row_to_instance(&row)
    }

    async fn get_asset_instance_by_id(&self, id: AssetInstanceId) -> Result<Option<AssetInstance>, StoreError> {
        let row = sqlx::query(
            "SELECT id, params_id, asset_slug, params_hash, params_hash_version, current_membership_materialization_id
             FROM asset_instances WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        row.as_ref().map(row_to_instance).transpose()
    }

    async fn enable_asset_instance_root(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO asset_instance_roots (instance_id, enabled_at, disabled_at)
             VALUES ($1, NOW(), NULL)
             ON CONFLICT (instance_id) DO UPDATE SET disabled_at = NULL",
        )
        .bind(instance_id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn disable_asset_instance_root(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        sqlx::query("UPDATE asset_instance_roots SET disabled_at = NOW() WHERE instance_id = $1")
            .bind(instance_id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn enable_asset_instance_fanout_root(
        &self,
        source_instance_id: AssetInstanceId,
        target_asset_slug: AssetSlug,
        fanout_mode: FanoutMode,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO asset_instance_fanout_roots
                 (source_instance_id, target_asset_slug, fanout_mode, enabled_at, disabled_at)
             VALUES ($1, $2, $3, NOW(), NULL)
             ON CONFLICT (source_instance_id, target_asset_slug)
             DO UPDATE SET fanout_mode = EXCLUDED.fanout_mode, disabled_at = NULL",
        )
        .bind(source_instance_id.0)
        .bind(target_asset_slug.as_str())
        .bind(fanout_mode_to_str(fanout_mode))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn disable_asset_instance_fanout_root(
        &self,
        source_instance_id: AssetInstanceId,
        target_asset_slug: AssetSlug,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE asset_instance_fanout_roots SET disabled_at = NOW()
             WHERE source_instance_id = $1 AND target_asset_slug = $2",
        )
        .bind(source_instance_id.0)
        .bind(target_asset_slug.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn list_enabled_roots(&self) -> Result<Vec<AssetInstanceRoot>, StoreError> {
        let rows = sqlx::query(
            "SELECT instance_id, enabled_at, disabled_at FROM asset_instance_roots WHERE disabled_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                Ok(AssetInstanceRoot {
                    instance_id: AssetInstanceId(row.try_get("instance_id").map_err(|e| StoreError::Internal(e.to_string()))?),
                    enabled_at: row.try_get("enabled_at").map_err(|e| StoreError::Internal(e.to_string()))?,
                    disabled_at: row.try_get("disabled_at").map_err(|e| StoreError::Internal(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn list_enabled_fanout_roots(&self) -> Result<Vec<AssetInstanceFanoutRoot>, StoreError> {
        let rows = sqlx::query(
            "SELECT source_instance_id, target_asset_slug, fanout_mode, enabled_at, disabled_at
             FROM asset_instance_fanout_roots WHERE disabled_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| {
                let slug_str: String = row.try_get("target_asset_slug").map_err(|e| StoreError::Internal(e.to_string()))?;
                let mode_str: String = row.try_get("fanout_mode").map_err(|e| StoreError::Internal(e.to_string()))?;
                Ok(AssetInstanceFanoutRoot {
                    source_instance_id: AssetInstanceId(
                        row.try_get("source_instance_id").map_err(|e| StoreError::Internal(e.to_string()))?,
                    ),
                    target_asset_slug: AssetSlug::parse(&slug_str).map_err(|e| StoreError::Internal(e.to_string()))?,
                    fanout_mode: str_to_fanout_mode(&mode_str),
                    enabled_at: row.try_get("enabled_at").map_err(|e| StoreError::Internal(e.to_string()))?,
                    disabled_at: row.try_get("disabled_at").map_err(|e| StoreError::Internal(e.to_string()))?,
                })
            })
            .collect()
    }

    async fn create_asset_materialization(
        &self,
        new: NewMaterialization,
    ) -> Result<AssetMaterialization, StoreError> {
        let row = sqlx::query(
            "INSERT INTO asset_materializations
                 (asset_instance_id, asset_slug, inputs_hash, inputs_hash_version,
                  dependency_revisions_hash, dependency_revisions_hash_version,
                  status, started_at, trigger_reason)
             VALUES ($1, $2, $3, $4, $5, $6, 'in_progress', NOW(), $7)
             RETURNING id, asset_instance_id, asset_slug, inputs_hash, inputs_hash_version,
                       dependency_revisions_hash, dependency_revisions_hash_version,
                       status, started_at, completed_at, output_revision, error, trigger_reason",
        )
        .bind(new.asset_instance_id.0)
        .bind(new.asset_slug.as_str())
        .bind(&new.inputs_hash)
        .bind(new.inputs_hash_version)
        .bind(&new.dependency_revisions_hash)
        .bind(new.dependency_revisions_hash_version)
        .bind(&new.trigger_reason)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        row_to_materialization(&row)
    }

    async fn update_asset_materialization(
        &self,
        id: AssetMaterializationId,
        completion: MaterializationCompletion,
    ) -> Result<AssetMaterialization, StoreError> {
        let row = match completion {
            MaterializationCompletion::Success { output_revision } => sqlx::query(
                "UPDATE asset_materializations
                 SET status = 'success', completed_at = NOW(), output_revision = $2, error = NULL
                 WHERE id = $1
                 RETURNING id, asset_instance_id, asset_slug, inputs_hash, inputs_hash_version,
                           dependency_revisions_hash, dependency_revisions_hash_version,
                           status, started_at, completed_at, output_revision, error, trigger_reason",
            )
            .bind(id.0)
            .bind(output_revision)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?,
            MaterializationCompletion::Error { error } => {
                let json = to_json(&error)?;
                sqlx::query(
                    "UPDATE asset_materializations
                     SET status = 'error', completed_at = NOW(), error = $2::jsonb
                     WHERE id = $1
                     RETURNING id, asset_instance_id, asset_slug, inputs_hash, inputs_hash_version,
                               dependency_revisions_hash, dependency_revisions_hash_version,
                               status, started_at, completed_at, output_revision, error, trigger_reason",
                )
                .bind(id.0)
                .bind(&json)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Internal(e.to_string()))?
            }
        };
        let row = row.ok_or_else(|| StoreError::MaterializationNotFound(id.to_string()))?;
        row_to_materialization(&row)
    }

    async fn get_latest_successful_materialization(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Option<AssetMaterialization>, StoreError> {
        let row = sqlx::query(
            "SELECT id, asset_instance_id, asset_slug, inputs_hash, inputs_hash_version,
                    dependency_revisions_hash, dependency_revisions_hash_version,
                    status, started_at, completed_at, output_revision, error, trigger_reason
             FROM asset_materializations
             WHERE asset_instance_id = $1 AND status = 'success'
             ORDER BY completed_at DESC, id DESC
             LIMIT 1",
        )
        .bind(instance_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        row.as_ref().map(row_to_materialization).transpose()
    }

    async fn get_asset_materialization_by_id(
        &self,
        id: AssetMaterializationId,
    ) -> Result<Option<AssetMaterialization>, StoreError> {
        let row = sqlx::query(
            "SELECT id, asset_instance_id, asset_slug, inputs_hash, inputs_hash_version,
                    dependency_revisions_hash, dependency_revisions_hash_version,
                    status, started_at, completed_at, output_revision, error, trigger_reason
             FROM asset_materializations WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        row.as_ref().map(row_to_materialization).transpose()
    }

    async fn list_successful_materializations(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Vec<AssetMaterialization>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, asset_instance_id, asset_slug, inputs_hash, inputs_hash_version,
                    dependency_revisions_hash, dependency_revisions_hash_version,
                    status, started_at, completed_at, output_revision, error, trigger_reason
             FROM asset_materializations
             WHERE asset_instance_id = $1 AND status = 'success'
             ORDER BY completed_at ASC, id ASC",
        )
        .bind(instance_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.iter().map(row_to_materialization).collect()
    }

    async fn insert_materialization_dependencies(
        &self,
        materialization_id: AssetMaterializationId,
        dependency_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        for dep_id in dependency_materialization_ids {
            sqlx::query(
                "INSERT INTO materialization_dependencies (materialization_id, dependency_materialization_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(materialization_id.0)
            .bind(dep_id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn insert_materialization_requests(
        &self,
        materialization_id: AssetMaterializationId,
        requested_by_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        for req_id in requested_by_materialization_ids {
            sqlx::query(
                "INSERT INTO materialization_requests (materialization_id, requested_by_materialization_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(materialization_id.0)
            .bind(req_id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn insert_segment_events(&self, events: &[SegmentEvent]) -> Result<(), StoreError> {
        for event in events {
            sqlx::query(
                "INSERT INTO segment_events (materialization_id, user_id, event_type, is_first_appearance)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (materialization_id, user_id) DO UPDATE SET event_type = EXCLUDED.event_type",
            )
            .bind(event.materialization_id.0)
            .bind(event.user_id.0 as i64)
            .bind(event_type_to_str(event.event_type))
            .bind(event.is_first_appearance)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn insert_post_corpus_events(&self, events: &[PostCorpusEvent]) -> Result<(), StoreError> {
        for event in events {
            sqlx::query(
                "INSERT INTO post_corpus_events (materialization_id, post_id, event_type, is_first_appearance)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (materialization_id, post_id) DO UPDATE SET event_type = EXCLUDED.event_type",
            )
            .bind(event.materialization_id.0)
            .bind(event.post_id.0 as i64)
            .bind(event_type_to_str(event.event_type))
            .bind(event.is_first_appearance)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn list_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let rows = sqlx::query("SELECT user_id FROM segment_membership_snapshot WHERE instance_id = $1")
            .bind(instance_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("user_id").map(|v| UserId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn list_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError> {
        let rows = sqlx::query("SELECT post_id FROM post_corpus_membership_snapshot WHERE instance_id = $1")
            .bind(instance_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("post_id").map(|v| PostId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn replace_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<UserId>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        sqlx::query("DELETE FROM segment_membership_snapshot WHERE instance_id = $1")
            .bind(instance_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        for user_id in items {
            sqlx::query(
                "INSERT INTO segment_membership_snapshot (instance_id, user_id, materialization_id) VALUES ($1, $2, $3)",
            )
            .bind(instance_id.0)
            .bind(user_id.0 as i64)
            .bind(materialization_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        sqlx::query("UPDATE asset_instances SET current_membership_materialization_id = $2 WHERE id = $1")
            .bind(instance_id.0)
            .bind(materialization_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn replace_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<PostId>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        sqlx::query("DELETE FROM post_corpus_membership_snapshot WHERE instance_id = $1")
            .bind(instance_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        for post_id in items {
            sqlx::query(
                "INSERT INTO post_corpus_membership_snapshot (instance_id, post_id, materialization_id) VALUES ($1, $2, $3)",
            )
            .bind(instance_id.0)
            .bind(post_id.0 as i64)
            .bind(materialization_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        sqlx::query("UPDATE asset_instances SET current_membership_materialization_id = $2 WHERE id = $1")
            .bind(instance_id.0)
            .bind(materialization_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        tx.commit().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn list_segment_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT se.user_id FROM segment_events se
             JOIN asset_materializations m ON m.id = se.materialization_id
             WHERE m.asset_instance_id = $1 AND m.status = 'success' AND se.event_type = 'enter'",
        )
        .bind(instance_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("user_id").map(|v| UserId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn list_post_corpus_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT pe.post_id FROM post_corpus_events pe
             JOIN asset_materializations m ON m.id = pe.materialization_id
             WHERE m.asset_instance_id = $1 AND m.status = 'success' AND pe.event_type = 'enter'",
        )
        .bind(instance_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("post_id").map(|v| PostId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn get_segment_membership_as_of(
        &self,
        instance_id: AssetInstanceId,
        target_materialization_id: AssetMaterializationId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let instance = self
            .get_asset_instance_by_id(instance_id)
            .await?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;
        let checkpoint_id = instance.current_membership_materialization_id.ok_or_else(|| {
            StoreError::InvariantViolated(format!("instance {instance_id} has no checkpoint to rewind from"))
        })?;
        if target_materialization_id == checkpoint_id {
            return self.list_segment_membership_snapshot(instance_id).await;
        }

        let ordered = self.list_successful_materializations(instance_id).await?;
        let target_pos = ordered.iter().position(|m| m.id == target_materialization_id).ok_or_else(|| {
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
        let rewind_ids: Vec<i64> = ordered[target_pos + 1..=checkpoint_pos].iter().map(|m| m.id.0).collect();

        let rows = sqlx::query(
            "SELECT user_id, COUNT(*) as toggle_count FROM segment_events
             WHERE materialization_id = ANY($1) GROUP BY user_id",
        )
        .bind(&rewind_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut result = self.list_segment_membership_snapshot(instance_id).await?;
        for row in rows {
            let user_id = UserId(row.try_get::<i64, _>("user_id").map_err(|e| StoreError::Internal(e.to_string()))? as u64);
            let count: i64 = row.try_get("toggle_count").map_err(|e| StoreError::Internal(e.to_string()))?;
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
        let instance = self
            .get_asset_instance_by_id(instance_id)
            .await?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;
        let checkpoint_id = instance.current_membership_materialization_id.ok_or_else(|| {
            StoreError::InvariantViolated(format!("instance {instance_id} has no checkpoint to rewind from"))
        })?;
        if target_materialization_id == checkpoint_id {
            return self.list_post_corpus_membership_snapshot(instance_id).await;
        }

        let ordered = self.list_successful_materializations(instance_id).await?;
        let target_pos = ordered.iter().position(|m| m.id == target_materialization_id).ok_or_else(|| {
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
        let rewind_ids: Vec<i64> = ordered[target_pos + 1..=checkpoint_pos].iter().map(|m| m.id.0).collect();

        let rows = sqlx::query(
            "SELECT post_id, COUNT(*) as toggle_count FROM post_corpus_events
             WHERE materialization_id = ANY($1) GROUP BY post_id",
        )
        .bind(&rewind_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut result = self.list_post_corpus_membership_snapshot(instance_id).await?;
        for row in rows {
            let post_id = PostId(row.try_get::<i64, _>("post_id").map_err(|e| StoreError::Internal(e.to_string()))? as u64);
            let count: i64 = row.try_get("toggle_count").map_err(|e| StoreError::Internal(e.to_string()))?;
            if count % 2 == 1 {
                if !result.remove(&post_id) {
                    result.insert(post_id);
                }
            }
        }
        Ok(result)
    }

    async fn rebuild_segment_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let ordered = self.list_successful_materializations(instance_id).await?;
        let Some(last) = ordered.last().cloned() else { return Ok(()) };

        let ids: Vec<i64> = ordered.iter().map(|m| m.id.0).collect();
        let rows = sqlx::query(
            "SELECT materialization_id, user_id, event_type FROM segment_events
             WHERE materialization_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut events_by_mat: std::collections::HashMap<i64, Vec<(UserId, EventType)>> = std::collections::HashMap::new();
        for row in rows {
            let mat_id: i64 = row.try_get("materialization_id").map_err(|e| StoreError::Internal(e.to_string()))?;
            let user_id = UserId(row.try_get::<i64, _>("user_id").map_err(|e| StoreError::Internal(e.to_string()))? as u64);
            let ty: String = row.try_get("event_type").map_err(|e| StoreError::Internal(e.to_string()))?;
            events_by_mat.entry(mat_id).or_default().push((user_id, str_to_event_type(&ty)));
        }

        let mut membership: BTreeSet<UserId> = BTreeSet::new();
        for mat in &ordered {
            if let Some(events) = events_by_mat.get(&mat.id.0) {
                for (user_id, event_type) in events {
                    match event_type {
                        EventType::Enter => {
                            membership.insert(*user_id);
                        }
                        EventType::Exit => {
                            membership.remove(user_id);
                        }
                    }
                }
            }
        }
        self.replace_segment_membership_snapshot(instance_id, last.id, &membership).await
    }

    async fn rebuild_post_corpus_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let ordered = self.list_successful_materializations(instance_id).await?;
        let Some(last) = ordered.last().cloned() else { return Ok(()) };

        let ids: Vec<i64> = ordered.iter().map(|m| m.id.0).collect();
        let rows = sqlx::query(
            "SELECT materialization_id, post_id, event_type FROM post_corpus_events
             WHERE materialization_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;

        let mut events_by_mat: std::collections::HashMap<i64, Vec<(PostId, EventType)>> = std::collections::HashMap::new();
        for row in rows {
            let mat_id: i64 = row.try_get("materialization_id").map_err(|e| StoreError::Internal(e.to_string()))?;
            let post_id = PostId(row.try_get::<i64, _>("post_id").map_err(|e| StoreError::Internal(e.to_string()))? as u64);
            let ty: String = row.try_get("event_type").map_err(|e| StoreError::Internal(e.to_string()))?;
            events_by_mat.entry(mat_id).or_default().push((post_id, str_to_event_type(&ty)));
        }

        let mut membership: BTreeSet<PostId> = BTreeSet::new();
        for mat in &ordered {
            if let Some(events) = events_by_mat.get(&mat.id.0) {
                for (post_id, event_type) in events {
                    match event_type {
                        EventType::Enter => {
                            membership.insert(*post_id);
                        }
                        EventType::Exit => {
                            membership.remove(post_id);
                        }
                    }
                }
            }
        }
        self.replace_post_corpus_membership_snapshot(instance_id, last.id, &membership).await
    }

    async fn acquire_advisory_lock(&self, key: &str, timeout_ms: u64) -> Result<bool, StoreError> {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
        loop {
            let result = sqlx::query("INSERT INTO advisory_locks (key) VALUES ($1) ON CONFLICT DO NOTHING")
                .bind(key)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Internal(e.to_string()))?;
            if result.rows_affected() > 0 {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }

    async fn release_advisory_lock(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM advisory_locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn get_latest_followers_sync_run(
        &self,
        target_user_id: UserId,
        status: Option<SyncRunStatus>,
        sync_mode: Option<SyncMode>,
    ) -> Result<Option<IngestSyncRunSummary>, StoreError> {
        let row = sqlx::query(
            "SELECT status, sync_mode, completed_at FROM followers_sync_runs
             WHERE target_user_id = $1
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR sync_mode = $3)
             ORDER BY completed_at DESC NULLS LAST LIMIT 1",
        )
        .bind(target_user_id.0 as i64)
        .bind(status.map(sync_status_to_str))
        .bind(sync_mode.map(sync_mode_to_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        row.map(row_to_sync_summary).transpose()
    }

    async fn get_latest_followings_sync_run(
        &self,
        target_user_id: UserId,
        status: Option<SyncRunStatus>,
        sync_mode: Option<SyncMode>,
    ) -> Result<Option<IngestSyncRunSummary>, StoreError> {
        let row = sqlx::query(
            "SELECT status, sync_mode, completed_at FROM followings_sync_runs
             WHERE target_user_id = $1
               AND ($2::text IS NULL OR status = $2)
               AND ($3::text IS NULL OR sync_mode = $3)
             ORDER BY completed_at DESC NULLS LAST LIMIT 1",
        )
        .bind(target_user_id.0 as i64)
        .bind(status.map(sync_status_to_str))
        .bind(sync_mode.map(sync_mode_to_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        row.map(row_to_sync_summary).transpose()
    }

    async fn get_latest_posts_sync_run(
        &self,
        target_user_id: UserId,
        status: Option<SyncRunStatus>,
    ) -> Result<Option<IngestSyncRunSummary>, StoreError> {
        let row = sqlx::query(
            "SELECT status, NULL::text as sync_mode, completed_at FROM posts_sync_runs
             WHERE target_user_id = $1 AND ($2::text IS NULL OR status = $2)
             ORDER BY completed_at DESC NULLS LAST LIMIT 1",
        )
        .bind(target_user_id.0 as i64)
        .bind(status.map(sync_status_to_str))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        row.map(row_to_sync_summary).transpose()
    }

    async fn link_posts_sync_run_to_materializations(
        &self,
        sync_run_id: Uuid,
        materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        for mat_id in materialization_ids {
            sqlx::query(
                "INSERT INTO posts_sync_run_materializations (sync_run_id, materialization_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(sync_run_id)
            .bind(mat_id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn record_planner_event(&self, entry: DecisionLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO decision_log (planner_run_id, job_id, target_id, target_params, decision, reason, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.planner_run_id)
        .bind(entry.job_id)
        .bind(entry.target_id.map(|id| id.0))
        .bind(entry.target_params)
        .bind(decision_to_str(entry.decision))
        .bind(entry.reason)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn get_specified_user_ids(&self, instance_id: AssetInstanceId) -> Result<Vec<UserId>, StoreError> {
        let rows = sqlx::query("SELECT user_id FROM segment_specified_users WHERE instance_id = $1 ORDER BY user_id")
            .bind(instance_id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("user_id").map(|v| UserId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn set_specified_user_ids(
        &self,
        instance_id: AssetInstanceId,
        user_ids: &[UserId],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        sqlx::query("DELETE FROM segment_specified_users WHERE instance_id = $1")
            .bind(instance_id.0)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        for user_id in user_ids {
            sqlx::query("INSERT INTO segment_specified_users (instance_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING")
                .bind(instance_id.0)
                .bind(user_id.0 as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        tx.commit().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn graph_followers_of(&self, subject: UserId) -> Result<BTreeSet<UserId>, StoreError> {
        let rows = sqlx::query("SELECT follower_user_id FROM graph_followers WHERE subject_user_id = $1")
            .bind(subject.0 as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("follower_user_id").map(|v| UserId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn graph_followed_by(&self, subject: UserId) -> Result<BTreeSet<UserId>, StoreError> {
        let rows = sqlx::query("SELECT followed_user_id FROM graph_followed WHERE subject_user_id = $1")
            .bind(subject.0 as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("followed_user_id").map(|v| UserId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn posts_authored_by(&self, user_ids: &[UserId]) -> Result<BTreeSet<PostId>, StoreError> {
        let ids: Vec<i64> = user_ids.iter().map(|u| u.0 as i64).collect();
        let rows = sqlx::query("SELECT post_id FROM authored_posts WHERE user_id = ANY($1)")
            .bind(&ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("post_id").map(|v| PostId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn begin_materialization_transaction(
        &self,
    ) -> Result<Box<dyn MaterializationTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(Box::new(PostgresMaterializationTransaction {
            tx: tokio::sync::Mutex::new(Some(tx)),
        }))
    }
}

/// `MaterializationTransaction` for [`PostgresRepository`]. Every method
/// reissues the same SQL its non-transactional counterpart uses, but against
/// the one `sqlx::Transaction` this handle owns instead of `&self.pool` —
/// `replace_*_membership_snapshot` in particular no longer opens its own
/// nested `pool.begin()`, since it now runs inside the caller's transaction.
struct PostgresMaterializationTransaction {
    tx: tokio::sync::Mutex<Option<sqlx::Transaction<'static, sqlx::Postgres>>>,
}

#[async_trait]
impl MaterializationTransaction for PostgresMaterializationTransaction {
    async fn insert_materialization_dependencies(
        &self,
        materialization_id: AssetMaterializationId,
        dependency_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        for dep_id in dependency_materialization_ids {
            sqlx::query(
                "INSERT INTO materialization_dependencies (materialization_id, dependency_materialization_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(materialization_id.0)
            .bind(dep_id.0)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn insert_materialization_requests(
        &self,
        materialization_id: AssetMaterializationId,
        requested_by_materialization_ids: &[AssetMaterializationId],
    ) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        for req_id in requested_by_materialization_ids {
            sqlx::query(
                "INSERT INTO materialization_requests (materialization_id, requested_by_materialization_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(materialization_id.0)
            .bind(req_id.0)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn list_successful_materializations(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<Vec<AssetMaterialization>, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        let rows = sqlx::query(
            "SELECT id, asset_instance_id, asset_slug, inputs_hash, inputs_hash_version,
                    dependency_revisions_hash, dependency_revisions_hash_version,
                    status, started_at, completed_at, output_revision, error, trigger_reason
             FROM asset_materializations
             WHERE asset_instance_id = $1 AND status = 'success'
             ORDER BY completed_at ASC, id ASC",
        )
        .bind(instance_id.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.iter().map(row_to_materialization).collect()
    }

    async fn list_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        let rows = sqlx::query("SELECT user_id FROM segment_membership_snapshot WHERE instance_id = $1")
            .bind(instance_id.0)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("user_id").map(|v| UserId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn list_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        let rows = sqlx::query("SELECT post_id FROM post_corpus_membership_snapshot WHERE instance_id = $1")
            .bind(instance_id.0)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("post_id").map(|v| PostId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn list_segment_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<UserId>, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        let rows = sqlx::query(
            "SELECT DISTINCT se.user_id FROM segment_events se
             JOIN asset_materializations m ON m.id = se.materialization_id
             WHERE m.asset_instance_id = $1 AND m.status = 'success' AND se.event_type = 'enter'",
        )
        .bind(instance_id.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("user_id").map(|v| UserId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn list_post_corpus_entered_item_ids(
        &self,
        instance_id: AssetInstanceId,
    ) -> Result<BTreeSet<PostId>, StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        let rows = sqlx::query(
            "SELECT DISTINCT pe.post_id FROM post_corpus_events pe
             JOIN asset_materializations m ON m.id = pe.materialization_id
             WHERE m.asset_instance_id = $1 AND m.status = 'success' AND pe.event_type = 'enter'",
        )
        .bind(instance_id.0)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| StoreError::Internal(e.to_string()))?;
        rows.into_iter()
            .map(|row| row.try_get::<i64, _>("post_id").map(|v| PostId(v as u64)).map_err(|e| StoreError::Internal(e.to_string())))
            .collect()
    }

    async fn insert_segment_events(&self, events: &[SegmentEvent]) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        for event in events {
            sqlx::query(
                "INSERT INTO segment_events (materialization_id, user_id, event_type, is_first_appearance)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (materialization_id, user_id) DO UPDATE SET event_type = EXCLUDED.event_type",
            )
            .bind(event.materialization_id.0)
            .bind(event.user_id.0 as i64)
            .bind(event_type_to_str(event.event_type))
            .bind(event.is_first_appearance)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn insert_post_corpus_events(&self, events: &[PostCorpusEvent]) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        for event in events {
            sqlx::query(
                "INSERT INTO post_corpus_events (materialization_id, post_id, event_type, is_first_appearance)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (materialization_id, post_id) DO UPDATE SET event_type = EXCLUDED.event_type",
            )
            .bind(event.materialization_id.0)
            .bind(event.post_id.0 as i64)
            .bind(event_type_to_str(event.event_type))
            .bind(event.is_first_appearance)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    async fn replace_segment_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<UserId>,
    ) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        sqlx::query("DELETE FROM segment_membership_snapshot WHERE instance_id = $1")
            .bind(instance_id.0)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        for user_id in items {
            sqlx::query(
                "INSERT INTO segment_membership_snapshot (instance_id, user_id, materialization_id) VALUES ($1, $2, $3)",
            )
            .bind(instance_id.0)
            .bind(user_id.0 as i64)
            .bind(materialization_id.0)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        sqlx::query("UPDATE asset_instances SET current_membership_materialization_id = $2 WHERE id = $1")
            .bind(instance_id.0)
            .bind(materialization_id.0)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn replace_post_corpus_membership_snapshot(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
        items: &BTreeSet<PostId>,
    ) -> Result<(), StoreError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(tx_closed)?;
        sqlx::query("DELETE FROM post_corpus_membership_snapshot WHERE instance_id = $1")
            .bind(instance_id.0)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        for post_id in items {
            sqlx::query(
                "INSERT INTO post_corpus_membership_snapshot (instance_id, post_id, materialization_id) VALUES ($1, $2, $3)",
            )
            .bind(instance_id.0)
            .bind(post_id.0 as i64)
            .bind(materialization_id.0)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        }
        sqlx::query("UPDATE asset_instances SET current_membership_materialization_id = $2 WHERE id = $1")
            .bind(instance_id.0)
            .bind(materialization_id.0)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn rebuild_segment_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let ordered = self.list_successful_materializations(instance_id).await?;
        let Some(last) = ordered.last().cloned() else { return Ok(()) };
        let ids: Vec<i64> = ordered.iter().map(|m| m.id.0).collect();

        let rows = {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(tx_closed)?;
            sqlx::query(
                "SELECT materialization_id, user_id, event_type FROM segment_events
                 WHERE materialization_id = ANY($1)",
            )
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?
        };

        let mut events_by_mat: std::collections::HashMap<i64, Vec<(UserId, EventType)>> = std::collections::HashMap::new();
        for row in rows {
            let mat_id: i64 = row.try_get("materialization_id").map_err(|e| StoreError::Internal(e.to_string()))?;
            let user_id = UserId(row.try_get::<i64, _>("user_id").map_err(|e| StoreError::Internal(e.to_string()))? as u64);
            let ty: String = row.try_get("event_type").map_err(|e| StoreError::Internal(e.to_string()))?;
            events_by_mat.entry(mat_id).or_default().push((user_id, str_to_event_type(&ty)));
        }

        let mut membership: BTreeSet<UserId> = BTreeSet::new();
        for mat in &ordered {
            if let Some(events) = events_by_mat.get(&mat.id.0) {
                for (user_id, event_type) in events {
                    match event_type {
                        EventType::Enter => {
                            membership.insert(*user_id);
                        }
                        EventType::Exit => {
                            membership.remove(user_id);
                        }
                    }
                }
            }
        }
        self.replace_segment_membership_snapshot(instance_id, last.id, &membership).await
    }

    async fn rebuild_post_corpus_membership_snapshot(&self, instance_id: AssetInstanceId) -> Result<(), StoreError> {
        let ordered = self.list_successful_materializations(instance_id).await?;
        let Some(last) = ordered.last().cloned() else { return Ok(()) };
        let ids: Vec<i64> = ordered.iter().map(|m| m.id.0).collect();

        let rows = {
            let mut guard = self.tx.lock().await;
            let tx = guard.as_mut().ok_or_else(tx_closed)?;
            sqlx::query(
                "SELECT materialization_id, post_id, event_type FROM post_corpus_events
                 WHERE materialization_id = ANY($1)",
            )
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| StoreError::Internal(e.to_string()))?
        };

        let mut events_by_mat: std::collections::HashMap<i64, Vec<(PostId, EventType)>> = std::collections::HashMap::new();
        for row in rows {
            let mat_id: i64 = row.try_get("materialization_id").map_err(|e| StoreError::Internal(e.to_string()))?;
            let post_id = PostId(row.try_get::<i64, _>("post_id").map_err(|e| StoreError::Internal(e.to_string()))? as u64);
            let ty: String = row.try_get("event_type").map_err(|e| StoreError::Internal(e.to_string()))?;
            events_by_mat.entry(mat_id).or_default().push((post_id, str_to_event_type(&ty)));
        }

        let mut membership: BTreeSet<PostId> = BTreeSet::new();
        for mat in &ordered {
            if let Some(events) = events_by_mat.get(&mat.id.0) {
                for (post_id, event_type) in events {
                    match event_type {
                        EventType::Enter => {
                            membership.insert(*post_id);
                        }
                        EventType::Exit => {
                            membership.remove(post_id);
                        }
                    }
                }
            }
        }
        self.replace_post_corpus_membership_snapshot(instance_id, last.id, &membership).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let tx = self.tx.into_inner().ok_or_else(tx_closed)?;
        tx.commit().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let tx = self.tx.into_inner().ok_or_else(tx_closed)?;
        tx.rollback().await.map_err(|e| StoreError::Internal(e.to_string()))?;
        Ok(())
    }
}

fn tx_closed() -> StoreError {
    StoreError::Internal("materialization transaction already committed or rolled back".to_string())
}

fn row_to_instance(row: &sqlx::postgres::PgRow) -> Result<AssetInstance, StoreError> {
    let slug_str: String = row.try_get("asset_slug").map_err(|e| StoreError::Internal(e.to_string()))?;
    Ok(AssetInstance {
        id: AssetInstanceId(row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?),
        params_id: AssetParamsId(row.try_get("params_id").map_err(|e| StoreError::Internal(e.to_string()))?),
        asset_slug: AssetSlug::parse(&slug_str).map_err(|e| StoreError::Internal(e.to_string()))?,
        params_hash: row.try_get("params_hash").map_err(|e| StoreError::Internal(e.to_string()))?,
        params_hash_version: row.try_get("params_hash_version").map_err(|e| StoreError::Internal(e.to_string()))?,
        current_membership_materialization_id: row
            .try_get::<Option<i64>, _>("current_membership_materialization_id")
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .map(AssetMaterializationId),
    })
}

fn row_to_materialization(row: &sqlx::postgres::PgRow) -> Result<AssetMaterialization, StoreError> {
    let slug_str: String = row.try_get("asset_slug").map_err(|e| StoreError::Internal(e.to_string()))?;
    let status_str: String = row.try_get("status").map_err(|e| StoreError::Internal(e.to_string()))?;
    let error_json: Option<serde_json::Value> = row.try_get("error").map_err(|e| StoreError::Internal(e.to_string()))?;
    let error = error_json
        .map(|v| serde_json::from_value::<MaterializationErrorPayload>(v).map_err(StoreError::Serialization))
        .transpose()?;
    Ok(AssetMaterialization {
        id: AssetMaterializationId(row.try_get("id").map_err(|e| StoreError::Internal(e.to_string()))?),
        asset_instance_id: AssetInstanceId(row.try_get("asset_instance_id").map_err(|e| StoreError::Internal(e.to_string()))?),
        asset_slug: AssetSlug::parse(&slug_str).map_err(|e| StoreError::Internal(e.to_string()))?,
        inputs_hash: row.try_get("inputs_hash").map_err(|e| StoreError::Internal(e.to_string()))?,
        inputs_hash_version: row.try_get("inputs_hash_version").map_err(|e| StoreError::Internal(e.to_string()))?,
        dependency_revisions_hash: row.try_get("dependency_revisions_hash").map_err(|e| StoreError::Internal(e.to_string()))?,
        dependency_revisions_hash_version: row
            .try_get("dependency_revisions_hash_version")
            .map_err(|e| StoreError::Internal(e.to_string()))?,
        status: str_to_status(&status_str),
        started_at: row.try_get("started_at").map_err(|e| StoreError::Internal(e.to_string()))?,
        completed_at: row.try_get("completed_at").map_err(|e| StoreError::Internal(e.to_string()))?,
        output_revision: row.try_get("output_revision").map_err(|e| StoreError::Internal(e.to_string()))?,
        error,
        trigger_reason: row.try_get("trigger_reason").map_err(|e| StoreError::Internal(e.to_string()))?,
    })
}

fn row_to_sync_summary(row: sqlx::postgres::PgRow) -> Result<IngestSyncRunSummary, StoreError> {
    let status_str: String = row.try_get("status").map_err(|e| StoreError::Internal(e.to_string()))?;
    let mode_str: Option<String> = row.try_get("sync_mode").map_err(|e| StoreError::Internal(e.to_string()))?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at").map_err(|e| StoreError::Internal(e.to_string()))?;
    Ok(IngestSyncRunSummary {
        status: str_to_sync_status(&status_str),
        sync_mode: mode_str.as_deref().map(str_to_sync_mode),
        completed_at,
    })
}

fn decision_to_str(decision: Decision) -> &'static str {
    decision.as_str()
}

/// Gated the same way `nclav_store::postgres_store` gates its own suite: run
/// only when a real database is reachable, via `cargo test -- --ignored`.
#[cfg(test)]
mod tests {
    use segment_domain::AssetSlug;

    use super::*;
    use crate::repository::NewMaterialization;

    fn test_url() -> Option<String> {
        std::env::var("TEST_POSTGRES_URL").ok()
    }

    #[tokio::test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    async fn get_or_create_asset_params_is_idempotent() {
        let url = test_url().unwrap();
        let repo = PostgresRepository::connect(&url).await.unwrap();

        let params = AssetParams::SegmentSpecifiedUsers {
            stable_key: "pg-test-idempotent".to_string(),
            fanout_source_params_hash: None,
        };
        let first = repo.get_or_create_asset_params(&params).await.unwrap();
        let second = repo.get_or_create_asset_params(&params).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.params_hash, second.params_hash);
    }

    #[tokio::test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    async fn materialization_lifecycle_and_snapshot_round_trip() {
        let url = test_url().unwrap();
        let repo = PostgresRepository::connect(&url).await.unwrap();

        let params = AssetParams::SegmentSpecifiedUsers {
            stable_key: "pg-test-lifecycle".to_string(),
            fanout_source_params_hash: None,
        };
        let params_row = repo.get_or_create_asset_params(&params).await.unwrap();
        let instance = repo.get_or_create_asset_instance(params_row.id).await.unwrap();

        let materialization = repo
            .create_asset_materialization(NewMaterialization {
                asset_instance_id: instance.id,
                asset_slug: AssetSlug::SegmentSpecifiedUsers,
                inputs_hash: "h1".to_string(),
                inputs_hash_version: 1,
                dependency_revisions_hash: "d1".to_string(),
                dependency_revisions_hash_version: 1,
                trigger_reason: "pg-test".to_string(),
            })
            .await
            .unwrap();
        repo.update_asset_materialization(
            materialization.id,
            MaterializationCompletion::Success { output_revision: 1 },
        )
        .await
        .unwrap();

        let members: BTreeSet<UserId> = [UserId(1), UserId(2)].into_iter().collect();
        repo.replace_segment_membership_snapshot(instance.id, materialization.id, &members)
            .await
            .unwrap();

        let snapshot = repo.list_segment_membership_snapshot(instance.id).await.unwrap();
        assert_eq!(snapshot, members);

        let latest = repo
            .get_latest_successful_materialization(instance.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, materialization.id);
        assert_eq!(latest.output_revision, 1);
    }

    #[tokio::test]
    #[ignore = "requires TEST_POSTGRES_URL"]
    async fn advisory_lock_excludes_concurrent_acquire() {
        let url = test_url().unwrap();
        let repo = PostgresRepository::connect(&url).await.unwrap();

        let key = "pg-test-advisory-lock";
        repo.release_advisory_lock(key).await.unwrap();
        assert!(repo.acquire_advisory_lock(key, 0).await.unwrap());
        assert!(!repo.acquire_advisory_lock(key, 0).await.unwrap());
        repo.release_advisory_lock(key).await.unwrap();
        assert!(repo.acquire_advisory_lock(key, 0).await.unwrap());
        repo.release_advisory_lock(key).await.unwrap();
    }
}
