use std::collections::BTreeSet;

use async_trait::async_trait;
use segment_domain::{AssetInstanceId, AssetMaterializationId, AssetParams, AssetSlug, ItemId, ItemKind, PostId, UserId};

use crate::error::RegistryError;

/// The kind of upstream ingest a requirement asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IngestKind {
    Followers,
    Followings,
    Posts,
}

impl std::fmt::Display for IngestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IngestKind::Followers => "followers",
            IngestKind::Followings => "followings",
            IngestKind::Posts => "posts",
        };
        write!(f, "{s}")
    }
}

/// One named dependency an asset declares over another asset's output.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub asset_slug: AssetSlug,
    pub params: AssetParams,
}

/// A dependency that the planner has already resolved to a materialization.
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub dependency: Dependency,
    pub instance_id: AssetInstanceId,
    pub materialization_id: AssetMaterializationId,
    pub output_revision: i64,
}

/// A request that some upstream ingest be fresh before this asset computes.
#[derive(Debug, Clone)]
pub struct IngestRequirement {
    pub ingest_kind: IngestKind,
    pub target_user_id: UserId,
    pub freshness_ms: Option<u64>,
    pub requested_by_materialization_ids: Vec<AssetMaterializationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub severity: ValidationSeverity,
    pub message: String,
}

impl ValidationIssue {
    pub fn error(message: impl Into<String>) -> Self {
        ValidationIssue {
            severity: ValidationSeverity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        ValidationIssue {
            severity: ValidationSeverity::Warning,
            message: message.into(),
        }
    }
}

/// The narrow slice of planner/store state an [`AssetDefinition`] is allowed
/// to read. Implemented by the engine against its repository so this crate
/// never takes a dependency on storage or ingest transports.
#[async_trait]
pub trait AssetContext: Send + Sync {
    /// Operator-provided user ids backing a `segment_specified_users` instance.
    async fn specified_user_ids(&self, instance_id: AssetInstanceId) -> Result<Vec<UserId>, RegistryError>;

    /// The membership set produced by a given materialization (its snapshot,
    /// or an as-of rewind if the materialization is no longer current).
    async fn membership_as_of(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
    ) -> Result<BTreeSet<ItemId>, RegistryError>;

    /// Posts authored by any of `user_ids`, over whatever window the ingest
    /// layer has synced.
    async fn posts_authored_by(&self, user_ids: &[UserId]) -> Result<BTreeSet<PostId>, RegistryError>;

    /// The accounts currently following `subject`, from synced graph state.
    async fn graph_followers_of(&self, subject: UserId) -> Result<BTreeSet<ItemId>, RegistryError>;

    /// The accounts `subject` currently follows, from synced graph state.
    async fn graph_followed_by(&self, subject: UserId) -> Result<BTreeSet<ItemId>, RegistryError>;

    /// The engine-configured default freshness window for a given ingest kind.
    fn default_freshness_ms(&self, kind: IngestKind) -> Option<u64>;
}

/// Per-slug behavior: dependency shape, ingest needs, validation, and the
/// pure membership computation.
#[async_trait]
pub trait AssetDefinition: Send + Sync {
    fn slug(&self) -> AssetSlug;

    fn output_item_kind(&self) -> ItemKind;

    /// The fixed set of slugs this asset may depend on, independent of
    /// params. Used only to assert acyclicity of the registry at startup —
    /// never to resolve an actual dependency list.
    fn static_dependency_slugs(&self) -> Vec<AssetSlug>;

    /// The concrete, params-specific dependency list. Deterministic: the
    /// same `(slug, params)` always yields the same list.
    fn dependencies(&self, params: &AssetParams) -> Result<Vec<Dependency>, RegistryError>;

    async fn ingest_requirements(
        &self,
        params: &AssetParams,
        resolved_deps: &[ResolvedDependency],
        ctx: &dyn AssetContext,
    ) -> Result<Vec<IngestRequirement>, RegistryError>;

    async fn validate_inputs(
        &self,
        params: &AssetParams,
        instance_id: AssetInstanceId,
        ctx: &dyn AssetContext,
    ) -> Result<Vec<ValidationIssue>, RegistryError>;

    /// Additional hash parts beyond the engine-prepended prefix — anything
    /// that can change this asset's output outside of its dependencies.
    async fn inputs_hash_parts(
        &self,
        params: &AssetParams,
        instance_id: AssetInstanceId,
        ctx: &dyn AssetContext,
    ) -> Result<Vec<String>, RegistryError>;

    async fn compute_membership(
        &self,
        params: &AssetParams,
        instance_id: AssetInstanceId,
        resolved_deps: &[ResolvedDependency],
        ctx: &dyn AssetContext,
    ) -> Result<BTreeSet<ItemId>, RegistryError>;

    /// Build the target params for a fanout minted from `item_id` in a
    /// source instance's membership. The default rejects this slug as a
    /// fanout target; slugs that support fanout targeting override it.
    fn params_from_fanout_item(
        &self,
        item_kind: ItemKind,
        item_id: ItemId,
        fanout_source_params_hash: Option<String>,
    ) -> Result<AssetParams, RegistryError> {
        let _ = (item_kind, item_id, fanout_source_params_hash);
        Err(RegistryError::NotAFanoutTarget(self.slug()))
    }
}
