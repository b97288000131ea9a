use std::collections::BTreeSet;

use async_trait::async_trait;
use segment_domain::{AssetInstanceId, AssetParams, AssetSlug, ItemId, ItemKind, UserId};

use crate::definition::{
    AssetContext, AssetDefinition, Dependency, IngestRequirement, ResolvedDependency, ValidationIssue,
};
use crate::error::RegistryError;

/// Operator-curated, fixed membership — no upstream ingest, no dependencies.
pub struct SegmentSpecifiedUsersAsset;

#[async_trait]
impl AssetDefinition for SegmentSpecifiedUsersAsset {
    fn slug(&self) -> AssetSlug {
        AssetSlug::SegmentSpecifiedUsers
    }

    fn output_item_kind(&self) -> ItemKind {
        ItemKind::User
    }

    fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
        vec![]
    }

    fn dependencies(&self, _params: &AssetParams) -> Result<Vec<Dependency>, RegistryError> {
        Ok(vec![])
    }

    async fn ingest_requirements(
        &self,
        _params: &AssetParams,
        _resolved_deps: &[ResolvedDependency],
        _ctx: &dyn AssetContext,
    ) -> Result<Vec<IngestRequirement>, RegistryError> {
        Ok(vec![])
    }

    async fn validate_inputs(
        &self,
        _params: &AssetParams,
        instance_id: AssetInstanceId,
        ctx: &dyn AssetContext,
    ) -> Result<Vec<ValidationIssue>, RegistryError> {
        let ids = ctx.specified_user_ids(instance_id).await?;
        if ids.is_empty() {
            Ok(vec![ValidationIssue::warning(
                "specified_users inputs are empty; the instance will materialize an empty segment",
            )])
        } else {
            Ok(vec![])
        }
    }

    async fn inputs_hash_parts(
        &self,
        _params: &AssetParams,
        instance_id: AssetInstanceId,
        ctx: &dyn AssetContext,
    ) -> Result<Vec<String>, RegistryError> {
        let mut ids = ctx.specified_user_ids(instance_id).await?;
        ids.sort();
        Ok(vec![format!(
            "specified_user_ids={}",
            ids.iter().map(UserId::to_string).collect::<Vec<_>>().join(",")
        )])
    }

    async fn compute_membership(
        &self,
        _params: &AssetParams,
        instance_id: AssetInstanceId,
        _resolved_deps: &[ResolvedDependency],
        ctx: &dyn AssetContext,
    ) -> Result<BTreeSet<ItemId>, RegistryError> {
        let ids = ctx.specified_user_ids(instance_id).await?;
        Ok(ids.into_iter().map(ItemId::User).collect())
    }
}
