use std::collections::BTreeSet;

use async_trait::async_trait;
use segment_domain::{AssetInstanceId, AssetParams, AssetSlug, ItemId, ItemKind};

use crate::assets::followers::subject_from_fanout_item;
use crate::definition::{
    AssetContext, AssetDefinition, Dependency, IngestKind, IngestRequirement, ResolvedDependency, ValidationIssue,
};
use crate::error::RegistryError;

/// `segment_followed(subject)` — the accounts `subject` currently follows.
pub struct SegmentFollowedAsset;

#[async_trait]
impl AssetDefinition for SegmentFollowedAsset {
    fn slug(&self) -> AssetSlug {
        AssetSlug::SegmentFollowed
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
        params: &AssetParams,
        _resolved_deps: &[ResolvedDependency],
        ctx: &dyn AssetContext,
    ) -> Result<Vec<IngestRequirement>, RegistryError> {
        let subject_user_id = params
            .subject_user_id()
            .ok_or_else(|| RegistryError::MalformedParams(self.slug()))?;
        Ok(vec![IngestRequirement {
            ingest_kind: IngestKind::Followings,
            target_user_id: subject_user_id,
            freshness_ms: ctx.default_freshness_ms(IngestKind::Followings),
            requested_by_materialization_ids: vec![],
        }])
    }

    async fn validate_inputs(
        &self,
        _params: &AssetParams,
        _instance_id: AssetInstanceId,
        _ctx: &dyn AssetContext,
    ) -> Result<Vec<ValidationIssue>, RegistryError> {
        Ok(vec![])
    }

    async fn inputs_hash_parts(
        &self,
        _params: &AssetParams,
        _instance_id: AssetInstanceId,
        _ctx: &dyn AssetContext,
    ) -> Result<Vec<String>, RegistryError> {
        Ok(vec![])
    }

    async fn compute_membership(
        &self,
        params: &AssetParams,
        _instance_id: AssetInstanceId,
        _resolved_deps: &[ResolvedDependency],
        ctx: &dyn AssetContext,
    ) -> Result<BTreeSet<ItemId>, RegistryError> {
        let subject_user_id = params
            .subject_user_id()
            .ok_or_else(|| RegistryError::MalformedParams(self.slug()))?;
        ctx.graph_followed_by(subject_user_id).await
    }

    fn params_from_fanout_item(
        &self,
        item_kind: ItemKind,
        item_id: ItemId,
        fanout_source_params_hash: Option<String>,
    ) -> Result<AssetParams, RegistryError> {
        let subject_user_id = subject_from_fanout_item(self.slug(), item_kind, item_id)?;
        Ok(AssetParams::SegmentFollowed {
            subject_user_id,
            fanout_source_params_hash,
        })
    }
}
