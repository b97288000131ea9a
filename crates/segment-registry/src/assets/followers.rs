use std::collections::BTreeSet;

use async_trait::async_trait;
use segment_domain::{AssetInstanceId, AssetParams, AssetSlug, ItemId, ItemKind};

use crate::definition::{
    AssetContext, AssetDefinition, Dependency, IngestKind, IngestRequirement, ResolvedDependency, ValidationIssue,
};
use crate::error::RegistryError;

/// `segment_followers(subject)` — the accounts currently following `subject`.
pub struct SegmentFollowersAsset;

#[async_trait]
impl AssetDefinition for SegmentFollowersAsset {
    fn slug(&self) -> AssetSlug {
        AssetSlug::SegmentFollowers
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
            ingest_kind: IngestKind::Followers,
            target_user_id: subject_user_id,
            freshness_ms: ctx.default_freshness_ms(IngestKind::Followers),
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
        ctx.graph_followers_of(subject_user_id).await
    }

    fn params_from_fanout_item(
        &self,
        item_kind: ItemKind,
        item_id: ItemId,
        fanout_source_params_hash: Option<String>,
    ) -> Result<AssetParams, RegistryError> {
        let subject_user_id = subject_from_fanout_item(self.slug(), item_kind, item_id)?;
        Ok(AssetParams::SegmentFollowers {
            subject_user_id,
            fanout_source_params_hash,
        })
    }
}

/// Shared by every `segment_*(subject)` fanout target: the fanned-out item
/// must be a user, and it becomes the new instance's subject.
pub(crate) fn subject_from_fanout_item(
    slug: AssetSlug,
    item_kind: ItemKind,
    item_id: ItemId,
) -> Result<segment_domain::UserId, RegistryError> {
    match (item_kind, item_id) {
        (ItemKind::User, ItemId::User(user_id)) => Ok(user_id),
        (expected, _) => Err(RegistryError::FanoutTargetKindMismatch {
            slug,
            expected,
            got: match item_id {
                ItemId::User(_) => ItemKind::User,
                ItemId::Post(_) => ItemKind::Post,
            },
        }),
    }
}
