use std::collections::BTreeSet;

use async_trait::async_trait;
use segment_domain::{AssetInstanceId, AssetParams, AssetSlug, ItemId, ItemKind};

use crate::assets::followers::subject_from_fanout_item;
use crate::assets::mutuals::find_resolved;
use crate::definition::{
    AssetContext, AssetDefinition, Dependency, IngestRequirement, ResolvedDependency, ValidationIssue,
};
use crate::error::RegistryError;

const FOLLOWERS_DEP: &str = "followers";
const FOLLOWED_DEP: &str = "followed";

/// `segment_unreciprocated_followed(subject)` — accounts `subject` follows
/// who do not follow back.
pub struct SegmentUnreciprocatedFollowedAsset;

#[async_trait]
impl AssetDefinition for SegmentUnreciprocatedFollowedAsset {
    fn slug(&self) -> AssetSlug {
        AssetSlug::SegmentUnreciprocatedFollowed
    }

    fn output_item_kind(&self) -> ItemKind {
        ItemKind::User
    }

    fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
        vec![AssetSlug::SegmentFollowers, AssetSlug::SegmentFollowed]
    }

    fn dependencies(&self, params: &AssetParams) -> Result<Vec<Dependency>, RegistryError> {
        let subject_user_id = params
            .subject_user_id()
            .ok_or_else(|| RegistryError::MalformedParams(self.slug()))?;
        Ok(vec![
            Dependency {
                name: FOLLOWERS_DEP.to_string(),
                asset_slug: AssetSlug::SegmentFollowers,
                params: AssetParams::SegmentFollowers {
                    subject_user_id,
                    fanout_source_params_hash: None,
                },
            },
            Dependency {
                name: FOLLOWED_DEP.to_string(),
                asset_slug: AssetSlug::SegmentFollowed,
                params: AssetParams::SegmentFollowed {
                    subject_user_id,
                    fanout_source_params_hash: None,
                },
            },
        ])
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
        _params: &AssetParams,
        _instance_id: AssetInstanceId,
        resolved_deps: &[ResolvedDependency],
        ctx: &dyn AssetContext,
    ) -> Result<BTreeSet<ItemId>, RegistryError> {
        let followers = find_resolved(resolved_deps, FOLLOWERS_DEP)?;
        let followed = find_resolved(resolved_deps, FOLLOWED_DEP)?;
        let followers_set = ctx
            .membership_as_of(followers.instance_id, followers.materialization_id)
            .await?;
        let followed_set = ctx
            .membership_as_of(followed.instance_id, followed.materialization_id)
            .await?;
        Ok(followed_set.difference(&followers_set).copied().collect())
    }

    fn params_from_fanout_item(
        &self,
        item_kind: ItemKind,
        item_id: ItemId,
        fanout_source_params_hash: Option<String>,
    ) -> Result<AssetParams, RegistryError> {
        let subject_user_id = subject_from_fanout_item(self.slug(), item_kind, item_id)?;
        Ok(AssetParams::SegmentUnreciprocatedFollowed {
            subject_user_id,
            fanout_source_params_hash,
        })
    }
}
