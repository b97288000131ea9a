use std::collections::BTreeSet;

use async_trait::async_trait;
use segment_domain::{AssetInstanceId, AssetParams, AssetSlug, ItemId, ItemKind, UserId};

use crate::definition::{
    AssetContext, AssetDefinition, Dependency, IngestKind, IngestRequirement, ResolvedDependency, ValidationIssue,
};
use crate::error::RegistryError;

const SOURCE_SEGMENT_DEP: &str = "source_segment";

/// `post_corpus_for_segment(sourceSegmentParams)` — posts authored by the
/// members of a source segment, over whatever window the ingest layer has
/// synced for each member.
pub struct PostCorpusForSegmentAsset;

#[async_trait]
impl AssetDefinition for PostCorpusForSegmentAsset {
    fn slug(&self) -> AssetSlug {
        AssetSlug::PostCorpusForSegment
    }

    fn output_item_kind(&self) -> ItemKind {
        ItemKind::Post
    }

    fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
        // Every segment variant is a potential source; the registry's
        // acyclicity check only needs to know post corpora sit downstream of
        // segments, never the reverse.
        vec![
            AssetSlug::SegmentSpecifiedUsers,
            AssetSlug::SegmentFollowers,
            AssetSlug::SegmentFollowed,
            AssetSlug::SegmentMutuals,
            AssetSlug::SegmentUnreciprocatedFollowed,
        ]
    }

    fn dependencies(&self, params: &AssetParams) -> Result<Vec<Dependency>, RegistryError> {
        let source_segment_params = match params {
            AssetParams::PostCorpusForSegment {
                source_segment_params,
                ..
            } => (**source_segment_params).clone(),
            _ => return Err(RegistryError::MalformedParams(self.slug())),
        };
        Ok(vec![Dependency {
            name: SOURCE_SEGMENT_DEP.to_string(),
            asset_slug: source_segment_params.slug(),
            params: source_segment_params,
        }])
    }

    async fn ingest_requirements(
        &self,
        _params: &AssetParams,
        resolved_deps: &[ResolvedDependency],
        ctx: &dyn AssetContext,
    ) -> Result<Vec<IngestRequirement>, RegistryError> {
        let source = find_source(resolved_deps)?;
        let members = ctx
            .membership_as_of(source.instance_id, source.materialization_id)
            .await?;
        let mut member_user_ids: Vec<UserId> = Vec::with_capacity(members.len());
        for member in &members {
            member_user_ids.push(member_user_id(self.slug(), *member)?);
        }
        member_user_ids.sort();
        member_user_ids.dedup();

        let freshness_ms = ctx.default_freshness_ms(IngestKind::Posts);
        Ok(member_user_ids
            .into_iter()
            .map(|target_user_id| IngestRequirement {
                ingest_kind: IngestKind::Posts,
                target_user_id,
                freshness_ms,
                requested_by_materialization_ids: vec![],
            })
            .collect())
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
        let source = find_source(resolved_deps)?;
        let members = ctx
            .membership_as_of(source.instance_id, source.materialization_id)
            .await?;
        let mut member_user_ids: Vec<UserId> = Vec::with_capacity(members.len());
        for member in &members {
            member_user_ids.push(member_user_id(self.slug(), *member)?);
        }
        member_user_ids.sort();
        member_user_ids.dedup();

        let posts = ctx.posts_authored_by(&member_user_ids).await?;
        Ok(posts.into_iter().map(ItemId::Post).collect())
    }

    fn params_from_fanout_item(
        &self,
        _item_kind: ItemKind,
        item_id: ItemId,
        fanout_source_params_hash: Option<String>,
    ) -> Result<AssetParams, RegistryError> {
        // A fanned-out member is a single user; wrap it in a single-member
        // specified-users segment and source the corpus from that. The
        // stable key is derived only from the member, not from the fanout
        // root, so `global_per_item` mode naturally converges on one nested
        // segment (and one corpus) per member across every source that
        // fans out to it.
        let member_user_id = member_user_id(self.slug(), item_id)?;
        Ok(AssetParams::PostCorpusForSegment {
            source_segment_params: Box::new(AssetParams::SegmentSpecifiedUsers {
                stable_key: fanout_member_stable_key(member_user_id),
                fanout_source_params_hash: None,
            }),
            fanout_source_params_hash,
        })
    }
}

/// Stable key for the single-member `segment_specified_users` instance a
/// fanout into `post_corpus_for_segment` mints for one member.
pub fn fanout_member_stable_key(member_user_id: UserId) -> String {
    format!("post_corpus_fanout_member:{member_user_id}")
}

fn find_source(resolved_deps: &[ResolvedDependency]) -> Result<&ResolvedDependency, RegistryError> {
    resolved_deps
        .iter()
        .find(|d| d.dependency.name == SOURCE_SEGMENT_DEP)
        .ok_or_else(|| RegistryError::Context("resolved dependency 'source_segment' not found".to_string()))
}

fn member_user_id(slug: AssetSlug, item: ItemId) -> Result<UserId, RegistryError> {
    match item {
        ItemId::User(user_id) => Ok(user_id),
        ItemId::Post(_) => Err(RegistryError::FanoutTargetKindMismatch {
            slug,
            expected: ItemKind::User,
            got: ItemKind::Post,
        }),
    }
}
