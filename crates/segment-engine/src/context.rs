//! The engine's concrete [`AssetContext`] — the narrow read surface asset
//! definitions are allowed, backed by the engine's [`Repository`]. Keeping
//! this adapter in the engine crate (rather than on `Repository` itself)
//! means `segment-registry` never depends on `segment-store`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use segment_domain::{AssetInstanceId, AssetMaterializationId, ItemId, ItemKind, PostId, UserId};
use segment_registry::{AssetContext, AssetDefinition, AssetRegistry, IngestKind};
use segment_store::Repository;

use crate::config::EngineConfig;

pub struct RepositoryAssetContext {
    pub repo: Arc<dyn Repository>,
    pub registry: Arc<AssetRegistry>,
    pub config: EngineConfig,
}

fn to_registry_err(err: segment_store::StoreError) -> segment_registry::RegistryError {
    segment_registry::RegistryError::Context(err.to_string())
}

#[async_trait]
impl AssetContext for RepositoryAssetContext {
    async fn specified_user_ids(&self, instance_id: AssetInstanceId) -> Result<Vec<UserId>, segment_registry::RegistryError> {
        self.repo.get_specified_user_ids(instance_id).await.map_err(to_registry_err)
    }

    async fn membership_as_of(
        &self,
        instance_id: AssetInstanceId,
        materialization_id: AssetMaterializationId,
    ) -> Result<BTreeSet<ItemId>, segment_registry::RegistryError> {
        let instance = self
            .repo
            .get_asset_instance_by_id(instance_id)
            .await
            .map_err(to_registry_err)?
            .ok_or_else(|| segment_registry::RegistryError::Context(format!("instance {instance_id} not found")))?;
        let definition = self.registry.get(instance.asset_slug)?;
        match definition.output_item_kind() {
            ItemKind::User => {
                let users = self
                    .repo
                    .get_segment_membership_as_of(instance_id, materialization_id)
                    .await
                    .map_err(to_registry_err)?;
                Ok(users.into_iter().map(ItemId::User).collect())
            }
            ItemKind::Post => {
                let posts = self
                    .repo
                    .get_post_corpus_membership_as_of(instance_id, materialization_id)
                    .await
                    .map_err(to_registry_err)?;
                Ok(posts.into_iter().map(ItemId::Post).collect())
            }
        }
    }

    async fn posts_authored_by(&self, user_ids: &[UserId]) -> Result<BTreeSet<PostId>, segment_registry::RegistryError> {
        self.repo.posts_authored_by(user_ids).await.map_err(to_registry_err)
    }

    async fn graph_followers_of(&self, subject: UserId) -> Result<BTreeSet<ItemId>, segment_registry::RegistryError> {
        let users = self.repo.graph_followers_of(subject).await.map_err(to_registry_err)?;
        Ok(users.into_iter().map(ItemId::User).collect())
    }

    async fn graph_followed_by(&self, subject: UserId) -> Result<BTreeSet<ItemId>, segment_registry::RegistryError> {
        let users = self.repo.graph_followed_by(subject).await.map_err(to_registry_err)?;
        Ok(users.into_iter().map(ItemId::User).collect())
    }

    fn default_freshness_ms(&self, kind: IngestKind) -> Option<u64> {
        match kind {
            IngestKind::Followers => self.config.default_followers_freshness_ms,
            IngestKind::Followings => self.config.default_followings_freshness_ms,
            IngestKind::Posts => self.config.default_posts_freshness_ms,
        }
    }
}
