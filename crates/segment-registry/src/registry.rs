use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use segment_domain::AssetSlug;

use crate::definition::AssetDefinition;
use crate::error::RegistryError;

/// The closed slug → definition map. Built once at startup and never
/// mutated afterward; the planner treats it as immutable shared state.
pub struct AssetRegistry {
    definitions: HashMap<AssetSlug, Arc<dyn AssetDefinition>>,
}

impl AssetRegistry {
    pub fn new(definitions: Vec<Arc<dyn AssetDefinition>>) -> Self {
        let mut map = HashMap::with_capacity(definitions.len());
        for def in definitions {
            map.insert(def.slug(), def);
        }
        AssetRegistry { definitions: map }
    }

    pub fn get(&self, slug: AssetSlug) -> Result<&Arc<dyn AssetDefinition>, RegistryError> {
        self.definitions.get(&slug).ok_or(RegistryError::UnknownSlug(slug))
    }

    pub fn slugs(&self) -> impl Iterator<Item = &AssetSlug> {
        self.definitions.keys()
    }

    /// Verifies the static, params-independent dependency shape has no
    /// cycles. The registry's dependency graph is closed by construction —
    /// this is a startup assertion, not a runtime possibility the planner
    /// needs to guard against per tick.
    pub fn assert_acyclic(&self) -> Result<(), RegistryError> {
        let mut graph = DiGraph::<AssetSlug, ()>::new();
        let mut nodes = HashMap::with_capacity(self.definitions.len());
        for slug in self.definitions.keys() {
            nodes.insert(*slug, graph.add_node(*slug));
        }
        for (slug, def) in &self.definitions {
            let from = nodes[slug];
            for dep_slug in def.static_dependency_slugs() {
                if !self.definitions.contains_key(&dep_slug) {
                    return Err(RegistryError::UnknownSlug(dep_slug));
                }
                let to = nodes[&dep_slug];
                graph.add_edge(from, to, ());
            }
        }
        if is_cyclic_directed(&graph) {
            let slugs: Vec<String> = self.definitions.keys().map(|s| s.to_string()).collect();
            return Err(RegistryError::CycleDetected(slugs.join(", ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use segment_domain::{AssetInstanceId, AssetMaterializationId, AssetParams, ItemId, ItemKind, PostId, UserId};

    use super::*;
    use crate::definition::{AssetContext, Dependency, IngestKind, IngestRequirement, ResolvedDependency, ValidationIssue};

    struct StubAsset {
        slug: AssetSlug,
        deps: Vec<AssetSlug>,
    }

    #[async_trait]
    impl AssetDefinition for StubAsset {
        fn slug(&self) -> AssetSlug {
            self.slug
        }

        fn output_item_kind(&self) -> ItemKind {
            ItemKind::User
        }

        fn static_dependency_slugs(&self) -> Vec<AssetSlug> {
            self.deps.clone()
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
            _resolved_deps: &[ResolvedDependency],
            _ctx: &dyn AssetContext,
        ) -> Result<BTreeSet<ItemId>, RegistryError> {
            Ok(BTreeSet::new())
        }
    }

    #[allow(dead_code)]
    struct StubContext;

    #[async_trait]
    impl AssetContext for StubContext {
        async fn specified_user_ids(&self, _instance_id: AssetInstanceId) -> Result<Vec<UserId>, RegistryError> {
            Ok(vec![])
        }

        async fn membership_as_of(
            &self,
            _instance_id: AssetInstanceId,
            _materialization_id: AssetMaterializationId,
        ) -> Result<BTreeSet<ItemId>, RegistryError> {
            Ok(BTreeSet::new())
        }

        async fn posts_authored_by(&self, _user_ids: &[UserId]) -> Result<BTreeSet<PostId>, RegistryError> {
            Ok(BTreeSet::new())
        }

        async fn graph_followers_of(&self, _subject: UserId) -> Result<BTreeSet<ItemId>, RegistryError> {
            Ok(BTreeSet::new())
        }

        async fn graph_followed_by(&self, _subject: UserId) -> Result<BTreeSet<ItemId>, RegistryError> {
            Ok(BTreeSet::new())
        }

        fn default_freshness_ms(&self, _kind: IngestKind) -> Option<u64> {
            None
        }
    }

    #[test]
    fn acyclic_registry_passes() {
        let registry = AssetRegistry::new(vec![
            Arc::new(StubAsset {
                slug: AssetSlug::SegmentFollowers,
                deps: vec![],
            }),
            Arc::new(StubAsset {
                slug: AssetSlug::SegmentMutuals,
                deps: vec![AssetSlug::SegmentFollowers, AssetSlug::SegmentFollowed],
            }),
            Arc::new(StubAsset {
                slug: AssetSlug::SegmentFollowed,
                deps: vec![],
            }),
        ]);
        assert!(registry.assert_acyclic().is_ok());
    }

    #[test]
    fn cycle_is_detected() {
        let registry = AssetRegistry::new(vec![
            Arc::new(StubAsset {
                slug: AssetSlug::SegmentFollowers,
                deps: vec![AssetSlug::SegmentFollowed],
            }),
            Arc::new(StubAsset {
                slug: AssetSlug::SegmentFollowed,
                deps: vec![AssetSlug::SegmentFollowers],
            }),
        ]);
        assert!(matches!(
            registry.assert_acyclic(),
            Err(RegistryError::CycleDetected(_))
        ));
    }

    #[test]
    fn unknown_slug_lookup_fails() {
        let registry = AssetRegistry::new(vec![]);
        assert!(matches!(
            registry.get(AssetSlug::SegmentFollowers),
            Err(RegistryError::UnknownSlug(_))
        ));
    }
}
