pub mod followed;
pub mod followers;
pub mod mutuals;
pub mod post_corpus;
pub mod specified_users;
pub mod unreciprocated_followed;

use std::sync::Arc;

use crate::definition::AssetDefinition;

/// The full closed set of asset definitions, in registration order.
///
/// This is the single place a new asset slug gets wired in — adding a slug
/// means adding one variant to [`segment_domain::AssetSlug`], one module
/// here, and one entry in this list.
pub fn all_definitions() -> Vec<Arc<dyn AssetDefinition>> {
    vec![
        Arc::new(specified_users::SegmentSpecifiedUsersAsset),
        Arc::new(followers::SegmentFollowersAsset),
        Arc::new(followed::SegmentFollowedAsset),
        Arc::new(mutuals::SegmentMutualsAsset),
        Arc::new(unreciprocated_followed::SegmentUnreciprocatedFollowedAsset),
        Arc::new(post_corpus::PostCorpusForSegmentAsset),
    ]
}
