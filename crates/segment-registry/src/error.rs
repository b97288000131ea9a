use segment_domain::{AssetSlug, ItemKind, ParamsError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no definition registered for asset slug: {0}")]
    UnknownSlug(AssetSlug),

    #[error("dependency cycle detected among static asset dependencies: {0}")]
    CycleDetected(String),

    #[error("asset slug {0} is not a valid fanout target")]
    NotAFanoutTarget(AssetSlug),

    #[error("fanout item kind mismatch: slug {slug} expects {expected} items, got {got}")]
    FanoutTargetKindMismatch {
        slug: AssetSlug,
        expected: ItemKind,
        got: ItemKind,
    },

    #[error("malformed params for slug {0}")]
    MalformedParams(AssetSlug),

    #[error(transparent)]
    Params(#[from] ParamsError),

    #[error("context lookup failed: {0}")]
    Context(String),
}
