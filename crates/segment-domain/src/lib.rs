pub mod decision;
pub mod error;
pub mod hashing;
pub mod ids;
pub mod params;

pub use decision::Decision;
pub use error::{HashError, ParamsError};
pub use hashing::{canonical_json_stringify, hash_parts_v1, HASH_VERSION_V1};
pub use ids::{AssetInstanceId, AssetMaterializationId, AssetParamsId, ItemId, ItemKind, PostId, UserId};
pub use params::{parse_asset_params, AssetParams, AssetSlug};
