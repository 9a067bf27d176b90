pub mod asset;
pub mod asset_index;

pub use asset::*;
pub use asset_index::{AlbumSummary, AssetIndex, CachedEntry, IndexedAsset};
