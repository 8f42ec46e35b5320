//! Avatar assets: image cycles, playback strategies and the id catalog.

pub mod catalog;
pub mod library;
pub mod playback;

pub use catalog::AvatarCatalog;
pub use library::{AssetSnapshot, BoundingBox, FrameAsset, FrameAssetLibrary};
pub use playback::{IdleClip, PlaybackStrategy};
