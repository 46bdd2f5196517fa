pub mod builder;
pub mod config;
pub mod copy;
pub mod manifest;
pub mod media_types;

pub use builder::{BuildState, ImageBuilder, MultiArchBuilder, PushedImage};
pub use config::{ImageConfig, ImageSettings};
pub use copy::{copy_artifact, CopyOptions, Location};
pub use manifest::{ImageIndex, ImageManifest, IndexEntry, Manifest, Platform};
pub use media_types::{ManifestStyle, MediaTypes};
