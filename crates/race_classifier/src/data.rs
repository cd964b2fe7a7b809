//! Data Module - Image manifests and batch loading
//!
//! - manifest: CSV manifest -> (image path, label) samples
//! - transform: decode + resize + normalise into CHW f32
//! - loader: shuffled / sequential batches decoded on a rayon pool

pub mod loader;
pub mod manifest;
pub mod transform;

pub use loader::ImageLoader;
pub use manifest::{read_manifest, ManifestColumns, Sample};
pub use transform::ImageTransform;
