//! Vision Engine
//!
//! Convolutional classifiers for the race classification toolchain, built on candle.
//! Provides the ResNet, Inception v3 and WS-DAN networks, the attention-guided
//! crop/drop augmentation used by WS-DAN, and top-k accuracy.

pub mod augment;
pub mod device_utils;
pub mod layers;
pub mod metrics;
pub mod model;

pub use metrics::{accuracy, topk_correct};
pub use model::{ModelKind, ModelSpec, Network, NetworkOutput};
