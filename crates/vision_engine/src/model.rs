//! Model Module - Classifier architectures
//!
//! This module contains the networks the trainer can build:
//! - ResNet: bottleneck ResNet-50 / ResNet-101
//! - InceptionV3: Inception v3 with auxiliary classifier
//! - WsDan: attention-pooled Inception trunk for fine-grained classes
//! - Network: runtime dispatch over the above, selected by ModelSpec

pub mod config;
pub mod inception;
pub mod network;
pub mod resnet;
pub mod wsdan;

pub use config::{ModelKind, ModelSpec};
pub use inception::InceptionV3;
pub use network::{Network, NetworkOutput};
pub use resnet::ResNet;
pub use wsdan::{WsDan, WsDanOutput};
