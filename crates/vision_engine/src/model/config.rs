//! ModelKind / ModelSpec - Architecture selection

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four classifier variants the trainer can build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Wsdan,
    Resnet50,
    #[serde(alias = "resnet101")]
    Resnet100,
    Inception,
}

impl ModelKind {
    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Wsdan => "wsdan",
            ModelKind::Resnet50 => "resnet50",
            ModelKind::Resnet100 => "resnet100",
            ModelKind::Inception => "inception",
        }
    }

    /// Whether training carries a feature center alongside the weights.
    pub fn uses_feature_center(&self) -> bool {
        matches!(self, ModelKind::Wsdan)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wsdan" | "ws-dan" => Ok(ModelKind::Wsdan),
            "resnet50" => Ok(ModelKind::Resnet50),
            "resnet100" | "resnet101" => Ok(ModelKind::Resnet100),
            "inception" | "inception_v3" | "inceptionv3" => Ok(ModelKind::Inception),
            other => Err(format!(
                "unknown model '{}' (expected wsdan, resnet50, resnet100 or inception)",
                other
            )),
        }
    }
}

/// Everything needed to rebuild a network before loading its weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub kind: ModelKind,
    pub num_classes: usize,
    #[serde(default = "default_num_attentions")]
    pub num_attentions: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
}

fn default_num_attentions() -> usize {
    8
}

fn default_image_size() -> usize {
    400
}

impl ModelSpec {
    pub fn new(kind: ModelKind, num_classes: usize) -> Self {
        Self {
            kind,
            num_classes,
            num_attentions: default_num_attentions(),
            image_size: default_image_size(),
        }
    }

    pub fn with_num_attentions(mut self, m: usize) -> Self {
        self.num_attentions = m;
        self
    }

    pub fn with_image_size(mut self, size: usize) -> Self {
        self.image_size = size;
        self
    }

    /// Size of the WS-DAN feature matrix row (M * C), None for other kinds.
    pub fn feature_dim(&self) -> Option<usize> {
        match self.kind {
            ModelKind::Wsdan => Some(self.num_attentions * super::wsdan::FEATURE_CHANNELS),
            _ => None,
        }
    }
}
