//! Network - Runtime dispatch over the classifier variants

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::{InceptionV3, ModelKind, ModelSpec, ResNet, WsDan};

/// What a forward pass produced. Only `logits` is always present.
pub struct NetworkOutput {
    pub logits: Tensor,
    /// Inception auxiliary head, training mode only
    pub aux_logits: Option<Tensor>,
    /// WS-DAN feature matrix [B, M * C]
    pub feature_matrix: Option<Tensor>,
    /// WS-DAN attention map(s), detached
    pub attention_map: Option<Tensor>,
}

impl NetworkOutput {
    fn logits_only(logits: Tensor) -> Self {
        Self {
            logits,
            aux_logits: None,
            feature_matrix: None,
            attention_map: None,
        }
    }
}

pub enum Network {
    ResNet(ResNet),
    Inception(InceptionV3),
    WsDan(WsDan),
}

impl Network {
    pub fn load(spec: &ModelSpec, vb: VarBuilder) -> Result<Self> {
        tracing::debug!(
            "Building {} ({} classes, {} attentions)",
            spec.kind,
            spec.num_classes,
            spec.num_attentions
        );
        let net = match spec.kind {
            ModelKind::Resnet50 => Network::ResNet(ResNet::resnet50(spec.num_classes, vb)?),
            ModelKind::Resnet100 => Network::ResNet(ResNet::resnet101(spec.num_classes, vb)?),
            ModelKind::Inception => {
                Network::Inception(InceptionV3::load(spec.num_classes, true, vb)?)
            }
            ModelKind::Wsdan => Network::WsDan(WsDan::load(
                spec.num_classes,
                spec.num_attentions,
                vb,
            )?),
        };
        Ok(net)
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<NetworkOutput> {
        match self {
            Network::ResNet(net) => Ok(NetworkOutput::logits_only(net.forward_t(xs, train)?)),
            Network::Inception(net) => {
                let (logits, aux_logits) = net.forward_t(xs, train)?;
                Ok(NetworkOutput {
                    logits,
                    aux_logits,
                    feature_matrix: None,
                    attention_map: None,
                })
            }
            Network::WsDan(net) => {
                let out = net.forward_t(xs, train)?;
                Ok(NetworkOutput {
                    logits: out.logits,
                    aux_logits: None,
                    feature_matrix: Some(out.feature_matrix),
                    attention_map: Some(out.attention_map),
                })
            }
        }
    }

    /// Logits in eval mode.
    pub fn predict(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.forward_t(xs, false)?.logits)
    }

    pub fn reseed(&self, seed: u64) {
        if let Network::WsDan(net) = self {
            net.reseed(seed);
        }
    }
}
