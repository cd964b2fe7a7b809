//! WsDan - Weakly Supervised Data Augmentation Network
//!
//! Inception v3 trunk (through `Mixed_6e`) -> M attention maps -> bilinear
//! attention pooling -> linear head. In training mode two attention maps per
//! sample are drawn for attention cropping and dropping; in eval mode the mean
//! attention map is returned.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Mutex;

use super::inception::{InceptionTrunk, TRUNK_CHANNELS};
use crate::layers::conv_bn::ConvSpec;
use crate::layers::{Bap, ConvBn};

/// Channels of the feature map fed into BAP
pub const FEATURE_CHANNELS: usize = TRUNK_CHANNELS;

/// Logit scale applied to the normalised feature matrix
const LOGIT_SCALE: f64 = 100.0;

const EPSILON: f64 = 1e-12;

pub struct WsDanOutput {
    pub logits: Tensor,
    /// [B, M * C], L2-normalised
    pub feature_matrix: Tensor,
    /// Detached. Training: [B, 2, H, W] (crop map, drop map). Eval: [B, 1, H, W].
    pub attention_map: Tensor,
}

pub struct WsDan {
    pub features: InceptionTrunk,
    pub attentions: ConvBn,
    pub fc: Linear,
    pub num_attentions: usize,
    rng: Mutex<StdRng>,
}

impl WsDan {
    pub fn load(num_classes: usize, num_attentions: usize, vb: VarBuilder) -> Result<Self> {
        let features = InceptionTrunk::load(vb.pp("features"))?;
        let attentions = ConvBn::basic(
            ConvSpec::square(FEATURE_CHANNELS, num_attentions, 1),
            vb.pp("attentions"),
        )?;
        let fc = candle_nn::linear_no_bias(
            num_attentions * FEATURE_CHANNELS,
            num_classes,
            vb.pp("fc"),
        )?;
        Ok(Self {
            features,
            attentions,
            fc,
            num_attentions,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// Makes attention sampling reproducible.
    pub fn reseed(&self, seed: u64) {
        if let Ok(mut rng) = self.rng.lock() {
            *rng = StdRng::seed_from_u64(seed);
        }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<WsDanOutput> {
        let feature_maps = self.features.forward_t(xs, train)?;
        let attention_maps = self.attentions.forward_t(&feature_maps, train)?;
        let feature_matrix = Bap::forward(&feature_maps, &attention_maps)?;
        let logits = self.fc.forward(&(&feature_matrix * LOGIT_SCALE)?)?;

        let attention_maps = attention_maps.detach();
        let attention_map = if train {
            self.sample_attention_maps(&attention_maps)?
        } else {
            attention_maps.mean_keepdim(1)?
        };

        Ok(WsDanOutput {
            logits,
            feature_matrix,
            attention_map,
        })
    }

    /// Draws two maps per sample with probability proportional to the square
    /// root of each map's total activation.
    fn sample_attention_maps(&self, attention_maps: &Tensor) -> Result<Tensor> {
        let (b, m, _h, _w) = attention_maps.dims4()?;
        let mass = attention_maps
            .sum(D::Minus1)?
            .sum(D::Minus1)?
            .to_dtype(candle_core::DType::F32)?
            .to_vec2::<f32>()?;

        let mut rng = self
            .rng
            .lock()
            .map_err(|_| candle_core::Error::Msg("attention rng poisoned".to_string()))?;

        let mut selected = Vec::with_capacity(b);
        for (i, row) in mass.iter().enumerate() {
            let weights: Vec<f64> = row
                .iter()
                .map(|&v| (f64::from(v).max(0.0) + EPSILON).sqrt())
                .collect();
            let dist = WeightedIndex::new(&weights)
                .map_err(|e| candle_core::Error::Msg(format!("attention weights: {e}")))?;
            let picks: Vec<u32> = (0..2).map(|_| dist.sample(&mut *rng) as u32).collect();
            debug_assert!(picks.iter().all(|&k| (k as usize) < m));
            let idx = Tensor::new(picks.as_slice(), attention_maps.device())?;
            selected.push(attention_maps.get(i)?.index_select(&idx, 0)?);
        }
        Tensor::stack(&selected, 0)
    }
}
