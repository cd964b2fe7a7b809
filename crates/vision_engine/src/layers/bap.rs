//! Bap - Bilinear Attention Pooling

use candle_core::{Result, Tensor, D};

use super::TensorExt;

const EPSILON: f64 = 1e-12;

/// Pools a feature map once per attention map and flattens the result.
///
/// features: [B, C, H, W], attentions: [B, M, H, W] -> [B, M * C]
pub struct Bap;

impl Bap {
    pub fn forward(features: &Tensor, attentions: &Tensor) -> Result<Tensor> {
        let (b, _c, _h, _w) = features.dims4()?;
        let m = attentions.dim(1)?;

        let mut parts = Vec::with_capacity(m);
        for i in 0..m {
            let a_i = attentions.narrow(1, i, 1)?;
            let pooled = features.broadcast_mul(&a_i)?.global_avg_pool()?;
            parts.push(pooled);
        }
        let feature_matrix = Tensor::cat(&parts, 1)?.reshape((b, ()))?;

        // Both inputs are post-ReLU, so the signed square root reduces to sqrt.
        let feature_matrix = (feature_matrix.relu()? + EPSILON)?.sqrt()?;
        l2_normalize(&feature_matrix)
    }
}

/// L2 normalization along the last dimension.
pub fn l2_normalize(xs: &Tensor) -> Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?.maximum(EPSILON)?;
    xs.broadcast_div(&norm)
}
