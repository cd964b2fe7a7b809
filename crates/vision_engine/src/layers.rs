//! Layers Module - Convolutional building blocks
//!
//! This module contains the pieces shared by the classifier networks:
//! - ConvBn: Conv2d (no bias) + BatchNorm, optionally followed by ReLU
//! - Bap: Bilinear Attention Pooling used by WS-DAN

use candle_core::{Result, Tensor, D};

pub mod bap;
pub mod conv_bn;

pub use bap::Bap;
pub use conv_bn::ConvBn;

// --- Helper Trait for Pooling Operations ---
// candle only differentiates its pooling kernels when kernel == stride, so
// overlapping windows are built from narrow / maximum / add instead.
pub(crate) trait TensorExt {
    /// Max pooling with symmetric zero padding. Only valid after a ReLU,
    /// where zero never exceeds the window maximum.
    fn max_pool2d_padded(&self, kernel: usize, stride: usize, padding: usize) -> Result<Tensor>;

    /// Average pooling that counts the zero padding, as torchvision does.
    fn avg_pool2d_padded(&self, kernel: usize, stride: usize, padding: usize) -> Result<Tensor>;

    /// [B, C, H, W] -> [B, C]
    fn global_avg_pool(&self) -> Result<Tensor>;
}

impl TensorExt for Tensor {
    fn max_pool2d_padded(&self, kernel: usize, stride: usize, padding: usize) -> Result<Tensor> {
        if kernel == stride && padding == 0 {
            return self.max_pool2d_with_stride(kernel, stride);
        }
        reduce_windows(self, kernel, stride, padding, |acc, window| acc.maximum(window))
    }

    fn avg_pool2d_padded(&self, kernel: usize, stride: usize, padding: usize) -> Result<Tensor> {
        if kernel == stride && padding == 0 {
            return self.avg_pool2d_with_stride(kernel, stride);
        }
        let sum = reduce_windows(self, kernel, stride, padding, |acc, window| acc + window)?;
        sum / (kernel * kernel) as f64
    }

    fn global_avg_pool(&self) -> Result<Tensor> {
        self.mean(D::Minus1)?.mean(D::Minus1)
    }
}

/// Folds the k*k shifted views of the zero-padded input with `op`, then keeps
/// every `stride`-th output row and column.
fn reduce_windows<F>(xs: &Tensor, kernel: usize, stride: usize, padding: usize, op: F) -> Result<Tensor>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    let xs = pad_hw(xs, padding)?;
    let (_b, _c, h, w) = xs.dims4()?;
    let (oh, ow) = pooled_size(h, w, kernel, stride)?;
    let (span_h, span_w) = ((oh - 1) * stride + 1, (ow - 1) * stride + 1);

    let mut acc: Option<Tensor> = None;
    for dy in 0..kernel {
        let rows = xs.narrow(2, dy, span_h)?;
        for dx in 0..kernel {
            let window = rows.narrow(3, dx, span_w)?;
            acc = Some(match acc {
                None => window,
                Some(acc) => op(&acc, &window)?,
            });
        }
    }
    let acc = acc.ok_or_else(|| candle_core::Error::Msg("empty pooling kernel".into()))?;
    subsample_hw(&acc, stride)
}

fn pooled_size(h: usize, w: usize, kernel: usize, stride: usize) -> Result<(usize, usize)> {
    if kernel == 0 || stride == 0 || h < kernel || w < kernel {
        candle_core::bail!(
            "pooling window {}x{} (stride {}) does not fit a {}x{} input",
            kernel,
            kernel,
            stride,
            h,
            w
        );
    }
    Ok(((h - kernel) / stride + 1, (w - kernel) / stride + 1))
}

/// Keeps every `stride`-th row and column.
fn subsample_hw(xs: &Tensor, stride: usize) -> Result<Tensor> {
    if stride == 1 {
        return Ok(xs.clone());
    }
    let (_b, _c, h, w) = xs.dims4()?;
    let rows: Vec<u32> = (0..h).step_by(stride).map(|i| i as u32).collect();
    let cols: Vec<u32> = (0..w).step_by(stride).map(|i| i as u32).collect();
    let rows = Tensor::new(rows.as_slice(), xs.device())?;
    let cols = Tensor::new(cols.as_slice(), xs.device())?;
    xs.index_select(&rows, 2)?.index_select(&cols, 3)
}

fn pad_hw(xs: &Tensor, padding: usize) -> Result<Tensor> {
    if padding == 0 {
        return Ok(xs.clone());
    }
    xs.pad_with_zeros(2, padding, padding)?
        .pad_with_zeros(3, padding, padding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_avg_pool_counts_padding() -> Result<()> {
        let xs = Tensor::ones((1, 1, 3, 3), DType::F32, &Device::Cpu)?;
        let pooled = xs.avg_pool2d_padded(3, 1, 1)?;
        assert_eq!(pooled.dims(), &[1, 1, 3, 3]);
        let v = pooled.flatten_all()?.to_vec1::<f32>()?;
        // Corner sees 4 ones out of 9 cells, centre sees all 9.
        assert!((v[0] - 4.0 / 9.0).abs() < 1e-6);
        assert!((v[4] - 1.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_max_pool_overlapping_windows() -> Result<()> {
        let xs = Tensor::arange(0f32, 25f32, &Device::Cpu)?.reshape((1, 1, 5, 5))?;
        let pooled = xs.max_pool2d_padded(3, 2, 0)?;
        assert_eq!(pooled.dims(), &[1, 1, 2, 2]);
        assert_eq!(
            pooled.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?,
            vec![vec![12.0, 14.0], vec![22.0, 24.0]]
        );

        let padded = xs.max_pool2d_padded(3, 2, 1)?;
        assert_eq!(padded.dims(), &[1, 1, 3, 3]);
        assert_eq!(
            padded.squeeze(0)?.squeeze(0)?.to_vec2::<f32>()?,
            vec![vec![6.0, 8.0, 9.0], vec![16.0, 18.0, 19.0], vec![21.0, 23.0, 24.0]]
        );
        Ok(())
    }

    #[test]
    fn test_avg_pool_strided_matches_window_mean() -> Result<()> {
        let xs = Tensor::arange(0f32, 36f32, &Device::Cpu)?.reshape((1, 1, 6, 6))?;
        let pooled = xs.avg_pool2d_padded(5, 3, 0)?;
        assert_eq!(pooled.dims(), &[1, 1, 1, 1]);
        // Mean of the top-left 5x5 block: centre cell (2, 2) = 14.
        let v = pooled.flatten_all()?.to_vec1::<f32>()?;
        assert!((v[0] - 14.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_overlapping_pools_backpropagate() -> Result<()> {
        let device = Device::Cpu;
        let var = candle_core::Var::new(&[1f32, 5., 2., 3., 4., 0., 7., 6., 8.], &device)?;
        let xs = var.as_tensor().reshape((1, 1, 3, 3))?;
        let ys = (xs.max_pool2d_padded(3, 2, 1)?.sum_all()? + xs.avg_pool2d_padded(3, 1, 1)?.sum_all()?)?;
        let grads = ys.backward()?;
        let g = grads.get(var.as_tensor()).expect("gradient").to_vec1::<f32>()?;
        assert_eq!(g.len(), 9);
        // 5 wins two max windows and sits under six average windows;
        // the corner 8 wins one and sits under four.
        assert!((g[1] - (2.0 + 6.0 / 9.0)).abs() < 1e-5);
        assert!((g[8] - (1.0 + 4.0 / 9.0)).abs() < 1e-5);
        // 0 never wins a window.
        assert!((g[5] - 6.0 / 9.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_global_avg_pool() -> Result<()> {
        let xs = Tensor::arange(0f32, 8f32, &Device::Cpu)?.reshape((1, 2, 2, 2))?;
        let pooled = xs.global_avg_pool()?;
        assert_eq!(pooled.to_vec2::<f32>()?, vec![vec![1.5, 5.5]]);
        Ok(())
    }
}
