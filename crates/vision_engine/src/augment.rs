//! Attention-guided augmentation (WS-DAN "see better" crop and "attend more" drop)

use candle_core::{DType, Result, Tensor, D};

/// Crop threshold on the max-normalised attention map
pub const THETA_C: f64 = 0.5;
/// Drop threshold on the max-normalised attention map
pub const THETA_D: f64 = 0.5;

const EPSILON: f64 = 1e-12;

/// Scales every [H, W] map of a [B, K, H, W] tensor so that its maximum is 1.
pub fn normalize_maps(maps: &Tensor) -> Result<Tensor> {
    let max = maps
        .flatten_from(2)?
        .max_keepdim(D::Minus1)?
        .unsqueeze(D::Minus1)?
        .maximum(EPSILON)?;
    maps.broadcast_div(&max)
}

/// Upsamples normalised maps to the image resolution.
fn maps_at(images: &Tensor, attention_map: &Tensor) -> Result<Tensor> {
    let (_b, _c, h, w) = images.dims4()?;
    normalize_maps(&attention_map.to_dtype(DType::F32)?)?.upsample_nearest2d(h, w)
}

/// Bounding box of the set cells as `(y0, y1, x0, x1)`, end-exclusive.
pub fn mask_bbox(mask: &[Vec<u8>]) -> Option<(usize, usize, usize, usize)> {
    let mut bbox: Option<(usize, usize, usize, usize)> = None;
    for (y, row) in mask.iter().enumerate() {
        for (x, &v) in row.iter().enumerate() {
            if v == 0 {
                continue;
            }
            bbox = Some(match bbox {
                None => (y, y + 1, x, x + 1),
                Some((y0, y1, x0, x1)) => (y0.min(y), y1.max(y + 1), x0.min(x), x1.max(x + 1)),
            });
        }
    }
    bbox
}

/// Crops each image to the region where its attention map exceeds `theta`
/// and resizes the crops to `crop_size`.
///
/// images: [B, 3, H, W], attention_map: [B, 1, h, w] -> [B, 3, crop_h, crop_w]
pub fn attention_crop(
    images: &Tensor,
    attention_map: &Tensor,
    theta: f64,
    crop_size: (usize, usize),
) -> Result<Tensor> {
    let (b, _c, h, w) = images.dims4()?;
    let maps = maps_at(images, attention_map)?;
    let mask = maps.gt(theta)?.squeeze(1)?.to_vec3::<u8>()?;

    let mut crops = Vec::with_capacity(b);
    for (i, sample_mask) in mask.iter().enumerate() {
        let (y0, y1, x0, x1) = mask_bbox(sample_mask).unwrap_or((0, h, 0, w));
        let crop = images
            .narrow(0, i, 1)?
            .narrow(2, y0, y1 - y0)?
            .narrow(3, x0, x1 - x0)?
            .upsample_nearest2d(crop_size.0, crop_size.1)?;
        crops.push(crop);
    }
    Tensor::cat(&crops, 0)
}

/// Zeroes the pixels where the attention map exceeds `theta`.
///
/// images: [B, 3, H, W], attention_map: [B, 1, h, w] -> [B, 3, H, W]
pub fn attention_drop(images: &Tensor, attention_map: &Tensor, theta: f64) -> Result<Tensor> {
    let maps = maps_at(images, attention_map)?;
    let keep = maps.le(theta)?.to_dtype(images.dtype())?;
    images.broadcast_mul(&keep)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_mask_bbox() {
        let mask = vec![vec![0, 0, 0, 0], vec![0, 1, 0, 0], vec![0, 0, 1, 0]];
        assert_eq!(mask_bbox(&mask), Some((1, 3, 1, 3)));
        assert_eq!(mask_bbox(&[vec![0, 0], vec![0, 0]]), None);
    }

    #[test]
    fn test_crop_follows_attention() -> Result<()> {
        let device = Device::Cpu;
        let images = Tensor::arange(0f32, 16f32, &device)?
            .reshape((1, 1, 4, 4))?
            .repeat((1, 3, 1, 1))?;
        // Attention peaks in the bottom-right quadrant of a 2x2 map.
        let attention = Tensor::new(&[0.1f32, 0.2, 0.3, 1.0], &device)?.reshape((1, 1, 2, 2))?;

        let crops = attention_crop(&images, &attention, THETA_C, (2, 2))?;
        assert_eq!(crops.dims(), &[1, 3, 2, 2]);
        let c0 = crops.get(0)?.get(0)?.to_vec2::<f32>()?;
        assert_eq!(c0, vec![vec![10.0, 11.0], vec![14.0, 15.0]]);
        Ok(())
    }

    #[test]
    fn test_drop_zeroes_attended_region() -> Result<()> {
        let device = Device::Cpu;
        let images = Tensor::ones((1, 3, 4, 4), DType::F32, &device)?;
        let attention = Tensor::new(&[1.0f32, 0.0, 0.0, 0.0], &device)?.reshape((1, 1, 2, 2))?;

        let dropped = attention_drop(&images, &attention, THETA_D)?;
        let c0 = dropped.get(0)?.get(0)?.to_vec2::<f32>()?;
        assert_eq!(c0[0], vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(c0[1], vec![0.0, 0.0, 1.0, 1.0]);
        assert_eq!(c0[3], vec![1.0, 1.0, 1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_all_zero_map_keeps_whole_image() -> Result<()> {
        let device = Device::Cpu;
        let images = Tensor::ones((2, 3, 4, 4), DType::F32, &device)?;
        let attention = Tensor::zeros((2, 1, 2, 2), DType::F32, &device)?;
        let crops = attention_crop(&images, &attention, THETA_C, (3, 3))?;
        assert_eq!(crops.dims(), &[2, 3, 3, 3]);
        Ok(())
    }
}
