use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;

/// ImageNet channel statistics
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resize -> [0, 1] -> per-channel normalise, laid out as CHW.
#[derive(Debug, Clone, Copy)]
pub struct ImageTransform {
    pub height: u32,
    pub width: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl ImageTransform {
    pub fn new(size: usize) -> Self {
        Self {
            height: size as u32,
            width: size as u32,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    /// Number of f32 values one transformed image occupies.
    pub fn sample_len(&self) -> usize {
        3 * self.height as usize * self.width as usize
    }

    pub fn load(&self, path: &Path) -> Result<Vec<f32>> {
        let img = image::open(path).with_context(|| format!("Failed to open image {:?}", path))?;
        Ok(self.apply(&img))
    }

    pub fn apply(&self, img: &DynamicImage) -> Vec<f32> {
        let rgb = img
            .resize_exact(self.width, self.height, FilterType::Triangle)
            .to_rgb8();
        let plane = (self.width * self.height) as usize;
        let mut out = vec![0f32; 3 * plane];
        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                let v = pixel[c] as f32 / 255.0;
                out[c * plane + i] = (v - self.mean[c]) / self.std[c];
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_normalised_chw() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 6, Rgb([255, 0, 128])));
        let t = ImageTransform::new(4);
        let out = t.apply(&img);
        assert_eq!(out.len(), t.sample_len());
        assert_eq!(out.len(), 3 * 16);

        let r = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let g = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((out[0] - r).abs() < 1e-5);
        assert!((out[15] - r).abs() < 1e-5);
        assert!((out[16] - g).abs() < 1e-5);
    }

    #[test]
    fn test_missing_file() {
        let t = ImageTransform::new(4);
        assert!(t.load(Path::new("/definitely/not/here.png")).is_err());
    }
}
