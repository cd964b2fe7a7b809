use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::sync::Arc;

use super::{ImageTransform, Sample};

pub struct ImageLoader {
    samples: Vec<Sample>,
    order: Vec<usize>,
    pub batch_size: usize,
    pub cursor: usize,
    pub shuffle: bool, // If true, reshuffle on every reset
    rng: StdRng,
    transform: ImageTransform,
    pool: Arc<rayon::ThreadPool>,
}

impl ImageLoader {
    pub fn new(
        samples: Vec<Sample>,
        batch_size: usize,
        transform: ImageTransform,
        pool: Arc<rayon::ThreadPool>,
    ) -> Self {
        let order = (0..samples.len()).collect();
        Self {
            samples,
            order,
            batch_size: batch_size.max(1),
            cursor: 0,
            shuffle: false, // Default to sequential (evaluation mode)
            rng: StdRng::from_entropy(),
            transform,
            pool,
        }
    }

    pub fn with_shuffle(mut self, seed: Option<u64>) -> Self {
        self.shuffle = true;
        if let Some(seed) = seed {
            self.rng = StdRng::seed_from_u64(seed);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Batches per pass, counting the trailing partial batch.
    pub fn num_batches(&self) -> usize {
        self.samples.len().div_ceil(self.batch_size)
    }

    /// Rewinds to the start of a new pass.
    pub fn reset(&mut self) {
        self.cursor = 0;
        if self.shuffle {
            self.order.shuffle(&mut self.rng);
        }
    }

    /// Samples of the next batch without decoding them.
    pub fn peek_indices(&self) -> &[usize] {
        let end = (self.cursor + self.batch_size).min(self.order.len());
        &self.order[self.cursor..end]
    }

    /// Decodes the next batch: images [B, 3, H, W] f32 and labels [B] u32.
    /// Returns `None` once the pass is exhausted.
    pub fn next_batch(&mut self, device: &Device) -> Result<Option<(Tensor, Tensor)>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }
        let indices = self.peek_indices().to_vec();
        self.cursor += indices.len();

        let transform = self.transform;
        let samples = &self.samples;
        let decoded: Vec<Vec<f32>> = self.pool.install(|| {
            indices
                .par_iter()
                .map(|&i| transform.load(&samples[i].path))
                .collect::<Result<Vec<_>>>()
        })?;

        let b = indices.len();
        let mut pixels = Vec::with_capacity(b * transform.sample_len());
        for img in decoded {
            pixels.extend_from_slice(&img);
        }
        let labels: Vec<u32> = indices.iter().map(|&i| samples[i].label).collect();

        let images = Tensor::from_vec(
            pixels,
            (b, 3, transform.height as usize, transform.width as usize),
            device,
        )?;
        let labels = Tensor::from_vec(labels, b, device)?;
        Ok(Some((images, labels)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use std::path::PathBuf;

    fn pool() -> Arc<rayon::ThreadPool> {
        Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap())
    }

    fn write_images(dir: &std::path::Path, n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let path = dir.join(format!("{i}.png"));
                RgbImage::from_pixel(5, 5, Rgb([i as u8 * 10, 0, 0]))
                    .save(&path)
                    .unwrap();
                Sample {
                    path,
                    label: (i % 4) as u32,
                }
            })
            .collect()
    }

    #[test]
    fn test_partial_last_batch() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let samples = write_images(dir.path(), 5);
        let mut loader = ImageLoader::new(samples, 2, ImageTransform::new(4), pool());
        assert_eq!(loader.num_batches(), 3);

        loader.reset();
        let mut sizes = Vec::new();
        let mut labels = Vec::new();
        while let Some((x, y)) = loader.next_batch(&Device::Cpu)? {
            assert_eq!(&x.dims()[1..], &[3, 4, 4]);
            sizes.push(x.dim(0)?);
            labels.extend(y.to_vec1::<u32>()?);
        }
        assert_eq!(sizes, vec![2, 2, 1]);
        // Sequential loaders keep manifest order.
        assert_eq!(labels, vec![0, 1, 2, 3, 0]);
        Ok(())
    }

    #[test]
    fn test_shuffle_is_a_permutation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let samples = write_images(dir.path(), 8);
        let mut loader =
            ImageLoader::new(samples, 3, ImageTransform::new(2), pool()).with_shuffle(Some(3));
        loader.reset();
        let mut seen = Vec::new();
        while !loader.peek_indices().is_empty() {
            seen.extend_from_slice(loader.peek_indices());
            loader.cursor += loader.peek_indices().len();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..8).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_missing_image_is_an_error() {
        let samples = vec![Sample {
            path: PathBuf::from("/nope/0.png"),
            label: 0,
        }];
        let mut loader = ImageLoader::new(samples, 1, ImageTransform::new(2), pool());
        assert!(loader.next_batch(&Device::Cpu).is_err());
    }
}
