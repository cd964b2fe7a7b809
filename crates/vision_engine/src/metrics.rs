//! Top-k accuracy

use candle_core::{DType, Result, Tensor};

/// Counts, for each k, the rows whose target is among the k highest scores.
///
/// Ties are broken towards the lower class index. A k larger than the number
/// of classes counts every row as correct.
pub fn topk_correct(scores: &[Vec<f32>], targets: &[u32], ks: &[usize]) -> Vec<usize> {
    let mut correct = vec![0usize; ks.len()];
    for (row, &target) in scores.iter().zip(targets) {
        let t = target as usize;
        let Some(&target_score) = row.get(t) else {
            continue;
        };
        let rank = row
            .iter()
            .enumerate()
            .filter(|&(j, &s)| s > target_score || (s == target_score && j < t))
            .count();
        for (c, &k) in correct.iter_mut().zip(ks) {
            if rank < k {
                *c += 1;
            }
        }
    }
    correct
}

/// Top-k accuracy in percent for a batch of logits [B, C] and targets [B].
pub fn accuracy(logits: &Tensor, targets: &Tensor, ks: &[usize]) -> Result<Vec<f64>> {
    let scores = logits.detach().to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let targets = targets.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let batch = targets.len();
    if batch == 0 {
        return Ok(vec![0.0; ks.len()]);
    }
    Ok(topk_correct(&scores, &targets, ks)
        .into_iter()
        .map(|c| c as f64 * 100.0 / batch as f64)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_topk_counts() {
        let scores = vec![
            vec![0.1, 0.7, 0.2, 0.0], // target 1 ranked first
            vec![0.5, 0.1, 0.3, 0.1], // target 2 ranked second
            vec![0.4, 0.3, 0.2, 0.1], // target 3 ranked last
        ];
        let targets = vec![1, 2, 3];
        assert_eq!(topk_correct(&scores, &targets, &[1, 2, 3]), vec![1, 2, 2]);
        assert_eq!(topk_correct(&scores, &targets, &[4, 10]), vec![3, 3]);
    }

    #[test]
    fn test_ties_prefer_lower_index() {
        let scores = vec![vec![0.5, 0.5, 0.0]];
        assert_eq!(topk_correct(&scores, &[0], &[1]), vec![1]);
        assert_eq!(topk_correct(&scores, &[1], &[1]), vec![0]);
        assert_eq!(topk_correct(&scores, &[1], &[2]), vec![1]);
    }

    #[test]
    fn test_accuracy_percent() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 1., 0., -1.], [0., 1., 3., 2.]], &device)?;
        let targets = Tensor::new(&[0u32, 3], &device)?;
        let acc = accuracy(&logits, &targets, &[1, 2, 3])?;
        assert_eq!(acc, vec![50.0, 100.0, 100.0]);
        Ok(())
    }
}
