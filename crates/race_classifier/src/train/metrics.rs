//! Running loss / top-k accuracy for one epoch

/// The k values reported for every batch
pub const TOPK: [usize; 3] = [1, 2, 3];

#[derive(Debug, Clone, Default)]
pub struct RunningMetrics {
    batches: usize,
    loss: f64,
    acc: [f64; 3],
}

impl RunningMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// `acc` is the batch's top-(1, 2, 3) accuracy in percent.
    pub fn add(&mut self, loss: f64, acc: &[f64]) {
        self.batches += 1;
        self.loss += loss;
        for (sum, a) in self.acc.iter_mut().zip(acc) {
            *sum += a;
        }
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn mean_loss(&self) -> f64 {
        if self.batches == 0 {
            return 0.0;
        }
        self.loss / self.batches as f64
    }

    pub fn mean_acc(&self) -> [f64; 3] {
        if self.batches == 0 {
            return [0.0; 3];
        }
        self.acc.map(|a| a / self.batches as f64)
    }

    /// `Loss 1.2345, Accuracy: (12.50, 40.00, 77.00)`
    pub fn summary(&self) -> String {
        let [a1, a2, a3] = self.mean_acc();
        format!(
            "Loss {:.4}, Accuracy: ({:.2}, {:.2}, {:.2})",
            self.mean_loss(),
            a1,
            a2,
            a3
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averages_over_batches() {
        let mut m = RunningMetrics::new();
        m.add(2.0, &[50.0, 75.0, 100.0]);
        m.add(1.0, &[0.0, 25.0, 50.0]);
        assert_eq!(m.batches(), 2);
        assert!((m.mean_loss() - 1.5).abs() < 1e-12);
        assert_eq!(m.mean_acc(), [25.0, 50.0, 75.0]);
        assert_eq!(
            m.summary(),
            "Loss 1.5000, Accuracy: (25.00, 50.00, 75.00)"
        );
    }

    #[test]
    fn test_empty_reports_zero() {
        let m = RunningMetrics::new();
        assert_eq!(m.batches(), 0);
        assert_eq!(m.mean_loss(), 0.0);
        assert_eq!(m.mean_acc(), [0.0; 3]);
    }
}
