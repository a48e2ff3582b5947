//! Scalar metrics: running averages and top-k accuracy

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Running average of a scalar, weighted by sample count.
#[derive(Debug, Clone, Default)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, value: f64, n: usize) {
        self.sum += value * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

/// Fraction of samples whose true label falls in the top-k logits, for
/// each requested k. Each k is capped at the class count.
pub fn accuracy(logits: &Array2<f64>, targets: &[usize], topk: &[usize]) -> Vec<f64> {
    let (n, classes) = logits.dim();
    debug_assert_eq!(n, targets.len());
    topk.iter()
        .map(|&k| {
            let k = k.min(classes);
            let mut correct = 0usize;
            for (bi, &label) in targets.iter().enumerate() {
                let own = logits[[bi, label]];
                // rank of the true label: number of strictly larger logits
                let rank = (0..classes).filter(|&c| logits[[bi, c]] > own).count();
                if rank < k {
                    correct += 1;
                }
            }
            correct as f64 / n.max(1) as f64
        })
        .collect()
}

/// Scalar report for one search epoch, handed to the reporting
/// callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub loss: f64,
    pub top1: f64,
    pub top5: f64,
    pub lr: f64,
    pub drop_prob: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_meter() {
        let mut meter = AverageMeter::new();
        meter.update(1.0, 2);
        meter.update(4.0, 1);
        assert!((meter.avg() - 2.0).abs() < 1e-12);
        assert_eq!(meter.count(), 3);
    }

    #[test]
    fn test_accuracy_top1_and_top2() {
        let logits = Array2::from_shape_vec(
            (2, 3),
            vec![
                0.1, 0.7, 0.2, // predicts class 1
                0.5, 0.3, 0.2, // predicts class 0
            ],
        )
        .unwrap();
        let acc = accuracy(&logits, &[1, 1], &[1, 2]);
        assert!((acc[0] - 0.5).abs() < 1e-12);
        assert!((acc[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_accuracy_caps_k_at_class_count() {
        let logits = Array2::from_shape_vec((1, 2), vec![0.9, 0.1]).unwrap();
        let acc = accuracy(&logits, &[0], &[5]);
        assert!((acc[0] - 1.0).abs() < 1e-12);
    }
}
