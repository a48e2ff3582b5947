//! Batch interface and loss
//!
//! Data pipelines are external collaborators; the search engine only
//! needs a batch-producing source and a loss function. A seeded
//! in-memory source is provided for tests and growth probes.

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::tensor::{softmax_rows, Tensor};

/// One mini-batch: inputs and class labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub x: Tensor,
    pub y: Vec<usize>,
}

/// A resettable mini-batch iterator.
///
/// When a source is exhausted mid-epoch it returns `None`; the outer
/// trainer is responsible for calling `reset` and retrying.
pub trait BatchSource {
    fn next_batch(&mut self) -> Option<Batch>;
    fn reset(&mut self);
    fn num_batches(&self) -> usize;
}

/// A fixed set of batches served in order.
#[derive(Debug, Clone)]
pub struct InMemoryBatches {
    batches: Vec<Batch>,
    cursor: usize,
}

impl InMemoryBatches {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches, cursor: 0 }
    }

    /// Synthetic labelled data: labels are the index of the strongest
    /// input channel, so architectures that preserve channel structure
    /// can fit it.
    pub fn synthetic(
        n_batches: usize,
        batch_size: usize,
        channels: usize,
        height: usize,
        width: usize,
        n_classes: usize,
        seed: u64,
    ) -> Self {
        assert!(n_classes <= channels, "labels are derived from channels");
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut batches = Vec::with_capacity(n_batches);
        for _ in 0..n_batches {
            let x = Tensor::from_shape_fn((batch_size, channels, height, width), |_| {
                rng.gen::<f64>() - 0.5
            });
            let y = (0..batch_size)
                .map(|bi| {
                    let mut best = 0;
                    let mut best_mean = f64::NEG_INFINITY;
                    for ci in 0..n_classes {
                        let mean = x
                            .index_axis(ndarray::Axis(0), bi)
                            .index_axis(ndarray::Axis(0), ci)
                            .mean()
                            .unwrap_or(0.0);
                        if mean > best_mean {
                            best_mean = mean;
                            best = ci;
                        }
                    }
                    best
                })
                .collect();
            batches.push(Batch { x, y });
        }
        Self::new(batches)
    }
}

impl BatchSource for InMemoryBatches {
    fn next_batch(&mut self) -> Option<Batch> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        batch
    }

    fn reset(&mut self) {
        self.cursor = 0;
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }
}

/// Softmax cross-entropy over class logits, with optional label
/// smoothing.
#[derive(Debug, Clone, Copy)]
pub struct CrossEntropy {
    label_smoothing: f64,
}

impl CrossEntropy {
    pub fn new() -> Self {
        Self {
            label_smoothing: 0.0,
        }
    }

    pub fn with_smoothing(label_smoothing: f64) -> Self {
        Self { label_smoothing }
    }

    pub fn loss(&self, logits: &Array2<f64>, y: &[usize]) -> f64 {
        let (n, k) = logits.dim();
        debug_assert_eq!(n, y.len());
        let probs = softmax_rows(logits);
        let mut total = 0.0;
        for (bi, &label) in y.iter().enumerate() {
            for ci in 0..k {
                let target = self.target(label, ci, k);
                if target > 0.0 {
                    total -= target * probs[[bi, ci]].max(1e-300).ln();
                }
            }
        }
        total / n as f64
    }

    /// Loss and its gradient with respect to the logits.
    pub fn loss_and_grad(&self, logits: &Array2<f64>, y: &[usize]) -> (f64, Array2<f64>) {
        let (n, k) = logits.dim();
        let probs = softmax_rows(logits);
        let mut grad = probs.clone();
        for (bi, &label) in y.iter().enumerate() {
            for ci in 0..k {
                grad[[bi, ci]] -= self.target(label, ci, k);
            }
        }
        grad /= n as f64;
        (self.loss(logits, y), grad)
    }

    fn target(&self, label: usize, class: usize, n_classes: usize) -> f64 {
        let smooth = self.label_smoothing / n_classes as f64;
        if class == label {
            1.0 - self.label_smoothing + smooth
        } else {
            smooth
        }
    }
}

impl Default for CrossEntropy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_labels_in_range() {
        let mut source = InMemoryBatches::synthetic(3, 4, 4, 4, 4, 3, 9);
        let mut count = 0;
        while let Some(batch) = source.next_batch() {
            assert!(batch.y.iter().all(|&y| y < 3));
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(source.next_batch().is_none());
        source.reset();
        assert!(source.next_batch().is_some());
    }

    #[test]
    fn test_cross_entropy_perfect_prediction() {
        let loss = CrossEntropy::new();
        let logits = Array2::from_shape_vec((1, 2), vec![100.0, -100.0]).unwrap();
        assert!(loss.loss(&logits, &[0]) < 1e-6);
        assert!(loss.loss(&logits, &[1]) > 10.0);
    }

    #[test]
    fn test_cross_entropy_gradient_matches_finite_difference() {
        let loss = CrossEntropy::with_smoothing(0.1);
        let logits = Array2::from_shape_vec((2, 3), vec![0.5, -0.2, 0.1, 1.0, 0.0, -1.0]).unwrap();
        let y = [2usize, 0];
        let (_, grad) = loss.loss_and_grad(&logits, &y);

        let eps = 1e-6;
        for idx in [[0, 0], [1, 2], [0, 2]] {
            let mut plus = logits.clone();
            plus[idx] += eps;
            let mut minus = logits.clone();
            minus[idx] -= eps;
            let fd = (loss.loss(&plus, &y) - loss.loss(&minus, &y)) / (2.0 * eps);
            assert!((grad[idx] - fd).abs() < 1e-8, "{} vs {}", grad[idx], fd);
        }
    }

    #[test]
    fn test_smoothed_targets_sum_to_one() {
        let loss = CrossEntropy::with_smoothing(0.2);
        let total: f64 = (0..5).map(|c| loss.target(1, c, 5)).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }
}
