//! Tensor aliases and trainable parameter container
//!
//! All math runs on `f64` ndarray arrays. Feature maps are NCHW
//! (batch, channels, height, width).

use ndarray::{Array1, Array2, ArrayD, ArrayView4, Ix4};

/// A batch of feature maps: (batch, channels, height, width)
pub type Tensor = ndarray::Array4<f64>;

/// A single trainable parameter tensor with its gradient accumulator.
///
/// Gradients are accumulated by backward passes and consumed by an
/// optimizer; `zero_grad` resets the accumulator between steps.
#[derive(Debug, Clone)]
pub struct Param {
    value: ArrayD<f64>,
    grad: ArrayD<f64>,
}

impl Param {
    pub fn new(value: ArrayD<f64>) -> Self {
        let grad = ArrayD::zeros(value.raw_dim());
        Self { value, grad }
    }

    pub fn value(&self) -> &ArrayD<f64> {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.value
    }

    pub fn grad(&self) -> &ArrayD<f64> {
        &self.grad
    }

    pub fn grad_mut(&mut self) -> &mut ArrayD<f64> {
        &mut self.grad
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    /// Add `delta` into the gradient accumulator.
    pub fn accumulate(&mut self, delta: &ArrayD<f64>) {
        self.grad += delta;
    }

    /// View the value as a 4-d conv weight (ch_out, ch_in/groups, kh, kw).
    pub fn view4(&self) -> ArrayView4<'_, f64> {
        self.value
            .view()
            .into_dimensionality::<Ix4>()
            .expect("conv weight is 4-d")
    }
}

/// Numerically stable softmax of a 1-d vector.
pub fn softmax_1d(x: &Array1<f64>) -> Array1<f64> {
    let max = x.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exp = x.mapv(|v| (v - max).exp());
    let sum = exp.sum();
    exp / sum
}

/// Row-wise softmax of a 2-d array (batch of logit vectors).
pub fn softmax_rows(x: &Array2<f64>) -> Array2<f64> {
    let mut result = x.clone();
    for mut row in result.rows_mut() {
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exp_sum: f64 = row.iter().map(|&v| (v - max).exp()).sum();
        for v in row.iter_mut() {
            *v = (*v - max).exp() / exp_sum;
        }
    }
    result
}

/// Sum of elementwise products over two equally shaped tensors.
pub fn dot_all(a: &Tensor, b: &Tensor) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_param_grad_accumulation() {
        let mut p = Param::new(ArrayD::zeros(ndarray::IxDyn(&[2, 2])));
        let delta = ArrayD::from_elem(ndarray::IxDyn(&[2, 2]), 1.5);
        p.accumulate(&delta);
        p.accumulate(&delta);
        assert_eq!(p.grad()[[0, 0]], 3.0);
        p.zero_grad();
        assert_eq!(p.grad()[[1, 1]], 0.0);
    }

    #[test]
    fn test_softmax_1d_sums_to_one() {
        let x = arr1(&[1.0, 2.0, 3.0]);
        let p = softmax_1d(&x);
        assert!((p.sum() - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_softmax_1d_stable_for_large_inputs() {
        let x = arr1(&[1000.0, 1000.0]);
        let p = softmax_1d(&x);
        assert!((p[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_softmax_rows() {
        let x = Array2::from_shape_vec((2, 3), vec![1.0, 1.0, 1.0, 0.0, 0.0, 10.0]).unwrap();
        let p = softmax_rows(&x);
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
        }
        assert!(p[[1, 2]] > 0.99);
    }
}
