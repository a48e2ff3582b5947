//! Weighted mixture of candidate operations on an edge

use ndarray::{Array1, ArrayD, Ix1};
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::ops::{Op, OpCache};
use crate::tensor::{dot_all, softmax_1d, Param, Tensor};

/// Scale of the random alpha initialization noise.
const ALPHA_INIT_SCALE: f64 = 1e-3;

/// A searchable edge operation: candidates weighted by the softmax of a
/// learned alpha vector, giving a convex combination of their outputs.
#[derive(Debug, Clone)]
pub struct MixedOp {
    ops: Vec<Op>,
    alpha: Param,
}

/// Forward intermediates of a `MixedOp`.
#[derive(Debug, Clone)]
pub struct MixedCache {
    op_caches: Vec<OpCache>,
    outputs: Vec<Tensor>,
    probs: Array1<f64>,
}

impl MixedOp {
    /// Build a mixture. `init` seeds the alpha vector; absent, alphas
    /// start as small noise so no candidate is favored.
    pub fn new(ops: Vec<Op>, init: Option<&[f64]>, rng: &mut Xoshiro256PlusPlus) -> Self {
        let n = ops.len();
        let values: Vec<f64> = match init {
            Some(init) => init.to_vec(),
            None => (0..n)
                .map(|_| (rng.gen::<f64>() - 0.5) * ALPHA_INIT_SCALE)
                .collect(),
        };
        let alpha = Param::new(ArrayD::from_shape_vec(ndarray::IxDyn(&[n]), values).expect("alpha shape"));
        Self { ops, alpha }
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn alpha(&self) -> &Param {
        &self.alpha
    }

    pub fn alpha_mut(&mut self) -> &mut Param {
        &mut self.alpha
    }

    /// Softmax-normalized candidate weights.
    pub fn probs(&self) -> Array1<f64> {
        let view = self
            .alpha
            .value()
            .view()
            .into_dimensionality::<Ix1>()
            .expect("alpha is 1-d");
        softmax_1d(&view.to_owned())
    }

    /// Index of the strongest candidate; ties resolve to the lowest
    /// index (candidate registration order).
    pub fn best_index(&self) -> usize {
        let mut best = 0;
        let alpha = self.alpha.value();
        for i in 1..self.ops.len() {
            if alpha[[i]] > alpha[[best]] {
                best = i;
            }
        }
        best
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        let probs = self.probs();
        let mut out: Option<Tensor> = None;
        for (op, &p) in self.ops.iter().zip(probs.iter()) {
            let y = op.forward(x) * p;
            out = Some(match out {
                Some(acc) => acc + y,
                None => y,
            });
        }
        out.expect("edge candidate list is non-empty")
    }

    pub fn forward_cached(&self, x: &Tensor) -> (Tensor, MixedCache) {
        let probs = self.probs();
        let mut op_caches = Vec::with_capacity(self.ops.len());
        let mut outputs = Vec::with_capacity(self.ops.len());
        let mut out: Option<Tensor> = None;
        for (op, &p) in self.ops.iter().zip(probs.iter()) {
            let (y, cache) = op.forward_cached(x);
            let weighted = &y * p;
            out = Some(match out {
                Some(acc) => acc + &weighted,
                None => weighted,
            });
            op_caches.push(cache);
            outputs.push(y);
        }
        (
            out.expect("edge candidate list is non-empty"),
            MixedCache {
                op_caches,
                outputs,
                probs,
            },
        )
    }

    /// Backward pass: accumulates the alpha gradient (softmax chain
    /// rule) and each candidate's weight gradients; returns the input
    /// gradient.
    pub fn backward(&mut self, cache: &MixedCache, gy: &Tensor) -> Tensor {
        let probs = &cache.probs;
        let scores: Vec<f64> = cache.outputs.iter().map(|y| dot_all(gy, y)).collect();
        let weighted_score: f64 = probs.iter().zip(scores.iter()).map(|(p, s)| p * s).sum();

        let mut galpha = ArrayD::zeros(self.alpha.value().raw_dim());
        for (j, (&p, &s)) in probs.iter().zip(scores.iter()).enumerate() {
            galpha[[j]] = p * (s - weighted_score);
        }
        self.alpha.accumulate(&galpha);

        let mut gx: Option<Tensor> = None;
        for ((op, cache), &p) in self.ops.iter_mut().zip(cache.op_caches.iter()).zip(probs.iter()) {
            let g = op.backward(cache, &(gy * p));
            gx = Some(match gx {
                Some(acc) => acc + g,
                None => g,
            });
        }
        gx.expect("edge candidate list is non-empty")
    }

    pub fn visit_weights(&self, f: &mut dyn FnMut(&Param)) {
        for op in &self.ops {
            op.visit_weights(f);
        }
    }

    pub fn visit_weights_mut(&mut self, f: &mut dyn FnMut(&mut Param)) {
        for op in &mut self.ops {
            op.visit_weights_mut(f);
        }
    }
}
