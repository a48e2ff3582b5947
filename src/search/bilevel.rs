//! Bilevel architecture optimizer
//!
//! Updates architecture alphas to minimize validation loss as a
//! function of the weights that would result from one training step,
//! not the current weights. The effect of alphas on that virtual step
//! is approximated with a central finite difference, so only first
//! derivatives are ever computed.

use crate::data::CrossEntropy;
use crate::search::optim::{Adam, AdamConfig, AdamState, Sgd};
use crate::supernet::Supernet;
use crate::tensor::Tensor;

/// Knobs for the bilevel update.
#[derive(Debug, Clone)]
pub struct BilevelConfig {
    /// Momentum assumed for the virtual weight step; matches the weight
    /// optimizer's momentum.
    pub w_momentum: f64,
    /// Weight decay assumed for the virtual weight step.
    pub w_weight_decay: f64,
    /// Numerator of the finite-difference step; divided by the norm of
    /// the perturbation direction so the step stays well-scaled.
    pub eps_scale: f64,
    /// Skip the finite-difference correction (cheaper, less accurate).
    pub first_order: bool,
    /// Optimizer applied to the alpha partition.
    pub alpha: AdamConfig,
}

impl Default for BilevelConfig {
    fn default() -> Self {
        Self {
            w_momentum: 0.9,
            w_weight_decay: 3e-4,
            eps_scale: 1e-2,
            first_order: false,
            alpha: AdamConfig::default(),
        }
    }
}

/// The architecture-weight trainer.
pub struct BilevelOptimizer {
    config: BilevelConfig,
    alpha_optim: Adam,
}

impl BilevelOptimizer {
    pub fn new(config: BilevelConfig) -> Self {
        let alpha_optim = Adam::new(config.alpha.clone());
        Self {
            config,
            alpha_optim,
        }
    }

    pub fn config(&self) -> &BilevelConfig {
        &self.config
    }

    pub fn alpha_state(&self) -> AdamState {
        self.alpha_optim.state()
    }

    pub fn load_alpha_state(&mut self, state: AdamState) {
        self.alpha_optim.load_state(state);
    }

    /// One architecture-weight update.
    ///
    /// Ordinary weights are bit-identical before and after this call:
    /// the virtual step is computed on the live graph and fully rolled
    /// back. Only alpha values (and the alpha optimizer's moments)
    /// change. Returns the validation loss at the virtual weights.
    pub fn step(
        &mut self,
        model: &mut Supernet,
        loss: &CrossEntropy,
        x_train: &Tensor,
        y_train: &[usize],
        x_val: &Tensor,
        y_val: &[usize],
        w_lr: f64,
        w_optim: &Sgd,
    ) -> f64 {
        let backup = model.weights_snapshot();

        // 1. virtual one-step weight update, momentum included, never
        //    committed
        model.zero_grads();
        model.backward_pass(x_train, y_train, loss, None);
        let train_grads = model.weight_grads();
        let momenta = w_optim.momentum_buffers();
        let (momentum, wd) = (self.config.w_momentum, self.config.w_weight_decay);
        let mut i = 0;
        model.visit_weights_mut(&mut |p| {
            let mut v = train_grads[i].clone();
            v += &(p.value() * wd);
            if let Some(buf) = momenta.get(i) {
                v += &(buf * momentum);
            }
            *p.value_mut() -= &(&v * w_lr);
            i += 1;
        });

        // 2. validation gradient at the virtual weights
        model.zero_grads();
        let val_stats = model.backward_pass(x_val, y_val, loss, None);
        let mut dalpha = model.alpha_grads();
        let val_w_grads = model.weight_grads();

        // 3. central finite-difference correction for the chain-rule
        //    term through the virtual step
        if !self.config.first_order {
            let norm = val_w_grads
                .iter()
                .map(|g| g.iter().map(|v| v * v).sum::<f64>())
                .sum::<f64>()
                .sqrt();
            if norm > 0.0 {
                let eps = self.config.eps_scale / norm;

                let g_plus =
                    perturbed_alpha_grads(model, loss, x_train, y_train, &backup, &val_w_grads, eps);
                let g_minus =
                    perturbed_alpha_grads(model, loss, x_train, y_train, &backup, &val_w_grads, -eps);

                for ((da, gp), gm) in dalpha.iter_mut().zip(g_plus.iter()).zip(g_minus.iter()) {
                    let correction = (gp - gm) / (2.0 * eps);
                    *da -= &(correction * w_lr);
                }
            }
        }

        // 4. roll back and apply the alpha update
        model.restore_weights(&backup);
        model.zero_grads();
        model.set_alpha_grads(&dalpha);
        self.alpha_optim.step(model);

        val_stats.loss
    }

}

/// Alpha gradient of the training loss at `backup + eps * direction`.
fn perturbed_alpha_grads(
    model: &mut Supernet,
    loss: &CrossEntropy,
    x_train: &Tensor,
    y_train: &[usize],
    backup: &[ndarray::ArrayD<f64>],
    direction: &[ndarray::ArrayD<f64>],
    eps: f64,
) -> Vec<ndarray::ArrayD<f64>> {
    let mut i = 0;
    model.visit_weights_mut(&mut |p| {
        *p.value_mut() = &backup[i] + &(&direction[i] * eps);
        i += 1;
    });
    model.zero_grads();
    model.backward_pass(x_train, y_train, loss, None);
    model.alpha_grads()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desc::{CellDesc, ConvMacroParams, EdgeDesc, ModelDesc, OpDesc};
    use crate::ops::OpCatalog;
    use crate::search::optim::SgdConfig;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn model() -> Supernet {
        let ch = ConvMacroParams::new(4, 4);
        let mut cell = CellDesc::new(false, 4, 4);
        cell.add_node(vec![EdgeDesc::new(
            0,
            &["identity", "none", "sep_conv_3x3"],
            ch,
            1,
        )]);
        let desc = ModelDesc::new(
            3,
            2,
            OpDesc::new("stem", ConvMacroParams::new(3, 4), 1),
            vec![cell],
            OpDesc::new("pool_linear", ConvMacroParams::new(4, 2), 1),
        );
        Supernet::new(&desc, &OpCatalog::with_defaults(), 0).unwrap()
    }

    fn batches() -> (Tensor, Vec<usize>, Tensor, Vec<usize>) {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(31);
        let xt = Tensor::from_shape_fn((4, 3, 8, 8), |_| rng.gen::<f64>() - 0.5);
        let xv = Tensor::from_shape_fn((4, 3, 8, 8), |_| rng.gen::<f64>() - 0.5);
        (xt, vec![0, 1, 0, 1], xv, vec![1, 0, 1, 0])
    }

    #[test]
    fn test_step_rolls_back_weights_exactly() {
        let mut m = model();
        let (xt, yt, xv, yv) = batches();
        let loss = CrossEntropy::new();
        let w_optim = Sgd::new(SgdConfig::default());
        let mut bilevel = BilevelOptimizer::new(BilevelConfig::default());

        let weights_before = m.weights_snapshot();
        let alphas_before: Vec<_> = {
            let mut v = Vec::new();
            m.visit_alphas(&mut |p| v.push(p.value().clone()));
            v
        };

        let val_loss = bilevel.step(&mut m, &loss, &xt, &yt, &xv, &yv, 0.025, &w_optim);
        assert!(val_loss.is_finite());

        // weights bit-identical, alphas changed
        let weights_after = m.weights_snapshot();
        assert_eq!(weights_before, weights_after);

        let mut changed = false;
        let mut i = 0;
        m.visit_alphas(&mut |p| {
            if p.value() != &alphas_before[i] {
                changed = true;
            }
            i += 1;
        });
        assert!(changed, "alphas should move");
    }

    #[test]
    fn test_first_order_mode_also_rolls_back() {
        let mut m = model();
        let (xt, yt, xv, yv) = batches();
        let loss = CrossEntropy::new();
        let w_optim = Sgd::new(SgdConfig::default());
        let mut bilevel = BilevelOptimizer::new(BilevelConfig {
            first_order: true,
            ..Default::default()
        });

        let before = m.weights_snapshot();
        bilevel.step(&mut m, &loss, &xt, &yt, &xv, &yv, 0.025, &w_optim);
        assert_eq!(before, m.weights_snapshot());
    }

    #[test]
    fn test_repeated_steps_reproducible_with_frozen_weights() {
        let (xt, yt, xv, yv) = batches();
        let loss = CrossEntropy::new();
        let w_optim = Sgd::new(SgdConfig::default());

        let run = || {
            let mut m = model();
            let mut bilevel = BilevelOptimizer::new(BilevelConfig::default());
            for _ in 0..3 {
                bilevel.step(&mut m, &loss, &xt, &yt, &xv, &yv, 0.025, &w_optim);
            }
            let mut alphas = Vec::new();
            m.visit_alphas(&mut |p| alphas.push(p.value().clone()));
            alphas
        };

        assert_eq!(run(), run());
    }
}
