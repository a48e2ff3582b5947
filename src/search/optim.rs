//! Optimizers over the supernet parameter partitions
//!
//! `Sgd` trains ordinary weights on the training loss; `Adam` trains
//! architecture alphas on the validation loss. State buffers align with
//! the deterministic visit order of the partition they own and can be
//! snapshotted for checkpoints.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::supernet::Supernet;

/// SGD with momentum, L2 weight decay and global-norm gradient clipping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdConfig {
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub grad_clip: Option<f64>,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.025,
            momentum: 0.9,
            weight_decay: 3e-4,
            grad_clip: Some(5.0),
        }
    }
}

/// Serializable momentum state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SgdState {
    pub velocity: Vec<ArrayD<f64>>,
}

#[derive(Debug, Clone)]
pub struct Sgd {
    config: SgdConfig,
    velocity: Vec<ArrayD<f64>>,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            velocity: Vec::new(),
        }
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    pub fn lr(&self) -> f64 {
        self.config.lr
    }

    pub fn set_lr(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    /// Momentum buffers in weight visit order; empty before the first
    /// step (treated as zeros by readers).
    pub fn momentum_buffers(&self) -> &[ArrayD<f64>] {
        &self.velocity
    }

    /// Apply one update to the weight partition from its accumulated
    /// gradients.
    pub fn step(&mut self, model: &mut Supernet) {
        if self.velocity.is_empty() {
            let velocity = &mut self.velocity;
            model.visit_weights(&mut |p| velocity.push(ArrayD::zeros(p.value().raw_dim())));
        }

        let clip_scale = match self.config.grad_clip {
            Some(max_norm) => {
                let mut sq = 0.0;
                model.visit_weights(&mut |p| sq += p.grad().iter().map(|g| g * g).sum::<f64>());
                let norm = sq.sqrt();
                if norm > max_norm {
                    max_norm / norm
                } else {
                    1.0
                }
            }
            None => 1.0,
        };

        let (lr, momentum, wd) = (self.config.lr, self.config.momentum, self.config.weight_decay);
        let velocity = &mut self.velocity;
        let mut i = 0;
        model.visit_weights_mut(&mut |p| {
            let mut g = p.grad() * clip_scale;
            g += &(p.value() * wd);
            velocity[i] = &velocity[i] * momentum + &g;
            *p.value_mut() -= &(&velocity[i] * lr);
            i += 1;
        });
    }

    pub fn state(&self) -> SgdState {
        SgdState {
            velocity: self.velocity.clone(),
        }
    }

    pub fn load_state(&mut self, state: SgdState) {
        self.velocity = state.velocity;
    }
}

/// Adam configuration for the alpha partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 3e-4,
            beta1: 0.5,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-3,
        }
    }
}

/// Serializable Adam moment state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdamState {
    pub m: Vec<ArrayD<f64>>,
    pub v: Vec<ArrayD<f64>>,
    pub t: u64,
}

#[derive(Debug, Clone)]
pub struct Adam {
    config: AdamConfig,
    m: Vec<ArrayD<f64>>,
    v: Vec<ArrayD<f64>>,
    t: u64,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            m: Vec::new(),
            v: Vec::new(),
            t: 0,
        }
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    /// Apply one update to the alpha partition from its accumulated
    /// gradients.
    pub fn step(&mut self, model: &mut Supernet) {
        if self.m.is_empty() {
            let (m, v) = (&mut self.m, &mut self.v);
            model.visit_alphas(&mut |p| {
                m.push(ArrayD::zeros(p.value().raw_dim()));
                v.push(ArrayD::zeros(p.value().raw_dim()));
            });
        }
        self.t += 1;

        let cfg = self.config.clone();
        let bias1 = 1.0 - cfg.beta1.powi(self.t as i32);
        let bias2 = 1.0 - cfg.beta2.powi(self.t as i32);
        let (m, v) = (&mut self.m, &mut self.v);
        let mut i = 0;
        model.visit_alphas_mut(&mut |p| {
            let mut g = p.grad().clone();
            g += &(p.value() * cfg.weight_decay);
            m[i] = &m[i] * cfg.beta1 + &(&g * (1.0 - cfg.beta1));
            v[i] = &v[i] * cfg.beta2 + &(&g.mapv(|x| x * x) * (1.0 - cfg.beta2));
            let m_hat = &m[i] / bias1;
            let v_hat = &v[i] / bias2;
            let update = m_hat / (v_hat.mapv(f64::sqrt) + cfg.eps) * cfg.lr;
            *p.value_mut() -= &update;
            i += 1;
        });
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            m: self.m.clone(),
            v: self.v.clone(),
            t: self.t,
        }
    }

    pub fn load_state(&mut self, state: AdamState) {
        self.m = state.m;
        self.v = state.v;
        self.t = state.t;
    }
}
