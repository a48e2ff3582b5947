//! DropPath regularization
//!
//! Stochastically zeroes edge outputs during training to discourage
//! over-reliance on any single path. Applied only to edges whose
//! strongest operation allows it, and never during evaluation or
//! finalization.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};

/// How the drop probability evolves across the training run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum DropPathSchedule {
    Disabled,
    /// Constant probability.
    Fixed { p: f64 },
    /// Ramps from 0 to `max_p` linearly over the epochs.
    Linear { max_p: f64 },
}

impl DropPathSchedule {
    pub fn prob(&self, epoch: usize, total_epochs: usize) -> f64 {
        match *self {
            DropPathSchedule::Disabled => 0.0,
            DropPathSchedule::Fixed { p } => p,
            DropPathSchedule::Linear { max_p } => {
                if total_epochs <= 1 {
                    max_p
                } else {
                    max_p * epoch as f64 / (total_epochs - 1) as f64
                }
            }
        }
    }
}

impl Default for DropPathSchedule {
    fn default() -> Self {
        DropPathSchedule::Disabled
    }
}

/// Per-step drop state: the current probability and the RNG drawing
/// keep/drop decisions. Carries no state across epochs beyond what the
/// schedule derives from the epoch index.
#[derive(Debug, Clone)]
pub struct DropPath {
    p: f64,
    rng: Xoshiro256PlusPlus,
}

impl DropPath {
    pub fn new(p: f64, seed: u64) -> Self {
        Self {
            p,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    pub fn prob(&self) -> f64 {
        self.p
    }

    /// Draw one keep/drop decision. `None` means the edge output is
    /// zeroed; `Some(scale)` means it is kept and rescaled so the
    /// expected contribution is unchanged.
    pub fn sample(&mut self) -> Option<f64> {
        if self.p <= 0.0 {
            return Some(1.0);
        }
        if self.p >= 1.0 || self.rng.gen::<f64>() < self.p {
            return None;
        }
        Some(1.0 / (1.0 - self.p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_schedule_ramps() {
        let sched = DropPathSchedule::Linear { max_p: 0.3 };
        assert_eq!(sched.prob(0, 11), 0.0);
        assert!((sched.prob(10, 11) - 0.3).abs() < 1e-12);
        assert!(sched.prob(5, 11) > 0.0 && sched.prob(5, 11) < 0.3);
    }

    #[test]
    fn test_sample_extremes() {
        let mut never = DropPath::new(0.0, 1);
        assert_eq!(never.sample(), Some(1.0));

        let mut always = DropPath::new(1.0, 1);
        for _ in 0..100 {
            assert_eq!(always.sample(), None);
        }
    }

    #[test]
    fn test_kept_paths_are_rescaled() {
        let mut drop = DropPath::new(0.5, 42);
        let mut saw_kept = false;
        for _ in 0..200 {
            if let Some(scale) = drop.sample() {
                assert!((scale - 2.0).abs() < 1e-12);
                saw_kept = true;
            }
        }
        assert!(saw_kept);
    }
}
