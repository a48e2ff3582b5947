//! Search engine: the outer loop driving architecture search
//!
//! Alternates, per training batch, one bilevel alpha update and one
//! clipped SGD weight update, strictly in that order. Owns the cosine
//! learning-rate schedule, DropPath scheduling, per-epoch metrics
//! reporting and the per-epoch finalize snapshot that tracks the best
//! description seen so far.

use tracing::{debug, info};

use crate::data::{Batch, BatchSource, CrossEntropy};
use crate::desc::ModelDesc;
use crate::error::{MosaicError, Result};
use crate::metrics::{accuracy, AverageMeter, EpochMetrics};
use crate::search::bilevel::{BilevelConfig, BilevelOptimizer};
use crate::search::optim::{AdamState, Sgd, SgdConfig, SgdState};
use crate::supernet::{DropPath, DropPathSchedule, Supernet};

/// Configuration of a search run.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub epochs: usize,
    /// Initial weight learning rate; annealed to `w_lr_min` by a cosine
    /// schedule.
    pub w_lr: f64,
    pub w_lr_min: f64,
    pub w_momentum: f64,
    pub w_weight_decay: f64,
    pub grad_clip: Option<f64>,
    pub bilevel: BilevelConfig,
    /// Edge budget applied by the per-epoch finalize snapshot.
    pub max_edges_per_node: usize,
    pub droppath: DropPathSchedule,
    pub label_smoothing: f64,
    /// Step-level debug log frequency; 0 disables.
    pub report_every: usize,
    pub seed: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            w_lr: 0.025,
            w_lr_min: 1e-3,
            w_momentum: 0.9,
            w_weight_decay: 3e-4,
            grad_clip: Some(5.0),
            bilevel: BilevelConfig::default(),
            max_edges_per_node: 2,
            droppath: DropPathSchedule::Disabled,
            label_smoothing: 0.0,
            report_every: 50,
            seed: 0,
        }
    }
}

/// Result of a completed search run.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub best: ModelDesc,
    pub best_top1: f64,
    pub best_epoch: usize,
    pub history: Vec<EpochMetrics>,
}

/// Drives the search over a supernet.
pub struct SearchEngine {
    config: SearchConfig,
    w_optim: Sgd,
    bilevel: BilevelOptimizer,
}

impl SearchEngine {
    pub fn new(config: SearchConfig) -> Self {
        let w_optim = Sgd::new(SgdConfig {
            lr: config.w_lr,
            momentum: config.w_momentum,
            weight_decay: config.w_weight_decay,
            grad_clip: config.grad_clip,
        });
        let bilevel = BilevelOptimizer::new(config.bilevel.clone());
        Self {
            config,
            w_optim,
            bilevel,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Optimizer state for checkpointing.
    pub fn optimizer_state(&self) -> (SgdState, AdamState) {
        (self.w_optim.state(), self.bilevel.alpha_state())
    }

    pub fn load_optimizer_state(&mut self, w: SgdState, alpha: AdamState) {
        self.w_optim.load_state(w);
        self.bilevel.load_alpha_state(alpha);
    }

    /// Run the search. `report` receives one `EpochMetrics` per epoch;
    /// logging and visualization are the caller's concern.
    pub fn run(
        &mut self,
        model: &mut Supernet,
        train: &mut dyn BatchSource,
        val: &mut dyn BatchSource,
        report: &mut dyn FnMut(&EpochMetrics),
    ) -> Result<SearchOutcome> {
        if self.config.epochs == 0 {
            return Err(MosaicError::ConfigError("epochs must be positive".to_string()));
        }
        let loss = CrossEntropy::with_smoothing(self.config.label_smoothing);
        let mut history = Vec::with_capacity(self.config.epochs);
        let mut best: Option<ModelDesc> = None;
        let mut best_top1 = f64::NEG_INFINITY;
        let mut best_epoch = 0;

        for epoch in 0..self.config.epochs {
            let lr = self.cosine_lr(epoch);
            self.w_optim.set_lr(lr);
            let drop_prob = self.config.droppath.prob(epoch, self.config.epochs);
            let mut drop = if drop_prob > 0.0 {
                Some(DropPath::new(
                    drop_prob,
                    self.config
                        .seed
                        .wrapping_add((epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)),
                ))
            } else {
                None
            };

            let mut loss_meter = AverageMeter::new();
            let mut top1_meter = AverageMeter::new();
            let mut top5_meter = AverageMeter::new();

            train.reset();
            let mut step = 0usize;
            while let Some(batch) = train.next_batch() {
                let val_batch = next_val_batch(val)?;

                // alpha update first, then the weight update, strictly
                // ordered within the step
                self.bilevel.step(
                    model,
                    &loss,
                    &batch.x,
                    &batch.y,
                    &val_batch.x,
                    &val_batch.y,
                    lr,
                    &self.w_optim,
                );

                model.zero_grads();
                let stats = model.backward_pass(&batch.x, &batch.y, &loss, drop.as_mut());
                self.w_optim.step(model);

                let n = batch.y.len();
                let acc = accuracy(&stats.logits, &batch.y, &[1, 5]);
                loss_meter.update(stats.loss, n);
                top1_meter.update(acc[0], n);
                top5_meter.update(acc[1], n);

                if self.config.report_every > 0 && step % self.config.report_every == 0 {
                    debug!(
                        epoch,
                        step,
                        loss = stats.loss,
                        top1 = acc[0],
                        "search step"
                    );
                }
                step += 1;
            }
            if step == 0 {
                return Err(MosaicError::ExhaustedIterator(
                    "training source produced no batches".to_string(),
                ));
            }

            let metrics = EpochMetrics {
                epoch,
                loss: loss_meter.avg(),
                top1: top1_meter.avg(),
                top5: top5_meter.avg(),
                lr,
                drop_prob,
            };
            info!(
                epoch,
                loss = metrics.loss,
                top1 = metrics.top1,
                top5 = metrics.top5,
                lr,
                "epoch complete"
            );
            report(&metrics);

            if best.is_none() || metrics.top1 > best_top1 {
                best = Some(model.finalize(self.config.max_edges_per_node));
                best_top1 = metrics.top1;
                best_epoch = epoch;
            }
            history.push(metrics);
        }

        Ok(SearchOutcome {
            best: best.expect("at least one epoch ran"),
            best_top1,
            best_epoch,
            history,
        })
    }

    fn cosine_lr(&self, epoch: usize) -> f64 {
        let (hi, lo) = (self.config.w_lr, self.config.w_lr_min);
        let t = epoch as f64 / self.config.epochs as f64;
        lo + 0.5 * (hi - lo) * (1.0 + (std::f64::consts::PI * t).cos())
    }
}

/// Pull the next validation batch, re-initializing the source once if
/// it is exhausted. An empty source is an error.
fn next_val_batch(val: &mut dyn BatchSource) -> Result<Batch> {
    if let Some(batch) = val.next_batch() {
        return Ok(batch);
    }
    val.reset();
    val.next_batch()
        .ok_or_else(|| MosaicError::ExhaustedIterator("validation source is empty".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InMemoryBatches;
    use crate::desc::{CellDesc, ConvMacroParams, EdgeDesc, OpDesc};
    use crate::ops::OpCatalog;

    fn tiny_desc() -> ModelDesc {
        let ch = ConvMacroParams::new(4, 4);
        let mut cell = CellDesc::new(false, 4, 4);
        cell.add_node(vec![EdgeDesc::new(
            0,
            &["identity", "none", "sep_conv_3x3"],
            ch,
            1,
        )]);
        ModelDesc::new(
            4,
            2,
            OpDesc::new("stem", ConvMacroParams::new(4, 4), 1),
            vec![cell],
            OpDesc::new("pool_linear", ConvMacroParams::new(4, 2), 1),
        )
    }

    fn engine(epochs: usize) -> SearchEngine {
        SearchEngine::new(SearchConfig {
            epochs,
            report_every: 0,
            ..Default::default()
        })
    }

    #[test]
    fn test_run_produces_discrete_best_desc() {
        let catalog = OpCatalog::with_defaults();
        let mut model = Supernet::new(&tiny_desc(), &catalog, 1).unwrap();
        let mut train = InMemoryBatches::synthetic(3, 4, 4, 4, 4, 2, 11);
        let mut val = InMemoryBatches::synthetic(2, 4, 4, 4, 4, 2, 12);

        let mut reports = 0;
        let outcome = engine(2)
            .run(&mut model, &mut train, &mut val, &mut |_| reports += 1)
            .unwrap();

        assert_eq!(reports, 2);
        assert_eq!(outcome.history.len(), 2);
        for cell in &outcome.best.cells {
            for node in &cell.nodes {
                for edge in &node.edges {
                    assert!(edge.discrete);
                    assert_eq!(edge.candidates.len(), 1);
                }
            }
        }
    }

    #[test]
    fn test_validation_source_reinitialized_on_exhaustion() {
        let catalog = OpCatalog::with_defaults();
        let mut model = Supernet::new(&tiny_desc(), &catalog, 1).unwrap();
        // more train batches than val batches forces mid-epoch re-init
        let mut train = InMemoryBatches::synthetic(4, 4, 4, 4, 4, 2, 13);
        let mut val = InMemoryBatches::synthetic(1, 4, 4, 4, 4, 2, 14);

        let outcome = engine(1).run(&mut model, &mut train, &mut val, &mut |_| {});
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_empty_validation_source_is_an_error() {
        let catalog = OpCatalog::with_defaults();
        let mut model = Supernet::new(&tiny_desc(), &catalog, 1).unwrap();
        let mut train = InMemoryBatches::synthetic(2, 4, 4, 4, 4, 2, 15);
        let mut val = InMemoryBatches::new(Vec::new());

        let outcome = engine(1).run(&mut model, &mut train, &mut val, &mut |_| {});
        assert!(matches!(outcome, Err(MosaicError::ExhaustedIterator(_))));
    }

    #[test]
    fn test_zero_epochs_rejected() {
        let catalog = OpCatalog::with_defaults();
        let mut model = Supernet::new(&tiny_desc(), &catalog, 1).unwrap();
        let mut train = InMemoryBatches::synthetic(1, 4, 4, 4, 4, 2, 16);
        let mut val = InMemoryBatches::synthetic(1, 4, 4, 4, 4, 2, 17);

        let outcome = engine(0).run(&mut model, &mut train, &mut val, &mut |_| {});
        assert!(matches!(outcome, Err(MosaicError::ConfigError(_))));
    }

    #[test]
    fn test_cosine_lr_anneals_between_bounds() {
        let e = engine(10);
        let first = e.cosine_lr(0);
        let last = e.cosine_lr(9);
        assert!((first - e.config.w_lr).abs() < 1e-12);
        assert!(last > e.config.w_lr_min && last < first);
    }
}
