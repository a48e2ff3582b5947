//! Supernet: the live trainable graph
//!
//! Builds a weighted-mixture graph from a model description, exposes
//! the disjoint weight/alpha parameter partitions, collapses the
//! mixture into a discrete description (finalize), and applies
//! DropPath regularization during training.

mod droppath;
mod mixed;
mod model;

pub use droppath::{DropPath, DropPathSchedule};
pub use mixed::{MixedCache, MixedOp};
pub use model::{StepStats, Supernet};
