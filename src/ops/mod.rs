//! Operation catalog and primitives
//!
//! Layer kernels with explicit forward/backward passes, the operation
//! bodies composed from them, and the registry that instantiates
//! operations by name.

mod catalog;
mod layers;
mod primitives;

pub use catalog::{OpCatalog, OpFactory};
pub use layers::{conv_out, Conv2d, Layer, Linear, Pool2d, PoolKind, Stack};
pub use primitives::{FactorizedReduce, Op, OpBody, OpCache};
