//! mosaic-nas - Differentiable neural architecture search engine
//!
//! Jointly learns continuous architecture weights that rank candidate
//! operations on every graph edge and the ordinary parameters of those
//! operations, then collapses the weighted supernet into a discrete
//! trainable architecture.
//!
//! # Modules
//!
//! - [`ops`] - Operation catalog, layer kernels, operation bodies
//! - [`desc`] - Serializable DAG model descriptions
//! - [`supernet`] - Live weighted-mixture graph, finalize, DropPath
//! - [`search`] - Bilevel optimizer, search engine, incremental growth
//! - [`metrics`] - Running averages and top-k accuracy
//! - [`data`] - Batch source interface and cross-entropy loss
//! - [`checkpoint`] - Atomic checkpoint save/load

// Core error handling
pub mod error;

// Numerics
pub mod tensor;

// Architecture state and operations
pub mod desc;
pub mod ops;

// Live graph
pub mod supernet;

// Search
pub mod search;

// Support
pub mod checkpoint;
pub mod data;
pub mod metrics;

pub use error::{MosaicError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, CheckpointFormat};
    pub use crate::data::{Batch, BatchSource, CrossEntropy, InMemoryBatches};
    pub use crate::desc::{CellDesc, ConvMacroParams, EdgeDesc, ModelDesc, NodeDesc, OpDesc};
    pub use crate::error::{MosaicError, Result};
    pub use crate::metrics::{accuracy, AverageMeter, EpochMetrics};
    pub use crate::ops::{Op, OpCatalog};
    pub use crate::search::{
        BilevelConfig, BilevelOptimizer, GrowthConfig, GrowthSearch, SearchConfig, SearchEngine,
        SearchOutcome,
    };
    pub use crate::supernet::{DropPath, DropPathSchedule, Supernet};
    pub use crate::tensor::Tensor;
}
