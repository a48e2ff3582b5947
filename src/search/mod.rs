//! Architecture search
//!
//! The bilevel alpha optimizer, the weight/alpha optimizers it drives,
//! the outer search engine and the incremental-growth loop.

mod bilevel;
mod engine;
mod growth;
mod optim;

pub use bilevel::{BilevelConfig, BilevelOptimizer};
pub use engine::{SearchConfig, SearchEngine, SearchOutcome};
pub use growth::{CandidateScore, GrowthConfig, GrowthSearch, GrowthStep};
pub use optim::{Adam, AdamConfig, AdamState, Sgd, SgdConfig, SgdState};
