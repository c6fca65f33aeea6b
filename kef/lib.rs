#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod data;
pub mod estimator;
pub mod kernel;
pub mod memory;
pub mod system;
pub mod types;

#[cfg(test)]
pub mod test_fixtures;

pub use config::{ConfigError, EstimatorConfig};
pub use data::{DataError, load_observations};
pub use estimator::{
    EstimatorError, KernelExpFamily, MatrixSelector, QuerySet, StateError, ValidationError,
    VectorSelector,
};
pub use kernel::GaussianKernel;
pub use memory::{DEFAULT_MEMORY_LIMIT_GIB, MemoryBudget, ResourceLimitError};
pub use system::{LinearSystem, SystemTerms};
pub use types::AlphaBeta;
