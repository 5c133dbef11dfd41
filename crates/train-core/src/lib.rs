//! Train Core - Foundation for the WaveNet training runtime
//!
//! Provides core types, error handling, run configuration resolution and the
//! async runtime used for checkpoint I/O.

pub mod config;
pub mod error;
pub mod params;
pub mod runtime;
pub mod types;

pub use config::{
    ConditioningSpec, Directories, GlobalConditioning, LocalConditioning, OptimizerKind,
    PipelineSettings, RawArgs, RunConfiguration,
};
pub use error::{ConfigurationError, Error, Result};
pub use params::{calculate_receptive_field, WaveNetParams};
pub use runtime::{RuntimeManager, RuntimeManagerBuilder};
pub use types::*;
