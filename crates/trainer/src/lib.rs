//! WaveNet trainer
//!
//! This crate provides:
//! - **Model contracts**: [`Model`] and [`Optimizer`] over explicit [`StateDict`]s
//! - **Reference collaborators**: a mu-law next-sample classifier and the
//!   `adam`, `sgd` and `rmsprop` optimizers
//! - **Training loop**: step cadence, checkpointing, interrupt and failure
//!   handling with a final save and worker join
//! - **Summaries and profiling**: `events.jsonl` records and Chrome traces
//!
//! [`StateDict`]: train_core::StateDict
//!
//! # Example
//!
//! ```no_run
//! use trainer::{session, InterruptFlag};
//! use train_core::{RawArgs, RunConfiguration};
//!
//! # fn example() -> train_core::Result<()> {
//! let config = RunConfiguration::resolve(RawArgs::default(), chrono::Local::now())?;
//! let report = session::run(&config, InterruptFlag::new())?;
//! println!("saved steps: {:?}", report.saved_steps);
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod model;
pub mod optimizer;
pub mod profiling;
pub mod reference;
pub mod session;
pub mod signal;
pub mod summary;
pub mod training_loop;

pub use cli::TrainArgs;
pub use model::{Model, StepOutput, TrainingState};
pub use optimizer::{create_optimizer, Adam, Optimizer, RmsProp, Sgd};
pub use profiling::{ChromeTrace, StepTrace, TraceEvent};
pub use reference::{mu_law_encode, MuLawBigram, ReferenceModelConfig};
pub use session::{first_step, Checkpoints};
pub use signal::{install_handler, InterruptFlag};
pub use summary::{Histogram, SummaryRecord, SummaryWriter};
pub use training_loop::{LoopConfig, LoopState, TrainingLoop, TrainingReport};
