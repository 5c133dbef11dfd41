//! Training loop
//!
//! Drives steps from the restored step up to `num_steps`, checkpointing on
//! the configured cadence. Interrupts are observed between steps. Whatever
//! ends the run, the last completed step is saved if it is not already and
//! the pipeline workers are stopped and joined.

use audio_pipeline::PipelineCoordinator;
use checkpoint::CheckpointManager;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};
use train_core::{CheckpointMetadata, Error, Result, RunConfiguration, RuntimeManager, StateDict, Step};

use crate::model::{Model, TrainingState};
use crate::optimizer::Optimizer;
use crate::profiling::StepTrace;
use crate::signal::InterruptFlag;
use crate::summary::SummaryWriter;

/// Loop cadence settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    pub num_steps: Step,
    pub checkpoint_every: Step,
    pub store_metadata: bool,
    pub metadata_every: Step,
    pub histograms: bool,
}

impl LoopConfig {
    pub fn from_run(config: &RunConfiguration) -> Self {
        Self {
            num_steps: config.num_steps,
            checkpoint_every: config.checkpoint_every,
            store_metadata: config.store_metadata,
            metadata_every: config.metadata_every,
            histograms: config.histograms,
        }
    }
}

/// Loop states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Checkpointing,
    Interrupted,
    Terminated,
}

/// Outcome of a run that ended without error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingReport {
    /// First step scheduled for this run
    pub start_step: Step,

    /// Last step that completed, `None` if no step ran
    pub last_step: Option<Step>,

    /// Every step saved during the run, in order
    pub saved_steps: Vec<Step>,

    pub interrupted: bool,

    /// Path of the newest checkpoint written by this run
    pub last_checkpoint: Option<PathBuf>,
}

/// The step loop and its terminal handling
pub struct TrainingLoop<'a> {
    config: LoopConfig,
    runtime: &'a RuntimeManager,
    checkpoints: &'a CheckpointManager,
    summary: &'a SummaryWriter,
    interrupt: InterruptFlag,
    state: LoopState,
    last_completed: Option<Step>,
    last_saved: Option<Step>,
    saved_steps: Vec<Step>,
    last_checkpoint: Option<PathBuf>,
}

impl<'a> TrainingLoop<'a> {
    pub fn new(
        config: LoopConfig,
        runtime: &'a RuntimeManager,
        checkpoints: &'a CheckpointManager,
        summary: &'a SummaryWriter,
        interrupt: InterruptFlag,
    ) -> Self {
        Self {
            config,
            runtime,
            checkpoints,
            summary,
            interrupt,
            state: LoopState::Running,
            last_completed: None,
            last_saved: None,
            saved_steps: Vec::new(),
            last_checkpoint: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Train from `start_step` and consume `pipeline`.
    ///
    /// A step error takes precedence over a failed final save, which takes
    /// precedence over a failed worker join.
    pub fn run(
        &mut self,
        model: &mut dyn Model,
        optimizer: &mut dyn Optimizer,
        start_step: Step,
        mut pipeline: PipelineCoordinator,
    ) -> Result<TrainingReport> {
        self.state = LoopState::Running;
        info!(
            start_step,
            num_steps = self.config.num_steps,
            checkpoint_every = self.config.checkpoint_every,
            "Starting training"
        );

        let outcome = self.run_steps(model, optimizer, start_step, &mut pipeline);

        let final_save = match self.last_completed {
            Some(step) if self.last_saved != Some(step) => {
                self.checkpoint(model, optimizer, step).map(|_| ())
            }
            _ => Ok(()),
        };

        pipeline.request_stop();
        let joined = pipeline.join();
        self.state = LoopState::Terminated;

        match outcome {
            Err(e) => {
                if let Err(save_error) = final_save {
                    warn!(error = %save_error, "Final checkpoint after failure was not written");
                }
                if let Err(join_error) = joined {
                    warn!(error = %join_error, "Pipeline shutdown failed");
                }
                error!(error = %e, "Training failed");
                Err(e)
            }
            Ok(()) => {
                final_save?;
                joined?;

                let interrupted = self.interrupt.is_requested();
                match &self.last_checkpoint {
                    Some(path) if interrupted => {
                        info!(path = %path.display(), "Training interrupted, last checkpoint saved")
                    }
                    Some(path) => info!(path = %path.display(), "Training finished, last checkpoint saved"),
                    None => info!("Training finished without running a step"),
                }

                Ok(TrainingReport {
                    start_step,
                    last_step: self.last_completed,
                    saved_steps: self.saved_steps.clone(),
                    interrupted,
                    last_checkpoint: self.last_checkpoint.clone(),
                })
            }
        }
    }

    fn run_steps(
        &mut self,
        model: &mut dyn Model,
        optimizer: &mut dyn Optimizer,
        start_step: Step,
        pipeline: &mut PipelineCoordinator,
    ) -> Result<()> {
        for step in start_step..self.config.num_steps {
            if self.interrupt.is_requested() {
                self.state = LoopState::Interrupted;
                info!(step, "Interrupt observed before step");
                break;
            }

            let started = Instant::now();
            let batch = pipeline.next_batch()?;

            let traced = self.config.store_metadata && step % self.config.metadata_every == 0;
            let mut trace = if traced {
                StepTrace::enabled()
            } else {
                StepTrace::disabled()
            };

            let output = model
                .train_step(&batch, optimizer, &mut trace)
                .map_err(|e| Error::Step {
                    step,
                    message: e.to_string(),
                })?;
            let duration = started.elapsed().as_secs_f64();
            self.last_completed = Some(step);

            if traced {
                self.record(self.summary.run_metadata(step, &trace.to_chrome_trace()));
            }
            self.record(self.summary.scalars(step, output.loss, duration));
            info!("step {} - loss = {:.3}, ({:.3} sec/step)", step, output.loss, duration);

            if step % self.config.checkpoint_every == 0 {
                self.checkpoint(model, optimizer, step)?;
            }
        }
        Ok(())
    }

    fn checkpoint(
        &mut self,
        model: &mut dyn Model,
        optimizer: &mut dyn Optimizer,
        step: Step,
    ) -> Result<CheckpointMetadata> {
        let previous = self.state;
        self.state = LoopState::Checkpointing;

        if self.config.histograms {
            let params = model.export_state();
            self.record(self.summary.histograms(step, &params));
        }

        let tensors = TrainingState::new(model, optimizer).export_state();
        let metadata = self.runtime.block_on(self.checkpoints.save(tensors, step))??;

        self.last_saved = Some(step);
        self.saved_steps.push(step);
        self.last_checkpoint = Some(PathBuf::from(&metadata.path));
        self.state = previous;
        Ok(metadata)
    }

    /// Summaries are best effort
    fn record(&self, write: impl std::future::Future<Output = Result<()>>) {
        match self.runtime.block_on(write) {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => warn!(error = %e, "Failed to write summary"),
        }
    }
}
