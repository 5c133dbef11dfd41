//! Run orchestration
//!
//! Wires a resolved [`RunConfiguration`] into the collaborators: network
//! parameters, checkpoint managers, corpus, model and optimizer, restore,
//! the data pipeline and finally the training loop.

use audio_pipeline::{Corpus, CorpusOptions, LcPairing, PipelineConfig, PipelineCoordinator};
use checkpoint::{CheckpointManager, CheckpointManagerConfig};
use std::sync::Arc;
use tracing::{info, warn};
use train_core::{
    Result, RunConfiguration, RuntimeManager, RuntimeManagerBuilder, StateDict, Step, WaveNetParams,
};

use crate::model::TrainingState;
use crate::optimizer::create_optimizer;
use crate::reference::{MuLawBigram, ReferenceModelConfig};
use crate::signal::InterruptFlag;
use crate::summary::SummaryWriter;
use crate::training_loop::{LoopConfig, TrainingLoop, TrainingReport};

/// First step of this run.
///
/// Output relocated away from the restore directory counts as a new run, so
/// it starts at zero even though the restored weights are kept.
pub fn first_step(restored: Option<Step>, is_overwritten_training: bool) -> Step {
    match restored {
        Some(step) if !is_overwritten_training => step + 1,
        _ => 0,
    }
}

/// Checkpoint managers for the output and restore directories
pub struct Checkpoints {
    writer: CheckpointManager,
    restore: Option<CheckpointManager>,
}

impl Checkpoints {
    /// Open both managers. Failing to open the restore directory is a
    /// restore failure.
    pub async fn open(config: &RunConfiguration) -> Result<Self> {
        let writer = CheckpointManager::open(CheckpointManagerConfig::new(
            config.logdir(),
            config.max_checkpoints,
        ))
        .await;
        // Resuming in place restores from the output directory
        let writer = match writer {
            Err(e) if !config.is_overwritten_training => {
                return Err(e.into_restore(config.logdir().display().to_string()))
            }
            other => other?,
        };

        let restore = if config.is_overwritten_training {
            let restore_from = config.restore_from().display().to_string();
            let manager = CheckpointManager::open(CheckpointManagerConfig::new(
                config.restore_from(),
                config.max_checkpoints,
            ))
            .await
            .map_err(|e| e.into_restore(restore_from))?;
            Some(manager)
        } else {
            None
        };

        Ok(Self { writer, restore })
    }

    pub fn writer(&self) -> &CheckpointManager {
        &self.writer
    }

    pub fn restore(&self) -> &CheckpointManager {
        self.restore.as_ref().unwrap_or(&self.writer)
    }
}

/// Train according to `config` until `num_steps` or an interrupt
pub fn run(config: &RunConfiguration, interrupt: InterruptFlag) -> Result<TrainingReport> {
    let params = WaveNetParams::load(&config.wavenet_params)?;
    let receptive_field = params.receptive_field();
    info!(
        receptive_field,
        quantization_channels = params.quantization_channels,
        "Loaded network parameters"
    );

    let runtime = RuntimeManagerBuilder::new().io_threads(2).build()?;
    run_with_runtime(config, &params, &runtime, interrupt)
}

fn run_with_runtime(
    config: &RunConfiguration,
    params: &WaveNetParams,
    runtime: &RuntimeManager,
    interrupt: InterruptFlag,
) -> Result<TrainingReport> {
    let checkpoints = runtime.block_on(Checkpoints::open(config))?.map_err(restore_halt)?;

    let corpus = Corpus::discover(
        &config.data_dir,
        CorpusOptions {
            sample_rate: params.sample_rate,
            gc_enabled: config.conditioning.gc_enabled(),
            lc: config.conditioning.local.as_ref().map(|lc| LcPairing {
                channels: lc.initial_channels,
                file_format: lc.file_format.clone(),
            }),
        },
    )?;

    let mut model = MuLawBigram::new(ReferenceModelConfig::new(
        params,
        &config.conditioning,
        corpus.gc_cardinality(),
        config.l2_regularization_strength,
        config.pipeline.seed,
    )?);
    let mut optimizer = create_optimizer(
        config.optimizer,
        config.learning_rate,
        config.momentum,
        model.parameters(),
    );
    info!(optimizer = optimizer.name(), "Created model and optimizer");

    let summary = SummaryWriter::local(config.logdir());
    let mut state = TrainingState::new(&mut model, optimizer.as_mut());
    runtime.block_on(checkpoints.writer().write_saved_vars(&state.state_names()))??;

    let restored = runtime
        .block_on(checkpoints.restore().load_into(&mut state))?
        .map_err(restore_halt)?;
    let start_step = first_step(restored, config.is_overwritten_training);
    if let Some(step) = restored {
        info!(restored_step = step, start_step, "Global step was restored");
    }

    if let Err(e) = runtime.block_on(summary.run_config(config))? {
        warn!(error = %e, "Failed to write run configuration summary");
    }

    let pipeline = PipelineCoordinator::start(
        Arc::new(corpus),
        PipelineConfig::from_run(config, params.receptive_field()),
    )?;

    let mut training = TrainingLoop::new(
        LoopConfig::from_run(config),
        runtime,
        checkpoints.writer(),
        &summary,
        interrupt,
    );
    training.run(&mut model, optimizer.as_mut(), start_step, pipeline)
}

fn restore_halt(e: train_core::Error) -> train_core::Error {
    if e.is_restore() {
        warn!(
            error = %e,
            "Something went wrong while restoring checkpoint. \
             Training is halted to avoid overwriting the previous model"
        );
    }
    e
}
