//! Restore failures and interrupts in the middle of a run

mod common;

use anyhow::Result;
use audio_pipeline::{Batch, Corpus, CorpusOptions, PipelineConfig, PipelineCoordinator};
use checkpoint::{CheckpointManager, CheckpointManagerConfig};
use common::{resolve, snapshot_steps, Workspace, SAMPLE_RATE};
use std::sync::Arc;
use train_core::{
    ConditioningSpec, NamedTensor, RawArgs, RuntimeManagerBuilder, StateDict, Step, WaveNetParams,
};
use trainer::{
    create_optimizer, session, InterruptFlag, LoopConfig, Model, MuLawBigram, Optimizer,
    ReferenceModelConfig, StepOutput, StepTrace, SummaryWriter, TrainingLoop,
};

#[test]
fn test_corrupt_checkpoint_halts_training() -> Result<()> {
    let ws = Workspace::new(&["a.wav"])?;
    session::run(&resolve(ws.args("run", 4, 10)), InterruptFlag::new())?;
    std::fs::write(ws.path("run").join("model.ckpt-3"), b"not a checkpoint")?;

    let err = session::run(&resolve(ws.args("run", 10, 10)), InterruptFlag::new()).unwrap_err();
    assert!(err.is_restore());
    assert_eq!(snapshot_steps(&ws.path("run")), vec![0, 3]);
    Ok(())
}

#[test]
fn test_incompatible_checkpoint_halts_training() -> Result<()> {
    let ws = Workspace::new(&["p225_001.wav"])?;
    session::run(&resolve(ws.args("run", 2, 10)), InterruptFlag::new())?;

    // Global conditioning adds parameters the checkpoint does not have
    let err = session::run(
        &resolve(RawArgs {
            gc_channels: Some(4),
            ..ws.args("run", 10, 10)
        }),
        InterruptFlag::new(),
    )
    .unwrap_err();
    assert!(err.is_restore());
    assert_eq!(snapshot_steps(&ws.path("run")), vec![0, 1]);
    Ok(())
}

#[test]
fn test_corrupt_manifest_in_restore_directory_halts_training() -> Result<()> {
    let ws = Workspace::new(&["a.wav"])?;
    std::fs::create_dir_all(ws.path("old"))?;
    std::fs::write(ws.path("old").join("checkpoint"), b"{ not json")?;

    let config = resolve(RawArgs {
        logdir: None,
        logdir_root: Some(ws.path("runs")),
        restore_from: Some(ws.path("old")),
        ..ws.args("unused", 3, 5)
    });
    let err = session::run(&config, InterruptFlag::new()).unwrap_err();
    assert!(err.is_restore());
    assert!(snapshot_steps(config.logdir()).is_empty());
    Ok(())
}

/// Reference model that raises the interrupt once `at` has completed
struct InterruptAt {
    inner: MuLawBigram,
    next: Step,
    at: Step,
    flag: InterruptFlag,
}

impl Model for InterruptAt {
    fn train_step(
        &mut self,
        batch: &Batch,
        optimizer: &mut dyn Optimizer,
        trace: &mut StepTrace,
    ) -> train_core::Result<StepOutput> {
        let output = self.inner.train_step(batch, optimizer, trace)?;
        if self.next == self.at {
            self.flag.request();
        }
        self.next += 1;
        Ok(output)
    }
}

impl StateDict for InterruptAt {
    fn export_state(&self) -> Vec<NamedTensor> {
        self.inner.export_state()
    }

    fn import_state(&mut self, tensors: Vec<NamedTensor>) -> train_core::Result<()> {
        self.inner.import_state(tensors)
    }
}

#[test]
fn test_interrupt_at_non_multiple_step_saves_once_and_joins() -> Result<()> {
    let ws = Workspace::new(&["a.wav", "b.wav"])?;
    let logdir = ws.path("run");
    let params = WaveNetParams {
        sample_rate: SAMPLE_RATE,
        dilations: vec![1, 2],
        quantization_channels: 16,
        ..Default::default()
    };

    let runtime = RuntimeManagerBuilder::new().io_threads(1).build()?;
    let checkpoints = runtime.block_on(CheckpointManager::open(CheckpointManagerConfig::new(
        &logdir, 5,
    )))??;
    let summary = SummaryWriter::local(&logdir);

    let corpus = Corpus::discover(
        &ws.path("corpus"),
        CorpusOptions {
            sample_rate: SAMPLE_RATE,
            gc_enabled: false,
            lc: None,
        },
    )?;
    let pipeline = PipelineCoordinator::start(
        Arc::new(corpus),
        PipelineConfig {
            num_readers: 2,
            batch_size: 2,
            receptive_field: params.receptive_field(),
            sample_size: Some(64),
            ..Default::default()
        },
    )?;
    assert_eq!(pipeline.worker_count(), 3);
    let stop = pipeline.stop_signal();

    let interrupt = InterruptFlag::new();
    let mut model = InterruptAt {
        inner: MuLawBigram::new(ReferenceModelConfig::new(
            &params,
            &ConditioningSpec::default(),
            None,
            None,
            3,
        )?),
        next: 0,
        at: 13,
        flag: interrupt.clone(),
    };
    let mut optimizer = create_optimizer(
        train_core::OptimizerKind::Adam,
        0.01,
        0.9,
        model.inner.parameters(),
    );

    let mut training = TrainingLoop::new(
        LoopConfig {
            num_steps: 1000,
            checkpoint_every: 5,
            store_metadata: false,
            metadata_every: 50,
            histograms: false,
        },
        &runtime,
        &checkpoints,
        &summary,
        interrupt,
    );
    let report = training.run(&mut model, optimizer.as_mut(), 0, pipeline)?;

    assert!(report.interrupted);
    assert_eq!(report.last_step, Some(13));
    assert_eq!(report.saved_steps, vec![0, 5, 10, 13]);
    assert_eq!(report.last_checkpoint, Some(checkpoints.checkpoint_path(13)));
    assert!(stop.is_stopped());
    assert_eq!(snapshot_steps(&logdir), vec![0, 5, 10, 13]);
    Ok(())
}
