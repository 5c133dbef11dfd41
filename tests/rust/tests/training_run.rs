//! End-to-end training runs over a generated WAV corpus

mod common;

use anyhow::Result;
use checkpoint::{CheckpointManifest, MANIFEST_FILE, SAVED_VARS_FILE};
use common::{init_tracing, resolve, snapshot_steps, write_lc, write_silence, Workspace};
use train_core::RawArgs;
use trainer::summary::{parse_events, SummaryRecord, EVENTS_FILE};
use trainer::{session, InterruptFlag};

#[test]
fn test_checkpoint_cadence_scenario() -> Result<()> {
    init_tracing();
    let ws = Workspace::new(&["a.wav", "b.wav", "c.wav"])?;
    let config = resolve(RawArgs {
        max_checkpoints: 10,
        ..ws.args("run", 150, 50)
    });

    let report = session::run(&config, InterruptFlag::new())?;

    assert_eq!(report.start_step, 0);
    assert_eq!(report.last_step, Some(149));
    assert_eq!(report.saved_steps, vec![0, 50, 100, 149]);
    assert!(!report.interrupted);
    assert_eq!(snapshot_steps(config.logdir()), vec![0, 50, 100, 149]);

    let manifest: CheckpointManifest =
        serde_json::from_slice(&std::fs::read(config.logdir().join(MANIFEST_FILE))?)?;
    assert_eq!(manifest.model_checkpoint_path, "model.ckpt-149");
    assert_eq!(manifest.all_model_checkpoint_paths.len(), 4);
    Ok(())
}

#[test]
fn test_run_writes_saved_vars_and_summaries() -> Result<()> {
    let ws = Workspace::new(&["a.wav", "b.wav"])?;
    let config = resolve(RawArgs {
        store_metadata: true,
        metadata_every: 5,
        histograms: true,
        ..ws.args("run", 10, 5)
    });

    session::run(&config, InterruptFlag::new())?;

    let names: Vec<String> =
        serde_json::from_slice(&std::fs::read(config.logdir().join(SAVED_VARS_FILE))?)?;
    assert!(names.contains(&"wavenet/transition".to_string()));
    assert!(names.contains(&"adam/wavenet/transition/m".to_string()));

    let events = parse_events(&std::fs::read(config.logdir().join(EVENTS_FILE))?)?;
    assert!(matches!(events[0], SummaryRecord::RunConfig { .. }));
    let scalar_steps: Vec<u64> = events
        .iter()
        .filter_map(|e| match e {
            SummaryRecord::Scalars { step, .. } => Some(*step),
            _ => None,
        })
        .collect();
    assert_eq!(scalar_steps, (0..10).collect::<Vec<_>>());

    let tags: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            SummaryRecord::RunMetadata { tag, .. } => Some(tag.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tags, vec!["step_0000", "step_0005"]);
    assert!(events
        .iter()
        .any(|e| matches!(e, SummaryRecord::Histogram { step: 9, .. })));
    assert!(config.logdir().join("timeline.trace").exists());
    Ok(())
}

#[test]
fn test_resume_in_place_continues_after_saved_step() -> Result<()> {
    let ws = Workspace::new(&["a.wav", "b.wav"])?;

    let first = session::run(&resolve(ws.args("run", 20, 10)), InterruptFlag::new())?;
    assert_eq!(first.saved_steps, vec![0, 10, 19]);

    let second = session::run(&resolve(ws.args("run", 30, 10)), InterruptFlag::new())?;
    assert_eq!(second.start_step, 20);
    assert_eq!(second.saved_steps, vec![20, 29]);
    assert_eq!(snapshot_steps(&ws.path("run")), vec![0, 10, 19, 20, 29]);
    Ok(())
}

#[test]
fn test_finished_run_has_nothing_to_do() -> Result<()> {
    let ws = Workspace::new(&["a.wav"])?;
    session::run(&resolve(ws.args("run", 5, 10)), InterruptFlag::new())?;

    let again = session::run(&resolve(ws.args("run", 5, 10)), InterruptFlag::new())?;
    assert_eq!(again.start_step, 5);
    assert_eq!(again.last_step, None);
    assert!(again.saved_steps.is_empty());
    assert_eq!(snapshot_steps(&ws.path("run")), vec![0, 4]);
    Ok(())
}

#[test]
fn test_relocated_output_starts_from_zero() -> Result<()> {
    let ws = Workspace::new(&["a.wav", "b.wav"])?;
    session::run(&resolve(ws.args("old", 12, 5)), InterruptFlag::new())?;

    let config = resolve(RawArgs {
        logdir: None,
        logdir_root: Some(ws.path("runs")),
        restore_from: Some(ws.path("old")),
        ..ws.args("unused", 3, 5)
    });
    assert!(config.is_overwritten_training);

    let report = session::run(&config, InterruptFlag::new())?;
    assert_eq!(report.start_step, 0);
    assert_eq!(report.saved_steps, vec![0, 2]);
    assert!(config.logdir().starts_with(ws.path("runs").join("train")));
    assert_eq!(snapshot_steps(config.logdir()), vec![0, 2]);

    // The restore directory is left alone
    assert_eq!(snapshot_steps(&ws.path("old")), vec![0, 5, 10, 11]);
    Ok(())
}

#[test]
fn test_retention_keeps_newest() -> Result<()> {
    let ws = Workspace::new(&["a.wav"])?;
    let config = resolve(RawArgs {
        max_checkpoints: 2,
        ..ws.args("run", 5, 1)
    });

    let report = session::run(&config, InterruptFlag::new())?;
    assert_eq!(report.saved_steps, vec![0, 1, 2, 3, 4]);
    assert_eq!(snapshot_steps(config.logdir()), vec![3, 4]);
    Ok(())
}

#[test]
fn test_interrupt_before_training_saves_nothing() -> Result<()> {
    let ws = Workspace::new(&["a.wav"])?;
    let config = resolve(ws.args("run", 100, 10));
    let interrupt = InterruptFlag::new();
    interrupt.request();

    let report = session::run(&config, interrupt)?;
    assert!(report.interrupted);
    assert!(report.saved_steps.is_empty());
    assert!(snapshot_steps(config.logdir()).is_empty());
    Ok(())
}

#[test]
fn test_global_conditioning_from_file_names() -> Result<()> {
    let ws = Workspace::new(&["p225_001.wav", "p226_002.wav"])?;
    let config = resolve(RawArgs {
        gc_channels: Some(4),
        ..ws.args("run", 3, 10)
    });

    let report = session::run(&config, InterruptFlag::new())?;
    assert_eq!(report.saved_steps, vec![0, 2]);

    let names: Vec<String> =
        serde_json::from_slice(&std::fs::read(config.logdir().join(SAVED_VARS_FILE))?)?;
    assert!(names.contains(&"wavenet/gc_embedding".to_string()));
    Ok(())
}

#[test]
fn test_local_conditioning_with_silence_trimming() -> Result<()> {
    let ws = Workspace::new(&["a.wav", "b.wav"])?;
    let corpus = ws.path("corpus");
    write_silence(&corpus.join("quiet.wav"), 600)?;
    for stem in ["a", "b", "quiet"] {
        write_lc(&corpus.join(format!("{}.feat", stem)), 10, 4)?;
    }

    let config = resolve(RawArgs {
        silence_threshold: Some(0.1),
        initial_lc_channels: Some(4),
        lc_channels: Some(3),
        lc_fileformat: Some("feat".to_string()),
        num_readers: 3,
        ..ws.args("run", 6, 5)
    });
    assert_eq!(config.silence_threshold, Some(0.1));

    // The silent utterance is skipped rather than stopping the readers
    let report = session::run(&config, InterruptFlag::new())?;
    assert_eq!(report.last_step, Some(5));
    assert_eq!(report.saved_steps, vec![0, 5]);

    let names: Vec<String> =
        serde_json::from_slice(&std::fs::read(config.logdir().join(SAVED_VARS_FILE))?)?;
    assert!(names.contains(&"wavenet/lc_input".to_string()));
    assert!(names.contains(&"wavenet/lc_projection".to_string()));
    Ok(())
}

#[test]
fn test_empty_corpus_fails_without_checkpoints() -> Result<()> {
    let ws = Workspace::new(&[])?;
    let config = resolve(ws.args("run", 10, 5));

    let err = session::run(&config, InterruptFlag::new()).unwrap_err();
    assert!(matches!(err, train_core::Error::Corpus { .. }));
    assert!(snapshot_steps(config.logdir()).is_empty());
    Ok(())
}
