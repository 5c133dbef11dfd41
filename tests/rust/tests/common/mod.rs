//! Shared fixtures: a tiny WAV corpus and a network params file

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use tempfile::TempDir;
use train_core::{RawArgs, RunConfiguration};

pub const SAMPLE_RATE: u32 = 8000;

/// Scratch workspace holding a corpus, a params file and log directories
pub struct Workspace {
    pub root: TempDir,
}

impl Workspace {
    pub fn new(names: &[&str]) -> anyhow::Result<Self> {
        let root = TempDir::new()?;
        let data = root.path().join("corpus");
        std::fs::create_dir_all(&data)?;
        for (i, name) in names.iter().enumerate() {
            write_tone(&data.join(name), 220.0 * (i + 1) as f32, 600)?;
        }

        std::fs::write(
            root.path().join("wavenet_params.json"),
            serde_json::json!({
                "filter_width": 2,
                "sample_rate": SAMPLE_RATE,
                "dilations": [1, 2],
                "residual_channels": 8,
                "dilation_channels": 8,
                "quantization_channels": 16,
                "skip_channels": 16,
                "use_biases": true,
                "scalar_input": false,
                "initial_filter_width": 2
            })
            .to_string(),
        )?;

        Ok(Self { root })
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    /// Options for a short run writing to `logdir`
    pub fn args(&self, logdir: &str, num_steps: u64, checkpoint_every: u64) -> RawArgs {
        RawArgs {
            data_dir: self.path("corpus"),
            wavenet_params: self.path("wavenet_params.json"),
            logdir: Some(self.path(logdir)),
            num_steps,
            checkpoint_every,
            sample_size: 64,
            learning_rate: 0.01,
            batch_size: 2,
            num_readers: 2,
            queue_capacity: 8,
            seed: Some(11),
            ..Default::default()
        }
    }
}

pub fn resolve(args: RawArgs) -> RunConfiguration {
    RunConfiguration::resolve(args, chrono::Local::now()).expect("valid arguments")
}

pub fn write_tone(path: &Path, frequency: f32, samples: usize) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for i in 0..samples {
        let t = i as f32 / SAMPLE_RATE as f32;
        let value = (t * frequency * std::f32::consts::TAU).sin() * 0.6;
        writer.write_sample((value * i16::MAX as f32) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

pub fn write_silence(path: &Path, samples: usize) -> anyhow::Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for _ in 0..samples {
        writer.write_sample(0i16)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Raw little-endian `f32` conditioning rows of `channels` values each
pub fn write_lc(path: &Path, frames: usize, channels: usize) -> anyhow::Result<()> {
    let bytes: Vec<u8> = (0..frames * channels)
        .flat_map(|i| ((i % 7) as f32 / 7.0).to_le_bytes())
        .collect();
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Snapshot files present in `dir`, sorted by step
pub fn snapshot_steps(dir: &Path) -> Vec<u64> {
    let mut steps: Vec<u64> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    e.file_name()
                        .to_str()
                        .and_then(|name| name.strip_prefix("model.ckpt-"))
                        .and_then(|step| step.parse().ok())
                })
                .collect()
        })
        .unwrap_or_default();
    steps.sort_unstable();
    steps
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
