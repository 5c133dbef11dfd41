//! Summary event stream
//!
//! Records are appended to `events.jsonl` in the log directory, one JSON
//! object per line, tagged by `kind`.

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use storage::{LocalStorage, StorageBackend};
use tracing::instrument;
use train_core::{NamedTensor, Result, RunConfiguration, Step};

use crate::profiling::ChromeTrace;

pub const EVENTS_FILE: &str = "events.jsonl";
pub const TIMELINE_FILE: &str = "timeline.trace";

const HISTOGRAM_BUCKETS: usize = 30;

/// One line of the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SummaryRecord {
    RunConfig {
        wall_time: f64,
        config: serde_json::Value,
    },
    Scalars {
        wall_time: f64,
        step: Step,
        loss: f32,
        duration_secs: f64,
    },
    RunMetadata {
        wall_time: f64,
        step: Step,
        tag: String,
        trace_file: String,
        trace_events: usize,
    },
    Histogram {
        wall_time: f64,
        step: Step,
        name: String,
        #[serde(flatten)]
        stats: Histogram,
    },
}

/// Value distribution of one tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub min: f32,
    pub max: f32,
    pub mean: f64,
    pub std: f64,
    pub count: usize,
    /// Equal-width bucket counts between `min` and `max`
    pub buckets: Vec<u64>,
}

impl Histogram {
    pub fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                std: 0.0,
                count: 0,
                buckets: Vec::new(),
            };
        }

        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let count = values.len();
        let mean = values.iter().map(|v| *v as f64).sum::<f64>() / count as f64;
        let variance = values
            .iter()
            .map(|v| (*v as f64 - mean).powi(2))
            .sum::<f64>()
            / count as f64;

        let mut buckets = vec![0u64; HISTOGRAM_BUCKETS];
        let width = (max - min) / HISTOGRAM_BUCKETS as f32;
        for v in values {
            let index = if width > 0.0 {
                (((v - min) / width) as usize).min(HISTOGRAM_BUCKETS - 1)
            } else {
                0
            };
            buckets[index] += 1;
        }

        Self {
            min,
            max,
            mean,
            std: variance.sqrt(),
            count,
            buckets,
        }
    }
}

/// Tag attached to run metadata captured at `step`
pub fn metadata_tag(step: Step) -> String {
    format!("step_{:04}", step)
}

fn wall_time() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1e6
}

/// Appends summary records and writes trace artifacts into the log directory
pub struct SummaryWriter {
    storage: Arc<dyn StorageBackend>,
}

impl SummaryWriter {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Writer rooted at a local log directory
    pub fn local(logdir: impl AsRef<std::path::Path>) -> Self {
        Self::new(Arc::new(LocalStorage::new(logdir)))
    }

    pub async fn run_config(&self, config: &RunConfiguration) -> Result<()> {
        self.append(&SummaryRecord::RunConfig {
            wall_time: wall_time(),
            config: serde_json::to_value(config)?,
        })
        .await
    }

    pub async fn scalars(&self, step: Step, loss: f32, duration_secs: f64) -> Result<()> {
        self.append(&SummaryRecord::Scalars {
            wall_time: wall_time(),
            step,
            loss,
            duration_secs,
        })
        .await
    }

    /// Write `trace` as the timeline artifact and record it against `step`
    #[instrument(skip(self, trace), fields(events = trace.trace_events.len()))]
    pub async fn run_metadata(&self, step: Step, trace: &ChromeTrace) -> Result<()> {
        let json = serde_json::to_vec(trace)?;
        self.storage.write(TIMELINE_FILE, Bytes::from(json)).await?;

        self.append(&SummaryRecord::RunMetadata {
            wall_time: wall_time(),
            step,
            tag: metadata_tag(step),
            trace_file: TIMELINE_FILE.to_string(),
            trace_events: trace.trace_events.len(),
        })
        .await
    }

    /// One histogram record per tensor
    pub async fn histograms(&self, step: Step, tensors: &[NamedTensor]) -> Result<()> {
        let now = wall_time();
        let mut lines = Vec::new();
        for tensor in tensors {
            let record = SummaryRecord::Histogram {
                wall_time: now,
                step,
                name: tensor.name.clone(),
                stats: Histogram::from_values(&tensor.data),
            };
            serde_json::to_writer(&mut lines, &record)?;
            lines.push(b'\n');
        }
        self.storage.append(EVENTS_FILE, Bytes::from(lines)).await?;
        Ok(())
    }

    async fn append(&self, record: &SummaryRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.storage.append(EVENTS_FILE, Bytes::from(line)).await?;
        Ok(())
    }
}

/// Parse an event stream back into records
pub fn parse_events(raw: &[u8]) -> Result<Vec<SummaryRecord>> {
    raw.split(|b| *b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).map_err(Into::into))
        .collect()
}
