//! Run configuration and its resolver
//!
//! `RawArgs` is the unvalidated option set as it arrives from the command
//! line. `RunConfiguration::resolve` validates it once at startup and derives
//! the directory layout; the result is immutable and passed to every
//! component.

use crate::ConfigurationError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default values for the run options
pub mod defaults {
    pub const BATCH_SIZE: usize = 1;
    pub const LOGDIR_ROOT: &str = "./logdir";
    pub const CHECKPOINT_EVERY: u64 = 50;
    pub const NUM_STEPS: u64 = 100_000;
    pub const LEARNING_RATE: f32 = 1e-3;
    pub const WAVENET_PARAMS: &str = "./wavenet_params.json";
    pub const DATA_DIRECTORY: &str = "./corpus";
    pub const SAMPLE_SIZE: usize = 100_000;
    pub const L2_REGULARIZATION_STRENGTH: f32 = 0.0;
    pub const MOMENTUM: f32 = 0.9;
    pub const MAX_CHECKPOINTS: usize = 5;
    pub const METADATA_EVERY: u64 = 50;
    pub const NUM_READERS: usize = 1;
    pub const QUEUE_CAPACITY: usize = 32;

    /// Silence thresholds at or below this value disable trimming
    pub const SILENCE_EPSILON: f32 = 0.001;

    /// Layout of the timestamped default log directory
    pub const STARTED_DATESTRING_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";
}

/// Registered optimizer kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
    Rmsprop,
}

impl OptimizerKind {
    /// Names accepted on the command line
    pub const NAMES: [&'static str; 3] = ["adam", "sgd", "rmsprop"];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Rmsprop => "rmsprop",
        }
    }
}

impl Default for OptimizerKind {
    fn default() -> Self {
        OptimizerKind::Adam
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "adam" => Ok(OptimizerKind::Adam),
            "sgd" => Ok(OptimizerKind::Sgd),
            "rmsprop" => Ok(OptimizerKind::Rmsprop),
            other => Err(format!(
                "unknown optimizer '{}', expected one of: {}",
                other,
                Self::NAMES.join(", ")
            )),
        }
    }
}

/// Unvalidated run options
#[derive(Debug, Clone)]
pub struct RawArgs {
    pub batch_size: usize,
    pub data_dir: PathBuf,
    pub store_metadata: bool,
    pub metadata_every: u64,
    pub logdir: Option<PathBuf>,
    pub logdir_root: Option<PathBuf>,
    pub restore_from: Option<PathBuf>,
    pub checkpoint_every: u64,
    pub num_steps: u64,
    pub learning_rate: f32,
    pub wavenet_params: PathBuf,
    pub sample_size: usize,
    pub l2_regularization_strength: f32,
    pub silence_threshold: Option<f32>,
    pub optimizer: OptimizerKind,
    pub momentum: f32,
    pub histograms: bool,
    pub gc_channels: Option<usize>,
    pub initial_lc_channels: Option<usize>,
    pub lc_channels: Option<usize>,
    pub lc_fileformat: Option<String>,
    pub max_checkpoints: usize,
    pub num_readers: usize,
    pub queue_capacity: usize,
    pub seed: Option<u64>,
}

impl Default for RawArgs {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            data_dir: PathBuf::from(defaults::DATA_DIRECTORY),
            store_metadata: false,
            metadata_every: defaults::METADATA_EVERY,
            logdir: None,
            logdir_root: None,
            restore_from: None,
            checkpoint_every: defaults::CHECKPOINT_EVERY,
            num_steps: defaults::NUM_STEPS,
            learning_rate: defaults::LEARNING_RATE,
            wavenet_params: PathBuf::from(defaults::WAVENET_PARAMS),
            sample_size: defaults::SAMPLE_SIZE,
            l2_regularization_strength: defaults::L2_REGULARIZATION_STRENGTH,
            silence_threshold: None,
            optimizer: OptimizerKind::default(),
            momentum: defaults::MOMENTUM,
            histograms: false,
            gc_channels: None,
            initial_lc_channels: None,
            lc_channels: None,
            lc_fileformat: None,
            max_checkpoints: defaults::MAX_CHECKPOINTS,
            num_readers: defaults::NUM_READERS,
            queue_capacity: defaults::QUEUE_CAPACITY,
            seed: None,
        }
    }
}

/// Resolved directory layout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directories {
    /// Where checkpoints, summaries and traces are written
    pub logdir: PathBuf,

    /// Root given explicitly on the command line, if any
    pub logdir_root: Option<PathBuf>,

    /// Where the initial state is restored from
    pub restore_from: PathBuf,
}

impl Directories {
    /// Default log directory under `root` for a run started at `started_at`
    pub fn default_logdir(root: &Path, started_at: &DateTime<Local>) -> PathBuf {
        root.join("train").join(
            started_at
                .format(defaults::STARTED_DATESTRING_FORMAT)
                .to_string(),
        )
    }
}

/// Global conditioning settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConditioning {
    /// Embedding width
    pub channels: usize,
}

/// Local conditioning settings. Present only when enabled, so both the
/// initial channel count and the file format are always set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalConditioning {
    /// Feature channels stored per frame in the LC files
    pub initial_channels: usize,

    /// Projected channel count fed to the model
    pub channels: usize,

    /// Extension of the LC files, without the leading dot
    pub file_format: String,
}

/// Conditioning options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditioningSpec {
    pub global: Option<GlobalConditioning>,
    pub local: Option<LocalConditioning>,
}

impl ConditioningSpec {
    pub fn gc_enabled(&self) -> bool {
        self.global.is_some()
    }

    pub fn lc_enabled(&self) -> bool {
        self.local.is_some()
    }

    /// Validate the conditioning options.
    ///
    /// Global conditioning is enabled iff its channel count is set; local
    /// conditioning is enabled iff `lc_channels` is set and then needs both
    /// the initial channel count and the file format.
    pub fn resolve(
        gc_channels: Option<usize>,
        initial_lc_channels: Option<usize>,
        lc_channels: Option<usize>,
        lc_fileformat: Option<&str>,
    ) -> Result<Self, ConfigurationError> {
        let global = gc_channels.map(|channels| GlobalConditioning { channels });

        let local = match lc_channels {
            Some(channels) => {
                let initial_channels =
                    initial_lc_channels.ok_or(ConfigurationError::MissingInitialLcChannels)?;
                let file_format = lc_fileformat
                    .ok_or(ConfigurationError::MissingLcFileFormat)?
                    .trim_start_matches('.')
                    .to_string();
                if file_format.is_empty() {
                    return Err(ConfigurationError::MissingLcFileFormat);
                }
                Some(LocalConditioning {
                    initial_channels,
                    channels,
                    file_format,
                })
            }
            None => {
                if lc_fileformat.is_some() {
                    return Err(ConfigurationError::DanglingLcFileFormat);
                }
                if initial_lc_channels.is_some() {
                    return Err(ConfigurationError::DanglingInitialLcChannels);
                }
                None
            }
        };

        Ok(Self { global, local })
    }
}

/// Data pipeline tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Number of reader threads
    pub num_readers: usize,

    /// Capacity of the item and batch queues
    pub queue_capacity: usize,

    /// Base seed for the per-epoch file order
    pub seed: u64,
}

/// Validated, immutable run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub batch_size: usize,
    pub num_steps: u64,
    pub checkpoint_every: u64,
    pub learning_rate: f32,
    pub momentum: f32,
    pub optimizer: OptimizerKind,
    pub data_dir: PathBuf,
    pub store_metadata: bool,
    pub metadata_every: u64,
    pub wavenet_params: PathBuf,

    /// `None` enqueues whole utterances
    pub sample_size: Option<usize>,

    /// `None` disables L2 regularization
    pub l2_regularization_strength: Option<f32>,

    /// `None` disables silence trimming
    pub silence_threshold: Option<f32>,

    pub histograms: bool,
    pub conditioning: ConditioningSpec,
    pub directories: Directories,

    /// True when the run writes its checkpoint lineage somewhere other than
    /// where it restores from
    pub is_overwritten_training: bool,

    pub max_checkpoints: usize,
    pub pipeline: PipelineSettings,
    pub started_at: DateTime<Local>,
}

impl RunConfiguration {
    /// Validate raw options and derive the directory layout. Pure: nothing is
    /// created on disk.
    pub fn resolve(
        args: RawArgs,
        started_at: DateTime<Local>,
    ) -> Result<Self, ConfigurationError> {
        // Directories
        if args.logdir.is_some() && args.logdir_root.is_some() {
            return Err(ConfigurationError::LogdirWithLogdirRoot);
        }
        if args.logdir.is_some() && args.restore_from.is_some() {
            return Err(ConfigurationError::LogdirWithRestoreFrom);
        }

        let root = args
            .logdir_root
            .clone()
            .unwrap_or_else(|| PathBuf::from(defaults::LOGDIR_ROOT));
        let logdir = match args.logdir {
            Some(logdir) => logdir,
            None => {
                let logdir = Directories::default_logdir(&root, &started_at);
                tracing::info!(logdir = %logdir.display(), "Using default logdir");
                logdir
            }
        };
        // logdir and restore_from are exclusive, so a defaulted restore_from
        // always means "resume in place"
        let restore_from = args.restore_from.unwrap_or_else(|| logdir.clone());
        let is_overwritten_training = logdir != restore_from;

        let directories = Directories {
            logdir,
            logdir_root: args.logdir_root,
            restore_from,
        };

        // Conditioning
        let conditioning = ConditioningSpec::resolve(
            args.gc_channels,
            args.initial_lc_channels,
            args.lc_channels,
            args.lc_fileformat.as_deref(),
        )?;

        // Numeric sanity
        require_positive("batch-size", args.batch_size as u64)?;
        require_positive("checkpoint-every", args.checkpoint_every)?;
        require_positive("max-checkpoints", args.max_checkpoints as u64)?;
        require_positive("metadata-every", args.metadata_every)?;
        require_positive("num-readers", args.num_readers as u64)?;
        require_positive("queue-capacity", args.queue_capacity as u64)?;
        if let Some(0) = conditioning.global.map(|g| g.channels) {
            return Err(ConfigurationError::InvalidValue {
                option: "gc-channels",
                reason: "must be positive".to_string(),
            });
        }
        if let Some(local) = &conditioning.local {
            require_positive("lc-channels", local.channels as u64)?;
            require_positive("initial-lc-channels", local.initial_channels as u64)?;
        }
        if !(args.learning_rate.is_finite() && args.learning_rate > 0.0) {
            return Err(ConfigurationError::InvalidValue {
                option: "learning-rate",
                reason: format!("must be a positive number, got {}", args.learning_rate),
            });
        }
        if args.l2_regularization_strength < 0.0 {
            return Err(ConfigurationError::InvalidValue {
                option: "l2-regularization-strength",
                reason: "must not be negative".to_string(),
            });
        }

        let l2_regularization_strength =
            (args.l2_regularization_strength != 0.0).then_some(args.l2_regularization_strength);
        let silence_threshold = args
            .silence_threshold
            .filter(|threshold| *threshold > defaults::SILENCE_EPSILON);
        let sample_size = (args.sample_size > 0).then_some(args.sample_size);

        let seed = args
            .seed
            .unwrap_or_else(|| started_at.timestamp().unsigned_abs());

        Ok(Self {
            batch_size: args.batch_size,
            num_steps: args.num_steps,
            checkpoint_every: args.checkpoint_every,
            learning_rate: args.learning_rate,
            momentum: args.momentum,
            optimizer: args.optimizer,
            data_dir: args.data_dir,
            store_metadata: args.store_metadata,
            metadata_every: args.metadata_every,
            wavenet_params: args.wavenet_params,
            sample_size,
            l2_regularization_strength,
            silence_threshold,
            histograms: args.histograms,
            conditioning,
            directories,
            is_overwritten_training,
            max_checkpoints: args.max_checkpoints,
            pipeline: PipelineSettings {
                num_readers: args.num_readers,
                queue_capacity: args.queue_capacity,
                seed,
            },
            started_at,
        })
    }

    pub fn logdir(&self) -> &Path {
        &self.directories.logdir
    }

    pub fn restore_from(&self) -> &Path {
        &self.directories.restore_from
    }
}

fn require_positive(option: &'static str, value: u64) -> Result<(), ConfigurationError> {
    if value == 0 {
        Err(ConfigurationError::InvalidValue {
            option,
            reason: "must be positive".to_string(),
        })
    } else {
        Ok(())
    }
}
