//! Command-line surface of the `train` binary

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use train_core::config::defaults;
use train_core::{OptimizerKind, RawArgs};

/// WaveNet training
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "WaveNet example network training", long_about = None)]
pub struct TrainArgs {
    /// How many wav files to process at once
    #[arg(long, default_value_t = defaults::BATCH_SIZE)]
    pub batch_size: usize,

    /// Directory containing the training WAV data and any LC files
    #[arg(long, default_value = defaults::DATA_DIRECTORY)]
    pub data_dir: PathBuf,

    /// Store timeline traces and run metadata every --metadata-every steps
    #[arg(
        long,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = false,
        default_missing_value = "true"
    )]
    pub store_metadata: bool,

    /// Steps between metadata captures
    #[arg(long, default_value_t = defaults::METADATA_EVERY)]
    pub metadata_every: u64,

    /// Directory for logs and checkpoints; resumes from its last checkpoint.
    /// Cannot be combined with --logdir-root or --restore-from
    #[arg(long)]
    pub logdir: Option<PathBuf>,

    /// Root under which a timestamped logdir is created
    #[arg(long)]
    pub logdir_root: Option<PathBuf>,

    /// Directory to restore the model from; new checkpoints go to the logdir
    #[arg(long)]
    pub restore_from: Option<PathBuf>,

    /// Steps between checkpoints
    #[arg(long, default_value_t = defaults::CHECKPOINT_EVERY)]
    pub checkpoint_every: u64,

    /// Number of training steps
    #[arg(long, default_value_t = defaults::NUM_STEPS)]
    pub num_steps: u64,

    #[arg(long, default_value_t = defaults::LEARNING_RATE)]
    pub learning_rate: f32,

    /// JSON file with the network parameters
    #[arg(long, default_value = defaults::WAVENET_PARAMS)]
    pub wavenet_params: PathBuf,

    /// Cut audio into pieces of this many samples; 0 keeps whole files
    #[arg(long, default_value_t = defaults::SAMPLE_SIZE)]
    pub sample_size: usize,

    /// L2 regularization coefficient; 0 disables it
    #[arg(long, default_value_t = defaults::L2_REGULARIZATION_STRENGTH)]
    pub l2_regularization_strength: f32,

    /// RMS level below which leading and trailing audio is trimmed
    #[arg(long)]
    pub silence_threshold: Option<f32>,

    /// One of adam, sgd, rmsprop
    #[arg(long, default_value = "adam")]
    pub optimizer: OptimizerKind,

    /// Momentum for sgd and rmsprop
    #[arg(long, default_value_t = defaults::MOMENTUM)]
    pub momentum: f32,

    /// Write parameter histograms on checkpoint steps
    #[arg(long)]
    pub histograms: bool,

    /// Global conditioning embedding width; enables GC
    #[arg(long)]
    pub gc_channels: Option<usize>,

    /// Channels per frame in the LC files
    #[arg(long)]
    pub initial_lc_channels: Option<usize>,

    /// Projected LC channels; enables LC
    #[arg(long)]
    pub lc_channels: Option<usize>,

    /// Extension of the LC files
    #[arg(long)]
    pub lc_fileformat: Option<String>,

    /// Checkpoints kept on disk
    #[arg(long, default_value_t = defaults::MAX_CHECKPOINTS)]
    pub max_checkpoints: usize,

    /// Audio reader threads
    #[arg(long, default_value_t = defaults::NUM_READERS)]
    pub num_readers: usize,

    /// Capacity of the example and batch queues
    #[arg(long, default_value_t = defaults::QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Seed for file order and parameter init; defaults to the start time
    #[arg(long)]
    pub seed: Option<u64>,
}

impl From<TrainArgs> for RawArgs {
    fn from(args: TrainArgs) -> Self {
        RawArgs {
            batch_size: args.batch_size,
            data_dir: args.data_dir,
            store_metadata: args.store_metadata,
            metadata_every: args.metadata_every,
            logdir: args.logdir,
            logdir_root: args.logdir_root,
            restore_from: args.restore_from,
            checkpoint_every: args.checkpoint_every,
            num_steps: args.num_steps,
            learning_rate: args.learning_rate,
            wavenet_params: args.wavenet_params,
            sample_size: args.sample_size,
            l2_regularization_strength: args.l2_regularization_strength,
            silence_threshold: args.silence_threshold,
            optimizer: args.optimizer,
            momentum: args.momentum,
            histograms: args.histograms,
            gc_channels: args.gc_channels,
            initial_lc_channels: args.initial_lc_channels,
            lc_channels: args.lc_channels,
            lc_fileformat: args.lc_fileformat,
            max_checkpoints: args.max_checkpoints,
            num_readers: args.num_readers,
            queue_capacity: args.queue_capacity,
            seed: args.seed,
        }
    }
}
