//! Error types for the training runtime

use thiserror::Error;

/// Result type alias using the runtime Error
pub type Result<T> = std::result::Result<T, Error>;

/// Conflicting or incomplete run options, detected before any side effect
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("--logdir and --logdir-root cannot be specified at the same time.")]
    LogdirWithLogdirRoot,

    #[error(
        "--logdir and --restore-from cannot be specified at the same time. \
         This is to keep your previous model from unexpected overwrites. \
         Use --logdir-root to specify the root of the directory which will be \
         automatically created with current date and time, or use only --logdir \
         to just continue the training from the last checkpoint."
    )]
    LogdirWithRestoreFrom,

    #[error("--initial-lc-channels must be specified when local conditioning is enabled (--lc-channels).")]
    MissingInitialLcChannels,

    #[error("--lc-fileformat must be specified when local conditioning is enabled (--lc-channels).")]
    MissingLcFileFormat,

    #[error("--lc-channels has to be set when --lc-fileformat is specified.")]
    DanglingLcFileFormat,

    #[error("--lc-channels has to be set when --initial-lc-channels is specified.")]
    DanglingInitialLcChannels,

    #[error("--{option}: {reason}")]
    InvalidValue { option: &'static str, reason: String },
}

/// Core error type for the training runtime
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Invalid configuration: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Invalid network parameters in {path}: {message}")]
    InvalidParams { path: String, message: String },

    // Checkpoint errors
    #[error("Failed to restore checkpoint {checkpoint}: {reason}")]
    Restore { checkpoint: String, reason: String },

    #[error("Checkpoint write failed: {message}")]
    CheckpointWriteFailed { message: String },

    #[error("Checkpoint corrupted: {checkpoint_id} - {reason}")]
    CheckpointCorrupted { checkpoint_id: String, reason: String },

    #[error("State mismatch for {name}: {reason}")]
    StateMismatch { name: String, reason: String },

    // Storage errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Data pipeline errors
    #[error("Corpus error: {message}")]
    Corpus { message: String },

    #[error("Audio error in {path}: {message}")]
    Audio { path: String, message: String },

    #[error("Pipeline worker {worker} failed: {message}")]
    Worker { worker: String, message: String },

    #[error("Channel closed: {channel}")]
    ChannelClosed { channel: String },

    // Training errors
    #[error("Training step {step} failed: {message}")]
    Step { step: u64, message: String },

    #[error("Model error: {message}")]
    Model { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true for user-input conflicts reported before any side effect
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::InvalidParams { .. })
    }

    /// Returns true if this error must abort startup to protect existing checkpoints
    pub fn is_restore(&self) -> bool {
        matches!(self, Error::Restore { .. })
    }

    /// Returns true if this error indicates a fatal condition
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Restore { .. }
                | Error::CheckpointCorrupted { .. }
                | Error::Configuration(_)
                | Error::Internal { .. }
        )
    }

    /// Wrap any error raised while restoring a checkpoint as a restore failure
    pub fn into_restore(self, checkpoint: impl Into<String>) -> Self {
        match self {
            Error::Restore { .. } => self,
            other => Error::Restore {
                checkpoint: checkpoint.into(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
