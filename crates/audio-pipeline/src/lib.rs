//! Audio data pipeline for WaveNet training
//!
//! This crate provides:
//! - **Corpus discovery** with speaker-id parsing and local-conditioning pairing
//! - **Audio preprocessing**: WAV decoding, silence trimming, receptive-field cutting
//! - **Pipeline coordination**: reader threads and a batch feeder behind bounded
//!   queues, with a shared stop signal and an explicit join
//!
//! # Example
//!
//! ```no_run
//! use audio_pipeline::{Corpus, CorpusOptions, PipelineConfig, PipelineCoordinator};
//! use std::sync::Arc;
//!
//! # fn example() -> train_core::Result<()> {
//! let corpus = Corpus::discover(
//!     "./VCTK-Corpus".as_ref(),
//!     CorpusOptions { sample_rate: 16000, gc_enabled: true, lc: None },
//! )?;
//!
//! let mut pipeline = PipelineCoordinator::start(Arc::new(corpus), PipelineConfig::default())?;
//! let batch = pipeline.next_batch()?;
//! pipeline.join()?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod corpus;
pub mod pipeline;

pub use audio::{cut_pieces, load_lc, load_wav, trim_silence, LcFeatures};
pub use corpus::{AudioItem, Corpus, CorpusEntry, CorpusOptions, ItemSource, LcPairing};
pub use pipeline::{
    epoch_order, prepare_examples, Batch, Example, PipelineConfig, PipelineCoordinator,
    StopSignal,
};
