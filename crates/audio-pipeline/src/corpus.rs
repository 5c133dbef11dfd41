//! Corpus discovery
//!
//! Walks the data directory for WAV files, pairs each with its
//! local-conditioning file when enabled and parses global-conditioning ids
//! from VCTK-style names.

use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use train_core::{Error, Result};
use walkdir::WalkDir;

use crate::audio::{load_lc, load_wav, LcFeatures};

/// One decoded utterance, before trimming and cutting
#[derive(Debug, Clone)]
pub struct AudioItem {
    /// Display name used in log messages
    pub name: String,
    pub samples: Vec<f32>,
    pub gc_id: Option<u32>,
    pub lc: Option<LcFeatures>,
}

/// Random-access source of utterances shared by the reader threads
pub trait ItemSource: Send + Sync + 'static {
    /// Number of items
    fn len(&self) -> usize;

    /// Decode the item at `index`
    fn load(&self, index: usize) -> Result<AudioItem>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A discovered audio file and its conditioning inputs
#[derive(Debug, Clone, PartialEq)]
pub struct CorpusEntry {
    pub audio: PathBuf,
    pub gc_id: Option<u32>,
    pub lc: Option<PathBuf>,
}

/// Local-conditioning pairing rule
#[derive(Debug, Clone)]
pub struct LcPairing {
    /// Rows in each LC file have this many values
    pub channels: usize,

    /// Extension of LC files, without the leading dot
    pub file_format: String,
}

/// Corpus discovery options
#[derive(Debug, Clone)]
pub struct CorpusOptions {
    pub sample_rate: u32,
    pub gc_enabled: bool,
    pub lc: Option<LcPairing>,
}

/// Audio files under a data directory
#[derive(Debug, Clone)]
pub struct Corpus {
    entries: Vec<CorpusEntry>,
    options: CorpusOptions,
}

impl Corpus {
    /// Recursively discover `*.wav` files under `data_dir`.
    ///
    /// Fails when no audio is found, when GC is enabled and a file name does
    /// not carry a speaker id, or when LC is enabled and a file has no
    /// paired LC file.
    pub fn discover(data_dir: &Path, options: CorpusOptions) -> Result<Self> {
        let files = find_files(data_dir, "wav")?;
        if files.is_empty() {
            return Err(Error::Corpus {
                message: format!("No audio files found in '{}'", data_dir.display()),
            });
        }

        let pattern = gc_pattern()?;
        let mut entries = Vec::with_capacity(files.len());
        for audio in files {
            let gc_id = if options.gc_enabled {
                let id = gc_id_from_name(&pattern, &audio).ok_or_else(|| Error::Corpus {
                    message: format!(
                        "Global conditioning is enabled, but file '{}' has no speaker id in its name",
                        audio.display()
                    ),
                })?;
                Some(id)
            } else {
                None
            };

            let lc = match &options.lc {
                Some(pairing) => {
                    let lc_path = audio.with_extension(&pairing.file_format);
                    if !lc_path.is_file() {
                        return Err(Error::Corpus {
                            message: format!(
                                "Local conditioning is enabled, but '{}' has no '{}' file",
                                audio.display(),
                                pairing.file_format
                            ),
                        });
                    }
                    Some(lc_path)
                }
                None => None,
            };

            entries.push(CorpusEntry { audio, gc_id, lc });
        }

        let corpus = Self { entries, options };
        info!(
            data_dir = %data_dir.display(),
            files = corpus.entries.len(),
            gc_cardinality = ?corpus.gc_cardinality(),
            "Discovered corpus"
        );
        Ok(corpus)
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    /// Number of distinct GC ids the model must embed: `max id + 1`
    pub fn gc_cardinality(&self) -> Option<usize> {
        self.entries
            .iter()
            .filter_map(|e| e.gc_id)
            .max()
            .map(|id| id as usize + 1)
    }
}

impl ItemSource for Corpus {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn load(&self, index: usize) -> Result<AudioItem> {
        let entry = self.entries.get(index).ok_or_else(|| Error::Internal {
            message: format!("corpus index {} out of range", index),
        })?;

        let samples = load_wav(&entry.audio, self.options.sample_rate)?;
        let lc = match (&entry.lc, &self.options.lc) {
            (Some(path), Some(pairing)) => Some(load_lc(path, pairing.channels)?),
            _ => None,
        };
        debug!(file = %entry.audio.display(), samples = samples.len(), "Decoded audio");

        Ok(AudioItem {
            name: entry.audio.display().to_string(),
            samples,
            gc_id: entry.gc_id,
            lc,
        })
    }
}

fn find_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::Corpus {
            message: format!("Data directory '{}' does not exist", dir.display()),
        });
    }

    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case(extension))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files)
}

fn gc_pattern() -> Result<Regex> {
    Regex::new(r"p([0-9]+)_([0-9]+)\.wav$").map_err(|e| Error::Internal {
        message: format!("invalid speaker id pattern: {}", e),
    })
}

/// Speaker id of a VCTK-style file name such as `p225_001.wav`
fn gc_id_from_name(pattern: &Regex, path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_string_lossy();
    let captures = pattern.captures(&name)?;
    captures.get(1)?.as_str().parse().ok()
}
