//! Audio decoding and preprocessing
//!
//! Decoding goes through `hound`; trimming and cutting work on sample index
//! ranges so paired local-conditioning frames can be sliced with the same
//! proportions as the audio.

use std::ops::Range;
use std::path::Path;
use train_core::{Error, Result};

/// Analysis window of the silence detector
pub const SILENCE_FRAME_LENGTH: usize = 2048;

/// Hop between analysis windows
pub const SILENCE_HOP_LENGTH: usize = 512;

/// Decode a WAV file into mono `f32` samples in `[-1, 1]`.
///
/// Integer PCM is scaled by its bit depth, multi-channel audio is averaged
/// down to one channel. The file's sample rate must equal `sample_rate`.
pub fn load_wav(path: &Path, sample_rate: u32) -> Result<Vec<f32>> {
    let audio_err = |message: String| Error::Audio {
        path: path.display().to_string(),
        message,
    };

    let mut reader =
        hound::WavReader::open(path).map_err(|e| audio_err(format!("failed to read WAV: {}", e)))?;
    let spec = reader.spec();

    if spec.sample_rate != sample_rate {
        return Err(audio_err(format!(
            "sample rate is {} Hz, the network expects {} Hz",
            spec.sample_rate, sample_rate
        )));
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<std::result::Result<_, _>>()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
    }
    .map_err(|e| audio_err(format!("failed to decode samples: {}", e)))?;

    let channels = spec.channels.max(1) as usize;
    if channels == 1 {
        return Ok(interleaved);
    }

    Ok(interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect())
}

/// Span of `samples` between the first and last analysis frame whose RMS
/// energy exceeds `threshold`, or `None` when every frame is below it.
pub fn trim_silence(samples: &[f32], threshold: f32) -> Option<Range<usize>> {
    let mut first = None;
    let mut last = None;

    let mut start = 0;
    while start < samples.len() {
        let end = (start + SILENCE_FRAME_LENGTH).min(samples.len());
        if frame_rms(&samples[start..end]) > threshold {
            if first.is_none() {
                first = Some(start);
            }
            last = Some(end);
        }
        start += SILENCE_HOP_LENGTH;
    }

    match (first, last) {
        (Some(first), Some(last)) if first < last => Some(first..last),
        _ => None,
    }
}

fn frame_rms(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let energy: f32 = frame.iter().map(|s| s * s).sum();
    (energy / frame.len() as f32).sqrt()
}

/// Pieces of a buffer of `len` samples that has been prefixed with
/// `receptive_field` zeros.
///
/// `len` counts the padded buffer. With a sample size `n`, each piece holds
/// up to `receptive_field + n` samples and consecutive pieces advance by
/// `n`; pieces are emitted while more than `receptive_field` samples remain.
/// Without a sample size the whole buffer is a single piece.
pub fn cut_pieces(len: usize, receptive_field: usize, sample_size: Option<usize>) -> Vec<Range<usize>> {
    let n = match sample_size {
        Some(n) if n > 0 => n,
        _ => return if len > 0 { vec![0..len] } else { Vec::new() },
    };

    let mut pieces = Vec::new();
    let mut start = 0;
    while start + receptive_field < len {
        pieces.push(start..(start + receptive_field + n).min(len));
        start += n;
    }
    pieces
}

/// Local-conditioning features: `num_frames` rows of `channels` values
#[derive(Debug, Clone, PartialEq)]
pub struct LcFeatures {
    pub channels: usize,
    pub values: Vec<f32>,
}

impl LcFeatures {
    pub fn new(channels: usize, values: Vec<f32>) -> Result<Self> {
        if channels == 0 || values.len() % channels != 0 {
            return Err(Error::Corpus {
                message: format!(
                    "{} local-conditioning values do not form rows of {} channels",
                    values.len(),
                    channels
                ),
            });
        }
        Ok(Self { channels, values })
    }

    pub fn num_frames(&self) -> usize {
        self.values.len() / self.channels
    }

    /// Frames aligned with `samples` out of an utterance of `total_samples`.
    /// Non-empty sample ranges always map to at least one frame.
    pub fn slice_for(&self, samples: Range<usize>, total_samples: usize) -> LcFeatures {
        let frames = self.num_frames();
        if frames == 0 || total_samples == 0 {
            return LcFeatures {
                channels: self.channels,
                values: Vec::new(),
            };
        }

        let mut start = samples.start * frames / total_samples;
        let mut end = (samples.end * frames).div_ceil(total_samples).min(frames);
        if samples.start < samples.end && start >= end {
            start = start.min(frames - 1);
            end = start + 1;
        }

        LcFeatures {
            channels: self.channels,
            values: self.values[start * self.channels..end * self.channels].to_vec(),
        }
    }
}

/// Read raw little-endian `f32` local-conditioning rows
pub fn load_lc(path: &Path, channels: usize) -> Result<LcFeatures> {
    let bytes = std::fs::read(path).map_err(|e| Error::Audio {
        path: path.display().to_string(),
        message: format!("failed to read local-conditioning file: {}", e),
    })?;

    if bytes.len() % 4 != 0 {
        return Err(Error::Audio {
            path: path.display().to_string(),
            message: format!("{} bytes is not a whole number of f32 values", bytes.len()),
        });
    }

    let values = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();

    LcFeatures::new(channels, values).map_err(|e| Error::Audio {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_wav(path: &Path, spec: hound::WavSpec, samples: &[i16]) {
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for s in samples {
            writer.write_sample(*s).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_load_wav_mono_int() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p225_001.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, &[0, 16384, -16384, i16::MIN]);

        let samples = load_wav(&path, 16000).unwrap();
        assert_eq!(samples, vec![0.0, 0.5, -0.5, -1.0]);
    }

    #[test]
    fn test_load_wav_downmixes_stereo() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, &[16384, 0, -16384, -16384]);

        let samples = load_wav(&path, 16000).unwrap();
        assert_eq!(samples, vec![0.25, -0.5]);
    }

    #[test]
    fn test_load_wav_rejects_other_sample_rate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fast.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        write_wav(&path, spec, &[1, 2, 3]);

        let err = load_wav(&path, 16000).unwrap_err();
        assert!(matches!(err, Error::Audio { .. }));
        assert!(err.to_string().contains("22050"));
    }

    #[test]
    fn test_trim_silence() {
        let mut samples = vec![0.0f32; 8192];
        for s in &mut samples[4096..5120] {
            *s = 0.5;
        }

        let range = trim_silence(&samples, 0.01).unwrap();
        assert!(range.start <= 4096);
        assert!(range.end >= 5120);
        assert!(range.start > 0);
        assert!(range.end < samples.len());

        assert_eq!(trim_silence(&vec![0.0; 4096], 0.01), None);
        assert_eq!(trim_silence(&[], 0.01), None);
    }

    #[test]
    fn test_cut_pieces() {
        // receptive field 3, sample size 4, 10 audio samples -> 13 padded
        let pieces = cut_pieces(13, 3, Some(4));
        assert_eq!(pieces, vec![0..7, 4..11, 8..13]);

        // Every piece starts with a full receptive field of context
        for piece in &pieces {
            assert!(piece.len() > 3);
        }

        assert_eq!(cut_pieces(13, 3, None), vec![0..13]);
        assert_eq!(cut_pieces(3, 3, Some(4)), Vec::<Range<usize>>::new());
    }

    #[test]
    fn test_lc_slice_for() {
        // 4 frames of 2 channels over 8 samples -> 2 samples per frame
        let lc = LcFeatures::new(2, (0..8).map(|v| v as f32).collect()).unwrap();
        assert_eq!(lc.num_frames(), 4);

        let slice = lc.slice_for(2..6, 8);
        assert_eq!(slice.values, vec![2.0, 3.0, 4.0, 5.0]);

        let slice = lc.slice_for(3..4, 8);
        assert_eq!(slice.num_frames(), 1);
    }

    #[test]
    fn test_load_lc() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p225_001.lc");
        let bytes: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        std::fs::write(&path, bytes).unwrap();

        let lc = load_lc(&path, 2).unwrap();
        assert_eq!(lc.num_frames(), 2);
        assert!(load_lc(&path, 3).is_err());
    }
}
