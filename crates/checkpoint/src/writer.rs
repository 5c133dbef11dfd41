//! Snapshot file format
//!
//! A snapshot is a small little-endian header followed by a `bincode`
//! payload holding every persisted tensor:
//!
//! ```text
//! magic "CKPT" | version u32 | step u64 | payload_size u64 | meta_len u32 | meta JSON | payload
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use train_core::{Error, NamedTensor, Result, Step};

/// Magic bytes for snapshot files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// Snapshot format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// magic + version + step + payload size + metadata length
const FIXED_HEADER_LEN: usize = 4 + 4 + 8 + 8 + 4;

/// Descriptive block stored in the header, readable without the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub created_at: DateTime<Utc>,
    pub tensor_names: Vec<String>,
    pub total_values: usize,
}

/// Decoded snapshot header
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointHeader {
    pub version: u32,
    pub step: Step,
    pub payload_size: u64,
    pub metadata: SnapshotMetadata,
}

/// A fully decoded snapshot
#[derive(Debug)]
pub struct Snapshot {
    pub header: CheckpointHeader,
    pub tensors: Vec<NamedTensor>,
}

/// Serialize `tensors` into snapshot bytes tagged with `step`
pub fn encode_snapshot(step: Step, tensors: &[NamedTensor]) -> Result<Bytes> {
    let payload = bincode::serialize(tensors)?;
    let metadata = SnapshotMetadata {
        created_at: Utc::now(),
        tensor_names: tensors.iter().map(|t| t.name.clone()).collect(),
        total_values: tensors.iter().map(NamedTensor::numel).sum(),
    };
    let metadata_json = serde_json::to_vec(&metadata)?;

    let mut buf = BytesMut::with_capacity(FIXED_HEADER_LEN + metadata_json.len() + payload.len());
    buf.put_slice(&CHECKPOINT_MAGIC);
    buf.put_u32_le(CHECKPOINT_VERSION);
    buf.put_u64_le(step);
    buf.put_u64_le(payload.len() as u64);
    buf.put_u32_le(metadata_json.len() as u32);
    buf.put_slice(&metadata_json);
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

/// Parse only the header of a snapshot
pub fn decode_header(checkpoint_id: &str, data: &[u8]) -> Result<(CheckpointHeader, usize)> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        checkpoint_id: checkpoint_id.to_string(),
        reason,
    };

    if data.len() < FIXED_HEADER_LEN {
        return Err(corrupted(format!(
            "file is {} bytes, shorter than the {} byte header",
            data.len(),
            FIXED_HEADER_LEN
        )));
    }
    if data[0..4] != CHECKPOINT_MAGIC {
        return Err(corrupted("invalid checkpoint magic".to_string()));
    }

    let version = u32::from_le_bytes(le_bytes(&data[4..8]));
    if version != CHECKPOINT_VERSION {
        return Err(corrupted(format!(
            "unsupported format version {} (expected {})",
            version, CHECKPOINT_VERSION
        )));
    }
    let step = u64::from_le_bytes(le_bytes(&data[8..16]));
    let payload_size = u64::from_le_bytes(le_bytes(&data[16..24]));
    let meta_len = u32::from_le_bytes(le_bytes(&data[24..28])) as usize;

    let meta_end = FIXED_HEADER_LEN + meta_len;
    if data.len() < meta_end {
        return Err(corrupted("truncated metadata block".to_string()));
    }
    let metadata: SnapshotMetadata = serde_json::from_slice(&data[FIXED_HEADER_LEN..meta_end])
        .map_err(|e| corrupted(format!("invalid metadata: {}", e)))?;

    Ok((
        CheckpointHeader {
            version,
            step,
            payload_size,
            metadata,
        },
        meta_end,
    ))
}

/// Parse a complete snapshot, validating sizes and tensor shapes
pub fn decode_snapshot(checkpoint_id: &str, data: &[u8]) -> Result<Snapshot> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        checkpoint_id: checkpoint_id.to_string(),
        reason,
    };

    let (header, offset) = decode_header(checkpoint_id, data)?;
    let payload = &data[offset..];
    if payload.len() as u64 != header.payload_size {
        return Err(corrupted(format!(
            "payload is {} bytes, header says {}",
            payload.len(),
            header.payload_size
        )));
    }

    let tensors: Vec<NamedTensor> = bincode::deserialize(payload)
        .map_err(|e| corrupted(format!("invalid payload: {}", e)))?;

    for tensor in &tensors {
        let expected: usize = tensor.shape.iter().product();
        if expected != tensor.data.len() {
            return Err(corrupted(format!(
                "tensor {} has {} values for shape {:?}",
                tensor.name,
                tensor.data.len(),
                tensor.shape
            )));
        }
    }

    Ok(Snapshot { header, tensors })
}

fn le_bytes<const N: usize>(slice: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tensors() -> Vec<NamedTensor> {
        vec![
            NamedTensor::from_vec("wavenet/embedding", vec![2, 3], vec![0.5; 6]).unwrap(),
            NamedTensor::from_vec("wavenet/bias", vec![3], vec![1.0, -1.0, 0.25]).unwrap(),
        ]
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let tensors = sample_tensors();
        let bytes = encode_snapshot(42, &tensors).unwrap();

        assert_eq!(&bytes[0..4], b"CKPT");

        let snapshot = decode_snapshot("model.ckpt-42", &bytes).unwrap();
        assert_eq!(snapshot.header.step, 42);
        assert_eq!(snapshot.header.version, CHECKPOINT_VERSION);
        assert_eq!(
            snapshot.header.metadata.tensor_names,
            vec!["wavenet/embedding", "wavenet/bias"]
        );
        assert_eq!(snapshot.header.metadata.total_values, 9);
        assert_eq!(snapshot.tensors, tensors);
    }

    #[test]
    fn test_header_only() {
        let bytes = encode_snapshot(7, &sample_tensors()).unwrap();
        let (header, offset) = decode_header("model.ckpt-7", &bytes).unwrap();
        assert_eq!(header.step, 7);
        assert_eq!(bytes.len() - offset, header.payload_size as usize);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode_snapshot(1, &sample_tensors()).unwrap().to_vec();
        bytes[0] = b'X';
        let err = decode_snapshot("model.ckpt-1", &bytes).unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn test_truncated_payload() {
        let bytes = encode_snapshot(1, &sample_tensors()).unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        let err = decode_snapshot("model.ckpt-1", truncated).unwrap_err();
        assert!(err.to_string().contains("payload"));
    }

    #[test]
    fn test_short_file() {
        let err = decode_snapshot("model.ckpt-1", b"CKPT").unwrap_err();
        assert!(matches!(err, Error::CheckpointCorrupted { .. }));
    }
}
