//! Core type definitions for the training runtime

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Checkpoint identifier, e.g. `model.ckpt-150`
pub type CheckpointId = String;

/// Global training step counter
pub type Step = u64;

/// A named, shaped block of trainable or optimizer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    /// Fully qualified name, e.g. `wavenet/transition`
    pub name: String,

    /// Dimensions, row-major
    pub shape: Vec<usize>,

    /// Flattened values
    pub data: Vec<f32>,
}

impl NamedTensor {
    /// Create a tensor filled with zeros
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            data: vec![0.0; len],
        }
    }

    /// Create a tensor from existing values; the value count must match the shape
    pub fn from_vec(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::StateMismatch {
                name,
                reason: format!("shape {:?} needs {} values, got {}", shape, expected, data.len()),
            });
        }
        Ok(Self { name, shape, data })
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the values in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// Explicit handle to persisted state.
///
/// Models and optimizers expose their parameters through this trait so the
/// checkpoint manager never has to discover them.
pub trait StateDict {
    /// Snapshot all persisted tensors
    fn export_state(&self) -> Vec<NamedTensor>;

    /// Replace all persisted tensors. Every owned tensor must be present with
    /// an identical shape.
    fn import_state(&mut self, tensors: Vec<NamedTensor>) -> Result<()>;

    /// Names of all persisted tensors
    fn state_names(&self) -> Vec<String> {
        self.export_state().into_iter().map(|t| t.name).collect()
    }
}

/// Copy `incoming` into `targets` by name, validating shapes.
///
/// Fails if a target is missing from `incoming`, if shapes differ, or if
/// `incoming` carries names the targets do not know.
pub fn assign_tensors(targets: &mut [NamedTensor], incoming: Vec<NamedTensor>) -> Result<()> {
    let mut by_name: HashMap<String, NamedTensor> =
        incoming.into_iter().map(|t| (t.name.clone(), t)).collect();

    // Validate everything before touching live state
    for target in targets.iter() {
        match by_name.get(&target.name) {
            None => {
                return Err(Error::StateMismatch {
                    name: target.name.clone(),
                    reason: "missing from checkpoint".to_string(),
                })
            }
            Some(t) if t.shape != target.shape => {
                return Err(Error::StateMismatch {
                    name: target.name.clone(),
                    reason: format!("expected shape {:?}, got {:?}", target.shape, t.shape),
                })
            }
            Some(t) if t.data.len() != target.data.len() => {
                return Err(Error::StateMismatch {
                    name: target.name.clone(),
                    reason: format!("expected {} values, got {}", target.data.len(), t.data.len()),
                })
            }
            Some(_) => {}
        }
    }

    if by_name.len() > targets.len() {
        let mut unknown: Vec<_> = by_name
            .keys()
            .filter(|name| !targets.iter().any(|t| &t.name == *name))
            .cloned()
            .collect();
        unknown.sort();
        return Err(Error::StateMismatch {
            name: unknown.join(", "),
            reason: "not present in the live state".to_string(),
        });
    }

    for target in targets.iter_mut() {
        if let Some(t) = by_name.remove(&target.name) {
            target.data = t.data;
        }
    }
    Ok(())
}

/// Checkpoint metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Checkpoint identifier (`model.ckpt-<step>`)
    pub id: CheckpointId,

    /// Training step at checkpoint
    pub step: Step,

    /// Storage path
    pub path: String,

    /// Checkpoint size in bytes
    pub size_bytes: u64,

    /// Timestamp when checkpoint was created
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(NamedTensor::from_vec("w", vec![2, 3], vec![0.0; 6]).is_ok());
        let err = NamedTensor::from_vec("w", vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, Error::StateMismatch { .. }));
    }

    #[test]
    fn test_assign_tensors() {
        let mut targets = vec![
            NamedTensor::zeros("a", vec![2]),
            NamedTensor::zeros("b", vec![1, 2]),
        ];
        let incoming = vec![
            NamedTensor::from_vec("b", vec![1, 2], vec![3.0, 4.0]).unwrap(),
            NamedTensor::from_vec("a", vec![2], vec![1.0, 2.0]).unwrap(),
        ];

        assign_tensors(&mut targets, incoming).unwrap();
        assert_eq!(targets[0].data, vec![1.0, 2.0]);
        assert_eq!(targets[1].data, vec![3.0, 4.0]);
    }

    #[test]
    fn test_assign_tensors_shape_mismatch_leaves_state_untouched() {
        let mut targets = vec![
            NamedTensor::zeros("a", vec![2]),
            NamedTensor::zeros("b", vec![2, 2]),
        ];
        let incoming = vec![
            NamedTensor::from_vec("a", vec![2], vec![1.0, 2.0]).unwrap(),
            NamedTensor::from_vec("b", vec![4], vec![1.0; 4]).unwrap(),
        ];

        let err = assign_tensors(&mut targets, incoming).unwrap_err();
        assert!(matches!(err, Error::StateMismatch { ref name, .. } if name == "b"));
        assert_eq!(targets[0].data, vec![0.0, 0.0]);
    }

    #[test]
    fn test_assign_tensors_missing_and_unknown() {
        let mut targets = vec![NamedTensor::zeros("a", vec![1])];
        assert!(assign_tensors(&mut targets, vec![]).is_err());

        let incoming = vec![
            NamedTensor::zeros("a", vec![1]),
            NamedTensor::zeros("extra", vec![1]),
        ];
        let err = assign_tensors(&mut targets, incoming).unwrap_err();
        assert!(err.to_string().contains("extra"));
    }
}
