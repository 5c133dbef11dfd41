//! Network hyper-parameters loaded from the `--wavenet-params` JSON file

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Hyper-parameters of the sequence model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveNetParams {
    pub filter_width: usize,
    pub sample_rate: u32,
    pub dilations: Vec<usize>,
    pub residual_channels: usize,
    pub dilation_channels: usize,
    pub quantization_channels: usize,
    pub skip_channels: usize,
    pub use_biases: bool,
    pub scalar_input: bool,
    pub initial_filter_width: usize,
}

impl Default for WaveNetParams {
    fn default() -> Self {
        let mut dilations = Vec::with_capacity(50);
        for _ in 0..5 {
            dilations.extend((0..10).map(|i| 1usize << i));
        }
        Self {
            filter_width: 2,
            sample_rate: 16000,
            dilations,
            residual_channels: 32,
            dilation_channels: 32,
            quantization_channels: 256,
            skip_channels: 512,
            use_biases: true,
            scalar_input: false,
            initial_filter_width: 32,
        }
    }
}

impl WaveNetParams {
    /// Load and validate a params file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::InvalidParams {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let params: Self = serde_json::from_str(&raw).map_err(|e| Error::InvalidParams {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        params.validate().map_err(|message| Error::InvalidParams {
            path: path.display().to_string(),
            message,
        })?;
        Ok(params)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.filter_width == 0 {
            return Err("filter_width must be positive".to_string());
        }
        if self.initial_filter_width == 0 {
            return Err("initial_filter_width must be positive".to_string());
        }
        if self.quantization_channels < 2 {
            return Err("quantization_channels must be at least 2".to_string());
        }
        if self.sample_rate == 0 {
            return Err("sample_rate must be positive".to_string());
        }
        Ok(())
    }

    /// Number of input samples that influence one prediction
    pub fn receptive_field(&self) -> usize {
        calculate_receptive_field(
            self.filter_width,
            &self.dilations,
            self.scalar_input,
            self.initial_filter_width,
        )
    }
}

/// Receptive field of a dilated causal stack.
///
/// `(filter_width - 1) * sum(dilations) + 1`, plus the width of the initial
/// causal layer minus one.
pub fn calculate_receptive_field(
    filter_width: usize,
    dilations: &[usize],
    scalar_input: bool,
    initial_filter_width: usize,
) -> usize {
    let mut receptive_field = (filter_width - 1) * dilations.iter().sum::<usize>() + 1;
    if scalar_input {
        receptive_field += initial_filter_width - 1;
    } else {
        receptive_field += filter_width - 1;
    }
    receptive_field
}
