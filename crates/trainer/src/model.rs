//! Model contract
//!
//! The training loop only needs a model that runs one optimization step on a
//! batch and exposes its parameters through [`StateDict`].

use audio_pipeline::Batch;
use std::collections::HashSet;
use train_core::{NamedTensor, Result, StateDict};

use crate::optimizer::Optimizer;
use crate::profiling::StepTrace;

/// Result of one optimization step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutput {
    pub loss: f32,
}

/// A trainable network
pub trait Model: StateDict + Send {
    /// Compute the loss on `batch` and apply one update through `optimizer`.
    ///
    /// When `trace` is enabled the model records its phases into it.
    fn train_step(
        &mut self,
        batch: &Batch,
        optimizer: &mut dyn Optimizer,
        trace: &mut StepTrace,
    ) -> Result<StepOutput>;
}

/// Everything a checkpoint persists: model parameters plus optimizer slots
pub struct TrainingState<'a> {
    pub model: &'a mut dyn Model,
    pub optimizer: &'a mut dyn Optimizer,
}

impl<'a> TrainingState<'a> {
    pub fn new(model: &'a mut dyn Model, optimizer: &'a mut dyn Optimizer) -> Self {
        Self { model, optimizer }
    }
}

impl StateDict for TrainingState<'_> {
    fn export_state(&self) -> Vec<NamedTensor> {
        let mut state = self.model.export_state();
        state.extend(self.optimizer.export_state());
        state
    }

    fn import_state(&mut self, tensors: Vec<NamedTensor>) -> Result<()> {
        let optimizer_names: HashSet<String> = self.optimizer.state_names().into_iter().collect();
        let (slots, params): (Vec<_>, Vec<_>) = tensors
            .into_iter()
            .partition(|t| optimizer_names.contains(&t.name));

        self.model.import_state(params)?;
        self.optimizer.import_state(slots)
    }
}
