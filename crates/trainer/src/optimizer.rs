//! Optimizers
//!
//! Each optimizer owns one slot tensor per parameter slot (moments,
//! velocities) and persists them through [`StateDict`], so a restored run
//! continues with the same update state. Slots are created up front by
//! [`Optimizer::register`]; a restore needs them to exist.

use train_core::{assign_tensors, Error, NamedTensor, OptimizerKind, Result, StateDict};

/// Update rule applied to the model parameters after each step
pub trait Optimizer: StateDict + Send {
    /// Registered name, as accepted by `--optimizer`
    fn name(&self) -> &'static str;

    /// Create zeroed slots for `params`
    fn register(&mut self, params: &[NamedTensor]);

    /// Apply `gradients[i]` to `params[i]`
    fn apply_gradients(&mut self, params: &mut [NamedTensor], gradients: &[Vec<f32>]) -> Result<()>;
}

/// Build the optimizer registered under `kind` with slots for `params`
pub fn create_optimizer(
    kind: OptimizerKind,
    learning_rate: f32,
    momentum: f32,
    params: &[NamedTensor],
) -> Box<dyn Optimizer> {
    let mut optimizer: Box<dyn Optimizer> = match kind {
        OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
        OptimizerKind::Sgd => Box::new(Sgd::new(learning_rate, momentum)),
        OptimizerKind::Rmsprop => Box::new(RmsProp::new(learning_rate, momentum)),
    };
    optimizer.register(params);
    optimizer
}

/// Slot tensors keyed `<optimizer>/<param>/<slot>`, stored in registration order
#[derive(Debug, Clone, Default)]
struct Slots {
    tensors: Vec<NamedTensor>,
    per_param: usize,
}

impl Slots {
    fn register(&mut self, prefix: &str, params: &[NamedTensor], slot_names: &[&str]) {
        self.per_param = slot_names.len();
        self.tensors = params
            .iter()
            .flat_map(|param| {
                slot_names.iter().map(move |slot| {
                    NamedTensor::zeros(format!("{}/{}/{}", prefix, param.name, slot), param.shape.clone())
                })
            })
            .collect();
    }

    /// Slots of the `index`-th registered parameter
    fn for_param(&mut self, index: usize, param: &NamedTensor) -> Result<&mut [NamedTensor]> {
        let start = index * self.per_param;
        let end = start + self.per_param;
        match self.tensors.get_mut(start..end) {
            Some(slots) if slots.iter().all(|s| s.data.len() == param.data.len()) => Ok(slots),
            _ => Err(Error::Internal {
                message: format!("no optimizer slots registered for {}", param.name),
            }),
        }
    }
}

fn check_lengths(params: &[NamedTensor], gradients: &[Vec<f32>]) -> Result<()> {
    if params.len() != gradients.len() {
        return Err(Error::Model {
            message: format!("{} gradients for {} parameters", gradients.len(), params.len()),
        });
    }
    for (param, grad) in params.iter().zip(gradients) {
        if param.data.len() != grad.len() {
            return Err(Error::Model {
                message: format!(
                    "gradient for {} has {} values, expected {}",
                    param.name,
                    grad.len(),
                    param.data.len()
                ),
            });
        }
    }
    Ok(())
}

/// Adam with bias correction
#[derive(Debug)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    slots: Slots,
    /// Completed updates, persisted as `adam/step`
    step: NamedTensor,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            slots: Slots::default(),
            step: NamedTensor::zeros("adam/step", vec![1]),
        }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        "adam"
    }

    fn register(&mut self, params: &[NamedTensor]) {
        self.slots.register("adam", params, &["m", "v"]);
    }

    fn apply_gradients(&mut self, params: &mut [NamedTensor], gradients: &[Vec<f32>]) -> Result<()> {
        check_lengths(params, gradients)?;

        self.step.data[0] += 1.0;
        let t = self.step.data[0] as i32;
        let lr_t = self.learning_rate * (1.0 - self.beta2.powi(t)).sqrt() / (1.0 - self.beta1.powi(t));

        for (index, (param, grad)) in params.iter_mut().zip(gradients).enumerate() {
            let slots = self.slots.for_param(index, param)?;
            let (m, v) = slots.split_at_mut(1);
            for i in 0..grad.len() {
                let g = grad[i];
                m[0].data[i] = self.beta1 * m[0].data[i] + (1.0 - self.beta1) * g;
                v[0].data[i] = self.beta2 * v[0].data[i] + (1.0 - self.beta2) * g * g;
                param.data[i] -= lr_t * m[0].data[i] / (v[0].data[i].sqrt() + self.epsilon);
            }
        }
        Ok(())
    }
}

impl StateDict for Adam {
    fn export_state(&self) -> Vec<NamedTensor> {
        let mut state = self.slots.tensors.clone();
        state.push(self.step.clone());
        state
    }

    fn import_state(&mut self, tensors: Vec<NamedTensor>) -> Result<()> {
        let mut all = self.export_state();
        assign_tensors(&mut all, tensors)?;
        self.step = all.pop().unwrap_or_else(|| NamedTensor::zeros("adam/step", vec![1]));
        self.slots.tensors = all;
        Ok(())
    }
}

/// Gradient descent with momentum
#[derive(Debug)]
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    slots: Slots,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            slots: Slots::default(),
        }
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn register(&mut self, params: &[NamedTensor]) {
        self.slots.register("sgd", params, &["momentum"]);
    }

    fn apply_gradients(&mut self, params: &mut [NamedTensor], gradients: &[Vec<f32>]) -> Result<()> {
        check_lengths(params, gradients)?;

        for (index, (param, grad)) in params.iter_mut().zip(gradients).enumerate() {
            let velocity = &mut self.slots.for_param(index, param)?[0];
            for i in 0..grad.len() {
                velocity.data[i] = self.momentum * velocity.data[i] + grad[i];
                param.data[i] -= self.learning_rate * velocity.data[i];
            }
        }
        Ok(())
    }
}

impl StateDict for Sgd {
    fn export_state(&self) -> Vec<NamedTensor> {
        self.slots.tensors.clone()
    }

    fn import_state(&mut self, tensors: Vec<NamedTensor>) -> Result<()> {
        assign_tensors(&mut self.slots.tensors, tensors)
    }
}

/// RMSProp with momentum
#[derive(Debug)]
pub struct RmsProp {
    learning_rate: f32,
    decay: f32,
    momentum: f32,
    epsilon: f32,
    slots: Slots,
}

impl RmsProp {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            decay: 0.9,
            momentum,
            epsilon: 1e-10,
            slots: Slots::default(),
        }
    }
}

impl Optimizer for RmsProp {
    fn name(&self) -> &'static str {
        "rmsprop"
    }

    fn register(&mut self, params: &[NamedTensor]) {
        self.slots.register("rmsprop", params, &["ms", "mom"]);
    }

    fn apply_gradients(&mut self, params: &mut [NamedTensor], gradients: &[Vec<f32>]) -> Result<()> {
        check_lengths(params, gradients)?;

        for (index, (param, grad)) in params.iter_mut().zip(gradients).enumerate() {
            let slots = self.slots.for_param(index, param)?;
            let (ms, mom) = slots.split_at_mut(1);
            for i in 0..grad.len() {
                let g = grad[i];
                ms[0].data[i] = self.decay * ms[0].data[i] + (1.0 - self.decay) * g * g;
                mom[0].data[i] = self.momentum * mom[0].data[i]
                    + self.learning_rate * g / (ms[0].data[i] + self.epsilon).sqrt();
                param.data[i] -= mom[0].data[i];
            }
        }
        Ok(())
    }
}

impl StateDict for RmsProp {
    fn export_state(&self) -> Vec<NamedTensor> {
        self.slots.tensors.clone()
    }

    fn import_state(&mut self, tensors: Vec<NamedTensor>) -> Result<()> {
        assign_tensors(&mut self.slots.tensors, tensors)
    }
}
