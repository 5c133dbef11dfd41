//! Reference model
//!
//! A mu-law next-sample classifier: every sample is quantized to one of
//! `quantization_channels` classes and the next class is predicted from the
//! previous one through a transition matrix, optionally shifted by a
//! speaker embedding (global conditioning) and projected frame features
//! (local conditioning). It is small enough to train on a CPU and lets the
//! `train` binary run end to end.

use audio_pipeline::{Batch, Example};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use train_core::{
    assign_tensors, ConditioningSpec, Error, NamedTensor, Result, StateDict, WaveNetParams,
};

use crate::model::{Model, StepOutput};
use crate::optimizer::Optimizer;
use crate::profiling::StepTrace;

const TRANSITION: usize = 0;
const BIAS: usize = 1;
const INIT_SCALE: f32 = 0.05;

/// Quantize `x` in `[-1, 1]` with mu-law companding, `mu = channels - 1`
pub fn mu_law_encode(x: f32, channels: usize) -> usize {
    let mu = (channels - 1) as f32;
    let x = x.clamp(-1.0, 1.0);
    let magnitude = (1.0 + mu * x.abs()).ln() / (1.0 + mu).ln();
    let companded = x.signum() * magnitude;
    (((companded + 1.0) / 2.0 * mu + 0.5) as usize).min(channels - 1)
}

/// Shape of the reference model
#[derive(Debug, Clone)]
pub struct ReferenceModelConfig {
    pub quantization_channels: usize,
    pub receptive_field: usize,
    /// `(cardinality, embedding channels)`
    pub global_conditioning: Option<(usize, usize)>,
    /// `(input channels, projected channels)`
    pub local_conditioning: Option<(usize, usize)>,
    pub l2_regularization_strength: Option<f32>,
    pub seed: u64,
}

impl ReferenceModelConfig {
    pub fn new(
        params: &WaveNetParams,
        conditioning: &ConditioningSpec,
        gc_cardinality: Option<usize>,
        l2_regularization_strength: Option<f32>,
        seed: u64,
    ) -> Result<Self> {
        let global_conditioning = match (&conditioning.global, gc_cardinality) {
            (Some(gc), Some(cardinality)) => Some((cardinality, gc.channels)),
            (Some(_), None) => {
                return Err(Error::Model {
                    message: "global conditioning needs the speaker id cardinality".to_string(),
                })
            }
            (None, _) => None,
        };

        Ok(Self {
            quantization_channels: params.quantization_channels,
            receptive_field: params.receptive_field(),
            global_conditioning,
            local_conditioning: conditioning
                .local
                .as_ref()
                .map(|lc| (lc.initial_channels, lc.channels)),
            l2_regularization_strength,
            seed,
        })
    }
}

/// Mu-law bigram classifier with optional conditioning branches
#[derive(Debug)]
pub struct MuLawBigram {
    config: ReferenceModelConfig,
    params: Vec<NamedTensor>,
    /// Indices of the gc embedding and projection
    gc: Option<(usize, usize)>,
    /// Indices of the lc input and output projections
    lc: Option<(usize, usize)>,
}

impl MuLawBigram {
    pub fn new(config: ReferenceModelConfig) -> Self {
        let q = config.quantization_channels;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut random = |name: &str, shape: Vec<usize>| {
            let len: usize = shape.iter().product();
            NamedTensor {
                name: name.to_string(),
                shape,
                data: (0..len).map(|_| rng.gen_range(-INIT_SCALE..INIT_SCALE)).collect(),
            }
        };

        let mut params = vec![
            NamedTensor::zeros("wavenet/transition", vec![q, q]),
            NamedTensor::zeros("wavenet/bias", vec![q]),
        ];

        let gc = config.global_conditioning.map(|(cardinality, channels)| {
            params.push(random("wavenet/gc_embedding", vec![cardinality, channels]));
            params.push(random("wavenet/gc_projection", vec![channels, q]));
            (params.len() - 2, params.len() - 1)
        });
        let lc = config.local_conditioning.map(|(input, channels)| {
            params.push(random("wavenet/lc_input", vec![input, channels]));
            params.push(random("wavenet/lc_projection", vec![channels, q]));
            (params.len() - 2, params.len() - 1)
        });

        Self {
            config,
            params,
            gc,
            lc,
        }
    }

    pub fn parameters(&self) -> &[NamedTensor] {
        &self.params
    }

    /// Sum of per-position losses and gradients over a batch
    fn accumulate(&self, batch: &Batch, grads: &mut [Vec<f32>]) -> Result<(f64, usize)> {
        let mut loss = 0.0f64;
        let mut count = 0usize;
        for example in &batch.examples {
            let (l, c) = self.accumulate_example(example, grads)?;
            loss += l;
            count += c;
        }
        Ok((loss, count))
    }

    fn accumulate_example(&self, example: &Example, grads: &mut [Vec<f32>]) -> Result<(f64, usize)> {
        let q = self.config.quantization_channels;
        let classes: Vec<usize> = example.audio.iter().map(|x| mu_law_encode(*x, q)).collect();
        let first = self.config.receptive_field.max(1);
        if classes.len() <= first {
            return Ok((0.0, 0));
        }

        // Constant speaker shift for the whole example
        let gc_input = match self.gc {
            Some((embedding, projection)) => {
                let id = example.gc_id.ok_or_else(|| Error::Model {
                    message: "global conditioning is enabled but an example has no speaker id"
                        .to_string(),
                })? as usize;
                let table = &self.params[embedding];
                if id >= table.shape[0] {
                    return Err(Error::Model {
                        message: format!("speaker id {} exceeds cardinality {}", id, table.shape[0]),
                    });
                }
                let channels = table.shape[1];
                let e = table.data[id * channels..(id + 1) * channels].to_vec();
                let shift = mat_vec_t(&e, &self.params[projection].data, q);
                Some((id, e, shift))
            }
            None => None,
        };

        // Per-frame hidden features and shifts
        let lc_input = match self.lc {
            Some((input, projection)) => {
                let features = example.lc.as_ref().ok_or_else(|| Error::Model {
                    message: "local conditioning is enabled but an example has no features"
                        .to_string(),
                })?;
                let (in_channels, channels) = (self.params[input].shape[0], self.params[input].shape[1]);
                if features.channels != in_channels || features.num_frames() == 0 {
                    return Err(Error::Model {
                        message: format!(
                            "expected local-conditioning frames of {} channels, got {} frames of {}",
                            in_channels,
                            features.num_frames(),
                            features.channels
                        ),
                    });
                }
                let frames: Vec<(Vec<f32>, Vec<f32>, Vec<f32>)> = features
                    .values
                    .chunks(in_channels)
                    .map(|x| {
                        let h = mat_vec_t(x, &self.params[input].data, channels);
                        let shift = mat_vec_t(&h, &self.params[projection].data, q);
                        (x.to_vec(), h, shift)
                    })
                    .collect();
                Some(frames)
            }
            None => None,
        };

        let mut gc_delta = vec![0.0f32; q];
        let mut lc_delta: Vec<Vec<f32>> = lc_input
            .as_ref()
            .map(|frames| vec![vec![0.0f32; q]; frames.len()])
            .unwrap_or_default();

        let transition = &self.params[TRANSITION].data;
        let bias = &self.params[BIAS].data;
        let mut logits = vec![0.0f32; q];
        let mut loss = 0.0f64;

        for t in first..classes.len() {
            let (prev, target) = (classes[t - 1], classes[t]);
            let frame = lc_input
                .as_ref()
                .map(|frames| (t * frames.len() / classes.len()).min(frames.len() - 1));

            for k in 0..q {
                logits[k] = transition[prev * q + k] + bias[k];
            }
            if let Some((_, _, shift)) = &gc_input {
                add_assign(&mut logits, shift);
            }
            if let (Some(frames), Some(f)) = (&lc_input, frame) {
                add_assign(&mut logits, &frames[f].2);
            }

            let probs = softmax(&logits);
            loss -= (probs[target].max(f32::MIN_POSITIVE) as f64).ln();

            // d(loss)/d(logits) = probs - onehot(target)
            let mut delta = probs;
            delta[target] -= 1.0;

            add_assign(&mut grads[TRANSITION][prev * q..(prev + 1) * q], &delta);
            add_assign(&mut grads[BIAS], &delta);
            if gc_input.is_some() {
                add_assign(&mut gc_delta, &delta);
            }
            if let Some(f) = frame {
                add_assign(&mut lc_delta[f], &delta);
            }
        }

        if let (Some((embedding, projection)), Some((id, e, _))) = (self.gc, &gc_input) {
            let projection_data = &self.params[projection].data;
            let channels = e.len();
            for j in 0..channels {
                for k in 0..q {
                    grads[projection][j * q + k] += e[j] * gc_delta[k];
                    grads[embedding][id * channels + j] += projection_data[j * q + k] * gc_delta[k];
                }
            }
        }

        if let (Some((input, projection)), Some(frames)) = (self.lc, &lc_input) {
            let in_channels = self.params[input].shape[0];
            let channels = self.params[input].shape[1];
            let projection_data = &self.params[projection].data;
            for ((x, h, _), delta) in frames.iter().zip(&lc_delta) {
                let mut dh = vec![0.0f32; channels];
                for j in 0..channels {
                    for k in 0..q {
                        grads[projection][j * q + k] += h[j] * delta[k];
                        dh[j] += projection_data[j * q + k] * delta[k];
                    }
                }
                for i in 0..in_channels {
                    for j in 0..channels {
                        grads[input][i * channels + j] += x[i] * dh[j];
                    }
                }
            }
        }

        Ok((loss, classes.len() - first))
    }

    /// `0.5 * strength * sum(w^2)` over every non-bias parameter, adding its gradient
    fn apply_l2(&self, grads: &mut [Vec<f32>]) -> f64 {
        let Some(strength) = self.config.l2_regularization_strength else {
            return 0.0;
        };

        let mut penalty = 0.0f64;
        for (param, grad) in self.params.iter().zip(grads.iter_mut()) {
            if param.name.ends_with("bias") {
                continue;
            }
            for (g, w) in grad.iter_mut().zip(&param.data) {
                *g += strength * w;
                penalty += 0.5 * (*w as f64) * (*w as f64);
            }
        }
        strength as f64 * penalty
    }
}

impl Model for MuLawBigram {
    fn train_step(
        &mut self,
        batch: &Batch,
        optimizer: &mut dyn Optimizer,
        trace: &mut StepTrace,
    ) -> Result<StepOutput> {
        let mut grads: Vec<Vec<f32>> = self.params.iter().map(|p| vec![0.0; p.numel()]).collect();

        let (loss_sum, count) = trace.scope("forward_backward", || self.accumulate(batch, &mut grads))?;
        if count == 0 {
            return Err(Error::Model {
                message: format!(
                    "batch of {} examples has no samples past the receptive field of {}",
                    batch.len(),
                    self.config.receptive_field
                ),
            });
        }

        let scale = 1.0 / count as f32;
        for grad in grads.iter_mut() {
            grad.iter_mut().for_each(|g| *g *= scale);
        }
        let loss = loss_sum / count as f64 + self.apply_l2(&mut grads);

        let params = &mut self.params;
        trace.scope("apply_gradients", || optimizer.apply_gradients(params, &grads))?;
        trace.counter(
            "parameter_bytes",
            self.params.iter().map(|p| p.size_bytes() as u64).sum(),
        );

        if !loss.is_finite() {
            return Err(Error::Model {
                message: format!("loss diverged to {}", loss),
            });
        }
        Ok(StepOutput { loss: loss as f32 })
    }
}

impl StateDict for MuLawBigram {
    fn export_state(&self) -> Vec<NamedTensor> {
        self.params.clone()
    }

    fn import_state(&mut self, tensors: Vec<NamedTensor>) -> Result<()> {
        assign_tensors(&mut self.params, tensors)
    }
}

/// `x^T M` for `M` stored row-major with `cols` columns
fn mat_vec_t(x: &[f32], m: &[f32], cols: usize) -> Vec<f32> {
    let mut out = vec![0.0f32; cols];
    for (i, xi) in x.iter().enumerate() {
        let row = &m[i * cols..(i + 1) * cols];
        for (o, v) in out.iter_mut().zip(row) {
            *o += xi * v;
        }
    }
    out
}

fn add_assign(target: &mut [f32], values: &[f32]) {
    for (t, v) in target.iter_mut().zip(values) {
        *t += v;
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
