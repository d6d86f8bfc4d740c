use std::collections::HashMap;

use candle_core::{backprop::GradStore, DType, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::config::{DecayMethod, OptimMethod, OptimSettings};
use crate::TrainingError;

const EPS: f64 = 1e-12;
const ADADELTA_RHO: f64 = 0.95;

/// Numeric optimizer plus learning-rate schedule for one sub-model.
///
/// The step counter advances once per accumulated macro-step, never per
/// micro-batch. Rate rules: `none` holds the base rate; `step` multiplies
/// by the decay factor after an epoch whose validation perplexity failed
/// to improve on the best seen or whose index reached `start_decay_at`;
/// `warmup-inverse-sqrt` recomputes the rate every step and ignores the
/// epoch rule.
#[derive(Debug)]
pub struct Optim {
    method: OptimMethod,
    params: Vec<ParameterSlot>,
    base_rate: f64,
    learning_rate: f64,
    max_grad_norm: f64,
    decay_method: DecayMethod,
    learning_rate_decay: f64,
    start_decay_at: usize,
    warmup_steps: usize,
    model_size: usize,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: usize,
    best_ppl: Option<f64>,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl Optim {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        settings: &OptimSettings,
        model_size: usize,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::runtime(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::runtime(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment = match settings.method {
                OptimMethod::Adagrad => {
                    Tensor::full(settings.adagrad_accum as f32, shape.as_slice(), device)
                        .map_err(to_runtime_error)?
                }
                _ => Tensor::zeros(shape.as_slice(), DType::F32, device)
                    .map_err(to_runtime_error)?,
            };

            params.push(ParameterSlot {
                name,
                param: var,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            method: settings.method,
            params,
            base_rate: settings.learning_rate,
            learning_rate: settings.learning_rate,
            max_grad_norm: settings.max_grad_norm,
            decay_method: settings.decay_method,
            learning_rate_decay: settings.learning_rate_decay,
            start_decay_at: settings.start_decay_at,
            warmup_steps: settings.warmup_steps,
            model_size,
            beta1: settings.beta1,
            beta2: settings.beta2,
            epsilon: settings.epsilon,
            step: 0,
            best_ppl: None,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn best_ppl(&self) -> Option<f64> {
        self.best_ppl
    }

    fn warmup_rate(&self, step: usize) -> f64 {
        let step = step.max(1) as f64;
        let warmup = self.warmup_steps as f64;
        self.base_rate
            * (self.model_size as f64).powf(-0.5)
            * step.powf(-0.5).min(step * warmup.powf(-1.5))
    }

    /// Applies one accumulated macro-step: advances the step counter,
    /// recomputes the warmup rate if scheduled, clips all gradients jointly,
    /// then updates every parameter under the configured method.
    pub fn step(&mut self, grads: &mut GradStore) -> Result<(), TrainingError> {
        self.step += 1;
        if self.decay_method == DecayMethod::WarmupInverseSqrt {
            self.learning_rate = self.warmup_rate(self.step);
        }

        let mut processed = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            let tensor = slot.param.as_tensor();
            let Some(grad) = grads.remove(tensor) else {
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            let norm = tensor_l2_norm(&grad)?;
            processed.push(ProcessedGradient {
                index: idx,
                grad,
                norm,
            });
        }

        if processed.is_empty() {
            return Ok(());
        }

        if self.max_grad_norm > 0.0 {
            let total_norm_sq: f64 = processed.iter().map(|g| g.norm * g.norm).sum();
            let total_norm = total_norm_sq.sqrt();
            if total_norm > self.max_grad_norm {
                let scale = self.max_grad_norm / (total_norm + EPS);
                for item in &mut processed {
                    item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                    item.norm *= scale;
                }
            }
        }

        match self.method {
            OptimMethod::Sgd => self.step_sgd(processed),
            OptimMethod::Adagrad => self.step_adagrad(processed),
            OptimMethod::Adadelta => self.step_adadelta(processed),
            OptimMethod::Adam => self.step_adam(processed),
        }
    }

    fn step_sgd(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        for item in processed {
            let slot = &self.params[item.index];
            let update = item
                .grad
                .affine(self.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
        }
        Ok(())
    }

    fn step_adagrad(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        for item in processed {
            let slot = &mut self.params[item.index];
            let grad_sq = item.grad.sqr().map_err(to_runtime_error)?;
            let accum = slot
                .second_moment
                .add(&grad_sq)
                .map_err(to_runtime_error)?;
            let denom = accum
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, self.epsilon)
                .map_err(to_runtime_error)?;
            let update = item
                .grad
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(self.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
            slot.second_moment = accum;
        }
        Ok(())
    }

    fn step_adadelta(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        for item in processed {
            let slot = &mut self.params[item.index];
            let grad_sq = item.grad.sqr().map_err(to_runtime_error)?;
            let avg_sq_grad = slot
                .first_moment
                .affine(ADADELTA_RHO, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad_sq.affine(1.0 - ADADELTA_RHO, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;

            let numer = slot
                .second_moment
                .affine(1.0, self.epsilon)
                .map_err(to_runtime_error)?;
            let denom = avg_sq_grad
                .affine(1.0, self.epsilon)
                .map_err(to_runtime_error)?;
            let scale = numer
                .div(&denom)
                .map_err(to_runtime_error)?
                .sqrt()
                .map_err(to_runtime_error)?;
            let delta = item.grad.mul(&scale).map_err(to_runtime_error)?;

            let delta_sq = delta.sqr().map_err(to_runtime_error)?;
            let avg_sq_delta = slot
                .second_moment
                .affine(ADADELTA_RHO, 0.0)
                .map_err(to_runtime_error)?
                .add(&delta_sq.affine(1.0 - ADADELTA_RHO, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;

            let update = delta
                .affine(self.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
            slot.first_moment = avg_sq_grad;
            slot.second_moment = avg_sq_delta;
        }
        Ok(())
    }

    fn step_adam(&mut self, processed: Vec<ProcessedGradient>) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.step as i32);
        let scale_m = if bias_correction1.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction1
        };
        let scale_v = if bias_correction2.abs() < EPS {
            1.0
        } else {
            1.0 / bias_correction2
        };

        for item in processed {
            let slot = &mut self.params[item.index];

            let prev_m = slot
                .first_moment
                .affine(self.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let grad_term = item
                .grad
                .affine(1.0 - self.beta1, 0.0)
                .map_err(to_runtime_error)?;
            let new_m = prev_m.add(&grad_term).map_err(to_runtime_error)?;

            let grad_sq = item.grad.sqr().map_err(to_runtime_error)?;
            let prev_v = slot
                .second_moment
                .affine(self.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let grad_sq_term = grad_sq
                .affine(1.0 - self.beta2, 0.0)
                .map_err(to_runtime_error)?;
            let new_v = prev_v.add(&grad_sq_term).map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, self.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(self.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let next = slot
                .param
                .as_tensor()
                .sub(&update)
                .map_err(to_runtime_error)?;
            slot.param.set(&next).map_err(to_runtime_error)?;
            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }
        Ok(())
    }

    /// End-of-epoch rate adjustment driven by validation perplexity. Only
    /// the `step` decay method reacts; the best perplexity is tracked for
    /// every method so checkpoints round-trip it.
    pub fn epoch_step(&mut self, valid_ppl: f64, epoch: usize) {
        if self.decay_method == DecayMethod::Step {
            let worse = self.best_ppl.map_or(false, |best| valid_ppl > best);
            if worse || epoch >= self.start_decay_at {
                self.learning_rate *= self.learning_rate_decay;
                println!("Decaying learning rate to {:.6}", self.learning_rate);
            }
        }
        match self.best_ppl {
            Some(best) if valid_ppl >= best => {}
            _ => self.best_ppl = Some(valid_ppl),
        }
    }

    pub fn state(&self) -> Result<OptimState, TrainingError> {
        let mut parameters = Vec::with_capacity(self.params.len());
        for slot in &self.params {
            let shape = slot.param.as_tensor().dims().to_vec();
            let numel = numel(&shape);
            parameters.push(ParameterState {
                name: slot.name.clone(),
                shape,
                first_moment: flatten_to_vec(&slot.first_moment, numel)?,
                second_moment: flatten_to_vec(&slot.second_moment, numel)?,
            });
        }

        Ok(OptimState {
            method: self.method,
            step: self.step,
            learning_rate: self.learning_rate,
            best_ppl: self.best_ppl,
            parameters,
        })
    }

    /// Restores method internals and scheduling metadata onto this
    /// instance's freshly built parameters. Parameter bindings from the
    /// saving run are never reused.
    pub fn load_state(&mut self, state: OptimState) -> Result<(), TrainingError> {
        if state.method != self.method {
            return Err(TrainingError::checkpoint(format!(
                "optimizer method mismatch: checkpoint has {:?}, run configured {:?}",
                state.method, self.method
            )));
        }
        self.step = state.step;
        self.learning_rate = state.learning_rate;
        self.best_ppl = state.best_ppl;

        let mut by_name: HashMap<_, _> = state
            .parameters
            .into_iter()
            .map(|param| (param.name.clone(), param))
            .collect();

        for slot in &mut self.params {
            let state = by_name.remove(&slot.name).ok_or_else(|| {
                TrainingError::checkpoint(format!(
                    "optimizer state missing parameter '{}'",
                    slot.name
                ))
            })?;

            let dims = slot.param.as_tensor().dims().to_vec();
            if dims != state.shape {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state shape mismatch for '{}'",
                    slot.name
                )));
            }
            let expected = numel(&dims);
            if expected != state.first_moment.len() || expected != state.second_moment.len() {
                return Err(TrainingError::checkpoint(format!(
                    "optimizer state size mismatch for '{}'",
                    slot.name
                )));
            }

            let device = slot.param.as_tensor().device().clone();
            slot.first_moment = Tensor::from_vec(state.first_moment, expected, &device)
                .map_err(to_runtime_error)?
                .reshape(dims.as_slice())
                .map_err(to_runtime_error)?;
            slot.second_moment = Tensor::from_vec(state.second_moment, expected, &device)
                .map_err(to_runtime_error)?
                .reshape(dims.as_slice())
                .map_err(to_runtime_error)?;
        }

        if !by_name.is_empty() {
            return Err(TrainingError::checkpoint(
                "optimizer state has extra parameters not present in the model",
            ));
        }

        Ok(())
    }
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, TrainingError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor, expected: usize) -> Result<Vec<f32>, TrainingError> {
    let flat = tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)?;
    if flat.len() != expected {
        return Err(TrainingError::runtime(
            "unexpected element count during optimizer serialization",
        ));
    }
    Ok(flat)
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Serialized optimizer internals plus scheduling metadata; one per
/// sub-model inside a checkpoint manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimState {
    pub method: OptimMethod,
    pub step: usize,
    pub learning_rate: f64,
    pub best_ppl: Option<f64>,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub first_moment: Vec<f32>,
    pub second_moment: Vec<f32>,
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn settings(method: OptimMethod, lr: f64) -> OptimSettings {
        OptimSettings {
            method,
            learning_rate: lr,
            max_grad_norm: 0.0,
            decay_method: DecayMethod::None,
            ..OptimSettings::default()
        }
    }

    fn var(values: &[f32]) -> Var {
        let tensor = Tensor::from_vec(values.to_vec(), values.len(), &Device::Cpu).unwrap();
        Var::from_tensor(&tensor).unwrap()
    }

    fn grads_for(var: &Var, direction: &[f32]) -> GradStore {
        let weights =
            Tensor::from_vec(direction.to_vec(), direction.len(), &Device::Cpu).unwrap();
        let loss = var
            .as_tensor()
            .mul(&weights)
            .unwrap()
            .sum_all()
            .unwrap();
        loss.backward().unwrap()
    }

    #[test]
    fn sgd_moves_against_gradient() {
        let param = var(&[0.0, 0.0]);
        let mut optim = Optim::new(
            vec![("w".to_string(), param.clone())],
            &settings(OptimMethod::Sgd, 0.5),
            256,
        )
        .unwrap();

        let mut grads = grads_for(&param, &[2.0, -4.0]);
        optim.step(&mut grads).unwrap();

        let values = param.as_tensor().to_vec1::<f32>().unwrap();
        assert_eq!(values, vec![-1.0, 2.0]);
        assert_eq!(optim.step_count(), 1);
    }

    #[test]
    fn joint_clip_bounds_gradient_norm() {
        let param = var(&[0.0, 0.0]);
        let mut cfg = settings(OptimMethod::Sgd, 1.0);
        cfg.max_grad_norm = 1.0;
        let mut optim =
            Optim::new(vec![("w".to_string(), param.clone())], &cfg, 256).unwrap();

        // gradient (3, 4) has norm 5, so it is rescaled to norm 1
        let mut grads = grads_for(&param, &[3.0, 4.0]);
        optim.step(&mut grads).unwrap();

        let values = param.as_tensor().to_vec1::<f32>().unwrap();
        assert!((values[0] + 0.6).abs() < 1e-5);
        assert!((values[1] + 0.8).abs() < 1e-5);
    }

    #[test]
    fn warmup_inverse_sqrt_schedule() {
        let param = var(&[0.0]);
        let mut cfg = settings(OptimMethod::Sgd, 2.0);
        cfg.decay_method = DecayMethod::WarmupInverseSqrt;
        cfg.warmup_steps = 4000;
        let model_size = 512usize;
        let mut optim =
            Optim::new(vec![("w".to_string(), param.clone())], &cfg, model_size).unwrap();

        let mut grads = grads_for(&param, &[1.0]);
        optim.step(&mut grads).unwrap();

        let expected = 2.0 * (512f64).powf(-0.5) * 4000f64.powf(-1.5);
        assert!((optim.learning_rate() - expected).abs() < 1e-12);

        // at step == warmup_steps the two min() terms coincide
        let at_warmup = optim.warmup_rate(4000);
        let decayed = 2.0 * (512f64).powf(-0.5) * (4000f64).powf(-0.5);
        assert!((at_warmup - decayed).abs() < 1e-12);
    }

    #[test]
    fn step_decay_fires_on_worse_perplexity() {
        let param = var(&[0.0]);
        let mut cfg = settings(OptimMethod::Sgd, 1.0);
        cfg.decay_method = DecayMethod::Step;
        cfg.learning_rate_decay = 0.5;
        cfg.start_decay_at = 100;
        let mut optim = Optim::new(vec![("w".to_string(), param)], &cfg, 256).unwrap();

        optim.epoch_step(10.0, 1);
        assert_eq!(optim.learning_rate(), 1.0);

        // perplexity regressed, so the rate halves
        optim.epoch_step(12.0, 2);
        assert_eq!(optim.learning_rate(), 0.5);
        assert_eq!(optim.best_ppl(), Some(10.0));
    }

    #[test]
    fn step_decay_fires_at_start_epoch() {
        let param = var(&[0.0]);
        let mut cfg = settings(OptimMethod::Sgd, 1.0);
        cfg.decay_method = DecayMethod::Step;
        cfg.learning_rate_decay = 0.5;
        cfg.start_decay_at = 3;
        let mut optim = Optim::new(vec![("w".to_string(), param)], &cfg, 256).unwrap();

        optim.epoch_step(10.0, 2);
        assert_eq!(optim.learning_rate(), 1.0);
        optim.epoch_step(9.0, 3);
        assert_eq!(optim.learning_rate(), 0.5);
    }

    #[test]
    fn adagrad_accumulator_starts_at_configured_value() {
        let param = var(&[0.0]);
        let mut cfg = settings(OptimMethod::Adagrad, 0.1);
        cfg.adagrad_accum = 0.1;
        let mut optim =
            Optim::new(vec![("w".to_string(), param.clone())], &cfg, 256).unwrap();

        let mut grads = grads_for(&param, &[3.0]);
        optim.step(&mut grads).unwrap();

        let state = optim.state().unwrap();
        // accumulator = 0.1 + 3^2
        assert!((state.parameters[0].second_moment[0] - 9.1).abs() < 1e-5);
    }

    #[test]
    fn state_round_trips_through_fresh_instance() {
        let param = var(&[1.0, 2.0]);
        let cfg = settings(OptimMethod::Adam, 0.01);
        let mut optim =
            Optim::new(vec![("w".to_string(), param.clone())], &cfg, 256).unwrap();

        let mut grads = grads_for(&param, &[1.0, -1.0]);
        optim.step(&mut grads).unwrap();
        optim.epoch_step(7.5, 1);
        let state = optim.state().unwrap();

        let fresh_param = var(&[0.0, 0.0]);
        let mut restored =
            Optim::new(vec![("w".to_string(), fresh_param)], &cfg, 256).unwrap();
        restored.load_state(state).unwrap();

        assert_eq!(restored.step_count(), 1);
        assert_eq!(restored.best_ppl(), Some(7.5));
        let restored_state = restored.state().unwrap();
        assert_eq!(
            restored_state.parameters[0].first_moment,
            optim.state().unwrap().parameters[0].first_moment
        );
    }

    #[test]
    fn load_state_rejects_method_mismatch() {
        let param = var(&[0.0]);
        let optim = Optim::new(
            vec![("w".to_string(), param.clone())],
            &settings(OptimMethod::Sgd, 1.0),
            256,
        )
        .unwrap();
        let state = optim.state().unwrap();

        let mut adam = Optim::new(
            vec![("w".to_string(), param)],
            &settings(OptimMethod::Adam, 1.0),
            256,
        )
        .unwrap();
        assert!(matches!(
            adam.load_state(state),
            Err(TrainingError::Checkpoint(_))
        ));
    }
}
