use std::{fmt, str::FromStr};

pub mod scaler;

pub use scaler::{GradientScaler, ScaleSchedule};

use candle_core::{backprop::GradStore, DType, Tensor, Var};

use crate::{
    config::{self, UnknownName},
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    Sgd,
    Adam,
    AdamW,
}

impl FromStr for OptimizerKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "adam" => Ok(Self::Adam),
            "adamw" => Ok(Self::AdamW),
            _ => Err(UnknownName::new("optimizer", s, "SGD, Adam, AdamW")),
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizerKind::Sgd => f.write_str("SGD"),
            OptimizerKind::Adam => f.write_str("Adam"),
            OptimizerKind::AdamW => f.write_str("AdamW"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum OptimizerConfig {
    /// Momentum SGD with L2 penalty folded into the gradient.
    Sgd(SgdConfig),
    /// Adam with L2 penalty folded into the gradient.
    Adam(AdamConfig),
    /// Adam with decoupled weight decay.
    AdamW(AdamConfig),
}

#[derive(Debug, Clone, Copy)]
pub struct SgdConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
}

impl TryFrom<&config::OptimizerConfig> for OptimizerConfig {
    type Error = TrainingError;

    fn try_from(value: &config::OptimizerConfig) -> Result<Self, Self::Error> {
        let adam = AdamConfig {
            learning_rate: value.learning_rate,
            beta1: value.beta1,
            beta2: value.beta2,
            epsilon: value.epsilon,
            weight_decay: value.weight_decay,
        };
        Ok(match value.algorithm.parse::<OptimizerKind>()? {
            OptimizerKind::Sgd => OptimizerConfig::Sgd(SgdConfig {
                learning_rate: value.learning_rate,
                momentum: value.momentum,
                weight_decay: value.weight_decay,
            }),
            OptimizerKind::Adam => OptimizerConfig::Adam(adam),
            OptimizerKind::AdamW => OptimizerConfig::AdamW(adam),
        })
    }
}

#[derive(Debug, Clone)]
pub struct TrainerOptimizerOptions {
    pub use_master_weights: bool,
}

impl Default for TrainerOptimizerOptions {
    fn default() -> Self {
        Self {
            use_master_weights: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// Non-finite gradients; parameters untouched.
    SkippedOverflow,
}

#[derive(Debug)]
pub struct TrainerOptimizer {
    config: OptimizerConfig,
    params: Vec<ParameterSlot>,
    step: usize,
}

#[derive(Debug)]
struct ParameterSlot {
    name: String,
    param: Var,
    dtype: DType,
    master: Option<Var>,
    first_moment: Tensor,
    second_moment: Tensor,
}

impl TrainerOptimizer {
    pub fn new(
        named_parameters: Vec<(String, Var)>,
        config: OptimizerConfig,
        options: TrainerOptimizerOptions,
    ) -> Result<Self, TrainingError> {
        if named_parameters.is_empty() {
            return Err(TrainingError::initialization(
                "optimizer requires at least one parameter",
            ));
        }

        let mut params = Vec::with_capacity(named_parameters.len());
        for (name, var) in named_parameters {
            let tensor = var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(TrainingError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    name
                )));
            }
            let device = tensor.device();
            let shape = tensor.dims().to_vec();
            let dtype = tensor.dtype();

            let first_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;
            let second_moment =
                Tensor::zeros(shape.as_slice(), DType::F32, device).map_err(to_runtime_error)?;

            let master = if options.use_master_weights && dtype != DType::F32 {
                let fp32 = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };

            params.push(ParameterSlot {
                name,
                param: var,
                dtype,
                master,
                first_moment,
                second_moment,
            });
        }

        Ok(Self {
            config,
            params,
            step: 0,
        })
    }

    pub fn learning_rate(&self) -> f64 {
        match &self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate,
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg.learning_rate,
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match &mut self.config {
            OptimizerConfig::Sgd(cfg) => cfg.learning_rate = lr,
            OptimizerConfig::Adam(cfg) | OptimizerConfig::AdamW(cfg) => cfg.learning_rate = lr,
        }
    }

    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Unscales gradients, skips the update when any is non-finite, and
    /// otherwise applies one optimizer step.
    pub fn step(
        &mut self,
        grads: &mut GradStore,
        scaler: &GradientScaler,
    ) -> Result<StepOutcome, TrainingError> {
        let mut processed = Vec::new();
        for (idx, slot) in self.params.iter().enumerate() {
            let Some(grad) = grads.remove(slot.param.as_tensor()) else {
                log::trace!("no gradient for {}", slot.name);
                continue;
            };
            let grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
            processed.push((idx, scaler.unscale(&grad)?));
        }

        if processed.is_empty() {
            return Ok(StepOutcome::Applied);
        }
        if scaler.has_overflow(processed.iter().map(|(_, grad)| grad))? {
            return Ok(StepOutcome::SkippedOverflow);
        }

        self.step += 1;
        match self.config.clone() {
            OptimizerConfig::Sgd(cfg) => self.step_sgd(cfg, processed)?,
            OptimizerConfig::Adam(cfg) => self.step_adam(cfg, processed, false)?,
            OptimizerConfig::AdamW(cfg) => self.step_adam(cfg, processed, true)?,
        }
        Ok(StepOutcome::Applied)
    }

    fn step_sgd(
        &mut self,
        cfg: SgdConfig,
        processed: Vec<(usize, Tensor)>,
    ) -> Result<(), TrainingError> {
        let first_step = self.step == 1;
        for (idx, grad) in processed {
            let slot = &mut self.params[idx];
            let base = slot.fp32_weights()?;
            let grad = with_l2_penalty(grad, &base, cfg.weight_decay)?;

            let direction = if cfg.momentum > 0.0 {
                let buf = if first_step {
                    grad
                } else {
                    slot.first_moment
                        .affine(cfg.momentum, 0.0)
                        .and_then(|m| m + &grad)
                        .map_err(to_runtime_error)?
                };
                slot.first_moment = buf.clone();
                buf
            } else {
                grad
            };

            let update = direction
                .affine(cfg.learning_rate, 0.0)
                .map_err(to_runtime_error)?;
            let next = base.sub(&update).map_err(to_runtime_error)?;
            slot.write_back(next)?;
        }
        Ok(())
    }

    fn step_adam(
        &mut self,
        cfg: AdamConfig,
        processed: Vec<(usize, Tensor)>,
        decoupled: bool,
    ) -> Result<(), TrainingError> {
        let bias_correction1 = 1.0 - cfg.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - cfg.beta2.powi(self.step as i32);

        for (idx, grad) in processed {
            let slot = &mut self.params[idx];
            let base = slot.fp32_weights()?;
            let grad = if decoupled {
                grad
            } else {
                with_l2_penalty(grad, &base, cfg.weight_decay)?
            };

            let new_m = (slot
                .first_moment
                .affine(cfg.beta1, 0.0)
                .map_err(to_runtime_error)?
                + grad.affine(1.0 - cfg.beta1, 0.0).map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;
            let new_v = (slot
                .second_moment
                .affine(cfg.beta2, 0.0)
                .map_err(to_runtime_error)?
                + grad
                    .sqr()
                    .and_then(|g| g.affine(1.0 - cfg.beta2, 0.0))
                    .map_err(to_runtime_error)?)
            .map_err(to_runtime_error)?;

            let m_hat = new_m
                .affine(1.0 / bias_correction1, 0.0)
                .map_err(to_runtime_error)?;
            let denom = new_v
                .affine(1.0 / bias_correction2, 0.0)
                .and_then(|v| v.sqrt())
                .and_then(|v| v.affine(1.0, cfg.epsilon))
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .and_then(|u| u.affine(cfg.learning_rate, 0.0))
                .map_err(to_runtime_error)?;

            let decayed = if decoupled && cfg.weight_decay != 0.0 {
                base.affine(1.0 - cfg.learning_rate * cfg.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            slot.write_back(next)?;

            slot.first_moment = new_m;
            slot.second_moment = new_v;
        }
        Ok(())
    }
}

impl ParameterSlot {
    fn fp32_weights(&self) -> Result<Tensor, TrainingError> {
        match self.master.as_ref() {
            Some(master) => Ok(master.as_tensor().clone()),
            None => self
                .param
                .as_tensor()
                .to_dtype(DType::F32)
                .map_err(to_runtime_error),
        }
    }

    fn write_back(&self, next: Tensor) -> Result<(), TrainingError> {
        if let Some(master) = self.master.as_ref() {
            master.set(&next).map_err(to_runtime_error)?;
        }
        let cast = if self.dtype == DType::F32 {
            next
        } else {
            next.to_dtype(self.dtype).map_err(to_runtime_error)?
        };
        self.param.set(&cast).map_err(to_runtime_error)
    }
}

fn with_l2_penalty(grad: Tensor, weights: &Tensor, weight_decay: f64) -> Result<Tensor, TrainingError> {
    if weight_decay == 0.0 {
        return Ok(grad);
    }
    weights
        .affine(weight_decay, 0.0)
        .and_then(|penalty| grad + penalty)
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::config::Precision;

    fn quadratic_step(config: OptimizerConfig) -> f32 {
        let var = Var::new(&[1.0f32, -2.0], &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            config,
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let scaler = GradientScaler::new(Precision::Fp32);
        for _ in 0..50 {
            let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
            let mut grads = loss.backward().unwrap();
            optimizer.step(&mut grads, &scaler).unwrap();
        }
        var.as_tensor()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap()
    }

    #[test]
    fn every_algorithm_descends() {
        let sgd = quadratic_step(OptimizerConfig::Sgd(SgdConfig {
            learning_rate: 0.1,
            momentum: 0.0,
            weight_decay: 5e-4,
        }));
        let adam = AdamConfig {
            learning_rate: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 5e-4,
        };
        let adam_l2 = quadratic_step(OptimizerConfig::Adam(adam));
        let adamw = quadratic_step(OptimizerConfig::AdamW(adam));
        for value in [sgd, adam_l2, adamw] {
            assert!(value < 0.5, "loss {value}");
        }
    }

    #[test]
    fn sgd_matches_closed_form() {
        let var = Var::new(&[2.0f32], &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            OptimizerConfig::Sgd(SgdConfig {
                learning_rate: 0.1,
                momentum: 0.0,
                weight_decay: 0.0,
            }),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let scaler = GradientScaler::new(Precision::Fp32);
        let loss = var.as_tensor().sqr().unwrap().sum_all().unwrap();
        let mut grads = loss.backward().unwrap();
        assert_eq!(optimizer.step(&mut grads, &scaler).unwrap(), StepOutcome::Applied);
        // w - lr * 2w
        let w = var.as_tensor().to_vec1::<f32>().unwrap()[0];
        assert!((w - 1.6).abs() < 1e-6);
    }

    #[test]
    fn skips_step_on_overflow() {
        let var = Var::new(&[1.0f32], &Device::Cpu).unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            OptimizerConfig::Sgd(SgdConfig {
                learning_rate: 0.1,
                momentum: 0.0,
                weight_decay: 0.0,
            }),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let scaler = GradientScaler::new(Precision::Mixed);
        let loss = var
            .as_tensor()
            .affine(f64::from(f32::MAX), 0.0)
            .unwrap()
            .sqr()
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = loss.backward().unwrap();
        assert_eq!(
            optimizer.step(&mut grads, &scaler).unwrap(),
            StepOutcome::SkippedOverflow
        );
        assert_eq!(var.as_tensor().to_vec1::<f32>().unwrap(), vec![1.0]);
        assert_eq!(optimizer.steps_taken(), 0);
    }

    #[test]
    fn master_weights_track_reduced_precision() {
        let var = Var::new(&[1.0f32, 2.0], &Device::Cpu)
            .and_then(|v| Var::from_tensor(&v.as_tensor().to_dtype(DType::BF16)?))
            .unwrap();
        let mut optimizer = TrainerOptimizer::new(
            vec![("w".to_string(), var.clone())],
            OptimizerConfig::Sgd(SgdConfig {
                learning_rate: 0.5,
                momentum: 0.0,
                weight_decay: 0.0,
            }),
            TrainerOptimizerOptions::default(),
        )
        .unwrap();
        let scaler = GradientScaler::new(Precision::Fp32);
        let loss = var
            .as_tensor()
            .to_dtype(DType::F32)
            .unwrap()
            .sum_all()
            .unwrap();
        let mut grads = loss.backward().unwrap();
        optimizer.step(&mut grads, &scaler).unwrap();
        assert_eq!(var.as_tensor().dtype(), DType::BF16);
        let values = var
            .as_tensor()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(values, vec![0.5, 1.5]);
    }

    #[test]
    fn parses_registry_names() {
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert_eq!("AdamW".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert!("Lion".parse::<OptimizerKind>().is_err());
    }
}
