use candle_core::{DType, Tensor};

use crate::{config::Precision, TrainingError};

/// Growth and backoff policy for the dynamic loss scale.
#[derive(Debug, Clone, PartialEq)]
pub struct ScaleSchedule {
    pub initial: f32,
    pub growth_factor: f32,
    pub backoff_factor: f32,
    /// Clean steps required before the scale grows again.
    pub growth_interval: usize,
    pub floor: f32,
    pub ceiling: f32,
}

impl Default for ScaleSchedule {
    fn default() -> Self {
        Self {
            initial: 65_536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2_000,
            floor: 1.0,
            ceiling: 16_777_216.0,
        }
    }
}

impl ScaleSchedule {
    fn sanitized(mut self) -> Self {
        self.growth_factor = self.growth_factor.max(1.0);
        if !(self.backoff_factor > 0.0 && self.backoff_factor < 1.0) {
            self.backoff_factor = 0.5;
        }
        self.growth_interval = self.growth_interval.max(1);
        if !(self.floor > 0.0) {
            self.floor = 1.0;
        }
        self.ceiling = self.ceiling.max(self.floor);
        self.initial = self.initial.clamp(self.floor, self.ceiling);
        self
    }
}

/// Loss scaler for reduced-precision parameters.
///
/// With fp32 parameters every operation is the identity and overflow is never
/// reported, so the trainer can drive it unconditionally.
#[derive(Debug, Clone)]
pub struct GradientScaler {
    dynamic: Option<DynamicScale>,
}

#[derive(Debug, Clone)]
struct DynamicScale {
    schedule: ScaleSchedule,
    current: f32,
    clean_steps: usize,
    overflow_streak: usize,
}

impl GradientScaler {
    pub fn new(precision: Precision) -> Self {
        Self::with_schedule(ScaleSchedule::default(), precision)
    }

    pub fn with_schedule(schedule: ScaleSchedule, precision: Precision) -> Self {
        let dynamic = (precision != Precision::Fp32).then(|| {
            let schedule = schedule.sanitized();
            DynamicScale {
                current: schedule.initial,
                schedule,
                clean_steps: 0,
                overflow_streak: 0,
            }
        });
        Self { dynamic }
    }

    pub fn is_enabled(&self) -> bool {
        self.dynamic.is_some()
    }

    pub fn loss_scale(&self) -> f32 {
        self.dynamic.as_ref().map_or(1.0, |d| d.current)
    }

    pub fn scale(&self, loss: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(loss, self.loss_scale() as f64)
    }

    pub fn unscale(&self, grad: &Tensor) -> Result<Tensor, TrainingError> {
        self.multiply(grad, 1.0 / self.loss_scale() as f64)
    }

    fn multiply(&self, tensor: &Tensor, factor: f64) -> Result<Tensor, TrainingError> {
        if self.dynamic.is_none() {
            return Ok(tensor.clone());
        }
        tensor.affine(factor, 0.0).map_err(to_runtime_error)
    }

    /// Reports whether any gradient holds a NaN or an infinity.
    ///
    /// Per-tensor sums are reduced on the device and read back once.
    pub fn has_overflow<I>(&self, grads: I) -> Result<bool, TrainingError>
    where
        I: IntoIterator,
        I::Item: AsRef<Tensor>,
    {
        if self.dynamic.is_none() {
            return Ok(false);
        }
        let mut sums = Vec::new();
        for grad in grads {
            let grad = grad.as_ref();
            if grad.elem_count() == 0 {
                continue;
            }
            let sum = grad
                .to_dtype(DType::F32)
                .and_then(|g| g.abs())
                .and_then(|g| g.sum_all())
                .map_err(to_runtime_error)?;
            sums.push(sum);
        }
        if sums.is_empty() {
            return Ok(false);
        }
        let total = Tensor::stack(&sums, 0)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.to_vec0::<f32>())
            .map_err(to_runtime_error)?;
        Ok(!total.is_finite())
    }

    /// Backs off after an overflow, grows after `growth_interval` clean steps.
    pub fn update(&mut self, found_overflow: bool) {
        let Some(dynamic) = self.dynamic.as_mut() else {
            return;
        };
        let schedule = &dynamic.schedule;
        if found_overflow {
            dynamic.clean_steps = 0;
            dynamic.overflow_streak += 1;
            let next = (dynamic.current * schedule.backoff_factor).max(schedule.floor);
            if next == dynamic.current {
                log::warn!(
                    "loss scale pinned at {} after {} consecutive overflows",
                    next,
                    dynamic.overflow_streak
                );
            }
            dynamic.current = next;
            return;
        }

        dynamic.overflow_streak = 0;
        dynamic.clean_steps += 1;
        if dynamic.clean_steps >= schedule.growth_interval {
            dynamic.current = (dynamic.current * schedule.growth_factor).min(schedule.ceiling);
            dynamic.clean_steps = 0;
        }
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn grad(values: &[f32]) -> Tensor {
        Tensor::from_slice(values, (values.len(),), &Device::Cpu).unwrap()
    }

    #[test]
    fn full_precision_is_identity() {
        let mut scaler = GradientScaler::new(Precision::Fp32);
        assert!(!scaler.is_enabled());

        let loss = grad(&[0.75]);
        assert_eq!(scaler.scale(&loss).unwrap().to_vec1::<f32>().unwrap(), vec![0.75]);
        assert!(!scaler.has_overflow([grad(&[f32::NAN])]).unwrap());
        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 1.0);
    }

    #[test]
    fn halves_on_overflow_and_regrows() {
        let schedule = ScaleSchedule {
            initial: 64.0,
            growth_interval: 3,
            ..ScaleSchedule::default()
        };
        let mut scaler = GradientScaler::with_schedule(schedule, Precision::Mixed);

        scaler.update(true);
        assert_eq!(scaler.loss_scale(), 32.0);
        scaler.update(false);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 32.0);
        scaler.update(false);
        assert_eq!(scaler.loss_scale(), 64.0);
    }

    #[test]
    fn never_drops_below_floor() {
        let schedule = ScaleSchedule {
            initial: 4.0,
            floor: 2.0,
            ..ScaleSchedule::default()
        };
        let mut scaler = GradientScaler::with_schedule(schedule, Precision::Fp16);
        for _ in 0..4 {
            scaler.update(true);
        }
        assert_eq!(scaler.loss_scale(), 2.0);
    }

    #[test]
    fn flags_nan_and_inf_gradients() {
        let scaler = GradientScaler::new(Precision::Bf16);
        let clean = grad(&[1.0, -2.0]);
        assert!(!scaler.has_overflow([&clean, &grad(&[])]).unwrap());
        assert!(scaler.has_overflow([&clean, &grad(&[f32::INFINITY])]).unwrap());
        assert!(scaler.has_overflow([grad(&[0.0, f32::NAN])]).unwrap());
    }

    #[test]
    fn unscale_undoes_scale() {
        let schedule = ScaleSchedule {
            initial: 8.0,
            ..ScaleSchedule::default()
        };
        let scaler = GradientScaler::with_schedule(schedule, Precision::Mixed);
        let scaled = scaler.scale(&grad(&[0.5, 1.0])).unwrap();
        assert_eq!(scaled.to_vec1::<f32>().unwrap(), vec![4.0, 8.0]);
        let back = scaler.unscale(&scaled).unwrap();
        assert_eq!(back.to_vec1::<f32>().unwrap(), vec![0.5, 1.0]);
    }
}
