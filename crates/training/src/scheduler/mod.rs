use crate::{config, TrainingError};

/// Learning-rate schedule advanced once per epoch.
pub trait LRScheduler: Send {
    fn step(&mut self) -> f64;
    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone)]
pub enum SchedulerConfig {
    StepDecay {
        base_lr: f64,
        step_size: usize,
        gamma: f64,
    },
}

impl SchedulerConfig {
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
    ) -> Result<Self, TrainingError> {
        if cfg.lr_decay_step == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires lr_decay_step greater than zero",
            ));
        }
        Ok(SchedulerConfig::StepDecay {
            base_lr,
            step_size: cfg.lr_decay_step,
            gamma: cfg.gamma,
        })
    }

    pub fn build(self) -> Result<Box<dyn LRScheduler>, TrainingError> {
        match self {
            SchedulerConfig::StepDecay {
                base_lr,
                step_size,
                gamma,
            } => Ok(Box::new(StepDecay::new(base_lr, step_size, gamma)?)),
        }
    }
}

/// Multiplies the rate by `gamma` every `step_size` epochs.
struct StepDecay {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
    current_lr: f64,
}

impl StepDecay {
    fn new(base_lr: f64, step_size: usize, gamma: f64) -> Result<Self, TrainingError> {
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }
        if !(gamma > 0.0 && gamma <= 1.0) {
            return Err(TrainingError::initialization(
                "scheduler gamma must be in (0, 1]",
            ));
        }
        Ok(Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
            current_lr: base_lr,
        })
    }

    fn compute_lr(&self, epoch: usize) -> f64 {
        let decays = (epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }
}

impl LRScheduler for StepDecay {
    fn step(&mut self) -> f64 {
        self.epoch = self.epoch.saturating_add(1);
        self.current_lr = self.compute_lr(self.epoch);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}
