use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use training::{Precision, Trainer, TrainingConfig, TrainingError, TrainingOutcome};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        log::error!("training failed: {err}");
        eprintln!("training failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Mask classification training CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "TOML or JSON training config")]
    config: Option<PathBuf>,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Random seed")]
    seed: Option<u64>,
    #[arg(long, help = "Number of epochs to train")]
    epochs: Option<usize>,
    #[arg(long, help = "Dataset split strategy (MaskBaseDataset, MaskSplitByProfileDataset)")]
    dataset: Option<String>,
    #[arg(long, help = "Augmentation (BaseAugmentation, CustomAugmentation)")]
    augmentation: Option<String>,
    #[arg(long, help = "Shorter-side resize in pixels")]
    resize: Option<u32>,
    #[arg(long, value_name = "BOOL", help = "Move the oldest age band boundary to 58")]
    age_filter: Option<bool>,
    #[arg(long, help = "Model architecture (BaseModel, RBaseModel)")]
    model: Option<String>,
    #[arg(long, help = "Optimizer (SGD, Adam, AdamW)")]
    optimizer: Option<String>,
    #[arg(long, help = "Criterion (cross_entropy, focal, label_smoothing, f1)")]
    criterion: Option<String>,
    #[arg(long, help = "Training batch size")]
    batch_size: Option<usize>,
    #[arg(long, help = "Validation batch size")]
    valid_batch_size: Option<usize>,
    #[arg(
        long,
        help = "Sampler (uniform-shuffle, inverse-frequency-weighted, dynamic-balance, paired-balance)"
    )]
    sampler: Option<String>,
    #[arg(long, value_name = "ALPHA", help = "Mixup beta parameter; 0 disables")]
    mixup: Option<f64>,
    #[arg(long, value_name = "ALPHA", help = "Cutmix beta parameter; 0 disables")]
    cutmix: Option<f64>,
    #[arg(long)]
    mixup_threshold: Option<f64>,
    #[arg(long)]
    cutmix_threshold: Option<f64>,
    #[arg(long, help = "Learning rate")]
    lr: Option<f64>,
    #[arg(long, help = "Halve the learning rate every N epochs")]
    lr_decay_step: Option<usize>,
    #[arg(long)]
    weight_decay: Option<f64>,
    #[arg(long, help = "Fraction of the data held out for validation")]
    val_ratio: Option<f32>,
    #[arg(long, help = "Batches between training log lines")]
    log_interval: Option<usize>,
    #[arg(long, help = "Epochs without f1 improvement before stopping")]
    num_early_stop: Option<usize>,
    #[arg(long, help = "Image decoding threads")]
    num_workers: Option<usize>,
    #[arg(long, help = "fp32, fp16, bf16 or mixed")]
    precision: Option<String>,
    #[arg(long, value_name = "PATH", help = "Safetensors weights to start from")]
    init_weights: Option<PathBuf>,
    #[arg(long, help = "Run directory name under the model directory")]
    name: Option<String>,
    #[arg(long, env = "SM_CHANNEL_TRAIN", value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, env = "SM_MODEL_DIR", value_name = "PATH")]
    model_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

impl Args {
    /// Layers explicit flags over the loaded (or default) configuration.
    fn apply(self, mut config: TrainingConfig) -> Result<TrainingConfig, TrainingError> {
        for item in &self.overrides {
            config = config.apply_override(&item.path, &item.value)?;
        }

        set(&mut config.runtime.seed, self.seed);
        set(&mut config.runtime.epochs, self.epochs);
        set(&mut config.data.dataset, self.dataset);
        set(&mut config.data.augmentation, self.augmentation);
        set(&mut config.data.resize, self.resize);
        set(&mut config.data.age_filter, self.age_filter);
        set(&mut config.model.architecture, self.model);
        set(&mut config.optimizer.algorithm, self.optimizer);
        set(&mut config.loss.criterion, self.criterion);
        set(&mut config.data.batch_size, self.batch_size);
        set(&mut config.data.valid_batch_size, self.valid_batch_size);
        set(&mut config.data.sampler, self.sampler);
        set(&mut config.augment.mixup_alpha, self.mixup);
        set(&mut config.augment.cutmix_alpha, self.cutmix);
        set(&mut config.augment.mixup_threshold, self.mixup_threshold);
        set(&mut config.augment.cutmix_threshold, self.cutmix_threshold);
        set(&mut config.optimizer.learning_rate, self.lr);
        set(&mut config.scheduler.lr_decay_step, self.lr_decay_step);
        set(&mut config.optimizer.weight_decay, self.weight_decay);
        set(&mut config.data.val_ratio, self.val_ratio);
        set(&mut config.runtime.log_interval, self.log_interval);
        set(&mut config.runtime.num_early_stop, self.num_early_stop);
        set(&mut config.data.num_workers, self.num_workers);
        if let Some(raw) = self.precision {
            config.runtime.precision = raw.parse::<Precision>()?;
        }
        if self.init_weights.is_some() {
            config.model.init_weights = self.init_weights;
        }
        set(&mut config.runtime.name, self.name);
        set(&mut config.data.data_dir, self.data_dir);
        set(&mut config.runtime.model_dir, self.model_dir);
        Ok(config)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let config = match args.config.as_ref() {
        Some(path) => TrainingConfig::from_path(path)?,
        None => TrainingConfig::default(),
    };
    let config = args.apply(config)?;
    config.validate()?;
    log::info!(
        "{}",
        serde_json::to_string(&config).unwrap_or_else(|_| format!("{config:?}"))
    );

    let mut trainer = Trainer::new(config)?;
    let report = trainer.train()?;

    match report.outcome {
        TrainingOutcome::EarlyStopTriggered { epoch } => {
            log::info!("early stopping triggered after epoch {epoch}")
        }
        TrainingOutcome::EpochsExhausted => {
            log::info!("finished {} epochs", report.epochs_completed)
        }
    }
    log::info!(
        "best val f1 {:.4}, acc {:4.2}%, loss {:.4}; artifacts in {}",
        report.best.f1,
        report.best.accuracy * 100.0,
        report.best.loss,
        report.run_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_values() {
        let args = Args::parse_from([
            "train",
            "--epochs",
            "7",
            "--sampler",
            "dynamic",
            "--age-filter",
            "false",
            "--precision",
            "fp32",
            "--override",
            "runtime.epochs=3",
            "--override",
            "optimizer.momentum=0.9",
        ]);
        let config = args.apply(TrainingConfig::default()).unwrap();
        assert_eq!(config.runtime.epochs, 7);
        assert_eq!(config.optimizer.momentum, 0.9);
        assert_eq!(config.data.sampler, "dynamic");
        assert!(!config.data.age_filter);
        assert_eq!(config.runtime.precision, Precision::Fp32);
    }

    #[test]
    fn rejects_malformed_override() {
        assert!("no-equals".parse::<OverrideArg>().is_err());
        assert!("=1".parse::<OverrideArg>().is_err());
    }
}
