use std::{path::PathBuf, sync::Arc};

use candle_core::{
    utils::{cuda_is_available, metal_is_available},
    DType, Device, Tensor,
};
use dataset::{MaskDataset, MaskDatasetConfig, Normalize, Subset};
use image::RgbImage;
use model::{Classifier, ModelConfig};

use crate::{
    checkpoint::{self, CheckpointController},
    config::Precision,
    data::{build_sampler, BatchLoader, BatchSampler, DataBatch, SamplerOptions},
    grid::sample_grid,
    logging::{IntervalPosition, Logger, LoggingSettings},
    loss::Criterion,
    metrics::{predictions, EvaluationMetrics, EvaluationSummary},
    mix::{blend_losses, BatchSynthesizer, MixedBatch},
    optimizer::{GradientScaler, OptimizerConfig, StepOutcome, TrainerOptimizer, TrainerOptimizerOptions},
    run_dir::create_run_dir,
    scheduler::{LRScheduler, SchedulerConfig},
    state::{BestMetrics, RunState},
    TrainingConfig, TrainingError,
};

const CONFIG_FILENAME: &str = "config.json";
const GRID_TAG: &str = "results";

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingOutcome {
    EarlyStopTriggered { epoch: usize },
    EpochsExhausted,
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub outcome: TrainingOutcome,
    pub epochs_completed: usize,
    pub best: BestMetrics,
    pub run_dir: PathBuf,
}

/// Result of one pass over the validation subset.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub summary: EvaluationSummary,
    pub grid: Option<RgbImage>,
}

pub struct Trainer {
    config: TrainingConfig,
    device: Device,
    run_dir: PathBuf,
    loader: BatchLoader,
    train_subset: Subset,
    val_subset: Subset,
    normalize: Normalize,
    sampler: Box<dyn BatchSampler>,
    model: Classifier,
    optimizer: TrainerOptimizer,
    scheduler: Box<dyn LRScheduler>,
    gradient_scaler: GradientScaler,
    criterion: Criterion,
    synthesizer: BatchSynthesizer,
    controller: CheckpointController,
    logger: Logger,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Result<Self, TrainingError> {
        config.validate()?;

        let dataset_kind = config.dataset_kind()?;
        let augmentation_kind = config.augmentation_kind()?;
        let sampler_kind = config.sampler_kind()?;
        let architecture = config.architecture()?;
        let criterion_kind = config.criterion_kind()?;

        let device = select_device();
        if device.is_cpu() {
            log::debug!("cpu backend keeps its own rng; skipping device seed");
        } else if let Err(err) = device.set_seed(config.runtime.seed) {
            log::warn!("failed to seed device RNG: {err}");
        }
        let precision = effective_precision(config.runtime.precision, &device);

        let mut dataset = MaskDataset::open(MaskDatasetConfig {
            data_dir: config.data.data_dir.clone(),
            kind: dataset_kind,
            val_ratio: config.data.val_ratio,
            age_filter: config.data.age_filter,
            seed: config.runtime.seed,
        })?;
        if dataset.is_empty() {
            return Err(TrainingError::initialization(format!(
                "no images found under {}",
                config.data.data_dir.display()
            )));
        }
        if let Some(max_samples) = config.data.statistics_samples {
            let stats = dataset.compute_statistics(max_samples)?;
            log::info!(
                "dataset statistics from {} images: mean {:?} std {:?}",
                max_samples.min(dataset.len()),
                stats.mean,
                stats.std
            );
        }
        let normalize = dataset.normalize();
        dataset.set_transform(augmentation_kind.build(config.data.resize, normalize));

        let (train_subset, val_subset) = dataset.split_dataset();
        if train_subset.is_empty() || val_subset.is_empty() {
            return Err(TrainingError::initialization(format!(
                "split produced {} training and {} validation samples; both must be non-empty",
                train_subset.len(),
                val_subset.len()
            )));
        }
        log::info!(
            "{} ({}): {} samples, {} train / {} val, transform {}",
            dataset_kind,
            dataset.root().display(),
            dataset.len(),
            train_subset.len(),
            val_subset.len(),
            augmentation_kind
        );

        let sampler = build_sampler(
            sampler_kind,
            &train_subset.labels(&dataset),
            &SamplerOptions {
                batch_size: config.data.batch_size,
                seed: config.runtime.seed,
                dynamic_lambda: config.data.dynamic_lambda,
                classes_per_batch: config.data.balance_classes_per_batch,
                samples_per_class: config.data.balance_samples_per_class,
            },
        )?;

        let num_classes = dataset.num_classes();
        let loader = BatchLoader::new(
            Arc::new(dataset),
            config.data.num_workers,
            config.data.prefetch_batches,
            device.clone(),
        )?;

        let model = Classifier::new(ModelConfig {
            architecture,
            num_classes,
            dropout_p: config.model.dropout,
            dtype: precision.parameter_dtype(),
            device: device.clone(),
        })
        .map_err(to_initialization_error)?;
        if let Some(path) = config.model.init_weights.as_ref() {
            checkpoint::apply_model_weights(&model, path)?;
            log::info!("loaded initial weights from {}", path.display());
        }
        log::info!(
            "model {} with {} parameters ({:?})",
            architecture,
            model.num_parameters(),
            precision.parameter_dtype()
        );

        let optimizer = TrainerOptimizer::new(
            model.parameters(),
            OptimizerConfig::try_from(&config.optimizer)?,
            TrainerOptimizerOptions::default(),
        )?;
        let scheduler = SchedulerConfig::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate,
        )?
        .build()?;
        let gradient_scaler = GradientScaler::new(precision);
        let criterion = Criterion::new(criterion_kind, num_classes, &config.loss);
        let synthesizer = BatchSynthesizer::new(&config.augment, config.runtime.seed);

        let run_dir = create_run_dir(&config.runtime.model_dir, &config.runtime.name)?;
        checkpoint::write_json(&run_dir.join(CONFIG_FILENAME), &config)?;
        let logger = Logger::new(LoggingSettings::from_config(
            config.runtime.tensorboard.then(|| run_dir.clone()),
            config.runtime.tensorboard_flush_every_n,
        ))?;
        let controller = CheckpointController::new(run_dir.clone(), &config)?;
        log::info!("writing run artifacts to {}", run_dir.display());

        Ok(Self {
            config,
            device,
            run_dir,
            loader,
            train_subset,
            val_subset,
            normalize,
            sampler,
            model,
            optimizer,
            scheduler,
            gradient_scaler,
            criterion,
            synthesizer,
            controller,
            logger,
        })
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn run_dir(&self) -> &std::path::Path {
        &self.run_dir
    }

    pub fn model(&self) -> &Classifier {
        &self.model
    }

    /// Runs epochs until they are exhausted or early stopping triggers.
    pub fn train(&mut self) -> Result<TrainingReport, TrainingError> {
        let epochs = self.config.runtime.epochs;
        let mut state = RunState::new();
        let mut outcome = TrainingOutcome::EpochsExhausted;
        let mut epochs_completed = 0;

        log::info!(
            "starting training on {:?}: {} epochs, sampler {}, criterion {}",
            self.device,
            epochs,
            self.sampler.kind(),
            self.criterion.kind()
        );

        for epoch in 0..epochs {
            self.train_epoch(epoch, &mut state)?;
            let lr = self.scheduler.step();
            self.optimizer.set_learning_rate(lr);

            let evaluation = self.evaluate()?;
            let decision =
                self.controller
                    .on_epoch_end(&mut state, epoch, &evaluation.summary, &self.model)?;
            self.logger
                .log_evaluation(epoch, &evaluation.summary, &state.best);
            if let Some(grid) = evaluation.grid.as_ref() {
                self.logger.log_image(GRID_TAG, epoch, grid);
            }
            self.logger.flush();
            epochs_completed = epoch + 1;

            if decision.stop {
                log::info!(
                    "no validation f1 improvement for {} epochs; stopping after epoch {}",
                    state.early_stop_counter,
                    epoch
                );
                outcome = TrainingOutcome::EarlyStopTriggered { epoch };
                break;
            }
        }

        if state.skipped_steps > 0 {
            log::info!(
                "{} of {} optimizer steps skipped on gradient overflow",
                state.skipped_steps,
                state.skipped_steps + state.optimizer_steps
            );
        }
        self.logger.flush();

        Ok(TrainingReport {
            outcome,
            epochs_completed,
            best: state.best,
            run_dir: self.run_dir.clone(),
        })
    }

    fn train_epoch(&mut self, epoch: usize, state: &mut RunState) -> Result<(), TrainingError> {
        self.model.set_training(true);
        let batches = self.sampler.epoch_batches(epoch);
        let total = batches.len();
        let stream = self.loader.stream(
            &self.train_subset,
            batches,
            true,
            self.config.runtime.seed.wrapping_add(epoch as u64),
        )?;
        let log_interval = self.config.runtime.log_interval;

        for (idx, batch) in stream.enumerate() {
            let batch = batch?;
            let (loss, logits) = self.forward_loss(&batch)?;

            let scaled = self.gradient_scaler.scale(&loss)?;
            let mut grads = scaled.backward().map_err(to_runtime_error)?;
            match self.optimizer.step(&mut grads, &self.gradient_scaler)? {
                StepOutcome::Applied => {
                    state.optimizer_steps += 1;
                    self.gradient_scaler.update(false);
                }
                StepOutcome::SkippedOverflow => {
                    state.skipped_steps += 1;
                    self.gradient_scaler.update(true);
                    log::debug!(
                        "gradient overflow at epoch {epoch} batch {idx}; loss scale now {}",
                        self.gradient_scaler.loss_scale()
                    );
                }
            }

            let predicted = predictions(&logits)?;
            let loss_value = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;
            state.interval.record(loss_value, &batch.label_ids, &predicted);

            if (idx + 1) % log_interval == 0 {
                if let Some(summary) = state.interval.flush() {
                    self.logger.log_train_interval(
                        IntervalPosition {
                            epoch,
                            epochs: self.config.runtime.epochs,
                            batch: idx + 1,
                            batches: total,
                            step: epoch * total + idx,
                        },
                        self.optimizer.learning_rate(),
                        &summary,
                    );
                }
            }
        }
        Ok(())
    }

    /// Forward pass and f32 loss, blending both targets for synthesized batches.
    fn forward_loss(&mut self, batch: &DataBatch) -> Result<(Tensor, Tensor), TrainingError> {
        match self.synthesizer.synthesize(&batch.images, &batch.labels)? {
            Some(MixedBatch {
                images,
                targets_a,
                targets_b,
                lambda,
                ..
            }) => {
                let logits = self.model.forward(&images).map_err(to_runtime_error)?;
                let loss_a = self.criterion.compute(&logits, &targets_a)?;
                let loss_b = self.criterion.compute(&logits, &targets_b)?;
                Ok((blend_losses(&loss_a, &loss_b, lambda)?, logits))
            }
            None => {
                let logits = self.model.forward(&batch.images).map_err(to_runtime_error)?;
                let loss = self.criterion.compute(&logits, &batch.labels)?;
                Ok((loss, logits))
            }
        }
    }

    /// Scores the validation subset with dropout disabled. Parameters are
    /// left untouched.
    pub fn evaluate(&self) -> Result<Evaluation, TrainingError> {
        let was_training = self.model.is_training();
        self.model.set_training(false);
        let result = self.evaluate_internal();
        self.model.set_training(was_training);
        result
    }

    fn evaluate_internal(&self) -> Result<Evaluation, TrainingError> {
        let stream = self.loader.sequential(
            &self.val_subset,
            self.config.data.valid_batch_size,
            self.config.runtime.seed,
        )?;

        let mut metrics = EvaluationMetrics::default();
        let mut grid = None;
        for (idx, batch) in stream.enumerate() {
            let batch = batch?;
            let logits = self
                .model
                .forward(&batch.images)
                .and_then(|logits| logits.detach().to_dtype(DType::F32))
                .map_err(to_runtime_error)?;
            let loss = self
                .criterion
                .compute(&logits, &batch.labels)?
                .to_vec0::<f32>()
                .map_err(to_runtime_error)?;
            let predicted = predictions(&logits)?;
            metrics.update(loss as f64, &batch.label_ids, &predicted);

            if idx == 0 {
                grid = match sample_grid(&batch.images, &batch.label_ids, &predicted, &self.normalize) {
                    Ok(image) => Some(image),
                    Err(err) => {
                        log::warn!("skipping sample grid: {err}");
                        None
                    }
                };
            }
        }

        let summary = metrics
            .finalize()
            .ok_or_else(|| TrainingError::runtime("validation produced no batches"))?;
        Ok(Evaluation { summary, grid })
    }
}

/// Metal, then CUDA, then CPU.
fn select_device() -> Device {
    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                log::info!("device: using Metal GPU #0");
                return device;
            }
            Err(err) => log::warn!("failed to initialize Metal device, trying next backend: {err}"),
        }
    }
    if cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => {
                log::info!("device: using CUDA GPU #0");
                return device;
            }
            Err(err) => log::warn!("CUDA reported available but initialization failed: {err}"),
        }
    }
    log::info!("device: no GPU backend available; using CPU");
    Device::Cpu
}

/// Reduced-precision parameters are only used on accelerators.
fn effective_precision(requested: Precision, device: &Device) -> Precision {
    if device.is_cpu() && requested != Precision::Fp32 {
        log::warn!("precision {requested:?} is not supported on the CPU backend; using fp32");
        return Precision::Fp32;
    }
    requested
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

fn to_initialization_error(err: candle_core::Error) -> TrainingError {
    TrainingError::initialization(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_runs_in_full_precision() {
        assert_eq!(effective_precision(Precision::Mixed, &Device::Cpu), Precision::Fp32);
        assert_eq!(effective_precision(Precision::Fp32, &Device::Cpu), Precision::Fp32);
    }
}
