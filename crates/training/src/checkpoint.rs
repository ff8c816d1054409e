use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use model::Classifier;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{metrics::EvaluationSummary, state::RunState, TrainingConfig, TrainingError};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const BEST_STEM: &str = "best";
pub const LAST_STEM: &str = "last";
const WEIGHTS_EXTENSION: &str = "safetensors";
const MANIFEST_EXTENSION: &str = "json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Sidecar written next to every weights file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub epoch: usize,
    pub metrics: EvaluationSummary,
    pub config_sha256: String,
    pub weights: FileRecord,
}

/// What the controller decided for one finished epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochDecision {
    pub improved: bool,
    pub periodic: bool,
    pub stop: bool,
}

#[derive(Debug)]
pub struct CheckpointController {
    run_dir: PathBuf,
    config_sha256: String,
    checkpoint_every: usize,
    num_early_stop: usize,
}

impl CheckpointController {
    pub fn new(run_dir: impl Into<PathBuf>, config: &TrainingConfig) -> Result<Self, TrainingError> {
        Ok(Self {
            run_dir: run_dir.into(),
            config_sha256: fingerprint_config(config)?,
            checkpoint_every: config.runtime.checkpoint_every_n_epochs.max(1),
            num_early_stop: config.runtime.num_early_stop.max(1),
        })
    }

    /// Updates best metrics and the early-stop counter in `state`.
    pub fn assess(&self, state: &mut RunState, epoch: usize, summary: &EvaluationSummary) -> EpochDecision {
        state.best.accuracy = state.best.accuracy.max(summary.accuracy);
        state.best.loss = state.best.loss.min(summary.loss);

        let improved = summary.f1 > state.best.f1;
        if improved {
            state.best.f1 = summary.f1;
            state.early_stop_counter = 0;
        } else {
            state.early_stop_counter += 1;
        }

        EpochDecision {
            improved,
            periodic: (epoch + 1) % self.checkpoint_every == 0,
            stop: state.early_stop_counter >= self.num_early_stop,
        }
    }

    /// Assesses the epoch and writes `last`, `epoch{N}` and `best` as decided.
    pub fn on_epoch_end(
        &self,
        state: &mut RunState,
        epoch: usize,
        summary: &EvaluationSummary,
        model: &Classifier,
    ) -> Result<EpochDecision, TrainingError> {
        let decision = self.assess(state, epoch, summary);

        self.save(LAST_STEM, epoch, summary, model)?;
        if decision.periodic {
            self.save(&format!("epoch{epoch}"), epoch, summary, model)?;
        }
        if decision.improved {
            let path = self.save(BEST_STEM, epoch, summary, model)?;
            log::info!(
                "new best model (f1 {:.4}) saved to {}",
                summary.f1,
                path.display()
            );
        }
        Ok(decision)
    }

    fn save(
        &self,
        stem: &str,
        epoch: usize,
        summary: &EvaluationSummary,
        model: &Classifier,
    ) -> Result<PathBuf, TrainingError> {
        fs::create_dir_all(&self.run_dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create run directory {}: {err}",
                self.run_dir.display()
            ))
        })?;

        let weights_path = weights_path(&self.run_dir, stem);
        save_model_weights(model, &weights_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            created_unix_timestamp: unix_timestamp(),
            epoch,
            metrics: *summary,
            config_sha256: self.config_sha256.clone(),
            weights: file_record(&weights_path)?,
        };
        write_json(&manifest_path(&self.run_dir, stem), &manifest)?;
        log::debug!("saved checkpoint {stem} for epoch {epoch}");
        Ok(weights_path)
    }
}

pub fn weights_path(run_dir: &Path, stem: &str) -> PathBuf {
    run_dir.join(format!("{stem}.{WEIGHTS_EXTENSION}"))
}

pub fn manifest_path(run_dir: &Path, stem: &str) -> PathBuf {
    run_dir.join(format!("{stem}.{MANIFEST_EXTENSION}"))
}

/// Reads a manifest and verifies the weights file against its checksum.
pub fn load_manifest(run_dir: &Path, stem: &str) -> Result<CheckpointManifest, TrainingError> {
    let manifest: CheckpointManifest = read_json(&manifest_path(run_dir, stem))?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }
    let weights = run_dir.join(&manifest.weights.filename);
    if sha256_file(&weights)? != manifest.weights.sha256 {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            weights.display()
        )));
    }
    Ok(manifest)
}

/// Loads a safetensors file into the classifier; names must match exactly.
pub fn apply_model_weights(model: &Classifier, weights_path: &Path) -> Result<(), TrainingError> {
    let device = model.config().device.clone();
    let tensors = load_safetensors(weights_path, &device).map_err(to_runtime_error)?;
    let mut params_by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in model.parameters() {
        let tensor = params_by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!(
                "weights file {} is missing parameter {name}",
                weights_path.display()
            ))
        })?;
        if tensor.dims() != var.as_tensor().dims() {
            return Err(TrainingError::runtime(format!(
                "parameter {name} has shape {:?}, model expects {:?}",
                tensor.dims(),
                var.as_tensor().dims()
            )));
        }
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor
        } else {
            tensor.to_dtype(desired_dtype).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !params_by_name.is_empty() {
        let mut extra = params_by_name.keys().cloned().collect::<Vec<_>>();
        extra.sort();
        return Err(TrainingError::runtime(format!(
            "weights file contains unused parameters: {}",
            extra.join(", ")
        )));
    }

    Ok(())
}

pub fn save_model_weights(model: &Classifier, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let tensors: HashMap<String, _> = named_parameters
        .into_iter()
        .map(|(name, var)| (name, var.as_tensor().clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

pub fn fingerprint_config(config: &TrainingConfig) -> Result<String, TrainingError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| TrainingError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data)
        .and_then(|_| file.write_all(b"\n"))
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!("failed to stat {}: {err}", path.display()))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha256_file(path)?,
        bytes,
    })
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use model::{Architecture, ModelConfig};

    use super::*;

    fn summary(f1: f64) -> EvaluationSummary {
        EvaluationSummary {
            loss: 1.0 - f1,
            accuracy: f1,
            f1,
            samples: 10,
        }
    }

    fn controller(dir: &Path, epochs: usize, patience: usize) -> CheckpointController {
        let mut config = TrainingConfig::default();
        config.runtime.epochs = epochs;
        config.runtime.num_early_stop = patience;
        CheckpointController::new(dir, &config).unwrap()
    }

    fn tiny_model() -> Classifier {
        Classifier::new(ModelConfig::new(Architecture::BaseModel, 18)).unwrap()
    }

    #[test]
    fn stops_after_patience_and_keeps_first_best() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), 3, 2);
        let model = tiny_model();
        let mut state = RunState::new();

        let mut stopped_at = None;
        for (epoch, f1) in [0.50, 0.48, 0.40].into_iter().enumerate() {
            let decision = controller
                .on_epoch_end(&mut state, epoch, &summary(f1), &model)
                .unwrap();
            assert_eq!(decision.improved, epoch == 0);
            if decision.stop {
                stopped_at = Some(epoch);
                break;
            }
        }

        assert_eq!(stopped_at, Some(2));
        assert_eq!(state.best.f1, 0.50);
        assert_eq!(state.best.accuracy, 0.50);
        assert!((state.best.loss - 0.50).abs() < 1e-12);

        let best = load_manifest(dir.path(), BEST_STEM).unwrap();
        assert_eq!(best.epoch, 0);
        assert_eq!(best.metrics.f1, 0.50);
        let last = load_manifest(dir.path(), LAST_STEM).unwrap();
        assert_eq!(last.epoch, 2);

        let best_files = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("best."))
            .count();
        assert_eq!(best_files, 2);
    }

    #[test]
    fn periodic_checkpoints_follow_interval() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), 10, 10);
        let mut state = RunState::new();
        let periodic: Vec<usize> = (0..10)
            .filter(|&epoch| {
                controller
                    .assess(&mut state, epoch, &summary(epoch as f64 / 10.0))
                    .periodic
            })
            .collect();
        assert_eq!(periodic, vec![4, 9]);
    }

    #[test]
    fn equal_f1_is_not_an_improvement() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(dir.path(), 5, 3);
        let mut state = RunState::new();
        assert!(controller.assess(&mut state, 0, &summary(0.3)).improved);
        let decision = controller.assess(&mut state, 1, &summary(0.3));
        assert!(!decision.improved);
        assert_eq!(state.early_stop_counter, 1);
    }

    #[test]
    fn weights_round_trip_into_fresh_model() {
        let dir = tempfile::tempdir().unwrap();
        let source = tiny_model();
        let path = dir.path().join("init.safetensors");
        save_model_weights(&source, &path).unwrap();

        let target = tiny_model();
        apply_model_weights(&target, &path).unwrap();
        for ((name_a, a), (name_b, b)) in source.parameters().iter().zip(target.parameters()) {
            assert_eq!(name_a, &name_b);
            let diff = (a.as_tensor() - b.as_tensor())
                .unwrap()
                .abs()
                .unwrap()
                .sum_all()
                .unwrap()
                .to_vec0::<f32>()
                .unwrap();
            assert_eq!(diff, 0.0);
        }

        let mismatched = Classifier::new(ModelConfig::new(Architecture::RBaseModel, 18)).unwrap();
        assert!(apply_model_weights(&mismatched, &path).is_err());
    }
}
