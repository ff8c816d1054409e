use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::DType;
use dataset::{AugmentationKind, DatasetError, DatasetKind};
use model::Architecture;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::{data::SamplerKind, loss::CriterionKind, optimizer::OptimizerKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub loss: LossConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub augment: AugmentConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl TrainingConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);

        Ok(config)
    }

    /// Checks every field and resolves every registry name, reporting all
    /// problems at once.
    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = self.data.dataset.parse::<DatasetKind>() {
            errors.push(format!("data.dataset: {err}"));
        }
        if let Err(err) = self.data.augmentation.parse::<AugmentationKind>() {
            errors.push(format!("data.augmentation: {err}"));
        }
        if let Err(err) = self.data.sampler.parse::<SamplerKind>() {
            errors.push(format!("data.sampler: {err}"));
        }
        if let Err(err) = self.model.architecture.parse::<Architecture>() {
            errors.push(format!("model.architecture: {err}"));
        }
        if let Err(err) = self.loss.criterion.parse::<CriterionKind>() {
            errors.push(format!("loss.criterion: {err}"));
        }
        if let Err(err) = self.optimizer.algorithm.parse::<OptimizerKind>() {
            errors.push(format!("optimizer.algorithm: {err}"));
        }

        if self.data.resize == 0 {
            errors.push("data.resize must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&self.data.val_ratio) {
            errors.push("data.val_ratio must be in [0, 1)".to_string());
        }
        if self.data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if self.data.valid_batch_size == 0 {
            errors.push("data.valid_batch_size must be greater than 0".to_string());
        }
        if self.data.num_workers == 0 {
            errors.push("data.num_workers must be greater than 0".to_string());
        }
        if self.data.prefetch_batches == 0 {
            errors.push("data.prefetch_batches must be greater than 0".to_string());
        }
        if self.data.balance_classes_per_batch < 2 {
            errors.push("data.balance_classes_per_batch must be at least 2".to_string());
        }
        if self.data.balance_samples_per_class < 2 {
            errors.push("data.balance_samples_per_class must be at least 2".to_string());
        }
        if !(0.0..=1.0).contains(&self.data.dynamic_lambda) || self.data.dynamic_lambda == 0.0 {
            errors.push("data.dynamic_lambda must be in (0, 1]".to_string());
        }

        if !(0.0..1.0).contains(&self.model.dropout) {
            errors.push("model.dropout must be in [0, 1)".to_string());
        }
        if let Some(path) = &self.model.init_weights {
            if !path.is_file() {
                errors.push(format!(
                    "model.init_weights does not exist: {}",
                    path.display()
                ));
            }
        }

        if self.loss.focal_gamma < 0.0 {
            errors.push("loss.focal_gamma must be >= 0".to_string());
        }
        if !(0.0..1.0).contains(&self.loss.smoothing) {
            errors.push("loss.smoothing must be in [0, 1)".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            errors.push("optimizer.momentum must be in [0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if self.scheduler.lr_decay_step == 0 {
            errors.push("scheduler.lr_decay_step must be greater than 0".to_string());
        }
        if !(self.scheduler.gamma > 0.0 && self.scheduler.gamma <= 1.0) {
            errors.push("scheduler.gamma must be in (0, 1]".to_string());
        }

        if self.augment.mixup_alpha < 0.0 {
            errors.push("augment.mixup_alpha must be >= 0".to_string());
        }
        if self.augment.cutmix_alpha < 0.0 {
            errors.push("augment.cutmix_alpha must be >= 0".to_string());
        }
        for (label, value) in [
            ("augment.mixup_threshold", self.augment.mixup_threshold),
            ("augment.cutmix_threshold", self.augment.cutmix_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                errors.push(format!("{label} must be in [0, 1]"));
            }
        }

        if self.runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if self.runtime.log_interval == 0 {
            errors.push("runtime.log_interval must be greater than 0".to_string());
        }
        if self.runtime.num_early_stop == 0 {
            errors.push("runtime.num_early_stop must be greater than 0".to_string());
        }
        if self.runtime.checkpoint_every_n_epochs == 0 {
            errors.push("runtime.checkpoint_every_n_epochs must be greater than 0".to_string());
        }
        if self.runtime.name.trim().is_empty() || self.runtime.name.contains('/') {
            errors.push("runtime.name must be a non-empty directory name".to_string());
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }

    /// Sets the value at a dot-separated path (`optimizer.learning_rate=0.01`).
    pub fn apply_override(self, path: &str, raw: &str) -> Result<Self, TrainingError> {
        let mut value = serde_json::to_value(self).map_err(|err| {
            TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
        })?;
        let segments: Vec<&str> = path.split('.').map(str::trim).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(TrainingError::validation(vec![format!(
                "invalid override path '{path}'"
            )]));
        }
        assign_at_path(&mut value, &segments, parse_override_value(raw), path)?;
        serde_json::from_value(value).map_err(|err| {
            TrainingError::validation(vec![format!("override '{path}={raw}' rejected: {err}")])
        })
    }

    fn apply_base_path(&mut self, base: &Path) {
        absolutize_in_place(&mut self.data.data_dir, base);
        absolutize_in_place(&mut self.runtime.model_dir, base);
        if let Some(path) = self.model.init_weights.as_mut() {
            absolutize_in_place(path, base);
        }
    }

    pub fn dataset_kind(&self) -> Result<DatasetKind, TrainingError> {
        Ok(self.data.dataset.parse::<DatasetKind>()?)
    }

    pub fn augmentation_kind(&self) -> Result<AugmentationKind, TrainingError> {
        Ok(self.data.augmentation.parse::<AugmentationKind>()?)
    }

    pub fn sampler_kind(&self) -> Result<SamplerKind, TrainingError> {
        Ok(self.data.sampler.parse::<SamplerKind>()?)
    }

    pub fn architecture(&self) -> Result<Architecture, TrainingError> {
        self.model
            .architecture
            .parse::<Architecture>()
            .map_err(|err| TrainingError::validation(vec![err.to_string()]))
    }

    pub fn criterion_kind(&self) -> Result<CriterionKind, TrainingError> {
        Ok(self.loss.criterion.parse::<CriterionKind>()?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_dataset")]
    pub dataset: String,
    #[serde(default = "default_augmentation")]
    pub augmentation: String,
    #[serde(default = "default_resize")]
    pub resize: u32,
    #[serde(default = "default_true")]
    pub age_filter: bool,
    #[serde(default = "default_val_ratio")]
    pub val_ratio: f32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub valid_batch_size: usize,
    #[serde(default = "default_sampler")]
    pub sampler: String,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    #[serde(default = "default_prefetch_batches")]
    pub prefetch_batches: usize,
    #[serde(default = "default_balance_classes")]
    pub balance_classes_per_batch: usize,
    #[serde(default = "default_balance_samples")]
    pub balance_samples_per_class: usize,
    #[serde(default = "default_dynamic_lambda")]
    pub dynamic_lambda: f64,
    /// Recompute mean/std from this many images instead of the defaults.
    #[serde(default)]
    pub statistics_samples: Option<usize>,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dataset: default_dataset(),
            augmentation: default_augmentation(),
            resize: default_resize(),
            age_filter: true,
            val_ratio: default_val_ratio(),
            batch_size: default_batch_size(),
            valid_batch_size: default_batch_size(),
            sampler: default_sampler(),
            num_workers: default_num_workers(),
            prefetch_batches: default_prefetch_batches(),
            balance_classes_per_batch: default_balance_classes(),
            balance_samples_per_class: default_balance_samples(),
            dynamic_lambda: default_dynamic_lambda(),
            statistics_samples: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default)]
    pub init_weights: Option<PathBuf>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            architecture: default_architecture(),
            dropout: default_dropout(),
            init_weights: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LossConfig {
    #[serde(default = "default_criterion")]
    pub criterion: String,
    #[serde(default = "default_focal_gamma")]
    pub focal_gamma: f64,
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
    #[serde(default = "default_f1_epsilon")]
    pub f1_epsilon: f64,
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            criterion: default_criterion(),
            focal_gamma: default_focal_gamma(),
            smoothing: default_smoothing(),
            f1_epsilon: default_f1_epsilon(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_optimizer")]
    pub algorithm: String,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub momentum: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            algorithm: default_optimizer(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            momentum: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_lr_decay_step")]
    pub lr_decay_step: usize,
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lr_decay_step: default_lr_decay_step(),
            gamma: default_gamma(),
        }
    }
}

/// Batch synthesis coefficients; an alpha of zero disables that synthesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AugmentConfig {
    #[serde(default)]
    pub mixup_alpha: f64,
    #[serde(default)]
    pub cutmix_alpha: f64,
    #[serde(default)]
    pub mixup_threshold: f64,
    #[serde(default)]
    pub cutmix_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_precision")]
    pub precision: Precision,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default = "default_num_early_stop")]
    pub num_early_stop: usize,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every_n_epochs: usize,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_true")]
    pub tensorboard: bool,
    #[serde(default = "default_flush_every")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            epochs: default_epochs(),
            precision: default_precision(),
            log_interval: default_log_interval(),
            num_early_stop: default_num_early_stop(),
            checkpoint_every_n_epochs: default_checkpoint_every(),
            name: default_name(),
            model_dir: default_model_dir(),
            tensorboard: true,
            tensorboard_flush_every_n: default_flush_every(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    Fp32,
    Fp16,
    Bf16,
    Mixed,
}

impl Precision {
    /// Parameter dtype used by the model under this precision.
    pub fn parameter_dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 | Precision::Mixed => DType::BF16,
        }
    }
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Mixed
    }
}

impl std::str::FromStr for Precision {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fp32" | "f32" => Ok(Precision::Fp32),
            "fp16" | "f16" => Ok(Precision::Fp16),
            "bf16" => Ok(Precision::Bf16),
            "mixed" | "amp" => Ok(Precision::Mixed),
            _ => Err(UnknownName::new("precision", s, "fp32, fp16, bf16, mixed")),
        }
    }
}

/// Lookup failure for a name-selected component.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} '{name}' (expected one of: {expected})")]
pub struct UnknownName {
    pub kind: &'static str,
    pub name: String,
    pub expected: &'static str,
}

impl UnknownName {
    pub fn new(kind: &'static str, name: &str, expected: &'static str) -> Self {
        Self {
            kind,
            name: name.trim().to_string(),
            expected,
        }
    }
}

impl From<UnknownName> for TrainingError {
    fn from(value: UnknownName) -> Self {
        TrainingError::Validation(vec![value.to_string()])
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn assign_at_path(
    target: &mut Value,
    segments: &[&str],
    new_value: Value,
    full_path: &str,
) -> Result<(), TrainingError> {
    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::validation(vec![
            "override path must not be empty".to_string()
        ]));
    };
    let mut current = target;
    for segment in parents {
        current = current
            .as_object_mut()
            .and_then(|map| map.get_mut(*segment))
            .ok_or_else(|| {
                TrainingError::validation(vec![format!(
                    "override path '{full_path}' has no section '{segment}'"
                )])
            })?;
    }
    let map = current.as_object_mut().ok_or_else(|| {
        TrainingError::validation(vec![format!(
            "override path '{full_path}' does not point into a section"
        )])
    })?;
    map.insert((*last).to_string(), new_value);
    Ok(())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/opt/ml/input/data/train/images")
}

fn default_dataset() -> String {
    "MaskSplitByProfileDataset".to_string()
}

fn default_augmentation() -> String {
    "BaseAugmentation".to_string()
}

fn default_resize() -> u32 {
    224
}

fn default_true() -> bool {
    true
}

fn default_val_ratio() -> f32 {
    0.2
}

fn default_batch_size() -> usize {
    128
}

fn default_sampler() -> String {
    "uniform-shuffle".to_string()
}

fn default_num_workers() -> usize {
    4
}

fn default_prefetch_batches() -> usize {
    2
}

fn default_balance_classes() -> usize {
    8
}

fn default_balance_samples() -> usize {
    16
}

fn default_dynamic_lambda() -> f64 {
    0.9
}

fn default_architecture() -> String {
    "RBaseModel".to_string()
}

fn default_dropout() -> f32 {
    0.25
}

fn default_criterion() -> String {
    "cross_entropy".to_string()
}

fn default_focal_gamma() -> f64 {
    2.0
}

fn default_smoothing() -> f64 {
    0.1
}

fn default_f1_epsilon() -> f64 {
    1e-7
}

fn default_optimizer() -> String {
    "SGD".to_string()
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_weight_decay() -> f64 {
    5e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_lr_decay_step() -> usize {
    20
}

fn default_gamma() -> f64 {
    0.5
}

fn default_seed() -> u64 {
    42
}

fn default_epochs() -> usize {
    50
}

fn default_precision() -> Precision {
    Precision::Mixed
}

fn default_log_interval() -> usize {
    20
}

fn default_num_early_stop() -> usize {
    3
}

fn default_checkpoint_every() -> usize {
    5
}

fn default_name() -> String {
    "exp".to_string()
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("./model")
}

fn default_flush_every() -> usize {
    10
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ConfigFormat(String),
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("trainer initialization failed: {0}")]
    Initialization(String),
    #[error("training failed: {0}")]
    Runtime(String),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        TrainingConfig::default().validate().unwrap();
    }

    #[test]
    fn collects_every_problem() {
        let mut config = TrainingConfig::default();
        config.data.sampler = "round-robin".into();
        config.model.architecture = "VGG".into();
        config.runtime.epochs = 0;

        let Err(TrainingError::Validation(messages)) = config.validate() else {
            panic!("expected validation error");
        };
        assert_eq!(messages.len(), 3);
        assert!(messages[0].starts_with("data.sampler"));
        assert!(messages[1].starts_with("model.architecture"));
    }

    #[test]
    fn overrides_nested_values() {
        let config = TrainingConfig::default()
            .apply_override("optimizer.learning_rate", "0.05")
            .unwrap()
            .apply_override("data.age_filter", "false")
            .unwrap()
            .apply_override("runtime.precision", "bf16")
            .unwrap();
        assert_eq!(config.optimizer.learning_rate, 0.05);
        assert!(!config.data.age_filter);
        assert_eq!(config.runtime.precision, Precision::Bf16);

        assert!(TrainingConfig::default()
            .apply_override("nosuch.field", "1")
            .is_err());
    }

    #[test]
    fn loads_toml_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[data]\ndata_dir = \"images\"\nsampler = \"weighted\"\n\n[runtime]\nepochs = 3"
        )
        .unwrap();

        let config = TrainingConfig::from_path(&path).unwrap();
        assert_eq!(config.data.data_dir, dir.path().join("images"));
        assert_eq!(config.runtime.epochs, 3);
        assert_eq!(config.data.batch_size, 128);
        config.validate().unwrap();
    }
}
