pub mod checkpoint;
pub mod config;
pub mod data;
pub mod grid;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod mix;
pub mod optimizer;
pub mod run_dir;
pub mod scheduler;
pub mod state;
pub mod trainer;

pub use checkpoint::{CheckpointController, CheckpointManifest, EpochDecision};
pub use config::{Precision, TrainingConfig, TrainingError};
pub use data::{BatchLoader, BatchSampler, DataBatch, SamplerKind};
pub use loss::{Criterion, CriterionKind};
pub use metrics::{EvaluationSummary, IntervalSummary};
pub use mix::{BatchSynthesizer, MixedBatch, Synthesis};
pub use optimizer::{
    GradientScaler, OptimizerConfig, OptimizerKind, StepOutcome, TrainerOptimizer,
    TrainerOptimizerOptions,
};
pub use scheduler::{LRScheduler, SchedulerConfig};
pub use state::{BestMetrics, RunState};
pub use trainer::{Evaluation, Trainer, TrainingOutcome, TrainingReport};
