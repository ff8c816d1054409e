use candle_core::Tensor;

use crate::TrainingError;

pub mod loader;
pub mod sampler;

pub use loader::{BatchLoader, BatchStream};
pub use sampler::{build_sampler, BatchSampler, SamplerKind, SamplerOptions};

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// One batch as the training loop consumes it.
#[derive(Debug, Clone)]
pub struct DataBatch {
    /// `[N, 3, H, W]` normalized f32 images.
    pub images: Tensor,
    /// `[N]` u32 class ids.
    pub labels: Tensor,
    /// Host copy of `labels` for metric bookkeeping.
    pub label_ids: Vec<u32>,
}

impl DataBatch {
    pub fn len(&self) -> usize {
        self.label_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_ids.is_empty()
    }
}
