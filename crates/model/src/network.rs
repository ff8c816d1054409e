use candle_core::{Result, Tensor};

/// Forward pass of an architecture; `train` toggles dropout.
pub(crate) trait Network: Send + Sync {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;
}
