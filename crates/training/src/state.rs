use crate::metrics::IntervalMetrics;

/// Best validation figures seen so far in a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMetrics {
    pub f1: f64,
    pub accuracy: f64,
    pub loss: f64,
}

impl Default for BestMetrics {
    fn default() -> Self {
        Self {
            f1: 0.0,
            accuracy: 0.0,
            loss: f64::INFINITY,
        }
    }
}

/// Mutable per-run bookkeeping threaded through the training loop.
#[derive(Debug, Default)]
pub struct RunState {
    pub interval: IntervalMetrics,
    pub best: BestMetrics,
    pub early_stop_counter: usize,
    pub optimizer_steps: usize,
    pub skipped_steps: usize,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }
}
