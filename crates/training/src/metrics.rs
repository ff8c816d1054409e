use std::collections::BTreeSet;

use candle_core::{Tensor, D};
use serde::{Deserialize, Serialize};

use crate::TrainingError;

/// Macro-averaged F1 over every label present in either `truth` or
/// `predicted`. Classes with no true or predicted positives score 0.
pub fn macro_f1(truth: &[u32], predicted: &[u32]) -> f64 {
    if truth.is_empty() || truth.len() != predicted.len() {
        return 0.0;
    }
    let labels: BTreeSet<u32> = truth.iter().chain(predicted).copied().collect();
    let total: f64 = labels
        .iter()
        .map(|&label| {
            let mut tp = 0usize;
            let mut fp = 0usize;
            let mut fn_ = 0usize;
            for (&t, &p) in truth.iter().zip(predicted) {
                match (t == label, p == label) {
                    (true, true) => tp += 1,
                    (false, true) => fp += 1,
                    (true, false) => fn_ += 1,
                    (false, false) => {}
                }
            }
            let denom = 2 * tp + fp + fn_;
            if denom == 0 {
                0.0
            } else {
                2.0 * tp as f64 / denom as f64
            }
        })
        .sum();
    total / labels.len() as f64
}

/// Arg-max class per row of `[N, C]` logits.
pub fn predictions(logits: &Tensor) -> Result<Vec<u32>, TrainingError> {
    logits
        .argmax(D::Minus1)
        .and_then(|t| t.to_vec1::<u32>())
        .map_err(|err| TrainingError::runtime(err.to_string()))
}

pub fn count_correct(truth: &[u32], predicted: &[u32]) -> usize {
    truth
        .iter()
        .zip(predicted)
        .filter(|(t, p)| t == p)
        .count()
}

/// Training accumulators flushed every `log_interval` batches.
#[derive(Debug, Default, Clone)]
pub struct IntervalMetrics {
    loss_sum: f64,
    f1_sum: f64,
    correct: usize,
    samples: usize,
    batches: usize,
}

impl IntervalMetrics {
    pub fn record(&mut self, loss: f64, truth: &[u32], predicted: &[u32]) {
        self.loss_sum += loss;
        self.f1_sum += macro_f1(truth, predicted);
        self.correct += count_correct(truth, predicted);
        self.samples += truth.len();
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Averages over the interval and resets the accumulators.
    pub fn flush(&mut self) -> Option<IntervalSummary> {
        if self.batches == 0 {
            return None;
        }
        let summary = IntervalSummary {
            loss: self.loss_sum / self.batches as f64,
            accuracy: if self.samples == 0 {
                0.0
            } else {
                self.correct as f64 / self.samples as f64
            },
            f1: self.f1_sum / self.batches as f64,
        };
        *self = Self::default();
        Some(summary)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IntervalSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub f1: f64,
}

/// Validation accumulators: loss and F1 are averaged over batches, accuracy
/// over samples.
#[derive(Debug, Default)]
pub struct EvaluationMetrics {
    loss_sum: f64,
    f1_sum: f64,
    batches: usize,
    correct: usize,
    samples: usize,
}

impl EvaluationMetrics {
    pub fn update(&mut self, loss: f64, truth: &[u32], predicted: &[u32]) {
        self.loss_sum += loss;
        self.f1_sum += macro_f1(truth, predicted);
        self.correct += count_correct(truth, predicted);
        self.samples += truth.len();
        self.batches += 1;
    }

    pub fn finalize(self) -> Option<EvaluationSummary> {
        if self.batches == 0 || self.samples == 0 {
            return None;
        }
        Some(EvaluationSummary {
            loss: self.loss_sum / self.batches as f64,
            accuracy: self.correct as f64 / self.samples as f64,
            f1: self.f1_sum / self.batches as f64,
            samples: self.samples,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub f1: f64,
    pub samples: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_f1_matches_sklearn_semantics() {
        // sklearn: f1_score([0, 1, 2, 2], [0, 2, 2, 2], average="macro") == 0.6
        let f1 = macro_f1(&[0, 1, 2, 2], &[0, 2, 2, 2]);
        assert!((f1 - 0.6).abs() < 1e-9);
        assert_eq!(macro_f1(&[3, 3], &[3, 3]), 1.0);
        assert_eq!(macro_f1(&[1], &[2]), 0.0);
    }

    #[test]
    fn interval_flush_averages_and_resets() {
        let mut interval = IntervalMetrics::default();
        interval.record(1.0, &[0, 1], &[0, 1]);
        interval.record(3.0, &[0, 1], &[1, 1]);
        let summary = interval.flush().unwrap();
        assert!((summary.loss - 2.0).abs() < 1e-12);
        assert!((summary.accuracy - 0.75).abs() < 1e-12);
        assert_eq!(interval.batches(), 0);
        assert!(interval.flush().is_none());
    }

    #[test]
    fn evaluation_uses_sample_accuracy() {
        let mut metrics = EvaluationMetrics::default();
        metrics.update(0.5, &[0, 0, 0], &[0, 0, 0]);
        metrics.update(1.5, &[1], &[0]);
        let summary = metrics.finalize().unwrap();
        assert!((summary.loss - 1.0).abs() < 1e-12);
        assert!((summary.accuracy - 0.75).abs() < 1e-12);
        assert!((summary.f1 - 0.5).abs() < 1e-12);
        assert_eq!(summary.samples, 4);
    }

    #[test]
    fn predictions_take_row_argmax() {
        let logits = Tensor::new(
            &[[0.1f32, 0.9, 0.0], [2.0, -1.0, 1.0]],
            &candle_core::Device::Cpu,
        )
        .unwrap();
        assert_eq!(predictions(&logits).unwrap(), vec![1, 0]);
    }
}
