use std::{fmt, str::FromStr};

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{
    config::{LossConfig, UnknownName},
    TrainingError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionKind {
    CrossEntropy,
    Focal,
    LabelSmoothing,
    F1,
}

impl FromStr for CriterionKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cross_entropy" | "ce" => Ok(Self::CrossEntropy),
            "focal" => Ok(Self::Focal),
            "label_smoothing" => Ok(Self::LabelSmoothing),
            "f1" => Ok(Self::F1),
            _ => Err(UnknownName::new(
                "criterion",
                s,
                "cross_entropy, focal, label_smoothing, f1",
            )),
        }
    }
}

impl fmt::Display for CriterionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CriterionKind::CrossEntropy => "cross_entropy",
            CriterionKind::Focal => "focal",
            CriterionKind::LabelSmoothing => "label_smoothing",
            CriterionKind::F1 => "f1",
        };
        f.write_str(name)
    }
}

/// Classification criterion mapping `[N, C]` logits and `[N]` u32 labels to
/// a scalar f32 loss.
#[derive(Debug, Clone)]
pub struct Criterion {
    kind: CriterionKind,
    num_classes: usize,
    focal_gamma: f64,
    smoothing: f64,
    f1_epsilon: f64,
}

impl Criterion {
    pub fn new(kind: CriterionKind, num_classes: usize, config: &LossConfig) -> Self {
        Self {
            kind,
            num_classes,
            focal_gamma: config.focal_gamma,
            smoothing: config.smoothing,
            f1_epsilon: config.f1_epsilon,
        }
    }

    pub fn kind(&self) -> CriterionKind {
        self.kind
    }

    pub fn compute(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
        let (batch, classes) = logits.dims2().map_err(to_runtime_error)?;
        if classes != self.num_classes {
            return Err(TrainingError::runtime(format!(
                "criterion expects {} classes, logits have {}",
                self.num_classes, classes
            )));
        }
        if targets.dims() != [batch] {
            return Err(TrainingError::runtime(format!(
                "targets shape {:?} does not match batch of {}",
                targets.dims(),
                batch
            )));
        }
        if batch == 0 {
            return Err(TrainingError::runtime("cannot compute loss of an empty batch"));
        }
        let targets = match targets.dtype() {
            DType::U32 => targets.clone(),
            _ => targets.to_dtype(DType::U32).map_err(to_runtime_error)?,
        };

        // Loss math always runs in f32.
        let logits = logits.to_dtype(DType::F32).map_err(to_runtime_error)?;
        let log_probs = ops::log_softmax(&logits, D::Minus1).map_err(to_runtime_error)?;

        match self.kind {
            CriterionKind::CrossEntropy => nll(&log_probs, &targets),
            CriterionKind::Focal => {
                let probs = log_probs.exp().map_err(to_runtime_error)?;
                let modulator = probs
                    .affine(-1.0, 1.0)
                    .and_then(|t| t.powf(self.focal_gamma))
                    .map_err(to_runtime_error)?;
                let weighted = (modulator * &log_probs).map_err(to_runtime_error)?;
                nll(&weighted, &targets)
            }
            CriterionKind::LabelSmoothing => {
                let dist = self.smoothed_targets(&targets, batch)?;
                (dist * &log_probs)
                    .and_then(|t| t.sum(D::Minus1))
                    .and_then(|t| t.neg())
                    .and_then(|t| t.mean_all())
                    .map_err(to_runtime_error)
            }
            CriterionKind::F1 => self.soft_f1(&log_probs, &targets, batch),
        }
    }

    fn smoothed_targets(&self, targets: &Tensor, batch: usize) -> Result<Tensor, TrainingError> {
        let labels = host_labels(targets, self.num_classes)?;
        let off = (self.smoothing / (self.num_classes - 1).max(1) as f64) as f32;
        let on = (1.0 - self.smoothing) as f32;
        let mut dist = vec![off; batch * self.num_classes];
        for (row, label) in labels.iter().enumerate() {
            dist[row * self.num_classes + *label as usize] = on;
        }
        Tensor::from_vec(dist, (batch, self.num_classes), targets.device())
            .map_err(to_runtime_error)
    }

    /// `1 - mean(F1_c)` over soft per-class counts.
    fn soft_f1(
        &self,
        log_probs: &Tensor,
        targets: &Tensor,
        batch: usize,
    ) -> Result<Tensor, TrainingError> {
        let eps = self.f1_epsilon;
        let labels = host_labels(targets, self.num_classes)?;
        let mut one_hot = vec![0f32; batch * self.num_classes];
        for (row, label) in labels.iter().enumerate() {
            one_hot[row * self.num_classes + *label as usize] = 1.0;
        }
        let y_true = Tensor::from_vec(one_hot, (batch, self.num_classes), targets.device())
            .map_err(to_runtime_error)?;
        let y_pred = log_probs.exp().map_err(to_runtime_error)?;

        let run = || -> candle_core::Result<Tensor> {
            let not_true = y_true.affine(-1.0, 1.0)?;
            let not_pred = y_pred.affine(-1.0, 1.0)?;
            let tp = (&y_true * &y_pred)?.sum(0)?;
            let fp = (&not_true * &y_pred)?.sum(0)?;
            let fn_ = (&y_true * &not_pred)?.sum(0)?;

            let precision = (&tp / (&tp + &fp)?.affine(1.0, eps)?)?;
            let recall = (&tp / (&tp + &fn_)?.affine(1.0, eps)?)?;
            let numerator = (&precision * &recall)?.affine(2.0, 0.0)?;
            let denominator = (&precision + &recall)?.affine(1.0, eps)?;
            let f1 = (numerator / denominator)?.clamp(eps as f32, (1.0 - eps) as f32)?;
            f1.mean_all()?.affine(-1.0, 1.0)
        };
        run().map_err(to_runtime_error)
    }
}

fn nll(log_probs: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    let index = targets.unsqueeze(1).map_err(to_runtime_error)?;
    log_probs
        .gather(&index, 1)
        .and_then(|t| t.squeeze(1))
        .and_then(|t| t.neg())
        .and_then(|t| t.mean_all())
        .map_err(to_runtime_error)
}

fn host_labels(targets: &Tensor, num_classes: usize) -> Result<Vec<u32>, TrainingError> {
    let labels = targets.to_vec1::<u32>().map_err(to_runtime_error)?;
    if let Some(bad) = labels.iter().find(|&&l| l as usize >= num_classes) {
        return Err(TrainingError::runtime(format!(
            "label {bad} outside 0..{num_classes}"
        )));
    }
    Ok(labels)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn criterion(kind: CriterionKind) -> Criterion {
        Criterion::new(kind, 3, &LossConfig::default())
    }

    fn sample() -> (Tensor, Tensor) {
        let logits = Tensor::new(&[[2.0f32, 0.5, -1.0], [0.1, 0.2, 3.0]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[0u32, 2], &Device::Cpu).unwrap();
        (logits, targets)
    }

    fn value(kind: CriterionKind) -> f32 {
        let (logits, targets) = sample();
        criterion(kind)
            .compute(&logits, &targets)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap()
    }

    fn reference_ce() -> f32 {
        let rows = [[2.0f32, 0.5, -1.0], [0.1, 0.2, 3.0]];
        let targets = [0usize, 2];
        let mut total = 0.0;
        for (row, t) in rows.iter().zip(targets) {
            let lse = row.iter().map(|v| v.exp()).sum::<f32>().ln();
            total += lse - row[t];
        }
        total / 2.0
    }

    #[test]
    fn cross_entropy_matches_reference() {
        assert!((value(CriterionKind::CrossEntropy) - reference_ce()).abs() < 1e-5);
    }

    #[test]
    fn focal_is_below_cross_entropy() {
        let focal = value(CriterionKind::Focal);
        assert!(focal > 0.0);
        assert!(focal < value(CriterionKind::CrossEntropy));
    }

    #[test]
    fn label_smoothing_penalises_confidence() {
        let smoothed = value(CriterionKind::LabelSmoothing);
        assert!(smoothed > value(CriterionKind::CrossEntropy));
    }

    #[test]
    fn f1_loss_is_bounded() {
        let f1 = value(CriterionKind::F1);
        assert!(f1 > 0.0 && f1 < 1.0);

        let confident =
            Tensor::new(&[[20.0f32, 0.0, 0.0], [0.0, 20.0, 0.0], [0.0, 0.0, 20.0]], &Device::Cpu)
                .unwrap();
        let targets = Tensor::new(&[0u32, 1, 2], &Device::Cpu).unwrap();
        let perfect = criterion(CriterionKind::F1)
            .compute(&confident, &targets)
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(perfect < 1e-3);
    }

    #[test]
    fn rejects_out_of_range_labels() {
        let (logits, _) = sample();
        let targets = Tensor::new(&[0u32, 7], &Device::Cpu).unwrap();
        assert!(criterion(CriterionKind::LabelSmoothing)
            .compute(&logits, &targets)
            .is_err());
    }

    #[test]
    fn parses_registry_names() {
        assert_eq!(
            "cross_entropy".parse::<CriterionKind>().unwrap(),
            CriterionKind::CrossEntropy
        );
        assert_eq!(
            "label-smoothing".parse::<CriterionKind>().unwrap(),
            CriterionKind::LabelSmoothing
        );
        assert!("hinge".parse::<CriterionKind>().is_err());
    }
}
