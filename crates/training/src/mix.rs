//! Mixup and cutmix batch synthesis.

use candle_core::{DType, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use rand_distr::{Beta, Distribution};

use crate::{config::AugmentConfig, TrainingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Synthesis {
    Mixup,
    Cutmix,
}

/// A batch whose targets are the pair `(targets_a, targets_b)` weighted by
/// `lambda` and `1 - lambda`.
#[derive(Debug, Clone)]
pub struct MixedBatch {
    pub images: Tensor,
    pub targets_a: Tensor,
    pub targets_b: Tensor,
    pub lambda: f64,
    pub synthesis: Synthesis,
}

/// Cutmix box in pixel coordinates, `[x1, x2) x [y1, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CutBox {
    pub x1: usize,
    pub y1: usize,
    pub x2: usize,
    pub y2: usize,
}

impl CutBox {
    pub fn area(&self) -> usize {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }
}

#[derive(Debug)]
pub struct BatchSynthesizer {
    mixup_alpha: f64,
    cutmix_alpha: f64,
    mixup_threshold: f64,
    cutmix_threshold: f64,
    rng: StdRng,
}

impl BatchSynthesizer {
    pub fn new(config: &AugmentConfig, seed: u64) -> Self {
        Self {
            mixup_alpha: config.mixup_alpha,
            cutmix_alpha: config.cutmix_alpha,
            mixup_threshold: config.mixup_threshold,
            cutmix_threshold: config.cutmix_threshold,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mixup_alpha > 0.0 || self.cutmix_alpha > 0.0
    }

    /// Synthesis chosen for draw `r`; cutmix wins when both qualify.
    pub fn select(&self, r: f64) -> Option<Synthesis> {
        if self.cutmix_alpha > 0.0 && r > self.cutmix_threshold {
            Some(Synthesis::Cutmix)
        } else if self.mixup_alpha > 0.0 && r > self.mixup_threshold {
            Some(Synthesis::Mixup)
        } else {
            None
        }
    }

    /// Draws once and applies at most one synthesis to the batch.
    pub fn synthesize(
        &mut self,
        images: &Tensor,
        labels: &Tensor,
    ) -> Result<Option<MixedBatch>, TrainingError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let r: f64 = self.rng.gen();
        match self.select(r) {
            Some(Synthesis::Cutmix) => self.cutmix(images, labels).map(Some),
            Some(Synthesis::Mixup) => self.mixup(images, labels).map(Some),
            None => Ok(None),
        }
    }

    pub fn mixup(&mut self, images: &Tensor, labels: &Tensor) -> Result<MixedBatch, TrainingError> {
        let lambda = sample_lambda(&mut self.rng, self.mixup_alpha)?;
        let perm = self.permutation(images)?;
        let shuffled = images.index_select(&perm, 0).map_err(to_runtime_error)?;
        let mixed = (images.affine(lambda, 0.0).map_err(to_runtime_error)?
            + shuffled.affine(1.0 - lambda, 0.0).map_err(to_runtime_error)?)
        .map_err(to_runtime_error)?;
        Ok(MixedBatch {
            images: mixed,
            targets_a: labels.clone(),
            targets_b: labels.index_select(&perm, 0).map_err(to_runtime_error)?,
            lambda,
            synthesis: Synthesis::Mixup,
        })
    }

    pub fn cutmix(&mut self, images: &Tensor, labels: &Tensor) -> Result<MixedBatch, TrainingError> {
        let (_, _, height, width) = images.dims4().map_err(to_runtime_error)?;
        let lambda = sample_lambda(&mut self.rng, self.cutmix_alpha)?;
        let cut = cut_box(width, height, lambda, &mut self.rng);
        let perm = self.permutation(images)?;
        let shuffled = images.index_select(&perm, 0).map_err(to_runtime_error)?;

        let mut mask = vec![0f32; height * width];
        for y in cut.y1..cut.y2 {
            for x in cut.x1..cut.x2 {
                mask[y * width + x] = 1.0;
            }
        }
        let mask = Tensor::from_vec(mask, (1, 1, height, width), images.device())
            .and_then(|m| m.to_dtype(images.dtype()))
            .map_err(to_runtime_error)?;
        let keep = mask.affine(-1.0, 1.0).map_err(to_runtime_error)?;
        let mixed = (images.broadcast_mul(&keep).map_err(to_runtime_error)?
            + shuffled.broadcast_mul(&mask).map_err(to_runtime_error)?)
        .map_err(to_runtime_error)?;

        let lambda = 1.0 - cut.area() as f64 / (width * height) as f64;
        Ok(MixedBatch {
            images: mixed,
            targets_a: labels.clone(),
            targets_b: labels.index_select(&perm, 0).map_err(to_runtime_error)?,
            lambda,
            synthesis: Synthesis::Cutmix,
        })
    }

    fn permutation(&mut self, images: &Tensor) -> Result<Tensor, TrainingError> {
        let n = images.dim(0).map_err(to_runtime_error)?;
        let mut order: Vec<u32> = (0..n as u32).collect();
        order.shuffle(&mut self.rng);
        Tensor::from_vec(order, n, images.device()).map_err(to_runtime_error)
    }
}

fn sample_lambda(rng: &mut StdRng, alpha: f64) -> Result<f64, TrainingError> {
    if alpha <= 0.0 {
        return Ok(1.0);
    }
    let beta = Beta::new(alpha, alpha)
        .map_err(|err| TrainingError::runtime(format!("invalid beta parameter {alpha}: {err}")))?;
    Ok(beta.sample(rng))
}

/// Box of side `floor(dim * sqrt(1 - lambda))` centred on a uniform point,
/// clipped to the image.
pub fn cut_box(width: usize, height: usize, lambda: f64, rng: &mut StdRng) -> CutBox {
    let cut_ratio = (1.0 - lambda).clamp(0.0, 1.0).sqrt();
    let cut_w = (width as f64 * cut_ratio) as usize;
    let cut_h = (height as f64 * cut_ratio) as usize;
    let cx = rng.gen_range(0..width.max(1));
    let cy = rng.gen_range(0..height.max(1));
    CutBox {
        x1: cx.saturating_sub(cut_w / 2),
        y1: cy.saturating_sub(cut_h / 2),
        x2: (cx + cut_w / 2).min(width),
        y2: (cy + cut_h / 2).min(height),
    }
}

/// Blended criterion value `lambda * a + (1 - lambda) * b`.
pub fn blend_losses(a: &Tensor, b: &Tensor, lambda: f64) -> Result<Tensor, TrainingError> {
    let a = a.affine(lambda, 0.0).map_err(to_runtime_error)?;
    let b = b.affine(1.0 - lambda, 0.0).map_err(to_runtime_error)?;
    (a + b).map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn constant_batch(n: usize, h: usize, w: usize) -> (Tensor, Tensor) {
        let mut data = Vec::with_capacity(n * 3 * h * w);
        for i in 0..n {
            data.extend(std::iter::repeat(i as f32).take(3 * h * w));
        }
        let images = Tensor::from_vec(data, (n, 3, h, w), &Device::Cpu).unwrap();
        let labels = Tensor::from_vec((0..n as u32).collect::<Vec<_>>(), n, &Device::Cpu).unwrap();
        (images, labels)
    }

    fn config(mixup: f64, cutmix: f64) -> AugmentConfig {
        AugmentConfig {
            mixup_alpha: mixup,
            cutmix_alpha: cutmix,
            mixup_threshold: 0.3,
            cutmix_threshold: 0.6,
        }
    }

    #[test]
    fn selection_prefers_cutmix() {
        let synth = BatchSynthesizer::new(&config(1.0, 1.0), 0);
        assert_eq!(synth.select(0.9), Some(Synthesis::Cutmix));
        assert_eq!(synth.select(0.5), Some(Synthesis::Mixup));
        assert_eq!(synth.select(0.1), None);

        let mixup_only = BatchSynthesizer::new(&config(1.0, 0.0), 0);
        assert_eq!(mixup_only.select(0.9), Some(Synthesis::Mixup));
        let disabled = BatchSynthesizer::new(&config(0.0, 0.0), 0);
        assert!(!disabled.is_enabled());
        assert_eq!(disabled.select(0.99), None);
    }

    #[test]
    fn mixup_blends_with_weights_summing_to_one() {
        let (images, labels) = constant_batch(4, 5, 6);
        let mut synth = BatchSynthesizer::new(&config(0.4, 0.0), 3);
        let mixed = synth.mixup(&images, &labels).unwrap();

        assert_eq!(mixed.images.dims(), images.dims());
        assert!((0.0..=1.0).contains(&mixed.lambda));
        let a = mixed.targets_a.to_vec1::<u32>().unwrap();
        let b = mixed.targets_b.to_vec1::<u32>().unwrap();
        let values = mixed.images.flatten_from(1).unwrap().to_vec2::<f32>().unwrap();
        for i in 0..4 {
            let expected = mixed.lambda * a[i] as f64 + (1.0 - mixed.lambda) * b[i] as f64;
            for v in &values[i] {
                assert!((*v as f64 - expected).abs() < 1e-4);
            }
        }
    }

    #[test]
    fn cutmix_area_matches_lambda() {
        let (images, labels) = constant_batch(6, 16, 20);
        let mut synth = BatchSynthesizer::new(&config(0.0, 1.0), 9);
        for _ in 0..5 {
            let mixed = synth.cutmix(&images, &labels).unwrap();
            assert_eq!(mixed.images.dims(), images.dims());
            let a = mixed.targets_a.to_vec1::<u32>().unwrap();
            let b = mixed.targets_b.to_vec1::<u32>().unwrap();
            let values = mixed.images.flatten_from(1).unwrap().to_vec2::<f32>().unwrap();
            for i in 0..6 {
                if a[i] == b[i] {
                    continue;
                }
                let replaced = values[i]
                    .iter()
                    .filter(|v| (**v - a[i] as f32).abs() > 1e-6)
                    .count();
                let fraction = replaced as f64 / (3 * 16 * 20) as f64;
                assert!((fraction - (1.0 - mixed.lambda)).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn cut_box_stays_inside_image() {
        let mut rng = StdRng::seed_from_u64(5);
        for step in 0..50 {
            let lambda = step as f64 / 50.0;
            let cut = cut_box(32, 24, lambda, &mut rng);
            assert!(cut.x1 <= cut.x2 && cut.x2 <= 32);
            assert!(cut.y1 <= cut.y2 && cut.y2 <= 24);
        }
        assert_eq!(cut_box(32, 24, 1.0, &mut rng).area(), 0);
    }

    #[test]
    fn blend_weights_losses() {
        let a = Tensor::new(2.0f32, &Device::Cpu).unwrap();
        let b = Tensor::new(4.0f32, &Device::Cpu).unwrap();
        let blended = blend_losses(&a, &b, 0.25).unwrap().to_vec0::<f32>().unwrap();
        assert!((blended - 3.5).abs() < 1e-6);
    }
}
