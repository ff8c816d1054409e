//! Image transforms applied to samples before batching.
//!
//! Every transform ends with "to tensor + normalize": the output is a CHW
//! `f32` buffer normalized with the dataset's per-channel mean/std. Random
//! operations only run for training samples so validation stays
//! deterministic.

use std::{fmt, str::FromStr, sync::Arc};

use image::{imageops, imageops::FilterType, RgbImage};
use rand::{rngs::StdRng, Rng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::{DatasetError, DatasetResult};

/// Center crop applied by [`CustomAugmentation`], as (height, width).
const CUSTOM_CROP: (u32, u32) = (320, 256);
const CUSTOM_JITTER: f32 = 0.1;
const CUSTOM_FLIP_PROB: f64 = 0.5;
const CUSTOM_NOISE_STD: f32 = 0.1;

/// A decoded sample in CHW layout.
#[derive(Debug, Clone)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub height: u32,
    pub width: u32,
}

impl ImageTensor {
    pub fn shape(&self) -> (usize, usize, usize) {
        (3, self.height as usize, self.width as usize)
    }
}

pub trait Augmentation: Send + Sync + fmt::Debug {
    fn apply(&self, image: &RgbImage, train: bool, rng: &mut StdRng)
        -> DatasetResult<ImageTensor>;

    fn describe(&self) -> String;
}

/// Per-channel normalization constants.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Normalize {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalize {
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> DatasetResult<Self> {
        if std.iter().any(|s| *s <= 0.0 || !s.is_finite()) {
            return Err(DatasetError::Other(format!(
                "normalization std must be positive (got {:?})",
                std
            )));
        }
        Ok(Self { mean, std })
    }
}

/// Registry of the augmentations selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AugmentationKind {
    BaseAugmentation,
    CustomAugmentation,
}

impl AugmentationKind {
    pub fn build(self, resize: u32, normalize: Normalize) -> Arc<dyn Augmentation> {
        match self {
            AugmentationKind::BaseAugmentation => {
                Arc::new(BaseAugmentation::new(resize, normalize))
            }
            AugmentationKind::CustomAugmentation => {
                Arc::new(CustomAugmentation::new(resize, normalize))
            }
        }
    }
}

impl FromStr for AugmentationKind {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "baseaugmentation" | "base" => Ok(Self::BaseAugmentation),
            "customaugmentation" | "custom" => Ok(Self::CustomAugmentation),
            other => Err(DatasetError::Other(format!(
                "unknown augmentation '{other}' (expected BaseAugmentation or CustomAugmentation)"
            ))),
        }
    }
}

impl fmt::Display for AugmentationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AugmentationKind::BaseAugmentation => f.write_str("BaseAugmentation"),
            AugmentationKind::CustomAugmentation => f.write_str("CustomAugmentation"),
        }
    }
}

/// Resize (shorter side), to tensor, normalize.
#[derive(Debug, Clone)]
pub struct BaseAugmentation {
    resize: u32,
    normalize: Normalize,
}

impl BaseAugmentation {
    pub fn new(resize: u32, normalize: Normalize) -> Self {
        Self {
            resize: resize.max(1),
            normalize,
        }
    }
}

impl Augmentation for BaseAugmentation {
    fn apply(
        &self,
        image: &RgbImage,
        _train: bool,
        _rng: &mut StdRng,
    ) -> DatasetResult<ImageTensor> {
        let resized = resize_shorter_side(image, self.resize);
        Ok(to_normalized_tensor(&resized, &self.normalize))
    }

    fn describe(&self) -> String {
        format!("BaseAugmentation(resize={})", self.resize)
    }
}

/// Center crop, resize, brightness/contrast jitter, horizontal flip and
/// additive Gaussian noise.
#[derive(Debug, Clone)]
pub struct CustomAugmentation {
    resize: u32,
    normalize: Normalize,
    crop: (u32, u32),
    jitter: f32,
    flip_prob: f64,
    noise_std: f32,
}

impl CustomAugmentation {
    pub fn new(resize: u32, normalize: Normalize) -> Self {
        Self {
            resize: resize.max(1),
            normalize,
            crop: CUSTOM_CROP,
            jitter: CUSTOM_JITTER,
            flip_prob: CUSTOM_FLIP_PROB,
            noise_std: CUSTOM_NOISE_STD,
        }
    }
}

impl Augmentation for CustomAugmentation {
    fn apply(
        &self,
        image: &RgbImage,
        train: bool,
        rng: &mut StdRng,
    ) -> DatasetResult<ImageTensor> {
        let cropped = center_crop(image, self.crop.0, self.crop.1);
        let mut resized = resize_shorter_side(&cropped, self.resize);
        if !train {
            return Ok(to_normalized_tensor(&resized, &self.normalize));
        }

        if rng.gen_bool(self.flip_prob) {
            imageops::flip_horizontal_in_place(&mut resized);
        }
        let brightness = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        let contrast = 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        jitter_in_place(&mut resized, brightness, contrast);

        let mut tensor = to_normalized_tensor(&resized, &self.normalize);
        if self.noise_std > 0.0 {
            let noise = Normal::new(0.0f32, self.noise_std)
                .map_err(|err| DatasetError::Other(format!("invalid noise std: {err}")))?;
            for value in tensor.data.iter_mut() {
                *value += noise.sample(rng);
            }
        }
        Ok(tensor)
    }

    fn describe(&self) -> String {
        format!(
            "CustomAugmentation(crop={}x{} resize={} jitter={:.2} flip_p={:.2} noise_std={:.2})",
            self.crop.0, self.crop.1, self.resize, self.jitter, self.flip_prob, self.noise_std
        )
    }
}

/// Resizes so the shorter side equals `size`, keeping the aspect ratio.
pub fn resize_shorter_side(image: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return image.clone();
    }
    let (new_w, new_h) = if w <= h {
        (size, ((h as u64 * size as u64) / w as u64).max(1) as u32)
    } else {
        (((w as u64 * size as u64) / h as u64).max(1) as u32, size)
    };
    if (new_w, new_h) == (w, h) {
        return image.clone();
    }
    imageops::resize(image, new_w, new_h, FilterType::Triangle)
}

/// Crops a centered `height` x `width` window, clamped to the image bounds.
pub fn center_crop(image: &RgbImage, height: u32, width: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let crop_w = width.min(w);
    let crop_h = height.min(h);
    let x = (w - crop_w) / 2;
    let y = (h - crop_h) / 2;
    imageops::crop_imm(image, x, y, crop_w, crop_h).to_image()
}

fn jitter_in_place(image: &mut RgbImage, brightness: f32, contrast: f32) {
    let pixels = (image.width() as usize * image.height() as usize).max(1);
    let gray_mean = image
        .pixels()
        .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
        .sum::<f32>()
        / pixels as f32;
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            let bright = *channel as f32 * brightness;
            let contrasted = (bright - gray_mean) * contrast + gray_mean;
            *channel = contrasted.round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn to_normalized_tensor(image: &RgbImage, normalize: &Normalize) -> ImageTensor {
    let (w, h) = image.dimensions();
    let plane = w as usize * h as usize;
    let mut data = Vec::with_capacity(plane * 3);
    for c in 0..3 {
        let mean = normalize.mean[c];
        let std = normalize.std[c];
        data.extend(
            image
                .pixels()
                .map(|p| (p[c] as f32 / 255.0 - mean) / std),
        );
    }
    ImageTensor {
        data,
        height: h,
        width: w,
    }
}

/// Inverts normalization for a CHW buffer and returns an 8-bit image.
pub fn denormalize_image(
    chw: &[f32],
    height: u32,
    width: u32,
    normalize: &Normalize,
) -> DatasetResult<RgbImage> {
    let plane = height as usize * width as usize;
    if chw.len() != plane * 3 {
        return Err(DatasetError::Other(format!(
            "expected {} values for a 3x{}x{} image, got {}",
            plane * 3,
            height,
            width,
            chw.len()
        )));
    }
    let mut image = RgbImage::new(width, height);
    for (idx, pixel) in image.pixels_mut().enumerate() {
        for c in 0..3 {
            let value = chw[c * plane + idx] * normalize.std[c] + normalize.mean[c];
            pixel.0[c] = (value * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(image)
}
