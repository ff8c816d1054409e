//! Validation sample grid rendered for TensorBoard.

use candle_core::{DType, Tensor};
use dataset::{denormalize_image, Normalize};
use image::{imageops, Rgb, RgbImage};

use crate::TrainingError;

pub const MAX_GRID_IMAGES: usize = 16;
const BORDER: u32 = 2;
const CORRECT: Rgb<u8> = Rgb([0, 200, 0]);
const WRONG: Rgb<u8> = Rgb([220, 0, 0]);

/// Tiles up to 16 denormalized images, each framed green when the
/// prediction matches the label and red otherwise.
pub fn sample_grid(
    images: &Tensor,
    truth: &[u32],
    predicted: &[u32],
    normalize: &Normalize,
) -> Result<RgbImage, TrainingError> {
    let (batch, channels, height, width) = images.dims4().map_err(to_runtime_error)?;
    if channels != 3 {
        return Err(TrainingError::runtime(format!(
            "sample grid expects 3 channels, got {channels}"
        )));
    }
    let count = batch.min(truth.len()).min(predicted.len()).min(MAX_GRID_IMAGES);
    if count == 0 {
        return Err(TrainingError::runtime("sample grid needs at least one image"));
    }

    let cols = (count as f64).sqrt().ceil() as u32;
    let rows = (count as u32).div_ceil(cols);
    let cell_w = width as u32 + 2 * BORDER;
    let cell_h = height as u32 + 2 * BORDER;
    let mut grid = RgbImage::new(cols * cell_w, rows * cell_h);

    let host = images
        .narrow(0, 0, count)
        .and_then(|t| t.to_dtype(DType::F32))
        .and_then(|t| t.flatten_from(1))
        .and_then(|t| t.to_vec2::<f32>())
        .map_err(to_runtime_error)?;

    for (idx, chw) in host.iter().enumerate() {
        let tile = denormalize_image(chw, height as u32, width as u32, normalize)?;
        let colour = if truth[idx] == predicted[idx] { CORRECT } else { WRONG };
        let mut framed = RgbImage::from_pixel(cell_w, cell_h, colour);
        imageops::replace(&mut framed, &tile, BORDER as i64, BORDER as i64);

        let x = (idx as u32 % cols) * cell_w;
        let y = (idx as u32 / cols) * cell_h;
        imageops::replace(&mut grid, &framed, x as i64, y as i64);
    }
    Ok(grid)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn frames_reflect_correctness() {
        let normalize = Normalize::new([0.0; 3], [1.0; 3]).unwrap();
        let images = Tensor::full(0.5f32, (3, 3, 4, 5), &Device::Cpu).unwrap();
        let grid = sample_grid(&images, &[1, 2, 3], &[1, 0, 3], &normalize).unwrap();

        // 3 images -> 2 columns x 2 rows of 9x8 cells.
        assert_eq!(grid.dimensions(), (18, 16));
        assert_eq!(*grid.get_pixel(0, 0), CORRECT);
        assert_eq!(*grid.get_pixel(9, 0), WRONG);
        assert_eq!(*grid.get_pixel(0, 8), CORRECT);
        assert_eq!(*grid.get_pixel(2, 2), Rgb([128, 128, 128]));
        assert_eq!(*grid.get_pixel(17, 15), Rgb([0, 0, 0]));
    }

    #[test]
    fn caps_at_sixteen_images() {
        let normalize = Normalize::new([0.0; 3], [1.0; 3]).unwrap();
        let images = Tensor::zeros((20, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = vec![0u32; 20];
        let grid = sample_grid(&images, &labels, &labels, &normalize).unwrap();
        assert_eq!(grid.dimensions(), (4 * 6, 4 * 6));
    }
}
