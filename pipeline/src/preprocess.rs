//! Deterministic image preprocessing.
//!
//! Decode, force RGB, bilinear resize to the fixed training resolution,
//! scale to [0,1], then normalize with the ImageNet statistics the
//! checkpoints were trained under. Stateless: the same file bytes always
//! produce the same tensor.

use crate::error::{PipelineError, Result};
use common::constants::{IMG_SIZE, NORM_MEAN, NORM_STD};
use image::imageops::FilterType;
use ndarray::{Array3, Array4};
use std::path::Path;

/// Output of [`preprocess`]: the normalized model input together with
/// the un-normalized resized RGB frame kept for heatmap overlays.
#[derive(Debug)]
pub struct PreprocessedImage {
    /// Normalized input, shape `[1, 3, 224, 224]`.
    pub tensor: Array4<f32>,
    /// Resized frame in `[0,1]`, shape `[224, 224, 3]`.
    pub rgb: Array3<f32>,
    /// File stem, used to name heatmap artifacts.
    pub stem: String,
}

pub fn preprocess(path: &Path) -> Result<PreprocessedImage> {
    let decoded = image::open(path).map_err(|e| PipelineError::ImageDecode {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let size = IMG_SIZE as usize;
    let resized = decoded
        .resize_exact(IMG_SIZE, IMG_SIZE, FilterType::Triangle)
        .to_rgb8();

    let mut rgb = Array3::<f32>::zeros((size, size, 3));
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = resized.get_pixel(x as u32, y as u32).0;
            for c in 0..3 {
                let value = f32::from(pixel[c]) / 255.0;
                rgb[[y, x, c]] = value;
                tensor[[0, c, y, x]] = (value - NORM_MEAN[c]) / NORM_STD[c];
            }
        }
    }

    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("image")
        .to_string();
    Ok(PreprocessedImage { tensor, rgb, stem })
}
