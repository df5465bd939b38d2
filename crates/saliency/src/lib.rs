//! Spatial saliency overlays from backbone token features
//!
//! Each spatial token is scored by the L2 norm of its feature vector. Scores are laid
//! out on the √N × √N patch grid, min-max normalized, bilinearly upsampled to the
//! image size, renormalized and colour-mapped, then blended over the denormalized
//! source image. A grid whose scores are all equal gives an all-zero map.
//!
//! This is an activation-magnitude approximation, not a gradient-weighted class
//! activation map: it shows where the backbone responded strongly, independent of
//! the predicted class. It is deterministic for a given set of token features.

pub mod colormap;

use cogniscan_common::{ImageTensor, InferenceError, TokenFeatures, IMAGE_SIZE};
use image::imageops::FilterType;
use image::{ImageBuffer, ImageFormat, Luma, RgbImage};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

/// Share of the source image in the overlay blend
pub const IMAGE_WEIGHT: f32 = 0.6;
/// Share of the colour-mapped heatmap in the overlay blend
pub const HEATMAP_WEIGHT: f32 = 0.4;

/// Configuration for overlay rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaliencyConfig {
    /// Side length of the importance map and overlay
    pub output_size: u32,
    /// Weight of the source image in the blend
    pub image_weight: f32,
    /// Weight of the colour-mapped heatmap in the blend
    pub heatmap_weight: f32,
}

impl Default for SaliencyConfig {
    fn default() -> Self {
        Self {
            output_size: IMAGE_SIZE,
            image_weight: IMAGE_WEIGHT,
            heatmap_weight: HEATMAP_WEIGHT,
        }
    }
}

/// Errors that can occur while building an overlay
#[derive(Error, Debug)]
pub enum SaliencyError {
    #[error("No spatial tokens to score")]
    EmptyTokens,

    #[error("Token count {0} is not a perfect square")]
    NotSquare(usize),

    #[error("Token features contain non-finite values")]
    NonFinite,

    #[error("Overlay encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

impl From<SaliencyError> for InferenceError {
    fn from(err: SaliencyError) -> Self {
        InferenceError::SaliencyGeneration(err.to_string())
    }
}

/// Importance map plus rendered overlay for one request
#[derive(Debug, Clone)]
pub struct SaliencyMap {
    /// `[output_size, output_size]`, values in `[0, 1]`
    pub importance: Array2<f32>,
    pub overlay: RgbImage,
}

impl SaliencyMap {
    /// Encode the overlay as PNG
    pub fn encode_png(&self) -> Result<Vec<u8>, SaliencyError> {
        let mut buffer = Cursor::new(Vec::new());
        self.overlay.write_to(&mut buffer, ImageFormat::Png)?;
        Ok(buffer.into_inner())
    }
}

/// Renders saliency overlays
#[derive(Debug, Clone, Default)]
pub struct SaliencyGenerator {
    config: SaliencyConfig,
}

impl SaliencyGenerator {
    #[must_use]
    pub fn new(config: SaliencyConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &SaliencyConfig {
        &self.config
    }

    /// Per-token L2 norm laid out on the square patch grid (row-major)
    pub fn token_scores(&self, tokens: &TokenFeatures) -> Result<Array2<f32>, SaliencyError> {
        let n = tokens.num_tokens();
        if n == 0 {
            return Err(SaliencyError::EmptyTokens);
        }
        let side = (n as f64).sqrt().round() as usize;
        if side * side != n {
            return Err(SaliencyError::NotSquare(n));
        }

        let scores: Vec<f32> = tokens
            .view()
            .rows()
            .into_iter()
            .map(|row| row.iter().map(|v| v * v).sum::<f32>().sqrt())
            .collect();
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(SaliencyError::NonFinite);
        }

        Array2::from_shape_vec((side, side), scores).map_err(|_| SaliencyError::NotSquare(n))
    }

    /// Token scores upsampled to `output_size` and normalized to `[0, 1]`
    pub fn importance_map(&self, tokens: &TokenFeatures) -> Result<Array2<f32>, SaliencyError> {
        let size = self.config.output_size as usize;
        let mut grid = self.token_scores(tokens)?;
        if !normalize_unit_interval(&mut grid) {
            return Ok(Array2::zeros((size, size)));
        }
        let mut map = upsample_bilinear(&grid, size, size);
        normalize_unit_interval(&mut map);
        Ok(map)
    }

    /// Colour-map an importance map with the jet ramp
    #[must_use]
    pub fn colorize(&self, importance: &Array2<f32>) -> RgbImage {
        let (h, w) = importance.dim();
        RgbImage::from_fn(w as u32, h as u32, |x, y| {
            colormap::jet(importance[[y as usize, x as usize]])
        })
    }

    /// Full overlay: importance map, jet heatmap, blended over the source scan
    pub fn generate(
        &self,
        tokens: &TokenFeatures,
        source: &ImageTensor,
    ) -> Result<SaliencyMap, SaliencyError> {
        let importance = self.importance_map(tokens)?;
        let heatmap = self.colorize(&importance);

        let size = self.config.output_size;
        let mut base = source.to_rgb_image();
        if base.dimensions() != (size, size) {
            base = image::imageops::resize(&base, size, size, FilterType::Triangle);
        }

        let overlay = colormap::blend(
            &base,
            &heatmap,
            self.config.image_weight,
            self.config.heatmap_weight,
        );
        debug!(
            "Saliency overlay rendered from {} tokens at {}x{}",
            tokens.num_tokens(),
            size,
            size
        );

        Ok(SaliencyMap {
            importance,
            overlay,
        })
    }
}

/// Bilinear (triangle filter) resize of a map with values in `[0, 1]`
///
/// Values outside `[0, 1]` are clamped by the resampler.
#[must_use]
pub fn upsample_bilinear(grid: &Array2<f32>, out_h: usize, out_w: usize) -> Array2<f32> {
    let (in_h, in_w) = grid.dim();
    let source: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(in_w as u32, in_h as u32, |x, y| {
            Luma([grid[[y as usize, x as usize]]])
        });
    let resized = image::imageops::resize(&source, out_w as u32, out_h as u32, FilterType::Triangle);
    Array2::from_shape_fn((out_h, out_w), |(y, x)| resized.get_pixel(x as u32, y as u32)[0])
}

/// Min-max normalize in place
///
/// Returns `false`, leaving the map all zeros, when every value is equal (or the
/// map is empty or non-finite).
pub fn normalize_unit_interval(map: &mut Array2<f32>) -> bool {
    let (min, max) = map
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = max - min;
    if max <= min || !range.is_finite() {
        map.fill(0.0);
        return false;
    }
    map.mapv_inplace(|v| ((v - min) / range).clamp(0.0, 1.0));
    true
}
