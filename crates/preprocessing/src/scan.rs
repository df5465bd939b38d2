//! Scan image decoding, resizing and normalization
use cogniscan_common::{ImageTensor, InferenceError, IMAGE_CHANNELS, IMAGE_SIZE};
use image::RgbImage;
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Default upload ceiling (20 MiB)
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Configuration for scan preprocessing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Square side length fed to the backbone
    pub input_size: u32,
    /// Largest accepted payload in bytes
    pub max_image_bytes: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            input_size: IMAGE_SIZE,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
        }
    }
}

/// Errors that can occur while preparing a scan
#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Empty image payload")]
    EmptyPayload,

    #[error("Image payload is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Image decoding error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Decoded image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
}

impl From<PreprocessError> for InferenceError {
    fn from(err: PreprocessError) -> Self {
        InferenceError::Decode(err.to_string())
    }
}

/// Turns raw upload bytes into a normalized `[3, S, S]` tensor
///
/// Pure function of its input: identical bytes always give a bit-identical tensor.
#[derive(Debug, Clone, Default)]
pub struct ImagePreprocessor {
    config: PreprocessConfig,
}

impl ImagePreprocessor {
    #[must_use]
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Decode any supported raster format and coerce it to 8-bit RGB
    ///
    /// Grayscale, alpha and 16-bit inputs are converted. Anything that is not a
    /// recognizable image fails with [`PreprocessError::Decode`].
    pub fn decode(&self, bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
        if bytes.is_empty() {
            return Err(PreprocessError::EmptyPayload);
        }
        if bytes.len() > self.config.max_image_bytes {
            return Err(PreprocessError::PayloadTooLarge {
                size: bytes.len(),
                max: self.config.max_image_bytes,
            });
        }

        let decoded = image::load_from_memory(bytes)?;
        let (width, height) = (decoded.width(), decoded.height());
        if width == 0 || height == 0 {
            return Err(PreprocessError::EmptyImage { width, height });
        }

        debug!("Decoded {}x{} image ({:?})", width, height, decoded.color());
        Ok(decoded.to_rgb8())
    }

    /// Resize to `input_size` x `input_size` with a bilinear (triangle) filter
    #[must_use]
    pub fn resize(&self, image: &RgbImage) -> RgbImage {
        let size = self.config.input_size;
        if image.dimensions() == (size, size) {
            image.clone()
        } else {
            image::imageops::resize(image, size, size, image::imageops::FilterType::Triangle)
        }
    }

    /// Map every channel to `(p / 255 - 0.5) / 0.5`, channel-first
    pub fn normalize(&self, image: &RgbImage) -> Result<ImageTensor, InferenceError> {
        let (width, height) = image.dimensions();
        let mut array = Array3::<f32>::zeros((IMAGE_CHANNELS, height as usize, width as usize));

        for (x, y, pixel) in image.enumerate_pixels() {
            for c in 0..IMAGE_CHANNELS {
                let v = f32::from(pixel[c]) / 255.0;
                array[[c, y as usize, x as usize]] = (v - 0.5) / 0.5;
            }
        }

        ImageTensor::new(array)
    }

    /// Decode, resize and normalize in one step
    pub fn preprocess(&self, bytes: &[u8]) -> Result<ImageTensor, InferenceError> {
        let decoded = self.decode(bytes)?;
        let resized = self.resize(&decoded);
        self.normalize(&resized)
    }
}
