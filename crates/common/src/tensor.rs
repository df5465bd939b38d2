//! Typed tensors passed between pipeline stages
use crate::{InferenceError, Result, CLINICAL_FEATURES, IMAGE_CHANNELS, NUM_CLASSES};
use image::{Rgb, RgbImage};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3};

/// Normalized image tensor, channel-first `[3, H, W]`, values in [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor(Array3<f32>);

impl ImageTensor {
    /// Wrap a channel-first array. Fails unless it has exactly 3 channels.
    pub fn new(data: Array3<f32>) -> Result<Self> {
        let shape = data.shape();
        if shape[0] != IMAGE_CHANNELS || shape[1] == 0 || shape[2] == 0 {
            return Err(InferenceError::ShapeMismatch {
                what: "image tensor",
                expected: vec![IMAGE_CHANNELS, shape[1].max(1), shape[2].max(1)],
                actual: shape.to_vec(),
            });
        }
        Ok(Self(data))
    }

    #[must_use]
    pub fn view(&self) -> ArrayView3<'_, f32> {
        self.0.view()
    }

    #[must_use]
    pub fn shape(&self) -> [usize; 3] {
        let s = self.0.shape();
        [s[0], s[1], s[2]]
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.0.shape()[1]
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.0.shape()[2]
    }

    /// Undo the `(x - 0.5) / 0.5` normalization back to an 8-bit RGB image
    #[must_use]
    pub fn to_rgb_image(&self) -> RgbImage {
        let (h, w) = (self.height(), self.width());
        RgbImage::from_fn(w as u32, h as u32, |x, y| {
            let (x, y) = (x as usize, y as usize);
            let px = |c: usize| {
                let v = (self.0[[c, y, x]] * 0.5 + 0.5) * 255.0;
                v.round().clamp(0.0, 255.0) as u8
            };
            Rgb([px(0), px(1), px(2)])
        })
    }

    #[must_use]
    pub fn into_inner(self) -> Array3<f32> {
        self.0
    }
}

/// Encoded clinical covariates `[age, gender, mmse, cdr]`
#[derive(Debug, Clone, PartialEq)]
pub struct ClinicalVector(Array1<f32>);

impl ClinicalVector {
    #[must_use]
    pub fn new(values: [f32; CLINICAL_FEATURES]) -> Self {
        Self(Array1::from_vec(values.to_vec()))
    }

    /// Wrap an arbitrary vector, rejecting the wrong length
    pub fn from_array(data: Array1<f32>) -> Result<Self> {
        if data.len() != CLINICAL_FEATURES {
            return Err(InferenceError::ShapeMismatch {
                what: "clinical vector",
                expected: vec![CLINICAL_FEATURES],
                actual: vec![data.len()],
            });
        }
        Ok(Self(data))
    }

    #[must_use]
    pub fn view(&self) -> ArrayView1<'_, f32> {
        self.0.view()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        self.0.as_slice().unwrap_or(&[])
    }
}

/// Spatial token features from the visual backbone, `[N, D]`
///
/// The class token is excluded. `N` is expected to be a perfect square.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenFeatures(Array2<f32>);

impl TokenFeatures {
    #[must_use]
    pub fn new(data: Array2<f32>) -> Self {
        Self(data)
    }

    #[must_use]
    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.0.view()
    }

    #[must_use]
    pub fn num_tokens(&self) -> usize {
        self.0.nrows()
    }

    #[must_use]
    pub fn dim(&self) -> usize {
        self.0.ncols()
    }
}

/// Unnormalized class scores in label order (CN, MCI, AD)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionLogits(pub [f32; NUM_CLASSES]);

impl FusionLogits {
    /// Numerically stable softmax (max-subtracted)
    #[must_use]
    pub fn softmax(&self) -> [f32; NUM_CLASSES] {
        let max = self.0.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut out = [0.0f32; NUM_CLASSES];
        let mut sum = 0.0f32;
        for (o, &l) in out.iter_mut().zip(self.0.iter()) {
            *o = (l - max).exp();
            sum += *o;
        }
        for o in &mut out {
            *o /= sum;
        }
        out
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.0.iter().all(|v| v.is_finite())
    }
}
