//! Visual backbone abstraction
use crate::ModelError;
use cogniscan_common::TokenFeatures;
use ndarray::{s, Array1, ArrayView2, ArrayView3};

/// Result of one backbone forward pass
#[derive(Debug, Clone)]
pub struct BackboneOutput {
    /// Global image embedding (class token), length D
    pub embedding: Array1<f32>,
    /// Spatial tokens `[N, D]`, class token excluded
    pub tokens: TokenFeatures,
}

impl BackboneOutput {
    /// Split ViT-style features `[1 + N, D]` into class token and spatial tokens
    pub fn from_vit_features(features: ArrayView2<'_, f32>) -> Result<Self, ModelError> {
        if features.nrows() < 2 || features.ncols() == 0 {
            return Err(ModelError::InvalidOutput(format!(
                "expected [1 + N, D] token features, got {:?}",
                features.shape()
            )));
        }
        Ok(Self {
            embedding: features.row(0).to_owned(),
            tokens: TokenFeatures::new(features.slice(s![1.., ..]).to_owned()),
        })
    }
}

/// Frozen image feature extractor
///
/// `forward` takes `&mut self` because ONNX sessions need exclusive access to run;
/// the classifier serializes calls behind a mutex.
pub trait VisualBackbone: Send {
    /// Short identifier for logs and health output
    fn name(&self) -> &str;

    /// Embedding width D
    fn embed_dim(&self) -> usize;

    /// Expected square input side length
    fn input_size(&self) -> usize {
        cogniscan_common::IMAGE_SIZE as usize
    }

    /// Run on a single normalized `[3, H, W]` image
    fn forward(&mut self, image: ArrayView3<'_, f32>) -> Result<BackboneOutput, ModelError>;
}
