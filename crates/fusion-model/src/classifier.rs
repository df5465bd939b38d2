//! Shared fusion classifier
use crate::backbone::VisualBackbone;
use crate::head::FusionHead;
use crate::weights::WeightError;
use crate::ModelError;
use cogniscan_common::{
    ClinicalVector, FusionLogits, ImageTensor, TokenFeatures, CLINICAL_FEATURES, IMAGE_CHANNELS,
};
use ndarray::Array1;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::debug;

/// Everything one forward pass produces
#[derive(Debug, Clone)]
pub struct FusionOutput {
    pub logits: FusionLogits,
    /// Visual embedding that entered the fusion head
    pub embedding: Array1<f32>,
    /// Spatial tokens from the same pass, for saliency
    pub tokens: TokenFeatures,
}

/// Backbone + fusion head, shared by every request
///
/// The backbone sits behind a mutex so forward passes are serialized; the head is
/// immutable and runs outside the lock. Inputs are validated before the lock is
/// taken, so malformed requests never reach the model.
pub struct FusionClassifier {
    backbone: Mutex<Box<dyn VisualBackbone>>,
    head: FusionHead,
    backbone_name: String,
    input_size: usize,
    forward_calls: AtomicUsize,
}

impl FusionClassifier {
    pub fn new(backbone: Box<dyn VisualBackbone>, head: FusionHead) -> Result<Self, ModelError> {
        if backbone.embed_dim() != head.embed_dim() {
            return Err(ModelError::Weights(WeightError::Shape {
                name: "fusion head input".to_string(),
                expected: vec![backbone.embed_dim()],
                actual: vec![head.embed_dim()],
            }));
        }

        Ok(Self {
            backbone_name: backbone.name().to_string(),
            input_size: backbone.input_size(),
            backbone: Mutex::new(backbone),
            head,
            forward_calls: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn embed_dim(&self) -> usize {
        self.head.embed_dim()
    }

    #[must_use]
    pub fn backbone_name(&self) -> &str {
        &self.backbone_name
    }

    /// Number of forward passes that reached the backbone
    #[must_use]
    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    /// One forward pass returning logits and the token features it used
    ///
    /// # Errors
    /// `ShapeMismatch` if the image is not `[3, S, S]` or the clinical vector is not
    /// length 4; backbone failures otherwise.
    pub fn forward(
        &self,
        image: &ImageTensor,
        clinical: &ClinicalVector,
    ) -> Result<FusionOutput, ModelError> {
        let expected_image = [IMAGE_CHANNELS, self.input_size, self.input_size];
        if image.shape() != expected_image {
            return Err(ModelError::ShapeMismatch {
                what: "image tensor",
                expected: expected_image.to_vec(),
                actual: image.shape().to_vec(),
            });
        }
        if clinical.len() != CLINICAL_FEATURES {
            return Err(ModelError::ShapeMismatch {
                what: "clinical vector",
                expected: vec![CLINICAL_FEATURES],
                actual: vec![clinical.len()],
            });
        }

        let start = Instant::now();
        let visual = {
            // Backbones keep no per-call state, so a poisoned lock is reusable
            let mut backbone = self.backbone.lock().unwrap_or_else(PoisonError::into_inner);
            self.forward_calls.fetch_add(1, Ordering::SeqCst);
            backbone.forward(image.view())?
        };

        if visual.embedding.len() != self.head.embed_dim() {
            return Err(ModelError::InvalidOutput(format!(
                "backbone returned {} features, head expects {}",
                visual.embedding.len(),
                self.head.embed_dim()
            )));
        }

        let logits = self.head.forward(visual.embedding.view(), clinical.view());
        if !logits.is_finite() {
            return Err(ModelError::InvalidOutput(format!(
                "non-finite logits {:?}",
                logits.0
            )));
        }

        debug!(
            "Fusion forward in {:.1}ms, logits={:?}",
            start.elapsed().as_secs_f64() * 1000.0,
            logits.0
        );

        Ok(FusionOutput {
            logits,
            embedding: visual.embedding,
            tokens: visual.tokens,
        })
    }
}
