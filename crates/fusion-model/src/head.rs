//! Clinical MLP and fused classifier head
use crate::layers::{relu, BatchNorm1d, Linear};
use crate::weights::{WeightError, WeightMap};
use cogniscan_common::{FusionLogits, CLINICAL_FEATURES, NUM_CLASSES};
use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use tracing::{debug, info};

/// Width of the first clinical MLP stage
pub const CLINICAL_HIDDEN: usize = 16;

/// Width of the clinical embedding
pub const CLINICAL_EMBED: usize = 32;

const CLASSIFIER_HIDDEN: usize = 256;
const CLASSIFIER_BOTTLENECK: usize = 64;

/// `Linear(4,16) → ReLU → BN(16) → Linear(16,32) → ReLU → BN(32)`
#[derive(Debug, Clone)]
pub struct ClinicalMlp {
    fc1: Linear,
    bn1: BatchNorm1d,
    fc2: Linear,
    bn2: BatchNorm1d,
}

impl ClinicalMlp {
    fn load(weights: &mut WeightMap) -> Result<Self, WeightError> {
        Ok(Self {
            fc1: Linear::load(weights, "clinical_mlp.0", CLINICAL_FEATURES, CLINICAL_HIDDEN)?,
            bn1: BatchNorm1d::load(weights, "clinical_mlp.2", CLINICAL_HIDDEN)?,
            fc2: Linear::load(weights, "clinical_mlp.3", CLINICAL_HIDDEN, CLINICAL_EMBED)?,
            bn2: BatchNorm1d::load(weights, "clinical_mlp.5", CLINICAL_EMBED)?,
        })
    }

    fn random(rng: &mut StdRng) -> Self {
        Self {
            fc1: Linear::random(CLINICAL_FEATURES, CLINICAL_HIDDEN, rng),
            bn1: BatchNorm1d::identity(CLINICAL_HIDDEN),
            fc2: Linear::random(CLINICAL_HIDDEN, CLINICAL_EMBED, rng),
            bn2: BatchNorm1d::identity(CLINICAL_EMBED),
        }
    }

    fn store(&self, weights: &mut WeightMap) {
        self.fc1.store(weights, "clinical_mlp.0");
        self.bn1.store(weights, "clinical_mlp.2");
        self.fc2.store(weights, "clinical_mlp.3");
        self.bn2.store(weights, "clinical_mlp.5");
    }

    #[must_use]
    pub fn forward(&self, x: ArrayView1<'_, f32>) -> Array1<f32> {
        let h = self.bn1.forward(relu(self.fc1.forward(x)).view());
        self.bn2.forward(relu(self.fc2.forward(h.view())).view())
    }
}

/// `Dropout → Linear(D+32,256) → ReLU → Dropout → Linear(256,64) → ReLU → Linear(64,3)`
///
/// Dropout is the identity at inference time, so only the linear stages are held.
#[derive(Debug, Clone)]
pub struct ClassifierHead {
    fc1: Linear,
    fc2: Linear,
    out: Linear,
}

impl ClassifierHead {
    fn load(weights: &mut WeightMap, fused_dim: usize) -> Result<Self, WeightError> {
        Ok(Self {
            fc1: Linear::load(weights, "classifier.1", fused_dim, CLASSIFIER_HIDDEN)?,
            fc2: Linear::load(weights, "classifier.4", CLASSIFIER_HIDDEN, CLASSIFIER_BOTTLENECK)?,
            out: Linear::load(weights, "classifier.6", CLASSIFIER_BOTTLENECK, NUM_CLASSES)?,
        })
    }

    fn random(fused_dim: usize, rng: &mut StdRng) -> Self {
        Self {
            fc1: Linear::random(fused_dim, CLASSIFIER_HIDDEN, rng),
            fc2: Linear::random(CLASSIFIER_HIDDEN, CLASSIFIER_BOTTLENECK, rng),
            out: Linear::random(CLASSIFIER_BOTTLENECK, NUM_CLASSES, rng),
        }
    }

    fn store(&self, weights: &mut WeightMap) {
        self.fc1.store(weights, "classifier.1");
        self.fc2.store(weights, "classifier.4");
        self.out.store(weights, "classifier.6");
    }

    #[must_use]
    pub fn forward(&self, fused: ArrayView1<'_, f32>) -> FusionLogits {
        let h = relu(self.fc1.forward(fused));
        let h = relu(self.fc2.forward(h.view()));
        let out = self.out.forward(h.view());
        let mut logits = [0.0f32; NUM_CLASSES];
        for (l, v) in logits.iter_mut().zip(out.iter()) {
            *l = *v;
        }
        FusionLogits(logits)
    }
}

/// Trainable part of the fusion model: clinical MLP plus classifier head
#[derive(Debug, Clone)]
pub struct FusionHead {
    embed_dim: usize,
    clinical: ClinicalMlp,
    classifier: ClassifierHead,
}

impl FusionHead {
    /// Load a head checkpoint for a backbone with embedding width `embed_dim`
    pub fn from_safetensors<P: AsRef<Path>>(path: P, embed_dim: usize) -> Result<Self, WeightError> {
        let path = path.as_ref();
        info!("Loading fusion head weights from {}", path.display());
        let mut weights = WeightMap::from_file(path)?;
        Self::from_weights(&mut weights, embed_dim)
    }

    /// Build from a weight map, consuming the `clinical_mlp.*` and `classifier.*` keys
    pub fn from_weights(weights: &mut WeightMap, embed_dim: usize) -> Result<Self, WeightError> {
        let head = Self {
            embed_dim,
            clinical: ClinicalMlp::load(weights)?,
            classifier: ClassifierHead::load(weights, embed_dim + CLINICAL_EMBED)?,
        };
        let leftover: Vec<&str> = weights
            .names()
            .filter(|n| n.starts_with("clinical_mlp.") || n.starts_with("classifier."))
            .collect();
        if !leftover.is_empty() {
            debug!("Ignoring unexpected head tensors: {:?}", leftover);
        }
        Ok(head)
    }

    /// Deterministic randomly initialised head with identity BatchNorm statistics
    #[must_use]
    pub fn seeded(embed_dim: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        Self {
            embed_dim,
            clinical: ClinicalMlp::random(&mut rng),
            classifier: ClassifierHead::random(embed_dim + CLINICAL_EMBED, &mut rng),
        }
    }

    /// Export using the same key layout [`FusionHead::from_weights`] reads
    #[must_use]
    pub fn to_weights(&self) -> WeightMap {
        let mut weights = WeightMap::new();
        self.clinical.store(&mut weights);
        self.classifier.store(&mut weights);
        weights
    }

    #[must_use]
    pub fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    /// Concatenate `[visual, clinical_mlp(clinical)]` and classify
    ///
    /// Callers validate lengths; see `FusionClassifier::forward`.
    #[must_use]
    pub fn forward(&self, visual: ArrayView1<'_, f32>, clinical: ArrayView1<'_, f32>) -> FusionLogits {
        let clinical_embedding = self.clinical.forward(clinical);
        let fused: Array1<f32> = visual
            .iter()
            .chain(clinical_embedding.iter())
            .copied()
            .collect();
        self.classifier.forward(fused.view())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_head_is_deterministic() {
        let a = FusionHead::seeded(16, 42);
        let b = FusionHead::seeded(16, 42);
        let visual = Array1::from_shape_fn(16, |i| i as f32 / 16.0);
        let clinical = Array1::from_vec(vec![70.0, 1.0, 22.0, 0.5]);
        assert_eq!(
            a.forward(visual.view(), clinical.view()),
            b.forward(visual.view(), clinical.view())
        );
    }

    #[test]
    fn test_checkpoint_key_layout() {
        let names: Vec<String> = FusionHead::seeded(8, 1)
            .to_weights()
            .names()
            .map(str::to_string)
            .collect();
        for key in [
            "clinical_mlp.0.weight",
            "clinical_mlp.2.running_var",
            "clinical_mlp.3.bias",
            "clinical_mlp.5.running_mean",
            "classifier.1.weight",
            "classifier.4.bias",
            "classifier.6.weight",
        ] {
            assert!(names.iter().any(|n| n == key), "missing {key}");
        }
    }

    #[test]
    fn test_reload_from_exported_weights() {
        let head = FusionHead::seeded(8, 5);
        let mut weights = head.to_weights();
        let reloaded = FusionHead::from_weights(&mut weights, 8).unwrap();
        assert!(weights.is_empty());

        let visual = Array1::from_elem(8, 0.25f32);
        let clinical = Array1::from_vec(vec![65.0, 0.0, 28.0, 0.0]);
        assert_eq!(
            head.forward(visual.view(), clinical.view()),
            reloaded.forward(visual.view(), clinical.view())
        );
    }

    #[test]
    fn test_wrong_embed_dim_is_rejected() {
        let mut weights = FusionHead::seeded(8, 5).to_weights();
        assert!(matches!(
            FusionHead::from_weights(&mut weights, 16),
            Err(WeightError::Shape { .. })
        ));
    }

    #[test]
    fn test_missing_tensor_is_reported() {
        let mut weights = FusionHead::seeded(8, 5).to_weights();
        weights.remove("classifier.6.bias");
        assert!(matches!(
            FusionHead::from_weights(&mut weights, 8),
            Err(WeightError::Missing(name)) if name == "classifier.6.bias"
        ));
    }
}
