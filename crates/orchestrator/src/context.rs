//! Owned model context with a once-only load
use crate::config::{BackboneConfig, ModelConfig};
use cogniscan_common::InferenceError;
use cogniscan_fusion_model::{
    FusionClassifier, FusionHead, LinearPatchBackbone, ModelError, OnnxVitBackbone,
    VisualBackbone,
};
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::{error, info, warn};

type Loader = dyn Fn() -> Result<FusionClassifier, ModelError> + Send + Sync;
type LoadSlot = Arc<OnceCell<Result<Arc<FusionClassifier>, String>>>;

/// Holds the shared classifier and loads it on first use
///
/// Concurrent first callers wait on the same load. A failed load is remembered and
/// every later call reports `ModelUnavailable` until [`reload`](Self::reload).
pub struct ModelContext {
    loader: Box<Loader>,
    slot: RwLock<LoadSlot>,
    load_count: AtomicUsize,
}

impl ModelContext {
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn() -> Result<FusionClassifier, ModelError> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            slot: RwLock::new(Arc::new(OnceCell::new())),
            load_count: AtomicUsize::new(0),
        }
    }

    /// Context around an already-built classifier
    #[must_use]
    pub fn preloaded(classifier: Arc<FusionClassifier>) -> Self {
        let slot = OnceCell::new();
        let _ = slot.set(Ok(classifier));
        Self {
            // Never called: reload keeps a loaded classifier
            loader: Box::new(|| {
                Err(ModelError::InvalidOutput(
                    "preloaded context has no loader".to_string(),
                ))
            }),
            slot: RwLock::new(Arc::new(slot)),
            load_count: AtomicUsize::new(0),
        }
    }

    /// Context that builds the classifier described by `config`
    #[must_use]
    pub fn from_config(config: ModelConfig) -> Self {
        Self::new(move || load_classifier(&config))
    }

    /// The shared classifier, loading it if this is the first call
    ///
    /// Blocks while a load is in progress.
    pub fn get(&self) -> Result<Arc<FusionClassifier>, InferenceError> {
        let slot = self.current_slot();
        let loaded = slot.get_or_init(|| {
            self.load_count.fetch_add(1, Ordering::SeqCst);
            let start = Instant::now();
            match (self.loader)() {
                Ok(classifier) => {
                    info!(
                        "Fusion classifier ({} backbone, D={}) loaded in {:.2}s",
                        classifier.backbone_name(),
                        classifier.embed_dim(),
                        start.elapsed().as_secs_f64()
                    );
                    Ok(Arc::new(classifier))
                }
                Err(e) => {
                    error!("Failed to load fusion classifier: {}", e);
                    Err(e.to_string())
                }
            }
        });

        match loaded {
            Ok(classifier) => Ok(classifier.clone()),
            Err(reason) => Err(InferenceError::ModelUnavailable(reason.clone())),
        }
    }

    /// Whether a classifier is loaded and usable
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        matches!(self.current_slot().get(), Some(Ok(_)))
    }

    /// Number of load attempts so far
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    /// Forget a failed load so the next call retries it
    ///
    /// A successfully loaded classifier is kept; requests already holding it are
    /// unaffected either way.
    pub fn reload(&self) {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if matches!(slot.get(), Some(Ok(_))) {
            return;
        }
        warn!("Resetting model context for reload");
        *slot = Arc::new(OnceCell::new());
    }

    fn current_slot(&self) -> LoadSlot {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Build backbone and head from configuration
///
/// Only `seeded_for_tests` runs without checkpoints; any other backbone needs a
/// head checkpoint as well.
pub fn load_classifier(config: &ModelConfig) -> Result<FusionClassifier, ModelError> {
    let dim = config.embed_dim;
    let (backbone, seed): (Box<dyn VisualBackbone>, Option<u64>) = match &config.backbone {
        BackboneConfig::Onnx {
            model_path,
            output_name,
        } => (
            Box::new(OnnxVitBackbone::new(model_path, output_name.clone(), dim)?),
            None,
        ),
        BackboneConfig::LinearPatch { weights } => (
            Box::new(LinearPatchBackbone::from_safetensors(weights, dim)?),
            None,
        ),
        BackboneConfig::SeededForTests { seed } => {
            warn!("Seeded test backbone in use: predictions are not diagnostic");
            (Box::new(LinearPatchBackbone::seeded(dim, *seed)), Some(*seed))
        }
    };

    let head = match (&config.head_weights, seed) {
        (Some(path), _) => FusionHead::from_safetensors(path, dim)?,
        (None, Some(seed)) => FusionHead::seeded(dim, seed),
        (None, None) => return Err(ModelError::NoCheckpoint("fusion head")),
    };

    FusionClassifier::new(backbone, head)
}
