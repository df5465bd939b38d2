//! Request pipeline: preprocess, encode, forward, softmax, best-effort saliency
use crate::context::ModelContext;
use cogniscan_common::{ClassificationResult, ClinicalRecord, InferenceError, NUM_CLASSES};
use cogniscan_preprocessing::{ClinicalFeatureEncoder, ImagePreprocessor};
use cogniscan_saliency::SaliencyGenerator;
use cogniscan_storage::ArtifactStore;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Output of the blocking part of a request
struct ForwardOutcome {
    probabilities: [f32; NUM_CLASSES],
    overlay_png: Option<Vec<u8>>,
}

/// Runs one classification per call against a shared model
///
/// Every request owns its buffers. Only the model load and the forward pass block,
/// and they run on tokio's blocking pool. When the caller-side timeout expires the
/// request returns `Timeout`; the blocking work still runs to completion, so the
/// backbone lock is always released normally. Nothing is stored for a request that
/// timed out.
pub struct InferenceOrchestrator {
    model: Arc<ModelContext>,
    preprocessor: ImagePreprocessor,
    encoder: ClinicalFeatureEncoder,
    saliency: SaliencyGenerator,
    artifacts: Arc<dyn ArtifactStore>,
    request_timeout: Option<Duration>,
}

impl InferenceOrchestrator {
    pub fn new(
        model: Arc<ModelContext>,
        preprocessor: ImagePreprocessor,
        saliency: SaliencyGenerator,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            model,
            preprocessor,
            encoder: ClinicalFeatureEncoder,
            saliency,
            artifacts,
            request_timeout: None,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn model(&self) -> &Arc<ModelContext> {
        &self.model
    }

    #[must_use]
    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Classify one scan
    ///
    /// # Errors
    /// `Decode` for unreadable payloads (the model is never invoked), `ModelUnavailable`
    /// if the classifier cannot be loaded, `Timeout` when the request limit expires.
    /// Saliency and overlay storage failures are not errors; the result then carries
    /// no overlay reference.
    pub async fn run(
        &self,
        image_bytes: Vec<u8>,
        clinical: &ClinicalRecord,
    ) -> Result<ClassificationResult, InferenceError> {
        let id = Uuid::new_v4();
        let start = Instant::now();
        let deadline = self.request_timeout.map(|limit| start + limit);

        let work = self.forward(id, image_bytes, clinical.clone());
        let outcome = match self.request_timeout {
            Some(limit) => tokio::time::timeout(limit, work).await.map_err(|_| {
                warn!("Request {} timed out after {:?}", id, limit);
                InferenceError::Timeout(limit.as_secs())
            })?,
            None => work.await,
        }?;

        let overlay_ref = match outcome.overlay_png {
            Some(png) => self.store_overlay(id, png, deadline).await,
            None => None,
        };
        let result =
            ClassificationResult::from_probabilities(id, outcome.probabilities, overlay_ref);

        info!(
            "Request {}: {} ({:.4}) in {:.1}ms, overlay={}",
            id,
            result.label(),
            result.confidence(),
            start.elapsed().as_secs_f64() * 1000.0,
            result.has_overlay()
        );
        Ok(result)
    }

    async fn forward(
        &self,
        id: Uuid,
        image_bytes: Vec<u8>,
        clinical: ClinicalRecord,
    ) -> Result<ForwardOutcome, InferenceError> {
        let model = self.model.clone();
        let preprocessor = self.preprocessor.clone();
        let encoder = self.encoder;
        let saliency = self.saliency.clone();

        tokio::task::spawn_blocking(move || -> Result<ForwardOutcome, InferenceError> {
            let image = preprocessor.preprocess(&image_bytes)?;
            drop(image_bytes);
            let features = encoder.encode(&clinical);
            debug!("Request {}: clinical features {:?}", id, features.as_slice());

            let classifier = model.get()?;
            let output = classifier.forward(&image, &features)?;
            let probabilities = output.logits.softmax();

            let overlay_png = match saliency
                .generate(&output.tokens, &image)
                .and_then(|map| map.encode_png())
            {
                Ok(png) => Some(png),
                Err(e) => {
                    warn!("Request {}: saliency unavailable: {}", id, e);
                    None
                }
            };

            Ok(ForwardOutcome {
                probabilities,
                overlay_png,
            })
        })
        .await
        .map_err(|e| InferenceError::Internal(format!("inference task failed: {e}")))?
    }

    /// Store the overlay within what is left of the request budget
    ///
    /// The write runs as its own task. If the budget runs out first, the request
    /// goes on without an overlay and the write is deleted once it lands.
    async fn store_overlay(
        &self,
        id: Uuid,
        png: Vec<u8>,
        deadline: Option<Instant>,
    ) -> Option<String> {
        let reference = ClassificationResult::overlay_reference(&id);
        let artifacts = self.artifacts.clone();
        let key = reference.clone();
        let mut write =
            tokio::spawn(async move { artifacts.store_artifact(&key, &png).await });

        let joined = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, &mut write).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!("Request {}: overlay store exceeded the request limit", id);
                        self.discard_late_overlay(id, write);
                        return None;
                    }
                }
            }
            None => write.await,
        };

        match joined {
            Ok(Ok(stored)) => Some(stored),
            Ok(Err(e)) => {
                warn!("Request {}: failed to store overlay {}: {}", id, reference, e);
                None
            }
            Err(e) => {
                warn!("Request {}: overlay store task failed: {}", id, e);
                None
            }
        }
    }

    fn discard_late_overlay(
        &self,
        id: Uuid,
        write: tokio::task::JoinHandle<cogniscan_storage::StorageResult<String>>,
    ) {
        let artifacts = self.artifacts.clone();
        tokio::spawn(async move {
            if let Ok(Ok(stored)) = write.await {
                match artifacts.delete_artifact(&stored).await {
                    Ok(()) => debug!("Request {}: removed late overlay {}", id, stored),
                    Err(e) => warn!("Request {}: could not remove late overlay {}: {}", id, stored, e),
                }
            }
        });
    }
}
