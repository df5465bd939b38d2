//! End-to-end pipeline tests against a seeded patch backbone
//!
//! No model download is needed: the classifier is built from seeded weights, and
//! overlays go to a temporary directory.

use cogniscan_common::{ClinicalRecord, DiagnosisLabel, ErrorKind, Gender};
use cogniscan_common::TokenFeatures;
use cogniscan_fusion_model::{
    BackboneOutput, FusionClassifier, FusionHead, LinearPatchBackbone, ModelError,
    VisualBackbone, WeightError,
};
use cogniscan_orchestrator::{
    InferenceOrchestrator, ModelContext, PersistenceStatus, PredictionRequest, PredictionService,
    ServiceConfig,
};
use cogniscan_preprocessing::ImagePreprocessor;
use cogniscan_saliency::SaliencyGenerator;
use cogniscan_storage::{
    ArtifactStore, DoctorProfile, InMemoryDoctorDirectory, LocalArtifactStore, NewPrediction,
    PredictionRecord, PredictionStore, StorageBackends, StorageError, StorageResult,
};
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array1, Array2, ArrayView3};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DIM: usize = 32;

fn png(image: &RgbImage) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

fn white_scan() -> Vec<u8> {
    png(&RgbImage::from_pixel(256, 256, Rgb([255, 255, 255])))
}

fn patterned_scan(seed: u32) -> Vec<u8> {
    png(&RgbImage::from_fn(96, 96, |x, y| {
        let v = ((x * 7 + y * 13 + seed * 31) % 256) as u8;
        Rgb([v, v.wrapping_add(seed as u8), 255 - v])
    }))
}

fn seeded_classifier() -> FusionClassifier {
    FusionClassifier::new(
        Box::new(LinearPatchBackbone::seeded(DIM, 7)),
        FusionHead::seeded(DIM, 7),
    )
    .unwrap()
}

fn orchestrator_with(
    model: Arc<ModelContext>,
    artifacts: Arc<dyn ArtifactStore>,
) -> InferenceOrchestrator {
    InferenceOrchestrator::new(
        model,
        ImagePreprocessor::default(),
        SaliencyGenerator::default(),
        artifacts,
    )
}

fn sample_clinical() -> ClinicalRecord {
    ClinicalRecord {
        age: Some(70),
        gender: Some(Gender::Female),
        mmse: Some(22.0),
        cdr: Some(0.5),
    }
}

struct FailingArtifactStore;

#[async_trait::async_trait]
impl ArtifactStore for FailingArtifactStore {
    async fn store_artifact(&self, _reference: &str, _data: &[u8]) -> StorageResult<String> {
        Err(StorageError::Other("disk full".to_string()))
    }

    async fn retrieve_artifact(&self, reference: &str) -> StorageResult<Vec<u8>> {
        Err(StorageError::NotFound(reference.to_string()))
    }

    async fn delete_artifact(&self, _reference: &str) -> StorageResult<()> {
        Ok(())
    }

    async fn artifact_exists(&self, _reference: &str) -> StorageResult<bool> {
        Ok(false)
    }
}

/// Holds artifacts in memory, each write taking `delay`
struct SlowArtifactStore {
    delay: Duration,
    writes: AtomicUsize,
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
}

impl SlowArtifactStore {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            writes: AtomicUsize::new(0),
            artifacts: Mutex::new(HashMap::new()),
        }
    }

    fn stored(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl ArtifactStore for SlowArtifactStore {
    async fn store_artifact(&self, reference: &str, data: &[u8]) -> StorageResult<String> {
        tokio::time::sleep(self.delay).await;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.artifacts
            .lock()
            .unwrap()
            .insert(reference.to_string(), data.to_vec());
        Ok(reference.to_string())
    }

    async fn retrieve_artifact(&self, reference: &str) -> StorageResult<Vec<u8>> {
        self.artifacts
            .lock()
            .unwrap()
            .get(reference)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(reference.to_string()))
    }

    async fn delete_artifact(&self, reference: &str) -> StorageResult<()> {
        self.artifacts.lock().unwrap().remove(reference);
        Ok(())
    }

    async fn artifact_exists(&self, reference: &str) -> StorageResult<bool> {
        Ok(self.artifacts.lock().unwrap().contains_key(reference))
    }
}

/// Emits a class token plus 195 spatial tokens, which no square grid fits
struct RaggedTokenBackbone;

impl VisualBackbone for RaggedTokenBackbone {
    fn name(&self) -> &str {
        "ragged-tokens"
    }

    fn embed_dim(&self) -> usize {
        DIM
    }

    fn forward(&mut self, image: ArrayView3<'_, f32>) -> Result<BackboneOutput, ModelError> {
        let mean = image.mean().unwrap_or(0.0);
        Ok(BackboneOutput {
            embedding: Array1::from_shape_fn(DIM, |j| mean + j as f32 * 0.01),
            tokens: TokenFeatures::new(Array2::from_shape_fn((195, DIM), |(i, j)| {
                ((i * 7 + j) % 11) as f32 * 0.1
            })),
        })
    }
}

struct FailingPredictionStore;

#[async_trait::async_trait]
impl PredictionStore for FailingPredictionStore {
    async fn store_prediction(&self, _prediction: NewPrediction) -> StorageResult<PredictionRecord> {
        Err(StorageError::PostgresError("connection refused".to_string()))
    }

    async fn list_predictions(
        &self,
        _subject_id: &str,
        _limit: usize,
    ) -> StorageResult<Vec<PredictionRecord>> {
        Err(StorageError::PostgresError("connection refused".to_string()))
    }
}

#[tokio::test]
async fn test_white_scan_produces_label_and_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalArtifactStore::new(dir.path()).unwrap());
    let orchestrator = orchestrator_with(
        Arc::new(ModelContext::preloaded(Arc::new(seeded_classifier()))),
        store.clone(),
    );

    let result = orchestrator
        .run(white_scan(), &sample_clinical())
        .await
        .unwrap();

    assert!(DiagnosisLabel::ALL.contains(&result.label()));
    let probs = result.probabilities();
    assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    let max = probs.iter().copied().fold(f32::MIN, f32::max);
    assert_eq!(result.confidence(), max);
    assert_eq!(result.label().index(), probs.iter().position(|p| *p == max).unwrap());

    let reference = result.saliency_overlay_ref().expect("overlay stored");
    assert_eq!(
        reference,
        cogniscan_common::ClassificationResult::overlay_reference(&result.id())
    );
    let overlay = image::load_from_memory(&store.retrieve_artifact(reference).await.unwrap())
        .unwrap()
        .to_rgb8();
    assert_eq!(overlay.dimensions(), (224, 224));
}

#[tokio::test]
async fn test_corrupt_payload_never_reaches_model() {
    let dir = tempfile::tempdir().unwrap();
    let classifier = Arc::new(seeded_classifier());
    let orchestrator = orchestrator_with(
        Arc::new(ModelContext::preloaded(classifier.clone())),
        Arc::new(LocalArtifactStore::new(dir.path()).unwrap()),
    );

    for payload in [b"not an image at all".to_vec(), Vec::new(), white_scan()[..40].to_vec()] {
        let err = orchestrator
            .run(payload, &ClinicalRecord::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeError);
        assert!(err.is_client_fault());
    }
    assert_eq!(classifier.forward_calls(), 0);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_match_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let classifier = Arc::new(seeded_classifier());
    let orchestrator = Arc::new(orchestrator_with(
        Arc::new(ModelContext::preloaded(classifier.clone())),
        Arc::new(LocalArtifactStore::new(dir.path()).unwrap()),
    ));

    let inputs: Vec<(Vec<u8>, ClinicalRecord)> = (0..50u32)
        .map(|i| {
            let clinical = ClinicalRecord {
                age: Some(55 + i),
                gender: Some(if i % 2 == 0 { Gender::Female } else { Gender::Male }),
                mmse: Some(30.0 - (i % 20) as f32),
                cdr: Some((i % 3) as f32 * 0.5),
            };
            (patterned_scan(i), clinical)
        })
        .collect();

    let handles: Vec<_> = inputs
        .iter()
        .cloned()
        .map(|(image, clinical)| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run(image, &clinical).await })
        })
        .collect();

    let mut concurrent = Vec::with_capacity(handles.len());
    for handle in handles {
        concurrent.push(handle.await.unwrap().unwrap());
    }

    for ((image, clinical), parallel) in inputs.into_iter().zip(&concurrent) {
        let sequential = orchestrator.run(image, &clinical).await.unwrap();
        assert_eq!(sequential.label(), parallel.label());
        assert_eq!(sequential.probabilities(), parallel.probabilities());
        assert_ne!(sequential.id(), parallel.id());
    }
    assert_eq!(classifier.forward_calls(), 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_requests_load_once() {
    let dir = tempfile::tempdir().unwrap();
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();
    let model = Arc::new(ModelContext::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(100));
        Ok(seeded_classifier())
    }));
    let orchestrator = Arc::new(orchestrator_with(
        model.clone(),
        Arc::new(LocalArtifactStore::new(dir.path()).unwrap()),
    ));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run(white_scan(), &sample_clinical()).await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert_eq!(model.load_count(), 1);
}

#[tokio::test]
async fn test_unavailable_model_until_reload() {
    let dir = tempfile::tempdir().unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let model = Arc::new(ModelContext::new(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(ModelError::Weights(WeightError::Missing(
                "patch_embed.proj.weight".to_string(),
            )))
        } else {
            Ok(seeded_classifier())
        }
    }));
    let orchestrator = orchestrator_with(
        model.clone(),
        Arc::new(LocalArtifactStore::new(dir.path()).unwrap()),
    );

    // Decoding fails before the model is touched
    let err = orchestrator
        .run(b"garbage".to_vec(), &ClinicalRecord::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DecodeError);
    assert_eq!(model.load_count(), 0);

    for _ in 0..2 {
        let err = orchestrator
            .run(white_scan(), &ClinicalRecord::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ModelUnavailable);
    }
    assert_eq!(model.load_count(), 1);

    model.reload();
    assert!(orchestrator
        .run(white_scan(), &ClinicalRecord::default())
        .await
        .is_ok());
    assert_eq!(model.load_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_leaves_model_usable() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(dir.path()).unwrap());
    let model = Arc::new(ModelContext::new(|| {
        std::thread::sleep(Duration::from_millis(400));
        Ok(seeded_classifier())
    }));

    let hasty = orchestrator_with(model.clone(), store.clone())
        .with_timeout(Some(Duration::from_millis(20)));
    let err = hasty
        .run(white_scan(), &sample_clinical())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // The abandoned load completes and later requests share it
    let patient = orchestrator_with(model.clone(), store);
    let result = patient.run(white_scan(), &sample_clinical()).await.unwrap();
    assert!(result.has_overlay());
    assert_eq!(model.load_count(), 1);
}

#[tokio::test]
async fn test_overlay_store_failure_is_not_fatal() {
    let orchestrator = orchestrator_with(
        Arc::new(ModelContext::preloaded(Arc::new(seeded_classifier()))),
        Arc::new(FailingArtifactStore),
    );
    let result = orchestrator
        .run(white_scan(), &sample_clinical())
        .await
        .unwrap();
    assert!(!result.has_overlay());
    assert!((result.probabilities().iter().sum::<f32>() - 1.0).abs() < 1e-5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_request_stores_nothing() {
    let store = Arc::new(SlowArtifactStore::new(Duration::from_millis(50)));
    let model = Arc::new(ModelContext::new(|| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(seeded_classifier())
    }));
    let orchestrator = orchestrator_with(model.clone(), store.clone())
        .with_timeout(Some(Duration::from_millis(20)));

    let err = orchestrator
        .run(white_scan(), &sample_clinical())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    // Let the abandoned forward pass finish
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert!(model.is_loaded());
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    assert_eq!(store.stored(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlay_write_past_deadline_is_removed() {
    let store = Arc::new(SlowArtifactStore::new(Duration::from_secs(2)));
    let orchestrator = orchestrator_with(
        Arc::new(ModelContext::preloaded(Arc::new(seeded_classifier()))),
        store.clone(),
    )
    .with_timeout(Some(Duration::from_millis(1500)));

    // Either the forward pass or the write runs out of time; neither leaves an overlay
    match orchestrator.run(white_scan(), &sample_clinical()).await {
        Ok(result) => assert!(!result.has_overlay()),
        Err(err) => assert_eq!(err.kind(), ErrorKind::Timeout),
    }

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(store.stored(), 0);
}

#[tokio::test]
async fn test_slow_store_within_limit_keeps_overlay() {
    let store = Arc::new(SlowArtifactStore::new(Duration::from_millis(50)));
    let orchestrator = orchestrator_with(
        Arc::new(ModelContext::preloaded(Arc::new(seeded_classifier()))),
        store.clone(),
    )
    .with_timeout(Some(Duration::from_secs(30)));

    let result = orchestrator
        .run(white_scan(), &sample_clinical())
        .await
        .unwrap();
    let reference = result.saliency_overlay_ref().unwrap();
    assert!(store.artifact_exists(reference).await.unwrap());
    assert_eq!(store.stored(), 1);
}

#[tokio::test]
async fn test_ragged_token_grid_skips_overlay() {
    let classifier = Arc::new(
        FusionClassifier::new(Box::new(RaggedTokenBackbone), FusionHead::seeded(DIM, 3)).unwrap(),
    );
    let store = Arc::new(SlowArtifactStore::new(Duration::ZERO));
    let orchestrator = orchestrator_with(
        Arc::new(ModelContext::preloaded(classifier.clone())),
        store.clone(),
    );

    let result = orchestrator
        .run(patterned_scan(5), &sample_clinical())
        .await
        .unwrap();

    assert!(DiagnosisLabel::ALL.contains(&result.label()));
    let probs = result.probabilities();
    assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
    assert!(probs.iter().all(|p| *p > 0.0 && *p < 1.0));
    assert_eq!(result.saliency_overlay_ref(), None);
    assert_eq!(classifier.forward_calls(), 1);
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    assert_eq!(store.stored(), 0);
}

fn doctors() -> Vec<DoctorProfile> {
    ["Neurologist", "Neurologist", "Brain Health Specialist"]
        .iter()
        .enumerate()
        .map(|(i, specialization)| DoctorProfile {
            id: format!("doc-{i}"),
            name: format!("Dr. {i}"),
            specialization: (*specialization).to_string(),
            rating: 4.0 + i as f32 * 0.3,
            location: None,
        })
        .collect()
}

#[tokio::test]
async fn test_service_records_and_recommends() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServiceConfig::default();
    let backends = StorageBackends::local(dir.path(), doctors()).unwrap();
    let service = PredictionService::from_parts(
        &config,
        Arc::new(ModelContext::preloaded(Arc::new(seeded_classifier()))),
        backends,
    );
    assert!(service.model_loaded());

    let first = service
        .predict(PredictionRequest::new(white_scan(), sample_clinical()).for_subject("p-1"))
        .await
        .unwrap();
    let second = service
        .predict(
            PredictionRequest::new(patterned_scan(3), ClinicalRecord::default()).for_subject("p-1"),
        )
        .await
        .unwrap();
    assert!(first.persistence.is_stored());

    let expected = cogniscan_storage::specialization_for(first.result.label());
    assert!(!first.suggested_doctors.is_empty());
    assert!(first.suggested_doctors.iter().all(|d| d.specialization == expected));

    let history = service.history("p-1", 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].prediction.result_id, second.result.id());
    assert_eq!(history[1].prediction.clinical, sample_clinical());

    let reference = first.result.saliency_overlay_ref().unwrap();
    assert!(!service.overlay(reference).await.unwrap().is_empty());
    assert!(matches!(
        service.overlay("../../etc/passwd").await,
        Err(StorageError::InvalidReference(_))
    ));
}

#[tokio::test]
async fn test_persistence_failure_keeps_result() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Arc::new(orchestrator_with(
        Arc::new(ModelContext::preloaded(Arc::new(seeded_classifier()))),
        Arc::new(LocalArtifactStore::new(dir.path()).unwrap()),
    ));
    let service = PredictionService::new(
        orchestrator.clone(),
        Arc::new(FailingPredictionStore),
        Arc::new(InMemoryDoctorDirectory::new(doctors())),
        2,
    );

    let report = service
        .predict(PredictionRequest::new(white_scan(), sample_clinical()))
        .await
        .unwrap();
    assert_eq!(
        report.persistence,
        PersistenceStatus::Failed {
            kind: ErrorKind::DownstreamPersistence,
            message: "The prediction was computed but could not be recorded.",
        }
    );

    let again = orchestrator.run(white_scan(), &sample_clinical()).await.unwrap();
    assert_eq!(report.result.probabilities(), again.probabilities());
    assert!(report.result.has_overlay());

    let err = service.history("anyone", 5).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DownstreamPersistence);
}
