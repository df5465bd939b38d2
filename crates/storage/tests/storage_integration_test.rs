//! Integration tests for storage backends
//!
//! The local and in-memory tests always run. The `MinIO` and `PostgreSQL` tests need
//! live services (`docker-compose up -d minio postgres`) and are marked `#[ignore]`:
//!
//! `cargo test --package cogniscan-storage --test storage_integration_test -- --ignored --nocapture`

use cogniscan_common::{ClassificationResult, ClinicalRecord, DiagnosisLabel, Gender};
use cogniscan_storage::*;
use uuid::Uuid;

async fn is_minio_available() -> bool {
    tokio::net::TcpStream::connect("127.0.0.1:9000")
        .await
        .is_ok()
}

async fn is_postgres_available() -> bool {
    tokio::net::TcpStream::connect("127.0.0.1:5432")
        .await
        .is_ok()
}

fn sample_prediction(subject: &str) -> NewPrediction {
    let id = Uuid::new_v4();
    let result = ClassificationResult::from_probabilities(
        id,
        [0.15, 0.25, 0.6],
        Some(ClassificationResult::overlay_reference(&id)),
    );
    let clinical = ClinicalRecord {
        age: Some(74),
        gender: Some(Gender::Female),
        mmse: Some(21.0),
        cdr: Some(1.0),
    };
    NewPrediction::from_result(subject, &clinical, &result)
}

fn sample_doctors() -> Vec<DoctorProfile> {
    vec![
        DoctorProfile {
            id: "neuro-1".to_string(),
            name: "Dr. Okafor".to_string(),
            specialization: "Neurologist".to_string(),
            rating: 4.8,
            location: Some("Lagos".to_string()),
        },
        DoctorProfile {
            id: "neuro-2".to_string(),
            name: "Dr. Lee".to_string(),
            specialization: "Neurologist".to_string(),
            rating: 4.2,
            location: None,
        },
        DoctorProfile {
            id: "bhs-1".to_string(),
            name: "Dr. Silva".to_string(),
            specialization: "Brain Health Specialist".to_string(),
            rating: 4.9,
            location: None,
        },
    ]
}

#[tokio::test]
async fn test_local_backends_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let backends = StorageBackends::local(dir.path().join("grad_cam"), sample_doctors()).unwrap();

    let prediction = sample_prediction("subject-7");
    let reference = prediction.overlay_ref.clone().unwrap();
    backends
        .artifacts
        .store_artifact(&reference, b"\x89PNG fake")
        .await
        .unwrap();
    assert!(dir.path().join("grad_cam").join(&reference).exists());

    let record = backends
        .predictions
        .store_prediction(prediction.clone())
        .await
        .unwrap();
    assert_eq!(record.prediction, prediction);

    let history = backends
        .predictions
        .list_predictions("subject-7", 20)
        .await
        .unwrap();
    assert_eq!(history, vec![record]);

    let doctors = backends
        .doctors
        .recommend_for(DiagnosisLabel::AlzheimersDisease, 5)
        .await
        .unwrap();
    assert_eq!(doctors.len(), 2);
    assert_eq!(doctors[0].id, "neuro-1");
}

#[tokio::test]
async fn test_connect_without_services_uses_local_stores() {
    let dir = tempfile::tempdir().unwrap();
    let config = StorageConfig {
        results_dir: dir.path().to_path_buf(),
        doctors: sample_doctors(),
        ..Default::default()
    };
    let backends = StorageBackends::connect(&config).await.unwrap();

    backends.artifacts.store_artifact("saliency_x.png", b"x").await.unwrap();
    assert_eq!(
        backends.artifacts.retrieve_artifact("saliency_x.png").await.unwrap(),
        b"x"
    );
    let normal = backends
        .doctors
        .recommend_for(DiagnosisLabel::CognitivelyNormal, 5)
        .await
        .unwrap();
    assert_eq!(normal.len(), 1);
}

#[tokio::test]
async fn test_concurrent_artifact_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(LocalArtifactStore::new(dir.path()).unwrap());

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                let reference = format!("saliency_{i}.png");
                store.store_artifact(&reference, &[i as u8; 64]).await.unwrap();
                reference
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let reference = handle.await.unwrap();
        assert_eq!(store.retrieve_artifact(&reference).await.unwrap(), vec![i as u8; 64]);
    }
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 16);
}

#[tokio::test]
#[ignore] // Requires MinIO running on localhost:9000
async fn test_minio_store_and_retrieve() {
    if !is_minio_available().await {
        eprintln!("MinIO not available on 127.0.0.1:9000");
        eprintln!("Start with: docker-compose up -d minio");
        return;
    }

    let config = S3Config {
        bucket: "cogniscan-results".to_string(),
        region: "us-east-1".to_string(),
        endpoint: Some("http://localhost:9000".to_string()),
        access_key_id: "minioadmin".to_string(),
        secret_access_key: "minioadmin".to_string(),
        prefix: "test/".to_string(),
    };
    let store = S3ArtifactStore::new(config)
        .await
        .expect("Failed to create S3 client");

    let reference = format!("saliency_{}.png", Uuid::new_v4().simple());
    store
        .store_artifact(&reference, b"overlay bytes")
        .await
        .expect("Failed to store overlay");
    assert!(store.artifact_exists(&reference).await.unwrap());
    assert_eq!(store.retrieve_artifact(&reference).await.unwrap(), b"overlay bytes");

    store.delete_artifact(&reference).await.unwrap();
    assert!(!store.artifact_exists(&reference).await.unwrap());
    assert!(matches!(
        store.retrieve_artifact(&reference).await,
        Err(StorageError::NotFound(_))
    ));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL running on localhost:5432
async fn test_postgres_history_and_doctors() {
    if !is_postgres_available().await {
        eprintln!("PostgreSQL not available on 127.0.0.1:5432");
        eprintln!("Start with: docker-compose up -d postgres");
        return;
    }

    let storage = PostgresStorage::new(PostgresConfig::default())
        .await
        .expect("Failed to connect to PostgreSQL");
    storage.init_schema().await.expect("Failed to init schema");

    let subject = format!("it-{}", Uuid::new_v4());
    let first = storage.store_prediction(sample_prediction(&subject)).await.unwrap();
    let second = storage.store_prediction(sample_prediction(&subject)).await.unwrap();

    let history = storage.list_predictions(&subject, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].record_id, second.record_id);
    assert_eq!(history[1].record_id, first.record_id);
    assert_eq!(history[0].prediction.clinical.gender, Some(Gender::Female));
    assert_eq!(history[0].prediction.label, DiagnosisLabel::AlzheimersDisease);

    for doctor in sample_doctors() {
        storage.upsert_doctor(&doctor).await.unwrap();
    }
    let top = storage.top_rated("Neurologist", 1).await.unwrap();
    assert_eq!(top.len(), 1);
    assert!(top[0].rating >= 4.8);
}
