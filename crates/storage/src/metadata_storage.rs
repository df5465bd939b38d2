//! Prediction history and doctor directory
//!
//! Both have an in-memory implementation and a `PostgreSQL` one. Stores assign the
//! record id and timestamp; callers never supply them.

use crate::{DoctorProfile, NewPrediction, PredictionRecord, StorageError, StorageResult};
use chrono::Utc;
use cogniscan_common::{ClinicalRecord, DiagnosisLabel};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::RwLock;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

/// `PostgreSQL` configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    /// Database host
    pub host: String,

    /// Database port
    pub port: u16,

    /// Database name
    pub database: String,

    /// Database user
    pub user: String,

    /// Database password
    pub password: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("POSTGRES_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("POSTGRES_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5432),
            database: std::env::var("POSTGRES_DB").unwrap_or_else(|_| "cogniscan".to_string()),
            user: std::env::var("POSTGRES_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("POSTGRES_PASSWORD").unwrap_or_default(),
        }
    }
}

impl PostgresConfig {
    /// Build connection string
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.host, self.port, self.database, self.user, self.password
        )
    }
}

/// Specialization recommended for a predicted stage
#[must_use]
pub fn specialization_for(label: DiagnosisLabel) -> &'static str {
    match label {
        DiagnosisLabel::AlzheimersDisease | DiagnosisLabel::MildCognitiveImpairment => {
            "Neurologist"
        }
        DiagnosisLabel::CognitivelyNormal => "Brain Health Specialist",
    }
}

/// Prediction history
#[async_trait::async_trait]
pub trait PredictionStore: Send + Sync {
    /// Record a prediction, assigning its id and timestamp
    async fn store_prediction(&self, prediction: NewPrediction) -> StorageResult<PredictionRecord>;

    /// A subject's predictions, newest first
    async fn list_predictions(
        &self,
        subject_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<PredictionRecord>>;
}

/// Specialist lookup
#[async_trait::async_trait]
pub trait DoctorDirectory: Send + Sync {
    /// Highest rated doctors with the given specialization, best first
    async fn top_rated(
        &self,
        specialization: &str,
        limit: usize,
    ) -> StorageResult<Vec<DoctorProfile>>;

    /// Doctors to suggest after a prediction with `label`
    async fn recommend_for(
        &self,
        label: DiagnosisLabel,
        limit: usize,
    ) -> StorageResult<Vec<DoctorProfile>> {
        self.top_rated(specialization_for(label), limit).await
    }
}

/// Records kept by [`InMemoryPredictionStore::new`]
pub const DEFAULT_MAX_RECORDS: usize = 10_000;

/// Process-local prediction history, for local runs and tests
///
/// Holds at most `max_records`; the oldest records are dropped first. Deployments
/// that need the full history configure `PostgreSQL`.
#[derive(Debug)]
pub struct InMemoryPredictionStore {
    records: RwLock<VecDeque<PredictionRecord>>,
    max_records: usize,
}

impl Default for InMemoryPredictionStore {
    fn default() -> Self {
        Self::with_max_records(DEFAULT_MAX_RECORDS)
    }
}

impl InMemoryPredictionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `max_records` (at least one)
    #[must_use]
    pub fn with_max_records(max_records: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            max_records: max_records.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl PredictionStore for InMemoryPredictionStore {
    async fn store_prediction(&self, prediction: NewPrediction) -> StorageResult<PredictionRecord> {
        let record = PredictionRecord {
            record_id: Uuid::new_v4(),
            created_at: Utc::now(),
            prediction,
        };
        let mut records = self.records.write().await;
        while records.len() >= self.max_records {
            if let Some(dropped) = records.pop_front() {
                debug!("History full, dropping record {}", dropped.record_id);
            }
        }
        records.push_back(record.clone());
        Ok(record)
    }

    async fn list_predictions(
        &self,
        subject_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<PredictionRecord>> {
        // Insertion order is chronological
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.prediction.subject_id == subject_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Fixed doctor list
#[derive(Debug, Default)]
pub struct InMemoryDoctorDirectory {
    doctors: Vec<DoctorProfile>,
}

impl InMemoryDoctorDirectory {
    #[must_use]
    pub fn new(doctors: Vec<DoctorProfile>) -> Self {
        Self { doctors }
    }
}

#[async_trait::async_trait]
impl DoctorDirectory for InMemoryDoctorDirectory {
    async fn top_rated(
        &self,
        specialization: &str,
        limit: usize,
    ) -> StorageResult<Vec<DoctorProfile>> {
        let mut matches: Vec<DoctorProfile> = self
            .doctors
            .iter()
            .filter(|d| d.specialization == specialization)
            .cloned()
            .collect();
        matches.sort_by(|a, b| {
            b.rating
                .total_cmp(&a.rating)
                .then_with(|| a.name.cmp(&b.name))
        });
        matches.truncate(limit);
        Ok(matches)
    }
}

/// `PostgreSQL` prediction history and doctor directory
pub struct PostgresStorage {
    client: Client,
}

fn pg_err(e: tokio_postgres::Error) -> StorageError {
    StorageError::PostgresError(e.to_string())
}

fn row_to_prediction(row: &Row) -> StorageResult<PredictionRecord> {
    let label: String = row.get("label");
    let label = DiagnosisLabel::parse(&label)
        .ok_or_else(|| StorageError::SerializationError(format!("unknown label {label:?}")))?;
    let clinical: ClinicalRecord = serde_json::from_value(row.get("clinical"))
        .map_err(|e| StorageError::SerializationError(e.to_string()))?;

    Ok(PredictionRecord {
        record_id: row.get("record_id"),
        created_at: row.get("created_at"),
        prediction: NewPrediction {
            result_id: row.get("result_id"),
            subject_id: row.get("subject_id"),
            clinical,
            label,
            confidence: row.get("confidence"),
            probabilities: [row.get("p_cn"), row.get("p_mci"), row.get("p_ad")],
            overlay_ref: row.get("overlay_ref"),
        },
    })
}

impl PostgresStorage {
    /// Connect to `PostgreSQL`
    pub async fn new(config: PostgresConfig) -> StorageResult<Self> {
        let (client, connection) = tokio_postgres::connect(&config.connection_string(), NoTls)
            .await
            .map_err(pg_err)?;

        // Spawn connection in background
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("PostgreSQL connection error: {}", e);
            }
        });

        info!(
            "Connected to PostgreSQL at {}:{}/{}",
            config.host, config.port, config.database
        );
        Ok(Self { client })
    }

    /// Create tables if they do not exist
    pub async fn init_schema(&self) -> StorageResult<()> {
        self.client
            .batch_execute(
                r"
                CREATE TABLE IF NOT EXISTS predictions (
                    record_id UUID PRIMARY KEY,
                    result_id UUID NOT NULL,
                    subject_id TEXT NOT NULL,
                    clinical JSONB NOT NULL,
                    label TEXT NOT NULL,
                    confidence REAL NOT NULL,
                    p_cn REAL NOT NULL,
                    p_mci REAL NOT NULL,
                    p_ad REAL NOT NULL,
                    overlay_ref TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_predictions_subject
                    ON predictions(subject_id, created_at DESC);
                CREATE TABLE IF NOT EXISTS doctors (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    specialization TEXT NOT NULL,
                    rating REAL NOT NULL DEFAULT 0,
                    location TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_doctors_specialization
                    ON doctors(specialization, rating DESC);
                ",
            )
            .await
            .map_err(pg_err)?;

        info!("PostgreSQL schema initialized");
        Ok(())
    }

    /// Insert or replace a doctor profile
    pub async fn upsert_doctor(&self, doctor: &DoctorProfile) -> StorageResult<()> {
        self.client
            .execute(
                r"
                INSERT INTO doctors (id, name, specialization, rating, location)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (id) DO UPDATE SET
                    name = EXCLUDED.name,
                    specialization = EXCLUDED.specialization,
                    rating = EXCLUDED.rating,
                    location = EXCLUDED.location
                ",
                &[
                    &doctor.id,
                    &doctor.name,
                    &doctor.specialization,
                    &doctor.rating,
                    &doctor.location,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl PredictionStore for PostgresStorage {
    async fn store_prediction(&self, prediction: NewPrediction) -> StorageResult<PredictionRecord> {
        let record = PredictionRecord {
            record_id: Uuid::new_v4(),
            created_at: Utc::now(),
            prediction,
        };
        let p = &record.prediction;
        let clinical = serde_json::to_value(&p.clinical)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        self.client
            .execute(
                r"
                INSERT INTO predictions
                (record_id, result_id, subject_id, clinical, label, confidence,
                 p_cn, p_mci, p_ad, overlay_ref, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ",
                &[
                    &record.record_id,
                    &p.result_id,
                    &p.subject_id,
                    &clinical,
                    &p.label.as_str(),
                    &p.confidence,
                    &p.probabilities[0],
                    &p.probabilities[1],
                    &p.probabilities[2],
                    &p.overlay_ref,
                    &record.created_at,
                ],
            )
            .await
            .map_err(pg_err)?;

        debug!("Stored prediction {} for {}", record.record_id, p.subject_id);
        Ok(record)
    }

    async fn list_predictions(
        &self,
        subject_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<PredictionRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(
                r"
                SELECT record_id, result_id, subject_id, clinical, label, confidence,
                       p_cn, p_mci, p_ad, overlay_ref, created_at
                FROM predictions
                WHERE subject_id = $1
                ORDER BY created_at DESC
                LIMIT $2
                ",
                &[&subject_id, &limit],
            )
            .await
            .map_err(pg_err)?;

        rows.iter().map(row_to_prediction).collect()
    }
}

#[async_trait::async_trait]
impl DoctorDirectory for PostgresStorage {
    async fn top_rated(
        &self,
        specialization: &str,
        limit: usize,
    ) -> StorageResult<Vec<DoctorProfile>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(
                r"
                SELECT id, name, specialization, rating, location
                FROM doctors
                WHERE specialization = $1
                ORDER BY rating DESC, name ASC
                LIMIT $2
                ",
                &[&specialization, &limit],
            )
            .await
            .map_err(pg_err)?;

        Ok(rows
            .iter()
            .map(|row| DoctorProfile {
                id: row.get(0),
                name: row.get(1),
                specialization: row.get(2),
                rating: row.get(3),
                location: row.get(4),
            })
            .collect())
    }
}
