//! Artifact storage for saliency overlays
//!
//! Artifacts are addressed by a flat reference string (`saliency_<id>.png`). The local
//! store writes through a temporary file in the target directory and renames it into
//! place, so readers never observe a partially written overlay.

use crate::{validate_reference, StorageError, StorageResult};
use aws_sdk_s3::{
    config::{Credentials, Region},
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
    primitives::ByteStream,
    Client,
};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// S3/MinIO configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,

    /// AWS region (e.g., "us-west-2") or "us-east-1" for `MinIO`
    pub region: String,

    /// S3 endpoint (custom for `MinIO`, empty for AWS S3)
    pub endpoint: Option<String>,

    /// AWS access key ID
    pub access_key_id: String,

    /// AWS secret access key
    pub secret_access_key: String,

    /// Key prefix for all overlays (e.g., "grad_cam/")
    pub prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: "cogniscan-results".to_string(),
            region: "us-west-2".to_string(),
            endpoint: None,
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            prefix: String::new(),
        }
    }
}

/// Artifact storage trait
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store bytes under `reference`, returning the reference
    async fn store_artifact(&self, reference: &str, data: &[u8]) -> StorageResult<String>;

    /// Retrieve the bytes stored under `reference`
    async fn retrieve_artifact(&self, reference: &str) -> StorageResult<Vec<u8>>;

    /// Delete an artifact; deleting a missing artifact succeeds
    async fn delete_artifact(&self, reference: &str) -> StorageResult<()>;

    async fn artifact_exists(&self, reference: &str) -> StorageResult<bool>;
}

/// Artifacts as files in one directory
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Use `root`, creating it if needed
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, reference: &str) -> StorageResult<PathBuf> {
        validate_reference(reference)?;
        Ok(self.root.join(reference))
    }
}

fn not_found(reference: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == ErrorKind::NotFound {
            StorageError::NotFound(reference.to_string())
        } else {
            StorageError::IoError(e)
        }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn store_artifact(&self, reference: &str, data: &[u8]) -> StorageResult<String> {
        let target = self.path_for(reference)?;
        let root = self.root.clone();
        let data = data.to_vec();

        // The temp file is removed on drop unless it was persisted
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            tmp.write_all(&data)?;
            tmp.persist(&target).map_err(|e| StorageError::IoError(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Other(format!("artifact write task failed: {e}")))??;

        debug!("Stored artifact {} in {}", reference, self.root.display());
        Ok(reference.to_string())
    }

    async fn retrieve_artifact(&self, reference: &str) -> StorageResult<Vec<u8>> {
        let path = self.path_for(reference)?;
        tokio::fs::read(&path).await.map_err(not_found(reference))
    }

    async fn delete_artifact(&self, reference: &str) -> StorageResult<()> {
        let path = self.path_for(reference)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::IoError(e)),
        }
    }

    async fn artifact_exists(&self, reference: &str) -> StorageResult<bool> {
        let path = self.path_for(reference)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

/// S3/MinIO artifact storage
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ArtifactStore {
    /// Create a new S3 client; no request is made until the first operation
    pub async fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::InvalidConfig("S3 bucket is empty".to_string()));
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "cogniscan-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .behavior_version_latest();

        // MinIO needs path-style addressing
        if let Some(endpoint) = config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    fn full_key(&self, reference: &str) -> StorageResult<String> {
        validate_reference(reference)?;
        Ok(format!("{}{}", self.prefix, reference))
    }
}

fn content_type(reference: &str) -> &'static str {
    match Path::new(reference).extension().and_then(|e| e.to_str()) {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

#[async_trait::async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn store_artifact(&self, reference: &str, data: &[u8]) -> StorageResult<String> {
        let full_key = self.full_key(reference)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type(reference))
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        debug!("Stored artifact s3://{}/{}", self.bucket, full_key);
        Ok(reference.to_string())
    }

    async fn retrieve_artifact(&self, reference: &str) -> StorageResult<Vec<u8>> {
        let full_key = self.full_key(reference)?;

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(GetObjectError::is_no_such_key) {
                    StorageError::NotFound(reference.to_string())
                } else {
                    StorageError::S3Error(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(bytes.to_vec())
    }

    async fn delete_artifact(&self, reference: &str) -> StorageResult<()> {
        let full_key = self.full_key(reference)?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        Ok(())
    }

    async fn artifact_exists(&self, reference: &str) -> StorageResult<bool> {
        let full_key = self.full_key(reference)?;

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(HeadObjectError::is_not_found) => Ok(false),
            Err(e) => Err(StorageError::S3Error(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_store(prefix: &str) -> S3ArtifactStore {
        S3ArtifactStore {
            client: Client::from_conf(
                aws_sdk_s3::Config::builder()
                    .behavior_version_latest()
                    .build(),
            ),
            bucket: "cogniscan-results".to_string(),
            prefix: prefix.to_string(),
        }
    }

    #[test]
    fn test_s3_config_default() {
        let config = S3Config::default();
        assert_eq!(config.bucket, "cogniscan-results");
        assert_eq!(config.region, "us-west-2");
        assert_eq!(config.endpoint, None);
    }

    #[test]
    fn test_full_key() {
        assert_eq!(
            s3_store("grad_cam/").full_key("saliency_ab.png").unwrap(),
            "grad_cam/saliency_ab.png"
        );
        assert_eq!(s3_store("").full_key("saliency_ab.png").unwrap(), "saliency_ab.png");
        assert!(s3_store("grad_cam/").full_key("../etc/passwd").is_err());
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type("saliency_ab.png"), "image/png");
        assert_eq!(content_type("scan.JPG"), "application/octet-stream");
        assert_eq!(content_type("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_local_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path().join("grad_cam")).unwrap();

        let reference = store.store_artifact("saliency_1.png", b"overlay").await.unwrap();
        assert_eq!(reference, "saliency_1.png");
        assert!(store.artifact_exists("saliency_1.png").await.unwrap());
        assert_eq!(store.retrieve_artifact("saliency_1.png").await.unwrap(), b"overlay");

        // Only the final file remains; the temp file was renamed into place
        let entries: Vec<_> = std::fs::read_dir(store.root()).unwrap().collect();
        assert_eq!(entries.len(), 1);

        store.delete_artifact("saliency_1.png").await.unwrap();
        assert!(!store.artifact_exists("saliency_1.png").await.unwrap());
        store.delete_artifact("saliency_1.png").await.unwrap();
    }

    #[tokio::test]
    async fn test_local_store_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path()).unwrap();
        store.store_artifact("a.png", b"first").await.unwrap();
        store.store_artifact("a.png", b"second").await.unwrap();
        assert_eq!(store.retrieve_artifact("a.png").await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_local_store_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalArtifactStore::new(dir.path()).unwrap();

        assert!(matches!(
            store.retrieve_artifact("missing.png").await,
            Err(StorageError::NotFound(r)) if r == "missing.png"
        ));
        assert!(matches!(
            store.store_artifact("../escape.png", b"x").await,
            Err(StorageError::InvalidReference(_))
        ));
        assert!(!dir.path().parent().unwrap().join("escape.png").exists());
    }
}
