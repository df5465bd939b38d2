//! Service configuration
//!
//! Loaded from the YAML file named by `COGNISCAN_CONFIG` (defaults otherwise), then
//! overridden by individual environment variables.

use cogniscan_common::IMAGE_SIZE;
use cogniscan_preprocessing::PreprocessConfig;
use cogniscan_saliency::{SaliencyConfig, HEATMAP_WEIGHT, IMAGE_WEIGHT};
use cogniscan_storage::StorageConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// ViT-B/16 embedding width
pub const DEFAULT_EMBED_DIM: usize = 768;

pub const DEFAULT_BACKBONE_MODEL: &str = "models/vit_b16_features.onnx";
pub const DEFAULT_HEAD_WEIGHTS: &str = "models/fusion_head.safetensors";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which visual backbone to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackboneConfig {
    /// Exported ViT feature extractor
    Onnx {
        model_path: PathBuf,
        /// Output holding the token features; first output when absent
        #[serde(default)]
        output_name: Option<String>,
    },
    /// Patch-embedding stage only, from a safetensors checkpoint
    LinearPatch { weights: PathBuf },
    /// Random weights from a seed, for tests and benchmarks
    ///
    /// Predictions from this backbone carry no diagnostic meaning.
    SeededForTests {
        #[serde(default)]
        seed: u64,
    },
}

impl BackboneConfig {
    #[must_use]
    pub fn is_seeded(&self) -> bool {
        matches!(self, Self::SeededForTests { .. })
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self::Onnx {
            model_path: PathBuf::from(DEFAULT_BACKBONE_MODEL),
            output_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backbone: BackboneConfig,
    /// Fusion head checkpoint (safetensors)
    ///
    /// Required unless the backbone is `seeded_for_tests`, which then seeds the
    /// head from the same seed.
    pub head_weights: Option<PathBuf>,
    pub embed_dim: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backbone: BackboneConfig::default(),
            head_weights: Some(PathBuf::from(DEFAULT_HEAD_WEIGHTS)),
            embed_dim: DEFAULT_EMBED_DIM,
        }
    }
}

impl ModelConfig {
    /// Seeded backbone and head of width `embed_dim`
    #[must_use]
    pub fn seeded_for_tests(embed_dim: usize, seed: u64) -> Self {
        Self {
            backbone: BackboneConfig::SeededForTests { seed },
            head_weights: None,
            embed_dim,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Caller-side limit on one request, 0 disables it
    pub request_timeout_secs: u64,
    /// Doctors suggested with each prediction
    pub top_n_doctors: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            top_n_doctors: 3,
        }
    }
}

impl InferenceConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5000".to_string(),
        }
    }
}

/// Everything the service needs to start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub preprocessing: PreprocessConfig,
    pub saliency: SaliencyConfig,
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
}

impl ServiceConfig {
    /// `COGNISCAN_CONFIG` file (or defaults) plus environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("COGNISCAN_CONFIG") {
            Ok(path) => Self::from_yaml(path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&contents)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `COGNISCAN_BACKBONE_MODEL`, `COGNISCAN_HEAD_WEIGHTS`, `COGNISCAN_RESULTS_DIR`
    /// and `API_SERVER_ADDR` from `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model_path) = lookup("COGNISCAN_BACKBONE_MODEL") {
            let output_name = match &self.model.backbone {
                BackboneConfig::Onnx { output_name, .. } => output_name.clone(),
                BackboneConfig::LinearPatch { .. } | BackboneConfig::SeededForTests { .. } => None,
            };
            self.model.backbone = BackboneConfig::Onnx {
                model_path: PathBuf::from(model_path),
                output_name,
            };
        }
        if let Some(head) = lookup("COGNISCAN_HEAD_WEIGHTS") {
            self.model.head_weights = Some(PathBuf::from(head));
        }
        if let Some(dir) = lookup("COGNISCAN_RESULTS_DIR") {
            self.storage.results_dir = PathBuf::from(dir);
        }
        if let Some(addr) = lookup("API_SERVER_ADDR") {
            self.server.addr = addr;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.embed_dim == 0 {
            return Err(ConfigError::Invalid("model.embed_dim must be positive".into()));
        }
        // The backbone and the trained head only accept 224x224 inputs
        if self.preprocessing.input_size != IMAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "preprocessing.input_size must be {IMAGE_SIZE}, got {}",
                self.preprocessing.input_size
            )));
        }
        if self.saliency.output_size != IMAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "saliency.output_size must be {IMAGE_SIZE}, got {}",
                self.saliency.output_size
            )));
        }
        if self.saliency.image_weight != IMAGE_WEIGHT
            || self.saliency.heatmap_weight != HEATMAP_WEIGHT
        {
            return Err(ConfigError::Invalid(format!(
                "saliency blend must be {IMAGE_WEIGHT}/{HEATMAP_WEIGHT}, got {}/{}",
                self.saliency.image_weight, self.saliency.heatmap_weight
            )));
        }
        Ok(())
    }
}
