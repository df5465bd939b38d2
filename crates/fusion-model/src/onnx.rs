//! ONNX Runtime ViT backbone
//!
//! Expects a feature extractor exported with a single image input `[1, 3, 224, 224]`
//! and an output of shape `[1, 1 + N, D]` (timm `forward_features`): token 0 is the
//! class token, tokens `1..` are the spatial patch tokens.

use crate::backbone::{BackboneOutput, VisualBackbone};
use crate::ModelError;
use ndarray::{ArrayView2, ArrayView3, Axis};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionOutputs};
use ort::value::TensorRef;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Error type for ONNX session creation
#[derive(Debug, thiserror::Error)]
pub enum OnnxError {
    #[error("Failed to create session builder: {0}")]
    SessionBuilderError(String),

    #[error("Failed to load ONNX model from {path}: {error}")]
    ModelLoadError { path: String, error: String },

    #[error("Model file not found: {0}")]
    ModelNotFound(String),
}

/// Thread count for ONNX intra-op parallelism (`COGNISCAN_THREADS`, else physical cores)
fn session_threads() -> usize {
    std::env::var("COGNISCAN_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(num_cpus::get_physical)
}

/// CoreML compiled-model cache (`COGNISCAN_COREML_CACHE_DIR`, else `$HOME/.cache/cogniscan/coreml`)
fn coreml_cache_dir() -> String {
    let dir = std::env::var("COGNISCAN_COREML_CACHE_DIR").unwrap_or_else(|_| {
        match std::env::var("HOME") {
            Ok(home) => format!("{home}/.cache/cogniscan/coreml"),
            Err(_) => {
                let tmp = std::env::var("TMPDIR").unwrap_or_else(|_| "/tmp".to_string());
                format!("{tmp}/cogniscan-coreml")
            }
        }
    });
    if let Err(e) = std::fs::create_dir_all(&dir) {
        warn!("Failed to create CoreML cache directory {}: {}", dir, e);
    }
    dir
}

fn build_session(model_path: &Path, with_coreml: bool) -> Result<Session, OnnxError> {
    let mut providers = Vec::with_capacity(3);
    if with_coreml {
        providers.push(
            CoreMLExecutionProvider::default()
                .with_subgraphs(true)
                .with_model_cache_dir(coreml_cache_dir())
                .build(),
        );
    }
    providers.push(CUDAExecutionProvider::default().build());
    providers.push(CPUExecutionProvider::default().build());

    Session::builder()
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_intra_threads(session_threads())
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_memory_pattern(true)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .with_execution_providers(providers)
        .map_err(|e| OnnxError::SessionBuilderError(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| OnnxError::ModelLoadError {
            path: model_path.display().to_string(),
            error: e.to_string(),
        })
}

/// Create an optimized session (CoreML, then CUDA, then CPU)
///
/// If CoreML cannot compile the graph the session is rebuilt with CUDA/CPU only.
pub fn create_optimized_session(model_path: &Path) -> Result<Session, OnnxError> {
    if !model_path.exists() {
        return Err(OnnxError::ModelNotFound(model_path.display().to_string()));
    }

    let start = Instant::now();
    let session = match build_session(model_path, true) {
        Ok(session) => session,
        Err(e) if e.to_string().contains("CoreML") || e.to_string().contains("MLModel") => {
            warn!(
                "CoreML failed for {}, retrying with CUDA/CPU: {}",
                model_path.display(),
                e
            );
            build_session(model_path, false)?
        }
        Err(e) => return Err(e),
    };

    debug!(
        "Session created for {} in {:.3}s",
        model_path.display(),
        start.elapsed().as_secs_f64()
    );
    Ok(session)
}

/// ViT feature extractor running in ONNX Runtime
pub struct OnnxVitBackbone {
    session: Session,
    output_name: Option<String>,
    embed_dim: usize,
}

impl OnnxVitBackbone {
    /// Load a backbone model
    ///
    /// # Arguments
    /// * `model_path` - Path to the exported ONNX feature extractor
    /// * `output_name` - Output holding `[1, 1 + N, D]` features (first output if `None`)
    /// * `embed_dim` - Expected D (768 for ViT-B/16)
    ///
    /// # Errors
    /// Returns error if the model file is missing or cannot be loaded
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        output_name: Option<String>,
        embed_dim: usize,
    ) -> Result<Self, ModelError> {
        let model_path = model_path.as_ref();
        info!("Loading ViT backbone from {}", model_path.display());
        let session = create_optimized_session(model_path)?;
        Ok(Self {
            session,
            output_name,
            embed_dim,
        })
    }
}

/// Pull `[1, 1 + N, D]` features out of the session outputs
fn extract_features(
    outputs: &SessionOutputs,
    output_name: Option<&str>,
    embed_dim: usize,
) -> Result<BackboneOutput, ModelError> {
    let value = match output_name {
        Some(name) => outputs.get(name).ok_or_else(|| {
            ModelError::InvalidOutput(format!("model has no output named {name}"))
        })?,
        None => &outputs[0],
    };

    let (shape, data) = value.try_extract_tensor::<f32>()?;
    let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

    // Accept [1, T, D] or [T, D]
    let (tokens, dim) = match dims.as_slice() {
        [1, t, d] | [t, d] => (*t, *d),
        _ => {
            return Err(ModelError::InvalidOutput(format!(
                "expected [1, 1 + N, D] features, got {dims:?}"
            )))
        }
    };
    if dim != embed_dim {
        return Err(ModelError::InvalidOutput(format!(
            "embedding width {dim} does not match configured {embed_dim}"
        )));
    }

    let features = ArrayView2::from_shape((tokens, dim), data)
        .map_err(|e| ModelError::InvalidOutput(e.to_string()))?;
    BackboneOutput::from_vit_features(features)
}

impl VisualBackbone for OnnxVitBackbone {
    fn name(&self) -> &str {
        "onnx-vit"
    }

    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn forward(&mut self, image: ArrayView3<'_, f32>) -> Result<BackboneOutput, ModelError> {
        let batch = image.insert_axis(Axis(0)).as_standard_layout().into_owned();
        let input_tensor = TensorRef::from_array_view(batch.view())?;

        let start = Instant::now();
        let outputs = self.session.run(ort::inputs![input_tensor])?;
        debug!(
            "Backbone forward in {:.1}ms",
            start.elapsed().as_secs_f64() * 1000.0
        );

        extract_features(&outputs, self.output_name.as_deref(), self.embed_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_not_found() {
        let result = create_optimized_session(Path::new("nonexistent_vit.onnx"));
        assert!(matches!(result, Err(OnnxError::ModelNotFound(_))));

        let result = OnnxVitBackbone::new("nonexistent_vit.onnx", None, 768);
        assert!(matches!(result, Err(ModelError::Session(_))));
    }

    #[test]
    fn test_error_display() {
        let err = OnnxError::ModelNotFound("vit.onnx".to_string());
        assert_eq!(err.to_string(), "Model file not found: vit.onnx");
    }

    #[test]
    #[ignore] // Requires models/vit_base_patch16_224.onnx
    fn test_real_vit_token_layout() {
        let mut backbone =
            OnnxVitBackbone::new("models/vit_base_patch16_224.onnx", None, 768).unwrap();
        let image = ndarray::Array3::<f32>::zeros((3, 224, 224));
        let output = backbone.forward(image.view()).unwrap();
        assert_eq!(output.embedding.len(), 768);
        assert_eq!(output.tokens.num_tokens(), 196);
    }
}
