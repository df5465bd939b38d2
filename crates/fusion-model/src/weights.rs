//! Safetensors checkpoint access keyed by PyTorch `state_dict` names
use ndarray::{Array1, Array2, ArrayD, ArrayViewD, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensorError, SafeTensors};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Errors that can occur while reading or writing a checkpoint
#[derive(Error, Debug)]
pub enum WeightError {
    #[error("Failed to read checkpoint {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid safetensors data: {0}")]
    Format(#[from] SafeTensorError),

    #[error("Tensor not found in checkpoint: {0}")]
    Missing(String),

    #[error("Tensor {name} has dtype {dtype}, only F32 is supported")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("Tensor {name} has shape {actual:?}, expected {expected:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Tensor {name} is invalid: {reason}")]
    InvalidValue { name: String, reason: String },

    #[error("Checkpoint has tensors this model cannot use: {}", .names.join(", "))]
    Unexpected { names: Vec<String> },
}

#[derive(Debug, Clone)]
struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Named f32 tensors decoded from (or destined for) a safetensors file
///
/// Loaders `take` the tensors they need so leftover keys can be reported.
#[derive(Debug, Clone, Default)]
pub struct WeightMap {
    tensors: BTreeMap<String, Tensor>,
    /// Non-f32 entries (e.g. `num_batches_tracked`), kept only by name
    skipped: BTreeMap<String, String>,
}

impl WeightMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, WeightError> {
        let path = path.as_ref();
        let buffer = std::fs::read(path).map_err(|source| WeightError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let map = Self::from_bytes(&buffer)?;
        debug!("Loaded {} tensors from {}", map.len(), path.display());
        Ok(map)
    }

    pub fn from_bytes(buffer: &[u8]) -> Result<Self, WeightError> {
        let tensors = SafeTensors::deserialize(buffer)?;
        let mut map = Self::new();

        for (name, view) in tensors.tensors() {
            if view.dtype() != Dtype::F32 {
                map.skipped.insert(name, format!("{:?}", view.dtype()));
                continue;
            }
            // Byte-wise decode: the data slice is not guaranteed to be 4-byte aligned
            let data = view
                .data()
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            map.tensors.insert(
                name,
                Tensor {
                    shape: view.shape().to_vec(),
                    data,
                },
            );
        }

        Ok(map)
    }

    pub fn insert(
        &mut self,
        name: impl Into<String>,
        shape: Vec<usize>,
        data: Vec<f32>,
    ) -> Result<(), WeightError> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(WeightError::Shape {
                name,
                expected: shape,
                actual: vec![data.len()],
            });
        }
        self.skipped.remove(&name);
        self.tensors.insert(name, Tensor { shape, data });
        Ok(())
    }

    /// Insert an array, copying it in logical (row-major) order
    pub fn insert_array(&mut self, name: impl Into<String>, array: &ArrayViewD<'_, f32>) {
        let name = name.into();
        self.skipped.remove(&name);
        self.tensors.insert(
            name,
            Tensor {
                shape: array.shape().to_vec(),
                data: array.iter().copied().collect(),
            },
        );
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.tensors.remove(name).is_some() | self.skipped.remove(name).is_some()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Names not yet consumed by a loader
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Fail if any unconsumed tensor starts with one of `prefixes`
    pub fn reject_prefixes(&self, prefixes: &[&str]) -> Result<(), WeightError> {
        let names: Vec<String> = self
            .tensors
            .keys()
            .chain(self.skipped.keys())
            .filter(|name| prefixes.iter().any(|p| name.starts_with(p)))
            .cloned()
            .collect();
        if names.is_empty() {
            Ok(())
        } else {
            Err(WeightError::Unexpected { names })
        }
    }

    pub fn take_array(&mut self, name: &str, shape: &[usize]) -> Result<ArrayD<f32>, WeightError> {
        let tensor = match self.tensors.remove(name) {
            Some(tensor) => tensor,
            None => {
                return Err(match self.skipped.get(name) {
                    Some(dtype) => WeightError::UnsupportedDtype {
                        name: name.to_string(),
                        dtype: dtype.clone(),
                    },
                    None => WeightError::Missing(name.to_string()),
                })
            }
        };

        if tensor.shape != shape {
            return Err(WeightError::Shape {
                name: name.to_string(),
                expected: shape.to_vec(),
                actual: tensor.shape,
            });
        }

        ArrayD::from_shape_vec(IxDyn(shape), tensor.data).map_err(|e| WeightError::InvalidValue {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn take_matrix(
        &mut self,
        name: &str,
        rows: usize,
        cols: usize,
    ) -> Result<Array2<f32>, WeightError> {
        let array = self.take_array(name, &[rows, cols])?;
        array
            .into_dimensionality()
            .map_err(|e| WeightError::InvalidValue {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn take_vector(&mut self, name: &str, len: usize) -> Result<Array1<f32>, WeightError> {
        let array = self.take_array(name, &[len])?;
        array
            .into_dimensionality()
            .map_err(|e| WeightError::InvalidValue {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Serialize every f32 tensor into safetensors format
    pub fn to_safetensors_bytes(&self) -> Result<Vec<u8>, WeightError> {
        let encoded: Vec<(&str, &[usize], Vec<u8>)> = self
            .tensors
            .iter()
            .map(|(name, t)| {
                let bytes = t.data.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name.as_str(), t.shape.as_slice(), bytes)
            })
            .collect();

        let views = encoded
            .iter()
            .map(|(name, shape, bytes)| {
                TensorView::new(Dtype::F32, shape.to_vec(), bytes).map(|view| (*name, view))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(safetensors::serialize(views, &None)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), WeightError> {
        let path = path.as_ref();
        let bytes = self.to_safetensors_bytes()?;
        std::fs::write(path, bytes).map_err(|source| WeightError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
