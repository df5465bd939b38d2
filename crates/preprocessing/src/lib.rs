//! Deterministic preprocessing for scan images and clinical covariates
//!
//! Both stages run before the fusion model is touched, so a payload that cannot be
//! decoded is rejected without ever taking the model lock.
//!
//! # Example
//! ```no_run
//! use cogniscan_common::ClinicalRecord;
//! use cogniscan_preprocessing::{ClinicalFeatureEncoder, ImagePreprocessor, PreprocessConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let preprocessor = ImagePreprocessor::new(PreprocessConfig::default());
//! let bytes = std::fs::read("scan.png")?;
//! let tensor = preprocessor.preprocess(&bytes)?;
//! assert_eq!(tensor.shape(), [3, 224, 224]);
//!
//! let vector = ClinicalFeatureEncoder.encode(&ClinicalRecord::default());
//! assert_eq!(vector.as_slice(), &[0.0, 0.0, 0.0, 0.0]);
//! # Ok(())
//! # }
//! ```

pub mod clinical;
pub mod scan;

pub use clinical::ClinicalFeatureEncoder;
pub use scan::{ImagePreprocessor, PreprocessConfig, PreprocessError};
