//! # DeepSpectrum Feature Extraction
//!
//! Batched CNN feature extraction over rendered spectrogram images:
//! - Lazy batching of sample streams with bounded memory
//! - Four interchangeable backends behind one extraction contract
//! - An order-preserving, pull-based pipeline from samples to feature vectors
//!
//! ## Backends
//!
//! - Frozen computation graphs (ONNX via `tract`), layers discovered from node names
//! - Prepackaged modules with declared outputs
//! - Named architectures (VGG, ResNet, DenseNet, ...) exported to ONNX
//! - Legacy layer-list networks run with `candle` (CPU, or CUDA with the `cuda` feature)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ds_extract::{ExtractorConfig, FeatureExtractor};
//!
//! let config = ExtractorConfig::load_or_init("deep.toml")?;
//! let extractor = FeatureExtractor::from_config(&config)?;
//!
//! for record in extractor.run(samples)? {
//!     let record = record?;
//!     writer.write(&record.identifier, record.timestamp, &record.features)?;
//! }
//! ```

pub mod backend;
pub mod batch;
pub mod config;
pub mod inference;
#[cfg(feature = "candle")]
pub mod net;
pub mod pipeline;
pub mod preprocess;

mod error;

pub use backend::{BackendKind, ExtractionBackend, load_backend};
pub use batch::{BatchSource, batches};
pub use config::{ExtractorConfig, ShapePolicy};
pub use error::{ErrorKind, MlError, MlResult};
pub use inference::{DevicePreference, InferenceConfig};
pub use pipeline::{FeatureExtractor, FeaturePipeline, PipelineState, PipelineStats, run};

pub use ds_core::{BackendCapability, Batch, FeatureRecord, SampleRecord};
