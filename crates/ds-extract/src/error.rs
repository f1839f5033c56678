//! Error types for feature extraction

use ds_core::RecordError;
use thiserror::Error;

/// Broad failure classes; all of them are fatal to a running pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing model artifacts, unknown layer, bad settings
    Configuration,
    /// Device unavailable or out of memory
    Resource,
    /// Forward pass failure unrelated to resources
    RuntimeCompute,
}

/// Extraction error types
#[derive(Error, Debug)]
pub enum MlError {
    /// Model file not found
    #[error("Model not found: {path}")]
    ModelNotFound { path: String },

    /// A required artifact is missing from a model directory
    #[error("No {what} found in {directory}")]
    ArtifactMissing { directory: String, what: String },

    /// Requested layer is not an extraction point of the model
    #[error("'{layer}' is not a valid layer. Available layers are: {available:?}")]
    UnknownLayer {
        layer: String,
        available: Vec<String>,
    },

    /// Short layer name maps to several graph nodes
    #[error(
        "'{layer}' is not a valid layer, it matches several nodes {candidates:?}. \
         Available layers are: {available:?}"
    )]
    AmbiguousLayer {
        layer: String,
        candidates: Vec<String>,
        available: Vec<String>,
    },

    /// Declared layer has no counterpart in the loaded model
    #[error("Layer '{layer}' is declared but not present in model {model}")]
    LayerNotInModel { layer: String, model: String },

    /// Unknown named architecture
    #[error("Unknown architecture '{key}'. Available architectures are: {available:?}")]
    UnknownArchitecture { key: String, available: Vec<String> },

    /// Model loading failed
    #[error("Failed to load model: {reason}")]
    ModelLoadFailed { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed or written
    #[error("Configuration error: {0}")]
    ConfigParse(String),

    /// Compute device cannot be used
    #[error("Device not available: {reason}")]
    DeviceUnavailable { reason: String },

    /// Device memory exhausted
    #[error("Out of memory: {reason}")]
    OutOfMemory { reason: String },

    /// Inference failed
    #[error("Inference failed: {reason}")]
    InferenceFailed { reason: String },

    /// Invalid input shape
    #[error("Invalid input shape: expected {expected}, got {got}")]
    InvalidInputShape { expected: String, got: String },

    /// Invalid output shape
    #[error("Invalid output shape: expected {expected}, got {got}")]
    InvalidOutputShape { expected: String, got: String },

    /// Images within one batch differ in shape
    #[error("Image shape mismatch for '{identifier}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        identifier: String,
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },

    /// Record invariant violation
    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    /// Extraction of one batch failed
    #[error("Batch {index} ('{first}'..'{last}') failed: {source}")]
    BatchFailed {
        index: usize,
        first: String,
        last: String,
        #[source]
        source: Box<MlError>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MlError {
    /// Classify error into configuration, resource or compute failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            MlError::ModelNotFound { .. }
            | MlError::ArtifactMissing { .. }
            | MlError::UnknownLayer { .. }
            | MlError::AmbiguousLayer { .. }
            | MlError::LayerNotInModel { .. }
            | MlError::UnknownArchitecture { .. }
            | MlError::ModelLoadFailed { .. }
            | MlError::InvalidConfig(_)
            | MlError::ConfigParse(_)
            | MlError::Io(_) => ErrorKind::Configuration,

            MlError::DeviceUnavailable { .. } | MlError::OutOfMemory { .. } => ErrorKind::Resource,

            MlError::InferenceFailed { .. }
            | MlError::InvalidInputShape { .. }
            | MlError::InvalidOutputShape { .. }
            | MlError::ShapeMismatch { .. }
            | MlError::Record(_) => ErrorKind::RuntimeCompute,

            MlError::BatchFailed { source, .. } => source.kind(),
        }
    }

    /// Map a runtime fault message, detecting exhausted device memory
    pub fn from_runtime(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let lower = reason.to_lowercase();
        if lower.contains("out of memory") || lower.contains("out_of_memory") {
            MlError::OutOfMemory { reason }
        } else {
            MlError::InferenceFailed { reason }
        }
    }

    /// Unknown layer error with the sorted list of alternatives
    pub fn unknown_layer<I, S>(layer: &str, available: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut available: Vec<String> = available.into_iter().map(Into::into).collect();
        available.sort();
        available.dedup();
        MlError::UnknownLayer {
            layer: layer.to_string(),
            available,
        }
    }

    /// Ambiguous layer error with the sorted list of all layers
    pub fn ambiguous_layer<I, S>(layer: &str, candidates: Vec<String>, available: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut available: Vec<String> = available.into_iter().map(Into::into).collect();
        available.sort();
        available.dedup();
        MlError::AmbiguousLayer {
            layer: layer.to_string(),
            candidates,
            available,
        }
    }

    /// Wrap extraction failure with the batch position
    pub fn in_batch(self, index: usize, first: &str, last: &str) -> Self {
        MlError::BatchFailed {
            index,
            first: first.to_string(),
            last: last.to_string(),
            source: Box::new(self),
        }
    }
}

/// Result type for extraction operations
pub type MlResult<T> = Result<T, MlError>;
