//! Error types for record construction

use thiserror::Error;

/// Record invariant violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Batch must contain at least one sample")]
    EmptyBatch,

    #[error(
        "Batch field lengths differ: \
         {identifiers} identifiers, {timestamps} timestamps, {images} images"
    )]
    LengthMismatch {
        identifiers: usize,
        timestamps: usize,
        images: usize,
    },

    #[error("Image shape mismatch for '{identifier}': expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        identifier: String,
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },

    #[error("Image for '{identifier}' has an empty dimension: {shape:?}")]
    DegenerateImage {
        identifier: String,
        shape: (usize, usize, usize),
    },
}

/// Result type alias
pub type RecordResult<T> = Result<T, RecordError>;
