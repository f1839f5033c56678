//! ds-core: Shared record types for DeepSpectrum
//!
//! This crate provides the data model passed between the spectrogram renderer,
//! the batching layer and the feature extraction backends:
//! - [`SampleRecord`]: one rendered spectrogram image with its identifier
//! - [`Batch`]: a dense stack of samples processed in one forward pass
//! - [`FeatureRecord`]: the flattened feature vector produced for one sample

mod batch;
mod error;
mod feature;
mod sample;

pub use batch::*;
pub use error::*;
pub use feature::*;
pub use sample::*;

/// Pixel intensity type of rendered spectrogram images
pub type Pixel = u8;

/// Default number of samples per batch
pub const DEFAULT_BATCH_SIZE: usize = 256;
