//! Feature extraction backends
//!
//! Four structurally different model families driven through one contract:
//! - [`GraphBackend`]: frozen computation graph, layers discovered from node names
//! - [`ModuleBackend`]: prepackaged module with declared outputs
//! - [`NamedBackend`]: named architecture from the model zoo
//! - `LegacyBackend`: layer-list network with separate weights (candle)
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ds_extract::{ExtractorConfig, backend::load_backend};
//!
//! let config = ExtractorConfig::load_or_init("deep.toml")?;
//! let mut backend = load_backend(&config)?;
//!
//! // One row per sample, in batch order
//! let features = backend.extract(&batch)?;
//! ```

mod graph;
pub mod layers;
#[cfg(feature = "candle")]
mod legacy;
mod module;
mod named;
mod plan;

#[cfg(test)]
pub(crate) mod fake;

pub use graph::{DEFAULT_INPUT_SIZE, GraphBackend, GraphOptions};
#[cfg(feature = "candle")]
pub use legacy::LegacyBackend;
pub use module::{MANIFEST_FILE, ModuleBackend, ModuleManifest};
pub use named::{Architecture, DEFAULT_WEIGHTS_DIR, NamedBackend, find_layer_node};
pub use plan::FixedBatchPlan;

pub use crate::config::BackendKind;

use std::collections::BTreeSet;
use std::path::Path;

use ds_core::{BackendCapability, Batch};
use ndarray::Array2;

use crate::config::ExtractorConfig;
use crate::error::{MlError, MlResult};

/// Common trait for all extraction backends
///
/// A backend owns its model and device resources from load until drop. Layer
/// validation happens at load, so a constructed backend is always ready.
pub trait ExtractionBackend: Send + std::fmt::Debug {
    /// Variant of this backend
    fn kind(&self) -> BackendKind;

    /// Legal extraction points of the loaded model
    fn available_layers(&self) -> BTreeSet<String>;

    /// Layers, selected layer and expected input shape
    fn capability(&self) -> BackendCapability;

    /// Run one forward pass and return one flat feature row per sample
    fn extract(&mut self, batch: &Batch) -> MlResult<Array2<f32>>;
}

impl<T: ExtractionBackend + ?Sized> ExtractionBackend for Box<T> {
    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    fn available_layers(&self) -> BTreeSet<String> {
        (**self).available_layers()
    }

    fn capability(&self) -> BackendCapability {
        (**self).capability()
    }

    fn extract(&mut self, batch: &Batch) -> MlResult<Array2<f32>> {
        (**self).extract(batch)
    }
}

/// Load the backend variant selected by `config`
pub fn load_backend(config: &ExtractorConfig) -> MlResult<Box<dyn ExtractionBackend>> {
    config.validate()?;
    let inference = config.inference_config();
    let location = config.model_location.as_str();

    log::info!(
        "Loading {} backend from {} (layer '{}', batch size {})",
        config.backend.name(),
        location,
        config.layer,
        config.batch_size
    );

    let backend: Box<dyn ExtractionBackend> = match config.backend {
        BackendKind::Graph => Box::new(GraphBackend::load(
            location,
            &config.layer,
            GraphOptions::from_config(config),
            &inference,
        )?),
        BackendKind::Module => Box::new(ModuleBackend::load(
            Path::new(location),
            &config.layer,
            &inference,
        )?),
        BackendKind::Architecture => Box::new(NamedBackend::load(
            location,
            config.weights.as_deref(),
            &config.layer,
            &inference,
        )?),
        BackendKind::Legacy => load_legacy(config)?,
    };

    let capability = backend.capability();
    if !capability.is_valid() {
        return Err(MlError::unknown_layer(&config.layer, capability.available_layers));
    }
    Ok(backend)
}

#[cfg(feature = "candle")]
fn load_legacy(config: &ExtractorConfig) -> MlResult<Box<dyn ExtractionBackend>> {
    Ok(Box::new(LegacyBackend::load(
        Path::new(&config.model_location),
        &config.layer,
        &config.inference_config(),
    )?))
}

#[cfg(not(feature = "candle"))]
fn load_legacy(_config: &ExtractorConfig) -> MlResult<Box<dyn ExtractionBackend>> {
    Err(MlError::InvalidConfig(
        "legacy backend requires the 'candle' feature".into(),
    ))
}
