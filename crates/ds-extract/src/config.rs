//! Extractor configuration: TOML backend and batching settings

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MlError, MlResult};
use crate::inference::{DevicePreference, InferenceConfig};

/// Backend variant driving the extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Frozen computation graph, layers discovered from node names
    Graph,
    /// Prepackaged module directory with declared outputs
    Module,
    /// Named architecture from the model zoo
    Architecture,
    /// Legacy layer-list network with separate weights
    #[default]
    Legacy,
}

impl BackendKind {
    /// Config key of the variant
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Graph => "graph",
            BackendKind::Module => "module",
            BackendKind::Architecture => "architecture",
            BackendKind::Legacy => "legacy",
        }
    }
}

/// Policy for images whose shape differs within one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShapePolicy {
    /// Fail the stream
    #[default]
    Reject,
    /// Resize to the shape of the batch's first sample
    ResizeToFirst,
}

/// Complete extractor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Backend variant
    #[serde(default)]
    pub backend: BackendKind,

    /// Model file, model directory or architecture key
    pub model_location: String,

    /// Layer to extract features from
    #[serde(default = "default_layer")]
    pub layer: String,

    /// Samples per forward pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Preferred device
    #[serde(default)]
    pub device: DevicePreference,

    /// GPU ordinal
    #[serde(default)]
    pub device_index: usize,

    /// Uneven image shape handling
    #[serde(default)]
    pub shape_policy: ShapePolicy,

    /// Weights file for named architectures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights: Option<PathBuf>,

    /// Square input size of a frozen graph, overriding the declared one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_size: Option<usize>,

    /// Input node of a frozen graph, if not `<prefix>/input`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_node: Option<String>,

    /// Frozen graph expects BGR channel order
    #[serde(default)]
    pub expects_bgr: bool,
}

fn default_layer() -> String {
    "fc7".to_string()
}

fn default_batch_size() -> usize {
    ds_core::DEFAULT_BATCH_SIZE
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            model_location: "models/bvlc_alexnet".to_string(),
            layer: default_layer(),
            batch_size: default_batch_size(),
            device: DevicePreference::default(),
            device_index: 0,
            shape_policy: ShapePolicy::default(),
            weights: None,
            input_size: None,
            input_node: None,
            expects_bgr: false,
        }
    }
}

impl ExtractorConfig {
    /// Create a config with required fields
    pub fn new(backend: BackendKind, model_location: &str, layer: &str) -> Self {
        Self {
            backend,
            model_location: model_location.to_string(),
            layer: layer.to_string(),
            ..Default::default()
        }
    }

    /// Load from TOML string
    pub fn from_toml(toml_str: &str) -> MlResult<Self> {
        toml::from_str(toml_str).map_err(|e| MlError::ConfigParse(e.to_string()))
    }

    /// Save to TOML string
    pub fn to_toml(&self) -> MlResult<String> {
        toml::to_string_pretty(self).map_err(|e| MlError::ConfigParse(e.to_string()))
    }

    /// Read config file, or write the default config there if it is missing
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> MlResult<Self> {
        let path = path.as_ref();

        if path.is_file() {
            log::info!("Found config file {}", path.display());
            let text = fs::read_to_string(path)?;
            let config = Self::from_toml(&text)?;
            config.validate()?;
            return Ok(config);
        }

        log::info!("Writing standard config to {}", path.display());
        let config = Self::default();
        fs::write(path, config.to_toml()?)?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> MlResult<()> {
        if self.model_location.trim().is_empty() {
            return Err(MlError::InvalidConfig(
                "model_location cannot be empty".to_string(),
            ));
        }
        if self.layer.trim().is_empty() {
            return Err(MlError::InvalidConfig("layer cannot be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(MlError::InvalidConfig(
                "batch_size must be a positive integer".to_string(),
            ));
        }
        if self.input_size == Some(0) {
            return Err(MlError::InvalidConfig(
                "input_size must be a positive integer".to_string(),
            ));
        }
        if self.device == DevicePreference::Cpu && self.device_index != 0 {
            log::warn!(
                "device_index {} is ignored in CPU mode",
                self.device_index
            );
        }
        Ok(())
    }

    /// Runtime settings derived from this config
    pub fn inference_config(&self) -> InferenceConfig {
        InferenceConfig {
            device: self.device,
            device_index: self.device_index,
            batch_size: self.batch_size,
        }
    }
}
