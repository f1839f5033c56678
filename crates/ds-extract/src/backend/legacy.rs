//! Legacy layer-list network backend
//!
//! The model directory holds a `*deploy.json` network definition and a
//! `*.safetensors` weights file. Unlike the graph runtimes the input blob is
//! reshaped to the size of every incoming batch.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use ds_core::{BackendCapability, Batch};
use ndarray::Array2;

use super::{BackendKind, ExtractionBackend};
use crate::error::{MlError, MlResult};
use crate::inference::{DevicePreference, InferenceConfig};
use crate::net::Network;
use crate::preprocess;

/// Suffix of network definition files
pub const DEFINITION_SUFFIX: &str = "deploy.json";

/// Extension of weight files
pub const WEIGHTS_EXTENSION: &str = "safetensors";

/// Backend over a legacy network
pub struct LegacyBackend {
    net: Network,
    layer: String,
    blobs: Vec<String>,
}

impl LegacyBackend {
    /// Load network from a model directory
    pub fn load(directory: &Path, layer: &str, inference: &InferenceConfig) -> MlResult<Self> {
        let definition = find_artifact(directory, "network definition (*deploy.json)", |name| {
            name.ends_with(DEFINITION_SUFFIX)
        })?;
        let weights = find_artifact(directory, "weights (*.safetensors)", |name| {
            Path::new(name)
                .extension()
                .is_some_and(|ext| ext == WEIGHTS_EXTENSION)
        })?;

        let device = select_device(inference)?;
        let net = Network::load(&definition, &weights, &device)?;
        Self::from_network(net, layer)
    }

    /// Build backend over a constructed network
    pub fn from_network(net: Network, layer: &str) -> MlResult<Self> {
        let blobs = net.blobs();
        if !blobs.iter().any(|blob| blob == layer) {
            return Err(MlError::unknown_layer(layer, blobs));
        }

        log::info!(
            "Legacy backend ready: network '{}' blob '{}' on {:?}",
            net.name(),
            layer,
            net.device()
        );

        Ok(Self {
            net,
            layer: layer.to_string(),
            blobs,
        })
    }

    /// Channel-first float tensor in network channel order
    fn prepare_input(&self, batch: &Batch) -> MlResult<Tensor> {
        let [_, channels, height, width] = self.net.input_shape();
        let (_, _, c) = batch.image_shape();
        if c != channels {
            return Err(MlError::InvalidInputShape {
                expected: format!("{} channels", channels),
                got: format!("{} channels", c),
            });
        }

        let images = preprocess::resize_batch(batch.images().view(), height, width)?;
        let mut input = preprocess::to_float(images.view());
        if let Some(scale) = self.net.raw_scale() {
            input.mapv_inplace(|v| v * scale / 255.0);
        }
        // RGB -> BGR
        preprocess::reverse_channels(&mut input);
        preprocess::subtract_mean(&mut input, self.net.mean());
        let input = preprocess::to_channel_first(input);

        let shape = input.dim();
        let data = input.into_raw_vec_and_offset().0;
        Tensor::from_vec(data, shape, self.net.device())
            .map_err(|e| MlError::from_runtime(e.to_string()))
    }
}

impl std::fmt::Debug for LegacyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyBackend")
            .field("network", &self.net.name())
            .field("layer", &self.layer)
            .finish()
    }
}

impl ExtractionBackend for LegacyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    fn available_layers(&self) -> BTreeSet<String> {
        self.blobs.iter().cloned().collect()
    }

    fn capability(&self) -> BackendCapability {
        let [_, c, h, w] = self.net.input_shape();
        BackendCapability::new(self.blobs.iter().cloned(), self.layer.clone(), Some((h, w, c)))
    }

    fn extract(&mut self, batch: &Batch) -> MlResult<Array2<f32>> {
        self.net.reshape_input(batch.len());
        let input = self.prepare_input(batch)?;
        let output = self.net.forward(input, &self.layer)?;

        let rows = output
            .flatten_from(1)
            .and_then(|flat| flat.to_vec2::<f32>())
            .map_err(|e| MlError::from_runtime(e.to_string()))?;

        let n = rows.len();
        let dim = rows.first().map(Vec::len).unwrap_or(0);
        let data: Vec<f32> = rows.into_iter().flatten().collect();
        Array2::from_shape_vec((n, dim), data).map_err(|e| MlError::InvalidOutputShape {
            expected: format!("({}, {})", n, dim),
            got: e.to_string(),
        })
    }
}

/// First file in sorted order whose name matches
fn find_artifact(
    directory: &Path,
    what: &str,
    matches: impl Fn(&str) -> bool,
) -> MlResult<PathBuf> {
    let missing = || MlError::ArtifactMissing {
        directory: directory.display().to_string(),
        what: what.to_string(),
    };
    if !directory.is_dir() {
        return Err(missing());
    }

    let mut candidates: Vec<PathBuf> = fs::read_dir(directory)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(&matches)
        })
        .collect();
    candidates.sort();

    let path = candidates.into_iter().next().ok_or_else(missing)?;
    log::debug!("Using {} as {}", path.display(), what);
    Ok(path)
}

/// Candle device for the configured preference
fn select_device(inference: &InferenceConfig) -> MlResult<Device> {
    match inference.device {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Gpu => {
            let device = Device::cuda_if_available(inference.device_index).map_err(|e| {
                MlError::DeviceUnavailable {
                    reason: format!("GPU {}: {}", inference.device_index, e),
                }
            })?;
            if !device.is_cuda() {
                log::warn!(
                    "GPU {} requested but CUDA is not available, falling back to CPU",
                    inference.device_index
                );
            }
            Ok(device)
        }
    }
}
