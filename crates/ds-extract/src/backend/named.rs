//! Named architecture backend
//!
//! Well-known image classification networks, selected by key. Each
//! architecture declares its input size, pixel preprocessing and the names of
//! its layers; weights are an ONNX export of the network.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ds_core::{BackendCapability, Batch};
use ndarray::Array2;

use super::layers::{self, LayerRegistry};
use super::plan::FixedBatchPlan;
use super::{BackendKind, ExtractionBackend};
use crate::error::{MlError, MlResult};
use crate::inference::{InferenceConfig, ModelGraph, TractGraph};
use crate::preprocess::{
    self, IMAGENET_BGR_MEAN, IMAGENET_RGB_MEAN, IMAGENET_RGB_STD, PixelTransform,
};

/// Directory searched for `<key>.onnx` when no weights file is configured
pub const DEFAULT_WEIGHTS_DIR: &str = "models";

/// Supported architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Architecture {
    Vgg16,
    Vgg19,
    ResNet50,
    Xception,
    InceptionV3,
    DenseNet121,
    DenseNet169,
    DenseNet201,
    MobileNet,
    MobileNetV2,
    NasNetLarge,
    NasNetMobile,
    InceptionResNetV2,
}

impl Architecture {
    /// All architectures in key order
    pub const ALL: [Architecture; 13] = [
        Architecture::DenseNet121,
        Architecture::DenseNet169,
        Architecture::DenseNet201,
        Architecture::InceptionResNetV2,
        Architecture::InceptionV3,
        Architecture::MobileNet,
        Architecture::MobileNetV2,
        Architecture::NasNetLarge,
        Architecture::NasNetMobile,
        Architecture::ResNet50,
        Architecture::Vgg16,
        Architecture::Vgg19,
        Architecture::Xception,
    ];

    /// Configuration key
    pub fn key(&self) -> &'static str {
        match self {
            Architecture::Vgg16 => "vgg16",
            Architecture::Vgg19 => "vgg19",
            Architecture::ResNet50 => "resnet50",
            Architecture::Xception => "xception",
            Architecture::InceptionV3 => "inception_v3",
            Architecture::DenseNet121 => "densenet121",
            Architecture::DenseNet169 => "densenet169",
            Architecture::DenseNet201 => "densenet201",
            Architecture::MobileNet => "mobilenet",
            Architecture::MobileNetV2 => "mobilenet_v2",
            Architecture::NasNetLarge => "nasnet_large",
            Architecture::NasNetMobile => "nasnet_mobile",
            Architecture::InceptionResNetV2 => "inception_resnet_v2",
        }
    }

    /// Square input size
    pub fn input_size(&self) -> usize {
        match self {
            Architecture::Xception
            | Architecture::InceptionV3
            | Architecture::InceptionResNetV2 => 299,
            Architecture::NasNetLarge => 331,
            _ => 224,
        }
    }

    /// Pixel preprocessing expected by the pretrained weights
    pub fn transform(&self) -> PixelTransform {
        match self {
            Architecture::Vgg16 | Architecture::Vgg19 => PixelTransform::ChannelReverse,
            Architecture::ResNet50 => PixelTransform::Caffe {
                mean: IMAGENET_BGR_MEAN,
            },
            Architecture::DenseNet121 | Architecture::DenseNet169 | Architecture::DenseNet201 => {
                PixelTransform::Torch {
                    mean: IMAGENET_RGB_MEAN,
                    std: IMAGENET_RGB_STD,
                }
            }
            _ => PixelTransform::Tf,
        }
    }

    /// Declared layer names
    pub fn layers(&self) -> Vec<String> {
        match self {
            Architecture::Vgg16 => vgg_layers(&[2, 2, 3, 3, 3]),
            Architecture::Vgg19 => vgg_layers(&[2, 2, 4, 4, 4]),
            Architecture::ResNet50 => resnet_layers(&[3, 4, 6, 3]),
            Architecture::Xception => xception_layers(),
            Architecture::InceptionV3 => {
                let mut layers: Vec<String> = (0..=10).map(|i| format!("mixed{}", i)).collect();
                layers.extend(["avg_pool".to_string(), "predictions".to_string()]);
                layers
            }
            Architecture::DenseNet121 => densenet_layers(&[6, 12, 24, 16]),
            Architecture::DenseNet169 => densenet_layers(&[6, 12, 32, 32]),
            Architecture::DenseNet201 => densenet_layers(&[6, 12, 48, 32]),
            Architecture::MobileNet => {
                let mut layers = vec!["conv1_relu".to_string()];
                layers.extend((1..=13).map(|i| format!("conv_pw_{}_relu", i)));
                layers.extend(
                    ["global_average_pooling2d", "conv_preds", "predictions"]
                        .map(String::from),
                );
                layers
            }
            Architecture::MobileNetV2 => {
                let mut layers =
                    vec!["Conv1_relu".to_string(), "expanded_conv_project_BN".to_string()];
                layers.extend((1..=16).map(|i| format!("block_{}_project_BN", i)));
                layers.extend(
                    ["out_relu", "global_average_pooling2d", "predictions"].map(String::from),
                );
                layers
            }
            Architecture::NasNetLarge => nasnet_layers(18),
            Architecture::NasNetMobile => nasnet_layers(12),
            Architecture::InceptionResNetV2 => {
                let mut layers = vec!["mixed_5b".to_string()];
                layers.extend((1..=10).map(|i| format!("block35_{}_ac", i)));
                layers.push("mixed_6a".into());
                layers.extend((1..=20).map(|i| format!("block17_{}_ac", i)));
                layers.push("mixed_7a".into());
                layers.extend((1..=9).map(|i| format!("block8_{}_ac", i)));
                layers.extend(
                    ["block8_10", "conv_7b_ac", "avg_pool", "predictions"].map(String::from),
                );
                layers
            }
        }
    }

    /// Default weights location
    pub fn default_weights(&self) -> PathBuf {
        Path::new(DEFAULT_WEIGHTS_DIR).join(format!("{}.onnx", self.key()))
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Architecture {
    type Err = MlError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        Architecture::ALL
            .iter()
            .copied()
            .find(|arch| arch.key() == key)
            .ok_or_else(|| MlError::UnknownArchitecture {
                key: key.to_string(),
                available: Architecture::ALL.iter().map(|a| a.key().to_string()).collect(),
            })
    }
}

fn vgg_layers(convs: &[usize]) -> Vec<String> {
    let mut layers = Vec::new();
    for (b, &count) in convs.iter().enumerate() {
        layers.extend((1..=count).map(|i| format!("block{}_conv{}", b + 1, i)));
        layers.push(format!("block{}_pool", b + 1));
    }
    layers.extend(["flatten", "fc1", "fc2", "predictions"].map(String::from));
    layers
}

fn resnet_layers(blocks: &[usize]) -> Vec<String> {
    let mut layers: Vec<String> =
        ["conv1_conv", "conv1_relu", "pool1_pool"].map(String::from).to_vec();
    for (stage, &count) in blocks.iter().enumerate() {
        layers.extend((1..=count).map(|i| format!("conv{}_block{}_out", stage + 2, i)));
    }
    layers.extend(["avg_pool", "predictions"].map(String::from));
    layers
}

fn xception_layers() -> Vec<String> {
    let mut layers = vec!["block1_conv1_act".to_string(), "block1_conv2_act".to_string()];
    layers.extend((2..=4).map(|b| format!("block{}_pool", b)));
    layers.extend((5..=12).map(|b| format!("block{}_sepconv3_act", b)));
    layers.extend(
        ["block13_pool", "block14_sepconv1_act", "block14_sepconv2_act", "avg_pool", "predictions"]
            .map(String::from),
    );
    layers
}

fn densenet_layers(blocks: &[usize]) -> Vec<String> {
    let mut layers = vec!["conv1/relu".to_string(), "pool1".to_string()];
    for (stage, &count) in blocks.iter().enumerate() {
        let stage = stage + 2;
        layers.extend((1..=count).map(|i| format!("conv{}_block{}_concat", stage, i)));
        if stage < 5 {
            layers.push(format!("pool{}_pool", stage));
        }
    }
    layers.extend(["relu", "avg_pool", "fc1000"].map(String::from));
    layers
}

fn nasnet_layers(normal_cells: usize) -> Vec<String> {
    let mut layers = vec!["stem_1".to_string(), "stem_2".to_string()];
    layers.extend((0..normal_cells).map(|i| format!("normal_concat_{}", i)));
    layers.extend(
        [
            "reduction_concat_reduce_0",
            "reduction_concat_reduce_1",
            "global_average_pooling2d",
            "predictions",
        ]
        .map(String::from),
    );
    layers
}

/// Node of `layer` in a graph exported from a named architecture
///
/// Candidates are ranked: the exact node name, the layer directly under the
/// export scope, any node ending in the layer's segments, an operation inside
/// the layer scoped directly under the export scope, and finally an operation
/// inside the layer anywhere. Within a rank the last node wins, which is the
/// layer's final operation.
pub fn find_layer_node<'a>(nodes: &'a [String], layer: &str) -> Option<&'a str> {
    let target: Vec<&str> = layer.split('/').collect();
    let mut best: Option<(u8, &str)> = None;
    for node in nodes {
        let Some(rank) = match_rank(node, &target) else {
            continue;
        };
        if best.is_none_or(|(best_rank, _)| rank <= best_rank) {
            best = Some((rank, node.as_str()));
        }
    }
    best.map(|(_, node)| node)
}

fn match_rank(node: &str, target: &[&str]) -> Option<u8> {
    let segments: Vec<&str> = node.split('/').collect();
    if segments == target {
        return Some(0);
    }

    let scoped = segments.get(1..).unwrap_or_default();
    if scoped == target {
        return Some(1);
    }
    if segments.ends_with(target) {
        return Some(2);
    }

    let operation = !layers::is_ignored_node(node);
    if operation && scoped.starts_with(target) {
        return Some(3);
    }
    if operation && segments.windows(target.len()).any(|window| window == target) {
        return Some(4);
    }
    None
}

/// Backend over a named architecture
pub struct NamedBackend {
    architecture: Architecture,
    registry: LayerRegistry,
    layer: String,
    plan: FixedBatchPlan,
}

impl NamedBackend {
    /// Load architecture `key` with weights from `weights` or the default location
    pub fn load(
        key: &str,
        weights: Option<&Path>,
        layer: &str,
        inference: &InferenceConfig,
    ) -> MlResult<Self> {
        let architecture: Architecture = key.parse()?;
        inference.resolve_cpu_only("tract");

        let path = weights
            .map(Path::to_path_buf)
            .unwrap_or_else(|| architecture.default_weights());
        let graph = TractGraph::load(&path)?;
        Self::from_graph(architecture, &graph, layer, inference.batch_size)
    }

    /// Build backend over an already loaded export of `architecture`
    pub fn from_graph(
        architecture: Architecture,
        graph: &dyn ModelGraph,
        layer: &str,
        batch_size: usize,
    ) -> MlResult<Self> {
        let nodes = graph.node_names();
        let declared = architecture.layers();
        let total = declared.len();
        let registry = LayerRegistry::from_declared(declared.into_iter().filter_map(|name| {
            let node = find_layer_node(&nodes, &name)?.to_string();
            Some((name, node))
        }));
        if registry.len() < total {
            log::debug!(
                "{} exports {} of {} declared {} layers",
                graph.location(),
                registry.len(),
                total,
                architecture
            );
        }
        let node = registry.resolve(layer)?.to_string();

        let inputs = graph.declared_inputs();
        let Some(input) = inputs.first() else {
            return Err(MlError::ModelLoadFailed {
                reason: format!("{} declares no input", graph.location()),
            });
        };

        let size = architecture.input_size();
        let plan = FixedBatchPlan::compile(graph, input, &node, (size, size, 3), batch_size)?;

        log::info!(
            "Architecture backend ready: {} from {} layer '{}' ({})",
            architecture,
            graph.location(),
            layer,
            node
        );

        Ok(Self {
            architecture,
            registry,
            layer: layer.to_string(),
            plan,
        })
    }

    /// Selected architecture
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }
}

impl fmt::Debug for NamedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedBackend")
            .field("architecture", &self.architecture)
            .field("layer", &self.layer)
            .field("output_node", &self.plan.output_node())
            .finish()
    }
}

impl ExtractionBackend for NamedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Architecture
    }

    fn available_layers(&self) -> BTreeSet<String> {
        self.registry.labels()
    }

    fn capability(&self) -> BackendCapability {
        BackendCapability::new(
            self.registry.labels(),
            self.layer.clone(),
            Some(self.plan.sample_shape()),
        )
    }

    fn extract(&mut self, batch: &Batch) -> MlResult<Array2<f32>> {
        let size = self.architecture.input_size();
        let (h, w, _) = batch.image_shape();

        let mut input = if (h, w) == (size, size) {
            preprocess::to_float(batch.images().view())
        } else {
            let resized = preprocess::resize_batch(batch.images().view(), size, size)?;
            preprocess::to_float(resized.view())
        };
        self.architecture.transform().apply(&mut input);

        self.plan.run(input)
    }
}
