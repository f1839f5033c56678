//! Frozen computation graph backend
//!
//! Extraction points are discovered from the graph's node names. The input
//! node follows the `<prefix>/input` convention of exported graphs unless it
//! is configured explicitly. Images are resized to the spatial size the input
//! node declares; a configured size overrides it.

use std::collections::BTreeSet;

use ds_core::{BackendCapability, Batch};
use ndarray::Array2;

use super::layers::{self, LayerRegistry};
use super::plan::FixedBatchPlan;
use super::{BackendKind, ExtractionBackend};
use crate::config::ExtractorConfig;
use crate::error::{MlError, MlResult};
use crate::inference::{InferenceConfig, ModelGraph, TractGraph};
use crate::preprocess;

/// Square input size of graphs whose input declares no spatial size
pub const DEFAULT_INPUT_SIZE: usize = 224;

/// Load-time settings of a graph backend
#[derive(Debug, Clone)]
pub struct GraphOptions {
    /// Square spatial input size overriding the declared one
    pub input_size: Option<usize>,
    /// Input channels
    pub channels: usize,
    /// Explicit input node
    pub input_node: Option<String>,
    /// Reverse RGB to BGR before the forward pass
    pub expects_bgr: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            input_size: None,
            channels: 3,
            input_node: None,
            expects_bgr: false,
        }
    }
}

impl GraphOptions {
    /// Options from the extractor configuration
    pub fn from_config(config: &ExtractorConfig) -> Self {
        Self {
            input_size: config.input_size,
            input_node: config.input_node.clone(),
            expects_bgr: config.expects_bgr,
            ..Default::default()
        }
    }
}

/// Backend over a frozen computation graph
pub struct GraphBackend {
    graph: Box<dyn ModelGraph>,
    registry: LayerRegistry,
    layer: String,
    plan: FixedBatchPlan,
    options: GraphOptions,
}

impl std::fmt::Debug for GraphBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphBackend")
            .field("location", &self.graph.location())
            .field("layer", &self.layer)
            .field("output_node", &self.plan.output_node())
            .finish()
    }
}

impl GraphBackend {
    /// Load ONNX graph from `path`
    pub fn load(
        path: &str,
        layer: &str,
        options: GraphOptions,
        inference: &InferenceConfig,
    ) -> MlResult<Self> {
        inference.resolve_cpu_only("tract");
        let graph = TractGraph::load(path)?;
        Self::from_graph(Box::new(graph), layer, options, inference.batch_size)
    }

    /// Build backend over an already loaded graph
    pub fn from_graph(
        graph: Box<dyn ModelGraph>,
        layer: &str,
        options: GraphOptions,
        batch_size: usize,
    ) -> MlResult<Self> {
        let nodes = graph.node_names();
        let mut registry = LayerRegistry::discover(&nodes);
        registry.include_outputs(&graph.declared_outputs());
        let output = registry.resolve(layer)?.to_string();

        let input = match &options.input_node {
            Some(node) => node.clone(),
            None => {
                let Some(first) = nodes.iter().find(|name| !layers::is_ignored_node(name)) else {
                    return Err(MlError::ModelLoadFailed {
                        reason: format!("{} contains no extraction points", graph.location()),
                    });
                };
                format!("{}/input", layers::leading_segment(first))
            }
        };
        if !nodes.contains(&input) {
            return Err(MlError::ModelLoadFailed {
                reason: format!("input node '{}' not found in {}", input, graph.location()),
            });
        }

        let (height, width) = input_size(graph.as_ref(), &input, options.input_size);
        let plan = FixedBatchPlan::compile(
            graph.as_ref(),
            &input,
            &output,
            (height, width, options.channels),
            batch_size,
        )?;

        log::info!(
            "Graph backend ready: {} layer '{}' ({} -> {}), {} layers available",
            graph.location(),
            layer,
            input,
            output,
            registry.len()
        );

        Ok(Self {
            graph,
            registry,
            layer: layer.to_string(),
            plan,
            options,
        })
    }
}

impl ExtractionBackend for GraphBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
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
        let (_, _, c) = batch.image_shape();
        if c != self.options.channels {
            return Err(MlError::InvalidInputShape {
                expected: format!("{} channels", self.options.channels),
                got: format!("{} channels", c),
            });
        }

        let (height, width, _) = self.plan.sample_shape();
        let images = preprocess::resize_batch(batch.images().view(), height, width)?;
        let mut input = preprocess::to_float(images.view());
        if self.options.expects_bgr {
            preprocess::reverse_channels(&mut input);
        }

        self.plan.run(input)
    }
}

/// Spatial size fed to `input`: configured, declared by an NHWC input, or default
fn input_size(graph: &dyn ModelGraph, input: &str, configured: Option<usize>) -> (usize, usize) {
    let declared = match graph.input_dims(input).as_deref() {
        Some(&[_, Some(height), Some(width), _]) => Some((height, width)),
        _ => None,
    };

    match (configured, declared) {
        (Some(size), Some(declared)) if declared != (size, size) => {
            log::warn!(
                "Configured input size {} overrides {:?} declared by '{}'",
                size,
                declared,
                input
            );
            (size, size)
        }
        (Some(size), _) => (size, size),
        (None, Some(declared)) => declared,
        (None, None) => {
            log::debug!(
                "'{}' declares no spatial size, using {}",
                input,
                DEFAULT_INPUT_SIZE
            );
            (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FAKE_FEATURE_DIM, FakeGraph};
    use ds_core::SampleRecord;
    use ndarray::{Array3, Array4};

    fn vggish() -> FakeGraph {
        FakeGraph::new(&[
            "vggish/input",
            "vggish/conv1/weights",
            "vggish/conv1/Conv2D",
            "vggish/conv1/conv1",
            "vggish/fc1/fc1_1/MatMul",
            "vggish/fc1/fc1_1/fc1_1",
            "vggish/embedding",
        ])
    }

    fn options(size: usize) -> GraphOptions {
        GraphOptions {
            input_size: Some(size),
            ..Default::default()
        }
    }

    fn batch(n: usize, value: u8) -> Batch {
        let ids = (0..n).map(|i| format!("s{}", i)).collect();
        let ts = (0..n).map(|i| i as f64).collect();
        Batch::new(ids, ts, Array4::from_elem((n, 4, 4, 3), value)).unwrap()
    }

    #[test]
    fn test_discovers_layers_and_input() {
        let graph = vggish();
        let handle = graph.handle();
        let backend =
            GraphBackend::from_graph(Box::new(graph), "embedding", options(4), 8).unwrap();

        let layers: Vec<_> = backend.available_layers().into_iter().collect();
        assert_eq!(layers, vec!["conv1", "embedding", "fc1_1"]);
        assert_eq!(
            handle.compiled(),
            vec![("vggish/input".to_string(), "vggish/embedding".to_string())]
        );
        assert!(backend.capability().is_valid());
    }

    #[test]
    fn test_unknown_layer_fails_at_load() {
        let err =
            GraphBackend::from_graph(Box::new(vggish()), "fc2", options(4), 8).unwrap_err();
        match err {
            MlError::UnknownLayer { layer, available } => {
                assert_eq!(layer, "fc2");
                assert_eq!(available, vec!["conv1", "embedding", "fc1_1"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_missing_input_node() {
        let graph = FakeGraph::new(&["net/fc7"]);
        let err = GraphBackend::from_graph(Box::new(graph), "fc7", options(4), 8).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[test]
    fn test_declared_output_is_extractable() {
        let graph = vggish().with_outputs(&["vggish/fc1/fc1_1/MatMul"]);
        let backend =
            GraphBackend::from_graph(Box::new(graph), "MatMul", options(4), 8).unwrap();
        assert!(backend.available_layers().contains("MatMul"));
    }

    #[test]
    fn test_explicit_input_node() {
        let graph = FakeGraph::new(&["net/images", "net/fc7"]);
        let mut opts = options(4);
        opts.input_node = Some("net/images".into());
        assert!(GraphBackend::from_graph(Box::new(graph), "fc7", opts, 8).is_ok());
    }

    #[test]
    fn test_extract_resizes_and_drops_padding() {
        let graph = vggish();
        let handle = graph.handle();
        let mut backend =
            GraphBackend::from_graph(Box::new(graph), "embedding", options(2), 8).unwrap();

        let features = backend.extract(&batch(3, 10)).unwrap();
        assert_eq!(features.dim(), (3, FAKE_FEATURE_DIM));
        assert_eq!(features[[0, 0]], 10.0);
        assert_eq!(features[[2, 3]], 13.0);
        assert_eq!(handle.last_input_shape(), Some(vec![8, 2, 2, 3]));
    }

    #[test]
    fn test_extract_is_deterministic() {
        let mut backend =
            GraphBackend::from_graph(Box::new(vggish()), "conv1", options(4), 4).unwrap();
        let batch = batch(2, 7);
        let first = backend.extract(&batch).unwrap();
        let second = backend.extract(&batch).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_bgr_reorders_channels() {
        let graph = vggish();
        let handle = graph.handle();
        let mut opts = options(1);
        opts.expects_bgr = true;
        let mut backend = GraphBackend::from_graph(Box::new(graph), "embedding", opts, 1).unwrap();

        let mut images = Array4::<u8>::zeros((1, 1, 1, 3));
        images[[0, 0, 0, 0]] = 1;
        images[[0, 0, 0, 2]] = 3;
        let batch = Batch::new(vec!["a".into()], vec![0.0], images).unwrap();
        backend.extract(&batch).unwrap();

        let input = handle.last_input().unwrap();
        assert_eq!(input[[0, 0, 0, 0]], 3.0);
        assert_eq!(input[[0, 0, 0, 2]], 1.0);
    }

    #[test]
    fn test_input_size_read_from_graph() {
        let graph = vggish().with_input_dims(&[None, Some(3), Some(5), Some(3)]);
        let handle = graph.handle();
        let opts = GraphOptions::default();
        let mut backend = GraphBackend::from_graph(Box::new(graph), "conv1", opts, 2).unwrap();

        assert_eq!(backend.capability().expected_input_shape, Some((3, 5, 3)));
        backend.extract(&batch(1, 4)).unwrap();
        assert_eq!(handle.last_input_shape(), Some(vec![2, 3, 5, 3]));
    }

    #[test]
    fn test_configured_size_overrides_declared() {
        let graph = vggish().with_input_dims(&[None, Some(3), Some(5), Some(3)]);
        let backend = GraphBackend::from_graph(Box::new(graph), "conv1", options(4), 2).unwrap();
        assert_eq!(backend.capability().expected_input_shape, Some((4, 4, 3)));
    }

    #[test]
    fn test_symbolic_input_falls_back_to_default() {
        let graph = vggish().with_input_dims(&[None, None, None, Some(3)]);
        let opts = GraphOptions::default();
        let backend = GraphBackend::from_graph(Box::new(graph), "conv1", opts, 1).unwrap();
        assert_eq!(
            backend.capability().expected_input_shape,
            Some((DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE, 3))
        );
    }

    #[test]
    fn test_pipeline_batch_larger_than_compiled() {
        let graph = FakeGraph::new(&["net/input", "net/fc7"]);
        let backend = GraphBackend::from_graph(Box::new(graph), "fc7", options(2), 2).unwrap();
        let stream: Vec<SampleRecord> = (0..3)
            .map(|i| {
                let image = Array3::from_elem((2, 2, 3), i as u8);
                SampleRecord::new(format!("s{}", i), i as f64, image)
            })
            .collect();

        let records: Vec<_> = crate::pipeline::run(stream, backend, 4)
            .unwrap()
            .collect::<MlResult<_>>()
            .unwrap();

        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.identifier, format!("s{}", i));
            assert_eq!(record.features[0], i as f32);
        }
    }
}
