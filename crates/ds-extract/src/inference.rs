//! ONNX graph runtime abstraction
//!
//! Backends talk to computation graphs through two narrow traits:
//! [`ModelGraph`] for introspection of a loaded but not yet specialized graph,
//! and [`CompiledGraph`] for a plan fixed to one input node, one output node
//! and one input shape. [`TractGraph`] implements both on top of tract
//! (pure Rust, CPU only).

use std::path::{Path, PathBuf};

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use tract_onnx::prelude::*;
use tract_onnx::tract_hir::infer::GenericFactoid;

use crate::error::{MlError, MlResult};

/// Preferred compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use GPU `device_index` when the runtime supports it
    #[default]
    Gpu,
    /// Always run on CPU
    Cpu,
}

/// Device a backend actually runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedDevice {
    Cpu,
    Gpu(usize),
}

impl ResolvedDevice {
    /// Check if running on GPU
    pub fn is_gpu(&self) -> bool {
        matches!(self, ResolvedDevice::Gpu(_))
    }
}

/// Configuration for graph compilation
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Preferred device
    pub device: DevicePreference,
    /// Device ID for GPU execution
    pub device_index: usize,
    /// Batch size the plan is compiled for
    pub batch_size: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: DevicePreference::Gpu,
            device_index: 0,
            batch_size: ds_core::DEFAULT_BATCH_SIZE,
        }
    }
}

impl InferenceConfig {
    /// Resolve the device for a CPU-only runtime
    pub fn resolve_cpu_only(&self, runtime: &str) -> ResolvedDevice {
        if self.device == DevicePreference::Gpu {
            log::warn!(
                "GPU {} requested but the {} runtime runs on CPU only, falling back to CPU",
                self.device_index,
                runtime
            );
        }
        ResolvedDevice::Cpu
    }
}

/// Loaded computation graph, before input/output specialization
pub trait ModelGraph: Send {
    /// Human readable origin (file path or key)
    fn location(&self) -> String;

    /// Names of all computation nodes in graph order
    fn node_names(&self) -> Vec<String>;

    /// Names of the graph's declared input nodes
    fn declared_inputs(&self) -> Vec<String>;

    /// Names of the graph's declared output nodes
    fn declared_outputs(&self) -> Vec<String>;

    /// Declared dimensions of an input node, `None` for symbolic axes
    ///
    /// Returns `None` when the node is unknown or its rank is not declared.
    fn input_dims(&self, node: &str) -> Option<Vec<Option<usize>>>;

    /// Fix input node, output node and input shape, and build a runnable plan
    fn compile(
        &self,
        input: &str,
        output: &str,
        input_shape: &[usize],
    ) -> MlResult<Box<dyn CompiledGraph>>;
}

/// Runnable plan with fixed input shape
pub trait CompiledGraph: Send {
    /// Run one forward pass
    fn run(&self, input: ArrayD<f32>) -> MlResult<ArrayD<f32>>;

    /// Output shape if statically known
    fn output_shape(&self) -> Option<Vec<usize>>;
}

/// ONNX graph loaded with tract
pub struct TractGraph {
    model: InferenceModel,
    path: PathBuf,
}

impl TractGraph {
    /// Load ONNX graph from disk
    pub fn load<P: AsRef<Path>>(model_path: P) -> MlResult<Self> {
        let path = model_path.as_ref();

        if !path.exists() {
            return Err(MlError::ModelNotFound {
                path: path.display().to_string(),
            });
        }

        let model = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(|e| MlError::ModelLoadFailed {
                reason: format!("{}: {}", path.display(), e),
            })?;

        log::info!(
            "Loaded graph {} ({} nodes)",
            path.display(),
            model.nodes().len()
        );

        Ok(Self {
            model,
            path: path.to_path_buf(),
        })
    }
}

impl ModelGraph for TractGraph {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn node_names(&self) -> Vec<String> {
        self.model.nodes().iter().map(|node| node.name.clone()).collect()
    }

    fn declared_inputs(&self) -> Vec<String> {
        self.model
            .input_outlets()
            .map(|outlets| {
                outlets
                    .iter()
                    .map(|outlet| self.model.node(outlet.node).name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn declared_outputs(&self) -> Vec<String> {
        self.model
            .output_outlets()
            .map(|outlets| {
                outlets
                    .iter()
                    .map(|outlet| self.model.node(outlet.node).name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn input_dims(&self, node: &str) -> Option<Vec<Option<usize>>> {
        let node = self.model.node_by_name(node).ok()?;
        let shape = &node.outputs.first()?.fact.shape;
        if shape.is_open() {
            return None;
        }
        Some(
            shape
                .dims()
                .map(|dim| match dim {
                    GenericFactoid::Only(d) => {
                        d.to_i64().ok().and_then(|v| usize::try_from(v).ok())
                    }
                    GenericFactoid::Any => None,
                })
                .collect(),
        )
    }

    fn compile(
        &self,
        input: &str,
        output: &str,
        input_shape: &[usize],
    ) -> MlResult<Box<dyn CompiledGraph>> {
        let load_err = |e: TractError| MlError::ModelLoadFailed {
            reason: format!("{} ({} -> {}): {}", self.path.display(), input, output, e),
        };

        let mut model = self.model.clone();
        model.set_input_names([input]).map_err(load_err)?;
        model.set_output_names([output]).map_err(load_err)?;
        model
            .set_input_fact(0, f32::fact(input_shape.to_vec()).into())
            .map_err(load_err)?;

        let plan = model
            .into_optimized()
            .map_err(load_err)?
            .into_runnable()
            .map_err(load_err)?;

        log::debug!(
            "Compiled {} for input {:?} ({} -> {})",
            self.path.display(),
            input_shape,
            input,
            output
        );

        Ok(Box::new(InferenceEngine {
            tract_model: TractModel { model: plan },
            input_shape: input_shape.to_vec(),
        }))
    }
}

/// Tract plan wrapper
struct TractModel {
    model: tract_onnx::prelude::SimplePlan<
        tract_onnx::prelude::TypedFact,
        Box<dyn tract_onnx::prelude::TypedOp>,
        tract_onnx::prelude::Graph<
            tract_onnx::prelude::TypedFact,
            Box<dyn tract_onnx::prelude::TypedOp>,
        >,
    >,
}

/// Compiled tract plan
pub struct InferenceEngine {
    tract_model: TractModel,
    input_shape: Vec<usize>,
}

impl InferenceEngine {
    /// Input shape the plan was compiled for
    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }
}

impl CompiledGraph for InferenceEngine {
    fn run(&self, input: ArrayD<f32>) -> MlResult<ArrayD<f32>> {
        if input.shape() != self.input_shape.as_slice() {
            return Err(MlError::InvalidInputShape {
                expected: format!("{:?}", self.input_shape),
                got: format!("{:?}", input.shape()),
            });
        }

        let tensor: Tensor = input.into();
        let outputs = self
            .tract_model
            .model
            .run(tvec!(tensor.into()))
            .map_err(|e| MlError::from_runtime(e.to_string()))?;

        let output = outputs.first().ok_or_else(|| MlError::InferenceFailed {
            reason: "No output from model".into(),
        })?;

        let view = output
            .to_array_view::<f32>()
            .map_err(|e| MlError::from_runtime(e.to_string()))?;

        Ok(view.to_owned())
    }

    fn output_shape(&self) -> Option<Vec<usize>> {
        let fact = self.tract_model.model.model().output_fact(0).ok()?;
        fact.shape.as_concrete().map(|shape| shape.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_model_is_configuration_error() {
        let result = TractGraph::load("/nonexistent/model.onnx");
        match result {
            Err(err @ MlError::ModelNotFound { .. }) => {
                assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("loading a missing model must fail"),
        }
    }

    #[test]
    fn test_cpu_only_resolution() {
        let config = InferenceConfig::default();
        assert_eq!(config.resolve_cpu_only("tract"), ResolvedDevice::Cpu);

        let config = InferenceConfig {
            device: DevicePreference::Cpu,
            ..Default::default()
        };
        assert!(!config.resolve_cpu_only("tract").is_gpu());
    }

    #[test]
    fn test_device_preference_serde() {
        let pref: DevicePreference = serde_json::from_str("\"cpu\"").unwrap();
        assert_eq!(pref, DevicePreference::Cpu);
        assert_eq!(DevicePreference::default(), DevicePreference::Gpu);
    }
}
