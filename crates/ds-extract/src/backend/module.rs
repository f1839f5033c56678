//! Prepackaged module backend
//!
//! A module is a directory holding a graph and a `module.json` manifest that
//! declares the input node, the expected image size and the named outputs of
//! its feature signature. Nothing is inferred from node names.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use ds_core::{BackendCapability, Batch};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::layers::LayerRegistry;
use super::plan::FixedBatchPlan;
use super::{BackendKind, ExtractionBackend};
use crate::error::{MlError, MlResult};
use crate::inference::{InferenceConfig, ModelGraph, TractGraph};
use crate::preprocess;

/// Manifest file name inside a module directory
pub const MANIFEST_FILE: &str = "module.json";

/// Declared module metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleManifest {
    /// Graph file, relative to the module directory
    pub graph: PathBuf,
    /// Input node name
    pub input: String,
    /// Expected image size [height, width]
    pub image_size: [usize; 2],
    /// Signature the outputs belong to
    #[serde(default = "default_signature")]
    pub signature: String,
    /// Output label -> node name
    pub outputs: BTreeMap<String, String>,
    /// Factor applied to [0, 255] pixel values
    #[serde(default = "default_pixel_scale")]
    pub pixel_scale: f32,
}

fn default_signature() -> String {
    "image_feature_vector".to_string()
}

fn default_pixel_scale() -> f32 {
    1.0
}

impl ModuleManifest {
    /// Read `module.json` from a module directory
    pub fn read(directory: &Path) -> MlResult<Self> {
        let path = directory.join(MANIFEST_FILE);
        if !path.is_file() {
            return Err(MlError::ArtifactMissing {
                directory: directory.display().to_string(),
                what: MANIFEST_FILE.to_string(),
            });
        }

        let text = fs::read_to_string(&path)?;
        let manifest: Self = serde_json::from_str(&text).map_err(|e| MlError::ModelLoadFailed {
            reason: format!("{}: {}", path.display(), e),
        })?;

        if manifest.outputs.is_empty() {
            return Err(MlError::ModelLoadFailed {
                reason: format!("{} declares no outputs", path.display()),
            });
        }
        Ok(manifest)
    }
}

/// Backend over a prepackaged module
pub struct ModuleBackend {
    graph: Box<dyn ModelGraph>,
    manifest: ModuleManifest,
    registry: LayerRegistry,
    layer: String,
    plan: FixedBatchPlan,
}

impl ModuleBackend {
    /// Load module from `directory`
    pub fn load(directory: &Path, layer: &str, inference: &InferenceConfig) -> MlResult<Self> {
        inference.resolve_cpu_only("tract");
        let manifest = ModuleManifest::read(directory)?;
        let graph = TractGraph::load(directory.join(&manifest.graph))?;
        Self::from_graph(Box::new(graph), manifest, layer, inference.batch_size)
    }

    /// Build backend over an already loaded module graph
    pub fn from_graph(
        graph: Box<dyn ModelGraph>,
        manifest: ModuleManifest,
        layer: &str,
        batch_size: usize,
    ) -> MlResult<Self> {
        let nodes = graph.node_names();
        let registry = LayerRegistry::from_declared(manifest.outputs.clone());
        registry.verify_against(&nodes, &graph.location())?;
        let output = registry.resolve(layer)?.to_string();

        if !nodes.contains(&manifest.input) {
            return Err(MlError::LayerNotInModel {
                layer: manifest.input.clone(),
                model: graph.location(),
            });
        }

        let [height, width] = manifest.image_size;
        let plan = FixedBatchPlan::compile(
            graph.as_ref(),
            &manifest.input,
            &output,
            (height, width, 3),
            batch_size,
        )?;

        log::info!(
            "Module backend ready: {} signature '{}' output '{}' ({}x{})",
            graph.location(),
            manifest.signature,
            layer,
            height,
            width
        );

        Ok(Self {
            graph,
            manifest,
            registry,
            layer: layer.to_string(),
            plan,
        })
    }

    /// Declared module metadata
    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }
}

impl std::fmt::Debug for ModuleBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleBackend")
            .field("location", &self.graph.location())
            .field("layer", &self.layer)
            .finish()
    }
}

impl ExtractionBackend for ModuleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Module
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
        let [height, width] = self.manifest.image_size;
        let images = preprocess::resize_batch(batch.images().view(), height, width)?;

        // sources arrive channel-reversed
        let mut input = preprocess::to_float(images.view());
        preprocess::reverse_channels(&mut input);
        if self.manifest.pixel_scale != 1.0 {
            let scale = self.manifest.pixel_scale;
            input.mapv_inplace(|v| v * scale);
        }

        self.plan.run(input)
    }
}
