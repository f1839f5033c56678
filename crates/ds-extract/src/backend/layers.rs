//! Layer registries
//!
//! A [`LayerRegistry`] maps extraction labels to graph node names. It is built
//! once when a backend loads, either from declared metadata or by discovering
//! candidate nodes in a graph, and is the only place layer names are resolved.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::error::{MlError, MlResult};

/// Trailing node name segments that never denote an extraction point
pub const IGNORED_NODE_SUFFIXES: &[&str] = &[
    "weights",
    "bias",
    "MatMul",
    "BiasAdd",
    "read",
    "size",
    "prob",
    "stack",
    "strided_slice",
    "shape",
    "axis",
    "input",
    "concat",
    "Conv2D",
    "split",
    "norm",
];

/// Label to node mapping for one loaded model
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerRegistry {
    layers: BTreeMap<String, String>,
}

impl LayerRegistry {
    /// Registry from declared (label, node) pairs
    pub fn from_declared<I, L, N>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (L, N)>,
        L: Into<String>,
        N: Into<String>,
    {
        Self {
            layers: pairs
                .into_iter()
                .map(|(label, node)| (label.into(), node.into()))
                .collect(),
        }
    }

    /// Registry where every label is its own node name
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_declared(names.into_iter().map(|name| {
            let name = name.into();
            (name.clone(), name)
        }))
    }

    /// Discover extraction points among graph node names
    ///
    /// Nodes whose trailing segment is a known non-output operation are
    /// skipped. Each remaining node is labelled by its trailing segment; a
    /// label shared by several nodes is not registered and the full node
    /// names are registered in its place.
    pub fn discover(node_names: &[String]) -> Self {
        let mut by_label: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for name in node_names.iter().filter(|name| !is_ignored_node(name)) {
            by_label.entry(trailing_segment(name)).or_default().push(name);
        }

        let mut layers = BTreeMap::new();
        for (label, nodes) in by_label {
            if let [node] = nodes.as_slice() {
                layers.insert(label.to_string(), node.to_string());
            } else {
                log::debug!(
                    "Layer label '{}' is shared by {} nodes, registering full names",
                    label,
                    nodes.len()
                );
                for node in nodes {
                    layers.insert(node.to_string(), node.to_string());
                }
            }
        }

        Self { layers }
    }

    /// Register declared graph outputs the name filter may have dropped
    ///
    /// Each node is labelled by its trailing segment unless that label is
    /// already taken by another node, in which case its full name is used.
    pub fn include_outputs(&mut self, outputs: &[String]) {
        for node in outputs {
            if self.layers.values().any(|known| known == node) {
                continue;
            }
            let label = trailing_segment(node);
            let label = if self.layers.contains_key(label) {
                node.as_str()
            } else {
                label
            };
            log::debug!("Registering declared output '{}' as '{}'", node, label);
            self.layers.insert(label.to_string(), node.clone());
        }
    }

    /// Sorted extraction labels
    pub fn labels(&self) -> BTreeSet<String> {
        self.layers.keys().cloned().collect()
    }

    /// Number of registered layers
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Check if no layer is registered
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Check if label is registered
    pub fn contains(&self, layer: &str) -> bool {
        self.layers.contains_key(layer)
    }

    /// Node name for label, or a configuration error listing all labels
    pub fn resolve(&self, layer: &str) -> MlResult<&str> {
        if let Some(node) = self.layers.get(layer) {
            return Ok(node);
        }

        let candidates: Vec<String> = self
            .layers
            .keys()
            .filter(|label| trailing_segment(label) == layer)
            .cloned()
            .collect();
        if !candidates.is_empty() {
            return Err(MlError::ambiguous_layer(layer, candidates, self.layers.keys().cloned()));
        }

        Err(MlError::unknown_layer(layer, self.layers.keys().cloned()))
    }

    /// Fail if a registered node does not exist in the graph
    pub fn verify_against(&self, node_names: &[String], model: &str) -> MlResult<()> {
        let present: HashSet<&str> = node_names.iter().map(String::as_str).collect();
        for (label, node) in &self.layers {
            if !present.contains(node.as_str()) {
                return Err(MlError::LayerNotInModel {
                    layer: format!("{} ({})", label, node),
                    model: model.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Last `/`-separated segment of a node name
pub fn trailing_segment(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// First `/`-separated segment of a node name
pub fn leading_segment(name: &str) -> &str {
    name.split('/').next().unwrap_or(name)
}

/// Strip a `_<digits>` duplicate counter (`strided_slice_3` -> `strided_slice`)
fn base_op_name(segment: &str) -> &str {
    match segment.rsplit_once('_') {
        Some((base, counter))
            if !base.is_empty()
                && !counter.is_empty()
                && counter.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base
        }
        _ => segment,
    }
}

/// Check if node name denotes a parameter or plumbing operation
pub fn is_ignored_node(name: &str) -> bool {
    let base = base_op_name(trailing_segment(name));
    IGNORED_NODE_SUFFIXES.iter().any(|suffix| {
        base == *suffix
            || base
                .strip_suffix(suffix)
                .is_some_and(|head| head.ends_with('_'))
    })
}
