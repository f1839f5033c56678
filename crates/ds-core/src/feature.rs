//! Extracted feature records and backend descriptors

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Flattened layer output for one sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    /// Identifier of the originating sample
    pub identifier: String,
    /// Timestamp of the originating sample
    pub timestamp: f64,
    /// Feature vector of the backend's fixed dimension
    pub features: Vec<f32>,
}

impl FeatureRecord {
    /// Create new feature record
    pub fn new(identifier: impl Into<String>, timestamp: f64, features: Vec<f32>) -> Self {
        Self {
            identifier: identifier.into(),
            timestamp,
            features,
        }
    }

    /// Feature dimension
    pub fn dim(&self) -> usize {
        self.features.len()
    }
}

/// What a loaded backend can extract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendCapability {
    /// Legal extraction points, sorted
    pub available_layers: BTreeSet<String>,
    /// Layer the backend extracts from
    pub selected_layer: String,
    /// Input shape the model expects per sample (H, W, C), if declared
    pub expected_input_shape: Option<(usize, usize, usize)>,
}

impl BackendCapability {
    /// Create descriptor
    pub fn new(
        available_layers: impl IntoIterator<Item = String>,
        selected_layer: impl Into<String>,
        expected_input_shape: Option<(usize, usize, usize)>,
    ) -> Self {
        Self {
            available_layers: available_layers.into_iter().collect(),
            selected_layer: selected_layer.into(),
            expected_input_shape,
        }
    }

    /// Whether the selected layer is one of the available layers
    pub fn is_valid(&self) -> bool {
        self.available_layers.contains(&self.selected_layer)
    }

    /// Sorted list of valid layer names
    pub fn sorted_layers(&self) -> Vec<String> {
        self.available_layers.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_validity() {
        let cap = BackendCapability::new(
            vec!["fc7".to_string(), "fc6".to_string(), "conv5".to_string()],
            "fc7",
            Some((227, 227, 3)),
        );
        assert!(cap.is_valid());
        assert_eq!(cap.sorted_layers(), vec!["conv5", "fc6", "fc7"]);

        let cap = BackendCapability::new(vec!["fc6".to_string()], "fc8", None);
        assert!(!cap.is_valid());
    }

    #[test]
    fn test_feature_record_serializes() {
        let record = FeatureRecord::new("a.wav", 1.5, vec![0.25, 0.5]);
        assert_eq!(record.dim(), 2);

        let json = serde_json::to_string(&record).unwrap();
        let back: FeatureRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
