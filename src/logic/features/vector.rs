//! Feature Vector - Versioned fixed-schema input to detection
//!
//! Every vector carries the layout version and hash so downstream
//! consumers (profiles, learned model) can reject incompatible data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::logic::capture::FlowRef;
use super::layout::{
    layout_hash, validate_layout, LayoutMismatchError, FEATURE_COUNT, FEATURE_LAYOUT,
    FEATURE_VERSION,
};

// ============================================================================
// FEATURE VECTOR
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureVector {
    pub version: u8,
    pub layout_hash: u32,
    pub values: [f32; FEATURE_COUNT],
}

impl FeatureVector {
    pub fn new() -> Self {
        Self {
            version: FEATURE_VERSION,
            layout_hash: layout_hash(),
            values: [0.0; FEATURE_COUNT],
        }
    }

    pub fn from_values(values: [f32; FEATURE_COUNT]) -> Self {
        Self {
            version: FEATURE_VERSION,
            layout_hash: layout_hash(),
            values,
        }
    }

    pub fn get(&self, index: usize) -> Option<f32> {
        self.values.get(index).copied()
    }

    pub fn get_by_name(&self, name: &str) -> Option<f32> {
        super::layout::feature_index(name).and_then(|i| self.get(i))
    }

    pub fn set(&mut self, index: usize, value: f32) {
        if index < FEATURE_COUNT {
            self.values[index] = value;
        }
    }

    pub fn validate(&self) -> Result<(), LayoutMismatchError> {
        validate_layout(self.version, self.layout_hash)
    }

    /// Named values for log/export payloads
    pub fn to_log_entry(&self) -> serde_json::Value {
        serde_json::json!({
            "feature_version": self.version,
            "layout_hash": self.layout_hash,
            "named_values": FEATURE_LAYOUT.iter()
                .zip(self.values.iter())
                .map(|(name, value)| (name.to_string(), *value))
                .collect::<std::collections::HashMap<_, _>>(),
        })
    }
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// FLOW FEATURES
// ============================================================================

/// What actually moves between pipeline stages: the vector plus the flow it
/// was derived from, so scores and incidents stay attributable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowFeatures {
    pub flow: FlowRef,
    pub vector: FeatureVector,
    pub captured_at: DateTime<Utc>,
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_vector_is_valid() {
        let v = FeatureVector::new();
        assert_eq!(v.version, FEATURE_VERSION);
        assert!(v.validate().is_ok());
        assert_eq!(v.values.len(), FEATURE_COUNT);
    }

    #[test]
    fn test_get_set_by_name() {
        let mut v = FeatureVector::new();
        v.set(0, 42.0);
        assert_eq!(v.get_by_name("pkt_rate"), Some(42.0));
        assert_eq!(v.get_by_name("nonexistent"), None);
    }

    #[test]
    fn test_log_entry_names_features() {
        let v = FeatureVector::from_values([1.0; FEATURE_COUNT]);
        let entry = v.to_log_entry();
        assert_eq!(entry["named_values"]["pkt_rate"], 1.0);
    }
}
