//! Features Module - Flow aggregation and feature extraction
//!
//! - `layout.rs` - versioned feature schema (single source of truth)
//! - `vector.rs` - `FeatureVector` / `FlowFeatures`
//! - `flow.rs` - flow stats, bounded flow table, per-source windows
//! - `extract.rs` - the extractor itself

pub mod layout;
pub mod vector;
pub mod flow;
pub mod extract;

pub use layout::{layout_hash, FEATURE_COUNT, FEATURE_LAYOUT, FEATURE_VERSION};
pub use vector::{FeatureVector, FlowFeatures};
pub use extract::{ExtractorConfig, FeatureExtractor};
