//! Feature Layout - Centralized Feature Definition
//!
//! **CRITICAL: This file controls the feature schema**
//!
//! ## Rules (NEVER break these):
//! 1. Add feature → increment FEATURE_VERSION
//! 2. Change order → increment FEATURE_VERSION
//! 3. Remove feature → increment FEATURE_VERSION
//!
//! Profiles and the learned model are stamped with the layout hash; a
//! mismatch on load means the stored statistics describe different features
//! and must be rebuilt, not reinterpreted.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

// ============================================================================
// FEATURE VERSION
// ============================================================================

/// Current feature layout version
pub const FEATURE_VERSION: u8 = 1;

// ============================================================================
// FEATURE LAYOUT (Authoritative source)
// ============================================================================

/// Feature names in exact vector order. SINGLE SOURCE OF TRUTH.
pub const FEATURE_LAYOUT: &[&str] = &[
    // === Flow rates (0-1) ===
    "pkt_rate",          // 0: packets per second over the flow/window
    "byte_rate",         // 1: bytes per second over the flow/window

    // === Packet sizes (2-3) ===
    "mean_pkt_size",     // 2: mean packet length in bytes
    "pkt_size_std",      // 3: packet length standard deviation

    // === Flow shape (4-6) ===
    "duration_secs",     // 4: flow duration at emission time
    "syn_ratio",         // 5: SYN packets / total packets
    "fin_rst_ratio",     // 6: FIN+RST packets / total packets

    // === Source host window (7-10) ===
    "unique_dst_ports",  // 7: distinct destination ports this source hit
    "dst_port_entropy",  // 8: Shannon entropy of destination ports
    "dst_host_count",    // 9: distinct destination hosts this source hit
    "protocol_entropy",  // 10: Shannon entropy of protocols used

    // === DNS (11) ===
    "mean_dns_query_len", // 11: mean decoded query length on UDP/53 flows

    // === Time (12) ===
    "hour_of_day",       // 12: UTC hour normalized to [0,1)
];

/// Total number of features. Must match FEATURE_LAYOUT.len()!
pub const FEATURE_COUNT: usize = 13;

// ============================================================================
// LAYOUT HASH
// ============================================================================

/// CRC32 over version + ordered feature names; detects layout drift at
/// runtime when stored profiles or models are loaded.
pub fn layout_hash() -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&[FEATURE_VERSION]);
    for name in FEATURE_LAYOUT {
        hasher.update(name.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize()
}

// ============================================================================
// LAYOUT VALIDATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutMismatchError {
    pub expected_version: u8,
    pub expected_hash: u32,
    pub actual_version: u8,
    pub actual_hash: u32,
}

impl std::fmt::Display for LayoutMismatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "feature layout mismatch: expected v{} (hash {:08x}), got v{} (hash {:08x})",
            self.expected_version, self.expected_hash, self.actual_version, self.actual_hash
        )
    }
}

impl std::error::Error for LayoutMismatchError {}

pub fn validate_layout(version: u8, hash: u32) -> Result<(), LayoutMismatchError> {
    let current = layout_hash();
    if version != FEATURE_VERSION || hash != current {
        return Err(LayoutMismatchError {
            expected_version: FEATURE_VERSION,
            expected_hash: current,
            actual_version: version,
            actual_hash: hash,
        });
    }
    Ok(())
}

// ============================================================================
// FEATURE INDEX LOOKUP
// ============================================================================

/// Get feature index by name (O(n) but features are few)
pub fn feature_index(name: &str) -> Option<usize> {
    FEATURE_LAYOUT.iter().position(|&n| n == name)
}

pub fn feature_name(index: usize) -> Option<&'static str> {
    FEATURE_LAYOUT.get(index).copied()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_count() {
        assert_eq!(FEATURE_COUNT, 13);
        assert_eq!(FEATURE_LAYOUT.len(), FEATURE_COUNT);
    }

    #[test]
    fn test_layout_hash_consistency() {
        assert_eq!(layout_hash(), layout_hash());
        assert_ne!(layout_hash(), 0);
    }

    #[test]
    fn test_validate_layout() {
        assert!(validate_layout(FEATURE_VERSION, layout_hash()).is_ok());
        assert!(validate_layout(FEATURE_VERSION + 1, layout_hash()).is_err());
        assert!(validate_layout(FEATURE_VERSION, layout_hash() ^ 1).is_err());
    }

    #[test]
    fn test_feature_index() {
        assert_eq!(feature_index("pkt_rate"), Some(0));
        assert_eq!(feature_index("mean_dns_query_len"), Some(11));
        assert_eq!(feature_index("hour_of_day"), Some(12));
        assert_eq!(feature_index("nonexistent"), None);
        assert_eq!(feature_name(0), Some("pkt_rate"));
        assert_eq!(feature_name(100), None);
    }
}
