//! Log Configuration
//!
//! Process-local settings fixed at log construction time.
//!
//! ## SegmentConfig
//!
//! Controls when the active segment rolls and where a fresh log starts:
//!
//! - **max_store_bytes**: roll the segment once its store reaches this many
//!   bytes (default: 1024)
//! - **max_index_bytes**: roll the segment once its index reaches this many
//!   bytes; this is also the size the index file is mapped at while open
//!   (default: 1024)
//! - **initial_offset**: base offset of the first segment when the log
//!   directory is empty (default: 0)
//!
//! ## Usage
//!
//! ```ignore
//! use logmesh_core::{LogConfig, SegmentConfig};
//!
//! // Tiny segments for tests: one index entry per segment
//! let config = LogConfig {
//!     segment: SegmentConfig {
//!         max_index_bytes: 12,
//!         ..Default::default()
//!     },
//! };
//! ```

use serde::{Deserialize, Serialize};

/// Width of one index entry: u32 relative offset + u64 store position.
pub const ENTRY_WIDTH: u64 = 12;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub segment: SegmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Maximum store file size in bytes before the segment rolls.
    #[serde(default = "default_max_bytes")]
    pub max_store_bytes: u64,

    /// Maximum index file size in bytes before the segment rolls. The index
    /// file is pre-grown to this size while the segment is open.
    #[serde(default = "default_max_bytes")]
    pub max_index_bytes: u64,

    /// Base offset of the first segment of a fresh log.
    #[serde(default)]
    pub initial_offset: u64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: default_max_bytes(),
            max_index_bytes: default_max_bytes(),
            initial_offset: 0,
        }
    }
}

fn default_max_bytes() -> u64 {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.segment.max_store_bytes, 1024);
        assert_eq!(config.segment.max_index_bytes, 1024);
        assert_eq!(config.segment.initial_offset, 0);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: LogConfig =
            serde_json::from_str(r#"{"segment":{"max_index_bytes":12}}"#).unwrap();
        assert_eq!(config.segment.max_index_bytes, 12);
        assert_eq!(config.segment.max_store_bytes, 1024);
        assert_eq!(config.segment.initial_offset, 0);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = LogConfig {
            segment: SegmentConfig {
                max_store_bytes: 4096,
                max_index_bytes: 120,
                initial_offset: 7,
            },
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: LogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.segment.max_store_bytes, 4096);
        assert_eq!(back.segment.max_index_bytes, 120);
        assert_eq!(back.segment.initial_offset, 7);
    }
}
