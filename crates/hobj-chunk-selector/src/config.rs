//! Configuration for the heap chunk selector.

use hobj_config::{Config, ConfigError};
use serde::{Deserialize, Serialize};

/// Default block size in bytes.
pub const DEFAULT_BLK_SIZE: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSelectorConfig {
    /// Size of one block in bytes. Chunk capacities are tracked in blocks;
    /// this only converts them for `get_chunk_size`.
    #[serde(default = "default_blk_size")]
    pub blk_size: u32,

    /// Chunks whose defragmentable block count is at or below this value are
    /// dropped from the defrag index when they are released or reclaimed.
    /// Hot-updatable.
    #[serde(default)]
    pub defrag_min_blks: u64,
}

fn default_blk_size() -> u32 {
    DEFAULT_BLK_SIZE
}

impl Default for ChunkSelectorConfig {
    fn default() -> Self {
        Self {
            blk_size: default_blk_size(),
            defrag_min_blks: 0,
        }
    }
}

impl Config for ChunkSelectorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.blk_size == 0 || !self.blk_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "blk_size must be a non-zero power of two, got {}",
                self.blk_size
            )));
        }
        Ok(())
    }

    fn hot_update(&mut self, other: &Self) {
        self.defrag_min_blks = other.defrag_min_blks;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChunkSelectorConfig::default();
        assert_eq!(config.blk_size, 4096);
        assert_eq!(config.defrag_min_blks, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_blk_size() {
        let mut config = ChunkSelectorConfig::default();
        config.blk_size = 0;
        assert!(config.validate().is_err());
        config.blk_size = 3000;
        assert!(config.validate().is_err());
        config.blk_size = 512;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hot_update_keeps_blk_size() {
        let mut live = ChunkSelectorConfig::default();
        let incoming = ChunkSelectorConfig {
            blk_size: 512,
            defrag_min_blks: 16,
        };
        live.hot_update(&incoming);
        assert_eq!(live.blk_size, 4096);
        assert_eq!(live.defrag_min_blks, 16);
    }

    #[test]
    fn test_from_toml_partial() {
        let value: toml::Value = toml::Value::Table(toml::from_str("defrag_min_blks = 8").unwrap());
        let config = ChunkSelectorConfig::from_toml(&value).unwrap();
        assert_eq!(config.blk_size, DEFAULT_BLK_SIZE);
        assert_eq!(config.defrag_min_blks, 8);
    }

    #[test]
    fn test_serde_json_roundtrip() {
        let config = ChunkSelectorConfig {
            blk_size: 8192,
            defrag_min_blks: 2,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: ChunkSelectorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
