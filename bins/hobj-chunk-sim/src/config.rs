use std::collections::HashSet;

use hobj_chunk_selector::ChunkSelectorConfig;
use hobj_config::{Config, ConfigError};
use hobj_logging::LogConfig;
use serde::{Deserialize, Serialize};

/// One simulated physical device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub dev_id: u32,
    pub num_chunks: u32,
    pub chunk_blks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default = "default_num_pgs")]
    pub num_pgs: u16,

    /// Requested size of every PG, in blocks.
    #[serde(default = "default_pg_size_blks")]
    pub pg_size_blks: u64,

    #[serde(default = "default_writes_per_pg")]
    pub writes_per_pg: u32,

    /// Writes are uniformly sized in `1..=max_write_blks`.
    #[serde(default = "default_max_write_blks")]
    pub max_write_blks: u64,

    /// Chance, in percent, that a step deletes an earlier blob instead of
    /// writing a new one.
    #[serde(default = "default_delete_percent")]
    pub delete_percent: u32,
}

fn default_num_pgs() -> u16 {
    8
}

fn default_pg_size_blks() -> u64 {
    1024
}

fn default_writes_per_pg() -> u32 {
    200
}

fn default_max_write_blks() -> u64 {
    16
}

fn default_delete_percent() -> u32 {
    25
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_pgs: default_num_pgs(),
            pg_size_blks: default_pg_size_blks(),
            writes_per_pg: default_writes_per_pg(),
            max_write_blks: default_max_write_blks(),
            delete_percent: default_delete_percent(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub selector: ChunkSelectorConfig,

    #[serde(default = "default_devices")]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub workload: WorkloadConfig,
}

fn default_devices() -> Vec<DeviceConfig> {
    (0..2)
        .map(|dev_id| DeviceConfig {
            dev_id,
            num_chunks: 32,
            chunk_blks: 256,
        })
        .collect()
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            selector: ChunkSelectorConfig::default(),
            devices: default_devices(),
            workload: WorkloadConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn total_chunks(&self) -> u64 {
        self.devices.iter().map(|d| u64::from(d.num_chunks)).sum()
    }

    /// Block count of every chunk; devices must agree on it.
    pub fn chunk_blks(&self) -> u64 {
        self.devices.first().map(|d| d.chunk_blks).unwrap_or(0)
    }
}

impl Config for SimConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.selector.validate()?;

        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("at least one device is required".into()));
        }
        let mut seen = HashSet::new();
        for dev in &self.devices {
            if !seen.insert(dev.dev_id) {
                return Err(ConfigError::Invalid(format!("device {} listed twice", dev.dev_id)));
            }
            if dev.num_chunks == 0 || dev.chunk_blks == 0 {
                return Err(ConfigError::Invalid(format!(
                    "device {} needs a positive chunk count and chunk size",
                    dev.dev_id
                )));
            }
            if dev.chunk_blks != self.chunk_blks() {
                return Err(ConfigError::Invalid(
                    "all devices must use the same chunk size".into(),
                ));
            }
        }
        if self.total_chunks() > u64::from(u16::MAX) + 1 {
            return Err(ConfigError::Invalid(format!(
                "{} chunks exceed the chunk id space",
                self.total_chunks()
            )));
        }

        let w = &self.workload;
        if w.pg_size_blks == 0 {
            return Err(ConfigError::Invalid("workload.pg_size_blks must be positive".into()));
        }
        if w.max_write_blks == 0 || w.max_write_blks > self.chunk_blks() {
            return Err(ConfigError::Invalid(format!(
                "workload.max_write_blks must be in 1..={}",
                self.chunk_blks()
            )));
        }
        if w.delete_percent > 100 {
            return Err(ConfigError::Invalid("workload.delete_percent is a percentage".into()));
        }
        Ok(())
    }

    /// Only the selector's hot fields change mid-run; the layout and the
    /// workload are fixed once chunks are registered.
    fn hot_update(&mut self, other: &Self) {
        self.selector.hot_update(&other.selector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hobj_config::ConfigManager;

    #[test]
    fn test_default_config_is_valid() {
        let config = SimConfig::default();
        config.validate().unwrap();
        assert_eq!(config.total_chunks(), 64);
        assert_eq!(config.chunk_blks(), 256);
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            [log]
            level = "debug"

            [selector]
            defrag_min_blks = 4

            [[devices]]
            dev_id = 3
            num_chunks = 10
            chunk_blks = 128

            [workload]
            num_pgs = 2
            pg_size_blks = 512
        "#;
        let value = toml::Value::Table(toml::from_str(text).unwrap());
        let config = SimConfig::from_toml(&value).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.selector.defrag_min_blks, 4);
        assert_eq!(config.selector.blk_size, 4096);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].dev_id, 3);
        assert_eq!(config.workload.num_pgs, 2);
        assert_eq!(config.workload.writes_per_pg, 200);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&SimConfig::default()).unwrap();
        let parsed: SimConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, SimConfig::default());
    }

    #[test]
    fn test_reload_applies_only_selector_hot_fields() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "[selector]\ndefrag_min_blks = 4\n[workload]\nnum_pgs = 2\n",
        )
        .unwrap();
        let mgr = ConfigManager::<SimConfig>::load(file.path()).unwrap();
        assert_eq!(mgr.path(), Some(file.path()));

        std::fs::write(
            file.path(),
            "[selector]\ndefrag_min_blks = 32\nblk_size = 8192\n[workload]\nnum_pgs = 5\n",
        )
        .unwrap();
        mgr.reload().unwrap();
        let config = mgr.get();
        assert_eq!(config.selector.defrag_min_blks, 32);
        assert_eq!(config.selector.blk_size, 4096);
        assert_eq!(config.workload.num_pgs, 2);
    }

    #[test]
    fn test_validate_rejects_bad_layouts() {
        let mut config = SimConfig::default();
        config.devices[1].chunk_blks = 512;
        assert!(config.validate().is_err());

        let mut config = SimConfig::default();
        config.devices[1].dev_id = 0;
        assert!(config.validate().is_err());

        let mut config = SimConfig::default();
        config.devices.clear();
        assert!(config.validate().is_err());

        let mut config = SimConfig::default();
        config.workload.max_write_blks = 1000;
        assert!(config.validate().is_err());

        let mut config = SimConfig::default();
        config.selector.blk_size = 3;
        assert!(config.validate().is_err());
    }
}
