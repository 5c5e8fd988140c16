use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::{Config, ConfigError};

/// Holds the live configuration and swaps it atomically on update.
///
/// Readers call [`ConfigManager::get`] on every use and never block writers.
pub struct ConfigManager<T: Config> {
    config: ArcSwap<T>,
    path: Option<PathBuf>,
}

fn parse_file<T: Config>(path: &Path) -> Result<T, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let table: toml::Table = toml::from_str(&content)?;
    let config = T::from_toml(&toml::Value::Table(table))?;
    config.validate()?;
    Ok(config)
}

impl<T: Config> ConfigManager<T> {
    pub fn new(config: T) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            path: None,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = parse_file::<T>(path)?;
        tracing::info!(path = %path.display(), "config loaded");
        Ok(Self {
            config: ArcSwap::from_pointee(config),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> arc_swap::Guard<Arc<T>> {
        self.config.load()
    }

    pub fn update(&self, new_config: T) -> Result<(), ConfigError> {
        new_config.validate()?;
        self.config.store(Arc::new(new_config));
        Ok(())
    }
}

impl<T: Config + Clone> ConfigManager<T> {
    /// Re-read the backing file and apply only the hot-updatable fields.
    pub fn reload(&self) -> Result<(), ConfigError> {
        if let Some(ref path) = self.path {
            let new_config = parse_file::<T>(path)?;

            let mut current = (*self.config.load_full()).clone();
            current.hot_update(&new_config);
            self.config.store(Arc::new(current));

            tracing::info!(path = %path.display(), "config reloaded");
        }
        Ok(())
    }

    pub fn snapshot(&self) -> T {
        (*self.config.load_full()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Deserialize)]
    struct Sample {
        #[serde(default)]
        threshold: u64,
        #[serde(default)]
        name: String,
    }

    impl Config for Sample {
        fn validate(&self) -> Result<(), ConfigError> {
            if self.name == "bad" {
                return Err(ConfigError::Invalid("name must not be bad".into()));
            }
            Ok(())
        }

        fn hot_update(&mut self, other: &Self) {
            self.threshold = other.threshold;
        }
    }

    fn write_file(file: &tempfile::NamedTempFile, body: &str) {
        std::fs::write(file.path(), body).unwrap();
    }

    #[test]
    fn test_load_and_get() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_file(&file, "threshold = 5\nname = \"a\"\n");

        let mgr = ConfigManager::<Sample>::load(file.path()).unwrap();
        assert_eq!(mgr.get().threshold, 5);
        assert_eq!(mgr.get().name, "a");
        assert_eq!(mgr.path(), Some(file.path()));
    }

    #[test]
    fn test_load_rejects_invalid() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_file(&file, "name = \"bad\"\n");
        assert!(matches!(
            ConfigManager::<Sample>::load(file.path()),
            Err(ConfigError::Invalid(_))
        ));

        write_file(&file, "threshold = \"nope\"\n");
        assert!(matches!(
            ConfigManager::<Sample>::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_reload_only_applies_hot_fields() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_file(&file, "threshold = 1\nname = \"first\"\n");
        let mgr = ConfigManager::<Sample>::load(file.path()).unwrap();

        write_file(&file, "threshold = 9\nname = \"second\"\n");
        mgr.reload().unwrap();

        let snap = mgr.snapshot();
        assert_eq!(snap.threshold, 9);
        assert_eq!(snap.name, "first");
    }

    #[test]
    fn test_update_validates() {
        let mgr = ConfigManager::new(Sample {
            threshold: 0,
            name: "ok".into(),
        });
        assert!(
            mgr.update(Sample {
                threshold: 1,
                name: "bad".into()
            })
            .is_err()
        );
        assert_eq!(mgr.get().threshold, 0);
    }
}
