//! Configuration.
//!
//! Settings come from an optional TOML file, with CLI flags taking
//! precedence. The loaded configuration is stored in a process-wide
//! hot-swappable cell so every component reads a consistent snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Configuration error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Get the current configuration snapshot.
pub fn config() -> Arc<Config> {
    CONFIG.load().clone()
}

/// Load configuration from file and install it globally.
pub fn load(path: &Path) -> Result<Arc<Config>, Error> {
    let config = Config::load(path)?;
    Ok(set(config))
}

/// Install a configuration globally.
pub fn set(config: Config) -> Arc<Config> {
    let config = Arc::new(config);
    CONFIG.store(config.clone());
    config
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub general: General,
    pub store: StoreConfig,
    pub master: MasterConfig,
}

impl Config {
    /// Read the configuration file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct General {
    /// Data center this process lives in.
    pub data_center: String,
}

impl Default for General {
    fn default() -> Self {
        Self {
            data_center: "dc1".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct MasterConfig {
    /// Address the master listens on.
    pub address: String,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8278".into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Data directory. One subdirectory per keyspace.
    pub dir: PathBuf,
    /// Data-plane address.
    pub address: String,
    /// Admin address used for peer replication and control RPCs.
    pub admin_address: String,
    /// Master address to register with.
    pub master: String,
    /// Size of one binlog segment file, in MB.
    pub log_file_size_mb: u32,
    /// How many binlog segment files to keep before purging.
    pub log_file_count: u32,
    /// Advertised disk capacity, in GB.
    pub disk_size_gb: u32,
    /// Free-form tags matched against cluster requirements.
    pub tags: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: "data".into(),
            address: "127.0.0.1:8279".into(),
            admin_address: "127.0.0.1:8280".into(),
            master: "127.0.0.1:8278".into(),
            log_file_size_mb: 32,
            log_file_count: 10,
            disk_size_gb: 10,
            tags: vec![],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.general.data_center, "dc1");
        assert_eq!(config.store.log_file_size_mb, 32);
        assert_eq!(config.store.log_file_count, 10);
    }

    #[test]
    fn parse_partial_file() {
        let config: Config = toml::from_str(
            r#"
            [store]
            dir = "/var/lib/ringstore"
            log_file_size_mb = 64

            [general]
            data_center = "us-east"
            "#,
        )
        .unwrap();

        assert_eq!(config.store.dir, PathBuf::from("/var/lib/ringstore"));
        assert_eq!(config.store.log_file_size_mb, 64);
        // untouched fields keep defaults
        assert_eq!(config.store.log_file_count, 10);
        assert_eq!(config.general.data_center, "us-east");
    }

    #[test]
    fn roundtrip() {
        let config = Config::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
