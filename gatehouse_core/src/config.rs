//! Configuration.
//!
//! Loaded from a `gatehouse_config.yaml` file; every field has a default
//! so a partial (or absent) file is fine for embedders that construct the
//! config in code.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use yaml_peg::serde as yaml;

/// Core tuning knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatehouseConfig {
    /// Per-user lock TTL in milliseconds. Bounds a stuck rebuild worker.
    pub lock_ttl_ms: u64,
    /// Sleep between reader retries while a commit is imminent.
    pub reader_retry_interval_ms: u64,
    /// Whether `submit` spawns the background drain worker. Off, the read
    /// path still rebuilds synchronously and embedders drain by hand.
    pub background_worker: bool,
    /// Where snapshots go, if anywhere.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for GatehouseConfig {
    fn default() -> Self {
        GatehouseConfig {
            lock_ttl_ms: 60_000,
            reader_retry_interval_ms: 50,
            background_worker: true,
            snapshot_path: None,
        }
    }
}

impl GatehouseConfig {
    /// Load from the default path `./gatehouse_config.yaml`.
    pub fn new() -> Result<GatehouseConfig> {
        Self::from_path("./gatehouse_config.yaml")
    }

    /// Load from a specific file.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<GatehouseConfig> {
        let raw = std::fs::read_to_string(path.into())?;
        let mut config = yaml::from_str::<GatehouseConfig>(&raw)?;
        config.pop().ok_or_else(|| anyhow!["empty config file"])
    }

    /// Lock TTL as a duration.
    pub fn lock_ttl(&self) -> time::Duration {
        time::Duration::milliseconds(self.lock_ttl_ms as i64)
    }

    /// How long a reader waits on a `COMMITTING` holder: a quarter of the
    /// lock TTL.
    pub fn reader_retry_budget(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.lock_ttl_ms / 4)
    }

    /// Sleep between reader retries.
    pub fn reader_retry_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reader_retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_contract() {
        let config = GatehouseConfig::default();
        assert_eq!(config.lock_ttl(), time::Duration::seconds(60));
        assert_eq!(
            config.reader_retry_budget(),
            std::time::Duration::from_secs(15)
        );
        assert!(config.background_worker);
    }

    #[test]
    fn partial_yaml_fills_the_rest_with_defaults() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("gatehouse-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("gatehouse_config.yaml");
        std::fs::write(&path, "lock_ttl_ms: 1000\nbackground_worker: false\n")?;

        let config = GatehouseConfig::from_path(&path)?;
        assert_eq!(config.lock_ttl_ms, 1000);
        assert!(!config.background_worker);
        assert_eq!(config.reader_retry_interval_ms, 50);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
