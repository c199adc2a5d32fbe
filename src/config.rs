//! Configuration management.

use crate::error::{ForgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Persistent configuration for forge-core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for image metadata and artifact bodies.
    pub storage_dir: PathBuf,

    /// Named admission queues and their concurrency caps.
    ///
    /// Queue names not listed here are unlimited by design.
    pub build_queues: HashMap<String, usize>,

    /// Default reserved headroom (bytes) for watched mount points.
    pub min_free_bytes: u64,

    /// Timeout for a single webhook PUT, in seconds.
    pub webhook_timeout_secs: u64,

    /// Optional upper bound on the delegate phase of a build stage, in
    /// seconds. `None` lets a hung delegate run forever, which also keeps
    /// its builder registered forever.
    pub stage_timeout_secs: Option<u64>,

    /// TCP port range handed out to delegates (inclusive).
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for Config {
    fn default() -> Self {
        let mut build_queues = HashMap::new();
        build_queues.insert("local".to_string(), 2);
        build_queues.insert("ec2".to_string(), 4);
        Self {
            storage_dir: PathBuf::from("/var/lib/forge/images"),
            build_queues,
            min_free_bytes: 256 * 1024 * 1024, // 256 MB
            webhook_timeout_secs: 30,
            stage_timeout_secs: None,
            port_range_start: 42000,
            port_range_end: 42999,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults if
    /// the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ForgeError::InvalidConfig {
            reason: format!("Failed to read config {}: {}", path.display(), e),
        })?;
        let config: Self =
            serde_json::from_str(&content).map_err(|e| ForgeError::InvalidConfig {
                reason: format!("Failed to parse config {}: {}", path.display(), e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants that deserialization cannot.
    pub fn validate(&self) -> Result<()> {
        if self.port_range_start > self.port_range_end {
            return Err(ForgeError::InvalidConfig {
                reason: format!(
                    "port range is inverted: {}-{}",
                    self.port_range_start, self.port_range_end
                ),
            });
        }
        Ok(())
    }

    /// Save configuration to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ForgeError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| ForgeError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content)
            .map_err(|e| ForgeError::IoError { path: path.to_path_buf(), source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.build_queues.get("local"), Some(&2));
        assert_eq!(config.build_queues.get("ec2"), Some(&4));
        assert!(config.stage_timeout_secs.is_none());
        assert!(config.port_range_start < config.port_range_end);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let config = Config::load("/nonexistent/forge/config.json").unwrap();
        assert_eq!(config.webhook_timeout_secs, 30);
    }

    #[test]
    fn test_load_rejects_inverted_port_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.port_range_start = 42010;
        config.port_range_end = 42000;
        config.save(&path).unwrap();

        assert!(matches!(Config::load(&path), Err(ForgeError::InvalidConfig { .. })));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.webhook_timeout_secs = 5;
        config.build_queues.insert("gce".to_string(), 8);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.webhook_timeout_secs, 5);
        assert_eq!(loaded.build_queues.get("gce"), Some(&8));
    }
}
