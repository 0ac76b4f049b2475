//! Typed configuration for one clone-kernel instance.
//!
//! `proxmox-section-config`'s plugin-registered INI format handles a server
//! with many independently-administered config files via schema
//! registration and per-section parser plugins. This crate has exactly one
//! config document, so it is represented here as a single serde-derived
//! struct loaded from JSON instead -- the simplification is intentional,
//! not an oversight (see DESIGN.md).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Mirrors `ck_datastore::constants::CLONE_MAX_TASKS` without introducing
/// a dependency edge from this crate onto the datastore crate; checked
/// for consistency in `ck-datastore`'s own tests.
const CLONE_MAX_TASKS_HINT: u32 = 16;

const MAX_UNDO_TABLESPACES_HINT: u32 = 127;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CloneConfig {
    pub data_dir: String,
    pub chunk_size_pow2: u8,
    pub block_size_pow2: u8,
    pub max_clone_tasks: u32,
    pub gtid: GtidConfig,
    pub undo: UndoConfig,
}

impl Default for CloneConfig {
    fn default() -> Self {
        CloneConfig {
            data_dir: "/var/lib/clone-kernel".into(),
            chunk_size_pow2: 12,
            block_size_pow2: 6,
            max_clone_tasks: 4,
            gtid: GtidConfig::default(),
            undo: UndoConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GtidConfig {
    pub flush_threshold: usize,
    pub flush_interval_secs: u64,
}

impl Default for GtidConfig {
    fn default() -> Self {
        GtidConfig {
            flush_threshold: 1024,
            flush_interval_secs: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UndoConfig {
    pub num_undo_tablespaces: u32,
    pub max_undo_tablespace_size_mb: u64,
}

impl Default for UndoConfig {
    fn default() -> Self {
        UndoConfig {
            num_undo_tablespaces: 2,
            max_undo_tablespace_size_mb: 1024,
        }
    }
}

impl CloneConfig {
    /// Structural validation beyond what serde's types already enforce:
    /// relationships between fields that a malformed or hand-edited
    /// config file could otherwise violate.
    pub fn validate(&self) -> Result<()> {
        if self.block_size_pow2 > self.chunk_size_pow2 {
            anyhow::bail!(
                "block_size_pow2 ({}) must not exceed chunk_size_pow2 ({})",
                self.block_size_pow2,
                self.chunk_size_pow2
            );
        }
        if self.max_clone_tasks == 0 || self.max_clone_tasks > CLONE_MAX_TASKS_HINT {
            anyhow::bail!(
                "max_clone_tasks must be between 1 and {}",
                CLONE_MAX_TASKS_HINT
            );
        }
        if self.undo.num_undo_tablespaces > MAX_UNDO_TABLESPACES_HINT {
            anyhow::bail!(
                "undo.num_undo_tablespaces must not exceed {}",
                MAX_UNDO_TABLESPACES_HINT
            );
        }
        if self.gtid.flush_threshold == 0 {
            anyhow::bail!("gtid.flush_threshold must be positive");
        }
        Ok(())
    }
}

/// Loads and validates a [`CloneConfig`] from a JSON file.
pub fn load(path: &Path) -> Result<CloneConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading clone-kernel config from {:?}", path))?;
    let config: CloneConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing clone-kernel config {:?}", path))?;
    config.validate()?;
    log::info!("loaded clone-kernel config from {:?}", path);
    Ok(config)
}

/// Writes `config` to `path` as pretty-printed JSON.
pub fn save(path: &Path, config: &CloneConfig) -> Result<()> {
    config.validate()?;
    let rendered = serde_json::to_string_pretty(config).context("serializing clone-kernel config")?;
    fs::write(path, rendered).with_context(|| format!("writing clone-kernel config to {:?}", path))?;
    log::info!("wrote clone-kernel config to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        CloneConfig::default().validate().unwrap();
    }

    #[test]
    fn block_size_larger_than_chunk_size_is_rejected() {
        let mut config = CloneConfig::default();
        config.block_size_pow2 = config.chunk_size_pow2 + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clone-kernel.json");

        let mut config = CloneConfig::default();
        config.max_clone_tasks = 2;
        save(&path, &config).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "not json").unwrap();
        assert!(load(&path).is_err());
    }
}
