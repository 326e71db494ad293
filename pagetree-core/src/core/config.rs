//! Tunables for a [`PageTree`](super::page_tree::PageTree).
//!
//! Loaded from a JSON file; missing keys fall back to [`PageTreeConfig::default`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::{PurgeStrategy, Result};

/// Runtime configuration of the page tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageTreeConfig {
    /// Number of descendants rewritten per cascade chunk.
    pub cascade_batch_size: usize,
    /// Prefix under which deleted pages are parked.
    pub trash_prefix: String,
    /// Prefixes whose root and direct children cannot be renamed or deleted.
    pub reserved_prefixes: Vec<String>,
    /// Immediate retries for idempotent reads when the store is busy.
    pub read_retries: u32,
    /// SQLite busy timeout in milliseconds.
    pub busy_timeout_ms: u64,
    /// Which operation log entries are dropped after each logged mutation.
    pub purge_strategy: PurgeStrategy,
}

impl Default for PageTreeConfig {
    fn default() -> Self {
        Self {
            cascade_batch_size: 100,
            trash_prefix: "/trash".to_string(),
            reserved_prefixes: vec!["/user".to_string()],
            read_retries: 2,
            busy_timeout_ms: 5_000,
            purge_strategy: PurgeStrategy::default(),
        }
    }
}

impl PageTreeConfig {
    /// Clamps values that would stall a cascade.
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.cascade_batch_size == 0 {
            self.cascade_batch_size = 1;
        }
        self.trash_prefix = crate::core::path_utils::normalize(&self.trash_prefix);
        self.reserved_prefixes = self
            .reserved_prefixes
            .iter()
            .map(|p| crate::core::path_utils::normalize(p))
            .collect();
        self
    }
}

/// Reads a [`PageTreeConfig`] from a JSON file.
///
/// # Errors
///
/// Returns [`crate::PageTreeError::Io`] if the file cannot be read, or
/// [`crate::PageTreeError::Json`] if it is not valid JSON.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PageTreeConfig> {
    let content = fs::read_to_string(path)?;
    let config: PageTreeConfig = serde_json::from_str(&content)?;
    Ok(config.sanitized())
}

/// Writes `config` as pretty JSON, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`crate::PageTreeError::Io`] or [`crate::PageTreeError::Json`] on failure.
pub fn save_config<P: AsRef<Path>>(path: P, config: &PageTreeConfig) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}
