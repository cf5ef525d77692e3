//! Project configuration loaded from `.modroute/config.toml`.
//!
//! A missing file is not an error; every section falls back to its defaults.

use crate::core::error::RouterError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_PATH: &str = ".modroute/config.toml";

/// Default module size ceiling (24 KiB).
pub const DEFAULT_MAX_BLOB_BYTES: usize = 24 * 1024;
/// The deployment wrapper records blob length as a u32.
pub const MAX_BLOB_BYTES_CEILING: usize = u32::MAX as usize;
pub const DEFAULT_MAX_BATCH_BLOBS: usize = 64;
pub const DEFAULT_ACTIVATION_DELAY_SECS: u64 = 3600;
pub const DEFAULT_MAX_ROUTES_PER_APPLY: usize = 256;
pub const DEFAULT_MAX_TOUCHED_SELECTORS: usize = 1024;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Namespace label; mixed into every derived module address.
    pub identity: String,
    pub max_blob_bytes: usize,
    pub max_batch_blobs: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            identity: "default".to_string(),
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
            max_batch_blobs: DEFAULT_MAX_BATCH_BLOBS,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct RouterConfig {
    pub activation_delay_secs: u64,
    pub max_routes_per_apply: usize,
    /// Upper bound on selectors re-verified at activation.
    pub max_touched_selectors: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            activation_delay_secs: DEFAULT_ACTIVATION_DELAY_SECS,
            max_routes_per_apply: DEFAULT_MAX_ROUTES_PER_APPLY,
            max_touched_selectors: DEFAULT_MAX_TOUCHED_SELECTORS,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModrouteConfig {
    pub store: StoreConfig,
    pub router: RouterConfig,
    /// actor -> capability names (`commit`, `apply`, `emergency`, `admin`).
    pub roles: BTreeMap<String, Vec<String>>,
}

impl ModrouteConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, RouterError> {
        let config: ModrouteConfig =
            toml::from_str(raw).map_err(|e| RouterError::ValidationError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RouterError> {
        if self.store.identity.trim().is_empty() {
            return Err(RouterError::ValidationError(
                "store.identity cannot be empty".to_string(),
            ));
        }
        if self.store.max_blob_bytes == 0 || self.store.max_batch_blobs == 0 {
            return Err(RouterError::ValidationError(
                "store limits must be greater than zero".to_string(),
            ));
        }
        if self.store.max_blob_bytes > MAX_BLOB_BYTES_CEILING {
            return Err(RouterError::ValidationError(format!(
                "store.max_blob_bytes cannot exceed {}",
                MAX_BLOB_BYTES_CEILING
            )));
        }
        if self.router.max_routes_per_apply == 0 || self.router.max_touched_selectors == 0 {
            return Err(RouterError::ValidationError(
                "router limits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn config_path(project_root: &Path) -> PathBuf {
    project_root.join(CONFIG_PATH)
}

/// Load `.modroute/config.toml` under `project_root`.
pub fn load_config(project_root: &Path) -> Result<ModrouteConfig, RouterError> {
    let path = config_path(project_root);
    if !path.exists() {
        return Ok(ModrouteConfig::default());
    }
    let content = fs::read_to_string(&path).map_err(RouterError::IoError)?;
    ModrouteConfig::from_toml_str(&content)
}
