//! modroute: content-addressed module deployment with a Merkle-verified routing manifest.
//!
//! Payload modules are deployed once, at addresses derived from their content, and never
//! mutated. A routing manifest binds 4-byte selectors to those modules. Every binding is
//! proven against a committed Merkle root, and a root becomes the active checkpoint only
//! after a timelock. Each dispatch re-checks the module's code fingerprint right before
//! invoking it.
//!
//! # Layout
//!
//! A project keeps its state under `<project>/.modroute/`:
//!
//! - `config.toml`: limits, store identity, actor roles (missing file = defaults)
//! - `data/modules.db`: deployed module code
//! - `data/orchestrator.db`: orchestration plans
//! - `data/*.events.jsonl`: append-only audit ledgers; the router's ledger is its state
//!
//! # The Thin Waist
//!
//! All SQLite access routes through [`core::broker::DbBroker`], which serializes
//! in-process and audits to `broker.events.jsonl`.
//!
//! # Crate Structure
//!
//! - [`core`]: errors, hashing, config, persistence, collaborator traits
//! - [`plugins`]: module store, Merkle verifier, router, manifests, orchestrator

pub mod core;
pub mod plugins;

mod subsystems;

use crate::core::capability::{PauseSwitch, RoleTable};
use crate::core::config::{self, ModrouteConfig};
use crate::core::error;
use crate::core::store::Store;
use crate::core::time::Clock;
use crate::plugins::module_host::ModuleHost;
use crate::plugins::module_store::ModuleStore;
use crate::plugins::router::{Router, RouterDeps};
use std::fs;
use std::path::{Path, PathBuf};

/// Project state directory name.
pub const PROJECT_DIR: &str = ".modroute";

/// Walk up from `start_dir` to the first directory containing `.modroute/`.
pub fn find_project_root(start_dir: &Path) -> Result<PathBuf, error::RouterError> {
    let mut current_dir = PathBuf::from(start_dir);
    loop {
        if current_dir.join(PROJECT_DIR).exists() {
            return Ok(current_dir);
        }
        if !current_dir.pop() {
            return Err(error::RouterError::NotFound(format!(
                "'{}' directory not found in current or parent directories",
                PROJECT_DIR
            )));
        }
    }
}

/// Create `data_root` and every subsystem database in it. Returns the initialized
/// subsystem names in order.
pub fn initialize_data_root(data_root: &Path) -> Result<Vec<&'static str>, error::RouterError> {
    fs::create_dir_all(data_root).map_err(error::RouterError::IoError)?;
    subsystems::initialize_all_dbs(data_root)
}

/// A loaded project: configuration plus an initialized data root.
#[derive(Debug, Clone)]
pub struct Project {
    root: PathBuf,
    config: ModrouteConfig,
}

impl Project {
    /// Load `<project_root>/.modroute/config.toml` and initialize the data root.
    pub fn open(project_root: &Path) -> Result<Self, error::RouterError> {
        let config = config::load_config(project_root)?;
        let project = Self {
            root: project_root.to_path_buf(),
            config,
        };
        initialize_data_root(&project.data_root())?;
        Ok(project)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ModrouteConfig {
        &self.config
    }

    pub fn data_root(&self) -> PathBuf {
        self.root.join(PROJECT_DIR).join("data")
    }

    pub fn store(&self) -> Store {
        Store::new(&self.config.store.identity, self.data_root())
    }

    pub fn module_store(&self) -> Result<ModuleStore, error::RouterError> {
        ModuleStore::open(self.store(), self.config.store.clone())
    }

    pub fn role_table(&self) -> Result<RoleTable, error::RouterError> {
        RoleTable::from_config(&self.config.roles)
    }

    /// Open the router with the configured roles as its capability collaborator.
    pub fn open_router(
        &self,
        pause: Box<dyn PauseSwitch>,
        clock: Box<dyn Clock>,
        host: Box<dyn ModuleHost>,
    ) -> Result<Router, error::RouterError> {
        let deps = RouterDeps {
            capabilities: Box::new(self.role_table()?),
            pause,
            clock,
            host,
        };
        Router::open(&self.data_root(), self.config.router.clone(), deps)
    }
}
