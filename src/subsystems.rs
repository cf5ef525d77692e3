//! Subsystem registration: every SQLite-backed subsystem's initializer.
//!
//! Adding a new subsystem: append one entry to `SUBSYSTEMS`.

use crate::core::error;
use crate::plugins::{module_store, orchestrator};
use std::path::Path;

pub(crate) struct SubsystemInit {
    pub name: &'static str,
    pub initialize_db: fn(&Path) -> Result<(), error::RouterError>,
}

/// Run sequentially to avoid SQLite contention on first start.
pub(crate) const SUBSYSTEMS: &[SubsystemInit] = &[
    SubsystemInit {
        name: "modules",
        initialize_db: module_store::initialize_modules_db,
    },
    SubsystemInit {
        name: "orchestrator",
        initialize_db: orchestrator::initialize_orchestrator_db,
    },
];

pub(crate) fn initialize_all_dbs(
    data_root: &Path,
) -> Result<Vec<&'static str>, error::RouterError> {
    let mut initialized = Vec::with_capacity(SUBSYSTEMS.len());
    for sub in SUBSYSTEMS {
        (sub.initialize_db)(data_root)?;
        initialized.push(sub.name);
    }
    Ok(initialized)
}
