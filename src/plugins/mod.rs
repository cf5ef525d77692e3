//! Deployment and routing subsystems built on `core`.

pub mod manifest;
pub mod merkle;
pub mod module_host;
pub mod module_store;
pub mod orchestrator;
pub mod router;
