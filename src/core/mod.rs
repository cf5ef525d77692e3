//! Shared primitives: errors, hashing, configuration, persistence and the
//! collaborator traits the plugins are written against.

pub mod broker;
pub mod capability;
pub mod config;
pub mod db;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod schemas;
pub mod store;
pub mod time;
