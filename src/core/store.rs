//! Data root handle shared by every subsystem.

use crate::core::hash::{Hash256, sha256_parts};
use std::path::PathBuf;

/// Domain tag for namespace derivation.
const NAMESPACE_DOMAIN: &[u8] = b"modroute.store.v1:";

/// Store handle: the namespace mixed into module addresses plus the directory that
/// holds the databases and event ledgers.
#[derive(Debug, Clone)]
pub struct Store {
    /// Human label from `[store] identity`.
    pub identity: String,
    /// Absolute path to the data root directory.
    pub root: PathBuf,
}

impl Store {
    pub fn new(identity: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            identity: identity.to_string(),
            root: root.into(),
        }
    }

    /// 32-byte namespace derived from the identity label. Two stores with the same
    /// identity derive the same addresses regardless of where their data lives.
    pub fn namespace(&self) -> Hash256 {
        sha256_parts(&[NAMESPACE_DOMAIN, self.identity.as_bytes()])
    }
}
