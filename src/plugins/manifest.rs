//! Persisted manifest documents.
//!
//! A manifest is the full, ordered routing table for one epoch plus every route's
//! inclusion proof and the Merkle root they prove against. Manifests chain through
//! `previous_manifest_hash` so an environment's history can be audited end to end.

use crate::core::error;
use crate::core::hash::{Hash256, ModuleAddress, Selector, sha256};
use crate::plugins::merkle::{self, MerkleProof, OrderedMerkleTree, Route};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const MANIFEST_FORMAT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestHeader {
    pub format_version: String,
    pub created_at: String,
    pub author: String,
    /// Target environment identifier, e.g. `mainnet` or `staging-eu`.
    pub environment: String,
    pub epoch: u64,
    pub previous_manifest_hash: Option<Hash256>,
}

impl ManifestHeader {
    pub fn new(author: &str, environment: &str, epoch: u64) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION.to_string(),
            created_at: crate::core::time::now_epoch_z(),
            author: author.to_string(),
            environment: environment.to_string(),
            epoch,
            previous_manifest_hash: None,
        }
    }

    pub fn following(mut self, previous: &ManifestDocument) -> Result<Self, error::RouterError> {
        self.previous_manifest_hash = Some(previous.document_hash()?);
        Ok(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub selector: Selector,
    pub module: ModuleAddress,
    pub fingerprint: Hash256,
    pub proof: Vec<Hash256>,
    pub positions: u64,
}

impl ManifestEntry {
    pub fn route(&self) -> Route {
        Route::new(self.selector, self.module, self.fingerprint)
    }

    pub fn merkle_proof(&self) -> MerkleProof {
        MerkleProof {
            siblings: self.proof.clone(),
            positions: self.positions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestDocument {
    pub header: ManifestHeader,
    pub entries: Vec<ManifestEntry>,
    pub root: Hash256,
}

impl ManifestDocument {
    /// Build the tree over `routes` in the given order and attach each proof.
    pub fn build(header: ManifestHeader, routes: &[Route]) -> Result<Self, error::RouterError> {
        check_unique_selectors(routes.iter().map(|r| &r.selector))?;
        let tree = OrderedMerkleTree::from_routes(routes)?;
        let mut entries = Vec::with_capacity(routes.len());
        for (idx, route) in routes.iter().enumerate() {
            let proof = tree.prove(idx)?;
            entries.push(ManifestEntry {
                selector: route.selector,
                module: route.module,
                fingerprint: route.fingerprint,
                proof: proof.siblings,
                positions: proof.positions,
            });
        }
        Ok(Self {
            header,
            entries,
            root: tree.root(),
        })
    }

    pub fn routes(&self) -> Vec<Route> {
        self.entries.iter().map(ManifestEntry::route).collect()
    }

    pub fn proofs(&self) -> Vec<MerkleProof> {
        self.entries.iter().map(ManifestEntry::merkle_proof).collect()
    }

    pub fn entry(&self, selector: &Selector) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.selector == *selector)
    }

    /// Structural and cryptographic checks: version, unique selectors, every proof
    /// against `root`, and `root` equal to the tree rebuilt from the entries in order.
    pub fn validate(&self) -> Result<(), error::RouterError> {
        if self.header.format_version != MANIFEST_FORMAT_VERSION {
            return Err(error::RouterError::ValidationError(format!(
                "unsupported manifest format_version '{}'",
                self.header.format_version
            )));
        }
        if self.header.epoch == 0 {
            return Err(error::RouterError::ValidationError(
                "manifest epoch must be at least 1".to_string(),
            ));
        }
        check_unique_selectors(self.entries.iter().map(|e| &e.selector))?;
        for entry in &self.entries {
            if !merkle::verify_route(&entry.route(), &entry.merkle_proof(), &self.root) {
                return Err(error::RouterError::ValidationError(format!(
                    "proof for selector {} does not verify against root {}",
                    entry.selector, self.root
                )));
            }
        }
        let rebuilt = OrderedMerkleTree::from_routes(&self.routes())?.root();
        if rebuilt != self.root {
            return Err(error::RouterError::ValidationError(format!(
                "root {} does not match rebuilt root {}",
                self.root, rebuilt
            )));
        }
        Ok(())
    }

    pub fn canonical_json_bytes(&self) -> Result<Vec<u8>, error::RouterError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn document_hash(&self) -> Result<Hash256, error::RouterError> {
        Ok(sha256(&self.canonical_json_bytes()?))
    }

    /// Check that `self` directly succeeds `previous` in the same environment.
    pub fn follows(&self, previous: &ManifestDocument) -> Result<(), error::RouterError> {
        let expected = previous.document_hash()?;
        if self.header.previous_manifest_hash != Some(expected) {
            return Err(error::RouterError::ValidationError(format!(
                "previous_manifest_hash does not link to {}",
                expected
            )));
        }
        if self.header.environment != previous.header.environment {
            return Err(error::RouterError::ValidationError(format!(
                "environment '{}' does not match previous '{}'",
                self.header.environment, previous.header.environment
            )));
        }
        if self.header.epoch <= previous.header.epoch {
            return Err(error::RouterError::ValidationError(format!(
                "epoch {} does not advance past {}",
                self.header.epoch, previous.header.epoch
            )));
        }
        Ok(())
    }
}

/// Validate every document and every link, oldest first.
pub fn verify_chain(chain: &[ManifestDocument]) -> Result<(), error::RouterError> {
    for (idx, doc) in chain.iter().enumerate() {
        doc.validate()?;
        if idx > 0 {
            doc.follows(&chain[idx - 1])?;
        }
    }
    Ok(())
}

pub fn save_manifest(path: &Path, doc: &ManifestDocument) -> Result<(), error::RouterError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(error::RouterError::IoError)?;
    }
    let bytes = serde_json::to_vec_pretty(doc).map_err(|e| {
        error::RouterError::ValidationError(format!("Unable to serialize manifest: {e}"))
    })?;
    fs::write(path, bytes).map_err(error::RouterError::IoError)?;
    Ok(())
}

/// Load and validate a manifest document.
pub fn load_manifest(path: &Path) -> Result<ManifestDocument, error::RouterError> {
    if !path.exists() {
        return Err(error::RouterError::NotFound(format!(
            "manifest not found at {}",
            path.display()
        )));
    }
    let raw = fs::read(path).map_err(error::RouterError::IoError)?;
    let doc: ManifestDocument = serde_json::from_slice(&raw).map_err(|e| {
        error::RouterError::ValidationError(format!(
            "invalid manifest {}: {}",
            path.display(),
            e
        ))
    })?;
    doc.validate()?;
    Ok(doc)
}

fn check_unique_selectors<'a>(
    selectors: impl Iterator<Item = &'a Selector>,
) -> Result<(), error::RouterError> {
    let mut seen = HashSet::new();
    for sel in selectors {
        if !seen.insert(*sel) {
            return Err(error::RouterError::ValidationError(format!(
                "duplicate selector {} in manifest",
                sel
            )));
        }
    }
    Ok(())
}
