//! Ordered Merkle tree over route leaves.
//!
//! Siblings are never sorted. Each proof carries the sibling hashes bottom-up plus a
//! position bitfield: bit `i` set means the running hash is the *right* operand when
//! combined with `siblings[i]`. A node without a sibling at the end of a level is
//! promoted unchanged and contributes no proof element.
//!
//! Hashing is domain separated: leaves are `sha256(0x00 ‖ selector ‖ module ‖
//! fingerprint)` with fixed-width fields, interior nodes are `sha256(0x01 ‖ left ‖ right)`.

use crate::core::error;
use crate::core::hash::{Hash256, ModuleAddress, Selector, sha256_parts};
use serde::{Deserialize, Serialize};

const LEAF_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

/// Deepest proof a `u64` position field can describe.
pub const MAX_PROOF_DEPTH: usize = 64;

/// One routing-table entry: selector bound to a module and its expected fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub selector: Selector,
    pub module: ModuleAddress,
    pub fingerprint: Hash256,
}

impl Route {
    pub fn new(selector: Selector, module: ModuleAddress, fingerprint: Hash256) -> Self {
        Self {
            selector,
            module,
            fingerprint,
        }
    }

    pub fn leaf(&self) -> Hash256 {
        leaf_hash(&self.selector, &self.module, &self.fingerprint)
    }
}

pub fn leaf_hash(selector: &Selector, module: &ModuleAddress, fingerprint: &Hash256) -> Hash256 {
    sha256_parts(&[
        &[LEAF_TAG],
        selector.as_bytes(),
        module.as_bytes(),
        fingerprint.as_bytes(),
    ])
}

pub fn node_hash(left: &Hash256, right: &Hash256) -> Hash256 {
    sha256_parts(&[&[NODE_TAG], left.as_bytes(), right.as_bytes()])
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub siblings: Vec<Hash256>,
    pub positions: u64,
}

impl MerkleProof {
    /// Rejects depth beyond [`MAX_PROOF_DEPTH`] and position bits with no sibling.
    pub fn check_shape(&self) -> Result<(), error::RouterError> {
        let depth = self.siblings.len();
        if depth > MAX_PROOF_DEPTH {
            return Err(error::RouterError::ValidationError(format!(
                "proof depth {} exceeds {}",
                depth, MAX_PROOF_DEPTH
            )));
        }
        if depth < MAX_PROOF_DEPTH && self.positions >> depth != 0 {
            return Err(error::RouterError::ValidationError(format!(
                "positions {:#x} has bits beyond proof length {}",
                self.positions, depth
            )));
        }
        Ok(())
    }

    /// Recompute the root implied by `leaf` and this proof.
    pub fn compute_root(&self, leaf: &Hash256) -> Result<Hash256, error::RouterError> {
        self.check_shape()?;
        let mut current = *leaf;
        for (level, sibling) in self.siblings.iter().enumerate() {
            current = if (self.positions >> level) & 1 == 1 {
                node_hash(sibling, &current)
            } else {
                node_hash(&current, sibling)
            };
        }
        Ok(current)
    }
}

/// True iff `leaf` combined with `proof` yields `root`.
pub fn verify(leaf: &Hash256, proof: &MerkleProof, root: &Hash256) -> bool {
    matches!(proof.compute_root(leaf), Ok(computed) if computed == *root)
}

pub fn verify_route(route: &Route, proof: &MerkleProof, root: &Hash256) -> bool {
    verify(&route.leaf(), proof, root)
}

/// Full tree kept level by level so any leaf can be proven.
#[derive(Debug, Clone)]
pub struct OrderedMerkleTree {
    levels: Vec<Vec<Hash256>>,
}

impl OrderedMerkleTree {
    pub fn build(leaves: &[Hash256]) -> Result<Self, error::RouterError> {
        if leaves.is_empty() {
            return Err(error::RouterError::ValidationError(
                "cannot build a Merkle tree without leaves".to_string(),
            ));
        }
        let mut levels = vec![leaves.to_vec()];
        while let Some(level) = levels.last()
            && level.len() > 1
        {
            let next: Vec<Hash256> = level
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => node_hash(left, right),
                    _ => pair[0],
                })
                .collect();
            levels.push(next);
        }
        Ok(Self { levels })
    }

    pub fn from_routes(routes: &[Route]) -> Result<Self, error::RouterError> {
        let leaves: Vec<Hash256> = routes.iter().map(Route::leaf).collect();
        Self::build(&leaves)
    }

    pub fn root(&self) -> Hash256 {
        self.levels
            .last()
            .and_then(|top| top.first())
            .copied()
            .unwrap_or_default()
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn prove(&self, index: usize) -> Result<MerkleProof, error::RouterError> {
        if index >= self.leaf_count() {
            return Err(error::RouterError::ValidationError(format!(
                "leaf index {} out of range for {} leaves",
                index,
                self.leaf_count()
            )));
        }
        let mut proof = MerkleProof::default();
        let mut idx = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_idx = idx ^ 1;
            if let Some(sibling) = level.get(sibling_idx) {
                if idx & 1 == 1 {
                    proof.positions |= 1u64 << proof.siblings.len();
                }
                proof.siblings.push(*sibling);
            }
            idx /= 2;
        }
        Ok(proof)
    }
}
