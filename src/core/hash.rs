//! Fixed-width identifiers shared by the store, the Merkle verifier and the dispatcher.
//!
//! All three render as `0x`-prefixed lowercase hex and serialize to JSON as strings, so
//! manifests and event ledgers stay human-readable.

use crate::core::error::RouterError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr, $label:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                format!("0x{}", hex::encode(self.0))
            }

            pub fn from_slice(bytes: &[u8]) -> Result<Self, RouterError> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| {
                    RouterError::ValidationError(format!(
                        "{} must be {} bytes, got {}",
                        $label,
                        $len,
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = RouterError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let trimmed = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(trimmed).map_err(|e| {
                    RouterError::ValidationError(format!("invalid {} hex '{}': {}", $label, s, e))
                })?;
                Self::from_slice(&bytes)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// SHA-256 output: content hashes, fingerprints, Merkle nodes and roots.
    Hash256,
    32,
    "hash"
);

fixed_bytes!(
    /// Deterministic module location inside a store namespace.
    ModuleAddress,
    20,
    "module address"
);

fixed_bytes!(
    /// Four-byte call selector.
    Selector,
    4,
    "selector"
);

impl Selector {
    pub fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

pub fn sha256(data: &[u8]) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash256(hasher.finalize().into())
}

/// Hashes the concatenation of `parts` without allocating the joined buffer.
pub fn sha256_parts(parts: &[&[u8]]) -> Hash256 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash256(hasher.finalize().into())
}

/// Fingerprint of a module's runtime code.
pub fn fingerprint(code: &[u8]) -> Hash256 {
    sha256(code)
}
