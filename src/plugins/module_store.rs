//! Content-addressed module store.
//!
//! Modules are immutable byte blobs deployed at an address derived from
//! `(namespace, content hash, hash of wrapped code)`. Deployment is the first write of
//! that address into `modules.db`; staging identical content again is a no-op.
//! First deployments are also appended to `modules.events.jsonl`.

use crate::core::broker::DbBroker;
use crate::core::config::{MAX_BLOB_BYTES_CEILING, StoreConfig};
use crate::core::error;
use crate::core::hash::{Hash256, ModuleAddress, sha256, sha256_parts};
use crate::core::ledger;
use crate::core::schemas;
use crate::core::store::Store;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Leading bytes of every stored module record.
pub const WRAPPER_MAGIC: &[u8; 4] = b"MRW1";
/// Magic plus a big-endian u32 length.
pub const WRAPPER_LEN: usize = 8;
const ADDRESS_PREFIX: u8 = 0xff;
const SALT_DOMAIN: &[u8] = b"modroute.salt.v1:";

// ---------------------------------------------------------------------------
// Address derivation
// ---------------------------------------------------------------------------

/// Deployment wrapper: `MRW1 ‖ len(u32 BE) ‖ blob`.
///
/// Blobs longer than `u32::MAX` saturate the length field and never unwrap; staging
/// rejects them first.
pub fn wrap(blob: &[u8]) -> Vec<u8> {
    let declared = u32::try_from(blob.len()).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(WRAPPER_LEN + blob.len());
    out.extend_from_slice(WRAPPER_MAGIC);
    out.extend_from_slice(&declared.to_be_bytes());
    out.extend_from_slice(blob);
    out
}

/// Strip and check the deployment wrapper.
pub fn unwrap_code(wrapped: &[u8]) -> Result<&[u8], error::RouterError> {
    if wrapped.len() < WRAPPER_LEN || &wrapped[..4] != WRAPPER_MAGIC {
        return Err(error::RouterError::IntegrityMismatch(
            "stored module is missing its deployment wrapper".to_string(),
        ));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&wrapped[4..WRAPPER_LEN]);
    let declared = u32::from_be_bytes(len_bytes) as usize;
    let body = &wrapped[WRAPPER_LEN..];
    if body.len() != declared {
        return Err(error::RouterError::IntegrityMismatch(format!(
            "wrapper declares {} bytes, found {}",
            declared,
            body.len()
        )));
    }
    Ok(body)
}

pub fn salt_for(content_hash: &Hash256) -> Hash256 {
    sha256_parts(&[SALT_DOMAIN, content_hash.as_bytes()])
}

/// The one address derivation used by both `stage` and `predict`.
pub fn derive_address(namespace: &Hash256, blob: &[u8]) -> (ModuleAddress, Hash256) {
    let content_hash = sha256(blob);
    let salt = salt_for(&content_hash);
    let code_hash = sha256(&wrap(blob));
    let digest = sha256_parts(&[
        &[ADDRESS_PREFIX],
        namespace.as_bytes(),
        salt.as_bytes(),
        code_hash.as_bytes(),
    ]);
    let mut addr = [0u8; ModuleAddress::LEN];
    addr.copy_from_slice(&digest.0[32 - ModuleAddress::LEN..]);
    (ModuleAddress(addr), content_hash)
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedModule {
    pub address: ModuleAddress,
    pub content_hash: Hash256,
    /// False when the module already existed and nothing was written.
    pub deployed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub address: ModuleAddress,
    pub content_hash: Hash256,
    pub byte_size: usize,
}

// ---------------------------------------------------------------------------
// Paths & initialization
// ---------------------------------------------------------------------------

pub fn modules_db_path(root: &Path) -> PathBuf {
    root.join(schemas::MODULES_DB_NAME)
}

pub fn modules_events_path(root: &Path) -> PathBuf {
    root.join(schemas::MODULES_EVENTS_NAME)
}

pub fn initialize_modules_db(root: &Path) -> Result<(), error::RouterError> {
    fs::create_dir_all(root).map_err(error::RouterError::IoError)?;
    let broker = DbBroker::new(root);
    broker.with_conn(&modules_db_path(root), "modroute", "modules.init", |conn| {
        conn.execute(schemas::MODULES_DB_SCHEMA, [])?;
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ModuleStore {
    store: Store,
    namespace: Hash256,
    config: StoreConfig,
}

impl ModuleStore {
    pub fn open(store: Store, config: StoreConfig) -> Result<Self, error::RouterError> {
        initialize_modules_db(&store.root)?;
        let namespace = store.namespace();
        Ok(Self {
            store,
            namespace,
            config,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn namespace(&self) -> Hash256 {
        self.namespace
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Address `stage` would deploy `blob` at. Writes nothing.
    pub fn predict(&self, blob: &[u8]) -> ModuleAddress {
        derive_address(&self.namespace, blob).0
    }

    pub fn stage(&self, actor: &str, blob: &[u8]) -> Result<StagedModule, error::RouterError> {
        let broker = DbBroker::new(&self.store.root);
        broker.with_tx(
            &modules_db_path(&self.store.root),
            actor,
            "modules.stage",
            |conn| {
                let staged = self.stage_in(conn, blob)?;
                self.record_deploys(actor, &[(staged, blob.len())])?;
                Ok(staged)
            },
        )
    }

    /// Stage every blob or none of them.
    pub fn stage_batch<B: AsRef<[u8]>>(
        &self,
        actor: &str,
        blobs: &[B],
    ) -> Result<Vec<StagedModule>, error::RouterError> {
        if blobs.is_empty() {
            return Err(error::RouterError::ValidationError(
                "stage_batch requires at least one blob".to_string(),
            ));
        }
        if blobs.len() > self.config.max_batch_blobs {
            return Err(error::RouterError::SizeExceeded(format!(
                "batch of {} blobs exceeds limit of {}",
                blobs.len(),
                self.config.max_batch_blobs
            )));
        }

        let broker = DbBroker::new(&self.store.root);
        broker.with_tx(
            &modules_db_path(&self.store.root),
            actor,
            "modules.stage_batch",
            |conn| {
                let mut out = Vec::with_capacity(blobs.len());
                for blob in blobs {
                    let blob = blob.as_ref();
                    out.push((self.stage_in(conn, blob)?, blob.len()));
                }
                self.record_deploys(actor, &out)?;
                Ok(out.into_iter().map(|(staged, _)| staged).collect())
            },
        )
    }

    /// True only when code is present at the derived address and still hashes to
    /// `content_hash`.
    pub fn exists(&self, content_hash: &Hash256) -> Result<bool, error::RouterError> {
        let Some(address) = self.address_of(content_hash)? else {
            return Ok(false);
        };
        let Some(code) = self.code_at(&address)? else {
            return Ok(false);
        };
        if code.is_empty() {
            return Ok(false);
        }
        let (derived, actual_hash) = derive_address(&self.namespace, &code);
        Ok(derived == address && actual_hash == *content_hash)
    }

    pub fn address_of(
        &self,
        content_hash: &Hash256,
    ) -> Result<Option<ModuleAddress>, error::RouterError> {
        let broker = DbBroker::new(&self.store.root);
        let raw: Option<String> = broker.with_conn(
            &modules_db_path(&self.store.root),
            "modroute",
            "modules.address_of",
            |conn| {
                Ok(conn
                    .query_row(
                        "SELECT address FROM modules WHERE content_hash = ?1",
                        params![content_hash.to_hex()],
                        |row| row.get(0),
                    )
                    .optional()?)
            },
        )?;
        raw.map(|s| s.parse()).transpose()
    }

    /// Runtime code at `address` with the wrapper removed.
    pub fn code_at(&self, address: &ModuleAddress) -> Result<Option<Vec<u8>>, error::RouterError> {
        let broker = DbBroker::new(&self.store.root);
        let wrapped: Option<Vec<u8>> = broker.with_conn(
            &modules_db_path(&self.store.root),
            "modroute",
            "modules.read",
            |conn| load_wrapped(conn, address),
        )?;
        match wrapped {
            Some(w) => Ok(Some(unwrap_code(&w)?.to_vec())),
            None => Ok(None),
        }
    }

    pub fn read(&self, address: &ModuleAddress) -> Result<Vec<u8>, error::RouterError> {
        self.code_at(address)?
            .ok_or_else(|| error::RouterError::NotFound(format!("no module at {}", address)))
    }

    pub fn read_range(
        &self,
        address: &ModuleAddress,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, error::RouterError> {
        let code = self.read(address)?;
        let end = offset.checked_add(len).ok_or_else(|| {
            error::RouterError::ValidationError("read range overflows".to_string())
        })?;
        if end > code.len() {
            return Err(error::RouterError::ValidationError(format!(
                "range {}..{} outside module of {} bytes",
                offset,
                end,
                code.len()
            )));
        }
        Ok(code[offset..end].to_vec())
    }

    pub fn module_count(&self) -> Result<usize, error::RouterError> {
        let broker = DbBroker::new(&self.store.root);
        let count: i64 = broker.with_conn(
            &modules_db_path(&self.store.root),
            "modroute",
            "modules.count",
            |conn| Ok(conn.query_row("SELECT COUNT(*) FROM modules", [], |row| row.get(0))?),
        )?;
        Ok(count.max(0) as usize)
    }

    pub fn read_events(&self) -> Result<Vec<ModuleEvent>, error::RouterError> {
        ledger::read_jsonl(&modules_events_path(&self.store.root))
    }

    fn stage_in(&self, conn: &Connection, blob: &[u8]) -> Result<StagedModule, error::RouterError> {
        if blob.is_empty() {
            return Err(error::RouterError::ValidationError(
                "cannot stage an empty blob".to_string(),
            ));
        }
        let limit = self.config.max_blob_bytes.min(MAX_BLOB_BYTES_CEILING);
        if blob.len() > limit {
            return Err(error::RouterError::SizeExceeded(format!(
                "blob of {} bytes exceeds limit of {}",
                blob.len(),
                limit
            )));
        }

        let (address, content_hash) = derive_address(&self.namespace, blob);
        if let Some(existing) = load_wrapped(conn, &address)?
            && !existing.is_empty()
        {
            return Ok(StagedModule {
                address,
                content_hash,
                deployed: false,
            });
        }

        let changed = conn.execute(
            "INSERT OR IGNORE INTO modules(address, content_hash, code, byte_size, created_at) VALUES(?1,?2,?3,?4,?5)",
            params![
                address.to_hex(),
                content_hash.to_hex(),
                wrap(blob),
                blob.len() as i64,
                crate::core::time::now_epoch_z()
            ],
        )?;
        Ok(StagedModule {
            address,
            content_hash,
            deployed: changed == 1,
        })
    }

    /// Log first deployments in one append. Runs inside the staging transaction, so a
    /// failed append rolls the rows back.
    fn record_deploys(
        &self,
        actor: &str,
        staged: &[(StagedModule, usize)],
    ) -> Result<(), error::RouterError> {
        let events: Vec<ModuleEvent> = staged
            .iter()
            .filter(|(module, _)| module.deployed)
            .map(|(module, byte_size)| ModuleEvent {
                ts: crate::core::time::now_epoch_z(),
                event_id: crate::core::time::new_event_id(),
                actor: actor.to_string(),
                op: "module.deploy".to_string(),
                address: module.address,
                content_hash: module.content_hash,
                byte_size: *byte_size,
            })
            .collect();
        if events.is_empty() {
            return Ok(());
        }
        ledger::append_jsonl_all(&modules_events_path(&self.store.root), &events)
    }
}

fn load_wrapped(
    conn: &Connection,
    address: &ModuleAddress,
) -> Result<Option<Vec<u8>>, error::RouterError> {
    Ok(conn
        .query_row(
            "SELECT code FROM modules WHERE address = ?1",
            params![address.to_hex()],
            |row| row.get(0),
        )
        .optional()?)
}
