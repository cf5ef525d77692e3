//! Runtime side of payload modules.
//!
//! The dispatcher never trusts a cached "verified" flag: it asks the host for the
//! fingerprint of whatever code is loaded at a module address right now, compares, and
//! only then asks the host to invoke it.

use crate::core::error;
use crate::core::hash::{Hash256, ModuleAddress, fingerprint};
use crate::plugins::module_store::ModuleStore;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Caller identity and context forwarded to the invoked module.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallContext {
    pub caller: String,
    pub value: u128,
}

impl CallContext {
    pub fn from_caller(caller: &str) -> Self {
        Self {
            caller: caller.to_string(),
            value: 0,
        }
    }
}

/// Executes a loaded module. Failures are free-form and surface as `ModuleFailure`.
pub type ModuleHandler = Arc<dyn Fn(&CallContext, &[u8]) -> Result<Vec<u8>, String> + Send + Sync>;

pub trait ModuleHost: Send + Sync {
    /// Fingerprint of the code currently at `module`, or `None` when nothing is loaded.
    fn current_fingerprint(
        &self,
        module: &ModuleAddress,
    ) -> Result<Option<Hash256>, error::RouterError>;

    fn invoke(
        &self,
        module: &ModuleAddress,
        ctx: &CallContext,
        payload: &[u8],
    ) -> Result<Vec<u8>, error::RouterError>;
}

fn failure(module: &ModuleAddress, reason: impl Into<String>) -> error::RouterError {
    error::RouterError::ModuleFailure {
        module: module.to_hex(),
        reason: reason.into(),
    }
}

struct LoadedModule {
    code: Vec<u8>,
    handler: ModuleHandler,
}

/// Host with explicitly loaded modules that may be reloaded in place.
///
/// Reloading replaces code and handler together, so a reloaded address reports a new
/// fingerprint on the next call. Clones share the same module table.
#[derive(Clone, Default)]
pub struct InMemoryModuleHost {
    modules: Arc<RwLock<HashMap<ModuleAddress, LoadedModule>>>,
}

impl InMemoryModuleHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load (or reload) `code` at `module`; returns the new fingerprint.
    pub fn load(
        &self,
        module: ModuleAddress,
        code: &[u8],
        handler: ModuleHandler,
    ) -> Result<Hash256, error::RouterError> {
        let mut modules = self.modules.write().map_err(|_| {
            error::RouterError::ValidationError("module host lock poisoned".to_string())
        })?;
        modules.insert(
            module,
            LoadedModule {
                code: code.to_vec(),
                handler,
            },
        );
        Ok(fingerprint(code))
    }

    pub fn unload(&self, module: &ModuleAddress) -> Result<bool, error::RouterError> {
        let mut modules = self.modules.write().map_err(|_| {
            error::RouterError::ValidationError("module host lock poisoned".to_string())
        })?;
        Ok(modules.remove(module).is_some())
    }
}

impl ModuleHost for InMemoryModuleHost {
    fn current_fingerprint(
        &self,
        module: &ModuleAddress,
    ) -> Result<Option<Hash256>, error::RouterError> {
        let modules = self.modules.read().map_err(|_| {
            error::RouterError::ValidationError("module host lock poisoned".to_string())
        })?;
        Ok(modules.get(module).map(|m| fingerprint(&m.code)))
    }

    fn invoke(
        &self,
        module: &ModuleAddress,
        ctx: &CallContext,
        payload: &[u8],
    ) -> Result<Vec<u8>, error::RouterError> {
        let handler = {
            let modules = self.modules.read().map_err(|_| {
                error::RouterError::ValidationError("module host lock poisoned".to_string())
            })?;
            let loaded = modules
                .get(module)
                .ok_or_else(|| failure(module, "module not loaded"))?;
            Arc::clone(&loaded.handler)
        };
        handler(ctx, payload).map_err(|reason| failure(module, reason))
    }
}

/// Host backed by a [`ModuleStore`]: code comes from the store, execution from a
/// handler registered for that code's fingerprint.
#[derive(Clone)]
pub struct StoreModuleHost {
    store: ModuleStore,
    handlers: HashMap<Hash256, ModuleHandler>,
}

impl StoreModuleHost {
    pub fn new(store: ModuleStore) -> Self {
        Self {
            store,
            handlers: HashMap::new(),
        }
    }

    /// Register the executor for modules whose code hashes to `code_fingerprint`.
    pub fn register(mut self, code_fingerprint: Hash256, handler: ModuleHandler) -> Self {
        self.handlers.insert(code_fingerprint, handler);
        self
    }
}

impl ModuleHost for StoreModuleHost {
    fn current_fingerprint(
        &self,
        module: &ModuleAddress,
    ) -> Result<Option<Hash256>, error::RouterError> {
        Ok(self.store.code_at(module)?.map(|code| fingerprint(&code)))
    }

    fn invoke(
        &self,
        module: &ModuleAddress,
        ctx: &CallContext,
        payload: &[u8],
    ) -> Result<Vec<u8>, error::RouterError> {
        let code = self
            .store
            .code_at(module)?
            .ok_or_else(|| failure(module, "no code at address"))?;
        let handler = self
            .handlers
            .get(&fingerprint(&code))
            .ok_or_else(|| failure(module, "no executor registered for module code"))?;
        handler(ctx, payload).map_err(|reason| failure(module, reason))
    }
}
