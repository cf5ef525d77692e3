use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Integrity mismatch: {0}")]
    IntegrityMismatch(String),
    #[error("Not ready: {0}")]
    NotReady(String),
    #[error("Unauthorized: {actor} lacks {capability} capability")]
    Unauthorized { actor: String, capability: String },
    #[error("Frozen: {0}")]
    FrozenState(String),
    #[error("Size exceeded: {0}")]
    SizeExceeded(String),
    #[error("Paused: {0}")]
    Paused(String),
    #[error("No such route: {0}")]
    NoRoute(String),
    #[error("Module failure at {module}: {reason}")]
    ModuleFailure { module: String, reason: String },
    #[error("Not found: {0}")]
    NotFound(String),
}

impl RouterError {
    /// Stable marker used in audit ledgers.
    pub fn marker(&self) -> &'static str {
        match self {
            Self::RusqliteError(_) => "SQLITE",
            Self::IoError(_) => "IO",
            Self::JsonError(_) => "JSON",
            Self::ValidationError(_) => "VALIDATION",
            Self::IntegrityMismatch(_) => "INTEGRITY_MISMATCH",
            Self::NotReady(_) => "NOT_READY",
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::FrozenState(_) => "FROZEN",
            Self::SizeExceeded(_) => "SIZE_EXCEEDED",
            Self::Paused(_) => "PAUSED",
            Self::NoRoute(_) => "NO_ROUTE",
            Self::ModuleFailure { .. } => "MODULE_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
        }
    }
}
