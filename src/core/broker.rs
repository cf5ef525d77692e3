use crate::core::db;
use crate::core::error;
use crate::core::ledger;
use crate::core::schemas;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The DB Broker is the single write path for SQLite-backed state.
/// Every call is serialized in-process and recorded in `broker.events.jsonl`.
pub struct DbBroker {
    audit_log_path: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub op: String,
    pub db_id: String,
    pub status: String,
    pub error: Option<String>,
}

static DB_LOCK: Mutex<()> = Mutex::new(());

impl DbBroker {
    pub fn new(root: &Path) -> Self {
        Self {
            audit_log_path: root.join(schemas::BROKER_EVENTS_NAME),
        }
    }

    /// Execute a closure with a serialized connection to the specified DB.
    pub fn with_conn<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, error::RouterError>
    where
        F: FnOnce(&Connection) -> Result<R, error::RouterError>,
    {
        let _lock = DB_LOCK.lock().map_err(|_| {
            error::RouterError::ValidationError("broker lock poisoned".to_string())
        })?;

        let db_id = db_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let conn = db::db_connect(&db_path.to_string_lossy())?;

        let result = f(&conn);
        self.log_event(actor, op_name, &db_id, &result)?;
        result
    }

    /// Like [`DbBroker::with_conn`], but the closure runs inside one transaction that
    /// is committed only when it returns `Ok`. Any error rolls everything back.
    pub fn with_tx<F, R>(
        &self,
        db_path: &Path,
        actor: &str,
        op_name: &str,
        f: F,
    ) -> Result<R, error::RouterError>
    where
        F: FnOnce(&Connection) -> Result<R, error::RouterError>,
    {
        self.with_conn(db_path, actor, op_name, |conn| {
            let tx = conn.unchecked_transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    pub fn audit_log_path(&self) -> &Path {
        &self.audit_log_path
    }

    fn log_event<R>(
        &self,
        actor: &str,
        op: &str,
        db_id: &str,
        result: &Result<R, error::RouterError>,
    ) -> Result<(), error::RouterError> {
        let (status, err) = match result {
            Ok(_) => ("success", None),
            Err(e) => ("error", Some(e.marker().to_string())),
        };
        let ev = BrokerEvent {
            ts: crate::core::time::now_epoch_z(),
            event_id: crate::core::time::new_event_id(),
            actor: actor.to_string(),
            op: op.to_string(),
            db_id: db_id.to_string(),
            status: status.to_string(),
            error: err,
        };
        ledger::append_jsonl(&self.audit_log_path, &ev)
    }
}
