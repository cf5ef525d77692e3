//! Orchestration plans.
//!
//! A plan is a named, budgeted sequence of store and dispatcher calls. The
//! orchestrator only talks to its collaborators through [`ModuleStaging`] and
//! [`ManifestControl`], records every step on the plan row in `orchestrator.db`, and
//! appends each attempt (successful or not) to `orchestrator.events.jsonl`.

use crate::core::broker::DbBroker;
use crate::core::error;
use crate::core::hash::{Hash256, ModuleAddress, Selector};
use crate::core::ledger;
use crate::core::schemas;
use crate::plugins::merkle::{MerkleProof, Route};
use crate::plugins::module_store::ModuleStore;
use crate::plugins::router::{ActiveManifest, PendingManifest, Router};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

pub trait ModuleStaging {
    fn stage_blobs(
        &self,
        actor: &str,
        blobs: &[Vec<u8>],
    ) -> Result<Vec<ModuleAddress>, error::RouterError>;
}

impl ModuleStaging for ModuleStore {
    fn stage_blobs(
        &self,
        actor: &str,
        blobs: &[Vec<u8>],
    ) -> Result<Vec<ModuleAddress>, error::RouterError> {
        Ok(self
            .stage_batch(actor, blobs)?
            .into_iter()
            .map(|m| m.address)
            .collect())
    }
}

pub trait ManifestControl {
    fn commit_root(
        &mut self,
        actor: &str,
        root: Hash256,
        epoch: u64,
    ) -> Result<PendingManifest, error::RouterError>;

    /// Apply routes against the pending root; returns that root.
    fn apply(
        &mut self,
        actor: &str,
        routes: &[Route],
        proofs: &[MerkleProof],
    ) -> Result<Hash256, error::RouterError>;

    fn activate(&mut self, actor: &str, epoch: u64) -> Result<ActiveManifest, error::RouterError>;
}

impl ManifestControl for Router {
    fn commit_root(
        &mut self,
        actor: &str,
        root: Hash256,
        epoch: u64,
    ) -> Result<PendingManifest, error::RouterError> {
        self.commit(actor, root, epoch)
    }

    fn apply(
        &mut self,
        actor: &str,
        routes: &[Route],
        proofs: &[MerkleProof],
    ) -> Result<Hash256, error::RouterError> {
        self.apply_routes(actor, routes, proofs)?;
        self.pending()
            .map(|p| p.root)
            .ok_or_else(|| error::RouterError::NotReady("no pending manifest".to_string()))
    }

    fn activate(&mut self, actor: &str, epoch: u64) -> Result<ActiveManifest, error::RouterError> {
        self.activate_committed_root(actor, epoch)
    }
}

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Open,
    Succeeded,
    Failed,
}

impl PlanStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Result<Self, error::RouterError> {
        match raw {
            "open" => Ok(Self::Open),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(error::RouterError::ValidationError(format!(
                "unknown plan status '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ManifestOp {
    Commit {
        epoch: u64,
        root: Hash256,
    },
    Apply {
        root: Hash256,
        selectors: Vec<Selector>,
    },
    Activate {
        epoch: u64,
        root: Hash256,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrchestrationPlan {
    pub plan_id: String,
    /// Units available: one per staged blob, one per applied route.
    pub budget: u64,
    pub spent: u64,
    pub status: PlanStatus,
    pub staged: Vec<ModuleAddress>,
    pub operations: Vec<ManifestOp>,
    pub last_root: Option<Hash256>,
    pub created_at: String,
    pub completed_at: Option<String>,
}

impl OrchestrationPlan {
    pub fn is_complete(&self) -> bool {
        self.status != PlanStatus::Open
    }

    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.spent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEvent {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    pub plan_id: String,
    pub op: String,
    pub status: String,
    pub detail: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Paths & initialization
// ---------------------------------------------------------------------------

pub fn orchestrator_db_path(root: &Path) -> PathBuf {
    root.join(schemas::ORCHESTRATOR_DB_NAME)
}

pub fn orchestrator_events_path(root: &Path) -> PathBuf {
    root.join(schemas::ORCHESTRATOR_EVENTS_NAME)
}

pub fn initialize_orchestrator_db(root: &Path) -> Result<(), error::RouterError> {
    fs::create_dir_all(root).map_err(error::RouterError::IoError)?;
    let broker = DbBroker::new(root);
    broker.with_conn(
        &orchestrator_db_path(root),
        "modroute",
        "orchestrator.init",
        |conn| {
            conn.execute(schemas::ORCHESTRATOR_DB_SCHEMA_PLANS, [])?;
            Ok(())
        },
    )
}

fn plan_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").expect("plan id pattern compiles")
    })
}

pub fn validate_plan_id(plan_id: &str) -> Result<(), error::RouterError> {
    if plan_id_pattern().is_match(plan_id) {
        Ok(())
    } else {
        Err(error::RouterError::ValidationError(format!(
            "invalid plan id '{}': 1-64 chars of [A-Za-z0-9_.-], starting alphanumeric",
            plan_id
        )))
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<S, D> {
    root: PathBuf,
    actor: String,
    store: S,
    dispatcher: D,
}

impl<S: ModuleStaging, D: ManifestControl> Orchestrator<S, D> {
    pub fn open(
        root: &Path,
        actor: &str,
        store: S,
        dispatcher: D,
    ) -> Result<Self, error::RouterError> {
        initialize_orchestrator_db(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            actor: actor.to_string(),
            store,
            dispatcher,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut D {
        &mut self.dispatcher
    }

    pub fn start_plan(
        &self,
        plan_id: &str,
        budget: u64,
    ) -> Result<OrchestrationPlan, error::RouterError> {
        validate_plan_id(plan_id)?;
        if budget == 0 {
            return Err(error::RouterError::ValidationError(
                "plan budget must be greater than zero".to_string(),
            ));
        }
        let stored_budget = units_to_sql(budget, "plan budget")?;
        let created_at = crate::core::time::now_epoch_z();
        let broker = DbBroker::new(&self.root);
        broker.with_tx(
            &orchestrator_db_path(&self.root),
            &self.actor,
            "orchestrator.start_plan",
            |conn| {
                if load_plan(conn, plan_id)?.is_some() {
                    return Err(error::RouterError::ValidationError(format!(
                        "plan '{}' already exists",
                        plan_id
                    )));
                }
                conn.execute(
                    "INSERT INTO plans(plan_id, budget, created_at) VALUES(?1,?2,?3)",
                    params![plan_id, stored_budget, created_at],
                )?;
                Ok(())
            },
        )?;
        self.log(plan_id, "start_plan", "ok", json!({ "budget": budget }))?;
        self.require_plan(plan_id)
    }

    pub fn stage_batch(
        &self,
        plan_id: &str,
        blobs: &[Vec<u8>],
    ) -> Result<Vec<ModuleAddress>, error::RouterError> {
        let mut plan = self.open_plan(plan_id)?;
        self.charge(&plan, blobs.len() as u64, "stage_batch")?;

        let addresses = self.attempt(plan_id, "stage_batch", || {
            self.store.stage_blobs(&self.actor, blobs)
        })?;

        plan.spent += blobs.len() as u64;
        plan.staged.extend(addresses.iter().copied());
        self.save(&plan)?;
        self.log(
            plan_id,
            "stage_batch",
            "ok",
            json!({ "addresses": addresses }),
        )?;
        Ok(addresses)
    }

    pub fn commit_manifest(
        &mut self,
        plan_id: &str,
        root: Hash256,
        epoch: u64,
    ) -> Result<PendingManifest, error::RouterError> {
        let mut plan = self.open_plan(plan_id)?;
        let actor = self.actor.clone();
        let dispatcher = &mut self.dispatcher;
        let pending = attempt_logged(&self.root, &actor, plan_id, "commit", || {
            dispatcher.commit_root(&actor, root, epoch)
        })?;

        plan.operations.push(ManifestOp::Commit { epoch, root });
        plan.last_root = Some(root);
        self.save(&plan)?;
        self.log(plan_id, "commit", "ok", json!({ "epoch": epoch, "root": root }))?;
        Ok(pending)
    }

    /// Apply `routes` against the committed root. Activation follows separately once
    /// the timelock has elapsed.
    pub fn submit_manifest_update(
        &mut self,
        plan_id: &str,
        routes: &[Route],
        proofs: &[MerkleProof],
    ) -> Result<Hash256, error::RouterError> {
        let mut plan = self.open_plan(plan_id)?;
        self.charge(&plan, routes.len() as u64, "submit_manifest_update")?;

        let actor = self.actor.clone();
        let dispatcher = &mut self.dispatcher;
        let root = attempt_logged(&self.root, &actor, plan_id, "apply", || {
            dispatcher.apply(&actor, routes, proofs)
        })?;

        plan.spent += routes.len() as u64;
        plan.operations.push(ManifestOp::Apply {
            root,
            selectors: routes.iter().map(|r| r.selector).collect(),
        });
        plan.last_root = Some(root);
        self.save(&plan)?;
        self.log(
            plan_id,
            "apply",
            "ok",
            json!({ "root": root, "routes": routes.len() }),
        )?;
        Ok(root)
    }

    pub fn activate_manifest(
        &mut self,
        plan_id: &str,
        epoch: u64,
    ) -> Result<ActiveManifest, error::RouterError> {
        let mut plan = self.open_plan(plan_id)?;
        let actor = self.actor.clone();
        let dispatcher = &mut self.dispatcher;
        let active = attempt_logged(&self.root, &actor, plan_id, "activate", || {
            dispatcher.activate(&actor, epoch)
        })?;

        plan.operations.push(ManifestOp::Activate {
            epoch: active.epoch,
            root: active.root,
        });
        plan.last_root = Some(active.root);
        self.save(&plan)?;
        self.log(
            plan_id,
            "activate",
            "ok",
            json!({ "epoch": active.epoch, "root": active.root }),
        )?;
        Ok(active)
    }

    /// Mark the plan terminal. Completed plans reject every further call.
    pub fn complete(
        &self,
        plan_id: &str,
        success: bool,
    ) -> Result<OrchestrationPlan, error::RouterError> {
        let mut plan = self.open_plan(plan_id)?;
        plan.status = if success {
            PlanStatus::Succeeded
        } else {
            PlanStatus::Failed
        };
        plan.completed_at = Some(crate::core::time::now_epoch_z());
        self.save(&plan)?;
        self.log(plan_id, "complete", "ok", json!({ "success": success }))?;
        Ok(plan)
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<Option<OrchestrationPlan>, error::RouterError> {
        let broker = DbBroker::new(&self.root);
        broker.with_conn(
            &orchestrator_db_path(&self.root),
            &self.actor,
            "orchestrator.get_plan",
            |conn| load_plan(conn, plan_id),
        )
    }

    pub fn list_plans(&self) -> Result<Vec<OrchestrationPlan>, error::RouterError> {
        let broker = DbBroker::new(&self.root);
        broker.with_conn(
            &orchestrator_db_path(&self.root),
            &self.actor,
            "orchestrator.list_plans",
            |conn| {
                let mut stmt =
                    conn.prepare(&format!("{} ORDER BY created_at, plan_id", PLAN_SELECT))?;
                let rows = stmt.query_map([], plan_row)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?.into_plan()?);
                }
                Ok(out)
            },
        )
    }

    pub fn read_events(&self) -> Result<Vec<PlanEvent>, error::RouterError> {
        ledger::read_jsonl(&orchestrator_events_path(&self.root))
    }

    // --- internals --------------------------------------------------------

    fn require_plan(&self, plan_id: &str) -> Result<OrchestrationPlan, error::RouterError> {
        self.get_plan(plan_id)?
            .ok_or_else(|| error::RouterError::NotFound(format!("plan '{}' not found", plan_id)))
    }

    fn open_plan(&self, plan_id: &str) -> Result<OrchestrationPlan, error::RouterError> {
        let plan = self.require_plan(plan_id)?;
        if plan.is_complete() {
            return Err(error::RouterError::ValidationError(format!(
                "plan '{}' is complete and immutable",
                plan_id
            )));
        }
        Ok(plan)
    }

    fn charge(
        &self,
        plan: &OrchestrationPlan,
        units: u64,
        op: &str,
    ) -> Result<(), error::RouterError> {
        if units > plan.remaining() {
            let err = error::RouterError::SizeExceeded(format!(
                "plan '{}' {} needs {} units, {} remaining",
                plan.plan_id,
                op,
                units,
                plan.remaining()
            ));
            self.log(
                &plan.plan_id,
                op,
                "error",
                json!({ "marker": err.marker(), "message": err.to_string() }),
            )?;
            return Err(err);
        }
        Ok(())
    }

    fn attempt<T>(
        &self,
        plan_id: &str,
        op: &str,
        f: impl FnOnce() -> Result<T, error::RouterError>,
    ) -> Result<T, error::RouterError> {
        attempt_logged(&self.root, &self.actor, plan_id, op, f)
    }

    fn save(&self, plan: &OrchestrationPlan) -> Result<(), error::RouterError> {
        let spent = units_to_sql(plan.spent, "plan spent")?;
        let staged = serde_json::to_string(&plan.staged)?;
        let operations = serde_json::to_string(&plan.operations)?;
        let broker = DbBroker::new(&self.root);
        broker.with_tx(
            &orchestrator_db_path(&self.root),
            &self.actor,
            "orchestrator.save_plan",
            |conn| {
                let changed = conn.execute(
                    "UPDATE plans SET spent = ?2, status = ?3, staged = ?4, operations = ?5, last_root = ?6, completed_at = ?7
                     WHERE plan_id = ?1 AND status = 'open'",
                    params![
                        plan.plan_id,
                        spent,
                        plan.status.as_str(),
                        staged,
                        operations,
                        plan.last_root.map(|r| r.to_hex()),
                        plan.completed_at,
                    ],
                )?;
                if changed != 1 {
                    return Err(error::RouterError::ValidationError(format!(
                        "plan '{}' is no longer open",
                        plan.plan_id
                    )));
                }
                Ok(())
            },
        )
    }

    fn log(
        &self,
        plan_id: &str,
        op: &str,
        status: &str,
        detail: serde_json::Value,
    ) -> Result<(), error::RouterError> {
        log_plan_event(&self.root, &self.actor, plan_id, op, status, detail)
    }
}

fn log_plan_event(
    root: &Path,
    actor: &str,
    plan_id: &str,
    op: &str,
    status: &str,
    detail: serde_json::Value,
) -> Result<(), error::RouterError> {
    let event = PlanEvent {
        ts: crate::core::time::now_epoch_z(),
        event_id: crate::core::time::new_event_id(),
        actor: actor.to_string(),
        plan_id: plan_id.to_string(),
        op: op.to_string(),
        status: status.to_string(),
        detail,
    };
    ledger::append_jsonl(&orchestrator_events_path(root), &event)
}

/// Run a delegated call; failures are logged on the plan ledger and returned as-is.
fn attempt_logged<T>(
    root: &Path,
    actor: &str,
    plan_id: &str,
    op: &str,
    f: impl FnOnce() -> Result<T, error::RouterError>,
) -> Result<T, error::RouterError> {
    match f() {
        Ok(value) => Ok(value),
        Err(err) => {
            log_plan_event(
                root,
                actor,
                plan_id,
                op,
                "error",
                json!({ "marker": err.marker(), "message": err.to_string() }),
            )?;
            Err(err)
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const PLAN_SELECT: &str = "SELECT plan_id, budget, spent, status, staged, operations, last_root, created_at, completed_at FROM plans";

struct PlanRow {
    plan_id: String,
    budget: i64,
    spent: i64,
    status: String,
    staged: String,
    operations: String,
    last_root: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl PlanRow {
    fn into_plan(self) -> Result<OrchestrationPlan, error::RouterError> {
        Ok(OrchestrationPlan {
            plan_id: self.plan_id,
            budget: units_from_sql(self.budget, "plan budget")?,
            spent: units_from_sql(self.spent, "plan spent")?,
            status: PlanStatus::parse(&self.status)?,
            staged: serde_json::from_str(&self.staged)?,
            operations: serde_json::from_str(&self.operations)?,
            last_root: self.last_root.map(|r| r.parse()).transpose()?,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

/// SQLite integers are signed; unit counts must fit without wrapping.
fn units_to_sql(units: u64, what: &str) -> Result<i64, error::RouterError> {
    i64::try_from(units).map_err(|_| {
        error::RouterError::ValidationError(format!(
            "{} {} exceeds the storable maximum {}",
            what,
            units,
            i64::MAX
        ))
    })
}

fn units_from_sql(value: i64, what: &str) -> Result<u64, error::RouterError> {
    u64::try_from(value).map_err(|_| {
        error::RouterError::ValidationError(format!("stored {} {} is negative", what, value))
    })
}

fn plan_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PlanRow> {
    Ok(PlanRow {
        plan_id: row.get(0)?,
        budget: row.get(1)?,
        spent: row.get(2)?,
        status: row.get(3)?,
        staged: row.get(4)?,
        operations: row.get(5)?,
        last_root: row.get(6)?,
        created_at: row.get(7)?,
        completed_at: row.get(8)?,
    })
}

fn load_plan(
    conn: &Connection,
    plan_id: &str,
) -> Result<Option<OrchestrationPlan>, error::RouterError> {
    let row = conn
        .query_row(
            &format!("{} WHERE plan_id = ?1", PLAN_SELECT),
            params![plan_id],
            plan_row,
        )
        .optional()?;
    row.map(PlanRow::into_plan).transpose()
}
