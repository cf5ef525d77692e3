//! Routing manifest and dispatcher.
//!
//! The routing table is a single-writer ledger. Every mutation is validated in full,
//! appended to `router.events.jsonl`, and only then applied to the in-memory table;
//! `Router::open` rebuilds the table by replaying that ledger.
//!
//! Lifecycle: `commit` proposes a root under a new epoch and starts the timelock,
//! `apply_routes` binds routes proven against the pending root (immediately
//! dispatchable), `activate_committed_root` checkpoints the pending root once the
//! timelock has elapsed. `freeze` ends the lifecycle for good; `remove_routes` keeps
//! working after it.

use crate::core::capability::{self, Capability, CapabilityCheck, PauseSwitch};
use crate::core::config::RouterConfig;
use crate::core::error;
use crate::core::hash::{Hash256, ModuleAddress, Selector};
use crate::core::ledger;
use crate::core::schemas;
use crate::core::time::Clock;
use crate::plugins::merkle::{MerkleProof, Route};
use crate::plugins::module_host::{CallContext, ModuleHost};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveManifest {
    pub epoch: u64,
    pub root: Hash256,
    pub activated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingManifest {
    pub epoch: u64,
    pub root: Hash256,
    pub committed_at: u64,
    pub earliest_activation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManifestState {
    Empty,
    Pending {
        pending: PendingManifest,
        active: Option<ActiveManifest>,
    },
    Active(ActiveManifest),
    /// Terminal. Keeps the last active manifest for reference.
    Frozen { active: Option<ActiveManifest> },
}

impl ManifestState {
    pub fn active(&self) -> Option<&ActiveManifest> {
        match self {
            Self::Empty => None,
            Self::Pending { active, .. } | Self::Frozen { active } => active.as_ref(),
            Self::Active(active) => Some(active),
        }
    }

    pub fn pending(&self) -> Option<&PendingManifest> {
        match self {
            Self::Pending { pending, .. } => Some(pending),
            _ => None,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self, Self::Frozen { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteBinding {
    pub module: ModuleAddress,
    pub fingerprint: Hash256,
    /// Pending epoch and root the route was proven against.
    pub epoch: u64,
    pub root: Hash256,
}

// ---------------------------------------------------------------------------
// Ledger events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RouterEvent {
    Committed {
        epoch: u64,
        root: Hash256,
        earliest_activation: u64,
        superseded: Option<PendingManifest>,
    },
    RoutesApplied {
        epoch: u64,
        root: Hash256,
        routes: Vec<Route>,
    },
    Activated {
        epoch: u64,
        root: Hash256,
        reverified: Vec<Selector>,
    },
    RoutesRemoved {
        selectors: Vec<Selector>,
    },
    Frozen,
    PauseChanged {
        paused: bool,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterRecord {
    pub ts: String,
    pub event_id: String,
    pub actor: String,
    /// Clock reading when the event was applied.
    pub at: u64,
    #[serde(flatten)]
    pub event: RouterEvent,
}

pub fn router_events_path(root: &Path) -> PathBuf {
    root.join(schemas::ROUTER_EVENTS_NAME)
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RouteTable {
    state: ManifestState,
    routes: FxHashMap<Selector, RouteBinding>,
    forbidden: FxHashSet<Selector>,
    touched: Vec<Selector>,
    touched_set: FxHashSet<Selector>,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self {
            state: ManifestState::Empty,
            routes: FxHashMap::default(),
            forbidden: FxHashSet::default(),
            touched: Vec::new(),
            touched_set: FxHashSet::default(),
        }
    }
}

impl RouteTable {
    /// Pure state transition; callers validate before recording the event.
    fn apply(&mut self, event: &RouterEvent, at: u64) {
        match event {
            RouterEvent::Committed {
                epoch,
                root,
                earliest_activation,
                ..
            } => {
                let active = self.state.active().copied();
                self.state = ManifestState::Pending {
                    pending: PendingManifest {
                        epoch: *epoch,
                        root: *root,
                        committed_at: at,
                        earliest_activation: *earliest_activation,
                    },
                    active,
                };
            }
            RouterEvent::RoutesApplied {
                epoch,
                root,
                routes,
            } => {
                for route in routes {
                    self.routes.insert(
                        route.selector,
                        RouteBinding {
                            module: route.module,
                            fingerprint: route.fingerprint,
                            epoch: *epoch,
                            root: *root,
                        },
                    );
                    if self.touched_set.insert(route.selector) {
                        self.touched.push(route.selector);
                    }
                }
            }
            RouterEvent::Activated { epoch, root, .. } => {
                // A block lifts only for routes proven against the activated root.
                for selector in &self.touched {
                    let proven_here = self
                        .routes
                        .get(selector)
                        .is_some_and(|binding| binding.epoch == *epoch && binding.root == *root);
                    if proven_here {
                        self.forbidden.remove(selector);
                    }
                }
                self.touched.clear();
                self.touched_set.clear();
                self.state = ManifestState::Active(ActiveManifest {
                    epoch: *epoch,
                    root: *root,
                    activated_at: at,
                });
            }
            RouterEvent::RoutesRemoved { selectors } => {
                // Only a later re-apply may lift the block at activation.
                for selector in selectors {
                    self.forbidden.insert(*selector);
                    if self.touched_set.remove(selector) {
                        self.touched.retain(|s| s != selector);
                    }
                }
            }
            RouterEvent::Frozen => {
                let active = self.state.active().copied();
                self.state = ManifestState::Frozen { active };
            }
            RouterEvent::PauseChanged { .. } => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// External collaborators the dispatcher consults.
pub struct RouterDeps {
    pub capabilities: Box<dyn CapabilityCheck>,
    pub pause: Box<dyn PauseSwitch>,
    pub clock: Box<dyn Clock>,
    pub host: Box<dyn ModuleHost>,
}

pub struct Router {
    root: PathBuf,
    config: RouterConfig,
    table: RouteTable,
    deps: RouterDeps,
}

impl Router {
    /// Open the dispatcher under `root`, replaying any existing ledger.
    pub fn open(
        root: &Path,
        config: RouterConfig,
        deps: RouterDeps,
    ) -> Result<Self, error::RouterError> {
        let mut router = Self {
            root: root.to_path_buf(),
            config,
            table: RouteTable::default(),
            deps,
        };
        for record in router.read_events()? {
            if let RouterEvent::PauseChanged { paused } = record.event {
                router.deps.pause.set_paused(paused);
            }
            router.table.apply(&record.event, record.at);
        }
        Ok(router)
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn read_events(&self) -> Result<Vec<RouterRecord>, error::RouterError> {
        ledger::read_jsonl(&router_events_path(&self.root))
    }

    // --- lifecycle -------------------------------------------------------

    /// Propose `root` under `epoch`. Supersedes any unactivated pending manifest.
    pub fn commit(
        &mut self,
        actor: &str,
        root: Hash256,
        epoch: u64,
    ) -> Result<PendingManifest, error::RouterError> {
        capability::require(self.deps.capabilities.as_ref(), actor, Capability::Commit)?;
        self.ensure_mutable("commit")?;

        if root == Hash256::default() {
            return Err(error::RouterError::ValidationError(
                "manifest root cannot be zero".to_string(),
            ));
        }
        let active_epoch = self.table.state.active().map(|a| a.epoch).unwrap_or(0);
        let pending_epoch = self.table.state.pending().map(|p| p.epoch).unwrap_or(0);
        let floor = active_epoch.max(pending_epoch);
        if epoch <= floor {
            return Err(error::RouterError::ValidationError(format!(
                "epoch {} must be greater than active epoch {} and pending epoch {}",
                epoch, active_epoch, pending_epoch
            )));
        }

        let now = self.deps.clock.now();
        let earliest_activation = now.saturating_add(self.config.activation_delay_secs);
        self.record(
            actor,
            now,
            RouterEvent::Committed {
                epoch,
                root,
                earliest_activation,
                superseded: self.table.state.pending().copied(),
            },
        )?;
        self.table
            .state
            .pending()
            .copied()
            .ok_or_else(|| error::RouterError::NotReady("commit did not stage".to_string()))
    }

    /// Bind `routes`, each proven against the pending root. All or nothing.
    pub fn apply_routes(
        &mut self,
        actor: &str,
        routes: &[Route],
        proofs: &[MerkleProof],
    ) -> Result<(), error::RouterError> {
        capability::require(self.deps.capabilities.as_ref(), actor, Capability::Apply)?;
        self.ensure_mutable("apply_routes")?;

        let pending = *self.table.state.pending().ok_or_else(|| {
            error::RouterError::NotReady("no pending manifest to apply against".to_string())
        })?;
        if routes.is_empty() {
            return Err(error::RouterError::ValidationError(
                "apply_routes requires at least one route".to_string(),
            ));
        }
        if routes.len() != proofs.len() {
            return Err(error::RouterError::ValidationError(format!(
                "{} routes but {} proofs",
                routes.len(),
                proofs.len()
            )));
        }
        if routes.len() > self.config.max_routes_per_apply {
            return Err(error::RouterError::SizeExceeded(format!(
                "{} routes exceeds per-apply limit of {}",
                routes.len(),
                self.config.max_routes_per_apply
            )));
        }

        let mut seen = FxHashSet::default();
        for route in routes {
            if !seen.insert(route.selector) {
                return Err(error::RouterError::ValidationError(format!(
                    "selector {} appears twice in one apply",
                    route.selector
                )));
            }
        }

        for (route, proof) in routes.iter().zip(proofs) {
            proof.check_shape()?;
            let computed = proof.compute_root(&route.leaf())?;
            if computed != pending.root {
                return Err(error::RouterError::ValidationError(format!(
                    "proof for selector {} does not match pending root {} (epoch {})",
                    route.selector, pending.root, pending.epoch
                )));
            }
        }

        for route in routes {
            self.check_fingerprint(&route.selector, &route.module, &route.fingerprint)?;
        }

        let new_touched = seen
            .iter()
            .filter(|sel| !self.table.touched_set.contains(*sel))
            .count();
        if self.table.touched.len() + new_touched > self.config.max_touched_selectors {
            return Err(error::RouterError::SizeExceeded(format!(
                "touched selector snapshot would reach {} (limit {}); activate first",
                self.table.touched.len() + new_touched,
                self.config.max_touched_selectors
            )));
        }

        let now = self.deps.clock.now();
        self.record(
            actor,
            now,
            RouterEvent::RoutesApplied {
                epoch: pending.epoch,
                root: pending.root,
                routes: routes.to_vec(),
            },
        )
    }

    /// Parallel-array form of [`Router::apply_routes`].
    pub fn apply_routes_parts(
        &mut self,
        actor: &str,
        selectors: &[Selector],
        modules: &[ModuleAddress],
        fingerprints: &[Hash256],
        proofs: &[Vec<Hash256>],
        positions: &[u64],
    ) -> Result<(), error::RouterError> {
        let n = selectors.len();
        if modules.len() != n
            || fingerprints.len() != n
            || proofs.len() != n
            || positions.len() != n
        {
            return Err(error::RouterError::ValidationError(
                "selectors, modules, fingerprints, proofs and positions must have equal length"
                    .to_string(),
            ));
        }
        let routes: Vec<Route> = (0..n)
            .map(|i| Route::new(selectors[i], modules[i], fingerprints[i]))
            .collect();
        let proofs: Vec<MerkleProof> = proofs
            .iter()
            .zip(positions)
            .map(|(siblings, positions)| MerkleProof {
                siblings: siblings.clone(),
                positions: *positions,
            })
            .collect();
        self.apply_routes(actor, &routes, &proofs)
    }

    /// Checkpoint the pending manifest once its timelock has elapsed.
    pub fn activate_committed_root(
        &mut self,
        actor: &str,
        epoch: u64,
    ) -> Result<ActiveManifest, error::RouterError> {
        capability::require(self.deps.capabilities.as_ref(), actor, Capability::Commit)?;
        self.ensure_mutable("activate_committed_root")?;

        let pending = *self.table.state.pending().ok_or_else(|| {
            error::RouterError::NotReady("no pending manifest to activate".to_string())
        })?;
        if epoch != pending.epoch {
            return Err(error::RouterError::NotReady(format!(
                "epoch {} does not match pending epoch {}",
                epoch, pending.epoch
            )));
        }
        let now = self.deps.clock.now();
        if now < pending.earliest_activation {
            return Err(error::RouterError::NotReady(format!(
                "activation locked for {} more seconds",
                pending.earliest_activation - now
            )));
        }

        let reverified = self.table.touched.clone();
        for selector in &reverified {
            if let Some(binding) = self.table.routes.get(selector).copied() {
                self.check_fingerprint(selector, &binding.module, &binding.fingerprint)?;
            }
        }

        self.record(
            actor,
            now,
            RouterEvent::Activated {
                epoch,
                root: pending.root,
                reverified,
            },
        )?;
        self.table
            .state
            .active()
            .copied()
            .ok_or_else(|| error::RouterError::NotReady("activation did not stage".to_string()))
    }

    /// Emergency override: block `selectors` from dispatch. Works while frozen or paused.
    pub fn remove_routes(
        &mut self,
        actor: &str,
        selectors: &[Selector],
    ) -> Result<(), error::RouterError> {
        capability::require(self.deps.capabilities.as_ref(), actor, Capability::Emergency)?;
        if selectors.is_empty() {
            return Err(error::RouterError::ValidationError(
                "remove_routes requires at least one selector".to_string(),
            ));
        }
        let mut unique = Vec::with_capacity(selectors.len());
        let mut seen = FxHashSet::default();
        for sel in selectors {
            if seen.insert(*sel) {
                unique.push(*sel);
            }
        }
        let now = self.deps.clock.now();
        self.record(actor, now, RouterEvent::RoutesRemoved { selectors: unique })
    }

    /// One-way. After this only pause/unpause and `remove_routes` are accepted.
    pub fn freeze(&mut self, actor: &str) -> Result<(), error::RouterError> {
        capability::require(self.deps.capabilities.as_ref(), actor, Capability::Admin)?;
        if self.table.state.is_frozen() {
            return Err(error::RouterError::FrozenState(
                "manifest is already frozen".to_string(),
            ));
        }
        let now = self.deps.clock.now();
        self.record(actor, now, RouterEvent::Frozen)
    }

    pub fn pause(&mut self, actor: &str) -> Result<(), error::RouterError> {
        self.set_paused(actor, true)
    }

    pub fn unpause(&mut self, actor: &str) -> Result<(), error::RouterError> {
        self.set_paused(actor, false)
    }

    // --- dispatch ---------------------------------------------------------

    /// Route `payload` to the module bound to `selector`, re-checking its fingerprint
    /// immediately before invocation.
    pub fn dispatch(
        &self,
        ctx: &CallContext,
        selector: Selector,
        payload: &[u8],
    ) -> Result<Vec<u8>, error::RouterError> {
        if self.deps.pause.is_paused() {
            return Err(error::RouterError::Paused("dispatch is paused".to_string()));
        }
        if self.table.forbidden.contains(&selector) {
            return Err(error::RouterError::NoRoute(selector.to_hex()));
        }
        let binding = self
            .table
            .routes
            .get(&selector)
            .ok_or_else(|| error::RouterError::NoRoute(selector.to_hex()))?;
        self.check_fingerprint(&selector, &binding.module, &binding.fingerprint)?;
        self.deps.host.invoke(&binding.module, ctx, payload)
    }

    // --- views ------------------------------------------------------------

    pub fn state(&self) -> &ManifestState {
        &self.table.state
    }

    pub fn active(&self) -> Option<&ActiveManifest> {
        self.table.state.active()
    }

    pub fn pending(&self) -> Option<&PendingManifest> {
        self.table.state.pending()
    }

    pub fn active_root(&self) -> Option<Hash256> {
        self.active().map(|a| a.root)
    }

    pub fn is_frozen(&self) -> bool {
        self.table.state.is_frozen()
    }

    pub fn is_paused(&self) -> bool {
        self.deps.pause.is_paused()
    }

    pub fn route(&self, selector: &Selector) -> Option<&RouteBinding> {
        self.table.routes.get(selector)
    }

    /// Bound routes ordered by selector.
    pub fn routes(&self) -> Vec<(Selector, RouteBinding)> {
        let mut out: Vec<(Selector, RouteBinding)> =
            self.table.routes.iter().map(|(s, b)| (*s, *b)).collect();
        out.sort_by_key(|(s, _)| *s);
        out
    }

    pub fn is_forbidden(&self, selector: &Selector) -> bool {
        self.table.forbidden.contains(selector)
    }

    /// Selectors applied since the last activation, in first-touch order.
    pub fn touched_selectors(&self) -> &[Selector] {
        &self.table.touched
    }

    // --- internals --------------------------------------------------------

    fn ensure_mutable(&self, op: &str) -> Result<(), error::RouterError> {
        if self.table.state.is_frozen() {
            return Err(error::RouterError::FrozenState(format!(
                "{} rejected: manifest is frozen",
                op
            )));
        }
        if self.deps.pause.is_paused() {
            return Err(error::RouterError::Paused(format!("{} rejected: paused", op)));
        }
        Ok(())
    }

    fn check_fingerprint(
        &self,
        selector: &Selector,
        module: &ModuleAddress,
        expected: &Hash256,
    ) -> Result<(), error::RouterError> {
        match self.deps.host.current_fingerprint(module)? {
            Some(actual) if actual == *expected => Ok(()),
            Some(actual) => Err(error::RouterError::IntegrityMismatch(format!(
                "selector {} module {} fingerprint {} != expected {}",
                selector, module, actual, expected
            ))),
            None => Err(error::RouterError::IntegrityMismatch(format!(
                "selector {} module {} has no code",
                selector, module
            ))),
        }
    }

    fn set_paused(&mut self, actor: &str, paused: bool) -> Result<(), error::RouterError> {
        capability::require(self.deps.capabilities.as_ref(), actor, Capability::Admin)?;
        if self.deps.pause.is_paused() == paused {
            return Ok(());
        }
        let now = self.deps.clock.now();
        self.record(actor, now, RouterEvent::PauseChanged { paused })?;
        self.deps.pause.set_paused(paused);
        Ok(())
    }

    /// Append to the ledger, then apply. A failed append leaves the table untouched.
    fn record(
        &mut self,
        actor: &str,
        at: u64,
        event: RouterEvent,
    ) -> Result<(), error::RouterError> {
        let record = RouterRecord {
            ts: crate::core::time::now_epoch_z(),
            event_id: crate::core::time::new_event_id(),
            actor: actor.to_string(),
            at,
            event,
        };
        ledger::append_jsonl(&router_events_path(&self.root), &record)?;
        self.table.apply(&record.event, at);
        Ok(())
    }
}
