//! Capability and pause collaborators consumed by the dispatcher.
//!
//! Role administration itself lives outside this crate. The dispatcher only asks
//! "may `actor` exercise `capability`?" and "is the system paused?".

use crate::core::error::RouterError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Commit,
    Apply,
    Emergency,
    Admin,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Commit => "commit",
            Self::Apply => "apply",
            Self::Emergency => "emergency",
            Self::Admin => "admin",
        };
        f.write_str(name)
    }
}

impl FromStr for Capability {
    type Err = RouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "commit" => Ok(Self::Commit),
            "apply" => Ok(Self::Apply),
            "emergency" => Ok(Self::Emergency),
            "admin" => Ok(Self::Admin),
            other => Err(RouterError::ValidationError(format!(
                "unknown capability '{}'; must be one of: commit, apply, emergency, admin",
                other
            ))),
        }
    }
}

pub trait CapabilityCheck: Send + Sync {
    fn has_capability(&self, actor: &str, capability: Capability) -> bool;
}

/// Maps `Unauthorized` onto a failed check.
pub fn require(
    checker: &dyn CapabilityCheck,
    actor: &str,
    capability: Capability,
) -> Result<(), RouterError> {
    if checker.has_capability(actor, capability) {
        Ok(())
    } else {
        Err(RouterError::Unauthorized {
            actor: actor.to_string(),
            capability: capability.to_string(),
        })
    }
}

/// Static actor -> capability table, usually built from the `[roles]` config section.
#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    grants: BTreeMap<String, BTreeSet<Capability>>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(mut self, actor: &str, capabilities: &[Capability]) -> Self {
        self.grants
            .entry(actor.to_string())
            .or_default()
            .extend(capabilities.iter().copied());
        self
    }

    pub fn from_config(roles: &BTreeMap<String, Vec<String>>) -> Result<Self, RouterError> {
        let mut table = Self::new();
        for (actor, names) in roles {
            let caps = names
                .iter()
                .map(|n| n.parse::<Capability>())
                .collect::<Result<Vec<_>, _>>()?;
            table = table.grant(actor, &caps);
        }
        Ok(table)
    }
}

impl CapabilityCheck for RoleTable {
    fn has_capability(&self, actor: &str, capability: Capability) -> bool {
        self.grants
            .get(actor)
            .is_some_and(|caps| caps.contains(&capability))
    }
}

pub trait PauseSwitch: Send + Sync {
    fn is_paused(&self) -> bool;
    fn set_paused(&self, paused: bool);
}

/// In-process pause flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct PauseFlag {
    paused: Arc<AtomicBool>,
}

impl PauseSwitch for PauseFlag {
    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }
}
