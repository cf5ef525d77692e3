//! Centralized database schema definitions and ledger file names.
//!
//! modroute keeps two SQLite databases under a data root:
//! 1. modules.db: content-addressed module code (append-only).
//! 2. orchestrator.db: orchestration plans.
//!
//! Dispatcher state is event-sourced from `router.events.jsonl` instead of a table.

pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";

// --- 1. Modules ---
pub const MODULES_DB_NAME: &str = "modules.db";
pub const MODULES_EVENTS_NAME: &str = "modules.events.jsonl";

pub const MODULES_DB_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS modules (
        address TEXT PRIMARY KEY,
        content_hash TEXT NOT NULL UNIQUE,
        code BLOB NOT NULL,
        byte_size INTEGER NOT NULL,
        created_at TEXT NOT NULL
    )
";

// --- 2. Router ---
pub const ROUTER_EVENTS_NAME: &str = "router.events.jsonl";

// --- 3. Orchestrator ---
pub const ORCHESTRATOR_DB_NAME: &str = "orchestrator.db";
pub const ORCHESTRATOR_EVENTS_NAME: &str = "orchestrator.events.jsonl";

pub const ORCHESTRATOR_DB_SCHEMA_PLANS: &str = "
    CREATE TABLE IF NOT EXISTS plans (
        plan_id TEXT PRIMARY KEY,
        budget INTEGER NOT NULL,
        spent INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'open', -- open, succeeded, failed
        staged TEXT NOT NULL DEFAULT '[]', -- JSON array of module addresses
        operations TEXT NOT NULL DEFAULT '[]', -- JSON array of manifest operations
        last_root TEXT,
        created_at TEXT NOT NULL,
        completed_at TEXT
    )
";
