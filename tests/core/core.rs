use modroute::core::broker::{BrokerEvent, DbBroker};
use modroute::core::capability::{Capability, CapabilityCheck, PauseFlag};
use modroute::core::config::{self, ModrouteConfig, StoreConfig};
use modroute::core::db;
use modroute::core::error::RouterError;
use modroute::core::hash::{Selector, fingerprint};
use modroute::core::ledger;
use modroute::core::store::Store;
use modroute::core::time::ManualClock;
use modroute::plugins::merkle::{OrderedMerkleTree, Route};
use modroute::plugins::module_host::{CallContext, ModuleHandler, StoreModuleHost};
use modroute::plugins::module_store::ModuleStore;
use modroute::{PROJECT_DIR, Project, find_project_root, initialize_data_root};
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn connections_are_hardened_and_store_writes_are_audited() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path();
    initialize_data_root(root).expect("init");

    let conn = db::db_connect(&root.join("modules.db").to_string_lossy()).expect("db connect");
    let fk_on: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .expect("pragma foreign_keys");
    assert_eq!(fk_on, 1);
    let mode: String = conn
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .expect("pragma journal_mode");
    assert_eq!(mode.to_lowercase(), "wal");
    drop(conn);

    let modules = ModuleStore::open(Store::new("audit", root), StoreConfig::default()).unwrap();
    modules.stage("deployer", b"blob").unwrap();
    assert!(modules.stage("deployer", b"").is_err());

    let broker = DbBroker::new(root);
    let events: Vec<BrokerEvent> =
        ledger::read_jsonl(broker.audit_log_path()).expect("read audit");
    let stage_events: Vec<&BrokerEvent> =
        events.iter().filter(|ev| ev.op == "modules.stage").collect();
    assert_eq!(stage_events.len(), 2);
    assert!(stage_events.iter().all(|ev| ev.db_id == "modules.db" && ev.actor == "deployer"));
    assert_eq!(stage_events[0].status, "success");
    assert_eq!(stage_events[1].error.as_deref(), Some("VALIDATION"));
    assert!(events.iter().any(|ev| ev.op == "orchestrator.init"));
}

#[test]
fn config_file_overrides_defaults_per_section() {
    let tmp = tempdir().expect("tempdir");
    fs::create_dir_all(tmp.path().join(PROJECT_DIR)).unwrap();
    fs::write(
        config::config_path(tmp.path()),
        r#"
[store]
identity = "mainnet"

[router]
activation_delay_secs = 60

[roles]
ops = ["commit", "apply"]
"#,
    )
    .unwrap();

    let loaded = config::load_config(tmp.path()).expect("load config");
    assert_eq!(loaded.store.identity, "mainnet");
    assert_eq!(loaded.store.max_blob_bytes, config::DEFAULT_MAX_BLOB_BYTES);
    assert_eq!(loaded.router.activation_delay_secs, 60);
    assert_eq!(
        loaded.router.max_touched_selectors,
        config::DEFAULT_MAX_TOUCHED_SELECTORS
    );
    assert_eq!(loaded.roles["ops"], vec!["commit", "apply"]);
}

#[test]
fn invalid_config_is_rejected() {
    assert!(ModrouteConfig::from_toml_str("[store]\nidentity = \"\"\n").is_err());
    assert!(ModrouteConfig::from_toml_str("[router]\nmax_routes_per_apply = 0\n").is_err());
    assert!(ModrouteConfig::from_toml_str("[router\n").is_err());
}

#[test]
fn data_root_initializes_every_subsystem() {
    let tmp = tempdir().expect("tempdir");
    let data = tmp.path().join("data");
    let names = initialize_data_root(&data).expect("init");
    assert_eq!(names, vec!["modules", "orchestrator"]);
    assert!(data.join("modules.db").exists());
    assert!(data.join("orchestrator.db").exists());
    // idempotent
    initialize_data_root(&data).expect("re-init");
}

#[test]
fn project_root_is_found_from_nested_directories() {
    let tmp = tempdir().expect("tempdir");
    let nested = tmp.path().join("a").join("b");
    fs::create_dir_all(&nested).unwrap();
    assert!(matches!(
        find_project_root(&nested),
        Err(RouterError::NotFound(_))
    ));

    fs::create_dir_all(tmp.path().join(PROJECT_DIR)).unwrap();
    assert_eq!(find_project_root(&nested).unwrap(), tmp.path());
}

#[test]
fn project_wires_store_roles_and_router() {
    let tmp = tempdir().expect("tempdir");
    fs::create_dir_all(tmp.path().join(PROJECT_DIR)).unwrap();
    fs::write(
        config::config_path(tmp.path()),
        "[router]\nactivation_delay_secs = 10\n\n[roles]\nops = [\"commit\", \"apply\", \"admin\"]\n",
    )
    .unwrap();

    let project = Project::open(tmp.path()).expect("open project");
    let roles = project.role_table().unwrap();
    assert!(roles.has_capability("ops", Capability::Apply));
    assert!(!roles.has_capability("ops", Capability::Emergency));

    let modules = project.module_store().unwrap();
    let blob = b"payload".to_vec();
    let staged = modules.stage("ops", &blob).unwrap();

    let handler: ModuleHandler =
        Arc::new(|_: &CallContext, payload: &[u8]| -> Result<Vec<u8>, String> {
            Ok(payload.iter().rev().copied().collect())
        });
    let host = StoreModuleHost::new(modules.clone()).register(fingerprint(&blob), handler);
    let clock = ManualClock::at(0);
    let mut router = project
        .open_router(
            Box::new(PauseFlag::default()),
            Box::new(clock.clone()),
            Box::new(host),
        )
        .unwrap();

    let route = Route::new(Selector::from_u32(1), staged.address, fingerprint(&blob));
    let tree = OrderedMerkleTree::from_routes(&[route]).unwrap();
    router.commit("ops", tree.root(), 1).unwrap();
    router
        .apply_routes("ops", &[route], &[tree.prove(0).unwrap()])
        .unwrap();
    clock.advance(10);
    router.activate_committed_root("ops", 1).unwrap();

    let out = router
        .dispatch(&CallContext::from_caller("u"), Selector::from_u32(1), b"abc")
        .unwrap();
    assert_eq!(out, b"cba");
    assert!(project.data_root().join("router.events.jsonl").exists());
}
