use modroute::core::config::StoreConfig;
use modroute::core::error::RouterError;
use modroute::core::hash::{ModuleAddress, sha256};
use modroute::core::store::Store;
use modroute::plugins::module_store::{
    ModuleStore, derive_address, modules_db_path, modules_events_path, wrap,
};
use rusqlite::{Connection, params};
use tempfile::tempdir;

fn test_store(identity: &str) -> (tempfile::TempDir, ModuleStore) {
    let tmp = tempdir().unwrap();
    let store = Store::new(identity, tmp.path());
    let modules = ModuleStore::open(store, StoreConfig::default()).unwrap();
    (tmp, modules)
}

#[test]
fn test_predict_matches_stage_and_is_deterministic() {
    let (_tmp, modules) = test_store("prod");
    let blob = b"payload module v1".to_vec();

    let predicted = modules.predict(&blob);
    assert_eq!(predicted, modules.predict(&blob));

    let staged = modules.stage("deployer", &blob).unwrap();
    assert_eq!(staged.address, predicted);
    assert_eq!(staged.content_hash, sha256(&blob));
    assert!(staged.deployed);
    assert_eq!(modules.read(&staged.address).unwrap(), blob);
}

#[test]
fn test_same_identity_in_another_root_derives_same_address() {
    let (_a, first) = test_store("prod");
    let (_b, second) = test_store("prod");
    let (_c, other) = test_store("staging");
    let blob = b"shared".to_vec();

    assert_eq!(first.predict(&blob), second.predict(&blob));
    assert_ne!(first.predict(&blob), other.predict(&blob));
}

#[test]
fn test_restaging_is_a_noop() {
    let (_tmp, modules) = test_store("prod");
    let first = modules.stage("deployer", b"abc").unwrap();
    let second = modules.stage("someone-else", b"abc").unwrap();

    assert_eq!(first.address, second.address);
    assert!(first.deployed);
    assert!(!second.deployed);
    assert_eq!(modules.module_count().unwrap(), 1);
    assert_eq!(modules.read_events().unwrap().len(), 1);
}

#[test]
fn test_exists_before_and_after_staging() {
    let (_tmp, modules) = test_store("prod");
    let blob = b"\x60\x80\x60\x40".to_vec();
    let (predicted, content_hash) = derive_address(&modules.namespace(), &blob);

    assert!(!modules.exists(&content_hash).unwrap());
    assert!(modules.code_at(&predicted).unwrap().is_none());

    let staged = modules.stage("deployer", &blob).unwrap();
    assert_eq!(staged.address, predicted);
    assert!(modules.exists(&content_hash).unwrap());
    assert_eq!(modules.address_of(&content_hash).unwrap(), Some(predicted));
}

#[test]
fn test_exists_rejects_tampered_code() {
    let (tmp, modules) = test_store("prod");
    let staged = modules.stage("deployer", b"original").unwrap();

    let conn = Connection::open(modules_db_path(tmp.path())).unwrap();
    conn.execute(
        "UPDATE modules SET code = ?1 WHERE address = ?2",
        params![wrap(b"tampered"), staged.address.to_hex()],
    )
    .unwrap();
    drop(conn);

    assert!(!modules.exists(&staged.content_hash).unwrap());
}

#[test]
fn test_batch_is_all_or_nothing() {
    let (_tmp, modules) = test_store("prod");
    let oversized = vec![0u8; modules.config().max_blob_bytes + 1];
    let batch = vec![b"one".to_vec(), b"two".to_vec(), oversized];

    let err = modules.stage_batch("deployer", &batch).unwrap_err();
    assert!(matches!(err, RouterError::SizeExceeded(_)));
    assert_eq!(modules.module_count().unwrap(), 0);
    assert!(modules.read_events().unwrap().is_empty());

    let ok = modules
        .stage_batch("deployer", &[b"one".to_vec(), b"two".to_vec()])
        .unwrap();
    assert_eq!(ok.len(), 2);
    assert_eq!(modules.module_count().unwrap(), 2);
}

#[test]
fn test_batch_with_empty_member_rolls_back() {
    let (_tmp, modules) = test_store("prod");
    let err = modules
        .stage_batch("deployer", &[b"fine".to_vec(), Vec::new()])
        .unwrap_err();
    assert!(matches!(err, RouterError::ValidationError(_)));
    assert_eq!(modules.module_count().unwrap(), 0);
}

#[test]
fn test_failed_deploy_log_rolls_back_staging() {
    let (tmp, modules) = test_store("prod");
    let log = modules_events_path(tmp.path());
    std::fs::create_dir_all(&log).unwrap();

    assert!(matches!(
        modules.stage("deployer", b"single"),
        Err(RouterError::IoError(_))
    ));
    assert!(matches!(
        modules.stage_batch("deployer", &[b"one".to_vec(), b"two".to_vec()]),
        Err(RouterError::IoError(_))
    ));
    assert_eq!(modules.module_count().unwrap(), 0);
    assert!(!modules.exists(&sha256(b"single")).unwrap());

    std::fs::remove_dir(&log).unwrap();
    let staged = modules
        .stage_batch("deployer", &[b"one".to_vec(), b"two".to_vec()])
        .unwrap();
    assert!(staged.iter().all(|m| m.deployed));
    assert_eq!(modules.read_events().unwrap().len(), 2);
}

#[test]
fn test_batch_limits() {
    let tmp = tempdir().unwrap();
    let config = StoreConfig {
        max_batch_blobs: 2,
        ..StoreConfig::default()
    };
    let modules = ModuleStore::open(Store::new("prod", tmp.path()), config).unwrap();

    let empty: Vec<Vec<u8>> = Vec::new();
    assert!(matches!(
        modules.stage_batch("deployer", &empty),
        Err(RouterError::ValidationError(_))
    ));
    let three = vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()];
    assert!(matches!(
        modules.stage_batch("deployer", &three),
        Err(RouterError::SizeExceeded(_))
    ));
}

#[test]
fn test_blob_at_limit_is_accepted() {
    let (_tmp, modules) = test_store("prod");
    let at_limit = vec![7u8; modules.config().max_blob_bytes];
    assert!(modules.stage("deployer", &at_limit).unwrap().deployed);
    assert!(matches!(
        modules.stage("deployer", &[]),
        Err(RouterError::ValidationError(_))
    ));
}

#[test]
fn test_read_range_and_missing_module() {
    let (_tmp, modules) = test_store("prod");
    let staged = modules.stage("deployer", b"0123456789").unwrap();

    assert_eq!(modules.read_range(&staged.address, 2, 3).unwrap(), b"234");
    assert!(modules.read_range(&staged.address, 8, 5).is_err());
    assert!(matches!(
        modules.read(&ModuleAddress([9u8; 20])),
        Err(RouterError::NotFound(_))
    ));
}
