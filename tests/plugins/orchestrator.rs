use modroute::core::capability::{Capability, PauseFlag, RoleTable};
use modroute::core::config::{RouterConfig, StoreConfig};
use modroute::core::error::RouterError;
use modroute::core::hash::{Hash256, ModuleAddress, Selector, fingerprint, sha256};
use modroute::core::store::Store;
use modroute::core::time::ManualClock;
use modroute::plugins::merkle::{MerkleProof, OrderedMerkleTree, Route};
use modroute::plugins::module_host::{CallContext, ModuleHandler, StoreModuleHost};
use modroute::plugins::module_store::ModuleStore;
use modroute::plugins::orchestrator::{
    ManifestControl, ManifestOp, ModuleStaging, Orchestrator, PlanStatus,
};
use modroute::plugins::router::{ActiveManifest, PendingManifest, Router, RouterDeps};
use std::cell::Cell;
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

const DELAY: u64 = 600;
const BOT: &str = "release-bot";

fn echo(tag: &'static str) -> ModuleHandler {
    Arc::new(move |_: &CallContext, payload: &[u8]| -> Result<Vec<u8>, String> {
        let mut out = tag.as_bytes().to_vec();
        out.extend_from_slice(payload);
        Ok(out)
    })
}

fn setup(blobs: &[&[u8]]) -> (TempDir, ManualClock, Orchestrator<ModuleStore, Router>) {
    let tmp = tempdir().unwrap();
    let store = ModuleStore::open(Store::new("prod", tmp.path()), StoreConfig::default()).unwrap();
    let mut host = StoreModuleHost::new(store.clone());
    for blob in blobs {
        host = host.register(fingerprint(blob), echo("ok:"));
    }
    let clock = ManualClock::at(0);
    let deps = RouterDeps {
        capabilities: Box::new(
            RoleTable::new().grant(BOT, &[Capability::Commit, Capability::Apply]),
        ),
        pause: Box::new(PauseFlag::default()),
        clock: Box::new(clock.clone()),
        host: Box::new(host),
    };
    let config = RouterConfig {
        activation_delay_secs: DELAY,
        ..RouterConfig::default()
    };
    let router = Router::open(tmp.path(), config, deps).unwrap();
    let orch = Orchestrator::open(tmp.path(), BOT, store, router).unwrap();
    (tmp, clock, orch)
}

fn build(routes: &[Route]) -> (Hash256, Vec<MerkleProof>) {
    let tree = OrderedMerkleTree::from_routes(routes).unwrap();
    let proofs = (0..routes.len()).map(|i| tree.prove(i).unwrap()).collect();
    (tree.root(), proofs)
}

#[test]
fn test_full_plan_flow() {
    let blobs: [&[u8]; 2] = [b"module alpha", b"module beta"];
    let (_tmp, clock, mut orch) = setup(&blobs);

    let plan = orch.start_plan("release-1", 10).unwrap();
    assert_eq!(plan.status, PlanStatus::Open);
    assert_eq!(plan.remaining(), 10);

    let owned: Vec<Vec<u8>> = blobs.iter().map(|b| b.to_vec()).collect();
    let addresses = orch.stage_batch("release-1", &owned).unwrap();
    assert_eq!(addresses[0], orch.store().predict(blobs[0]));
    assert_eq!(addresses[1], orch.store().predict(blobs[1]));

    let routes = [
        Route::new(Selector::from_u32(0xAA), addresses[0], fingerprint(blobs[0])),
        Route::new(Selector::from_u32(0xBB), addresses[1], fingerprint(blobs[1])),
    ];
    let (root, proofs) = build(&routes);

    orch.commit_manifest("release-1", root, 1).unwrap();
    let pending_root = orch
        .submit_manifest_update("release-1", &routes, &proofs)
        .unwrap();
    assert_eq!(pending_root, root);

    assert!(matches!(
        orch.activate_manifest("release-1", 1),
        Err(RouterError::NotReady(_))
    ));
    clock.advance(DELAY);
    let active = orch.activate_manifest("release-1", 1).unwrap();
    assert_eq!(active.root, root);

    let out = orch
        .dispatcher()
        .dispatch(&CallContext::from_caller("user"), Selector::from_u32(0xBB), b"!")
        .unwrap();
    assert_eq!(out, b"ok:!");

    let done = orch.complete("release-1", true).unwrap();
    assert_eq!(done.status, PlanStatus::Succeeded);
    assert!(done.completed_at.is_some());

    let stored = orch.get_plan("release-1").unwrap().unwrap();
    assert_eq!(stored.spent, 4);
    assert_eq!(stored.staged, addresses);
    assert_eq!(stored.last_root, Some(root));
    assert_eq!(
        stored.operations,
        vec![
            ManifestOp::Commit { epoch: 1, root },
            ManifestOp::Apply {
                root,
                selectors: vec![Selector::from_u32(0xAA), Selector::from_u32(0xBB)],
            },
            ManifestOp::Activate { epoch: 1, root },
        ]
    );

    let events = orch.read_events().unwrap();
    assert!(events.iter().any(|e| e.op == "activate" && e.status == "error"));
    assert!(events.iter().any(|e| e.op == "complete" && e.status == "ok"));
}

#[test]
fn test_completed_plans_are_immutable() {
    let (_tmp, _clock, mut orch) = setup(&[]);
    orch.start_plan("p1", 5).unwrap();
    orch.complete("p1", false).unwrap();

    assert!(matches!(
        orch.stage_batch("p1", &[b"x".to_vec()]),
        Err(RouterError::ValidationError(_))
    ));
    assert!(matches!(
        orch.commit_manifest("p1", sha256(b"r"), 1),
        Err(RouterError::ValidationError(_))
    ));
    assert!(matches!(
        orch.complete("p1", true),
        Err(RouterError::ValidationError(_))
    ));
    assert_eq!(
        orch.get_plan("p1").unwrap().unwrap().status,
        PlanStatus::Failed
    );
}

#[test]
fn test_plan_ids_and_duplicates() {
    let (_tmp, _clock, orch) = setup(&[]);
    orch.start_plan("p1", 1).unwrap();
    assert!(matches!(
        orch.start_plan("p1", 1),
        Err(RouterError::ValidationError(_))
    ));
    assert!(matches!(
        orch.start_plan("bad id!", 1),
        Err(RouterError::ValidationError(_))
    ));
    assert!(matches!(
        orch.start_plan("p2", 0),
        Err(RouterError::ValidationError(_))
    ));
    assert!(matches!(
        orch.stage_batch("missing", &[b"x".to_vec()]),
        Err(RouterError::NotFound(_))
    ));
    assert_eq!(orch.list_plans().unwrap().len(), 1);
}

#[test]
fn test_budget_beyond_storable_range_is_rejected() {
    let (_tmp, _clock, orch) = setup(&[]);
    for budget in [u64::MAX, i64::MAX as u64 + 1] {
        assert!(matches!(
            orch.start_plan("big", budget),
            Err(RouterError::ValidationError(_))
        ));
    }
    assert!(orch.get_plan("big").unwrap().is_none());

    let plan = orch.start_plan("big", i64::MAX as u64).unwrap();
    assert_eq!(plan.budget, i64::MAX as u64);
    orch.stage_batch("big", &[b"blob".to_vec()]).unwrap();
    assert_eq!(
        orch.get_plan("big").unwrap().unwrap().remaining(),
        i64::MAX as u64 - 1
    );
}

#[test]
fn test_budget_exceeded_before_delegation() {
    let (_tmp, _clock, orch) = setup(&[]);
    orch.start_plan("tight", 2).unwrap();

    let err = orch
        .stage_batch("tight", &[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])
        .unwrap_err();
    assert!(matches!(err, RouterError::SizeExceeded(_)));
    assert_eq!(orch.store().module_count().unwrap(), 0);

    orch.stage_batch("tight", &[b"a".to_vec(), b"b".to_vec()])
        .unwrap();
    assert!(matches!(
        orch.stage_batch("tight", &[b"c".to_vec()]),
        Err(RouterError::SizeExceeded(_))
    ));
    assert_eq!(orch.get_plan("tight").unwrap().unwrap().remaining(), 0);
}

#[test]
fn test_failed_delegation_leaves_plan_unchanged() {
    let (_tmp, _clock, orch) = setup(&[]);
    orch.start_plan("p", 10).unwrap();
    let oversized = vec![0u8; StoreConfig::default().max_blob_bytes + 1];

    assert!(orch.stage_batch("p", &[b"ok".to_vec(), oversized]).is_err());
    let plan = orch.get_plan("p").unwrap().unwrap();
    assert_eq!(plan.spent, 0);
    assert!(plan.staged.is_empty());
    assert_eq!(orch.store().module_count().unwrap(), 0);
}

#[derive(Default)]
struct CountingStaging {
    calls: Cell<usize>,
}

impl ModuleStaging for CountingStaging {
    fn stage_blobs(
        &self,
        _actor: &str,
        blobs: &[Vec<u8>],
    ) -> Result<Vec<ModuleAddress>, RouterError> {
        self.calls.set(self.calls.get() + 1);
        Ok(blobs.iter().map(|b| ModuleAddress([b.len() as u8; 20])).collect())
    }
}

#[derive(Default)]
struct RecordingControl {
    applied: usize,
}

impl ManifestControl for RecordingControl {
    fn commit_root(
        &mut self,
        _actor: &str,
        root: Hash256,
        epoch: u64,
    ) -> Result<PendingManifest, RouterError> {
        Ok(PendingManifest {
            epoch,
            root,
            committed_at: 0,
            earliest_activation: 0,
        })
    }

    fn apply(
        &mut self,
        _actor: &str,
        routes: &[Route],
        _proofs: &[MerkleProof],
    ) -> Result<Hash256, RouterError> {
        self.applied += routes.len();
        Ok(sha256(b"pending"))
    }

    fn activate(&mut self, _actor: &str, epoch: u64) -> Result<ActiveManifest, RouterError> {
        Ok(ActiveManifest {
            epoch,
            root: sha256(b"pending"),
            activated_at: 0,
        })
    }
}

#[test]
fn test_orchestrator_works_through_traits_only() {
    let tmp = tempdir().unwrap();
    let mut orch = Orchestrator::open(
        tmp.path(),
        BOT,
        CountingStaging::default(),
        RecordingControl::default(),
    )
    .unwrap();
    orch.start_plan("mocked", 3).unwrap();

    assert!(orch.stage_batch("mocked", &vec![vec![1u8; 4]; 4]).is_err());
    assert_eq!(orch.store().calls.get(), 0);
    orch.stage_batch("mocked", &[vec![1u8; 4]]).unwrap();
    assert_eq!(orch.store().calls.get(), 1);

    let route = Route::new(Selector::from_u32(1), ModuleAddress([4u8; 20]), sha256(b"c"));
    let proofs = [MerkleProof::default(), MerkleProof::default()];
    assert!(matches!(
        orch.submit_manifest_update("mocked", &[route, route], &proofs),
        Err(RouterError::SizeExceeded(_))
    ));
    assert_eq!(orch.dispatcher().applied, 0);

    orch.submit_manifest_update("mocked", &[route], &proofs[..1])
        .unwrap();
    assert_eq!(orch.dispatcher().applied, 1);
    assert_eq!(orch.get_plan("mocked").unwrap().unwrap().remaining(), 1);
}
