use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use hostd_common::api::{MigrationTarget, SnapshotPost, SnapshotsPost};
use hostd_instance::*;
use hostd_operations::{
    Channel, OperationClass, OperationRegistry, OperationStatus, OperationView, RegistryConfig,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    store: InMemoryStore,
    controller: Arc<SnapshotController>,
    registry: Arc<OperationRegistry>,
}

async fn harness() -> Harness {
    let store = InMemoryStore::new();
    store.insert(InstanceRecord::new("default", "c1")).await;
    let registry = OperationRegistry::new(RegistryConfig {
        location: "node1".to_string(),
        connect_timeout: Duration::from_secs(5),
        ..RegistryConfig::default()
    });
    let controller = Arc::new(SnapshotController::new(
        Arc::new(store.clone()),
        registry.clone(),
        Arc::new(JsonTransport::new()),
    ));
    Harness {
        store,
        controller,
        registry,
    }
}

fn ctx() -> RequestContext {
    RequestContext::new("default")
}

async fn finish(registry: &OperationRegistry, op: &hostd_operations::Operation) -> OperationView {
    registry
        .wait(&op.id().to_string(), Some(Duration::from_secs(5)))
        .await
        .unwrap()
}

fn named(name: &str) -> SnapshotsPost {
    SnapshotsPost {
        name: name.to_string(),
        ..Default::default()
    }
}

async fn seed_snapshot(h: &Harness, leaf: &str, expires_at: Option<DateTime<Utc>>) {
    h.store
        .create_snapshot("default", "c1", leaf, expires_at, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_auto_name_picks_lowest_unused() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;
    seed_snapshot(&h, "snap2", None).await;

    let op = h
        .controller
        .create(&ctx(), "c1", SnapshotsPost::default())
        .await
        .unwrap();
    let view = finish(&h.registry, &op).await;

    assert_eq!(view.status, OperationStatus::Success);
    assert_eq!(
        view.resources["instances_snapshots"],
        vec!["/1.0/instances/c1/snapshots/snap1"]
    );
    assert!(h.store.exists("default", "c1/snap1").await.unwrap());
}

#[tokio::test]
async fn test_custom_pattern() {
    let h = harness().await;
    h.store
        .insert(InstanceRecord::new("default", "c2").with_expanded_config("snapshots.pattern", "backup-%d"))
        .await;

    let op = h
        .controller
        .create(&ctx(), "c2", SnapshotsPost::default())
        .await
        .unwrap();
    finish(&h.registry, &op).await;
    assert!(h.store.exists("default", "c2/backup-0").await.unwrap());
}

#[tokio::test]
async fn test_create_validation() {
    let h = harness().await;

    let err = h
        .controller
        .create(&ctx(), "c1/snap0", SnapshotsPost::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = h.controller.create(&ctx(), "c1", named("a/b")).await.unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = h
        .controller
        .create(&ctx(), "missing", SnapshotsPost::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 404);

    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_default_expiry_from_config() {
    let h = harness().await;
    h.store
        .insert(
            InstanceRecord::new("default", "c2")
                .with_expanded_config("snapshots.expiry", "1d")
                .with_expanded_config("snapshots.expiry.manual", "2H"),
        )
        .await;

    let before = Utc::now();
    let op = h.controller.create(&ctx(), "c2", named("s")).await.unwrap();
    finish(&h.registry, &op).await;

    let expiry = h.store.load("default", "c2/s").await.unwrap().expires_at.unwrap();
    assert!(expiry >= before + ChronoDuration::hours(2));
    assert!(expiry <= Utc::now() + ChronoDuration::hours(2));
}

#[tokio::test]
async fn test_explicit_expiry_wins_and_bad_policy_is_ignored() {
    let h = harness().await;
    h.store
        .insert(InstanceRecord::new("default", "c2").with_expanded_config("snapshots.expiry", "soon"))
        .await;

    let op = h.controller.create(&ctx(), "c2", named("auto")).await.unwrap();
    assert_eq!(finish(&h.registry, &op).await.status, OperationStatus::Success);
    assert_eq!(h.store.load("default", "c2/auto").await.unwrap().expires_at, None);

    let at = Utc.with_ymd_and_hms(2031, 5, 1, 0, 0, 0).unwrap();
    let req = SnapshotsPost {
        name: "pinned".to_string(),
        expires_at: Some(at),
        stateful: false,
    };
    let op = h.controller.create(&ctx(), "c2", req).await.unwrap();
    finish(&h.registry, &op).await;
    assert_eq!(
        h.store.load("default", "c2/pinned").await.unwrap().expires_at,
        Some(at)
    );
}

#[tokio::test]
async fn test_concurrent_auto_named_creates() {
    let h = harness().await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let controller = h.controller.clone();
        handles.push(tokio::spawn(async move {
            controller.create(&ctx(), "c1", SnapshotsPost::default()).await
        }));
    }

    let mut views = Vec::new();
    for handle in handles {
        let op = handle.await.unwrap().unwrap();
        views.push(finish(&h.registry, &op).await);
    }

    let succeeded = views
        .iter()
        .filter(|v| v.status == OperationStatus::Success)
        .count();
    assert!(succeeded >= 1);
    for view in views.iter().filter(|v| v.status != OperationStatus::Success) {
        assert_eq!(view.status, OperationStatus::Failure);
        assert!(view.err.contains("already in use"));
    }
    assert_eq!(
        h.store.snapshot_names("default", "c1").await.unwrap().len(),
        succeeded
    );
}

#[tokio::test]
async fn test_rename_collision_is_conflict() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;
    seed_snapshot(&h, "snap1", None).await;

    let req = SnapshotPost {
        name: "snap1".to_string(),
        ..Default::default()
    };
    let err = h
        .controller
        .post(&ctx(), "c1", "snap0", req)
        .await
        .unwrap_err();

    assert_eq!(err.status_code(), 409);
    assert_eq!(err.to_string(), "Name 'c1/snap1' already in use");
    assert!(h.registry.is_empty());
    assert!(h.store.exists("default", "c1/snap0").await.unwrap());
}

#[tokio::test]
async fn test_rename_race_fails_operation() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let req = SnapshotPost {
        name: "snap1".to_string(),
        ..Default::default()
    };
    let op = h.controller.post(&ctx(), "c1", "snap0", req).await.unwrap();
    // Taken between validation and the run step.
    seed_snapshot(&h, "snap1", None).await;
    let view = finish(&h.registry, &op).await;

    assert_eq!(view.status, OperationStatus::Failure);
    assert_eq!(view.err, "Name 'c1/snap1' already in use");
    assert!(h.store.exists("default", "c1/snap0").await.unwrap());
    assert_eq!(
        view.resources["instances_snapshots"],
        vec!["/1.0/instances/c1/snapshots/snap0"]
    );
}

#[tokio::test]
async fn test_rename() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let err = h
        .controller
        .post(&ctx(), "c1", "snap0", SnapshotPost::default())
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let req = SnapshotPost {
        name: "nightly".to_string(),
        ..Default::default()
    };
    let op = h.controller.post(&ctx(), "c1", "snap0", req).await.unwrap();
    assert_eq!(finish(&h.registry, &op).await.status, OperationStatus::Success);
    assert!(h.store.exists("default", "c1/nightly").await.unwrap());
    assert!(!h.store.exists("default", "c1/snap0").await.unwrap());
}

#[tokio::test]
async fn test_delete() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let op = h.controller.delete(&ctx(), "c1", "snap0").await.unwrap();
    let view = finish(&h.registry, &op).await;
    assert_eq!(view.status, OperationStatus::Success);
    assert_eq!(view.description, "Deleting snapshot");
    assert!(!h.store.exists("default", "c1/snap0").await.unwrap());

    let err = h.controller.delete(&ctx(), "c1", "snap0").await.unwrap_err();
    assert_eq!(err.status_code(), 404);
}

#[tokio::test]
async fn test_update_without_expiry_is_noop() {
    let h = harness().await;
    let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
    seed_snapshot(&h, "snap0", Some(at)).await;

    for body in [&b"{}"[..], &br#"{"expires_at":null}"#[..], &b""[..]] {
        let op = h
            .controller
            .update(&ctx(), "c1", "snap0", None, body)
            .await
            .unwrap();
        assert_eq!(finish(&h.registry, &op).await.status, OperationStatus::Success);
    }
    assert_eq!(
        h.store.load("default", "c1/snap0").await.unwrap().expires_at,
        Some(at)
    );
}

#[tokio::test]
async fn test_update_with_matching_etag() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let (_, etag) = h.controller.get(&ctx(), "c1", "snap0").await.unwrap();
    let op = h
        .controller
        .update(
            &ctx(),
            "c1",
            "snap0",
            Some(&format!("\"{etag}\"")),
            br#"{"expires_at":"2030-06-01T12:00:00Z"}"#,
        )
        .await
        .unwrap();
    assert_eq!(finish(&h.registry, &op).await.status, OperationStatus::Success);

    let (snapshot, new_etag) = h.controller.get(&ctx(), "c1", "snap0").await.unwrap();
    assert_eq!(
        snapshot.expires_at,
        Some(Utc.with_ymd_and_hms(2030, 6, 1, 12, 0, 0).unwrap())
    );
    assert_ne!(etag, new_etag);
}

#[tokio::test]
async fn test_stale_etag_rejected_before_decoding() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let err = h
        .controller
        .update(&ctx(), "c1", "snap0", Some("stale"), b"{not json")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 412);

    let err = h
        .controller
        .update(&ctx(), "c1", "snap0", None, b"{not json")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_listing() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let op = h
        .controller
        .create(&ctx(), "c1", SnapshotsPost::default())
        .await
        .unwrap();
    let view = finish(&h.registry, &op).await;
    assert_eq!(
        view.resources["instances_snapshots"],
        vec!["/1.0/instances/c1/snapshots/snap1"]
    );

    match h.controller.list(&ctx(), "c1", false).await.unwrap() {
        SnapshotListing::Urls(urls) => assert_eq!(
            urls,
            vec![
                "/1.0/instances/c1/snapshots/snap0",
                "/1.0/instances/c1/snapshots/snap1"
            ]
        ),
        other => panic!("unexpected listing {other:?}"),
    }

    match h.controller.list(&ctx(), "c1", true).await.unwrap() {
        SnapshotListing::Full(snapshots) => {
            let names: Vec<_> = snapshots.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["snap0", "snap1"]);
        }
        other => panic!("unexpected listing {other:?}"),
    }
}

#[tokio::test]
async fn test_listing_in_other_project() {
    let h = harness().await;
    h.store.insert(InstanceRecord::new("prod", "db")).await;
    h.store
        .create_snapshot("prod", "db", "snap0", None, false)
        .await
        .unwrap();

    match h
        .controller
        .list(&RequestContext::new("prod"), "db", false)
        .await
        .unwrap()
    {
        SnapshotListing::Urls(urls) => {
            assert_eq!(urls, vec!["/1.0/instances/db/snapshots/snap0?project=prod"])
        }
        other => panic!("unexpected listing {other:?}"),
    }
}

/// Store whose loads of one snapshot always fail.
struct FlakyStore {
    inner: InMemoryStore,
    broken: String,
}

#[async_trait]
impl InstanceStore for FlakyStore {
    async fn load(&self, project: &str, name: &str) -> Result<InstanceRecord> {
        if name == self.broken {
            return Err(HostdError::internal("disk error"));
        }
        self.inner.load(project, name).await
    }

    async fn exists(&self, project: &str, name: &str) -> Result<bool> {
        self.inner.exists(project, name).await
    }

    async fn snapshot_names(&self, project: &str, instance: &str) -> Result<Vec<String>> {
        self.inner.snapshot_names(project, instance).await
    }

    async fn create_snapshot(
        &self,
        project: &str,
        instance: &str,
        leaf: &str,
        expires_at: Option<DateTime<Utc>>,
        stateful: bool,
    ) -> Result<InstanceRecord> {
        self.inner
            .create_snapshot(project, instance, leaf, expires_at, stateful)
            .await
    }

    async fn rename_instance(&self, project: &str, name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_instance(project, name, new_name).await
    }

    async fn delete_instance(&self, project: &str, name: &str) -> Result<()> {
        self.inner.delete_instance(project, name).await
    }

    async fn update_instance(
        &self,
        project: &str,
        name: &str,
        args: InstanceArgs,
        structural: bool,
    ) -> Result<()> {
        self.inner.update_instance(project, name, args, structural).await
    }
}

#[tokio::test]
async fn test_recursive_listing_skips_failures() {
    let inner = InMemoryStore::new();
    inner.insert(InstanceRecord::new("default", "c1")).await;
    for leaf in ["snap0", "snap1", "snap2"] {
        inner
            .create_snapshot("default", "c1", leaf, None, false)
            .await
            .unwrap();
    }
    let controller = SnapshotController::new(
        Arc::new(FlakyStore {
            inner,
            broken: "c1/snap1".to_string(),
        }),
        OperationRegistry::new(RegistryConfig::default()),
        Arc::new(JsonTransport::new()),
    );

    match controller.list(&ctx(), "c1", true).await.unwrap() {
        SnapshotListing::Full(snapshots) => {
            let names: Vec<_> = snapshots.iter().map(|s| s.name.as_str()).collect();
            assert_eq!(names, vec!["snap0", "snap2"]);
        }
        other => panic!("unexpected listing {other:?}"),
    }

    let err = controller.get(&ctx(), "c1", "snap1").await.unwrap_err();
    assert_eq!(err.status_code(), 500);
}

#[tokio::test]
async fn test_live_push_with_rename_creates_no_operation() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let req = SnapshotPost {
        name: "other".to_string(),
        migration: true,
        live: true,
        target: Some(MigrationTarget {
            operation: "https://node2:8443/1.0/operations/abc".to_string(),
            ..Default::default()
        }),
    };
    let err = h.controller.post(&ctx(), "c1", "snap0", req).await.unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert_eq!(
        err.to_string(),
        "Instance name cannot be changed during stateful copy"
    );
    assert!(h.registry.is_empty());
}

#[tokio::test]
async fn test_pull_migration_streams_to_peer() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let req = SnapshotPost {
        migration: true,
        ..Default::default()
    };
    let op = h.controller.post(&ctx(), "c1", "snap0", req).await.unwrap();
    let view = op.view();

    assert_eq!(view.class, OperationClass::Websocket);
    assert_eq!(view.description, "Transferring snapshot");
    assert!(view.may_cancel);
    assert_eq!(view.resources["instances"], vec!["/1.0/instances/c1"]);
    assert_eq!(
        view.resources["instances_snapshots"],
        vec!["/1.0/instances/c1/snapshots/snap0"]
    );

    let metadata = view.metadata.unwrap();
    let control_secret = metadata["control"].as_str().unwrap().to_string();
    let fs_secret = metadata["fs"].as_str().unwrap().to_string();
    assert!(metadata.get("state").is_none());

    let id = op.id().to_string();
    let (ours, mut peer_control) = Channel::pair();
    h.registry.connect(&id, &control_secret, ours).await.unwrap();
    let (ours, mut peer_fs) = Channel::pair();
    h.registry.connect(&id, &fs_secret, ours).await.unwrap();

    let header: TransferEnvelope =
        serde_json::from_slice(&peer_control.recv().await.unwrap()).unwrap();
    assert_eq!(header.name, "c1/snap0");
    assert!(header.snapshot_only);
    assert!(peer_fs.recv().await.is_some());
    peer_control
        .send(serde_json::to_vec(&TransferAck { success: true, message: String::new() }).unwrap())
        .await
        .unwrap();

    let view = finish(&h.registry, &op).await;
    assert_eq!(view.status, OperationStatus::Success);
    assert!(view.metadata.unwrap()["fs_progress"].is_string());
}

#[tokio::test]
async fn test_pull_migration_cancel_while_waiting() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let req = SnapshotPost {
        migration: true,
        ..Default::default()
    };
    let op = h.controller.post(&ctx(), "c1", "snap0", req).await.unwrap();
    let id = op.id().to_string();
    let secret = op.metadata().unwrap()["control"].as_str().unwrap().to_string();

    let (ours, mut peer) = Channel::pair();
    h.registry.connect(&id, &secret, ours).await.unwrap();

    let view = h.registry.cancel(&id).await.unwrap();
    assert_eq!(view.status, OperationStatus::Cancelled);
    assert!(peer.recv().await.is_none());
}

#[tokio::test]
async fn test_push_to_unreachable_target_fails() {
    let h = harness().await;
    seed_snapshot(&h, "snap0", None).await;

    let mut secrets = std::collections::HashMap::new();
    secrets.insert("control".to_string(), "abc".to_string());
    let req = SnapshotPost {
        migration: true,
        target: Some(MigrationTarget {
            operation: "http://127.0.0.1:1/1.0/operations/abc".to_string(),
            secrets,
            ..Default::default()
        }),
        ..Default::default()
    };
    let op = h.controller.post(&ctx(), "c1", "snap0", req).await.unwrap();
    assert_eq!(op.class(), OperationClass::Task);

    let view = finish(&h.registry, &op).await;
    assert_eq!(view.status, OperationStatus::Failure);
    assert!(view.err.contains("Failed to reach migration target"));
}
