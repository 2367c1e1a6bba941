use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Router,
};
use hostd_common::api::{MigrationTarget, SnapshotPost};
use hostd_instance::{
    InMemoryStore, InstanceRecord, InstanceStore, JsonTransport, RequestContext,
    SnapshotController, TransferEnvelope, SECRET_HEADER,
};
use hostd_operations::{OperationClass, OperationRegistry, OperationStatus, RegistryConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// What the sink saw for one pushed transfer.
#[derive(Debug)]
struct Received {
    operation: String,
    secret: Option<String>,
    envelope: TransferEnvelope,
}

#[derive(Clone)]
struct Sink {
    status: StatusCode,
    tx: mpsc::UnboundedSender<Received>,
}

async fn receive(
    State(sink): State<Sink>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, &'static str) {
    let secret = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Ok(envelope) = serde_json::from_slice(&body) {
        let _ = sink.tx.send(Received {
            operation: id,
            secret,
            envelope,
        });
    }
    let message = if sink.status.is_success() { "ok" } else { "disk full" };
    (sink.status, message)
}

/// Start a migration sink answering every push with `status`.
async fn spawn_sink(status: StatusCode) -> Result<(String, mpsc::UnboundedReceiver<Received>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let address = format!("http://{}", listener.local_addr()?);
    let (tx, rx) = mpsc::unbounded_channel();

    let app = Router::new()
        .route("/1.0/operations/:id", post(receive))
        .with_state(Sink { status, tx });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok((address, rx))
}

async fn controller() -> Result<(Arc<SnapshotController>, Arc<OperationRegistry>)> {
    let store = InMemoryStore::new();
    let mut parent = InstanceRecord::new("default", "c1");
    parent.description = "web frontend".to_string();
    store.insert(parent).await;
    store
        .create_snapshot("default", "c1", "snap0", None, false)
        .await?;

    let registry = OperationRegistry::new(RegistryConfig::default());
    let controller = Arc::new(SnapshotController::new(
        Arc::new(store),
        registry.clone(),
        Arc::new(JsonTransport::new()),
    ));
    Ok((controller, registry))
}

fn push_to(address: &str) -> SnapshotPost {
    let mut secrets = HashMap::new();
    secrets.insert("control".to_string(), "s3cret".to_string());
    SnapshotPost {
        migration: true,
        target: Some(MigrationTarget {
            operation: format!("{address}/1.0/operations/incoming-1"),
            secrets,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_push_delivers_snapshot_to_target() -> Result<()> {
    let (address, mut received) = spawn_sink(StatusCode::OK).await?;
    let (controller, registry) = controller().await?;

    let op = controller
        .post(&RequestContext::new("default"), "c1", "snap0", push_to(&address))
        .await?;
    assert_eq!(op.class(), OperationClass::Task);
    assert!(!op.may_cancel());

    let view = registry
        .wait(&op.id().to_string(), Some(Duration::from_secs(5)))
        .await?;
    assert_eq!(view.status, OperationStatus::Success, "err: {}", view.err);
    let progress = view.metadata.unwrap_or_default();
    assert!(progress["fs_progress"].as_str().unwrap_or("").ends_with(" B"));

    let delivered = received.recv().await.expect("sink saw no transfer");
    assert_eq!(delivered.operation, "incoming-1");
    assert_eq!(delivered.secret.as_deref(), Some("s3cret"));
    assert_eq!(delivered.envelope.name, "c1/snap0");
    assert_eq!(delivered.envelope.snapshot.name, "snap0");
    assert_eq!(delivered.envelope.snapshot.description, "web frontend");
    assert!(delivered.envelope.args.snapshot);
    assert!(!delivered.envelope.live);
    assert!(delivered.envelope.snapshot_only);
    Ok(())
}

#[tokio::test]
async fn test_push_rejected_by_target_fails() -> Result<()> {
    let (address, _received) = spawn_sink(StatusCode::INSUFFICIENT_STORAGE).await?;
    let (controller, registry) = controller().await?;

    let op = controller
        .post(&RequestContext::new("default"), "c1", "snap0", push_to(&address))
        .await?;
    let view = registry
        .wait(&op.id().to_string(), Some(Duration::from_secs(5)))
        .await?;

    assert_eq!(view.status, OperationStatus::Failure);
    assert!(view.err.contains("Migration target rejected transfer (507"));
    assert!(view.err.ends_with("disk full"));
    Ok(())
}
