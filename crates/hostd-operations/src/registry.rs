use chrono::Utc;
use dashmap::DashMap;
use hostd_common::{HostdError, Result};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::operation::{NewOperation, OperationContext, OperationKind, OperationState};
use crate::{Channel, Operation, OperationStatus, OperationView};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Node name reported as every operation's `location`.
    pub location: String,
    /// How long terminal operations stay visible.
    pub retention: Duration,
    /// How long a websocket operation waits for all of its peers.
    pub connect_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            location: "local".to_string(),
            retention: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Process-wide store of operations.
pub struct OperationRegistry {
    operations: DashMap<Uuid, Arc<Operation>>,
    config: RegistryConfig,
}

impl OperationRegistry {
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            operations: DashMap::new(),
            config,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register an operation and schedule its run step.
    ///
    /// Returns while the operation is still `Pending`. Must be called from
    /// within a tokio runtime.
    pub fn create(&self, new: NewOperation) -> Result<Arc<Operation>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| HostdError::internal("No async runtime available to run operations"))?;

        let op = Arc::new(Operation::new(new, &self.config.location));
        self.operations.insert(op.id(), op.clone());

        info!(
            operation_id = %op.id(),
            project = %op.project(),
            class = ?op.class(),
            "Created operation: {}",
            op.op_type().description()
        );

        runtime.spawn(execute(op.clone(), self.config.connect_timeout));
        Ok(op)
    }

    fn lookup(&self, id: &str) -> Result<Arc<Operation>> {
        let not_found = || HostdError::NotFound(format!("Operation '{id}' not found"));
        let uuid = Uuid::parse_str(id).map_err(|_| not_found())?;
        self.operations
            .get(&uuid)
            .map(|entry| entry.value().clone())
            .ok_or_else(not_found)
    }

    pub fn get(&self, id: &str) -> Result<Arc<Operation>> {
        self.lookup(id)
    }

    /// Views of all operations, optionally restricted to one project, oldest
    /// first.
    pub fn list(&self, project: Option<&str>) -> Vec<OperationView> {
        let mut views: Vec<OperationView> = self
            .operations
            .iter()
            .filter(|entry| project.map_or(true, |p| entry.value().project() == p))
            .map(|entry| entry.value().view())
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        views
    }

    /// Operations whose resource map mentions `url`.
    pub fn by_resource(&self, url: &str) -> Vec<OperationView> {
        let mut views: Vec<OperationView> = self
            .operations
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .resources()
                    .values()
                    .any(|urls| urls.iter().any(|u| u == url))
            })
            .map(|entry| entry.value().view())
            .collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        views
    }

    /// Cancel an operation.
    ///
    /// Cancelling a finished operation is a no-op returning its view.
    pub async fn cancel(&self, id: &str) -> Result<OperationView> {
        let op = self.lookup(id)?;
        if op.status().is_final() {
            return Ok(op.view());
        }
        if !op.may_cancel() {
            return Err(HostdError::bad_request("This operation can't be cancelled"));
        }

        op.handler().cancel().await?;
        if op.transition(OperationStatus::Cancelled, None) {
            info!(operation_id = %op.id(), "Operation cancelled");
        }
        Ok(op.view())
    }

    /// Hand a peer's channel to a websocket operation.
    pub async fn connect(&self, id: &str, secret: &str, channel: Channel) -> Result<()> {
        let op = self.lookup(id)?;
        let connector = match op.kind() {
            OperationKind::Websocket(connector) => connector.clone(),
            OperationKind::Task => {
                return Err(HostdError::bad_request(
                    "Only websocket operations can be connected",
                ))
            }
        };
        if op.status().is_final() {
            return Err(HostdError::bad_request(format!(
                "Operation is already {}",
                op.status()
            )));
        }

        connector.connect(secret, channel).await?;
        debug!(operation_id = %op.id(), "Websocket peer connected");
        Ok(())
    }

    /// Wait for an operation to reach a terminal status.
    ///
    /// With a timeout the current view is returned when it elapses, whatever
    /// the status.
    pub async fn wait(&self, id: &str, timeout: Option<Duration>) -> Result<OperationView> {
        let op = self.lookup(id)?;
        let mut rx = op.subscribe();
        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, reached_final(&mut rx)).await;
            }
            None => reached_final(&mut rx).await,
        }
        Ok(op.view())
    }

    /// Evict terminal operations older than the retention window.
    pub fn prune(&self) -> usize {
        let now = Utc::now();
        let retention = self.config.retention;
        let before = self.operations.len();

        self.operations.retain(|_, op| {
            if !op.status().is_final() {
                return true;
            }
            match (now - op.updated_at()).to_std() {
                Ok(age) => age < retention,
                Err(_) => true,
            }
        });

        let removed = before.saturating_sub(self.operations.len());
        if removed > 0 {
            debug!("Pruned {} finished operations", removed);
        }
        removed
    }

    /// Periodically prune until the registry is dropped.
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.prune();
                    }
                    None => break,
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

async fn reached_final(rx: &mut watch::Receiver<OperationState>) {
    let _ = rx.wait_for(|state| state.status.is_final()).await.map(|_| ());
}

async fn execute(op: Arc<Operation>, connect_timeout: Duration) {
    if !op.transition(OperationStatus::Running, None) {
        debug!(operation_id = %op.id(), "Operation finished before it started");
        return;
    }

    if let OperationKind::Websocket(connector) = op.kind().clone() {
        let mut rx = op.subscribe();
        tokio::select! {
            connected = tokio::time::timeout(connect_timeout, connector.connected()) => {
                if connected.is_err() {
                    let err = HostdError::Timeout(
                        "Timed out waiting for websocket peers to connect".to_string(),
                    );
                    warn!(operation_id = %op.id(), "{}", err);
                    op.transition(OperationStatus::Failure, Some(err.to_string()));
                    return;
                }
            }
            _ = reached_final(&mut rx) => {
                debug!(operation_id = %op.id(), status = %op.status(), "Operation ended while waiting for peers");
                return;
            }
        }
    }

    let ctx = OperationContext::new(op.clone());
    match op.handler().run(&ctx).await {
        Ok(()) => {
            if op.transition(OperationStatus::Success, None) {
                info!(operation_id = %op.id(), "Operation succeeded");
            }
        }
        Err(e) => {
            warn!(operation_id = %op.id(), error = %e, "Operation failed");
            op.transition(OperationStatus::Failure, Some(e.to_string()));
        }
    }
}
