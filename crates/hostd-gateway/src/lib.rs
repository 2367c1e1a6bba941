//! HTTP front end of a hostd cluster member.
//!
//! Routes snapshot requests either to the local [`SnapshotController`] or,
//! for instances owned by another member, through the [`cluster`] forwarding
//! proxy.

pub mod cluster;
pub mod config;
pub mod handlers;
pub mod response;
pub mod websocket;

pub use config::{ConfigError, GatewayConfig, Placement};
pub use handlers::api_routes;
pub use response::AppError;

use axum::Router;
use cluster::{Forwarder, MembershipDirectory, ResourceLocator, StaticDirectory};
use hostd_instance::{
    InMemoryStore, InstanceRecord, InstanceStore, JsonTransport, MigrationTransport,
    SnapshotController,
};
use hostd_operations::OperationRegistry;
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub controller: Arc<SnapshotController>,
    pub registry: Arc<OperationRegistry>,
    pub locator: Arc<ResourceLocator>,
    pub forwarder: Forwarder,
}

impl AppState {
    pub fn new(
        config: &GatewayConfig,
        store: Arc<dyn InstanceStore>,
        directory: Arc<dyn MembershipDirectory>,
        transport: Arc<dyn MigrationTransport>,
    ) -> Self {
        let registry = OperationRegistry::new(config.registry_config());
        let controller = Arc::new(SnapshotController::new(store, registry.clone(), transport));
        let locator = Arc::new(ResourceLocator::new(
            directory,
            config.advertise_address.clone(),
        ));

        Self {
            controller,
            registry,
            locator,
            forwarder: Forwarder::new(config.node_name.clone()),
        }
    }

    /// State backed by the in-memory store, the static directory from
    /// `config`, and the JSON transport.
    pub async fn in_memory(config: &GatewayConfig) -> Self {
        let store = InMemoryStore::new();
        for (project, instance) in &config.seed_instances {
            store.insert(InstanceRecord::new(project, instance)).await;
        }
        let directory = StaticDirectory::new(config.cluster_members.clone());

        Self::new(
            config,
            Arc::new(store),
            Arc::new(directory),
            Arc::new(JsonTransport::new()),
        )
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    api_routes(state)
}
