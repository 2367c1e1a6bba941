use async_trait::async_trait;
use hostd_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::Placement;

/// Cluster membership: which member hosts an instance.
#[async_trait]
pub trait MembershipDirectory: Send + Sync {
    /// Address of the member hosting `instance`, `None` when unknown.
    async fn locate(&self, project: &str, instance: &str) -> Result<Option<String>>;
}

/// Directory backed by a fixed placement table.
#[derive(Clone, Default)]
pub struct StaticDirectory {
    placements: Arc<RwLock<HashMap<(String, String), String>>>,
}

impl StaticDirectory {
    pub fn new(placements: impl IntoIterator<Item = Placement>) -> Self {
        let placements = placements
            .into_iter()
            .map(|p| ((p.project, p.instance), p.address))
            .collect();
        Self {
            placements: Arc::new(RwLock::new(placements)),
        }
    }

    pub async fn place(&self, project: &str, instance: &str, address: &str) {
        self.placements.write().await.insert(
            (project.to_string(), instance.to_string()),
            address.to_string(),
        );
    }
}

#[async_trait]
impl MembershipDirectory for StaticDirectory {
    async fn locate(&self, project: &str, instance: &str) -> Result<Option<String>> {
        Ok(self
            .placements
            .read()
            .await
            .get(&(project.to_string(), instance.to_string()))
            .cloned())
    }
}
