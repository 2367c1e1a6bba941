//! Cluster-aware request routing.
//!
//! Every instance-scoped request first asks the [`ResourceLocator`] where the
//! instance lives. Remote instances are proxied through the [`Forwarder`] and
//! nothing runs locally.

pub mod directory;
pub mod forward;

pub use directory::{MembershipDirectory, StaticDirectory};
pub use forward::Forwarder;

use axum::http::HeaderMap;
use hostd_common::{HostdError, Result};
use std::sync::Arc;
use tracing::debug;

/// Marks a request that another member already forwarded.
pub const FORWARDED_HEADER: &str = "X-Hostd-Forwarded";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local,
    Remote(String),
}

/// Decides whether an instance is served by this member.
pub struct ResourceLocator {
    directory: Arc<dyn MembershipDirectory>,
    local_address: String,
}

impl ResourceLocator {
    pub fn new(directory: Arc<dyn MembershipDirectory>, local_address: impl Into<String>) -> Self {
        Self {
            directory,
            local_address: local_address.into(),
        }
    }

    /// Unknown instances and already forwarded requests resolve to `Local`.
    pub async fn locate(
        &self,
        project: &str,
        instance: &str,
        headers: &HeaderMap,
    ) -> Result<Location> {
        if headers.contains_key(FORWARDED_HEADER) {
            return Ok(Location::Local);
        }

        let address = self
            .directory
            .locate(project, instance)
            .await
            .map_err(|e| HostdError::internal(format!("Failed to locate instance '{instance}': {e}")))?;

        match address {
            Some(address) if !same_address(&address, &self.local_address) => {
                debug!("Instance {}/{} lives on {}", project, instance, address);
                Ok(Location::Remote(address))
            }
            _ => Ok(Location::Local),
        }
    }
}

fn same_address(a: &str, b: &str) -> bool {
    a.trim_end_matches('/').eq_ignore_ascii_case(b.trim_end_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::HeaderValue;

    struct BrokenDirectory;

    #[async_trait]
    impl MembershipDirectory for BrokenDirectory {
        async fn locate(&self, _project: &str, _instance: &str) -> Result<Option<String>> {
            Err(HostdError::internal("database is locked"))
        }
    }

    async fn locator() -> ResourceLocator {
        let directory = StaticDirectory::default();
        directory.place("default", "c1", "http://10.0.0.2:8443").await;
        directory.place("default", "c2", "http://10.0.0.1:8443/").await;
        ResourceLocator::new(Arc::new(directory), "http://10.0.0.1:8443")
    }

    #[tokio::test]
    async fn test_locate() {
        let locator = locator().await;
        let headers = HeaderMap::new();

        assert_eq!(
            locator.locate("default", "c1", &headers).await.unwrap(),
            Location::Remote("http://10.0.0.2:8443".to_string())
        );
        assert_eq!(
            locator.locate("default", "c2", &headers).await.unwrap(),
            Location::Local
        );
        assert_eq!(
            locator.locate("default", "unknown", &headers).await.unwrap(),
            Location::Local
        );
        assert_eq!(
            locator.locate("prod", "c1", &headers).await.unwrap(),
            Location::Local
        );
    }

    #[tokio::test]
    async fn test_forwarded_requests_stay_local() {
        let locator = locator().await;
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_HEADER, HeaderValue::from_static("node2"));

        assert_eq!(
            locator.locate("default", "c1", &headers).await.unwrap(),
            Location::Local
        );
    }

    #[tokio::test]
    async fn test_directory_failure_is_internal() {
        let locator = ResourceLocator::new(Arc::new(BrokenDirectory), "http://10.0.0.1:8443");
        let err = locator
            .locate("default", "c1", &HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 500);
    }
}
