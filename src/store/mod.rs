//! Cluster object store abstraction
//!
//! The lock, the taint controller and the drain collaborator only need
//! get/replace with optimistic-concurrency conflict detection on a handful of
//! object kinds. [`ClusterStore`] captures exactly that, so the production
//! [`KubeStore`] and the in-memory [`MemoryStore`] are interchangeable.

mod kube_store;
mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod};
use tracing::debug;

use crate::error::Result;

pub use self::kube_store::KubeStore;
pub use self::memory::{selector_matches, MemoryStore};

/// Read/conditional-write access to the cluster objects the daemon touches.
///
/// Every `replace_*` call is conditional on `metadata.resourceVersion` and
/// fails with [`crate::Error::Conflict`] when the stored object has moved on.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet>;

    async fn replace_daemonset(&self, daemonset: &DaemonSet) -> Result<DaemonSet>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn replace_node(&self, node: &Node) -> Result<Node>;

    /// Pods bound to `node_name`, optionally narrowed by a label selector
    async fn list_pods(&self, node_name: &str, label_selector: Option<&str>) -> Result<Vec<Pod>>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Create an eviction; [`crate::Error::TooManyRequests`] if a disruption budget forbids it
    async fn evict_pod(&self, namespace: &str, name: &str, grace_period: Option<i64>)
        -> Result<()>;

    /// `Ok(None)` when the lease does not exist yet
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>>;

    /// Fails with [`crate::Error::Conflict`] if the lease already exists
    async fn create_lease(&self, lease: &Lease) -> Result<Lease>;

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease>;
}

/// Run a read-modify-write operation until it stops reporting conflicts.
///
/// Conflicts are rare and self-resolving, so the retry count is unbounded;
/// every other outcome is returned to the caller untouched.
pub async fn retry_on_conflict<T, F, Fut>(what: &str, backoff: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match op().await {
            Err(e) if e.is_conflict() => {
                debug!("Conflict updating {}, retrying in {:?}: {}", what, backoff, e);
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_on_conflict_retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_on_conflict("node", Duration::from_millis(1), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(Error::Conflict("node".to_string()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_on_conflict_surfaces_other_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict("node", Duration::from_millis(1), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotFound("node".to_string()))
        })
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
