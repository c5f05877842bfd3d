//! Blocks while selected pods are running on the node

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use tracing::warn;

use super::{BlockerResult, RebootBlocker};
use crate::store::ClusterStore;

pub struct PodBlocker {
    store: Arc<dyn ClusterStore>,
    node_id: String,
    selectors: Vec<String>,
}

impl PodBlocker {
    pub fn new(store: Arc<dyn ClusterStore>, node_id: &str, selectors: Vec<String>) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            selectors,
        }
    }
}

#[async_trait]
impl RebootBlocker for PodBlocker {
    fn name(&self) -> &str {
        "blocking-pods"
    }

    async fn check(&self) -> BlockerResult {
        let mut reasons = Vec::new();

        for selector in &self.selectors {
            match self.store.list_pods(&self.node_id, Some(selector)).await {
                Ok(pods) => {
                    reasons.extend(
                        pods.iter()
                            .filter(|pod| {
                                !matches!(
                                    pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                                    Some("Succeeded") | Some("Failed")
                                )
                            })
                            .map(|pod| {
                                format!(
                                    "pod {}/{} matches {selector}",
                                    pod.namespace().unwrap_or_default(),
                                    pod.name_any()
                                )
                            }),
                    );
                }
                Err(e) => {
                    warn!(
                        "Unable to list pods on {} for selector {}, blocking reboot: {}",
                        self.node_id, selector, e
                    );
                    return BlockerResult::unverifiable(format!("pod list failed: {e}"));
                }
            }
        }

        if reasons.is_empty() {
            BlockerResult::clear()
        } else {
            BlockerResult::blocked(reasons)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str, node: &str, app: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
        }
    }

    fn blocker(store: &Arc<MemoryStore>, selectors: &[&str]) -> PodBlocker {
        PodBlocker::new(
            store.clone(),
            "worker-1",
            selectors.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_matching_pod_on_node_blocks() {
        let store = Arc::new(MemoryStore::new());
        store.insert_pod(pod("db-0", "worker-1", "db", "Running"));

        let result = blocker(&store, &["app=batch", "app=db"]).check().await;
        assert!(result.blocked);
        assert_eq!(result.reasons, vec!["pod default/db-0 matches app=db".to_string()]);
    }

    #[tokio::test]
    async fn test_pods_elsewhere_or_finished_do_not_block() {
        let store = Arc::new(MemoryStore::new());
        store.insert_pod(pod("db-0", "worker-2", "db", "Running"));
        store.insert_pod(pod("db-job", "worker-1", "db", "Succeeded"));
        store.insert_pod(pod("web-0", "worker-1", "web", "Running"));

        assert!(!blocker(&store, &["app=db"]).is_blocked().await);
    }

    #[tokio::test]
    async fn test_pod_in_unknown_phase_blocks() {
        let store = Arc::new(MemoryStore::new());
        store.insert_pod(pod("db-0", "worker-1", "db", "Unknown"));
        store.insert_pod(pod("db-1", "worker-1", "db", "Failed"));

        let result = blocker(&store, &["app=db"]).check().await;
        assert!(result.blocked);
        assert_eq!(result.reasons, vec!["pod default/db-0 matches app=db".to_string()]);
    }

    #[tokio::test]
    async fn test_list_error_blocks() {
        let store = Arc::new(MemoryStore::new());
        store.set_unreachable(true);
        assert!(blocker(&store, &["app=db"]).is_blocked().await);
    }
}
