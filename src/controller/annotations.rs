//! Node annotations and labels owned by the daemon
//!
//! All writes are read-modify-replace against the node's resourceVersion,
//! retried on conflict.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use tracing::debug;

use crate::error::Result;
use crate::store::{retry_on_conflict, ClusterStore};

/// Whether the node was cordoned before this daemon drained it ("true"/"false").
/// Present from lock acquisition until maintenance completes.
pub const UNSCHEDULABLE_BEFORE_DRAIN: &str = "reboot-coordinator.io/unschedulable-before-drain";

/// RFC 3339 time the reboot was issued
pub const REBOOT_IN_PROGRESS: &str = "reboot-coordinator.io/reboot-in-progress";

/// RFC 3339 time a pending reboot was last detected
pub const MOST_RECENT_REBOOT_NEEDED: &str = "reboot-coordinator.io/most-recent-reboot-needed";

/// Apply `mutate` to the current node and replace it. `mutate` returns
/// `false` when the node is already in the desired state, skipping the write.
pub async fn modify_node<F>(
    store: &dyn ClusterStore,
    node_id: &str,
    backoff: Duration,
    mutate: F,
) -> Result<Node>
where
    F: Fn(&mut Node) -> bool,
{
    retry_on_conflict(&format!("node {node_id}"), backoff, || async {
        let mut node = store.get_node(node_id).await?;
        if !mutate(&mut node) {
            return Ok(node);
        }
        store.replace_node(&node).await
    })
    .await
}

pub fn annotation<'a>(node: &'a Node, key: &str) -> Option<&'a str> {
    node.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn is_unschedulable(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false)
}

pub async fn set_annotations(
    store: &dyn ClusterStore,
    node_id: &str,
    values: &BTreeMap<String, String>,
    backoff: Duration,
) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    debug!("Annotating node {}: {:?}", node_id, values);
    modify_node(store, node_id, backoff, |node| {
        let annotations = node.metadata.annotations.get_or_insert_with(Default::default);
        let mut changed = false;
        for (k, v) in values {
            if annotations.get(k) != Some(v) {
                annotations.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        changed
    })
    .await
    .map(|_| ())
}

pub async fn remove_annotations(
    store: &dyn ClusterStore,
    node_id: &str,
    keys: &[&str],
    backoff: Duration,
) -> Result<()> {
    modify_node(store, node_id, backoff, |node| match node.metadata.annotations.as_mut() {
        Some(annotations) => keys
            .iter()
            .fold(false, |changed, k| annotations.remove(*k).is_some() || changed),
        None => false,
    })
    .await
    .map(|_| ())
}

pub async fn set_labels(
    store: &dyn ClusterStore,
    node_id: &str,
    values: &BTreeMap<String, String>,
    backoff: Duration,
) -> Result<()> {
    if values.is_empty() {
        return Ok(());
    }
    debug!("Labelling node {}: {:?}", node_id, values);
    modify_node(store, node_id, backoff, |node| {
        let labels = node.metadata.labels.get_or_insert_with(Default::default);
        let mut changed = false;
        for (k, v) in values {
            if labels.get(k) != Some(v) {
                labels.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        changed
    })
    .await
    .map(|_| ())
}

/// Persist the pre-maintenance cordon state
pub async fn record_unschedulable(
    store: &dyn ClusterStore,
    node_id: &str,
    unschedulable: bool,
    backoff: Duration,
) -> Result<()> {
    let values = BTreeMap::from([(
        UNSCHEDULABLE_BEFORE_DRAIN.to_string(),
        unschedulable.to_string(),
    )]);
    set_annotations(store, node_id, &values, backoff).await
}

/// The persisted cordon state; `None` when the node was never cordoned by the daemon
pub fn unschedulable_marker(node: &Node) -> Option<bool> {
    annotation(node, UNSCHEDULABLE_BEFORE_DRAIN).map(|v| v == "true")
}

pub async fn clear_unschedulable_marker(
    store: &dyn ClusterStore,
    node_id: &str,
    backoff: Duration,
) -> Result<()> {
    remove_annotations(store, node_id, &[UNSCHEDULABLE_BEFORE_DRAIN], backoff).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use k8s_openapi::api::core::v1::NodeSpec;
    use kube::api::ObjectMeta;

    const BACKOFF: Duration = Duration::from_millis(1);

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_node(Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                unschedulable: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        });
        store
    }

    #[tokio::test]
    async fn test_marker_lifecycle() {
        let store = store();
        let node = store.node("worker-1").unwrap();
        assert_eq!(unschedulable_marker(&node), None);
        assert!(is_unschedulable(&node));

        record_unschedulable(&store, "worker-1", true, BACKOFF).await.unwrap();
        assert_eq!(unschedulable_marker(&store.node("worker-1").unwrap()), Some(true));

        clear_unschedulable_marker(&store, "worker-1", BACKOFF).await.unwrap();
        assert_eq!(unschedulable_marker(&store.node("worker-1").unwrap()), None);
    }

    #[tokio::test]
    async fn test_unchanged_node_is_not_written() {
        let store = store();
        let values = BTreeMap::from([("a".to_string(), "1".to_string())]);
        set_annotations(&store, "worker-1", &values, BACKOFF).await.unwrap();
        let version = store.node("worker-1").unwrap().metadata.resource_version;

        set_annotations(&store, "worker-1", &values, BACKOFF).await.unwrap();
        remove_annotations(&store, "worker-1", &["missing"], BACKOFF).await.unwrap();
        assert_eq!(store.node("worker-1").unwrap().metadata.resource_version, version);
    }

    #[tokio::test]
    async fn test_set_labels() {
        let store = store();
        let values = BTreeMap::from([("reboot".to_string(), "pending".to_string())]);
        set_labels(&store, "worker-1", &values, BACKOFF).await.unwrap();

        let labels = store.node("worker-1").unwrap().metadata.labels.unwrap();
        assert_eq!(labels.get("reboot").map(String::as_str), Some("pending"));
    }

    #[tokio::test]
    async fn test_missing_node_is_an_error() {
        let store = MemoryStore::new();
        assert!(record_unschedulable(&store, "ghost", false, BACKOFF)
            .await
            .unwrap_err()
            .is_not_found());
    }
}
