//! Blockers that read the daemon's own Node object

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use tracing::warn;

use super::{BlockerResult, RebootBlocker};
use crate::store::ClusterStore;

/// A label requirement: presence only, or an exact value
#[derive(Clone, Debug, PartialEq, Eq)]
struct LabelRequirement {
    key: String,
    value: Option<String>,
}

impl LabelRequirement {
    fn parse(spec: &str) -> Self {
        match spec.split_once('=') {
            Some((k, v)) => Self {
                key: k.trim().to_string(),
                value: Some(v.trim().to_string()),
            },
            None => Self {
                key: spec.trim().to_string(),
                value: None,
            },
        }
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match (&self.value, labels.get(&self.key)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(want), Some(have)) => want == have,
        }
    }
}

async fn fetch_node(store: &dyn ClusterStore, node_id: &str) -> Result<Node, BlockerResult> {
    store.get_node(node_id).await.map_err(|e| {
        warn!("Unable to read node {}, blocking reboot: {}", node_id, e);
        BlockerResult::unverifiable(format!("node read failed: {e}"))
    })
}

/// Blocks while the node carries any of the configured labels
pub struct NodeLabelBlocker {
    store: Arc<dyn ClusterStore>,
    node_id: String,
    requirements: Vec<LabelRequirement>,
}

impl NodeLabelBlocker {
    pub fn new<S: AsRef<str>>(store: Arc<dyn ClusterStore>, node_id: &str, labels: &[S]) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            requirements: labels
                .iter()
                .map(|l| LabelRequirement::parse(l.as_ref()))
                .collect(),
        }
    }
}

#[async_trait]
impl RebootBlocker for NodeLabelBlocker {
    fn name(&self) -> &str {
        "node-labels"
    }

    async fn check(&self) -> BlockerResult {
        let node = match fetch_node(self.store.as_ref(), &self.node_id).await {
            Ok(node) => node,
            Err(result) => return result,
        };
        let labels = node.metadata.labels.unwrap_or_default();

        let reasons: Vec<String> = self
            .requirements
            .iter()
            .filter(|r| r.matches(&labels))
            .map(|r| match &r.value {
                Some(v) => format!("node label {}={}", r.key, v),
                None => format!("node label {}", r.key),
            })
            .collect();

        if reasons.is_empty() {
            BlockerResult::clear()
        } else {
            BlockerResult::blocked(reasons)
        }
    }
}

/// Blocks while the node carries any of the configured annotation keys
pub struct NodeAnnotationBlocker {
    store: Arc<dyn ClusterStore>,
    node_id: String,
    keys: Vec<String>,
}

impl NodeAnnotationBlocker {
    pub fn new(store: Arc<dyn ClusterStore>, node_id: &str, keys: Vec<String>) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            keys,
        }
    }
}

#[async_trait]
impl RebootBlocker for NodeAnnotationBlocker {
    fn name(&self) -> &str {
        "node-annotations"
    }

    async fn check(&self) -> BlockerResult {
        let node = match fetch_node(self.store.as_ref(), &self.node_id).await {
            Ok(node) => node,
            Err(result) => return result,
        };
        let annotations = node.metadata.annotations.unwrap_or_default();

        let reasons: Vec<String> = self
            .keys
            .iter()
            .filter(|k| annotations.contains_key(k.as_str()))
            .map(|k| format!("node annotation {k}"))
            .collect();

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
    use kube::api::ObjectMeta;

    fn node(labels: &[(&str, &str)], annotations: &[(&str, &str)]) -> Node {
        let to_map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>()
        };
        Node {
            metadata: ObjectMeta {
                name: Some("worker-1".to_string()),
                labels: Some(to_map(labels)),
                annotations: Some(to_map(annotations)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_label_requirement_parse() {
        let req = LabelRequirement::parse("maintenance=hold");
        assert_eq!(req.key, "maintenance");
        assert_eq!(req.value.as_deref(), Some("hold"));
        assert!(LabelRequirement::parse("frozen").value.is_none());
    }

    #[tokio::test]
    async fn test_label_presence_blocks() {
        let store = Arc::new(MemoryStore::new());
        store.insert_node(node(&[("frozen", "")], &[]));

        let blocker = NodeLabelBlocker::new(store.clone(), "worker-1", &["frozen"]);
        assert!(blocker.is_blocked().await);
    }

    #[tokio::test]
    async fn test_label_value_must_match() {
        let store = Arc::new(MemoryStore::new());
        store.insert_node(node(&[("maintenance", "allowed")], &[]));

        let blocker = NodeLabelBlocker::new(store.clone(), "worker-1", &["maintenance=hold"]);
        assert!(!blocker.is_blocked().await);

        let blocker = NodeLabelBlocker::new(store.clone(), "worker-1", &["maintenance=allowed"]);
        let result = blocker.check().await;
        assert_eq!(result.reasons, vec!["node label maintenance=allowed".to_string()]);
    }

    #[tokio::test]
    async fn test_annotation_key_blocks() {
        let store = Arc::new(MemoryStore::new());
        store.insert_node(node(&[], &[("example.com/hold", "true")]));

        let blocker = NodeAnnotationBlocker::new(
            store.clone(),
            "worker-1",
            vec!["example.com/hold".to_string(), "other".to_string()],
        );
        let result = blocker.check().await;
        assert!(result.blocked);
        assert_eq!(result.reasons, vec!["node annotation example.com/hold".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_node_blocks() {
        let store = Arc::new(MemoryStore::new());
        let blocker = NodeAnnotationBlocker::new(store, "worker-1", vec!["any".to_string()]);
        assert!(blocker.is_blocked().await);
    }
}
