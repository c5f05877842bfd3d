//! In-memory [`ClusterStore`] with Kubernetes optimistic-concurrency semantics
//!
//! Every stored object carries a `resourceVersion` that is bumped on each
//! write; a replace carrying a stale version is rejected with
//! [`Error::Conflict`], exactly like the API server. Used by the test suite
//! and handy for exercising the lock protocol without a cluster.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;

use super::ClusterStore;
use crate::error::{Error, Result};

type Key = (String, String);

#[derive(Default)]
struct Objects {
    daemonsets: BTreeMap<Key, DaemonSet>,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<Key, Pod>,
    leases: BTreeMap<Key, Lease>,
    blocked_evictions: BTreeSet<Key>,
    version: u64,
}

impl Objects {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<Objects>,
    unreachable: AtomicBool,
}

fn key_of<K: ResourceExt>(obj: &K) -> Key {
    (
        obj.namespace().unwrap_or_else(|| "default".to_string()),
        obj.name_any(),
    )
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// Reject the write if `incoming` was read at an older version than `stored`.
fn check_version<K: ResourceExt>(what: &str, stored: &K, incoming: &K) -> Result<()> {
    match incoming.resource_version() {
        Some(version) if Some(&version) != stored.resource_version().as_ref() => Err(
            Error::Conflict(format!("{what}: the object has been modified; please apply your changes to the latest version")),
        ),
        _ => Ok(()),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> Result<std::sync::MutexGuard<'_, Objects>> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::KubeError(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "connection refused".to_string(),
                reason: "ServiceUnavailable".to_string(),
                code: 503,
            })));
        }
        Ok(self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Simulate losing connectivity to the API server
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make evictions of the pod fail with HTTP 429 until unblocked
    pub fn block_eviction(&self, namespace: &str, name: &str) {
        if let Ok(mut objects) = self.objects() {
            objects.blocked_evictions.insert(key(namespace, name));
        }
    }

    pub fn unblock_eviction(&self, namespace: &str, name: &str) {
        if let Ok(mut objects) = self.objects() {
            objects.blocked_evictions.remove(&key(namespace, name));
        }
    }

    pub fn insert_daemonset(&self, mut daemonset: DaemonSet) {
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        daemonset.metadata.resource_version = Some(objects.next_version());
        objects.daemonsets.insert(key_of(&daemonset), daemonset);
    }

    pub fn insert_node(&self, mut node: Node) {
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        node.metadata.resource_version = Some(objects.next_version());
        objects.nodes.insert(node.name_any(), node);
    }

    pub fn insert_pod(&self, mut pod: Pod) {
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        pod.metadata.resource_version = Some(objects.next_version());
        objects.pods.insert(key_of(&pod), pod);
    }

    pub fn insert_lease(&self, mut lease: Lease) {
        let mut objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        lease.metadata.resource_version = Some(objects.next_version());
        objects.leases.insert(key_of(&lease), lease);
    }

    pub fn daemonset(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        objects.daemonsets.get(&key(namespace, name)).cloned()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        objects.nodes.get(name).cloned()
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        objects.leases.get(&key(namespace, name)).cloned()
    }

    pub fn pod_names(&self) -> Vec<String> {
        let objects = self.objects.lock().unwrap_or_else(|p| p.into_inner());
        objects.pods.values().map(|p| p.name_any()).collect()
    }
}

/// Evaluate an equality-based label selector (`k=v`, `k==v`, `k!=v`, `k`, `!k`).
pub fn selector_matches(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some(key) = term.strip_prefix('!') {
                !labels.contains_key(key.trim())
            } else if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once("==").or_else(|| term.split_once('=')) {
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed") | Some("Unknown")
    )
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        self.objects()?
            .daemonsets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("daemonset {namespace}/{name}")))
    }

    async fn replace_daemonset(&self, daemonset: &DaemonSet) -> Result<DaemonSet> {
        let mut objects = self.objects()?;
        let k = key_of(daemonset);
        let what = format!("daemonset {}/{}", k.0, k.1);
        let stored = objects
            .daemonsets
            .get(&k)
            .ok_or_else(|| Error::NotFound(what.clone()))?;
        check_version(&what, stored, daemonset)?;

        let mut updated = daemonset.clone();
        updated.metadata.resource_version = Some(objects.next_version());
        objects.daemonsets.insert(k, updated.clone());
        Ok(updated)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.objects()?
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("node {name}")))
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let mut objects = self.objects()?;
        let name = node.name_any();
        let what = format!("node {name}");
        let stored = objects
            .nodes
            .get(&name)
            .ok_or_else(|| Error::NotFound(what.clone()))?;
        check_version(&what, stored, node)?;

        let mut updated = node.clone();
        updated.metadata.resource_version = Some(objects.next_version());
        objects.nodes.insert(name, updated.clone());
        Ok(updated)
    }

    async fn list_pods(&self, node_name: &str, label_selector: Option<&str>) -> Result<Vec<Pod>> {
        let objects = self.objects()?;
        let empty = BTreeMap::new();
        Ok(objects
            .pods
            .values()
            .filter(|pod| {
                pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name)
            })
            .filter(|pod| !is_terminal(pod))
            .filter(|pod| {
                label_selector.map_or(true, |selector| {
                    selector_matches(pod.metadata.labels.as_ref().unwrap_or(&empty), selector)
                })
            })
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.objects()?
            .pods
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("pod {namespace}/{name}")))
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period: Option<i64>,
    ) -> Result<()> {
        let mut objects = self.objects()?;
        let k = key(namespace, name);
        if objects.blocked_evictions.contains(&k) {
            return Err(Error::TooManyRequests(format!(
                "eviction of pod {namespace}/{name} would violate the pod's disruption budget"
            )));
        }
        objects
            .pods
            .remove(&k)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("pod {namespace}/{name}")))
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        Ok(self.objects()?.leases.get(&key(namespace, name)).cloned())
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease> {
        let mut objects = self.objects()?;
        let k = key_of(lease);
        if objects.leases.contains_key(&k) {
            return Err(Error::Conflict(format!(
                "lease {}/{} already exists",
                k.0, k.1
            )));
        }
        let mut created = lease.clone();
        created.metadata.resource_version = Some(objects.next_version());
        objects.leases.insert(k, created.clone());
        Ok(created)
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease> {
        let mut objects = self.objects()?;
        let k = key_of(lease);
        let what = format!("lease {}/{}", k.0, k.1);
        let stored = objects
            .leases
            .get(&k)
            .ok_or_else(|| Error::NotFound(what.clone()))?;
        check_version(&what, stored, lease)?;

        let mut updated = lease.clone();
        updated.metadata.resource_version = Some(objects.next_version());
        objects.leases.insert(k, updated.clone());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_selector_equality_and_existence() {
        let l = labels(&[("app", "db"), ("tier", "backend")]);
        assert!(selector_matches(&l, "app=db"));
        assert!(selector_matches(&l, "app==db,tier=backend"));
        assert!(selector_matches(&l, "tier"));
        assert!(selector_matches(&l, "app!=web"));
        assert!(selector_matches(&l, "!critical"));
        assert!(selector_matches(&l, ""));
        assert!(!selector_matches(&l, "app=web"));
        assert!(!selector_matches(&l, "app=db,missing"));
        assert!(!selector_matches(&l, "!app"));
    }

    #[tokio::test]
    async fn test_stale_replace_is_a_conflict() {
        let store = MemoryStore::new();
        store.insert_node(node("worker-1"));

        let first = store.get_node("worker-1").await.unwrap();
        let second = store.get_node("worker-1").await.unwrap();

        store.replace_node(&first).await.unwrap();
        let err = store.replace_node(&second).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.insert_node(node("worker-1"));
        store.set_unreachable(true);

        let err = store.get_node("worker-1").await.unwrap_err();
        assert!(matches!(err, Error::KubeError(_)));

        store.set_unreachable(false);
        assert!(store.get_node("worker-1").await.is_ok());
    }
}
