//! [`ClusterStore`] backed by the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use super::ClusterStore;
use crate::error::{Error, Result};

/// Field selector excluding pods that will never run again
const NON_TERMINAL_PODS: &str = "status.phase!=Succeeded,status.phase!=Failed,status.phase!=Unknown";

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespace_of<K: ResourceExt>(obj: &K) -> String {
        obj.namespace().unwrap_or_else(|| "default".to_string())
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_daemonset(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(e, &format!("daemonset {namespace}/{name}")))
    }

    async fn replace_daemonset(&self, daemonset: &DaemonSet) -> Result<DaemonSet> {
        let namespace = Self::namespace_of(daemonset);
        let name = daemonset.name_any();
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), daemonset)
            .await
            .map_err(|e| Error::from_kube(e, &format!("daemonset {namespace}/{name}")))
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(e, &format!("node {name}")))
    }

    async fn replace_node(&self, node: &Node) -> Result<Node> {
        let name = node.name_any();
        let api: Api<Node> = Api::all(self.client.clone());
        api.replace(&name, &PostParams::default(), node)
            .await
            .map_err(|e| Error::from_kube(e, &format!("node {name}")))
    }

    async fn list_pods(&self, node_name: &str, label_selector: Option<&str>) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let mut params =
            ListParams::default().fields(&format!("spec.nodeName={node_name},{NON_TERMINAL_PODS}"));
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }

        debug!("Listing pods on node {} (selector: {:?})", node_name, label_selector);
        let pods = api
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(e, &format!("pods on node {node_name}")))?;
        Ok(pods.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(e, &format!("pod {namespace}/{name}")))
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period: Option<i64>,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = EvictParams {
            delete_options: grace_period.map(|secs| DeleteParams {
                grace_period_seconds: Some(secs.max(0) as u32),
                ..Default::default()
            }),
            ..Default::default()
        };

        api.evict(name, &params)
            .await
            .map_err(|e| Error::from_kube(e, &format!("eviction of pod {namespace}/{name}")))?;
        Ok(())
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::from_kube(e, &format!("lease {namespace}/{name}")))
    }

    async fn create_lease(&self, lease: &Lease) -> Result<Lease> {
        let namespace = Self::namespace_of(lease);
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), lease)
            .await
            .map_err(|e| Error::from_kube(e, &format!("lease {namespace}/{}", lease.name_any())))
    }

    async fn replace_lease(&self, lease: &Lease) -> Result<Lease> {
        let namespace = Self::namespace_of(lease);
        let name = lease.name_any();
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), lease)
            .await
            .map_err(|e| Error::from_kube(e, &format!("lease {namespace}/{name}")))
    }
}
