//! Cordon, drain and uncordon, similar to `kubectl drain`
//!
//! Pods are removed through the Eviction API so PodDisruptionBudgets are
//! respected. By default DaemonSet pods and static mirror pods are left
//! alone; pods with local `emptyDir` storage and unreplicated pods are
//! evicted as well.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::annotations::modify_node;
use crate::config::DrainOptions;
use crate::error::{Error, Result};
use crate::store::ClusterStore;

// Maximum number of Pods evicted concurrently, waiting for deletion included
const CONCURRENT_EVICTIONS: usize = 5;

// `kubectl drain` also waits 5 seconds between eviction attempts
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

const MIRROR_ANNOTATION: &str = "kubernetes.io/config.mirror";

#[async_trait]
pub trait Drainer: Send + Sync {
    async fn cordon(&self, node: &str) -> Result<()>;

    /// Cordon `node` and evict its pods
    async fn drain(&self, node: &str, options: &DrainOptions) -> Result<()>;

    async fn uncordon(&self, node: &str) -> Result<()>;
}

/// [`Drainer`] on top of a [`ClusterStore`]
pub struct StoreDrainer {
    store: Arc<dyn ClusterStore>,
    backoff: Duration,
    eviction_retry_interval: Duration,
    deletion_check_interval: Duration,
}

enum Verdict {
    Evict,
    Skip(&'static str),
    Refuse(&'static str),
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn controller_kind(pod: &Pod) -> Option<&str> {
    pod.metadata
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
        .map(|r| r.kind.as_str())
}

fn has_empty_dir(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|volumes| volumes.iter().any(|v| v.empty_dir.is_some()))
}

fn verdict(pod: &Pod, options: &DrainOptions) -> Verdict {
    if is_terminal(pod) {
        return Verdict::Skip("pod has completed");
    }
    if pod.annotations().contains_key(MIRROR_ANNOTATION) {
        return Verdict::Skip("static mirror pod");
    }
    match controller_kind(pod) {
        Some("DaemonSet") if options.ignore_daemonsets => {
            return Verdict::Skip("member of a DaemonSet")
        }
        Some("DaemonSet") => return Verdict::Refuse("member of a DaemonSet"),
        None if !options.force => return Verdict::Refuse("not managed by a controller"),
        _ => {}
    }
    if has_empty_dir(pod) && !options.delete_empty_dir {
        return Verdict::Refuse("uses emptyDir local storage");
    }
    Verdict::Evict
}

/// Pods to evict, or a `DrainError` naming every pod that blocks the drain
fn select_targets(pods: Vec<Pod>, options: &DrainOptions) -> Result<Vec<Pod>> {
    let mut targets = Vec::new();
    let mut refused = Vec::new();

    for pod in pods {
        match verdict(&pod, options) {
            Verdict::Evict => targets.push(pod),
            Verdict::Skip(why) => debug!("Not draining pod {}: {}", pod.name_any(), why),
            Verdict::Refuse(why) => refused.push(format!(
                "{}/{} ({})",
                pod.namespace().unwrap_or_default(),
                pod.name_any(),
                why
            )),
        }
    }

    if !refused.is_empty() {
        return Err(Error::DrainError(format!(
            "cannot evict pods: {}",
            refused.join(", ")
        )));
    }
    Ok(targets)
}

impl StoreDrainer {
    pub fn new(store: Arc<dyn ClusterStore>, backoff: Duration) -> Self {
        Self {
            store,
            backoff,
            eviction_retry_interval: EVICTION_RETRY_INTERVAL,
            deletion_check_interval: DELETION_CHECK_INTERVAL,
        }
    }

    /// Override the eviction retry and deletion poll intervals
    pub fn with_intervals(mut self, eviction_retry: Duration, deletion_check: Duration) -> Self {
        self.eviction_retry_interval = eviction_retry;
        self.deletion_check_interval = deletion_check;
        self
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<()> {
        modify_node(self.store.as_ref(), node, self.backoff, |n| {
            let spec = n.spec.get_or_insert_with(Default::default);
            if spec.unschedulable.unwrap_or(false) == unschedulable {
                return false;
            }
            spec.unschedulable = unschedulable.then_some(true);
            true
        })
        .await
        .map(|_| ())
    }

    async fn evict(&self, pod: &Pod, grace_period: Option<i64>) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let name = pod.name_any();

        loop {
            match self.store.evict_pod(&namespace, &name, grace_period).await {
                Ok(()) => {
                    info!("Evicted pod {}/{}", namespace, name);
                    break;
                }
                Err(e) if e.is_not_found() => return Ok(()),
                // Waiting on a PodDisruptionBudget
                Err(Error::TooManyRequests(msg)) => {
                    warn!(
                        "Eviction of pod {}/{} refused, retrying in {:?}: {}",
                        namespace, name, self.eviction_retry_interval, msg
                    );
                    tokio::time::sleep(self.eviction_retry_interval).await;
                }
                Err(e) => return Err(e),
            }
        }

        loop {
            match self.store.get_pod(&namespace, &name).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Ok(current) if current.uid() != pod.uid() => return Ok(()),
                Ok(_) => debug!("Pod {}/{} not yet deleted", namespace, name),
                Err(e) => warn!(
                    "Could not determine whether pod {}/{} is deleted: {}",
                    namespace, name, e
                ),
            }
            tokio::time::sleep(self.deletion_check_interval).await;
        }
    }

    async fn evict_all(&self, node: &str, options: &DrainOptions) -> Result<()> {
        let pods = self
            .store
            .list_pods(node, options.pod_selector.as_deref())
            .await?;
        let targets = select_targets(pods, options)?;
        info!("Evicting {} pods from node {}", targets.len(), node);

        stream::iter(targets.iter().map(Ok::<_, Error>))
            .try_for_each_concurrent(CONCURRENT_EVICTIONS, |pod| {
                self.evict(pod, options.grace_period)
            })
            .await
    }
}

#[async_trait]
impl Drainer for StoreDrainer {
    async fn cordon(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, true).await
    }

    #[instrument(skip(self, options), err)]
    async fn drain(&self, node: &str, options: &DrainOptions) -> Result<()> {
        self.cordon(node).await?;

        match options.timeout {
            Some(limit) => tokio::time::timeout(limit, self.evict_all(node, options))
                .await
                .map_err(|_| Error::Timeout(format!("drain of node {node} after {limit:?}")))?,
            None => self.evict_all(node, options).await,
        }
    }

    async fn uncordon(&self, node: &str) -> Result<()> {
        self.set_unschedulable(node, false).await
    }
}
