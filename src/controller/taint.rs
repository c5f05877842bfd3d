//! PreferNoSchedule taint toggled around maintenance

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::store::ClusterStore;

pub const PREFER_NO_SCHEDULE: &str = "PreferNoSchedule";

/// Conflicting writers get this many attempts before the toggle fails
const MAX_ATTEMPTS: u32 = 10;

pub struct TaintController {
    store: Arc<dyn ClusterStore>,
    node_id: String,
    key: String,
    effect: String,
    backoff: Duration,
}

impl TaintController {
    pub fn new(store: Arc<dyn ClusterStore>, node_id: &str, key: &str, backoff: Duration) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            key: key.to_string(),
            effect: PREFER_NO_SCHEDULE.to_string(),
            backoff,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn position(&self, node: &Node) -> Option<usize> {
        node.spec
            .as_ref()
            .and_then(|s| s.taints.as_ref())
            .and_then(|taints| {
                taints
                    .iter()
                    .position(|t| t.key == self.key && t.effect == self.effect)
            })
    }

    pub async fn is_enabled(&self) -> Result<bool> {
        let node = self.store.get_node(&self.node_id).await?;
        Ok(self.position(&node).is_some())
    }

    /// Add the taint; no-op if present
    pub async fn enable(&self) -> Result<()> {
        self.toggle(true).await
    }

    /// Remove the taint; no-op if absent
    pub async fn disable(&self) -> Result<()> {
        self.toggle(false).await
    }

    async fn toggle(&self, enable: bool) -> Result<()> {
        for attempt in 1..=MAX_ATTEMPTS {
            let mut node = self.store.get_node(&self.node_id).await?;
            let position = self.position(&node);

            if position.is_some() == enable {
                debug!(
                    "Taint {}:{} already {} on {}",
                    self.key,
                    self.effect,
                    if enable { "present" } else { "absent" },
                    self.node_id
                );
                return Ok(());
            }

            let taints = node
                .spec
                .get_or_insert_with(Default::default)
                .taints
                .get_or_insert_with(Vec::new);
            match position {
                // The resourceVersion guard on replace rejects the write if the
                // list shifted since this read
                Some(index) => {
                    taints.remove(index);
                }
                None => taints.push(Taint {
                    key: self.key.clone(),
                    effect: self.effect.clone(),
                    time_added: Some(Time(chrono::Utc::now())),
                    value: None,
                }),
            }

            match self.store.replace_node(&node).await {
                Ok(_) => {
                    info!(
                        "{} taint {}:{} on node {}",
                        if enable { "Added" } else { "Removed" },
                        self.key,
                        self.effect,
                        self.node_id
                    );
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!("Taint update conflict on attempt {}: {}", attempt, e);
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Conflict(format!(
            "taint {} on node {}: still conflicting after {} attempts",
            self.key, self.node_id, MAX_ATTEMPTS
        )))
    }
}
