//! Reboot blockers
//!
//! Each [`RebootBlocker`] is an independent admission check. A reboot goes
//! ahead only when none of them block. Every blocker blocks when it cannot
//! verify its condition: never reboot when cluster health is unknown.

mod alerts;
mod node;
mod pods;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::BlockerConfig;
use crate::store::ClusterStore;

pub use alerts::{Alert, AlertBlocker};
pub use node::{NodeAnnotationBlocker, NodeLabelBlocker};
pub use pods::PodBlocker;

/// Outcome of one blocker evaluation; reasons are for logging only
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockerResult {
    pub blocked: bool,
    pub reasons: Vec<String>,
}

impl BlockerResult {
    pub fn clear() -> Self {
        Self::default()
    }

    pub fn blocked(reasons: Vec<String>) -> Self {
        Self {
            blocked: true,
            reasons,
        }
    }

    /// Blocked because the condition could not be verified
    pub fn unverifiable(reason: impl Into<String>) -> Self {
        Self::blocked(vec![reason.into()])
    }
}

#[async_trait]
pub trait RebootBlocker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> BlockerResult;

    async fn is_blocked(&self) -> bool {
        self.check().await.blocked
    }
}

/// Short-circuiting OR over `blockers`; the first blocking result is returned.
pub async fn first_blocking(blockers: &[Box<dyn RebootBlocker>]) -> Option<(String, BlockerResult)> {
    for blocker in blockers {
        let result = blocker.check().await;
        if result.blocked {
            info!(
                "Reboot blocked by {}: {}",
                blocker.name(),
                result.reasons.join("; ")
            );
            return Some((blocker.name().to_string(), result));
        }
        debug!("Blocker {} clear", blocker.name());
    }
    None
}

/// Whether any blocker blocks; `false` for an empty set
pub async fn any_blocked(blockers: &[Box<dyn RebootBlocker>]) -> bool {
    first_blocking(blockers).await.is_some()
}

/// Assemble the configured blockers for `node_id`
pub fn build_blockers(
    config: &BlockerConfig,
    store: Arc<dyn ClusterStore>,
    node_id: &str,
) -> crate::Result<Vec<Box<dyn RebootBlocker>>> {
    let mut blockers: Vec<Box<dyn RebootBlocker>> = Vec::new();

    if let Some(alerts) = &config.alerts {
        blockers.push(Box::new(AlertBlocker::new(alerts.clone())?));
    }
    if !config.pod_selectors.is_empty() {
        blockers.push(Box::new(PodBlocker::new(
            store.clone(),
            node_id,
            config.pod_selectors.clone(),
        )));
    }
    if !config.node_labels.is_empty() {
        blockers.push(Box::new(NodeLabelBlocker::new(
            store.clone(),
            node_id,
            &config.node_labels,
        )));
    }
    if !config.node_annotations.is_empty() {
        blockers.push(Box::new(NodeAnnotationBlocker::new(
            store,
            node_id,
            config.node_annotations.clone(),
        )));
    }

    Ok(blockers)
}
