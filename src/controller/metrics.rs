//! Prometheus metrics for the reboot coordinator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `reboot_coordinator_reboot_required` (gauge): 1 while the node reports a pending reboot, labeled by node.
//! - `reboot_coordinator_blocked_total` (counter): reboots held back, labeled by node and blocker.

use std::sync::atomic::{AtomicI64, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tracing::warn;

use crate::checker::RebootChecker;

/// How often the reboot-required gauge is refreshed
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub node: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BlockerLabels {
    pub node: String,
    /// Blocker name, e.g. "prometheus-alerts"
    pub blocker: String,
}

/// Gauge tracking whether the node needs a reboot
pub static REBOOT_REQUIRED: Lazy<Family<NodeLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Counter tracking blocked reboot attempts per blocker
pub static BLOCKED_TOTAL: Lazy<Family<BlockerLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "reboot_coordinator_reboot_required",
        "OS requires reboot due to software updates",
        REBOOT_REQUIRED.clone(),
    );
    registry.register(
        "reboot_coordinator_blocked",
        "Reboot attempts held back by a blocker",
        BLOCKED_TOTAL.clone(),
    );

    registry
});

pub fn set_reboot_required(node: &str, required: bool) {
    let labels = NodeLabels {
        node: node.to_string(),
    };
    REBOOT_REQUIRED.get_or_create(&labels).set(i64::from(required));
}

pub fn inc_blocked(node: &str, blocker: &str) {
    let labels = BlockerLabels {
        node: node.to_string(),
        blocker: blocker.to_string(),
    };
    BLOCKED_TOTAL.get_or_create(&labels).inc();
}

/// Render the registry in the OpenMetrics text format
pub fn encode() -> Result<String, std::fmt::Error> {
    let mut buffer = String::new();
    prometheus_client::encoding::text::encode(&mut buffer, &REGISTRY)?;
    Ok(buffer)
}

/// Refresh the reboot-required gauge forever, independently of the main tick
pub async fn maintain_reboot_required_metric(
    node: String,
    checker: Arc<dyn RebootChecker>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        match checker.requires_reboot().await {
            Ok(required) => set_reboot_required(&node, required),
            Err(e) => warn!("Unable to refresh reboot-required metric: {}", e),
        }
    }
}
