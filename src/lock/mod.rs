//! Coordination locks
//!
//! A node may only drain and reboot while it holds the coordination lock.
//! Two strategies are provided:
//!
//! - [`DaemonSetLock`]: a single holder recorded as a JSON annotation on the
//!   daemon's own DaemonSet, with an optional TTL.
//! - [`SlotLock`]: `concurrency` independent Leases, each with one holder,
//!   bounding the number of simultaneous holders.
//!
//! Neither blocks waiting for the lock: acquisition can be denied, and the
//! caller retries on its next tick.

mod daemonset;
mod record;
mod slots;

#[cfg(test)]
mod lock_test;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{LockConfig, LockStrategy};
use crate::error::Result;
use crate::store::ClusterStore;

pub use daemonset::DaemonSetLock;
pub use record::{LockRecord, NodeMeta};
pub use slots::SlotLock;

/// Outcome of an acquisition attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Acquisition {
    pub acquired: bool,
    /// Current holder when known; this node when `acquired`
    pub holder: Option<String>,
}

impl Acquisition {
    pub fn granted(holder: &str) -> Self {
        Self {
            acquired: true,
            holder: Some(holder.to_string()),
        }
    }

    pub fn denied(holder: Option<String>) -> Self {
        Self {
            acquired: false,
            holder,
        }
    }
}

/// Mutual exclusion across the daemons of a cluster, bound to one node identity
#[async_trait]
pub trait CoordinationLock: Send + Sync {
    fn node_id(&self) -> &str;

    /// Try once to take the lock; conflicts are retried internally
    async fn acquire(&self, metadata: NodeMeta) -> Result<Acquisition>;

    /// Whether the stored holder is this node
    async fn test(&self) -> Result<bool>;

    /// Give the lock up; [`crate::Error::NotLockHolder`] if this node does not hold it
    async fn release(&self) -> Result<()>;

    /// Index of the held slot for multi-slot locks
    async fn held_slot(&self) -> Option<usize> {
        None
    }

    /// Resolves once a held lock has been lost; never for locks without renewal
    async fn lost(&self) {
        std::future::pending::<()>().await
    }
}

pub fn build_lock(
    config: &LockConfig,
    store: Arc<dyn ClusterStore>,
    node_id: &str,
) -> Arc<dyn CoordinationLock> {
    match config.strategy {
        LockStrategy::DaemonSet => Arc::new(DaemonSetLock::new(store, node_id, config)),
        LockStrategy::Leases => Arc::new(SlotLock::new(store, node_id, config)),
    }
}
