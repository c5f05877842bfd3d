use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::DaemonSet;
use tracing::{debug, info};

use super::{Acquisition, CoordinationLock, LockRecord, NodeMeta};
use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::store::ClusterStore;

/// Single-holder lock stored in an annotation of a DaemonSet
pub struct DaemonSetLock {
    store: Arc<dyn ClusterStore>,
    node_id: String,
    namespace: String,
    name: String,
    annotation: String,
    ttl: Option<Duration>,
    backoff: Duration,
}

impl DaemonSetLock {
    pub fn new(store: Arc<dyn ClusterStore>, node_id: &str, config: &LockConfig) -> Self {
        Self {
            store,
            node_id: node_id.to_string(),
            namespace: config.daemonset_namespace.clone(),
            name: config.daemonset_name.clone(),
            annotation: config.annotation.clone(),
            ttl: config.ttl,
            backoff: config.conflict_backoff,
        }
    }

    fn record_of(&self, daemonset: &DaemonSet) -> Result<Option<LockRecord>> {
        match daemonset
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(&self.annotation))
        {
            Some(raw) if !raw.is_empty() => LockRecord::parse(raw).map(Some),
            _ => Ok(None),
        }
    }

    async fn fetch(&self) -> Result<DaemonSet> {
        self.store.get_daemonset(&self.namespace, &self.name).await
    }

    async fn backoff(&self, action: &str, err: &Error) {
        debug!(
            "Conflict during lock {} on {}/{}, retrying in {:?}: {}",
            action, self.namespace, self.name, self.backoff, err
        );
        tokio::time::sleep(self.backoff).await;
    }
}

#[async_trait]
impl CoordinationLock for DaemonSetLock {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn acquire(&self, mut metadata: NodeMeta) -> Result<Acquisition> {
        loop {
            let mut daemonset = self.fetch().await?;
            let now = Utc::now();

            // Our own record is re-stamped so the new metadata and expiry take effect
            if let Some(record) = self.record_of(&daemonset)? {
                if record.holder_id == self.node_id {
                    debug!("Lock already held by {}, refreshing record", self.node_id);
                } else if record.is_valid_at(now) {
                    return Ok(Acquisition::denied(Some(record.holder_id)));
                } else {
                    info!(
                        "Lock record held by {} expired at {:?}, taking over",
                        record.holder_id, record.metadata.expires_at
                    );
                }
            }

            metadata.expires_at = match self.ttl {
                Some(ttl) => Some(now + chrono::Duration::from_std(ttl).map_err(|e| {
                    Error::ConfigError(format!("lock ttl out of range: {e}"))
                })?),
                None => None,
            };
            let value = LockRecord::new(&self.node_id, metadata.clone()).to_json()?;
            daemonset
                .metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(self.annotation.clone(), value);

            match self.store.replace_daemonset(&daemonset).await {
                Ok(_) => {
                    info!("Lock {}/{} acquired by {}", self.namespace, self.name, self.node_id);
                    return Ok(Acquisition::granted(&self.node_id));
                }
                Err(e) if e.is_conflict() => self.backoff("acquire", &e).await,
                Err(e) => return Err(e),
            }
        }
    }

    async fn test(&self) -> Result<bool> {
        let daemonset = self.fetch().await?;
        let now = Utc::now();
        Ok(self
            .record_of(&daemonset)?
            .is_some_and(|record| record.holder_id == self.node_id && record.is_valid_at(now)))
    }

    async fn release(&self) -> Result<()> {
        loop {
            let mut daemonset = self.fetch().await?;

            match self.record_of(&daemonset)? {
                Some(record) if record.holder_id == self.node_id => {}
                Some(record) => {
                    return Err(Error::NotLockHolder(format!(
                        "{} cannot release lock held by {}",
                        self.node_id, record.holder_id
                    )))
                }
                None => {
                    return Err(Error::NotLockHolder(format!(
                        "{} cannot release lock {}/{}: not held",
                        self.node_id, self.namespace, self.name
                    )))
                }
            }

            if let Some(annotations) = daemonset.metadata.annotations.as_mut() {
                annotations.remove(&self.annotation);
            }

            match self.store.replace_daemonset(&daemonset).await {
                Ok(_) => {
                    info!("Lock {}/{} released by {}", self.namespace, self.name, self.node_id);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => self.backoff("release", &e).await,
                Err(e) => return Err(e),
            }
        }
    }
}
