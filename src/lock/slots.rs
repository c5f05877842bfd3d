//! Bounded-concurrency lock built from one Lease per slot

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::ObjectMeta;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Acquisition, CoordinationLock, LockRecord, NodeMeta};
use crate::config::LockConfig;
use crate::error::{Error, Result};
use crate::store::ClusterStore;

/// Everything the renewal task needs, shared with it
struct Slots {
    store: Arc<dyn ClusterStore>,
    node_id: String,
    namespace: String,
    base_name: String,
    annotation: String,
    count: usize,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    backoff: Duration,
    lost: watch::Sender<bool>,
}

#[derive(Default)]
struct SlotState {
    /// The one slot this instance accepted
    won: Option<usize>,
    renewer: Option<JoinHandle<()>>,
}

/// `concurrency` Leases named `<lease_name>-<i>`; holding any one of them
/// grants the lock.
pub struct SlotLock {
    slots: Arc<Slots>,
    state: Mutex<SlotState>,
}

fn holder_of(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty())
}

fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = lease.spec.as_ref() else {
        return true;
    };
    match (&spec.renew_time, spec.lease_duration_seconds) {
        (Some(renewed), Some(seconds)) => now > renewed.0 + chrono::Duration::seconds(seconds as i64),
        _ => true,
    }
}

impl Slots {
    fn slot_name(&self, index: usize) -> String {
        format!("{}-{}", self.base_name, index)
    }

    fn lease_seconds(&self) -> i32 {
        self.lease_duration.as_secs().max(1).min(i32::MAX as u64) as i32
    }

    fn stamp(&self, lease: &mut Lease, metadata: &NodeMeta, now: DateTime<Utc>) -> Result<()> {
        let record = LockRecord::new(&self.node_id, metadata.clone()).to_json()?;
        lease
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(self.annotation.clone(), record);

        let lease_seconds = self.lease_seconds();
        let spec = lease.spec.get_or_insert_with(Default::default);
        if spec.holder_identity.as_deref() != Some(self.node_id.as_str()) {
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.holder_identity = Some(self.node_id.clone());
        spec.renew_time = Some(MicroTime(now));
        spec.lease_duration_seconds = Some(lease_seconds);
        Ok(())
    }

    /// One election round for a single slot
    async fn try_slot(&self, index: usize, metadata: &NodeMeta) -> Result<Acquisition> {
        let name = self.slot_name(index);
        let now = Utc::now();

        match self.store.get_lease(&self.namespace, &name).await? {
            None => {
                let mut lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec::default()),
                };
                self.stamp(&mut lease, metadata, now)?;
                match self.store.create_lease(&lease).await {
                    Ok(_) => {
                        info!("Created slot lease {} held by {}", name, self.node_id);
                        Ok(Acquisition::granted(&self.node_id))
                    }
                    Err(e) if e.is_conflict() => Ok(Acquisition::denied(None)),
                    Err(e) => Err(e),
                }
            }
            Some(mut lease) => {
                let holder = holder_of(&lease).map(str::to_string);
                let ours = holder.as_deref() == Some(self.node_id.as_str());
                if !ours && holder.is_some() && !is_expired(&lease, now) {
                    return Ok(Acquisition::denied(holder));
                }
                if !ours {
                    debug!("Slot lease {} free (previous holder {:?})", name, holder);
                }

                self.stamp(&mut lease, metadata, now)?;
                match self.store.replace_lease(&lease).await {
                    Ok(_) => Ok(Acquisition::granted(&self.node_id)),
                    Err(e) if e.is_conflict() => Ok(Acquisition::denied(holder)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Refresh `renewTime`; `Ok(false)` once someone else holds the slot
    async fn renew(&self, index: usize) -> Result<bool> {
        let name = self.slot_name(index);
        let Some(mut lease) = self.store.get_lease(&self.namespace, &name).await? else {
            return Ok(false);
        };
        if holder_of(&lease) != Some(self.node_id.as_str()) {
            return Ok(false);
        }
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }
        self.store.replace_lease(&lease).await?;
        Ok(true)
    }

    /// Clear the holder of `index`. With `strict`, not holding it is an error.
    async fn clear_holder(&self, index: usize, strict: bool) -> Result<()> {
        let name = self.slot_name(index);
        loop {
            let lease = self.store.get_lease(&self.namespace, &name).await?;
            let mut lease = match lease {
                Some(lease) if holder_of(&lease) == Some(self.node_id.as_str()) => lease,
                other if strict => {
                    return Err(Error::NotLockHolder(format!(
                        "{} cannot release slot lease {}: held by {:?}",
                        self.node_id,
                        name,
                        other.as_ref().and_then(holder_of)
                    )))
                }
                _ => return Ok(()),
            };

            if let Some(spec) = lease.spec.as_mut() {
                spec.holder_identity = None;
                spec.renew_time = None;
            }
            if let Some(annotations) = lease.metadata.annotations.as_mut() {
                annotations.remove(&self.annotation);
            }

            match self.store.replace_lease(&lease).await {
                Ok(_) => {
                    info!("Slot lease {} released by {}", name, self.node_id);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!("Conflict releasing {}, retrying in {:?}", name, self.backoff);
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn find_held(&self) -> Result<Option<usize>> {
        for index in 0..self.count {
            let lease = self.store.get_lease(&self.namespace, &self.slot_name(index)).await?;
            if lease.as_ref().and_then(holder_of) == Some(self.node_id.as_str()) {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }
}

/// Keep the won slot renewed; flag the lock as lost once that stops working.
async fn renew_until_lost(slots: Arc<Slots>, index: usize) {
    let name = slots.slot_name(index);
    let mut last_renewal = Instant::now();

    loop {
        tokio::time::sleep(slots.retry_period).await;
        match slots.renew(index).await {
            Ok(true) => last_renewal = Instant::now(),
            Ok(false) => {
                warn!("Slot lease {} is no longer held by {}", name, slots.node_id);
                break;
            }
            Err(e) if last_renewal.elapsed() >= slots.renew_deadline => {
                warn!(
                    "Failed to renew slot lease {} within {:?}: {}",
                    name, slots.renew_deadline, e
                );
                break;
            }
            Err(e) => debug!("Slot lease {} renewal failed, retrying: {}", name, e),
        }
    }

    slots.lost.send_replace(true);
}

impl SlotLock {
    pub fn new(store: Arc<dyn ClusterStore>, node_id: &str, config: &LockConfig) -> Self {
        let (lost, _) = watch::channel(false);
        Self {
            slots: Arc::new(Slots {
                store,
                node_id: node_id.to_string(),
                namespace: config.lease_namespace.clone(),
                base_name: config.lease_name.clone(),
                annotation: config.annotation.clone(),
                count: config.concurrency.max(1) as usize,
                lease_duration: config.lease_duration,
                renew_deadline: config.renew_deadline,
                retry_period: config.retry_period,
                backoff: config.conflict_backoff,
                lost,
            }),
            state: Mutex::new(SlotState::default()),
        }
    }

    async fn contend(&self, index: usize, metadata: &NodeMeta) -> Result<Acquisition> {
        let attempt = self.slots.try_slot(index, metadata).await?;
        if !attempt.acquired {
            return Ok(attempt);
        }

        let mut state = self.state.lock().await;
        if state.won.is_none() {
            state.won = Some(index);
            info!("Node {} won slot {}", self.slots.node_id, index);
            return Ok(attempt);
        }
        drop(state);

        debug!("Already holding a slot, giving back slot {}", index);
        self.slots.clear_holder(index, false).await?;
        Ok(Acquisition::denied(Some(self.slots.node_id.clone())))
    }
}

fn stop_renewal(state: &mut SlotState) {
    if let Some(renewer) = state.renewer.take() {
        renewer.abort();
    }
}

#[async_trait]
impl CoordinationLock for SlotLock {
    fn node_id(&self) -> &str {
        &self.slots.node_id
    }

    async fn acquire(&self, metadata: NodeMeta) -> Result<Acquisition> {
        {
            let mut state = self.state.lock().await;
            stop_renewal(&mut state);
            state.won = None;
        }
        self.slots.lost.send_replace(false);

        let attempts = join_all((0..self.slots.count).map(|i| self.contend(i, &metadata))).await;

        let mut holder = None;
        let mut failure = None;
        for attempt in attempts {
            match attempt {
                Ok(a) if !a.acquired => holder = holder.or(a.holder),
                Ok(_) => {}
                Err(e) => {
                    warn!("Slot election failed: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }

        let mut state = self.state.lock().await;
        if let Some(index) = state.won {
            state.renewer = Some(tokio::spawn(renew_until_lost(self.slots.clone(), index)));
            return Ok(Acquisition::granted(&self.slots.node_id));
        }
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(Acquisition::denied(holder))
    }

    async fn test(&self) -> Result<bool> {
        let held = self.slots.find_held().await?;
        let mut state = self.state.lock().await;
        let Some(index) = held else {
            stop_renewal(&mut state);
            state.won = None;
            return Ok(false);
        };

        let renewing = state.renewer.as_ref().is_some_and(|r| !r.is_finished());
        if state.won == Some(index) && renewing {
            return Ok(true);
        }

        // Adopting a slot found in the cluster: stamp it now so an expired
        // lease is ours again before anyone else can take it over
        stop_renewal(&mut state);
        state.won = None;
        match self.slots.renew(index).await {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) if e.is_conflict() => {
                debug!("Slot {} changed while adopting it: {}", index, e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        info!("Node {} resumed holding slot {}", self.slots.node_id, index);
        self.slots.lost.send_replace(false);
        state.won = Some(index);
        state.renewer = Some(tokio::spawn(renew_until_lost(self.slots.clone(), index)));
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        let won = {
            let mut state = self.state.lock().await;
            stop_renewal(&mut state);
            state.won.take()
        };

        let index = match won {
            Some(index) => index,
            None => self.slots.find_held().await?.ok_or_else(|| {
                Error::NotLockHolder(format!(
                    "{} holds none of the {} slot leases",
                    self.slots.node_id, self.slots.count
                ))
            })?,
        };
        self.slots.clear_holder(index, true).await
    }

    async fn held_slot(&self) -> Option<usize> {
        self.state.lock().await.won
    }

    async fn lost(&self) {
        let mut lost = self.slots.lost.subscribe();
        let _ = lost.wait_for(|lost| *lost).await;
    }
}

impl Drop for SlotLock {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            stop_renewal(&mut state);
        }
    }
}
