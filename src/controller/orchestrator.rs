//! Per-node reboot state machine
//!
//! ```text
//! Idle -> CheckRequired -> CheckBlocked -> Acquiring -> PreDrainDelay -> Draining
//!      -> TaintEnabled -> Rebooting -> AwaitingRestart
//! (restart) ResumeCheck -> Uncordoning -> Releasing -> Idle
//! ```
//!
//! The pre-maintenance cordon state is persisted as the
//! [`UNSCHEDULABLE_BEFORE_DRAIN`] node annotation right after the lock is
//! acquired, so an orchestrator constructed after a crash or a reboot can
//! finish the cycle from cluster state alone.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use futures::FutureExt;
use rand::Rng;
use tracing::{error, info, instrument, warn};

use super::annotations::{
    self, is_unschedulable, unschedulable_marker, MOST_RECENT_REBOOT_NEEDED, REBOOT_IN_PROGRESS,
    UNSCHEDULABLE_BEFORE_DRAIN,
};
use super::drain::{Drainer, StoreDrainer};
use super::notify::{build_notifier, notify, Notifier};
use super::reboot::{build_rebooter, Rebooter};
use super::taint::TaintController;
use crate::blockers::{build_blockers, first_blocking, RebootBlocker};
use crate::checker::{build_checker, RebootChecker};
use crate::config::{DaemonConfig, MessageTemplates};
use crate::error::Result;
use crate::lock::{build_lock, CoordinationLock, NodeMeta};
use crate::store::ClusterStore;

/// How often a node that has issued its reboot reports that it is still alive
const AWAIT_REBOOT_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CheckRequired,
    CheckBlocked,
    Acquiring,
    PreDrainDelay,
    Draining,
    TaintEnabled,
    Rebooting,
    AwaitingRestart,
    ResumeCheck,
    Uncordoning,
    Releasing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// In-process view of this node's maintenance, rebuilt from cluster state on start
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeState {
    pub unschedulable_before_drain: bool,
    pub holding_lock: bool,
    pub slot_index: Option<usize>,
}

/// Result of one pass through the state machine
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    NoRebootRequired,
    Blocked(Vec<String>),
    OutsideWindow,
    /// Another node holds the lock
    LockHeld(Option<String>),
    /// Drain failed and the cycle was rolled back
    DrainFailed,
    /// The lock was lost before the reboot was issued
    LockLost,
    RebootInvoked,
}

/// What startup found and did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// No maintenance in flight
    Idle,
    /// Maintenance completed and the lock released
    Released,
    /// The lock had moved on; the node was restored without a release
    Restored,
}

/// External capabilities the state machine drives
pub struct Collaborators {
    pub store: Arc<dyn ClusterStore>,
    pub lock: Arc<dyn CoordinationLock>,
    pub checker: Arc<dyn RebootChecker>,
    pub blockers: Vec<Box<dyn RebootBlocker>>,
    pub drainer: Box<dyn Drainer>,
    pub rebooter: Box<dyn Rebooter>,
    pub notifier: Box<dyn Notifier>,
    pub taint: Option<TaintController>,
}

impl Collaborators {
    /// Production wiring for `config` on top of `store`
    pub fn from_config(config: &DaemonConfig, store: Arc<dyn ClusterStore>) -> Result<Self> {
        let backoff = config.lock.conflict_backoff;
        Ok(Self {
            lock: build_lock(&config.lock, store.clone(), &config.node_id),
            checker: build_checker(&config.sentinel)?,
            blockers: build_blockers(&config.blockers, store.clone(), &config.node_id)?,
            drainer: Box::new(StoreDrainer::new(store.clone(), backoff)),
            rebooter: build_rebooter(&config.reboot)?,
            notifier: build_notifier(config.notify_url.as_deref())?,
            taint: config
                .prefer_no_schedule_taint
                .as_deref()
                .filter(|key| !key.is_empty())
                .map(|key| TaintController::new(store.clone(), &config.node_id, key, backoff)),
            store,
        })
    }
}

/// Uniformly random delay in `[period / 2, 3 * period / 2)`
pub fn initial_delay(period: Duration) -> Duration {
    period.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

pub struct Orchestrator {
    config: DaemonConfig,
    c: Collaborators,
    phase: Phase,
    state: NodeState,
}

impl Orchestrator {
    pub fn new(config: DaemonConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            c: collaborators,
            phase: Phase::Idle,
            state: NodeState::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &NodeState {
        &self.state
    }

    fn node_id(&self) -> &str {
        &self.config.node_id
    }

    fn backoff(&self) -> Duration {
        self.config.lock.conflict_backoff
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!("{}: {} -> {}", self.config.node_id, self.phase, phase);
        self.phase = phase;
    }

    async fn send(&self, template: &str) {
        let message = MessageTemplates::render(template, self.node_id());
        notify(self.c.notifier.as_ref(), &message, self.node_id()).await;
    }

    /// Put the node back the way it was before maintenance: uncordon unless it
    /// was already cordoned, drop the taint and clear the marker.
    async fn restore_node(&self, unschedulable_before: Option<bool>) -> Result<()> {
        match unschedulable_before {
            Some(false) => {
                info!("Uncordoning node {}", self.node_id());
                self.c.drainer.uncordon(self.node_id()).await?;
            }
            Some(true) => info!(
                "Node {} was cordoned before maintenance, leaving it cordoned",
                self.node_id()
            ),
            None => info!(
                "No pre-maintenance cordon state recorded for {}, leaving it as is",
                self.node_id()
            ),
        }
        if let Some(taint) = &self.c.taint {
            taint.disable().await?;
        }
        annotations::clear_unschedulable_marker(self.c.store.as_ref(), self.node_id(), self.backoff())
            .await
    }

    /// Finish or abandon maintenance left over from a previous process
    #[instrument(skip(self), fields(node = %self.config.node_id))]
    pub async fn resume(&mut self) -> Result<ResumeOutcome> {
        self.enter(Phase::ResumeCheck);

        let node = self.c.store.get_node(self.node_id()).await?;
        let marker = unschedulable_marker(&node);
        let holding = self.c.lock.test().await?;

        if self.config.annotate_nodes && annotations::annotation(&node, REBOOT_IN_PROGRESS).is_some()
        {
            annotations::remove_annotations(
                self.c.store.as_ref(),
                self.node_id(),
                &[REBOOT_IN_PROGRESS],
                self.backoff(),
            )
            .await?;
        }

        let outcome = if holding {
            info!("Holding lock after restart, completing maintenance");
            self.state = NodeState {
                unschedulable_before_drain: marker.unwrap_or(false),
                holding_lock: true,
                slot_index: self.c.lock.held_slot().await,
            };

            self.enter(Phase::Uncordoning);
            self.restore_node(marker).await?;
            if marker == Some(false) {
                self.send(&self.config.messages.uncordon).await;
            }
            annotations::set_labels(
                self.c.store.as_ref(),
                self.node_id(),
                &self.config.post_reboot_node_labels,
                self.backoff(),
            )
            .await?;

            if !self.config.lock.release_delay.is_zero() {
                info!("Delaying lock release by {:?}", self.config.lock.release_delay);
                tokio::time::sleep(self.config.lock.release_delay).await;
            }
            self.enter(Phase::Releasing);
            self.c.lock.release().await?;
            ResumeOutcome::Released
        } else if marker.is_some() {
            warn!(
                "Found {} without holding the lock, restoring node",
                UNSCHEDULABLE_BEFORE_DRAIN
            );
            self.restore_node(marker).await?;
            ResumeOutcome::Restored
        } else {
            ResumeOutcome::Idle
        };

        self.state = NodeState::default();
        self.enter(Phase::Idle);
        Ok(outcome)
    }

    /// One pass from detection up to the reboot
    #[instrument(skip(self), fields(node = %self.config.node_id))]
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        self.enter(Phase::CheckRequired);
        let required = self.c.checker.requires_reboot().await?;
        #[cfg(feature = "metrics")]
        super::metrics::set_reboot_required(self.node_id(), required);
        if !required {
            self.enter(Phase::Idle);
            return Ok(TickOutcome::NoRebootRequired);
        }
        info!("Reboot required");

        if self.config.annotate_nodes {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            let values = BTreeMap::from([(MOST_RECENT_REBOOT_NEEDED.to_string(), now)]);
            if let Err(e) = annotations::set_annotations(
                self.c.store.as_ref(),
                self.node_id(),
                &values,
                self.backoff(),
            )
            .await
            {
                warn!("Unable to annotate node: {}", e);
            }
        }

        self.enter(Phase::CheckBlocked);
        if let Some((blocker, result)) = first_blocking(&self.c.blockers).await {
            #[cfg(feature = "metrics")]
            super::metrics::inc_blocked(self.node_id(), &blocker);
            #[cfg(not(feature = "metrics"))]
            let _ = blocker;
            self.enter(Phase::Idle);
            return Ok(TickOutcome::Blocked(result.reasons));
        }
        if let Some(window) = &self.config.window {
            if !window.contains(Utc::now()) {
                info!("Reboot required but outside maintenance window {}", window);
                self.enter(Phase::Idle);
                return Ok(TickOutcome::OutsideWindow);
            }
        }

        self.enter(Phase::Acquiring);
        let node = self.c.store.get_node(self.node_id()).await?;
        let unschedulable = is_unschedulable(&node);
        let acquisition = self.c.lock.acquire(NodeMeta::new(unschedulable)).await?;
        if !acquisition.acquired {
            info!("Lock already held by {:?}, retrying next tick", acquisition.holder);
            self.enter(Phase::Idle);
            return Ok(TickOutcome::LockHeld(acquisition.holder));
        }
        self.state = NodeState {
            unschedulable_before_drain: unschedulable,
            holding_lock: true,
            slot_index: self.c.lock.held_slot().await,
        };

        // Must be durable before anything cordons the node
        annotations::record_unschedulable(
            self.c.store.as_ref(),
            self.node_id(),
            unschedulable,
            self.backoff(),
        )
        .await?;

        let lock = self.c.lock.clone();
        let drained = tokio::select! {
            biased;
            _ = lock.lost() => None,
            drained = self.prepare_reboot() => Some(drained?),
        };

        match drained {
            None => self.abandon_after_loss().await,
            Some(false) => {
                self.restore_node(Some(unschedulable)).await?;
                self.enter(Phase::Releasing);
                self.c.lock.release().await?;
                self.state = NodeState::default();
                self.enter(Phase::Idle);
                Ok(TickOutcome::DrainFailed)
            }
            Some(true) => self.reboot().await,
        }
    }

    /// Delay, taint and drain. `Ok(false)` when the drain failed and the
    /// cycle must be rolled back.
    async fn prepare_reboot(&mut self) -> Result<bool> {
        if !self.config.drain_delay.is_zero() {
            self.enter(Phase::PreDrainDelay);
            info!("Delaying drain by {:?}", self.config.drain_delay);
            tokio::time::sleep(self.config.drain_delay).await;
        }

        self.enter(Phase::Draining);
        self.send(&self.config.messages.drain).await;
        if let Some(taint) = &self.c.taint {
            taint.enable().await?;
        }
        info!("Draining node {}", self.node_id());
        if let Err(e) = self.c.drainer.drain(self.node_id(), &self.config.drain).await {
            if !self.config.force_reboot {
                error!("Error draining node, rolling back: {}", e);
                return Ok(false);
            }
            warn!("Error draining node, rebooting anyway: {}", e);
        }

        self.enter(Phase::TaintEnabled);
        annotations::set_labels(
            self.c.store.as_ref(),
            self.node_id(),
            &self.config.pre_reboot_node_labels,
            self.backoff(),
        )
        .await?;
        if !self.config.reboot_delay.is_zero() {
            info!("Delaying reboot by {:?}", self.config.reboot_delay);
            tokio::time::sleep(self.config.reboot_delay).await;
        }
        Ok(true)
    }

    /// Whether the lock has already signalled loss, without waiting
    fn lock_lost(&self) -> bool {
        self.c.lock.lost().now_or_never().is_some()
    }

    /// Roll back a cycle whose lock went away before the reboot was issued
    async fn abandon_after_loss(&mut self) -> Result<TickOutcome> {
        error!("Lock lost before reboot, aborting maintenance");
        if self.config.annotate_nodes {
            annotations::remove_annotations(
                self.c.store.as_ref(),
                self.node_id(),
                &[REBOOT_IN_PROGRESS],
                self.backoff(),
            )
            .await?;
        }
        self.restore_node(Some(self.state.unschedulable_before_drain)).await?;
        self.state = NodeState::default();
        self.enter(Phase::Idle);
        Ok(TickOutcome::LockLost)
    }

    async fn reboot(&mut self) -> Result<TickOutcome> {
        if self.lock_lost() {
            return self.abandon_after_loss().await;
        }
        self.enter(Phase::Rebooting);
        if self.config.annotate_nodes {
            let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            let values = BTreeMap::from([(REBOOT_IN_PROGRESS.to_string(), now)]);
            annotations::set_annotations(self.c.store.as_ref(), self.node_id(), &values, self.backoff())
                .await?;
        }
        self.send(&self.config.messages.reboot).await;

        // The notification may have taken a while; never reboot without the lock
        if self.lock_lost() {
            return self.abandon_after_loss().await;
        }
        info!("Rebooting node {}", self.node_id());
        self.c.rebooter.reboot().await?;
        self.enter(Phase::AwaitingRestart);
        Ok(TickOutcome::RebootInvoked)
    }

    /// Resume, then tick on a jittered schedule until a reboot is issued.
    /// Only returns on a fatal error.
    pub async fn run(mut self) -> Result<()> {
        self.resume().await?;

        let period = self.config.period;
        let delay = initial_delay(period);
        info!("First check in {:?}, then every {:?}", delay, period);
        tokio::time::sleep(delay).await;

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.tick().await? == TickOutcome::RebootInvoked {
                break;
            }
        }

        // The host reboot is expected to kill us; the lock stays held meanwhile
        loop {
            info!("Reboot issued for {}, waiting for it to happen", self.node_id());
            tokio::time::sleep(AWAIT_REBOOT_LOG_INTERVAL).await;
        }
    }
}
