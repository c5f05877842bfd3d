//! Node maintenance controller
//! This module contains the reboot state machine and the collaborators it
//! drives: node annotations, the PreferNoSchedule taint, drain, reboot and
//! notifications.

pub mod annotations;
pub mod drain;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod notify;
mod orchestrator;
pub mod reboot;
pub mod taint;

pub use drain::{Drainer, StoreDrainer};
pub use notify::{build_notifier, Notifier, NoopNotifier, WebhookNotifier};
pub use orchestrator::{
    initial_delay, Collaborators, NodeState, Orchestrator, Phase, ResumeOutcome, TickOutcome,
};
pub use reboot::{build_rebooter, CommandRebooter, Rebooter, SignalRebooter};
pub use taint::TaintController;
