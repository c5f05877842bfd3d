//! Reboot Coordinator: safe, cluster-wide node reboots for Kubernetes
//!
//! One daemon runs on every node. When the host reports that it needs a
//! reboot, the daemon takes a cluster-wide lock, drains the node, reboots
//! it, and after the restart uncordons the node and hands the lock back.

pub mod blockers;
pub mod checker;
pub mod config;
pub mod controller;
pub mod error;
pub mod exec;
pub mod lock;
pub mod store;
pub mod telemetry;
pub mod window;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
