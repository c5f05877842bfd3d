//! Daemon configuration
//!
//! The binary maps CLI flags and environment variables onto [`DaemonConfig`];
//! everything that can be wrong with a configuration is rejected by
//! [`DaemonConfig::validate`] before the daemon starts ticking.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;

use crate::error::{Error, Result};
use crate::window::TimeWindow;

pub const DEFAULT_LOCK_ANNOTATION: &str = "reboot-coordinator.io/node-lock";
pub const DEFAULT_SENTINEL: &str = "/var/run/reboot-required";
pub const DEFAULT_REBOOT_COMMAND: &str = "/bin/systemctl reboot";

/// Which coordination lock backs the daemon
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockStrategy {
    /// Single holder, recorded in an annotation on the daemon's DaemonSet
    #[default]
    DaemonSet,
    /// `concurrency` independent Leases, one holder each
    Leases,
}

impl FromStr for LockStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "daemonset" => Ok(LockStrategy::DaemonSet),
            "leases" | "lease" => Ok(LockStrategy::Leases),
            other => Err(Error::ConfigError(format!("unknown lock strategy: {other}"))),
        }
    }
}

impl fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStrategy::DaemonSet => write!(f, "daemonset"),
            LockStrategy::Leases => write!(f, "leases"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LockConfig {
    pub strategy: LockStrategy,
    /// Maximum number of nodes rebooting at once
    pub concurrency: u32,
    pub daemonset_namespace: String,
    pub daemonset_name: String,
    pub annotation: String,
    /// Lifetime of a single-holder lock record; `None` never expires
    pub ttl: Option<Duration>,
    /// Pause between uncordon and release after a reboot
    pub release_delay: Duration,
    /// Sleep between optimistic-concurrency retries
    pub conflict_backoff: Duration,
    pub lease_namespace: String,
    /// Slot leases are named `<lease_name>-<i>`
    pub lease_name: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: LockStrategy::DaemonSet,
            concurrency: 1,
            daemonset_namespace: "kube-system".to_string(),
            daemonset_name: "reboot-coordinator".to_string(),
            annotation: DEFAULT_LOCK_ANNOTATION.to_string(),
            ttl: None,
            release_delay: Duration::ZERO,
            conflict_backoff: Duration::from_secs(1),
            lease_namespace: "kube-system".to_string(),
            lease_name: "reboot-coordinator".to_string(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SentinelConfig {
    pub file: PathBuf,
    /// Overrides the file check when set
    pub command: Option<Vec<String>>,
    pub host_namespace: bool,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from(DEFAULT_SENTINEL),
            command: None,
            host_namespace: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RebootMethod {
    #[default]
    Command,
    Signal,
}

impl FromStr for RebootMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "command" => Ok(RebootMethod::Command),
            "signal" => Ok(RebootMethod::Signal),
            other => Err(Error::ConfigError(format!("unknown reboot method: {other}"))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RebootConfig {
    pub method: RebootMethod,
    pub command: Vec<String>,
    /// Signal delivered to PID 1; `None` selects SIGRTMIN+5
    pub signal: Option<i32>,
    pub host_namespace: bool,
}

impl Default for RebootConfig {
    fn default() -> Self {
        Self {
            method: RebootMethod::Command,
            command: crate::exec::split_command(DEFAULT_REBOOT_COMMAND),
            signal: None,
            host_namespace: false,
        }
    }
}

/// Options handed to the drain collaborator
#[derive(Clone, Debug)]
pub struct DrainOptions {
    /// Pod termination grace period; `None` uses each pod's own
    pub grace_period: Option<i64>,
    /// Only pods matching this selector are evicted
    pub pod_selector: Option<String>,
    /// Upper bound for the whole drain; `None` waits forever
    pub timeout: Option<Duration>,
    pub delete_empty_dir: bool,
    pub ignore_daemonsets: bool,
    /// Evict pods that no controller will recreate
    pub force: bool,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            grace_period: None,
            pod_selector: None,
            timeout: None,
            delete_empty_dir: true,
            ignore_daemonsets: true,
            force: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AlertConfig {
    pub prometheus_url: String,
    pub filter: Option<Regex>,
    /// Invert `filter`: only matching alerts block
    pub match_only: bool,
    /// Ignore pending alerts
    pub firing_only: bool,
    /// Only alerts carrying all of these label values block
    pub labels: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default)]
pub struct BlockerConfig {
    pub alerts: Option<AlertConfig>,
    pub pod_selectors: Vec<String>,
    /// `name` or `name=value`
    pub node_labels: Vec<String>,
    pub node_annotations: Vec<String>,
}

/// Notification texts; `%s` is replaced by the node id
#[derive(Clone, Debug)]
pub struct MessageTemplates {
    pub drain: String,
    pub reboot: String,
    pub uncordon: String,
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            drain: "Draining node %s".to_string(),
            reboot: "Rebooting node %s".to_string(),
            uncordon: "Node %s rebooted & uncordoned successfully!".to_string(),
        }
    }
}

impl MessageTemplates {
    pub fn render(template: &str, node_id: &str) -> String {
        template.replace("%s", node_id)
    }
}

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub node_id: String,
    pub period: Duration,
    pub lock: LockConfig,
    pub sentinel: SentinelConfig,
    pub reboot: RebootConfig,
    pub blockers: BlockerConfig,
    pub window: Option<TimeWindow>,
    pub drain: DrainOptions,
    /// Sleep after acquiring the lock, before draining
    pub drain_delay: Duration,
    /// Sleep after draining, before rebooting
    pub reboot_delay: Duration,
    /// Reboot even when the drain fails
    pub force_reboot: bool,
    pub prefer_no_schedule_taint: Option<String>,
    pub annotate_nodes: bool,
    pub pre_reboot_node_labels: BTreeMap<String, String>,
    pub post_reboot_node_labels: BTreeMap<String, String>,
    pub notify_url: Option<String>,
    pub messages: MessageTemplates,
}

impl DaemonConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            period: Duration::from_secs(60 * 60),
            lock: LockConfig::default(),
            sentinel: SentinelConfig::default(),
            reboot: RebootConfig::default(),
            blockers: BlockerConfig::default(),
            window: None,
            drain: DrainOptions::default(),
            drain_delay: Duration::ZERO,
            reboot_delay: Duration::ZERO,
            force_reboot: false,
            prefer_no_schedule_taint: None,
            annotate_nodes: false,
            pre_reboot_node_labels: BTreeMap::new(),
            post_reboot_node_labels: BTreeMap::new(),
            notify_url: None,
            messages: MessageTemplates::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(Error::ConfigError("node id must not be empty".to_string()));
        }
        if self.period.is_zero() {
            return Err(Error::ConfigError("period must be positive".to_string()));
        }
        if self.lock.concurrency == 0 {
            return Err(Error::ConfigError("concurrency must be at least 1".to_string()));
        }
        if self.lock.strategy == LockStrategy::DaemonSet && self.lock.concurrency > 1 {
            return Err(Error::ConfigError(format!(
                "concurrency {} requires the leases lock strategy",
                self.lock.concurrency
            )));
        }
        if self.lock.annotation.trim().is_empty() {
            return Err(Error::ConfigError("lock annotation must not be empty".to_string()));
        }
        if self.lock.strategy == LockStrategy::Leases
            && self.lock.renew_deadline >= self.lock.lease_duration
        {
            return Err(Error::ConfigError(
                "lease renew deadline must be shorter than the lease duration".to_string(),
            ));
        }
        if let Some(command) = &self.sentinel.command {
            if command.is_empty() {
                return Err(Error::ConfigError("reboot sentinel command is empty".to_string()));
            }
        }
        if self.reboot.method == RebootMethod::Command && self.reboot.command.is_empty() {
            return Err(Error::ConfigError("reboot command is empty".to_string()));
        }
        if let Some(alerts) = &self.blockers.alerts {
            reqwest::Url::parse(&alerts.prometheus_url).map_err(|e| {
                Error::ConfigError(format!(
                    "invalid prometheus url {:?}: {e}",
                    alerts.prometheus_url
                ))
            })?;
        }
        if let Some(url) = &self.notify_url {
            reqwest::Url::parse(url)
                .map_err(|e| Error::ConfigError(format!("invalid notify url {url:?}: {e}")))?;
        }
        Ok(())
    }
}

/// Parse `k=v` pairs into a map
pub fn parse_label_pairs<S: AsRef<str>>(pairs: &[S]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let pair = pair.as_ref();
            match pair.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => {
                    Ok((k.trim().to_string(), v.trim().to_string()))
                }
                _ => Err(Error::ConfigError(format!(
                    "expected key=value, got {pair:?}"
                ))),
            }
        })
        .collect()
}

/// Compile an optional alert filter expression
pub fn parse_alert_filter(expr: Option<&str>) -> Result<Option<Regex>> {
    expr.filter(|e| !e.is_empty())
        .map(|e| {
            Regex::new(e).map_err(|err| {
                Error::ConfigError(format!("invalid alert filter regexp {e:?}: {err}"))
            })
        })
        .transpose()
}

/// Parse a human-readable duration such as `90s`, `10m` or `1h30m`
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(value)
        .map_err(|e| Error::ConfigError(format!("invalid duration {value:?}: {e}")))
}
