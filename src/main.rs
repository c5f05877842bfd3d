use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use reboot_coordinator::config::{
    parse_alert_filter, parse_duration, parse_label_pairs, AlertConfig, BlockerConfig,
    DaemonConfig, DrainOptions, LockConfig, LockStrategy, MessageTemplates, RebootConfig,
    RebootMethod, SentinelConfig, DEFAULT_LOCK_ANNOTATION, DEFAULT_REBOOT_COMMAND,
    DEFAULT_SENTINEL,
};
use reboot_coordinator::controller::{Collaborators, Orchestrator};
use reboot_coordinator::exec::split_command;
use reboot_coordinator::store::{ClusterStore, KubeStore};
use reboot_coordinator::window::TimeWindow;
use reboot_coordinator::Error;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reboot daemon on this node
    Run(RunArgs),
    /// Show version information
    Version,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LockStrategyArg {
    Daemonset,
    Leases,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RebootMethodArg {
    Command,
    Signal,
}

fn duration_arg(value: &str) -> Result<Duration, String> {
    parse_duration(value).map_err(|e| e.to_string())
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Node identity used in lock records; defaults to the hostname
    #[arg(long, env = "NODE_ID")]
    node_id: Option<String>,

    /// How often to check for a pending reboot
    #[arg(long, env = "PERIOD", default_value = "1h", value_parser = duration_arg)]
    period: Duration,

    /// Coordination lock backend
    #[arg(long, env = "LOCK_STRATEGY", value_enum, default_value = "daemonset")]
    lock_strategy: LockStrategyArg,

    /// Maximum number of nodes rebooting at once (requires leases)
    #[arg(long, env = "CONCURRENCY", default_value_t = 1)]
    concurrency: u32,

    #[arg(long, env = "DS_NAMESPACE", default_value = "kube-system")]
    ds_namespace: String,

    #[arg(long, env = "DS_NAME", default_value = "reboot-coordinator")]
    ds_name: String,

    #[arg(long, env = "LOCK_ANNOTATION", default_value = DEFAULT_LOCK_ANNOTATION)]
    lock_annotation: String,

    /// Lock validity; 0 never expires
    #[arg(long, env = "LOCK_TTL", default_value = "0", value_parser = duration_arg)]
    lock_ttl: Duration,

    /// Hold the lock this long after uncordoning
    #[arg(long, env = "LOCK_RELEASE_DELAY", default_value = "0", value_parser = duration_arg)]
    lock_release_delay: Duration,

    #[arg(long, env = "LOCK_CONFLICT_BACKOFF", default_value = "1s", value_parser = duration_arg)]
    lock_conflict_backoff: Duration,

    #[arg(long, env = "LEASE_NAMESPACE", default_value = "kube-system")]
    lease_namespace: String,

    #[arg(long, env = "LEASE_NAME", default_value = "reboot-coordinator")]
    lease_name: String,

    #[arg(long, env = "LEASE_DURATION", default_value = "15s", value_parser = duration_arg)]
    lease_duration: Duration,

    #[arg(long, env = "LEASE_RENEW_DEADLINE", default_value = "10s", value_parser = duration_arg)]
    lease_renew_deadline: Duration,

    #[arg(long, env = "LEASE_RETRY_PERIOD", default_value = "2s", value_parser = duration_arg)]
    lease_retry_period: Duration,

    /// File whose presence means a reboot is pending
    #[arg(long, env = "REBOOT_SENTINEL", default_value = DEFAULT_SENTINEL)]
    reboot_sentinel: PathBuf,

    /// Command whose zero exit means a reboot is pending; overrides the sentinel file
    #[arg(long, env = "REBOOT_SENTINEL_COMMAND")]
    reboot_sentinel_command: Option<String>,

    /// Run commands in the host's mount namespace through nsenter
    #[arg(long, env = "HOST_NAMESPACE")]
    host_namespace: bool,

    #[arg(long, env = "REBOOT_METHOD", value_enum, default_value = "command")]
    reboot_method: RebootMethodArg,

    #[arg(long, env = "REBOOT_COMMAND", default_value = DEFAULT_REBOOT_COMMAND)]
    reboot_command: String,

    /// Signal number sent to PID 1; defaults to SIGRTMIN+5
    #[arg(long, env = "REBOOT_SIGNAL")]
    reboot_signal: Option<i32>,

    /// Prometheus base URL; active alerts block reboots
    #[arg(long, env = "PROMETHEUS_URL")]
    prometheus_url: Option<String>,

    /// Alerts whose name matches are ignored
    #[arg(long, env = "ALERT_FILTER_REGEXP")]
    alert_filter_regexp: Option<String>,

    /// Only alerts matching the filter block
    #[arg(long, env = "ALERT_FILTER_MATCH_ONLY")]
    alert_filter_match_only: bool,

    /// Ignore pending alerts
    #[arg(long, env = "ALERT_FIRING_ONLY")]
    alert_firing_only: bool,

    /// Only alerts carrying this label value block (k=v, repeatable)
    #[arg(long = "alert-label", env = "ALERT_LABELS", value_delimiter = ',')]
    alert_labels: Vec<String>,

    /// Pods on this node matching the selector block reboots (repeatable)
    #[arg(long = "blocking-pod-selector", env = "BLOCKING_POD_SELECTORS")]
    blocking_pod_selectors: Vec<String>,

    /// Node label (`name` or `name=value`) that blocks reboots (repeatable)
    #[arg(long = "blocking-node-label", env = "BLOCKING_NODE_LABELS", value_delimiter = ',')]
    blocking_node_labels: Vec<String>,

    /// Node annotation that blocks reboots (repeatable)
    #[arg(long = "blocking-node-annotation", env = "BLOCKING_NODE_ANNOTATIONS", value_delimiter = ',')]
    blocking_node_annotations: Vec<String>,

    /// Days reboots are allowed on, e.g. mon,tue,wed
    #[arg(long, env = "REBOOT_DAYS", value_delimiter = ',')]
    reboot_days: Vec<String>,

    #[arg(long, env = "START_TIME")]
    start_time: Option<String>,

    #[arg(long, env = "END_TIME")]
    end_time: Option<String>,

    #[arg(long, env = "TIME_ZONE")]
    time_zone: Option<String>,

    /// Pod termination grace period in seconds; negative uses each pod's own
    #[arg(long, env = "DRAIN_GRACE_PERIOD", default_value_t = -1, allow_negative_numbers = true)]
    drain_grace_period: i64,

    /// Give up draining after this long; 0 waits forever
    #[arg(long, env = "DRAIN_TIMEOUT", default_value = "0", value_parser = duration_arg)]
    drain_timeout: Duration,

    /// Only evict pods matching this selector
    #[arg(long, env = "DRAIN_POD_SELECTOR")]
    drain_pod_selector: Option<String>,

    /// Wait this long after acquiring the lock before draining
    #[arg(long, env = "DRAIN_DELAY", default_value = "0", value_parser = duration_arg)]
    drain_delay: Duration,

    /// Refuse to drain pods using emptyDir volumes
    #[arg(long, env = "SKIP_DELETE_EMPTYDIR_DATA")]
    skip_delete_emptydir_data: bool,

    /// Evict pods that no controller will recreate
    #[arg(long, env = "FORCE_DRAIN", default_value_t = true, action = clap::ArgAction::Set)]
    force_drain: bool,

    /// Reboot even if the drain fails
    #[arg(long, env = "FORCE_REBOOT")]
    force_reboot: bool,

    /// Wait this long between drain and reboot
    #[arg(long, env = "REBOOT_DELAY", default_value = "0", value_parser = duration_arg)]
    reboot_delay: Duration,

    /// PreferNoSchedule taint key set while rebooting; empty disables it
    #[arg(long, env = "PREFER_NO_SCHEDULE_TAINT", default_value = "reboot-coordinator.io/rebooting")]
    prefer_no_schedule_taint: String,

    /// Record reboot progress in node annotations
    #[arg(long, env = "ANNOTATE_NODES")]
    annotate_nodes: bool,

    #[arg(long, env = "PRE_REBOOT_NODE_LABELS", value_delimiter = ',')]
    pre_reboot_node_labels: Vec<String>,

    #[arg(long, env = "POST_REBOOT_NODE_LABELS", value_delimiter = ',')]
    post_reboot_node_labels: Vec<String>,

    /// Webhook receiving drain/reboot/uncordon notifications
    #[arg(long, env = "NOTIFY_URL")]
    notify_url: Option<String>,

    #[arg(long, env = "MESSAGE_TEMPLATE_DRAIN", default_value = "Draining node %s")]
    message_template_drain: String,

    #[arg(long, env = "MESSAGE_TEMPLATE_REBOOT", default_value = "Rebooting node %s")]
    message_template_reboot: String,

    #[arg(
        long,
        env = "MESSAGE_TEMPLATE_UNCORDON",
        default_value = "Node %s rebooted & uncordoned successfully!"
    )]
    message_template_uncordon: String,

    /// Address of the /metrics and /health endpoints
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn node_id(args: &RunArgs) -> Result<String, Error> {
    if let Some(id) = args.node_id.as_deref().filter(|id| !id.trim().is_empty()) {
        return Ok(id.to_string());
    }
    if let Ok(id) = std::env::var("HOSTNAME") {
        if !id.trim().is_empty() {
            return Ok(id);
        }
    }
    hostname::get()
        .map_err(Error::IoError)?
        .into_string()
        .map_err(|_| Error::ConfigError("hostname is not valid UTF-8".to_string()))
}

fn optional(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}

fn build_config(args: &RunArgs) -> Result<DaemonConfig, Error> {
    let window = if args.reboot_days.is_empty()
        && args.start_time.is_none()
        && args.end_time.is_none()
        && args.time_zone.is_none()
    {
        None
    } else {
        Some(TimeWindow::new(
            &args.reboot_days,
            args.start_time.as_deref().unwrap_or("00:00"),
            args.end_time.as_deref().unwrap_or("23:59:59"),
            args.time_zone.as_deref().unwrap_or("UTC"),
        )?)
    };

    let alerts = match args.prometheus_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => Some(AlertConfig {
            prometheus_url: url.to_string(),
            filter: parse_alert_filter(args.alert_filter_regexp.as_deref())?,
            match_only: args.alert_filter_match_only,
            firing_only: args.alert_firing_only,
            labels: parse_label_pairs(&args.alert_labels)?,
        }),
        None => None,
    };

    let config = DaemonConfig {
        period: args.period,
        lock: LockConfig {
            strategy: match args.lock_strategy {
                LockStrategyArg::Daemonset => LockStrategy::DaemonSet,
                LockStrategyArg::Leases => LockStrategy::Leases,
            },
            concurrency: args.concurrency,
            daemonset_namespace: args.ds_namespace.clone(),
            daemonset_name: args.ds_name.clone(),
            annotation: args.lock_annotation.clone(),
            ttl: optional(args.lock_ttl),
            release_delay: args.lock_release_delay,
            conflict_backoff: args.lock_conflict_backoff,
            lease_namespace: args.lease_namespace.clone(),
            lease_name: args.lease_name.clone(),
            lease_duration: args.lease_duration,
            renew_deadline: args.lease_renew_deadline,
            retry_period: args.lease_retry_period,
        },
        sentinel: SentinelConfig {
            file: args.reboot_sentinel.clone(),
            command: args.reboot_sentinel_command.as_deref().map(split_command),
            host_namespace: args.host_namespace,
        },
        reboot: RebootConfig {
            method: match args.reboot_method {
                RebootMethodArg::Command => RebootMethod::Command,
                RebootMethodArg::Signal => RebootMethod::Signal,
            },
            command: split_command(&args.reboot_command),
            signal: args.reboot_signal,
            host_namespace: args.host_namespace,
        },
        blockers: BlockerConfig {
            alerts,
            pod_selectors: args.blocking_pod_selectors.clone(),
            node_labels: args.blocking_node_labels.clone(),
            node_annotations: args.blocking_node_annotations.clone(),
        },
        window,
        drain: DrainOptions {
            grace_period: (args.drain_grace_period >= 0).then_some(args.drain_grace_period),
            pod_selector: args.drain_pod_selector.clone().filter(|s| !s.is_empty()),
            timeout: optional(args.drain_timeout),
            delete_empty_dir: !args.skip_delete_emptydir_data,
            ignore_daemonsets: true,
            force: args.force_drain,
        },
        drain_delay: args.drain_delay,
        reboot_delay: args.reboot_delay,
        force_reboot: args.force_reboot,
        prefer_no_schedule_taint: Some(args.prefer_no_schedule_taint.clone())
            .filter(|key| !key.is_empty()),
        annotate_nodes: args.annotate_nodes,
        pre_reboot_node_labels: parse_label_pairs(&args.pre_reboot_node_labels)?,
        post_reboot_node_labels: parse_label_pairs(&args.post_reboot_node_labels)?,
        notify_url: args.notify_url.clone().filter(|url| !url.is_empty()),
        messages: MessageTemplates {
            drain: args.message_template_drain.clone(),
            reboot: args.message_template_reboot.clone(),
            uncordon: args.message_template_uncordon.clone(),
        },
        ..DaemonConfig::new(node_id(args)?)
    };
    config.validate()?;
    Ok(config)
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    // Only enable OTEL if an endpoint is provided
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = reboot_coordinator::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("Reboot Coordinator v{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(run_args) => {
            init_tracing(run_args.log_format);
            let result = run_daemon(run_args).await;
            if let Err(e) = &result {
                error!(retriable = e.is_retriable(), "Fatal error: {}", e);
            }
            reboot_coordinator::telemetry::shutdown_telemetry();
            result
        }
    }
}

async fn run_daemon(args: RunArgs) -> Result<(), Error> {
    let config = build_config(&args)?;
    info!(
        "Starting Reboot Coordinator v{} on node {}",
        env!("CARGO_PKG_VERSION"),
        config.node_id
    );
    info!(
        "Lock: {} (concurrency {}), period {:?}",
        config.lock.strategy, config.lock.concurrency, config.period
    );
    match &config.window {
        Some(window) => info!("Reboot window: {}", window),
        None => info!("Reboot window: always"),
    }

    let client = kube::Client::try_default()
        .await
        .map_err(Error::KubeError)?;
    info!("Connected to Kubernetes cluster");

    let store: Arc<dyn ClusterStore> = Arc::new(KubeStore::new(client));
    let collaborators = Collaborators::from_config(&config, store)?;

    #[cfg(feature = "metrics")]
    {
        let node = config.node_id.clone();
        let checker = collaborators.checker.clone();
        tokio::spawn(reboot_coordinator::controller::metrics::maintain_reboot_required_metric(
            node,
            checker,
            reboot_coordinator::controller::metrics::REFRESH_INTERVAL,
        ));
    }

    #[cfg(feature = "rest-api")]
    {
        let addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = reboot_coordinator::rest_api::run_server(addr).await {
                error!("Metrics server error: {:?}", e);
            }
        });
    }
    #[cfg(not(feature = "rest-api"))]
    let _ = args.metrics_addr;

    Orchestrator::new(config, collaborators).run().await
}
