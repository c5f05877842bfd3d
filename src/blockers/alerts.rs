//! Active-alert blocker backed by the Prometheus alerts API

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{BlockerResult, RebootBlocker};
use crate::config::AlertConfig;
use crate::error::{Error, Result};

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// An alert as returned by `/api/v1/alerts`
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Alert {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub state: String,
}

impl Alert {
    pub fn name(&self) -> &str {
        self.labels.get("alertname").map(String::as_str).unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
struct AlertsResponse {
    status: String,
    #[serde(default)]
    data: Option<AlertsData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlertsData {
    #[serde(default)]
    alerts: Vec<Alert>,
}

pub struct AlertBlocker {
    client: Client,
    config: AlertConfig,
}

impl AlertBlocker {
    pub fn new(config: AlertConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(QUERY_TIMEOUT)
            .user_agent(concat!("reboot-coordinator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self { client, config })
    }

    /// Fetch every active alert from Prometheus
    pub async fn active_alerts(&self) -> Result<Vec<Alert>> {
        let url = format!(
            "{}/api/v1/alerts",
            self.config.prometheus_url.trim_end_matches('/')
        );
        debug!("Querying active alerts: {}", url);

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(Error::CommandError(format!(
                "prometheus returned HTTP {}",
                response.status()
            )));
        }

        let body: AlertsResponse = response.json().await?;
        if body.status != "success" {
            return Err(Error::CommandError(format!(
                "prometheus query failed: {}",
                body.error.unwrap_or_else(|| body.status.clone())
            )));
        }
        Ok(body.data.map(|d| d.alerts).unwrap_or_default())
    }

    /// Names of the alerts that count against a reboot, sorted and deduplicated
    pub fn blocking_alert_names(&self, alerts: &[Alert]) -> Vec<String> {
        let mut names: Vec<String> = alerts
            .iter()
            .filter(|a| !self.config.firing_only || a.state == "firing")
            .filter(|a| match &self.config.filter {
                Some(re) => re.is_match(a.name()) == self.config.match_only,
                None => true,
            })
            .filter(|a| {
                self.config
                    .labels
                    .iter()
                    .all(|(k, v)| a.labels.get(k) == Some(v))
            })
            .map(|a| a.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

#[async_trait]
impl RebootBlocker for AlertBlocker {
    fn name(&self) -> &str {
        "prometheus-alerts"
    }

    async fn check(&self) -> BlockerResult {
        match self.active_alerts().await {
            Ok(alerts) => {
                let names = self.blocking_alert_names(&alerts);
                if names.is_empty() {
                    BlockerResult::clear()
                } else {
                    BlockerResult::blocked(
                        names
                            .into_iter()
                            .map(|n| format!("active alert {n}"))
                            .collect(),
                    )
                }
            }
            Err(e) => {
                warn!(
                    "Unable to query alerts from {}, blocking reboot: {}",
                    self.config.prometheus_url, e
                );
                BlockerResult::unverifiable(format!("alert query failed: {e}"))
            }
        }
    }
}
