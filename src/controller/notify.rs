//! Outbound notifications
//!
//! Delivery is best effort: the orchestrator goes through [`notify`], which
//! logs failures and never propagates them.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, message: &str, title: &str) -> Result<()>;
}

/// Used when no notification URL is configured
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, message: &str, _title: &str) -> Result<()> {
        debug!("Notification (not delivered): {}", message);
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    text: &'a str,
}

/// POSTs `{"title": ..., "text": ...}` to a webhook URL
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(Error::HttpError)?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, message: &str, title: &str) -> Result<()> {
        self.client
            .post(&self.url)
            .json(&WebhookPayload {
                title,
                text: message,
            })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

pub fn build_notifier(url: Option<&str>) -> Result<Box<dyn Notifier>> {
    Ok(match url {
        Some(url) if !url.is_empty() => Box::new(WebhookNotifier::new(url)?),
        _ => Box::new(NoopNotifier),
    })
}

/// Fire-and-forget send
pub async fn notify(notifier: &dyn Notifier, message: &str, title: &str) {
    if let Err(e) = notifier.send(message, title).await {
        warn!("Error notifying: {}", e);
    }
}
