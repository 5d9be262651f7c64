//! Notification channels.
//!
//! Channels are independently pluggable behind [`NotificationChannel`]; a
//! failing channel never blocks delivery to the others.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use spendwatch_core::{
    Alert, AlertEvent, ChannelConfig, NotificationChannel, Result, SpendWatchError,
};
use tracing::{info, warn};

/// Channel that logs notifications through the tracing subscriber.
pub struct ConsoleChannel {
    name: String,
}

impl ConsoleChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &Alert, event: AlertEvent) -> Result<()> {
        match event {
            AlertEvent::Triggered => warn!(
                alert_id = %alert.id,
                rule = %alert.rule_name,
                severity = %alert.severity,
                current_value = alert.current_value,
                threshold = alert.threshold,
                "ALERT triggered"
            ),
            AlertEvent::Resolved => info!(
                alert_id = %alert.id,
                rule = %alert.rule_name,
                "Alert resolved"
            ),
        }
        Ok(())
    }
}

/// JSON body POSTed by [`WebhookChannel`].
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: String,
    alert_id: String,
    rule_name: &'a str,
    severity: String,
    current_value: f64,
    threshold: f64,
    triggered_at: String,
}

/// Channel that POSTs alert events to a configured URL.
pub struct WebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(name: &str, url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                SpendWatchError::Config(format!("failed to build webhook client: {e}"))
            })?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, alert: &Alert, event: AlertEvent) -> Result<()> {
        let payload = WebhookPayload {
            event: event.to_string(),
            alert_id: alert.id.to_string(),
            rule_name: &alert.rule_name,
            severity: alert.severity.to_string(),
            current_value: alert.current_value,
            threshold: alert.threshold,
            triggered_at: alert.triggered_at.to_rfc3339(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SpendWatchError::ExternalService(format!("webhook POST failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SpendWatchError::ExternalService(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Build the channel set from configuration.
///
/// When the config names no channels at all, a default console channel is
/// provided so alerts are never silently dropped.
pub fn build_channels(configs: &[ChannelConfig]) -> Result<Vec<Arc<dyn NotificationChannel>>> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    for config in configs.iter().filter(|c| c.enabled) {
        match config.kind.as_str() {
            "console" => channels.push(Arc::new(ConsoleChannel::new(&config.name))),
            "webhook" => {
                if config.webhook_url.is_empty() {
                    return Err(SpendWatchError::Config(format!(
                        "webhook channel '{}' has no webhook_url",
                        config.name
                    )));
                }
                channels.push(Arc::new(WebhookChannel::new(
                    &config.name,
                    &config.webhook_url,
                )?));
            }
            other => {
                return Err(SpendWatchError::Config(format!(
                    "unknown channel kind '{other}' for channel '{}'",
                    config.name
                )));
            }
        }
    }
    if channels.is_empty() {
        channels.push(Arc::new(ConsoleChannel::new("console")));
    }
    Ok(channels)
}
