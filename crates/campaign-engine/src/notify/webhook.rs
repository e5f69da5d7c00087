//! HTTP webhook delivery of lifecycle notifications

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Notification, NotificationPublisher, Topic};
use crate::config::NotificationConfig;
use crate::error::{CampaignError, Result};

/// POSTs each notification as JSON to the URL configured for its topic.
///
/// Delivery happens on a spawned task; failures are logged and dropped.
pub struct WebhookPublisher {
    client: reqwest::Client,
    endpoints: HashMap<Topic, String>,
}

impl WebhookPublisher {
    pub fn new(config: &NotificationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.webhook_timeout_ms))
            .build()
            .map_err(|e| CampaignError::configuration(format!("Failed to build webhook client: {}", e)))?;

        let mut endpoints = HashMap::new();
        for (name, url) in &config.webhooks {
            let topic = Topic::ALL
                .into_iter()
                .find(|t| t.as_str() == name)
                .ok_or_else(|| CampaignError::configuration(format!("Unknown notification topic '{}'", name)))?;
            endpoints.insert(topic, url.clone());
        }

        Ok(Self { client, endpoints })
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoint(&self, topic: Topic) -> Option<&str> {
        self.endpoints.get(&topic).map(String::as_str)
    }
}

impl NotificationPublisher for WebhookPublisher {
    fn publish(&self, notification: Notification) -> Result<()> {
        let topic = notification.topic();
        let Some(url) = self.endpoints.get(&topic).cloned() else {
            return Ok(());
        };

        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| CampaignError::internal("Webhook delivery requires a Tokio runtime"))?;
        let client = self.client.clone();

        handle.spawn(async move {
            match client.post(&url).json(&notification).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(topic = %topic, url = %url, "Webhook delivered");
                }
                Ok(response) => {
                    warn!(topic = %topic, url = %url, status = %response.status(), "Webhook rejected");
                }
                Err(e) => {
                    warn!(topic = %topic, url = %url, error = %e, "Webhook delivery failed");
                }
            }
        });
        Ok(())
    }
}
