//! # Lifecycle Notifications
//!
//! Fire-and-forget outbound events, one topic per concern:
//!
//! | Topic             | Events                                                    |
//! |-------------------|-----------------------------------------------------------|
//! | `call-events`     | `state_change`, `dial_end`, `dtmf_received`, `call_ended` |
//! | `donation-events` | `donation_requested`                                      |
//! | `opt-out-events`  | `optout_requested`                                        |
//! | `campaign-alerts` | `dead_lettered`, `execution_failed`                       |
//!
//! Publishing never waits on a consumer. [`BroadcastPublisher`] fans events
//! out in-process, [`WebhookPublisher`] POSTs them to per-topic URLs from a
//! spawned task, and [`FanoutPublisher`] combines several publishers.

pub mod webhook;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{CallId, CampaignId, ContactId};

pub use webhook::WebhookPublisher;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
pub enum Topic {
    #[serde(rename = "call-events")]
    CallEvents,
    #[serde(rename = "donation-events")]
    DonationEvents,
    #[serde(rename = "opt-out-events")]
    OptOutEvents,
    #[serde(rename = "campaign-alerts")]
    CampaignAlerts,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::CallEvents,
        Topic::DonationEvents,
        Topic::OptOutEvents,
        Topic::CampaignAlerts,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::CallEvents => "call-events",
            Topic::DonationEvents => "donation-events",
            Topic::OptOutEvents => "opt-out-events",
            Topic::CampaignAlerts => "campaign-alerts",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    StateChange,
    DialEnd,
    DtmfReceived,
    CallEnded,
    DonationRequested,
    OptoutRequested,
    DeadLettered,
    ExecutionFailed,
}

impl NotificationKind {
    pub fn topic(&self) -> Topic {
        match self {
            NotificationKind::StateChange
            | NotificationKind::DialEnd
            | NotificationKind::DtmfReceived
            | NotificationKind::CallEnded => Topic::CallEvents,
            NotificationKind::DonationRequested => Topic::DonationEvents,
            NotificationKind::OptoutRequested => Topic::OptOutEvents,
            NotificationKind::DeadLettered | NotificationKind::ExecutionFailed => Topic::CampaignAlerts,
        }
    }
}

/// One outbound event
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub event_type: NotificationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<CallId>,
    pub campaign_id: CampaignId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<ContactId>,
    pub timestamp: DateTime<Utc>,
    /// Event-specific fields (`state`, `digit`, `outcome`, ...)
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl Notification {
    pub fn for_call(
        kind: NotificationKind,
        call_id: &CallId,
        campaign_id: &CampaignId,
        contact_id: &ContactId,
        timestamp: DateTime<Utc>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            event_type: kind,
            call_id: Some(call_id.clone()),
            campaign_id: campaign_id.clone(),
            contact_id: Some(contact_id.clone()),
            timestamp,
            details,
        }
    }

    pub fn for_campaign(
        kind: NotificationKind,
        campaign_id: &CampaignId,
        timestamp: DateTime<Utc>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            event_type: kind,
            call_id: None,
            campaign_id: campaign_id.clone(),
            contact_id: None,
            timestamp,
            details,
        }
    }

    pub fn topic(&self) -> Topic {
        self.event_type.topic()
    }
}

/// Sink for lifecycle notifications
///
/// `publish` hands the event off and returns; a returned error means the
/// event could not even be handed off.
pub trait NotificationPublisher: Send + Sync {
    fn publish(&self, notification: Notification) -> Result<()>;
}

/// In-process publisher: one broadcast channel per topic
pub struct BroadcastPublisher {
    channels: HashMap<Topic, broadcast::Sender<Notification>>,
    published: HashMap<Topic, AtomicU64>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut channels = HashMap::new();
        let mut published = HashMap::new();
        for topic in Topic::ALL {
            let (tx, _) = broadcast::channel(capacity);
            channels.insert(topic, tx);
            published.insert(topic, AtomicU64::new(0));
        }
        Self { channels, published }
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Notification> {
        match self.channels.get(&topic) {
            Some(tx) => tx.subscribe(),
            // every topic is created in `new`
            None => broadcast::channel(1).1,
        }
    }

    /// Events published on a topic since startup
    pub fn published(&self, topic: Topic) -> u64 {
        self.published
            .get(&topic)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl NotificationPublisher for BroadcastPublisher {
    fn publish(&self, notification: Notification) -> Result<()> {
        let topic = notification.topic();
        if let Some(counter) = self.published.get(&topic) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            topic = %topic,
            event_type = ?notification.event_type,
            call_id = ?notification.call_id,
            campaign_id = %notification.campaign_id,
            "Publishing notification"
        );
        if let Some(tx) = self.channels.get(&topic) {
            // no subscribers is fine for fire-and-forget
            let _ = tx.send(notification);
        }
        Ok(())
    }
}

/// Publishes to every inner publisher; one failing sink does not stop the others
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn NotificationPublisher>>,
}

impl FanoutPublisher {
    pub fn new(publishers: Vec<Arc<dyn NotificationPublisher>>) -> Self {
        Self { publishers }
    }
}

impl NotificationPublisher for FanoutPublisher {
    fn publish(&self, notification: Notification) -> Result<()> {
        let mut failed = 0;
        let mut last_error = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(notification.clone()) {
                warn!(error = %e, "Notification sink failed");
                failed += 1;
                last_error = Some(e);
            }
        }
        // only an error when nothing accepted the event
        match last_error {
            Some(e) if failed == self.publishers.len() => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: NotificationKind) -> Notification {
        Notification::for_call(
            kind,
            &"call-1".into(),
            &"camp-1".into(),
            &"contact-1".into(),
            Utc::now(),
            serde_json::json!({ "digit": "1" }),
        )
    }

    #[test]
    fn test_kinds_route_to_their_topics() {
        assert_eq!(NotificationKind::CallEnded.topic(), Topic::CallEvents);
        assert_eq!(NotificationKind::DonationRequested.topic(), Topic::DonationEvents);
        assert_eq!(NotificationKind::OptoutRequested.topic(), Topic::OptOutEvents);
        assert_eq!(NotificationKind::DeadLettered.topic(), Topic::CampaignAlerts);
    }

    #[test]
    fn test_payload_shape() {
        let value = serde_json::to_value(sample(NotificationKind::DtmfReceived)).unwrap();
        assert_eq!(value["eventType"], "dtmf_received");
        assert_eq!(value["callId"], "call-1");
        assert_eq!(value["campaignId"], "camp-1");
        assert_eq!(value["contactId"], "contact-1");
        assert_eq!(value["details"]["digit"], "1");
        assert!(value.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn test_broadcast_delivers_per_topic() {
        let publisher = BroadcastPublisher::new(16);
        let mut donations = publisher.subscribe(Topic::DonationEvents);
        let mut calls = publisher.subscribe(Topic::CallEvents);

        publisher.publish(sample(NotificationKind::DonationRequested)).unwrap();
        publisher.publish(sample(NotificationKind::CallEnded)).unwrap();

        assert_eq!(donations.recv().await.unwrap().event_type, NotificationKind::DonationRequested);
        assert_eq!(calls.recv().await.unwrap().event_type, NotificationKind::CallEnded);
        assert!(donations.try_recv().is_err());
        assert_eq!(publisher.published(Topic::CallEvents), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let publisher = BroadcastPublisher::new(4);
        assert!(publisher.publish(sample(NotificationKind::StateChange)).is_ok());
    }
}
