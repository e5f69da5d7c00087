//! Intake queue message format and partial-batch ingestion
//!
//! Producers deliver dial tasks as JSON messages. A batch is processed message
//! by message: malformed or invalid messages are reported individually in
//! `batchItemFailures` and the rest of the batch is accepted, so one bad
//! contact row never forces the whole batch to be redelivered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::queue::TaskQueue;
use crate::error::{CampaignError, Result};
use crate::types::{CampaignId, ContactId, DialTask, TaskId};

/// Body of one intake message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMessage {
    pub task_id: String,
    pub campaign_id: String,
    pub contact_id: String,
    pub phone_number: String,
    pub audio_ref: String,
    pub ivr_flow: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// When the producer created the task. Part of the call id, so
    /// redeliveries of the same message map onto the same call.
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl TaskMessage {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("taskId", &self.task_id),
            ("campaignId", &self.campaign_id),
            ("contactId", &self.contact_id),
            ("audioRef", &self.audio_ref),
            ("ivrFlow", &self.ivr_flow),
        ] {
            if value.trim().is_empty() {
                return Err(CampaignError::invalid_input(format!("{} cannot be empty", field)));
            }
        }
        validate_phone_number(&self.phone_number)
    }

    /// Freeze into a [`DialTask`]. `fallback` stamps messages that carry no
    /// submission time of their own.
    pub fn into_task(self, fallback: DateTime<Utc>) -> Result<DialTask> {
        self.validate()?;
        let submitted_at = self.submitted_at.unwrap_or(fallback);
        Ok(DialTask {
            task_id: TaskId(self.task_id),
            campaign_id: CampaignId(self.campaign_id),
            contact_id: ContactId(self.contact_id),
            phone_number: self.phone_number,
            audio_ref: self.audio_ref,
            ivr_flow: self.ivr_flow,
            metadata: self.metadata,
            submitted_at,
        })
    }
}

/// E.164-ish: optional leading `+`, then 6 to 15 digits
pub fn validate_phone_number(number: &str) -> Result<()> {
    let digits = number.strip_prefix('+').unwrap_or(number);
    if digits.len() < 6 || digits.len() > 15 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(CampaignError::invalid_input(format!("Invalid phone number: {}", number)));
    }
    Ok(())
}

/// Raw message as handed over by the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    /// Time the transport first accepted the message; stable across redeliveries
    #[serde(default)]
    pub sent_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueBatch {
    pub records: Vec<QueueMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

/// Per-message outcome of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

/// Messages of a batch that parsed, keyed by message id, plus the ones that did not
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub tasks: Vec<(String, DialTask)>,
    pub failures: BatchResponse,
}

impl ParsedBatch {
    pub fn reject(&mut self, message_id: impl Into<String>) {
        self.failures.batch_item_failures.push(BatchItemFailure {
            item_identifier: message_id.into(),
        });
    }
}

/// Parse every message of a batch without enqueueing anything.
///
/// The submission time comes from the message body, then the transport's
/// sent time, then `now`.
pub fn parse_batch(batch: QueueBatch, now: DateTime<Utc>) -> ParsedBatch {
    let mut parsed = ParsedBatch::default();

    for message in batch.records {
        let fallback = message.sent_timestamp.unwrap_or(now);
        let task = serde_json::from_str::<TaskMessage>(&message.body)
            .map_err(CampaignError::from)
            .and_then(|m| m.into_task(fallback));

        match task {
            Ok(task) => parsed.tasks.push((message.message_id, task)),
            Err(e) => {
                warn!(message_id = %message.message_id, error = %e, "Rejecting intake message");
                parsed.reject(message.message_id);
            }
        }
    }
    parsed
}

/// Parse and enqueue every message onto one queue; report the ones that failed.
///
/// Redelivered messages whose task is queued or already finished count as successes.
pub fn ingest_batch(queue: &TaskQueue, batch: QueueBatch, now: DateTime<Utc>) -> BatchResponse {
    let parsed = parse_batch(batch, now);
    for (message_id, task) in parsed.tasks {
        let task_id = task.task_id.clone();
        if !queue.enqueue(task, now) {
            debug!(message_id = %message_id, task_id = %task_id, "Duplicate delivery of known task");
        }
    }
    parsed.failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntakeConfig;
    use crate::intake::LeaseGate;
    use crate::types::AdmissionClass;

    fn body(task_id: &str, phone: &str) -> String {
        serde_json::json!({
            "taskId": task_id,
            "campaignId": "camp-1",
            "contactId": format!("contact-{}", task_id),
            "phoneNumber": phone,
            "audioRef": "audio/appeal.wav",
            "ivrFlow": "donation",
            "metadata": { "segment": "lapsed" }
        })
        .to_string()
    }

    #[test]
    fn test_partial_batch_failure_reporting() {
        let queue = TaskQueue::new(AdmissionClass::Voice, &IntakeConfig::default());
        let batch = QueueBatch {
            records: vec![
                QueueMessage { message_id: "m1".into(), body: body("t1", "+15550100"), sent_timestamp: None },
                QueueMessage { message_id: "m2".into(), body: "{\"taskId\": 5".into(), sent_timestamp: None },
                QueueMessage { message_id: "m3".into(), body: body("t3", "call-me"), sent_timestamp: None },
                QueueMessage { message_id: "m4".into(), body: body("t4", "4420790001"), sent_timestamp: None },
            ],
        };

        let response = ingest_batch(&queue, batch, Utc::now());
        let failed: Vec<&str> = response
            .batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
            .collect();
        assert_eq!(failed, vec!["m2", "m3"]);
        assert_eq!(queue.stats().pending, 2);
    }

    #[test]
    fn test_call_id_is_stable_across_redeliveries() {
        let mut message: serde_json::Value = serde_json::from_str(&body("t1", "+15550100")).unwrap();
        message["submittedAt"] = serde_json::json!("2026-03-01T09:00:00Z");
        let parse = |now| {
            let batch = QueueBatch {
                records: vec![QueueMessage { message_id: "m1".into(), body: message.to_string(), sent_timestamp: None }],
            };
            parse_batch(batch, now).tasks.remove(0).1
        };

        let first = parse(Utc::now());
        let second = parse(Utc::now() + chrono::Duration::hours(2));
        assert_eq!(first.submitted_at, second.submitted_at);
        assert_eq!(first.call_id(), second.call_id());
    }

    #[test]
    fn test_redelivery_after_ack_is_not_dialled_again() {
        let queue = TaskQueue::new(AdmissionClass::Voice, &IntakeConfig::default());
        let gate = LeaseGate::new();
        gate.open(&"camp-1".into());
        let now = Utc::now();
        let sent = now - chrono::Duration::minutes(5);
        let batch = || QueueBatch {
            records: vec![QueueMessage { message_id: "m1".into(), body: body("t1", "+15550100"), sent_timestamp: Some(sent) }],
        };

        assert!(ingest_batch(&queue, batch(), now).batch_item_failures.is_empty());
        let first = queue.lease(now, 10, &gate).remove(0);
        assert_eq!(first.task.submitted_at, sent);
        queue.ack(&first.receipt).unwrap();

        let later = now + chrono::Duration::minutes(1);
        assert!(ingest_batch(&queue, batch(), later).batch_item_failures.is_empty());
        assert!(queue.lease(later, 10, &gate).is_empty());
        assert_eq!(queue.stats().pending, 0);
    }

    #[test]
    fn test_response_wire_format() {
        let response = BatchResponse {
            batch_item_failures: vec![BatchItemFailure { item_identifier: "m9".into() }],
        };
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"batchItemFailures":[{"itemIdentifier":"m9"}]}"#
        );
    }

    #[test]
    fn test_phone_validation() {
        assert!(validate_phone_number("+15550100").is_ok());
        assert!(validate_phone_number("12345").is_err());
        assert!(validate_phone_number("+1555abc0100").is_err());
    }
}
