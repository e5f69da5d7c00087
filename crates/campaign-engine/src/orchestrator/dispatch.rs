//! SMS dispatch
//!
//! SMS executions do not go through the call engine. Their tasks are handed
//! to an [`SmsDispatcher`] on a background task; when dispatch returns the
//! execution is complete and its slot is released.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::execution::CampaignExecution;
use crate::error::{CampaignError, Result};
use crate::intake::TaskQueue;
use crate::types::{AdmissionClass, CampaignId, DialTask};

#[async_trait]
pub trait SmsDispatcher: Send + Sync {
    /// Dispatch every task of the execution. Returns how many were accepted.
    async fn dispatch(&self, execution: &CampaignExecution, tasks: Vec<DialTask>) -> Result<usize>;

    /// Withdraw the campaign's messages not yet picked up. Returns how many.
    fn purge(&self, campaign_id: &CampaignId) -> usize;
}

/// Hands SMS tasks to the SMS partition of the intake queue, where the
/// messaging gateway consumer picks them up.
pub struct SmsQueueDispatcher {
    queue: Arc<TaskQueue>,
}

impl SmsQueueDispatcher {
    pub fn new(queue: Arc<TaskQueue>) -> Result<Self> {
        if queue.class() != AdmissionClass::Sms {
            return Err(CampaignError::configuration(format!(
                "SMS dispatcher needs the sms queue, got the {} queue",
                queue.class()
            )));
        }
        Ok(Self { queue })
    }
}

#[async_trait]
impl SmsDispatcher for SmsQueueDispatcher {
    async fn dispatch(&self, execution: &CampaignExecution, tasks: Vec<DialTask>) -> Result<usize> {
        let now = Utc::now();
        let accepted = tasks
            .into_iter()
            .filter(|task| self.queue.enqueue(task.clone(), now))
            .count();
        info!(
            campaign_id = %execution.campaign_id,
            execution_id = %execution.execution_id,
            accepted,
            "SMS tasks dispatched"
        );
        Ok(accepted)
    }

    fn purge(&self, campaign_id: &CampaignId) -> usize {
        self.queue.purge_campaign(campaign_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IntakeConfig;

    #[test]
    fn test_rejects_voice_queue() {
        let voice = Arc::new(TaskQueue::new(AdmissionClass::Voice, &IntakeConfig::default()));
        assert!(SmsQueueDispatcher::new(voice).is_err());

        let sms = Arc::new(TaskQueue::new(AdmissionClass::Sms, &IntakeConfig::default()));
        assert!(SmsQueueDispatcher::new(sms).is_ok());
    }

    #[test]
    fn test_purge_withdraws_only_that_campaign() {
        let sms = Arc::new(TaskQueue::new(AdmissionClass::Sms, &IntakeConfig::default()));
        let dispatcher = SmsQueueDispatcher::new(sms.clone()).unwrap();
        let now = Utc::now();
        for (task_id, campaign) in [("t1", "a"), ("t2", "a"), ("t3", "b")] {
            sms.enqueue(
                DialTask {
                    task_id: task_id.into(),
                    campaign_id: campaign.into(),
                    contact_id: task_id.into(),
                    phone_number: "+15550100".into(),
                    audio_ref: String::new(),
                    ivr_flow: "sms".into(),
                    metadata: serde_json::Value::Null,
                    submitted_at: now,
                },
                now,
            );
        }

        assert_eq!(dispatcher.purge(&"a".into()), 2);
        assert_eq!(sms.outstanding(&"b".into()), 1);
    }
}
