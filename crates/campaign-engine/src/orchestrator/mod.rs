//! # Campaign Orchestrator
//!
//! Top-level control of campaign executions. A control request names a
//! campaign and one of four actions:
//!
//! | Action   | Effect                                                                  |
//! |----------|-------------------------------------------------------------------------|
//! | `start`  | admit against the type's quota, dispatch tasks, enter `Running`         |
//! | `pause`  | stop leasing the campaign's tasks; the slot is kept                     |
//! | `resume` | allow leasing again                                                     |
//! | `stop`   | stop leasing, purge pending tasks, hang up live calls, release the slot |
//!
//! Start denials caused by a full quota come back as retryable rejections
//! carrying the current utilization. Voice (and hybrid) campaigns dispatch
//! onto the voice task queue consumed by the call engine; SMS campaigns go
//! to an [`SmsDispatcher`] on a background task.
//!
//! ```text
//!            start (granted)
//!   ──────────────▶ Starting ──dispatched──▶ Running ◀──resume── Paused
//!                      │                      │   └────pause──────▶ │
//!                      │ dispatch failed      │ stop / completed    │ stop
//!                      ▼                      ▼                     ▼
//!                    Failed                Stopping ──────────▶ Stopped
//! ```

pub mod core;
pub mod directory;
pub mod dispatch;
pub mod execution;

use serde::{Deserialize, Serialize};

use crate::types::{CampaignId, CampaignType, ExecutionId};

pub use self::core::CampaignOrchestrator;
pub use directory::{CampaignDirectory, InMemoryDirectory};
pub use dispatch::{SmsDispatcher, SmsQueueDispatcher};
pub use execution::{CampaignExecution, ExecutionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Start,
    Pause,
    Resume,
    Stop,
}

impl std::fmt::Display for ControlAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlAction::Start => "start",
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
            ControlAction::Stop => "stop",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    pub campaign_id: CampaignId,
    pub action: ControlAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub campaign_id: CampaignId,
    pub campaign_type: Option<CampaignType>,
    pub action: ControlAction,
    pub success: bool,
    pub message: String,
    /// Set on rejections that may succeed if retried later
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<ExecutionId>,
}

impl ControlResponse {
    pub fn accepted(
        campaign_id: &CampaignId,
        campaign_type: Option<CampaignType>,
        action: ControlAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            campaign_id: campaign_id.clone(),
            campaign_type,
            action,
            success: true,
            message: message.into(),
            retryable: false,
            execution_id: None,
        }
    }

    pub fn rejected(
        campaign_id: &CampaignId,
        campaign_type: Option<CampaignType>,
        action: ControlAction,
        message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            ..Self::accepted(campaign_id, campaign_type, action, message)
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_execution(mut self, execution_id: &ExecutionId) -> Self {
        self.execution_id = Some(execution_id.clone());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_wire_format() {
        let request: ControlRequest =
            serde_json::from_str(r#"{"campaignId":"spring-appeal","action":"pause"}"#).unwrap();
        assert_eq!(request.action, ControlAction::Pause);

        let response = ControlResponse::rejected(
            &request.campaign_id,
            Some(CampaignType::Voice),
            ControlAction::Start,
            "Resource exhausted: 1/1 voice slots in use",
        )
        .retryable();
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["campaignId"], "spring-appeal");
        assert_eq!(value["campaignType"], "voice");
        assert_eq!(value["action"], "start");
        assert_eq!(value["success"], false);
        assert_eq!(value["retryable"], true);
        assert!(value.get("executionId").is_none());
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        assert!(serde_json::from_str::<ControlRequest>(r#"{"campaignId":"c","action":"restart"}"#).is_err());
    }
}
