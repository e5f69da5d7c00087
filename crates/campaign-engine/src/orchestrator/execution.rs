//! Campaign execution records

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::SlotLease;
use crate::types::{AdmissionClass, CampaignId, CampaignType, ExecutionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

impl ExecutionState {
    /// The execution still owns its resource slot
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            ExecutionState::Starting | ExecutionState::Running | ExecutionState::Paused | ExecutionState::Stopping
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ExecutionState::Stopped | ExecutionState::Failed)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionState::Starting => "starting",
            ExecutionState::Running => "running",
            ExecutionState::Paused => "paused",
            ExecutionState::Stopping => "stopping",
            ExecutionState::Stopped => "stopped",
            ExecutionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One admitted run of a campaign
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignExecution {
    pub execution_id: ExecutionId,
    pub campaign_id: CampaignId,
    pub campaign_type: CampaignType,
    pub class: AdmissionClass,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub tasks_dispatched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Voice tasks of this campaign the queue had already finished when the
    /// execution started
    #[serde(skip)]
    pub intake_baseline: u64,
}

impl CampaignExecution {
    pub fn from_lease(lease: &SlotLease, campaign_type: CampaignType) -> Self {
        Self {
            execution_id: lease.execution_id.clone(),
            campaign_id: lease.campaign_id.clone(),
            campaign_type,
            class: lease.class,
            state: ExecutionState::Starting,
            started_at: lease.acquired_at,
            updated_at: lease.acquired_at,
            ended_at: None,
            tasks_dispatched: 0,
            failure_reason: None,
            intake_baseline: 0,
        }
    }

    pub fn set_state(&mut self, state: ExecutionState, now: DateTime<Utc>) {
        self.state = state;
        self.updated_at = now;
        if state.is_finished() {
            self.ended_at = Some(now);
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.failure_reason = Some(reason.into());
        self.set_state(ExecutionState::Failed, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_ownership_by_state() {
        assert!(ExecutionState::Paused.holds_slot());
        assert!(ExecutionState::Stopping.holds_slot());
        assert!(!ExecutionState::Stopped.holds_slot());
        assert!(!ExecutionState::Failed.holds_slot());
    }

    #[test]
    fn test_finishing_stamps_end_time() {
        let now = Utc::now();
        let lease = SlotLease {
            execution_id: "exec-1".into(),
            campaign_id: "camp".into(),
            class: AdmissionClass::Voice,
            owner: "test".into(),
            acquired_at: now,
            expires_at: now,
        };
        let mut execution = CampaignExecution::from_lease(&lease, CampaignType::Hybrid);
        assert_eq!(execution.state, ExecutionState::Starting);

        execution.set_state(ExecutionState::Running, now);
        assert!(execution.ended_at.is_none());
        assert_eq!(execution.intake_baseline, 0);
        execution.fail("lease lost", now);
        assert_eq!(execution.ended_at, Some(now));
        assert_eq!(execution.failure_reason.as_deref(), Some("lease lost"));
    }
}
