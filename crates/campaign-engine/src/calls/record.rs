//! Per-call state record, terminated-call tombstones and the opt-out list

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use super::state::CallState;
use crate::intake::{LeaseReceipt, LeasedTask};
use crate::types::{CallId, CampaignId, ContactId, TaskId};

/// One in-flight call. Owned exclusively by the engine loop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub call_id: CallId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub task_id: TaskId,
    pub phone_number: String,
    pub state: CallState,
    pub dtmf_inputs: String,
    pub start_time: DateTime<Utc>,
    pub last_event_time: DateTime<Utc>,
    pub state_entered_at: DateTime<Utc>,
    /// Delivery number of the task behind this call
    pub attempt: u32,
    #[serde(skip)]
    pub receipt: LeaseReceipt,
}

impl Call {
    pub fn from_lease(leased: &LeasedTask, now: DateTime<Utc>) -> Self {
        let task = &leased.task;
        Self {
            call_id: task.call_id(),
            campaign_id: task.campaign_id.clone(),
            contact_id: task.contact_id.clone(),
            task_id: task.task_id.clone(),
            phone_number: task.phone_number.clone(),
            state: CallState::Queued,
            dtmf_inputs: String::new(),
            start_time: now,
            last_event_time: now,
            state_entered_at: now,
            attempt: leased.attempt,
            receipt: leased.receipt.clone(),
        }
    }

    pub fn enter(&mut self, state: CallState, now: DateTime<Utc>) {
        if self.state != state {
            self.state = state;
            self.state_entered_at = now;
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_event_time {
            self.last_event_time = at;
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_event_time
    }
}

/// Bounded memory of recently terminated calls.
///
/// Terminal events routinely arrive more than once (hangup request, then
/// channel destroyed). Once a call id is in here every further event for it
/// is a known duplicate rather than an unknown call.
#[derive(Debug)]
pub struct Tombstones {
    capacity: usize,
    set: HashSet<CallId>,
    order: VecDeque<CallId>,
}

impl Tombstones {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn insert(&mut self, call_id: CallId) {
        if !self.set.insert(call_id.clone()) {
            return;
        }
        self.order.push_back(call_id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.set.contains(call_id)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }
}

/// Numbers that opted out. Never dialled again.
#[derive(Debug, Default)]
pub struct SuppressionList {
    numbers: DashMap<String, DateTime<Utc>>,
}

impl SuppressionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digits only, keeping a leading `+`
    pub fn normalize(number: &str) -> String {
        let trimmed = number.trim();
        let mut normalized: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
        if trimmed.starts_with('+') {
            normalized.insert(0, '+');
        }
        normalized
    }

    pub fn suppress(&self, number: &str, at: DateTime<Utc>) -> bool {
        self.numbers.insert(Self::normalize(number), at).is_none()
    }

    pub fn is_suppressed(&self, number: &str) -> bool {
        self.numbers.contains_key(&Self::normalize(number))
    }

    pub fn len(&self) -> usize {
        self.numbers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tombstones_evict_oldest() {
        let mut tombstones = Tombstones::new(2);
        tombstones.insert("a".into());
        tombstones.insert("b".into());
        tombstones.insert("a".into());
        tombstones.insert("c".into());

        assert!(!tombstones.contains(&"a".into()));
        assert!(tombstones.contains(&"b".into()));
        assert!(tombstones.contains(&"c".into()));
        assert_eq!(tombstones.len(), 2);
    }

    #[test]
    fn test_suppression_ignores_formatting() {
        let list = SuppressionList::new();
        assert!(list.suppress("+1 (555) 010-0100", Utc::now()));
        assert!(list.is_suppressed("+15550100100"));
        assert!(!list.is_suppressed("15550100100"));
        assert!(!list.suppress("+1-555-010-0100", Utc::now()));
        assert_eq!(list.len(), 1);
    }
}
