//! Visibility-timeout task queue
//!
//! At-least-once delivery: a leased task stays invisible until it is
//! acknowledged, explicitly released with [`TaskQueue::nack`], or its
//! visibility timeout passes. Each delivery increments the attempt count; a
//! task that reaches the attempt ceiling without an acknowledgement is moved
//! to the dead-letter list instead of becoming visible again.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::LeaseGate;
use crate::config::IntakeConfig;
use crate::error::{CampaignError, Result};
use crate::types::{AdmissionClass, CampaignId, DialTask, TaskId};

/// Handle proving ownership of one delivery of a task
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize)]
pub struct LeaseReceipt(pub String);

impl std::fmt::Display for LeaseReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivery of a task
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub task: DialTask,
    pub receipt: LeaseReceipt,
    /// 1-based delivery count
    pub attempt: u32,
    pub visible_again_at: DateTime<Utc>,
}

/// Why a task left the queue without being acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Visibility timeout passed on the final attempt
    LeaseExpired,
    /// Released for retry on the final attempt
    RetriesExhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub task: DialTask,
    pub attempts: u32,
    pub reason: DeadLetterReason,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Result of releasing a lease for retry
#[derive(Debug, Clone)]
pub enum NackOutcome {
    Redrive { visible_at: DateTime<Utc> },
    DeadLettered(DeadLetter),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

#[derive(Debug)]
struct Entry {
    task: DialTask,
    attempts: u32,
    visible_at: DateTime<Utc>,
    lease: Option<ActiveLease>,
}

#[derive(Debug)]
struct ActiveLease {
    receipt: LeaseReceipt,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<TaskId, Entry>,
    order: VecDeque<TaskId>,
    receipts: HashMap<LeaseReceipt, TaskId>,
    dead_letters: Vec<DeadLetter>,
    /// Acked or dead-lettered task ids, oldest first, bounded
    retired: HashSet<TaskId>,
    retired_order: VecDeque<TaskId>,
    /// Tasks ever accepted per campaign
    accepted: HashMap<CampaignId, u64>,
}

impl QueueState {
    fn remove(&mut self, task_id: &TaskId) -> Option<Entry> {
        let entry = self.entries.remove(task_id)?;
        self.order.retain(|id| id != task_id);
        if let Some(lease) = &entry.lease {
            self.receipts.remove(&lease.receipt);
        }
        Some(entry)
    }

    fn retire(&mut self, task_id: TaskId, capacity: usize) {
        if !self.retired.insert(task_id.clone()) {
            return;
        }
        self.retired_order.push_back(task_id);
        while self.retired_order.len() > capacity {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    fn dead_letter(
        &mut self,
        task_id: &TaskId,
        reason: DeadLetterReason,
        now: DateTime<Utc>,
        capacity: usize,
    ) -> Option<DeadLetter> {
        let entry = self.remove(task_id)?;
        self.retire(task_id.clone(), capacity);
        let letter = DeadLetter {
            task: entry.task,
            attempts: entry.attempts,
            reason,
            dead_lettered_at: now,
        };
        self.dead_letters.push(letter.clone());
        Some(letter)
    }
}

/// In-process task queue for one admission class
pub struct TaskQueue {
    class: AdmissionClass,
    state: Mutex<QueueState>,
    visibility_timeout: chrono::Duration,
    max_attempts: u32,
    retired_capacity: usize,
    redrive: Backoff,
}

impl TaskQueue {
    pub fn new(class: AdmissionClass, config: &IntakeConfig) -> Self {
        Self {
            class,
            state: Mutex::new(QueueState::default()),
            visibility_timeout: config.visibility_timeout(),
            max_attempts: config.max_attempts,
            retired_capacity: config.retired_task_capacity.max(1),
            redrive: Backoff::from_millis(config.redrive_base_ms, config.redrive_max_ms),
        }
    }

    /// Replace the redrive policy (e.g. a jitter-free one in tests)
    pub fn with_redrive(mut self, redrive: Backoff) -> Self {
        self.redrive = redrive;
        self
    }

    pub fn class(&self) -> AdmissionClass {
        self.class
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Enqueue a task. Re-submitting a task id that is still queued, or that
    /// was recently acknowledged or dead-lettered, is a no-op and returns `false`.
    pub fn enqueue(&self, task: DialTask, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        if state.entries.contains_key(&task.task_id) {
            debug!(task_id = %task.task_id, "Task already queued, ignoring duplicate");
            return false;
        }
        if state.retired.contains(&task.task_id) {
            debug!(task_id = %task.task_id, "Task already finished, ignoring redelivery");
            return false;
        }

        let task_id = task.task_id.clone();
        *state.accepted.entry(task.campaign_id.clone()).or_insert(0) += 1;
        state.entries.insert(
            task_id.clone(),
            Entry {
                task,
                attempts: 0,
                visible_at: now,
                lease: None,
            },
        );
        state.order.push_back(task_id);
        true
    }

    /// Lease up to `limit` visible tasks belonging to campaigns open in `gate`, oldest first.
    pub fn lease(&self, now: DateTime<Utc>, limit: usize, gate: &LeaseGate) -> Vec<LeasedTask> {
        let mut state = self.state.lock();
        let QueueState {
            entries,
            order,
            receipts,
            ..
        } = &mut *state;

        let mut leased = Vec::new();
        for task_id in order.iter() {
            if leased.len() >= limit {
                break;
            }
            let Some(entry) = entries.get_mut(task_id) else {
                continue;
            };
            if entry.lease.is_some() || entry.visible_at > now || !gate.is_open(&entry.task.campaign_id) {
                continue;
            }
            if entry.attempts >= self.max_attempts {
                continue;
            }

            entry.attempts += 1;
            let receipt = LeaseReceipt(Uuid::new_v4().to_string());
            let expires_at = now + self.visibility_timeout;
            entry.lease = Some(ActiveLease {
                receipt: receipt.clone(),
                expires_at,
            });
            receipts.insert(receipt.clone(), task_id.clone());

            leased.push(LeasedTask {
                task: entry.task.clone(),
                receipt,
                attempt: entry.attempts,
                visible_again_at: expires_at,
            });
        }

        if !leased.is_empty() {
            debug!(class = %self.class, count = leased.len(), "Leased tasks");
        }
        leased
    }

    /// Acknowledge completion; the task is gone for good.
    pub fn ack(&self, receipt: &LeaseReceipt) -> Result<DialTask> {
        let mut state = self.state.lock();
        let task_id = state
            .receipts
            .get(receipt)
            .cloned()
            .ok_or_else(|| CampaignError::queue(format!("Unknown or stale lease receipt {}", receipt)))?;
        let entry = state
            .remove(&task_id)
            .ok_or_else(|| CampaignError::internal(format!("Receipt {} points at missing task {}", receipt, task_id)))?;
        state.retire(task_id, self.retired_capacity);
        Ok(entry.task)
    }

    /// Release a lease for another delivery after a backoff, or dead-letter it
    /// if this was the final attempt.
    pub fn nack(&self, receipt: &LeaseReceipt, now: DateTime<Utc>) -> Result<NackOutcome> {
        let mut state = self.state.lock();
        let task_id = state
            .receipts
            .remove(receipt)
            .ok_or_else(|| CampaignError::queue(format!("Unknown or stale lease receipt {}", receipt)))?;

        let attempts = match state.entries.get(&task_id) {
            Some(entry) => entry.attempts,
            None => return Err(CampaignError::internal(format!("Receipt {} points at missing task", receipt))),
        };

        if attempts >= self.max_attempts {
            let letter = state
                .dead_letter(&task_id, DeadLetterReason::RetriesExhausted, now, self.retired_capacity)
                .ok_or_else(|| CampaignError::internal("Task vanished while dead-lettering"))?;
            warn!(
                task_id = %task_id,
                campaign_id = %letter.task.campaign_id,
                attempts,
                "Task dead-lettered after final attempt"
            );
            return Ok(NackOutcome::DeadLettered(letter));
        }

        let delay = chrono::Duration::from_std(self.redrive.delay(attempts))
            .unwrap_or_else(|_| chrono::Duration::seconds(1));
        let visible_at = now + delay;
        if let Some(entry) = state.entries.get_mut(&task_id) {
            entry.lease = None;
            entry.visible_at = visible_at;
        }
        debug!(task_id = %task_id, attempts, visible_at = %visible_at, "Task released for redrive");
        Ok(NackOutcome::Redrive { visible_at })
    }

    /// Push a lease's visibility deadline out by one timeout. Returns false for stale receipts.
    pub fn extend(&self, receipt: &LeaseReceipt, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        let Some(task_id) = state.receipts.get(receipt).cloned() else {
            return false;
        };
        match state.entries.get_mut(&task_id).and_then(|e| e.lease.as_mut()) {
            Some(lease) => {
                lease.expires_at = now + self.visibility_timeout;
                true
            }
            None => false,
        }
    }

    /// Return timed-out leases to the queue; final-attempt ones are dead-lettered and returned.
    pub fn expire_leases(&self, now: DateTime<Utc>) -> Vec<DeadLetter> {
        let mut state = self.state.lock();

        let expired: Vec<(TaskId, u32)> = state
            .entries
            .iter()
            .filter(|(_, e)| e.lease.as_ref().map(|l| l.expires_at <= now).unwrap_or(false))
            .map(|(id, e)| (id.clone(), e.attempts))
            .collect();

        let mut letters = Vec::new();
        for (task_id, attempts) in expired {
            if attempts >= self.max_attempts {
                if let Some(letter) = state.dead_letter(&task_id, DeadLetterReason::LeaseExpired, now, self.retired_capacity) {
                    warn!(
                        task_id = %task_id,
                        campaign_id = %letter.task.campaign_id,
                        attempts,
                        "Lease expired on final attempt, task dead-lettered"
                    );
                    letters.push(letter);
                }
                continue;
            }

            let receipt = state
                .entries
                .get_mut(&task_id)
                .and_then(|e| {
                    e.visible_at = now;
                    e.lease.take()
                })
                .map(|l| l.receipt);
            if let Some(receipt) = receipt {
                state.receipts.remove(&receipt);
            }
            info!(task_id = %task_id, attempts, "Lease expired, task visible again");
        }
        letters
    }

    /// Drop every not-yet-leased task of a campaign. In-flight tasks are left
    /// to finish and be acknowledged normally.
    pub fn purge_campaign(&self, campaign_id: &CampaignId) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<TaskId> = state
            .entries
            .iter()
            .filter(|(_, e)| &e.task.campaign_id == campaign_id && e.lease.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in &doomed {
            state.remove(task_id);
        }
        if !doomed.is_empty() {
            info!(campaign_id = %campaign_id, purged = doomed.len(), "Purged pending tasks");
        }
        doomed.len()
    }

    /// Tasks of a campaign not yet acknowledged or dead-lettered
    pub fn outstanding(&self, campaign_id: &CampaignId) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| &e.task.campaign_id == campaign_id)
            .count()
    }

    /// Tasks of a campaign accepted by `enqueue` since this queue was created
    pub fn accepted(&self, campaign_id: &CampaignId) -> u64 {
        self.state.lock().accepted.get(campaign_id).copied().unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let in_flight = state.entries.values().filter(|e| e.lease.is_some()).count();
        QueueStats {
            pending: state.entries.len() - in_flight,
            in_flight,
            dead_lettered: state.dead_letters.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn task(id: &str, campaign: &str, now: DateTime<Utc>) -> DialTask {
        DialTask {
            task_id: id.into(),
            campaign_id: campaign.into(),
            contact_id: format!("contact-{}", id).into(),
            phone_number: "+15550100".to_string(),
            audio_ref: "s3://audio/appeal.wav".to_string(),
            ivr_flow: "donation".to_string(),
            metadata: serde_json::Value::Null,
            submitted_at: now,
        }
    }

    fn queue() -> TaskQueue {
        let config = IntakeConfig {
            visibility_timeout_secs: 60,
            max_attempts: 3,
            redrive_base_ms: 1_000,
            redrive_max_ms: 10_000,
            ..Default::default()
        };
        TaskQueue::new(AdmissionClass::Voice, &config).with_redrive(Backoff::from_millis(1_000, 10_000).without_jitter())
    }

    fn open_gate(campaign: &str) -> LeaseGate {
        let gate = LeaseGate::new();
        gate.open(&campaign.into());
        gate
    }

    #[test]
    fn test_lease_hides_task_until_ack() {
        let q = queue();
        let now = Utc::now();
        let gate = open_gate("c");
        assert!(q.enqueue(task("t1", "c", now), now));
        assert!(!q.enqueue(task("t1", "c", now), now));

        let leased = q.lease(now, 10, &gate);
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].attempt, 1);
        assert!(q.lease(now, 10, &gate).is_empty());

        q.ack(&leased[0].receipt).unwrap();
        assert_eq!(q.outstanding(&"c".into()), 0);
        assert!(q.ack(&leased[0].receipt).is_err());
    }

    #[test]
    fn test_closed_gate_blocks_leasing() {
        let q = queue();
        let now = Utc::now();
        let gate = LeaseGate::new();
        q.enqueue(task("t1", "paused", now), now);

        assert!(q.lease(now, 10, &gate).is_empty());
        gate.open(&"paused".into());
        assert_eq!(q.lease(now, 10, &gate).len(), 1);
    }

    #[test]
    fn test_visibility_timeout_redelivers() {
        let q = queue();
        let now = Utc::now();
        let gate = open_gate("c");
        q.enqueue(task("t1", "c", now), now);

        let first = q.lease(now, 1, &gate).remove(0);
        let later = now + Duration::seconds(61);
        assert!(q.expire_leases(later).is_empty());

        let second = q.lease(later, 1, &gate).remove(0);
        assert_eq!(second.attempt, 2);
        assert_ne!(first.receipt, second.receipt);
        assert!(q.ack(&first.receipt).is_err());
    }

    #[test]
    fn test_extend_prevents_redelivery() {
        let q = queue();
        let now = Utc::now();
        let gate = open_gate("c");
        q.enqueue(task("t1", "c", now), now);

        let leased = q.lease(now, 1, &gate).remove(0);
        assert!(q.extend(&leased.receipt, now + Duration::seconds(50)));
        assert!(q.expire_leases(now + Duration::seconds(70)).is_empty());
        assert!(q.lease(now + Duration::seconds(70), 1, &gate).is_empty());
        assert_eq!(q.stats().in_flight, 1);
    }

    #[test]
    fn test_three_failed_deliveries_dead_letter_and_never_lease_again() {
        let q = queue();
        let mut now = Utc::now();
        let gate = open_gate("c");
        q.enqueue(task("t1", "c", now), now);

        for attempt in 1..=3 {
            let leased = q.lease(now, 1, &gate);
            assert_eq!(leased.len(), 1, "attempt {} should lease", attempt);
            assert_eq!(leased[0].attempt, attempt);

            match q.nack(&leased[0].receipt, now).unwrap() {
                NackOutcome::Redrive { visible_at } => {
                    assert!(attempt < 3);
                    assert!(q.lease(now, 1, &gate).is_empty());
                    now = visible_at;
                }
                NackOutcome::DeadLettered(letter) => {
                    assert_eq!(attempt, 3);
                    assert_eq!(letter.attempts, 3);
                    assert_eq!(letter.reason, DeadLetterReason::RetriesExhausted);
                }
            }
        }

        assert!(q.lease(now + Duration::hours(1), 10, &gate).is_empty());
        assert_eq!(q.stats(), QueueStats { pending: 0, in_flight: 0, dead_lettered: 1 });
    }

    #[test]
    fn test_expiry_on_final_attempt_dead_letters() {
        let q = queue();
        let mut now = Utc::now();
        let gate = open_gate("c");
        q.enqueue(task("t1", "c", now), now);

        for _ in 0..3 {
            assert_eq!(q.lease(now, 1, &gate).len(), 1);
            now = now + Duration::seconds(61);
            let letters = q.expire_leases(now);
            if !letters.is_empty() {
                assert_eq!(letters[0].reason, DeadLetterReason::LeaseExpired);
            }
        }
        assert_eq!(q.dead_letters().len(), 1);
        assert!(q.lease(now, 1, &gate).is_empty());
    }

    #[test]
    fn test_finished_task_ids_are_not_requeued() {
        let q = queue();
        let now = Utc::now();
        let gate = open_gate("c");
        q.enqueue(task("t1", "c", now), now);
        let leased = q.lease(now, 1, &gate).remove(0);
        q.ack(&leased.receipt).unwrap();

        assert!(!q.enqueue(task("t1", "c", now), now + Duration::minutes(5)));
        assert!(q.lease(now + Duration::minutes(5), 1, &gate).is_empty());
        assert_eq!(q.accepted(&"c".into()), 1);
    }

    #[test]
    fn test_retired_ids_are_bounded() {
        let config = IntakeConfig {
            retired_task_capacity: 2,
            ..Default::default()
        };
        let q = TaskQueue::new(AdmissionClass::Voice, &config);
        let now = Utc::now();
        let gate = open_gate("c");
        for id in ["t1", "t2", "t3"] {
            q.enqueue(task(id, "c", now), now);
            let leased = q.lease(now, 1, &gate).remove(0);
            q.ack(&leased.receipt).unwrap();
        }

        // t1 aged out of the retired set, t3 is still remembered
        assert!(q.enqueue(task("t1", "c", now), now));
        assert!(!q.enqueue(task("t3", "c", now), now));
    }

    #[test]
    fn test_purge_leaves_in_flight_tasks() {
        let q = queue();
        let now = Utc::now();
        let gate = open_gate("c");
        q.enqueue(task("t1", "c", now), now);
        q.enqueue(task("t2", "c", now), now);
        q.enqueue(task("t3", "other", now), now);

        let leased = q.lease(now, 1, &gate);
        assert_eq!(q.purge_campaign(&"c".into()), 1);
        assert_eq!(q.outstanding(&"c".into()), 1);
        assert_eq!(q.outstanding(&"other".into()), 1);
        q.ack(&leased[0].receipt).unwrap();
        assert_eq!(q.outstanding(&"c".into()), 0);
    }
}
