//! In-process coordination store

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{AcquireResult, CoordinationStore, SlotLease};
use crate::error::Result;
use crate::types::{AdmissionClass, CampaignId, ExecutionId};

/// Coordination store held in memory
///
/// Each admission class has its own mutex, so voice and SMS admissions never
/// contend with or observe each other.
pub struct MemoryStore {
    voice: Mutex<HashMap<ExecutionId, SlotLease>>,
    sms: Mutex<HashMap<ExecutionId, SlotLease>>,
    failures: DashMap<CampaignId, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            voice: Mutex::new(HashMap::new()),
            sms: Mutex::new(HashMap::new()),
            failures: DashMap::new(),
        }
    }

    fn slots(&self, class: AdmissionClass) -> &Mutex<HashMap<ExecutionId, SlotLease>> {
        match class {
            AdmissionClass::Voice => &self.voice,
            AdmissionClass::Sms => &self.sms,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn reclaim_expired(slots: &mut HashMap<ExecutionId, SlotLease>, now: DateTime<Utc>) {
    slots.retain(|execution_id, lease| {
        if lease.is_expired(now) {
            debug!(
                execution_id = %execution_id,
                campaign_id = %lease.campaign_id,
                owner = %lease.owner,
                "Reclaiming expired slot lease"
            );
            false
        } else {
            true
        }
    });
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn try_acquire(&self, lease: SlotLease, quota: u32, now: DateTime<Utc>) -> Result<AcquireResult> {
        let mut slots = self.slots(lease.class).lock();
        reclaim_expired(&mut slots, now);

        if let Some(held) = slots.values().find(|l| l.campaign_id == lease.campaign_id) {
            return Ok(AcquireResult::CampaignHeld {
                execution_id: held.execution_id.clone(),
            });
        }

        let active = slots.len() as u32;
        if active >= quota {
            return Ok(AcquireResult::Exhausted { active });
        }

        slots.insert(lease.execution_id.clone(), lease);
        Ok(AcquireResult::Granted { active: active + 1 })
    }

    async fn release(&self, class: AdmissionClass, execution_id: &ExecutionId) -> Result<bool> {
        Ok(self.slots(class).lock().remove(execution_id).is_some())
    }

    async fn heartbeat(
        &self,
        class: AdmissionClass,
        execution_id: &ExecutionId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut slots = self.slots(class).lock();
        reclaim_expired(&mut slots, now);
        match slots.get_mut(execution_id) {
            Some(lease) => {
                lease.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active(&self, class: AdmissionClass, now: DateTime<Utc>) -> Result<Vec<SlotLease>> {
        let mut slots = self.slots(class).lock();
        reclaim_expired(&mut slots, now);
        Ok(slots.values().cloned().collect())
    }

    async fn increment_failures(&self, campaign_id: &CampaignId) -> Result<u64> {
        let mut entry = self.failures.entry(campaign_id.clone()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn failures(&self, campaign_id: &CampaignId) -> Result<u64> {
        Ok(self.failures.get(campaign_id).map(|v| *v).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lease(execution: &str, campaign: &str, class: AdmissionClass, now: DateTime<Utc>) -> SlotLease {
        SlotLease {
            execution_id: execution.into(),
            campaign_id: campaign.into(),
            class,
            owner: "test".to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(30),
        }
    }

    #[tokio::test]
    async fn test_quota_is_enforced_per_class() {
        let store = MemoryStore::new();
        let now = Utc::now();

        let first = store.try_acquire(lease("e1", "a", AdmissionClass::Voice, now), 1, now).await.unwrap();
        assert_eq!(first, AcquireResult::Granted { active: 1 });

        let second = store.try_acquire(lease("e2", "b", AdmissionClass::Voice, now), 1, now).await.unwrap();
        assert_eq!(second, AcquireResult::Exhausted { active: 1 });

        // SMS budget is untouched by the full voice partition
        let sms = store.try_acquire(lease("e3", "c", AdmissionClass::Sms, now), 1, now).await.unwrap();
        assert_eq!(sms, AcquireResult::Granted { active: 1 });
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_on_acquire() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.try_acquire(lease("e1", "a", AdmissionClass::Voice, now), 1, now).await.unwrap();

        let later = now + Duration::seconds(31);
        let result = store.try_acquire(lease("e2", "b", AdmissionClass::Voice, later), 1, later).await.unwrap();
        assert_eq!(result, AcquireResult::Granted { active: 1 });
        let extended = later + Duration::seconds(30);
        assert!(!store.heartbeat(AdmissionClass::Voice, &"e1".into(), later, extended).await.unwrap());
    }

    #[tokio::test]
    async fn test_heartbeat_does_not_revive_lapsed_lease() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.try_acquire(lease("e1", "a", AdmissionClass::Sms, now), 1, now).await.unwrap();

        // expired but nobody has reclaimed it yet
        let late = now + Duration::seconds(45);
        let revived = store
            .heartbeat(AdmissionClass::Sms, &"e1".into(), late, late + Duration::seconds(30))
            .await
            .unwrap();
        assert!(!revived);
        assert!(store.active(AdmissionClass::Sms, late).await.unwrap().is_empty());

        let fresh = store.try_acquire(lease("e2", "b", AdmissionClass::Sms, late), 1, late).await.unwrap();
        assert_eq!(fresh, AcquireResult::Granted { active: 1 });
    }

    #[tokio::test]
    async fn test_same_campaign_cannot_hold_two_slots() {
        let store = MemoryStore::new();
        let now = Utc::now();

        store.try_acquire(lease("e1", "a", AdmissionClass::Voice, now), 5, now).await.unwrap();
        let dup = store.try_acquire(lease("e2", "a", AdmissionClass::Voice, now), 5, now).await.unwrap();
        assert_eq!(dup, AcquireResult::CampaignHeld { execution_id: "e1".into() });
    }

    #[tokio::test]
    async fn test_failure_counter() {
        let store = MemoryStore::new();
        let campaign: CampaignId = "a".into();
        assert_eq!(store.failures(&campaign).await.unwrap(), 0);
        store.increment_failures(&campaign).await.unwrap();
        assert_eq!(store.increment_failures(&campaign).await.unwrap(), 2);
    }
}
