//! # Resource Pool
//!
//! Admission control for campaign executions. Each admission class (voice,
//! SMS) has an independent quota; hybrid campaigns are accounted as voice.
//!
//! Acquisition never blocks: it answers immediately with either a granted
//! [`SlotLease`] or a denial carrying the current utilization, so backpressure
//! is visible to the caller. Every grant is a lease with a TTL that the owning
//! execution must refresh through [`ResourcePool::heartbeat`]; a lease that
//! lapses is treated as a crashed owner and its slot is reclaimed by the store.
//!
//! ```
//! use std::sync::Arc;
//! use rvoip_campaign_engine::config::ResourceConfig;
//! use rvoip_campaign_engine::resource::{AdmissionOutcome, ResourcePool};
//! use rvoip_campaign_engine::store::MemoryStore;
//! use rvoip_campaign_engine::types::CampaignType;
//!
//! # async fn example() -> rvoip_campaign_engine::Result<()> {
//! let config = ResourceConfig { voice_quota: 1, ..Default::default() };
//! let pool = ResourcePool::new(Arc::new(MemoryStore::new()), config, "instance-1");
//!
//! let now = chrono::Utc::now();
//! match pool.try_acquire(CampaignType::Voice, &"spring-drive".into(), now).await? {
//!     AdmissionOutcome::Granted(lease) => println!("admitted as {}", lease.execution_id),
//!     AdmissionOutcome::Exhausted(util) => println!("busy: {}", util),
//!     AdmissionOutcome::AlreadyHeld { .. } => {}
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ResourceConfig;
use crate::error::Result;
use crate::store::{AcquireResult, CoordinationStore, SlotLease};
use crate::types::{AdmissionClass, CampaignId, CampaignType, ExecutionId};

/// Snapshot of one admission class's budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Utilization {
    pub class: AdmissionClass,
    pub active: u32,
    pub quota: u32,
}

impl fmt::Display for Utilization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {} slots in use", self.active, self.quota, self.class)
    }
}

/// Answer to an admission request
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionOutcome {
    Granted(SlotLease),
    /// Retryable: the class is at quota
    Exhausted(Utilization),
    /// The campaign already owns a slot
    AlreadyHeld { execution_id: ExecutionId },
}

/// Per-type concurrency budget backed by a [`CoordinationStore`]
pub struct ResourcePool {
    store: Arc<dyn CoordinationStore>,
    config: ResourceConfig,
    owner: String,
}

impl ResourcePool {
    pub fn new(store: Arc<dyn CoordinationStore>, config: ResourceConfig, owner: impl Into<String>) -> Self {
        Self {
            store,
            config,
            owner: owner.into(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    pub fn quota(&self, class: AdmissionClass) -> u32 {
        self.config.quota(class)
    }

    /// Try to admit one execution of `campaign_type` for `campaign_id`.
    pub async fn try_acquire(
        &self,
        campaign_type: CampaignType,
        campaign_id: &CampaignId,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome> {
        let class = campaign_type.admission_class();
        let quota = self.quota(class);
        let lease = SlotLease {
            execution_id: ExecutionId::generate(),
            campaign_id: campaign_id.clone(),
            class,
            owner: self.owner.clone(),
            acquired_at: now,
            expires_at: now + self.config.lease_ttl(),
        };

        match self.store.try_acquire(lease.clone(), quota, now).await? {
            AcquireResult::Granted { active } => {
                info!(
                    campaign_id = %campaign_id,
                    execution_id = %lease.execution_id,
                    class = %class,
                    active,
                    quota,
                    "Slot granted"
                );
                Ok(AdmissionOutcome::Granted(lease))
            }
            AcquireResult::Exhausted { active } => {
                // Expected backpressure, not an error
                info!(campaign_id = %campaign_id, class = %class, active, quota, "Slot denied, quota reached");
                Ok(AdmissionOutcome::Exhausted(Utilization { class, active, quota }))
            }
            AcquireResult::CampaignHeld { execution_id } => {
                debug!(campaign_id = %campaign_id, execution_id = %execution_id, "Campaign already holds a slot");
                Ok(AdmissionOutcome::AlreadyHeld { execution_id })
            }
        }
    }

    /// Release a slot. Releasing an already reclaimed slot is not an error.
    pub async fn release(&self, class: AdmissionClass, execution_id: &ExecutionId) -> Result<()> {
        if self.store.release(class, execution_id).await? {
            info!(execution_id = %execution_id, class = %class, "Slot released");
        } else {
            debug!(execution_id = %execution_id, class = %class, "Slot already gone on release");
        }
        Ok(())
    }

    /// Refresh a lease. `false` means the lease lapsed and the slot was reclaimed.
    pub async fn heartbeat(&self, class: AdmissionClass, execution_id: &ExecutionId, now: DateTime<Utc>) -> Result<bool> {
        let alive = self
            .store
            .heartbeat(class, execution_id, now, now + self.config.lease_ttl())
            .await?;
        if !alive {
            warn!(execution_id = %execution_id, class = %class, "Heartbeat found no lease; slot was reclaimed");
        }
        Ok(alive)
    }

    pub async fn utilization(&self, class: AdmissionClass, now: DateTime<Utc>) -> Result<Utilization> {
        let active = self.store.active(class, now).await?.len() as u32;
        Ok(Utilization {
            class,
            active,
            quota: self.quota(class),
        })
    }
}
