//! # Coordination Store
//!
//! The only state shared between orchestrator and worker instances: resource
//! slot leases (one row per admitted campaign execution) and per-campaign
//! failure counters.
//!
//! Every slot acquisition is a single atomic check-and-insert. Expired leases
//! are removed inside the same critical section before counting, so an
//! execution whose owner crashed stops occupying its type's budget as soon as
//! its TTL passes, without a separate reconciliation sweep.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`]: one mutex per admission class; suitable for a single
//!   process and for tests.
//! - [`SqliteStore`]: sqlx over SQLite; a conditional `INSERT … SELECT`
//!   inside one transaction, with `UNIQUE(campaign_id)` guaranteeing a single
//!   execution per campaign across instances.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::types::{AdmissionClass, CampaignId, ExecutionId};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A granted resource slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotLease {
    pub execution_id: ExecutionId,
    pub campaign_id: CampaignId,
    pub class: AdmissionClass,
    /// Instance that owns the execution and heartbeats the lease
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SlotLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of an atomic slot acquisition
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireResult {
    /// Slot inserted; `active` includes it
    Granted { active: u32 },
    /// Quota reached; nothing inserted
    Exhausted { active: u32 },
    /// The campaign already holds a live slot under another execution
    CampaignHeld { execution_id: ExecutionId },
}

/// Shared, cross-instance coordination state
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Atomically insert `lease` if its class holds fewer than `quota` live leases
    /// and the campaign holds none.
    async fn try_acquire(&self, lease: SlotLease, quota: u32, now: DateTime<Utc>) -> Result<AcquireResult>;

    /// Remove a lease. Returns false if it was already gone.
    async fn release(&self, class: AdmissionClass, execution_id: &ExecutionId) -> Result<bool>;

    /// Extend a lease that is still live at `now`. Returns false if it expired,
    /// whether or not it has been reclaimed yet.
    async fn heartbeat(
        &self,
        class: AdmissionClass,
        execution_id: &ExecutionId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Live leases of a class; expired ones are reclaimed first
    async fn active(&self, class: AdmissionClass, now: DateTime<Utc>) -> Result<Vec<SlotLease>>;

    async fn increment_failures(&self, campaign_id: &CampaignId) -> Result<u64>;

    async fn failures(&self, campaign_id: &CampaignId) -> Result<u64>;
}
