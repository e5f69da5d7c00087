//! # Task Intake
//!
//! Durable-queue semantics for dial tasks: visibility-timeout leasing,
//! at-least-once delivery, redrive with exponential backoff and a dead-letter
//! path after a fixed number of deliveries.
//!
//! Voice and SMS tasks live in separate [`TaskQueue`] partitions. Which
//! campaigns may be leased from is decided by the [`LeaseGate`], which the
//! orchestrator opens on start/resume and closes on pause/stop.

pub mod backoff;
pub mod message;
pub mod queue;

use dashmap::DashMap;

use crate::types::CampaignId;

pub use backoff::Backoff;
pub use message::{
    ingest_batch, parse_batch, BatchItemFailure, BatchResponse, ParsedBatch, QueueBatch, QueueMessage, TaskMessage,
};
pub use queue::{DeadLetter, DeadLetterReason, LeaseReceipt, LeasedTask, NackOutcome, QueueStats, TaskQueue};

/// Per-campaign switch controlling whether tasks may be leased
#[derive(Debug, Default)]
pub struct LeaseGate {
    campaigns: DashMap<CampaignId, bool>,
}

impl LeaseGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, campaign_id: &CampaignId) {
        self.campaigns.insert(campaign_id.clone(), true);
    }

    pub fn close(&self, campaign_id: &CampaignId) {
        self.campaigns.insert(campaign_id.clone(), false);
    }

    pub fn remove(&self, campaign_id: &CampaignId) {
        self.campaigns.remove(campaign_id);
    }

    /// Unknown campaigns are closed
    pub fn is_open(&self, campaign_id: &CampaignId) -> bool {
        self.campaigns.get(campaign_id).map(|open| *open).unwrap_or(false)
    }
}
