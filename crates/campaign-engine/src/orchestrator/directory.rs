//! Campaign directory
//!
//! Campaign definitions and contact lists are owned by an external service.
//! The orchestrator only needs two things from it: what type a campaign is
//! and which dial tasks are waiting when it starts.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::types::{CampaignId, CampaignType, DialTask};

#[async_trait]
pub trait CampaignDirectory: Send + Sync {
    async fn campaign_type(&self, campaign_id: &CampaignId) -> Result<Option<CampaignType>>;

    /// Hand over every task waiting for this campaign. Tasks are handed over once.
    async fn take_pending_tasks(&self, campaign_id: &CampaignId) -> Result<Vec<DialTask>>;
}

#[derive(Debug, Clone)]
struct CampaignEntry {
    campaign_type: CampaignType,
    pending: Vec<DialTask>,
}

/// Directory held in memory, for tests and single-node deployments
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    campaigns: RwLock<HashMap<CampaignId, CampaignEntry>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, campaign_id: impl Into<CampaignId>, campaign_type: CampaignType) {
        self.campaigns.write().insert(
            campaign_id.into(),
            CampaignEntry {
                campaign_type,
                pending: Vec::new(),
            },
        );
    }

    /// Queue tasks for the campaign's next start. Unknown campaigns are ignored.
    pub fn add_tasks(&self, campaign_id: &CampaignId, tasks: impl IntoIterator<Item = DialTask>) -> usize {
        match self.campaigns.write().get_mut(campaign_id) {
            Some(entry) => {
                let before = entry.pending.len();
                entry.pending.extend(tasks);
                entry.pending.len() - before
            }
            None => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.campaigns.read().len()
    }
}

#[async_trait]
impl CampaignDirectory for InMemoryDirectory {
    async fn campaign_type(&self, campaign_id: &CampaignId) -> Result<Option<CampaignType>> {
        Ok(self.campaigns.read().get(campaign_id).map(|e| e.campaign_type))
    }

    async fn take_pending_tasks(&self, campaign_id: &CampaignId) -> Result<Vec<DialTask>> {
        Ok(self
            .campaigns
            .write()
            .get_mut(campaign_id)
            .map(|e| std::mem::take(&mut e.pending))
            .unwrap_or_default())
    }
}
