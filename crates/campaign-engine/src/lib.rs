//! # Campaign Engine
//!
//! Outbound call campaign engine for the RVoIP stack. A campaign is a list of
//! contacts to dial, play a recorded prompt to, and collect one DTMF answer
//! from (`1` to request a donation, `9` to opt out).
//!
//! This crate provides:
//! - Per-type admission control with leased, heartbeated resource slots
//! - Durable-style dial task intake with visibility timeouts, redrive and a
//!   dead-letter queue
//! - A single-loop call lifecycle engine driven by a pure transition table
//! - A PBX binding (Asterisk ARI) and an in-process simulator
//! - Campaign start / pause / resume / stop orchestration
//! - Lifecycle notifications over broadcast channels and webhooks
//! - An HTTP API for control, intake batches, dialplan callbacks and health
//!
//! ## Architecture
//!
//! ```text
//!   control ──▶ CampaignOrchestrator ──▶ ResourcePool ──▶ CoordinationStore
//!                    │ dispatch / gate
//!                    ▼
//!   intake ───▶  TaskQueue (voice) ──lease──▶ CallEngine ◀── TelephonyAdapter events
//!                                                │              dialplan callbacks
//!                                                ▼
//!                                       NotificationPublisher
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use rvoip_campaign_engine::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let mut config = CampaignEngineConfig::default();
//! config.resources.voice_quota = 5;
//!
//! let mut server = CampaignServerBuilder::new()
//!     .with_config(config)
//!     .with_simulated_telephony(SimulatedBehavior::Manual)
//!     .build()
//!     .await?;
//! server.start().await?;
//!
//! let response = server
//!     .orchestrator()
//!     .handle(
//!         ControlRequest { campaign_id: "spring-appeal".into(), action: ControlAction::Start },
//!         chrono::Utc::now(),
//!     )
//!     .await;
//! println!("{}", response.message);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod calls;
pub mod config;
pub mod error;
pub mod intake;
pub mod logging;
pub mod notify;
pub mod orchestrator;
pub mod resource;
pub mod server;
pub mod store;
pub mod telephony;
pub mod types;

pub use error::{CampaignError, Result};
pub use config::CampaignEngineConfig;
pub use orchestrator::CampaignOrchestrator;
pub use server::{CampaignServer, CampaignServerBuilder};

/// Commonly used items
pub mod prelude {
    pub use crate::calls::{CallEngine, CallState, EngineHandle, EngineStats};
    pub use crate::config::CampaignEngineConfig;
    pub use crate::error::{CampaignError, Result};
    pub use crate::intake::{LeaseGate, TaskQueue};
    pub use crate::notify::{BroadcastPublisher, Notification, NotificationKind, NotificationPublisher, Topic};
    pub use crate::orchestrator::{
        CampaignDirectory, CampaignOrchestrator, ControlAction, ControlRequest, ControlResponse, InMemoryDirectory,
    };
    pub use crate::resource::{AdmissionOutcome, ResourcePool, Utilization};
    pub use crate::server::{CampaignServer, CampaignServerBuilder};
    pub use crate::store::{CoordinationStore, MemoryStore};
    pub use crate::telephony::simulated::{SimulatedAdapter, SimulatedBehavior};
    pub use crate::telephony::{TelephonyAdapter, TelephonyEvent, TelephonyEventKind};
    pub use crate::types::{AdmissionClass, CallId, CampaignId, CampaignType, DialTask};
}
