//! # Campaign Engine Configuration
//!
//! Configuration for every subsystem of the campaign engine: admission quotas
//! and slot leases, dial-task intake, the call lifecycle engine, the PBX
//! binding, outbound notifications, the HTTP API and the coordination store.
//!
//! Every section has production-ready defaults. Files are loaded with the
//! `config` crate, so any value can be overridden from the environment with
//! a `CAMPAIGN__` prefix and `__` as the section separator:
//!
//! ```text
//! CAMPAIGN__RESOURCES__VOICE_QUOTA=25
//! CAMPAIGN__TELEPHONY__BASE_URL=http://pbx.internal:8088
//! ```
//!
//! ## Example
//!
//! ```
//! use rvoip_campaign_engine::config::CampaignEngineConfig;
//!
//! let mut config = CampaignEngineConfig::default();
//! config.resources.voice_quota = 1;
//! assert!(config.validate().is_ok());
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CampaignError, Result};
use crate::types::{AdmissionClass, CampaignType};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CampaignEngineConfig {
    pub general: GeneralConfig,
    pub resources: ResourceConfig,
    pub intake: IntakeConfig,
    pub calls: CallConfig,
    pub telephony: TelephonyConfig,
    pub notifications: NotificationConfig,
    pub api: ApiConfig,
    pub store: StoreConfig,
    /// Static campaign catalog loaded into the in-memory directory
    pub campaigns: Vec<CampaignDefinition>,
}

/// Instance identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Identifies this orchestrator/worker instance in slot leases and logs
    pub instance_id: String,
}

/// Admission control: per-type quotas and slot lease timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Concurrent voice (and hybrid) executions
    pub voice_quota: u32,

    /// Concurrent SMS executions
    pub sms_quota: u32,

    /// Slot lease TTL; a slot whose owner stops heartbeating is reclaimed after this
    pub lease_ttl_secs: u64,

    /// How often owned executions refresh their slot lease
    pub heartbeat_interval_secs: u64,

    /// How often the orchestrator looks for executions whose work has drained
    pub completion_check_interval_secs: u64,
}

/// Dial-task intake
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Visibility timeout of a task lease
    pub visibility_timeout_secs: u64,

    /// Deliveries before a task is dead-lettered
    pub max_attempts: u32,

    /// Redrive backoff base delay
    pub redrive_base_ms: u64,

    /// Redrive backoff ceiling
    pub redrive_max_ms: u64,

    /// Tasks leased per poll
    pub lease_batch_size: usize,

    /// Poll interval of the engine's lease loop
    pub poll_interval_ms: u64,

    /// Finished task ids remembered so redelivered intake messages are not dialled twice
    pub retired_task_capacity: usize,
}

/// Call lifecycle engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Upper bound on calls tracked by one worker
    pub max_live_calls: usize,

    /// Originating/Ringing calls without an answer after this become NoAnswer
    pub ring_timeout_secs: u64,

    /// Answered/InIvr calls without a decisive digit after this become Timeout
    pub ivr_timeout_secs: u64,

    /// While the adapter is disconnected, calls silent for longer than this are assumed lost
    pub assume_lost_grace_secs: u64,

    /// Recently terminated call ids remembered for duplicate detection
    pub tombstone_capacity: usize,

    /// Interval of the timeout/visibility sweep
    pub sweep_interval_ms: u64,

    /// Capacity of the engine's inbound event channel
    pub event_channel_capacity: usize,
}

/// PBX control binding (ARI-style REST + websocket events)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    /// REST base URL, e.g. `http://127.0.0.1:8088`
    pub base_url: String,

    /// Event websocket URL; derived from `base_url` when empty
    pub events_url: String,

    /// Stasis application name the dialplan hands calls to
    pub app_name: String,

    pub username: String,
    pub password: String,

    /// Endpoint template; `{number}` is replaced with the dialled number
    pub endpoint_template: String,

    pub caller_id: String,

    /// Seconds the PBX lets the far end ring
    pub originate_timeout_secs: u64,

    pub request_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

/// Outbound lifecycle notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Capacity of each in-process topic channel
    pub broadcast_capacity: usize,

    /// Optional webhook per topic name (`call-events`, `donation-events`, ...)
    pub webhooks: HashMap<String, String>,

    pub webhook_timeout_ms: u64,
}

/// HTTP API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
}

/// One `[[campaigns]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub campaign_type: CampaignType,
}

/// Coordination store backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// `memory` or a sqlx SQLite URL such as `sqlite://campaigns.db?mode=rwc`
    pub url: String,

    pub max_connections: u32,
}

impl CampaignEngineConfig {
    /// Load configuration from a TOML file, layered with `CAMPAIGN__*` environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("CAMPAIGN").separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the environment only, on top of defaults
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix("CAMPAIGN").separator("__"))
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML, for `--print-config`
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| CampaignError::configuration(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.instance_id.is_empty() {
            return Err(CampaignError::configuration("instance_id cannot be empty"));
        }

        if self.resources.voice_quota == 0 {
            return Err(CampaignError::configuration("voice_quota must be greater than 0"));
        }

        if self.resources.sms_quota == 0 {
            return Err(CampaignError::configuration("sms_quota must be greater than 0"));
        }

        if self.resources.heartbeat_interval_secs == 0
            || self.resources.heartbeat_interval_secs >= self.resources.lease_ttl_secs
        {
            return Err(CampaignError::configuration(
                "heartbeat_interval_secs must be non-zero and shorter than lease_ttl_secs",
            ));
        }

        if self.intake.max_attempts == 0 {
            return Err(CampaignError::configuration("max_attempts must be greater than 0"));
        }

        if self.intake.visibility_timeout_secs == 0 {
            return Err(CampaignError::configuration("visibility_timeout_secs must be greater than 0"));
        }

        if self.intake.redrive_base_ms > self.intake.redrive_max_ms {
            return Err(CampaignError::configuration("redrive_base_ms cannot exceed redrive_max_ms"));
        }

        if self.intake.lease_batch_size == 0 {
            return Err(CampaignError::configuration("lease_batch_size must be greater than 0"));
        }

        if self.calls.max_live_calls == 0 {
            return Err(CampaignError::configuration("max_live_calls must be greater than 0"));
        }

        if self.calls.ivr_timeout_secs == 0 || self.calls.ring_timeout_secs == 0 {
            return Err(CampaignError::configuration("call timeouts must be greater than 0"));
        }

        if self.calls.event_channel_capacity == 0 {
            return Err(CampaignError::configuration("event_channel_capacity must be greater than 0"));
        }

        if !self.telephony.endpoint_template.contains("{number}") {
            return Err(CampaignError::configuration(
                "endpoint_template must contain a {number} placeholder",
            ));
        }

        if self.api.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(CampaignError::configuration(format!(
                "Invalid bind address: {}",
                self.api.bind_address
            )));
        }

        if let Some(dup) = self
            .campaigns
            .iter()
            .enumerate()
            .find(|(i, c)| self.campaigns[..*i].iter().any(|other| other.id == c.id))
        {
            return Err(CampaignError::configuration(format!(
                "Campaign {} is defined twice",
                dup.1.id
            )));
        }

        Ok(())
    }
}

impl ResourceConfig {
    pub fn quota(&self, class: AdmissionClass) -> u32 {
        match class {
            AdmissionClass::Voice => self.voice_quota,
            AdmissionClass::Sms => self.sms_quota,
        }
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_ttl_secs as i64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl IntakeConfig {
    pub fn visibility_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.visibility_timeout_secs as i64)
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ring_timeout_secs as i64)
    }

    pub fn ivr_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ivr_timeout_secs as i64)
    }

    pub fn assume_lost_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.assume_lost_grace_secs as i64)
    }
}

impl TelephonyConfig {
    /// Websocket URL for the event stream
    pub fn events_url(&self) -> String {
        if !self.events_url.is_empty() {
            return self.events_url.clone();
        }
        let ws_base = self
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!(
            "{}/ari/events?app={}&api_key={}:{}",
            ws_base.trim_end_matches('/'),
            self.app_name,
            self.username,
            self.password
        )
    }

    pub fn endpoint_for(&self, number: &str) -> String {
        self.endpoint_template.replace("{number}", number)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_id: "campaign-engine-1".to_string(),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            voice_quota: 10,
            sms_quota: 10,
            lease_ttl_secs: 60,
            heartbeat_interval_secs: 15,
            completion_check_interval_secs: 5,
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 120,
            max_attempts: 3,
            redrive_base_ms: 2_000,
            redrive_max_ms: 60_000,
            lease_batch_size: 10,
            poll_interval_ms: 250,
            retired_task_capacity: 100_000,
        }
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            max_live_calls: 500,
            ring_timeout_secs: 45,
            ivr_timeout_secs: 30,
            assume_lost_grace_secs: 30,
            tombstone_capacity: 4096,
            sweep_interval_ms: 1_000,
            event_channel_capacity: 10_000,
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8088".to_string(),
            events_url: String::new(),
            app_name: "outbound-campaign".to_string(),
            username: "asterisk".to_string(),
            password: "asterisk".to_string(),
            endpoint_template: "PJSIP/{number}@trunk".to_string(),
            caller_id: "Campaign <1000>".to_string(),
            originate_timeout_secs: 40,
            request_timeout_ms: 5_000,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 1024,
            webhooks: HashMap::new(),
            webhook_timeout_ms: 3_000,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8090".to_string(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "memory".to_string(),
            max_connections: 5,
        }
    }
}
