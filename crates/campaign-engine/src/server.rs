//! # Campaign Server
//!
//! Wires every subsystem into one running service:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                   CampaignServer                     │
//! ├──────────────────────────────────────────────────────┤
//! │  HTTP API (control, intake batches, dialplan, health)│
//! ├───────────────────────────┬──────────────────────────┤
//! │   CampaignOrchestrator    │       CallEngine loop    │
//! │  heartbeat + completion   │  lease → originate → IVR │
//! ├───────────────────────────┴──────────────────────────┤
//! │ ResourcePool │ TaskQueues │ Notifications │ Telephony │
//! ├──────────────────────────────────────────────────────┤
//! │        CoordinationStore (memory or SQLite)          │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ```no_run
//! use rvoip_campaign_engine::config::CampaignEngineConfig;
//! use rvoip_campaign_engine::server::CampaignServerBuilder;
//! use rvoip_campaign_engine::telephony::simulated::SimulatedBehavior;
//!
//! # async fn example() -> rvoip_campaign_engine::Result<()> {
//! let mut server = CampaignServerBuilder::new()
//!     .with_config(CampaignEngineConfig::default())
//!     .with_simulated_telephony(SimulatedBehavior::Manual)
//!     .build()
//!     .await?;
//!
//! server.start().await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

use crate::api::{create_router, AppState};
use crate::calls::{CallEngine, EngineHandle, SuppressionList};
use crate::config::CampaignEngineConfig;
use crate::error::{CampaignError, Result};
use crate::intake::{LeaseGate, TaskQueue};
use crate::logging::component_span;
use crate::notify::{BroadcastPublisher, FanoutPublisher, NotificationPublisher, WebhookPublisher};
use crate::orchestrator::{CampaignDirectory, CampaignOrchestrator, InMemoryDirectory, SmsQueueDispatcher};
use crate::resource::ResourcePool;
use crate::store::{CoordinationStore, MemoryStore, SqliteStore};
use crate::telephony::simulated::{SimulatedAdapter, SimulatedBehavior};
use crate::telephony::{AriAdapter, TelephonyAdapter, TelephonyInput};
use crate::types::AdmissionClass;

/// Engine built but not yet running
struct PendingEngine {
    engine: CallEngine,
    events_rx: mpsc::Receiver<TelephonyInput>,
}

pub struct CampaignServer {
    config: CampaignEngineConfig,
    pool: Arc<ResourcePool>,
    voice_queue: Arc<TaskQueue>,
    sms_queue: Arc<TaskQueue>,
    broadcast: Arc<BroadcastPublisher>,
    suppression: Arc<SuppressionList>,
    orchestrator: CampaignOrchestrator,
    events_tx: mpsc::Sender<TelephonyInput>,
    ari: Option<Arc<AriAdapter>>,
    simulated: Option<Arc<SimulatedAdapter>>,
    pending: Option<PendingEngine>,
    engine: Option<EngineHandle>,
    engine_handle: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl CampaignServer {
    async fn new(
        config: CampaignEngineConfig,
        directory: Option<Arc<dyn CampaignDirectory>>,
        simulate: Option<SimulatedBehavior>,
    ) -> Result<Self> {
        config.validate()?;
        info!(instance_id = %config.general.instance_id, "🚀 Building campaign engine");

        let store: Arc<dyn CoordinationStore> = if config.store.url == "memory" {
            Arc::new(MemoryStore::new())
        } else {
            Arc::new(SqliteStore::connect(&config.store.url, config.store.max_connections).await?)
        };
        let pool = Arc::new(ResourcePool::new(
            store.clone(),
            config.resources.clone(),
            config.general.instance_id.clone(),
        ));

        let voice_queue = Arc::new(TaskQueue::new(AdmissionClass::Voice, &config.intake));
        let sms_queue = Arc::new(TaskQueue::new(AdmissionClass::Sms, &config.intake));
        let gate = Arc::new(LeaseGate::new());

        let broadcast = Arc::new(BroadcastPublisher::new(config.notifications.broadcast_capacity));
        let webhooks = WebhookPublisher::new(&config.notifications)?;
        let publisher: Arc<dyn NotificationPublisher> = if webhooks.is_empty() {
            broadcast.clone()
        } else {
            let sinks: Vec<Arc<dyn NotificationPublisher>> = vec![broadcast.clone(), Arc::new(webhooks)];
            Arc::new(FanoutPublisher::new(sinks))
        };

        let (events_tx, events_rx) = mpsc::channel(config.calls.event_channel_capacity);
        let (adapter, ari, simulated) = match simulate {
            Some(behavior) => {
                info!(?behavior, "Using simulated telephony");
                let sim = Arc::new(SimulatedAdapter::new(events_tx.clone()).with_behavior(behavior));
                (sim.clone() as Arc<dyn TelephonyAdapter>, None, Some(sim))
            }
            None => {
                info!(base_url = %config.telephony.base_url, "Using ARI telephony");
                let ari = Arc::new(AriAdapter::new(config.telephony.clone())?);
                (ari.clone() as Arc<dyn TelephonyAdapter>, Some(ari), None)
            }
        };

        let suppression = Arc::new(SuppressionList::new());
        let engine = CallEngine::new(
            config.calls.clone(),
            &config.intake,
            voice_queue.clone(),
            gate.clone(),
            adapter,
            publisher.clone(),
            store,
        )
        .with_suppression(suppression.clone());

        let directory = match directory {
            Some(directory) => directory,
            None => {
                let catalog = InMemoryDirectory::new();
                for campaign in &config.campaigns {
                    catalog.register(campaign.id.as_str(), campaign.campaign_type);
                }
                info!(campaigns = catalog.len(), "Loaded campaign catalog");
                Arc::new(catalog)
            }
        };

        let orchestrator = CampaignOrchestrator::new(
            pool.clone(),
            directory,
            voice_queue.clone(),
            gate,
            Arc::new(SmsQueueDispatcher::new(sms_queue.clone())?),
            publisher,
        );

        Ok(Self {
            config,
            pool,
            voice_queue,
            sms_queue,
            broadcast,
            suppression,
            orchestrator,
            events_tx,
            ari,
            simulated,
            pending: Some(PendingEngine { engine, events_rx }),
            engine: None,
            engine_handle: None,
            background: Vec::new(),
            local_addr: None,
        })
    }

    /// Start the engine loop, PBX event stream, lease heartbeats, completion checks and the API
    pub async fn start(&mut self) -> Result<()> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| CampaignError::orchestration("Server already started"))?;

        let instance_id = self.config.general.instance_id.clone();
        let (engine, join) = {
            let _span = component_span(&instance_id, "engine").entered();
            pending.engine.spawn(pending.events_rx, self.events_tx.clone())
        };
        self.orchestrator = self.orchestrator.clone().with_engine(engine.clone());
        self.engine = Some(engine.clone());
        self.engine_handle = Some(join);
        info!("✅ Call engine started");

        if let Some(ari) = &self.ari {
            let _span = component_span(&instance_id, "ari").entered();
            self.background.push(ari.spawn_event_stream(self.events_tx.clone()));
            info!(base_url = %self.config.telephony.base_url, "✅ ARI event stream started");
        }

        let orchestrator = self.orchestrator.clone();
        let every = self.config.resources.heartbeat_interval();
        self.background.push(tokio::spawn(
            Self::heartbeat_loop(orchestrator, every).instrument(component_span(&instance_id, "heartbeat")),
        ));

        let orchestrator = self.orchestrator.clone();
        let every = Duration::from_secs(self.config.resources.completion_check_interval_secs.max(1));
        self.background.push(tokio::spawn(
            Self::completion_loop(orchestrator, every).instrument(component_span(&instance_id, "completion")),
        ));

        let listener = tokio::net::TcpListener::bind(&self.config.api.bind_address).await?;
        let local_addr = listener.local_addr()?;
        let router = self.router();
        self.background.push(tokio::spawn(
            async move {
                if let Err(e) = axum::serve(listener, router).await {
                    error!(error = %e, "API server terminated");
                }
            }
            .instrument(component_span(&instance_id, "api")),
        ));
        self.local_addr = Some(local_addr);
        info!(address = %local_addr, "✅ API listening");

        Ok(())
    }

    /// Stop background tasks and the engine loop
    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping campaign engine...");

        for handle in self.background.drain(..) {
            handle.abort();
            let _ = handle.await;
        }

        if let Some(engine) = self.engine.take() {
            if let Err(e) = engine.shutdown().await {
                debug!(error = %e, "Engine already stopped");
            }
        }
        if let Some(handle) = self.engine_handle.take() {
            let _ = handle.await;
        }

        info!("✅ Campaign engine stopped");
        Ok(())
    }

    /// Run until Ctrl-C, logging a status line every minute, then stop
    pub async fn run(&mut self) -> Result<()> {
        info!("📞 Campaign engine is running");
        let mut status = interval(Duration::from_secs(60));
        status.tick().await;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = status.tick() => self.log_status().await,
            }
        }
        self.stop().await
    }

    async fn log_status(&self) {
        let stats = self.engine.as_ref().map(|e| e.stats()).unwrap_or_default();
        let now = Utc::now();
        for class in AdmissionClass::ALL {
            match self.pool.utilization(class, now).await {
                Ok(util) => info!(class = %class, active = util.active, quota = util.quota, "📊 Slots"),
                Err(e) => warn!(class = %class, error = %e, "Could not read utilization"),
            }
        }
        let queue = self.voice_queue.stats();
        info!(
            live_calls = stats.live_calls,
            adapter_connected = stats.adapter_connected,
            originated = stats.originated,
            completed = stats.completed,
            pending = queue.pending,
            in_flight = queue.in_flight,
            dead_lettered = queue.dead_lettered,
            "📊 Engine status"
        );
    }

    async fn heartbeat_loop(orchestrator: CampaignOrchestrator, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let lost = orchestrator.heartbeat(Utc::now()).await;
            if lost > 0 {
                warn!(lost, "Executions lost their slot lease");
            }
        }
    }

    async fn completion_loop(orchestrator: CampaignOrchestrator, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            orchestrator.check_completions(Utc::now()).await;
        }
    }

    /// API router over this server's state
    pub fn router(&self) -> Router {
        create_router(AppState::new(
            self.orchestrator.clone(),
            self.voice_queue.clone(),
            self.sms_queue.clone(),
            self.engine.clone(),
        ))
    }

    pub fn config(&self) -> &CampaignEngineConfig {
        &self.config
    }

    pub fn orchestrator(&self) -> &CampaignOrchestrator {
        &self.orchestrator
    }

    pub fn engine(&self) -> Option<&EngineHandle> {
        self.engine.as_ref()
    }

    pub fn voice_queue(&self) -> &Arc<TaskQueue> {
        &self.voice_queue
    }

    /// SMS partition, drained by the messaging gateway
    pub fn sms_queue(&self) -> &Arc<TaskQueue> {
        &self.sms_queue
    }

    pub fn notifications(&self) -> &Arc<BroadcastPublisher> {
        &self.broadcast
    }

    pub fn suppression(&self) -> &Arc<SuppressionList> {
        &self.suppression
    }

    pub fn simulated_adapter(&self) -> Option<&Arc<SimulatedAdapter>> {
        self.simulated.as_ref()
    }

    /// Bound API address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

/// Builder for [`CampaignServer`]
pub struct CampaignServerBuilder {
    config: Option<CampaignEngineConfig>,
    directory: Option<Arc<dyn CampaignDirectory>>,
    simulate: Option<SimulatedBehavior>,
}

impl CampaignServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            directory: None,
            simulate: None,
        }
    }

    pub fn with_config(mut self, config: CampaignEngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an external campaign directory instead of the configured catalog
    pub fn with_directory(mut self, directory: Arc<dyn CampaignDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Replace the ARI binding with the in-process simulator
    pub fn with_simulated_telephony(mut self, behavior: SimulatedBehavior) -> Self {
        self.simulate = Some(behavior);
        self
    }

    pub async fn build(self) -> Result<CampaignServer> {
        let config = self
            .config
            .ok_or_else(|| CampaignError::configuration("Configuration not provided"))?;
        CampaignServer::new(config, self.directory, self.simulate).await
    }
}

impl Default for CampaignServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CampaignDefinition;
    use crate::types::CampaignType;

    fn config() -> CampaignEngineConfig {
        let mut config = CampaignEngineConfig::default();
        config.api.bind_address = "127.0.0.1:0".to_string();
        config.campaigns = vec![CampaignDefinition {
            id: "spring-appeal".to_string(),
            campaign_type: CampaignType::Voice,
        }];
        config
    }

    #[tokio::test]
    async fn test_builder_requires_config() {
        assert!(matches!(
            CampaignServerBuilder::new().build().await,
            Err(CampaignError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop_with_simulated_telephony() {
        let mut server = CampaignServerBuilder::new()
            .with_config(config())
            .with_simulated_telephony(SimulatedBehavior::Manual)
            .build()
            .await
            .unwrap();
        assert!(server.engine().is_none());

        server.start().await.unwrap();
        assert!(server.local_addr().is_some());
        assert!(server.engine().is_some());
        assert!(server.start().await.is_err());

        let response = server.orchestrator().start(&"spring-appeal".into(), Utc::now()).await;
        assert!(response.success, "{}", response.message);

        server.stop().await.unwrap();
        assert!(server.engine().is_none());
    }
}
