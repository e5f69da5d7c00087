//! Campaign orchestrator core

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use super::directory::CampaignDirectory;
use super::dispatch::SmsDispatcher;
use super::execution::{CampaignExecution, ExecutionState};
use super::{ControlAction, ControlRequest, ControlResponse};
use crate::calls::EngineHandle;
use crate::error::{CampaignError, Result};
use crate::intake::{LeaseGate, TaskQueue};
use crate::notify::{Notification, NotificationKind, NotificationPublisher};
use crate::resource::{AdmissionOutcome, ResourcePool, Utilization};
use crate::types::{AdmissionClass, CampaignId, CampaignType, ExecutionId};

/// Starts, pauses, resumes and stops campaign executions.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct CampaignOrchestrator {
    pool: Arc<ResourcePool>,
    directory: Arc<dyn CampaignDirectory>,
    voice_queue: Arc<TaskQueue>,
    gate: Arc<LeaseGate>,
    sms: Arc<dyn SmsDispatcher>,
    publisher: Arc<dyn NotificationPublisher>,
    engine: Option<EngineHandle>,
    executions: Arc<DashMap<CampaignId, CampaignExecution>>,
}

impl CampaignOrchestrator {
    pub fn new(
        pool: Arc<ResourcePool>,
        directory: Arc<dyn CampaignDirectory>,
        voice_queue: Arc<TaskQueue>,
        gate: Arc<LeaseGate>,
        sms: Arc<dyn SmsDispatcher>,
        publisher: Arc<dyn NotificationPublisher>,
    ) -> Self {
        Self {
            pool,
            directory,
            voice_queue,
            gate,
            sms,
            publisher,
            engine: None,
            executions: Arc::new(DashMap::new()),
        }
    }

    /// Route per-campaign hangups on stop through a running call engine
    pub fn with_engine(mut self, engine: EngineHandle) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn directory(&self) -> &Arc<dyn CampaignDirectory> {
        &self.directory
    }

    pub fn pool(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    pub fn execution(&self, campaign_id: &CampaignId) -> Option<CampaignExecution> {
        self.executions.get(campaign_id).map(|e| e.clone())
    }

    pub fn executions(&self) -> Vec<CampaignExecution> {
        self.executions.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn utilization(&self, class: AdmissionClass, now: DateTime<Utc>) -> Result<Utilization> {
        self.pool.utilization(class, now).await
    }

    pub async fn handle(&self, request: ControlRequest, now: DateTime<Utc>) -> ControlResponse {
        debug!(campaign_id = %request.campaign_id, action = %request.action, "Campaign control request");
        match request.action {
            ControlAction::Start => self.start(&request.campaign_id, now).await,
            ControlAction::Pause => self.pause(&request.campaign_id, now),
            ControlAction::Resume => self.resume(&request.campaign_id, now),
            ControlAction::Stop => self.stop(&request.campaign_id, now).await,
        }
    }

    pub async fn start(&self, campaign_id: &CampaignId, now: DateTime<Utc>) -> ControlResponse {
        let action = ControlAction::Start;
        let campaign_type = match self.directory.campaign_type(campaign_id).await {
            Ok(Some(campaign_type)) => campaign_type,
            Ok(None) => return ControlResponse::rejected(campaign_id, None, action, "Unknown campaign"),
            Err(e) => {
                error!(campaign_id = %campaign_id, error = %e, "Campaign lookup failed");
                return ControlResponse::rejected(campaign_id, None, action, format!("Campaign lookup failed: {}", e))
                    .retryable();
            }
        };
        let kind = Some(campaign_type);

        if let Some(existing) = self.execution(campaign_id) {
            match existing.state {
                ExecutionState::Starting | ExecutionState::Running => {
                    return ControlResponse::accepted(campaign_id, kind, action, "Campaign already running")
                        .with_execution(&existing.execution_id);
                }
                ExecutionState::Paused => {
                    return ControlResponse::rejected(campaign_id, kind, action, "Campaign is paused; use resume")
                        .with_execution(&existing.execution_id);
                }
                ExecutionState::Stopping => {
                    return ControlResponse::rejected(campaign_id, kind, action, "Campaign is stopping").retryable();
                }
                ExecutionState::Stopped | ExecutionState::Failed => {}
            }
        }

        let lease = match self.pool.try_acquire(campaign_type, campaign_id, now).await {
            Ok(AdmissionOutcome::Granted(lease)) => lease,
            Ok(AdmissionOutcome::Exhausted(utilization)) => {
                return ControlResponse::rejected(
                    campaign_id,
                    kind,
                    action,
                    format!("Resource exhausted: {}", utilization),
                )
                .retryable();
            }
            Ok(AdmissionOutcome::AlreadyHeld { execution_id }) => {
                return ControlResponse::rejected(
                    campaign_id,
                    kind,
                    action,
                    format!("Campaign already holds execution {}", execution_id),
                )
                .with_execution(&execution_id);
            }
            Err(e) => {
                error!(campaign_id = %campaign_id, error = %e, "Admission check failed");
                return ControlResponse::rejected(campaign_id, kind, action, format!("Admission failed: {}", e))
                    .retryable();
            }
        };

        let mut execution = CampaignExecution::from_lease(&lease, campaign_type);
        if execution.class == AdmissionClass::Voice {
            let outstanding = self.voice_queue.outstanding(campaign_id) as u64;
            execution.intake_baseline = self.voice_queue.accepted(campaign_id).saturating_sub(outstanding);
        }
        let execution_id = execution.execution_id.clone();
        self.executions.insert(campaign_id.clone(), execution.clone());

        let dispatched = match execution.class {
            AdmissionClass::Voice => self.start_voice(&execution, now).await,
            AdmissionClass::Sms => self.start_sms(&execution, now).await,
        };

        match dispatched {
            Ok(count) => {
                if let Some(mut entry) = self.executions.get_mut(campaign_id) {
                    if entry.execution_id == execution_id {
                        entry.tasks_dispatched = count;
                        if entry.state == ExecutionState::Starting {
                            entry.set_state(ExecutionState::Running, now);
                        }
                    }
                }
                info!(
                    campaign_id = %campaign_id,
                    execution_id = %execution_id,
                    campaign_type = %campaign_type,
                    tasks = count,
                    "🚀 Campaign started"
                );
                ControlResponse::accepted(
                    campaign_id,
                    kind,
                    action,
                    format!("Campaign started with {} tasks", count),
                )
                .with_execution(&execution_id)
            }
            Err(e) => {
                let reason = format!("Dispatch failed: {}", e);
                self.finish_execution(campaign_id, &execution_id, Err(reason.clone()), now).await;
                ControlResponse::rejected(campaign_id, kind, action, reason).with_execution(&execution_id)
            }
        }
    }

    async fn start_voice(&self, execution: &CampaignExecution, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self.directory.take_pending_tasks(&execution.campaign_id).await?;
        let offered = tasks.len();

        // The guard keeps a concurrent stop out until the gate is open; a stop
        // that already got in wins and the tasks are dropped with the run.
        let guard = self
            .executions
            .get(&execution.campaign_id)
            .filter(|e| e.execution_id == execution.execution_id && e.state == ExecutionState::Starting);
        let Some(guard) = guard else {
            debug!(campaign_id = %execution.campaign_id, dropped = offered, "Execution ended before dispatch");
            return Err(CampaignError::orchestration("Campaign was stopped while starting"));
        };

        let enqueued = tasks
            .into_iter()
            .filter(|task| self.voice_queue.enqueue(task.clone(), now))
            .count();
        self.gate.open(&execution.campaign_id);
        drop(guard);

        if enqueued < offered {
            debug!(campaign_id = %execution.campaign_id, duplicates = offered - enqueued, "Some tasks were already queued");
        }
        Ok(enqueued)
    }

    async fn start_sms(&self, execution: &CampaignExecution, now: DateTime<Utc>) -> Result<usize> {
        let tasks = self.directory.take_pending_tasks(&execution.campaign_id).await?;
        let count = tasks.len();

        // Running before the dispatcher can possibly finish
        match self.executions.get_mut(&execution.campaign_id) {
            Some(mut entry) if entry.execution_id == execution.execution_id && entry.state == ExecutionState::Starting => {
                entry.set_state(ExecutionState::Running, now);
            }
            _ => return Err(CampaignError::orchestration("Campaign was stopped while starting")),
        }

        let this = self.clone();
        let execution = execution.clone();
        tokio::spawn(async move {
            let outcome = this
                .sms
                .dispatch(&execution, tasks)
                .await
                .map(|_| ())
                .map_err(|e| format!("SMS dispatch failed: {}", e));
            this.finish_execution(&execution.campaign_id, &execution.execution_id, outcome, Utc::now())
                .await;
        });
        Ok(count)
    }

    pub fn pause(&self, campaign_id: &CampaignId, now: DateTime<Utc>) -> ControlResponse {
        let action = ControlAction::Pause;
        let outcome = match self.executions.get_mut(campaign_id) {
            None => Err((None, "Campaign is not running".to_string())),
            Some(mut entry) => match entry.state {
                ExecutionState::Running => {
                    entry.set_state(ExecutionState::Paused, now);
                    Ok((entry.campaign_type, true))
                }
                ExecutionState::Paused => Ok((entry.campaign_type, false)),
                state => Err((Some(entry.campaign_type), format!("Cannot pause a {} campaign", state))),
            },
        };

        match outcome {
            Ok((campaign_type, changed)) => {
                if changed {
                    self.gate.close(campaign_id);
                    info!(campaign_id = %campaign_id, "⏸️ Campaign paused, slot retained");
                    ControlResponse::accepted(campaign_id, Some(campaign_type), action, "Campaign paused")
                } else {
                    ControlResponse::accepted(campaign_id, Some(campaign_type), action, "Campaign already paused")
                }
            }
            Err((campaign_type, message)) => ControlResponse::rejected(campaign_id, campaign_type, action, message),
        }
    }

    pub fn resume(&self, campaign_id: &CampaignId, now: DateTime<Utc>) -> ControlResponse {
        let action = ControlAction::Resume;
        let outcome = match self.executions.get_mut(campaign_id) {
            None => Err((None, "Campaign is not running".to_string())),
            Some(mut entry) => match entry.state {
                ExecutionState::Paused => {
                    entry.set_state(ExecutionState::Running, now);
                    Ok((entry.campaign_type, true))
                }
                ExecutionState::Running => Ok((entry.campaign_type, false)),
                state => Err((Some(entry.campaign_type), format!("Cannot resume a {} campaign", state))),
            },
        };

        match outcome {
            Ok((campaign_type, changed)) => {
                if changed {
                    if campaign_type.admission_class() == AdmissionClass::Voice {
                        self.gate.open(campaign_id);
                    }
                    info!(campaign_id = %campaign_id, "▶️ Campaign resumed");
                    ControlResponse::accepted(campaign_id, Some(campaign_type), action, "Campaign resumed")
                } else {
                    ControlResponse::accepted(campaign_id, Some(campaign_type), action, "Campaign already running")
                }
            }
            Err((campaign_type, message)) => ControlResponse::rejected(campaign_id, campaign_type, action, message),
        }
    }

    /// Stop always ends with the slot released and the execution `Stopped`.
    pub async fn stop(&self, campaign_id: &CampaignId, now: DateTime<Utc>) -> ControlResponse {
        let action = ControlAction::Stop;
        let execution = match self.executions.get_mut(campaign_id) {
            Some(mut entry) if entry.state.holds_slot() => {
                entry.set_state(ExecutionState::Stopping, now);
                Some(entry.clone())
            }
            _ => None,
        };

        let Some(execution) = execution else {
            return self.stop_untracked(campaign_id, now).await;
        };

        self.gate.close(campaign_id);
        let mut hung_up = 0;
        let purged = match execution.class {
            AdmissionClass::Voice => {
                let purged = self.voice_queue.purge_campaign(campaign_id);
                if let Some(engine) = &self.engine {
                    match engine.stop_campaign(campaign_id).await {
                        Ok(count) => hung_up = count,
                        Err(e) => warn!(campaign_id = %campaign_id, error = %e, "Could not hang up campaign calls"),
                    }
                }
                purged
            }
            AdmissionClass::Sms => self.sms.purge(campaign_id),
        };

        if let Err(e) = self.pool.release(execution.class, &execution.execution_id).await {
            // the lease will lapse on its own once heartbeats stop
            error!(campaign_id = %campaign_id, error = %e, "Slot release failed");
        }
        if let Some(mut entry) = self.executions.get_mut(campaign_id) {
            if entry.execution_id == execution.execution_id {
                entry.set_state(ExecutionState::Stopped, now);
            }
        }

        info!(
            campaign_id = %campaign_id,
            execution_id = %execution.execution_id,
            purged,
            hung_up,
            "🛑 Campaign stopped"
        );
        ControlResponse::accepted(
            campaign_id,
            Some(execution.campaign_type),
            action,
            format!("Campaign stopped; {} pending tasks purged, {} calls hung up", purged, hung_up),
        )
        .with_execution(&execution.execution_id)
    }

    /// Stop for a campaign this instance is not running: release any slot the
    /// store still holds for it (left behind by another instance or a restart).
    async fn stop_untracked(&self, campaign_id: &CampaignId, now: DateTime<Utc>) -> ControlResponse {
        let action = ControlAction::Stop;
        let campaign_type = self.directory.campaign_type(campaign_id).await.ok().flatten();
        self.gate.close(campaign_id);

        let mut released = None;
        for class in AdmissionClass::ALL {
            match self.pool.store().active(class, now).await {
                Ok(leases) => {
                    for lease in leases.into_iter().filter(|l| &l.campaign_id == campaign_id) {
                        if self.pool.release(class, &lease.execution_id).await.is_ok() {
                            released = Some(lease.execution_id);
                        }
                    }
                }
                Err(e) => warn!(campaign_id = %campaign_id, class = %class, error = %e, "Could not inspect slots"),
            }
        }

        match released {
            Some(execution_id) => {
                info!(campaign_id = %campaign_id, execution_id = %execution_id, "Released orphaned slot on stop");
                ControlResponse::accepted(campaign_id, campaign_type, action, "Campaign stopped; orphaned slot released")
                    .with_execution(&execution_id)
            }
            None => ControlResponse::accepted(campaign_id, campaign_type, action, "Campaign is not running"),
        }
    }

    /// Refresh the slot lease of every execution that owns one.
    /// Returns the number of executions whose lease had already lapsed.
    pub async fn heartbeat(&self, now: DateTime<Utc>) -> usize {
        let live: Vec<CampaignExecution> = self
            .executions
            .iter()
            .filter(|e| e.state.holds_slot())
            .map(|e| e.value().clone())
            .collect();

        let mut lost = 0;
        for execution in live {
            match self.pool.heartbeat(execution.class, &execution.execution_id, now).await {
                Ok(true) => {}
                Ok(false) => {
                    lost += 1;
                    self.finish_execution(
                        &execution.campaign_id,
                        &execution.execution_id,
                        Err("Slot lease lapsed".to_string()),
                        now,
                    )
                    .await;
                }
                Err(e) => warn!(execution_id = %execution.execution_id, error = %e, "Heartbeat failed"),
            }
        }
        lost
    }

    /// Complete running voice executions whose tasks have all been worked off.
    /// An execution that has not seen a single task of its own yet keeps
    /// waiting for intake. Returns how many completed.
    pub async fn check_completions(&self, now: DateTime<Utc>) -> usize {
        let done: Vec<(CampaignId, ExecutionId)> = self
            .executions
            .iter()
            .filter(|e| e.state == ExecutionState::Running && e.class == AdmissionClass::Voice)
            .filter(|e| self.voice_queue.accepted(&e.campaign_id) > e.intake_baseline)
            .filter(|e| self.voice_queue.outstanding(&e.campaign_id) == 0)
            .map(|e| (e.campaign_id.clone(), e.execution_id.clone()))
            .collect();

        for (campaign_id, execution_id) in &done {
            info!(campaign_id = %campaign_id, "✅ Campaign has no outstanding tasks, completing");
            self.finish_execution(campaign_id, execution_id, Ok(()), now).await;
        }
        done.len()
    }

    /// End an execution as `Stopped` or `Failed` and release its slot.
    /// No-op if the execution was replaced or already finished.
    async fn finish_execution(
        &self,
        campaign_id: &CampaignId,
        execution_id: &ExecutionId,
        outcome: std::result::Result<(), String>,
        now: DateTime<Utc>,
    ) {
        let class = match self.executions.get_mut(campaign_id) {
            Some(mut entry) if &entry.execution_id == execution_id && !entry.state.is_finished() => {
                match &outcome {
                    Ok(()) => entry.set_state(ExecutionState::Stopped, now),
                    Err(reason) => entry.fail(reason.clone(), now),
                }
                entry.class
            }
            _ => return,
        };

        self.gate.close(campaign_id);
        if let Err(e) = self.pool.release(class, execution_id).await {
            error!(campaign_id = %campaign_id, error = %e, "Slot release failed");
        }

        if let Err(reason) = outcome {
            warn!(campaign_id = %campaign_id, execution_id = %execution_id, reason = %reason, "Campaign execution failed");
            let alert = Notification::for_campaign(
                NotificationKind::ExecutionFailed,
                campaign_id,
                now,
                serde_json::json!({ "executionId": execution_id, "reason": reason }),
            );
            if let Err(e) = self.publisher.publish(alert) {
                warn!(campaign_id = %campaign_id, error = %e, "Execution alert not published");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IntakeConfig, ResourceConfig};
    use crate::notify::BroadcastPublisher;
    use crate::orchestrator::{InMemoryDirectory, SmsQueueDispatcher};
    use crate::store::MemoryStore;
    use crate::types::DialTask;
    use async_trait::async_trait;
    use chrono::Duration;
    use tokio::sync::Notify;

    struct Fixture {
        orchestrator: CampaignOrchestrator,
        directory: Arc<InMemoryDirectory>,
        voice_queue: Arc<TaskQueue>,
        sms_queue: Arc<TaskQueue>,
        gate: Arc<LeaseGate>,
    }

    fn fixture(voice_quota: u32) -> Fixture {
        let resources = ResourceConfig {
            voice_quota,
            sms_quota: 2,
            ..Default::default()
        };
        let pool = Arc::new(ResourcePool::new(Arc::new(MemoryStore::new()), resources, "test"));
        let directory = Arc::new(InMemoryDirectory::new());
        let voice_queue = Arc::new(TaskQueue::new(AdmissionClass::Voice, &IntakeConfig::default()));
        let sms_queue = Arc::new(TaskQueue::new(AdmissionClass::Sms, &IntakeConfig::default()));
        let gate = Arc::new(LeaseGate::new());
        let sms = Arc::new(SmsQueueDispatcher::new(sms_queue.clone()).unwrap());
        let orchestrator = CampaignOrchestrator::new(
            pool,
            directory.clone(),
            voice_queue.clone(),
            gate.clone(),
            sms,
            Arc::new(BroadcastPublisher::new(16)),
        );
        Fixture {
            orchestrator,
            directory,
            voice_queue,
            sms_queue,
            gate,
        }
    }

    fn task(campaign: &str, id: &str) -> DialTask {
        DialTask {
            task_id: id.into(),
            campaign_id: campaign.into(),
            contact_id: id.into(),
            phone_number: "+15550100".into(),
            audio_ref: "audio".into(),
            ivr_flow: "donation".into(),
            metadata: serde_json::Value::Null,
            submitted_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_start_dispatches_voice_tasks_and_opens_gate() {
        let f = fixture(1);
        f.directory.register("A", CampaignType::Voice);
        f.directory.add_tasks(&"A".into(), vec![task("A", "t1"), task("A", "t2")]);

        let response = f.orchestrator.start(&"A".into(), Utc::now()).await;
        assert!(response.success, "{}", response.message);
        assert_eq!(response.campaign_type, Some(CampaignType::Voice));
        assert!(response.execution_id.is_some());
        assert_eq!(f.voice_queue.outstanding(&"A".into()), 2);
        assert!(f.gate.is_open(&"A".into()));
        assert_eq!(f.orchestrator.execution(&"A".into()).unwrap().state, ExecutionState::Running);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_running() {
        let f = fixture(2);
        f.directory.register("A", CampaignType::Voice);
        let first = f.orchestrator.start(&"A".into(), Utc::now()).await;
        let second = f.orchestrator.start(&"A".into(), Utc::now()).await;

        assert!(second.success);
        assert_eq!(second.message, "Campaign already running");
        assert_eq!(first.execution_id, second.execution_id);
        let util = f.orchestrator.utilization(AdmissionClass::Voice, Utc::now()).await.unwrap();
        assert_eq!(util.active, 1);
    }

    #[tokio::test]
    async fn test_quota_exhaustion_is_retryable() {
        let f = fixture(1);
        f.directory.register("A", CampaignType::Voice);
        f.directory.register("B", CampaignType::Hybrid);
        let now = Utc::now();

        assert!(f.orchestrator.start(&"A".into(), now).await.success);
        let denied = f.orchestrator.start(&"B".into(), now).await;
        assert!(!denied.success);
        assert!(denied.retryable);
        assert_eq!(denied.message, "Resource exhausted: 1/1 voice slots in use");

        assert!(f.orchestrator.stop(&"A".into(), now).await.success);
        assert!(f.orchestrator.start(&"B".into(), now).await.success);
    }

    #[tokio::test]
    async fn test_pause_keeps_slot_and_closes_gate() {
        let f = fixture(1);
        f.directory.register("A", CampaignType::Voice);
        let now = Utc::now();
        f.orchestrator.start(&"A".into(), now).await;

        assert!(f.orchestrator.pause(&"A".into(), now).success);
        assert!(!f.gate.is_open(&"A".into()));
        assert_eq!(f.orchestrator.utilization(AdmissionClass::Voice, now).await.unwrap().active, 1);

        let restart = f.orchestrator.start(&"A".into(), now).await;
        assert!(!restart.success);
        assert_eq!(restart.message, "Campaign is paused; use resume");

        assert!(f.orchestrator.resume(&"A".into(), now).success);
        assert!(f.gate.is_open(&"A".into()));
        assert!(!f.orchestrator.resume(&"missing".into(), now).success);
    }

    #[tokio::test]
    async fn test_stop_purges_and_releases() {
        let f = fixture(1);
        f.directory.register("A", CampaignType::Voice);
        f.directory.add_tasks(&"A".into(), vec![task("A", "t1")]);
        let now = Utc::now();
        f.orchestrator.start(&"A".into(), now).await;

        let stopped = f.orchestrator.stop(&"A".into(), now).await;
        assert!(stopped.success);
        assert_eq!(f.voice_queue.outstanding(&"A".into()), 0);
        assert_eq!(f.orchestrator.execution(&"A".into()).unwrap().state, ExecutionState::Stopped);
        assert_eq!(f.orchestrator.utilization(AdmissionClass::Voice, now).await.unwrap().active, 0);

        let again = f.orchestrator.stop(&"A".into(), now).await;
        assert!(again.success);
        assert_eq!(again.message, "Campaign is not running");
    }

    #[tokio::test]
    async fn test_sms_execution_completes_and_releases() {
        let f = fixture(1);
        f.directory.register("S", CampaignType::Sms);
        f.directory.add_tasks(&"S".into(), vec![task("S", "m1"), task("S", "m2")]);

        assert!(f.orchestrator.start(&"S".into(), Utc::now()).await.success);
        for _ in 0..100 {
            if f.orchestrator.execution(&"S".into()).unwrap().state == ExecutionState::Stopped {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.orchestrator.execution(&"S".into()).unwrap().state, ExecutionState::Stopped);
        assert_eq!(f.sms_queue.outstanding(&"S".into()), 2);
        assert_eq!(f.voice_queue.outstanding(&"S".into()), 0);
        assert_eq!(f.orchestrator.utilization(AdmissionClass::Sms, Utc::now()).await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_completion_when_queue_drains() {
        let f = fixture(1);
        f.directory.register("A", CampaignType::Voice);
        f.directory.add_tasks(&"A".into(), vec![task("A", "t1")]);
        let now = Utc::now();
        f.orchestrator.start(&"A".into(), now).await;

        assert_eq!(f.orchestrator.check_completions(now).await, 0);
        let leased = f.voice_queue.lease(now, 1, &f.gate);
        f.voice_queue.ack(&leased[0].receipt).unwrap();
        assert_eq!(f.orchestrator.check_completions(now).await, 1);
        assert_eq!(f.orchestrator.execution(&"A".into()).unwrap().state, ExecutionState::Stopped);
        assert_eq!(f.orchestrator.utilization(AdmissionClass::Voice, now).await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_lapsed_lease_fails_execution() {
        let f = fixture(1);
        f.directory.register("A", CampaignType::Voice);
        let now = Utc::now();
        f.orchestrator.start(&"A".into(), now).await;

        // past the default 60s TTL; another acquire reclaims the slot first
        let later = now + Duration::seconds(120);
        f.directory.register("B", CampaignType::Voice);
        assert!(f.orchestrator.start(&"B".into(), later).await.success);

        assert_eq!(f.orchestrator.heartbeat(later).await, 1);
        let failed = f.orchestrator.execution(&"A".into()).unwrap();
        assert_eq!(failed.state, ExecutionState::Failed);
        assert!(!f.gate.is_open(&"A".into()));
        assert_eq!(f.orchestrator.execution(&"B".into()).unwrap().state, ExecutionState::Running);
    }

    /// Directory that blocks in `take_pending_tasks` until released
    struct BlockingDirectory {
        inner: InMemoryDirectory,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CampaignDirectory for BlockingDirectory {
        async fn campaign_type(&self, campaign_id: &CampaignId) -> Result<Option<CampaignType>> {
            self.inner.campaign_type(campaign_id).await
        }

        async fn take_pending_tasks(&self, campaign_id: &CampaignId) -> Result<Vec<DialTask>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.take_pending_tasks(campaign_id).await
        }
    }

    #[tokio::test]
    async fn test_stop_during_dispatch_wins() {
        let directory = Arc::new(BlockingDirectory {
            inner: InMemoryDirectory::new(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        directory.inner.register("A", CampaignType::Voice);
        directory.inner.add_tasks(&"A".into(), vec![task("A", "t1")]);

        let resources = ResourceConfig {
            voice_quota: 1,
            ..Default::default()
        };
        let pool = Arc::new(ResourcePool::new(Arc::new(MemoryStore::new()), resources, "test"));
        let voice_queue = Arc::new(TaskQueue::new(AdmissionClass::Voice, &IntakeConfig::default()));
        let sms_queue = Arc::new(TaskQueue::new(AdmissionClass::Sms, &IntakeConfig::default()));
        let gate = Arc::new(LeaseGate::new());
        let orchestrator = CampaignOrchestrator::new(
            pool,
            directory.clone(),
            voice_queue.clone(),
            gate.clone(),
            Arc::new(SmsQueueDispatcher::new(sms_queue).unwrap()),
            Arc::new(BroadcastPublisher::new(16)),
        );
        let now = Utc::now();

        let starting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.start(&"A".into(), now).await })
        };
        directory.entered.notified().await;

        let stopped = orchestrator.stop(&"A".into(), now).await;
        assert!(stopped.success);
        directory.release.notify_one();
        let started = starting.await.unwrap();

        assert!(!started.success);
        assert_eq!(orchestrator.execution(&"A".into()).unwrap().state, ExecutionState::Stopped);
        assert!(!gate.is_open(&"A".into()));
        assert_eq!(voice_queue.outstanding(&"A".into()), 0);
        assert_eq!(orchestrator.utilization(AdmissionClass::Voice, now).await.unwrap().active, 0);
    }

    #[tokio::test]
    async fn test_empty_start_waits_for_intake_before_completing() {
        let f = fixture(1);
        f.directory.register("A", CampaignType::Voice);
        let now = Utc::now();
        assert!(f.orchestrator.start(&"A".into(), now).await.success);

        assert_eq!(f.orchestrator.check_completions(now).await, 0);
        assert_eq!(f.orchestrator.execution(&"A".into()).unwrap().state, ExecutionState::Running);

        // tasks arrive through intake after the start
        f.voice_queue.enqueue(task("A", "t1"), now);
        let leased = f.voice_queue.lease(now, 1, &f.gate);
        assert_eq!(leased.len(), 1);
        assert_eq!(f.orchestrator.check_completions(now).await, 0);

        f.voice_queue.ack(&leased[0].receipt).unwrap();
        assert_eq!(f.orchestrator.check_completions(now).await, 1);
    }

    #[tokio::test]
    async fn test_restart_ignores_work_of_previous_run() {
        let f = fixture(1);
        f.directory.register("A", CampaignType::Voice);
        f.directory.add_tasks(&"A".into(), vec![task("A", "t1")]);
        let now = Utc::now();
        f.orchestrator.start(&"A".into(), now).await;
        let leased = f.voice_queue.lease(now, 1, &f.gate);
        f.voice_queue.ack(&leased[0].receipt).unwrap();
        assert_eq!(f.orchestrator.check_completions(now).await, 1);

        assert!(f.orchestrator.start(&"A".into(), now).await.success);
        assert_eq!(f.orchestrator.check_completions(now).await, 0);
    }

    #[tokio::test]
    async fn test_stop_purges_sms_partition() {
        let f = fixture(1);
        f.directory.register("S", CampaignType::Sms);
        f.directory.register("T", CampaignType::Sms);
        let now = Utc::now();
        f.sms_queue.enqueue(task("S", "m1"), now);
        f.sms_queue.enqueue(task("T", "m2"), now);

        // single-threaded runtime: the dispatch task has not run yet when stop lands
        assert!(f.orchestrator.start(&"S".into(), now).await.success);
        let stopped = f.orchestrator.stop(&"S".into(), now).await;
        assert!(stopped.success);
        assert_eq!(stopped.message, "Campaign stopped; 1 pending tasks purged, 0 calls hung up");
        assert_eq!(f.sms_queue.outstanding(&"S".into()), 0);
        assert_eq!(f.sms_queue.outstanding(&"T".into()), 1);
        assert_eq!(f.orchestrator.utilization(AdmissionClass::Sms, now).await.unwrap().active, 0);
    }
}
