//! # Call Lifecycle Engine
//!
//! One ordered loop owns every live [`Call`]. Nothing else touches call
//! state, so there are no locks around it; the loop suspends only while
//! talking to the PBX.
//!
//! The loop multiplexes four inputs:
//!
//! - telephony events and adapter status from the PBX binding or dialplan callbacks
//! - commands (per-campaign stop, shutdown) from the orchestrator
//! - a poll tick that leases voice tasks and originates calls
//! - a sweep tick that extends task visibility, applies ring/IVR timeouts and
//!   assumes calls lost while the PBX is unreachable
//!
//! Each event runs through the pure [`transition`] table and the resulting
//! actions are carried out in order. A call reaching a terminal state emits
//! `call_ended` once, acknowledges its task lease, is evicted and leaves a
//! tombstone behind so repeated terminal deliveries are recognised.
//!
//! Every handler takes the current time explicitly; [`CallEngine::run`]
//! passes the wall clock, tests pass whatever they like.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use super::record::{Call, SuppressionList, Tombstones};
use super::state::{transition, CallAction, CallEvent, CallState};
use crate::config::{CallConfig, IntakeConfig};
use crate::error::{CampaignError, Result};
use crate::intake::{DeadLetter, LeaseGate, LeasedTask, NackOutcome, TaskQueue};
use crate::notify::{Notification, NotificationKind, NotificationPublisher};
use crate::store::CoordinationStore;
use crate::telephony::{
    AdapterStatus, OriginateRequest, OriginationError, TelephonyAdapter, TelephonyEvent, TelephonyInput,
};
use crate::types::{CallId, CampaignId};

/// Control messages for the engine loop
#[derive(Debug)]
pub enum EngineCommand {
    /// Hang up every tracked call of a campaign; replies with the number of calls asked to hang up
    StopCampaign {
        campaign_id: CampaignId,
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// Counters published after every handler run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub live_calls: usize,
    pub adapter_connected: bool,
    pub originated: u64,
    pub completed: u64,
    pub redriven: u64,
    pub dead_lettered: u64,
    pub suppressed: u64,
    pub duplicate_events: u64,
    pub unknown_events: u64,
    pub outcomes: BTreeMap<String, u64>,
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: mpsc::Sender<TelephonyInput>,
    stats: watch::Receiver<EngineStats>,
}

impl EngineHandle {
    /// Feed an event into the loop (dialplan callbacks use this)
    pub async fn submit(&self, event: TelephonyEvent) -> Result<()> {
        self.events
            .send(TelephonyInput::Event(event))
            .await
            .map_err(|_| CampaignError::EngineUnavailable("Call engine is not running".into()))
    }

    pub async fn stop_campaign(&self, campaign_id: &CampaignId) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::StopCampaign {
                campaign_id: campaign_id.clone(),
                reply,
            })
            .await
            .map_err(|_| CampaignError::EngineUnavailable("Call engine is not running".into()))?;
        rx.await
            .map_err(|_| CampaignError::EngineUnavailable("Call engine stopped before replying".into()))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| CampaignError::EngineUnavailable("Call engine is not running".into()))
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.borrow().clone()
    }

    pub fn watch_stats(&self) -> watch::Receiver<EngineStats> {
        self.stats.clone()
    }
}

pub struct CallEngine {
    config: CallConfig,
    lease_batch_size: usize,
    poll_interval: Duration,
    queue: Arc<TaskQueue>,
    gate: Arc<LeaseGate>,
    adapter: Arc<dyn TelephonyAdapter>,
    publisher: Arc<dyn NotificationPublisher>,
    store: Arc<dyn CoordinationStore>,
    suppression: Arc<SuppressionList>,
    calls: HashMap<CallId, Call>,
    tombstones: Tombstones,
    connected: bool,
    disconnected_since: Option<DateTime<Utc>>,
    stats: EngineStats,
    stats_tx: watch::Sender<EngineStats>,
}

impl CallEngine {
    pub fn new(
        config: CallConfig,
        intake: &IntakeConfig,
        queue: Arc<TaskQueue>,
        gate: Arc<LeaseGate>,
        adapter: Arc<dyn TelephonyAdapter>,
        publisher: Arc<dyn NotificationPublisher>,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        let connected = adapter.is_connected();
        let stats = EngineStats {
            adapter_connected: connected,
            ..Default::default()
        };
        let (stats_tx, _) = watch::channel(stats.clone());

        Self {
            tombstones: Tombstones::new(config.tombstone_capacity),
            config,
            lease_batch_size: intake.lease_batch_size.max(1),
            poll_interval: Duration::from_millis(intake.poll_interval_ms.max(1)),
            queue,
            gate,
            adapter,
            publisher,
            store,
            suppression: Arc::new(SuppressionList::new()),
            calls: HashMap::new(),
            connected,
            disconnected_since: None,
            stats,
            stats_tx,
        }
    }

    /// Share an opt-out list with other engines or the API
    pub fn with_suppression(mut self, suppression: Arc<SuppressionList>) -> Self {
        self.suppression = suppression;
        self
    }

    pub fn suppression(&self) -> &Arc<SuppressionList> {
        &self.suppression
    }

    pub fn live_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn call(&self, call_id: &CallId) -> Option<&Call> {
        self.calls.get(call_id)
    }

    pub fn stats(&self) -> EngineStats {
        self.stats_tx.borrow().clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<EngineStats> {
        self.stats_tx.subscribe()
    }

    /// Move the engine onto its own task
    pub fn spawn(
        self,
        telephony: mpsc::Receiver<TelephonyInput>,
        telephony_tx: mpsc::Sender<TelephonyInput>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let handle = EngineHandle {
            commands: commands_tx,
            events: telephony_tx,
            stats: self.stats_tx.subscribe(),
        };
        let join = tokio::spawn(self.run(telephony, commands_rx).in_current_span());
        (handle, join)
    }

    pub async fn run(mut self, mut telephony: mpsc::Receiver<TelephonyInput>, mut commands: mpsc::Receiver<EngineCommand>) {
        let mut poll = interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = interval(Duration::from_millis(self.config.sweep_interval_ms.max(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("📞 Call engine loop started");
        loop {
            tokio::select! {
                Some(input) = telephony.recv() => {
                    self.handle_telephony(input, Utc::now()).await;
                }
                command = commands.recv() => match command {
                    Some(EngineCommand::StopCampaign { campaign_id, reply }) => {
                        let count = self.stop_campaign(&campaign_id).await;
                        let _ = reply.send(count);
                    }
                    Some(EngineCommand::Shutdown) | None => break,
                },
                _ = poll.tick() => {
                    self.poll_tasks(Utc::now()).await;
                }
                _ = sweep.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
        info!(live_calls = self.calls.len(), "Call engine loop stopped");
    }

    /// Lease voice tasks up to the live-call ceiling and originate them.
    /// Returns the number of tasks leased.
    pub async fn poll_tasks(&mut self, now: DateTime<Utc>) -> usize {
        if !self.connected {
            return 0;
        }
        let capacity = self.config.max_live_calls.saturating_sub(self.calls.len());
        if capacity == 0 {
            return 0;
        }

        let leased = self.queue.lease(now, capacity.min(self.lease_batch_size), &self.gate);
        let count = leased.len();
        for task in leased {
            self.start_call(task, now).await;
        }
        self.publish_stats();
        count
    }

    async fn start_call(&mut self, leased: LeasedTask, now: DateTime<Utc>) {
        let task = &leased.task;

        if self.suppression.is_suppressed(&task.phone_number) {
            info!(task_id = %task.task_id, campaign_id = %task.campaign_id, "Number opted out, not dialling");
            self.ack_receipt(&leased, "suppressed");
            self.stats.suppressed += 1;
            return;
        }

        let call_id = task.call_id();
        if let Some(call) = self.calls.get_mut(&call_id) {
            debug!(call_id = %call_id, attempt = leased.attempt, "Task redelivered while its call is live");
            call.receipt = leased.receipt.clone();
            call.attempt = leased.attempt;
            return;
        }
        if self.tombstones.contains(&call_id) {
            debug!(call_id = %call_id, "Task redelivered after its call finished");
            self.ack_receipt(&leased, "already finished");
            return;
        }

        let request = OriginateRequest {
            call_id: call_id.clone(),
            campaign_id: task.campaign_id.clone(),
            contact_id: task.contact_id.clone(),
            phone_number: task.phone_number.clone(),
            audio_ref: task.audio_ref.clone(),
            ivr_flow: task.ivr_flow.clone(),
        };
        // tracked while the request is out; Originating only once the PBX took it
        self.calls.insert(call_id.clone(), Call::from_lease(&leased, now));

        match self.adapter.originate(&request).await {
            Ok(_) => {
                self.apply(&call_id, CallEvent::Originate, now).await;
                self.stats.originated += 1;
                info!(
                    call_id = %call_id,
                    campaign_id = %request.campaign_id,
                    attempt = leased.attempt,
                    "Call originated"
                );
            }
            Err(OriginationError::Rejected(reason)) => {
                warn!(call_id = %call_id, reason = %reason, "Origination rejected");
                self.apply(&call_id, CallEvent::OriginationFailed { reason }, now).await;
            }
            Err(OriginationError::Transport(reason)) => {
                // no call exists; give the task back rather than burn an outcome
                self.calls.remove(&call_id);
                warn!(call_id = %call_id, attempt = leased.attempt, reason = %reason, "Origination transport failure");
                match self.queue.nack(&leased.receipt, now) {
                    Ok(NackOutcome::Redrive { visible_at }) => {
                        self.stats.redriven += 1;
                        debug!(call_id = %call_id, visible_at = %visible_at, "Task scheduled for redelivery");
                    }
                    Ok(NackOutcome::DeadLettered(letter)) => self.handle_dead_letter(letter, now).await,
                    Err(e) => warn!(call_id = %call_id, error = %e, "Failed to release task lease"),
                }
            }
        }
    }

    fn ack_receipt(&self, leased: &LeasedTask, why: &str) {
        if let Err(e) = self.queue.ack(&leased.receipt) {
            warn!(task_id = %leased.task.task_id, reason = why, error = %e, "Task ack failed");
        }
    }

    pub async fn handle_telephony(&mut self, input: TelephonyInput, now: DateTime<Utc>) {
        match input {
            TelephonyInput::Event(event) => self.handle_event(event, now).await,
            TelephonyInput::Status(status) => self.handle_status(status, now).await,
        }
        self.publish_stats();
    }

    async fn handle_event(&mut self, event: TelephonyEvent, now: DateTime<Utc>) {
        let TelephonyEvent { call_id, kind, timestamp } = event;

        if self.tombstones.contains(&call_id) {
            self.stats.duplicate_events += 1;
            debug!(call_id = %call_id, event = kind.name(), "Event for finished call dropped");
            return;
        }
        let Some(call) = self.calls.get_mut(&call_id) else {
            self.stats.unknown_events += 1;
            warn!(call_id = %call_id, event = kind.name(), "Event for unknown call dropped");
            return;
        };

        debug!(call_id = %call_id, event = kind.name(), sent_at = %timestamp, "Telephony event");
        call.touch(now);
        self.apply(&call_id, CallEvent::from(kind), now).await;
    }

    async fn handle_status(&mut self, status: AdapterStatus, now: DateTime<Utc>) {
        match status {
            AdapterStatus::Disconnected { reason } => {
                if self.connected {
                    warn!(reason = %reason, live_calls = self.calls.len(), "PBX connection lost");
                    self.connected = false;
                    self.disconnected_since = Some(now);
                }
            }
            AdapterStatus::Connected => {
                if let Some(since) = self.disconnected_since.take() {
                    info!(outage_secs = (now - since).num_seconds(), "PBX connection restored");
                    for call_id in self.lost_calls(now) {
                        self.apply(&call_id, CallEvent::AssumedLost, now).await;
                    }
                }
                self.connected = true;
                self.reconcile(now).await;
            }
        }
    }

    /// Calls silent for longer than the grace period
    fn lost_calls(&self, now: DateTime<Utc>) -> Vec<CallId> {
        let grace = self.config.assume_lost_grace();
        self.calls
            .values()
            .filter(|call| call.idle_for(now) > grace)
            .map(|call| call.call_id.clone())
            .collect()
    }

    /// Compare the live set with the PBX's own channel list
    async fn reconcile(&mut self, now: DateTime<Utc>) {
        let live = match self.adapter.active_calls().await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "Could not resynchronise with PBX");
                return;
            }
        };

        let missing: Vec<CallId> = self
            .calls
            .keys()
            .filter(|id| !live.contains(*id))
            .cloned()
            .collect();
        for call_id in &missing {
            info!(call_id = %call_id, "Call unknown to PBX after reconnect");
            self.apply(call_id, CallEvent::AssumedLost, now).await;
        }

        let orphans = live
            .iter()
            .filter(|id| !self.calls.contains_key(*id) && !self.tombstones.contains(id))
            .count();
        if orphans > 0 {
            warn!(orphans, "PBX reports channels this engine does not track");
        }
        debug!(tracked = self.calls.len(), missing = missing.len(), "Reconciled with PBX");
    }

    /// Periodic housekeeping. Safe to call at any time.
    pub async fn sweep(&mut self, now: DateTime<Utc>) {
        for call in self.calls.values() {
            if !self.queue.extend(&call.receipt, now) {
                debug!(call_id = %call.call_id, "Task lease for live call is stale");
            }
        }
        for letter in self.queue.expire_leases(now) {
            self.handle_dead_letter(letter, now).await;
        }

        // while the PBX is unreachable only the assume-lost grace applies
        if !self.connected {
            for call_id in self.lost_calls(now) {
                self.apply(&call_id, CallEvent::AssumedLost, now).await;
            }
            self.publish_stats();
            return;
        }

        let ring_timeout = self.config.ring_timeout();
        let ivr_timeout = self.config.ivr_timeout();
        let due: Vec<(CallId, CallEvent)> = self
            .calls
            .values()
            .filter_map(|call| match call.state {
                CallState::Originating | CallState::Ringing if now - call.start_time >= ring_timeout => {
                    Some((call.call_id.clone(), CallEvent::RingTimeout))
                }
                CallState::Answered | CallState::InIvr if now - call.state_entered_at >= ivr_timeout => {
                    Some((call.call_id.clone(), CallEvent::IvrTimeout))
                }
                _ => None,
            })
            .collect();

        for (call_id, event) in due {
            self.apply(&call_id, event, now).await;
        }
        self.publish_stats();
    }

    /// Best-effort hangup of every tracked call of a campaign
    pub async fn stop_campaign(&mut self, campaign_id: &CampaignId) -> usize {
        let targets: Vec<CallId> = self
            .calls
            .values()
            .filter(|call| &call.campaign_id == campaign_id)
            .map(|call| call.call_id.clone())
            .collect();

        for call_id in &targets {
            if let Err(e) = self.adapter.hangup(call_id).await {
                warn!(call_id = %call_id, error = %e, "Hangup on campaign stop failed");
            }
        }
        info!(campaign_id = %campaign_id, calls = targets.len(), "Hangups issued for stopped campaign");
        targets.len()
    }

    async fn apply(&mut self, call_id: &CallId, event: CallEvent, now: DateTime<Utc>) {
        let Some(call) = self.calls.get_mut(call_id) else {
            return;
        };
        let Some(step) = transition(call.state, &event) else {
            debug!(call_id = %call_id, state = %call.state, event = event.name(), "Event ignored in current state");
            return;
        };
        call.enter(step.next_state, now);

        for action in step.actions {
            self.perform(call_id, action, now).await;
        }
    }

    async fn perform(&mut self, call_id: &CallId, action: CallAction, now: DateTime<Utc>) {
        match action {
            CallAction::RecordDtmf(digit) => {
                if let Some(call) = self.calls.get_mut(call_id) {
                    call.dtmf_inputs.push(digit);
                    info!(call_id = %call_id, digit = %digit, sequence = %call.dtmf_inputs, "DTMF received");
                }
                self.publish_call(
                    call_id,
                    NotificationKind::DtmfReceived,
                    now,
                    |call| serde_json::json!({ "digit": digit.to_string(), "sequence": call.dtmf_inputs }),
                );
            }
            CallAction::StateChanged { from, to } => {
                debug!(call_id = %call_id, from = %from, to = %to, "Call state changed");
                self.publish_call(call_id, NotificationKind::StateChange, now, |_| {
                    serde_json::json!({ "from": from, "to": to })
                });
            }
            CallAction::DialEnded { answered } => {
                self.publish_call(call_id, NotificationKind::DialEnd, now, |call| {
                    serde_json::json!({ "answered": answered, "state": call.state })
                });
            }
            CallAction::RequestDonation => {
                self.publish_call(call_id, NotificationKind::DonationRequested, now, |call| {
                    serde_json::json!({ "phoneNumber": call.phone_number, "taskId": call.task_id })
                });
            }
            CallAction::RecordOptOut => {
                if let Some(call) = self.calls.get(call_id) {
                    self.suppression.suppress(&call.phone_number, now);
                    info!(call_id = %call_id, campaign_id = %call.campaign_id, "Number added to suppression list");
                }
                self.publish_call(call_id, NotificationKind::OptoutRequested, now, |call| {
                    serde_json::json!({ "phoneNumber": call.phone_number, "taskId": call.task_id })
                });
            }
            CallAction::HangupChannel => {
                if let Err(e) = self.adapter.hangup(call_id).await {
                    warn!(call_id = %call_id, error = %e, "Hangup request failed");
                }
            }
            CallAction::Finish(outcome) => self.finish(call_id, outcome, now).await,
        }
    }

    async fn finish(&mut self, call_id: &CallId, outcome: CallState, now: DateTime<Utc>) {
        self.publish_call(call_id, NotificationKind::CallEnded, now, |call| {
            serde_json::json!({
                "outcome": outcome,
                "dtmfInputs": call.dtmf_inputs,
                "durationSecs": (now - call.start_time).num_seconds(),
                "attempt": call.attempt,
                "taskId": call.task_id,
            })
        });

        let Some(call) = self.calls.remove(call_id) else {
            return;
        };
        if let Err(e) = self.queue.ack(&call.receipt) {
            warn!(call_id = %call_id, error = %e, "Task ack failed; the task may be delivered again");
        }
        self.tombstones.insert(call.call_id.clone());

        self.stats.completed += 1;
        *self.stats.outcomes.entry(outcome.as_str().to_string()).or_insert(0) += 1;

        if outcome == CallState::OriginationFailed {
            if let Err(e) = self.store.increment_failures(&call.campaign_id).await {
                warn!(campaign_id = %call.campaign_id, error = %e, "Failed to record origination failure");
            }
        }

        info!(
            call_id = %call_id,
            campaign_id = %call.campaign_id,
            contact_id = %call.contact_id,
            outcome = %outcome,
            dtmf = %call.dtmf_inputs,
            "Call finished"
        );
    }

    async fn handle_dead_letter(&mut self, letter: DeadLetter, now: DateTime<Utc>) {
        self.stats.dead_lettered += 1;
        let campaign_id = letter.task.campaign_id.clone();

        let failures = match self.store.increment_failures(&campaign_id).await {
            Ok(count) => Some(count),
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "Failed to record dead-lettered task");
                None
            }
        };

        let notification = Notification::for_campaign(
            NotificationKind::DeadLettered,
            &campaign_id,
            now,
            serde_json::json!({
                "taskId": letter.task.task_id,
                "contactId": letter.task.contact_id,
                "attempts": letter.attempts,
                "reason": letter.reason,
                "campaignFailures": failures,
            }),
        );
        if let Err(e) = self.publisher.publish(notification) {
            warn!(campaign_id = %campaign_id, error = %e, "Dead-letter alert not published");
        }
    }

    fn publish_call<F>(&self, call_id: &CallId, kind: NotificationKind, now: DateTime<Utc>, details: F)
    where
        F: FnOnce(&Call) -> serde_json::Value,
    {
        let Some(call) = self.calls.get(call_id) else {
            return;
        };
        let notification = Notification::for_call(
            kind,
            &call.call_id,
            &call.campaign_id,
            &call.contact_id,
            now,
            details(call),
        );
        if let Err(e) = self.publisher.publish(notification) {
            warn!(call_id = %call_id, error = %e, "Notification not published");
        }
    }

    fn publish_stats(&mut self) {
        self.stats.live_calls = self.calls.len();
        self.stats.adapter_connected = self.connected;
        self.stats_tx.send_replace(self.stats.clone());
    }
}
