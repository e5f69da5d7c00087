//! In-process telephony adapter
//!
//! Used by `campaign-engine --simulate` and by the test suite. In manual mode
//! nothing happens until the caller injects events with
//! [`SimulatedAdapter::emit`]; in auto-answer mode every originated call
//! rings, answers, plays its prompt, optionally presses a digit and hangs up.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    AdapterStatus, HangupCause, OriginateRequest, OriginationError, TelephonyAdapter, TelephonyEvent,
    TelephonyEventKind, TelephonyInput,
};
use crate::error::{CampaignError, Result};
use crate::types::CallId;

#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedBehavior {
    /// Events only arrive through `emit`
    Manual,
    /// Walk every call through ring, answer, prompt, optional digit, hangup
    AutoAnswer { digit: Option<char>, step: Duration },
}

pub struct SimulatedAdapter {
    events: mpsc::Sender<TelephonyInput>,
    behavior: SimulatedBehavior,
    connected: AtomicBool,
    live: Mutex<HashSet<CallId>>,
    injected_failures: Mutex<VecDeque<OriginationError>>,
    originated: Mutex<Vec<OriginateRequest>>,
    hangups: Mutex<Vec<CallId>>,
}

impl SimulatedAdapter {
    pub fn new(events: mpsc::Sender<TelephonyInput>) -> Self {
        Self {
            events,
            behavior: SimulatedBehavior::Manual,
            connected: AtomicBool::new(true),
            live: Mutex::new(HashSet::new()),
            injected_failures: Mutex::new(VecDeque::new()),
            originated: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
        }
    }

    pub fn with_behavior(mut self, behavior: SimulatedBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Make the next `originate` call fail with `error`
    pub fn fail_next(&self, error: OriginationError) {
        self.injected_failures.lock().push_back(error);
    }

    /// Push an event into the engine as if the PBX had sent it
    pub async fn emit(&self, call_id: &CallId, kind: TelephonyEventKind) -> Result<()> {
        if matches!(kind, TelephonyEventKind::Hangup { .. } | TelephonyEventKind::Failed { .. }) {
            self.live.lock().remove(call_id);
        }
        let event = TelephonyEvent::new(call_id.clone(), kind, Utc::now());
        self.events
            .send(TelephonyInput::Event(event))
            .await
            .map_err(|_| CampaignError::EngineUnavailable("Call engine event channel closed".into()))
    }

    /// Drop the event stream
    pub async fn disconnect(&self, reason: impl Into<String>) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.send_status(AdapterStatus::Disconnected { reason: reason.into() }).await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        self.send_status(AdapterStatus::Connected).await
    }

    /// Forget a call without telling anyone, as a PBX restart would
    pub fn lose_call(&self, call_id: &CallId) {
        self.live.lock().remove(call_id);
    }

    /// The channel this adapter feeds, for wiring dialplan callbacks into the same loop
    pub fn sender(&self) -> mpsc::Sender<TelephonyInput> {
        self.events.clone()
    }

    pub fn originated(&self) -> Vec<OriginateRequest> {
        self.originated.lock().clone()
    }

    pub fn hangups(&self) -> Vec<CallId> {
        self.hangups.lock().clone()
    }

    async fn send_status(&self, status: AdapterStatus) -> Result<()> {
        self.events
            .send(TelephonyInput::Status(status))
            .await
            .map_err(|_| CampaignError::EngineUnavailable("Call engine event channel closed".into()))
    }

    fn spawn_auto_answer(&self, call_id: CallId, digit: Option<char>, step: Duration) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut script = vec![
                TelephonyEventKind::Proceeding,
                TelephonyEventKind::Answered,
                TelephonyEventKind::AudioStarted,
            ];
            if let Some(digit) = digit {
                script.push(TelephonyEventKind::Dtmf { digit });
            }
            script.push(TelephonyEventKind::Hangup { cause: HangupCause::Normal });

            for kind in script {
                tokio::time::sleep(step).await;
                let event = TelephonyEvent::new(call_id.clone(), kind, Utc::now());
                if events.send(TelephonyInput::Event(event)).await.is_err() {
                    debug!(call_id = %call_id, "Engine gone, stopping simulated call");
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl TelephonyAdapter for SimulatedAdapter {
    async fn originate(&self, request: &OriginateRequest) -> std::result::Result<CallId, OriginationError> {
        self.originated.lock().push(request.clone());

        if !self.connected.load(Ordering::SeqCst) {
            return Err(OriginationError::Transport("simulated PBX disconnected".into()));
        }
        if let Some(error) = self.injected_failures.lock().pop_front() {
            return Err(error);
        }

        self.live.lock().insert(request.call_id.clone());
        info!(call_id = %request.call_id, number = %request.phone_number, "Simulated origination");

        if let SimulatedBehavior::AutoAnswer { digit, step } = &self.behavior {
            self.spawn_auto_answer(request.call_id.clone(), *digit, *step);
        }
        Ok(request.call_id.clone())
    }

    async fn hangup(&self, call_id: &CallId) -> Result<()> {
        self.hangups.lock().push(call_id.clone());
        let was_live = self.live.lock().remove(call_id);
        if was_live && self.is_connected() {
            self.emit(call_id, TelephonyEventKind::Hangup { cause: HangupCause::Normal })
                .await?;
        }
        Ok(())
    }

    async fn active_calls(&self) -> Result<HashSet<CallId>> {
        if !self.is_connected() {
            return Err(CampaignError::telephony("simulated PBX disconnected"));
        }
        Ok(self.live.lock().clone())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Convenience for wiring: the adapter plus the receiver the engine consumes
pub fn simulated_pair(capacity: usize) -> (Arc<SimulatedAdapter>, mpsc::Receiver<TelephonyInput>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Arc::new(SimulatedAdapter::new(tx)), rx)
}
