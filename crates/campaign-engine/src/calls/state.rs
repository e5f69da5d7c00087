//! Call states and the pure transition table
//!
//! `transition(state, event)` decides the next state and the ordered list of
//! actions the engine must carry out. It touches no I/O and owns no data, so
//! every path through the IVR can be tested without an engine.
//!
//! ```text
//! Queued ──Originate──▶ Originating ──Proceeding──▶ Ringing
//!                           │                          │
//!                           ├──────────Answered────────┤──▶ Answered ──AudioStarted──▶ InIvr
//!                           │                          │                                 │
//!                           └─ busy / no answer / failed / ring timeout ─▶ terminal      ├─ '1' ─▶ DonationRequested
//!                                                                                        ├─ '9' ─▶ OptOutRequested
//!                                                                                        └─ other / timeout ─▶ Timeout
//! any live state ──hangup / assumed lost──▶ Hungup
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::telephony::{HangupCause, TelephonyEventKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Queued,
    Originating,
    Ringing,
    Answered,
    InIvr,
    Busy,
    NoAnswer,
    OriginationFailed,
    Hungup,
    Timeout,
    DonationRequested,
    OptOutRequested,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Busy
                | CallState::NoAnswer
                | CallState::OriginationFailed
                | CallState::Hungup
                | CallState::Timeout
                | CallState::DonationRequested
                | CallState::OptOutRequested
        )
    }

    /// Still dialling: nobody has picked up yet
    pub fn is_pre_answer(&self) -> bool {
        matches!(self, CallState::Queued | CallState::Originating | CallState::Ringing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Queued => "queued",
            CallState::Originating => "originating",
            CallState::Ringing => "ringing",
            CallState::Answered => "answered",
            CallState::InIvr => "in_ivr",
            CallState::Busy => "busy",
            CallState::NoAnswer => "no_answer",
            CallState::OriginationFailed => "origination_failed",
            CallState::Hungup => "hungup",
            CallState::Timeout => "timeout",
            CallState::DonationRequested => "donation_requested",
            CallState::OptOutRequested => "opt_out_requested",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Originate,
    Proceeding,
    Answered,
    AudioStarted,
    Dtmf(char),
    IvrTimeout,
    RingTimeout,
    Hangup(HangupCause),
    OriginationFailed { reason: String },
    /// No event for longer than the grace period while the PBX was unreachable,
    /// or absent from the PBX's channel list after reconnecting
    AssumedLost,
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::Originate => "originate",
            CallEvent::Proceeding => "proceeding",
            CallEvent::Answered => "answered",
            CallEvent::AudioStarted => "audio_started",
            CallEvent::Dtmf(_) => "dtmf",
            CallEvent::IvrTimeout => "ivr_timeout",
            CallEvent::RingTimeout => "ring_timeout",
            CallEvent::Hangup(_) => "hangup",
            CallEvent::OriginationFailed { .. } => "origination_failed",
            CallEvent::AssumedLost => "assumed_lost",
        }
    }
}

impl From<TelephonyEventKind> for CallEvent {
    fn from(kind: TelephonyEventKind) -> Self {
        match kind {
            TelephonyEventKind::Proceeding => CallEvent::Proceeding,
            TelephonyEventKind::Answered => CallEvent::Answered,
            TelephonyEventKind::AudioStarted => CallEvent::AudioStarted,
            TelephonyEventKind::Dtmf { digit } => CallEvent::Dtmf(digit),
            TelephonyEventKind::IvrTimeout => CallEvent::IvrTimeout,
            TelephonyEventKind::Hangup { cause } => CallEvent::Hangup(cause),
            TelephonyEventKind::Failed { reason } => CallEvent::OriginationFailed { reason },
        }
    }
}

/// Side effects, carried out by the engine in order
#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    /// Append to the call's digit log and publish `dtmf_received`
    RecordDtmf(char),
    /// Publish `state_change`
    StateChanged { from: CallState, to: CallState },
    /// Publish `dial_end`: the dialling phase is over
    DialEnded { answered: bool },
    /// Publish `donation_requested`
    RequestDonation,
    /// Suppress the number and publish `optout_requested`
    RecordOptOut,
    /// Ask the PBX to drop the channel
    HangupChannel,
    /// Publish `call_ended`, ack the task lease, evict the call
    Finish(CallState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next_state: CallState,
    pub actions: Vec<CallAction>,
}

impl Transition {
    fn to(from: CallState, next_state: CallState) -> Self {
        let mut actions = Vec::new();
        if from != next_state {
            actions.push(CallAction::StateChanged { from, to: next_state });
        }
        Self { next_state, actions }
    }

    fn stay(state: CallState, actions: Vec<CallAction>) -> Self {
        Self { next_state: state, actions }
    }

    fn then(mut self, action: CallAction) -> Self {
        self.actions.push(action);
        self
    }

    /// Close out the call: dial_end if it never got answered, then finish
    fn terminal(from: CallState, outcome: CallState) -> Self {
        let t = Self::to(from, outcome);
        let t = if from.is_pre_answer() && from != CallState::Queued {
            t.then(CallAction::DialEnded { answered: false })
        } else {
            t
        };
        t.then(CallAction::Finish(outcome))
    }
}

/// Map a hangup before answer onto the outcome it really means
fn pre_answer_outcome(cause: HangupCause) -> CallState {
    match cause {
        HangupCause::Busy => CallState::Busy,
        HangupCause::NoAnswer => CallState::NoAnswer,
        HangupCause::Unallocated | HangupCause::Congestion | HangupCause::Rejected => CallState::OriginationFailed,
        HangupCause::Normal | HangupCause::Other => CallState::Hungup,
    }
}

/// `None` means the event does not apply in this state and is dropped.
pub fn transition(state: CallState, event: &CallEvent) -> Option<Transition> {
    use CallEvent as E;
    use CallState as S;

    if state.is_terminal() {
        return None;
    }

    let t = match (state, event) {
        (S::Queued, E::Originate) => Transition::to(state, S::Originating),

        (S::Originating, E::Proceeding) => Transition::to(state, S::Ringing),

        (S::Originating | S::Ringing, E::Answered) => {
            Transition::to(state, S::Answered).then(CallAction::DialEnded { answered: true })
        }
        (S::Originating | S::Ringing, E::AudioStarted) => {
            Transition::to(state, S::InIvr).then(CallAction::DialEnded { answered: true })
        }
        (S::Answered, E::AudioStarted) => Transition::to(state, S::InIvr),

        (S::Answered | S::InIvr, E::Dtmf(digit)) => {
            let record = Transition::stay(state, vec![CallAction::RecordDtmf(*digit)]);
            let (next, extra) = match digit {
                '1' => (S::DonationRequested, Some(CallAction::RequestDonation)),
                '9' => (S::OptOutRequested, Some(CallAction::RecordOptOut)),
                _ => (S::Timeout, Some(CallAction::HangupChannel)),
            };
            let mut actions = record.actions;
            actions.push(CallAction::StateChanged { from: state, to: next });
            actions.extend(extra);
            actions.push(CallAction::Finish(next));
            Transition { next_state: next, actions }
        }
        // digits before answer are logged, nothing else
        (_, E::Dtmf(digit)) => Transition::stay(state, vec![CallAction::RecordDtmf(*digit)]),

        (S::Answered | S::InIvr, E::IvrTimeout) => {
            let t = Transition::to(state, S::Timeout).then(CallAction::HangupChannel);
            t.then(CallAction::Finish(S::Timeout))
        }

        (S::Originating | S::Ringing, E::RingTimeout) => {
            let t = Transition::to(state, S::NoAnswer)
                .then(CallAction::HangupChannel)
                .then(CallAction::DialEnded { answered: false });
            t.then(CallAction::Finish(S::NoAnswer))
        }

        (S::Queued | S::Originating | S::Ringing, E::OriginationFailed { .. }) => {
            Transition::terminal(state, S::OriginationFailed)
        }
        (S::Answered | S::InIvr, E::OriginationFailed { .. }) => Transition::terminal(state, S::Hungup),

        (s, E::Hangup(cause)) if s.is_pre_answer() => Transition::terminal(state, pre_answer_outcome(*cause)),
        (_, E::Hangup(_)) => Transition::terminal(state, S::Hungup),

        (_, E::AssumedLost) => Transition::terminal(state, S::Hungup),

        _ => return None,
    };
    Some(t)
}
