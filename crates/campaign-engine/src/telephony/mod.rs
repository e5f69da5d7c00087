//! # Telephony Control Adapter
//!
//! The boundary between the call engine and the PBX. Commands go out through
//! the [`TelephonyAdapter`] trait; events come back as [`TelephonyInput`]
//! values on an mpsc channel that the engine's loop consumes in order.
//!
//! Two implementations ship with the crate:
//!
//! - [`AriAdapter`]: REST commands plus a websocket event stream against an
//!   Asterisk REST Interface style endpoint, reconnecting with backoff.
//! - [`SimulatedAdapter`]: in-process stand-in for dry runs and tests, with
//!   scripted events and failure injection.
//!
//! Dialplan HTTP callbacks are converted into the same [`TelephonyEvent`]
//! type, so the engine sees one event vocabulary regardless of the source.

pub mod ari;
pub mod simulated;

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Result;
use crate::types::{CallId, CampaignId, ContactId};

pub use ari::AriAdapter;
pub use simulated::SimulatedAdapter;

/// Everything the PBX needs to place one call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginateRequest {
    pub call_id: CallId,
    pub campaign_id: CampaignId,
    pub contact_id: ContactId,
    pub phone_number: String,
    pub audio_ref: String,
    pub ivr_flow: String,
}

/// Why an origination did not produce a call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OriginationError {
    /// The PBX refused the call; the call is over
    #[error("Origination rejected: {0}")]
    Rejected(String),

    /// The PBX could not be reached; the task should be delivered again later
    #[error("Telephony transport failure: {0}")]
    Transport(String),
}

impl OriginationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, OriginationError::Transport(_))
    }
}

/// Normalised hangup cause (Q.850 codes where the PBX supplies them)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HangupCause {
    Normal,
    Busy,
    NoAnswer,
    Unallocated,
    Congestion,
    Rejected,
    Other,
}

impl HangupCause {
    pub fn from_q850(code: i64) -> Self {
        match code {
            16 => HangupCause::Normal,
            17 => HangupCause::Busy,
            18 | 19 => HangupCause::NoAnswer,
            1 | 3 | 28 => HangupCause::Unallocated,
            34 | 38 | 41 | 42 => HangupCause::Congestion,
            21 => HangupCause::Rejected,
            _ => HangupCause::Other,
        }
    }

    /// Lenient parse of textual causes from dialplan callbacks
    pub fn from_text(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "normal" | "normal_clearing" | "answered" => HangupCause::Normal,
            "busy" | "user_busy" => HangupCause::Busy,
            "noanswer" | "no_answer" | "no_user_response" => HangupCause::NoAnswer,
            "unallocated" | "invalid_number" | "chanunavail" => HangupCause::Unallocated,
            "congestion" => HangupCause::Congestion,
            "rejected" | "call_rejected" => HangupCause::Rejected,
            _ => HangupCause::Other,
        }
    }
}

impl fmt::Display for HangupCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HangupCause::Normal => "normal",
            HangupCause::Busy => "busy",
            HangupCause::NoAnswer => "no_answer",
            HangupCause::Unallocated => "unallocated",
            HangupCause::Congestion => "congestion",
            HangupCause::Rejected => "rejected",
            HangupCause::Other => "other",
        };
        f.write_str(s)
    }
}

/// What happened on a call, as reported by the PBX or a dialplan callback
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyEventKind {
    /// The far end is being alerted
    Proceeding,
    Answered,
    /// The IVR prompt started playing
    AudioStarted,
    Dtmf { digit: char },
    /// The dialplan gave up waiting for input
    IvrTimeout,
    Hangup { cause: HangupCause },
    /// The PBX reports the call could not be set up
    Failed { reason: String },
}

impl TelephonyEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            TelephonyEventKind::Proceeding => "proceeding",
            TelephonyEventKind::Answered => "answered",
            TelephonyEventKind::AudioStarted => "audio_started",
            TelephonyEventKind::Dtmf { .. } => "dtmf",
            TelephonyEventKind::IvrTimeout => "ivr_timeout",
            TelephonyEventKind::Hangup { .. } => "hangup",
            TelephonyEventKind::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelephonyEvent {
    pub call_id: CallId,
    pub kind: TelephonyEventKind,
    pub timestamp: DateTime<Utc>,
}

impl TelephonyEvent {
    pub fn new(call_id: CallId, kind: TelephonyEventKind, timestamp: DateTime<Utc>) -> Self {
        Self { call_id, kind, timestamp }
    }
}

/// Connectivity of the adapter's event stream
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterStatus {
    Connected,
    Disconnected { reason: String },
}

/// Everything an adapter pushes into the engine
#[derive(Debug, Clone, PartialEq)]
pub enum TelephonyInput {
    Event(TelephonyEvent),
    Status(AdapterStatus),
}

impl From<TelephonyEvent> for TelephonyInput {
    fn from(event: TelephonyEvent) -> Self {
        TelephonyInput::Event(event)
    }
}

/// Command side of the PBX binding
#[async_trait]
pub trait TelephonyAdapter: Send + Sync {
    /// Place a call. On success the returned id is the one events will carry.
    async fn originate(&self, request: &OriginateRequest) -> std::result::Result<CallId, OriginationError>;

    /// Best-effort hangup
    async fn hangup(&self, call_id: &CallId) -> Result<()>;

    /// Calls the PBX currently considers live
    async fn active_calls(&self) -> Result<HashSet<CallId>>;

    fn is_connected(&self) -> bool;
}
