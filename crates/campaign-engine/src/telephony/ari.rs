//! Asterisk REST Interface style adapter
//!
//! Commands are plain REST calls (`POST /ari/channels`, `DELETE
//! /ari/channels/{id}`, `GET /ari/channels`). Events arrive as JSON text
//! frames on a websocket; [`parse_event`] turns one frame into at most one
//! [`TelephonyEvent`], and a frame that fails to parse is logged and skipped
//! without touching the rest of the stream.
//!
//! The engine's deterministic call id is used as the channel id, so events
//! need no translation table.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn, Instrument};

use super::{
    AdapterStatus, HangupCause, OriginateRequest, OriginationError, TelephonyAdapter, TelephonyEvent,
    TelephonyEventKind, TelephonyInput,
};
use crate::config::TelephonyConfig;
use crate::error::{CampaignError, Result};
use crate::intake::Backoff;
use crate::types::CallId;

pub struct AriAdapter {
    config: TelephonyConfig,
    client: reqwest::Client,
    connected: Arc<AtomicBool>,
}

impl AriAdapter {
    pub fn new(config: TelephonyConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| CampaignError::configuration(format!("Failed to build ARI client: {}", e)))?;

        Ok(Self {
            config,
            client,
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/ari{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Start the websocket reader. It reconnects with backoff until `events` is closed.
    pub fn spawn_event_stream(&self, events: mpsc::Sender<TelephonyInput>) -> JoinHandle<()> {
        let url = self.config.events_url();
        let connected = self.connected.clone();
        let backoff = Backoff::from_millis(self.config.reconnect_base_ms, self.config.reconnect_max_ms);
        tokio::spawn(run_event_stream(url, connected, events, backoff).in_current_span())
    }
}

async fn run_event_stream(
    url: String,
    connected: Arc<AtomicBool>,
    events: mpsc::Sender<TelephonyInput>,
    backoff: Backoff,
) {
    let mut attempt: u32 = 0;

    loop {
        if events.is_closed() {
            debug!("Event consumer gone, stopping ARI event stream");
            return;
        }

        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _response)) => {
                info!("ARI event stream connected");
                attempt = 0;
                connected.store(true, Ordering::SeqCst);
                if events.send(TelephonyInput::Status(AdapterStatus::Connected)).await.is_err() {
                    return;
                }

                let (_write, mut read) = stream.split();
                let reason = loop {
                    match read.next().await {
                        Some(Ok(Message::Text(text))) => match parse_event(&text) {
                            Ok(Some(event)) => {
                                if events.send(TelephonyInput::Event(event)).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!(error = %e, "Skipping unparseable ARI event"),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break format!("closed by PBX: {:?}", frame);
                        }
                        Some(Ok(_)) => trace!("Ignoring non-text websocket frame"),
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    }
                };

                connected.store(false, Ordering::SeqCst);
                warn!(reason = %reason, "ARI event stream disconnected");
                if events
                    .send(TelephonyInput::Status(AdapterStatus::Disconnected { reason }))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                error!(error = %e, attempt, "ARI event stream connection failed");
            }
        }

        attempt = attempt.saturating_add(1);
        tokio::time::sleep(backoff.delay(attempt)).await;
    }
}

#[derive(Debug, Deserialize)]
struct AriEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    channel: Option<AriChannel>,
    #[serde(default)]
    digit: Option<String>,
    #[serde(default)]
    cause: Option<i64>,
    #[serde(default)]
    playback: Option<AriPlayback>,
}

#[derive(Debug, Deserialize)]
struct AriChannel {
    id: String,
    #[serde(default)]
    state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AriPlayback {
    target_uri: String,
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|ts| {
        DateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f%z")
            .or_else(|_| DateTime::parse_from_rfc3339(ts))
            .ok()
    })
    .map(|ts| ts.with_timezone(&Utc))
    .unwrap_or_else(Utc::now)
}

/// Translate one websocket frame. `Ok(None)` for event types the engine does not track.
pub fn parse_event(text: &str) -> Result<Option<TelephonyEvent>> {
    let raw: AriEvent = serde_json::from_str(text)?;
    let timestamp = parse_timestamp(raw.timestamp.as_deref());
    let channel_id = raw.channel.as_ref().map(|c| c.id.clone());

    let (call_id, kind) = match raw.event_type.as_str() {
        "ChannelStateChange" => {
            let channel = raw
                .channel
                .ok_or_else(|| CampaignError::telephony("ChannelStateChange without channel"))?;
            let kind = match channel.state.as_deref() {
                Some("Ring") | Some("Ringing") => TelephonyEventKind::Proceeding,
                Some("Up") => TelephonyEventKind::Answered,
                _ => return Ok(None),
            };
            (channel.id, kind)
        }
        "StasisStart" => (require_channel(channel_id, "StasisStart")?, TelephonyEventKind::Answered),
        "ChannelDtmfReceived" => {
            let digit = raw
                .digit
                .as_deref()
                .and_then(|d| d.chars().next())
                .ok_or_else(|| CampaignError::telephony("ChannelDtmfReceived without digit"))?;
            (
                require_channel(channel_id, "ChannelDtmfReceived")?,
                TelephonyEventKind::Dtmf { digit },
            )
        }
        "ChannelHangupRequest" | "ChannelDestroyed" => (
            require_channel(channel_id, &raw.event_type)?,
            TelephonyEventKind::Hangup {
                cause: HangupCause::from_q850(raw.cause.unwrap_or(16)),
            },
        ),
        "PlaybackStarted" => {
            let playback = raw
                .playback
                .ok_or_else(|| CampaignError::telephony("PlaybackStarted without playback"))?;
            match playback.target_uri.strip_prefix("channel:") {
                Some(id) => (id.to_string(), TelephonyEventKind::AudioStarted),
                None => return Ok(None),
            }
        }
        other => {
            trace!(event_type = other, "Ignoring ARI event");
            return Ok(None);
        }
    };

    Ok(Some(TelephonyEvent::new(CallId::new(call_id), kind, timestamp)))
}

fn require_channel(channel_id: Option<String>, event_type: &str) -> Result<String> {
    channel_id.ok_or_else(|| CampaignError::telephony(format!("{} without channel", event_type)))
}

#[derive(Debug, Deserialize)]
struct ChannelSummary {
    id: String,
}

#[async_trait]
impl TelephonyAdapter for AriAdapter {
    async fn originate(&self, request: &OriginateRequest) -> std::result::Result<CallId, OriginationError> {
        let endpoint = self.config.endpoint_for(&request.phone_number);
        let timeout = self.config.originate_timeout_secs.to_string();
        let body = serde_json::json!({
            "variables": {
                "CAMPAIGN_ID": request.campaign_id.as_str(),
                "CONTACT_ID": request.contact_id.as_str(),
                "AUDIO_REF": request.audio_ref,
                "IVR_FLOW": request.ivr_flow,
            }
        });

        let response = self
            .client
            .post(self.url("/channels"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .query(&[
                ("endpoint", endpoint.as_str()),
                ("app", self.config.app_name.as_str()),
                ("callerId", self.config.caller_id.as_str()),
                ("timeout", timeout.as_str()),
                ("channelId", request.call_id.as_str()),
            ])
            .json(&body)
            .send()
            .await
            .map_err(|e| OriginationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!(call_id = %request.call_id, endpoint = %endpoint, "Channel originated");
            return Ok(request.call_id.clone());
        }

        let detail = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(OriginationError::Rejected(format!("{}: {}", status, detail)))
        } else {
            Err(OriginationError::Transport(format!("{}: {}", status, detail)))
        }
    }

    async fn hangup(&self, call_id: &CallId) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("/channels/{}", call_id)))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| CampaignError::telephony(format!("Hangup of {} failed: {}", call_id, e)))?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(call_id = %call_id, "Channel already gone on hangup");
                Ok(())
            }
            s => Err(CampaignError::telephony(format!("Hangup of {} returned {}", call_id, s))),
        }
    }

    async fn active_calls(&self) -> Result<HashSet<CallId>> {
        let response = self
            .client
            .get(self.url("/channels"))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| CampaignError::telephony(format!("Channel listing failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(CampaignError::telephony(format!(
                "Channel listing returned {}",
                response.status()
            )));
        }

        let channels: Vec<ChannelSummary> = response
            .json()
            .await
            .map_err(|e| CampaignError::telephony(format!("Malformed channel listing: {}", e)))?;
        Ok(channels.into_iter().map(|c| CallId::new(c.id)).collect())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_change_events() {
        let ringing = r#"{"type":"ChannelStateChange","timestamp":"2025-03-01T10:00:00.000+0000",
            "channel":{"id":"call-1","state":"Ringing"}}"#;
        let event = parse_event(ringing).unwrap().unwrap();
        assert_eq!(event.call_id, CallId::from("call-1"));
        assert_eq!(event.kind, TelephonyEventKind::Proceeding);
        assert_eq!(event.timestamp.to_rfc3339(), "2025-03-01T10:00:00+00:00");

        let up = r#"{"type":"ChannelStateChange","channel":{"id":"call-1","state":"Up"}}"#;
        assert_eq!(parse_event(up).unwrap().unwrap().kind, TelephonyEventKind::Answered);

        let down = r#"{"type":"ChannelStateChange","channel":{"id":"call-1","state":"Down"}}"#;
        assert!(parse_event(down).unwrap().is_none());
    }

    #[test]
    fn test_dtmf_and_hangup_events() {
        let dtmf = r#"{"type":"ChannelDtmfReceived","digit":"9","channel":{"id":"call-2"}}"#;
        assert_eq!(
            parse_event(dtmf).unwrap().unwrap().kind,
            TelephonyEventKind::Dtmf { digit: '9' }
        );

        let busy = r#"{"type":"ChannelHangupRequest","cause":17,"channel":{"id":"call-2"}}"#;
        assert_eq!(
            parse_event(busy).unwrap().unwrap().kind,
            TelephonyEventKind::Hangup { cause: HangupCause::Busy }
        );
    }

    #[test]
    fn test_playback_targets_channel() {
        let playback = r#"{"type":"PlaybackStarted","playback":{"id":"pb","target_uri":"channel:call-3"}}"#;
        let event = parse_event(playback).unwrap().unwrap();
        assert_eq!(event.call_id, CallId::from("call-3"));
        assert_eq!(event.kind, TelephonyEventKind::AudioStarted);

        let bridge = r#"{"type":"PlaybackStarted","playback":{"id":"pb","target_uri":"bridge:b1"}}"#;
        assert!(parse_event(bridge).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frames_are_errors_not_panics() {
        assert!(parse_event("not json").is_err());
        assert!(parse_event(r#"{"type":"ChannelDtmfReceived","channel":{"id":"c"}}"#).is_err());
        assert!(parse_event(r#"{"type":"StasisStart"}"#).is_err());
        assert!(parse_event(r#"{"type":"BridgeCreated"}"#).unwrap().is_none());
    }

    #[test]
    fn test_rest_urls() {
        let adapter = AriAdapter::new(TelephonyConfig {
            base_url: "http://pbx:8088/".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(adapter.url("/channels"), "http://pbx:8088/ari/channels");
        assert!(!adapter.is_connected());
    }
}
