//! Request handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{ApiError, ApiResult, AppState};
use crate::intake::{parse_batch, BatchResponse, QueueBatch, QueueStats};
use crate::orchestrator::{ControlRequest, ControlResponse, ExecutionState};
use crate::resource::Utilization;
use crate::telephony::{HangupCause, TelephonyEvent, TelephonyEventKind};
use crate::types::{AdmissionClass, CallId, CampaignId};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: i64,
    pub active_calls: usize,
    pub adapter_connected: bool,
    pub utilization: Vec<Utilization>,
    pub running_executions: usize,
    pub voice_queue: QueueStats,
}

pub async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    let now = Utc::now();
    let mut utilization = Vec::with_capacity(AdmissionClass::ALL.len());
    for class in AdmissionClass::ALL {
        utilization.push(state.orchestrator.utilization(class, now).await?);
    }

    let (active_calls, adapter_connected) = match &state.engine {
        Some(engine) => {
            let stats = engine.stats();
            (stats.live_calls, stats.adapter_connected)
        }
        None => (0, false),
    };

    let running_executions = state
        .orchestrator
        .executions()
        .iter()
        .filter(|e| e.state == ExecutionState::Running)
        .count();

    Ok(Json(HealthResponse {
        status: if adapter_connected { "healthy" } else { "degraded" }.to_string(),
        version: state.version.clone(),
        uptime_secs: (now - state.started_at).num_seconds(),
        active_calls,
        adapter_connected,
        utilization,
        running_executions,
        voice_queue: state.voice_queue.stats(),
    }))
}

/// Accepted requests answer 200; quota denials 429; other rejections 409.
/// The body is always the control response.
pub async fn control(
    State(state): State<AppState>,
    Json(request): Json<ControlRequest>,
) -> (StatusCode, Json<ControlResponse>) {
    let response = state.orchestrator.handle(request, Utc::now()).await;
    let status = if response.success {
        StatusCode::OK
    } else if response.retryable {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::CONFLICT
    };
    (status, Json(response))
}

/// Each task goes to the queue partition of its campaign's type. Tasks of
/// campaigns the directory does not know are reported as failures.
pub async fn ingest_tasks(
    State(state): State<AppState>,
    Json(batch): Json<QueueBatch>,
) -> ApiResult<Json<BatchResponse>> {
    let now = Utc::now();
    let received = batch.records.len();
    let mut parsed = parse_batch(batch, now);
    let tasks = std::mem::take(&mut parsed.tasks);

    let mut classes: HashMap<CampaignId, Option<AdmissionClass>> = HashMap::new();
    let (mut voice, mut sms) = (0usize, 0usize);
    for (message_id, task) in tasks {
        let class = match classes.get(&task.campaign_id) {
            Some(class) => *class,
            None => {
                let campaign_type = state.orchestrator.directory().campaign_type(&task.campaign_id).await?;
                let class = campaign_type.map(|t| t.admission_class());
                classes.insert(task.campaign_id.clone(), class);
                class
            }
        };

        let queue = match class {
            Some(AdmissionClass::Voice) => {
                voice += 1;
                &state.voice_queue
            }
            Some(AdmissionClass::Sms) => {
                sms += 1;
                &state.sms_queue
            }
            None => {
                warn!(message_id = %message_id, campaign_id = %task.campaign_id, "Task for unknown campaign");
                parsed.reject(message_id);
                continue;
            }
        };
        if !queue.enqueue(task, now) {
            debug!(message_id = %message_id, "Duplicate delivery of known task");
        }
    }

    info!(
        received,
        voice,
        sms,
        failed = parsed.failures.batch_item_failures.len(),
        "Ingested dial task batch"
    );
    Ok(Json(parsed.failures))
}

/// Body shared by every dialplan callback; fields beyond `callId` depend on the callback
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialplanCallback {
    pub call_id: String,
    #[serde(default, alias = "dtmf")]
    pub digit: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// Q.850 code or textual cause
    #[serde(default)]
    pub cause: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAccepted {
    pub call_id: CallId,
    pub event: &'static str,
}

pub async fn dialplan(
    State(state): State<AppState>,
    Path(callback): Path<String>,
    Json(body): Json<DialplanCallback>,
) -> ApiResult<(StatusCode, Json<CallbackAccepted>)> {
    let engine = state
        .engine
        .as_ref()
        .ok_or_else(|| ApiError::Unavailable("No call engine on this instance".into()))?;

    let event = callback_event(&callback, body)?;
    debug!(call_id = %event.call_id, callback = %callback, "Dialplan callback");
    let accepted = CallbackAccepted {
        call_id: event.call_id.clone(),
        event: event.kind.name(),
    };
    engine.submit(event).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Translate a dialplan callback into the engine's event vocabulary
pub fn callback_event(callback: &str, body: DialplanCallback) -> ApiResult<TelephonyEvent> {
    if body.call_id.trim().is_empty() {
        return Err(ApiError::BadRequest("callId cannot be empty".into()));
    }

    let kind = match callback {
        "call-started" => TelephonyEventKind::AudioStarted,
        "dtmf-action" => {
            let digit = parse_digit(body.digit.as_deref())?;
            TelephonyEventKind::Dtmf { digit }
        }
        "call-timeout" => TelephonyEventKind::IvrTimeout,
        "call-failed" => TelephonyEventKind::Failed {
            reason: body.reason.clone().unwrap_or_else(|| "failed".to_string()),
        },
        "call-ended" => TelephonyEventKind::Hangup {
            cause: parse_cause(body.cause.as_ref()),
        },
        other => return Err(ApiError::NotFound(format!("Unknown dialplan callback: {}", other))),
    };

    Ok(TelephonyEvent::new(
        CallId(body.call_id),
        kind,
        body.timestamp.unwrap_or_else(Utc::now),
    ))
}

fn parse_digit(digit: Option<&str>) -> ApiResult<char> {
    let digit = digit.ok_or_else(|| ApiError::BadRequest("dtmf-action requires a digit".into()))?;
    let mut chars = digit.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if c.is_ascii_digit() || c == '*' || c == '#' => Ok(c),
        _ => Err(ApiError::BadRequest(format!("Invalid DTMF digit: {:?}", digit))),
    }
}

fn parse_cause(cause: Option<&Value>) -> HangupCause {
    match cause {
        Some(Value::Number(n)) => n.as_i64().map(HangupCause::from_q850).unwrap_or(HangupCause::Other),
        Some(Value::String(s)) => match s.trim().parse::<i64>() {
            Ok(code) => HangupCause::from_q850(code),
            Err(_) => HangupCause::from_text(s),
        },
        _ => HangupCause::Normal,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::api::create_router;
    use crate::calls::CallEngine;
    use crate::config::{CallConfig, IntakeConfig, ResourceConfig};
    use crate::intake::{LeaseGate, TaskQueue};
    use crate::notify::BroadcastPublisher;
    use crate::orchestrator::{CampaignOrchestrator, InMemoryDirectory, SmsQueueDispatcher};
    use crate::resource::ResourcePool;
    use crate::store::MemoryStore;
    use crate::telephony::simulated::simulated_pair;
    use crate::types::CampaignType;

    fn body(json: Value) -> DialplanCallback {
        serde_json::from_value(json).unwrap()
    }

    fn state(voice_quota: u32, with_engine: bool) -> (AppState, Arc<InMemoryDirectory>) {
        let store = Arc::new(MemoryStore::new());
        let resources = ResourceConfig {
            voice_quota,
            ..Default::default()
        };
        let pool = Arc::new(ResourcePool::new(store.clone(), resources, "api-test"));
        let directory = Arc::new(InMemoryDirectory::new());
        let voice_queue = Arc::new(TaskQueue::new(AdmissionClass::Voice, &IntakeConfig::default()));
        let sms_queue = Arc::new(TaskQueue::new(AdmissionClass::Sms, &IntakeConfig::default()));
        let gate = Arc::new(LeaseGate::new());
        let publisher = Arc::new(BroadcastPublisher::new(16));

        let engine = if with_engine {
            let (adapter, rx) = simulated_pair(64);
            let tx = adapter.sender();
            let engine = CallEngine::new(
                CallConfig::default(),
                &IntakeConfig::default(),
                voice_queue.clone(),
                gate.clone(),
                adapter,
                publisher.clone(),
                store,
            );
            Some(engine.spawn(rx, tx).0)
        } else {
            None
        };

        let orchestrator = CampaignOrchestrator::new(
            pool,
            directory.clone(),
            voice_queue.clone(),
            gate,
            Arc::new(SmsQueueDispatcher::new(sms_queue.clone()).unwrap()),
            publisher,
        );
        (AppState::new(orchestrator, voice_queue, sms_queue, engine), directory)
    }

    async fn post(router: axum::Router, uri: &str, json: Value) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(json.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[test]
    fn test_callback_translation() {
        let event = callback_event("dtmf-action", body(serde_json::json!({"callId": "c1", "digit": "1"}))).unwrap();
        assert_eq!(event.kind, TelephonyEventKind::Dtmf { digit: '1' });

        let event = callback_event("call-ended", body(serde_json::json!({"callId": "c1", "cause": 17}))).unwrap();
        assert_eq!(event.kind, TelephonyEventKind::Hangup { cause: HangupCause::Busy });

        let event = callback_event("call-ended", body(serde_json::json!({"callId": "c1", "cause": "no-answer"}))).unwrap();
        assert_eq!(event.kind, TelephonyEventKind::Hangup { cause: HangupCause::NoAnswer });

        let event = callback_event("call-started", body(serde_json::json!({"callId": "c1"}))).unwrap();
        assert_eq!(event.kind, TelephonyEventKind::AudioStarted);

        let event = callback_event("call-timeout", body(serde_json::json!({"callId": "c1"}))).unwrap();
        assert_eq!(event.kind, TelephonyEventKind::IvrTimeout);

        assert!(matches!(
            callback_event("dtmf-action", body(serde_json::json!({"callId": "c1", "digit": "12"}))),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            callback_event("call-transferred", body(serde_json::json!({"callId": "c1"}))),
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_control_quota_denial_is_429() {
        let (state, directory) = state(1, false);
        directory.register("A", CampaignType::Voice);
        directory.register("B", CampaignType::Voice);
        let router = create_router(state);

        let (status, body) = post(
            router.clone(),
            "/campaigns/control",
            serde_json::json!({"campaignId": "A", "action": "start"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["campaignType"], "voice");

        let (status, body) = post(
            router,
            "/campaigns/control",
            serde_json::json!({"campaignId": "B", "action": "start"}),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["message"], "Resource exhausted: 1/1 voice slots in use");
    }

    fn task_body(task_id: &str, campaign_id: &str) -> String {
        serde_json::json!({
            "taskId": task_id, "campaignId": campaign_id, "contactId": format!("k-{}", task_id),
            "phoneNumber": "+15550100", "audioRef": "a", "ivrFlow": "donation"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_batch_reports_bad_messages() {
        let (state, directory) = state(1, false);
        directory.register("A", CampaignType::Voice);
        let queue = state.voice_queue.clone();
        let (status, body) = post(
            create_router(state),
            "/tasks/batch",
            serde_json::json!({"records": [
                {"messageId": "m1", "body": task_body("t1", "A")},
                {"messageId": "m2", "body": "{broken"}
            ]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["batchItemFailures"], serde_json::json!([{"itemIdentifier": "m2"}]));
        assert_eq!(queue.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_batch_routes_tasks_by_campaign_type() {
        let (state, directory) = state(1, false);
        directory.register("calls", CampaignType::Hybrid);
        directory.register("texts", CampaignType::Sms);
        let (voice_queue, sms_queue) = (state.voice_queue.clone(), state.sms_queue.clone());

        let (status, body) = post(
            create_router(state),
            "/tasks/batch",
            serde_json::json!({"records": [
                {"messageId": "m1", "body": task_body("t1", "calls")},
                {"messageId": "m2", "body": task_body("t2", "texts")},
                {"messageId": "m3", "body": task_body("t3", "texts")},
                {"messageId": "m4", "body": task_body("t4", "nobody")}
            ]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["batchItemFailures"], serde_json::json!([{"itemIdentifier": "m4"}]));
        assert_eq!(voice_queue.outstanding(&"calls".into()), 1);
        assert_eq!(voice_queue.outstanding(&"texts".into()), 0);
        assert_eq!(sms_queue.outstanding(&"texts".into()), 2);
        assert_eq!(sms_queue.stats().pending, 2);
    }

    #[tokio::test]
    async fn test_dialplan_requires_engine() {
        let (state, _) = state(1, false);
        let (status, body) = post(
            create_router(state),
            "/dialplan/call-started",
            serde_json::json!({"callId": "c1"}),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_dialplan_callback_reaches_engine() {
        let (state, _) = state(1, true);
        let (status, body) = post(
            create_router(state),
            "/dialplan/dtmf-action",
            serde_json::json!({"callId": "c1", "digit": "9"}),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["event"], "dtmf");
        assert_eq!(body["callId"], "c1");
    }

    #[tokio::test]
    async fn test_health_reports_utilization() {
        let (state, directory) = state(2, false);
        directory.register("A", CampaignType::Hybrid);
        state.orchestrator.start(&"A".into(), Utc::now()).await;

        let response = create_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["runningExecutions"], 1);
        assert_eq!(body["utilization"][0]["class"], "voice");
        assert_eq!(body["utilization"][0]["active"], 1);
        assert_eq!(body["utilization"][0]["quota"], 2);
    }
}
