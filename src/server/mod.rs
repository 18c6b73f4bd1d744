//! Web server: call-boundary websockets, the listener stream, and the
//! provider webhooks.
//!
//! Everything a call needs is owned by [`AppState`] and passed into the
//! per-call tasks explicitly; the only process-wide registries are the
//! listener queues, the active-call controls, the knowledge cache, and the
//! sound cache.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::{Body, Bytes};
use axum::extract::ws::WebSocket;
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audio::SoundCache;
use crate::bridge::{BrowserBridge, CallControl, TelephonyBridge};
use crate::config::Config;
use crate::db::CallStore;
use crate::knowledge::{ChatClient, KnowledgeService};
use crate::listener::{ListenerMessage, ListenerRegistry, SubscribeError};
use crate::realtime::{self, SessionSettings};
use crate::storage::ObjectStore;
use crate::telephony::TelephonyClient;
use crate::tools::{CallContext, Dispatcher, TelephonyContext};
use crate::types::{
    AudioFormat, CallDirection, CallRecord, Termination, TerminationCause, ToolConfiguration,
};

type HmacSha256 = Hmac<Sha256>;

/// Shared server state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<CallStore>,
    pub storage: Arc<ObjectStore>,
    pub telephony: Arc<TelephonyClient>,
    pub knowledge: Arc<KnowledgeService>,
    pub listeners: ListenerRegistry,
    pub sounds: Arc<SoundCache>,
    active: Arc<Mutex<HashMap<Uuid, CallControl>>>,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Self> {
        let store = Arc::new(CallStore::new(&config.database.path).await?);
        let storage = Arc::new(ObjectStore::new(&config.storage));
        let sounds = Arc::new(SoundCache::load(&storage, &config.storage.sounds_prefix).await);
        let knowledge = Arc::new(KnowledgeService::new(
            store.clone() as Arc<dyn crate::knowledge::DocumentSource>,
            ChatClient::new(&config.realtime),
        ));
        let telephony = Arc::new(TelephonyClient::new(&config.telephony));
        Ok(Self {
            config: Arc::new(config),
            store,
            storage,
            telephony,
            knowledge,
            listeners: ListenerRegistry::new(),
            sounds,
            active: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn register_call(&self, call_id: Uuid, control: CallControl) {
        self.active.lock().await.insert(call_id, control);
    }

    async fn unregister_call(&self, call_id: Uuid) {
        self.active.lock().await.remove(&call_id);
    }

    async fn active_control(&self, call_id: Uuid) -> Option<CallControl> {
        self.active.lock().await.get(&call_id).cloned()
    }
}

/// Start the web server
pub async fn start(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    let state = AppState::new(config).await?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/v1/calls", post(create_call))
        .route("/api/v1/calls/{call_id}/media-stream", get(media_stream))
        .route("/api/v1/calls/{call_id}/browser-stream", get(browser_stream))
        .route("/api/v1/calls/{call_id}/listen", get(listen))
        .route("/api/v1/calls/{call_id}/hangup", post(hang_up_call))
        .route("/api/v1/calls/{call_id}/events", post(call_status_webhook))
        .route(
            "/api/v1/messages/{message_id}/status",
            post(message_status_webhook),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("Listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

// ─── Call creation ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateCallRequest {
    /// Counter-party number; required for telephony directions.
    #[serde(default)]
    phone_number: Option<String>,
    /// Sending number; defaults to the configured one.
    #[serde(default)]
    from_number: Option<String>,
    /// Provider call sid, supplied by the inbound webhook collaborator.
    #[serde(default)]
    call_sid: Option<String>,
    #[serde(default = "default_input_data")]
    input_data: Value,
    system_prompt: String,
    #[serde(default)]
    tool_configuration: ToolConfiguration,
    #[serde(default = "default_direction")]
    direction: CallDirection,
    #[serde(default)]
    audio_format: Option<AudioFormat>,
}

fn default_input_data() -> Value {
    Value::Object(Default::default())
}

fn default_direction() -> CallDirection {
    CallDirection::Outbound
}

#[derive(Debug, Serialize)]
struct CreateCallResponse {
    call_id: Uuid,
}

/// Create the call row (and, for outbound calls, dial the counter-party with
/// a media stream pointing back at this server). The listener queue is
/// provisioned here so a listener can attach before media flows.
async fn create_call(
    State(state): State<AppState>,
    Json(request): Json<CreateCallRequest>,
) -> Result<Json<CreateCallResponse>, (StatusCode, String)> {
    let call_id = Uuid::new_v4();
    let public_host = &state.config.server.public_host;

    let audio_format = request.audio_format.unwrap_or(match request.direction {
        CallDirection::Browser => AudioFormat::Pcm16,
        _ => AudioFormat::G711Ulaw,
    });

    let from_number = request
        .from_number
        .clone()
        .unwrap_or_else(|| state.config.telephony.from_number.clone());

    let (call_sid, from_number, to_number) = match request.direction {
        CallDirection::Outbound => {
            let to_number = request.phone_number.clone().ok_or((
                StatusCode::BAD_REQUEST,
                "phone_number is required for outbound calls".to_string(),
            ))?;
            let stream_url =
                format!("wss://{public_host}/api/v1/calls/{call_id}/media-stream");
            let status_callback =
                format!("https://{public_host}/api/v1/calls/{call_id}/events");
            let sid = state
                .telephony
                .start_call(&to_number, &from_number, &stream_url, &status_callback)
                .await
                .map_err(|e| {
                    error!("Failed to start outbound call: {e:#}");
                    (
                        StatusCode::BAD_GATEWAY,
                        "Failed to start outbound call".to_string(),
                    )
                })?;
            (Some(sid), from_number, to_number)
        }
        CallDirection::Inbound => {
            // The counter-party dialed us: they are the from side.
            let caller_number = request.phone_number.clone().ok_or((
                StatusCode::BAD_REQUEST,
                "phone_number is required for inbound calls".to_string(),
            ))?;
            (request.call_sid.clone(), caller_number, from_number)
        }
        CallDirection::Browser => (
            None,
            crate::types::BROWSER_NAME.to_string(),
            crate::types::BROWSER_NAME.to_string(),
        ),
    };

    let record = CallRecord {
        id: call_id,
        call_sid,
        direction: request.direction,
        from_number,
        to_number,
        input_data: request.input_data,
        system_prompt: request.system_prompt,
        audio_format,
        tool_configuration: request.tool_configuration,
        log_path: None,
        end_reason: None,
        created_at: Utc::now(),
    };
    state.store.insert_call(&record).await.map_err(|e| {
        error!("Failed to insert call: {e:#}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to record call".to_string(),
        )
    })?;

    state.listeners.ensure(call_id);
    Ok(Json(CreateCallResponse { call_id }))
}

// ─── Media websockets ────────────────────────────────────────

async fn media_stream(
    Path(call_id): Path<Uuid>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let record = load_call(&state, call_id).await?;
    if record.call_sid.is_none() {
        warn!(%call_id, "Media stream for a call without a provider sid");
        return Err(StatusCode::CONFLICT);
    }
    Ok(ws.on_upgrade(move |socket| run_telephony_call(state, record, socket)))
}

async fn browser_stream(
    Path(call_id): Path<Uuid>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    let record = load_call(&state, call_id).await?;
    Ok(ws.on_upgrade(move |socket| run_browser_call(state, record, socket)))
}

async fn load_call(state: &AppState, call_id: Uuid) -> Result<CallRecord, StatusCode> {
    match state.store.get_call(call_id).await {
        Ok(Some(record)) => Ok(record),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!("Failed to load call {call_id}: {e:#}");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn run_telephony_call(state: AppState, record: CallRecord, ws: WebSocket) {
    let Some(call_sid) = record.call_sid.clone() else {
        return;
    };
    let Some((session, events, control)) = open_session(&state, &record).await else {
        return;
    };
    let dispatcher = Dispatcher::new(
        session.clone(),
        control.clone(),
        state.knowledge.clone(),
        state.store.clone(),
        Some(TelephonyContext {
            client: state.telephony.clone(),
            call_sid: call_sid.clone(),
        }),
        call_context(&state, &record),
    );
    TelephonyBridge {
        session,
        events,
        control,
        dispatcher,
        telephony: state.telephony.clone(),
        call_sid,
    }
    .run(ws)
    .await;
    state.unregister_call(record.id).await;
    state.listeners.remove(record.id);
}

async fn run_browser_call(state: AppState, record: CallRecord, ws: WebSocket) {
    let Some((session, events, control)) = open_session(&state, &record).await else {
        return;
    };
    let dispatcher = Dispatcher::new(
        session.clone(),
        control.clone(),
        state.knowledge.clone(),
        state.store.clone(),
        None,
        call_context(&state, &record),
    );
    BrowserBridge {
        session,
        events,
        control,
        dispatcher,
        sounds: state.sounds.clone(),
    }
    .run(ws)
    .await;
    state.unregister_call(record.id).await;
    state.listeners.remove(record.id);
}

async fn open_session(
    state: &AppState,
    record: &CallRecord,
) -> Option<(
    realtime::SessionHandle,
    tokio::sync::mpsc::Receiver<realtime::SessionEvent>,
    CallControl,
)> {
    let queue = state.listeners.ensure(record.id);
    // The assistant speaks first on inbound and browser calls; outbound
    // callers answered the phone and are expected to talk.
    let start_speaking_buffer_ms = (record.direction != CallDirection::Outbound)
        .then_some(state.config.calls.start_speaking_buffer_ms);
    let settings = SessionSettings {
        call_id: record.id,
        direction: record.direction,
        audio_format: record.audio_format,
        system_prompt: record.system_prompt.clone(),
        input_data: record.input_data.clone(),
        tool_configuration: record.tool_configuration.clone(),
        start_speaking_buffer_ms,
        log_dir: state.config.calls.log_dir.clone(),
    };
    match realtime::connect(
        &state.config.realtime,
        settings,
        queue,
        state.storage.clone(),
        state.store.clone(),
    )
    .await
    {
        Ok((session, events)) => {
            let control = CallControl::new();
            state.register_call(record.id, control.clone()).await;
            Some((session, events, control))
        }
        Err(e) => {
            error!(call_id = %record.id, "Failed to open realtime session: {e:#}");
            None
        }
    }
}

fn call_context(state: &AppState, record: &CallRecord) -> CallContext {
    CallContext {
        call_id: record.id,
        direction: record.direction,
        from_number: record.from_number.clone(),
        to_number: record.to_number.clone(),
        tool_configuration: record.tool_configuration.clone(),
        public_host: state.config.server.public_host.clone(),
    }
}

// ─── Listener stream ─────────────────────────────────────────

/// Attach the single allowed listener and stream newline-delimited JSON
/// until the `call_end` sentinel.
async fn listen(Path(call_id): Path<Uuid>, State(state): State<AppState>) -> Response {
    match state.listeners.subscribe(call_id) {
        Ok(subscription) => {
            info!(%call_id, "Listener attached");
            let stream = futures_util::stream::unfold(Some(subscription), |sub| async move {
                let sub = sub?;
                let message = sub.next().await;
                let line = message.to_ndjson();
                let done = matches!(message, ListenerMessage::CallEnd);
                Some((
                    Ok::<_, std::convert::Infallible>(line),
                    (!done).then_some(sub),
                ))
            });
            Response::builder()
                .header("content-type", "application/x-ndjson")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(SubscribeError::NotFound) => {
            (StatusCode::NOT_FOUND, "Phone call not found").into_response()
        }
        Err(SubscribeError::Busy) => {
            (StatusCode::CONFLICT, "Call already has a listener").into_response()
        }
    }
}

// ─── Listener hang-up ────────────────────────────────────────

async fn hang_up_call(
    Path(call_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, (StatusCode, String)> {
    let record = load_call(&state, call_id)
        .await
        .map_err(|code| (code, "Phone call not found".to_string()))?;
    if record.end_reason.is_some() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Phone call already ended".to_string(),
        ));
    }
    if let Some(control) = state.active_control(call_id).await {
        control
            .request_termination(Termination::new(TerminationCause::ListenerHangup))
            .await;
    }
    if let Some(call_sid) = &record.call_sid {
        if let Err(e) = state.telephony.hang_up(call_sid).await {
            warn!(%call_id, "Provider hang up failed: {e:#}");
        }
    }
    // Release a listener even if the media stream never connected.
    if let Some(queue) = state.listeners.get(call_id) {
        queue.push_call_end();
    }
    Ok(StatusCode::NO_CONTENT)
}

// ─── Provider webhooks ───────────────────────────────────────

/// Provider status callback; closes the loop for outbound telephony calls,
/// whose termination deliberately writes no local call event.
async fn call_status_webhook(
    Path(call_id): Path<Uuid>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    verify_webhook_signature(&state, &headers, &body)?;

    let fields: HashMap<String, String> = url::form_urlencoded::parse(&body)
        .into_owned()
        .collect();
    let status = fields
        .get("CallStatus")
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    let duration = fields.get("CallDuration").and_then(|d| d.parse().ok());
    let sequence = fields
        .get("SequenceNumber")
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);

    state
        .store
        .insert_call_event(call_id, &status, duration, sequence)
        .await
        .map_err(|e| {
            error!("Failed to record call event: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to record event".to_string(),
            )
        })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn message_status_webhook(
    Path(message_id): Path<Uuid>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    verify_webhook_signature(&state, &headers, &body)?;
    let fields: HashMap<String, String> = url::form_urlencoded::parse(&body)
        .into_owned()
        .collect();
    info!(
        %message_id,
        status = fields.get("MessageStatus").map(String::as_str).unwrap_or("unknown"),
        "Text message status update"
    );
    Ok(StatusCode::NO_CONTENT)
}

fn verify_webhook_signature(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), (StatusCode, String)> {
    let Some(secret) = &state.config.telephony.webhook_secret else {
        return Ok(());
    };
    let provided = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or((
            StatusCode::FORBIDDEN,
            "Missing webhook signature".to_string(),
        ))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| (StatusCode::FORBIDDEN, "Invalid webhook secret".to_string()))?;
    mac.update(body);
    let expected = hex::encode(mac.finalize().into_bytes());
    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return Err((
            StatusCode::FORBIDDEN,
            "Invalid webhook signature".to_string(),
        ));
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_create_call_request_defaults() {
        let request: CreateCallRequest = serde_json::from_str(
            r#"{"system_prompt": "You are a helpful agent."}"#,
        )
        .unwrap();
        assert_eq!(request.direction, CallDirection::Outbound);
        assert!(request.phone_number.is_none());
        assert!(request.input_data.is_object());
        assert!(request.tool_configuration.hang_up);
    }

    #[test]
    fn test_webhook_field_parsing() {
        let body = b"CallStatus=completed&CallDuration=42&SequenceNumber=3";
        let fields: HashMap<String, String> =
            url::form_urlencoded::parse(body).into_owned().collect();
        assert_eq!(fields["CallStatus"], "completed");
        assert_eq!(fields["CallDuration"], "42");
    }
}
