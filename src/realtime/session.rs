//! The realtime model session actor.
//!
//! One task per call owns the upstream websocket, the call state, and the
//! session log. The bridge talks to it through a command channel and
//! consumes a typed event stream; termination runs here exactly once.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RealtimeConfig;
use crate::db::CallStore;
use crate::listener::ListenerQueue;
use crate::realtime::events::{
    ClientEvent, ConversationItem, ModelEvent, SessionConfiguration, ToolInvocation,
    TurnDetection,
};
use crate::realtime::log::SessionLog;
use crate::realtime::state::{CallState, UplinkAudio};
use crate::storage::{self, ObjectStore};
use crate::tools;
use crate::types::{AudioFormat, CallDirection, Speaker, SpeakerSegment, TerminationCause};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Everything needed to open a session for one call.
pub struct SessionSettings {
    pub call_id: Uuid,
    pub direction: CallDirection,
    pub audio_format: AudioFormat,
    pub system_prompt: String,
    pub input_data: Value,
    pub tool_configuration: crate::types::ToolConfiguration,
    /// Assistant-speaks-first window; `None` disables the kickoff.
    pub start_speaking_buffer_ms: Option<u64>,
    pub log_dir: PathBuf,
}

/// Events the bridge consumes, already enriched by the session state.
#[derive(Debug)]
pub enum SessionEvent {
    AudioDelta {
        item_id: String,
        payload: String,
        audio_ms: u64,
    },
    SpeechStarted,
    FunctionCall(ToolInvocation),
    TranscriptUpdate {
        segments: Vec<SpeakerSegment>,
    },
    Closed,
}

enum Command {
    Audio(String),
    Truncate {
        item_id: String,
        audio_end_ms: u64,
    },
    ToolResult {
        previous_item_id: String,
        call_id: String,
        output: String,
    },
    Close {
        cause: TerminationCause,
        reply: oneshot::Sender<(Uuid, u64)>,
    },
}

/// Cheap handle to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    call_id: Uuid,
    cmd_tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Forward one base64 uplink frame to the model.
    pub async fn send_audio(&self, frame_b64: String) -> Result<()> {
        self.send(Command::Audio(frame_b64)).await
    }

    /// Tell the model how much of the current assistant item was heard.
    pub async fn send_truncate(&self, item_id: String, audio_end_ms: u64) -> Result<()> {
        self.send(Command::Truncate {
            item_id,
            audio_end_ms,
        })
        .await
    }

    /// Return a tool result and prompt the model to continue.
    pub async fn send_tool_result(
        &self,
        previous_item_id: String,
        call_id: String,
        output: String,
    ) -> Result<()> {
        self.send(Command::ToolResult {
            previous_item_id,
            call_id,
            output,
        })
        .await
    }

    /// Run the termination routine; idempotent. Returns the call id and the
    /// total played milliseconds as observed by the first caller.
    pub async fn close(&self, cause: TerminationCause) -> Result<(Uuid, u64)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Close {
            cause,
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| anyhow!("session task is gone"))
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| anyhow!("session task is gone"))
    }
}

/// Connect to the realtime endpoint, send `session.update`, and spawn the
/// session task. Returns the command handle and the bridge event stream.
pub async fn connect(
    realtime: &RealtimeConfig,
    settings: SessionSettings,
    listener: Arc<ListenerQueue>,
    object_store: Arc<ObjectStore>,
    store: Arc<CallStore>,
) -> Result<(SessionHandle, mpsc::Receiver<SessionEvent>)> {
    let url = format!("{}?model={}", realtime.url, realtime.model);
    let mut request = url
        .into_client_request()
        .context("Failed to build realtime websocket request")?;
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", realtime.api_key)
            .parse()
            .context("Invalid realtime bearer token")?,
    );
    request.headers_mut().insert(
        "OpenAI-Beta",
        "realtime=v1".parse().expect("static header value"),
    );

    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .context("Failed to connect to the realtime model")?;
    let (ws_tx, ws_rx) = ws.split();

    let session_config = SessionConfiguration::new(
        &settings.system_prompt,
        &settings.input_data,
        settings.audio_format,
        realtime.voice.clone(),
        realtime.transcription_model.clone(),
        tools::agent_tools(&settings.tool_configuration),
    );

    let log_path = settings.log_dir.join(format!("{}.log", settings.call_id));
    let log = SessionLog::open(log_path);
    info!(call_id = %settings.call_id, "Initialized realtime session, logging to {}", log.path().display());

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(256);

    let actor = SessionActor {
        call_id: settings.call_id,
        direction: settings.direction,
        format: settings.audio_format,
        ws_tx,
        ws_open: true,
        state: CallState::new(
            settings.audio_format,
            TurnDetection::default().prefix_padding_ms,
        ),
        listener,
        log,
        object_store,
        store,
        event_tx,
        event_rx_gone: false,
        kickoff_ms: settings.start_speaking_buffer_ms,
        kickoff_deadline: None,
        pending_config: Some(session_config),
        closed: None,
    };
    tokio::spawn(run(actor, ws_rx, cmd_rx));

    Ok((
        SessionHandle {
            call_id: settings.call_id,
            cmd_tx,
        },
        event_rx,
    ))
}

struct SessionActor {
    call_id: Uuid,
    direction: CallDirection,
    format: AudioFormat,
    ws_tx: WsSink,
    ws_open: bool,
    state: CallState,
    listener: Arc<ListenerQueue>,
    log: SessionLog,
    object_store: Arc<ObjectStore>,
    store: Arc<CallStore>,
    event_tx: mpsc::Sender<SessionEvent>,
    event_rx_gone: bool,
    kickoff_ms: Option<u64>,
    kickoff_deadline: Option<Instant>,
    pending_config: Option<SessionConfiguration>,
    closed: Option<(Uuid, u64)>,
}

async fn run(mut actor: SessionActor, mut ws_rx: WsStream, mut cmd_rx: mpsc::Receiver<Command>) {
    if let Some(session) = actor.pending_config.take() {
        actor.send_event(ClientEvent::SessionUpdate { session }).await;
    }

    loop {
        let kickoff_at = actor.kickoff_deadline;
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => actor.handle_command(cmd).await,
                None => break,
            },
            msg = ws_rx.next(), if actor.ws_open => actor.handle_ws_message(msg).await,
            _ = async move { tokio::time::sleep_until(kickoff_at.unwrap()).await },
                if kickoff_at.is_some() => actor.fire_kickoff().await,
        }
    }

    // All handles dropped without an explicit close (a bridge task died
    // without running its finish path): terminate with cause unknown.
    if actor.closed.is_none() {
        warn!(call_id = %actor.call_id, "Session dropped without close, terminating");
        actor.close(TerminationCause::Unknown).await;
    }
}

impl SessionActor {
    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Audio(frame) => {
                self.send_event(ClientEvent::InputAudioAppend {
                    audio: frame.clone(),
                })
                .await;
                match self.state.on_human_audio(&frame) {
                    UplinkAudio::Live => self.listener.push_audio(frame, self.format),
                    UplinkAudio::Buffered => {}
                }
            }
            Command::Truncate {
                item_id,
                audio_end_ms,
            } => {
                self.send_event(ClientEvent::ItemTruncate {
                    item_id,
                    content_index: 0,
                    audio_end_ms,
                })
                .await;
            }
            Command::ToolResult {
                previous_item_id,
                call_id,
                output,
            } => {
                self.send_event(ClientEvent::ItemCreate {
                    previous_item_id: Some(previous_item_id),
                    item: ConversationItem::FunctionCallOutput { call_id, output },
                })
                .await;
                self.send_event(ClientEvent::ResponseCreate).await;
            }
            Command::Close { cause, reply } => {
                let result = self.close(cause).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_ws_message(
        &mut self,
        msg: Option<Result<Message, tokio_tungstenite::tungstenite::Error>>,
    ) {
        match msg {
            Some(Ok(Message::Text(text))) => self.handle_model_message(text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => self.on_upstream_closed("closed").await,
            Some(Ok(_)) => {}
            Some(Err(e)) => self.on_upstream_closed(&e.to_string()).await,
        }
    }

    async fn on_upstream_closed(&mut self, reason: &str) {
        info!(call_id = %self.call_id, "Connection to model closed ({reason})");
        self.ws_open = false;
        self.emit(SessionEvent::Closed).await;
    }

    async fn handle_model_message(&mut self, text: &str) {
        self.log.record(text);

        let event: ModelEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("Malformed model event: {e}");
                return;
            }
        };

        match event {
            ModelEvent::SpeechStarted {
                item_id,
                audio_start_ms,
            } => {
                self.disarm_kickoff();
                let flushed = self.state.on_speech_started(&item_id, audio_start_ms);
                self.listener.push_speaker(self.state.segments());
                for frame in flushed {
                    self.listener.push_audio(frame, self.format);
                }
                self.emit(SessionEvent::SpeechStarted).await;
            }
            ModelEvent::SpeechStopped => {
                self.state.on_speech_stopped();
                self.listener.push_speaker(self.state.segments());
            }
            ModelEvent::AudioDelta { item_id, delta } => {
                self.disarm_kickoff();
                let audio_ms = self.state.on_audio_delta(&item_id, &delta);
                self.listener.push_audio(delta.clone(), self.format);
                self.emit(SessionEvent::AudioDelta {
                    item_id,
                    payload: delta,
                    audio_ms,
                })
                .await;
            }
            ModelEvent::InputTranscriptionCompleted {
                item_id,
                transcript,
            } => {
                self.state
                    .apply_transcript(Speaker::User, &item_id, &transcript);
                let segments = self.state.segments();
                self.listener.push_speaker(segments.clone());
                self.emit(SessionEvent::TranscriptUpdate { segments }).await;
            }
            ModelEvent::AudioTranscriptDone {
                item_id,
                transcript,
            } => {
                self.state
                    .apply_transcript(Speaker::Assistant, &item_id, &transcript);
                let segments = self.state.segments();
                self.listener.push_speaker(segments.clone());
                self.emit(SessionEvent::TranscriptUpdate { segments }).await;
            }
            ModelEvent::FunctionCallArgumentsDone {
                name,
                arguments,
                call_id,
                item_id,
            } => {
                self.emit(SessionEvent::FunctionCall(ToolInvocation {
                    name,
                    arguments,
                    call_id,
                    item_id,
                }))
                .await;
            }
            ModelEvent::SessionUpdated => {
                if let Some(ms) = self.kickoff_ms {
                    self.kickoff_deadline = Some(Instant::now() + Duration::from_millis(ms));
                }
            }
            ModelEvent::ResponseDone { response } => {
                if response.get("status").and_then(Value::as_str) == Some("failed") {
                    warn!("Model response failed: {response}");
                }
            }
            ModelEvent::Error { error } => warn!("Model error event: {error}"),
            ModelEvent::Other => debug!("Unhandled model event"),
        }
    }

    /// Someone is speaking; the assistant no longer needs to go first.
    fn disarm_kickoff(&mut self) {
        self.kickoff_ms = None;
        self.kickoff_deadline = None;
    }

    async fn fire_kickoff(&mut self) {
        self.kickoff_deadline = None;
        if self.kickoff_ms.take().is_some() {
            info!(call_id = %self.call_id, "Kickoff: prompting the model to speak first");
            self.send_event(ClientEvent::ResponseCreate).await;
        }
    }

    async fn emit(&mut self, event: SessionEvent) {
        if self.event_rx_gone {
            return;
        }
        if self.event_tx.send(event).await.is_err() {
            self.event_rx_gone = true;
        }
    }

    async fn send_event(&mut self, event: ClientEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize client event: {e}");
                return;
            }
        };
        self.log.record(&payload);
        if !self.ws_open {
            return;
        }
        if let Err(e) = self.ws_tx.send(Message::text(payload)).await {
            warn!("Error sending to model: {e}");
        }
    }

    /// The termination routine. Idempotent; the first entrant's result is
    /// cached and returned to every later caller.
    async fn close(&mut self, cause: TerminationCause) -> (Uuid, u64) {
        if let Some(result) = self.closed {
            info!(call_id = %self.call_id, "Cleanup already started");
            return result;
        }
        let result = (self.call_id, self.state.total_ms());
        self.closed = Some(result);
        self.disarm_kickoff();
        info!(call_id = %self.call_id, cause = cause.as_str(), "Terminating call");

        // Close the model connection and release the peer loop, which may
        // still be waiting on the event stream.
        if self.ws_open {
            let _ = self.ws_tx.close().await;
            self.ws_open = false;
        }
        self.emit(SessionEvent::Closed).await;

        // Release the listener.
        self.listener.push_call_end();

        // Gather pending log writes (bounded).
        self.log.flush(Duration::from_secs(5)).await;

        // Archive the session log.
        let object_path = format!("logs/{}.zip", self.call_id);
        let stored_path = match self.archive_log(&object_path).await {
            Ok(()) => Some(object_path),
            Err(e) => {
                error!("Failed to archive session log: {e:#}");
                None
            }
        };

        // Record the end reason; this must land even when archiving failed.
        if let Err(e) = self
            .store
            .record_call_end(self.call_id, stored_path.as_deref(), cause)
            .await
        {
            error!("Failed to record call end: {e:#}");
        }
        // Outbound telephony calls get their completed event from the
        // provider status callback instead.
        if self.direction != CallDirection::Outbound {
            if let Err(e) = self
                .store
                .insert_call_event(self.call_id, "completed", Some(result.1 / 1000), 1)
                .await
            {
                error!("Failed to record call event: {e:#}");
            }
        }

        // Remove the local log file.
        if let Err(e) = tokio::fs::remove_file(self.log.path()).await {
            warn!(
                "Failed to remove session log {}: {e}",
                self.log.path().display()
            );
        }

        info!(call_id = %self.call_id, total_ms = result.1, "Cleanup complete");
        result
    }

    async fn archive_log(&self, object_path: &str) -> Result<()> {
        let data = tokio::fs::read(self.log.path())
            .await
            .context("Failed to read session log")?;
        let archive = storage::zip_archive(&format!("{}.log", self.call_id), &data)?;
        self.object_store
            .upload(object_path, archive, "application/zip")
            .await
    }
}
