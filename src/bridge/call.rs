//! Telephony media-stream bridge.
//!
//! Frames follow the provider's media-stream envelope: base64 μ-law payloads
//! under `media.payload`, a `start` event carrying the stream sid, and
//! round-trip `mark` acknowledgments that drive the truncation bookkeeping.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{
    finalize, now_ms, send_loop, send_truncation, CallControl, OutFrame, UplinkExit,
};
use crate::realtime::{SessionEvent, SessionHandle};
use crate::telephony::TelephonyClient;
use crate::tools::{Dispatcher, ToolAction};
use crate::types::{Termination, TerminationCause};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum InboundFrame {
    Media { media: MediaPayload },
    Start { start: StartPayload },
    Mark,
    Stop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    payload: String,
}

#[derive(Debug, Deserialize)]
struct StartPayload {
    #[serde(rename = "streamSid")]
    stream_sid: String,
}

pub struct TelephonyBridge {
    pub session: SessionHandle,
    pub events: mpsc::Receiver<SessionEvent>,
    pub control: CallControl,
    pub dispatcher: Dispatcher,
    pub telephony: Arc<TelephonyClient>,
    pub call_sid: String,
}

impl TelephonyBridge {
    /// Drive both loops until the call ends, then apply the provider-side
    /// follow-up (hang up, or dial the transfer target instead).
    pub async fn run(self, ws: WebSocket) {
        let TelephonyBridge {
            session,
            events,
            control,
            dispatcher,
            telephony,
            call_sid,
        } = self;

        let (ws_tx, ws_rx) = ws.split();
        let (out_tx, out_rx) = mpsc::channel::<OutFrame>(64);
        let sender = tokio::spawn(send_loop(ws_tx, out_rx));

        let uplink = async {
            let exit = uplink_loop(ws_rx, &session, &control).await;
            if exit == UplinkExit::StreamClosed {
                control
                    .request_termination(Termination::new(TerminationCause::UserHangup))
                    .await;
                send_truncation(&control, &session).await;
            }
            complete(&control, &session, &telephony, &call_sid, &out_tx).await;
        };

        let downlink = async {
            let mut events = events;
            downlink_loop(&mut events, &out_tx, &session, &control, &dispatcher).await;
            // Drop our end first so the session task never blocks emitting
            // into a stream nobody reads.
            drop(events);
            complete(&control, &session, &telephony, &call_sid, &out_tx).await;
        };

        tokio::join!(uplink, downlink);
        drop(out_tx);
        let _ = sender.await;
    }
}

/// Terminate once, then tell the provider what to do with the live leg.
async fn complete(
    control: &CallControl,
    session: &SessionHandle,
    telephony: &TelephonyClient,
    call_sid: &str,
    out: &mpsc::Sender<OutFrame>,
) {
    let Some((call_id, _total_ms, termination)) = finalize(control, session).await else {
        return;
    };
    let result = match termination.transfer_to {
        Some(number) if termination.cause == TerminationCause::Transferred => {
            telephony.transfer(call_sid, &number).await
        }
        _ => telephony.hang_up(call_sid).await,
    };
    if let Err(e) = result {
        warn!(%call_id, "Provider call update failed: {e:#}");
    }
    let _ = out.send(OutFrame::Close).await;
    info!(%call_id, "Cleanup complete");
}

async fn uplink_loop(
    mut ws_rx: SplitStream<WebSocket>,
    session: &SessionHandle,
    control: &CallControl,
) -> UplinkExit {
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                info!("Media stream closed: {e}");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let frame: InboundFrame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Malformed media-stream frame: {e}");
                        continue;
                    }
                };
                match frame {
                    InboundFrame::Media { media } => {
                        if session.send_audio(media.payload).await.is_err() {
                            return UplinkExit::StreamClosed;
                        }
                    }
                    InboundFrame::Start { start } => {
                        info!("Incoming stream has started {}", start.stream_sid);
                        let mut state = control.lock().await;
                        state.stream_sid = Some(start.stream_sid);
                        state.playback.reset();
                    }
                    InboundFrame::Mark => {
                        if control.ack_mark(now_ms()).await {
                            info!("Hang up requested and all media processed");
                            return UplinkExit::Drained;
                        }
                    }
                    InboundFrame::Stop | InboundFrame::Other => {}
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    UplinkExit::StreamClosed
}

async fn downlink_loop(
    events: &mut mpsc::Receiver<SessionEvent>,
    out: &mpsc::Sender<OutFrame>,
    session: &SessionHandle,
    control: &CallControl,
    dispatcher: &Dispatcher,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::FunctionCall(invocation) => {
                for action in dispatcher.dispatch(&invocation).await {
                    match action {
                        // Answering machine: stop forwarding audio at once.
                        ToolAction::EndDownlink => return,
                        other => {
                            debug!("Tool action {other:?} has no telephony effect")
                        }
                    }
                }
            }
            SessionEvent::AudioDelta {
                item_id,
                payload,
                audio_ms,
            } => {
                let stream_sid = {
                    let mut state = control.lock().await;
                    state.playback.begin_delta(&item_id);
                    state.stream_sid.clone()
                };
                let media = json!({
                    "event": "media",
                    "streamSid": stream_sid,
                    "media": {"payload": payload},
                });
                if out.send(OutFrame::Text(media.to_string())).await.is_err() {
                    return;
                }
                if let Some(sid) = stream_sid {
                    let mark = json!({
                        "event": "mark",
                        "streamSid": sid,
                        "mark": {"name": "responsePart"},
                    });
                    if out.send(OutFrame::Text(mark.to_string())).await.is_err() {
                        return;
                    }
                    control.lock().await.playback.push_chunk(audio_ms);
                }
            }
            SessionEvent::SpeechStarted => {
                let outcome = { control.lock().await.playback.barge_in(now_ms()) };
                if let Some((item_id, heard_ms)) = outcome.truncate {
                    if let Err(e) = session.send_truncate(item_id, heard_ms).await {
                        warn!("Failed to send truncation: {e}");
                    }
                }
                if outcome.clear_playback {
                    let stream_sid = control.lock().await.stream_sid.clone();
                    let clear = json!({"event": "clear", "streamSid": stream_sid});
                    if out.send(OutFrame::Text(clear.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            // The live transcript only goes to browser endpoints.
            SessionEvent::TranscriptUpdate { .. } => {}
            SessionEvent::Closed => return,
        }
    }
}
