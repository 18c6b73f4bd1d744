//! Browser raw-PCM bridge.
//!
//! Same core choreography as the telephony bridge with a flatter envelope:
//! payloads sit directly under `payload`, there is no stream sid or
//! out-of-band mark protocol, the client may send an explicit `hangup`, and
//! the live transcript plus UI messages are forwarded to the page.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::SoundCache;
use crate::bridge::{
    finalize, now_ms, send_loop, send_truncation, CallControl, OutFrame, UplinkExit,
};
use crate::realtime::{SessionEvent, SessionHandle};
use crate::tools::{Dispatcher, ToolAction};
use crate::types::{Termination, TerminationCause};

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum InboundFrame {
    Media { payload: String },
    Start,
    Mark,
    Hangup,
    #[serde(other)]
    Other,
}

pub struct BrowserBridge {
    pub session: SessionHandle,
    pub events: mpsc::Receiver<SessionEvent>,
    pub control: CallControl,
    pub dispatcher: Dispatcher,
    pub sounds: Arc<SoundCache>,
}

impl BrowserBridge {
    pub async fn run(self, ws: WebSocket) {
        let BrowserBridge {
            session,
            events,
            control,
            dispatcher,
            sounds,
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
            complete(&control, &session, &out_tx).await;
        };

        let downlink = async {
            let mut events = events;
            downlink_loop(&mut events, &out_tx, &session, &control, &dispatcher, &sounds).await;
            drop(events);
            complete(&control, &session, &out_tx).await;
        };

        tokio::join!(uplink, downlink);
        drop(out_tx);
        let _ = sender.await;
    }
}

async fn complete(control: &CallControl, session: &SessionHandle, out: &mpsc::Sender<OutFrame>) {
    let Some((call_id, _total_ms, termination)) = finalize(control, session).await else {
        return;
    };
    // There is no provider leg to redirect; surface the transfer to the page.
    if let Some(number) = termination.transfer_to {
        let frame = json!({
            "event": "message",
            "payload": {
                "title": "Call Transfer",
                "body": format!("Call would be transferred to {number}"),
            },
        });
        let _ = out.send(OutFrame::Text(frame.to_string())).await;
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
                info!("Browser stream closed: {e}");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let frame: InboundFrame = match serde_json::from_str(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("Malformed browser frame: {e}");
                        continue;
                    }
                };
                match frame {
                    InboundFrame::Media { payload } => {
                        if session.send_audio(payload).await.is_err() {
                            return UplinkExit::StreamClosed;
                        }
                    }
                    InboundFrame::Start => {
                        info!("Incoming stream has started");
                        control.lock().await.playback.reset();
                    }
                    InboundFrame::Mark => {
                        if control.ack_mark(now_ms()).await {
                            info!("Hang up requested and all media processed");
                            return UplinkExit::Drained;
                        }
                    }
                    InboundFrame::Hangup => {
                        info!("Hang up requested by user");
                        control
                            .request_termination(Termination::new(TerminationCause::UserHangup))
                            .await;
                        send_truncation(control, session).await;
                        return UplinkExit::HungUp;
                    }
                    InboundFrame::Other => {}
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
    sounds: &SoundCache,
) {
    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::FunctionCall(invocation) => {
                for action in dispatcher.dispatch(&invocation).await {
                    match action {
                        ToolAction::PlayHangUpTone => {
                            match sounds.get(SoundCache::HANG_UP_TONE_24K) {
                                Some(sound) => {
                                    let frame = json!({
                                        "event": "media",
                                        "payload": sound.payload_b64,
                                    });
                                    if out.send(OutFrame::Text(frame.to_string())).await.is_err() {
                                        return;
                                    }
                                    control.lock().await.playback.push_chunk(sound.duration_ms);
                                }
                                None => warn!("Hang up tone not found"),
                            }
                        }
                        ToolAction::ShowMessage { title, body } => {
                            let frame = json!({
                                "event": "message",
                                "payload": {"title": title, "body": body},
                            });
                            if out.send(OutFrame::Text(frame.to_string())).await.is_err() {
                                return;
                            }
                        }
                        ToolAction::EndDownlink => return,
                    }
                }
            }
            SessionEvent::AudioDelta {
                item_id,
                payload,
                audio_ms,
            } => {
                control.lock().await.playback.begin_delta(&item_id);
                let frame = json!({"event": "media", "payload": payload});
                if out.send(OutFrame::Text(frame.to_string())).await.is_err() {
                    return;
                }
                control.lock().await.playback.push_chunk(audio_ms);
            }
            SessionEvent::SpeechStarted => {
                let outcome = { control.lock().await.playback.barge_in(now_ms()) };
                if let Some((item_id, heard_ms)) = outcome.truncate {
                    if let Err(e) = session.send_truncate(item_id, heard_ms).await {
                        warn!("Failed to send truncation: {e}");
                    }
                }
                if outcome.clear_playback {
                    let frame = json!({"event": "clear"});
                    if out.send(OutFrame::Text(frame.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            SessionEvent::TranscriptUpdate { segments } => {
                let frame = json!({"event": "speaker_segments", "payload": segments});
                if out.send(OutFrame::Text(frame.to_string())).await.is_err() {
                    return;
                }
            }
            SessionEvent::Closed => return,
        }
    }
}
