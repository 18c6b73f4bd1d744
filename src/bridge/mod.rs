//! Media bridge: the two per-call loops tying the human endpoint to the
//! model session.
//!
//! Each transport runs an uplink loop (human frames in) and a downlink loop
//! (model events out) plus a sender task that serializes writes to the human
//! websocket. Both loops converge on [`finalize`] no matter how they exit,
//! and only the first entrant completes the call.

mod browser;
mod call;
mod state;

pub use browser::BrowserBridge;
pub use call::TelephonyBridge;
pub use state::{now_ms, BargeIn, BridgeState, CallControl, Playback};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::realtime::SessionHandle;
use crate::types::Termination;

/// How an uplink loop ended; decides the close bookkeeping that follows.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum UplinkExit {
    /// The human transport closed (or the session task went away).
    StreamClosed,
    /// A requested hang-up finished draining its marks.
    Drained,
    /// The browser sent an explicit hangup frame (already accounted for).
    HungUp,
}

/// Report how much of the current assistant item was actually heard, if one
/// is playing at all.
pub(crate) async fn send_truncation(control: &CallControl, session: &SessionHandle) {
    let truncate = { control.lock().await.playback.truncation(now_ms()) };
    if let Some((item_id, heard_ms)) = truncate {
        if let Err(e) = session.send_truncate(item_id, heard_ms).await {
            warn!("Failed to send truncation: {e}");
        }
    }
}

/// Run the call's termination exactly once across both loops. The first
/// entrant resolves the cause (defaulting to `unknown`), closes the session,
/// and gets the result back for transport-specific follow-up; later entrants
/// get `None`.
pub(crate) async fn finalize(
    control: &CallControl,
    session: &SessionHandle,
) -> Option<(Uuid, u64, Termination)> {
    let termination = control.claim_finish().await?;
    match session.close(termination.cause).await {
        Ok((call_id, total_ms)) => {
            control.record_finished((call_id, total_ms)).await;
            Some((call_id, total_ms, termination))
        }
        Err(e) => {
            error!("Failed to close session: {e:#}");
            None
        }
    }
}

/// One unit of work for the sender task.
pub(crate) enum OutFrame {
    Text(String),
    /// Close the human websocket; unblocks an uplink loop whose peer would
    /// otherwise keep streaming after the call ended.
    Close,
}

/// Drain serialized frames onto the human websocket until the channel or the
/// socket closes.
pub(crate) async fn send_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutFrame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            OutFrame::Text(text) => {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            OutFrame::Close => break,
        }
    }
    let _ = ws_tx.close().await;
    info!("Closed connection to human");
}
