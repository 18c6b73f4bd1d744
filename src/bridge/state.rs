//! State shared between the two bridge loops of one call.
//!
//! The downlink loop appends to the mark queue as it sends audio; the uplink
//! loop pops it as the endpoint acknowledges playback. The termination cause
//! lives alongside so every exit path funnels through one first-writer-wins
//! value. The mutex is only ever held for pointer-sized bookkeeping, never
//! across an await.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::types::{Termination, TerminationCause};

/// Downlink playback bookkeeping for the assistant item currently on the
/// wire. All time arithmetic takes `now_ms` as a parameter.
#[derive(Debug, Default)]
pub struct Playback {
    /// The model item being played, unset while idle.
    pub last_item_id: Option<String>,
    /// Durations of sent-but-unacknowledged chunks, in ms.
    queue: VecDeque<u64>,
    /// Acknowledged playback for the current item, in ms.
    elapsed_ms: u64,
    /// Wallclock of the last acknowledgment while more chunks are pending.
    inter_mark_start: Option<u64>,
}

/// What the barge-in handler must do after the state rolled back.
#[derive(Debug, PartialEq)]
pub struct BargeIn {
    /// Truncation to report to the model, if any audio was in flight.
    pub truncate: Option<(String, u64)>,
    /// Whether a `clear` should be sent to the human endpoint.
    pub clear_playback: bool,
}

impl Playback {
    /// First delta of a new item resets the bookkeeping; later deltas of the
    /// same item keep it.
    pub fn begin_delta(&mut self, item_id: &str) {
        if self.last_item_id.is_none() {
            self.last_item_id = Some(item_id.to_string());
            self.elapsed_ms = 0;
            self.inter_mark_start = None;
            self.queue.clear();
        }
    }

    /// A chunk of `ms` milliseconds was sent to the endpoint.
    pub fn push_chunk(&mut self, ms: u64) {
        self.queue.push_back(ms);
    }

    /// The endpoint acknowledged the oldest outstanding chunk. Returns
    /// whether the queue drained (spurious marks return `None`).
    pub fn ack_mark(&mut self, now_ms: u64) -> Option<bool> {
        let ms = self.queue.pop_front()?;
        self.elapsed_ms += ms;
        self.inter_mark_start = (!self.queue.is_empty()).then_some(now_ms);
        Some(self.queue.is_empty())
    }

    /// How much of the current item the human actually heard: acknowledged
    /// playback, plus wallclock since the last ack capped at the first
    /// pending chunk's duration.
    pub fn truncation(&self, now_ms: u64) -> Option<(String, u64)> {
        let item_id = self.last_item_id.clone()?;
        let mut heard_ms = self.elapsed_ms;
        if let Some(start) = self.inter_mark_start {
            let wallclock = now_ms.saturating_sub(start);
            heard_ms += wallclock.min(self.queue.front().copied().unwrap_or(wallclock));
        }
        Some((item_id, heard_ms))
    }

    /// The user started speaking over playback. Computes the truncation (only
    /// when chunks are actually in flight), then reverts to idle.
    pub fn barge_in(&mut self, now_ms: u64) -> BargeIn {
        let had_pending = !self.queue.is_empty();
        let truncate = if had_pending {
            self.truncation(now_ms)
        } else {
            None
        };
        self.reset();
        BargeIn {
            truncate,
            clear_playback: had_pending,
        }
    }

    /// Back to idle (stream start, barge-in, item completion).
    pub fn reset(&mut self) {
        self.last_item_id = None;
        self.queue.clear();
        self.elapsed_ms = 0;
        self.inter_mark_start = None;
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BridgeState {
    pub playback: Playback,
    pub stream_sid: Option<String>,
    termination: Option<Termination>,
    finishing: bool,
    finished: Option<(Uuid, u64)>,
}

/// Clonable handle to one call's shared bridge state. Held by both bridge
/// loops, the tool dispatcher, and the server's hang-up route.
#[derive(Clone, Default)]
pub struct CallControl(Arc<Mutex<BridgeState>>);

impl CallControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access for the bridge loops; hold only for bookkeeping, never
    /// across an await.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, BridgeState> {
        self.0.lock().await
    }

    /// Set the termination cause, first-writer-wins. Returns whether this
    /// call won.
    pub async fn request_termination(&self, termination: Termination) -> bool {
        let mut state = self.0.lock().await;
        if state.termination.is_some() {
            return false;
        }
        state.termination = Some(termination);
        true
    }

    /// Clear a bot-requested hang-up (the `cancel_hang_up` tool). Causes set
    /// by transports or the listener are final.
    pub async fn cancel_bot_termination(&self) {
        let mut state = self.0.lock().await;
        if state
            .termination
            .as_ref()
            .is_some_and(|t| t.cause.bot_requested())
        {
            state.termination = None;
        }
    }

    pub async fn termination(&self) -> Option<Termination> {
        self.0.lock().await.termination.clone()
    }

    /// Acknowledge one played chunk. Returns true when a termination is
    /// pending and the last outstanding chunk was just acknowledged — all
    /// audio has reached the caller and the uplink may stop.
    pub async fn ack_mark(&self, now_ms: u64) -> bool {
        let mut state = self.0.lock().await;
        matches!(state.playback.ack_mark(now_ms), Some(true)) && state.termination.is_some()
    }

    /// Claim the finish path. The first claimant receives the resolved
    /// termination (defaulting to `unknown`) and must complete the call;
    /// later claimants get `None`.
    pub async fn claim_finish(&self) -> Option<Termination> {
        let mut state = self.0.lock().await;
        if state.finishing {
            return None;
        }
        state.finishing = true;
        Some(
            state
                .termination
                .get_or_insert(Termination::new(TerminationCause::Unknown))
                .clone(),
        )
    }

    pub async fn record_finished(&self, result: (Uuid, u64)) {
        self.0.lock().await.finished = Some(result);
    }

    pub async fn finished(&self) -> Option<(Uuid, u64)> {
        self.0.lock().await.finished
    }
}

/// Current wallclock in epoch milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_delta_resets_only_once() {
        let mut p = Playback::default();
        p.begin_delta("it_1");
        p.push_chunk(200);
        p.begin_delta("it_1");
        p.push_chunk(200);
        assert_eq!(p.last_item_id.as_deref(), Some("it_1"));
        assert!(p.has_pending());
    }

    #[test]
    fn test_ack_tracks_elapsed_and_inter_mark() {
        let mut p = Playback::default();
        p.begin_delta("it_1");
        p.push_chunk(200);
        p.push_chunk(200);
        assert_eq!(p.ack_mark(10_000), Some(false));
        // one chunk remains, so the wallclock anchor is set
        let (item, heard) = p.truncation(10_050).unwrap();
        assert_eq!(item, "it_1");
        assert_eq!(heard, 250);
    }

    #[test]
    fn test_truncation_caps_at_head_chunk() {
        let mut p = Playback::default();
        p.begin_delta("it_1");
        p.push_chunk(200);
        p.push_chunk(200);
        p.push_chunk(200);
        p.ack_mark(1_000);
        // 500ms of wallclock but the pending head is only 200ms long
        let (_, heard) = p.truncation(1_500).unwrap();
        assert_eq!(heard, 200 + 200);
    }

    #[test]
    fn test_barge_in_mid_chunk() {
        // Chunks [200,200,200]: first acked, second pending for 50ms of
        // wallclock when the user interrupts.
        let mut p = Playback::default();
        p.begin_delta("it_1");
        p.push_chunk(200);
        p.push_chunk(200);
        p.push_chunk(200);
        p.ack_mark(3_000);
        let outcome = p.barge_in(3_050);
        assert_eq!(outcome.truncate, Some(("it_1".to_string(), 250)));
        assert!(outcome.clear_playback);
        assert!(p.last_item_id.is_none());
        assert!(!p.has_pending());
    }

    #[test]
    fn test_barge_in_with_empty_queue_is_silent() {
        let mut p = Playback::default();
        p.begin_delta("it_1");
        let outcome = p.barge_in(1_000);
        assert_eq!(outcome.truncate, None);
        assert!(!outcome.clear_playback);
        assert!(p.last_item_id.is_none());
    }

    #[test]
    fn test_drain_detection() {
        let mut p = Playback::default();
        p.begin_delta("it_1");
        p.push_chunk(100);
        p.push_chunk(100);
        assert_eq!(p.ack_mark(0), Some(false));
        assert_eq!(p.ack_mark(10), Some(true));
        assert_eq!(p.ack_mark(20), None);
        // fully acknowledged: no wallclock anchor remains
        assert_eq!(p.truncation(1_000), Some(("it_1".to_string(), 200)));
    }

    #[tokio::test]
    async fn test_termination_first_writer_wins() {
        let control = CallControl::new();
        assert!(
            control
                .request_termination(Termination::new(TerminationCause::EndOfCallBot))
                .await
        );
        assert!(
            !control
                .request_termination(Termination::new(TerminationCause::UserHangup))
                .await
        );
        assert_eq!(
            control.termination().await.unwrap().cause,
            TerminationCause::EndOfCallBot
        );
    }

    #[tokio::test]
    async fn test_cancel_only_clears_bot_causes() {
        let control = CallControl::new();
        control
            .request_termination(Termination::new(TerminationCause::VoiceMailBot))
            .await;
        control.cancel_bot_termination().await;
        assert!(control.termination().await.is_none());

        control
            .request_termination(Termination::new(TerminationCause::ListenerHangup))
            .await;
        control.cancel_bot_termination().await;
        assert_eq!(
            control.termination().await.unwrap().cause,
            TerminationCause::ListenerHangup
        );
    }

    #[tokio::test]
    async fn test_claim_finish_single_entrant() {
        let control = CallControl::new();
        let first = control.claim_finish().await;
        assert_eq!(first.unwrap().cause, TerminationCause::Unknown);
        assert!(control.claim_finish().await.is_none());
    }
}
