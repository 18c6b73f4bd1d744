//! Per-call session state: speaker segments and audio bookkeeping.
//!
//! Owned exclusively by the session task; everything here is synchronous and
//! lock-free. Readers outside the call see value copies pushed onto the
//! listener queue.

use tracing::warn;

use crate::audio;
use crate::types::{AudioFormat, Speaker, SpeakerSegment};

/// Where an uplink frame went: straight onto the user's timeline, or into
/// the pre-speech buffer awaiting the model's speech-started signal.
#[derive(Debug, PartialEq, Eq)]
pub enum UplinkAudio {
    Live,
    Buffered,
}

#[derive(Debug)]
pub struct CallState {
    format: AudioFormat,
    /// Cumulative played audio across both directions, in ms.
    total_ms: u64,
    /// Cumulative uplink audio, seeded with the VAD prefix padding so it
    /// lines up with the model's reported `audio_start_ms`.
    input_buffer_ms: u64,
    /// Pre-speech ring of (frame, duration_ms, cumulative_input_ms).
    input_buffer: Vec<(String, u64, u64)>,
    user_speaking: bool,
    segments: Vec<SpeakerSegment>,
}

impl CallState {
    pub fn new(format: AudioFormat, prefix_padding_ms: u64) -> Self {
        Self {
            format,
            total_ms: 0,
            input_buffer_ms: prefix_padding_ms,
            input_buffer: Vec::new(),
            user_speaking: false,
            segments: Vec::new(),
        }
    }

    pub fn total_ms(&self) -> u64 {
        self.total_ms
    }

    pub fn user_speaking(&self) -> bool {
        self.user_speaking
    }

    pub fn segments(&self) -> Vec<SpeakerSegment> {
        self.segments.clone()
    }

    /// Account for one uplink frame. While the user is speaking the frame
    /// lands on the timeline immediately; otherwise it is buffered until the
    /// model reports where speech actually started.
    pub fn on_human_audio(&mut self, frame_b64: &str) -> UplinkAudio {
        let ms = audio::b64_audio_ms(frame_b64, self.format);
        self.input_buffer_ms += ms;
        if self.user_speaking {
            self.total_ms += ms;
            UplinkAudio::Live
        } else {
            self.input_buffer
                .push((frame_b64.to_string(), ms, self.input_buffer_ms));
            UplinkAudio::Buffered
        }
    }

    /// The model detected user speech. Opens the user segment, then flushes
    /// buffered frames from `audio_start_ms` onward into the timeline and
    /// returns them for the listener; earlier frames are discarded.
    pub fn on_speech_started(&mut self, item_id: &str, audio_start_ms: u64) -> Vec<String> {
        self.user_speaking = true;
        self.upsert_segment(SpeakerSegment {
            timestamp: self.total_ms as f64 / 1000.0,
            speaker: Speaker::User,
            transcript: String::new(),
            item_id: item_id.to_string(),
        });

        let mut flushed = Vec::new();
        for (frame, ms, cumulative_ms) in self.input_buffer.drain(..) {
            if cumulative_ms >= audio_start_ms {
                self.total_ms += ms;
                flushed.push(frame);
            }
        }
        flushed
    }

    /// The model detected end of user speech: open the assistant placeholder
    /// that the next audio delta will claim.
    pub fn on_speech_stopped(&mut self) {
        self.user_speaking = false;
        self.upsert_segment(SpeakerSegment {
            timestamp: self.total_ms as f64 / 1000.0,
            speaker: Speaker::Assistant,
            transcript: String::new(),
            item_id: String::new(),
        });
    }

    /// Account for one assistant audio delta; returns its duration. A
    /// trailing placeholder segment adopts the delta's item id.
    pub fn on_audio_delta(&mut self, item_id: &str, delta_b64: &str) -> u64 {
        let ms = audio::b64_audio_ms(delta_b64, self.format);
        self.total_ms += ms;
        if let Some(last) = self.segments.last_mut() {
            if last.item_id.is_empty() {
                if last.speaker != Speaker::Assistant {
                    warn!("Trailing segment without item_id is not the assistant");
                } else {
                    last.item_id = item_id.to_string();
                }
            }
        }
        ms
    }

    /// Apply a finalized transcript to the segment with a matching item id.
    /// A transcript for an item the call never opened a segment for is
    /// appended (its timestamp is unknowable at that point).
    pub fn apply_transcript(&mut self, speaker: Speaker, item_id: &str, transcript: &str) {
        self.upsert_segment(SpeakerSegment {
            timestamp: 0.0,
            speaker,
            transcript: transcript.to_string(),
            item_id: item_id.to_string(),
        });
    }

    /// The single segment-update rule: a matching non-empty item id updates
    /// the transcript in place, anything else appends.
    fn upsert_segment(&mut self, segment: SpeakerSegment) {
        if !segment.item_id.is_empty() {
            if let Some(existing) = self
                .segments
                .iter_mut()
                .find(|s| s.item_id == segment.item_id)
            {
                if existing.speaker != segment.speaker {
                    warn!(
                        item_id = %segment.item_id,
                        "Transcript speaker does not match its segment, ignoring"
                    );
                    return;
                }
                existing.transcript = segment.transcript;
                return;
            }
        }
        self.segments.push(segment);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn frame(ms: u64) -> String {
        // 8 bytes per ms of g711_ulaw
        BASE64.encode(vec![0u8; (ms * 8) as usize])
    }

    fn state() -> CallState {
        CallState::new(AudioFormat::G711Ulaw, 300)
    }

    #[test]
    fn test_pre_speech_buffering() {
        let mut st = state();
        assert_eq!(st.on_human_audio(&frame(20)), UplinkAudio::Buffered);
        assert_eq!(st.total_ms(), 0);
    }

    #[test]
    fn test_speech_started_flushes_from_audio_start() {
        let mut st = state();
        // cumulative input: 320, 340, 360
        st.on_human_audio(&frame(20));
        st.on_human_audio(&frame(20));
        st.on_human_audio(&frame(20));
        // audio_start_ms 340 keeps the last two frames
        let flushed = st.on_speech_started("it_user", 340);
        assert_eq!(flushed.len(), 2);
        assert_eq!(st.total_ms(), 40);
        // the user segment was opened at the pre-flush timeline position
        let segments = st.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speaker, Speaker::User);
        assert_eq!(segments[0].timestamp, 0.0);
        assert_eq!(segments[0].item_id, "it_user");
    }

    #[test]
    fn test_live_audio_counts_towards_timeline() {
        let mut st = state();
        st.on_speech_started("it_user", u64::MAX);
        assert_eq!(st.on_human_audio(&frame(20)), UplinkAudio::Live);
        assert_eq!(st.total_ms(), 20);
    }

    #[test]
    fn test_placeholder_adopts_delta_item_id() {
        let mut st = state();
        st.on_speech_started("it_user", u64::MAX);
        st.on_human_audio(&frame(100));
        st.on_speech_stopped();

        let segments = st.segments();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].speaker, Speaker::Assistant);
        assert_eq!(segments[1].item_id, "");
        assert_eq!(segments[1].timestamp, 0.1);

        let ms = st.on_audio_delta("it_assistant", &frame(40));
        assert_eq!(ms, 40);
        assert_eq!(st.total_ms(), 140);
        assert_eq!(st.segments()[1].item_id, "it_assistant");
    }

    #[test]
    fn test_at_most_one_trailing_placeholder() {
        let mut st = state();
        st.on_speech_started("it_1", u64::MAX);
        st.on_speech_stopped();
        st.on_audio_delta("it_2", &frame(40));
        st.on_speech_started("it_3", u64::MAX);
        st.on_speech_stopped();

        let placeholders: Vec<_> = st
            .segments()
            .into_iter()
            .filter(|s| s.item_id.is_empty())
            .collect();
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0].speaker, Speaker::Assistant);
    }

    #[test]
    fn test_transcript_updates_in_place() {
        let mut st = state();
        st.on_speech_started("it_user", u64::MAX);
        st.apply_transcript(Speaker::User, "it_user", "hello there");

        let segments = st.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].transcript, "hello there");
    }

    #[test]
    fn test_transcript_speaker_mismatch_ignored() {
        let mut st = state();
        st.on_speech_started("it_user", u64::MAX);
        st.apply_transcript(Speaker::Assistant, "it_user", "not yours");
        assert_eq!(st.segments()[0].transcript, "");
    }

    #[test]
    fn test_orphan_transcript_appends() {
        let mut st = state();
        st.apply_transcript(Speaker::Assistant, "it_x", "greeting");
        let segments = st.segments();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].timestamp, 0.0);
        assert_eq!(segments[0].transcript, "greeting");
    }

    #[test]
    fn test_timestamps_monotonic() {
        let mut st = state();
        st.on_speech_started("it_1", u64::MAX);
        st.on_human_audio(&frame(500));
        st.on_speech_stopped();
        st.on_audio_delta("it_2", &frame(700));
        st.on_speech_started("it_3", u64::MAX);

        let segments = st.segments();
        for pair in segments.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }
}
