//! Cross-module scenarios for the call core: barge-in truncation, mark
//! draining after a requested hang-up, first-writer-wins termination, and
//! the listener stream contract.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use callbridge::bridge::{CallControl, Playback};
use callbridge::listener::{ListenerMessage, ListenerRegistry};
use callbridge::types::{AudioFormat, Speaker, SpeakerSegment, Termination, TerminationCause};
use uuid::Uuid;

#[test]
fn barge_in_mid_chunk_reports_heard_audio() {
    // The assistant has sent three 200ms chunks; the endpoint acknowledged
    // the first, and 50ms of wallclock passed since. The user barges in:
    // the model must be told 250ms were heard, no more.
    let mut playback = Playback::default();
    playback.begin_delta("item_greeting");
    playback.push_chunk(200);
    playback.push_chunk(200);
    playback.push_chunk(200);
    assert_eq!(playback.ack_mark(10_000), Some(false));

    let outcome = playback.barge_in(10_050);
    assert_eq!(outcome.truncate, Some(("item_greeting".to_string(), 250)));
    assert!(outcome.clear_playback);

    // A slow wallclock never reports more than the pending chunk.
    let mut playback = Playback::default();
    playback.begin_delta("item_greeting");
    playback.push_chunk(200);
    playback.push_chunk(200);
    playback.ack_mark(10_000);
    let outcome = playback.barge_in(10_900);
    assert_eq!(outcome.truncate, Some(("item_greeting".to_string(), 400)));
}

#[test]
fn barge_in_without_pending_audio_is_a_no_op() {
    let mut playback = Playback::default();
    let outcome = playback.barge_in(5_000);
    assert_eq!(outcome.truncate, None);
    assert!(!outcome.clear_playback);
}

#[tokio::test]
async fn hang_up_waits_for_marks_to_drain() {
    let control = CallControl::new();
    {
        let mut state = control.lock().await;
        state.playback.begin_delta("item_goodbye");
        state.playback.push_chunk(150);
        state.playback.push_chunk(150);
    }
    control
        .request_termination(Termination::new(TerminationCause::EndOfCallBot))
        .await;

    // First mark: audio still pending, keep going.
    assert!(!control.ack_mark(1_000).await);
    // Second mark drains the queue: safe to stop.
    assert!(control.ack_mark(1_150).await);
}

#[tokio::test]
async fn termination_cause_is_first_writer_wins() {
    let control = CallControl::new();
    let mut tasks = tokio::task::JoinSet::new();
    for cause in [
        TerminationCause::UserHangup,
        TerminationCause::EndOfCallBot,
        TerminationCause::ListenerHangup,
    ] {
        let control = control.clone();
        tasks.spawn(async move { control.request_termination(Termination::new(cause)).await });
    }
    let wins: usize = tasks.join_all().await.into_iter().filter(|w| *w).count();
    assert_eq!(wins, 1);
    assert!(control.termination().await.is_some());

    // Only the first finish claimant completes the call.
    assert!(control.claim_finish().await.is_some());
    assert!(control.claim_finish().await.is_none());
}

#[tokio::test]
async fn listener_stream_replays_audio_and_ends_at_sentinel() {
    let registry = ListenerRegistry::new();
    let call_id = Uuid::new_v4();
    let queue = registry.ensure(call_id);

    queue.push_speaker(vec![SpeakerSegment {
        timestamp: 0.0,
        speaker: Speaker::User,
        transcript: String::new(),
        item_id: "item_1".to_string(),
    }]);
    queue.push_audio(BASE64.encode([0xFFu8, 0xFF]), AudioFormat::G711Ulaw);
    queue.push_call_end();

    let subscription = registry.subscribe(call_id).expect("first subscriber");
    assert!(registry.subscribe(call_id).is_err(), "one listener per call");

    // Snapshot first, then audio transcoded to PCM16, then the sentinel.
    let first = subscription.next().await;
    assert!(matches!(first, ListenerMessage::Speaker(_)));

    let second = subscription.next().await;
    let line = second.to_ndjson();
    let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(value["type"], "audio");
    let pcm = BASE64.decode(value["data"].as_str().unwrap()).unwrap();
    assert_eq!(pcm.len(), 4, "two u-law bytes become two 16-bit samples");

    let third = subscription.next().await;
    assert!(matches!(third, ListenerMessage::CallEnd));
    let end_line = third.to_ndjson();
    assert_eq!(end_line.trim(), r#"{"data":null,"type":"call_end"}"#);
}
