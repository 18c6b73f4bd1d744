//! Live listener fan-out.
//!
//! Each call owns one bounded message queue; the session task and the
//! bridges produce, at most one HTTP subscriber consumes. The stream is
//! best-effort: under a slow consumer the oldest audio is dropped, speaker
//! snapshots and the terminal `call_end` sentinel never are.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::audio;
use crate::types::{AudioFormat, SpeakerSegment};

/// Queue capacity; beyond it the oldest audio message is evicted.
const QUEUE_CAPACITY: usize = 256;

/// One message on a listener stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerMessage {
    Audio {
        payload_b64: String,
        format: AudioFormat,
    },
    Speaker(Vec<SpeakerSegment>),
    CallEnd,
}

impl ListenerMessage {
    /// Serialize to one newline-delimited JSON line. Audio is re-encoded as
    /// 16-bit linear PCM when the call codec is G.711; other formats pass
    /// through.
    pub fn to_ndjson(&self) -> String {
        let value = match self {
            ListenerMessage::Audio {
                payload_b64,
                format,
            } => {
                let data = match format {
                    AudioFormat::Pcm16 => payload_b64.clone(),
                    AudioFormat::G711Ulaw | AudioFormat::G711Alaw => {
                        match BASE64.decode(payload_b64) {
                            Ok(bytes) => BASE64.encode(audio::to_pcm16(&bytes, *format)),
                            Err(_) => payload_b64.clone(),
                        }
                    }
                };
                json!({"type": "audio", "data": data})
            }
            ListenerMessage::Speaker(segments) => json!({"type": "speaker", "data": segments}),
            ListenerMessage::CallEnd => json!({"type": "call_end", "data": null}),
        };
        let mut line = value.to_string();
        line.push('\n');
        line
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<ListenerMessage>,
    subscribed: bool,
}

/// The per-call queue. Producers push synchronously; the single consumer
/// awaits `pop`.
#[derive(Debug, Default)]
pub struct ListenerQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl ListenerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_audio(&self, payload_b64: String, format: AudioFormat) {
        self.push(ListenerMessage::Audio {
            payload_b64,
            format,
        });
    }

    pub fn push_speaker(&self, segments: Vec<SpeakerSegment>) {
        self.push(ListenerMessage::Speaker(segments));
    }

    pub fn push_call_end(&self) {
        self.push(ListenerMessage::CallEnd);
    }

    fn push(&self, message: ListenerMessage) {
        {
            let mut inner = self.inner.lock().expect("listener queue poisoned");
            if inner.items.len() >= QUEUE_CAPACITY {
                // Evict the oldest droppable message; audio only.
                let oldest_audio = inner
                    .items
                    .iter()
                    .position(|m| matches!(m, ListenerMessage::Audio { .. }));
                match oldest_audio {
                    Some(idx) => {
                        inner.items.remove(idx);
                        debug!("Listener behind, dropped oldest audio message");
                    }
                    None => {
                        if matches!(message, ListenerMessage::Audio { .. }) {
                            debug!("Listener behind, dropped incoming audio message");
                            return;
                        }
                    }
                }
            }
            inner.items.push_back(message);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> ListenerMessage {
        loop {
            let notified = self.notify.notified();
            if let Some(message) = self
                .inner
                .lock()
                .expect("listener queue poisoned")
                .items
                .pop_front()
            {
                return message;
            }
            notified.await;
        }
    }

    fn try_subscribe(self: &Arc<Self>) -> Option<Subscription> {
        let mut inner = self.inner.lock().expect("listener queue poisoned");
        if inner.subscribed {
            return None;
        }
        inner.subscribed = true;
        Some(Subscription {
            queue: Arc::clone(self),
        })
    }
}

/// Exclusive consumer of one call's listener queue; released on drop.
#[derive(Debug)]
pub struct Subscription {
    queue: Arc<ListenerQueue>,
}

impl Subscription {
    pub async fn next(&self) -> ListenerMessage {
        self.queue.pop().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue
            .inner
            .lock()
            .expect("listener queue poisoned")
            .subscribed = false;
    }
}

/// Process-wide lookup of per-call listener queues.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    queues: Arc<Mutex<HashMap<Uuid, Arc<ListenerQueue>>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue for a call, created on first use (the outbound initiator
    /// provisions it before the media stream connects).
    pub fn ensure(&self, call_id: Uuid) -> Arc<ListenerQueue> {
        self.queues
            .lock()
            .expect("listener registry poisoned")
            .entry(call_id)
            .or_default()
            .clone()
    }

    pub fn get(&self, call_id: Uuid) -> Option<Arc<ListenerQueue>> {
        self.queues
            .lock()
            .expect("listener registry poisoned")
            .get(&call_id)
            .cloned()
    }

    /// Attach the single allowed subscriber to a call's stream.
    pub fn subscribe(&self, call_id: Uuid) -> Result<Subscription, SubscribeError> {
        let queue = self.get(call_id).ok_or(SubscribeError::NotFound)?;
        queue.try_subscribe().ok_or(SubscribeError::Busy)
    }

    pub fn remove(&self, call_id: Uuid) {
        self.queues
            .lock()
            .expect("listener registry poisoned")
            .remove(&call_id);
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("no listener stream for this call")]
    NotFound,
    #[error("the call already has a listener")]
    Busy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Speaker;

    #[test]
    fn test_ndjson_audio_passthrough() {
        let msg = ListenerMessage::Audio {
            payload_b64: BASE64.encode([1u8, 2, 3, 4]),
            format: AudioFormat::Pcm16,
        };
        let line = msg.to_ndjson();
        assert!(line.ends_with('\n'));
        let v: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(v["type"], "audio");
        assert_eq!(v["data"], BASE64.encode([1u8, 2, 3, 4]));
    }

    #[test]
    fn test_ndjson_transcodes_ulaw() {
        let msg = ListenerMessage::Audio {
            payload_b64: BASE64.encode([0xFFu8]),
            format: AudioFormat::G711Ulaw,
        };
        let v: serde_json::Value = serde_json::from_str(msg.to_ndjson().trim()).unwrap();
        let decoded = BASE64.decode(v["data"].as_str().unwrap()).unwrap();
        // one μ-law byte becomes one 16-bit sample
        assert_eq!(decoded, vec![0, 0]);
    }

    #[test]
    fn test_ndjson_speaker_and_call_end() {
        let msg = ListenerMessage::Speaker(vec![SpeakerSegment {
            timestamp: 1.5,
            speaker: Speaker::User,
            transcript: "hi".to_string(),
            item_id: "it_1".to_string(),
        }]);
        let v: serde_json::Value = serde_json::from_str(msg.to_ndjson().trim()).unwrap();
        assert_eq!(v["data"][0]["speaker"], "User");

        let end: serde_json::Value =
            serde_json::from_str(ListenerMessage::CallEnd.to_ndjson().trim()).unwrap();
        assert_eq!(end["type"], "call_end");
        assert!(end["data"].is_null());
    }

    #[tokio::test]
    async fn test_overflow_drops_audio_not_speaker() {
        let queue = Arc::new(ListenerQueue::new());
        queue.push_speaker(vec![]);
        for i in 0..QUEUE_CAPACITY + 10 {
            queue.push_audio(format!("frame{i}"), AudioFormat::Pcm16);
        }
        queue.push_call_end();

        let sub = queue.try_subscribe().unwrap();
        // the speaker snapshot survived in front
        assert!(matches!(sub.next().await, ListenerMessage::Speaker(_)));
        let mut saw_end = false;
        let mut audio_count = 0;
        loop {
            match sub.next().await {
                ListenerMessage::Audio { .. } => audio_count += 1,
                ListenerMessage::CallEnd => {
                    saw_end = true;
                    break;
                }
                ListenerMessage::Speaker(_) => {}
            }
        }
        assert!(saw_end);
        assert!(audio_count <= QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_single_subscriber() {
        let registry = ListenerRegistry::new();
        let id = Uuid::new_v4();
        registry.ensure(id);
        let first = registry.subscribe(id).unwrap();
        assert_eq!(registry.subscribe(id).unwrap_err(), SubscribeError::Busy);
        drop(first);
        assert!(registry.subscribe(id).is_ok());
        assert_eq!(
            registry.subscribe(Uuid::new_v4()).unwrap_err(),
            SubscribeError::NotFound
        );
    }

    #[tokio::test]
    async fn test_stream_order_preserved() {
        let queue = Arc::new(ListenerQueue::new());
        queue.push_audio("a".to_string(), AudioFormat::Pcm16);
        queue.push_speaker(vec![]);
        queue.push_call_end();
        let sub = queue.try_subscribe().unwrap();
        assert!(matches!(sub.next().await, ListenerMessage::Audio { .. }));
        assert!(matches!(sub.next().await, ListenerMessage::Speaker(_)));
        assert!(matches!(sub.next().await, ListenerMessage::CallEnd));
    }
}
