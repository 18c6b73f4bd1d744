//! Wire events for the realtime model connection.
//!
//! Both directions are heterogeneous JSON objects discriminated by `type`;
//! they are modeled as internally tagged enums and validated at the parse
//! boundary. Only the event fields the core consumes are declared — the rest
//! of each payload is ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::AudioFormat;

/// Events received from the model.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ModelEvent {
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        item_id: String,
        #[serde(default)]
        audio_start_ms: u64,
    },
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,
    #[serde(rename = "response.audio.delta")]
    AudioDelta { item_id: String, delta: String },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        item_id: String,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        item_id: String,
        #[serde(default)]
        transcript: String,
    },
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        name: String,
        arguments: String,
        call_id: String,
        item_id: String,
    },
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Value,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        error: Value,
    },
    #[serde(other)]
    Other,
}

/// A model-emitted tool call, forwarded to the dispatcher.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: String,
    pub call_id: String,
    pub item_id: String,
}

/// Events sent to the model.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfiguration },
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
    #[serde(rename = "conversation.item.truncate")]
    ItemTruncate {
        item_id: String,
        content_index: u32,
        audio_end_ms: u64,
    },
    #[serde(rename = "conversation.item.create")]
    ItemCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_item_id: Option<String>,
        item: ConversationItem,
    },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ConversationItem {
    #[serde(rename = "function_call_output")]
    FunctionCallOutput { call_id: String, output: String },
}

/// Server-side voice activity detection parameters.
#[derive(Debug, Clone, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f64,
    pub prefix_padding_ms: u64,
    pub silence_duration_ms: u64,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// The `session.update` payload sent once on connect.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfiguration {
    pub turn_detection: TurnDetection,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub voice: String,
    pub instructions: String,
    pub input_audio_transcription: TranscriptionConfig,
    pub tools: Vec<Value>,
}

impl SessionConfiguration {
    /// Instantiate the system prompt template with the caller-supplied input
    /// and assemble the session configuration. The template's `{user_info}`
    /// placeholder receives one indented `-key: value` line per input field.
    pub fn new(
        system_prompt: &str,
        input_data: &Value,
        audio_format: AudioFormat,
        voice: String,
        transcription_model: String,
        tools: Vec<Value>,
    ) -> Self {
        let instructions = system_prompt.replace("{user_info}", &format_input_data(input_data));
        Self {
            turn_detection: TurnDetection::default(),
            input_audio_format: audio_format,
            output_audio_format: audio_format,
            voice,
            instructions,
            input_audio_transcription: TranscriptionConfig {
                model: transcription_model,
            },
            tools,
        }
    }
}

fn format_input_data(input_data: &Value) -> String {
    let mut out = String::new();
    if let Value::Object(map) = input_data {
        for (key, value) in map {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push_str(&format!("\t-{key}: {rendered}\n"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_speech_started() {
        let ev: ModelEvent = serde_json::from_str(
            r#"{"type":"input_audio_buffer.speech_started","item_id":"it_1","audio_start_ms":420,"event_id":"ev_9"}"#,
        )
        .unwrap();
        match ev {
            ModelEvent::SpeechStarted {
                item_id,
                audio_start_ms,
            } => {
                assert_eq!(item_id, "it_1");
                assert_eq!(audio_start_ms, 420);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_event() {
        let ev: ModelEvent =
            serde_json::from_str(r#"{"type":"rate_limits.updated","rate_limits":[]}"#).unwrap();
        assert!(matches!(ev, ModelEvent::Other));
    }

    #[test]
    fn test_parse_function_call() {
        let ev: ModelEvent = serde_json::from_str(
            r#"{"type":"response.function_call_arguments.done","name":"hang_up","arguments":"{\"reason\":\"end_of_call\"}","call_id":"call_1","item_id":"it_2"}"#,
        )
        .unwrap();
        assert!(matches!(ev, ModelEvent::FunctionCallArgumentsDone { .. }));
    }

    #[test]
    fn test_truncate_wire_shape() {
        let ev = ClientEvent::ItemTruncate {
            item_id: "it_3".to_string(),
            content_index: 0,
            audio_end_ms: 250,
        };
        let v: Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "conversation.item.truncate");
        assert_eq!(v["content_index"], 0);
        assert_eq!(v["audio_end_ms"], 250);
    }

    #[test]
    fn test_tool_output_wire_shape() {
        let ev = ClientEvent::ItemCreate {
            previous_item_id: Some("it_4".to_string()),
            item: ConversationItem::FunctionCallOutput {
                call_id: "call_2".to_string(),
                output: "answer".to_string(),
            },
        };
        let v: Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "conversation.item.create");
        assert_eq!(v["previous_item_id"], "it_4");
        assert_eq!(v["item"]["type"], "function_call_output");
        assert_eq!(v["item"]["output"], "answer");
    }

    #[test]
    fn test_session_configuration_interpolation() {
        let cfg = SessionConfiguration::new(
            "Call the patient.\n{user_info}",
            &json!({"name": "Ada", "age": 36}),
            AudioFormat::G711Ulaw,
            "shimmer".to_string(),
            "whisper-1".to_string(),
            vec![],
        );
        assert!(cfg.instructions.contains("\t-name: Ada\n"));
        assert!(cfg.instructions.contains("\t-age: 36\n"));
        let v: Value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(v["turn_detection"]["type"], "server_vad");
        assert_eq!(v["turn_detection"]["prefix_padding_ms"], 300);
        assert_eq!(v["input_audio_format"], "g711_ulaw");
    }
}
