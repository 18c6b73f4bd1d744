//! Shared domain types for calls, transcripts, and tool configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Counter-party name recorded for browser calls, which have no phone number.
pub const BROWSER_NAME: &str = "browser";

/// Audio codec negotiated with both the media stream and the model.
///
/// The same format is used for input and output; the wire names match the
/// realtime model's `session.update` schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    #[serde(rename = "pcm16")]
    Pcm16,
    #[serde(rename = "g711_ulaw")]
    G711Ulaw,
    #[serde(rename = "g711_alaw")]
    G711Alaw,
}

impl AudioFormat {
    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioFormat::Pcm16 => 24_000,
            AudioFormat::G711Ulaw | AudioFormat::G711Alaw => 8_000,
        }
    }

    pub fn bytes_per_sample(&self) -> u32 {
        match self {
            AudioFormat::Pcm16 => 2,
            AudioFormat::G711Ulaw | AudioFormat::G711Alaw => 1,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat::G711Ulaw
    }
}

/// Who produced a transcript segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Speaker {
    User,
    Assistant,
}

/// One conversational turn of the live transcript.
///
/// `timestamp` is seconds from call start; `item_id` is the model's
/// correlation id and may be empty for an assistant turn that has not yet
/// produced audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub timestamp: f64,
    pub speaker: Speaker,
    pub transcript: String,
    pub item_id: String,
}

/// How the call reached this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
    Browser,
}

/// The single enumerated reason a call ended, chosen first-writer-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    EndOfCallBot,
    VoiceMailBot,
    UserHangup,
    ListenerHangup,
    Transferred,
    Unknown,
}

impl TerminationCause {
    /// Causes requested by the model, which `cancel_hang_up` may clear.
    pub fn bot_requested(&self) -> bool {
        matches!(
            self,
            TerminationCause::EndOfCallBot | TerminationCause::VoiceMailBot
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationCause::EndOfCallBot => "end_of_call_bot",
            TerminationCause::VoiceMailBot => "voice_mail_bot",
            TerminationCause::UserHangup => "user_hangup",
            TerminationCause::ListenerHangup => "listener_hangup",
            TerminationCause::Transferred => "transferred",
            TerminationCause::Unknown => "unknown",
        }
    }
}

/// A termination decision plus its side data (the transfer target).
#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    pub cause: TerminationCause,
    pub transfer_to: Option<String>,
}

impl Termination {
    pub fn new(cause: TerminationCause) -> Self {
        Self {
            cause,
            transfer_to: None,
        }
    }

    pub fn transferred(number: String) -> Self {
        Self {
            cause: TerminationCause::Transferred,
            transfer_to: Some(number),
        }
    }
}

/// A labeled phone number the model may transfer the call to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferNumber {
    pub label: String,
    pub phone_number: String,
}

/// Reference to a knowledge base the agent can query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseRef {
    pub id: Uuid,
    pub name: String,
}

/// Per-agent tool configuration; drives the tool schema sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfiguration {
    /// Let the model hang up (and cancel a pending hang-up).
    #[serde(default = "default_true")]
    pub hang_up: bool,
    /// Knowledge bases available to `query_documents`.
    #[serde(default)]
    pub knowledge_bases: Vec<KnowledgeBaseRef>,
    /// Transfer targets for `transfer_call`; empty disables the tool.
    #[serde(default)]
    pub transfer_numbers: Vec<TransferNumber>,
    /// Enable `send_text_message`.
    #[serde(default)]
    pub text_messaging: bool,
    /// Enable `enter_keypad`.
    #[serde(default)]
    pub keypad: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ToolConfiguration {
    fn default() -> Self {
        Self {
            hang_up: true,
            knowledge_bases: Vec::new(),
            transfer_numbers: Vec::new(),
            text_messaging: false,
            keypad: false,
        }
    }
}

impl ToolConfiguration {
    /// Resolve a transfer label to its phone number.
    pub fn transfer_number(&self, label: &str) -> Option<&str> {
        self.transfer_numbers
            .iter()
            .find(|item| item.label == label)
            .map(|item| item.phone_number.as_str())
    }
}

/// A call row: created by the outbound initiator or the inbound webhook
/// before the media websocket connects, updated exactly once on termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub call_sid: Option<String>,
    pub direction: CallDirection,
    pub from_number: String,
    pub to_number: String,
    /// Caller-supplied context interpolated into the system prompt.
    pub input_data: serde_json::Value,
    pub system_prompt: String,
    pub audio_format: AudioFormat,
    pub tool_configuration: ToolConfiguration,
    pub log_path: Option<String>,
    pub end_reason: Option<TerminationCause>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_format_wire_names() {
        assert_eq!(
            serde_json::to_string(&AudioFormat::G711Ulaw).unwrap(),
            "\"g711_ulaw\""
        );
        assert_eq!(
            serde_json::to_string(&AudioFormat::Pcm16).unwrap(),
            "\"pcm16\""
        );
        let f: AudioFormat = serde_json::from_str("\"g711_alaw\"").unwrap();
        assert_eq!(f, AudioFormat::G711Alaw);
    }

    #[test]
    fn test_audio_format_params() {
        assert_eq!(AudioFormat::Pcm16.sample_rate(), 24_000);
        assert_eq!(AudioFormat::Pcm16.bytes_per_sample(), 2);
        assert_eq!(AudioFormat::G711Ulaw.sample_rate(), 8_000);
        assert_eq!(AudioFormat::G711Ulaw.bytes_per_sample(), 1);
    }

    #[test]
    fn test_speaker_wire_names() {
        assert_eq!(serde_json::to_string(&Speaker::User).unwrap(), "\"User\"");
        assert_eq!(
            serde_json::to_string(&Speaker::Assistant).unwrap(),
            "\"Assistant\""
        );
    }

    #[test]
    fn test_termination_cause_names() {
        assert_eq!(TerminationCause::VoiceMailBot.as_str(), "voice_mail_bot");
        assert!(TerminationCause::EndOfCallBot.bot_requested());
        assert!(!TerminationCause::UserHangup.bot_requested());
    }

    #[test]
    fn test_transfer_lookup() {
        let cfg = ToolConfiguration {
            transfer_numbers: vec![TransferNumber {
                label: "support".to_string(),
                phone_number: "+15550100".to_string(),
            }],
            ..Default::default()
        };
        assert_eq!(cfg.transfer_number("support"), Some("+15550100"));
        assert_eq!(cfg.transfer_number("sales"), None);
    }
}
