//! Callbridge - Real-time voice call bridge
//!
//! Bridges a human media stream (telephony or browser WebSocket) with a
//! realtime speech-to-speech model:
//! - Bidirectional low-latency audio proxying with barge-in truncation
//! - Live transcript of speaker segments
//! - Model tool calls (hang up, transfer, DTMF, SMS, document query)
//! - Live listener fan-out over newline-delimited JSON
//! - Durable session log archived to object storage on termination

// Core modules (leaf-first: state -> session -> tools -> bridge -> listener)
pub mod types;
pub mod audio;
pub mod realtime;
pub mod tools;
pub mod bridge;
pub mod listener;

// Collaborators
pub mod knowledge;
pub mod telephony;
pub mod storage;
pub mod db;

// Wiring
pub mod config;
pub mod server;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use db::CallStore;
pub use listener::{ListenerQueue, ListenerRegistry};
pub use realtime::SessionHandle;
pub use types::{AudioFormat, CallDirection, Speaker, SpeakerSegment, TerminationCause};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
