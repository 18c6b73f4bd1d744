//! Realtime model session (connection, per-call state, session log).

pub mod events;
mod log;
pub mod session;
mod state;

pub use events::{ModelEvent, SessionConfiguration, ToolInvocation, TurnDetection};
pub use session::{connect, SessionEvent, SessionHandle, SessionSettings};
