//! Connection supervisor
//!
//! Owns the lifecycle of the single logical event subscription:
//!
//! - `backoff`: reconnect delay schedule
//! - `machine`: pure state machine deciding what to do on each input
//! - `driver`: async actor executing the machine's actions against an
//!   [`crate::transport::EventSource`]
//!
//! The split keeps every lifecycle rule unit-testable without timers or
//! sockets; the driver only owns futures, deadlines and channels.

use std::fmt;

use serde::Serialize;

pub mod backoff;
pub mod driver;
pub mod machine;

pub use backoff::BackoffPolicy;
pub use driver::{StreamHandler, StreamSupervisor, SupervisorHandle};
pub use machine::{Action, ConnectionMachine, Input};

/// Connection state of the logical subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not started, or stopped
    #[default]
    Idle,
    /// First connection attempt in flight
    Connecting,
    /// Stream open
    Connected,
    /// Stream lost; a retry is scheduled or in flight
    Reconnecting,
    /// Consumer hidden; stream deliberately closed
    Paused,
    /// Network reported offline; stream deliberately closed
    Offline,
    /// Last connection attempt failed; a retry is scheduled
    Error,
}

impl ConnectionState {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Paused => "paused",
            ConnectionState::Offline => "offline",
            ConnectionState::Error => "error",
        }
    }

    /// Numeric code published on the `stream_connection_state` gauge
    pub fn code(&self) -> u8 {
        match self {
            ConnectionState::Idle => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Reconnecting => 3,
            ConnectionState::Paused => 4,
            ConnectionState::Offline => 5,
            ConnectionState::Error => 6,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable connection status: a state plus an optional hint for display
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Current state
    pub state: ConnectionState,
    /// Human-readable detail (retry delay, last error)
    pub hint: Option<String>,
}

impl ConnectionStatus {
    /// Status without a hint
    pub fn new(state: ConnectionState) -> Self {
        Self { state, hint: None }
    }

    /// Status with a hint
    pub fn with_hint(state: ConnectionState, hint: impl Into<String>) -> Self {
        Self {
            state,
            hint: Some(hint.into()),
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hint {
            Some(hint) => write!(f, "{} ({})", self.state, hint),
            None => write!(f, "{}", self.state),
        }
    }
}

/// How much state to reload after regaining the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatchUpKind {
    /// Reload the session list and resync the current session
    Full,
    /// Resync only the current session
    Light,
}
