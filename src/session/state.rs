//! Personal-bridge session state machine.
//!
//! [`transition`] is the complete table. It is pure so the lifecycle rules
//! can be checked without a live connection; the session actor applies it
//! to every trigger and ignores triggers that yield `None`.

use serde::Serialize;

use crate::types::HealthStatus;

/// Lifecycle state of one user's bridge session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session was ever started.
    Uninitialized,
    /// Opening the device connection.
    Initializing,
    /// A pairing code was issued and awaits scanning.
    AwaitingPairing,
    /// The device connection is open.
    Connected,
    /// The connection dropped; a new attempt is scheduled.
    Reconnecting,
    /// Terminal until the next explicit init.
    LoggedOut,
}

impl SessionState {
    /// Stable label for logs and the API.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::LoggedOut => "logged_out",
        }
    }

    /// Health mirrored onto the integration while in this state.
    pub fn health(&self) -> HealthStatus {
        match self {
            Self::Uninitialized | Self::Initializing => HealthStatus::Unknown,
            Self::Connected => HealthStatus::Healthy,
            Self::Reconnecting => HealthStatus::Degraded,
            Self::AwaitingPairing | Self::LoggedOut => HealthStatus::Disconnected,
        }
    }

    /// Whether a session in this state may still reach `Connected` on its own.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Uninitialized | Self::LoggedOut)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionTrigger {
    /// Explicit init, or the automatic re-init after a drop.
    Init,
    /// The transport issued a pairing code.
    PairingCode,
    /// The transport reported an open connection.
    Opened,
    /// The transport reported a close.
    Closed {
        /// Whether the close reason was "logged out".
        logged_out: bool,
    },
    /// Explicit teardown requested by the platform.
    Disconnect,
}

/// Next state for `trigger` in `state`, or `None` if the trigger is ignored.
pub fn transition(state: SessionState, trigger: SessionTrigger) -> Option<SessionState> {
    use SessionState::*;
    use SessionTrigger::*;

    match (state, trigger) {
        (Uninitialized | Reconnecting | LoggedOut, Init) => Some(Initializing),
        (Initializing | AwaitingPairing | Connected, Init) => None,

        (Initializing | AwaitingPairing, PairingCode) => Some(AwaitingPairing),
        (Initializing | AwaitingPairing, Opened) => Some(Connected),
        (_, PairingCode | Opened) => None,

        (LoggedOut, Closed { .. } | Disconnect) => None,
        (_, Closed { logged_out: true } | Disconnect) => Some(LoggedOut),

        (Initializing | AwaitingPairing | Connected, Closed { logged_out: false }) => {
            Some(Reconnecting)
        }
        (Uninitialized | Reconnecting, Closed { logged_out: false }) => None,
    }
}
