//! Connection State Machine
//!
//! Defines the manager-wide connection states and which link events may move
//! between them.

use std::fmt;

/// Manager-wide connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Caller asked to connect (or reconnect)
    ConnectRequested,
    /// Transport open completed
    Opened,
    /// Transport open failed
    OpenFailed,
    /// Read loop saw the transport go away
    ConnectionLost,
    /// Caller asked to disconnect
    DisconnectRequested,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// State changed
    Changed {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// Event accepted, state already where it should be
    Unchanged(ConnectionState),
    /// Event not valid from the current state; nothing changed
    Invalid {
        from: ConnectionState,
        event: LinkEvent,
    },
}

impl Transition {
    /// Whether the event was accepted
    pub fn is_valid(&self) -> bool {
        !matches!(self, Transition::Invalid { .. })
    }
}

/// Connection lifecycle state machine
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    current_state: ConnectionState,
}

impl ConnectionStateMachine {
    /// Create a new state machine in Disconnected state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> Transition {
        let from = self.current_state;
        match next_state(from, event) {
            Some(to) if to == from => Transition::Unchanged(to),
            Some(to) => {
                self.current_state = to;
                Transition::Changed { from, to }
            }
            None => Transition::Invalid { from, event },
        }
    }
}

/// Get the next state for a given event, if the transition is valid
fn next_state(from: ConnectionState, event: LinkEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use LinkEvent::*;

    match (from, event) {
        // Disconnect is accepted from anywhere
        (_, DisconnectRequested) => Some(Disconnected),

        // Reconnect closes the old transport first, so it restarts the attempt
        (_, ConnectRequested) => Some(Connecting),

        (Connecting, Opened) => Some(Connected),
        (Connecting, OpenFailed) => Some(Disconnected),

        (Connected, ConnectionLost) => Some(Disconnected),

        _ => None,
    }
}
