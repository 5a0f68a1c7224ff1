//! Transport error taxonomy

use thiserror::Error;

/// Failures a transport reports to the connection manager
///
/// The `Display` text is what consumers receive in the `Error` event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The peer went away while the link was open
    #[error("Connection lost")]
    ConnectionLost,

    /// The link was closed locally; never surfaced as an event
    #[error("Transport closed")]
    Closed,
}
