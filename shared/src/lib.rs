//! Singularity Shared Link Types
//!
//! This crate provides the types, marker framing codec and connection state
//! machine shared by the host-side connection manager and peer simulators.

pub mod codec;
pub mod state_machine;

use std::fmt;
use std::hash::{Hash, Hasher};

pub use state_machine::ConnectionState;

/// Reference protocol parameters
pub mod protocol {
    /// Default TCP port of a WiFi peripheral
    pub const DEFAULT_WIFI_PORT: u16 = 80;

    /// Socket read loop polling interval in milliseconds
    pub const POLL_INTERVAL_MS: u64 = 50;

    /// Transport open timeout in milliseconds
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// Bytes requested from the socket per non-blocking read
    pub const READ_CHUNK_SIZE: usize = 1024;

    /// Default RFCOMM channel of a serial port profile peripheral
    pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

    /// Start-of-message marker
    pub const START_MARKER: u8 = b'S';

    /// End-of-message marker
    pub const END_MARKER: u8 = b'E';
}

/// Identity of a Bluetooth peer.
///
/// Two signatures are the same peer when their `mac` matches; the name is
/// display-only and may differ between enumerations.
#[derive(Debug, Clone, Eq)]
pub struct DeviceSignature {
    pub name: String,
    pub mac: String,
}

impl DeviceSignature {
    pub fn new(name: impl Into<String>, mac: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mac: mac.into(),
        }
    }
}

impl PartialEq for DeviceSignature {
    fn eq(&self, other: &Self) -> bool {
        self.mac == other.mac
    }
}

impl Hash for DeviceSignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mac.hash(state);
    }
}

impl fmt::Display for DeviceSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.mac)
    }
}

/// Which transport variant a manager drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    Bluetooth,
    #[default]
    Wifi,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Bluetooth => write!(f, "Bluetooth"),
            TransportKind::Wifi => write!(f, "WiFi"),
        }
    }
}

/// Where to connect, discriminated by transport kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionTarget {
    Bluetooth(DeviceSignature),
    Wifi { host: String, port: u16 },
}

impl ConnectionTarget {
    /// Create a WiFi target
    pub fn wifi(host: impl Into<String>, port: u16) -> Self {
        Self::Wifi {
            host: host.into(),
            port,
        }
    }

    /// The transport kind able to reach this target
    pub fn kind(&self) -> TransportKind {
        match self {
            ConnectionTarget::Bluetooth(_) => TransportKind::Bluetooth,
            ConnectionTarget::Wifi { .. } => TransportKind::Wifi,
        }
    }

    /// Address string the transport dials (mac or `host:port`)
    pub fn address(&self) -> String {
        match self {
            ConnectionTarget::Bluetooth(sig) => sig.mac.clone(),
            ConnectionTarget::Wifi { host, port } => format!("{}:{}", host, port),
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::Bluetooth(sig) => write!(f, "{}", sig),
            ConnectionTarget::Wifi { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

/// Opaque reference to one established transport instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerHandle {
    pub id: u64,
    pub kind: TransportKind,
    /// Bluetooth mac or `host:port`
    pub address: String,
}

impl PeerHandle {
    pub fn new(id: u64, kind: TransportKind, address: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            address: address.into(),
        }
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.kind, self.id, self.address)
    }
}
