//! Singularity Link
//!
//! Keeps one logical connection to a remote peripheral over classic
//! Bluetooth serial or a raw TCP socket, exchanges text messages and reports
//! `Connected`, `MessageReceived` and `Error` events to subscribers.
//!
//! The two transports deliver messages differently. Bluetooth devices hand
//! over whole messages (one per line). The WiFi socket is a raw byte stream
//! in which the peer wraps each message as `S<message>E`; the manager
//! reconstructs messages with [`codec::FrameDecoder`].

pub mod connection;
pub mod registry;
pub mod transport;

pub use connection::{
    BluetoothConfig, BluetoothMode, ConnectionEvent, ConnectionManager, EventReceiver,
    ManagerConfig, WifiConfig,
};
pub use registry::DeviceRegistry;
pub use singularity_shared::{
    codec, protocol, state_machine, ConnectionState, ConnectionTarget, DeviceSignature,
    PeerHandle, TransportKind,
};
pub use transport::{SerialDeviceBridge, TransportError};
