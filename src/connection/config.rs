//! Connection manager configuration

use singularity_shared::codec::FrameMarkers;
use singularity_shared::{protocol, ConnectionTarget, DeviceSignature, TransportKind};
use std::time::Duration;

/// WiFi (raw TCP) settings
#[derive(Debug, Clone)]
pub struct WifiConfig {
    /// Peripheral host name or IP
    pub host: String,
    /// Peripheral TCP port
    pub port: u16,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Longest a single send may wait on the peer
    pub write_timeout: Duration,
    /// Read loop polling cadence
    pub poll_interval: Duration,
    /// Bytes requested per non-blocking read
    pub read_chunk_size: usize,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            host: "192.168.4.1".into(),
            port: protocol::DEFAULT_WIFI_PORT,
            connect_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
            write_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
            poll_interval: Duration::from_millis(protocol::POLL_INTERVAL_MS),
            read_chunk_size: protocol::READ_CHUNK_SIZE,
        }
    }
}

impl WifiConfig {
    /// The configured peripheral as a connection target
    pub fn target(&self) -> ConnectionTarget {
        ConnectionTarget::wifi(self.host.clone(), self.port)
    }
}

/// Bluetooth bridge selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BluetoothMode {
    /// Use real RFCOMM Bluetooth (requires BlueZ)
    #[cfg(feature = "rfcomm")]
    Rfcomm,
    /// Use TCP simulation (for development)
    #[default]
    TcpSimulation,
}

/// Bluetooth configuration
#[derive(Debug, Clone)]
pub struct BluetoothConfig {
    /// Bluetooth bridge mode
    pub mode: BluetoothMode,
    /// TCP simulation address (when mode is TcpSimulation)
    pub tcp_address: String,
    /// Devices the TCP simulation reports as paired
    pub paired: Vec<DeviceSignature>,
    /// RFCOMM channel number
    pub channel: u8,
    /// Device open timeout
    pub connect_timeout: Duration,
    /// Longest a single send may wait on the device
    pub write_timeout: Duration,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            mode: BluetoothMode::TcpSimulation,
            tcp_address: "127.0.0.1:9000".into(),
            paired: Vec::new(),
            channel: protocol::DEFAULT_RFCOMM_CHANNEL,
            connect_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
            write_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
        }
    }
}

/// Configuration for connection manager
///
/// The transport kind is fixed for the lifetime of a manager.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    /// Which transport variant to drive
    pub transport: TransportKind,
    /// WiFi settings
    pub wifi: WifiConfig,
    /// Bluetooth settings
    pub bluetooth: BluetoothConfig,
    /// WiFi stream frame markers
    pub markers: FrameMarkers,
}

impl ManagerConfig {
    /// WiFi manager for `host:port`
    pub fn wifi(host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: TransportKind::Wifi,
            wifi: WifiConfig {
                host: host.into(),
                port,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Bluetooth manager with default bridge settings
    pub fn bluetooth() -> Self {
        Self {
            transport: TransportKind::Bluetooth,
            ..Default::default()
        }
    }
}
