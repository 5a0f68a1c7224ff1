pub mod bluetooth;
mod error;
#[cfg(feature = "rfcomm")]
pub mod rfcomm;
pub mod serial;
pub mod tcp;
pub mod tcp_sim;
pub mod traits;

pub use bluetooth::{BluetoothConnector, BluetoothLink};
pub use error::TransportError;
#[cfg(feature = "rfcomm")]
pub use rfcomm::{RfcommBridge, RfcommConfig};
pub use serial::{OpenDevices, SerialDevice, SerialDeviceBridge};
pub use tcp::{SocketConnector, SocketLink};
pub use tcp_sim::TcpSimulationBridge;
pub use traits::{TransportConnector, TransportLink};
