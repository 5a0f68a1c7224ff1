//! Bluetooth serial transport layer
//!
//! Messages on this path arrive pre-framed by the serial bridge (one per
//! line), so no start/end marker decoding is applied.

use crate::transport::serial::{SerialDevice, SerialDeviceBridge};
use crate::transport::traits::{TransportConnector, TransportLink};
use crate::transport::TransportError;
use async_trait::async_trait;
use singularity_shared::{protocol, ConnectionTarget, DeviceSignature, PeerHandle, TransportKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;

/// Link to one open Bluetooth serial device
pub struct BluetoothLink {
    peer: PeerHandle,
    signature: DeviceSignature,
    device: Arc<SerialDevice>,
    bridge: Arc<dyn SerialDeviceBridge>,
    write_timeout: Duration,
}

impl BluetoothLink {
    /// The device this link talks to
    pub fn signature(&self) -> &DeviceSignature {
        &self.signature
    }

    /// Take the pushed message stream (see [`SerialDevice::take_messages`])
    pub fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.device.take_messages()
    }
}

#[async_trait]
impl TransportLink for BluetoothLink {
    fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    async fn send(&self, payload: &str) -> Result<(), TransportError> {
        match timeout(self.write_timeout, self.device.send_message(payload)).await {
            Ok(result) => result.map_err(|e| TransportError::SendFailed(format!("{:#}", e))),
            Err(_) => {
                warn!(
                    "[BT] Write to {} timed out after {:?}",
                    self.signature, self.write_timeout
                );
                Err(TransportError::SendFailed(format!(
                    "timed out after {:?}",
                    self.write_timeout
                )))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.device.is_open()
    }

    async fn close(&self) {
        self.bridge.close_device(&self.signature.mac).await;
        self.device.close().await;
    }
}

/// Bluetooth connector delegating to a serial device bridge
pub struct BluetoothConnector {
    bridge: Arc<dyn SerialDeviceBridge>,
    connect_timeout: Duration,
    write_timeout: Duration,
    peer_ids: AtomicU64,
}

impl BluetoothConnector {
    pub fn new(bridge: Arc<dyn SerialDeviceBridge>) -> Self {
        Self {
            bridge,
            connect_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
            write_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
            peer_ids: AtomicU64::new(0),
        }
    }

    /// Override how long one send may wait on the device
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Override how long a device open may take
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// The underlying bridge
    pub fn bridge(&self) -> &Arc<dyn SerialDeviceBridge> {
        &self.bridge
    }
}

#[async_trait]
impl TransportConnector for BluetoothConnector {
    type Link = BluetoothLink;

    async fn open(&self, target: &ConnectionTarget) -> Result<Self::Link, TransportError> {
        let ConnectionTarget::Bluetooth(signature) = target else {
            return Err(TransportError::ConnectFailed(format!(
                "{} target cannot be opened over Bluetooth",
                target.kind()
            )));
        };

        let device = match timeout(
            self.connect_timeout,
            self.bridge.open_serial_device(&signature.mac),
        )
        .await
        {
            Ok(Ok(device)) => device,
            Ok(Err(e)) => {
                return Err(TransportError::ConnectFailed(format!(
                    "{}: {:#}",
                    self.bridge.name(),
                    e
                )));
            }
            Err(_) => {
                // The bridge may still finish opening; make sure it is released
                self.bridge.close_device(&signature.mac).await;
                return Err(TransportError::ConnectFailed(format!(
                    "{}: timed out after {:?}",
                    signature.mac, self.connect_timeout
                )));
            }
        };

        let id = self.peer_ids.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(BluetoothLink {
            peer: PeerHandle::new(id, TransportKind::Bluetooth, signature.mac.clone()),
            signature: signature.clone(),
            device,
            bridge: self.bridge.clone(),
            write_timeout: self.write_timeout,
        })
    }

    fn name(&self) -> &'static str {
        "Bluetooth"
    }
}
