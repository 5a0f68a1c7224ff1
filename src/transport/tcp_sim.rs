//! TCP simulation of a Bluetooth serial bridge for development without a radio

use crate::transport::serial::{OpenDevices, SerialDevice, SerialDeviceBridge};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use singularity_shared::DeviceSignature;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

/// Bridge whose paired "devices" all live behind one TCP address
pub struct TcpSimulationBridge {
    address: String,
    paired: Vec<DeviceSignature>,
    connect_timeout: Duration,
    devices: OpenDevices,
}

impl TcpSimulationBridge {
    pub fn new(address: impl Into<String>, paired: Vec<DeviceSignature>) -> Self {
        Self {
            address: address.into(),
            paired,
            connect_timeout: Duration::from_secs(5),
            devices: OpenDevices::new(),
        }
    }

    /// Override the TCP connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Number of devices currently open
    pub async fn open_count(&self) -> usize {
        self.devices.len().await
    }
}

#[async_trait]
impl SerialDeviceBridge for TcpSimulationBridge {
    async fn paired_devices(&self) -> Result<Vec<DeviceSignature>> {
        Ok(self.paired.clone())
    }

    async fn open_serial_device(&self, mac: &str) -> Result<Arc<SerialDevice>> {
        if !self.paired.iter().any(|d| d.mac == mac) {
            bail!("device {} is not paired", mac);
        }

        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| anyhow!("simulated device {} timed out", mac))?
            .map_err(|e| anyhow!("simulated device {} unreachable at {}: {}", mac, self.address, e))?;

        info!("[BT] Simulated {} connected via {}", mac, self.address);
        let device = Arc::new(SerialDevice::spawn(mac, stream));
        self.devices.insert(device.clone()).await;
        Ok(device)
    }

    async fn close_device(&self, mac: &str) {
        self.devices.close(mac).await;
    }

    async fn close_all(&self) {
        self.devices.close_all().await;
    }

    fn name(&self) -> &'static str {
        "TCP simulation"
    }
}
