//! RFCOMM serial bridge for classic Bluetooth peripherals (BlueZ)

use crate::transport::serial::{OpenDevices, SerialDevice, SerialDeviceBridge};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bluer::rfcomm::{SocketAddr as RfcommAddr, Stream as RfcommStream};
use bluer::{Adapter, Address};
use singularity_shared::{protocol, DeviceSignature};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration for the RFCOMM bridge
#[derive(Debug, Clone)]
pub struct RfcommConfig {
    /// RFCOMM channel the peripheral's serial port profile listens on
    pub channel: u8,
    /// Adapter name (`hci0`); `None` picks the default adapter
    pub adapter: Option<String>,
}

impl Default for RfcommConfig {
    fn default() -> Self {
        Self {
            channel: protocol::DEFAULT_RFCOMM_CHANNEL,
            adapter: None,
        }
    }
}

/// Serial bridge opening RFCOMM streams through BlueZ
pub struct RfcommBridge {
    config: RfcommConfig,
    devices: OpenDevices,
}

impl RfcommBridge {
    pub fn new(config: RfcommConfig) -> Self {
        Self {
            config,
            devices: OpenDevices::new(),
        }
    }

    /// Get the configured Bluetooth adapter, powered on
    async fn adapter(&self) -> Result<Adapter> {
        let session = bluer::Session::new().await?;
        let adapter = match &self.config.adapter {
            Some(name) => session.adapter(name)?,
            None => session.default_adapter().await?,
        };
        adapter.set_powered(true).await?;
        Ok(adapter)
    }
}

#[async_trait]
impl SerialDeviceBridge for RfcommBridge {
    async fn paired_devices(&self) -> Result<Vec<DeviceSignature>> {
        let adapter = self.adapter().await?;
        let mut paired = Vec::new();

        for addr in adapter.device_addresses().await? {
            let device = adapter.device(addr)?;
            if !device.is_paired().await.unwrap_or(false) {
                continue;
            }
            let name = device.name().await.ok().flatten().unwrap_or_default();
            paired.push(DeviceSignature::new(name, addr.to_string()));
        }

        debug!("[BT] {} paired devices on {}", paired.len(), adapter.name());
        Ok(paired)
    }

    async fn open_serial_device(&self, mac: &str) -> Result<Arc<SerialDevice>> {
        let address: Address = mac
            .parse()
            .map_err(|e| anyhow!("invalid Bluetooth address {}: {}", mac, e))?;

        // Make sure the radio is up before dialing
        self.adapter().await?;

        let socket_addr = RfcommAddr::new(address, self.config.channel);
        info!("[BT] Connecting to {} channel {}", address, self.config.channel);

        let stream = RfcommStream::connect(socket_addr)
            .await
            .map_err(|e| anyhow!("RFCOMM connect failed: {}", e))?;

        info!("[BT] Connected to {}", address);
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
        "RFCOMM"
    }
}
