//! Line-oriented serial devices and the bridge that owns them
//!
//! A classic-Bluetooth serial peripheral is reached through an external
//! device bridge. The bridge opens devices by mac, keeps them until they are
//! closed, and delivers whole newline-terminated messages. No start/end
//! framing is applied on this path.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use singularity_shared::{codec, DeviceSignature};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// External serial-device registry (the native Bluetooth serial library)
#[async_trait]
pub trait SerialDeviceBridge: Send + Sync + 'static {
    /// Devices already paired with the local radio
    async fn paired_devices(&self) -> Result<Vec<DeviceSignature>>;

    /// Open the device with the given mac and keep it until closed
    async fn open_serial_device(&self, mac: &str) -> Result<Arc<SerialDevice>>;

    /// Close one device; unknown macs are ignored
    async fn close_device(&self, mac: &str);

    /// Close every device this bridge opened
    async fn close_all(&self);

    /// Human-readable name for this bridge
    fn name(&self) -> &'static str;
}

/// An open serial device delivering newline-terminated messages
pub struct SerialDevice {
    mac: String,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    messages: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    closing: watch::Sender<bool>,
    open: Arc<AtomicBool>,
}

impl SerialDevice {
    /// Wrap a duplex stream and start delivering its lines
    pub fn spawn<S>(mac: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mac = mac.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));

        let reader_open = open.clone();
        let reader_mac = mac.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim_end_matches('\r');
                        if line.is_empty() {
                            continue;
                        }
                        if message_tx.send(line.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("[BT] Read error from {}: {}", reader_mac, e);
                        break;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            debug!("[BT] Message stream of {} ended", reader_mac);
        });

        let writer: BoxedWriter = Box::new(write_half);
        Self {
            mac,
            writer: tokio::sync::Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            messages: Mutex::new(Some(message_rx)),
            closing: watch::channel(false).0,
            open,
        }
    }

    /// Bluetooth address of the device
    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// Whether the device is still delivering and accepting messages
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Take the receiving end of the message listener
    ///
    /// The channel closes when the device stream ends or the device is
    /// closed. Only the first caller gets it.
    pub fn take_messages(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Write one message followed by a newline
    ///
    /// A write still in progress when the device is closed is abandoned.
    pub async fn send_message(&self, message: &str) -> Result<()> {
        let mut closing = self.closing.subscribe();
        if *closing.borrow_and_update() {
            bail!("device {} is closed", self.mac);
        }

        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = closing.changed() => bail!("device {} is closed", self.mac),
        };
        let Some(writer) = guard.as_mut() else {
            bail!("device {} is closed", self.mac);
        };

        let line = codec::encode_line(message);
        let write = async {
            writer.write_all(&line).await?;
            writer.flush().await
        };
        tokio::select! {
            result = write => Ok(result?),
            _ = closing.changed() => bail!("device {} was closed during a write", self.mac),
        }
    }

    /// Stop delivery and release the stream. Closing twice is a no-op.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closing.send_replace(true);

        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("[BT] Shutdown of {} failed: {}", self.mac, e);
            }
            info!("[BT] Closed {}", self.mac);
        }
    }
}

/// Devices a bridge currently holds open, keyed by mac
#[derive(Default)]
pub struct OpenDevices {
    devices: tokio::sync::Mutex<HashMap<String, Arc<SerialDevice>>>,
}

impl OpenDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened device, closing any older one with the same mac
    pub async fn insert(&self, device: Arc<SerialDevice>) {
        let previous = self
            .devices
            .lock()
            .await
            .insert(device.mac().to_string(), device);
        if let Some(previous) = previous {
            previous.close().await;
        }
    }

    /// Close and forget one device
    pub async fn close(&self, mac: &str) {
        let device = self.devices.lock().await.remove(mac);
        if let Some(device) = device {
            device.close().await;
        }
    }

    /// Close and forget every device
    pub async fn close_all(&self) {
        let devices: Vec<_> = self.devices.lock().await.drain().map(|(_, d)| d).collect();
        join_all(devices.iter().map(|d| d.close())).await;
    }

    /// Number of devices held open
    pub async fn len(&self) -> usize {
        self.devices.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
