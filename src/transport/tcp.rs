//! TCP transport implementation for WiFi peripherals

use crate::transport::traits::{TransportConnector, TransportLink};
use crate::transport::TransportError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use singularity_shared::{codec, protocol, ConnectionTarget, PeerHandle, TransportKind};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Read side of the socket with its reusable receive buffer
struct ReadState {
    stream: OwnedReadHalf,
    buf: BytesMut,
}

/// TCP link to a WiFi peripheral
///
/// Reads are non-blocking checks so the caller can interleave them with its
/// own shutdown signal. Writes are bounded by a timeout and abandoned as soon
/// as the link is closed, so `close` never waits on a peer that stopped
/// reading.
pub struct SocketLink {
    peer: PeerHandle,
    reader: Mutex<Option<ReadState>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closing: watch::Sender<bool>,
    open: AtomicBool,
    read_chunk_size: usize,
    write_timeout: Duration,
}

impl SocketLink {
    pub fn new(stream: TcpStream, peer: PeerHandle, read_chunk_size: usize) -> Self {
        let (reader, writer) = stream.into_split();
        let read_chunk_size = read_chunk_size.max(1);
        Self {
            peer,
            reader: Mutex::new(Some(ReadState {
                stream: reader,
                buf: BytesMut::with_capacity(read_chunk_size),
            })),
            writer: tokio::sync::Mutex::new(Some(writer)),
            closing: watch::channel(false).0,
            open: AtomicBool::new(true),
            read_chunk_size,
            write_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
        }
    }

    /// Override how long one `send` may wait on the peer
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Check for bytes that have already arrived
    ///
    /// Returns:
    /// - `Ok(Some(chunk))` if data was waiting
    /// - `Ok(None)` if nothing has arrived yet
    /// - `Err(ConnectionLost)` if the peer closed or the socket failed
    /// - `Err(Closed)` if the link was closed locally
    pub fn poll_read(&self) -> Result<Option<Bytes>, TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let state = guard.as_mut().ok_or(TransportError::Closed)?;

        // Only allocates again once the previous chunk is still referenced
        state.buf.reserve(self.read_chunk_size);
        match state.stream.try_read_buf(&mut state.buf) {
            Ok(0) => Err(self.lost()),
            Ok(_) => Ok(Some(state.buf.split().freeze())),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                debug!("[TCP] Read error from {}: {}", self.peer.address, e);
                Err(self.lost())
            }
        }
    }

    /// Mark the link dead after a failed read
    fn lost(&self) -> TransportError {
        if self.open.swap(false, Ordering::SeqCst) {
            TransportError::ConnectionLost
        } else {
            TransportError::Closed
        }
    }
}

#[async_trait]
impl TransportLink for SocketLink {
    fn peer(&self) -> &PeerHandle {
        &self.peer
    }

    async fn send(&self, payload: &str) -> Result<(), TransportError> {
        let mut closing = self.closing.subscribe();
        if *closing.borrow_and_update() {
            return Err(TransportError::SendFailed("socket is closed".into()));
        }

        let mut guard = tokio::select! {
            guard = self.writer.lock() => guard,
            _ = closing.changed() => {
                return Err(TransportError::SendFailed("socket is closed".into()));
            }
        };
        let writer = guard
            .as_mut()
            .ok_or_else(|| TransportError::SendFailed("socket is closed".into()))?;

        let line = codec::encode_line(payload);
        let write = async {
            writer.write_all(&line).await?;
            writer.flush().await
        };

        tokio::select! {
            result = timeout(self.write_timeout, write) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(TransportError::SendFailed(e.to_string())),
                Err(_) => {
                    warn!(
                        "[TCP] Write to {} timed out after {:?}",
                        self.peer.address, self.write_timeout
                    );
                    Err(TransportError::SendFailed(format!(
                        "timed out after {:?}",
                        self.write_timeout
                    )))
                }
            },
            _ = closing.changed() => Err(TransportError::SendFailed("socket is closed".into())),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Wakes any send still waiting on the peer so the writer lock frees up
        self.closing.send_replace(true);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match timeout(self.write_timeout, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("[TCP] Shutdown of {} failed: {}", self.peer.address, e),
                Err(_) => debug!("[TCP] Shutdown of {} timed out", self.peer.address),
            }
            info!("[TCP] Closed {}", self.peer.address);
        }
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Bound a connect attempt to `limit`, mapping every failure to `ConnectFailed`
async fn connect_within<T, F>(
    limit: Duration,
    address: &str,
    connect: F,
) -> Result<T, TransportError>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, connect).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(TransportError::ConnectFailed(format!("{}: {}", address, e))),
        Err(_) => Err(TransportError::ConnectFailed(format!(
            "{}: timed out after {:?}",
            address, limit
        ))),
    }
}

/// TCP connector for WiFi targets
pub struct SocketConnector {
    connect_timeout: Duration,
    write_timeout: Duration,
    read_chunk_size: usize,
    peer_ids: AtomicU64,
}

impl SocketConnector {
    pub fn new(connect_timeout: Duration, read_chunk_size: usize) -> Self {
        Self {
            connect_timeout,
            write_timeout: Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
            read_chunk_size,
            peer_ids: AtomicU64::new(0),
        }
    }

    /// Override the per-send write timeout of opened links
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }
}

impl Default for SocketConnector {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(protocol::CONNECT_TIMEOUT_MS),
            protocol::READ_CHUNK_SIZE,
        )
    }
}

#[async_trait]
impl TransportConnector for SocketConnector {
    type Link = SocketLink;

    async fn open(&self, target: &ConnectionTarget) -> Result<Self::Link, TransportError> {
        let ConnectionTarget::Wifi { .. } = target else {
            return Err(TransportError::ConnectFailed(format!(
                "{} target cannot be opened over WiFi",
                target.kind()
            )));
        };

        let address = target.address();
        debug!("[TCP] Connecting to {}", address);

        let stream =
            connect_within(self.connect_timeout, &address, TcpStream::connect(&address)).await?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("[TCP] Could not set TCP_NODELAY on {}: {}", address, e);
        }

        let id = self.peer_ids.fetch_add(1, Ordering::SeqCst) + 1;
        info!("[TCP] Connected to {}", address);
        Ok(SocketLink::new(
            stream,
            PeerHandle::new(id, TransportKind::Wifi, address),
            self.read_chunk_size,
        )
        .with_write_timeout(self.write_timeout))
    }

    fn name(&self) -> &'static str {
        "WiFi"
    }
}
