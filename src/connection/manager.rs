//! Connection manager owning the single active link to a peripheral

use crate::connection::config::{BluetoothMode, ManagerConfig};
use crate::connection::events::{ConnectionEvent, EventBus, EventReceiver};
use crate::registry::DeviceRegistry;
use crate::transport::{
    BluetoothConnector, BluetoothLink, SerialDeviceBridge, SocketConnector, SocketLink,
    TcpSimulationBridge, TransportConnector, TransportError, TransportLink,
};
use singularity_shared::codec::{FrameDecoder, FrameMarkers};
use singularity_shared::state_machine::{ConnectionStateMachine, LinkEvent, Transition};
use singularity_shared::{
    ConnectionState, ConnectionTarget, DeviceSignature, PeerHandle, TransportKind,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// The connector matching the manager's transport kind
enum Connector {
    Wifi(Arc<SocketConnector>),
    Bluetooth(Arc<BluetoothConnector>),
}

impl Connector {
    fn name(&self) -> &'static str {
        match self {
            Connector::Wifi(c) => c.name(),
            Connector::Bluetooth(c) => c.name(),
        }
    }

    fn bridge(&self) -> Option<Arc<dyn SerialDeviceBridge>> {
        match self {
            Connector::Wifi(_) => None,
            Connector::Bluetooth(c) => Some(c.bridge().clone()),
        }
    }
}

/// Read loop parameters for the WiFi stream
#[derive(Debug, Clone, Copy)]
struct ReadSettings {
    poll_interval: Duration,
    markers: FrameMarkers,
}

/// The live connection and the task reading from it
struct ActiveSession {
    link: Arc<dyn TransportLink>,
    shutdown: watch::Sender<bool>,
    reader: Option<JoinHandle<()>>,
}

/// An open running in the background
struct PendingOpen {
    task: JoinHandle<()>,
    /// Mac of the Bluetooth device being opened
    device: Option<String>,
}

/// Everything detached from the manager by a teardown, still to be closed
#[derive(Default)]
struct Released {
    pending: Option<PendingOpen>,
    active: Option<ActiveSession>,
    peers: Vec<Arc<dyn TransportLink>>,
}

impl Released {
    fn is_empty(&self) -> bool {
        self.active.is_none() && self.peers.is_empty()
    }

    /// Stop the pending open and the read loop without waiting for them
    fn stop_reader(&mut self) {
        if let Some(pending) = &self.pending {
            pending.task.abort();
        }
        if let Some(active) = &mut self.active {
            let _ = active.shutdown.send(true);
            if let Some(reader) = active.reader.take() {
                reader.abort();
            }
        }
    }

    /// Signal the read loop, close every link and wait for the loop to exit
    ///
    /// A device the aborted open may already have registered with the
    /// bridge is closed there too.
    async fn close(mut self, bridge: Option<&dyn SerialDeviceBridge>) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
            let _ = pending.task.await;
            if let (Some(mac), Some(bridge)) = (pending.device, bridge) {
                debug!("[CONN] Releasing {} after an abandoned open", mac);
                bridge.close_device(&mac).await;
            }
        }

        let reader = match &mut self.active {
            Some(active) => {
                let _ = active.shutdown.send(true);
                active.reader.take()
            }
            None => None,
        };

        if let Some(active) = &self.active {
            active.link.close().await;
        }
        for peer in &self.peers {
            peer.close().await;
        }

        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                if !e.is_cancelled() {
                    warn!("[CONN] Read loop ended abnormally: {}", e);
                }
            }
        }
    }
}

/// Mutable connection state, only touched under the manager lock
struct Inner {
    fsm: ConnectionStateMachine,
    /// Generation of the current attempt; stale opens and loops compare against it
    session: u64,
    pending: Option<PendingOpen>,
    active: Option<ActiveSession>,
    registry: DeviceRegistry<dyn TransportLink>,
}

impl Inner {
    fn new() -> Self {
        Self {
            fsm: ConnectionStateMachine::new(),
            session: 0,
            pending: None,
            active: None,
            registry: DeviceRegistry::new(),
        }
    }

    /// Start a new generation, invalidating every in-flight open and loop
    fn next_session(&mut self) -> u64 {
        self.session += 1;
        self.session
    }

    fn transition(&mut self, event: LinkEvent) {
        match self.fsm.process_event(event) {
            Transition::Changed { from, to } => debug!("[CONN] {} -> {}", from, to),
            Transition::Unchanged(_) => {}
            Transition::Invalid { from, event } => {
                debug!("[CONN] Ignoring {:?} while {}", event, from)
            }
        }
    }

    /// Detach the active session, the peer registry and any pending open
    fn release(&mut self) -> Released {
        let pending = self.pending.take();
        if let Some(pending) = &pending {
            pending.task.abort();
        }
        let active = self.active.take();
        let active_id = active.as_ref().map(|a| a.link.peer().id);
        let peers = self
            .registry
            .clear()
            .into_iter()
            .filter(|p| Some(p.peer().id) != active_id)
            .collect();
        Released {
            pending,
            active,
            peers,
        }
    }
}

/// State shared between the manager and its background tasks
struct Shared {
    inner: Mutex<Inner>,
    events: EventBus,
    bridge: Option<Arc<dyn SerialDeviceBridge>>,
}

impl Shared {
    /// Emit a message if `session` is still the live one
    async fn deliver(&self, session: u64, message: String) -> bool {
        let inner = self.inner.lock().await;
        if inner.session != session || inner.active.is_none() {
            return false;
        }
        self.events.emit(ConnectionEvent::MessageReceived(message));
        true
    }

    /// Report a fatal link error and tear the session down
    async fn fail(&self, session: u64, error: TransportError) {
        let released = {
            let mut inner = self.inner.lock().await;
            if inner.session != session {
                return;
            }
            warn!("[CONN] {}", error);
            self.events.emit(ConnectionEvent::Error(error.to_string()));

            inner.next_session();
            inner.transition(LinkEvent::ConnectionLost);
            let mut released = inner.release();
            // Called from the read loop itself; it must not wait on its own handle
            if let Some(active) = &mut released.active {
                active.reader.take();
            }
            released
        };
        released.close(self.bridge.as_deref()).await;
    }

    /// Report a non-fatal error for `session`
    async fn report(&self, session: u64, error: TransportError) {
        let inner = self.inner.lock().await;
        if inner.session == session {
            warn!("[CONN] {}", error);
            self.events.emit(ConnectionEvent::Error(error.to_string()));
        }
    }

    /// Disconnect everything; shared by `disconnect`, `shutdown` and drop
    async fn teardown(&self) {
        let released = {
            let mut inner = self.inner.lock().await;
            inner.next_session();
            inner.transition(LinkEvent::DisconnectRequested);
            inner.release()
        };
        let had_connection = !released.is_empty();
        released.close(self.bridge.as_deref()).await;
        if let Some(bridge) = &self.bridge {
            bridge.close_all().await;
        }
        if had_connection {
            info!("[CONN] Disconnected");
        }
    }

    async fn finish_socket_open(
        self: Arc<Self>,
        session: u64,
        result: Result<SocketLink, TransportError>,
        settings: ReadSettings,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.session != session {
            drop(inner);
            if let Ok(link) = result {
                debug!("[CONN] Discarding stale connection to {}", link.peer());
                link.close().await;
            }
            return;
        }
        inner.pending = None;

        match result {
            Ok(link) => {
                let link = Arc::new(link);
                let peer = link.peer().clone();
                inner.transition(LinkEvent::Opened);
                info!("[CONN] Connected to {}", peer);
                self.events.emit(ConnectionEvent::Connected { peer });

                let (shutdown_tx, shutdown_rx) = watch::channel(false);
                let reader = tokio::spawn(socket_read_loop(
                    self.clone(),
                    session,
                    link.clone(),
                    shutdown_rx,
                    settings,
                ));
                inner.active = Some(ActiveSession {
                    link,
                    shutdown: shutdown_tx,
                    reader: Some(reader),
                });
            }
            Err(e) => {
                inner.transition(LinkEvent::OpenFailed);
                warn!("[CONN] {}", e);
                self.events.emit(ConnectionEvent::Error(e.to_string()));
            }
        }
    }

    async fn finish_bluetooth_open(
        self: Arc<Self>,
        session: u64,
        result: Result<BluetoothLink, TransportError>,
    ) {
        let mut inner = self.inner.lock().await;
        if inner.session != session {
            drop(inner);
            if let Ok(link) = result {
                debug!("[CONN] Discarding stale connection to {}", link.peer());
                link.close().await;
            }
            return;
        }
        inner.pending = None;

        let link = match result {
            Ok(link) => Arc::new(link),
            Err(e) => {
                inner.transition(LinkEvent::OpenFailed);
                warn!("[CONN] {}", e);
                self.events.emit(ConnectionEvent::Error(e.to_string()));
                return;
            }
        };

        let Some(messages) = link.take_messages() else {
            inner.transition(LinkEvent::OpenFailed);
            let error = TransportError::ConnectFailed(format!(
                "{} is already being read elsewhere",
                link.signature()
            ));
            warn!("[CONN] {}", error);
            self.events.emit(ConnectionEvent::Error(error.to_string()));
            drop(inner);
            link.close().await;
            return;
        };

        let peer = link.peer().clone();
        inner.transition(LinkEvent::Opened);
        info!("[CONN] Connected to {} ({})", link.signature(), peer);
        self.events.emit(ConnectionEvent::Connected { peer });

        let replaced = inner.registry.add(link.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reader = tokio::spawn(bluetooth_read_loop(
            self.clone(),
            session,
            messages,
            shutdown_rx,
        ));
        inner.active = Some(ActiveSession {
            link,
            shutdown: shutdown_tx,
            reader: Some(reader),
        });
        drop(inner);

        if let Some(replaced) = replaced {
            replaced.close().await;
        }
    }
}

/// Poll the socket at a fixed cadence and decode marker frames
async fn socket_read_loop(
    shared: Arc<Shared>,
    session: u64,
    link: Arc<SocketLink>,
    mut shutdown: watch::Receiver<bool>,
    settings: ReadSettings,
) {
    let mut decoder = FrameDecoder::with_markers(settings.markers);
    let mut ticker = interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        loop {
            match link.poll_read() {
                Ok(Some(chunk)) => {
                    if let Some(message) = decoder.push(&chunk) {
                        if !shared.deliver(session, message).await {
                            return;
                        }
                    }
                }
                Ok(None) => break,
                Err(TransportError::Closed) => {
                    debug!("[CONN] Read loop {} saw local close", session);
                    return;
                }
                Err(e) => {
                    shared.fail(session, e).await;
                    return;
                }
            }
        }
    }

    debug!("[CONN] Read loop {} stopped", session);
}

/// Forward messages pushed by the Bluetooth device
async fn bluetooth_read_loop(
    shared: Arc<Shared>,
    session: u64,
    mut messages: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            message = messages.recv() => match message {
                Some(message) => {
                    if !shared.deliver(session, message).await {
                        break;
                    }
                }
                None => {
                    shared.fail(session, TransportError::ConnectionLost).await;
                    break;
                }
            }
        }
    }

    debug!("[CONN] Message listener {} stopped", session);
}

/// Manages the single logical connection to a peripheral
///
/// All operations return quickly: `connect` starts the open in the
/// background and its outcome arrives as a `Connected` or `Error` event.
/// Events for one connection are ordered: one `Connected`, then messages,
/// then at most one fatal `Error`. Nothing is delivered after `disconnect`.
pub struct ConnectionManager {
    config: ManagerConfig,
    connector: Connector,
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a manager for the configured transport
    ///
    /// Bluetooth managers use the bridge selected by `config.bluetooth.mode`.
    pub fn new(config: ManagerConfig) -> Self {
        let connector = match config.transport {
            TransportKind::Wifi => Connector::Wifi(Arc::new(
                SocketConnector::new(config.wifi.connect_timeout, config.wifi.read_chunk_size)
                    .with_write_timeout(config.wifi.write_timeout),
            )),
            TransportKind::Bluetooth => {
                let bridge: Arc<dyn SerialDeviceBridge> = match config.bluetooth.mode {
                    #[cfg(feature = "rfcomm")]
                    BluetoothMode::Rfcomm => {
                        Arc::new(crate::transport::RfcommBridge::new(crate::transport::RfcommConfig {
                            channel: config.bluetooth.channel,
                            ..Default::default()
                        }))
                    }
                    BluetoothMode::TcpSimulation => Arc::new(
                        TcpSimulationBridge::new(
                            config.bluetooth.tcp_address.clone(),
                            config.bluetooth.paired.clone(),
                        )
                        .with_connect_timeout(config.bluetooth.connect_timeout),
                    ),
                };
                Connector::Bluetooth(Arc::new(
                    BluetoothConnector::new(bridge)
                        .with_connect_timeout(config.bluetooth.connect_timeout)
                        .with_write_timeout(config.bluetooth.write_timeout),
                ))
            }
        };
        Self::with_connector(config, connector)
    }

    /// Create a Bluetooth manager on a caller-supplied serial bridge
    pub fn with_bridge(mut config: ManagerConfig, bridge: Arc<dyn SerialDeviceBridge>) -> Self {
        config.transport = TransportKind::Bluetooth;
        let connector = Connector::Bluetooth(Arc::new(
            BluetoothConnector::new(bridge)
                .with_connect_timeout(config.bluetooth.connect_timeout)
                .with_write_timeout(config.bluetooth.write_timeout),
        ));
        Self::with_connector(config, connector)
    }

    fn with_connector(config: ManagerConfig, connector: Connector) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::new()),
            events: EventBus::new(),
            bridge: connector.bridge(),
        });
        Self {
            config,
            connector,
            shared,
        }
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events.subscribe()
    }

    /// The manager configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Current connection state
    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.lock().await.fsm.state()
    }

    /// Handle of the active connection, if any
    pub async fn active_peer(&self) -> Option<PeerHandle> {
        let inner = self.shared.inner.lock().await;
        inner.active.as_ref().map(|a| a.link.peer().clone())
    }

    /// Addresses of registered Bluetooth peers
    pub async fn connected_peers(&self) -> Vec<String> {
        self.shared.inner.lock().await.registry.addresses()
    }

    /// Devices paired with the local radio (empty for WiFi)
    pub async fn paired_devices(&self) -> anyhow::Result<Vec<DeviceSignature>> {
        match &self.shared.bridge {
            Some(bridge) => bridge.paired_devices().await,
            None => Ok(Vec::new()),
        }
    }

    /// Connect to the WiFi peripheral named in the configuration
    pub async fn connect_configured(&self) {
        self.connect(self.config.wifi.target()).await;
    }

    /// Start connecting to `target`
    ///
    /// Any existing connection is closed first. The result is reported
    /// through `Connected` or `Error`.
    pub async fn connect(&self, target: ConnectionTarget) {
        if target.kind() != self.config.transport {
            let error = TransportError::ConnectFailed(format!(
                "manager drives {}, cannot reach {} target {}",
                self.config.transport,
                target.kind(),
                target
            ));
            warn!("[CONN] {}", error);
            self.shared.events.emit(ConnectionEvent::Error(error.to_string()));
            return;
        }

        let (session, released) = {
            let mut inner = self.shared.inner.lock().await;
            let released = inner.release();
            let session = inner.next_session();
            inner.transition(LinkEvent::ConnectRequested);
            (session, released)
        };

        if !released.is_empty() {
            info!("[CONN] Closing previous connection before reconnecting");
        }
        released.close(self.shared.bridge.as_deref()).await;

        let mut inner = self.shared.inner.lock().await;
        if inner.session != session {
            // Disconnected while the old link was closing
            return;
        }

        info!("[CONN] Connecting to {} via {}", target, self.connector.name());
        let device = match &target {
            ConnectionTarget::Bluetooth(signature) => Some(signature.mac.clone()),
            ConnectionTarget::Wifi { .. } => None,
        };
        let shared = self.shared.clone();
        let task = match &self.connector {
            Connector::Wifi(connector) => {
                let connector = connector.clone();
                let settings = ReadSettings {
                    poll_interval: self.config.wifi.poll_interval,
                    markers: self.config.markers,
                };
                tokio::spawn(async move {
                    let result = connector.open(&target).await;
                    shared.finish_socket_open(session, result, settings).await;
                })
            }
            Connector::Bluetooth(connector) => {
                let connector = connector.clone();
                tokio::spawn(async move {
                    let result = connector.open(&target).await;
                    shared.finish_bluetooth_open(session, result).await;
                })
            }
        };
        inner.pending = Some(PendingOpen { task, device });
    }

    /// Send a message over the active connection
    ///
    /// Without an active connection this does nothing and reports nothing.
    /// Write failures are reported as `Error` and do not change state.
    pub async fn send(&self, message: &str) {
        let target = {
            let inner = self.shared.inner.lock().await;
            inner
                .active
                .as_ref()
                .map(|a| (inner.session, a.link.clone()))
        };
        let Some((session, link)) = target else {
            debug!("[CONN] Not connected, dropping outbound message");
            return;
        };

        if let Err(e) = link.send(message).await {
            self.shared.report(session, e).await;
        }
    }

    /// Send a message to a specific registered Bluetooth peer
    pub async fn send_to(&self, device: &DeviceSignature, message: &str) {
        let target = {
            let inner = self.shared.inner.lock().await;
            inner
                .registry
                .find(&device.mac)
                .map(|link| (inner.session, link))
        };
        let Some((session, link)) = target else {
            debug!("[CONN] {} is not connected, dropping message", device);
            return;
        };

        if let Err(e) = link.send(message).await {
            self.shared.report(session, e).await;
        }
    }

    /// Close the active connection and clear the peer registry
    ///
    /// Never raises an `Error` event.
    pub async fn disconnect(&self) {
        self.shared.teardown().await;
    }

    /// Close one registered Bluetooth peer
    ///
    /// When it is the active connection the manager returns to Disconnected.
    pub async fn disconnect_device(&self, device: &DeviceSignature) {
        let (removed, released) = {
            let mut inner = self.shared.inner.lock().await;
            let is_active = inner
                .active
                .as_ref()
                .is_some_and(|a| a.link.peer().address == device.mac);
            if is_active {
                inner.next_session();
                inner.transition(LinkEvent::DisconnectRequested);
                (None, inner.release())
            } else {
                (inner.registry.remove(&device.mac), Released::default())
            }
        };

        if let Some(link) = removed {
            link.close().await;
        }
        released.close(self.shared.bridge.as_deref()).await;
        info!("[CONN] Disconnected {}", device);
    }

    /// Close everything this manager holds
    pub async fn shutdown(&self) {
        self.disconnect().await;
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    shared.teardown().await;
                });
            }
            Err(_) => {
                // No runtime left to close links on; stop the loops so the
                // last references (and sockets) are dropped.
                if let Ok(mut inner) = shared.inner.try_lock() {
                    inner.next_session();
                    let mut released = inner.release();
                    released.stop_reader();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::BluetoothConfig;
    use crate::transport::SerialDevice;
    use async_trait::async_trait;
    use singularity_shared::codec::encode_frame;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next_event(events: &mut EventReceiver) -> ConnectionEvent {
        timeout(WAIT, events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed")
    }

    /// Assert nothing arrives for a few polling intervals
    async fn assert_quiet(events: &mut EventReceiver) {
        let result = timeout(Duration::from_millis(250), events.recv()).await;
        assert!(result.is_err(), "unexpected event: {:?}", result);
    }

    async fn wifi_setup() -> (ConnectionManager, EventReceiver, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let mut config = ManagerConfig::wifi("127.0.0.1", port);
        config.wifi.poll_interval = Duration::from_millis(10);
        let manager = ConnectionManager::new(config);
        let events = manager.subscribe();
        (manager, events, listener)
    }

    async fn connect_wifi(
        manager: &ConnectionManager,
        events: &mut EventReceiver,
        listener: &TcpListener,
    ) -> TcpStream {
        manager.connect_configured().await;
        let (peer, _) = listener.accept().await.expect("accept");
        assert!(matches!(
            next_event(events).await,
            ConnectionEvent::Connected { .. }
        ));
        peer
    }

    fn hc05() -> DeviceSignature {
        DeviceSignature::new("HC-05", "00:11:22:33:44:55")
    }

    fn hc06() -> DeviceSignature {
        DeviceSignature::new("HC-06", "66:77:88:99:AA:BB")
    }

    /// Native-style bridge that opens in-memory devices after a delay
    struct SlowBridge {
        open_delay: Duration,
        remotes: std::sync::Mutex<Vec<DuplexStream>>,
        closed: std::sync::Mutex<Vec<String>>,
    }

    impl SlowBridge {
        fn new(open_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                open_delay,
                remotes: Default::default(),
                closed: Default::default(),
            })
        }

        fn closed(&self) -> Vec<String> {
            self.closed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SerialDeviceBridge for SlowBridge {
        async fn paired_devices(&self) -> anyhow::Result<Vec<DeviceSignature>> {
            Ok(vec![hc05(), hc06()])
        }

        async fn open_serial_device(&self, mac: &str) -> anyhow::Result<Arc<SerialDevice>> {
            tokio::time::sleep(self.open_delay).await;
            let (local, remote) = duplex(1024);
            self.remotes.lock().unwrap().push(remote);
            Ok(Arc::new(SerialDevice::spawn(mac, local)))
        }

        async fn close_device(&self, mac: &str) {
            self.closed.lock().unwrap().push(mac.to_string());
        }

        async fn close_all(&self) {}

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    /// Large enough to fill both loopback socket buffers
    fn oversized_payload() -> String {
        "x".repeat(32 * 1024 * 1024)
    }

    async fn wifi_setup_with_write_timeout(
        write_timeout: Duration,
    ) -> (Arc<ConnectionManager>, EventReceiver, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let mut config = ManagerConfig::wifi("127.0.0.1", port);
        config.wifi.poll_interval = Duration::from_millis(10);
        config.wifi.write_timeout = write_timeout;
        let manager = Arc::new(ConnectionManager::new(config));
        let events = manager.subscribe();
        (manager, events, listener)
    }

    async fn bluetooth_setup() -> (ConnectionManager, EventReceiver, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let config = ManagerConfig {
            transport: TransportKind::Bluetooth,
            bluetooth: BluetoothConfig {
                tcp_address: listener.local_addr().expect("addr").to_string(),
                paired: vec![hc05()],
                ..Default::default()
            },
            ..Default::default()
        };
        let manager = ConnectionManager::new(config);
        let events = manager.subscribe();
        (manager, events, listener)
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (manager, mut events, listener) = wifi_setup().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        let peer = connect_wifi(&manager, &mut events, &listener).await;
        assert_eq!(manager.state().await, ConnectionState::Connected);
        assert_eq!(
            manager.active_peer().await.map(|p| p.kind),
            Some(TransportKind::Wifi)
        );

        manager.send("ping").await;

        let mut peer = BufReader::new(peer);
        let mut line = String::new();
        peer.read_line(&mut line).await.expect("read");
        assert_eq!(line, "ping\n");

        let echo = encode_frame(line.trim_end(), FrameMarkers::default());
        peer.get_mut().write_all(&echo).await.expect("write");

        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::MessageReceived("ping".into())
        );
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_fragmented_and_duplicate_frames() {
        let (manager, mut events, listener) = wifi_setup().await;
        let mut peer = connect_wifi(&manager, &mut events, &listener).await;

        peer.write_all(b"noiseS4").await.expect("write");
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.write_all(b"2E").await.expect("write");
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::MessageReceived("42".into())
        );

        peer.write_all(b"S42E").await.expect("write");
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.write_all(b"S43E").await.expect("write");
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::MessageReceived("43".into())
        );
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_connection_lost_reported_once() {
        let (manager, mut events, listener) = wifi_setup().await;
        let peer = connect_wifi(&manager, &mut events, &listener).await;

        drop(peer);

        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Error("Connection lost".into())
        );
        assert_quiet(&mut events).await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(manager.active_peer().await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_is_silent_and_stops_delivery() {
        let (manager, mut events, listener) = wifi_setup().await;
        let mut peer = connect_wifi(&manager, &mut events, &listener).await;

        manager.disconnect().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(manager.connected_peers().await.is_empty());

        // Late data from the peer must not surface
        let _ = peer.write_all(b"SlateE").await;
        assert_quiet(&mut events).await;

        // Disconnecting again is harmless
        manager.disconnect().await;
        assert_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_send_while_disconnected_is_noop() {
        let (manager, mut events, _listener) = wifi_setup().await;

        manager.send("ping").await;

        assert_quiet(&mut events).await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let (manager, mut events, listener) = wifi_setup().await;
        drop(listener);

        manager.connect_configured().await;

        match next_event(&mut events).await {
            ConnectionEvent::Error(reason) => assert!(reason.starts_with("Connect failed")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_closes_previous_socket() {
        let (manager, mut events, listener) = wifi_setup().await;
        let first = connect_wifi(&manager, &mut events, &listener).await;
        let first_peer = manager.active_peer().await.expect("peer");

        let _second = connect_wifi(&manager, &mut events, &listener).await;
        let second_peer = manager.active_peer().await.expect("peer");
        assert_ne!(first_peer.id, second_peer.id);

        // The first socket was closed by the manager, not reported as lost
        let mut first = BufReader::new(first);
        let mut line = String::new();
        let read = timeout(WAIT, first.read_line(&mut line)).await.expect("timeout");
        assert_eq!(read.expect("read"), 0);
        assert_quiet(&mut events).await;
        assert_eq!(manager.state().await, ConnectionState::Connected);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_drops_late_open() {
        let (manager, mut events, listener) = wifi_setup().await;

        manager.connect_configured().await;
        manager.disconnect().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);

        // The listener may still accept the aborted attempt
        let _ = timeout(Duration::from_millis(100), listener.accept()).await;
        assert_quiet(&mut events).await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_wrong_target_kind() {
        let (manager, mut events, _listener) = wifi_setup().await;

        manager.connect(ConnectionTarget::Bluetooth(hc05())).await;

        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Error(_)
        ));
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(manager.paired_devices().await.expect("paired").is_empty());
    }

    #[tokio::test]
    async fn test_bluetooth_session() {
        let (manager, mut events, listener) = bluetooth_setup().await;
        assert_eq!(manager.paired_devices().await.expect("paired"), vec![hc05()]);

        manager.connect(ConnectionTarget::Bluetooth(hc05())).await;
        let (peer, _) = listener.accept().await.expect("accept");
        match next_event(&mut events).await {
            ConnectionEvent::Connected { peer } => assert_eq!(peer.address, hc05().mac),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(manager.connected_peers().await, vec![hc05().mac]);

        manager.send_to(&hc05(), "led on").await;
        let mut peer = BufReader::new(peer);
        let mut line = String::new();
        peer.read_line(&mut line).await.expect("read");
        assert_eq!(line, "led on\n");

        // Pre-framed: each line is a message, markers are not interpreted
        peer.get_mut().write_all(b"SENSOR 12\n").await.expect("write");
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::MessageReceived("SENSOR 12".into())
        );

        manager.disconnect().await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(manager.connected_peers().await.is_empty());
        assert_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_bluetooth_unpaired_device() {
        let (manager, mut events, _listener) = bluetooth_setup().await;

        manager
            .connect(ConnectionTarget::Bluetooth(DeviceSignature::new(
                "stranger",
                "66:77:88:99:AA:BB",
            )))
            .await;

        match next_event(&mut events).await {
            ConnectionEvent::Error(reason) => assert!(reason.contains("not paired")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_bluetooth_device_loss() {
        let (manager, mut events, listener) = bluetooth_setup().await;
        manager.connect(ConnectionTarget::Bluetooth(hc05())).await;
        let (peer, _) = listener.accept().await.expect("accept");
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Connected { .. }
        ));

        drop(peer);

        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Error("Connection lost".into())
        );
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(manager.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_device() {
        let (manager, mut events, listener) = bluetooth_setup().await;
        manager.connect(ConnectionTarget::Bluetooth(hc05())).await;
        let _peer = listener.accept().await.expect("accept");
        next_event(&mut events).await;

        // Unknown devices are ignored
        manager
            .disconnect_device(&DeviceSignature::new("other", "66:77:88:99:AA:BB"))
            .await;
        assert_eq!(manager.state().await, ConnectionState::Connected);

        manager.disconnect_device(&hc05()).await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(manager.connected_peers().await.is_empty());
        assert_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_stalled_send_reports_timeout() {
        let (manager, mut events, listener) =
            wifi_setup_with_write_timeout(Duration::from_millis(200)).await;
        // The peer never reads
        let _peer = connect_wifi(&manager, &mut events, &listener).await;

        timeout(WAIT, manager.send(&oversized_payload()))
            .await
            .expect("send must give up on its own");

        match next_event(&mut events).await {
            ConnectionEvent::Error(reason) => {
                assert!(reason.starts_with("Send failed"), "{reason}");
                assert!(reason.contains("timed out"), "{reason}");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(manager.state().await, ConnectionState::Connected);
        manager.disconnect().await;
    }

    #[tokio::test]
    async fn test_disconnect_not_blocked_by_stalled_send() {
        let (manager, mut events, listener) =
            wifi_setup_with_write_timeout(Duration::from_secs(60)).await;
        let _peer = connect_wifi(&manager, &mut events, &listener).await;

        let sender = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.send(&oversized_payload()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        timeout(WAIT, manager.disconnect())
            .await
            .expect("disconnect waited behind a stalled send");
        timeout(WAIT, sender)
            .await
            .expect("send still blocked after disconnect")
            .expect("join");

        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        // The interrupted write belongs to a closed session and is not reported
        assert_quiet(&mut events).await;
    }

    #[tokio::test]
    async fn test_drop_closes_socket() {
        let (manager, mut events, listener) = wifi_setup().await;
        let peer = connect_wifi(&manager, &mut events, &listener).await;

        drop(manager);

        let mut peer = peer;
        let mut buf = [0u8; 16];
        let read = timeout(WAIT, peer.read(&mut buf))
            .await
            .expect("socket still open after drop");
        assert_eq!(read.expect("read"), 0);
    }

    #[tokio::test]
    async fn test_native_bridge_open_timeout() {
        let bridge = SlowBridge::new(Duration::from_secs(5));
        let mut config = ManagerConfig::bluetooth();
        config.bluetooth.connect_timeout = Duration::from_millis(50);
        let manager = ConnectionManager::with_bridge(config, bridge.clone());
        let mut events = manager.subscribe();
        assert_eq!(
            manager.paired_devices().await.expect("paired"),
            vec![hc05(), hc06()]
        );

        manager.connect(ConnectionTarget::Bluetooth(hc05())).await;

        match next_event(&mut events).await {
            ConnectionEvent::Error(reason) => assert!(reason.contains("timed out"), "{reason}"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_quiet(&mut events).await;
        assert_eq!(manager.state().await, ConnectionState::Disconnected);
        assert!(bridge.closed().contains(&hc05().mac));
    }

    #[tokio::test]
    async fn test_native_bridge_session() {
        let bridge = SlowBridge::new(Duration::ZERO);
        let manager = ConnectionManager::with_bridge(ManagerConfig::default(), bridge.clone());
        let mut events = manager.subscribe();
        assert_eq!(manager.config().transport, TransportKind::Bluetooth);

        manager.connect(ConnectionTarget::Bluetooth(hc06())).await;
        match next_event(&mut events).await {
            ConnectionEvent::Connected { peer } => assert_eq!(peer.address, hc06().mac),
            other => panic!("unexpected event: {:?}", other),
        }

        let remote = bridge.remotes.lock().unwrap().pop().expect("device opened");
        let mut remote = BufReader::new(remote);
        remote.get_mut().write_all(b"temp 21\n").await.expect("write");
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::MessageReceived("temp 21".into())
        );

        manager.disconnect().await;
        assert!(bridge.closed().contains(&hc06().mac));
    }

    #[tokio::test]
    async fn test_abandoned_bluetooth_open_is_released() {
        let bridge = SlowBridge::new(Duration::from_millis(200));
        let manager = ConnectionManager::with_bridge(ManagerConfig::bluetooth(), bridge.clone());
        let mut events = manager.subscribe();

        manager.connect(ConnectionTarget::Bluetooth(hc05())).await;
        manager.connect(ConnectionTarget::Bluetooth(hc06())).await;

        // The first device is handed back to the bridge before the second opens
        assert_eq!(bridge.closed(), vec![hc05().mac]);
        match next_event(&mut events).await {
            ConnectionEvent::Connected { peer } => assert_eq!(peer.address, hc06().mac),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_quiet(&mut events).await;
        assert_eq!(manager.connected_peers().await, vec![hc06().mac]);
        manager.disconnect().await;
    }
}
