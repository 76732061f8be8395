//! TCP socket transport
//!
//! A [`SocketBus`] connects processes over TCP: one process runs the
//! bus in server role, any number of others connect as clients. Every
//! notification a server receives is relayed to all other live
//! connections and delivered locally; clients send to the server and
//! deliver inbound notifications locally. Wire format is one
//! JSON-serialized [`Notification`] per length-prefixed frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{
    Connector, ConnectorBase, EventSink, HandlerId, InPushConnector, OutConnector, PortTable,
};
use crate::config::{ParticipantConfig, QualityOfServiceSpec, TransportOptions};
use crate::error::{BusError, Result};
use crate::event::Event;
use crate::scope::Scope;

pub mod fragment;
pub mod frame;
pub mod notification;

use fragment::Reassembler;
use frame::{FrameReader, FrameWriter};
use notification::{notifications_for, Notification};

/// Handshake word written by the server on accept (protocol version 0)
const HANDSHAKE: [u8; 4] = [0, 0, 0, 0];

/// Capacity of each connection's outbound frame queue
const WRITE_QUEUE: usize = 64;

/// Role a socket bus plays on its address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    /// Bind, accept connections, relay between them
    Server,
    /// Connect to a server
    Client,
}

/// Resolved socket transport configuration
#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub host: String,
    pub port: u16,
    pub role: SocketRole,
    pub max_message_size: usize,
    pub fragment_threshold: usize,
    pub reassembly_budget: usize,
}

impl SocketConfig {
    /// Interpret the transport option map
    ///
    /// Recognized options: `host` (default `127.0.0.1`), `port`
    /// (default 55555), `server` (`true`/`false`, default `false`).
    /// Sizes come from the participant configuration.
    pub fn from_options(options: &TransportOptions, config: &ParticipantConfig) -> Result<Self> {
        let host = options.get("host").unwrap_or("127.0.0.1").to_string();
        let port = match options.get("port") {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|_| BusError::Config(format!("invalid socket port '{}'", raw)))?,
            None => 55555,
        };
        let role = match options.get("server") {
            Some("true") | Some("1") => SocketRole::Server,
            Some("false") | Some("0") | None => SocketRole::Client,
            Some(other) => {
                return Err(BusError::Config(format!(
                    "invalid socket server flag '{}'",
                    other
                )))
            }
        };
        Ok(Self {
            host,
            port,
            role,
            max_message_size: config.max_message_size,
            fragment_threshold: config.fragment_threshold,
            reassembly_budget: config.reassembly_budget,
        })
    }

    /// Cache key for sharing one bus per address and role
    pub(crate) fn bus_key(&self) -> String {
        let role = match self.role {
            SocketRole::Server => "server",
            SocketRole::Client => "client",
        };
        format!("{}:{}:{}", self.host, self.port, role)
    }
}

struct Shared {
    ports: PortTable,
    peers: tokio::sync::Mutex<HashMap<u64, mpsc::Sender<Bytes>>>,
    next_peer: AtomicU64,
}

impl Shared {
    /// Forward a raw frame to every live connection except its origin
    async fn relay(&self, origin: u64, frame: &Bytes) {
        let peers = self.peers.lock().await;
        for (peer, tx) in peers.iter() {
            if *peer == origin {
                continue;
            }
            if tx.send(frame.clone()).await.is_err() {
                debug!(peer, "Skipping relay to closed connection");
            }
        }
    }

    /// Send a raw frame to every live connection
    async fn broadcast(&self, frame: &Bytes) {
        let peers = self.peers.lock().await;
        for (peer, tx) in peers.iter() {
            if tx.send(frame.clone()).await.is_err() {
                debug!(peer, "Skipping send to closed connection");
            }
        }
    }

    async fn remove_peer(&self, peer: u64) {
        self.peers.lock().await.remove(&peer);
    }
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
    client_tx: Option<mpsc::Sender<Bytes>>,
    local_addr: Option<SocketAddr>,
}

#[derive(Default)]
struct LifeState {
    attached: usize,
    running: Option<Running>,
}

/// Socket-backed shared medium
///
/// Connectors attach on activation and detach on deactivation; the
/// underlying connection (or listener) runs while at least one
/// connector is attached. Teardown is serialized against the read and
/// write paths, so neither ever observes a half-closed socket.
pub struct SocketBus {
    config: SocketConfig,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<LifeState>,
}

impl SocketBus {
    pub fn new(config: SocketConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                ports: PortTable::new(),
                peers: tokio::sync::Mutex::new(HashMap::new()),
                next_peer: AtomicU64::new(1),
            }),
            lifecycle: tokio::sync::Mutex::new(LifeState::default()),
        }
    }

    /// The actually bound address of a running server bus
    ///
    /// Useful when the configured port is 0 (ephemeral).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle
            .lock()
            .await
            .running
            .as_ref()
            .and_then(|r| r.local_addr)
    }

    pub(crate) async fn attach(&self) -> Result<()> {
        let mut life = self.lifecycle.lock().await;
        if life.attached == 0 {
            life.running = Some(self.start().await?);
        }
        life.attached += 1;
        Ok(())
    }

    pub(crate) async fn detach(&self) -> Result<()> {
        let mut life = self.lifecycle.lock().await;
        if life.attached == 0 {
            return Err(BusError::Lifecycle(
                "socket bus has no attached connectors".to_string(),
            ));
        }
        life.attached -= 1;
        if life.attached == 0 {
            if let Some(running) = life.running.take() {
                running.cancel.cancel();
                drop(running.client_tx);
                self.shared.peers.lock().await.clear();
                running.tracker.close();
                running.tracker.wait().await;
                info!(
                    host = %self.config.host,
                    port = self.config.port,
                    "Socket bus shut down"
                );
            }
        }
        Ok(())
    }

    async fn start(&self) -> Result<Running> {
        match self.config.role {
            SocketRole::Server => self.start_server().await,
            SocketRole::Client => self.start_client().await,
        }
    }

    async fn start_server(&self) -> Result<Running> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                BusError::Connection(format!(
                    "bind {}:{}: {}",
                    self.config.host, self.config.port, e
                ))
            })?;
        let local_addr = listener.local_addr().ok();

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let shared = self.shared.clone();
        let accept_cancel = cancel.clone();
        let accept_tracker = tracker.clone();
        let max_size = self.config.max_message_size;
        let budget = self.config.reassembly_budget;

        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            debug!(peer = %addr, "Accepted bus connection");
                            if let Err(e) = accept_connection(
                                stream,
                                &shared,
                                &accept_tracker,
                                &accept_cancel,
                                max_size,
                                budget,
                            )
                            .await
                            {
                                warn!(peer = %addr, error = %e, "Connection setup failed");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            break;
                        }
                    }
                }
            }
        });

        info!(
            addr = ?local_addr,
            "Socket bus listening"
        );

        Ok(Running {
            cancel,
            tracker,
            client_tx: None,
            local_addr,
        })
    }

    async fn start_client(&self) -> Result<Running> {
        let mut stream = TcpStream::connect((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| {
                BusError::Connection(format!(
                    "connect {}:{}: {}",
                    self.config.host, self.config.port, e
                ))
            })?;
        let _ = stream.set_nodelay(true);

        // The server confirms the connection with a 4-byte zero word
        let mut handshake = [0u8; 4];
        stream
            .read_exact(&mut handshake)
            .await
            .map_err(|e| BusError::Connection(format!("handshake read: {}", e)))?;
        if handshake != HANDSHAKE {
            return Err(BusError::Connection(format!(
                "unexpected handshake word {:?}",
                handshake
            )));
        }

        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);

        tracker.spawn(write_loop(
            FrameWriter::new(write_half, self.config.max_message_size),
            rx,
        ));
        tracker.spawn(read_loop(
            FrameReader::new(read_half, self.config.max_message_size),
            self.shared.clone(),
            cancel.clone(),
            self.config.reassembly_budget,
            None,
        ));

        info!(
            host = %self.config.host,
            port = self.config.port,
            "Connected to socket bus"
        );

        Ok(Running {
            cancel,
            tracker,
            client_tx: Some(tx),
            local_addr: None,
        })
    }

    /// Send an event over the socket and deliver it locally
    pub(crate) async fn push(&self, event: &Event) -> Result<()> {
        let client_tx = {
            let life = self.lifecycle.lock().await;
            let running = life.running.as_ref().ok_or(BusError::Inactive)?;
            running.client_tx.clone()
        };

        for notification in notifications_for(event, self.config.fragment_threshold)? {
            let frame = Bytes::from(serde_json::to_vec(&notification)?);
            match &client_tx {
                Some(tx) => tx
                    .send(frame)
                    .await
                    .map_err(|_| BusError::Connection("connection closed".to_string()))?,
                None => self.shared.broadcast(&frame).await,
            }
        }

        // Loopback to in-connectors in this process
        self.shared.ports.dispatch(event).await;
        Ok(())
    }
}

/// Server-side per-connection setup: handshake, split, spawn both loops
async fn accept_connection(
    stream: TcpStream,
    shared: &Arc<Shared>,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
    max_size: usize,
    budget: usize,
) -> Result<()> {
    let _ = stream.set_nodelay(true);

    let peer = shared.next_peer.fetch_add(1, Ordering::Relaxed);
    let (read_half, mut write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Bytes>(WRITE_QUEUE);

    // Register the peer before confirming the handshake: once the
    // client observes the handshake word, broadcasts reach it.
    shared.peers.lock().await.insert(peer, tx);
    if let Err(e) = write_half.write_all(&HANDSHAKE).await {
        shared.remove_peer(peer).await;
        return Err(e.into());
    }

    tracker.spawn(write_loop(FrameWriter::new(write_half, max_size), rx));
    tracker.spawn(read_loop(
        FrameReader::new(read_half, max_size),
        shared.clone(),
        cancel.clone(),
        budget,
        Some(peer),
    ));
    Ok(())
}

async fn write_loop(mut writer: FrameWriter<OwnedWriteHalf>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.write_frame(&frame).await {
            warn!(error = %e, "Connection write failed");
            break;
        }
    }
}

/// Per-connection read path: frames → notifications → reassembly →
/// local dispatch, relaying raw frames to other peers on the server
///
/// The reassembly table is owned by this task, one per connection. A
/// message that fails to decode is dropped; subsequent messages keep
/// flowing.
async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    budget: usize,
    relay_origin: Option<u64>,
) {
    let mut reassembler = Reassembler::new(budget);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.read_frame() => match frame {
                Ok(Some(bytes)) => {
                    let bytes = Bytes::from(bytes);
                    if let Some(origin) = relay_origin {
                        shared.relay(origin, &bytes).await;
                    }
                    match serde_json::from_slice::<Notification>(&bytes) {
                        Ok(notification) => {
                            if let Some(complete) = reassembler.add(notification) {
                                deliver(&shared, complete).await;
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping undecodable message"),
                    }
                }
                Ok(None) => {
                    debug!("Connection closed by peer");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Connection read failed");
                    break;
                }
            }
        }
    }
    reassembler.clear();
    if let Some(origin) = relay_origin {
        shared.remove_peer(origin).await;
    }
}

async fn deliver(shared: &Shared, notification: Notification) {
    match notification.into_event() {
        Ok(event) => shared.ports.dispatch(&event).await,
        Err(e) => warn!(error = %e, "Dropping notification that failed to decode"),
    }
}

// ---------------------------------------------------------------------------
// Connectors
// ---------------------------------------------------------------------------

/// Out-connector for the socket transport
pub struct SocketOutConnector {
    base: ConnectorBase,
    bus: Arc<SocketBus>,
}

impl SocketOutConnector {
    pub fn new(bus: Arc<SocketBus>, scope: Scope) -> Self {
        Self {
            base: ConnectorBase::new(scope),
            bus,
        }
    }
}

#[async_trait]
impl Connector for SocketOutConnector {
    fn scope(&self) -> Scope {
        self.base.scope()
    }

    fn set_scope(&self, scope: Scope) -> Result<()> {
        self.base.set_scope(scope)
    }

    fn set_quality_of_service(&self, spec: QualityOfServiceSpec) -> Result<()> {
        // TCP delivers ordered and reliable, which honors every spec
        self.base.set_quality_of_service(spec)
    }

    async fn activate(&self) -> Result<()> {
        self.base.state.activate()?;
        if let Err(e) = self.bus.attach().await {
            let _ = self.base.state.deactivate();
            return Err(e);
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.base.state.deactivate()?;
        self.bus.detach().await
    }

    fn is_active(&self) -> bool {
        self.base.state.is_active()
    }
}

#[async_trait]
impl OutConnector for SocketOutConnector {
    async fn push(&self, event: &Event) -> Result<()> {
        if !self.is_active() {
            return Err(BusError::Inactive);
        }
        self.bus.push(event).await
    }
}

/// In-connector for the socket transport
pub struct SocketInConnector {
    base: ConnectorBase,
    bus: Arc<SocketBus>,
    port: tokio::sync::Mutex<Option<u64>>,
    pending: tokio::sync::Mutex<Vec<(HandlerId, Arc<dyn EventSink>)>>,
    next_handler: AtomicU64,
}

impl SocketInConnector {
    pub fn new(bus: Arc<SocketBus>, scope: Scope) -> Self {
        Self {
            base: ConnectorBase::new(scope),
            bus,
            port: tokio::sync::Mutex::new(None),
            pending: tokio::sync::Mutex::new(Vec::new()),
            next_handler: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl Connector for SocketInConnector {
    fn scope(&self) -> Scope {
        self.base.scope()
    }

    fn set_scope(&self, scope: Scope) -> Result<()> {
        self.base.set_scope(scope)
    }

    fn set_quality_of_service(&self, spec: QualityOfServiceSpec) -> Result<()> {
        self.base.set_quality_of_service(spec)
    }

    async fn activate(&self) -> Result<()> {
        self.base.state.activate()?;
        if let Err(e) = self.bus.attach().await {
            let _ = self.base.state.deactivate();
            return Err(e);
        }
        let id = self.bus.shared.ports.register(self.base.scope()).await;
        *self.port.lock().await = Some(id);

        let buffered: Vec<_> = self.pending.lock().await.drain(..).collect();
        for (handler_id, sink) in buffered {
            self.bus
                .shared
                .ports
                .add_handler(id, handler_id, sink)
                .await?;
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.base.state.deactivate()?;
        if let Some(id) = self.port.lock().await.take() {
            self.bus.shared.ports.unregister(id).await;
        }
        self.bus.detach().await
    }

    fn is_active(&self) -> bool {
        self.base.state.is_active()
    }
}

#[async_trait]
impl InPushConnector for SocketInConnector {
    async fn add_handler(&self, sink: Arc<dyn EventSink>) -> Result<HandlerId> {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        match *self.port.lock().await {
            Some(port) => self.bus.shared.ports.add_handler(port, id, sink).await?,
            None => self.pending.lock().await.push((id, sink)),
        }
        Ok(id)
    }

    async fn remove_handler(&self, id: HandlerId) -> Result<()> {
        match *self.port.lock().await {
            Some(port) => self.bus.shared.ports.remove_handler(port, id).await,
            None => {
                let mut pending = self.pending.lock().await;
                let before = pending.len();
                pending.retain(|(handler_id, _)| *handler_id != id);
                if pending.len() == before {
                    return Err(BusError::UnknownHandler(id));
                }
                Ok(())
            }
        }
    }
}
