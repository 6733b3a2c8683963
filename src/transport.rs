use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use rustc_hash::FxHashMap;
use tokio::net::{lookup_host, UdpSocket};
use tokio::select;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::config::RudpConfig;
use crate::connection::Connection;
use crate::error::RudpError;
use crate::message_dispatcher::MessageDispatcher;
use crate::packet_header::{PacketType, MAX_DATAGRAM};
use crate::send_pipeline::SendPipeline;
use crate::ConnId;

/// The two connection maps. They are kept consistent under one lock: a peer
///  address is present in `by_peer` iff its id is present in `by_id`.
#[derive(Default)]
struct ConnectionRegistry {
    by_id: FxHashMap<ConnId, Arc<Connection>>,
    by_peer: FxHashMap<SocketAddr, ConnId>,
}

impl ConnectionRegistry {
    fn insert(&mut self, connection: Arc<Connection>) {
        self.by_peer.insert(connection.peer_addr(), connection.conn_id());
        self.by_id.insert(connection.conn_id(), connection);
    }

    fn remove(&mut self, conn_id: ConnId) -> Option<Arc<Connection>> {
        let connection = self.by_id.remove(&conn_id)?;
        self.by_peer.remove(&connection.peer_addr());
        Some(connection)
    }

    fn get_by_peer(&self, peer_addr: &SocketAddr) -> Option<Arc<Connection>> {
        let conn_id = self.by_peer.get(peer_addr)?;
        self.by_id.get(conn_id).cloned()
    }
}

struct TransportInner {
    config: Arc<RudpConfig>,
    socket: Arc<UdpSocket>,
    send_pipeline: Arc<SendPipeline>,
    default_dispatcher: Arc<dyn MessageDispatcher>,

    /// Server variant: packets from peers we have never seen materialize a
    ///  new connection instead of being dropped.
    accept_unknown_peers: bool,

    registry: RwLock<ConnectionRegistry>,
    next_conn_id: AtomicI32,

    /// Timer tasks report connections to be removed over this channel; the
    ///  receive loop drains it. Replaced with a fresh pair whenever the
    ///  receive loop is stopped and restarted.
    removal_tx: StdMutex<mpsc::UnboundedSender<ConnId>>,
    pending_removal_rx: StdMutex<Option<mpsc::UnboundedReceiver<ConnId>>>,
    recv_loop_handle: StdMutex<Option<JoinHandle<()>>>,
}

/// The host side of the protocol: owns the UDP socket, the peer maps and the
///  receive loop, creates connections (locally via [`connect`](Transport::connect),
///  or - in the server variant - when an unknown peer first sends something),
///  and routes user sends to the addressed connection.
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Ok(mut handle_guard) = self.inner.recv_loop_handle.lock() {
            if let Some(handle) = handle_guard.take() {
                handle.abort();
            }
        }
    }
}

impl Transport {
    /// A client transport: binds `port` (0 for ephemeral) and starts its
    ///  receive loop lazily on the first `connect`.
    pub async fn client(
        port: u16,
        config: RudpConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Result<Transport, RudpError> {
        Self::bind(port, config, dispatcher, false).await
    }

    /// A server transport: accepts connections from unknown peers, and its
    ///  receive loop runs from construction.
    pub async fn server(
        port: u16,
        config: RudpConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> Result<Transport, RudpError> {
        let transport = Self::bind(port, config, dispatcher, true).await?;
        transport.ensure_recv_loop();
        Ok(transport)
    }

    async fn bind(
        port: u16,
        config: RudpConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
        accept_unknown_peers: bool,
    ) -> Result<Transport, RudpError> {
        config.validate()?;

        let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                error!("failed to bind UDP socket to port {}: {}", port, e);
                if config.exit_on_receive_exception {
                    std::process::exit(1);
                }
                return Err(e.into());
            }
        };
        info!("bound UDP socket to {:?}", socket.local_addr()?);

        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        let inner = TransportInner {
            config: Arc::new(config),
            send_pipeline: Arc::new(SendPipeline::new(Arc::new(socket.clone()))),
            socket,
            default_dispatcher: dispatcher,
            accept_unknown_peers,
            registry: RwLock::new(ConnectionRegistry::default()),
            next_conn_id: AtomicI32::new(1),
            removal_tx: StdMutex::new(removal_tx),
            pending_removal_rx: StdMutex::new(Some(removal_rx)),
            recv_loop_handle: StdMutex::new(None),
        };

        Ok(Transport { inner: Arc::new(inner) })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.send_pipeline.local_addr()
    }

    /// Connects to `host:port`: numeric IP parse first, then a DNS lookup
    ///  taking the first A record. Creates the connection, starts the receive
    ///  loop if it is not running yet, and initiates the handshake.
    ///
    /// Fails with [`RudpError::InvalidPort`] / [`RudpError::InvalidAddress`]
    ///  for caller mistakes; a peer that does not answer is not an error here
    ///  (the connection just never reaches its connected state and is
    ///  eventually reaped by the inactivity timeout).
    pub async fn connect(&self, host: &str, port: u32) -> Result<ConnId, RudpError> {
        if port > u16::MAX as u32 {
            return Err(RudpError::InvalidPort(port));
        }

        let peer_addr = match host.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, port as u16),
            Err(_) => {
                let candidates = lookup_host((host, port as u16))
                    .await
                    .map_err(|_| RudpError::InvalidAddress(host.to_string()))?
                    .collect::<Vec<_>>();
                candidates
                    .iter()
                    .find(|addr| addr.is_ipv4())
                    .or(candidates.first())
                    .copied()
                    .ok_or_else(|| RudpError::InvalidAddress(host.to_string()))?
            }
        };

        let connection = {
            let mut registry = self.inner.registry.write().await;
            if let Some(existing) = registry.get_by_peer(&peer_addr) {
                debug!("connect: already tracking {:?} as connection {}", peer_addr, existing.conn_id());
                return Ok(existing.conn_id());
            }
            let connection = self.inner.new_connection(peer_addr);
            registry.insert(connection.clone());
            connection
        };

        self.ensure_recv_loop();
        connection.arm_inactivity().await;
        connection.initiate_handshake().await;

        info!("connection {} to {:?} initiated", connection.conn_id(), peer_addr);
        Ok(connection.conn_id())
    }

    /// Best-effort send. Unknown ids are silently ignored.
    pub async fn send(&self, conn_id: ConnId, payload: &[u8]) {
        match self.inner.lookup(conn_id).await {
            Some(connection) => connection.send_non_reliable(payload).await,
            None => trace!("send to unknown connection {} - ignoring", conn_id),
        }
    }

    /// Reliable send: retransmitted until ACKed or the retry budget is spent.
    ///  Unknown ids are silently ignored.
    pub async fn send_reliable(&self, conn_id: ConnId, payload: &[u8]) {
        match self.inner.lookup(conn_id).await {
            Some(connection) => connection.send_reliable(payload).await,
            None => trace!("send_reliable to unknown connection {} - ignoring", conn_id),
        }
    }

    /// UTF-8 convenience wrapper around [`send`](Transport::send).
    pub async fn send_text(&self, conn_id: ConnId, text: &str) {
        self.send(conn_id, text.as_bytes()).await;
    }

    /// Replaces the connection's dispatcher slot.
    pub async fn set_dispatcher(&self, conn_id: ConnId, dispatcher: Arc<dyn MessageDispatcher>) {
        if let Some(connection) = self.inner.lookup(conn_id).await {
            connection.set_dispatcher(dispatcher).await;
        }
    }

    /// Resets the connection's dispatcher slot to the transport default.
    pub async fn clear_dispatcher(&self, conn_id: ConnId) {
        if let Some(connection) = self.inner.lookup(conn_id).await {
            connection.set_dispatcher(self.inner.default_dispatcher.clone()).await;
        }
    }

    pub async fn is_connected(&self, conn_id: ConnId) -> bool {
        match self.inner.lookup(conn_id).await {
            Some(connection) => connection.is_connected().await,
            None => false,
        }
    }

    pub async fn connection_ids(&self) -> Vec<ConnId> {
        let registry = self.inner.registry.read().await;
        let mut ids = registry.by_id.keys().copied().collect::<Vec<_>>();
        ids.sort_unstable();
        ids
    }

    /// Tells the peer, clears the connection's pending reliable state and
    ///  removes it from the maps. Fires `on_disconnect` at most once, so a
    ///  second call for the same id is a no-op.
    pub async fn disconnect(&self, conn_id: ConnId) {
        let removed = self.inner.registry.write().await.remove(conn_id);
        match removed {
            Some(connection) => connection.local_disconnect().await,
            None => debug!("disconnect for unknown connection {} - ignoring", conn_id),
        }
    }

    /// Disconnects every connection. The client variant also stops its
    ///  receive loop; a server keeps listening for new peers.
    pub async fn disconnect_all(&self) {
        let connections = {
            let mut registry = self.inner.registry.write().await;
            let ids = registry.by_id.keys().copied().collect::<Vec<_>>();
            ids.into_iter()
                .filter_map(|conn_id| registry.remove(conn_id))
                .collect::<Vec<_>>()
        };
        for connection in connections {
            connection.local_disconnect().await;
        }

        if !self.inner.accept_unknown_peers {
            self.inner.stop_recv_loop();
        }
    }

    fn ensure_recv_loop(&self) {
        let mut handle_guard = self
            .inner
            .recv_loop_handle
            .lock()
            .expect("recv loop handle mutex poisoned");
        if handle_guard.is_some() {
            return;
        }

        let removal_rx = self
            .inner
            .pending_removal_rx
            .lock()
            .expect("removal rx mutex poisoned")
            .take();
        let Some(removal_rx) = removal_rx else {
            warn!("receive loop has no removal channel - not starting");
            return;
        };

        let inner = self.inner.clone();
        *handle_guard = Some(tokio::spawn(async move {
            inner.recv_loop(removal_rx).await;
        }));
    }
}

impl TransportInner {
    fn new_connection(&self, peer_addr: SocketAddr) -> Arc<Connection> {
        let conn_id = self.alloc_conn_id();
        let removal_tx = self
            .removal_tx
            .lock()
            .expect("removal tx mutex poisoned")
            .clone();
        Arc::new(Connection::new(
            conn_id,
            peer_addr,
            self.config.clone(),
            self.send_pipeline.clone(),
            self.default_dispatcher.clone(),
            removal_tx,
        ))
    }

    /// Ids are non-zero and monotonic, wrapping from `i32::MAX` back to 1.
    fn alloc_conn_id(&self) -> ConnId {
        self.next_conn_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(if v == i32::MAX { 1 } else { v + 1 })
            })
            .expect("conn id update never fails")
    }

    async fn lookup(&self, conn_id: ConnId) -> Option<Arc<Connection>> {
        self.registry.read().await.by_id.get(&conn_id).cloned()
    }

    async fn recv_loop(self: Arc<Self>, mut removal_rx: mpsc::UnboundedReceiver<ConnId>) {
        info!("starting receive loop");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((num_read, from)) => {
                            let correlation_id = Uuid::new_v4();
                            let recv_span = span!(Level::TRACE, "packet_received", ?correlation_id);
                            self.handle_datagram(&buf[..num_read], from)
                                .instrument(recv_span)
                                .await;
                        }
                        Err(e) => self.on_receive_error(e),
                    }
                }
                removed = removal_rx.recv() => {
                    match removed {
                        Some(conn_id) => {
                            debug!("removing connection {} on request", conn_id);
                            self.registry.write().await.remove(conn_id);
                        }
                        None => {
                            // channel replaced, this loop is being shut down
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_datagram(&self, buf: &[u8], from: SocketAddr) {
        trace!("received {} bytes from {:?}", buf.len(), from);

        if buf.is_empty() {
            debug!("empty datagram from {:?} - dropping", from);
            return;
        }

        let known = self.registry.read().await.get_by_peer(&from);
        let connection = match known {
            Some(connection) => connection,
            None if self.accept_unknown_peers => self.accept_connection(from).await,
            None => {
                debug!("packet from unknown peer {:?} - dropping", from);
                return;
            }
        };

        if buf[0] == u8::from(PacketType::Disconnect) {
            debug!("peer {:?} disconnected", from);
            self.registry.write().await.remove(connection.conn_id());
            connection.remote_disconnect().await;
            return;
        }

        connection.process_inbound(buf).await;
    }

    /// Server variant: first contact from an unknown peer materializes a
    ///  connection. No handshake is initiated from this side - the packet
    ///  that created the connection is expected to be the peer's INIT.
    async fn accept_connection(&self, peer_addr: SocketAddr) -> Arc<Connection> {
        let connection = {
            let mut registry = self.registry.write().await;
            if let Some(existing) = registry.get_by_peer(&peer_addr) {
                existing
            } else {
                let connection = self.new_connection(peer_addr);
                registry.insert(connection.clone());
                info!("new connection {} for first-contact peer {:?}", connection.conn_id(), peer_addr);
                connection
            }
        };
        connection.arm_inactivity().await;
        connection
    }

    fn on_receive_error(&self, e: std::io::Error) {
        match e.kind() {
            // no data / spurious wakeups: keep receiving
            ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionReset => {
                debug!("recoverable receive error: {}", e);
            }
            _ => {
                if self.config.exit_on_receive_exception {
                    error!("unexpected receive error: {} - terminating", e);
                    std::process::exit(1);
                }
                error!("unexpected receive error: {}", e);
            }
        }
    }

    fn stop_recv_loop(&self) {
        let mut handle_guard = self
            .recv_loop_handle
            .lock()
            .expect("recv loop handle mutex poisoned");
        if let Some(handle) = handle_guard.take() {
            debug!("stopping receive loop");
            handle.abort();
        }

        // fresh channel pair for a potential later restart; connections
        //  created before this point report removals into the void, which is
        //  fine - they were all torn down alongside the loop
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        *self.removal_tx.lock().expect("removal tx mutex poisoned") = removal_tx;
        *self
            .pending_removal_rx
            .lock()
            .expect("removal rx mutex poisoned") = Some(removal_rx);
    }
}
