use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::config::RudpConfig;
use crate::error::RudpError;
use crate::fragment::Reassembly;
use crate::message_dispatcher::{DisconnectReason, MessageDispatcher};
use crate::packet_header::PacketHeader;
use crate::send_pipeline::SendPipeline;
use crate::ConnId;

/// Sequence ids live in `0..=254`: the increment is modulo 255, so the value
///  255 never appears on the wire.
pub(crate) fn next_seq(seq: u8) -> u8 {
    seq.wrapping_add(1) % 255
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakePhase {
    /// Nothing happened yet on this connection.
    Idle,
    /// We sent INIT and are waiting for the peer's INIT_ACK.
    AwaitingInitAck,
    /// We answered an INIT with INIT_ACK and are waiting for INIT_FIN.
    AwaitingInitFin,
    Connected,
    Closed,
}

/// One in-flight reliable send: the exact bytes to retransmit, plus the retry
///  bookkeeping. `tries` counts transmissions including the initial one and
///  only ever grows; the entry is removed when the matching ACK arrives or
///  when `tries` hits the configured budget.
struct OutboundReliable {
    header: Vec<u8>,
    body: Vec<u8>,
    tries: u32,
    retry_handle: Option<JoinHandle<()>>,
}

pub(crate) struct ConnectionInner {
    config: Arc<RudpConfig>,
    conn_id: ConnId,
    peer_addr: SocketAddr,
    send_pipeline: Arc<SendPipeline>,
    dispatcher: Arc<dyn MessageDispatcher>,
    removal_tx: mpsc::UnboundedSender<ConnId>,

    phase: HandshakePhase,
    gen_nonce: i32,
    recv_nonce: i32,

    outbound: FxHashMap<u8, OutboundReliable>,
    next_send_id: u8,

    reorder: BTreeMap<u8, Vec<u8>>,
    next_expected_id: u8,
    first_packet: bool,

    reassembly: Option<Reassembly>,

    keep_alive_handle: Option<JoinHandle<()>>,
    inactivity_handle: Option<JoinHandle<()>>,
    handshake_interval_handle: Option<JoinHandle<()>>,
    handshake_timeout_handle: Option<JoinHandle<()>>,
}

impl ConnectionInner {
    async fn send_control(&self, header: PacketHeader, nonces: &[i32]) {
        let mut buf = header.to_bytes();
        for nonce in nonces {
            buf.extend_from_slice(&nonce.to_le_bytes());
        }
        self.send_pipeline.send_packet(self.peer_addr, &buf).await;
    }

    async fn send_init(&self) {
        trace!("sending INIT to {:?}", self.peer_addr);
        self.send_control(PacketHeader::Init, &[self.gen_nonce]).await;
    }

    /// (Re)arms the inactivity timer. Called on creation, on entering
    ///  Connected, and on every valid inbound packet.
    fn restart_inactivity(&mut self, inner_arc: Arc<RwLock<ConnectionInner>>) {
        if let Some(handle) = self.inactivity_handle.take() {
            handle.abort();
        }
        let deadline = self.config.connection_timeout;
        self.inactivity_handle = Some(tokio::spawn(async move {
            time::sleep(deadline).await;

            let mut inner = inner_arc.write().await;
            // this timer has served its purpose, don't let close() abort us mid-cleanup
            inner.inactivity_handle = None;
            debug!(
                "connection {} to {:?}: no packet for {:?} - closing",
                inner.conn_id, inner.peer_addr, deadline
            );
            inner.close(DisconnectReason::Timeout).await;
        }));
    }

    fn stop_handshake_timers(&mut self) {
        if let Some(handle) = self.handshake_interval_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.handshake_timeout_handle.take() {
            handle.abort();
        }
    }

    /// Stops every timer and drops all pending reliable state. Idempotent.
    fn clear_all(&mut self) {
        self.stop_handshake_timers();
        if let Some(handle) = self.keep_alive_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.inactivity_handle.take() {
            handle.abort();
        }
        for (_, mut entry) in self.outbound.drain() {
            if let Some(handle) = entry.retry_handle.take() {
                handle.abort();
            }
        }
        self.reassembly = None;
    }

    /// Terminal transition. Fires `on_disconnect` exactly once and asks the
    ///  transport to drop this connection from its maps.
    async fn close(&mut self, reason: DisconnectReason) {
        if self.phase == HandshakePhase::Closed {
            return;
        }
        self.phase = HandshakePhase::Closed;
        self.clear_all();

        self.dispatcher.on_disconnect(self.conn_id, reason).await;

        // map removal is performed by the transport's receive loop - timer
        //  tasks must not touch the transport maps themselves
        self.removal_tx.send(self.conn_id).ok();
    }

    fn enter_connected(&mut self, inner_arc: &Arc<RwLock<ConnectionInner>>) {
        debug!("connection {} to {:?} established", self.conn_id, self.peer_addr);
        self.phase = HandshakePhase::Connected;
        self.stop_handshake_timers();

        if let Some(handle) = self.keep_alive_handle.take() {
            handle.abort();
        }
        let period = self.config.keep_alive_ping_time;
        let keep_alive_arc = inner_arc.clone();
        self.keep_alive_handle = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                let inner = keep_alive_arc.read().await;
                if inner.phase != HandshakePhase::Connected {
                    return;
                }
                trace!("keep-alive: sending PING to {:?}", inner.peer_addr);
                inner.send_control(PacketHeader::Ping, &[]).await;
            }
        }));

        self.restart_inactivity(inner_arc.clone());
    }
}

/// The per-peer protocol engine: handshake, reliable retransmission, ordered
///  dispatch, multi-part reassembly, keep-alive and inactivity timers.
///
/// All state sits behind a single lock per connection; timer tasks take only
///  that lock and report removals to the transport over a channel.
pub struct Connection {
    conn_id: ConnId,
    peer_addr: SocketAddr,
    inner: Arc<RwLock<ConnectionInner>>,
}

impl Connection {
    pub(crate) fn new(
        conn_id: ConnId,
        peer_addr: SocketAddr,
        config: Arc<RudpConfig>,
        send_pipeline: Arc<SendPipeline>,
        dispatcher: Arc<dyn MessageDispatcher>,
        removal_tx: mpsc::UnboundedSender<ConnId>,
    ) -> Connection {
        let inner = ConnectionInner {
            config,
            conn_id,
            peer_addr,
            send_pipeline,
            dispatcher,
            removal_tx,
            phase: HandshakePhase::Idle,
            gen_nonce: 0,
            recv_nonce: 0,
            outbound: FxHashMap::default(),
            next_send_id: 1,
            reorder: BTreeMap::new(),
            next_expected_id: 0,
            first_packet: true,
            reassembly: None,
            keep_alive_handle: None,
            inactivity_handle: None,
            handshake_interval_handle: None,
            handshake_timeout_handle: None,
        };

        Connection {
            conn_id,
            peer_addr,
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.read().await.phase == HandshakePhase::Connected
    }

    /// Arms the inactivity timer; a connection that never completes its
    ///  handshake is reaped by this timer.
    pub(crate) async fn arm_inactivity(&self) {
        let mut inner = self.inner.write().await;
        if inner.phase == HandshakePhase::Closed {
            return;
        }
        inner.restart_inactivity(self.inner.clone());
    }

    pub(crate) async fn set_dispatcher(&self, dispatcher: Arc<dyn MessageDispatcher>) {
        self.inner.write().await.dispatcher = dispatcher;
    }

    /// Starts the three-way handshake as the initiating side: sends INIT with
    ///  a fresh random nonce and keeps retransmitting it at
    ///  `connect_interval` until `connect_timeout` passes or INIT_ACK arrives.
    pub(crate) async fn initiate_handshake(&self) {
        self.start_handshake_with_nonce(rand::random::<i32>()).await;
    }

    pub(crate) async fn start_handshake_with_nonce(&self, nonce: i32) {
        let mut inner = self.inner.write().await;
        if inner.phase == HandshakePhase::Closed {
            return;
        }
        inner.gen_nonce = nonce;
        inner.phase = HandshakePhase::AwaitingInitAck;
        inner.send_init().await;

        let interval_arc = self.inner.clone();
        let connect_interval = inner.config.connect_interval;
        if let Some(handle) = inner.handshake_interval_handle.take() {
            handle.abort();
        }
        inner.handshake_interval_handle = Some(tokio::spawn(async move {
            let mut ticker = interval(connect_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let inner = interval_arc.read().await;
                if inner.phase != HandshakePhase::AwaitingInitAck {
                    return;
                }
                inner.send_init().await;
            }
        }));

        let timeout_arc = self.inner.clone();
        let connect_timeout = inner.config.connect_timeout;
        if let Some(handle) = inner.handshake_timeout_handle.take() {
            handle.abort();
        }
        inner.handshake_timeout_handle = Some(tokio::spawn(async move {
            time::sleep(connect_timeout).await;

            let mut inner = timeout_arc.write().await;
            inner.handshake_timeout_handle = None;
            if let Some(handle) = inner.handshake_interval_handle.take() {
                handle.abort();
            }
            if inner.phase != HandshakePhase::Connected {
                // no further progress; the inactivity timeout reaps the connection
                debug!("handshake with {:?} timed out", inner.peer_addr);
            }
        }));
    }

    /// Best-effort single send, lost packets are lost.
    pub(crate) async fn send_non_reliable(&self, payload: &[u8]) {
        let inner = self.inner.read().await;
        if inner.phase == HandshakePhase::Closed {
            return;
        }
        inner
            .send_pipeline
            .send_framed(inner.peer_addr, &PacketHeader::NonReliable.to_bytes(), payload)
            .await;
    }

    /// Assigns the next sequence id, transmits once right away, and arms a
    ///  periodic retry task that retransmits the identical bytes until the
    ///  ACK arrives or the budget is spent. Exhaustion is silent - there is
    ///  deliberately no user-visible delivery failure.
    pub(crate) async fn send_reliable(&self, payload: &[u8]) {
        let mut inner = self.inner.write().await;
        if inner.phase == HandshakePhase::Closed {
            return;
        }

        let seq = inner.next_send_id;
        inner.next_send_id = next_seq(inner.next_send_id);

        let header = PacketHeader::Reliable { seq }.to_bytes();
        trace!(
            "sending reliable #{} ({} bytes) to {:?}",
            seq,
            payload.len(),
            inner.peer_addr
        );
        inner
            .send_pipeline
            .send_framed(inner.peer_addr, &header, payload)
            .await;

        let retry_arc = self.inner.clone();
        let retry_interval = inner.config.retry_interval;
        let max_retries = inner.config.max_retries;
        let retry_handle = tokio::spawn(async move {
            let mut ticker = interval(retry_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut inner = retry_arc.write().await;
                let Some(entry) = inner.outbound.get_mut(&seq) else {
                    return;
                };
                if entry.tries >= max_retries {
                    debug!("reliable #{} exhausted its {} tries - giving up", seq, max_retries);
                    inner.outbound.remove(&seq);
                    return;
                }
                entry.tries += 1;
                let header = entry.header.clone();
                let body = entry.body.clone();
                trace!("retransmitting reliable #{} (try {})", seq, entry.tries);
                inner
                    .send_pipeline
                    .send_framed(inner.peer_addr, &header, &body)
                    .await;
            }
        });

        let previous = inner.outbound.insert(
            seq,
            OutboundReliable {
                header,
                body: payload.to_vec(),
                tries: 1,
                retry_handle: Some(retry_handle),
            },
        );
        // seq wrapped onto a still-unacknowledged send; the old entry is gone either way
        if let Some(mut old) = previous {
            warn!("sequence id {} reassigned while still in flight", seq);
            if let Some(handle) = old.retry_handle.take() {
                handle.abort();
            }
        }
    }

    pub(crate) async fn clear_all(&self) {
        self.inner.write().await.clear_all();
    }

    /// Local, deliberate teardown: tells the peer, then runs the common close
    ///  path (which fires `on_disconnect` at most once).
    pub(crate) async fn local_disconnect(&self) {
        let mut inner = self.inner.write().await;
        if inner.phase == HandshakePhase::Closed {
            return;
        }
        inner.send_control(PacketHeader::Disconnect, &[]).await;
        inner.close(DisconnectReason::Disconnect).await;
    }

    /// The peer told us to go away (or the transport saw its DISCONNECT byte).
    pub(crate) async fn remote_disconnect(&self) {
        let mut inner = self.inner.write().await;
        inner.close(DisconnectReason::Disconnect).await;
    }

    /// Entry point for every datagram the transport routed to this
    ///  connection. Parses the header, restarts the inactivity timer for any
    ///  valid packet, unwraps MULTI framing, and dispatches.
    pub(crate) async fn process_inbound(&self, buf: &[u8]) {
        let mut inner = self.inner.write().await;
        if inner.phase == HandshakePhase::Closed {
            return;
        }

        let mut b = buf;
        let header = match PacketHeader::deser(&mut b) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping packet from {:?}: {}", inner.peer_addr, e);
                return;
            }
        };
        trace!("received {:?} from {:?}", header, inner.peer_addr);

        inner.restart_inactivity(self.inner.clone());

        match header {
            PacketHeader::Multi { total_parts, part_index } => {
                self.on_multi_fragment(&mut inner, total_parts, part_index, b).await;
            }
            other => self.process_packet(&mut inner, other, b).await,
        }
    }

    async fn on_multi_fragment(
        &self,
        inner: &mut ConnectionInner,
        total_parts: u8,
        part_index: u8,
        fragment_bytes: &[u8],
    ) {
        // every fragment repeats the inner packet's header; parse it off so
        //  the slot stores pure payload slices
        let mut rest = fragment_bytes;
        let inner_header = match PacketHeader::deser(&mut rest) {
            Ok(PacketHeader::Multi { .. }) => {
                debug!("dropping nested MULTI packet from {:?}", inner.peer_addr);
                return;
            }
            Ok(header) => header,
            Err(e) => {
                debug!("dropping MULTI fragment from {:?}: {}", inner.peer_addr, e);
                return;
            }
        };

        let slot = inner
            .reassembly
            .get_or_insert_with(|| Reassembly::new(total_parts, inner_header.to_bytes()));
        match slot.on_fragment(total_parts, part_index, rest) {
            Ok(Some(inner_packet)) => {
                inner.reassembly = None;

                let mut pb: &[u8] = &inner_packet;
                match PacketHeader::deser(&mut pb) {
                    Ok(header) => self.process_packet(inner, header, pb).await,
                    Err(e) => debug!("dropping reassembled packet from {:?}: {}", inner.peer_addr, e),
                }
            }
            Ok(None) => {
                trace!(
                    "MULTI fragment {}/{} from {:?} buffered",
                    part_index,
                    total_parts,
                    inner.peer_addr
                );
            }
            Err(e) => debug!("dropping MULTI fragment from {:?}: {}", inner.peer_addr, e),
        }
    }

    async fn process_packet(
        &self,
        inner: &mut ConnectionInner,
        header: PacketHeader,
        payload: &[u8],
    ) {
        match header {
            PacketHeader::Init => self.on_init(inner, payload).await,
            PacketHeader::InitAck => self.on_init_ack(inner, payload).await,
            PacketHeader::InitFin => self.on_init_fin(inner, payload).await,
            PacketHeader::NonReliable => {
                let dispatcher = inner.dispatcher.clone();
                dispatcher.on_message(inner.conn_id, payload).await;
            }
            PacketHeader::Reliable { seq } => self.on_reliable(inner, seq, payload).await,
            PacketHeader::Ack { seq } => Self::on_ack(inner, seq),
            PacketHeader::Ping => {
                inner.send_control(PacketHeader::PingAck, &[]).await;
            }
            PacketHeader::PingAck => {
                // nothing beyond the inactivity restart that already happened
            }
            PacketHeader::Disconnect => {
                inner.close(DisconnectReason::Disconnect).await;
            }
            PacketHeader::Multi { .. } => {
                debug!("dropping nested MULTI packet from {:?}", inner.peer_addr);
            }
        }
    }

    async fn on_init(&self, inner: &mut ConnectionInner, payload: &[u8]) {
        let Some(a) = read_nonce(payload, 0) else {
            debug!("dropping truncated INIT from {:?}", inner.peer_addr);
            return;
        };

        match inner.phase {
            HandshakePhase::Idle => {
                inner.gen_nonce = rand::random::<i32>();
            }
            HandshakePhase::AwaitingInitFin => {
                // the peer retransmitted INIT - answer again with the same nonce
            }
            _ => {
                debug!(
                    "dropping INIT from {:?} in phase {:?}",
                    inner.peer_addr, inner.phase
                );
                return;
            }
        }
        inner.recv_nonce = a.wrapping_add(1);
        inner.phase = HandshakePhase::AwaitingInitFin;

        let (a1, b) = (inner.recv_nonce, inner.gen_nonce);
        inner.send_control(PacketHeader::InitAck, &[a1, b]).await;
    }

    async fn on_init_ack(&self, inner: &mut ConnectionInner, payload: &[u8]) {
        if inner.phase != HandshakePhase::AwaitingInitAck {
            debug!(
                "dropping INIT_ACK from {:?} in phase {:?}",
                inner.peer_addr, inner.phase
            );
            return;
        }
        let (Some(a1), Some(b)) = (read_nonce(payload, 0), read_nonce(payload, 4)) else {
            debug!("dropping truncated INIT_ACK from {:?}", inner.peer_addr);
            return;
        };

        if let Err(e) = verify_nonce(inner.gen_nonce.wrapping_add(1), a1) {
            warn!("{} in INIT_ACK from {:?} - closing", e, inner.peer_addr);
            inner.close(DisconnectReason::Disconnect).await;
            return;
        }

        inner.recv_nonce = b;
        inner
            .send_control(PacketHeader::InitFin, &[a1, b.wrapping_add(1)])
            .await;
        inner.enter_connected(&self.inner);
    }

    async fn on_init_fin(&self, inner: &mut ConnectionInner, payload: &[u8]) {
        if inner.phase != HandshakePhase::AwaitingInitFin {
            debug!(
                "dropping INIT_FIN from {:?} in phase {:?}",
                inner.peer_addr, inner.phase
            );
            return;
        }
        let (Some(a), Some(b1)) = (read_nonce(payload, 0), read_nonce(payload, 4)) else {
            debug!("dropping truncated INIT_FIN from {:?}", inner.peer_addr);
            return;
        };

        let checked = verify_nonce(inner.recv_nonce, a)
            .and_then(|()| verify_nonce(inner.gen_nonce.wrapping_add(1), b1));
        if let Err(e) = checked {
            warn!("{} in INIT_FIN from {:?} - closing", e, inner.peer_addr);
            inner.close(DisconnectReason::Disconnect).await;
            return;
        }
        inner.enter_connected(&self.inner);
    }

    async fn on_reliable(&self, inner: &mut ConnectionInner, seq: u8, payload: &[u8]) {
        // always confirm receipt, even for duplicates - our earlier ACK may
        //  have been lost
        inner.send_control(PacketHeader::Ack { seq }, &[]).await;

        let dispatcher = inner.dispatcher.clone();
        let conn_id = inner.conn_id;

        if !inner.config.use_ordering {
            dispatcher.on_message(conn_id, payload).await;
            return;
        }

        if inner.first_packet {
            inner.next_expected_id = seq;
            inner.first_packet = false;
        }

        // NB: raw byte comparison - misorders at the wrap boundary, carried
        //  over from the protocol this implements
        if seq < inner.next_expected_id {
            debug!(
                "reliable #{} from {:?} below cursor #{} - dropping as duplicate",
                seq, inner.peer_addr, inner.next_expected_id
            );
            return;
        }

        if seq == inner.next_expected_id {
            dispatcher.on_message(conn_id, payload).await;
            inner.next_expected_id = next_seq(inner.next_expected_id);

            // drain everything that became consecutive
            while let Some(buffered) = inner.reorder.remove(&inner.next_expected_id) {
                dispatcher.on_message(conn_id, &buffered).await;
                inner.next_expected_id = next_seq(inner.next_expected_id);
            }
        } else {
            trace!(
                "reliable #{} from {:?} ahead of cursor #{} - buffering",
                seq,
                inner.peer_addr,
                inner.next_expected_id
            );
            inner.reorder.insert(seq, payload.to_vec());
        }
    }

    fn on_ack(inner: &mut ConnectionInner, seq: u8) {
        match inner.outbound.remove(&seq) {
            Some(mut entry) => {
                trace!("ACK for reliable #{} after {} tries", seq, entry.tries);
                if let Some(handle) = entry.retry_handle.take() {
                    handle.abort();
                }
            }
            None => {
                warn!(
                    "received ACK for unknown sequence id {} from {:?}",
                    seq, inner.peer_addr
                );
            }
        }
    }
}

fn read_nonce(payload: &[u8], offset: usize) -> Option<i32> {
    let bytes = payload.get(offset..offset + 4)?;
    Some(i32::from_le_bytes(bytes.try_into().expect("slice of length 4")))
}

fn verify_nonce(expected: i32, actual: i32) -> Result<(), RudpError> {
    if expected == actual {
        Ok(())
    } else {
        Err(RudpError::HandshakeMismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::packet_header::{PacketType, MAX_PAYLOAD};
    use crate::send_pipeline::MockSendSocket;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::runtime::Builder;

    fn test_config() -> RudpConfig {
        RudpConfig {
            connect_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            connection_timeout: Duration::from_secs(30),
            keep_alive_ping_time: Duration::from_secs(10),
            max_retries: 3,
            retry_interval: Duration::from_millis(300),
            ..RudpConfig::default()
        }
    }

    fn recording_socket() -> (Arc<MockSendSocket>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut socket = MockSendSocket::new();
        socket
            .expect_local_addr()
            .return_const(SocketAddr::from(([127, 0, 0, 1], 4000)));
        let sent_clone = sent.clone();
        socket.expect_do_send_packet().returning(move |_, buf| {
            sent_clone.lock().unwrap().push(buf.to_vec());
        });
        (Arc::new(socket), sent)
    }

    fn recording_dispatcher() -> (Arc<MockMessageDispatcher>, Arc<Mutex<Vec<(ConnId, Vec<u8>)>>>) {
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = MockMessageDispatcher::new();
        let delivered_clone = delivered.clone();
        dispatcher.expect_on_message().returning(move |conn_id, buf| {
            delivered_clone.lock().unwrap().push((conn_id, buf.to_vec()));
        });
        dispatcher.expect_on_disconnect().returning(|_, _| ());
        (Arc::new(dispatcher), delivered)
    }

    fn test_connection(
        config: RudpConfig,
        socket: Arc<MockSendSocket>,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> (Connection, mpsc::UnboundedReceiver<ConnId>) {
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(
            7,
            SocketAddr::from(([127, 0, 0, 1], 4001)),
            Arc::new(config),
            Arc::new(SendPipeline::new(socket)),
            dispatcher,
            removal_tx,
        );
        (connection, removal_rx)
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    #[test]
    fn test_next_seq_wraps_at_255() {
        assert_eq!(next_seq(0), 1);
        assert_eq!(next_seq(253), 254);
        assert_eq!(next_seq(254), 0);
    }

    #[test]
    fn test_handshake_initiator() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.start_handshake_with_nonce(1000).await;
            {
                let sent = sent.lock().unwrap();
                assert_eq!(sent.as_slice(), &[vec![1, 0xe8, 0x03, 0, 0]]);
            }

            // INIT_ACK carrying A+1 and the peer's nonce B=7777
            let mut init_ack = vec![2];
            init_ack.extend_from_slice(&1001i32.to_le_bytes());
            init_ack.extend_from_slice(&7777i32.to_le_bytes());
            connection.process_inbound(&init_ack).await;

            assert!(connection.is_connected().await);
            let sent = sent.lock().unwrap();
            let mut expected_fin = vec![3];
            expected_fin.extend_from_slice(&1001i32.to_le_bytes());
            expected_fin.extend_from_slice(&7778i32.to_le_bytes());
            assert_eq!(sent[1], expected_fin);
        });
    }

    #[test]
    fn test_handshake_init_retransmitted_until_timeout() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            // connect_interval 200ms, connect_timeout 1s
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.start_handshake_with_nonce(42).await;
            time::sleep(Duration::from_secs(5)).await;

            let sent = sent.lock().unwrap();
            assert!(sent.iter().all(|p| p[0] == 1));
            // initial send plus retransmissions for ~1s at 200ms; after the
            //  timeout no INIT goes out any more
            assert!(sent.len() >= 4 && sent.len() <= 7, "sent {} INITs", sent.len());
        });
    }

    #[test]
    fn test_handshake_acceptor() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            let mut init = vec![1];
            init.extend_from_slice(&500i32.to_le_bytes());
            connection.process_inbound(&init).await;

            let b = {
                let sent = sent.lock().unwrap();
                assert_eq!(sent.len(), 1);
                let init_ack = &sent[0];
                assert_eq!(init_ack.len(), 9);
                assert_eq!(init_ack[0], 2);
                assert_eq!(&init_ack[1..5], &501i32.to_le_bytes());
                i32::from_le_bytes(init_ack[5..9].try_into().unwrap())
            };
            assert!(!connection.is_connected().await);

            let mut init_fin = vec![3];
            init_fin.extend_from_slice(&501i32.to_le_bytes());
            init_fin.extend_from_slice(&b.wrapping_add(1).to_le_bytes());
            connection.process_inbound(&init_fin).await;

            assert!(connection.is_connected().await);
        });
    }

    #[test]
    fn test_handshake_nonce_mismatch_closes() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, _sent) = recording_socket();
            let disconnects = Arc::new(Mutex::new(Vec::new()));
            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_message().returning(|_, _| ());
            let disconnects_clone = disconnects.clone();
            dispatcher
                .expect_on_disconnect()
                .returning(move |conn_id, reason| {
                    disconnects_clone.lock().unwrap().push((conn_id, reason));
                });
            let (connection, mut removal_rx) =
                test_connection(test_config(), socket, Arc::new(dispatcher));

            connection.start_handshake_with_nonce(1000).await;

            // wrong A+1
            let mut init_ack = vec![2];
            init_ack.extend_from_slice(&9999i32.to_le_bytes());
            init_ack.extend_from_slice(&7777i32.to_le_bytes());
            connection.process_inbound(&init_ack).await;

            assert!(!connection.is_connected().await);
            assert_eq!(
                disconnects.lock().unwrap().as_slice(),
                &[(7, DisconnectReason::Disconnect)]
            );
            assert_eq!(removal_rx.try_recv().unwrap(), 7);
        });
    }

    #[test]
    fn test_reliable_retry_budget() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            // max_retries 3, retry_interval 300ms, no ACK ever
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.send_reliable(b"payload").await;
            time::sleep(Duration::from_secs(10)).await;

            let sent = sent.lock().unwrap();
            let reliable_sends = sent
                .iter()
                .filter(|p| p[0] == u8::from(PacketType::Reliable))
                .count();
            assert_eq!(reliable_sends, 3);
            assert!(sent.iter().all(|p| p.as_slice() == b"\x0b\x01payload"));

            assert!(connection.inner.read().await.outbound.is_empty());
        });
    }

    #[test]
    fn test_ack_stops_retransmission() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.send_reliable(b"payload").await;
            connection.process_inbound(&[20, 1]).await;
            time::sleep(Duration::from_secs(10)).await;

            let sent = sent.lock().unwrap();
            let reliable_sends = sent
                .iter()
                .filter(|p| p[0] == u8::from(PacketType::Reliable))
                .count();
            assert_eq!(reliable_sends, 1);
            assert!(connection.inner.read().await.outbound.is_empty());
        });
    }

    #[test]
    fn test_ack_for_unknown_seq_is_ignored() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, _sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.process_inbound(&[20, 99]).await;
        });
    }

    #[test]
    fn test_sequence_ids_start_at_one() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.send_reliable(b"a").await;
            connection.send_reliable(b"b").await;

            let sent = sent.lock().unwrap();
            assert_eq!(sent[0][..2], [11, 1]);
            assert_eq!(sent[1][..2], [11, 2]);
        });
    }

    #[test]
    fn test_ordered_delivery_buffers_out_of_order() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, delivered) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            // stream already established: cursor sits at seq 2
            {
                let mut inner = connection.inner.write().await;
                inner.first_packet = false;
                inner.next_expected_id = 2;
            }

            let mut pkt3 = vec![11, 3];
            pkt3.extend_from_slice(&[3u8; 9]);
            connection.process_inbound(&pkt3).await;
            assert!(delivered.lock().unwrap().is_empty());

            let mut pkt2 = vec![11, 2];
            pkt2.extend_from_slice(&[2u8; 9]);
            connection.process_inbound(&pkt2).await;

            let delivered = delivered.lock().unwrap();
            assert_eq!(
                delivered.as_slice(),
                &[(7, vec![2u8; 9]), (7, vec![3u8; 9])]
            );

            // both packets were ACKed on receipt, in arrival order
            let acks = sent
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p[0] == 20)
                .map(|p| p[1])
                .collect::<Vec<_>>();
            assert_eq!(acks, vec![3, 2]);
        });
    }

    #[test]
    fn test_first_packet_seeds_cursor() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, _sent) = recording_socket();
            let (dispatcher, delivered) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.process_inbound(&[11, 17, b'x']).await;
            connection.process_inbound(&[11, 18, b'y']).await;

            assert_eq!(
                delivered.lock().unwrap().as_slice(),
                &[(7, vec![b'x']), (7, vec![b'y'])]
            );
            assert_eq!(connection.inner.read().await.next_expected_id, 19);
        });
    }

    #[test]
    fn test_duplicate_reliable_dropped_but_acked() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, delivered) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.process_inbound(&[11, 5, b'x']).await;
            connection.process_inbound(&[11, 5, b'x']).await;

            assert_eq!(delivered.lock().unwrap().len(), 1);
            let acks = sent
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p[0] == 20)
                .count();
            assert_eq!(acks, 2);
        });
    }

    #[test]
    fn test_unordered_mode_delivers_in_arrival_order() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, _sent) = recording_socket();
            let (dispatcher, delivered) = recording_dispatcher();
            let config = RudpConfig {
                use_ordering: false,
                ..test_config()
            };
            let (connection, _removal_rx) = test_connection(config, socket, dispatcher);

            connection.process_inbound(&[11, 3, b'a']).await;
            connection.process_inbound(&[11, 2, b'b']).await;

            assert_eq!(
                delivered.lock().unwrap().as_slice(),
                &[(7, vec![b'a']), (7, vec![b'b'])]
            );
        });
    }

    #[test]
    fn test_multi_part_reassembly_dispatches_inner_packet() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, _sent) = recording_socket();
            let (dispatcher, delivered) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            let payload = (0..(MAX_PAYLOAD + 100)).map(|i| i as u8).collect::<Vec<_>>();
            let fragments =
                crate::fragment::fragment(&[PacketType::NonReliable.into()], &payload).unwrap();
            assert_eq!(fragments.len(), 2);

            connection.process_inbound(&fragments[1]).await;
            assert!(delivered.lock().unwrap().is_empty());
            connection.process_inbound(&fragments[0]).await;

            assert_eq!(delivered.lock().unwrap().as_slice(), &[(7, payload)]);
        });
    }

    #[test]
    fn test_multi_part_reliable_is_acked_once_assembled() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, delivered) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            let payload = vec![9u8; MAX_PAYLOAD * 2];
            let fragments =
                crate::fragment::fragment(&[PacketType::Reliable.into(), 4], &payload).unwrap();

            for frag in &fragments {
                connection.process_inbound(frag).await;
            }

            assert_eq!(delivered.lock().unwrap().as_slice(), &[(7, payload)]);
            let acks = sent
                .lock()
                .unwrap()
                .iter()
                .filter(|p| p.as_slice() == [20, 4])
                .count();
            assert_eq!(acks, 1);
        });
    }

    #[test]
    fn test_ping_answered_with_ping_ack() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.process_inbound(&[25]).await;

            assert_eq!(sent.lock().unwrap().as_slice(), &[vec![26]]);
        });
    }

    #[test]
    fn test_keep_alive_pings_and_inactivity_timeout() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let disconnects = Arc::new(Mutex::new(Vec::new()));
            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_message().returning(|_, _| ());
            let disconnects_clone = disconnects.clone();
            dispatcher
                .expect_on_disconnect()
                .returning(move |conn_id, reason| {
                    disconnects_clone.lock().unwrap().push((conn_id, reason));
                });

            let config = RudpConfig {
                keep_alive_ping_time: Duration::from_secs(1),
                connection_timeout: Duration::from_secs(3),
                ..test_config()
            };
            let (connection, mut removal_rx) =
                test_connection(config, socket, Arc::new(dispatcher));

            // complete the handshake so keep-alive starts
            connection.start_handshake_with_nonce(1000).await;
            let mut init_ack = vec![2];
            init_ack.extend_from_slice(&1001i32.to_le_bytes());
            init_ack.extend_from_slice(&7777i32.to_le_bytes());
            connection.process_inbound(&init_ack).await;
            assert!(connection.is_connected().await);

            time::sleep(Duration::from_millis(1100)).await;
            {
                let sent = sent.lock().unwrap();
                assert!(
                    sent.iter().any(|p| p.as_slice() == [25]),
                    "expected a PING after ~1s"
                );
            }
            assert!(disconnects.lock().unwrap().is_empty());

            // nothing ever arrives: the inactivity deadline fires ~3s after
            //  the last valid receive
            time::sleep(Duration::from_secs(3)).await;

            assert_eq!(
                disconnects.lock().unwrap().as_slice(),
                &[(7, DisconnectReason::Timeout)]
            );
            assert_eq!(removal_rx.try_recv().unwrap(), 7);

            // and no PING goes out afterwards
            let sent_after = sent.lock().unwrap().len();
            time::sleep(Duration::from_secs(5)).await;
            assert_eq!(sent.lock().unwrap().len(), sent_after);
        });
    }

    #[test]
    fn test_inbound_packet_restarts_inactivity() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, _sent) = recording_socket();
            let disconnects = Arc::new(Mutex::new(Vec::new()));
            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_message().returning(|_, _| ());
            let disconnects_clone = disconnects.clone();
            dispatcher
                .expect_on_disconnect()
                .returning(move |conn_id, reason| {
                    disconnects_clone.lock().unwrap().push((conn_id, reason));
                });

            let config = RudpConfig {
                connection_timeout: Duration::from_secs(3),
                ..test_config()
            };
            let (connection, _removal_rx) = test_connection(config, socket, Arc::new(dispatcher));
            connection.arm_inactivity().await;

            // a valid packet every 2s keeps the 3s deadline at bay
            for _ in 0..3 {
                time::sleep(Duration::from_secs(2)).await;
                connection.process_inbound(&[26]).await;
            }
            assert!(disconnects.lock().unwrap().is_empty());

            time::sleep(Duration::from_secs(4)).await;
            assert_eq!(
                disconnects.lock().unwrap().as_slice(),
                &[(7, DisconnectReason::Timeout)]
            );
        });
    }

    #[test]
    fn test_disconnect_packet_closes_once() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, _sent) = recording_socket();
            let disconnects = Arc::new(Mutex::new(Vec::new()));
            let mut dispatcher = MockMessageDispatcher::new();
            dispatcher.expect_on_message().returning(|_, _| ());
            let disconnects_clone = disconnects.clone();
            dispatcher
                .expect_on_disconnect()
                .returning(move |conn_id, reason| {
                    disconnects_clone.lock().unwrap().push((conn_id, reason));
                });
            let (connection, mut removal_rx) =
                test_connection(test_config(), socket, Arc::new(dispatcher));

            connection.process_inbound(&[30]).await;
            connection.process_inbound(&[30]).await;
            connection.local_disconnect().await;

            assert_eq!(
                disconnects.lock().unwrap().as_slice(),
                &[(7, DisconnectReason::Disconnect)]
            );
            assert_eq!(removal_rx.try_recv().unwrap(), 7);
        });
    }

    #[test]
    fn test_local_disconnect_sends_disconnect_packet() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.local_disconnect().await;
            connection.local_disconnect().await;

            let sent = sent.lock().unwrap();
            assert_eq!(sent.as_slice(), &[vec![30]]);
        });
    }

    #[test]
    fn test_no_delivery_after_close() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, _sent) = recording_socket();
            let (dispatcher, delivered) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.process_inbound(&[30]).await;
            connection.process_inbound(&[11, 1, b'x']).await;

            assert!(delivered.lock().unwrap().is_empty());
        });
    }

    #[test]
    fn test_clear_all_stops_retransmissions() {
        let rt = paused_rt();
        rt.block_on(async {
            let (socket, sent) = recording_socket();
            let (dispatcher, _) = recording_dispatcher();
            let (connection, _removal_rx) = test_connection(test_config(), socket, dispatcher);

            connection.send_reliable(b"payload").await;
            connection.clear_all().await;
            connection.clear_all().await; // idempotent

            let before = sent.lock().unwrap().len();
            time::sleep(Duration::from_secs(5)).await;
            assert_eq!(sent.lock().unwrap().len(), before);
        });
    }
}
