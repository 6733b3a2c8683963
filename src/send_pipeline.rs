use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

use crate::fragment;
use crate::packet_header::MAX_DATAGRAM;

/// Abstraction for putting one datagram on the wire, introduced to facilitate
///  mocking the I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        trace!("UDP socket: sending {} bytes to {:?}", packet_buf.len(), to);

        // send failures are never propagated - reliable traffic is covered by
        //  the retry timer, everything else is best-effort anyway
        if let Err(e) = self.send_to(packet_buf, to).await {
            error!("error sending UDP packet to {:?}: {}", to, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}

/// The outbound half shared by all connections of a transport: frames a
///  header + body into one datagram, or into MULTI fragments when the framed
///  size exceeds the datagram limit.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    /// Sends pre-framed bytes as a single datagram, no size handling.
    pub async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.socket.do_send_packet(to, packet_buf).await;
    }

    /// Sends a logical packet: one datagram if `header ++ body` fits, MULTI
    ///  fragments otherwise. Oversized payloads that cannot be framed are
    ///  logged and dropped.
    pub async fn send_framed(&self, to: SocketAddr, header: &[u8], body: &[u8]) {
        if header.len() + body.len() <= MAX_DATAGRAM {
            let mut buf = Vec::with_capacity(header.len() + body.len());
            buf.extend_from_slice(header);
            buf.extend_from_slice(body);
            self.socket.do_send_packet(to, &buf).await;
            return;
        }

        match fragment::fragment(header, body) {
            Ok(fragments) => {
                trace!("sending {} byte payload to {:?} as {} fragments", body.len(), to, fragments.len());
                for frag in fragments {
                    self.socket.do_send_packet(to, &frag).await;
                }
            }
            Err(e) => {
                error!("cannot frame {} byte payload for {:?}: {}", body.len(), to, e);
            }
        }
    }
}
