//! Minimal echo server: every message a peer delivers reliably comes straight
//!  back to it, also reliably.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, Level};

use rudp::config::RudpConfig;
use rudp::message_dispatcher::{DisconnectReason, MessageDispatcher};
use rudp::transport::Transport;
use rudp::ConnId;

enum Event {
    Message(ConnId, Vec<u8>),
    Disconnected(ConnId, DisconnectReason),
}

struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<Event>,
}

#[async_trait]
impl MessageDispatcher for ChannelDispatcher {
    async fn on_message(&self, conn_id: ConnId, msg_buf: &[u8]) {
        self.tx.send(Event::Message(conn_id, msg_buf.to_vec())).ok();
    }

    async fn on_disconnect(&self, conn_id: ConnId, reason: DisconnectReason) {
        self.tx.send(Event::Disconnected(conn_id, reason)).ok();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let port = std::env::args()
        .nth(1)
        .map(|arg| arg.parse::<u16>())
        .transpose()?
        .unwrap_or(4050);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let transport = Transport::server(
        port,
        RudpConfig::default(),
        Arc::new(ChannelDispatcher { tx }),
    )
    .await?;
    info!("echo server listening on {:?}", transport.local_addr());

    while let Some(event) = rx.recv().await {
        match event {
            Event::Message(conn_id, msg) => {
                info!("connection {}: {} bytes - echoing", conn_id, msg.len());
                transport.send_reliable(conn_id, &msg).await;
            }
            Event::Disconnected(conn_id, reason) => {
                info!("connection {} closed: {:?}", conn_id, reason);
            }
        }
    }
    Ok(())
}
