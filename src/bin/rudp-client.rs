//! Line-oriented console client: every line typed on stdin is sent reliably
//!  to the server; whatever the server sends back is printed.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, Level};

use rudp::config::RudpConfig;
use rudp::message_dispatcher::{DisconnectReason, MessageDispatcher};
use rudp::transport::Transport;
use rudp::ConnId;

struct PrintingDispatcher;

#[async_trait]
impl MessageDispatcher for PrintingDispatcher {
    async fn on_message(&self, conn_id: ConnId, msg_buf: &[u8]) {
        println!("[{}] {}", conn_id, String::from_utf8_lossy(msg_buf));
    }

    async fn on_disconnect(&self, conn_id: ConnId, reason: DisconnectReason) {
        println!("[{}] disconnected: {:?}", conn_id, reason);
        std::process::exit(0);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args
        .next()
        .map(|arg| arg.parse::<u32>())
        .transpose()?
        .unwrap_or(4050);

    let transport = Transport::client(0, RudpConfig::default(), Arc::new(PrintingDispatcher)).await?;
    let conn_id = transport.connect(&host, port).await?;
    info!("connecting to {}:{} as connection {}", host, port, conn_id);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line == "/quit" {
            transport.disconnect(conn_id).await;
            break;
        }
        transport.send_text(conn_id, &line).await;
    }
    Ok(())
}
