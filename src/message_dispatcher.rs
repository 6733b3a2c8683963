use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::ConnId;

/// Why a connection went away, delivered to
///  [`MessageDispatcher::on_disconnect`] (and encoded as a single byte where
///  it crosses an API boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DisconnectReason {
    /// The peer (or the local side) ended the connection deliberately.
    Disconnect = 1,
    /// No valid packet arrived within the configured inactivity deadline.
    Timeout = 2,
}

/// The application's view of a transport: message delivery and connection
///  termination.
///
/// A transport has one default dispatcher; individual connections can be
///  given their own through `Transport::set_dispatcher`. For any one
///  connection, `on_disconnect` fires at most once, and no `on_message`
///  follows it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageDispatcher: Send + Sync + 'static {
    async fn on_message(&self, conn_id: ConnId, msg_buf: &[u8]);

    async fn on_disconnect(&self, conn_id: ConnId, reason: DisconnectReason);
}
