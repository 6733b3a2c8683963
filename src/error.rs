use thiserror::Error;

/// The error taxonomy of the transport.
///
/// Only connect-time validation errors ([`InvalidAddress`](RudpError::InvalidAddress),
///  [`InvalidPort`](RudpError::InvalidPort)) and bind failures are surfaced to
///  callers - those are caller bugs. Everything transient (malformed inbound
///  packets, datagram send failures, handshake mismatches) is logged and
///  handled inside the engine; a terminal connection state is reported exactly
///  once through `MessageDispatcher::on_disconnect`.
#[derive(Debug, Error)]
pub enum RudpError {
    /// The host passed to `connect` is neither a parseable IP address nor a
    ///  resolvable host name.
    #[error("unresolvable host '{0}'")]
    InvalidAddress(String),

    /// The port passed to `connect` is outside the valid UDP port range.
    #[error("port {0} is outside the valid range 0..=65535")]
    InvalidPort(u32),

    /// A configuration value that cannot work, e.g. a zero retry interval.
    ///  Surfaced when the transport is created.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An inbound buffer that cannot be parsed: truncated header, unknown
    ///  packet type, or inconsistent multi-part metadata. Never surfaced to
    ///  the application - logged and dropped where it occurs.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// An error from the datagram layer, e.g. failure to bind the socket.
    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// A handshake nonce check failed; the connection is closed.
    #[error("handshake nonce mismatch")]
    HandshakeMismatch,
}
