//! A connection-oriented reliable-datagram transport layered on top of UDP.
//!
//! UDP gives us cheap, connectionless, unordered datagrams; this crate adds the
//!  minimum machinery on top to make that usable for applications that want a
//!  long-lived conversation with a peer:
//! * a *connection* per remote peer, established through a three-way handshake
//!   with random nonces so both endpoints know they are talking about the same
//!   session
//! * best-effort single-datagram sends for traffic where losing a packet is fine
//! * *reliable* sends that are retransmitted at a fixed interval until the peer
//!   acknowledges them or a retry budget is exhausted
//! * in-order delivery of reliable messages per peer, buffering packets that
//!   arrive ahead of the expected sequence id
//! * transparent splitting of payloads that exceed the datagram size limit into
//!   multi-part packets, reassembled on the receiving side
//! * keep-alive pings on idle connections and an inactivity timeout that reaps
//!   connections whose peer went away
//!
//! It is explicitly *not* TCP: there is no congestion control, no flow control
//!  and no backpressure, the sequence space is a single byte, and a reliable
//!  send that exhausts its retry budget is dropped silently. The intended use
//!  is small control/chat-style traffic between cooperating endpoints on
//!  reasonably healthy networks.
//!
//! ## Wire format
//!
//! Every datagram starts with a one-byte packet type, optionally followed by
//!  type-specific header bytes, followed by the payload. All multi-byte
//!  integers are little-endian.
//!
//! ```ascii
//! INIT         =  1: [type] [nonce A: i32]                    handshake step 1
//! INIT_ACK     =  2: [type] [A+1: i32] [nonce B: i32]         handshake step 2
//! INIT_FIN     =  3: [type] [A+1: i32] [B+1: i32]             handshake step 3
//! NON_RELIABLE = 10: [type] [payload...]
//! RELIABLE     = 11: [type] [seq: u8] [payload...]
//! MULTI        = 12: [type] [total parts: u8] [part index (1-based): u8]
//!                    [inner packet: header + payload slice]
//! ACK          = 20: [type] [seq: u8]
//! PING         = 25: [type]
//! PING_ACK     = 26: [type]
//! DISCONNECT   = 30: [type]
//! ```
//!
//! A datagram is at most [`MAX_DATAGRAM`](packet_header::MAX_DATAGRAM) bytes;
//!  payloads whose framed size exceeds that are split into
//!  `ceil(len / MAX_PAYLOAD)` MULTI fragments, each carrying a slice of at most
//!  [`MAX_PAYLOAD`](packet_header::MAX_PAYLOAD) bytes plus the inner packet's
//!  header in the first position after the MULTI header.
//!
//! Sequence ids for reliable packets live in `0..=254`: the increment is
//!  modulo 255, so the value 255 never appears on the wire. This (and the raw
//!  byte comparison on the receive path) is carried over from the protocol
//!  this crate interoperates with.
//!
//! ## Structure
//!
//! [`Transport`](transport::Transport) owns the UDP socket, the peer maps and
//!  the receive loop; a [`Connection`](connection::Connection) per peer owns
//!  the handshake state machine, the retransmit table, the reorder buffer and
//!  the timers. Inbound messages and connection termination are handed to a
//!  [`MessageDispatcher`](message_dispatcher::MessageDispatcher) implemented
//!  by the application.

pub mod config;
pub mod connection;
pub mod error;
pub mod fragment;
pub mod message_dispatcher;
pub mod packet_header;
pub mod send_pipeline;
pub mod transport;

/// Stable identifier of a connection within its transport. Non-zero, assigned
///  monotonically (modulo `i32::MAX`) when the connection is created.
pub type ConnId = i32;
