use std::fmt::Debug;

use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::RudpError;

/// Maximum payload slice carried by a single MULTI fragment.
pub const MAX_PAYLOAD: usize = 1400;

/// Maximum size of any single datagram on the wire (header + payload). A
///  framed packet above this limit must be split into MULTI fragments before
///  it is sent.
pub const MAX_DATAGRAM: usize = 1450;

/// The packet-type byte. Any value on the wire that is not one of these is
///  rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    InitAck = 2,
    InitFin = 3,
    NonReliable = 10,
    Reliable = 11,
    Multi = 12,
    Ack = 20,
    Ping = 25,
    PingAck = 26,
    Disconnect = 30,
}

/// The parsed per-type header at the start of a datagram. Everything after
///  the header is payload (for MULTI: the inner packet's header plus the
///  payload slice of that fragment).
#[derive(Clone, Eq, PartialEq)]
pub enum PacketHeader {
    Init,
    InitAck,
    InitFin,
    NonReliable,
    Reliable { seq: u8 },
    /// `part_index` is 1-based, `1..=total_parts`.
    Multi { total_parts: u8, part_index: u8 },
    Ack { seq: u8 },
    Ping,
    PingAck,
    Disconnect,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketHeader::Init => write!(f, "INIT"),
            PacketHeader::InitAck => write!(f, "INIT_ACK"),
            PacketHeader::InitFin => write!(f, "INIT_FIN"),
            PacketHeader::NonReliable => write!(f, "NON_RELIABLE"),
            PacketHeader::Reliable { seq } => write!(f, "RELIABLE(#{})", seq),
            PacketHeader::Multi { total_parts, part_index } => {
                write!(f, "MULTI({}/{})", part_index, total_parts)
            }
            PacketHeader::Ack { seq } => write!(f, "ACK(#{})", seq),
            PacketHeader::Ping => write!(f, "PING"),
            PacketHeader::PingAck => write!(f, "PING_ACK"),
            PacketHeader::Disconnect => write!(f, "DISCONNECT"),
        }
    }
}

impl PacketHeader {
    pub fn packet_type(&self) -> PacketType {
        match self {
            PacketHeader::Init => PacketType::Init,
            PacketHeader::InitAck => PacketType::InitAck,
            PacketHeader::InitFin => PacketType::InitFin,
            PacketHeader::NonReliable => PacketType::NonReliable,
            PacketHeader::Reliable { .. } => PacketType::Reliable,
            PacketHeader::Multi { .. } => PacketType::Multi,
            PacketHeader::Ack { .. } => PacketType::Ack,
            PacketHeader::Ping => PacketType::Ping,
            PacketHeader::PingAck => PacketType::PingAck,
            PacketHeader::Disconnect => PacketType::Disconnect,
        }
    }

    /// Header length on the wire, derived from the packet type alone.
    pub fn header_len(packet_type: PacketType) -> usize {
        match packet_type {
            PacketType::Reliable | PacketType::Ack => 2,
            PacketType::Multi => 3,
            _ => 1,
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::header_len(self.packet_type())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.packet_type().into());
        match *self {
            PacketHeader::Reliable { seq } | PacketHeader::Ack { seq } => {
                buf.put_u8(seq);
            }
            PacketHeader::Multi { total_parts, part_index } => {
                buf.put_u8(total_parts);
                buf.put_u8(part_index);
            }
            _ => {}
        }
    }

    /// Convenience for callers that need the header as standalone bytes, e.g.
    ///  to store it alongside a retransmittable body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf
    }

    /// Parses the header, leaving `buf` positioned at the first payload byte.
    ///
    /// Fails with [`RudpError::MalformedPacket`] if the buffer is shorter than
    ///  the header length its type byte implies, if the type byte is unknown,
    ///  or if MULTI part metadata is structurally invalid.
    pub fn deser(buf: &mut impl Buf) -> Result<PacketHeader, RudpError> {
        let type_byte = buf
            .try_get_u8()
            .map_err(|_| RudpError::MalformedPacket("empty buffer".to_string()))?;
        let packet_type = PacketType::try_from(type_byte)
            .map_err(|_| RudpError::MalformedPacket(format!("unknown packet type {}", type_byte)))?;

        let header = match packet_type {
            PacketType::Init => PacketHeader::Init,
            PacketType::InitAck => PacketHeader::InitAck,
            PacketType::InitFin => PacketHeader::InitFin,
            PacketType::NonReliable => PacketHeader::NonReliable,
            PacketType::Ping => PacketHeader::Ping,
            PacketType::PingAck => PacketHeader::PingAck,
            PacketType::Disconnect => PacketHeader::Disconnect,
            PacketType::Reliable => PacketHeader::Reliable {
                seq: Self::try_get_u8(buf, packet_type)?,
            },
            PacketType::Ack => PacketHeader::Ack {
                seq: Self::try_get_u8(buf, packet_type)?,
            },
            PacketType::Multi => {
                let total_parts = Self::try_get_u8(buf, packet_type)?;
                let part_index = Self::try_get_u8(buf, packet_type)?;
                if total_parts == 0 || part_index == 0 || part_index > total_parts {
                    return Err(RudpError::MalformedPacket(format!(
                        "inconsistent multi-part metadata: part {} of {}",
                        part_index, total_parts
                    )));
                }
                PacketHeader::Multi { total_parts, part_index }
            }
        };
        Ok(header)
    }

    fn try_get_u8(buf: &mut impl Buf, packet_type: PacketType) -> Result<u8, RudpError> {
        buf.try_get_u8().map_err(|_| {
            RudpError::MalformedPacket(format!("buffer too short for {:?} header", packet_type))
        })
    }
}
