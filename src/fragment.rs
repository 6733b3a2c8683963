use crate::error::RudpError;
use crate::packet_header::{PacketHeader, MAX_PAYLOAD};

/// Splits a logical packet (its 1- or 2-byte header plus payload) into MULTI
///  fragments, each a complete wire datagram.
///
/// The fragment count is `ceil(len / MAX_PAYLOAD)`, and at least 1: an empty
///  payload still produces a single fragment carrying just the inner header.
///  Fragment `i` (0-based) is framed as `[MULTI, total, i+1]` followed by the
///  inner header and the payload slice for that fragment; the inner header is
///  repeated in every fragment.
pub fn fragment(inner_header: &[u8], payload: &[u8]) -> Result<Vec<Vec<u8>>, RudpError> {
    let total_parts = payload.len().div_ceil(MAX_PAYLOAD).max(1);
    if total_parts > u8::MAX as usize {
        return Err(RudpError::MalformedPacket(format!(
            "payload of {} bytes needs {} fragments, more than the framing can count",
            payload.len(),
            total_parts
        )));
    }

    let mut fragments = Vec::with_capacity(total_parts);
    for part in 0..total_parts {
        let slice = &payload[part * MAX_PAYLOAD..((part + 1) * MAX_PAYLOAD).min(payload.len())];

        let multi_header = PacketHeader::Multi {
            total_parts: total_parts as u8,
            part_index: (part + 1) as u8,
        };
        let mut buf =
            Vec::with_capacity(multi_header.serialized_len() + inner_header.len() + slice.len());
        multi_header.ser(&mut buf);
        buf.extend_from_slice(inner_header);
        buf.extend_from_slice(slice);
        fragments.push(buf);
    }
    Ok(fragments)
}

/// A connection's single reassembly slot.
///
/// The slot array is sized and the inner header captured when the first
///  fragment arrives; subsequent fragments contribute their payload slice by
///  1-based part index. Once every slot is filled, the inner packet (captured
///  header + concatenated slices) is handed back to the caller to feed through
///  normal dispatch.
///
/// There is exactly one slot per connection: a second MULTI stream from the
///  same peer interleaved with the first writes into the same slot array and
///  corrupts it. Fragments whose part count disagrees with the slot are
///  malformed and dropped without touching the slot.
pub struct Reassembly {
    total_parts: u8,
    inner_header: Vec<u8>,
    slots: Vec<Option<Vec<u8>>>,
    num_filled: usize,
}

impl Reassembly {
    pub fn new(total_parts: u8, inner_header: Vec<u8>) -> Reassembly {
        Reassembly {
            total_parts,
            inner_header,
            slots: vec![None; total_parts as usize],
            num_filled: 0,
        }
    }

    pub fn total_parts(&self) -> u8 {
        self.total_parts
    }

    /// Stores one fragment's payload slice (the bytes after the repeated inner
    ///  header). Returns the reassembled inner packet once all parts are
    ///  present, `None` while parts are still missing.
    pub fn on_fragment(
        &mut self,
        total_parts: u8,
        part_index: u8,
        body: &[u8],
    ) -> Result<Option<Vec<u8>>, RudpError> {
        if total_parts != self.total_parts {
            return Err(RudpError::MalformedPacket(format!(
                "multi-part fragment declares {} total parts, reassembly expects {}",
                total_parts, self.total_parts
            )));
        }
        if part_index == 0 || part_index > self.total_parts {
            return Err(RudpError::MalformedPacket(format!(
                "multi-part index {} out of range 1..={}",
                part_index, self.total_parts
            )));
        }

        let slot = &mut self.slots[part_index as usize - 1];
        if slot.is_none() {
            self.num_filled += 1;
        }
        *slot = Some(body.to_vec());

        if self.num_filled < self.total_parts as usize {
            return Ok(None);
        }

        let mut assembled = std::mem::take(&mut self.inner_header);
        for slot in &mut self.slots {
            let part = slot.take().expect("all slots filled");
            assembled.extend_from_slice(&part);
        }
        Ok(Some(assembled))
    }
}
