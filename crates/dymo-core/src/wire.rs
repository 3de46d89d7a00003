//! Wire format encoding and decoding
//!
//! ```text
//! Frame:          kind (1B) | body
//! RREQ/RREP body: hop_limit (1B) | orig block | target block | count (1B) | blocks
//! RERR body:      hop_limit (1B) | count (1B) | blocks
//! UERR body:      hop_limit (1B) | unsupported kind (1B)
//! DATA body:      src (4B) | dst (4B) | created_at µs (8B) | len (2B) | payload
//!
//! AddressBlock:   flags (1B) | address (4B) | [seq (2B)] | [prefix (1B)] | [dist (1B)]
//!                 flags bit 0 = seq present, bit 1 = prefix present, bit 2 = dist present
//! ```
//!
//! All integers are big-endian. The nominal transmission cost used for
//! accounting is [`Message::byte_len`], not the length of this encoding.

use crate::address::Address;
use crate::error::{DymoError, Result};
use crate::message::{AddressBlock, DataPacket, ErrorMessage, Message, RoutingMessage, UnsupportedMessage};
use crate::seqnum::SeqNum;
use crate::time::Timestamp;

pub const KIND_RREQ: u8 = 1;
pub const KIND_RREP: u8 = 2;
pub const KIND_RERR: u8 = 3;
pub const KIND_UERR: u8 = 4;
pub const KIND_DATA: u8 = 5;

const HAS_SEQ: u8 = 0x01;
const HAS_PREFIX: u8 = 0x02;
const HAS_DIST: u8 = 0x04;

/// Encode a message into a frame
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(message.byte_len() + 8);
    match message {
        Message::Request(rm) | Message::Reply(rm) => {
            out.push(if matches!(message, Message::Request(_)) { KIND_RREQ } else { KIND_RREP });
            out.push(rm.hop_limit);
            put_block(&mut out, &rm.orig_node);
            put_block(&mut out, &rm.target_node);
            put_blocks(&mut out, &rm.additional_nodes)?;
        }
        Message::Error(rerr) => {
            out.push(KIND_RERR);
            out.push(rerr.hop_limit);
            put_blocks(&mut out, &rerr.unreachable_nodes)?;
        }
        Message::Unsupported(uerr) => {
            out.push(KIND_UERR);
            out.push(uerr.hop_limit);
            out.push(uerr.unsupported_kind);
        }
        Message::Data(pkt) => {
            let len = u16::try_from(pkt.payload.len())
                .map_err(|_| DymoError::Malformed(format!("payload of {} bytes too large", pkt.payload.len())))?;
            out.push(KIND_DATA);
            out.extend_from_slice(&pkt.source.to_bytes());
            out.extend_from_slice(&pkt.destination.to_bytes());
            out.extend_from_slice(&pkt.created_at.as_micros().to_be_bytes());
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(&pkt.payload);
        }
    }
    Ok(out)
}

/// Decode a frame
///
/// An unknown kind tag is reported as [`DymoError::UnknownMessageKind`].
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let mut r = Reader { bytes, pos: 0 };
    let kind = r.u8()?;
    let message = match kind {
        KIND_RREQ | KIND_RREP => {
            let hop_limit = r.u8()?;
            let orig_node = r.block()?;
            let target_node = r.block()?;
            let additional_nodes = r.blocks()?;
            let rm = RoutingMessage {
                hop_limit,
                orig_node,
                target_node,
                additional_nodes,
            };
            if kind == KIND_RREQ {
                Message::Request(rm)
            } else {
                Message::Reply(rm)
            }
        }
        KIND_RERR => {
            let hop_limit = r.u8()?;
            let unreachable_nodes = r.blocks()?;
            Message::Error(ErrorMessage {
                hop_limit,
                unreachable_nodes,
            })
        }
        KIND_UERR => Message::Unsupported(UnsupportedMessage {
            hop_limit: r.u8()?,
            unsupported_kind: r.u8()?,
        }),
        KIND_DATA => {
            let source = r.address()?;
            let destination = r.address()?;
            let created_at = Timestamp::from_micros(u64::from_be_bytes(r.array::<8>()?));
            let len = u16::from_be_bytes(r.array::<2>()?) as usize;
            let payload = r.take(len)?.to_vec();
            Message::Data(DataPacket::new(source, destination, created_at, payload))
        }
        other => return Err(DymoError::UnknownMessageKind(other)),
    };
    if r.pos != bytes.len() {
        return Err(DymoError::Malformed(format!(
            "{} trailing bytes after {}",
            bytes.len() - r.pos,
            message.name()
        )));
    }
    Ok(message)
}

fn put_block(out: &mut Vec<u8>, block: &AddressBlock) {
    let mut flags = 0u8;
    if block.seq_num.is_some() {
        flags |= HAS_SEQ;
    }
    if block.prefix.is_some() {
        flags |= HAS_PREFIX;
    }
    if block.dist.is_some() {
        flags |= HAS_DIST;
    }
    out.push(flags);
    out.extend_from_slice(&block.address.to_bytes());
    if let Some(seq) = block.seq_num {
        out.extend_from_slice(&seq.value().to_be_bytes());
    }
    if let Some(prefix) = block.prefix {
        out.push(prefix);
    }
    if let Some(dist) = block.dist {
        out.push(dist);
    }
}

fn put_blocks(out: &mut Vec<u8>, blocks: &[AddressBlock]) -> Result<()> {
    let count = u8::try_from(blocks.len())
        .map_err(|_| DymoError::Malformed(format!("{} address blocks exceed 255", blocks.len())))?;
    out.push(count);
    for block in blocks {
        put_block(out, block);
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(DymoError::Malformed(format!(
                "truncated frame: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.bytes.len()
            )));
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn address(&mut self) -> Result<Address> {
        Ok(Address::from_bytes(self.array::<4>()?))
    }

    fn block(&mut self) -> Result<AddressBlock> {
        let flags = self.u8()?;
        let mut block = AddressBlock::new(self.address()?);
        if flags & HAS_SEQ != 0 {
            block.seq_num = Some(SeqNum::new(u16::from_be_bytes(self.array::<2>()?)));
        }
        if flags & HAS_PREFIX != 0 {
            block.prefix = Some(self.u8()?);
        }
        if flags & HAS_DIST != 0 {
            block.dist = Some(self.u8()?);
        }
        Ok(block)
    }

    fn blocks(&mut self) -> Result<Vec<AddressBlock>> {
        let count = self.u8()? as usize;
        (0..count).map(|_| self.block()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> Message {
        let mut rm = RoutingMessage::new(
            7,
            AddressBlock::new(Address::new(10, 0, 0, 1))
                .with_seq_num(SeqNum::new(0x1234))
                .with_prefix(24)
                .with_dist(0),
            AddressBlock::new(Address::new(10, 0, 0, 5)),
        );
        rm.additional_nodes
            .push(AddressBlock::new(Address::new(10, 0, 0, 2)).with_seq_num(SeqNum::new(9)).with_dist(1));
        Message::Request(rm)
    }

    #[test]
    fn test_request_survives_encoding() {
        let msg = sample_request();
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes[0], KIND_RREQ);
        assert_eq!(decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_optional_fields_absent() {
        let block = AddressBlock::new(Address::new(192, 168, 0, 1));
        let mut out = Vec::new();
        put_block(&mut out, &block);
        // flags + address only
        assert_eq!(out.len(), 5);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn test_unknown_kind_is_fatal() {
        match decode(&[0x7F, 1, 2, 3]) {
            Err(DymoError::UnknownMessageKind(0x7F)) => {}
            other => panic!("expected unknown kind, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_frame() {
        let bytes = encode(&sample_request()).unwrap();
        let result = decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(DymoError::Malformed(_))));

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(matches!(decode(&padded), Err(DymoError::Malformed(_))));
    }

    #[test]
    fn test_data_packet_frame() {
        let pkt = DataPacket::new(
            Address::new(10, 0, 0, 1),
            Address::new(10, 0, 0, 4),
            Timestamp::from_millis(1500),
            b"hello".to_vec(),
        );
        let bytes = encode(&Message::Data(pkt.clone())).unwrap();
        assert_eq!(bytes.len(), 1 + 4 + 4 + 8 + 2 + 5);
        assert_eq!(decode(&bytes).unwrap(), Message::Data(pkt));
    }
}
