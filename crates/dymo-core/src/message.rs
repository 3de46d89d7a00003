//! DYMO message types
//!
//! ```text
//! Routing message (RREQ / RREP):
//! ┌───────────┬──────────────┬──────────────┬────────────────────────────┐
//! │ HopLimit  │ OrigNode     │ TargetNode   │ AdditionalNodes (0..n)     │
//! │ (1B)      │ AddressBlock │ AddressBlock │ AddressBlock, ...          │
//! └───────────┴──────────────┴──────────────┴────────────────────────────┘
//!   nominal size: 13 + 10 * (1 + n) bytes
//!
//! Error message (RERR):
//! ┌───────────┬───────────────────────────────────────────────────────────┐
//! │ HopLimit  │ UnreachableNodes (1..n)                                   │
//! └───────────┴───────────────────────────────────────────────────────────┘
//!   nominal size: 4 + 8 * n bytes
//! ```

use crate::address::{Address, ADDRESS_BITS};
use crate::seqnum::SeqNum;
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Length in bytes of a routing message header
pub const RM_HEADER_LENGTH: usize = 13;
/// Length in bytes of one routing block
pub const RBLOCK_LENGTH: usize = 10;
/// Length in bytes of an error message header
pub const RERR_HEADER_LENGTH: usize = 4;
/// Length in bytes of one unreachable-node block
pub const UBLOCK_LENGTH: usize = 8;

/// Highest distance that can still be incremented without overflowing
pub const MAX_RELAYABLE_DIST: u8 = 0xFF - 2;

/// Routing information about one address
///
/// Every field except the address is optional on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AddressBlock {
    pub address: Address,
    pub seq_num: Option<SeqNum>,
    pub prefix: Option<u8>,
    /// Hop count from the address' authority to the current holder
    pub dist: Option<u8>,
}

impl AddressBlock {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn with_seq_num(mut self, seq_num: SeqNum) -> Self {
        self.seq_num = Some(seq_num);
        self
    }

    pub fn with_prefix(mut self, prefix: u8) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn with_dist(mut self, dist: u8) -> Self {
        self.dist = Some(dist);
        self
    }

    /// Sequence number, or [`SeqNum::UNKNOWN`] when absent
    pub fn seq_num_or_unknown(&self) -> SeqNum {
        self.seq_num.unwrap_or(SeqNum::UNKNOWN)
    }

    /// Prefix length, host-only when absent
    pub fn prefix_or_host(&self) -> u8 {
        self.prefix.unwrap_or(ADDRESS_BITS)
    }

    /// Whether incrementing the distance would leave the representable range
    pub fn dist_would_overflow(&self) -> bool {
        self.dist.is_some_and(|d| d > MAX_RELAYABLE_DIST)
    }

    /// Add one hop to the distance, if present
    pub fn increment_dist(&mut self) {
        if let Some(d) = self.dist.as_mut() {
            *d = d.saturating_add(1);
        }
    }
}

/// Request/reply discriminator for routing messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingKind {
    Request,
    Reply,
}

/// Common body of route requests and route replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingMessage {
    pub hop_limit: u8,
    pub orig_node: AddressBlock,
    pub target_node: AddressBlock,
    /// Routing information accumulated hop by hop
    pub additional_nodes: Vec<AddressBlock>,
}

impl RoutingMessage {
    pub fn new(hop_limit: u8, orig_node: AddressBlock, target_node: AddressBlock) -> Self {
        Self {
            hop_limit,
            orig_node,
            target_node,
            additional_nodes: Vec::new(),
        }
    }
}

/// Route error listing unreachable destinations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub hop_limit: u8,
    pub unreachable_nodes: Vec<AddressBlock>,
}

/// Message kind this implementation does not process (UERR)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsupportedMessage {
    pub hop_limit: u8,
    /// Kind tag the sender could not handle
    pub unsupported_kind: u8,
}

/// Application data routed by DYMO
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPacket {
    pub source: Address,
    pub destination: Address,
    /// Time the packet entered the network layer at its source
    pub created_at: Timestamp,
    pub payload: Vec<u8>,
}

impl DataPacket {
    pub fn new(source: Address, destination: Address, created_at: Timestamp, payload: Vec<u8>) -> Self {
        Self {
            source,
            destination,
            created_at,
            payload,
        }
    }
}

/// Everything the engine can receive or transmit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(RoutingMessage),
    Reply(RoutingMessage),
    Error(ErrorMessage),
    Unsupported(UnsupportedMessage),
    Data(DataPacket),
}

impl Message {
    /// Wrap a routing message body with its kind
    pub fn routing(kind: RoutingKind, rm: RoutingMessage) -> Self {
        match kind {
            RoutingKind::Request => Message::Request(rm),
            RoutingKind::Reply => Message::Reply(rm),
        }
    }

    /// Nominal transmission cost in bytes
    pub fn byte_len(&self) -> usize {
        match self {
            Message::Request(rm) | Message::Reply(rm) => {
                RM_HEADER_LENGTH + (1 + rm.additional_nodes.len()) * RBLOCK_LENGTH
            }
            Message::Error(rerr) => RERR_HEADER_LENGTH + rerr.unreachable_nodes.len() * UBLOCK_LENGTH,
            Message::Unsupported(_) => RERR_HEADER_LENGTH,
            // Data travels unencapsulated
            Message::Data(pkt) => pkt.payload.len(),
        }
    }

    /// Whether this is DYMO control traffic
    pub fn is_control(&self) -> bool {
        !matches!(self, Message::Data(_))
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Message::Request(_) => "RREQ",
            Message::Reply(_) => "RREP",
            Message::Error(_) => "RERR",
            Message::Unsupported(_) => "UERR",
            Message::Data(_) => "DATA",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_len() {
        let mut rm = RoutingMessage::new(
            5,
            AddressBlock::new(Address::new(10, 0, 0, 1)).with_dist(0),
            AddressBlock::new(Address::new(10, 0, 0, 5)),
        );
        assert_eq!(Message::Request(rm.clone()).byte_len(), 23);
        rm.additional_nodes.push(AddressBlock::new(Address::new(10, 0, 0, 2)));
        rm.additional_nodes.push(AddressBlock::new(Address::new(10, 0, 0, 3)));
        assert_eq!(Message::Reply(rm).byte_len(), 43);

        let rerr = ErrorMessage {
            hop_limit: 10,
            unreachable_nodes: vec![AddressBlock::new(Address::new(10, 0, 0, 9)); 3],
        };
        assert_eq!(Message::Error(rerr).byte_len(), 28);

        let data = DataPacket::new(Address::new(10, 0, 0, 1), Address::new(10, 0, 0, 2), Timestamp::ZERO, vec![0; 64]);
        assert_eq!(Message::Data(data).byte_len(), 64);
    }

    #[test]
    fn test_dist_overflow() {
        let mut block = AddressBlock::new(Address::new(10, 0, 0, 1)).with_dist(MAX_RELAYABLE_DIST);
        assert!(!block.dist_would_overflow());
        block.increment_dist();
        assert_eq!(block.dist, Some(0xFE));
        assert!(block.dist_would_overflow());

        // Absent distance never overflows and stays absent
        let mut bare = AddressBlock::new(Address::new(10, 0, 0, 1));
        bare.increment_dist();
        assert_eq!(bare.dist, None);
        assert!(!bare.dist_would_overflow());
    }
}
