//! Route quality comparison
//!
//! Decides whether routing information received in an address block
//! supersedes what an existing routing entry already holds.

use crate::message::AddressBlock;
use crate::routing::RoutingEntry;

/// Whether `block` carries better routing information than `entry`
///
/// Fresher sequence numbers always win. With equal sequence numbers the
/// block's distance is compared after adding the hop it just travelled;
/// unknown distances, implausible jumps and longer paths are rejected,
/// and an equally long path only displaces a working route when it
/// arrives in a reply.
pub fn is_better(entry: &RoutingEntry, block: &AddressBlock, is_request: bool) -> bool {
    let block_seq = block.seq_num_or_unknown();
    if entry.seq_num.is_fresher_than(block_seq) {
        return false;
    }

    if entry.seq_num == block_seq {
        let block_dist = block.dist.map_or(0, |d| u16::from(d) + 1);
        if block_dist == 0 || entry.distance == 0 {
            return false;
        }
        if block_dist > entry.distance + 1 {
            return false;
        }
        if block_dist > entry.distance {
            return false;
        }
        if block_dist == entry.distance && !entry.broken && is_request {
            return false;
        }
    }

    true
}
