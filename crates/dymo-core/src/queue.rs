//! Packets waiting for a route
//!
//! A single FIFO in global insertion order. Per-destination views are
//! obtained by filtering, so draining one destination keeps the order in
//! which its packets arrived.

use crate::address::Address;
use crate::message::DataPacket;
use crate::seqnum::SeqNum;
use std::collections::VecDeque;

/// One buffered outbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueElement {
    /// Own sequence number when the packet was queued
    pub seq_num_at_enqueue: SeqNum,
    pub destination: Address,
    pub source: Address,
    pub packet: DataPacket,
}

/// FIFO of packets awaiting route resolution
#[derive(Debug, Default)]
pub struct PendingQueue {
    elements: VecDeque<QueueElement>,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, element: QueueElement) {
        self.elements.push_back(element);
    }

    /// Remove the earliest packet for exactly `destination`
    pub fn dequeue_first_for(&mut self, destination: Address) -> Option<QueueElement> {
        let idx = self.elements.iter().position(|e| e.destination == destination)?;
        self.elements.remove(idx)
    }

    /// Remove the earliest packet whose destination lies in `address/prefix`
    pub fn dequeue_first_matching(&mut self, address: Address, prefix: u8) -> Option<QueueElement> {
        let idx = self
            .elements
            .iter()
            .position(|e| e.destination.prefix_matches(address, prefix))?;
        self.elements.remove(idx)
    }

    /// Discard every packet for `destination`, returning how many were dropped
    pub fn discard_all_for(&mut self, destination: Address) -> usize {
        let before = self.elements.len();
        self.elements.retain(|e| e.destination != destination);
        before - self.elements.len()
    }

    /// Number of packets queued for `destination`
    pub fn count_for(&self, destination: Address) -> usize {
        self.elements.iter().filter(|e| e.destination == destination).count()
    }

    /// Drop everything
    pub fn clear(&mut self) -> usize {
        let n = self.elements.len();
        self.elements.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}
