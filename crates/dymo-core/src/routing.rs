//! DYMO routing table
//!
//! Entries are kept in creation order. Lookups by address use the longest
//! matching prefix; when two entries match with the same prefix length the
//! one created first wins.

use crate::address::{Address, InterfaceId, ADDRESS_BITS};
use crate::error::{DymoError, Result};
use crate::seqnum::SeqNum;
use crate::timer::{Timer, TimerService};
use std::fmt;

/// A route to a destination prefix
#[derive(Debug, Clone)]
pub struct RoutingEntry {
    /// Destination address
    pub address: Address,
    /// Number of leading address bits this route covers
    pub prefix: u8,
    /// Sequence number of the destination's authority
    pub seq_num: SeqNum,
    /// Hop count; 0 means unknown
    pub distance: u16,
    pub next_hop: Address,
    pub next_hop_interface: InterfaceId,
    /// Invalidated by a route error, pending deletion
    pub broken: bool,
    pub age_min: Timer,
    pub age_max: Timer,
    pub new: Timer,
    pub used: Timer,
    pub delete: Timer,
}

impl RoutingEntry {
    /// Create an empty host route to `address`
    pub fn new(address: Address) -> Self {
        Self {
            address,
            prefix: ADDRESS_BITS,
            seq_num: SeqNum::UNKNOWN,
            distance: 0,
            next_hop: Address::UNSPECIFIED,
            next_hop_interface: InterfaceId::default(),
            broken: false,
            age_min: Timer::new(),
            age_max: Timer::new(),
            new: Timer::new(),
            used: Timer::new(),
            delete: Timer::new(),
        }
    }

    /// Whether `addr` falls inside this entry's prefix
    pub fn covers(&self, addr: Address) -> bool {
        self.address.prefix_matches(addr, self.prefix)
    }

    /// Whether this route may carry traffic
    pub fn is_valid(&self) -> bool {
        !self.broken
    }

    /// Disarm all five aging timers
    pub fn cancel_timers<T: TimerService>(&mut self, timers: &mut T) {
        self.age_min.cancel(timers);
        self.age_max.cancel(timers);
        self.new.cancel(timers);
        self.used.cancel(timers);
        self.delete.cancel(timers);
    }
}

impl fmt::Display for RoutingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} (seq {}) is {} hops via {} on {}",
            self.address, self.prefix, self.seq_num, self.distance, self.next_hop, self.next_hop_interface
        )?;
        if self.broken {
            write!(f, " (broken)")?;
        }
        Ok(())
    }
}

/// Routing table for storing known routes
#[derive(Debug, Default)]
pub struct RoutingTable {
    /// Entries in creation order
    entries: Vec<RoutingEntry>,
}

impl RoutingTable {
    /// Create an empty routing table
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, returning its position
    ///
    /// No duplicate check is done; look the destination up first.
    pub fn add(&mut self, entry: RoutingEntry) -> usize {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    /// Remove the entry for exactly `address/prefix`
    pub fn remove(&mut self, address: Address, prefix: u8) -> Result<RoutingEntry> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.address == address && e.prefix == prefix)
            .ok_or(DymoError::UnknownEntry { address, prefix })?;
        Ok(self.entries.remove(idx))
    }

    /// Remove the entry at `index`
    pub(crate) fn take(&mut self, index: usize) -> RoutingEntry {
        self.entries.remove(index)
    }

    pub fn get(&self, index: usize) -> Option<&RoutingEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut RoutingEntry> {
        self.entries.get_mut(index)
    }

    /// First entry whose address is exactly `addr`, regardless of prefix
    pub fn get_by_address(&self, addr: Address) -> Option<&RoutingEntry> {
        self.entries.iter().find(|e| e.address == addr)
    }

    /// Longest-prefix match for `addr`
    pub fn get_for_address(&self, addr: Address) -> Option<&RoutingEntry> {
        self.position_for_address(addr).map(|i| &self.entries[i])
    }

    /// Mutable variant of [`get_for_address`](Self::get_for_address)
    pub fn get_for_address_mut(&mut self, addr: Address) -> Option<&mut RoutingEntry> {
        self.position_for_address(addr).map(move |i| &mut self.entries[i])
    }

    /// Position of the longest-prefix match for `addr`
    pub fn position_for_address(&self, addr: Address) -> Option<usize> {
        let mut best: Option<(usize, u8)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if !entry.covers(addr) {
                continue;
            }
            // Strict comparison keeps the earliest entry on ties
            if best.map_or(true, |(_, prefix)| entry.prefix > prefix) {
                best = Some((i, entry.prefix));
            }
        }
        best.map(|(i, _)| i)
    }

    /// All entries in creation order
    pub fn iter(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.iter()
    }

    /// All entries in creation order, mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RoutingEntry> {
        self.entries.iter_mut()
    }

    /// Remove and return every entry
    pub fn drain(&mut self) -> Vec<RoutingEntry> {
        std::mem::take(&mut self.entries)
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of routes marked broken
    pub fn broken_count(&self) -> usize {
        self.entries.iter().filter(|e| e.broken).count()
    }
}

impl fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} entries ({} broken)", self.len(), self.broken_count())?;
        for entry in &self.entries {
            write!(f, "\n  {}", entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: Address, prefix: u8, next_hop: Address) -> RoutingEntry {
        let mut e = RoutingEntry::new(address);
        e.prefix = prefix;
        e.next_hop = next_hop;
        e
    }

    #[test]
    fn test_longest_prefix_match() {
        let mut table = RoutingTable::new();
        table.add(entry(Address::new(10, 0, 0, 0), 8, Address::new(1, 1, 1, 1)));
        table.add(entry(Address::new(10, 0, 0, 0), 24, Address::new(2, 2, 2, 2)));

        let found = table.get_for_address(Address::new(10, 0, 0, 5)).unwrap();
        assert_eq!(found.prefix, 24);
        assert_eq!(found.next_hop, Address::new(2, 2, 2, 2));

        let found = table.get_for_address(Address::new(10, 9, 0, 5)).unwrap();
        assert_eq!(found.prefix, 8);

        assert!(table.get_for_address(Address::new(192, 168, 0, 1)).is_none());
    }

    #[test]
    fn test_first_created_wins_tie() {
        let mut table = RoutingTable::new();
        table.add(entry(Address::new(10, 0, 0, 0), 16, Address::new(1, 1, 1, 1)));
        table.add(entry(Address::new(10, 0, 7, 0), 16, Address::new(2, 2, 2, 2)));

        let found = table.get_for_address(Address::new(10, 0, 3, 3)).unwrap();
        assert_eq!(found.next_hop, Address::new(1, 1, 1, 1));
    }

    #[test]
    fn test_remove() {
        let mut table = RoutingTable::new();
        let dest = Address::new(10, 0, 0, 4);
        table.add(entry(dest, 32, Address::new(10, 0, 0, 2)));
        assert_eq!(table.len(), 1);

        let removed = table.remove(dest, 32).unwrap();
        assert_eq!(removed.address, dest);
        assert!(table.is_empty());

        match table.remove(dest, 32) {
            Err(DymoError::UnknownEntry { address, prefix }) => {
                assert_eq!(address, dest);
                assert_eq!(prefix, 32);
            }
            other => panic!("expected UnknownEntry, got {:?}", other.map(|e| e.address)),
        }
    }

    #[test]
    fn test_get_by_address_ignores_prefix() {
        let mut table = RoutingTable::new();
        let net = Address::new(10, 1, 0, 0);
        table.add(entry(net, 16, Address::new(10, 0, 0, 2)));

        assert!(table.get_by_address(net).is_some());
        assert!(table.get_by_address(Address::new(10, 1, 0, 1)).is_none());
        table.get_mut(0).unwrap().broken = true;
        assert_eq!(table.broken_count(), 1);
    }

    #[test]
    fn test_display() {
        let mut table = RoutingTable::new();
        table.add(entry(Address::new(10, 0, 0, 3), 32, Address::new(10, 0, 0, 2)));
        let mut broken = entry(Address::new(10, 0, 0, 9), 32, Address::new(10, 0, 0, 2));
        broken.broken = true;
        table.add(broken);

        let text = table.to_string();
        assert!(text.starts_with("2 entries (1 broken)"));
        assert!(text.contains("10.0.0.3/32"));
        assert!(text.contains("(broken)"));
    }
}
