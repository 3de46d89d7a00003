//! Collaborator traits at the engine boundary
//!
//! The engine never transmits, delivers or records anything itself. It
//! hands every side effect to a [`Host`], which the embedding (simulator,
//! test, or real network stack) implements. This keeps the protocol logic
//! independent of any particular link layer or statistics sink.

use crate::address::{Address, InterfaceId};
use crate::message::{DataPacket, Message};
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

/// Where a transmission goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NextHop {
    /// Link-local multicast to every MANET router in range
    AllRouters,
    /// A single neighbour
    Unicast { address: Address, interface: InterfaceId },
}

impl NextHop {
    pub fn unicast(address: Address, interface: InterfaceId) -> Self {
        NextHop::Unicast { address, interface }
    }

    /// Neighbour address for unicasts, `None` for multicast
    pub fn address(&self) -> Option<Address> {
        match self {
            NextHop::AllRouters => None,
            NextHop::Unicast { address, .. } => Some(*address),
        }
    }
}

/// Link-layer context of a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    /// Neighbour that transmitted the message
    pub sender: Address,
    /// Interface the message arrived on
    pub interface: InterfaceId,
}

impl Arrival {
    pub fn new(sender: Address, interface: InterfaceId) -> Self {
        Self { sender, interface }
    }
}

/// Everything the engine needs from its environment besides time
pub trait Host: Debug {
    /// Send `message` to `next_hop` after `jitter`
    fn transmit(&mut self, message: Message, next_hop: NextHop, jitter: Duration);

    /// Hand a packet addressed to this node to the upper layer
    fn deliver_locally(&mut self, packet: DataPacket);

    /// Tell the upper layer that route discovery for `destination` failed
    fn destination_unreachable(&mut self, destination: Address);

    /// Record a named statistic sample
    fn record_statistic(&mut self, _name: &str, _value: f64) {}

    /// Map a symbolic destination name to an address
    fn resolve(&self, _name: &str) -> Option<Address> {
        None
    }
}

/// One transmission captured by [`Outbox`]
#[derive(Debug, Clone, PartialEq)]
pub struct Transmission {
    pub message: Message,
    pub next_hop: NextHop,
    pub jitter: Duration,
}

/// Recording host
///
/// Keeps every side effect the engine produces so callers can inspect
/// or replay them.
#[derive(Debug, Default)]
pub struct Outbox {
    pub transmissions: Vec<Transmission>,
    pub delivered: Vec<DataPacket>,
    pub unreachable: Vec<Address>,
    pub statistics: Vec<(String, f64)>,
    /// Names answered by [`Host::resolve`]
    pub names: HashMap<String, Address>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbolic name
    pub fn with_name(mut self, name: impl Into<String>, address: Address) -> Self {
        self.names.insert(name.into(), address);
        self
    }

    /// Take all recorded transmissions
    pub fn drain_transmissions(&mut self) -> Vec<Transmission> {
        std::mem::take(&mut self.transmissions)
    }

    /// Recorded transmissions of messages with this log name
    pub fn sent(&self, name: &str) -> Vec<&Transmission> {
        self.transmissions.iter().filter(|t| t.message.name() == name).collect()
    }

    /// All samples recorded under `name`
    pub fn samples(&self, name: &str) -> Vec<f64> {
        self.statistics
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| *v)
            .collect()
    }
}

impl Host for Outbox {
    fn transmit(&mut self, message: Message, next_hop: NextHop, jitter: Duration) {
        self.transmissions.push(Transmission {
            message,
            next_hop,
            jitter,
        });
    }

    fn deliver_locally(&mut self, packet: DataPacket) {
        self.delivered.push(packet);
    }

    fn destination_unreachable(&mut self, destination: Address) {
        self.unreachable.push(destination);
    }

    fn record_statistic(&mut self, name: &str, value: f64) {
        self.statistics.push((name.to_string(), value));
    }

    fn resolve(&self, name: &str) -> Option<Address> {
        self.names.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;

    #[test]
    fn test_outbox_records() {
        let dest = Address::new(10, 0, 0, 5);
        let mut outbox = Outbox::new().with_name("host[5]", dest);
        assert_eq!(outbox.resolve("host[5]"), Some(dest));
        assert_eq!(outbox.resolve("host[6]"), None);

        let pkt = DataPacket::new(Address::new(10, 0, 0, 1), dest, Timestamp::ZERO, vec![1, 2]);
        outbox.transmit(
            Message::Data(pkt.clone()),
            NextHop::unicast(dest, InterfaceId(0)),
            Duration::from_micros(10),
        );
        outbox.record_statistic("data delay", 0.5);
        outbox.deliver_locally(pkt);

        assert_eq!(outbox.sent("DATA").len(), 1);
        assert_eq!(outbox.samples("data delay"), vec![0.5]);
        assert_eq!(outbox.delivered.len(), 1);
        assert_eq!(outbox.drain_transmissions().len(), 1);
        assert!(outbox.transmissions.is_empty());
    }

    #[test]
    fn test_next_hop_address() {
        assert_eq!(NextHop::AllRouters.address(), None);
        let hop = NextHop::unicast(Address::new(10, 0, 0, 2), InterfaceId(1));
        assert_eq!(hop.address(), Some(Address::new(10, 0, 0, 2)));
    }
}
