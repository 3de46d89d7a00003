//! Node addresses and prefix matching
//!
//! DYMO routes IPv4-style 32-bit addresses. A route may cover a whole
//! prefix (`address/prefix`) when a router advertises responsibility for
//! a subnet; plain host routes use the full 32-bit prefix.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Number of bits in an address (and the host-route prefix length)
pub const ADDRESS_BITS: u8 = 32;

/// 32-bit node address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Address(u32);

impl Address {
    /// Limited broadcast (all ones)
    pub const BROADCAST: Address = Address(0xFFFF_FFFF);

    /// Unspecified address (all zeros)
    pub const UNSPECIFIED: Address = Address(0);

    /// Create an address from dotted-quad octets
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Address(u32::from_be_bytes([a, b, c, d]))
    }

    /// Create an address from a u32
    pub const fn from_u32(value: u32) -> Self {
        Address(value)
    }

    /// Convert to u32
    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Get the raw bytes (network order)
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    /// Create from raw bytes (network order)
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Address(u32::from_be_bytes(bytes))
    }

    /// Check if this is the limited broadcast address
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// Check if this is a class D (224.0.0.0/4) multicast address
    pub fn is_multicast(self) -> bool {
        (self.0 >> 28) == 0xE
    }

    /// True when `self` and `other` agree on their first `prefix` bits
    pub fn prefix_matches(self, other: Address, prefix: u8) -> bool {
        let mask = prefix_mask(prefix);
        (self.0 & mask) == (other.0 & mask)
    }
}

/// Netmask for a prefix length; lengths above 32 are clamped
pub fn prefix_mask(prefix: u8) -> u32 {
    match prefix.min(ADDRESS_BITS) {
        0 => 0,
        p => u32::MAX << (ADDRESS_BITS - p),
    }
}

impl From<Ipv4Addr> for Address {
    fn from(addr: Ipv4Addr) -> Self {
        Address(u32::from(addr))
    }
}

impl From<Address> for Ipv4Addr {
    fn from(addr: Address) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>().map(Address::from)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.to_bytes();
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

/// Index of a participating interface in the configured interface list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InterfaceId(pub u8);

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_parse() {
        let addr = Address::new(10, 0, 0, 5);
        assert_eq!(addr.to_string(), "10.0.0.5");
        assert_eq!("10.0.0.5".parse::<Address>().unwrap(), addr);
        assert!("10.0.0".parse::<Address>().is_err());
    }

    #[test]
    fn test_prefix_matches() {
        let net = Address::new(10, 0, 0, 0);
        assert!(Address::new(10, 0, 0, 5).prefix_matches(net, 24));
        assert!(Address::new(10, 200, 1, 1).prefix_matches(net, 8));
        assert!(!Address::new(10, 0, 1, 5).prefix_matches(net, 24));
        assert!(!Address::new(10, 0, 0, 5).prefix_matches(net, 32));
        // Prefix 0 matches everything
        assert!(Address::new(192, 168, 1, 1).prefix_matches(net, 0));
    }

    #[test]
    fn test_special_addresses() {
        assert!(Address::BROADCAST.is_broadcast());
        assert!(Address::new(224, 0, 0, 109).is_multicast());
        assert!(Address::new(239, 255, 255, 255).is_multicast());
        assert!(!Address::new(10, 0, 0, 1).is_multicast());
        assert_eq!(prefix_mask(24), 0xFFFF_FF00);
        assert_eq!(prefix_mask(40), u32::MAX);
    }
}
