//! MAC address type and generation for guest interfaces.

use std::collections::HashSet;
use std::fmt;

use rand::RngCore;

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// True when the locally-administered bit is set and the multicast
    /// bit is clear.
    pub fn is_locally_administered_unicast(&self) -> bool {
        self.0[0] & 0x02 != 0 && self.0[0] & 0x01 == 0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

// Base address that per-index stable MACs are derived from. The index is
// folded into the last four octets, so distinct indices always produce
// distinct addresses.
const STABLE_BASE: [u8; 6] = [0x42, 0x37, 0x05, 0x13, 0x17, 0x0a];

/// Generates MAC addresses that are guaranteed unique for the lifetime
/// of this object.
#[derive(Debug, Default)]
pub struct MacAddressGenerator {
    generated: HashSet<MacAddress>,
}

impl MacAddressGenerator {
    pub fn new() -> MacAddressGenerator {
        MacAddressGenerator::default()
    }

    /// Returns a fresh random locally-administered unicast address, never
    /// equal to a previously returned one.
    pub fn generate(&mut self) -> MacAddress {
        let mut rng = rand::rng();
        loop {
            let mut octets = [0u8; 6];
            rng.fill_bytes(&mut octets);
            octets[0] = (octets[0] & 0xfc) | 0x02;
            let addr = MacAddress(octets);
            if self.generated.insert(addr) {
                return addr;
            }
        }
    }

    /// Returns the address derived from `index`; the same index always
    /// yields the same address.
    pub fn get_stable(&self, index: u32) -> MacAddress {
        let mut octets = STABLE_BASE;
        let id = index.to_be_bytes();
        for (octet, byte) in octets[2..].iter_mut().zip(id) {
            *octet ^= byte;
        }
        MacAddress(octets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_macs_are_unique_and_local() {
        let mut gen = MacAddressGenerator::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let addr = gen.generate();
            assert!(addr.is_locally_administered_unicast(), "{addr}");
            assert!(seen.insert(addr), "duplicate {addr}");
        }
    }

    #[test]
    fn stable_macs_are_stable_and_distinct() {
        let gen = MacAddressGenerator::new();
        for i in 1..64u32 {
            assert_eq!(gen.get_stable(i), gen.get_stable(i));
            for j in (i + 1)..64u32 {
                assert_ne!(gen.get_stable(i), gen.get_stable(j));
            }
        }
    }

    #[test]
    fn display_format() {
        let addr = MacAddress([0x42, 0x37, 0x05, 0x13, 0x17, 0x0a]);
        assert_eq!(addr.to_string(), "42:37:05:13:17:0a");
    }
}
