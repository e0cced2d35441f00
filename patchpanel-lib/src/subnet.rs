//! IPv4 subnet allocation out of fixed-capacity pools.

use std::cell::RefCell;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;

use cidr::Ipv4Inet;

/// Index value requesting "any available subnet" from a pool.
pub const ANY_SUBNET_INDEX: u32 = 0;
/// Maximum number of subnets a single pool can manage.
pub const MAX_SUBNETS: u32 = 32;

/// An allocated IPv4 subnet.
///
/// The subnet tracks host-offset usage: offset 0 (the network address)
/// and the last offset (the broadcast address) are permanently marked
/// used. Dropping the subnet runs its release closure, returning the
/// slot to the pool it was taken from.
pub struct Subnet {
    base: Ipv4Inet,
    addrs: Vec<bool>,
    release: Option<Box<dyn FnOnce()>>,
}

impl Subnet {
    /// `release` runs when the subnet is dropped and can be used to free
    /// other resources associated with it.
    pub fn new(base: Ipv4Inet, release: Box<dyn FnOnce()>) -> Subnet {
        let size = 1usize << (32 - base.network_length());
        let mut addrs = vec![false; size];
        addrs[0] = true;
        addrs[size - 1] = true;
        Subnet {
            base,
            addrs,
            release: Some(release),
        }
    }

    /// Returns the CIDR whose address is `offset` above the base address,
    /// with the subnet's prefix length. `None` for the network address,
    /// the broadcast address, and anything past the subnet.
    pub fn cidr_at_offset(&self, offset: u32) -> Option<Ipv4Inet> {
        if !self.is_valid_offset(offset) {
            return None;
        }
        let addr = Ipv4Addr::from(u32::from(self.base.address()) + offset);
        Ipv4Inet::new(addr, self.base.network_length()).ok()
    }

    /// Number of usable addresses (all addresses minus network and
    /// broadcast).
    pub fn available_count(&self) -> u32 {
        self.addrs.len() as u32 - 2
    }

    pub fn base_cidr(&self) -> Ipv4Inet {
        self.base
    }

    fn is_valid_offset(&self, offset: u32) -> bool {
        0 < offset && (offset as usize) < self.addrs.len() - 1
    }
}

impl fmt::Debug for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subnet").field("base", &self.base).finish()
    }
}

impl Drop for Subnet {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Manages up to [`MAX_SUBNETS`] fixed-size IPv4 subnets carved out of a
/// base CIDR.
///
/// Slot `i` (1-based) covers the address block starting at
/// `base + (i - 1) * 2^(32 - prefix)`. Index 0 never names a slot; it
/// requests the lowest free one.
pub struct SubnetPool {
    base: Ipv4Inet,
    num_subnets: u32,
    addrs_per_index: u32,
    // Bit i set means slot i is taken; bit 0 is never used.
    allocated: Rc<RefCell<u64>>,
}

impl SubnetPool {
    /// Returns `None` when `num_subnets` exceeds [`MAX_SUBNETS`].
    pub fn new(base: Ipv4Inet, num_subnets: u32) -> Option<SubnetPool> {
        if num_subnets > MAX_SUBNETS {
            return None;
        }
        Some(SubnetPool {
            base,
            num_subnets,
            addrs_per_index: 1u32 << (32 - base.network_length()),
            allocated: Rc::new(RefCell::new(0)),
        })
    }

    /// Allocates a subnet, or `None` when the pool is exhausted, the
    /// requested index is out of range, or the requested slot is taken.
    /// `index` is 1-based; [`ANY_SUBNET_INDEX`] picks the lowest free slot.
    pub fn allocate(&self, index: u32) -> Option<Subnet> {
        let slot = if index == ANY_SUBNET_INDEX {
            (1..=self.num_subnets).find(|i| *self.allocated.borrow() & (1u64 << i) == 0)?
        } else {
            if index > self.num_subnets || *self.allocated.borrow() & (1u64 << index) != 0 {
                return None;
            }
            index
        };

        *self.allocated.borrow_mut() |= 1u64 << slot;
        let offset = (slot - 1) * self.addrs_per_index;
        let addr = Ipv4Addr::from(u32::from(self.base.address()) + offset);
        let base = Ipv4Inet::new(addr, self.base.network_length()).ok()?;
        let allocated = Rc::clone(&self.allocated);
        Some(Subnet::new(
            base,
            Box::new(move || {
                *allocated.borrow_mut() &= !(1u64 << slot);
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inet(s: &str) -> Ipv4Inet {
        s.parse().unwrap()
    }

    #[test]
    fn offsets_exclude_network_and_broadcast() {
        let subnet = Subnet::new(inet("100.115.92.24/30"), Box::new(|| {}));
        assert_eq!(subnet.available_count(), 2);
        assert_eq!(subnet.cidr_at_offset(0), None);
        assert_eq!(subnet.cidr_at_offset(1), Some(inet("100.115.92.25/30")));
        assert_eq!(subnet.cidr_at_offset(2), Some(inet("100.115.92.26/30")));
        assert_eq!(subnet.cidr_at_offset(3), None);
        assert_eq!(subnet.cidr_at_offset(4), None);
    }

    #[test]
    fn offsets_cover_whole_28() {
        let subnet = Subnet::new(inet("100.115.92.192/28"), Box::new(|| {}));
        assert_eq!(subnet.available_count(), 14);
        for k in 1..=14 {
            let cidr = subnet.cidr_at_offset(k).unwrap();
            assert_eq!(u32::from(cidr.address()), u32::from(subnet.base_cidr().address()) + k);
            assert_eq!(cidr.network_length(), 28);
        }
        assert_eq!(subnet.cidr_at_offset(15), None);
    }

    #[test]
    fn pool_allocates_sequential_slots() {
        let pool = SubnetPool::new(inet("100.115.92.4/30"), 5).unwrap();
        let s1 = pool.allocate(ANY_SUBNET_INDEX).unwrap();
        let s2 = pool.allocate(ANY_SUBNET_INDEX).unwrap();
        assert_eq!(s1.base_cidr(), inet("100.115.92.4/30"));
        assert_eq!(s2.base_cidr(), inet("100.115.92.8/30"));
        drop(s1);
        // The freed slot is handed out again before untouched ones.
        let s1_again = pool.allocate(ANY_SUBNET_INDEX).unwrap();
        assert_eq!(s1_again.base_cidr(), inet("100.115.92.4/30"));
        drop(s2);
        drop(s1_again);
    }

    #[test]
    fn pool_exhausts() {
        let pool = SubnetPool::new(inet("100.115.92.4/30"), 2).unwrap();
        let _a = pool.allocate(ANY_SUBNET_INDEX).unwrap();
        let _b = pool.allocate(ANY_SUBNET_INDEX).unwrap();
        assert!(pool.allocate(ANY_SUBNET_INDEX).is_none());
    }

    #[test]
    fn pool_indexed_allocation() -> anyhow::Result<()> {
        let pool = SubnetPool::new(inet("100.115.93.0/29"), 32)
            .ok_or_else(|| anyhow::anyhow!("pool creation failed"))?;
        let s = pool.allocate(3).ok_or_else(|| anyhow::anyhow!("slot 3 unavailable"))?;
        assert_eq!(s.base_cidr(), inet("100.115.93.16/29"));
        // Same slot cannot be taken twice.
        assert!(pool.allocate(3).is_none());
        // Out-of-range index is rejected.
        assert!(pool.allocate(33).is_none());
        drop(s);
        assert!(pool.allocate(3).is_some());
        Ok(())
    }

    #[test]
    fn pool_rejects_oversized_capacity() {
        assert!(SubnetPool::new(inet("100.115.92.0/24"), 33).is_none());
    }

    #[test]
    fn release_returns_slot_on_drop() {
        let pool = SubnetPool::new(inet("100.115.92.0/30"), 1).unwrap();
        let s = pool.allocate(ANY_SUBNET_INDEX).unwrap();
        assert!(pool.allocate(ANY_SUBNET_INDEX).is_none());
        drop(s);
        assert!(pool.allocate(ANY_SUBNET_INDEX).is_some());
    }
}
