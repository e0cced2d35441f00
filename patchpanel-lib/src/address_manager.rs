//! Address provisioning for guest networks.
//!
//! The 100.115.92.0/24 subnet is reserved and not publicly routable. It
//! is sliced into the following IP pools for use among the various
//! guests:
//!
//! ```text
//! +---------------+------------+----------------------------------------------+
//! |   IP Range    |    Guest   |                                              |
//! +---------------+------------+----------------------------------------------+
//! | 0-3     (/30) | ARC        | Used for ARC management interface arc0       |
//! | 4-23    (/30) | ARC        | Used to expose multiple host networks to ARC |
//! | 24-63   (/30) | Termina VM | Used by Crostini, Bruschetta and Borealis    |
//! | 64-127  (/28) | Containers | 2nd range used by Crostini LXD containers    |
//! | 128-191 (/30) | Host netns | Used for netns hosting minijailed services   |
//! | 192-255 (/28) | Containers | 1st range used by Crostini LXD containers    |
//! +---------------+------------+----------------------------------------------+
//! ```
//!
//! The 100.115.93.0/24 subnet is reserved for Parallels VMs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::Ipv6Addr;

use cidr::{Ipv6Cidr, Ipv6Inet};
use rand::Rng;

use crate::mac::{MacAddress, MacAddressGenerator};
use crate::subnet::{ANY_SUBNET_INDEX, Subnet, SubnetPool};

/// Prefix length of allocated subnets for static ULA IPv6 addresses.
const STATIC_IPV6_PREFIX_LENGTH: u8 = 64;

/// RFC4193: fd00::/8 is defined for locally assigned unique local
/// addresses (ULA).
fn ula_net_block() -> Ipv6Cidr {
    "fd00::/8".parse().expect("valid ULA block")
}

/// ULA subnet statically assigned to dns-proxy; reserved at construction
/// so it can never be handed out to a guest.
fn dns_proxy_subnet() -> Ipv6Cidr {
    "fd64:ffff:ffff:ffff::/64".parse().expect("valid subnet")
}

/// The different types of downstream guests that require assignment of
/// IPv4 subnets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuestType {
    /// ARC++ or ARCVM management interface.
    Arc0,
    /// ARC++ or ARCVM virtual networks connected to shill Devices.
    ArcNet,
    /// Crostini VM root namespace.
    TerminaVm,
    /// Parallels VMs.
    ParallelsVm,
    /// Crostini VM user containers.
    LxdContainer,
    /// Other network namespaces hosting minijailed host processes.
    Netns,
}

impl fmt::Display for GuestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuestType::Arc0 => "ARC0",
            GuestType::ArcNet => "ARC_NET",
            GuestType::TerminaVm => "TERMINA_VM",
            GuestType::ParallelsVm => "PARALLELS_VM",
            GuestType::LxdContainer => "LXD_CONTAINER",
            GuestType::Netns => "MINIJAIL_NETNS",
        };
        write!(f, "{name}")
    }
}

/// Responsible for address provisioning for guest networks.
pub struct AddressManager {
    mac_addrs: MacAddressGenerator,
    pools: HashMap<GuestType, SubnetPool>,
    parallels_pool: SubnetPool,
    lxd_fallback_pool: SubnetPool,
    allocated_ipv6_subnets: HashSet<Ipv6Cidr>,
}

impl Default for AddressManager {
    fn default() -> AddressManager {
        AddressManager::new()
    }
}

impl AddressManager {
    pub fn new() -> AddressManager {
        let pool = |cidr: &str, n| {
            SubnetPool::new(cidr.parse().expect("valid pool base"), n).expect("valid pool size")
        };
        let mut pools = HashMap::new();
        pools.insert(GuestType::Arc0, pool("100.115.92.0/30", 1));
        pools.insert(GuestType::ArcNet, pool("100.115.92.4/30", 5));
        pools.insert(GuestType::TerminaVm, pool("100.115.92.24/30", 10));
        pools.insert(GuestType::Netns, pool("100.115.92.128/30", 16));
        pools.insert(GuestType::LxdContainer, pool("100.115.92.192/28", 4));
        let mut allocated_ipv6_subnets = HashSet::new();
        allocated_ipv6_subnets.insert(dns_proxy_subnet());
        AddressManager {
            mac_addrs: MacAddressGenerator::new(),
            pools,
            parallels_pool: pool("100.115.93.0/29", 32),
            lxd_fallback_pool: pool("100.115.92.64/28", 4),
            allocated_ipv6_subnets,
        }
    }

    /// Generates a MAC address guaranteed to be unique for the lifetime
    /// of this object. A non-zero `index` instead returns an address that
    /// is stable across all invocations.
    pub fn generate_mac_address(&mut self, index: u32) -> MacAddress {
        if index == ANY_SUBNET_INDEX {
            self.mac_addrs.generate()
        } else {
            self.mac_addrs.get_stable(index)
        }
    }

    /// Allocates a subnet from the guest's pool if available.
    ///
    /// `index` requests a particular 1-based slot and is only supported
    /// for Parallels; 0 indicates no preference. A Crostini LXD container
    /// allocation falls back to the secondary container range when the
    /// primary pool is exhausted.
    pub fn allocate_ipv4_subnet(&self, guest: GuestType, index: u32) -> Option<Subnet> {
        if guest == GuestType::ParallelsVm {
            return self.parallels_pool.allocate(index);
        }
        if index > 0 {
            tracing::error!(%guest, index, "subnet indexing is not supported for guest");
            return None;
        }
        let subnet = self.pools.get(&guest)?.allocate(ANY_SUBNET_INDEX);
        if subnet.is_none() && guest == GuestType::LxdContainer {
            tracing::info!("allocating LXD container subnet from fallback subnet pool");
            return self.lxd_fallback_pool.allocate(ANY_SUBNET_INDEX);
        }
        subnet
    }

    /// Allocates an IPv6 ULA subnet with a fixed prefix length of 64. The
    /// caller is responsible for releasing the subnet through
    /// [`AddressManager::release_ipv6_subnet`]; allocation and release
    /// happen on different code paths, so there is no RAII handle.
    pub fn allocate_ipv6_subnet(&mut self) -> Ipv6Cidr {
        loop {
            let subnet = generate_ipv6_subnet(ula_net_block(), STATIC_IPV6_PREFIX_LENGTH)
                .expect("/64 inside fd00::/8 is always derivable");
            if self.allocated_ipv6_subnets.insert(subnet) {
                return subnet;
            }
        }
    }

    /// Releases a subnet previously obtained from
    /// [`AddressManager::allocate_ipv6_subnet`].
    pub fn release_ipv6_subnet(&mut self, subnet: &Ipv6Cidr) {
        if !self.allocated_ipv6_subnets.remove(subnet) {
            tracing::error!(%subnet, "releasing unallocated subnet");
        }
    }

    /// Picks a random address inside `subnet`, never the subnet's base
    /// address. `None` when the subnet has no room for a second address.
    pub fn get_randomized_ipv6_address(subnet: &Ipv6Cidr) -> Option<Ipv6Inet> {
        if subnet.network_length() >= 128 {
            tracing::error!(
                %subnet,
                "subnet must hold at least one address besides the base address"
            );
            return None;
        }
        let base = u128::from(subnet.first_address());
        let host_mask = host_mask(subnet.network_length());
        let mut rng = rand::rng();
        loop {
            let addr = base | (rng.random::<u128>() & host_mask);
            if addr != base {
                return Ipv6Inet::new(Ipv6Addr::from(addr), subnet.network_length()).ok();
            }
        }
    }
}

fn host_mask(prefix_length: u8) -> u128 {
    if prefix_length == 0 {
        u128::MAX
    } else {
        u128::MAX >> prefix_length
    }
}

/// Generates a random subnet of `prefix_length` inside `net_block`,
/// never equal to the block's own base address.
pub fn generate_ipv6_subnet(net_block: Ipv6Cidr, prefix_length: u8) -> Option<Ipv6Cidr> {
    if prefix_length <= net_block.network_length() || prefix_length > 128 {
        tracing::error!(
            prefix_length,
            %net_block,
            "prefix length must be longer than the network block's"
        );
        return None;
    }
    let base = u128::from(net_block.first_address());
    let block_host_mask = host_mask(net_block.network_length());
    let subnet_host_mask = host_mask(prefix_length);
    let mut rng = rand::rng();
    loop {
        let addr = base | (rng.random::<u128>() & block_host_mask);
        if addr == base {
            continue;
        }
        let prefix = addr & !subnet_host_mask;
        return Ipv6Cidr::new(Ipv6Addr::from(prefix), prefix_length).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cidr::Ipv4Inet;

    fn inet(s: &str) -> Ipv4Inet {
        s.parse().unwrap()
    }

    #[test]
    fn pool_bases_match_address_plan() {
        let mgr = AddressManager::new();
        let cases = [
            (GuestType::Arc0, "100.115.92.0/30"),
            (GuestType::ArcNet, "100.115.92.4/30"),
            (GuestType::TerminaVm, "100.115.92.24/30"),
            (GuestType::Netns, "100.115.92.128/30"),
            (GuestType::LxdContainer, "100.115.92.192/28"),
            (GuestType::ParallelsVm, "100.115.93.0/29"),
        ];
        for (guest, base) in cases {
            let subnet = mgr.allocate_ipv4_subnet(guest, 0).unwrap();
            assert_eq!(subnet.base_cidr(), inet(base), "{guest}");
        }
    }

    #[test]
    fn indexing_only_supported_for_parallels() {
        let mgr = AddressManager::new();
        assert!(mgr.allocate_ipv4_subnet(GuestType::ParallelsVm, 2).is_some());
        assert!(mgr.allocate_ipv4_subnet(GuestType::TerminaVm, 2).is_none());
        assert!(mgr.allocate_ipv4_subnet(GuestType::Netns, 1).is_none());
    }

    #[test]
    fn parallels_indexed_subnets_have_stride_8() {
        let mgr = AddressManager::new();
        let s1 = mgr.allocate_ipv4_subnet(GuestType::ParallelsVm, 1).unwrap();
        let s5 = mgr.allocate_ipv4_subnet(GuestType::ParallelsVm, 5).unwrap();
        assert_eq!(s1.base_cidr(), inet("100.115.93.0/29"));
        assert_eq!(s5.base_cidr(), inet("100.115.93.32/29"));
    }

    #[test]
    fn lxd_fallback_pool_takes_over_when_exhausted() {
        let mgr = AddressManager::new();
        let mut primary = Vec::new();
        for i in 0..4 {
            let subnet = mgr.allocate_ipv4_subnet(GuestType::LxdContainer, 0).unwrap();
            assert_eq!(
                u32::from(subnet.base_cidr().address()),
                u32::from(inet("100.115.92.192/28").address()) + i * 16
            );
            primary.push(subnet);
        }
        // Termina allocations do not interfere with the container pools.
        let mut termina = Vec::new();
        for _ in 0..4 {
            termina.push(mgr.allocate_ipv4_subnet(GuestType::TerminaVm, 0).unwrap());
        }
        // The 5th container allocation comes from the fallback range.
        let mut fallback = Vec::new();
        for i in 0..4 {
            let subnet = mgr.allocate_ipv4_subnet(GuestType::LxdContainer, 0).unwrap();
            assert_eq!(
                u32::from(subnet.base_cidr().address()),
                u32::from(inet("100.115.92.64/28").address()) + i * 16
            );
            fallback.push(subnet);
        }
        // Both ranges exhausted: the 9th allocation fails.
        assert!(mgr.allocate_ipv4_subnet(GuestType::LxdContainer, 0).is_none());
    }

    #[test]
    fn ipv6_subnets_are_distinct_ulas() {
        let mut mgr = AddressManager::new();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let subnet = mgr.allocate_ipv6_subnet();
            assert_eq!(subnet.network_length(), 64);
            assert!(ula_net_block().contains(&subnet.first_address()), "{subnet}");
            assert!(seen.insert(subnet), "duplicate {subnet}");
        }
        for subnet in &seen {
            mgr.release_ipv6_subnet(subnet);
        }
    }

    #[test]
    fn randomized_address_stays_in_subnet() {
        let subnet: Ipv6Cidr = "fd12:3456:78::/64".parse().unwrap();
        for _ in 0..20 {
            let addr = AddressManager::get_randomized_ipv6_address(&subnet).unwrap();
            assert!(subnet.contains(&addr.address()));
            assert_ne!(addr.address(), subnet.first_address());
            assert_eq!(addr.network_length(), 64);
        }
    }

    #[test]
    fn randomized_address_rejects_full_length_prefix() {
        let subnet: Ipv6Cidr = "fd12::1/128".parse().unwrap();
        assert!(AddressManager::get_randomized_ipv6_address(&subnet).is_none());
    }

    #[test]
    fn generated_subnet_never_equals_block_base() {
        let block: Ipv6Cidr = "fd00::/8".parse().unwrap();
        for _ in 0..50 {
            let subnet = generate_ipv6_subnet(block, 64).unwrap();
            assert_ne!(subnet.first_address(), block.first_address());
        }
        // Invalid combination: prefix not longer than the block's.
        assert!(generate_ipv6_subnet(block, 8).is_none());
    }
}
