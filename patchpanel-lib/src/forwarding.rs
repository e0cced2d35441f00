//! Seams to the traffic forwarding helper daemons.
//!
//! The ND proxy, multicast and broadcast relays run as separate
//! minijailed helper processes driven over a control channel; only the
//! operations the core invokes on them are modelled here.

use crate::datapath::Datapath;
use crate::shill::ShillDevice;

/// Which forwarding features to start or stop for an upstream ⇄
/// downstream pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardingSet {
    pub ipv6: bool,
    pub multicast: bool,
    pub broadcast: bool,
}

impl ForwardingSet {
    pub fn all() -> ForwardingSet {
        ForwardingSet {
            ipv6: true,
            multicast: true,
            broadcast: true,
        }
    }

    pub fn ipv6_only() -> ForwardingSet {
        ForwardingSet {
            ipv6: true,
            ..ForwardingSet::default()
        }
    }
}

/// Forwarding orchestration offered to the guest services. Implemented
/// by Manager, which fans out to the IPv6 service and the helper
/// controls.
pub trait ForwardingService {
    fn start_forwarding(
        &mut self,
        datapath: &Datapath,
        shill_device: &ShillDevice,
        int_ifname: &str,
        set: ForwardingSet,
    );
    fn stop_forwarding(
        &mut self,
        datapath: &Datapath,
        shill_device: &ShillDevice,
        int_ifname: &str,
        set: ForwardingSet,
    );
}

/// Control surface of the ND proxy helper: relays RS/RA/NS/NA between an
/// uplink and each downlink of its forwarding group.
pub trait NdProxyControl {
    fn start_nd_proxy(&self, uplink_ifname: &str, downlink_ifname: &str);
    fn stop_nd_proxy(&self, uplink_ifname: &str, downlink_ifname: &str);
}

/// Control surface of the multicast / broadcast relay helper.
pub trait MulticastControl {
    fn start_multicast_forwarding(&self, lan_ifname: &str, int_ifname: &str);
    fn stop_multicast_forwarding(&self, lan_ifname: &str, int_ifname: &str);
    fn start_broadcast_forwarding(&self, lan_ifname: &str, int_ifname: &str);
    fn stop_broadcast_forwarding(&self, lan_ifname: &str, int_ifname: &str);
}
