//! IPv6 connectivity for downstream guests through ND proxying.
//!
//! Each IPv6-capable uplink owns a forwarding group: the set of
//! downstream interfaces to which Neighbor Discovery messages are
//! relayed by the nd-proxy helper. This service keeps the groups in
//! sync with uplink changes, installs the host routes that make
//! downstream addresses reachable, and registers dns-proxy peer
//! addresses so they are routable from the guests.

use std::collections::{HashMap, HashSet};
use std::net::Ipv6Addr;
use std::rc::Rc;

use cidr::Ipv6Cidr;

use crate::address_manager::generate_ipv6_subnet;
use crate::datapath::Datapath;
use crate::forwarding::NdProxyControl;
use crate::shill::ShillDevice;

#[derive(Default)]
struct ForwardingGroup {
    downstreams: HashSet<String>,
    uplink_prefix: Option<Ipv6Cidr>,
    /// ULA /64 picked for the downstream side when the uplink offers no
    /// delegated prefix. Released when the group dissolves.
    downstream_ula: Option<Ipv6Cidr>,
}

/// Downstream neighbor registration of a dns-proxy address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NeighborEntry {
    ifname: String,
    addr: Ipv6Addr,
}

pub struct GuestIPv6Service {
    nd_proxy: Rc<dyn NdProxyControl>,
    forwarding_groups: HashMap<String, ForwardingGroup>,
    /// ULA /64s handed out as downstream prefixes, to keep them pairwise
    /// distinct across groups.
    allocated_ulas: HashSet<Ipv6Cidr>,
    neighbors: HashSet<NeighborEntry>,
}

impl GuestIPv6Service {
    pub fn new(nd_proxy: Rc<dyn NdProxyControl>) -> GuestIPv6Service {
        GuestIPv6Service {
            nd_proxy,
            forwarding_groups: HashMap::new(),
            allocated_ulas: HashSet::new(),
            neighbors: HashSet::new(),
        }
    }

    fn allocate_ula(&mut self) -> Ipv6Cidr {
        let block: Ipv6Cidr = "fd00::/8".parse().expect("valid ULA block");
        loop {
            let subnet = generate_ipv6_subnet(block, 64).expect("/64 inside fd00::/8");
            if self.allocated_ulas.insert(subnet) {
                return subnet;
            }
        }
    }

    /// Adds `downstream_ifname` to the forwarding group of `uplink` and
    /// programs the ND proxy pair.
    pub fn start_forwarding(
        &mut self,
        datapath: &Datapath,
        uplink: &ShillDevice,
        downstream_ifname: &str,
    ) {
        let needs_ula = {
            let group = self
                .forwarding_groups
                .entry(uplink.ifname.clone())
                .or_default();
            if !group.downstreams.insert(downstream_ifname.to_string()) {
                return;
            }
            group.uplink_prefix = uplink.ipv6_prefix;
            group.uplink_prefix.is_none() && group.downstream_ula.is_none()
        };
        // Without a delegated or SLAAC prefix on the uplink, downstream
        // addressing falls back to a ULA /64 of our own.
        if needs_ula {
            let ula = self.allocate_ula();
            if let Some(group) = self.forwarding_groups.get_mut(&uplink.ifname) {
                group.downstream_ula = Some(ula);
            }
        }
        self.nd_proxy.start_nd_proxy(&uplink.ifname, downstream_ifname);
        let group = &self.forwarding_groups[&uplink.ifname];
        if let Some(prefix) = group.uplink_prefix.or(group.downstream_ula) {
            if let Err(error) = datapath.add_ipv6_host_route(downstream_ifname, &prefix, None) {
                tracing::error!(%error, downstream_ifname, "failed to install downstream IPv6 route");
            }
        }
        // When the downstream runs on our own ULA, the downstream
        // interface also carries the gateway address of that prefix so
        // RAs have a routable source.
        if let Some(ula) = group.downstream_ula {
            let addr = ula_gateway_address(&ula);
            if let Err(error) = datapath.add_ipv6_address(downstream_ifname, &addr) {
                tracing::error!(%error, downstream_ifname, "failed to assign downstream ULA address");
            }
        }
    }

    pub fn stop_forwarding(
        &mut self,
        datapath: &Datapath,
        uplink: &ShillDevice,
        downstream_ifname: &str,
    ) {
        let Some(group) = self.forwarding_groups.get_mut(&uplink.ifname) else {
            return;
        };
        if !group.downstreams.remove(downstream_ifname) {
            return;
        }
        self.nd_proxy.stop_nd_proxy(&uplink.ifname, downstream_ifname);
        if let Some(prefix) = group.uplink_prefix.or(group.downstream_ula) {
            datapath.remove_ipv6_host_route(&prefix);
        }
        if let Some(ula) = group.downstream_ula {
            datapath.remove_ipv6_address(downstream_ifname, &ula_gateway_address(&ula));
        }
        if group.downstreams.is_empty() {
            let ula = group.downstream_ula.take();
            self.forwarding_groups.remove(&uplink.ifname);
            if let Some(ula) = ula {
                self.allocated_ulas.remove(&ula);
            }
        }
    }

    /// Dissolves the whole forwarding group of a disappearing uplink.
    pub fn stop_uplink(&mut self, datapath: &Datapath, uplink: &ShillDevice) {
        let Some(group) = self.forwarding_groups.remove(&uplink.ifname) else {
            return;
        };
        for downstream in &group.downstreams {
            self.nd_proxy.stop_nd_proxy(&uplink.ifname, downstream);
            if let Some(ula) = group.downstream_ula {
                datapath.remove_ipv6_address(downstream, &ula_gateway_address(&ula));
            }
        }
        if let Some(prefix) = group.uplink_prefix.or(group.downstream_ula) {
            datapath.remove_ipv6_host_route(&prefix);
        }
        if let Some(ula) = group.downstream_ula {
            self.allocated_ulas.remove(&ula);
        }
    }

    /// Applies an uplink prefix change to its forwarding group: routes
    /// for the old prefix are withdrawn and re-installed for the new one
    /// on every downstream of the group.
    pub fn on_uplink_ipv6_changed(&mut self, datapath: &Datapath, uplink: &ShillDevice) {
        let Some(group) = self.forwarding_groups.get_mut(&uplink.ifname) else {
            return;
        };
        if group.uplink_prefix == uplink.ipv6_prefix {
            return;
        }
        if let Some(old) = group.uplink_prefix {
            datapath.remove_ipv6_host_route(&old);
        }
        group.uplink_prefix = uplink.ipv6_prefix;
        if let Some(new) = group.uplink_prefix {
            for downstream in &group.downstreams {
                if let Err(error) = datapath.add_ipv6_host_route(downstream, &new, None) {
                    tracing::error!(%error, downstream, "failed to refresh downstream IPv6 route");
                }
            }
        }
    }

    /// Registers a dns-proxy peer address as a proxied neighbor so it is
    /// routable from the guests behind `ifname`.
    pub fn register_downstream_neighbor(
        &mut self,
        datapath: &Datapath,
        ifname: &str,
        addr: Ipv6Addr,
    ) {
        let entry = NeighborEntry {
            ifname: ifname.to_string(),
            addr,
        };
        if !self.neighbors.insert(entry) {
            return;
        }
        if let Err(error) = datapath.add_ipv6_neighbor_proxy(ifname, addr) {
            tracing::error!(%error, ifname, %addr, "failed to add IPv6 neighbor proxy");
        }
        let host_route = Ipv6Cidr::new(addr, 128).expect("/128 is always valid");
        if let Err(error) = datapath.add_ipv6_host_route(ifname, &host_route, None) {
            tracing::error!(%error, ifname, %addr, "failed to add IPv6 host route");
        }
    }

    pub fn unregister_downstream_neighbor(
        &mut self,
        datapath: &Datapath,
        ifname: &str,
        addr: Ipv6Addr,
    ) {
        let entry = NeighborEntry {
            ifname: ifname.to_string(),
            addr,
        };
        if !self.neighbors.remove(&entry) {
            return;
        }
        datapath.remove_ipv6_neighbor_proxy(ifname, addr);
        let host_route = Ipv6Cidr::new(addr, 128).expect("/128 is always valid");
        datapath.remove_ipv6_host_route(&host_route);
    }

    /// Forces the kernel inside `netns_name` to re-emit Router
    /// Solicitations by toggling IPv6 off and on.
    pub fn restart_ipv6(&self, datapath: &Datapath, netns_name: &str) {
        datapath.restart_ipv6_in_netns(netns_name);
    }
}

/// First host address of a downstream ULA, with its prefix length.
fn ula_gateway_address(ula: &Ipv6Cidr) -> String {
    let addr = Ipv6Addr::from(u128::from(ula.first_address()) + 1);
    format!("{addr}/{}", ula.network_length())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FakeProcessRunner, FakeSystem, RecordingNdProxy, fake_shill_device};
    use crate::process::ProcessRunner;
    use crate::shill::Technology;
    use crate::system::System;
    use std::path::PathBuf;

    fn datapath(runner: &Rc<FakeProcessRunner>) -> Datapath {
        Datapath::with_scripts(
            Rc::clone(runner) as Rc<dyn ProcessRunner>,
            Rc::new(FakeSystem::new()) as Rc<dyn System>,
            PathBuf::from("/tmp/iptables.start"),
            PathBuf::from("/tmp/ip6tables.start"),
        )
    }

    #[test]
    fn forwarding_group_tracks_nd_proxy_pairs() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let dp = datapath(&runner);
        let nd = Rc::new(RecordingNdProxy::default());
        let mut service = GuestIPv6Service::new(Rc::clone(&nd) as Rc<dyn NdProxyControl>);

        let mut wlan0 = fake_shill_device("wlan0", Technology::Wifi);
        wlan0.ipv6_prefix = Some("2001:db8:0:200::/64".parse().unwrap());

        service.start_forwarding(&dp, &wlan0, "arc_wlan0");
        service.start_forwarding(&dp, &wlan0, "vmtap0");
        assert_eq!(nd.active.borrow().len(), 2);

        service.stop_forwarding(&dp, &wlan0, "arc_wlan0");
        assert_eq!(
            *nd.active.borrow(),
            vec![("wlan0".to_string(), "vmtap0".to_string())]
        );

        service.stop_uplink(&dp, &wlan0);
        assert!(nd.active.borrow().is_empty());
    }

    #[test]
    fn uplink_without_prefix_gets_ula_fallback() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let dp = datapath(&runner);
        let nd = Rc::new(RecordingNdProxy::default());
        let mut service = GuestIPv6Service::new(Rc::clone(&nd) as Rc<dyn NdProxyControl>);

        let eth0 = fake_shill_device("eth0", Technology::Ethernet);
        service.start_forwarding(&dp, &eth0, "arc_eth0");
        // A ULA route and a gateway address were installed for the
        // downstream.
        assert!(
            runner
                .ip_calls()
                .iter()
                .any(|call| call.starts_with("ip -6 route replace fd") && call.ends_with("dev arc_eth0"))
        );
        assert!(
            runner
                .ip_calls()
                .iter()
                .any(|call| call.starts_with("ip -6 addr add fd") && call.ends_with("dev arc_eth0"))
        );
        service.stop_uplink(&dp, &eth0);
        assert!(
            runner
                .ip_calls()
                .iter()
                .any(|call| call.starts_with("ip -6 addr del fd"))
        );
        assert!(service.allocated_ulas.is_empty());
    }

    #[test]
    fn uplink_prefix_change_refreshes_routes() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let dp = datapath(&runner);
        let nd = Rc::new(RecordingNdProxy::default());
        let mut service = GuestIPv6Service::new(Rc::clone(&nd) as Rc<dyn NdProxyControl>);

        let mut wlan0 = fake_shill_device("wlan0", Technology::Wifi);
        wlan0.ipv6_prefix = Some("2001:db8:0:200::/64".parse().unwrap());
        service.start_forwarding(&dp, &wlan0, "arc_wlan0");

        wlan0.ipv6_prefix = Some("2001:db8:0:300::/64".parse().unwrap());
        service.on_uplink_ipv6_changed(&dp, &wlan0);
        let calls = runner.ip_calls();
        assert!(calls.contains(&"ip -6 route del 2001:db8:0:200::/64".to_string()));
        assert!(calls.contains(&"ip -6 route replace 2001:db8:0:300::/64 dev arc_wlan0".to_string()));
    }

    #[test]
    fn neighbor_registration_roundtrip() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let dp = datapath(&runner);
        let nd = Rc::new(RecordingNdProxy::default());
        let mut service = GuestIPv6Service::new(nd as Rc<dyn NdProxyControl>);

        let addr: Ipv6Addr = "fd12:3456:78::25".parse().unwrap();
        service.register_downstream_neighbor(&dp, "arc_ns0", addr);
        assert!(
            runner
                .ip_calls()
                .contains(&"ip -6 neighbor add proxy fd12:3456:78::25 dev arc_ns0".to_string())
        );
        // Registering twice does not duplicate the kernel state.
        let calls_before = runner.ip_calls().len();
        service.register_downstream_neighbor(&dp, "arc_ns0", addr);
        assert_eq!(runner.ip_calls().len(), calls_before);

        service.unregister_downstream_neighbor(&dp, "arc_ns0", addr);
        assert!(
            runner
                .ip_calls()
                .contains(&"ip -6 neighbor del proxy fd12:3456:78::25 dev arc_ns0".to_string())
        );
    }

    #[test]
    fn restart_ipv6_toggles_sysctl_inside_netns() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let dp = datapath(&runner);
        let nd = Rc::new(RecordingNdProxy::default());
        let service = GuestIPv6Service::new(nd as Rc<dyn NdProxyControl>);

        service.restart_ipv6(&dp, "connected_netns_0");
        assert_eq!(
            runner.netns_exec_calls(),
            vec![
                "ip netns exec connected_netns_0 sysctl -w net.ipv6.conf.all.disable_ipv6=1"
                    .to_string(),
                "ip netns exec connected_netns_0 sysctl -w net.ipv6.conf.all.disable_ipv6=0"
                    .to_string(),
            ]
        );
    }
}
