//! Top-level orchestrator.
//!
//! Manager is the sole owner of every collaborator: the address manager,
//! the datapath, the guest services, the lifeline-fd service and the
//! forwarding orchestration. It consumes upstream Device events from the
//! external shill client, dispatches guest lifecycle requests, and owns
//! the tables binding externally requested state (connected namespaces,
//! DNS redirection rules) to client lifeline fds.
//!
//! All methods must run on the daemon's single-threaded executor inside
//! a `tokio::task::LocalSet`; lifeline closures and delayed work never
//! touch Manager directly but post a [`ManagerEvent`] back onto the
//! executor through the event channel.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use cidr::{Ipv4Inet, Ipv6Cidr};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::address_manager::{AddressManager, GuestType};
use crate::arc_service::{ArcService, ArcServiceError, ArcType};
use crate::crostini_service::{CrostiniService, CrostiniServiceError, VmType};
use crate::datapath::{
    ConnectedNamespace, Datapath, DatapathError, DnsRedirectionRule, DnsRedirectionType,
    DownstreamNetworkInfo, PortRuleRequest, StaticIpv6Config,
};
use crate::downstream_network::{DownstreamNetworkError, DownstreamNetworkService};
use crate::forwarding::{ForwardingService, ForwardingSet, MulticastControl, NdProxyControl};
use crate::fwmark::{self, Fwmark, TrafficSource};
use crate::guest_ipv6::GuestIPv6Service;
use crate::iptables::IpFamily;
use crate::lifeline::{CancelHandle, LifelineError, LifelineFdService};
use crate::process::{NEW_NETNS_PID, ProcessRunner};
use crate::shill::{NetworkApplier, ShillDevice, ShillDevicesChange, Technology};
use crate::subnet::ANY_SUBNET_INDEX;
use crate::system::System;

/// Delay between a default network change and the IPv6 restart of the
/// affected namespaces, so that the forwarding setup settles before the
/// namespace sends new Router Solicitations.
const IPV6_RESTART_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid request: {0}")]
    Configuration(String),
    #[error("address pool exhausted for {0}")]
    ResourceExhaustion(String),
    #[error(transparent)]
    Datapath(#[from] DatapathError),
    #[error(transparent)]
    Lifeline(#[from] LifelineError),
    #[error(transparent)]
    Arc(#[from] ArcServiceError),
    #[error(transparent)]
    Crostini(#[from] CrostiniServiceError),
    #[error(transparent)]
    Downstream(#[from] DownstreamNetworkError),
    #[error("system error: {0}")]
    System(#[from] crate::system::SystemError),
}

/// Messages posted back onto the executor by lifeline closures and
/// delayed tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    ConnectedNamespaceAutoclose(u32),
    DnsRedirectionAutoclose(RawFd),
    RestartIpv6(String),
}

pub struct ConnectNamespaceRequest {
    /// Pid of the client process, or [`NEW_NETNS_PID`] for a fresh
    /// namespace.
    pub pid: i32,
    /// Upstream shill Device to route through; empty follows the default
    /// network.
    pub outbound_physical_device: String,
    pub source: TrafficSource,
    pub route_on_vpn: bool,
    pub static_ipv6: bool,
}

pub struct ConnectNamespaceResponse {
    pub netns_name: String,
    pub peer_ifname: String,
    pub peer_ipv4_cidr: Ipv4Inet,
    pub host_ifname: String,
    pub host_ipv4_cidr: Ipv4Inet,
    pub ipv4_subnet: Ipv4Inet,
    pub static_ipv6: Option<StaticIpv6Config>,
}

pub struct DnsRedirectionRequest {
    pub rule_type: DnsRedirectionType,
    pub input_ifname: String,
    pub proxy_address: IpAddr,
    pub host_ifname: String,
    pub nameservers: Vec<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnRoutingPolicy {
    Default,
    RouteOnVpn,
    BypassVpn,
}

pub struct TagSocketRequest {
    /// Interface index of the network to pin the socket to; 0 leaves the
    /// routing tag unset.
    pub network_id: u32,
    pub vpn_policy: VpnRoutingPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureFlag {
    WifiQos,
    Clat,
}

pub struct ArcVmStartupResponse {
    pub arc0_ipv4_address: Ipv4Addr,
    pub tap_ifnames: Vec<String>,
}

pub struct TerminaVmStartupResponse {
    pub tap_ifname: String,
    pub vm_ipv4_subnet: Ipv4Inet,
    pub gateway_ipv4_address: Ipv4Addr,
    pub vm_ipv4_address: Ipv4Addr,
    pub container_ipv4_subnet: Option<Ipv4Inet>,
    pub container_ipv4_address: Option<Ipv4Addr>,
}

/// Summary of one guest virtual device, as exposed by GetDevices.
pub struct VirtualDeviceInfo {
    pub ifname: String,
    pub phys_ifname: String,
    pub guest_ifname: String,
    pub ipv4_addr: Ipv4Addr,
    pub host_ipv4_addr: Ipv4Addr,
    pub guest_type: String,
}

struct ConnectedNamespaceEntry {
    info: ConnectedNamespace,
    ipv6_subnet: Option<Ipv6Cidr>,
    _lifeline: CancelHandle,
}

struct DnsRedirectionEntry {
    rule: DnsRedirectionRule,
    _lifeline: CancelHandle,
}

/// Fans guest forwarding requests out to the IPv6 ND proxy service and
/// the multicast/broadcast relay helper.
pub struct ForwardingOrchestrator {
    pub guest_ipv6: GuestIPv6Service,
    multicast: Rc<dyn MulticastControl>,
}

impl ForwardingService for ForwardingOrchestrator {
    fn start_forwarding(
        &mut self,
        datapath: &Datapath,
        shill_device: &ShillDevice,
        int_ifname: &str,
        set: ForwardingSet,
    ) {
        if set.ipv6 {
            self.guest_ipv6.start_forwarding(datapath, shill_device, int_ifname);
        }
        if set.multicast {
            self.multicast
                .start_multicast_forwarding(&shill_device.ifname, int_ifname);
        }
        if set.broadcast {
            self.multicast
                .start_broadcast_forwarding(&shill_device.ifname, int_ifname);
        }
    }

    fn stop_forwarding(
        &mut self,
        datapath: &Datapath,
        shill_device: &ShillDevice,
        int_ifname: &str,
        set: ForwardingSet,
    ) {
        if set.ipv6 {
            self.guest_ipv6.stop_forwarding(datapath, shill_device, int_ifname);
        }
        if set.multicast {
            self.multicast
                .stop_multicast_forwarding(&shill_device.ifname, int_ifname);
        }
        if set.broadcast {
            self.multicast
                .stop_broadcast_forwarding(&shill_device.ifname, int_ifname);
        }
    }
}

pub struct Manager {
    datapath: Datapath,
    addr_mgr: AddressManager,
    arc_service: ArcService,
    crostini_service: CrostiniService,
    downstream_networks: DownstreamNetworkService,
    forwarding: ForwardingOrchestrator,
    lifeline_svc: LifelineFdService,
    system: Rc<dyn System>,
    network_applier: Rc<dyn NetworkApplier>,
    event_tx: UnboundedSender<ManagerEvent>,

    shill_devices: HashMap<String, ShillDevice>,
    default_logical_device: Option<ShillDevice>,
    default_physical_device: Option<ShillDevice>,
    connected_namespaces: HashMap<u32, ConnectedNamespaceEntry>,
    dns_redirection_rules: HashMap<RawFd, DnsRedirectionEntry>,
    /// dns-proxy addresses of ARC-bound upstreams, re-emitted to
    /// observers of the request surface.
    arc_dns_proxy_ipv4_addrs: HashMap<String, Ipv4Addr>,
    arc_dns_proxy_ipv6_addrs: HashMap<String, Ipv6Addr>,
    next_connected_namespace_id: u32,
    arc_id: Option<u32>,
    crostini_vms: HashMap<u64, VmType>,
    feature_wifi_qos: bool,
    feature_clat: bool,
}

impl Manager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runner: Rc<dyn ProcessRunner>,
        system: Rc<dyn System>,
        nd_proxy: Rc<dyn NdProxyControl>,
        multicast: Rc<dyn MulticastControl>,
        network_applier: Rc<dyn NetworkApplier>,
        arc_type: ArcType,
        iptables_start_script: std::path::PathBuf,
        ip6tables_start_script: std::path::PathBuf,
        event_tx: UnboundedSender<ManagerEvent>,
    ) -> Manager {
        let datapath = Datapath::with_scripts(
            runner,
            Rc::clone(&system),
            iptables_start_script,
            ip6tables_start_script,
        );
        let mut addr_mgr = AddressManager::new();
        let arc_service = ArcService::new(arc_type, &mut addr_mgr);
        Manager {
            datapath,
            addr_mgr,
            arc_service,
            crostini_service: CrostiniService::new(),
            downstream_networks: DownstreamNetworkService::new(),
            forwarding: ForwardingOrchestrator {
                guest_ipv6: GuestIPv6Service::new(nd_proxy),
                multicast,
            },
            lifeline_svc: LifelineFdService::new(),
            system,
            network_applier,
            event_tx,
            shill_devices: HashMap::new(),
            default_logical_device: None,
            default_physical_device: None,
            connected_namespaces: HashMap::new(),
            dns_redirection_rules: HashMap::new(),
            arc_dns_proxy_ipv4_addrs: HashMap::new(),
            arc_dns_proxy_ipv6_addrs: HashMap::new(),
            next_connected_namespace_id: 0,
            arc_id: None,
            crostini_vms: HashMap::new(),
            feature_wifi_qos: false,
            feature_clat: false,
        }
    }

    pub fn datapath(&self) -> &Datapath {
        &self.datapath
    }

    /// Brings up the datapath skeleton. Call once before serving
    /// requests.
    pub fn start(&mut self) {
        self.datapath.start();
    }

    /// Ordered teardown of everything the daemon still owns.
    pub fn stop(&mut self) {
        let fds: Vec<RawFd> = self.dns_redirection_rules.keys().copied().collect();
        for fd in fds {
            self.on_dns_redirection_autoclose(fd);
        }
        let ids: Vec<u32> = self.connected_namespaces.keys().copied().collect();
        for id in ids {
            self.on_connected_namespace_autoclose(id);
        }
        self.downstream_networks.stop_all(&self.datapath);
        let vm_ids: Vec<u64> = self.crostini_vms.keys().copied().collect();
        for vm_id in vm_ids {
            self.crostini_vm_shutdown(vm_id);
        }
        if let Some(id) = self.arc_id.take() {
            self.arc_service.stop(&self.datapath, &mut self.forwarding, id);
        }
        self.datapath.stop();
    }

    pub fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::ConnectedNamespaceAutoclose(id) => {
                self.on_connected_namespace_autoclose(id)
            }
            ManagerEvent::DnsRedirectionAutoclose(fd) => self.on_dns_redirection_autoclose(fd),
            ManagerEvent::RestartIpv6(netns_name) => self
                .forwarding
                .guest_ipv6
                .restart_ipv6(&self.datapath, &netns_name),
        }
    }

    fn schedule_restart_ipv6(event_tx: &UnboundedSender<ManagerEvent>, netns_name: &str) {
        let event_tx = event_tx.clone();
        let netns_name = netns_name.to_string();
        tokio::task::spawn_local(async move {
            tokio::time::sleep(IPV6_RESTART_DELAY).await;
            let _ = event_tx.send(ManagerEvent::RestartIpv6(netns_name));
        });
    }

    // ------------------------------------------------------------------
    // shill Device events
    // ------------------------------------------------------------------

    pub fn on_shill_devices_changed(&mut self, change: ShillDevicesChange) {
        for device in change.removed {
            info!(%device, "upstream device removed");
            self.arc_service
                .remove_device(&self.datapath, &mut self.forwarding, &device);
            self.forwarding.guest_ipv6.stop_uplink(&self.datapath, &device);
            self.datapath.stop_connection_pinning(&device);
            self.datapath.remove_redirect_dns_rule(&device);
            self.datapath.stop_source_ipv6_prefix_enforcement(&device);
            if device.technology == Technology::Wifi && self.feature_wifi_qos {
                self.datapath.disable_qos_applying_dscp(&device.ifname);
            }
            self.shill_devices.remove(&device.ifname);
        }
        for device in change.added {
            info!(%device, "upstream device added");
            self.shill_devices.insert(device.ifname.clone(), device.clone());
            self.datapath.start_connection_pinning(&device);
            if let Some(dns) = device.ipv4_dns_addresses.first() {
                self.datapath.add_redirect_dns_rule(&device, *dns);
            }
            self.arc_service
                .add_device(&self.datapath, &mut self.forwarding, &device);
            self.datapath.start_source_ipv6_prefix_enforcement(&device);
            if let Some(prefix) = &device.ipv6_prefix {
                self.datapath
                    .update_source_enforcement_ipv6_prefix(&device, Some(prefix));
            }
            if device.technology == Technology::Wifi && self.feature_wifi_qos {
                self.datapath.enable_qos_applying_dscp(&device.ifname);
            }
        }
    }

    /// Applies or clears a network configuration on a physical
    /// interface through the external applier, keeping the Device cache
    /// in sync. This path is performance sensitive and may run before
    /// the rest of the initialization has completed.
    pub fn configure_network(&mut self, ifindex: u32, device: Option<ShillDevice>) {
        match device {
            Some(device) => {
                self.network_applier.apply_network_config(ifindex, &device);
                self.shill_devices.insert(device.ifname.clone(), device);
            }
            None => {
                self.network_applier.clear_network_config(ifindex);
                let system = Rc::clone(&self.system);
                self.shill_devices
                    .retain(|_, d| system.ifindex(&d.ifname).ok() != Some(ifindex));
            }
        }
    }

    pub fn on_shill_device_ipv6_changed(&mut self, device: ShillDevice) {
        self.forwarding
            .guest_ipv6
            .on_uplink_ipv6_changed(&self.datapath, &device);
        self.datapath
            .update_source_enforcement_ipv6_prefix(&device, device.ipv6_prefix.as_ref());
        self.shill_devices.insert(device.ifname.clone(), device);
    }

    pub fn on_shill_default_logical_device_changed(&mut self, new_device: Option<ShillDevice>) {
        let previous = self.default_logical_device.clone();
        // Only take into account interface switches and new Device or
        // removed Device events. Ignore any layer 3 property change.
        match (&previous, &new_device) {
            (None, None) => return,
            (Some(prev), Some(new)) if prev.ifname == new.ifname => return,
            _ => {}
        }

        if let Some(prev) = previous.as_ref().filter(|d| d.is_vpn()) {
            self.datapath.stop_vpn_routing(prev);
        }
        if let Some(new) = new_device.as_ref().filter(|d| d.is_vpn()) {
            self.datapath.start_vpn_routing(new);
        }

        self.crostini_service.on_shill_default_logical_device_changed(
            &self.datapath,
            &mut self.forwarding,
            new_device.as_ref(),
        );

        // Connected namespaces following the logical default swap their
        // forwarding group membership and re-solicit routers shortly
        // after.
        for entry in self.connected_namespaces.values_mut() {
            if !entry.info.outbound_ifname.is_empty() || !entry.info.route_on_vpn {
                continue;
            }
            if entry.info.static_ipv6_config.is_none() {
                if let Some(prev) = &entry.info.current_outbound_device {
                    self.forwarding
                        .guest_ipv6
                        .stop_forwarding(&self.datapath, prev, &entry.info.host_ifname);
                }
                if let Some(new) = &new_device {
                    self.forwarding
                        .guest_ipv6
                        .start_forwarding(&self.datapath, new, &entry.info.host_ifname);
                }
                Manager::schedule_restart_ipv6(&self.event_tx, &entry.info.netns_name);
            }
            entry.info.current_outbound_device = new_device.clone();
        }

        self.default_logical_device = new_device;
    }

    pub fn on_shill_default_physical_device_changed(&mut self, new_device: Option<ShillDevice>) {
        // Only take into account interface switches and new Device or
        // removed Device events. Ignore any layer 3 property change.
        match (&self.default_physical_device, &new_device) {
            (None, None) => return,
            (Some(prev), Some(new)) if prev.ifname == new.ifname => return,
            _ => {}
        }

        for entry in self.connected_namespaces.values_mut() {
            if !entry.info.outbound_ifname.is_empty() || entry.info.route_on_vpn {
                continue;
            }
            if entry.info.static_ipv6_config.is_none() {
                if let Some(prev) = &entry.info.current_outbound_device {
                    self.forwarding
                        .guest_ipv6
                        .stop_forwarding(&self.datapath, prev, &entry.info.host_ifname);
                }
                if let Some(new) = &new_device {
                    self.forwarding
                        .guest_ipv6
                        .start_forwarding(&self.datapath, new, &entry.info.host_ifname);
                }
                Manager::schedule_restart_ipv6(&self.event_tx, &entry.info.netns_name);
            }
            entry.info.current_outbound_device = new_device.clone();
        }
        self.default_physical_device = new_device;
    }

    // ------------------------------------------------------------------
    // Guest lifecycle
    // ------------------------------------------------------------------

    pub fn arc_startup(&mut self, pid: u32) -> Result<(), ManagerError> {
        self.arc_service
            .start(&self.datapath, &mut self.addr_mgr, &mut self.forwarding, pid)?;
        self.arc_id = Some(pid);
        Ok(())
    }

    pub fn arc_shutdown(&mut self) {
        if let Some(id) = self.arc_id.take() {
            self.arc_service.stop(&self.datapath, &mut self.forwarding, id);
        }
    }

    pub fn arc_vm_startup(&mut self, cid: u32) -> Result<ArcVmStartupResponse, ManagerError> {
        self.arc_service
            .start(&self.datapath, &mut self.addr_mgr, &mut self.forwarding, cid)?;
        self.arc_id = Some(cid);
        let arc0_ipv4_address = self
            .arc_service
            .arc0_ipv4_address()
            .ok_or_else(|| ManagerError::Configuration("arc0 is not configured".to_string()))?;
        Ok(ArcVmStartupResponse {
            arc0_ipv4_address,
            tap_ifnames: self.arc_service.tap_ifnames(),
        })
    }

    pub fn arc_vm_shutdown(&mut self, cid: u32) {
        self.arc_service.stop(&self.datapath, &mut self.forwarding, cid);
        if self.arc_id == Some(cid) {
            self.arc_id = None;
        }
    }

    pub fn termina_vm_startup(&mut self, cid: u64) -> Result<TerminaVmStartupResponse, ManagerError> {
        let device = self.crostini_service.start(
            &self.datapath,
            &mut self.addr_mgr,
            &mut self.forwarding,
            cid,
            VmType::Termina,
            ANY_SUBNET_INDEX,
        )?;
        let response = TerminaVmStartupResponse {
            tap_ifname: device.tap_device_ifname.clone(),
            vm_ipv4_subnet: device.vm_ipv4_subnet.base_cidr(),
            gateway_ipv4_address: device.gateway_ipv4_address(),
            vm_ipv4_address: device.vm_ipv4_address(),
            container_ipv4_subnet: device.lxd_ipv4_subnet.as_ref().map(|s| s.base_cidr()),
            container_ipv4_address: device.lxd_ipv4_address(),
        };
        self.crostini_vms.insert(cid, VmType::Termina);
        Ok(response)
    }

    pub fn parallels_vm_startup(
        &mut self,
        cid: u64,
        subnet_index: u32,
    ) -> Result<TerminaVmStartupResponse, ManagerError> {
        let device = self.crostini_service.start(
            &self.datapath,
            &mut self.addr_mgr,
            &mut self.forwarding,
            cid,
            VmType::Parallels,
            subnet_index,
        )?;
        let response = TerminaVmStartupResponse {
            tap_ifname: device.tap_device_ifname.clone(),
            vm_ipv4_subnet: device.vm_ipv4_subnet.base_cidr(),
            gateway_ipv4_address: device.gateway_ipv4_address(),
            vm_ipv4_address: device.vm_ipv4_address(),
            container_ipv4_subnet: None,
            container_ipv4_address: None,
        };
        self.crostini_vms.insert(cid, VmType::Parallels);
        Ok(response)
    }

    pub fn bruschetta_vm_startup(&mut self, cid: u64) -> Result<TerminaVmStartupResponse, ManagerError> {
        let device = self.crostini_service.start(
            &self.datapath,
            &mut self.addr_mgr,
            &mut self.forwarding,
            cid,
            VmType::Bruschetta,
            ANY_SUBNET_INDEX,
        )?;
        let response = TerminaVmStartupResponse {
            tap_ifname: device.tap_device_ifname.clone(),
            vm_ipv4_subnet: device.vm_ipv4_subnet.base_cidr(),
            gateway_ipv4_address: device.gateway_ipv4_address(),
            vm_ipv4_address: device.vm_ipv4_address(),
            container_ipv4_subnet: None,
            container_ipv4_address: None,
        };
        self.crostini_vms.insert(cid, VmType::Bruschetta);
        Ok(response)
    }

    pub fn borealis_vm_startup(&mut self, cid: u64) -> Result<TerminaVmStartupResponse, ManagerError> {
        let device = self.crostini_service.start(
            &self.datapath,
            &mut self.addr_mgr,
            &mut self.forwarding,
            cid,
            VmType::Borealis,
            ANY_SUBNET_INDEX,
        )?;
        let response = TerminaVmStartupResponse {
            tap_ifname: device.tap_device_ifname.clone(),
            vm_ipv4_subnet: device.vm_ipv4_subnet.base_cidr(),
            gateway_ipv4_address: device.gateway_ipv4_address(),
            vm_ipv4_address: device.vm_ipv4_address(),
            container_ipv4_subnet: None,
            container_ipv4_address: None,
        };
        // Borealis opts into the real-time-interactive QoS tagging.
        self.datapath.add_borealis_qos_rule(&response.tap_ifname);
        self.crostini_vms.insert(cid, VmType::Borealis);
        Ok(response)
    }

    pub fn crostini_vm_shutdown(&mut self, vm_id: u64) {
        let vm_type = self.crostini_vms.remove(&vm_id);
        if vm_type == Some(VmType::Borealis) {
            if let Some(device) = self.crostini_service.get_device(vm_id) {
                let tap = device.tap_device_ifname.clone();
                self.datapath.remove_borealis_qos_rule(&tap);
            }
        }
        self.crostini_service
            .stop(&self.datapath, &mut self.forwarding, vm_id);
    }

    // ------------------------------------------------------------------
    // Connected namespaces
    // ------------------------------------------------------------------

    pub fn connect_namespace(
        &mut self,
        request: ConnectNamespaceRequest,
        lifeline_fd: OwnedFd,
    ) -> Result<ConnectNamespaceResponse, ManagerError> {
        if request.pid != NEW_NETNS_PID && request.pid <= 0 {
            return Err(ManagerError::Configuration(format!(
                "invalid pid {}",
                request.pid
            )));
        }
        let current_outbound_device = if request.outbound_physical_device.is_empty() {
            if request.route_on_vpn {
                self.default_logical_device.clone()
            } else {
                self.default_physical_device.clone()
            }
        } else {
            let device = self
                .shill_devices
                .get(&request.outbound_physical_device)
                .cloned();
            if device.is_none() {
                return Err(ManagerError::Configuration(format!(
                    "unknown outbound device {}",
                    request.outbound_physical_device
                )));
            }
            device
        };

        let subnet = self
            .addr_mgr
            .allocate_ipv4_subnet(GuestType::Netns, ANY_SUBNET_INDEX)
            .ok_or_else(|| ManagerError::ResourceExhaustion("netns IPv4 pool".to_string()))?;
        let host_ipv4_cidr = subnet.cidr_at_offset(1).expect("offset 1 is valid");
        let peer_ipv4_cidr = subnet.cidr_at_offset(2).expect("offset 2 is valid");

        let id = self.next_connected_namespace_id;
        self.next_connected_namespace_id += 1;

        let (ipv6_subnet, static_ipv6_config) = if request.static_ipv6 {
            let subnet6 = self.addr_mgr.allocate_ipv6_subnet();
            let host_cidr = AddressManager::get_randomized_ipv6_address(&subnet6)
                .expect("a /64 holds more than one address");
            let peer_cidr = loop {
                let candidate = AddressManager::get_randomized_ipv6_address(&subnet6)
                    .expect("a /64 holds more than one address");
                if candidate.address() != host_cidr.address() {
                    break candidate;
                }
            };
            (Some(subnet6), Some(StaticIpv6Config { host_cidr, peer_cidr }))
        } else {
            (None, None)
        };

        let nsinfo = ConnectedNamespace {
            pid: request.pid,
            netns_name: format!("connected_netns_{id}"),
            source: request.source,
            outbound_ifname: request.outbound_physical_device.clone(),
            route_on_vpn: request.route_on_vpn,
            host_ifname: format!("arc_ns{id}"),
            peer_ifname: format!("veth{id}"),
            host_mac_addr: self.addr_mgr.generate_mac_address(ANY_SUBNET_INDEX),
            peer_mac_addr: self.addr_mgr.generate_mac_address(ANY_SUBNET_INDEX),
            peer_ipv4_subnet: Some(subnet),
            host_ipv4_cidr,
            peer_ipv4_cidr,
            static_ipv6_config,
            current_outbound_device,
        };

        if let Err(error) = self.datapath.start_routing_namespace(&nsinfo) {
            if let Some(subnet6) = &ipv6_subnet {
                self.addr_mgr.release_ipv6_subnet(subnet6);
            }
            return Err(error.into());
        }

        let event_tx = self.event_tx.clone();
        let lifeline = self.lifeline_svc.add_lifeline_fd(lifeline_fd, move || {
            let _ = event_tx.send(ManagerEvent::ConnectedNamespaceAutoclose(id));
        })?;

        // Dynamic IPv6 goes through ND proxying on the current upstream;
        // static IPv6 is NAT66'd instead.
        if nsinfo.static_ipv6_config.is_none() {
            if let Some(upstream) = nsinfo.current_outbound_device.clone() {
                self.forwarding.guest_ipv6.start_forwarding(
                    &self.datapath,
                    &upstream,
                    &nsinfo.host_ifname,
                );
                Manager::schedule_restart_ipv6(&self.event_tx, &nsinfo.netns_name);
            }
        }

        let response = ConnectNamespaceResponse {
            netns_name: nsinfo.netns_name.clone(),
            peer_ifname: nsinfo.peer_ifname.clone(),
            peer_ipv4_cidr: nsinfo.peer_ipv4_cidr,
            host_ifname: nsinfo.host_ifname.clone(),
            host_ipv4_cidr: nsinfo.host_ipv4_cidr,
            ipv4_subnet: nsinfo
                .peer_ipv4_subnet
                .as_ref()
                .expect("owned above")
                .base_cidr(),
            static_ipv6: nsinfo.static_ipv6_config.clone(),
        };
        info!(netns = %response.netns_name, host = %response.host_ifname, "namespace connected");
        self.connected_namespaces.insert(
            id,
            ConnectedNamespaceEntry {
                info: nsinfo,
                ipv6_subnet,
                _lifeline: lifeline,
            },
        );
        Ok(response)
    }

    fn on_connected_namespace_autoclose(&mut self, id: u32) {
        let Some(entry) = self.connected_namespaces.remove(&id) else {
            return;
        };
        info!(netns = %entry.info.netns_name, "releasing connected namespace");
        if entry.info.static_ipv6_config.is_none() {
            if let Some(upstream) = &entry.info.current_outbound_device {
                self.forwarding.guest_ipv6.stop_forwarding(
                    &self.datapath,
                    upstream,
                    &entry.info.host_ifname,
                );
            }
        }
        self.datapath.stop_routing_namespace(&entry.info);
        if let Some(subnet6) = &entry.ipv6_subnet {
            self.addr_mgr.release_ipv6_subnet(subnet6);
        }
        // Dropping the entry returns the IPv4 /30 to the netns pool.
    }

    // ------------------------------------------------------------------
    // DNS redirection
    // ------------------------------------------------------------------

    pub fn set_dns_redirection_rule(
        &mut self,
        request: DnsRedirectionRequest,
        lifeline_fd: OwnedFd,
    ) -> Result<(), ManagerError> {
        let fd_key = lifeline_fd.as_raw_fd();
        let rule = DnsRedirectionRule {
            rule_type: request.rule_type,
            input_ifname: request.input_ifname,
            proxy_address: request.proxy_address,
            host_ifname: request.host_ifname,
            nameservers: request.nameservers,
        };

        let event_tx = self.event_tx.clone();
        let lifeline = self.lifeline_svc.add_lifeline_fd(lifeline_fd, move || {
            let _ = event_tx.send(ManagerEvent::DnsRedirectionAutoclose(fd_key));
        })?;

        self.datapath.start_dns_redirection(&rule)?;

        // An IPv6 proxy address must be reachable from the guests: add it
        // as a proxied neighbor on the guest-facing interface.
        if let IpAddr::V6(addr) = rule.proxy_address {
            if !rule.host_ifname.is_empty() && rule.rule_type != DnsRedirectionType::Arc {
                self.forwarding.guest_ipv6.register_downstream_neighbor(
                    &self.datapath,
                    &rule.host_ifname,
                    addr,
                );
            }
        }

        // Record ARC dns-proxy addresses for re-emission to observers.
        if rule.rule_type == DnsRedirectionType::Arc {
            match rule.proxy_address {
                IpAddr::V4(addr) => {
                    self.arc_dns_proxy_ipv4_addrs
                        .insert(rule.input_ifname.clone(), addr);
                }
                IpAddr::V6(addr) => {
                    self.arc_dns_proxy_ipv6_addrs
                        .insert(rule.input_ifname.clone(), addr);
                }
            }
        }

        self.dns_redirection_rules.insert(
            fd_key,
            DnsRedirectionEntry {
                rule,
                _lifeline: lifeline,
            },
        );
        Ok(())
    }

    fn on_dns_redirection_autoclose(&mut self, fd_key: RawFd) {
        let Some(entry) = self.dns_redirection_rules.remove(&fd_key) else {
            return;
        };
        let rule = &entry.rule;
        self.datapath.stop_dns_redirection(rule);
        if let IpAddr::V6(addr) = rule.proxy_address {
            if !rule.host_ifname.is_empty() && rule.rule_type != DnsRedirectionType::Arc {
                self.forwarding.guest_ipv6.unregister_downstream_neighbor(
                    &self.datapath,
                    &rule.host_ifname,
                    addr,
                );
            }
        }
        if rule.rule_type == DnsRedirectionType::Arc {
            match rule.proxy_address {
                IpAddr::V4(_) => {
                    self.arc_dns_proxy_ipv4_addrs.remove(&rule.input_ifname);
                }
                IpAddr::V6(_) => {
                    self.arc_dns_proxy_ipv6_addrs.remove(&rule.input_ifname);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Downstream networks
    // ------------------------------------------------------------------

    pub fn start_downstream_network(
        &mut self,
        info: DownstreamNetworkInfo,
    ) -> Result<(), ManagerError> {
        Ok(self.downstream_networks.start(&self.datapath, info)?)
    }

    pub fn stop_downstream_network(&mut self, downstream_ifname: &str) {
        self.downstream_networks.stop(&self.datapath, downstream_ifname);
    }

    // ------------------------------------------------------------------
    // Misc request surface
    // ------------------------------------------------------------------

    pub fn modify_port_rule(&mut self, request: &PortRuleRequest) -> Result<(), ManagerError> {
        Ok(self.datapath.modify_port_rule(request)?)
    }

    pub fn set_vpn_lockdown(&mut self, enable: bool) {
        self.datapath.set_vpn_lockdown(enable);
    }

    pub fn tag_socket(&mut self, request: TagSocketRequest, fd: RawFd) -> Result<(), ManagerError> {
        let mut mark = Fwmark::from_ifindex(request.network_id).ok_or_else(|| {
            ManagerError::Configuration(format!("invalid network id {}", request.network_id))
        })?;
        match request.vpn_policy {
            VpnRoutingPolicy::Default => {}
            VpnRoutingPolicy::RouteOnVpn => mark = mark | fwmark::ROUTE_ON_VPN,
            VpnRoutingPolicy::BypassVpn => mark = mark | fwmark::BYPASS_VPN,
        }
        Ok(self.system.set_socket_mark(fd, mark.value())?)
    }

    pub fn notify_android_wifi_multicast_lock_change(&mut self, held: bool) {
        self.arc_service.notify_android_wifi_multicast_lock_change(
            &self.datapath,
            &mut self.forwarding,
            held,
        );
    }

    pub fn set_feature_flag(&mut self, flag: FeatureFlag, enabled: bool) -> bool {
        match flag {
            FeatureFlag::WifiQos => {
                let previous = self.feature_wifi_qos;
                self.feature_wifi_qos = enabled;
                if enabled && !previous {
                    self.datapath.enable_qos_detection();
                    for device in self.shill_devices.values() {
                        if device.technology == Technology::Wifi {
                            self.datapath.enable_qos_applying_dscp(&device.ifname);
                        }
                    }
                } else if !enabled && previous {
                    self.datapath.disable_qos_detection();
                    for device in self.shill_devices.values() {
                        if device.technology == Technology::Wifi {
                            self.datapath.disable_qos_applying_dscp(&device.ifname);
                        }
                    }
                }
                previous
            }
            FeatureFlag::Clat => {
                let previous = self.feature_clat;
                self.feature_clat = enabled;
                previous
            }
        }
    }

    /// Replaces the DoH provider list used for QoS classification.
    pub fn update_doh_providers(&mut self, provider_ips: &[IpAddr]) {
        self.datapath
            .update_doh_providers_for_qos(IpFamily::Ipv4, provider_ips);
        self.datapath
            .update_doh_providers_for_qos(IpFamily::Ipv6, provider_ips);
    }

    pub fn get_devices(&self) -> Vec<VirtualDeviceInfo> {
        let mut devices = Vec::new();
        for arc_device in self.arc_service.devices() {
            devices.push(VirtualDeviceInfo {
                ifname: arc_device.bridge_ifname.clone(),
                phys_ifname: arc_device.shill_device_ifname.clone().unwrap_or_default(),
                guest_ifname: arc_device.guest_device_ifname.clone(),
                ipv4_addr: arc_device.arc_ipv4_address(),
                host_ipv4_addr: arc_device.bridge_ipv4_address(),
                guest_type: match arc_device.arc_type {
                    ArcType::Container => "ARC".to_string(),
                    ArcType::Vm => "ARCVM".to_string(),
                },
            });
        }
        for device in self.crostini_service.devices() {
            devices.push(VirtualDeviceInfo {
                ifname: device.tap_device_ifname.clone(),
                phys_ifname: device.tap_device_ifname.clone(),
                guest_ifname: String::new(),
                ipv4_addr: device.vm_ipv4_address(),
                host_ipv4_addr: device.gateway_ipv4_address(),
                guest_type: device.vm_type.to_string(),
            });
        }
        devices
    }

    pub fn shill_device(&self, ifname: &str) -> Option<&ShillDevice> {
        self.shill_devices.get(ifname)
    }

    pub fn arc_dns_proxy_ipv4_addr(&self, ifname: &str) -> Option<Ipv4Addr> {
        self.arc_dns_proxy_ipv4_addrs.get(ifname).copied()
    }

    pub fn arc_dns_proxy_ipv6_addr(&self, ifname: &str) -> Option<Ipv6Addr> {
        self.arc_dns_proxy_ipv6_addrs.get(ifname).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::Table;
    use crate::mocks::{
        FakeProcessRunner, FakeSystem, RecordingMulticast, RecordingNdProxy,
        RecordingNetworkApplier, fake_shill_device,
    };
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        runner: Rc<FakeProcessRunner>,
        system: Rc<FakeSystem>,
        manager: Manager,
        event_rx: mpsc::UnboundedReceiver<ManagerEvent>,
    }

    fn fixture(arc_type: ArcType) -> Fixture {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let manager = Manager::new(
            Rc::clone(&runner) as Rc<dyn ProcessRunner>,
            Rc::clone(&system) as Rc<dyn System>,
            Rc::new(RecordingNdProxy::default()) as Rc<dyn NdProxyControl>,
            Rc::new(RecordingMulticast::default()) as Rc<dyn MulticastControl>,
            Rc::new(RecordingNetworkApplier::default()) as Rc<dyn NetworkApplier>,
            arc_type,
            PathBuf::from("/tmp/iptables.start"),
            PathBuf::from("/tmp/ip6tables.start"),
            event_tx,
        );
        Fixture {
            runner,
            system,
            manager,
            event_rx,
        }
    }

    fn lifeline_fd() -> (OwnedFd, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (OwnedFd::from(ours), theirs)
    }

    #[tokio::test]
    async fn connected_namespace_lifecycle() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut fx = fixture(ArcType::Container);
                fx.system.set_ifindex("wlan0", 3);
                fx.manager.on_shill_devices_changed(ShillDevicesChange {
                    added: vec![fake_shill_device("wlan0", Technology::Wifi)],
                    removed: vec![],
                });

                let (fd, peer) = lifeline_fd();
                let request = ConnectNamespaceRequest {
                    pid: 4567,
                    outbound_physical_device: "wlan0".to_string(),
                    source: TrafficSource::System,
                    route_on_vpn: false,
                    static_ipv6: true,
                };
                let response = fx.manager.connect_namespace(request, fd).unwrap();

                assert_eq!(response.netns_name, "connected_netns_0");
                assert_eq!(response.host_ifname, "arc_ns0");
                assert_eq!(response.peer_ifname, "veth0");
                assert_eq!(response.host_ipv4_cidr, "100.115.92.129/30".parse().unwrap());
                assert_eq!(response.peer_ipv4_cidr, "100.115.92.130/30".parse().unwrap());
                let static_ipv6 = response.static_ipv6.as_ref().unwrap();
                assert_eq!(static_ipv6.host_cidr.network_length(), 64);
                assert_ne!(static_ipv6.host_cidr.address(), static_ipv6.peer_cidr.address());
                let host_octets = static_ipv6.host_cidr.address().octets();
                assert_eq!(host_octets[0], 0xfd);
                // The namespace exists and its chains are installed.
                assert_eq!(fx.runner.netns_names(), vec!["connected_netns_0".to_string()]);
                assert!(fx.runner.has_chain(false, Table::Mangle, "PREROUTING_arc_ns0"));

                // Closing the client fd releases everything.
                drop(peer);
                let event = tokio::time::timeout(Duration::from_secs(1), fx.event_rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(event, ManagerEvent::ConnectedNamespaceAutoclose(0));
                fx.manager.handle_event(event);
                assert!(fx.runner.netns_names().is_empty());
                assert!(!fx.runner.has_chain(false, Table::Mangle, "PREROUTING_arc_ns0"));

                // The /30 went back to the pool: the next namespace gets
                // the same addresses.
                let (fd2, _peer2) = lifeline_fd();
                let request = ConnectNamespaceRequest {
                    pid: NEW_NETNS_PID,
                    outbound_physical_device: String::new(),
                    source: TrafficSource::System,
                    route_on_vpn: false,
                    static_ipv6: false,
                };
                let response = fx.manager.connect_namespace(request, fd2).unwrap();
                assert_eq!(response.netns_name, "connected_netns_1");
                assert_eq!(response.host_ipv4_cidr, "100.115.92.129/30".parse().unwrap());
            })
            .await;
    }

    #[tokio::test]
    async fn connect_namespace_rejects_bad_pid() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut fx = fixture(ArcType::Container);
                let (fd, _peer) = lifeline_fd();
                let request = ConnectNamespaceRequest {
                    pid: -5,
                    outbound_physical_device: String::new(),
                    source: TrafficSource::System,
                    route_on_vpn: false,
                    static_ipv6: false,
                };
                assert!(matches!(
                    fx.manager.connect_namespace(request, fd),
                    Err(ManagerError::Configuration(_))
                ));
            })
            .await;
    }

    #[tokio::test]
    async fn dns_redirection_rule_lifecycle() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut fx = fixture(ArcType::Container);
                let (fd, peer) = lifeline_fd();
                let request = DnsRedirectionRequest {
                    rule_type: DnsRedirectionType::User,
                    input_ifname: String::new(),
                    proxy_address: "8.8.4.4".parse().unwrap(),
                    host_ifname: "arc_ns0".to_string(),
                    nameservers: vec![],
                };
                fx.manager.set_dns_redirection_rule(request, fd).unwrap();
                assert_eq!(fx.runner.rules(false, Table::Nat, "redirect_user_dns").len(), 2);
                assert_eq!(
                    fx.runner.rules(false, Table::Mangle, "skip_apply_vpn_mark").len(),
                    2
                );
                assert_eq!(
                    fx.runner
                        .rules(false, Table::Filter, "accept_egress_to_dns_proxy")
                        .len(),
                    1
                );

                drop(peer);
                let event = tokio::time::timeout(Duration::from_secs(1), fx.event_rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                fx.manager.handle_event(event);
                assert!(fx.runner.rules(false, Table::Nat, "redirect_user_dns").is_empty());
                assert!(
                    fx.runner
                        .rules(false, Table::Mangle, "skip_apply_vpn_mark")
                        .is_empty()
                );
                assert!(
                    fx.runner
                        .rules(false, Table::Filter, "accept_egress_to_dns_proxy")
                        .is_empty()
                );
            })
            .await;
    }

    #[tokio::test]
    async fn default_logical_vpn_switch_toggles_vpn_routing() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut fx = fixture(ArcType::Container);
                fx.system.set_ifindex("tun0", 5);
                fx.system.set_ifindex("arcbr0", 6);
                fx.system.set_ifindex("eth0", 2);

                let tun0 = fake_shill_device("tun0", Technology::Vpn);
                fx.manager.on_shill_default_logical_device_changed(Some(tun0));
                assert_eq!(
                    fx.runner.rules(false, Table::Mangle, "apply_vpn_mark").len(),
                    2
                );

                let eth0 = fake_shill_device("eth0", Technology::Ethernet);
                fx.manager.on_shill_default_logical_device_changed(Some(eth0));
                assert!(fx.runner.rules(false, Table::Mangle, "apply_vpn_mark").is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn default_device_layer3_only_change_is_ignored() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut fx = fixture(ArcType::Container);
                fx.system.set_ifindex("tun0", 5);
                fx.system.set_ifindex("arcbr0", 6);

                // No previous and no new default is a no-op.
                fx.manager.on_shill_default_logical_device_changed(None);
                fx.manager.on_shill_default_physical_device_changed(None);

                let tun0 = fake_shill_device("tun0", Technology::Vpn);
                fx.manager
                    .on_shill_default_logical_device_changed(Some(tun0.clone()));
                let rules = fx.runner.rules(false, Table::Mangle, "apply_vpn_mark");
                assert_eq!(rules.len(), 2);

                // A layer 3 property change on the same interface must not
                // restart VPN routing or duplicate any rule.
                let mut tun0_l3 = tun0.clone();
                tun0_l3.ipv4_dns_addresses = vec!["10.8.0.1".parse().unwrap()];
                fx.manager.on_shill_default_logical_device_changed(Some(tun0_l3));
                assert_eq!(fx.runner.rules(false, Table::Mangle, "apply_vpn_mark"), rules);

                // Same for the physical default: with a namespace following
                // it, a repeated signal for the same interface must not
                // re-arm the IPv6 restart timer.
                let eth0 = fake_shill_device("eth0", Technology::Ethernet);
                fx.system.set_ifindex("eth0", 2);
                fx.manager
                    .on_shill_default_physical_device_changed(Some(eth0.clone()));
                let (fd, _peer) = lifeline_fd();
                let request = ConnectNamespaceRequest {
                    pid: NEW_NETNS_PID,
                    outbound_physical_device: String::new(),
                    source: TrafficSource::System,
                    route_on_vpn: false,
                    static_ipv6: false,
                };
                fx.manager.connect_namespace(request, fd).unwrap();
                // Drain the restart scheduled by the namespace setup itself.
                let event = tokio::time::timeout(Duration::from_secs(1), fx.event_rx.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert!(matches!(event, ManagerEvent::RestartIpv6(_)));

                fx.manager.on_shill_default_physical_device_changed(Some(eth0));
                tokio::time::sleep(Duration::from_millis(400)).await;
                assert!(fx.event_rx.try_recv().is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn device_change_installs_and_removes_upstream_state() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut fx = fixture(ArcType::Container);
                fx.system.set_ifindex("eth0", 2);
                let mut eth0 = fake_shill_device("eth0", Technology::Ethernet);
                eth0.ipv4_dns_addresses = vec!["192.168.1.1".parse().unwrap()];

                fx.manager.on_shill_devices_changed(ShillDevicesChange {
                    added: vec![eth0.clone()],
                    removed: vec![],
                });
                // Connection pinning and system DNS redirection.
                assert!(fx.runner.has_chain(false, Table::Mangle, "POSTROUTING_eth0"));
                assert_eq!(
                    fx.runner.rules(false, Table::Nat, "redirect_dns"),
                    vec![
                        "-p udp --dport 53 -o eth0 -j DNAT --to-destination 192.168.1.1".to_string(),
                        "-p tcp --dport 53 -o eth0 -j DNAT --to-destination 192.168.1.1".to_string(),
                    ]
                );
                // Source IPv6 prefix enforcement starts closed.
                assert_eq!(
                    fx.runner.rules(true, Table::Filter, "egress_eth0"),
                    vec!["-j enforce_ipv6_src_prefix".to_string()]
                );

                fx.manager.on_shill_devices_changed(ShillDevicesChange {
                    added: vec![],
                    removed: vec![eth0],
                });
                assert!(!fx.runner.has_chain(false, Table::Mangle, "POSTROUTING_eth0"));
                assert!(fx.runner.rules(false, Table::Nat, "redirect_dns").is_empty());
                assert!(!fx.runner.has_chain(true, Table::Filter, "egress_eth0"));
            })
            .await;
    }

    #[tokio::test]
    async fn tag_socket_sets_so_mark() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut fx = fixture(ArcType::Container);
                let request = TagSocketRequest {
                    network_id: 7,
                    vpn_policy: VpnRoutingPolicy::RouteOnVpn,
                };
                fx.manager.tag_socket(request, 42).unwrap();
                assert_eq!(fx.system.socket_marks(), vec![(42, 0x0100_0007)]);
            })
            .await;
    }

    #[tokio::test]
    async fn feature_flag_returns_previous_value() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut fx = fixture(ArcType::Container);
                assert!(!fx.manager.set_feature_flag(FeatureFlag::WifiQos, true));
                assert!(fx.manager.set_feature_flag(FeatureFlag::WifiQos, true));
                // Enabling QoS installed the detection jump.
                assert_eq!(
                    fx.runner.rules(false, Table::Mangle, "qos_detect_static"),
                    vec!["-j qos_detect".to_string()]
                );
                fx.manager.set_feature_flag(FeatureFlag::WifiQos, false);
                assert!(fx.runner.rules(false, Table::Mangle, "qos_detect_static").is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn borealis_startup_installs_qos_rule() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut fx = fixture(ArcType::Container);
                let response = fx.manager.borealis_vm_startup(9).unwrap();
                assert_eq!(
                    fx.runner.rules(false, Table::Mangle, "qos_detect_borealis"),
                    vec![format!(
                        "-i {} -j MARK --set-xmark 0x0c000000/0x3c000000",
                        response.tap_ifname
                    )]
                );
                fx.manager.crostini_vm_shutdown(9);
                assert!(
                    fx.runner
                        .rules(false, Table::Mangle, "qos_detect_borealis")
                        .is_empty()
                );
            })
            .await;
    }
}
