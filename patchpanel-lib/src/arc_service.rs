//! Lifecycle of the ARC container and ARCVM datapaths.
//!
//! ARC gets one virtual device per upstream shill Device plus the
//! `arc0`/`arcbr0` management device used for VPN forwarding and
//! ADB-over-TCP. Address configs are pre-allocated at construction and
//! recycled when an upstream disappears, so a reappearing upstream keeps
//! its MAC and addresses.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::address_manager::{AddressManager, GuestType};
use crate::datapath::{ARC0_IFNAME, ARCBR0_IFNAME, AutoDnatTarget, Datapath, DatapathError};
use crate::forwarding::{ForwardingService, ForwardingSet};
use crate::fwmark::TrafficSource;
use crate::mac::MacAddress;
use crate::shill::{ShillDevice, Technology};
use crate::subnet::{ANY_SUBNET_INDEX, Subnet};
use crate::system::DeviceMode;

const ARC_NETNS_NAME: &str = "arc_netns";
const ARC_VM_IFNAME_PREFIX: &str = "eth";
const VETH_ARC0_IFNAME: &str = "vetharc0";
const CROSVM_USER: &str = "crosvm";
const IFNAMSIZ: usize = 16;

// Netfilter modules needed by Android's netd that are not compiled into
// the kernel; Android does not allow auto-loading of kernel modules.
const ANDROID_REQUIRED_MODULES: &[&str] =
    &["ip6table_filter", "ip6t_ipv6header", "ip6t_REJECT", "ah6", "esp6"];
// Optional for CTS compliance but required for some Android features
// (Android NAT conntrack helpers, 464xlat).
const ANDROID_OPTIONAL_MODULES: &[&str] = &["nf_reject_ipv6", "nf_nat_ftp", "nf_nat_tftp", "tun"];

#[derive(Debug, Error)]
pub enum ArcServiceError {
    #[error("invalid ARC id {0}")]
    InvalidId(u32),
    #[error("failed to attach {0} to pid {1}")]
    NetnsAttach(String, i32),
    #[error(transparent)]
    Datapath(#[from] DatapathError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcType {
    Container,
    Vm,
}

/// Pre-allocated addressing for one ARC virtual device. The subnet
/// reserves offset 1 for the bridge (host side) and offset 2 for the
/// guest side.
pub struct ArcConfig {
    pub mac_addr: MacAddress,
    pub ipv4_subnet: Subnet,
    /// Only set for ARCVM, where TAP devices are provisioned ahead of
    /// time.
    pub tap_ifname: Option<String>,
}

impl ArcConfig {
    pub fn bridge_ipv4_cidr(&self) -> cidr::Ipv4Inet {
        self.ipv4_subnet
            .cidr_at_offset(1)
            .expect("offset 1 is valid in a /30")
    }

    pub fn guest_ipv4_cidr(&self) -> cidr::Ipv4Inet {
        self.ipv4_subnet
            .cidr_at_offset(2)
            .expect("offset 2 is valid in a /30")
    }
}

/// A virtual device currently attached to the ARC guest.
pub struct ArcDevice {
    pub arc_type: ArcType,
    /// ifname of the bound upstream shill Device; the management device
    /// has none.
    pub shill_device_ifname: Option<String>,
    /// Host-side interface: a veth end for the container, a TAP for the
    /// VM.
    pub arc_device_ifname: String,
    /// Interface name seen inside the guest.
    pub guest_device_ifname: String,
    pub bridge_ifname: String,
    pub config: ArcConfig,
}

impl ArcDevice {
    pub fn arc_ipv4_address(&self) -> std::net::Ipv4Addr {
        self.config.guest_ipv4_cidr().address()
    }

    pub fn bridge_ipv4_address(&self) -> std::net::Ipv4Addr {
        self.config.bridge_ipv4_cidr().address()
    }
}

/// Truncates `prefix + ifname` to IFNAMSIZ, best-effort preserving the
/// trailing interface number.
fn prefix_ifname(prefix: &str, ifname: &str) -> String {
    let mut name = format!("{prefix}{ifname}");
    if name.len() >= IFNAMSIZ {
        name.truncate(IFNAMSIZ - 1);
        if let Some(last) = ifname.chars().last() {
            name.pop();
            name.push(last);
        }
    }
    name
}

pub fn arc_veth_host_name(shill_device: &ShillDevice) -> String {
    prefix_ifname("veth", &shill_device.shill_device_name)
}

pub fn arc_bridge_name(shill_device: &ShillDevice) -> String {
    prefix_ifname("arc_", &shill_device.shill_device_name)
}

pub struct ArcService {
    arc_type: ArcType,
    id: Option<u32>,
    arc0_config: Option<ArcConfig>,
    arc0_device: Option<ArcDevice>,
    available_configs: HashMap<Technology, Vec<ArcConfig>>,
    /// TAP ifname -> guest ifname (eth%d), assigned at ARCVM start.
    arcvm_guest_ifnames: HashMap<String, String>,
    devices: HashMap<String, ArcDevice>,
    shill_devices: HashMap<String, ShillDevice>,
    wifi_multicast_lock_held: bool,
}

impl ArcService {
    pub fn new(arc_type: ArcType, addr_mgr: &mut AddressManager) -> ArcService {
        let mut service = ArcService {
            arc_type,
            id: None,
            arc0_config: None,
            arc0_device: None,
            available_configs: HashMap::new(),
            arcvm_guest_ifnames: HashMap::new(),
            devices: HashMap::new(),
            shill_devices: HashMap::new(),
            wifi_multicast_lock_held: false,
        };
        service.allocate_address_configs(addr_mgr);
        service
    }

    pub fn is_started(&self) -> bool {
        self.id.is_some()
    }

    fn allocate_address_configs(&mut self, addr_mgr: &mut AddressManager) {
        let arc0_subnet = addr_mgr
            .allocate_ipv4_subnet(GuestType::Arc0, ANY_SUBNET_INDEX)
            .expect("the arc0 pool is never exhausted at construction");
        // ARCVM uses fixed MAC addresses derived from stable indices.
        let arc0_mac = match self.arc_type {
            ArcType::Vm => addr_mgr.generate_mac_address(1),
            ArcType::Container => addr_mgr.generate_mac_address(ANY_SUBNET_INDEX),
        };
        self.arc0_config = Some(ArcConfig {
            mac_addr: arc0_mac,
            ipv4_subnet: arc0_subnet,
            tap_ifname: None,
        });

        // Two subnets each for Ethernet and WiFi, one for Cellular.
        let mut mac_addr_index = 2;
        for technology in [
            Technology::Ethernet,
            Technology::Ethernet,
            Technology::Wifi,
            Technology::Wifi,
            Technology::Cellular,
        ] {
            let Some(ipv4_subnet) = addr_mgr.allocate_ipv4_subnet(GuestType::ArcNet, ANY_SUBNET_INDEX)
            else {
                error!("subnet already in use or unavailable");
                continue;
            };
            let mac_addr = match self.arc_type {
                ArcType::Vm => {
                    let mac = addr_mgr.generate_mac_address(mac_addr_index);
                    mac_addr_index += 1;
                    mac
                }
                ArcType::Container => addr_mgr.generate_mac_address(ANY_SUBNET_INDEX),
            };
            self.available_configs
                .entry(technology)
                .or_default()
                .push(ArcConfig {
                    mac_addr,
                    ipv4_subnet,
                    tap_ifname: None,
                });
        }
    }

    /// ARC container restarts must come up with different MAC addresses,
    /// e.g. after an opt-out and re-opt-in.
    fn refresh_mac_addresses(&mut self, addr_mgr: &mut AddressManager) {
        if let Some(config) = &mut self.arc0_config {
            config.mac_addr = addr_mgr.generate_mac_address(ANY_SUBNET_INDEX);
        }
        for configs in self.available_configs.values_mut() {
            for config in configs {
                config.mac_addr = addr_mgr.generate_mac_address(ANY_SUBNET_INDEX);
            }
        }
    }

    /// Each technology draws from its own config set only; an exhausted
    /// set means the device is not attached rather than borrowing a
    /// subnet reserved for another technology.
    fn acquire_config(&mut self, technology: Technology) -> Option<ArcConfig> {
        let configs = self.available_configs.get_mut(&technology)?;
        if configs.is_empty() {
            return None;
        }
        Some(configs.remove(0))
    }

    fn release_config(&mut self, technology: Technology, config: ArcConfig) {
        self.available_configs
            .entry(technology)
            .or_default()
            .insert(0, config);
    }

    /// Starts the ARC datapath. `id` is the container pid or the ARCVM
    /// cid.
    pub fn start(
        &mut self,
        datapath: &Datapath,
        addr_mgr: &mut AddressManager,
        forwarding: &mut dyn ForwardingService,
        id: u32,
    ) -> Result<(), ArcServiceError> {
        if self.is_started() {
            warn!("already running - did something crash? stopping and restarting");
            let previous = self.id.expect("started");
            self.stop(datapath, forwarding, previous);
        }
        if id == 0 {
            return Err(ArcServiceError::InvalidId(id));
        }

        let arc0_device_ifname;
        match self.arc_type {
            ArcType::Vm => {
                // Provision TAP devices for all configs ahead of time.
                // Inside ARCVM the virtio-net interfaces follow the
                // pattern eth%d in TAP creation order.
                let mut arcvm_ifname_id = 0;
                let mut guest_ifnames: Vec<(String, String)> = Vec::new();
                let mut provision = |config: &mut ArcConfig| {
                    match datapath.add_tun_tap(
                        "",
                        Some(config.mac_addr),
                        None,
                        Some(CROSVM_USER),
                        DeviceMode::Tap,
                    ) {
                        Ok(tap) => {
                            guest_ifnames
                                .push((tap.clone(), format!("{ARC_VM_IFNAME_PREFIX}{arcvm_ifname_id}")));
                            arcvm_ifname_id += 1;
                            config.tap_ifname = Some(tap);
                        }
                        Err(error) => error!(%error, "failed to create TAP device"),
                    }
                };
                if let Some(config) = self.arc0_config.as_mut() {
                    provision(config);
                }
                for technology in [Technology::Ethernet, Technology::Wifi, Technology::Cellular] {
                    if let Some(configs) = self.available_configs.get_mut(&technology) {
                        for config in configs {
                            provision(config);
                        }
                    }
                }
                self.arcvm_guest_ifnames.extend(guest_ifnames);
                arc0_device_ifname = self
                    .arc0_config
                    .as_ref()
                    .and_then(|c| c.tap_ifname.clone())
                    .unwrap_or_default();
            }
            ArcType::Container => {
                let pid = id as i32;
                one_time_container_setup(datapath);
                if datapath.netns_attach_name(ARC_NETNS_NAME, pid).is_err() {
                    error!(pid, "failed to attach {ARC_NETNS_NAME} to pid");
                    return Err(ArcServiceError::NetnsAttach(ARC_NETNS_NAME.to_string(), pid));
                }
                self.refresh_mac_addresses(addr_mgr);
                arc0_device_ifname = VETH_ARC0_IFNAME.to_string();
            }
        }
        self.id = Some(id);

        // The arc0 management device is attached on demand to host VPNs,
        // so it is not bound to any shill Device.
        let arc0_device = ArcDevice {
            arc_type: self.arc_type,
            shill_device_ifname: None,
            arc_device_ifname: arc0_device_ifname,
            guest_device_ifname: ARC0_IFNAME.to_string(),
            bridge_ifname: ARCBR0_IFNAME.to_string(),
            config: self.arc0_config.take().expect("arc0 config allocated"),
        };
        info!(bridge = %arc0_device.bridge_ifname, "starting ARC management device");
        self.start_arc_device_datapath(datapath, forwarding, &arc0_device);
        self.arc0_device = Some(arc0_device);

        // Attach the already known upstream shill Devices.
        let shill_devices: Vec<ShillDevice> = self.shill_devices.values().cloned().collect();
        for shill_device in shill_devices {
            self.add_device(datapath, forwarding, &shill_device);
        }

        // Conntrack helpers are needed to process through SNAT the IPv4
        // GRE packets sent by the Android PPTP client.
        if let Err(error) = datapath.set_conntrack_helpers(true) {
            error!(%error, "failed to enable conntrack helpers");
        }
        Ok(())
    }

    pub fn stop(&mut self, datapath: &Datapath, forwarding: &mut dyn ForwardingService, id: u32) {
        if !self.is_started() {
            error!("ArcService was not running");
            return;
        }
        // The ARCVM stop message may arrive after a new VM was started;
        // only stop when the id matches the latest started one.
        if self.arc_type == ArcType::Vm && self.id != Some(id) {
            warn!(current = ?self.id, id, "mismatched ARCVM ids");
            return;
        }

        if let Err(error) = datapath.set_conntrack_helpers(false) {
            error!(%error, "failed to disable conntrack helpers");
        }

        let shill_devices: Vec<ShillDevice> = self.shill_devices.values().cloned().collect();
        for shill_device in &shill_devices {
            self.remove_device(datapath, forwarding, shill_device);
        }
        for shill_device in shill_devices {
            self.shill_devices.insert(shill_device.ifname.clone(), shill_device);
        }

        if let Some(arc0_device) = self.arc0_device.take() {
            self.stop_arc_device_datapath(datapath, forwarding, &arc0_device);
            info!(bridge = %arc0_device.bridge_ifname, "stopped ARC management device");
            self.arc0_config = Some(arc0_device.config);
        }

        match self.arc_type {
            ArcType::Vm => {
                // Destroy the pre-provisioned persistent TAP devices.
                if let Some(config) = &mut self.arc0_config {
                    if let Some(tap) = config.tap_ifname.take() {
                        datapath.remove_tun_tap(&tap, DeviceMode::Tap);
                    }
                }
                for configs in self.available_configs.values_mut() {
                    for config in configs {
                        if let Some(tap) = config.tap_ifname.take() {
                            datapath.remove_tun_tap(&tap, DeviceMode::Tap);
                        }
                    }
                }
                self.arcvm_guest_ifnames.clear();
            }
            ArcType::Container => {
                if datapath.netns_delete_name(ARC_NETNS_NAME).is_err() {
                    error!("failed to delete netns name {ARC_NETNS_NAME}");
                }
            }
        }
        self.id = None;
    }

    pub fn add_device(
        &mut self,
        datapath: &Datapath,
        forwarding: &mut dyn ForwardingService,
        shill_device: &ShillDevice,
    ) {
        self.shill_devices
            .insert(shill_device.ifname.clone(), shill_device.clone());
        if !self.is_started() || shill_device.ifname.is_empty() {
            return;
        }
        if self.devices.contains_key(&shill_device.ifname) {
            error!(%shill_device, "attempting to add already tracked shill Device");
            return;
        }

        let Some(config) = self.acquire_config(shill_device.technology) else {
            error!(%shill_device, "cannot acquire an ARC IPv4 config for shill Device");
            return;
        };

        // The interface name visible inside ARC: the container veth peer
        // reuses the shill Device name (including for Cellular
        // multiplexed interfaces, so the Android stack does not need to
        // know about multiplexing); ARCVM interfaces follow eth%d.
        let (arc_device_ifname, guest_device_ifname) = match self.arc_type {
            ArcType::Vm => {
                let Some(tap) = config.tap_ifname.clone() else {
                    error!(%shill_device, "no TAP device for shill Device");
                    self.release_config(shill_device.technology, config);
                    return;
                };
                let guest = self
                    .arcvm_guest_ifnames
                    .get(&tap)
                    .cloned()
                    .unwrap_or_else(|| shill_device.shill_device_name.clone());
                (tap, guest)
            }
            ArcType::Container => (
                arc_veth_host_name(shill_device),
                shill_device.shill_device_name.clone(),
            ),
        };

        let arc_device = ArcDevice {
            arc_type: self.arc_type,
            shill_device_ifname: Some(shill_device.ifname.clone()),
            arc_device_ifname,
            guest_device_ifname,
            bridge_ifname: arc_bridge_name(shill_device),
            config,
        };
        info!(bridge = %arc_device.bridge_ifname, %shill_device, "starting ARC device");
        self.start_arc_device_datapath(datapath, forwarding, &arc_device);
        self.devices.insert(shill_device.ifname.clone(), arc_device);
    }

    pub fn remove_device(
        &mut self,
        datapath: &Datapath,
        forwarding: &mut dyn ForwardingService,
        shill_device: &ShillDevice,
    ) {
        if self.is_started() {
            match self.devices.remove(&shill_device.ifname) {
                None => warn!(%shill_device, "unknown shill Device"),
                Some(arc_device) => {
                    info!(bridge = %arc_device.bridge_ifname, "removing ARC device");
                    self.stop_arc_device_datapath(datapath, forwarding, &arc_device);
                    // Return the config so the same MAC and addresses are
                    // reused if the upstream reappears.
                    self.release_config(shill_device.technology, arc_device.config);
                }
            }
        }
        self.shill_devices.remove(&shill_device.ifname);
    }

    fn start_arc_device_datapath(
        &self,
        datapath: &Datapath,
        forwarding: &mut dyn ForwardingService,
        arc_device: &ArcDevice,
    ) {
        // The container guest interface is created here; ARCVM TAP
        // devices were provisioned at start.
        if self.arc_type == ArcType::Container {
            let guest_cidr = arc_device.config.guest_ipv4_cidr();
            if let Err(error) = datapath.connect_veth_pair(
                ARC_NETNS_NAME,
                &arc_device.arc_device_ifname,
                &arc_device.guest_device_ifname,
                arc_device.config.mac_addr,
                guest_cidr,
                None,
                false,
            ) {
                error!(%error, bridge = %arc_device.bridge_ifname, "cannot create virtual ethernet pair");
                return;
            }
        }

        let bridge_cidr = arc_device.config.bridge_ipv4_cidr();
        if let Err(error) = datapath.add_bridge(&arc_device.bridge_ifname, bridge_cidr) {
            error!(%error, bridge = %arc_device.bridge_ifname, "failed to setup bridge");
            return;
        }
        if let Err(error) =
            datapath.add_to_bridge(&arc_device.bridge_ifname, &arc_device.arc_device_ifname)
        {
            error!(%error, bridge = %arc_device.bridge_ifname, "failed to link bridge and ARC virtual interface");
            return;
        }

        // Only devices bound to a shill Device get routing rules; arc0's
        // rules are installed when the default logical network switches
        // to a VPN.
        let Some(shill_device_ifname) = &arc_device.shill_device_ifname else {
            return;
        };
        let Some(shill_device) = self.shill_devices.get(shill_device_ifname).cloned() else {
            error!(shill_device_ifname, "failed to find shill Device");
            return;
        };

        if let Err(error) = datapath.start_routing_device(
            &shill_device,
            &arc_device.bridge_ifname,
            TrafficSource::Arc,
            false,
        ) {
            error!(%error, bridge = %arc_device.bridge_ifname, "failed to start routing");
        }
        datapath.add_inbound_ipv4_dnat(
            AutoDnatTarget::Arc,
            &shill_device,
            arc_device.arc_ipv4_address(),
        );
        if shill_device.is_adb_allowed() && !datapath.add_adb_port_access_rule(&shill_device.ifname)
        {
            error!(ifname = %shill_device.ifname, "failed to add ADB port access rule");
        }
        forwarding.start_forwarding(
            datapath,
            &shill_device,
            &arc_device.bridge_ifname,
            self.forwarding_set(shill_device.technology),
        );
    }

    fn stop_arc_device_datapath(
        &self,
        datapath: &Datapath,
        forwarding: &mut dyn ForwardingService,
        arc_device: &ArcDevice,
    ) {
        if let Some(shill_device_ifname) = &arc_device.shill_device_ifname {
            match self.shill_devices.get(shill_device_ifname).cloned() {
                None => error!(shill_device_ifname, "failed to find shill Device"),
                Some(shill_device) => {
                    forwarding.stop_forwarding(
                        datapath,
                        &shill_device,
                        &arc_device.bridge_ifname,
                        self.forwarding_set(shill_device.technology),
                    );
                    if shill_device.is_adb_allowed() {
                        datapath.delete_adb_port_access_rule(&shill_device.ifname);
                    }
                    datapath.remove_inbound_ipv4_dnat(
                        AutoDnatTarget::Arc,
                        &shill_device,
                        arc_device.arc_ipv4_address(),
                    );
                    datapath.stop_routing_device(&arc_device.bridge_ifname, TrafficSource::Arc);
                }
            }
        }
        datapath.remove_bridge(&arc_device.bridge_ifname);
        // ARCVM TAP devices are destroyed separately when ARC stops.
        if self.arc_type == ArcType::Container {
            datapath.remove_interface(&arc_device.arc_device_ifname);
        }
    }

    /// WiFi mDNS/SSDP forwarding into ARC only runs while Android holds
    /// its WiFi multicast lock.
    fn forwarding_set(&self, technology: Technology) -> ForwardingSet {
        ForwardingSet {
            ipv6: true,
            broadcast: true,
            multicast: technology != Technology::Wifi || self.wifi_multicast_lock_held,
        }
    }

    pub fn notify_android_wifi_multicast_lock_change(
        &mut self,
        datapath: &Datapath,
        forwarding: &mut dyn ForwardingService,
        held: bool,
    ) {
        if self.wifi_multicast_lock_held == held {
            return;
        }
        self.wifi_multicast_lock_held = held;
        let multicast_only = ForwardingSet {
            multicast: true,
            ..ForwardingSet::default()
        };
        for arc_device in self.devices.values() {
            let Some(ifname) = &arc_device.shill_device_ifname else {
                continue;
            };
            let Some(shill_device) = self.shill_devices.get(ifname) else {
                continue;
            };
            if shill_device.technology != Technology::Wifi {
                continue;
            }
            if held {
                forwarding.start_forwarding(
                    datapath,
                    shill_device,
                    &arc_device.bridge_ifname,
                    multicast_only,
                );
            } else {
                forwarding.stop_forwarding(
                    datapath,
                    shill_device,
                    &arc_device.bridge_ifname,
                    multicast_only,
                );
            }
        }
    }

    pub fn arc0_ipv4_address(&self) -> Option<std::net::Ipv4Addr> {
        self.arc0_device
            .as_ref()
            .map(|d| d.arc_ipv4_address())
            .or_else(|| self.arc0_config.as_ref().map(|c| c.guest_ipv4_cidr().address()))
    }

    /// TAP interface names provisioned for ARCVM, in guest eth%d order.
    pub fn tap_ifnames(&self) -> Vec<String> {
        let mut taps: Vec<(&String, &String)> = self.arcvm_guest_ifnames.iter().collect();
        taps.sort_by(|a, b| a.1.cmp(b.1));
        taps.into_iter().map(|(tap, _)| tap.clone()).collect()
    }

    pub fn devices(&self) -> impl Iterator<Item = &ArcDevice> {
        self.devices.values().chain(self.arc0_device.iter())
    }

    pub fn get_device(&self, shill_ifname: &str) -> Option<&ArcDevice> {
        self.devices.get(shill_ifname)
    }
}

fn one_time_container_setup(datapath: &Datapath) {
    if let Err(error) = datapath.modprobe_all(ANDROID_REQUIRED_MODULES) {
        error!(%error, "one or more required kernel modules failed to load, some Android functionality may be broken");
    }
    if let Err(error) = datapath.modprobe_all(ANDROID_OPTIONAL_MODULES) {
        warn!(%error, "one or more optional kernel modules failed to load");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::Table;
    use crate::mocks::{FakeProcessRunner, FakeSystem, RecordingForwarding, fake_shill_device};
    use crate::process::ProcessRunner;
    use crate::system::System;
    use std::path::PathBuf;
    use std::rc::Rc;

    struct Fixture {
        runner: Rc<FakeProcessRunner>,
        system: Rc<FakeSystem>,
        datapath: Datapath,
        addr_mgr: AddressManager,
        forwarding: RecordingForwarding,
    }

    impl Fixture {
        fn new() -> Fixture {
            let runner = Rc::new(FakeProcessRunner::with_static_chains());
            let system = Rc::new(FakeSystem::new());
            let datapath = Datapath::with_scripts(
                Rc::clone(&runner) as Rc<dyn ProcessRunner>,
                Rc::clone(&system) as Rc<dyn System>,
                PathBuf::from("/tmp/iptables.start"),
                PathBuf::from("/tmp/ip6tables.start"),
            );
            Fixture {
                runner,
                system,
                datapath,
                addr_mgr: AddressManager::new(),
                forwarding: RecordingForwarding::default(),
            }
        }
    }

    #[test]
    fn container_startup_with_ethernet_upstream() {
        let mut fx = Fixture::new();
        fx.system.set_ifindex("eth0", 2);
        let mut service = ArcService::new(ArcType::Container, &mut fx.addr_mgr);

        let eth0 = fake_shill_device("eth0", Technology::Ethernet);
        service.add_device(&fx.datapath, &mut fx.forwarding, &eth0);

        service
            .start(&fx.datapath, &mut fx.addr_mgr, &mut fx.forwarding, 12345)
            .unwrap();

        // Management bridge and the eth0 bridge exist.
        assert_eq!(fx.system.bridges(), vec!["arcbr0".to_string(), "arc_eth0".to_string()]);
        // arcbr0 gets 100.115.92.1/30, arc_eth0 gets 100.115.92.5/30.
        let ip_calls = fx.runner.ip_calls();
        assert!(ip_calls.contains(&"ip addr add 100.115.92.1/30 brd 100.115.92.3 dev arcbr0".to_string()));
        assert!(ip_calls.contains(&"ip addr add 100.115.92.5/30 brd 100.115.92.7 dev arc_eth0".to_string()));
        // The veth pair crosses into the ARC netns with the shill Device
        // name on the guest side.
        assert!(
            ip_calls
                .iter()
                .any(|c| c.starts_with("ip link add vetheth0 type veth peer name eth0 netns arc_netns"))
        );
        // Auto-DNAT into the ARC address of the eth0 device.
        assert_eq!(
            fx.runner.rules(false, Table::Nat, "apply_auto_dnat_to_arc"),
            vec![
                "-i eth0 -m socket --nowildcard -j ACCEPT".to_string(),
                "-i eth0 -p tcp -j DNAT --to-destination 100.115.92.6".to_string(),
                "-i eth0 -p udp -j DNAT --to-destination 100.115.92.6".to_string(),
            ]
        );
        // Routing chain for the bridge.
        assert!(fx.runner.has_chain(false, Table::Mangle, "PREROUTING_arc_eth0"));
        // ADB port access on an Ethernet upstream.
        assert!(
            fx.runner
                .rules(false, Table::Filter, "ingress_port_firewall")
                .contains(&"-i eth0 -p tcp --dport 5550 -j ACCEPT".to_string())
        );

        service.stop(&fx.datapath, &mut fx.forwarding, 12345);
        assert!(fx.system.bridges().is_empty());
        assert!(fx.runner.netns_names().is_empty());
        assert!(!fx.runner.has_chain(false, Table::Mangle, "PREROUTING_arc_eth0"));
    }

    #[test]
    fn arcvm_startup_provisions_taps() {
        let mut fx = Fixture::new();
        let mut service = ArcService::new(ArcType::Vm, &mut fx.addr_mgr);
        service
            .start(&fx.datapath, &mut fx.addr_mgr, &mut fx.forwarding, 42)
            .unwrap();

        // One TAP per config: arc0 + 2 Ethernet + 2 WiFi + 1 Cellular.
        assert_eq!(fx.system.tap_names().len(), 6);
        assert_eq!(service.tap_ifnames().len(), 6);
        // The management device is bridged onto its TAP.
        assert!(
            fx.system
                .bridge_members()
                .contains(&("arcbr0".to_string(), "vmtap0".to_string()))
        );
        assert_eq!(service.arc0_ipv4_address(), Some("100.115.92.2".parse().unwrap()));

        service.stop(&fx.datapath, &mut fx.forwarding, 42);
        assert!(service.tap_ifnames().is_empty());
    }

    #[test]
    fn arcvm_stop_ignores_mismatched_id() {
        let mut fx = Fixture::new();
        let mut service = ArcService::new(ArcType::Vm, &mut fx.addr_mgr);
        service
            .start(&fx.datapath, &mut fx.addr_mgr, &mut fx.forwarding, 42)
            .unwrap();
        service.stop(&fx.datapath, &mut fx.forwarding, 41);
        assert!(service.is_started());
        service.stop(&fx.datapath, &mut fx.forwarding, 42);
        assert!(!service.is_started());
    }

    #[test]
    fn removed_device_reuses_config_on_return() {
        let mut fx = Fixture::new();
        fx.system.set_ifindex("wlan0", 3);
        let mut service = ArcService::new(ArcType::Container, &mut fx.addr_mgr);
        service
            .start(&fx.datapath, &mut fx.addr_mgr, &mut fx.forwarding, 100)
            .unwrap();

        let wlan0 = fake_shill_device("wlan0", Technology::Wifi);
        service.add_device(&fx.datapath, &mut fx.forwarding, &wlan0);
        let first_addr = service.get_device("wlan0").unwrap().arc_ipv4_address();
        let first_mac = service.get_device("wlan0").unwrap().config.mac_addr;

        service.remove_device(&fx.datapath, &mut fx.forwarding, &wlan0);
        assert!(service.get_device("wlan0").is_none());

        service.add_device(&fx.datapath, &mut fx.forwarding, &wlan0);
        assert_eq!(service.get_device("wlan0").unwrap().arc_ipv4_address(), first_addr);
        assert_eq!(service.get_device("wlan0").unwrap().config.mac_addr, first_mac);
    }

    #[test]
    fn exhausted_technology_pool_does_not_borrow_from_others() {
        let mut fx = Fixture::new();
        for (ifname, ifindex) in [("eth0", 2), ("eth1", 3), ("eth2", 4), ("wlan0", 5)] {
            fx.system.set_ifindex(ifname, ifindex);
        }
        let mut service = ArcService::new(ArcType::Container, &mut fx.addr_mgr);
        service
            .start(&fx.datapath, &mut fx.addr_mgr, &mut fx.forwarding, 100)
            .unwrap();

        // Two Ethernet configs exist; the third Ethernet upstream cannot
        // be attached.
        for ifname in ["eth0", "eth1", "eth2"] {
            let device = fake_shill_device(ifname, Technology::Ethernet);
            service.add_device(&fx.datapath, &mut fx.forwarding, &device);
        }
        assert!(service.get_device("eth0").is_some());
        assert!(service.get_device("eth1").is_some());
        assert!(service.get_device("eth2").is_none());

        // The WiFi configs were not raided for it.
        let wlan0 = fake_shill_device("wlan0", Technology::Wifi);
        service.add_device(&fx.datapath, &mut fx.forwarding, &wlan0);
        assert!(service.get_device("wlan0").is_some());
    }

    #[test]
    fn wifi_multicast_follows_android_lock() {
        let mut fx = Fixture::new();
        fx.system.set_ifindex("wlan0", 3);
        let mut service = ArcService::new(ArcType::Container, &mut fx.addr_mgr);
        service
            .start(&fx.datapath, &mut fx.addr_mgr, &mut fx.forwarding, 100)
            .unwrap();
        let wlan0 = fake_shill_device("wlan0", Technology::Wifi);
        service.add_device(&fx.datapath, &mut fx.forwarding, &wlan0);

        // Without the lock, WiFi multicast forwarding is off.
        let start_set = match fx.forwarding.events.last().unwrap() {
            crate::mocks::ForwardingEvent::Start(_, _, set) => *set,
            _ => panic!("expected a start event"),
        };
        assert!(!start_set.multicast);
        assert!(start_set.ipv6);

        service.notify_android_wifi_multicast_lock_change(&fx.datapath, &mut fx.forwarding, true);
        let lock_set = match fx.forwarding.events.last().unwrap() {
            crate::mocks::ForwardingEvent::Start(_, _, set) => *set,
            _ => panic!("expected a start event"),
        };
        assert!(lock_set.multicast);
        assert!(!lock_set.ipv6);
    }
}
