//! Lifecycle of the crosvm guest datapaths: Termina VMs (and their LXD
//! containers), Parallels, Bruschetta and Borealis VMs.
//!
//! Each VM gets a TAP device owned by crosvm, addressed out of the VM
//! pools. Termina additionally gets a /28 for the LXD container inside
//! the VM, reachable through a host route via the VM address. Parallels
//! VMs opt into inbound auto-DNAT; Bruschetta and Borealis do not.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::address_manager::{AddressManager, GuestType};
use crate::datapath::{AutoDnatTarget, Datapath, DatapathError};
use crate::forwarding::{ForwardingService, ForwardingSet};
use crate::fwmark::TrafficSource;
use crate::mac::MacAddress;
use crate::shill::ShillDevice;
use crate::subnet::{ANY_SUBNET_INDEX, Subnet};
use crate::system::DeviceMode;

const CROSVM_USER: &str = "crosvm";
/// Offset of the LXD container address inside the container subnet.
const TERMINA_CONTAINER_ADDRESS_OFFSET: u32 = 1;

#[derive(Debug, Error)]
pub enum CrostiniServiceError {
    #[error("invalid VM id {0}")]
    InvalidId(u64),
    #[error("datapath already started for VM {0}")]
    AlreadyStarted(u64),
    #[error("no subnet available for VM {0}")]
    SubnetExhausted(u64),
    #[error(transparent)]
    Datapath(#[from] DatapathError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmType {
    Termina,
    Parallels,
    Bruschetta,
    Borealis,
}

impl VmType {
    fn address_managing_type(self) -> GuestType {
        match self {
            // Bruschetta and Borealis draw from the same VM range as
            // Termina.
            VmType::Termina | VmType::Bruschetta | VmType::Borealis => GuestType::TerminaVm,
            VmType::Parallels => GuestType::ParallelsVm,
        }
    }

    pub fn traffic_source(self) -> TrafficSource {
        match self {
            VmType::Termina => TrafficSource::CrostiniVm,
            VmType::Parallels => TrafficSource::ParallelsVm,
            VmType::Bruschetta => TrafficSource::BruschettaVm,
            VmType::Borealis => TrafficSource::BorealisVm,
        }
    }

    fn auto_dnat_target(self) -> Option<AutoDnatTarget> {
        match self {
            VmType::Termina => Some(AutoDnatTarget::Crostini),
            VmType::Parallels => Some(AutoDnatTarget::Parallels),
            // No inbound auto-DNAT into Bruschetta or Borealis.
            VmType::Bruschetta | VmType::Borealis => None,
        }
    }
}

impl std::fmt::Display for VmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmType::Termina => write!(f, "Termina"),
            VmType::Parallels => write!(f, "Parallels"),
            VmType::Bruschetta => write!(f, "Bruschetta"),
            VmType::Borealis => write!(f, "Borealis"),
        }
    }
}

/// The host-side view of one running crosvm guest.
pub struct CrostiniDevice {
    pub vm_type: VmType,
    pub tap_device_ifname: String,
    pub mac_address: MacAddress,
    pub vm_ipv4_subnet: Subnet,
    pub lxd_ipv4_subnet: Option<Subnet>,
}

impl CrostiniDevice {
    /// Host-side gateway address of the VM subnet.
    pub fn gateway_ipv4_address(&self) -> Ipv4Addr {
        self.vm_ipv4_subnet
            .cidr_at_offset(1)
            .expect("offset 1 is valid")
            .address()
    }

    pub fn vm_ipv4_address(&self) -> Ipv4Addr {
        self.vm_ipv4_subnet
            .cidr_at_offset(2)
            .expect("offset 2 is valid")
            .address()
    }

    pub fn lxd_ipv4_address(&self) -> Option<Ipv4Addr> {
        self.lxd_ipv4_subnet
            .as_ref()
            .and_then(|s| s.cidr_at_offset(TERMINA_CONTAINER_ADDRESS_OFFSET))
            .map(|cidr| cidr.address())
    }
}

pub struct CrostiniService {
    devices: HashMap<u64, CrostiniDevice>,
    default_logical_device: Option<ShillDevice>,
    adb_sideloading_enabled: bool,
}

impl Default for CrostiniService {
    fn default() -> CrostiniService {
        CrostiniService::new()
    }
}

impl CrostiniService {
    pub fn new() -> CrostiniService {
        CrostiniService {
            devices: HashMap::new(),
            default_logical_device: None,
            adb_sideloading_enabled: false,
        }
    }

    pub fn set_adb_sideloading_enabled(&mut self, enabled: bool) {
        self.adb_sideloading_enabled = enabled;
    }

    /// Starts the datapath of one VM and returns its device view.
    pub fn start(
        &mut self,
        datapath: &Datapath,
        addr_mgr: &mut AddressManager,
        forwarding: &mut dyn ForwardingService,
        vm_id: u64,
        vm_type: VmType,
        subnet_index: u32,
    ) -> Result<&CrostiniDevice, CrostiniServiceError> {
        if vm_id == 0 {
            return Err(CrostiniServiceError::InvalidId(vm_id));
        }
        if self.devices.contains_key(&vm_id) {
            warn!(vm_id, %vm_type, "datapath already started");
            return Err(CrostiniServiceError::AlreadyStarted(vm_id));
        }

        let device = self.add_tap(datapath, addr_mgr, vm_type, subnet_index)
            .ok_or(CrostiniServiceError::SubnetExhausted(vm_id))?;

        datapath.start_routing_device_as_user(
            &device.tap_device_ifname,
            vm_type.traffic_source(),
            device.vm_ipv4_address(),
            None,
            None,
            None,
        );
        if let Some(default_device) = self.default_logical_device.clone() {
            forwarding.start_forwarding(
                datapath,
                &default_device,
                &device.tap_device_ifname,
                ForwardingSet::all(),
            );
        }
        if self.adb_sideloading_enabled {
            self.start_adb_port_forwarding(datapath, &device.tap_device_ifname);
        }
        if vm_type == VmType::Parallels {
            self.start_auto_dnat(datapath, &device);
        }

        info!(vm_id, %vm_type, tap = %device.tap_device_ifname, "Crostini network service started");
        Ok(self.devices.entry(vm_id).or_insert(device))
    }

    pub fn stop(&mut self, datapath: &Datapath, forwarding: &mut dyn ForwardingService, vm_id: u64) {
        let Some(device) = self.devices.remove(&vm_id) else {
            warn!(vm_id, "unknown VM");
            return;
        };
        let vm_type = device.vm_type;
        let tap_ifname = device.tap_device_ifname.clone();

        if let Some(default_device) = self.default_logical_device.clone() {
            forwarding.stop_forwarding(datapath, &default_device, &tap_ifname, ForwardingSet::all());
        }
        datapath.stop_routing_device(&tap_ifname, vm_type.traffic_source());
        if self.adb_sideloading_enabled {
            self.stop_adb_port_forwarding(datapath, &tap_ifname);
        }
        if vm_type == VmType::Parallels {
            self.stop_auto_dnat(datapath, &device);
        }
        if let Some(lxd_subnet) = &device.lxd_ipv4_subnet {
            let lxd_route = lxd_subnet.base_cidr().network().to_string();
            datapath.delete_ipv4_route(device.vm_ipv4_address(), &lxd_route);
        }
        // Dropping the device releases the VM and LXD subnets back to
        // their pools.
        datapath.remove_interface(&tap_ifname);
        info!(vm_id, %vm_type, tap = %tap_ifname, "Crostini network service stopped");
    }

    fn add_tap(
        &self,
        datapath: &Datapath,
        addr_mgr: &mut AddressManager,
        vm_type: VmType,
        subnet_index: u32,
    ) -> Option<CrostiniDevice> {
        let ipv4_subnet =
            addr_mgr.allocate_ipv4_subnet(vm_type.address_managing_type(), subnet_index)?;
        let gateway_ipv4_cidr = ipv4_subnet.cidr_at_offset(1)?;
        ipv4_subnet.cidr_at_offset(2)?;

        let lxd_subnet = if vm_type == VmType::Termina {
            let lxd = addr_mgr.allocate_ipv4_subnet(GuestType::LxdContainer, ANY_SUBNET_INDEX);
            match lxd {
                None => {
                    error!("LXD subnet already in use or unavailable");
                    return None;
                }
                Some(lxd) => {
                    lxd.cidr_at_offset(TERMINA_CONTAINER_ADDRESS_OFFSET)?;
                    Some(lxd)
                }
            }
        } else {
            None
        };

        let mac_address = addr_mgr.generate_mac_address(subnet_index);
        let tap = match datapath.add_tun_tap(
            "",
            Some(mac_address),
            Some(gateway_ipv4_cidr),
            Some(CROSVM_USER),
            DeviceMode::Tap,
        ) {
            Ok(tap) => tap,
            Err(error) => {
                error!(%error, "failed to create TAP device");
                return None;
            }
        };

        let device = CrostiniDevice {
            vm_type,
            tap_device_ifname: tap,
            mac_address,
            vm_ipv4_subnet: ipv4_subnet,
            lxd_ipv4_subnet: lxd_subnet,
        };

        if let Some(lxd_subnet) = &device.lxd_ipv4_subnet {
            // Route to the LXD container subnet using the VM as gateway.
            let lxd_route = lxd_subnet.base_cidr().network().to_string();
            if let Err(error) = datapath.add_ipv4_route(device.vm_ipv4_address(), &lxd_route) {
                error!(%error, "failed to setup route to the Termina LXD container");
                datapath.remove_interface(&device.tap_device_ifname);
                return None;
            }
        }
        Some(device)
    }

    fn start_adb_port_forwarding(&self, datapath: &Datapath, ifname: &str) {
        if !datapath.add_adb_port_forward_rule(ifname) {
            error!(ifname, "error adding ADB port forwarding rule");
            return;
        }
        if !datapath.add_adb_port_access_rule(ifname) {
            error!(ifname, "error adding ADB port access rule");
        }
        // The DNAT target is the adb-proxy listener on localhost.
        if let Err(error) = datapath.set_route_localnet(ifname, true) {
            error!(%error, ifname, "failed to set route_localnet");
        }
    }

    fn stop_adb_port_forwarding(&self, datapath: &Datapath, ifname: &str) {
        datapath.delete_adb_port_forward_rule(ifname);
        datapath.delete_adb_port_access_rule(ifname);
        if let Err(error) = datapath.set_route_localnet(ifname, false) {
            error!(%error, ifname, "failed to clear route_localnet");
        }
    }

    fn start_auto_dnat(&self, datapath: &Datapath, device: &CrostiniDevice) {
        let Some(target) = device.vm_type.auto_dnat_target() else {
            return;
        };
        if let Some(default_device) = &self.default_logical_device {
            datapath.add_inbound_ipv4_dnat(target, default_device, device.vm_ipv4_address());
        }
    }

    fn stop_auto_dnat(&self, datapath: &Datapath, device: &CrostiniDevice) {
        let Some(target) = device.vm_type.auto_dnat_target() else {
            return;
        };
        if let Some(default_device) = &self.default_logical_device {
            datapath.remove_inbound_ipv4_dnat(target, default_device, device.vm_ipv4_address());
        }
    }

    /// Re-points forwarding and Parallels auto-DNAT at the new default
    /// logical network.
    pub fn on_shill_default_logical_device_changed(
        &mut self,
        datapath: &Datapath,
        forwarding: &mut dyn ForwardingService,
        new_device: Option<&ShillDevice>,
    ) {
        let previous = self.default_logical_device.take();
        for device in self.devices.values() {
            if let Some(previous) = &previous {
                forwarding.stop_forwarding(
                    datapath,
                    previous,
                    &device.tap_device_ifname,
                    ForwardingSet::all(),
                );
                if device.vm_type == VmType::Parallels {
                    if let Some(target) = device.vm_type.auto_dnat_target() {
                        datapath.remove_inbound_ipv4_dnat(target, previous, device.vm_ipv4_address());
                    }
                }
            }
            if let Some(new_device) = new_device {
                forwarding.start_forwarding(
                    datapath,
                    new_device,
                    &device.tap_device_ifname,
                    ForwardingSet::all(),
                );
                if device.vm_type == VmType::Parallels {
                    if let Some(target) = device.vm_type.auto_dnat_target() {
                        datapath.add_inbound_ipv4_dnat(target, new_device, device.vm_ipv4_address());
                    }
                }
            }
        }
        self.default_logical_device = new_device.cloned();
    }

    pub fn get_device(&self, vm_id: u64) -> Option<&CrostiniDevice> {
        self.devices.get(&vm_id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &CrostiniDevice> {
        self.devices.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::Table;
    use crate::mocks::{FakeProcessRunner, FakeSystem, RecordingForwarding, fake_shill_device};
    use crate::process::ProcessRunner;
    use crate::shill::Technology;
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
    fn termina_start_allocates_vm_and_lxd_subnets() {
        let mut fx = Fixture::new();
        let mut service = CrostiniService::new();

        let device = service
            .start(
                &fx.datapath,
                &mut fx.addr_mgr,
                &mut fx.forwarding,
                1,
                VmType::Termina,
                ANY_SUBNET_INDEX,
            )
            .unwrap();
        assert_eq!(device.gateway_ipv4_address(), "100.115.92.25".parse::<Ipv4Addr>().unwrap());
        assert_eq!(device.vm_ipv4_address(), "100.115.92.26".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            device.lxd_ipv4_address(),
            Some("100.115.92.193".parse::<Ipv4Addr>().unwrap())
        );
        let tap = device.tap_device_ifname.clone();
        assert_eq!(tap, "vmtap0");

        // Host route to the LXD container through the VM address.
        assert!(
            fx.runner
                .ip_calls()
                .contains(&"ip route add 100.115.92.192/28 via 100.115.92.26".to_string())
        );
        // The TAP is routed as a user device.
        assert!(fx.runner.has_chain(false, Table::Mangle, "PREROUTING_vmtap0"));

        service.stop(&fx.datapath, &mut fx.forwarding, 1);
        assert!(service.get_device(1).is_none());
        assert!(!fx.runner.has_chain(false, Table::Mangle, "PREROUTING_vmtap0"));
        // The subnets were released: a new Termina start reuses them.
        let device = service
            .start(
                &fx.datapath,
                &mut fx.addr_mgr,
                &mut fx.forwarding,
                2,
                VmType::Termina,
                ANY_SUBNET_INDEX,
            )
            .unwrap();
        assert_eq!(device.vm_ipv4_address(), "100.115.92.26".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn parallels_auto_dnat_follows_default_device() {
        let mut fx = Fixture::new();
        fx.system.set_ifindex("eth0", 2);
        let mut service = CrostiniService::new();
        let eth0 = fake_shill_device("eth0", Technology::Ethernet);
        service.on_shill_default_logical_device_changed(
            &fx.datapath,
            &mut fx.forwarding,
            Some(&eth0),
        );

        service
            .start(
                &fx.datapath,
                &mut fx.addr_mgr,
                &mut fx.forwarding,
                7,
                VmType::Parallels,
                1,
            )
            .unwrap();
        let rules = fx.runner.rules(false, Table::Nat, "apply_auto_dnat_to_parallels");
        assert_eq!(rules.len(), 3);
        assert!(rules[1].contains("--to-destination 100.115.93.2"));

        service.stop(&fx.datapath, &mut fx.forwarding, 7);
        assert!(
            fx.runner
                .rules(false, Table::Nat, "apply_auto_dnat_to_parallels")
                .is_empty()
        );
    }

    #[test]
    fn bruschetta_gets_isolated_guest_rules() {
        let mut fx = Fixture::new();
        let mut service = CrostiniService::new();
        service
            .start(
                &fx.datapath,
                &mut fx.addr_mgr,
                &mut fx.forwarding,
                3,
                VmType::Bruschetta,
                ANY_SUBNET_INDEX,
            )
            .unwrap();
        assert_eq!(
            fx.runner.rules(false, Table::Filter, "drop_forward_to_bruschetta"),
            vec!["-o vmtap0 -j DROP".to_string()]
        );
        assert_eq!(
            fx.runner.rules(false, Table::Filter, "drop_output_to_bruschetta"),
            vec!["-m state --state NEW -o vmtap0 -j DROP".to_string()]
        );
        service.stop(&fx.datapath, &mut fx.forwarding, 3);
        assert!(
            fx.runner
                .rules(false, Table::Filter, "drop_forward_to_bruschetta")
                .is_empty()
        );
    }

    #[test]
    fn duplicate_start_is_rejected() {
        let mut fx = Fixture::new();
        let mut service = CrostiniService::new();
        service
            .start(
                &fx.datapath,
                &mut fx.addr_mgr,
                &mut fx.forwarding,
                1,
                VmType::Borealis,
                ANY_SUBNET_INDEX,
            )
            .unwrap();
        assert!(matches!(
            service.start(
                &fx.datapath,
                &mut fx.addr_mgr,
                &mut fx.forwarding,
                1,
                VmType::Borealis,
                ANY_SUBNET_INDEX,
            ),
            Err(CrostiniServiceError::AlreadyStarted(1))
        ));
    }
}
