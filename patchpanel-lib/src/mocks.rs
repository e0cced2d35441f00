#![cfg(test)]
//! Stateful fakes for the process-runner and syscall seams.
//!
//! The fakes track actual state (which chains exist and which rules they
//! hold, which bridges and taps were created) rather than just verifying
//! call sequences. Tests assert on the system's _state_ after a
//! lifecycle operation, not on which calls happened.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use cidr::Ipv4Inet;

use crate::forwarding::{ForwardingService, ForwardingSet, MulticastControl, NdProxyControl};
use crate::iptables::{Command, Table};
use crate::mac::MacAddress;
use crate::process::{ProcessError, ProcessRunner};
use crate::shill::{ShillDevice, Technology};
use crate::system::{DeviceMode, SysNet, System, SystemError};

pub fn fake_shill_device(ifname: &str, technology: Technology) -> ShillDevice {
    ShillDevice {
        ifname: ifname.to_string(),
        shill_device_name: ifname.to_string(),
        technology,
        ipv4_dns_addresses: vec![],
        ipv6_prefix: None,
    }
}

// ============================================================================
// FakeProcessRunner
// ============================================================================

#[derive(Default)]
pub struct RunnerState {
    /// (ipv6, table, chain) -> ordered rules.
    pub chains: HashMap<(bool, Table, String), Vec<String>>,
    pub ip_calls: Vec<String>,
    pub netns: Vec<String>,
    pub netns_exec_calls: Vec<String>,
    pub restored_scripts: Vec<PathBuf>,
    pub batch_depth: u32,
    pub batch_acquisitions: u32,
    /// Prefix of the rendered command -> error message.
    pub fail_on: HashMap<String, String>,
}

impl RunnerState {
    fn check_fail(&self, rendered: &str) -> Result<(), ProcessError> {
        for (prefix, msg) in &self.fail_on {
            if rendered.starts_with(prefix.as_str()) {
                return Err(ProcessError::CommandFailed(msg.clone()));
            }
        }
        Ok(())
    }
}

pub struct FakeProcessRunner {
    pub state: Rc<RefCell<RunnerState>>,
}

const BUILTIN_CHAINS: &[(Table, &str)] = &[
    (Table::Filter, "INPUT"),
    (Table::Filter, "FORWARD"),
    (Table::Filter, "OUTPUT"),
    (Table::Mangle, "PREROUTING"),
    (Table::Mangle, "INPUT"),
    (Table::Mangle, "FORWARD"),
    (Table::Mangle, "OUTPUT"),
    (Table::Mangle, "POSTROUTING"),
    (Table::Nat, "PREROUTING"),
    (Table::Nat, "INPUT"),
    (Table::Nat, "OUTPUT"),
    (Table::Nat, "POSTROUTING"),
];

// The chains the on-disk restore scripts create at daemon start.
const STATIC_CHAINS: &[(Table, &str)] = &[
    (Table::Mangle, "apply_vpn_mark"),
    (Table::Mangle, "skip_apply_vpn_mark"),
    (Table::Mangle, "qos_detect"),
    (Table::Mangle, "qos_detect_static"),
    (Table::Mangle, "qos_detect_doh"),
    (Table::Mangle, "qos_detect_borealis"),
    (Table::Mangle, "qos_apply_dscp"),
    (Table::Filter, "vpn_accept"),
    (Table::Filter, "vpn_lockdown"),
    (Table::Filter, "accept_egress_to_dns_proxy"),
    (Table::Filter, "drop_guest_ipv4_prefix"),
    (Table::Filter, "enforce_ipv6_src_prefix"),
    (Table::Filter, "forward_tethering"),
    (Table::Filter, "egress_tethering"),
    (Table::Filter, "ingress_tethering"),
    (Table::Filter, "forward_localonly"),
    (Table::Filter, "egress_localonly"),
    (Table::Filter, "ingress_localonly"),
    (Table::Filter, "ingress_downstream_network"),
    (Table::Filter, "drop_output_to_bruschetta"),
    (Table::Filter, "drop_forward_to_bruschetta"),
    (Table::Filter, "ingress_port_firewall"),
    (Table::Filter, "egress_port_firewall"),
    (Table::Nat, "apply_auto_dnat_to_arc"),
    (Table::Nat, "apply_auto_dnat_to_crostini"),
    (Table::Nat, "apply_auto_dnat_to_parallels"),
    (Table::Nat, "redirect_default_dns"),
    (Table::Nat, "redirect_user_dns"),
    (Table::Nat, "snat_user_dns"),
    (Table::Nat, "redirect_dns"),
    (Table::Nat, "ingress_port_forwarding"),
];

fn join(args: &[&str]) -> String {
    args.iter()
        .filter(|a| **a != "-w")
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}

impl FakeProcessRunner {
    pub fn new() -> FakeProcessRunner {
        let mut chains = HashMap::new();
        for ipv6 in [false, true] {
            for (table, chain) in BUILTIN_CHAINS {
                chains.insert((ipv6, *table, chain.to_string()), Vec::new());
            }
        }
        FakeProcessRunner {
            state: Rc::new(RefCell::new(RunnerState {
                chains,
                ..RunnerState::default()
            })),
        }
    }

    /// A runner whose chain state matches a freshly sourced pair of
    /// restore scripts: every static chain exists and is empty.
    pub fn with_static_chains() -> FakeProcessRunner {
        let runner = FakeProcessRunner::new();
        {
            let mut state = runner.state.borrow_mut();
            for ipv6 in [false, true] {
                for (table, chain) in STATIC_CHAINS {
                    state
                        .chains
                        .insert((ipv6, *table, chain.to_string()), Vec::new());
                }
            }
        }
        runner
    }

    pub fn fail_on(&self, command_prefix: &str, message: &str) {
        self.state
            .borrow_mut()
            .fail_on
            .insert(command_prefix.to_string(), message.to_string());
    }

    pub fn rules(&self, ipv6: bool, table: Table, chain: &str) -> Vec<String> {
        self.state
            .borrow()
            .chains
            .get(&(ipv6, table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_chain(&self, ipv6: bool, table: Table, chain: &str) -> bool {
        self.state
            .borrow()
            .chains
            .contains_key(&(ipv6, table, chain.to_string()))
    }

    /// Ordered snapshot of the full chain state, for before/after
    /// symmetry assertions.
    pub fn snapshot(&self) -> Vec<(String, Vec<String>)> {
        let state = self.state.borrow();
        let mut entries: Vec<(String, Vec<String>)> = state
            .chains
            .iter()
            .map(|((ipv6, table, chain), rules)| {
                let family = if *ipv6 { "v6" } else { "v4" };
                (format!("{family}/{table}/{chain}"), rules.clone())
            })
            .collect();
        entries.sort();
        entries
    }

    pub fn ip_calls(&self) -> Vec<String> {
        self.state.borrow().ip_calls.clone()
    }

    pub fn netns_names(&self) -> Vec<String> {
        self.state.borrow().netns.clone()
    }

    pub fn netns_exec_calls(&self) -> Vec<String> {
        self.state.borrow().netns_exec_calls.clone()
    }

    fn record_ip(&self, rendered: String) -> Result<(), ProcessError> {
        let mut state = self.state.borrow_mut();
        state.check_fail(&rendered)?;
        state.ip_calls.push(rendered);
        Ok(())
    }

    fn apply_xtables(
        &self,
        ipv6: bool,
        table: Table,
        command: Command,
        chain: &str,
        args: &[&str],
    ) -> Result<(), ProcessError> {
        let program = if ipv6 { "ip6tables" } else { "iptables" };
        let rendered = format!("{program} {table} {} {chain} {}", command.flag(), join(args));
        let mut state = self.state.borrow_mut();
        state.check_fail(&rendered)?;

        let key = (ipv6, table, chain.to_string());
        let rule = join(args);
        match command {
            Command::NewChain => {
                if state.chains.contains_key(&key) {
                    return Err(ProcessError::CommandFailed(format!(
                        "{program}: chain {chain} already exists"
                    )));
                }
                state.chains.insert(key, Vec::new());
            }
            Command::DeleteChain => {
                match state.chains.get(&key) {
                    None => {
                        return Err(ProcessError::CommandFailed(format!(
                            "{program}: no chain {chain}"
                        )));
                    }
                    Some(rules) if !rules.is_empty() => {
                        return Err(ProcessError::CommandFailed(format!(
                            "{program}: chain {chain} not empty"
                        )));
                    }
                    Some(_) => {
                        state.chains.remove(&key);
                    }
                }
            }
            Command::Flush => {
                state
                    .chains
                    .get_mut(&key)
                    .ok_or_else(|| {
                        ProcessError::CommandFailed(format!("{program}: no chain {chain}"))
                    })?
                    .clear();
            }
            Command::Append => {
                state
                    .chains
                    .get_mut(&key)
                    .ok_or_else(|| {
                        ProcessError::CommandFailed(format!("{program}: no chain {chain}"))
                    })?
                    .push(rule);
            }
            Command::Insert => {
                state
                    .chains
                    .get_mut(&key)
                    .ok_or_else(|| {
                        ProcessError::CommandFailed(format!("{program}: no chain {chain}"))
                    })?
                    .insert(0, rule);
            }
            Command::Delete => {
                let rules = state.chains.get_mut(&key).ok_or_else(|| {
                    ProcessError::CommandFailed(format!("{program}: no chain {chain}"))
                })?;
                let index = rules.iter().position(|r| *r == rule).ok_or_else(|| {
                    ProcessError::CommandFailed(format!("{program}: rule not found in {chain}"))
                })?;
                rules.remove(index);
            }
            Command::Check => {
                let rules = state.chains.get(&key).ok_or_else(|| {
                    ProcessError::CommandFailed(format!("{program}: no chain {chain}"))
                })?;
                // A bare `-C <chain>` only probes for chain existence.
                if !rule.is_empty() && !rules.contains(&rule) {
                    return Err(ProcessError::CommandFailed(format!(
                        "{program}: rule not found in {chain}"
                    )));
                }
            }
            Command::List => {}
        }
        Ok(())
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn ip(
        &self,
        object: &str,
        action: &str,
        args: &[&str],
        _log_failures: bool,
    ) -> Result<(), ProcessError> {
        self.record_ip(format!("ip {object} {action} {}", args.join(" ")))
    }

    fn ip6(
        &self,
        object: &str,
        action: &str,
        args: &[&str],
        _log_failures: bool,
    ) -> Result<(), ProcessError> {
        self.record_ip(format!("ip -6 {object} {action} {}", args.join(" ")))
    }

    fn ip_in_netns(
        &self,
        netns: &str,
        object: &str,
        action: &str,
        args: &[&str],
    ) -> Result<(), ProcessError> {
        self.record_ip(format!(
            "ip -netns {netns} {object} {action} {}",
            args.join(" ")
        ))
    }

    fn ip6_in_netns(
        &self,
        netns: &str,
        object: &str,
        action: &str,
        args: &[&str],
    ) -> Result<(), ProcessError> {
        self.record_ip(format!(
            "ip -6 -netns {netns} {object} {action} {}",
            args.join(" ")
        ))
    }

    fn ip_netns_add(&self, netns: &str) -> Result<(), ProcessError> {
        let mut state = self.state.borrow_mut();
        state.check_fail(&format!("ip netns add {netns}"))?;
        state.netns.push(netns.to_string());
        Ok(())
    }

    fn ip_netns_attach(&self, netns: &str, pid: i32) -> Result<(), ProcessError> {
        let mut state = self.state.borrow_mut();
        state.check_fail(&format!("ip netns attach {netns} {pid}"))?;
        state.netns.push(netns.to_string());
        Ok(())
    }

    fn ip_netns_delete(&self, netns: &str, _log_failures: bool) -> Result<(), ProcessError> {
        let mut state = self.state.borrow_mut();
        state.check_fail(&format!("ip netns delete {netns}"))?;
        let before = state.netns.len();
        state.netns.retain(|n| n != netns);
        if state.netns.len() == before {
            return Err(ProcessError::CommandFailed(format!("no netns {netns}")));
        }
        Ok(())
    }

    fn ip_netns_exec(&self, netns: &str, argv: &[&str]) -> Result<(), ProcessError> {
        let rendered = format!("ip netns exec {netns} {}", argv.join(" "));
        let mut state = self.state.borrow_mut();
        state.check_fail(&rendered)?;
        state.netns_exec_calls.push(rendered);
        Ok(())
    }

    fn iptables(
        &self,
        table: Table,
        command: Command,
        chain: &str,
        args: &[&str],
        _log_failures: bool,
    ) -> Result<(), ProcessError> {
        self.apply_xtables(false, table, command, chain, args)
    }

    fn ip6tables(
        &self,
        table: Table,
        command: Command,
        chain: &str,
        args: &[&str],
        _log_failures: bool,
    ) -> Result<(), ProcessError> {
        self.apply_xtables(true, table, command, chain, args)
    }

    fn iptables_dump(&self, ipv6: bool, table: Table) -> Result<String, ProcessError> {
        let state = self.state.borrow();
        let mut dump = String::new();
        for ((v6, t, chain), rules) in &state.chains {
            if *v6 != ipv6 || *t != table {
                continue;
            }
            dump.push_str(&format!("Chain {chain} ({} rules)\n", rules.len()));
        }
        Ok(dump)
    }

    fn iptables_restore(&self, script: &Path) -> Result<(), ProcessError> {
        self.state.borrow_mut().restored_scripts.push(script.to_path_buf());
        Ok(())
    }

    fn ip6tables_restore(&self, script: &Path) -> Result<(), ProcessError> {
        self.state.borrow_mut().restored_scripts.push(script.to_path_buf());
        Ok(())
    }

    fn modprobe_all(&self, _modules: &[&str]) -> Result<(), ProcessError> {
        Ok(())
    }

    fn begin_iptables_batch(&self) {
        let mut state = self.state.borrow_mut();
        state.batch_depth += 1;
        state.batch_acquisitions += 1;
    }

    fn end_iptables_batch(&self) {
        let mut state = self.state.borrow_mut();
        state.batch_depth = state.batch_depth.saturating_sub(1);
    }
}

// ============================================================================
// FakeSystem
// ============================================================================

#[derive(Default)]
pub struct SystemState {
    pub ifindexes: HashMap<String, u32>,
    pub sysnet_writes: Vec<(SysNet, String, Option<String>)>,
    pub bridges: Vec<String>,
    pub bridge_members: Vec<(String, String)>,
    pub taps: Vec<(String, Option<MacAddress>, Option<Ipv4Inet>, Option<String>)>,
    pub tap_counter: u32,
    pub socket_marks: Vec<(RawFd, u32)>,
    pub ebpf_enabled: bool,
    pub fail_on: HashMap<String, String>,
}

impl SystemState {
    fn check_fail(&self, op: &str) -> Result<(), SystemError> {
        if let Some(msg) = self.fail_on.get(op) {
            return Err(SystemError::Io(std::io::Error::other(msg.clone())));
        }
        Ok(())
    }
}

pub struct FakeSystem {
    pub state: Rc<RefCell<SystemState>>,
}

impl FakeSystem {
    pub fn new() -> FakeSystem {
        FakeSystem {
            state: Rc::new(RefCell::new(SystemState::default())),
        }
    }

    pub fn set_ifindex(&self, ifname: &str, ifindex: u32) {
        self.state
            .borrow_mut()
            .ifindexes
            .insert(ifname.to_string(), ifindex);
    }

    pub fn set_ebpf_enabled(&self, enabled: bool) {
        self.state.borrow_mut().ebpf_enabled = enabled;
    }

    pub fn fail_on(&self, op: &str, message: &str) {
        self.state
            .borrow_mut()
            .fail_on
            .insert(op.to_string(), message.to_string());
    }

    pub fn bridges(&self) -> Vec<String> {
        self.state.borrow().bridges.clone()
    }

    pub fn bridge_members(&self) -> Vec<(String, String)> {
        self.state.borrow().bridge_members.clone()
    }

    pub fn tap_names(&self) -> Vec<String> {
        self.state.borrow().taps.iter().map(|t| t.0.clone()).collect()
    }

    pub fn sysnet_writes(&self) -> Vec<(SysNet, String, Option<String>)> {
        self.state.borrow().sysnet_writes.clone()
    }

    pub fn socket_marks(&self) -> Vec<(RawFd, u32)> {
        self.state.borrow().socket_marks.clone()
    }
}

impl System for FakeSystem {
    fn sysnet_set(
        &self,
        target: SysNet,
        value: &str,
        ifname: Option<&str>,
    ) -> Result<(), SystemError> {
        let mut state = self.state.borrow_mut();
        state.check_fail("sysnet_set")?;
        state
            .sysnet_writes
            .push((target, value.to_string(), ifname.map(str::to_string)));
        Ok(())
    }

    fn ifindex(&self, ifname: &str) -> Result<u32, SystemError> {
        let state = self.state.borrow();
        state.check_fail("ifindex")?;
        state
            .ifindexes
            .get(ifname)
            .copied()
            .ok_or_else(|| SystemError::InterfaceNotFound(ifname.to_string()))
    }

    fn create_bridge(&self, ifname: &str) -> Result<(), SystemError> {
        let mut state = self.state.borrow_mut();
        state.check_fail("create_bridge")?;
        state.bridges.push(ifname.to_string());
        Ok(())
    }

    fn destroy_bridge(&self, ifname: &str) -> Result<(), SystemError> {
        let mut state = self.state.borrow_mut();
        state.check_fail("destroy_bridge")?;
        state.bridges.retain(|b| b != ifname);
        state.bridge_members.retain(|(b, _)| b != ifname);
        Ok(())
    }

    fn add_to_bridge(&self, br_ifname: &str, ifname: &str) -> Result<(), SystemError> {
        let mut state = self.state.borrow_mut();
        state.check_fail("add_to_bridge")?;
        if !state.bridges.iter().any(|b| b == br_ifname) {
            return Err(SystemError::InterfaceNotFound(br_ifname.to_string()));
        }
        state
            .bridge_members
            .push((br_ifname.to_string(), ifname.to_string()));
        Ok(())
    }

    fn create_tuntap(
        &self,
        name_template: &str,
        mac_addr: Option<MacAddress>,
        ipv4_cidr: Option<Ipv4Inet>,
        user: Option<&str>,
        _mode: DeviceMode,
    ) -> Result<String, SystemError> {
        let mut state = self.state.borrow_mut();
        state.check_fail("create_tuntap")?;
        let name = if name_template.contains("%d") {
            let name = name_template.replace("%d", &state.tap_counter.to_string());
            state.tap_counter += 1;
            name
        } else {
            name_template.to_string()
        };
        state
            .taps
            .push((name.clone(), mac_addr, ipv4_cidr, user.map(str::to_string)));
        Ok(name)
    }

    fn set_socket_mark(&self, fd: RawFd, mark: u32) -> Result<(), SystemError> {
        let mut state = self.state.borrow_mut();
        state.check_fail("set_socket_mark")?;
        state.socket_marks.push((fd, mark));
        Ok(())
    }

    fn is_ebpf_enabled(&self) -> bool {
        self.state.borrow().ebpf_enabled
    }
}

// ============================================================================
// Recording forwarding fakes
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardingEvent {
    Start(String, String, ForwardingSet),
    Stop(String, String, ForwardingSet),
}

#[derive(Default)]
pub struct RecordingForwarding {
    pub events: Vec<ForwardingEvent>,
}

impl ForwardingService for RecordingForwarding {
    fn start_forwarding(
        &mut self,
        _datapath: &crate::datapath::Datapath,
        shill_device: &ShillDevice,
        int_ifname: &str,
        set: ForwardingSet,
    ) {
        self.events.push(ForwardingEvent::Start(
            shill_device.ifname.clone(),
            int_ifname.to_string(),
            set,
        ));
    }

    fn stop_forwarding(
        &mut self,
        _datapath: &crate::datapath::Datapath,
        shill_device: &ShillDevice,
        int_ifname: &str,
        set: ForwardingSet,
    ) {
        self.events.push(ForwardingEvent::Stop(
            shill_device.ifname.clone(),
            int_ifname.to_string(),
            set,
        ));
    }
}

#[derive(Default)]
pub struct RecordingNetworkApplier {
    pub applied: RefCell<Vec<(u32, String)>>,
    pub cleared: RefCell<Vec<u32>>,
}

impl crate::shill::NetworkApplier for RecordingNetworkApplier {
    fn apply_network_config(&self, ifindex: u32, device: &ShillDevice) {
        self.applied.borrow_mut().push((ifindex, device.ifname.clone()));
    }

    fn clear_network_config(&self, ifindex: u32) {
        self.cleared.borrow_mut().push(ifindex);
    }
}

#[derive(Default)]
pub struct RecordingNdProxy {
    pub active: RefCell<Vec<(String, String)>>,
}

impl NdProxyControl for RecordingNdProxy {
    fn start_nd_proxy(&self, uplink_ifname: &str, downlink_ifname: &str) {
        self.active
            .borrow_mut()
            .push((uplink_ifname.to_string(), downlink_ifname.to_string()));
    }

    fn stop_nd_proxy(&self, uplink_ifname: &str, downlink_ifname: &str) {
        self.active
            .borrow_mut()
            .retain(|(up, down)| !(up == uplink_ifname && down == downlink_ifname));
    }
}

#[derive(Default)]
pub struct RecordingMulticast {
    pub multicast: RefCell<Vec<(String, String)>>,
    pub broadcast: RefCell<Vec<(String, String)>>,
}

impl MulticastControl for RecordingMulticast {
    fn start_multicast_forwarding(&self, lan_ifname: &str, int_ifname: &str) {
        self.multicast
            .borrow_mut()
            .push((lan_ifname.to_string(), int_ifname.to_string()));
    }

    fn stop_multicast_forwarding(&self, lan_ifname: &str, int_ifname: &str) {
        self.multicast
            .borrow_mut()
            .retain(|(lan, int)| !(lan == lan_ifname && int == int_ifname));
    }

    fn start_broadcast_forwarding(&self, lan_ifname: &str, int_ifname: &str) {
        self.broadcast
            .borrow_mut()
            .push((lan_ifname.to_string(), int_ifname.to_string()));
    }

    fn stop_broadcast_forwarding(&self, lan_ifname: &str, int_ifname: &str) {
        self.broadcast
            .borrow_mut()
            .retain(|(lan, int)| !(lan == lan_ifname && int == int_ifname));
    }
}
