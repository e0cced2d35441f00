//! Translation of high-level datapath intents ("attach guest G on
//! upstream U", "start VPN routing", "redirect DNS") into the concrete
//! sequences of link-layer operations and iptables mutations.
//!
//! The static chain skeleton is sourced from the on-disk restore scripts
//! at start; this module only ever flushes or appends to those chains and
//! owns the dynamic per-interface chains (`PREROUTING_<if>`,
//! `POSTROUTING_<if>`, `egress_<if>`) entirely.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::rc::Rc;

use cidr::{Ipv4Inet, Ipv6Cidr, Ipv6Inet};
use thiserror::Error;

use crate::firewall::{Firewall, FirewallError, Protocol};
use crate::fwmark::{
    self, Fwmark, QosCategory, TrafficSource, qos_fwmark_with_mask, source_fwmark_with_mask,
};
use crate::iptables::{Command, IpFamily, Table};
use crate::mac::MacAddress;
use crate::process::{NEW_NETNS_PID, ProcessError, ProcessRunner, acquire_iptables_batch_mode};
use crate::shill::ShillDevice;
use crate::subnet::Subnet;
use crate::system::{DeviceMode, SysNet, System, SystemError, WEBRTC_MATCHER_PIN_PATH};

/// ARC-side address of the management interface, used by the ADB
/// forwarding rules.
const ARC_ADDR: Ipv4Addr = Ipv4Addr::new(100, 115, 92, 2);
const LOCALHOST_ADDR: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);
const DNS_PORT: &str = "53";
const ADB_SERVER_PORT: u16 = 5555;
const ADB_PROXY_TCP_LISTEN_PORT: u16 = 5550;

/// Name template handed to the kernel when the caller does not care
/// about the TAP device name.
const DEFAULT_TAP_TEMPLATE: &str = "vmtap%d";

pub const ARC0_IFNAME: &str = "arc0";
pub const ARCBR0_IFNAME: &str = "arcbr0";

pub const IPTABLES_START_SCRIPT: &str = "/etc/patchpanel/iptables.start";
pub const IP6TABLES_START_SCRIPT: &str = "/etc/patchpanel/ip6tables.start";

// Chains for tagging egress traffic in the OUTPUT and PREROUTING chains
// of the mangle table. These names must stay consistent with the static
// restore scripts.
const SKIP_APPLY_VPN_MARK_CHAIN: &str = "skip_apply_vpn_mark";
const APPLY_VPN_MARK_CHAIN: &str = "apply_vpn_mark";

// Egress filter chain to allow traffic to dns-proxy.
const ACCEPT_EGRESS_TO_DNS_PROXY_CHAIN: &str = "accept_egress_to_dns_proxy";

// Egress filter chain for dropping in OUTPUT any local traffic
// incorrectly bound to a static IPv4 address used for a guest.
const DROP_GUEST_IPV4_PREFIX_CHAIN: &str = "drop_guest_ipv4_prefix";

// Egress nat chain redirecting DNS queries from system services.
const REDIRECT_DNS_CHAIN: &str = "redirect_dns";

// OUTPUT filter chain enforcing the source IP of egress IPv6 packets.
const ENFORCE_SOURCE_PREFIX_CHAIN: &str = "enforce_ipv6_src_prefix";

// VPN egress filter chains for the filter OUTPUT and FORWARD chains.
const VPN_ACCEPT_CHAIN: &str = "vpn_accept";
const VPN_LOCKDOWN_CHAIN: &str = "vpn_lockdown";

// Tethering filter chains: accept traffic forwarded between the
// upstream and downstream interfaces, drop everything else touching the
// downstream interface.
const FORWARD_TETHERING_CHAIN: &str = "forward_tethering";
const EGRESS_TETHERING_CHAIN: &str = "egress_tethering";
const INGRESS_TETHERING_CHAIN: &str = "ingress_tethering";

// Local-only network filter chains: no forwarding at all.
const FORWARD_LOCALONLY_CHAIN: &str = "forward_localonly";
const EGRESS_LOCALONLY_CHAIN: &str = "egress_localonly";
const INGRESS_LOCALONLY_CHAIN: &str = "ingress_localonly";

// INPUT filter chain dispatching to the specialized ingress chains for
// tethering or local-only networks. Must traverse after
// ingress_port_firewall.
const INGRESS_DOWNSTREAM_NETWORK_CHAIN: &str = "ingress_downstream_network";

// OUTPUT filter chain to drop host-initiated connections to Bruschetta
// and FORWARD filter chain to drop external- and other-vm-initiated
// connections.
const DROP_OUTPUT_TO_BRUSCHETTA_CHAIN: &str = "drop_output_to_bruschetta";
const DROP_FORWARD_TO_BRUSCHETTA_CHAIN: &str = "drop_forward_to_bruschetta";

// IPv4 nat PREROUTING chains forwarding ingress traffic to the guest
// currently acting as default receiver for an upstream.
const APPLY_AUTO_DNAT_TO_ARC_CHAIN: &str = "apply_auto_dnat_to_arc";
const APPLY_AUTO_DNAT_TO_CROSTINI_CHAIN: &str = "apply_auto_dnat_to_crostini";
const APPLY_AUTO_DNAT_TO_PARALLELS_CHAIN: &str = "apply_auto_dnat_to_parallels";

// nat PREROUTING chain for egress DNS traffic of downstream guests.
const REDIRECT_DEFAULT_DNS_CHAIN: &str = "redirect_default_dns";
// nat OUTPUT chain for egress DNS traffic of host processes.
const REDIRECT_USER_DNS_CHAIN: &str = "redirect_user_dns";
// nat POSTROUTING chain for egress DNS traffic of host processes.
const SNAT_USER_DNS_CHAIN: &str = "snat_user_dns";

// QoS chains in the mangle table. qos_detect holds the detection rules;
// qos_detect_static only holds the jump to qos_detect so the rule order
// of the mangle table stays static.
const QOS_DETECT_CHAIN: &str = "qos_detect";
const QOS_DETECT_STATIC_CHAIN: &str = "qos_detect_static";
const QOS_DETECT_DOH_CHAIN: &str = "qos_detect_doh";
const QOS_DETECT_BOREALIS_CHAIN: &str = "qos_detect_borealis";
const QOS_APPLY_DSCP_CHAIN: &str = "qos_apply_dscp";

// Kernel limit on iptables chain names.
const IPTABLES_MAX_CHAIN_LENGTH: usize = 28;

#[derive(Debug, Error)]
pub enum DatapathError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    System(#[from] SystemError),
    #[error(transparent)]
    Firewall(#[from] FirewallError),
    #[error("interface index of {0} does not fit a routing fwmark")]
    RoutingTagOverflow(String),
    #[error("tethering downstream network has no upstream device")]
    MissingUpstream,
    #[error("local-only downstream network must not have an upstream device")]
    UnexpectedUpstream,
    #[error("invalid port rule request: {0}")]
    InvalidPortRule(String),
    #[error("no shill Device known for outbound interface {0}")]
    MissingOutboundDevice(String),
}

/// Targets of the inbound auto-DNAT chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoDnatTarget {
    Arc,
    Crostini,
    Parallels,
}

impl AutoDnatTarget {
    fn chain(self) -> &'static str {
        match self {
            AutoDnatTarget::Arc => APPLY_AUTO_DNAT_TO_ARC_CHAIN,
            AutoDnatTarget::Crostini => APPLY_AUTO_DNAT_TO_CROSTINI_CHAIN,
            AutoDnatTarget::Parallels => APPLY_AUTO_DNAT_TO_PARALLELS_CHAIN,
        }
    }
}

/// Conventional name of the PREROUTING mangle subchain of a downstream
/// interface.
pub fn prerouting_subchain_name(int_ifname: &str) -> String {
    let chain = format!("PREROUTING_{int_ifname}");
    assert!(
        chain.len() <= IPTABLES_MAX_CHAIN_LENGTH,
        "chain name {chain} is longer than {IPTABLES_MAX_CHAIN_LENGTH}"
    );
    chain
}

fn postrouting_subchain_name(ext_ifname: &str) -> String {
    let chain = format!("POSTROUTING_{ext_ifname}");
    assert!(
        chain.len() <= IPTABLES_MAX_CHAIN_LENGTH,
        "chain name {chain} is longer than {IPTABLES_MAX_CHAIN_LENGTH}"
    );
    chain
}

pub fn egress_subchain_name(ext_ifname: &str) -> String {
    let chain = format!("egress_{ext_ifname}");
    assert!(
        chain.len() <= IPTABLES_MAX_CHAIN_LENGTH,
        "chain name {chain} is longer than {IPTABLES_MAX_CHAIN_LENGTH}"
    );
    chain
}

/// FORWARD firewall policy classes a traffic source collapses into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardFirewallRuleType {
    Tethering,
    LocalOnly,
    IsolatedGuest,
    Open,
}

fn forward_firewall_rule_type(source: TrafficSource) -> ForwardFirewallRuleType {
    match source {
        TrafficSource::TetherDownstream => ForwardFirewallRuleType::Tethering,
        TrafficSource::WifiLohs | TrafficSource::WifiDirect => ForwardFirewallRuleType::LocalOnly,
        TrafficSource::BruschettaVm => ForwardFirewallRuleType::IsolatedGuest,
        _ => ForwardFirewallRuleType::Open,
    }
}

fn is_downstream_network_rule(rule: ForwardFirewallRuleType) -> bool {
    matches!(
        rule,
        ForwardFirewallRuleType::Tethering | ForwardFirewallRuleType::LocalOnly
    )
}

/// Static IPv6 configuration of a connected namespace.
#[derive(Debug, Clone)]
pub struct StaticIpv6Config {
    pub host_cidr: Ipv6Inet,
    pub peer_cidr: Ipv6Inet,
}

/// A network namespace attached to the datapath on behalf of a client
/// process.
pub struct ConnectedNamespace {
    /// Pid of the client process owning the namespace, or
    /// [`NEW_NETNS_PID`] to create a fresh one.
    pub pid: i32,
    pub netns_name: String,
    pub source: TrafficSource,
    /// Name of the upstream shill Device to route through; empty means
    /// "follow the default".
    pub outbound_ifname: String,
    pub route_on_vpn: bool,
    pub host_ifname: String,
    pub peer_ifname: String,
    pub host_mac_addr: MacAddress,
    pub peer_mac_addr: MacAddress,
    /// Subnet owning the host and peer addresses; freed back to the
    /// netns pool when this struct drops.
    pub peer_ipv4_subnet: Option<Subnet>,
    pub host_ipv4_cidr: Ipv4Inet,
    pub peer_ipv4_cidr: Ipv4Inet,
    pub static_ipv6_config: Option<StaticIpv6Config>,
    /// Snapshot of the current upstream when following a default network.
    pub current_outbound_device: Option<ShillDevice>,
}

/// Flavors of DNS redirection requested by dns-proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRedirectionType {
    Default,
    Arc,
    User,
    ExcludeDestination,
}

pub struct DnsRedirectionRule {
    pub rule_type: DnsRedirectionType,
    pub input_ifname: String,
    pub proxy_address: IpAddr,
    pub host_ifname: String,
    pub nameservers: Vec<IpAddr>,
}

impl DnsRedirectionRule {
    pub fn family(&self) -> IpFamily {
        match self.proxy_address {
            IpAddr::V4(_) => IpFamily::Ipv4,
            IpAddr::V6(_) => IpFamily::Ipv6,
        }
    }
}

/// Topology of a downstream network managed for shill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamTopology {
    Tethering,
    LocalOnly,
}

pub struct DownstreamNetworkInfo {
    pub downstream_ifname: String,
    pub ipv4_cidr: Ipv4Inet,
    pub topology: DownstreamTopology,
    pub upstream_device: Option<ShillDevice>,
}

impl DownstreamNetworkInfo {
    pub fn traffic_source(&self) -> TrafficSource {
        match self.topology {
            DownstreamTopology::Tethering => TrafficSource::TetherDownstream,
            DownstreamTopology::LocalOnly => TrafficSource::WifiLohs,
        }
    }

    fn egress_chain(&self) -> &'static str {
        match self.topology {
            DownstreamTopology::Tethering => EGRESS_TETHERING_CHAIN,
            DownstreamTopology::LocalOnly => EGRESS_LOCALONLY_CHAIN,
        }
    }

    fn ingress_chain(&self) -> &'static str {
        match self.topology {
            DownstreamTopology::Tethering => INGRESS_TETHERING_CHAIN,
            DownstreamTopology::LocalOnly => INGRESS_LOCALONLY_CHAIN,
        }
    }
}

/// Port rule request surface (ModifyPortRule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRuleOp {
    Create,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRuleType {
    /// Open ingress access to a port.
    Access,
    /// Restrict localhost access to a port.
    Lockdown,
    /// Forward ingress traffic to a downstream guest.
    Forwarding,
}

pub struct PortRuleRequest {
    pub op: PortRuleOp,
    pub rule_type: PortRuleType,
    pub proto: Protocol,
    pub input_dst_ip: Option<Ipv4Addr>,
    pub input_dst_port: u32,
    pub input_ifname: String,
    pub dst_ip: Option<Ipv4Addr>,
    pub dst_port: u32,
}

/// Stateless mutation engine over the process-runner and syscall seams.
pub struct Datapath {
    runner: Rc<dyn ProcessRunner>,
    system: Rc<dyn System>,
    firewall: Firewall,
    iptables_start_script: PathBuf,
    ip6tables_start_script: PathBuf,
    // DNS address currently redirected to, per physical interface.
    physical_dns_addresses: RefCell<HashMap<String, Ipv4Addr>>,
}

impl Datapath {
    pub fn new(runner: Rc<dyn ProcessRunner>, system: Rc<dyn System>) -> Datapath {
        Datapath::with_scripts(
            runner,
            system,
            PathBuf::from(IPTABLES_START_SCRIPT),
            PathBuf::from(IP6TABLES_START_SCRIPT),
        )
    }

    pub fn with_scripts(
        runner: Rc<dyn ProcessRunner>,
        system: Rc<dyn System>,
        iptables_start_script: PathBuf,
        ip6tables_start_script: PathBuf,
    ) -> Datapath {
        let firewall = Firewall::new(Rc::clone(&runner));
        Datapath {
            runner,
            system,
            firewall,
            iptables_start_script,
            ip6tables_start_script,
            physical_dns_addresses: RefCell::new(HashMap::new()),
        }
    }

    pub fn firewall(&self) -> &Firewall {
        &self.firewall
    }

    /// Brings up packet forwarding and sources the static chain skeleton
    /// from the restore scripts. Individual failures are logged but do
    /// not abort startup: a partially degraded datapath is still better
    /// than none.
    pub fn start(&self) {
        if let Err(error) = self.system.sysnet_set(SysNet::Ipv4Forward, "1", None) {
            tracing::error!(%error, "failed to update net.ipv4.ip_forward, guest connectivity will not work correctly");
        }
        if let Err(error) = self.system.sysnet_set(SysNet::Ipv6Forward, "1", None) {
            tracing::error!(%error, "failed to update net.ipv6.conf.all.forwarding, IPv6 functionality may be broken");
        }
        if let Err(error) = self.system.sysnet_set(SysNet::Ipv6ProxyNdp, "1", None) {
            tracing::error!(%error, "failed to update net.ipv6.conf.all.proxy_ndp, IPv6 functionality may be broken");
        }

        if let Err(error) = self.runner.iptables_restore(&self.iptables_start_script) {
            tracing::error!(%error, "failed to source iptables start script");
        }
        if let Err(error) = self.runner.ip6tables_restore(&self.ip6tables_start_script) {
            tracing::error!(%error, "failed to source ip6tables start script");
        }

        // WebRTC detection: detect the client hello of a WebRTC connection
        // with the pinned BPF matcher and mark the whole connection through
        // connmark. The matcher is only present on kernels with CAP_BPF, so
        // these rules are installed dynamically while the rest of the QoS
        // detection rules live in the static scripts. The mark is only
        // saved for packets that were still unmarked, to avoid tagging
        // unrelated connections.
        if self.system.is_ebpf_enabled() {
            let _batch = acquire_iptables_batch_mode(&*self.runner);
            let qos_mask = fwmark::QOS_MASK.to_string();
            let default_mark = qos_fwmark_with_mask(QosCategory::Default);
            let multimedia_mark = qos_fwmark_with_mask(QosCategory::MultimediaConferencing);
            self.modify_iptables(
                IpFamily::Dual,
                Table::Mangle,
                Command::Append,
                QOS_DETECT_CHAIN,
                &["-m", "mark", "!", "--mark", &default_mark, "-j", "RETURN", "-w"],
                true,
            );
            self.modify_iptables(
                IpFamily::Dual,
                Table::Mangle,
                Command::Append,
                QOS_DETECT_CHAIN,
                &[
                    "-m",
                    "bpf",
                    "--object-pinned",
                    WEBRTC_MATCHER_PIN_PATH,
                    "-j",
                    "MARK",
                    "--set-xmark",
                    &multimedia_mark,
                    "-w",
                ],
                true,
            );
            self.modify_iptables(
                IpFamily::Dual,
                Table::Mangle,
                Command::Append,
                QOS_DETECT_CHAIN,
                &[
                    "-j", "CONNMARK", "--save-mark", "--nfmask", &qos_mask, "--ctmask", &qos_mask,
                    "-w",
                ],
                true,
            );
        }
    }

    pub fn stop(&self) {
        if let Err(error) = self.system.sysnet_set(SysNet::Ipv6Forward, "0", None) {
            tracing::error!(%error, "failed to restore net.ipv6.conf.all.forwarding");
        }
        if let Err(error) = self.system.sysnet_set(SysNet::Ipv4Forward, "0", None) {
            tracing::error!(%error, "failed to restore net.ipv4.ip_forward");
        }
    }

    // ------------------------------------------------------------------
    // Network namespaces
    // ------------------------------------------------------------------

    pub fn netns_attach_name(&self, netns_name: &str, netns_pid: i32) -> Result<(), DatapathError> {
        // Remove any namespace with the same name left over from an
        // unclean exit.
        if self.runner.ip_netns_delete(netns_name, false).is_ok() {
            tracing::info!(netns_name, "deleted left over network namespace name");
        }
        if netns_pid == NEW_NETNS_PID {
            self.runner.ip_netns_add(netns_name)?;
        } else {
            self.runner.ip_netns_attach(netns_name, netns_pid)?;
        }
        Ok(())
    }

    pub fn netns_delete_name(&self, netns_name: &str) -> Result<(), DatapathError> {
        Ok(self.runner.ip_netns_delete(netns_name, true)?)
    }

    // ------------------------------------------------------------------
    // Link layer
    // ------------------------------------------------------------------

    pub fn add_bridge(&self, ifname: &str, cidr: Ipv4Inet) -> Result<(), DatapathError> {
        self.system.create_bridge(ifname)?;

        // Configure the persistent bridge interface with a static IP.
        let addr = cidr.to_string();
        let brd = cidr.last_address().to_string();
        if let Err(error) = self
            .runner
            .ip("addr", "add", &[&addr, "brd", &brd, "dev", ifname], true)
        {
            self.remove_bridge(ifname);
            return Err(error.into());
        }
        if let Err(error) = self.runner.ip("link", "set", &[ifname, "up"], true) {
            self.remove_bridge(ifname);
            return Err(error.into());
        }
        Ok(())
    }

    pub fn remove_bridge(&self, ifname: &str) {
        let _ = self.runner.ip("link", "set", &[ifname, "down"], false);
        if let Err(error) = self.system.destroy_bridge(ifname) {
            tracing::error!(%error, ifname, "failed to destroy bridge");
        }
    }

    pub fn add_to_bridge(&self, br_ifname: &str, ifname: &str) -> Result<(), DatapathError> {
        Ok(self.system.add_to_bridge(br_ifname, ifname)?)
    }

    /// Creates a persistent tun/tap device and returns the actual
    /// interface name picked by the kernel.
    pub fn add_tun_tap(
        &self,
        name: &str,
        mac_addr: Option<MacAddress>,
        ipv4_cidr: Option<Ipv4Inet>,
        user: Option<&str>,
        dev_mode: DeviceMode,
    ) -> Result<String, DatapathError> {
        let template = if name.is_empty() { DEFAULT_TAP_TEMPLATE } else { name };
        Ok(self
            .system
            .create_tuntap(template, mac_addr, ipv4_cidr, user, dev_mode)?)
    }

    pub fn remove_tun_tap(&self, ifname: &str, dev_mode: DeviceMode) {
        let mode = dev_mode.to_string();
        let _ = self
            .runner
            .ip("tuntap", "del", &[ifname, "mode", &mode], true);
    }

    /// Creates a veth pair with the peer end already inside
    /// `netns_name`, configures the peer, and brings the host end up.
    #[allow(clippy::too_many_arguments)]
    pub fn connect_veth_pair(
        &self,
        netns_name: &str,
        veth_ifname: &str,
        peer_ifname: &str,
        remote_mac_addr: MacAddress,
        remote_ipv4_cidr: Ipv4Inet,
        remote_ipv6_cidr: Option<Ipv6Inet>,
        remote_multicast: bool,
    ) -> Result<(), DatapathError> {
        self.runner.ip(
            "link",
            "add",
            &[
                veth_ifname,
                "type",
                "veth",
                "peer",
                "name",
                peer_ifname,
                "netns",
                netns_name,
            ],
            true,
        )?;

        if let Err(error) = self.configure_interface_in(
            Some(netns_name),
            peer_ifname,
            Some(remote_mac_addr),
            remote_ipv4_cidr,
            remote_ipv6_cidr,
            true,
            remote_multicast,
        ) {
            tracing::error!(%error, peer_ifname, "failed to configure interface");
            self.remove_interface(veth_ifname);
            return Err(error);
        }

        if let Err(error) = self.toggle_interface(veth_ifname, true) {
            tracing::error!(%error, veth_ifname, "failed to bring up interface");
            self.remove_interface(veth_ifname);
            return Err(error);
        }
        Ok(())
    }

    pub fn toggle_interface(&self, ifname: &str, up: bool) -> Result<(), DatapathError> {
        let state = if up { "up" } else { "down" };
        Ok(self.runner.ip("link", "set", &[ifname, state], true)?)
    }

    pub fn configure_interface(
        &self,
        ifname: &str,
        mac_addr: Option<MacAddress>,
        ipv4_cidr: Ipv4Inet,
        ipv6_cidr: Option<Ipv6Inet>,
        up: bool,
        enable_multicast: bool,
    ) -> Result<(), DatapathError> {
        self.configure_interface_in(
            None,
            ifname,
            mac_addr,
            ipv4_cidr,
            ipv6_cidr,
            up,
            enable_multicast,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn configure_interface_in(
        &self,
        netns: Option<&str>,
        ifname: &str,
        mac_addr: Option<MacAddress>,
        ipv4_cidr: Ipv4Inet,
        ipv6_cidr: Option<Ipv6Inet>,
        up: bool,
        enable_multicast: bool,
    ) -> Result<(), DatapathError> {
        let ip = |object: &str, action: &str, args: &[&str]| match netns {
            Some(netns) => self.runner.ip_in_netns(netns, object, action, args),
            None => self.runner.ip(object, action, args, true),
        };

        let addr = ipv4_cidr.to_string();
        let brd = ipv4_cidr.last_address().to_string();
        ip("addr", "add", &[&addr, "brd", &brd, "dev", ifname])?;
        if let Some(ipv6_cidr) = ipv6_cidr {
            let addr6 = ipv6_cidr.to_string();
            ip("addr", "add", &[&addr6, "dev", ifname])?;
        }

        let mut args: Vec<&str> = vec!["dev", ifname, if up { "up" } else { "down" }];
        let mac = mac_addr.map(|m| m.to_string());
        if let Some(mac) = mac.as_deref() {
            args.extend_from_slice(&["addr", mac]);
        }
        args.extend_from_slice(&["multicast", if enable_multicast { "on" } else { "off" }]);
        ip("link", "set", &args)?;
        Ok(())
    }

    pub fn remove_interface(&self, ifname: &str) {
        let _ = self.runner.ip("link", "delete", &[ifname], false);
    }

    /// Toggles IPv6 inside a namespace to force the kernel to re-send
    /// Router Solicitations.
    pub fn restart_ipv6_in_netns(&self, netns_name: &str) {
        for value in ["1", "0"] {
            let arg = format!("net.ipv6.conf.all.disable_ipv6={value}");
            if let Err(error) = self
                .runner
                .ip_netns_exec(netns_name, &["sysctl", "-w", &arg])
            {
                tracing::error!(%error, netns_name, "failed to toggle disable_ipv6");
            }
        }
    }

    // ------------------------------------------------------------------
    // Routes
    // ------------------------------------------------------------------

    pub fn add_ipv4_route(
        &self,
        gateway_addr: Ipv4Addr,
        subnet_cidr: &str,
    ) -> Result<(), DatapathError> {
        let gateway = gateway_addr.to_string();
        Ok(self
            .runner
            .ip("route", "add", &[subnet_cidr, "via", &gateway], true)?)
    }

    pub fn delete_ipv4_route(&self, gateway_addr: Ipv4Addr, subnet_cidr: &str) {
        let gateway = gateway_addr.to_string();
        let _ = self
            .runner
            .ip("route", "del", &[subnet_cidr, "via", &gateway], true);
    }

    pub fn add_ipv6_host_route(
        &self,
        ifname: &str,
        ipv6_cidr: &Ipv6Cidr,
        src_addr: Option<std::net::Ipv6Addr>,
    ) -> Result<(), DatapathError> {
        let cidr = ipv6_cidr.to_string();
        match src_addr {
            Some(src) => {
                let src = src.to_string();
                Ok(self
                    .runner
                    .ip6("route", "replace", &[&cidr, "dev", ifname, "src", &src], true)?)
            }
            None => Ok(self
                .runner
                .ip6("route", "replace", &[&cidr, "dev", ifname], true)?),
        }
    }

    pub fn remove_ipv6_host_route(&self, ipv6_cidr: &Ipv6Cidr) {
        let cidr = ipv6_cidr.to_string();
        let _ = self.runner.ip6("route", "del", &[&cidr], true);
    }

    pub fn add_ipv6_neighbor_proxy(
        &self,
        ifname: &str,
        ipv6_addr: std::net::Ipv6Addr,
    ) -> Result<(), DatapathError> {
        let addr = ipv6_addr.to_string();
        Ok(self
            .runner
            .ip6("neighbor", "add", &["proxy", &addr, "dev", ifname], true)?)
    }

    pub fn remove_ipv6_neighbor_proxy(&self, ifname: &str, ipv6_addr: std::net::Ipv6Addr) {
        let addr = ipv6_addr.to_string();
        let _ = self
            .runner
            .ip6("neighbor", "del", &["proxy", &addr, "dev", ifname], true);
    }

    pub fn add_ipv6_address(&self, ifname: &str, ipv6_addr: &str) -> Result<(), DatapathError> {
        Ok(self.runner.ip6("addr", "add", &[ipv6_addr, "dev", ifname], true)?)
    }

    pub fn remove_ipv6_address(&self, ifname: &str, ipv6_addr: &str) {
        let _ = self.runner.ip6("addr", "del", &[ipv6_addr, "dev", ifname], true);
    }

    // ------------------------------------------------------------------
    // Connected namespaces
    // ------------------------------------------------------------------

    /// Attaches the client namespace and wires its veth datapath:
    ///  - attach a name to the client namespace, or create a fresh named
    ///    namespace when no client pid is given,
    ///  - create the veth pair across the host and client namespaces and
    ///    configure the peer end inside the client namespace,
    ///  - configure the host end,
    ///  - install the default route inside the client namespace,
    ///  - install the routing rules for the selected outbound mode.
    pub fn start_routing_namespace(
        &self,
        nsinfo: &ConnectedNamespace,
    ) -> Result<(), DatapathError> {
        if let Err(error) = self.netns_attach_name(&nsinfo.netns_name, nsinfo.pid) {
            tracing::error!(%error, netns_name = %nsinfo.netns_name, pid = nsinfo.pid,
                "failed to attach name to namespace");
            return Err(error);
        }

        if let Err(error) = self.connect_veth_pair(
            &nsinfo.netns_name,
            &nsinfo.host_ifname,
            &nsinfo.peer_ifname,
            nsinfo.peer_mac_addr,
            nsinfo.peer_ipv4_cidr,
            nsinfo.static_ipv6_config.as_ref().map(|c| c.peer_cidr),
            false,
        ) {
            tracing::error!(%error, pid = nsinfo.pid, "failed to create veth pair for namespace");
            let _ = self.netns_delete_name(&nsinfo.netns_name);
            return Err(error);
        }

        if let Err(error) = self.configure_interface(
            &nsinfo.host_ifname,
            Some(nsinfo.host_mac_addr),
            nsinfo.host_ipv4_cidr,
            nsinfo.static_ipv6_config.as_ref().map(|c| c.host_cidr),
            true,
            false,
        ) {
            tracing::error!(%error, host_ifname = %nsinfo.host_ifname, "cannot configure host interface");
            self.remove_interface(&nsinfo.host_ifname);
            let _ = self.netns_delete_name(&nsinfo.netns_name);
            return Err(error);
        }

        // Default routes inside the client namespace point at the host
        // end of the pair.
        let host_v4 = nsinfo.host_ipv4_cidr.address().to_string();
        if let Err(error) = self.runner.ip_in_netns(
            &nsinfo.netns_name,
            "route",
            "add",
            &["default", "via", &host_v4],
        ) {
            tracing::error!(%error, pid = nsinfo.pid, "failed to add default /0 route inside namespace");
            self.remove_interface(&nsinfo.host_ifname);
            let _ = self.netns_delete_name(&nsinfo.netns_name);
            return Err(error.into());
        }
        if let Some(config) = &nsinfo.static_ipv6_config {
            let host_v6 = config.host_cidr.address().to_string();
            if let Err(error) = self.runner.ip6_in_netns(
                &nsinfo.netns_name,
                "route",
                "add",
                &["default", "via", &host_v6],
            ) {
                tracing::error!(%error, pid = nsinfo.pid, "failed to add IPv6 default /0 route inside namespace");
                self.remove_interface(&nsinfo.host_ifname);
                let _ = self.netns_delete_name(&nsinfo.netns_name);
                return Err(error.into());
            }
        }

        // Egress traffic of the namespace is tagged for SNAT; ingress
        // forwarding stays closed unless the client sets up explicit port
        // forwarding rules.
        if !nsinfo.outbound_ifname.is_empty() {
            let Some(outbound_device) = &nsinfo.current_outbound_device else {
                tracing::error!(netns_name = %nsinfo.netns_name,
                    "no shill Device known for connected namespace");
                return Err(DatapathError::MissingOutboundDevice(
                    nsinfo.outbound_ifname.clone(),
                ));
            };
            self.start_routing_device(
                outbound_device,
                &nsinfo.host_ifname,
                nsinfo.source,
                nsinfo.static_ipv6_config.is_some(),
            )?;
        } else if !nsinfo.route_on_vpn {
            self.start_routing_device_as_system(
                &nsinfo.host_ifname,
                nsinfo.source,
                nsinfo.static_ipv6_config.is_some(),
            );
        } else {
            self.start_routing_device_as_user(
                &nsinfo.host_ifname,
                nsinfo.source,
                nsinfo.host_ipv4_cidr.address(),
                Some(nsinfo.peer_ipv4_cidr.address()),
                nsinfo.static_ipv6_config.as_ref().map(|c| c.host_cidr.address()),
                nsinfo.static_ipv6_config.as_ref().map(|c| c.peer_cidr.address()),
            );
        }
        Ok(())
    }

    pub fn stop_routing_namespace(&self, nsinfo: &ConnectedNamespace) {
        self.stop_routing_device(&nsinfo.host_ifname, nsinfo.source);
        self.remove_interface(&nsinfo.host_ifname);
        let _ = self.netns_delete_name(&nsinfo.netns_name);
    }

    // ------------------------------------------------------------------
    // DNS redirection (dns-proxy)
    // ------------------------------------------------------------------

    fn modify_dns_proxy_dnat(
        &self,
        family: IpFamily,
        rule: &DnsRedirectionRule,
        op: Command,
        ifname: &str,
        chain: &str,
    ) -> bool {
        let proxy_addr = rule.proxy_address.to_string();
        let mut success = true;
        for protocol in ["udp", "tcp"] {
            let mut args: Vec<&str> = Vec::new();
            if !ifname.is_empty() {
                args.extend_from_slice(&["-i", ifname]);
            }
            args.extend_from_slice(&[
                "-p",
                protocol,
                "--dport",
                DNS_PORT,
                "-j",
                "DNAT",
                "--to-destination",
                &proxy_addr,
                "-w",
            ]);
            success &= self.modify_iptables(family, Table::Nat, op, chain, &args, true);
        }
        success
    }

    fn modify_dns_proxy_masquerade(&self, family: IpFamily, op: Command, chain: &str) -> bool {
        let mut success = true;
        for protocol in ["udp", "tcp"] {
            let args = ["-p", protocol, "--dport", DNS_PORT, "-j", "MASQUERADE", "-w"];
            success &= self.modify_iptables(family, Table::Nat, op, chain, &args, true);
        }
        success
    }

    fn modify_dns_proxy_accept_rule(
        &self,
        family: IpFamily,
        rule: &DnsRedirectionRule,
        op: Command,
    ) -> bool {
        let proxy_addr = rule.proxy_address.to_string();
        let args = ["-d", proxy_addr.as_str(), "-j", "ACCEPT", "-w"];
        self.modify_iptables(
            family,
            Table::Filter,
            op,
            ACCEPT_EGRESS_TO_DNS_PROXY_CHAIN,
            &args,
            true,
        )
    }

    fn modify_dns_redirection_skip_vpn_rule(&self, family: IpFamily, op: Command) -> bool {
        let mut success = true;
        for protocol in ["udp", "tcp"] {
            let args = ["-p", protocol, "--dport", DNS_PORT, "-j", "ACCEPT", "-w"];
            success &= self.modify_iptables(
                family,
                Table::Mangle,
                op,
                SKIP_APPLY_VPN_MARK_CHAIN,
                &args,
                true,
            );
        }
        success
    }

    fn modify_dns_exclude_destination_rule(
        &self,
        family: IpFamily,
        rule: &DnsRedirectionRule,
        op: Command,
        chain: &str,
    ) -> bool {
        let proxy_addr = rule.proxy_address.to_string();
        let mut success = true;
        for protocol in ["udp", "tcp"] {
            let args = [
                "-p",
                protocol,
                "!",
                "-d",
                proxy_addr.as_str(),
                "--dport",
                DNS_PORT,
                "-j",
                "RETURN",
                "-w",
            ];
            success &= self.modify_iptables(family, Table::Nat, op, chain, &args, true);
        }
        success
    }

    pub fn start_dns_redirection(&self, rule: &DnsRedirectionRule) -> Result<(), DatapathError> {
        let _batch = acquire_iptables_batch_mode(&*self.runner);
        let family = rule.family();
        let failed = || {
            Err(DatapathError::Process(ProcessError::CommandFailed(
                "dns redirection".to_string(),
            )))
        };
        match rule.rule_type {
            DnsRedirectionType::Default => {
                if !self.modify_dns_proxy_dnat(
                    family,
                    rule,
                    Command::Append,
                    &rule.input_ifname,
                    REDIRECT_DEFAULT_DNS_CHAIN,
                ) {
                    tracing::error!(input_ifname = %rule.input_ifname, "failed to add DNS DNAT rule");
                    return failed();
                }
            }
            // No datapath changes for ARC: the address is only recorded
            // for re-emission to observers.
            DnsRedirectionType::Arc => {}
            DnsRedirectionType::User => {
                // Keep DNS traffic off the VPN marking pipeline.
                if !self.modify_dns_redirection_skip_vpn_rule(family, Command::Append) {
                    tracing::error!("failed to add VPN skip rule for dns-proxy");
                    return failed();
                }
                // Redirect user (including Chrome) DNS traffic.
                if !self.modify_dns_proxy_dnat(
                    family,
                    rule,
                    Command::Append,
                    "",
                    REDIRECT_USER_DNS_CHAIN,
                ) {
                    tracing::error!("failed to add user DNS DNAT rule");
                    return failed();
                }
                if family == IpFamily::Ipv6
                    && !self.modify_dns_proxy_masquerade(family, Command::Append, SNAT_USER_DNS_CHAIN)
                {
                    tracing::error!("failed to add user DNS MASQUERADE rule");
                    return failed();
                }
                if !self.modify_dns_proxy_accept_rule(family, rule, Command::Append) {
                    tracing::error!(host_ifname = %rule.host_ifname, "failed to add dns-proxy accept rule");
                    return failed();
                }
            }
            DnsRedirectionType::ExcludeDestination => {
                if !self.modify_dns_exclude_destination_rule(
                    family,
                    rule,
                    Command::Insert,
                    REDIRECT_USER_DNS_CHAIN,
                ) {
                    tracing::error!("failed to add user DNS exclude rule");
                    return failed();
                }
                if !self.modify_dns_proxy_accept_rule(family, rule, Command::Append) {
                    tracing::error!(host_ifname = %rule.host_ifname, "failed to add dns-proxy accept rule");
                    return failed();
                }
            }
        }
        Ok(())
    }

    /// Rules are removed one by one rather than by flushing: other
    /// lifeline-fd bound rules live in the same chains.
    pub fn stop_dns_redirection(&self, rule: &DnsRedirectionRule) {
        let _batch = acquire_iptables_batch_mode(&*self.runner);
        let family = rule.family();
        match rule.rule_type {
            DnsRedirectionType::Default => {
                self.modify_dns_proxy_dnat(
                    family,
                    rule,
                    Command::Delete,
                    &rule.input_ifname,
                    REDIRECT_DEFAULT_DNS_CHAIN,
                );
            }
            DnsRedirectionType::Arc => {}
            DnsRedirectionType::User => {
                self.modify_dns_proxy_dnat(family, rule, Command::Delete, "", REDIRECT_USER_DNS_CHAIN);
                self.modify_dns_redirection_skip_vpn_rule(family, Command::Delete);
                if family == IpFamily::Ipv6 {
                    self.modify_dns_proxy_masquerade(family, Command::Delete, SNAT_USER_DNS_CHAIN);
                }
                self.modify_dns_proxy_accept_rule(family, rule, Command::Delete);
            }
            DnsRedirectionType::ExcludeDestination => {
                self.modify_dns_exclude_destination_rule(
                    family,
                    rule,
                    Command::Delete,
                    REDIRECT_USER_DNS_CHAIN,
                );
                self.modify_dns_proxy_accept_rule(family, rule, Command::Delete);
            }
        }
    }

    // ------------------------------------------------------------------
    // Routing device family
    // ------------------------------------------------------------------

    fn add_downstream_interface_rules(
        &self,
        upstream_device: Option<&ShillDevice>,
        int_ifname: &str,
        source: TrafficSource,
        static_ipv6: bool,
    ) {
        let rule_type = forward_firewall_rule_type(source);
        if rule_type == ForwardFirewallRuleType::Tethering {
            if let Some(upstream) = upstream_device {
                // Accept any traffic forwarded between the upstream and
                // downstream interfaces, then drop any other forwarded
                // traffic touching the downstream interface. The upstream
                // interface may legitimately carry other forwarded
                // traffic.
                self.modify_jump_rule(
                    IpFamily::Dual,
                    Table::Filter,
                    Command::Append,
                    FORWARD_TETHERING_CHAIN,
                    "ACCEPT",
                    &upstream.ifname,
                    int_ifname,
                    true,
                );
                self.modify_jump_rule(
                    IpFamily::Dual,
                    Table::Filter,
                    Command::Append,
                    FORWARD_TETHERING_CHAIN,
                    "ACCEPT",
                    int_ifname,
                    &upstream.ifname,
                    true,
                );
                self.modify_jump_rule(
                    IpFamily::Dual,
                    Table::Filter,
                    Command::Append,
                    FORWARD_TETHERING_CHAIN,
                    "DROP",
                    "",
                    int_ifname,
                    true,
                );
                self.modify_jump_rule(
                    IpFamily::Dual,
                    Table::Filter,
                    Command::Append,
                    FORWARD_TETHERING_CHAIN,
                    "DROP",
                    int_ifname,
                    "",
                    true,
                );
            }
        }

        if rule_type == ForwardFirewallRuleType::LocalOnly {
            self.modify_jump_rule(
                IpFamily::Dual,
                Table::Filter,
                Command::Append,
                FORWARD_LOCALONLY_CHAIN,
                "DROP",
                "",
                int_ifname,
                true,
            );
            self.modify_jump_rule(
                IpFamily::Dual,
                Table::Filter,
                Command::Append,
                FORWARD_LOCALONLY_CHAIN,
                "DROP",
                int_ifname,
                "",
                true,
            );
        }

        if rule_type == ForwardFirewallRuleType::Open {
            self.modify_jump_rule(
                IpFamily::Dual,
                Table::Filter,
                Command::Append,
                "FORWARD",
                "ACCEPT",
                "",
                int_ifname,
                true,
            );
        }
        if !is_downstream_network_rule(rule_type) {
            self.modify_jump_rule(
                IpFamily::Dual,
                Table::Filter,
                Command::Append,
                "FORWARD",
                "ACCEPT",
                int_ifname,
                "",
                true,
            );
        }
        if rule_type == ForwardFirewallRuleType::IsolatedGuest {
            self.modify_isolated_guest_drop_rule(Command::Append, int_ifname);
        }

        let subchain = prerouting_subchain_name(int_ifname);
        // Chain creation can fail if a previous run did not clean up
        // after itself; flushing afterwards covers that case.
        if !self.add_chain(IpFamily::Dual, Table::Mangle, &subchain) {
            tracing::error!(subchain, "failed to create mangle chain");
        }
        if !self.flush_chain(IpFamily::Dual, Table::Mangle, &subchain) {
            tracing::error!(subchain, "could not flush chain");
        }
        self.modify_jump_rule(
            IpFamily::Dual,
            Table::Mangle,
            Command::Append,
            "PREROUTING",
            &subchain,
            int_ifname,
            "",
            true,
        );

        // IPv4 traffic from all downstream interfaces should be tagged to
        // go through SNAT.
        if !self.modify_fwmark(
            IpFamily::Ipv4,
            &subchain,
            Command::Append,
            "",
            fwmark::LEGACY_SNAT,
            fwmark::LEGACY_SNAT,
            true,
        ) {
            tracing::error!(int_ifname, "failed to add fwmark SNAT tagging rule");
        }
        // Same for IPv6 when NAT66 is in use for this downstream.
        if static_ipv6
            && !self.modify_fwmark(
                IpFamily::Ipv6,
                &subchain,
                Command::Append,
                "",
                fwmark::LEGACY_SNAT,
                fwmark::LEGACY_SNAT,
                true,
            )
        {
            tracing::error!(int_ifname, "failed to add fwmark SNAT tagging rule");
        }

        // Restore the source bits saved in the connmark: per-connection
        // source tags always win over the interface default.
        if !self.modify_connmark_restore(
            IpFamily::Dual,
            &subchain,
            Command::Append,
            "",
            fwmark::ALL_SOURCES_MASK,
        ) {
            tracing::error!(subchain, "failed to add CONNMARK restore rule");
        }

        // If the restore produced a known source tag, keep it; otherwise
        // fall through to the interface's default source tag.
        let unknown = source_fwmark_with_mask(TrafficSource::Unknown);
        self.modify_iptables(
            IpFamily::Dual,
            Table::Mangle,
            Command::Append,
            &subchain,
            &["-m", "mark", "!", "--mark", &unknown, "-j", "RETURN", "-w"],
            true,
        );

        if !self.modify_fwmark_source_tag(&subchain, Command::Append, source) {
            tracing::error!(%source, subchain, "failed to add fwmark tagging rule for source");
        }
    }

    /// Routes `int_ifname` through the specific upstream `shill_device`
    /// by pinning its routing fwmark.
    pub fn start_routing_device(
        &self,
        shill_device: &ShillDevice,
        int_ifname: &str,
        source: TrafficSource,
        static_ipv6: bool,
    ) -> Result<(), DatapathError> {
        let _batch = acquire_iptables_batch_mode(&*self.runner);

        let ext_ifname = &shill_device.ifname;
        self.add_downstream_interface_rules(Some(shill_device), int_ifname, source, static_ipv6);

        let ifindex = self.system.ifindex(ext_ifname)?;
        let routing_mark = Fwmark::from_ifindex(ifindex)
            .ok_or_else(|| DatapathError::RoutingTagOverflow(ext_ifname.clone()))?;

        let subchain = prerouting_subchain_name(int_ifname);
        if !self.modify_fwmark_routing_tag(&subchain, Command::Append, routing_mark) {
            tracing::error!(ext_ifname, int_ifname, subchain, "failed to add fwmark routing tag");
        }
        Ok(())
    }

    /// Routes `int_ifname` through the default physical network: only a
    /// CONNMARK restore of the routing tag, deferring to the kernel
    /// default route otherwise.
    pub fn start_routing_device_as_system(
        &self,
        int_ifname: &str,
        source: TrafficSource,
        static_ipv6: bool,
    ) {
        let _batch = acquire_iptables_batch_mode(&*self.runner);
        self.add_downstream_interface_rules(None, int_ifname, source, static_ipv6);

        let subchain = prerouting_subchain_name(int_ifname);
        if !self.modify_connmark_restore(
            IpFamily::Dual,
            &subchain,
            Command::Append,
            "",
            fwmark::ROUTING_MASK,
        ) {
            tracing::error!(subchain, "failed to add CONNMARK restore rule");
        }
    }

    /// Routes `int_ifname` through the default logical network, making
    /// its traffic eligible for VPN routing.
    #[allow(clippy::too_many_arguments)]
    pub fn start_routing_device_as_user(
        &self,
        int_ifname: &str,
        source: TrafficSource,
        int_ipv4_addr: Ipv4Addr,
        peer_ipv4_addr: Option<Ipv4Addr>,
        int_ipv6_addr: Option<std::net::Ipv6Addr>,
        peer_ipv6_addr: Option<std::net::Ipv6Addr>,
    ) {
        let _batch = acquire_iptables_batch_mode(&*self.runner);
        self.add_downstream_interface_rules(None, int_ifname, source, peer_ipv6_addr.is_some());

        let subchain = prerouting_subchain_name(int_ifname);
        if !self.modify_connmark_restore(
            IpFamily::Dual,
            &subchain,
            Command::Append,
            "",
            fwmark::ROUTING_MASK,
        ) {
            tracing::error!(subchain, "failed to add CONNMARK restore rule");
        }

        // Return traffic between the peer and the host addresses of a
        // connected namespace escapes the VPN marking pipeline so it can
        // reach the local source.
        if let Some(peer) = peer_ipv4_addr {
            let src = peer.to_string();
            let dst = int_ipv4_addr.to_string();
            if self
                .runner
                .iptables(
                    Table::Mangle,
                    Command::Append,
                    &subchain,
                    &["-s", &src, "-d", &dst, "-j", "ACCEPT", "-w"],
                    true,
                )
                .is_err()
            {
                tracing::error!("failed to add connected namespace IPv4 VPN bypass rule");
            }
        }
        if let (Some(peer6), Some(int6)) = (peer_ipv6_addr, int_ipv6_addr) {
            let src = peer6.to_string();
            let dst = int6.to_string();
            if self
                .runner
                .ip6tables(
                    Table::Mangle,
                    Command::Append,
                    &subchain,
                    &["-s", &src, "-d", &dst, "-j", "ACCEPT", "-w"],
                    true,
                )
                .is_err()
            {
                tracing::error!("failed to add connected namespace IPv6 VPN bypass rule");
            }
        }

        // DNS-following connected namespaces (identified by a known peer
        // address) must not skip VPN marking for DNS.
        if peer_ipv4_addr.is_none() {
            self.modify_jump_rule(
                IpFamily::Dual,
                Table::Mangle,
                Command::Append,
                &subchain,
                SKIP_APPLY_VPN_MARK_CHAIN,
                "",
                "",
                true,
            );
        }

        if !self.modify_fwmark_vpn_jump_rule(&subchain, Command::Append, None) {
            tracing::error!(int_ifname, "failed to add jump rule to VPN chain");
        }
    }

    pub fn stop_routing_device(&self, int_ifname: &str, source: TrafficSource) {
        let _batch = acquire_iptables_batch_mode(&*self.runner);

        let rule_type = forward_firewall_rule_type(source);
        if rule_type == ForwardFirewallRuleType::Tethering {
            // There is a single unique tethering setup across the device,
            // so flushing removes exactly the rules added at start.
            self.flush_chain(IpFamily::Dual, Table::Filter, FORWARD_TETHERING_CHAIN);
        }
        if rule_type == ForwardFirewallRuleType::LocalOnly {
            self.flush_chain(IpFamily::Dual, Table::Filter, FORWARD_LOCALONLY_CHAIN);
        }
        if rule_type == ForwardFirewallRuleType::Open {
            self.modify_jump_rule(
                IpFamily::Dual,
                Table::Filter,
                Command::Delete,
                "FORWARD",
                "ACCEPT",
                "",
                int_ifname,
                true,
            );
        }
        if !is_downstream_network_rule(rule_type) {
            self.modify_jump_rule(
                IpFamily::Dual,
                Table::Filter,
                Command::Delete,
                "FORWARD",
                "ACCEPT",
                int_ifname,
                "",
                true,
            );
        }
        if rule_type == ForwardFirewallRuleType::IsolatedGuest {
            self.modify_isolated_guest_drop_rule(Command::Delete, int_ifname);
        }

        let subchain = prerouting_subchain_name(int_ifname);
        self.modify_jump_rule(
            IpFamily::Dual,
            Table::Mangle,
            Command::Delete,
            "PREROUTING",
            &subchain,
            int_ifname,
            "",
            true,
        );
        self.flush_chain(IpFamily::Dual, Table::Mangle, &subchain);
        self.remove_chain(IpFamily::Dual, Table::Mangle, &subchain);
    }

    fn modify_isolated_guest_drop_rule(&self, op: Command, ifname: &str) -> bool {
        let mut success = true;
        success &= self.modify_iptables(
            IpFamily::Dual,
            Table::Filter,
            op,
            DROP_FORWARD_TO_BRUSCHETTA_CHAIN,
            &["-o", ifname, "-j", "DROP", "-w"],
            true,
        );
        success &= self.modify_iptables(
            IpFamily::Dual,
            Table::Filter,
            op,
            DROP_OUTPUT_TO_BRUSCHETTA_CHAIN,
            &["-m", "state", "--state", "NEW", "-o", ifname, "-j", "DROP", "-w"],
            true,
        );
        success
    }

    // ------------------------------------------------------------------
    // Inbound auto-DNAT
    // ------------------------------------------------------------------

    pub fn add_inbound_ipv4_dnat(
        &self,
        target: AutoDnatTarget,
        shill_device: &ShillDevice,
        ipv4_addr: Ipv4Addr,
    ) {
        let addr = ipv4_addr.to_string();
        let chain = target.chain();
        let ifname = &shill_device.ifname;
        let mut success = true;
        // Direct ingress IP traffic to existing sockets.
        success &= self
            .runner
            .iptables(
                Table::Nat,
                Command::Append,
                chain,
                &["-i", ifname, "-m", "socket", "--nowildcard", "-j", "ACCEPT", "-w"],
                true,
            )
            .is_ok();
        // Direct ingress TCP & UDP traffic to the guest for new
        // connections.
        for proto in ["tcp", "udp"] {
            success &= self
                .runner
                .iptables(
                    Table::Nat,
                    Command::Append,
                    chain,
                    &["-i", ifname, "-p", proto, "-j", "DNAT", "--to-destination", &addr, "-w"],
                    true,
                )
                .is_ok();
        }
        if !success {
            tracing::error!(ifname, addr, "failed to configure ingress DNAT rules");
            self.remove_inbound_ipv4_dnat(target, shill_device, ipv4_addr);
        }
    }

    pub fn remove_inbound_ipv4_dnat(
        &self,
        target: AutoDnatTarget,
        shill_device: &ShillDevice,
        ipv4_addr: Ipv4Addr,
    ) {
        let addr = ipv4_addr.to_string();
        let chain = target.chain();
        let ifname = &shill_device.ifname;
        for proto in ["udp", "tcp"] {
            let _ = self.runner.iptables(
                Table::Nat,
                Command::Delete,
                chain,
                &["-i", ifname, "-p", proto, "-j", "DNAT", "--to-destination", &addr, "-w"],
                true,
            );
        }
        let _ = self.runner.iptables(
            Table::Nat,
            Command::Delete,
            chain,
            &["-i", ifname, "-m", "socket", "--nowildcard", "-j", "ACCEPT", "-w"],
            true,
        );
    }

    // ------------------------------------------------------------------
    // System DNS redirection for physical networks
    // ------------------------------------------------------------------

    pub fn add_redirect_dns_rule(
        &self,
        shill_device: &ShillDevice,
        dns_ipv4_addr: Ipv4Addr,
    ) -> bool {
        let mut success = self.remove_redirect_dns_rule(shill_device);
        // Insert so that the new DNS address is matched first.
        success &= self.modify_redirect_dns_dnat_rule(
            Command::Insert,
            "tcp",
            &shill_device.ifname,
            dns_ipv4_addr,
        );
        success &= self.modify_redirect_dns_dnat_rule(
            Command::Insert,
            "udp",
            &shill_device.ifname,
            dns_ipv4_addr,
        );
        self.physical_dns_addresses
            .borrow_mut()
            .insert(shill_device.ifname.clone(), dns_ipv4_addr);
        success
    }

    pub fn remove_redirect_dns_rule(&self, shill_device: &ShillDevice) -> bool {
        let addr = {
            let map = self.physical_dns_addresses.borrow();
            match map.get(&shill_device.ifname) {
                Some(addr) => *addr,
                None => return true,
            }
        };
        let mut success = true;
        success &=
            self.modify_redirect_dns_dnat_rule(Command::Delete, "tcp", &shill_device.ifname, addr);
        success &=
            self.modify_redirect_dns_dnat_rule(Command::Delete, "udp", &shill_device.ifname, addr);
        self.physical_dns_addresses
            .borrow_mut()
            .remove(&shill_device.ifname);
        success
    }

    fn modify_redirect_dns_dnat_rule(
        &self,
        op: Command,
        protocol: &str,
        ifname: &str,
        dns_ipv4_addr: Ipv4Addr,
    ) -> bool {
        let addr = dns_ipv4_addr.to_string();
        let args = [
            "-p",
            protocol,
            "--dport",
            DNS_PORT,
            "-o",
            ifname,
            "-j",
            "DNAT",
            "--to-destination",
            &addr,
            "-w",
        ];
        self.modify_iptables(
            IpFamily::Ipv4,
            Table::Nat,
            op,
            REDIRECT_DNS_CHAIN,
            &args,
            true,
        )
    }

    fn modify_redirect_dns_jump_rule(
        &self,
        family: IpFamily,
        op: Command,
        chain: &str,
        target_chain: &str,
        mark: Fwmark,
        mask: Fwmark,
        redirect_on_mark: bool,
    ) -> bool {
        let mark_str = mark.with_mask(mask);
        let mut args: Vec<&str> = Vec::new();
        if mark.value() != 0 && mask.value() != 0 {
            args.extend_from_slice(&["-m", "mark"]);
            if !redirect_on_mark {
                args.push("!");
            }
            args.extend_from_slice(&["--mark", &mark_str]);
        }
        args.extend_from_slice(&["-j", target_chain, "-w"]);
        self.modify_iptables(family, Table::Nat, op, chain, &args, true)
    }

    // ------------------------------------------------------------------
    // Connection pinning
    // ------------------------------------------------------------------

    /// Pins new connections egressing `shill_device` to that device by
    /// saving its routing tag into the connmark, and restores the source
    /// tag for returning ingress traffic.
    pub fn start_connection_pinning(&self, shill_device: &ShillDevice) {
        let _batch = acquire_iptables_batch_mode(&*self.runner);

        let ext_ifname = &shill_device.ifname;
        let ifindex = match self.system.ifindex(ext_ifname) {
            Ok(ifindex) => ifindex,
            Err(error) => {
                // Can happen if the interface has already been removed.
                tracing::error!(%error, ext_ifname, "failed to set up connection pinning");
                return;
            }
        };
        let Some(routing_mark) = Fwmark::from_ifindex(ifindex) else {
            tracing::error!(ext_ifname, ifindex, "failed to compute fwmark value of interface");
            return;
        };

        let subchain = postrouting_subchain_name(ext_ifname);
        if !self.add_chain(IpFamily::Dual, Table::Mangle, &subchain) {
            tracing::error!(subchain, "failed to create mangle chain");
        }
        if !self.flush_chain(IpFamily::Dual, Table::Mangle, &subchain) {
            tracing::error!(subchain, "could not flush chain");
        }
        self.modify_jump_rule(
            IpFamily::Dual,
            Table::Mangle,
            Command::Append,
            "POSTROUTING",
            &subchain,
            "",
            ext_ifname,
            true,
        );

        tracing::info!(ext_ifname, fwmark = %routing_mark, "start connection pinning");
        // Set in CONNMARK the routing tag associated with the device.
        if !self.modify_connmark_set(
            IpFamily::Dual,
            &subchain,
            Command::Append,
            routing_mark,
            fwmark::ROUTING_MASK,
        ) {
            tracing::error!(ext_ifname, "could not start connection pinning");
        }
        // Save in CONNMARK the source tag of egress traffic.
        if !self.modify_connmark_save(
            IpFamily::Dual,
            &subchain,
            Command::Append,
            fwmark::ALL_SOURCES_MASK,
        ) {
            tracing::error!(ext_ifname, "failed to add CONNMARK rule for saving fwmark source tag");
        }
        // Restore from CONNMARK the source tag of returning ingress
        // traffic.
        if !self.modify_connmark_restore(
            IpFamily::Dual,
            "PREROUTING",
            Command::Append,
            ext_ifname,
            fwmark::ALL_SOURCES_MASK,
        ) {
            tracing::error!(ext_ifname, "could not setup fwmark source tagging rule for return traffic");
        }
    }

    pub fn stop_connection_pinning(&self, shill_device: &ShillDevice) {
        let _batch = acquire_iptables_batch_mode(&*self.runner);

        let ext_ifname = &shill_device.ifname;
        let subchain = postrouting_subchain_name(ext_ifname);
        self.modify_jump_rule(
            IpFamily::Dual,
            Table::Mangle,
            Command::Delete,
            "POSTROUTING",
            &subchain,
            "",
            ext_ifname,
            true,
        );
        self.flush_chain(IpFamily::Dual, Table::Mangle, &subchain);
        self.remove_chain(IpFamily::Dual, Table::Mangle, &subchain);
        if !self.modify_connmark_restore(
            IpFamily::Dual,
            "PREROUTING",
            Command::Delete,
            ext_ifname,
            fwmark::ALL_SOURCES_MASK,
        ) {
            tracing::error!(ext_ifname, "could not remove fwmark source tagging rule for return traffic");
        }
    }

    // ------------------------------------------------------------------
    // VPN routing and lockdown
    // ------------------------------------------------------------------

    pub fn start_vpn_routing(&self, vpn_device: &ShillDevice) {
        let vpn_ifname = &vpn_device.ifname;
        let ifindex = match self.system.ifindex(vpn_ifname) {
            Ok(ifindex) => ifindex,
            Err(error) => {
                tracing::error!(%error, vpn_ifname, "failed to start VPN routing");
                return;
            }
        };
        let Some(routing_mark) = Fwmark::from_ifindex(ifindex) else {
            tracing::error!(vpn_ifname, ifindex, "failed to compute fwmark value of interface");
            return;
        };

        tracing::info!(vpn_ifname, fwmark = %routing_mark, "start VPN routing");
        self.modify_jump_rule(
            IpFamily::Ipv4,
            Table::Nat,
            Command::Append,
            "POSTROUTING",
            "MASQUERADE",
            "",
            vpn_ifname,
            true,
        );
        self.start_connection_pinning(vpn_device);

        // Traffic that already carries a routing tag is left alone; any
        // new connection gets marked with the VPN routing tag.
        let unrouted = Fwmark::default().with_mask(fwmark::ROUTING_MASK);
        if !self.modify_iptables(
            IpFamily::Dual,
            Table::Mangle,
            Command::Append,
            APPLY_VPN_MARK_CHAIN,
            &["-m", "mark", "!", "--mark", &unrouted, "-j", "ACCEPT", "-w"],
            true,
        ) {
            tracing::error!("failed to add ACCEPT rule to VPN tagging chain for marked connections");
        }
        if !self.modify_fwmark_routing_tag(APPLY_VPN_MARK_CHAIN, Command::Append, routing_mark) {
            tracing::error!(vpn_ifname, "failed to set up VPN set-mark rule");
        }

        // When the VPN client runs on the host, also route arcbr0 to the
        // VPN so that ARC sees the VPN network through arc0.
        if vpn_ifname != ARCBR0_IFNAME {
            if let Err(error) =
                self.start_routing_device(vpn_device, ARCBR0_IFNAME, TrafficSource::Arc, false)
            {
                tracing::error!(%error, "failed to route arcbr0 through the VPN");
            }
        }
        if !self.modify_redirect_dns_jump_rule(
            IpFamily::Ipv4,
            Command::Append,
            "OUTPUT",
            REDIRECT_DNS_CHAIN,
            fwmark::ROUTE_ON_VPN,
            fwmark::VPN_MASK,
            false,
        ) {
            tracing::error!("failed to set jump rule to {REDIRECT_DNS_CHAIN}");
        }

        // Traffic bearing the VPN routing tag is explicitly accepted in
        // the filter table, before vpn_lockdown can reject it.
        let vpn_mark = routing_mark.with_mask(fwmark::ROUTING_MASK);
        if !self.modify_iptables(
            IpFamily::Dual,
            Table::Filter,
            Command::Append,
            VPN_ACCEPT_CHAIN,
            &["-m", "mark", "--mark", &vpn_mark, "-j", "ACCEPT", "-w"],
            true,
        ) {
            tracing::error!("failed to set filter rule for accepting VPN marked traffic");
        }
    }

    pub fn stop_vpn_routing(&self, vpn_device: &ShillDevice) {
        let vpn_ifname = &vpn_device.ifname;
        tracing::info!(vpn_ifname, "stop VPN routing");
        if !self.flush_chain(IpFamily::Dual, Table::Filter, VPN_ACCEPT_CHAIN) {
            tracing::error!("could not flush {VPN_ACCEPT_CHAIN}");
        }
        if vpn_ifname != ARCBR0_IFNAME {
            self.stop_routing_device(ARCBR0_IFNAME, TrafficSource::Arc);
        }
        if !self.flush_chain(IpFamily::Dual, Table::Mangle, APPLY_VPN_MARK_CHAIN) {
            tracing::error!("could not flush {APPLY_VPN_MARK_CHAIN}");
        }
        self.stop_connection_pinning(vpn_device);
        self.modify_jump_rule(
            IpFamily::Ipv4,
            Table::Nat,
            Command::Delete,
            "POSTROUTING",
            "MASQUERADE",
            "",
            vpn_ifname,
            true,
        );
        if !self.modify_redirect_dns_jump_rule(
            IpFamily::Ipv4,
            Command::Delete,
            "OUTPUT",
            REDIRECT_DNS_CHAIN,
            fwmark::ROUTE_ON_VPN,
            fwmark::VPN_MASK,
            false,
        ) {
            tracing::error!("failed to remove jump rule to {REDIRECT_DNS_CHAIN}");
        }
    }

    pub fn set_vpn_lockdown(&self, enable_vpn_lockdown: bool) {
        if enable_vpn_lockdown {
            let mark = fwmark::ROUTE_ON_VPN.with_mask(fwmark::VPN_MASK);
            if !self.modify_iptables(
                IpFamily::Dual,
                Table::Filter,
                Command::Append,
                VPN_LOCKDOWN_CHAIN,
                &["-m", "mark", "--mark", &mark, "-j", "REJECT", "-w"],
                true,
            ) {
                tracing::error!("failed to start VPN lockdown mode");
            }
        } else if !self.flush_chain(IpFamily::Dual, Table::Filter, VPN_LOCKDOWN_CHAIN) {
            tracing::error!("failed to stop VPN lockdown mode");
        }
    }

    // ------------------------------------------------------------------
    // Source IPv6 prefix enforcement
    // ------------------------------------------------------------------

    pub fn start_source_ipv6_prefix_enforcement(&self, shill_device: &ShillDevice) {
        let subchain = egress_subchain_name(&shill_device.ifname);
        if !self.add_chain(IpFamily::Ipv6, Table::Filter, &subchain) {
            tracing::error!(subchain, "failed to create chain");
            return;
        }
        if !self.modify_jump_rule(
            IpFamily::Ipv6,
            Table::Filter,
            Command::Insert,
            "OUTPUT",
            &subchain,
            "",
            &shill_device.ifname,
            true,
        ) {
            return;
        }
        // Until a prefix RETURN rule is installed, all IPv6 egress on the
        // device drops through enforce_ipv6_src_prefix.
        self.update_source_enforcement_ipv6_prefix(shill_device, None);
    }

    pub fn stop_source_ipv6_prefix_enforcement(&self, shill_device: &ShillDevice) {
        let subchain = egress_subchain_name(&shill_device.ifname);
        if !self.flush_chain(IpFamily::Ipv6, Table::Filter, &subchain) {
            tracing::error!(subchain, "failed to flush chain");
        }
        if !self.modify_jump_rule(
            IpFamily::Ipv6,
            Table::Filter,
            Command::Delete,
            "OUTPUT",
            &subchain,
            "",
            &shill_device.ifname,
            true,
        ) {
            return;
        }
        if !self.remove_chain(IpFamily::Ipv6, Table::Filter, &subchain) {
            tracing::error!(subchain, "failed to remove chain");
        }
    }

    pub fn update_source_enforcement_ipv6_prefix(
        &self,
        shill_device: &ShillDevice,
        prefix: Option<&Ipv6Cidr>,
    ) {
        let subchain = egress_subchain_name(&shill_device.ifname);
        if !self.flush_chain(IpFamily::Ipv6, Table::Filter, &subchain) {
            tracing::error!(subchain, "failed to flush chain");
        }
        if let Some(prefix) = prefix {
            let prefix_str = prefix.to_string();
            if !self.modify_iptables(
                IpFamily::Ipv6,
                Table::Filter,
                Command::Append,
                &subchain,
                &["-s", &prefix_str, "-j", "RETURN", "-w"],
                true,
            ) {
                tracing::error!(prefix_str, subchain, "failed to add RETURN rule");
            }
        }
        self.modify_jump_rule(
            IpFamily::Ipv6,
            Table::Filter,
            Command::Append,
            &subchain,
            ENFORCE_SOURCE_PREFIX_CHAIN,
            "",
            "",
            true,
        );
    }

    // ------------------------------------------------------------------
    // Downstream networks (tethering / local only)
    // ------------------------------------------------------------------

    pub fn start_downstream_network(
        &self,
        info: &DownstreamNetworkInfo,
    ) -> Result<(), DatapathError> {
        match info.topology {
            DownstreamTopology::Tethering if info.upstream_device.is_none() => {
                return Err(DatapathError::MissingUpstream);
            }
            DownstreamTopology::LocalOnly if info.upstream_device.is_some() => {
                return Err(DatapathError::UnexpectedUpstream);
            }
            _ => {}
        }

        self.configure_interface(
            &info.downstream_ifname,
            None,
            info.ipv4_cidr,
            None,
            true,
            true,
        )
        .map_err(|error| {
            tracing::error!(downstream = %info.downstream_ifname, "cannot configure downstream interface");
            error
        })?;

        if !self.modify_jump_rule(
            IpFamily::Dual,
            Table::Filter,
            Command::Insert,
            "OUTPUT",
            info.egress_chain(),
            "",
            &info.downstream_ifname,
            true,
        ) {
            return Err(DatapathError::Process(ProcessError::CommandFailed(
                "downstream egress jump".to_string(),
            )));
        }
        if !self.modify_jump_rule(
            IpFamily::Dual,
            Table::Filter,
            Command::Insert,
            INGRESS_DOWNSTREAM_NETWORK_CHAIN,
            info.ingress_chain(),
            &info.downstream_ifname,
            "",
            true,
        ) {
            self.modify_jump_rule(
                IpFamily::Dual,
                Table::Filter,
                Command::Delete,
                "OUTPUT",
                info.egress_chain(),
                "",
                &info.downstream_ifname,
                true,
            );
            return Err(DatapathError::Process(ProcessError::CommandFailed(
                "downstream ingress jump".to_string(),
            )));
        }

        match info.topology {
            DownstreamTopology::LocalOnly => {
                // Routed as the system for now; a dedicated local-only
                // routing mode would prevent any forwarding to external
                // networks.
                self.start_routing_device_as_system(
                    &info.downstream_ifname,
                    info.traffic_source(),
                    false,
                );
            }
            DownstreamTopology::Tethering => {
                let upstream = info.upstream_device.as_ref().expect("validated above");
                self.start_routing_device(
                    upstream,
                    &info.downstream_ifname,
                    info.traffic_source(),
                    false,
                )?;
            }
        }
        Ok(())
    }

    pub fn stop_downstream_network(&self, info: &DownstreamNetworkInfo) {
        match info.topology {
            DownstreamTopology::Tethering if info.upstream_device.is_none() => {
                tracing::error!(downstream = %info.downstream_ifname, "no upstream device defined");
                return;
            }
            DownstreamTopology::LocalOnly if info.upstream_device.is_some() => {
                tracing::error!(downstream = %info.downstream_ifname, "invalid upstream device argument");
                return;
            }
            _ => {}
        }
        // The downstream interface itself is left configured: shill will
        // either destroy it or flip it back to client mode.
        self.stop_routing_device(&info.downstream_ifname, info.traffic_source());
        self.modify_jump_rule(
            IpFamily::Dual,
            Table::Filter,
            Command::Delete,
            "OUTPUT",
            info.egress_chain(),
            "",
            &info.downstream_ifname,
            true,
        );
        self.modify_jump_rule(
            IpFamily::Dual,
            Table::Filter,
            Command::Delete,
            INGRESS_DOWNSTREAM_NETWORK_CHAIN,
            info.ingress_chain(),
            &info.downstream_ifname,
            "",
            true,
        );
    }

    // ------------------------------------------------------------------
    // QoS
    // ------------------------------------------------------------------

    pub fn enable_qos_detection(&self) {
        self.modify_qos_detect_jump_rule(Command::Append);
    }

    pub fn disable_qos_detection(&self) {
        self.modify_qos_detect_jump_rule(Command::Delete);
    }

    pub fn enable_qos_applying_dscp(&self, ifname: &str) {
        tracing::info!(ifname, "enable QoS DSCP application");
        self.modify_qos_apply_dscp_jump_rule(Command::Append, ifname);
    }

    pub fn disable_qos_applying_dscp(&self, ifname: &str) {
        tracing::info!(ifname, "disable QoS DSCP application");
        self.modify_qos_apply_dscp_jump_rule(Command::Delete, ifname);
    }

    fn modify_qos_detect_jump_rule(&self, op: Command) {
        self.modify_iptables(
            IpFamily::Dual,
            Table::Mangle,
            op,
            QOS_DETECT_STATIC_CHAIN,
            &["-j", QOS_DETECT_CHAIN, "-w"],
            true,
        );
    }

    fn modify_qos_apply_dscp_jump_rule(&self, op: Command, ifname: &str) {
        self.modify_iptables(
            IpFamily::Dual,
            Table::Mangle,
            op,
            "POSTROUTING",
            &["-o", ifname, "-j", QOS_APPLY_DSCP_CHAIN, "-w"],
            true,
        );
    }

    pub fn add_borealis_qos_rule(&self, ifname: &str) {
        let mark = qos_fwmark_with_mask(QosCategory::RealTimeInteractive);
        self.modify_iptables(
            IpFamily::Dual,
            Table::Mangle,
            Command::Append,
            QOS_DETECT_BOREALIS_CHAIN,
            &["-i", ifname, "-j", "MARK", "--set-xmark", &mark, "-w"],
            true,
        );
    }

    pub fn remove_borealis_qos_rule(&self, ifname: &str) {
        let mark = qos_fwmark_with_mask(QosCategory::RealTimeInteractive);
        self.modify_iptables(
            IpFamily::Dual,
            Table::Mangle,
            Command::Delete,
            QOS_DETECT_BOREALIS_CHAIN,
            &["-i", ifname, "-j", "MARK", "--set-xmark", &mark, "-w"],
            true,
        );
    }

    /// Replaces the DoH provider matching rules of one family. Traffic to
    /// port 443 of these servers is marked as network-control; false
    /// positives on non-DNS HTTPS traffic to the same servers are
    /// accepted.
    pub fn update_doh_providers_for_qos(&self, family: IpFamily, doh_provider_ips: &[IpAddr]) {
        self.flush_chain(family, Table::Mangle, QOS_DETECT_DOH_CHAIN);

        let ips: Vec<String> = doh_provider_ips
            .iter()
            .filter(|ip| match family {
                IpFamily::Ipv4 => ip.is_ipv4(),
                IpFamily::Ipv6 => ip.is_ipv6(),
                IpFamily::Dual => true,
            })
            .map(|ip| ip.to_string())
            .collect();
        if ips.is_empty() {
            return;
        }
        let ip_list = ips.join(",");
        let mark = qos_fwmark_with_mask(QosCategory::NetworkControl);
        for protocol in ["udp", "tcp"] {
            self.modify_iptables(
                family,
                Table::Mangle,
                Command::Append,
                QOS_DETECT_DOH_CHAIN,
                &[
                    "-p", protocol, "--dport", "443", "-d", &ip_list, "-j", "MARK", "--set-xmark",
                    &mark, "-w",
                ],
                true,
            );
        }
    }

    // ------------------------------------------------------------------
    // ADB
    // ------------------------------------------------------------------

    pub fn add_adb_port_forward_rule(&self, ifname: &str) -> bool {
        self.firewall
            .add_ipv4_forward_rule(
                Protocol::Tcp,
                Some(ARC_ADDR),
                ADB_SERVER_PORT,
                ifname,
                LOCALHOST_ADDR,
                ADB_PROXY_TCP_LISTEN_PORT,
            )
            .is_ok()
    }

    pub fn delete_adb_port_forward_rule(&self, ifname: &str) {
        let _ = self.firewall.delete_ipv4_forward_rule(
            Protocol::Tcp,
            Some(ARC_ADDR),
            ADB_SERVER_PORT,
            ifname,
            LOCALHOST_ADDR,
            ADB_PROXY_TCP_LISTEN_PORT,
        );
    }

    pub fn add_adb_port_access_rule(&self, ifname: &str) -> bool {
        self.firewall
            .add_accept_rules(Protocol::Tcp, ADB_PROXY_TCP_LISTEN_PORT, ifname)
            .is_ok()
    }

    pub fn delete_adb_port_access_rule(&self, ifname: &str) {
        let _ = self
            .firewall
            .delete_accept_rules(Protocol::Tcp, ADB_PROXY_TCP_LISTEN_PORT, ifname);
    }

    // ------------------------------------------------------------------
    // Misc sysctl / modules
    // ------------------------------------------------------------------

    pub fn set_conntrack_helpers(&self, enable: bool) -> Result<(), DatapathError> {
        Ok(self
            .system
            .sysnet_set(SysNet::ConntrackHelper, if enable { "1" } else { "0" }, None)?)
    }

    pub fn set_route_localnet(&self, ifname: &str, enable: bool) -> Result<(), DatapathError> {
        Ok(self.system.sysnet_set(
            SysNet::Ipv4RouteLocalnet,
            if enable { "1" } else { "0" },
            Some(ifname),
        )?)
    }

    pub fn modprobe_all(&self, modules: &[&str]) -> Result<(), DatapathError> {
        Ok(self.runner.modprobe_all(modules)?)
    }

    pub fn add_source_ipv4_drop_rule(&self, oif: &str, src_ip: &str) -> bool {
        self.runner
            .iptables(
                Table::Filter,
                Command::Insert,
                DROP_GUEST_IPV4_PREFIX_CHAIN,
                &["-o", oif, "-s", src_ip, "-j", "DROP", "-w"],
                true,
            )
            .is_ok()
    }

    // ------------------------------------------------------------------
    // Port rules
    // ------------------------------------------------------------------

    pub fn modify_port_rule(&self, request: &PortRuleRequest) -> Result<(), DatapathError> {
        let input_dst_port = u16::try_from(request.input_dst_port).map_err(|_| {
            DatapathError::InvalidPortRule(format!(
                "invalid matching destination port {}",
                request.input_dst_port
            ))
        })?;
        let dst_port = u16::try_from(request.dst_port).map_err(|_| {
            DatapathError::InvalidPortRule(format!(
                "invalid forwarding destination port {}",
                request.dst_port
            ))
        })?;
        if request.rule_type == PortRuleType::Forwarding && request.dst_ip.is_none() {
            return Err(DatapathError::InvalidPortRule(
                "missing forwarding destination address".to_string(),
            ));
        }

        match (request.op, request.rule_type) {
            (PortRuleOp::Create, PortRuleType::Access) => Ok(self.firewall.add_accept_rules(
                request.proto,
                input_dst_port,
                &request.input_ifname,
            )?),
            (PortRuleOp::Create, PortRuleType::Lockdown) => Ok(self
                .firewall
                .add_loopback_lockdown_rules(request.proto, input_dst_port)?),
            (PortRuleOp::Create, PortRuleType::Forwarding) => {
                Ok(self.firewall.add_ipv4_forward_rule(
                    request.proto,
                    request.input_dst_ip,
                    input_dst_port,
                    &request.input_ifname,
                    request.dst_ip.expect("validated above"),
                    dst_port,
                )?)
            }
            (PortRuleOp::Delete, PortRuleType::Access) => Ok(self.firewall.delete_accept_rules(
                request.proto,
                input_dst_port,
                &request.input_ifname,
            )?),
            (PortRuleOp::Delete, PortRuleType::Lockdown) => Ok(self
                .firewall
                .delete_loopback_lockdown_rules(request.proto, input_dst_port)?),
            (PortRuleOp::Delete, PortRuleType::Forwarding) => {
                Ok(self.firewall.delete_ipv4_forward_rule(
                    request.proto,
                    request.input_dst_ip,
                    input_dst_port,
                    &request.input_ifname,
                    request.dst_ip.expect("validated above"),
                    dst_port,
                )?)
            }
        }
    }

    // ------------------------------------------------------------------
    // Fwmark / connmark / chain helpers
    // ------------------------------------------------------------------

    fn modify_connmark_set(
        &self,
        family: IpFamily,
        chain: &str,
        op: Command,
        mark: Fwmark,
        mask: Fwmark,
    ) -> bool {
        let mark_str = mark.with_mask(mask);
        self.modify_iptables(
            family,
            Table::Mangle,
            op,
            chain,
            &["-j", "CONNMARK", "--set-mark", &mark_str, "-w"],
            true,
        )
    }

    fn modify_connmark_restore(
        &self,
        family: IpFamily,
        chain: &str,
        op: Command,
        iif: &str,
        mask: Fwmark,
    ) -> bool {
        let mask_str = mask.to_string();
        let mut args: Vec<&str> = Vec::new();
        if !iif.is_empty() {
            args.extend_from_slice(&["-i", iif]);
        }
        args.extend_from_slice(&["-j", "CONNMARK", "--restore-mark", "--mask", &mask_str, "-w"]);
        self.modify_iptables(family, Table::Mangle, op, chain, &args, true)
    }

    fn modify_connmark_save(
        &self,
        family: IpFamily,
        chain: &str,
        op: Command,
        mask: Fwmark,
    ) -> bool {
        let mask_str = mask.to_string();
        self.modify_iptables(
            family,
            Table::Mangle,
            op,
            chain,
            &["-j", "CONNMARK", "--save-mark", "--mask", &mask_str, "-w"],
            true,
        )
    }

    fn modify_fwmark_routing_tag(&self, chain: &str, op: Command, routing_mark: Fwmark) -> bool {
        self.modify_fwmark(
            IpFamily::Dual,
            chain,
            op,
            "",
            routing_mark,
            fwmark::ROUTING_MASK,
            true,
        )
    }

    fn modify_fwmark_source_tag(&self, chain: &str, op: Command, source: TrafficSource) -> bool {
        self.modify_fwmark(
            IpFamily::Dual,
            chain,
            op,
            "",
            Fwmark::from_source(source),
            fwmark::ALL_SOURCES_MASK,
            true,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn modify_fwmark(
        &self,
        family: IpFamily,
        chain: &str,
        op: Command,
        iif: &str,
        mark: Fwmark,
        mask: Fwmark,
        log_failures: bool,
    ) -> bool {
        let mark_str = mark.with_mask(mask);
        let mut args: Vec<&str> = Vec::new();
        if !iif.is_empty() {
            args.extend_from_slice(&["-i", iif]);
        }
        args.extend_from_slice(&["-j", "MARK", "--set-mark", &mark_str, "-w"]);
        self.modify_iptables(family, Table::Mangle, op, chain, &args, log_failures)
    }

    #[allow(clippy::too_many_arguments)]
    fn modify_jump_rule(
        &self,
        family: IpFamily,
        table: Table,
        op: Command,
        chain: &str,
        target: &str,
        iif: &str,
        oif: &str,
        log_failures: bool,
    ) -> bool {
        let mut args: Vec<&str> = Vec::new();
        if !iif.is_empty() {
            args.extend_from_slice(&["-i", iif]);
        }
        if !oif.is_empty() {
            args.extend_from_slice(&["-o", oif]);
        }
        args.extend_from_slice(&["-j", target, "-w"]);
        let success = self.modify_iptables(family, table, op, chain, &args, log_failures);
        if !success && log_failures {
            tracing::error!(%family, %table, %op, chain, iif, oif, target, "jump rule modification failed");
        }
        success
    }

    fn modify_fwmark_vpn_jump_rule(
        &self,
        chain: &str,
        op: Command,
        mark_and_mask: Option<(Fwmark, Fwmark)>,
    ) -> bool {
        let mut args: Vec<&str> = Vec::new();
        let mark_str;
        if let Some((mark, mask)) = mark_and_mask {
            if mark.value() != 0 && mask.value() != 0 {
                mark_str = mark.with_mask(mask);
                args.extend_from_slice(&["-m", "mark", "--mark", &mark_str]);
            }
        }
        args.extend_from_slice(&["-j", APPLY_VPN_MARK_CHAIN, "-w"]);
        self.modify_iptables(IpFamily::Dual, Table::Mangle, op, chain, &args, true)
    }

    pub fn check_chain(&self, family: IpFamily, table: Table, chain: &str) -> bool {
        self.modify_chain(family, table, Command::Check, chain, false)
    }

    pub fn add_chain(&self, family: IpFamily, table: Table, chain: &str) -> bool {
        assert!(
            chain.len() <= IPTABLES_MAX_CHAIN_LENGTH,
            "chain name {chain} is longer than {IPTABLES_MAX_CHAIN_LENGTH}"
        );
        self.modify_chain(family, table, Command::NewChain, chain, true)
    }

    pub fn remove_chain(&self, family: IpFamily, table: Table, chain: &str) -> bool {
        self.modify_chain(family, table, Command::DeleteChain, chain, true)
    }

    pub fn flush_chain(&self, family: IpFamily, table: Table, chain: &str) -> bool {
        self.modify_chain(family, table, Command::Flush, chain, true)
    }

    fn modify_chain(
        &self,
        family: IpFamily,
        table: Table,
        command: Command,
        chain: &str,
        log_failures: bool,
    ) -> bool {
        self.modify_iptables(family, table, command, chain, &["-w"], log_failures)
    }

    fn modify_iptables(
        &self,
        family: IpFamily,
        table: Table,
        command: Command,
        chain: &str,
        args: &[&str],
        log_failures: bool,
    ) -> bool {
        let mut success = true;
        if family.has_ipv4() {
            success &= self
                .runner
                .iptables(table, command, chain, args, log_failures)
                .is_ok();
        }
        if family.has_ipv6() {
            success &= self
                .runner
                .ip6tables(table, command, chain, args, log_failures)
                .is_ok();
        }
        success
    }

    /// Textual `-L -x -v -n -w` dump of one family and table. Debug only.
    pub fn dump_iptables(&self, family: IpFamily, table: Table) -> String {
        let ipv6 = match family {
            IpFamily::Ipv4 => false,
            IpFamily::Ipv6 => true,
            IpFamily::Dual => {
                tracing::error!("cannot dump iptables and ip6tables at the same time");
                return String::new();
            }
        };
        match self.runner.iptables_dump(ipv6, table) {
            Ok(dump) => dump,
            Err(error) => {
                tracing::error!(%error, %table, "could not dump iptables");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{FakeProcessRunner, FakeSystem, fake_shill_device};
    use crate::shill::Technology;

    fn datapath(runner: &Rc<FakeProcessRunner>, system: &Rc<FakeSystem>) -> Datapath {
        Datapath::with_scripts(
            Rc::clone(runner) as Rc<dyn ProcessRunner>,
            Rc::clone(system) as Rc<dyn System>,
            PathBuf::from("/tmp/iptables.start"),
            PathBuf::from("/tmp/ip6tables.start"),
        )
    }

    #[test]
    fn start_routing_device_installs_prerouting_subchain() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        system.set_ifindex("eth0", 2);
        let dp = datapath(&runner, &system);

        let eth0 = fake_shill_device("eth0", Technology::Ethernet);
        dp.start_routing_device(&eth0, "arc_eth0", TrafficSource::Arc, false)
            .unwrap();

        let rules = runner.rules(false, Table::Mangle, "PREROUTING_arc_eth0");
        assert_eq!(
            rules,
            vec![
                "-j MARK --set-mark 0x40000000/0x40000000".to_string(),
                "-j CONNMARK --restore-mark --mask 0x00ff0000".to_string(),
                "-m mark ! --mark 0x00000000/0x00ff0000 -j RETURN".to_string(),
                "-j MARK --set-mark 0x00030000/0x00ff0000".to_string(),
                "-j MARK --set-mark 0x00000002/0x0000ffff".to_string(),
            ]
        );
        // The IPv6 side has no SNAT tagging rule without static IPv6.
        let rules6 = runner.rules(true, Table::Mangle, "PREROUTING_arc_eth0");
        assert_eq!(rules6.len(), 4);
        // Jump from the global PREROUTING.
        assert!(
            runner
                .rules(false, Table::Mangle, "PREROUTING")
                .contains(&"-i arc_eth0 -j PREROUTING_arc_eth0".to_string())
        );
        // Open forwarding in both directions.
        let forward = runner.rules(false, Table::Filter, "FORWARD");
        assert!(forward.contains(&"-o arc_eth0 -j ACCEPT".to_string()));
        assert!(forward.contains(&"-i arc_eth0 -j ACCEPT".to_string()));
    }

    #[test]
    fn stop_routing_device_removes_everything_started() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        system.set_ifindex("wlan0", 3);
        let dp = datapath(&runner, &system);

        let before = runner.snapshot();
        let wlan0 = fake_shill_device("wlan0", Technology::Wifi);
        dp.start_routing_device(&wlan0, "vmtap1", TrafficSource::CrostiniVm, false)
            .unwrap();
        dp.stop_routing_device("vmtap1", TrafficSource::CrostiniVm);
        assert_eq!(before, runner.snapshot());
    }

    #[test]
    fn tethering_forward_chain_rule_order() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        system.set_ifindex("rmnet0", 4);
        let dp = datapath(&runner, &system);

        let info = DownstreamNetworkInfo {
            downstream_ifname: "wlan1".to_string(),
            ipv4_cidr: "172.16.16.1/24".parse().unwrap(),
            topology: DownstreamTopology::Tethering,
            upstream_device: Some(fake_shill_device("rmnet0", Technology::Cellular)),
        };
        dp.start_downstream_network(&info).unwrap();

        assert_eq!(
            runner.rules(false, Table::Filter, FORWARD_TETHERING_CHAIN),
            vec![
                "-i rmnet0 -o wlan1 -j ACCEPT".to_string(),
                "-i wlan1 -o rmnet0 -j ACCEPT".to_string(),
                "-o wlan1 -j DROP".to_string(),
                "-i wlan1 -j DROP".to_string(),
            ]
        );
        // Ingress and egress dispatch jumps.
        assert!(
            runner
                .rules(false, Table::Filter, "OUTPUT")
                .contains(&"-o wlan1 -j egress_tethering".to_string())
        );
        assert!(
            runner
                .rules(false, Table::Filter, INGRESS_DOWNSTREAM_NETWORK_CHAIN)
                .contains(&"-i wlan1 -j ingress_tethering".to_string())
        );

        dp.stop_downstream_network(&info);
        assert!(runner.rules(false, Table::Filter, FORWARD_TETHERING_CHAIN).is_empty());
    }

    #[test]
    fn downstream_network_validation() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let dp = datapath(&runner, &system);

        let tethering_without_upstream = DownstreamNetworkInfo {
            downstream_ifname: "wlan1".to_string(),
            ipv4_cidr: "172.16.16.1/24".parse().unwrap(),
            topology: DownstreamTopology::Tethering,
            upstream_device: None,
        };
        assert!(matches!(
            dp.start_downstream_network(&tethering_without_upstream),
            Err(DatapathError::MissingUpstream)
        ));

        let local_only_with_upstream = DownstreamNetworkInfo {
            downstream_ifname: "wlan1".to_string(),
            ipv4_cidr: "172.16.16.1/24".parse().unwrap(),
            topology: DownstreamTopology::LocalOnly,
            upstream_device: Some(fake_shill_device("eth0", Technology::Ethernet)),
        };
        assert!(matches!(
            dp.start_downstream_network(&local_only_with_upstream),
            Err(DatapathError::UnexpectedUpstream)
        ));
    }

    #[test]
    fn vpn_routing_and_lockdown() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        system.set_ifindex("tun0", 5);
        system.set_ifindex(ARCBR0_IFNAME, 6);
        let dp = datapath(&runner, &system);

        let tun0 = fake_shill_device("tun0", Technology::Vpn);
        dp.start_vpn_routing(&tun0);

        // vpn_accept accepts traffic already bearing the VPN routing tag.
        assert_eq!(
            runner.rules(false, Table::Filter, VPN_ACCEPT_CHAIN),
            vec!["-m mark --mark 0x00000005/0x0000ffff -j ACCEPT".to_string()]
        );
        // apply_vpn_mark: accept already-tagged traffic, tag the rest.
        assert_eq!(
            runner.rules(false, Table::Mangle, APPLY_VPN_MARK_CHAIN),
            vec![
                "-m mark ! --mark 0x00000000/0x0000ffff -j ACCEPT".to_string(),
                "-j MARK --set-mark 0x00000005/0x0000ffff".to_string(),
            ]
        );
        // IPv4 masquerade on the VPN interface.
        assert!(
            runner
                .rules(false, Table::Nat, "POSTROUTING")
                .contains(&"-o tun0 -j MASQUERADE".to_string())
        );
        // Connection pinning on the VPN device.
        assert_eq!(
            runner.rules(false, Table::Mangle, "POSTROUTING_tun0"),
            vec![
                "-j CONNMARK --set-mark 0x00000005/0x0000ffff".to_string(),
                "-j CONNMARK --save-mark --mask 0x00ff0000".to_string(),
            ]
        );

        // Lockdown toggling.
        dp.set_vpn_lockdown(true);
        assert_eq!(
            runner.rules(false, Table::Filter, VPN_LOCKDOWN_CHAIN),
            vec!["-m mark --mark 0x01000000/0x03000000 -j REJECT".to_string()]
        );
        dp.set_vpn_lockdown(false);
        assert!(runner.rules(false, Table::Filter, VPN_LOCKDOWN_CHAIN).is_empty());

        dp.stop_vpn_routing(&tun0);
        assert!(runner.rules(false, Table::Filter, VPN_ACCEPT_CHAIN).is_empty());
        assert!(runner.rules(false, Table::Mangle, APPLY_VPN_MARK_CHAIN).is_empty());
        assert!(!runner.has_chain(false, Table::Mangle, "POSTROUTING_tun0"));
    }

    #[test]
    fn user_dns_redirection_rules() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let dp = datapath(&runner, &system);

        let rule = DnsRedirectionRule {
            rule_type: DnsRedirectionType::User,
            input_ifname: String::new(),
            proxy_address: "8.8.4.4".parse().unwrap(),
            host_ifname: "arc_ns0".to_string(),
            nameservers: vec![],
        };
        dp.start_dns_redirection(&rule).unwrap();

        assert_eq!(
            runner.rules(false, Table::Mangle, SKIP_APPLY_VPN_MARK_CHAIN),
            vec![
                "-p udp --dport 53 -j ACCEPT".to_string(),
                "-p tcp --dport 53 -j ACCEPT".to_string(),
            ]
        );
        assert_eq!(
            runner.rules(false, Table::Nat, REDIRECT_USER_DNS_CHAIN),
            vec![
                "-p udp --dport 53 -j DNAT --to-destination 8.8.4.4".to_string(),
                "-p tcp --dport 53 -j DNAT --to-destination 8.8.4.4".to_string(),
            ]
        );
        assert_eq!(
            runner.rules(false, Table::Filter, ACCEPT_EGRESS_TO_DNS_PROXY_CHAIN),
            vec!["-d 8.8.4.4 -j ACCEPT".to_string()]
        );
        // IPv4 rule: no MASQUERADE side.
        assert!(runner.rules(false, Table::Nat, SNAT_USER_DNS_CHAIN).is_empty());

        dp.stop_dns_redirection(&rule);
        assert!(runner.rules(false, Table::Mangle, SKIP_APPLY_VPN_MARK_CHAIN).is_empty());
        assert!(runner.rules(false, Table::Nat, REDIRECT_USER_DNS_CHAIN).is_empty());
        assert!(
            runner
                .rules(false, Table::Filter, ACCEPT_EGRESS_TO_DNS_PROXY_CHAIN)
                .is_empty()
        );
    }

    #[test]
    fn exclude_destination_dns_redirection_inserts_return() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let dp = datapath(&runner, &system);

        let user_rule = DnsRedirectionRule {
            rule_type: DnsRedirectionType::User,
            input_ifname: String::new(),
            proxy_address: "100.115.92.130".parse().unwrap(),
            host_ifname: "arc_ns0".to_string(),
            nameservers: vec![],
        };
        dp.start_dns_redirection(&user_rule).unwrap();

        let exclude_rule = DnsRedirectionRule {
            rule_type: DnsRedirectionType::ExcludeDestination,
            input_ifname: String::new(),
            proxy_address: "100.115.92.130".parse().unwrap(),
            host_ifname: "arc_ns0".to_string(),
            nameservers: vec![],
        };
        dp.start_dns_redirection(&exclude_rule).unwrap();

        let rules = runner.rules(false, Table::Nat, REDIRECT_USER_DNS_CHAIN);
        // The RETURN rules are inserted ahead of the user DNAT rules.
        assert_eq!(
            rules[0],
            "-p tcp ! -d 100.115.92.130 --dport 53 -j RETURN".to_string()
        );
        assert_eq!(
            rules[1],
            "-p udp ! -d 100.115.92.130 --dport 53 -j RETURN".to_string()
        );
        assert_eq!(rules.len(), 4);
    }

    #[test]
    fn source_ipv6_prefix_enforcement_lifecycle() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let dp = datapath(&runner, &system);

        let eth0 = fake_shill_device("eth0", Technology::Ethernet);
        dp.start_source_ipv6_prefix_enforcement(&eth0);
        // Initially only the jump to the drop chain: all egress drops.
        assert_eq!(
            runner.rules(true, Table::Filter, "egress_eth0"),
            vec!["-j enforce_ipv6_src_prefix".to_string()]
        );

        let prefix: Ipv6Cidr = "2001:db8:0:200::/64".parse().unwrap();
        dp.update_source_enforcement_ipv6_prefix(&eth0, Some(&prefix));
        assert_eq!(
            runner.rules(true, Table::Filter, "egress_eth0"),
            vec![
                "-s 2001:db8:0:200::/64 -j RETURN".to_string(),
                "-j enforce_ipv6_src_prefix".to_string(),
            ]
        );

        dp.stop_source_ipv6_prefix_enforcement(&eth0);
        assert!(!runner.has_chain(true, Table::Filter, "egress_eth0"));
    }

    #[test]
    fn auto_dnat_rules_roundtrip() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let dp = datapath(&runner, &system);

        let eth0 = fake_shill_device("eth0", Technology::Ethernet);
        let addr: Ipv4Addr = "100.115.92.6".parse().unwrap();
        dp.add_inbound_ipv4_dnat(AutoDnatTarget::Arc, &eth0, addr);
        assert_eq!(
            runner.rules(false, Table::Nat, APPLY_AUTO_DNAT_TO_ARC_CHAIN),
            vec![
                "-i eth0 -m socket --nowildcard -j ACCEPT".to_string(),
                "-i eth0 -p tcp -j DNAT --to-destination 100.115.92.6".to_string(),
                "-i eth0 -p udp -j DNAT --to-destination 100.115.92.6".to_string(),
            ]
        );
        dp.remove_inbound_ipv4_dnat(AutoDnatTarget::Arc, &eth0, addr);
        assert!(runner.rules(false, Table::Nat, APPLY_AUTO_DNAT_TO_ARC_CHAIN).is_empty());
    }

    #[test]
    fn add_bridge_unwinds_on_failure() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        runner.fail_on("ip addr add", "simulated failure");
        let dp = datapath(&runner, &system);

        let cidr: Ipv4Inet = "100.115.92.1/30".parse().unwrap();
        assert!(dp.add_bridge("arcbr0", cidr).is_err());
        // The half-created bridge was destroyed again.
        assert!(system.bridges().is_empty());
    }

    #[test]
    fn connection_pinning_restores_source_on_prerouting() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        system.set_ifindex("wlan0", 7);
        let dp = datapath(&runner, &system);

        let wlan0 = fake_shill_device("wlan0", Technology::Wifi);
        dp.start_connection_pinning(&wlan0);
        assert!(
            runner
                .rules(false, Table::Mangle, "PREROUTING")
                .contains(&"-i wlan0 -j CONNMARK --restore-mark --mask 0x00ff0000".to_string())
        );
        assert!(dp.check_chain(IpFamily::Ipv4, Table::Mangle, "POSTROUTING_wlan0"));
        assert!(!dp.check_chain(IpFamily::Ipv4, Table::Mangle, "POSTROUTING_eth7"));
        dp.stop_connection_pinning(&wlan0);
        assert!(runner.rules(false, Table::Mangle, "PREROUTING").is_empty());
        assert!(!runner.has_chain(false, Table::Mangle, "POSTROUTING_wlan0"));
    }

    #[test]
    fn source_ipv4_drop_rule_targets_guest_prefix() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let dp = datapath(&runner, &system);

        assert!(dp.add_source_ipv4_drop_rule("eth+", "100.115.92.0/23"));
        assert_eq!(
            runner.rules(false, Table::Filter, "drop_guest_ipv4_prefix"),
            vec!["-o eth+ -s 100.115.92.0/23 -j DROP".to_string()]
        );
    }

    #[test]
    fn qos_doh_provider_update_replaces_rules() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let dp = datapath(&runner, &system);

        dp.update_doh_providers_for_qos(
            IpFamily::Ipv4,
            &["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
        );
        assert_eq!(
            runner.rules(false, Table::Mangle, QOS_DETECT_DOH_CHAIN),
            vec![
                "-p udp --dport 443 -d 1.1.1.1,8.8.8.8 -j MARK --set-xmark 0x04000000/0x3c000000"
                    .to_string(),
                "-p tcp --dport 443 -d 1.1.1.1,8.8.8.8 -j MARK --set-xmark 0x04000000/0x3c000000"
                    .to_string(),
            ]
        );
        // Updating with an empty list leaves the chain flushed.
        dp.update_doh_providers_for_qos(IpFamily::Ipv4, &[]);
        assert!(runner.rules(false, Table::Mangle, QOS_DETECT_DOH_CHAIN).is_empty());
    }

    #[test]
    fn start_installs_webrtc_rules_only_with_ebpf() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        system.set_ebpf_enabled(true);
        let dp = datapath(&runner, &system);
        dp.start();
        let rules = runner.rules(false, Table::Mangle, QOS_DETECT_CHAIN);
        assert_eq!(rules.len(), 3);
        assert!(rules[1].contains("--object-pinned"));
        assert!(dp.dump_iptables(IpFamily::Ipv4, Table::Mangle).contains("Chain qos_detect"));

        let runner2 = Rc::new(FakeProcessRunner::with_static_chains());
        let system2 = Rc::new(FakeSystem::new());
        let dp2 = datapath(&runner2, &system2);
        dp2.start();
        assert!(runner2.rules(false, Table::Mangle, QOS_DETECT_CHAIN).is_empty());
    }
}
