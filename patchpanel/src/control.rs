//! JSON request surface of the daemon over its unix control socket.
//!
//! Requests are single JSON objects; fd-bearing requests (lifeline fds,
//! sockets to tag) attach their descriptors as SCM_RIGHTS ancillary data
//! on the same message. The reply is a single JSON object.

use std::mem;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use serde::{Deserialize, Serialize};
use serde_json::json;

use patchpanel_lib::datapath::{
    DnsRedirectionType, DownstreamNetworkInfo, DownstreamTopology, PortRuleOp, PortRuleRequest,
    PortRuleType,
};
use patchpanel_lib::firewall::Protocol;
use patchpanel_lib::fwmark::TrafficSource;
use patchpanel_lib::manager::{
    ConnectNamespaceRequest, DnsRedirectionRequest, FeatureFlag, Manager, TagSocketRequest,
    VpnRoutingPolicy,
};
use patchpanel_lib::shill::{ShillDevice, ShillDevicesChange, Technology};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceDto {
    System,
    User,
    Arc,
    CrostiniVm,
    ParallelsVm,
    BruschettaVm,
    BorealisVm,
    TetherDownstream,
    WifiDirect,
    WifiLohs,
}

impl From<SourceDto> for TrafficSource {
    fn from(dto: SourceDto) -> TrafficSource {
        match dto {
            SourceDto::System => TrafficSource::System,
            SourceDto::User => TrafficSource::User,
            SourceDto::Arc => TrafficSource::Arc,
            SourceDto::CrostiniVm => TrafficSource::CrostiniVm,
            SourceDto::ParallelsVm => TrafficSource::ParallelsVm,
            SourceDto::BruschettaVm => TrafficSource::BruschettaVm,
            SourceDto::BorealisVm => TrafficSource::BorealisVm,
            SourceDto::TetherDownstream => TrafficSource::TetherDownstream,
            SourceDto::WifiDirect => TrafficSource::WifiDirect,
            SourceDto::WifiLohs => TrafficSource::WifiLohs,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsRuleTypeDto {
    Default,
    Arc,
    User,
    ExcludeDestination,
}

impl From<DnsRuleTypeDto> for DnsRedirectionType {
    fn from(dto: DnsRuleTypeDto) -> DnsRedirectionType {
        match dto {
            DnsRuleTypeDto::Default => DnsRedirectionType::Default,
            DnsRuleTypeDto::Arc => DnsRedirectionType::Arc,
            DnsRuleTypeDto::User => DnsRedirectionType::User,
            DnsRuleTypeDto::ExcludeDestination => DnsRedirectionType::ExcludeDestination,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpnPolicyDto {
    Default,
    RouteOnVpn,
    BypassVpn,
}

impl From<VpnPolicyDto> for VpnRoutingPolicy {
    fn from(dto: VpnPolicyDto) -> VpnRoutingPolicy {
        match dto {
            VpnPolicyDto::Default => VpnRoutingPolicy::Default,
            VpnPolicyDto::RouteOnVpn => VpnRoutingPolicy::RouteOnVpn,
            VpnPolicyDto::BypassVpn => VpnRoutingPolicy::BypassVpn,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureFlagDto {
    WifiQos,
    Clat,
}

impl From<FeatureFlagDto> for FeatureFlag {
    fn from(dto: FeatureFlagDto) -> FeatureFlag {
        match dto {
            FeatureFlagDto::WifiQos => FeatureFlag::WifiQos,
            FeatureFlagDto::Clat => FeatureFlag::Clat,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolDto {
    Tcp,
    Udp,
}

impl From<ProtocolDto> for Protocol {
    fn from(dto: ProtocolDto) -> Protocol {
        match dto {
            ProtocolDto::Tcp => Protocol::Tcp,
            ProtocolDto::Udp => Protocol::Udp,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRuleOpDto {
    Create,
    Delete,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortRuleTypeDto {
    Access,
    Lockdown,
    Forwarding,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyDto {
    Tethering,
    LocalOnly,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TechnologyDto {
    Ethernet,
    Wifi,
    Cellular,
    Vpn,
}

impl From<TechnologyDto> for Technology {
    fn from(dto: TechnologyDto) -> Technology {
        match dto {
            TechnologyDto::Ethernet => Technology::Ethernet,
            TechnologyDto::Wifi => Technology::Wifi,
            TechnologyDto::Cellular => Technology::Cellular,
            TechnologyDto::Vpn => Technology::Vpn,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceDto {
    pub ifname: String,
    #[serde(default)]
    pub shill_device_name: Option<String>,
    pub technology: TechnologyDto,
    #[serde(default)]
    pub ipv4_dns_addresses: Vec<Ipv4Addr>,
    #[serde(default)]
    pub ipv6_prefix: Option<String>,
}

impl DeviceDto {
    fn into_device(self) -> Result<ShillDevice, String> {
        let ipv6_prefix = match self.ipv6_prefix {
            Some(prefix) => Some(prefix.parse().map_err(|e| format!("bad ipv6 prefix: {e}"))?),
            None => None,
        };
        Ok(ShillDevice {
            shill_device_name: self.shill_device_name.unwrap_or_else(|| self.ifname.clone()),
            ifname: self.ifname,
            technology: self.technology.into(),
            ipv4_dns_addresses: self.ipv4_dns_addresses,
            ipv6_prefix,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    ArcStartup {
        pid: u32,
    },
    ArcShutdown,
    ArcVmStartup {
        cid: u32,
    },
    ArcVmShutdown {
        cid: u32,
    },
    TerminaVmStartup {
        cid: u64,
    },
    TerminaVmShutdown {
        cid: u64,
    },
    ParallelsVmStartup {
        cid: u64,
        #[serde(default)]
        subnet_index: u32,
    },
    ParallelsVmShutdown {
        cid: u64,
    },
    BruschettaVmStartup {
        cid: u64,
    },
    BruschettaVmShutdown {
        cid: u64,
    },
    BorealisVmStartup {
        cid: u64,
    },
    BorealisVmShutdown {
        cid: u64,
    },
    ConnectNamespace {
        pid: i32,
        #[serde(default)]
        outbound_physical_device: String,
        source: SourceDto,
        #[serde(default)]
        route_on_vpn: bool,
        #[serde(default)]
        static_ipv6: bool,
    },
    SetDnsRedirectionRule {
        rule_type: DnsRuleTypeDto,
        #[serde(default)]
        input_ifname: String,
        proxy_address: IpAddr,
        #[serde(default)]
        host_ifname: String,
        #[serde(default)]
        nameservers: Vec<IpAddr>,
    },
    ModifyPortRule {
        op: PortRuleOpDto,
        rule_type: PortRuleTypeDto,
        proto: ProtocolDto,
        #[serde(default)]
        input_dst_ip: Option<Ipv4Addr>,
        input_dst_port: u32,
        #[serde(default)]
        input_ifname: String,
        #[serde(default)]
        dst_ip: Option<Ipv4Addr>,
        #[serde(default)]
        dst_port: u32,
    },
    SetVpnLockdown {
        enable: bool,
    },
    TagSocket {
        network_id: u32,
        vpn_policy: VpnPolicyDto,
    },
    GetDevices,
    GetTrafficCounters {
        #[serde(default)]
        ifnames: Vec<String>,
    },
    NotifyAndroidWifiMulticastLockChange {
        held: bool,
    },
    SetFeatureFlag {
        flag: FeatureFlagDto,
        enabled: bool,
    },
    StartDownstreamNetwork {
        downstream_ifname: String,
        ipv4_cidr: String,
        topology: TopologyDto,
        #[serde(default)]
        upstream_ifname: Option<String>,
    },
    StopDownstreamNetwork {
        downstream_ifname: String,
    },
    NotifyUpstreamDevicesChanged {
        #[serde(default)]
        added: Vec<DeviceDto>,
        #[serde(default)]
        removed: Vec<DeviceDto>,
    },
    NotifyDefaultLogicalDeviceChanged {
        device: Option<DeviceDto>,
    },
    NotifyDefaultPhysicalDeviceChanged {
        device: Option<DeviceDto>,
    },
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Response {
    fn ok() -> Response {
        Response {
            success: true,
            error: None,
            data: None,
        }
    }

    fn with_data(data: serde_json::Value) -> Response {
        Response {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    fn fail(error: impl ToString) -> Response {
        Response {
            success: false,
            error: Some(error.to_string()),
            data: None,
        }
    }
}

/// Reads one request message and any SCM_RIGHTS descriptors attached to
/// it.
pub fn recv_request(stream: &UnixStream) -> std::io::Result<(Vec<u8>, Vec<OwnedFd>)> {
    let mut buf = vec![0u8; 65536];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    // Room for a handful of descriptors; requests carry at most one.
    let mut cmsg_buf = [0u8; 128];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_buf.len();

    let received = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if received < 0 {
        return Err(std::io::Error::last_os_error());
    }
    buf.truncate(received as usize);

    let mut fds = Vec::new();
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                for i in 0..payload / mem::size_of::<RawFd>() {
                    fds.push(OwnedFd::from_raw_fd(std::ptr::read_unaligned(data.add(i))));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    Ok((buf, fds))
}

fn take_fd(fds: &mut Vec<OwnedFd>) -> Result<OwnedFd, Response> {
    if fds.is_empty() {
        return Err(Response::fail("request requires an attached fd"));
    }
    Ok(fds.remove(0))
}

pub fn dispatch(manager: &mut Manager, request: Request, fds: &mut Vec<OwnedFd>) -> Response {
    match request {
        Request::ArcStartup { pid } => match manager.arc_startup(pid) {
            Ok(()) => Response::ok(),
            Err(error) => Response::fail(error),
        },
        Request::ArcShutdown => {
            manager.arc_shutdown();
            Response::ok()
        }
        Request::ArcVmStartup { cid } => match manager.arc_vm_startup(cid) {
            Ok(response) => Response::with_data(json!({
                "arc0_ipv4_address": response.arc0_ipv4_address.to_string(),
                "tap_ifnames": response.tap_ifnames,
            })),
            Err(error) => Response::fail(error),
        },
        Request::ArcVmShutdown { cid } => {
            manager.arc_vm_shutdown(cid);
            Response::ok()
        }
        Request::TerminaVmStartup { cid } => match manager.termina_vm_startup(cid) {
            Ok(response) => Response::with_data(json!({
                "tap_ifname": response.tap_ifname,
                "vm_ipv4_subnet": response.vm_ipv4_subnet.to_string(),
                "gateway_ipv4_address": response.gateway_ipv4_address.to_string(),
                "vm_ipv4_address": response.vm_ipv4_address.to_string(),
                "container_ipv4_subnet": response.container_ipv4_subnet.map(|s| s.to_string()),
                "container_ipv4_address": response.container_ipv4_address.map(|a| a.to_string()),
            })),
            Err(error) => Response::fail(error),
        },
        Request::TerminaVmShutdown { cid }
        | Request::ParallelsVmShutdown { cid }
        | Request::BruschettaVmShutdown { cid }
        | Request::BorealisVmShutdown { cid } => {
            manager.crostini_vm_shutdown(cid);
            Response::ok()
        }
        Request::ParallelsVmStartup { cid, subnet_index } => {
            match manager.parallels_vm_startup(cid, subnet_index) {
                Ok(response) => Response::with_data(json!({
                    "tap_ifname": response.tap_ifname,
                    "vm_ipv4_subnet": response.vm_ipv4_subnet.to_string(),
                    "gateway_ipv4_address": response.gateway_ipv4_address.to_string(),
                    "vm_ipv4_address": response.vm_ipv4_address.to_string(),
                })),
                Err(error) => Response::fail(error),
            }
        }
        Request::BruschettaVmStartup { cid } => match manager.bruschetta_vm_startup(cid) {
            Ok(response) => Response::with_data(json!({
                "tap_ifname": response.tap_ifname,
                "gateway_ipv4_address": response.gateway_ipv4_address.to_string(),
                "vm_ipv4_address": response.vm_ipv4_address.to_string(),
            })),
            Err(error) => Response::fail(error),
        },
        Request::BorealisVmStartup { cid } => match manager.borealis_vm_startup(cid) {
            Ok(response) => Response::with_data(json!({
                "tap_ifname": response.tap_ifname,
                "gateway_ipv4_address": response.gateway_ipv4_address.to_string(),
                "vm_ipv4_address": response.vm_ipv4_address.to_string(),
            })),
            Err(error) => Response::fail(error),
        },
        Request::ConnectNamespace {
            pid,
            outbound_physical_device,
            source,
            route_on_vpn,
            static_ipv6,
        } => {
            let lifeline_fd = match take_fd(fds) {
                Ok(fd) => fd,
                Err(response) => return response,
            };
            let request = ConnectNamespaceRequest {
                pid,
                outbound_physical_device,
                source: source.into(),
                route_on_vpn,
                static_ipv6,
            };
            match manager.connect_namespace(request, lifeline_fd) {
                Ok(response) => Response::with_data(json!({
                    "netns_name": response.netns_name,
                    "peer_ifname": response.peer_ifname,
                    "peer_ipv4_cidr": response.peer_ipv4_cidr.to_string(),
                    "host_ifname": response.host_ifname,
                    "host_ipv4_cidr": response.host_ipv4_cidr.to_string(),
                    "ipv4_subnet": response.ipv4_subnet.to_string(),
                    "host_ipv6_cidr": response.static_ipv6.as_ref().map(|c| c.host_cidr.to_string()),
                    "peer_ipv6_cidr": response.static_ipv6.as_ref().map(|c| c.peer_cidr.to_string()),
                })),
                Err(error) => Response::fail(error),
            }
        }
        Request::SetDnsRedirectionRule {
            rule_type,
            input_ifname,
            proxy_address,
            host_ifname,
            nameservers,
        } => {
            let lifeline_fd = match take_fd(fds) {
                Ok(fd) => fd,
                Err(response) => return response,
            };
            let request = DnsRedirectionRequest {
                rule_type: rule_type.into(),
                input_ifname,
                proxy_address,
                host_ifname,
                nameservers,
            };
            match manager.set_dns_redirection_rule(request, lifeline_fd) {
                Ok(()) => Response::ok(),
                Err(error) => Response::fail(error),
            }
        }
        Request::ModifyPortRule {
            op,
            rule_type,
            proto,
            input_dst_ip,
            input_dst_port,
            input_ifname,
            dst_ip,
            dst_port,
        } => {
            let request = PortRuleRequest {
                op: match op {
                    PortRuleOpDto::Create => PortRuleOp::Create,
                    PortRuleOpDto::Delete => PortRuleOp::Delete,
                },
                rule_type: match rule_type {
                    PortRuleTypeDto::Access => PortRuleType::Access,
                    PortRuleTypeDto::Lockdown => PortRuleType::Lockdown,
                    PortRuleTypeDto::Forwarding => PortRuleType::Forwarding,
                },
                proto: proto.into(),
                input_dst_ip,
                input_dst_port,
                input_ifname,
                dst_ip,
                dst_port,
            };
            match manager.modify_port_rule(&request) {
                Ok(()) => Response::ok(),
                Err(error) => Response::fail(error),
            }
        }
        Request::SetVpnLockdown { enable } => {
            manager.set_vpn_lockdown(enable);
            Response::ok()
        }
        Request::TagSocket {
            network_id,
            vpn_policy,
        } => {
            let socket_fd = match take_fd(fds) {
                Ok(fd) => fd,
                Err(response) => return response,
            };
            let request = TagSocketRequest {
                network_id,
                vpn_policy: vpn_policy.into(),
            };
            match manager.tag_socket(request, socket_fd.as_raw_fd()) {
                Ok(()) => Response::ok(),
                Err(error) => Response::fail(error),
            }
        }
        Request::GetDevices => {
            let devices: Vec<serde_json::Value> = manager
                .get_devices()
                .into_iter()
                .map(|device| {
                    json!({
                        "ifname": device.ifname,
                        "phys_ifname": device.phys_ifname,
                        "guest_ifname": device.guest_ifname,
                        "ipv4_addr": device.ipv4_addr.to_string(),
                        "host_ipv4_addr": device.host_ipv4_addr.to_string(),
                        "guest_type": device.guest_type,
                    })
                })
                .collect();
            Response::with_data(json!({ "devices": devices }))
        }
        // Counters are read out by a separate service.
        Request::GetTrafficCounters { .. } => Response::fail("traffic counters are not served here"),
        Request::NotifyAndroidWifiMulticastLockChange { held } => {
            manager.notify_android_wifi_multicast_lock_change(held);
            Response::ok()
        }
        Request::SetFeatureFlag { flag, enabled } => {
            let previous = manager.set_feature_flag(flag.into(), enabled);
            Response::with_data(json!({ "previous": previous }))
        }
        Request::StartDownstreamNetwork {
            downstream_ifname,
            ipv4_cidr,
            topology,
            upstream_ifname,
        } => {
            let ipv4_cidr = match ipv4_cidr.parse() {
                Ok(cidr) => cidr,
                Err(error) => return Response::fail(format!("bad ipv4_cidr: {error}")),
            };
            let upstream_device = match upstream_ifname {
                None => None,
                Some(ifname) => match manager.shill_device(&ifname) {
                    Some(device) => Some(device.clone()),
                    None => return Response::fail(format!("unknown upstream {ifname}")),
                },
            };
            let info = DownstreamNetworkInfo {
                downstream_ifname,
                ipv4_cidr,
                topology: match topology {
                    TopologyDto::Tethering => DownstreamTopology::Tethering,
                    TopologyDto::LocalOnly => DownstreamTopology::LocalOnly,
                },
                upstream_device,
            };
            match manager.start_downstream_network(info) {
                Ok(()) => Response::ok(),
                Err(error) => Response::fail(error),
            }
        }
        Request::StopDownstreamNetwork { downstream_ifname } => {
            manager.stop_downstream_network(&downstream_ifname);
            Response::ok()
        }
        Request::NotifyUpstreamDevicesChanged { added, removed } => {
            let mut change = ShillDevicesChange::default();
            for dto in added {
                match dto.into_device() {
                    Ok(device) => change.added.push(device),
                    Err(error) => return Response::fail(error),
                }
            }
            for dto in removed {
                match dto.into_device() {
                    Ok(device) => change.removed.push(device),
                    Err(error) => return Response::fail(error),
                }
            }
            manager.on_shill_devices_changed(change);
            Response::ok()
        }
        Request::NotifyDefaultLogicalDeviceChanged { device } => {
            let device = match device.map(DeviceDto::into_device).transpose() {
                Ok(device) => device,
                Err(error) => return Response::fail(error),
            };
            manager.on_shill_default_logical_device_changed(device);
            Response::ok()
        }
        Request::NotifyDefaultPhysicalDeviceChanged { device } => {
            let device = match device.map(DeviceDto::into_device).transpose() {
                Ok(device) => device,
                Err(error) => return Response::fail(error),
            };
            manager.on_shill_default_physical_device_changed(device);
            Response::ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_namespace_request() {
        let raw = r#"{
            "request": "connect_namespace",
            "pid": 4567,
            "outbound_physical_device": "wlan0",
            "source": "system",
            "static_ipv6": true
        }"#;
        let request: Request = serde_json::from_str(raw).unwrap();
        match request {
            Request::ConnectNamespace {
                pid,
                outbound_physical_device,
                route_on_vpn,
                static_ipv6,
                ..
            } => {
                assert_eq!(pid, 4567);
                assert_eq!(outbound_physical_device, "wlan0");
                assert!(!route_on_vpn);
                assert!(static_ipv6);
            }
            _ => panic!("wrong request variant"),
        }
    }

    #[test]
    fn parses_device_notification() {
        let raw = r#"{
            "request": "notify_upstream_devices_changed",
            "added": [{
                "ifname": "wlan0",
                "technology": "wifi",
                "ipv4_dns_addresses": ["8.8.8.8"],
                "ipv6_prefix": "2001:db8:0:200::/64"
            }]
        }"#;
        let request: Request = serde_json::from_str(raw).unwrap();
        let Request::NotifyUpstreamDevicesChanged { added, removed } = request else {
            panic!("wrong request variant");
        };
        assert!(removed.is_empty());
        let device = added.into_iter().next().unwrap().into_device().unwrap();
        assert_eq!(device.ifname, "wlan0");
        assert_eq!(device.shill_device_name, "wlan0");
        assert!(device.ipv6_prefix.is_some());
    }

    #[test]
    fn response_serialization_skips_empty_fields() {
        let raw = serde_json::to_string(&Response::ok()).unwrap();
        assert_eq!(raw, r#"{"success":true}"#);
        let raw = serde_json::to_string(&Response::fail("nope")).unwrap();
        assert_eq!(raw, r#"{"success":false,"error":"nope"}"#);
    }
}
