//! Control channels to the minijailed helper daemons (nd-proxy,
//! mcast-proxy) and to the external network applier.
//!
//! The helpers own their sockets; this side only holds the write end
//! established at fork and sends one JSON datagram per control message.
//! When a helper is not running its messages are dropped with a debug
//! log, which keeps the datapath usable on test images without the
//! helper fleet.

use std::os::unix::net::UnixDatagram;
use std::path::Path;

use patchpanel_lib::shill::{NetworkApplier, ShillDevice};
use serde::Serialize;

#[derive(Serialize)]
struct ForwardingMessage<'a> {
    feature: &'static str,
    op: &'static str,
    lan_ifname: &'a str,
    int_ifname: &'a str,
}

pub struct HelperClient {
    socket: Option<UnixDatagram>,
    helper: &'static str,
}

impl HelperClient {
    pub fn connect(helper: &'static str, path: &Path) -> HelperClient {
        let socket = UnixDatagram::unbound()
            .and_then(|s| s.connect(path).map(|_| s))
            .map_err(|error| {
                tracing::debug!(%error, helper, "helper control socket unavailable");
            })
            .ok();
        HelperClient { socket, helper }
    }

    fn send(&self, feature: &'static str, op: &'static str, lan_ifname: &str, int_ifname: &str) {
        let message = ForwardingMessage {
            feature,
            op,
            lan_ifname,
            int_ifname,
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(%error, "cannot serialize helper control message");
                return;
            }
        };
        match &self.socket {
            Some(socket) => {
                if let Err(error) = socket.send(&payload) {
                    tracing::warn!(%error, helper = self.helper, "failed to send helper control message");
                }
            }
            None => {
                tracing::debug!(helper = self.helper, feature, op, lan_ifname, int_ifname,
                    "helper not connected, dropping control message");
            }
        }
    }
}

impl patchpanel_lib::forwarding::NdProxyControl for HelperClient {
    fn start_nd_proxy(&self, uplink_ifname: &str, downlink_ifname: &str) {
        self.send("nd_proxy", "start", uplink_ifname, downlink_ifname);
    }

    fn stop_nd_proxy(&self, uplink_ifname: &str, downlink_ifname: &str) {
        self.send("nd_proxy", "stop", uplink_ifname, downlink_ifname);
    }
}

impl patchpanel_lib::forwarding::MulticastControl for HelperClient {
    fn start_multicast_forwarding(&self, lan_ifname: &str, int_ifname: &str) {
        self.send("multicast", "start", lan_ifname, int_ifname);
    }

    fn stop_multicast_forwarding(&self, lan_ifname: &str, int_ifname: &str) {
        self.send("multicast", "stop", lan_ifname, int_ifname);
    }

    fn start_broadcast_forwarding(&self, lan_ifname: &str, int_ifname: &str) {
        self.send("broadcast", "start", lan_ifname, int_ifname);
    }

    fn stop_broadcast_forwarding(&self, lan_ifname: &str, int_ifname: &str) {
        self.send("broadcast", "stop", lan_ifname, int_ifname);
    }
}

/// Network provisioning is owned by the external network service; this
/// daemon only forwards the delegation and logs it.
pub struct LoggingNetworkApplier;

impl NetworkApplier for LoggingNetworkApplier {
    fn apply_network_config(&self, ifindex: u32, device: &ShillDevice) {
        tracing::info!(ifindex, %device, "applying network config");
    }

    fn clear_network_config(&self, ifindex: u32) {
        tracing::info!(ifindex, "clearing network config");
    }
}
