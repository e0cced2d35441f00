//! Downstream network data plane for tethering and local-only (WiFi
//! hotspot / WiFi Direct) networks managed on behalf of shill.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{info, warn};

use crate::datapath::{Datapath, DatapathError, DownstreamNetworkInfo, DownstreamTopology};

#[derive(Debug, Error)]
pub enum DownstreamNetworkError {
    #[error("downstream network already started on {0}")]
    AlreadyStarted(String),
    #[error("downstream interface {0} requires an IPv4 prefix of at most /30")]
    PrefixTooLong(String),
    #[error(transparent)]
    Datapath(#[from] DatapathError),
}

/// Tracks the downstream networks currently configured. The downstream
/// interface itself is owned by shill; on stop it is handed back
/// untouched so shill can destroy it or flip it back to client mode.
#[derive(Default)]
pub struct DownstreamNetworkService {
    networks: HashMap<String, DownstreamNetworkInfo>,
}

impl DownstreamNetworkService {
    pub fn new() -> DownstreamNetworkService {
        DownstreamNetworkService::default()
    }

    pub fn start(
        &mut self,
        datapath: &Datapath,
        info: DownstreamNetworkInfo,
    ) -> Result<(), DownstreamNetworkError> {
        if self.networks.contains_key(&info.downstream_ifname) {
            return Err(DownstreamNetworkError::AlreadyStarted(
                info.downstream_ifname.clone(),
            ));
        }
        // The downstream network needs room for the gateway and at least
        // one client address.
        if info.ipv4_cidr.network_length() > 30 {
            return Err(DownstreamNetworkError::PrefixTooLong(
                info.downstream_ifname.clone(),
            ));
        }
        datapath.start_downstream_network(&info)?;
        info!(downstream = %info.downstream_ifname, topology = ?info.topology, "downstream network started");
        self.networks.insert(info.downstream_ifname.clone(), info);
        Ok(())
    }

    pub fn stop(&mut self, datapath: &Datapath, downstream_ifname: &str) {
        let Some(info) = self.networks.remove(downstream_ifname) else {
            warn!(downstream_ifname, "unknown downstream network");
            return;
        };
        datapath.stop_downstream_network(&info);
        info!(downstream = %info.downstream_ifname, "downstream network stopped");
    }

    pub fn stop_all(&mut self, datapath: &Datapath) {
        let ifnames: Vec<String> = self.networks.keys().cloned().collect();
        for ifname in ifnames {
            self.stop(datapath, &ifname);
        }
    }

    pub fn get(&self, downstream_ifname: &str) -> Option<&DownstreamNetworkInfo> {
        self.networks.get(downstream_ifname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iptables::Table;
    use crate::mocks::{FakeProcessRunner, FakeSystem, fake_shill_device};
    use crate::process::ProcessRunner;
    use crate::shill::Technology;
    use crate::system::System;
    use std::path::PathBuf;
    use std::rc::Rc;

    fn datapath(runner: &Rc<FakeProcessRunner>, system: &Rc<FakeSystem>) -> Datapath {
        Datapath::with_scripts(
            Rc::clone(runner) as Rc<dyn ProcessRunner>,
            Rc::clone(system) as Rc<dyn System>,
            PathBuf::from("/tmp/iptables.start"),
            PathBuf::from("/tmp/ip6tables.start"),
        )
    }

    #[test]
    fn local_only_network_lifecycle() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let dp = datapath(&runner, &system);
        let mut service = DownstreamNetworkService::new();

        let info = DownstreamNetworkInfo {
            downstream_ifname: "wlan1".to_string(),
            ipv4_cidr: "172.16.16.1/24".parse().unwrap(),
            topology: DownstreamTopology::LocalOnly,
            upstream_device: None,
        };
        service.start(&dp, info).unwrap();
        // Forwarding between the downstream and anything else is dropped.
        assert_eq!(
            runner.rules(false, Table::Filter, "forward_localonly"),
            vec!["-o wlan1 -j DROP".to_string(), "-i wlan1 -j DROP".to_string()]
        );
        assert!(
            runner
                .rules(false, Table::Filter, "OUTPUT")
                .contains(&"-o wlan1 -j egress_localonly".to_string())
        );

        service.stop(&dp, "wlan1");
        assert!(runner.rules(false, Table::Filter, "forward_localonly").is_empty());
        assert!(runner.rules(false, Table::Filter, "OUTPUT").is_empty());
        assert!(service.get("wlan1").is_none());
    }

    #[test]
    fn duplicate_downstream_is_rejected() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        system.set_ifindex("rmnet0", 4);
        let dp = datapath(&runner, &system);
        let mut service = DownstreamNetworkService::new();

        let info = || DownstreamNetworkInfo {
            downstream_ifname: "wlan1".to_string(),
            ipv4_cidr: "172.16.16.1/24".parse().unwrap(),
            topology: DownstreamTopology::Tethering,
            upstream_device: Some(fake_shill_device("rmnet0", Technology::Cellular)),
        };
        service.start(&dp, info()).unwrap();
        assert!(matches!(
            service.start(&dp, info()),
            Err(DownstreamNetworkError::AlreadyStarted(_))
        ));
    }

    #[test]
    fn prefix_longer_than_30_is_rejected() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let system = Rc::new(FakeSystem::new());
        let dp = datapath(&runner, &system);
        let mut service = DownstreamNetworkService::new();

        let info = DownstreamNetworkInfo {
            downstream_ifname: "wlan1".to_string(),
            ipv4_cidr: "172.16.16.1/31".parse().unwrap(),
            topology: DownstreamTopology::LocalOnly,
            upstream_device: None,
        };
        assert!(matches!(
            service.start(&dp, info),
            Err(DownstreamNetworkError::PrefixTooLong(_))
        ));
    }
}
