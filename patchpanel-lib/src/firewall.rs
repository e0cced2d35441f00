//! Port-level firewall rule families: ingress accept rules, loopback
//! lockdown rules, and IPv4 forwarding (DNAT) rules.
//!
//! These operate on the static `ingress_port_firewall`,
//! `egress_port_firewall` and `ingress_port_forwarding` chains created
//! by the restore scripts.

use std::net::Ipv4Addr;
use std::rc::Rc;

use thiserror::Error;

use crate::iptables::{Command, Table};
use crate::process::{ProcessError, ProcessRunner};

const INGRESS_PORT_FIREWALL_CHAIN: &str = "ingress_port_firewall";
const EGRESS_PORT_FIREWALL_CHAIN: &str = "egress_port_firewall";
const INGRESS_PORT_FORWARDING_CHAIN: &str = "ingress_port_forwarding";

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("invalid port 0")]
    InvalidPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Typed wrapper over the iptables port rule families.
pub struct Firewall {
    runner: Rc<dyn ProcessRunner>,
}

impl Firewall {
    pub fn new(runner: Rc<dyn ProcessRunner>) -> Firewall {
        Firewall { runner }
    }

    /// Accepts ingress traffic to `port`, optionally restricted to
    /// `ifname`. Applies to both families.
    pub fn add_accept_rules(
        &self,
        proto: Protocol,
        port: u16,
        ifname: &str,
    ) -> Result<(), FirewallError> {
        if port == 0 {
            return Err(FirewallError::InvalidPort);
        }
        self.modify_accept_rules(Command::Append, proto, port, ifname)
    }

    pub fn delete_accept_rules(
        &self,
        proto: Protocol,
        port: u16,
        ifname: &str,
    ) -> Result<(), FirewallError> {
        if port == 0 {
            return Err(FirewallError::InvalidPort);
        }
        self.modify_accept_rules(Command::Delete, proto, port, ifname)
    }

    fn modify_accept_rules(
        &self,
        op: Command,
        proto: Protocol,
        port: u16,
        ifname: &str,
    ) -> Result<(), FirewallError> {
        let port = port.to_string();
        let mut args: Vec<&str> = Vec::new();
        if !ifname.is_empty() {
            args.extend_from_slice(&["-i", ifname]);
        }
        args.extend_from_slice(&["-p", proto.name(), "--dport", &port, "-j", "ACCEPT", "-w"]);
        self.runner
            .iptables(Table::Filter, op, INGRESS_PORT_FIREWALL_CHAIN, &args, true)?;
        self.runner
            .ip6tables(Table::Filter, op, INGRESS_PORT_FIREWALL_CHAIN, &args, true)?;
        Ok(())
    }

    /// Rejects traffic to `port` on the loopback interface unless it was
    /// sent by chronos. Used to lock down ports that only Chrome should
    /// reach.
    pub fn add_loopback_lockdown_rules(
        &self,
        proto: Protocol,
        port: u16,
    ) -> Result<(), FirewallError> {
        if port == 0 {
            return Err(FirewallError::InvalidPort);
        }
        self.modify_loopback_lockdown_rules(Command::Append, proto, port)
    }

    pub fn delete_loopback_lockdown_rules(
        &self,
        proto: Protocol,
        port: u16,
    ) -> Result<(), FirewallError> {
        if port == 0 {
            return Err(FirewallError::InvalidPort);
        }
        self.modify_loopback_lockdown_rules(Command::Delete, proto, port)
    }

    fn modify_loopback_lockdown_rules(
        &self,
        op: Command,
        proto: Protocol,
        port: u16,
    ) -> Result<(), FirewallError> {
        let port = port.to_string();
        let args = [
            "-p",
            proto.name(),
            "--dport",
            &port,
            "-o",
            "lo",
            "-m",
            "owner",
            "!",
            "--uid-owner",
            "chronos",
            "-j",
            "REJECT",
            "-w",
        ];
        self.runner
            .iptables(Table::Filter, op, EGRESS_PORT_FIREWALL_CHAIN, &args, true)?;
        self.runner
            .ip6tables(Table::Filter, op, EGRESS_PORT_FIREWALL_CHAIN, &args, true)?;
        Ok(())
    }

    /// DNATs ingress traffic matching `(input_dst_ip, input_dst_port)` on
    /// `input_ifname` to `dst_ip:dst_port`, and accepts the forwarded
    /// flow in FORWARD.
    #[allow(clippy::too_many_arguments)]
    pub fn add_ipv4_forward_rule(
        &self,
        proto: Protocol,
        input_dst_ip: Option<Ipv4Addr>,
        input_dst_port: u16,
        input_ifname: &str,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Result<(), FirewallError> {
        if input_dst_port == 0 || dst_port == 0 || input_ifname.is_empty() {
            return Err(FirewallError::InvalidPort);
        }
        self.modify_ipv4_dnat_rule(
            Command::Append,
            proto,
            input_dst_ip,
            input_dst_port,
            input_ifname,
            dst_ip,
            dst_port,
        )?;
        if let Err(error) =
            self.modify_ipv4_forward_accept_rule(Command::Append, proto, dst_ip, dst_port)
        {
            // Unwind the DNAT rule so no half-forwarding is left behind.
            let _ = self.modify_ipv4_dnat_rule(
                Command::Delete,
                proto,
                input_dst_ip,
                input_dst_port,
                input_ifname,
                dst_ip,
                dst_port,
            );
            return Err(error);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn delete_ipv4_forward_rule(
        &self,
        proto: Protocol,
        input_dst_ip: Option<Ipv4Addr>,
        input_dst_port: u16,
        input_ifname: &str,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Result<(), FirewallError> {
        let dnat = self.modify_ipv4_dnat_rule(
            Command::Delete,
            proto,
            input_dst_ip,
            input_dst_port,
            input_ifname,
            dst_ip,
            dst_port,
        );
        let accept = self.modify_ipv4_forward_accept_rule(Command::Delete, proto, dst_ip, dst_port);
        dnat.and(accept)
    }

    #[allow(clippy::too_many_arguments)]
    fn modify_ipv4_dnat_rule(
        &self,
        op: Command,
        proto: Protocol,
        input_dst_ip: Option<Ipv4Addr>,
        input_dst_port: u16,
        input_ifname: &str,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Result<(), FirewallError> {
        let input_dst_ip = input_dst_ip.map(|ip| ip.to_string());
        let input_dst_port = input_dst_port.to_string();
        let dest = format!("{dst_ip}:{dst_port}");
        let mut args: Vec<&str> = vec!["-i", input_ifname];
        if let Some(input_dst_ip) = input_dst_ip.as_deref() {
            args.extend_from_slice(&["-d", input_dst_ip]);
        }
        args.extend_from_slice(&[
            "-p",
            proto.name(),
            "--dport",
            &input_dst_port,
            "-j",
            "DNAT",
            "--to-destination",
            &dest,
            "-w",
        ]);
        self.runner
            .iptables(Table::Nat, op, INGRESS_PORT_FORWARDING_CHAIN, &args, true)?;
        Ok(())
    }

    fn modify_ipv4_forward_accept_rule(
        &self,
        op: Command,
        proto: Protocol,
        dst_ip: Ipv4Addr,
        dst_port: u16,
    ) -> Result<(), FirewallError> {
        let dst_ip = dst_ip.to_string();
        let dst_port = dst_port.to_string();
        let args = [
            "-d",
            dst_ip.as_str(),
            "-p",
            proto.name(),
            "--dport",
            &dst_port,
            "-j",
            "ACCEPT",
            "-w",
        ];
        self.runner
            .iptables(Table::Filter, op, "FORWARD", &args, true)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::FakeProcessRunner;

    fn firewall(runner: &Rc<FakeProcessRunner>) -> Firewall {
        Firewall::new(Rc::clone(runner) as Rc<dyn ProcessRunner>)
    }

    #[test]
    fn accept_rules_apply_to_both_families() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let fw = firewall(&runner);

        fw.add_accept_rules(Protocol::Tcp, 5555, "eth0").unwrap();
        let expected = "-i eth0 -p tcp --dport 5555 -j ACCEPT".to_string();
        assert!(runner.rules(false, Table::Filter, "ingress_port_firewall").contains(&expected));
        assert!(runner.rules(true, Table::Filter, "ingress_port_firewall").contains(&expected));

        fw.delete_accept_rules(Protocol::Tcp, 5555, "eth0").unwrap();
        assert!(runner.rules(false, Table::Filter, "ingress_port_firewall").is_empty());
        assert!(runner.rules(true, Table::Filter, "ingress_port_firewall").is_empty());
    }

    #[test]
    fn port_zero_is_rejected() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let fw = firewall(&runner);
        assert!(matches!(
            fw.add_accept_rules(Protocol::Udp, 0, ""),
            Err(FirewallError::InvalidPort)
        ));
        assert!(matches!(
            fw.add_loopback_lockdown_rules(Protocol::Tcp, 0),
            Err(FirewallError::InvalidPort)
        ));
    }

    #[test]
    fn loopback_lockdown_rules_roundtrip() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let fw = firewall(&runner);

        fw.add_loopback_lockdown_rules(Protocol::Tcp, 8888).unwrap();
        let expected =
            "-p tcp --dport 8888 -o lo -m owner ! --uid-owner chronos -j REJECT".to_string();
        assert!(runner.rules(false, Table::Filter, "egress_port_firewall").contains(&expected));
        assert!(runner.rules(true, Table::Filter, "egress_port_firewall").contains(&expected));

        fw.delete_loopback_lockdown_rules(Protocol::Tcp, 8888).unwrap();
        assert!(runner.rules(false, Table::Filter, "egress_port_firewall").is_empty());
    }

    #[test]
    fn forward_rule_installs_dnat_and_accept() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        let fw = firewall(&runner);

        fw.add_ipv4_forward_rule(
            Protocol::Tcp,
            Some("100.115.92.2".parse().unwrap()),
            5555,
            "arc_eth0",
            "127.0.0.1".parse().unwrap(),
            5550,
        )
        .unwrap();
        assert_eq!(
            runner.rules(false, Table::Nat, "ingress_port_forwarding"),
            vec![
                "-i arc_eth0 -d 100.115.92.2 -p tcp --dport 5555 -j DNAT --to-destination 127.0.0.1:5550"
                    .to_string()
            ]
        );
        assert_eq!(
            runner.rules(false, Table::Filter, "FORWARD"),
            vec!["-d 127.0.0.1 -p tcp --dport 5550 -j ACCEPT".to_string()]
        );
    }

    #[test]
    fn forward_rule_unwinds_dnat_when_accept_fails() {
        let runner = Rc::new(FakeProcessRunner::with_static_chains());
        runner.fail_on("iptables filter -A FORWARD", "simulated failure");
        let fw = firewall(&runner);

        assert!(
            fw.add_ipv4_forward_rule(
                Protocol::Udp,
                None,
                8080,
                "wlan0",
                "100.115.92.130".parse().unwrap(),
                8080,
            )
            .is_err()
        );
        assert!(runner.rules(false, Table::Nat, "ingress_port_forwarding").is_empty());
    }
}
