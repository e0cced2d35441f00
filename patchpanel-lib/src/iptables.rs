//! Vocabulary types for iptables/ip6tables invocations.

use std::fmt;

/// IP family selector for a rule. `Dual` applies the operation to both
/// iptables and ip6tables and fails if either one fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    Ipv4,
    Ipv6,
    Dual,
}

impl IpFamily {
    pub fn has_ipv4(self) -> bool {
        matches!(self, IpFamily::Ipv4 | IpFamily::Dual)
    }

    pub fn has_ipv6(self) -> bool {
        matches!(self, IpFamily::Ipv6 | IpFamily::Dual)
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::Ipv4 => write!(f, "IPv4"),
            IpFamily::Ipv6 => write!(f, "IPv6"),
            IpFamily::Dual => write!(f, "IPv4v6"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Mangle,
    Nat,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Mangle => "mangle",
            Table::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The iptables command verbs used by the datapath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `-A`: append a rule.
    Append,
    /// `-I`: insert a rule in first position.
    Insert,
    /// `-D`: delete a rule.
    Delete,
    /// `-N`: create a chain.
    NewChain,
    /// `-X`: delete an empty chain.
    DeleteChain,
    /// `-F`: flush a chain.
    Flush,
    /// `-C`: check whether a rule exists.
    Check,
    /// `-L`: list rules.
    List,
}

impl Command {
    pub fn flag(self) -> &'static str {
        match self {
            Command::Append => "-A",
            Command::Insert => "-I",
            Command::Delete => "-D",
            Command::NewChain => "-N",
            Command::DeleteChain => "-X",
            Command::Flush => "-F",
            Command::Check => "-C",
            Command::List => "-L",
        }
    }

    /// True for verbs that mutate the ruleset and can therefore be
    /// deferred into an `iptables-restore` batch.
    pub fn is_mutation(self) -> bool {
        !matches!(self, Command::Check | Command::List)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.flag())
    }
}
