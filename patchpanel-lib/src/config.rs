//! Daemon configuration, loaded from an optional TOML file.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::datapath::{IP6TABLES_START_SCRIPT, IPTABLES_START_SCRIPT};

pub const DEFAULT_CONTROL_SOCKET_PATH: &str = "/run/patchpanel/patchpanel.sock";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("cannot parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Static iptables chain skeleton sourced at start.
    pub iptables_start_script: PathBuf,
    pub ip6tables_start_script: PathBuf,
    /// Unix socket carrying the JSON request surface.
    pub control_socket_path: PathBuf,
    /// WiFi QoS (DSCP marking) enabled at startup.
    pub wifi_qos: bool,
    /// CLAT offload hooks enabled at startup.
    pub clat: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            iptables_start_script: PathBuf::from(IPTABLES_START_SCRIPT),
            ip6tables_start_script: PathBuf::from(IP6TABLES_START_SCRIPT),
            control_socket_path: PathBuf::from(DEFAULT_CONTROL_SOCKET_PATH),
            wifi_qos: false,
            clat: false,
        }
    }
}

impl Config {
    /// Loads the config file, or the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = Config::load(None).unwrap();
        assert_eq!(
            config.iptables_start_script,
            PathBuf::from("/etc/patchpanel/iptables.start")
        );
        assert!(!config.wifi_qos);
    }

    #[test]
    fn parses_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "wifi_qos = true").unwrap();
        writeln!(file, "control_socket_path = \"/tmp/pp.sock\"").unwrap();
        let config = Config::load(Some(file.path())).unwrap();
        assert!(config.wifi_qos);
        assert_eq!(config.control_socket_path, PathBuf::from("/tmp/pp.sock"));
        // Unset fields keep their defaults.
        assert_eq!(
            config.ip6tables_start_script,
            PathBuf::from("/etc/patchpanel/ip6tables.start")
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no_such_option = 1").unwrap();
        assert!(Config::load(Some(file.path())).is_err());
    }
}
