use clap::Parser;

use std::path::PathBuf;

/// Host packet-forwarding daemon for virtualized guests
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// General configuration file
    #[arg(short, long, env = "PATCHPANEL_CONFIG")]
    pub config_path: Option<PathBuf>,

    /// Socket path for the request surface of this service
    #[arg(short, long, env = "PATCHPANEL_SOCKET")]
    pub socket_path: Option<PathBuf>,

    /// Serve the ARCVM datapath instead of the ARC container one
    #[arg(long)]
    pub arc_vm: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
