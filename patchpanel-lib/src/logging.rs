//! Tracing bootstrap for the daemon.

use std::fs::OpenOptions;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info";
const ENV_VAR_LOG_FILE: &str = "PATCHPANEL_LOG_FILE";

/// Initializes the global subscriber. Logs go to stderr, or to the file
/// named by `PATCHPANEL_LOG_FILE` when set. The filter comes from
/// `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let writer = match std::env::var(ENV_VAR_LOG_FILE) {
        Ok(log_path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)
                .unwrap_or_else(|e| panic!("failed to open log file {log_path}: {e}"));
            BoxMakeWriter::new(file)
        }
        Err(_) => BoxMakeWriter::new(std::io::stderr),
    };
    let layer = fmt::layer().with_writer(writer).with_ansi(false);
    tracing_subscriber::registry().with(layer).with(filter).init();
}
