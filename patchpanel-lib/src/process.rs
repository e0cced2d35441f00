//! Child-process execution for `ip`, `iptables` and friends.
//!
//! All invocations are synchronous: they run to completion on the
//! executor thread, which is the daemon's concurrency model for kernel
//! mutations. The iptables batch mode exists to bound the number of such
//! stalls on cold paths: while a [`IptablesBatchMode`] guard is alive,
//! rule mutations are buffered and flushed through a single
//! `iptables-restore -n` invocation per family when the last guard drops.

use std::cell::RefCell;
use std::io::Write;
use std::path::Path;
use std::process::{Command as SysCommand, Stdio};

use thiserror::Error;

use crate::iptables::{Command, Table};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("command `{0}` failed")]
    CommandFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pid value meaning "create a fresh namespace" for
/// [`ProcessRunner::ip_netns_attach`] callers.
pub const NEW_NETNS_PID: i32 = -1;

/// Seam over every external program the datapath drives. Production uses
/// [`RealProcessRunner`]; tests use the stateful fake in `mocks`.
pub trait ProcessRunner {
    /// `ip <object> <action> <args…>`.
    fn ip(&self, object: &str, action: &str, args: &[&str], log_failures: bool)
    -> Result<(), ProcessError>;

    /// `ip -6 <object> <action> <args…>`.
    fn ip6(&self, object: &str, action: &str, args: &[&str], log_failures: bool)
    -> Result<(), ProcessError>;

    /// `ip -netns <netns> <object> <action> <args…>`, running inside the
    /// named namespace without flipping the daemon's own namespace.
    fn ip_in_netns(
        &self,
        netns: &str,
        object: &str,
        action: &str,
        args: &[&str],
    ) -> Result<(), ProcessError>;

    /// `ip -6 -netns <netns> <object> <action> <args…>`.
    fn ip6_in_netns(
        &self,
        netns: &str,
        object: &str,
        action: &str,
        args: &[&str],
    ) -> Result<(), ProcessError>;

    fn ip_netns_add(&self, netns: &str) -> Result<(), ProcessError>;
    fn ip_netns_attach(&self, netns: &str, pid: i32) -> Result<(), ProcessError>;
    fn ip_netns_delete(&self, netns: &str, log_failures: bool) -> Result<(), ProcessError>;

    /// `ip netns exec <netns> <argv…>`, for programs without native netns
    /// support (sysctl).
    fn ip_netns_exec(&self, netns: &str, argv: &[&str]) -> Result<(), ProcessError>;

    fn iptables(
        &self,
        table: Table,
        command: Command,
        chain: &str,
        args: &[&str],
        log_failures: bool,
    ) -> Result<(), ProcessError>;

    fn ip6tables(
        &self,
        table: Table,
        command: Command,
        chain: &str,
        args: &[&str],
        log_failures: bool,
    ) -> Result<(), ProcessError>;

    /// Dumps a table with `-L -x -v -n -w`. Debug only.
    fn iptables_dump(&self, ipv6: bool, table: Table) -> Result<String, ProcessError>;

    fn iptables_restore(&self, script: &Path) -> Result<(), ProcessError>;
    fn ip6tables_restore(&self, script: &Path) -> Result<(), ProcessError>;

    fn modprobe_all(&self, modules: &[&str]) -> Result<(), ProcessError>;

    /// Increments the batch depth; mutations are buffered until the depth
    /// returns to zero. Use [`acquire_iptables_batch_mode`] instead of
    /// calling this directly.
    fn begin_iptables_batch(&self);

    /// Decrements the batch depth, flushing the buffered mutations when it
    /// reaches zero.
    fn end_iptables_batch(&self);
}

/// RAII guard for iptables batch mode. Flushes on drop.
pub struct IptablesBatchMode<'a> {
    runner: &'a dyn ProcessRunner,
}

impl Drop for IptablesBatchMode<'_> {
    fn drop(&mut self) {
        self.runner.end_iptables_batch();
    }
}

pub fn acquire_iptables_batch_mode(runner: &dyn ProcessRunner) -> IptablesBatchMode<'_> {
    runner.begin_iptables_batch();
    IptablesBatchMode { runner }
}

#[derive(Default)]
struct BatchState {
    depth: u32,
    v4: Vec<(Table, String)>,
    v6: Vec<(Table, String)>,
}

/// Production [`ProcessRunner`] executing the real binaries.
#[derive(Default)]
pub struct RealProcessRunner {
    batch: RefCell<BatchState>,
}

impl RealProcessRunner {
    pub fn new() -> RealProcessRunner {
        RealProcessRunner::default()
    }

    fn run(&self, program: &str, args: &[&str], log_failures: bool) -> Result<(), ProcessError> {
        let output = SysCommand::new(program).args(args).output()?;
        if output.status.success() {
            if !output.stderr.is_empty() && log_failures {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::warn!(cmd = %render(program, args), %stderr, "non empty stderr on successful command");
            }
            return Ok(());
        }
        if log_failures {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(
                cmd = %render(program, args),
                status_code = ?output.status.code(),
                %stdout,
                %stderr,
                "error executing command"
            );
        }
        Err(ProcessError::CommandFailed(render(program, args)))
    }

    fn run_stdout(&self, program: &str, args: &[&str]) -> Result<String, ProcessError> {
        let output = SysCommand::new(program).args(args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(cmd = %render(program, args), %stderr, "error executing command");
            return Err(ProcessError::CommandFailed(render(program, args)));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn xtables(
        &self,
        ipv6: bool,
        table: Table,
        command: Command,
        chain: &str,
        args: &[&str],
        log_failures: bool,
    ) -> Result<(), ProcessError> {
        {
            let mut batch = self.batch.borrow_mut();
            if batch.depth > 0 && command.is_mutation() {
                let mut line = format!("{} {}", command.flag(), chain);
                for arg in args {
                    if *arg == "-w" {
                        continue;
                    }
                    line.push(' ');
                    line.push_str(arg);
                }
                let buffer = if ipv6 { &mut batch.v6 } else { &mut batch.v4 };
                buffer.push((table, line));
                return Ok(());
            }
        }
        let program = if ipv6 { "ip6tables" } else { "iptables" };
        let mut argv: Vec<&str> = vec!["-t", table.name(), command.flag()];
        if !chain.is_empty() {
            argv.push(chain);
        }
        argv.extend_from_slice(args);
        self.run(program, &argv, log_failures)
    }

    fn flush_batch(&self) {
        let state = {
            let mut batch = self.batch.borrow_mut();
            std::mem::take(&mut *batch)
        };
        for (ipv6, rules) in [(false, state.v4), (true, state.v6)] {
            if rules.is_empty() {
                continue;
            }
            let program = if ipv6 { "ip6tables-restore" } else { "iptables-restore" };
            if let Err(error) = self.restore_rules(program, &rules) {
                tracing::error!(%error, program, "failed to commit batched iptables rules");
            }
        }
    }

    fn restore_rules(&self, program: &str, rules: &[(Table, String)]) -> Result<(), ProcessError> {
        let mut input = String::new();
        for table in [Table::Filter, Table::Mangle, Table::Nat] {
            let lines: Vec<&str> = rules
                .iter()
                .filter(|(t, _)| *t == table)
                .map(|(_, line)| line.as_str())
                .collect();
            if lines.is_empty() {
                continue;
            }
            input.push_str(&format!("*{}\n", table.name()));
            for line in lines {
                input.push_str(line);
                input.push('\n');
            }
            input.push_str("COMMIT\n");
        }
        let mut child = SysCommand::new(program)
            .args(["-n", "-w"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(input.as_bytes())?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!(%stderr, %input, "iptables-restore rejected batched rules");
            return Err(ProcessError::CommandFailed(program.to_string()));
        }
        Ok(())
    }
}

fn render(program: &str, args: &[&str]) -> String {
    let mut s = String::from(program);
    for arg in args {
        s.push(' ');
        s.push_str(arg);
    }
    s
}

impl ProcessRunner for RealProcessRunner {
    fn ip(
        &self,
        object: &str,
        action: &str,
        args: &[&str],
        log_failures: bool,
    ) -> Result<(), ProcessError> {
        let mut argv = vec![object, action];
        argv.extend_from_slice(args);
        self.run("ip", &argv, log_failures)
    }

    fn ip6(
        &self,
        object: &str,
        action: &str,
        args: &[&str],
        log_failures: bool,
    ) -> Result<(), ProcessError> {
        let mut argv = vec!["-6", object, action];
        argv.extend_from_slice(args);
        self.run("ip", &argv, log_failures)
    }

    fn ip_in_netns(
        &self,
        netns: &str,
        object: &str,
        action: &str,
        args: &[&str],
    ) -> Result<(), ProcessError> {
        let mut argv = vec!["-netns", netns, object, action];
        argv.extend_from_slice(args);
        self.run("ip", &argv, true)
    }

    fn ip6_in_netns(
        &self,
        netns: &str,
        object: &str,
        action: &str,
        args: &[&str],
    ) -> Result<(), ProcessError> {
        let mut argv = vec!["-6", "-netns", netns, object, action];
        argv.extend_from_slice(args);
        self.run("ip", &argv, true)
    }

    fn ip_netns_add(&self, netns: &str) -> Result<(), ProcessError> {
        self.run("ip", &["netns", "add", netns], true)
    }

    fn ip_netns_attach(&self, netns: &str, pid: i32) -> Result<(), ProcessError> {
        let pid = pid.to_string();
        self.run("ip", &["netns", "attach", netns, &pid], true)
    }

    fn ip_netns_delete(&self, netns: &str, log_failures: bool) -> Result<(), ProcessError> {
        self.run("ip", &["netns", "delete", netns], log_failures)
    }

    fn ip_netns_exec(&self, netns: &str, argv: &[&str]) -> Result<(), ProcessError> {
        let mut full = vec!["netns", "exec", netns];
        full.extend_from_slice(argv);
        self.run("ip", &full, true)
    }

    fn iptables(
        &self,
        table: Table,
        command: Command,
        chain: &str,
        args: &[&str],
        log_failures: bool,
    ) -> Result<(), ProcessError> {
        self.xtables(false, table, command, chain, args, log_failures)
    }

    fn ip6tables(
        &self,
        table: Table,
        command: Command,
        chain: &str,
        args: &[&str],
        log_failures: bool,
    ) -> Result<(), ProcessError> {
        self.xtables(true, table, command, chain, args, log_failures)
    }

    fn iptables_dump(&self, ipv6: bool, table: Table) -> Result<String, ProcessError> {
        let program = if ipv6 { "ip6tables" } else { "iptables" };
        self.run_stdout(program, &["-t", table.name(), "-L", "-x", "-v", "-n", "-w"])
    }

    fn iptables_restore(&self, script: &Path) -> Result<(), ProcessError> {
        let script = script.to_string_lossy();
        self.run("iptables-restore", &["-w", &script], true)
    }

    fn ip6tables_restore(&self, script: &Path) -> Result<(), ProcessError> {
        let script = script.to_string_lossy();
        self.run("ip6tables-restore", &["-w", &script], true)
    }

    fn modprobe_all(&self, modules: &[&str]) -> Result<(), ProcessError> {
        let mut argv = vec!["-a"];
        argv.extend_from_slice(modules);
        self.run("modprobe", &argv, true)
    }

    fn begin_iptables_batch(&self) {
        self.batch.borrow_mut().depth += 1;
    }

    fn end_iptables_batch(&self) {
        let depth = {
            let mut batch = self.batch.borrow_mut();
            batch.depth = batch.depth.saturating_sub(1);
            batch.depth
        };
        if depth == 0 {
            self.flush_batch();
        }
    }
}
