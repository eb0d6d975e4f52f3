//! Network namespaces with scoped cleanup.

use std::process::{Command, Output};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// One end of a veth pair: interface name plus its CIDR address.
///
/// Interface names must fit the 15-character netdev limit.
#[derive(Debug, Clone)]
pub struct VethEnd {
    pub iface: String,
    pub cidr: String,
}

impl VethEnd {
    pub fn new(iface: impl Into<String>, cidr: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
            cidr: cidr.into(),
        }
    }
}

/// A Linux network namespace, deleted again on drop.
///
/// Construction creates the namespace and brings loopback up; every command
/// inside it goes through `sudo ip netns exec`.
pub struct Namespace {
    pub name: String,
}

impl Namespace {
    pub fn new(name: &str) -> Result<Self> {
        // A namespace left over from a crashed run would make `add` fail.
        let _ = run_sudo(&["ip", "netns", "del", name]);
        run_sudo_checked(&["ip", "netns", "add", name])
            .with_context(|| format!("create netns '{name}'"))?;
        debug!(ns = name, "network namespace created");

        let ns = Self {
            name: name.to_string(),
        };
        // Loopback is best-effort; nothing in the tests depends on it.
        let _ = ns.exec("ip", &["link", "set", "lo", "up"]);
        Ok(ns)
    }

    /// Argument prefix that places a command inside this namespace.
    ///
    /// Suitable for `HostProcessRunner::with_prefix` and
    /// `TcLinkController::with_prefix`: `["sudo", "ip", "netns", "exec", name]`.
    pub fn exec_prefix(&self) -> Vec<String> {
        ["sudo", "ip", "netns", "exec", self.name.as_str()]
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Run a command inside this namespace, returning raw output.
    pub fn exec(&self, program: &str, args: &[&str]) -> Result<Output> {
        let mut argv = vec!["ip", "netns", "exec", &self.name, program];
        argv.extend_from_slice(args);
        run_sudo(&argv).with_context(|| format!("exec '{program}' in ns '{}'", self.name))
    }

    /// Like [`Namespace::exec`], but a non-zero exit is an error.
    pub fn exec_checked(&self, program: &str, args: &[&str]) -> Result<Output> {
        let mut argv = vec!["ip", "netns", "exec", &self.name, program];
        argv.extend_from_slice(args);
        run_sudo_checked(&argv).with_context(|| format!("exec '{program}' in ns '{}'", self.name))
    }

    /// Wire this namespace to `peer` with a fresh veth pair, one addressed
    /// and raised end on each side.
    pub fn connect(&self, peer: &Namespace, local: &VethEnd, remote: &VethEnd) -> Result<()> {
        // Stale interface with the same name from an earlier run.
        let _ = run_sudo(&["ip", "link", "del", &local.iface]);

        run_sudo_checked(&[
            "ip", "link", "add", &local.iface, "type", "veth", "peer", "name", &remote.iface,
        ])
        .with_context(|| format!("create veth {} <-> {}", local.iface, remote.iface))?;

        for (ns, end) in [(self, local), (peer, remote)] {
            ns.adopt_end(end)
                .with_context(|| format!("configure {} in '{}'", end.iface, ns.name))?;
        }

        debug!(
            left_ns = %self.name,
            left = %local.iface,
            right_ns = %peer.name,
            right = %remote.iface,
            "veth link up"
        );
        Ok(())
    }

    /// Move a veth end (currently in the host namespace) here, address it,
    /// and bring it up.
    fn adopt_end(&self, end: &VethEnd) -> Result<()> {
        run_sudo_checked(&["ip", "link", "set", &end.iface, "netns", &self.name])?;
        self.exec_checked("ip", &["addr", "add", &end.cidr, "dev", &end.iface])?;
        self.exec_checked("ip", &["link", "set", &end.iface, "up"])?;
        Ok(())
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        debug!(ns = self.name, "deleting network namespace");
        let _ = run_sudo(&["ip", "netns", "del", &self.name]);
    }
}

fn run_sudo(args: &[&str]) -> Result<Output> {
    Command::new("sudo")
        .args(args)
        .output()
        .with_context(|| format!("sudo {}", args.join(" ")))
}

fn run_sudo_checked(args: &[&str]) -> Result<Output> {
    let output = run_sudo(args)?;
    if !output.status.success() {
        bail!(
            "command failed: sudo {}\n{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output)
}
