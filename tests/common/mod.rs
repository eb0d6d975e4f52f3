//! Shared utilities for integration tests.
#![allow(dead_code)]

use netns_env::test_util::{check_netem, check_privileges};
use netns_env::{Namespace, TwoHostWorld};

/// Returns `true` if namespace tests should be skipped (prints the reason to
/// stderr). Use at the top of every test that builds a [`TwoHostWorld`].
pub fn skip_without_netns() -> bool {
    if check_privileges() {
        return false;
    }
    eprintln!("Skipping: requires the `ip` tool and passwordless sudo");
    true
}

/// Like `skip_without_netns` but also requires the netem qdisc.
pub fn skip_without_impairment() -> bool {
    if skip_without_netns() {
        return true;
    }
    if check_netem() {
        return false;
    }
    eprintln!("Skipping: sch_netem not loadable");
    true
}

/// Returns `true` if `name` resolves on PATH.
pub fn has_binary(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Round-trip average in milliseconds for `count` pings from inside `ns`.
pub fn ping_avg_ms(ns: &Namespace, target: &str, count: u32) -> anyhow::Result<f64> {
    let count = count.to_string();
    let out = ns.exec_checked("ping", &["-c", &count, "-i", "0.2", "-W", "2", target])?;
    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    parse_ping_avg(&stdout).ok_or_else(|| anyhow::anyhow!("no rtt line in ping output:\n{stdout}"))
}

/// Pull the avg figure out of ping's `rtt min/avg/max/mdev = a/b/c/d ms` line.
fn parse_ping_avg(output: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.contains("min/avg/max"))?;
    let values = line.split('=').nth(1)?.trim();
    let avg = values.split('/').nth(1)?;
    avg.trim().parse().ok()
}

/// Dump `tc qdisc show` for one interface inside `ns` (for assertions on the
/// installed netem parameters).
pub fn qdisc_show(world: &TwoHostWorld, iface: &str) -> anyhow::Result<String> {
    let out = world
        .left
        .exec_checked("tc", &["qdisc", "show", "dev", iface])?;
    Ok(String::from_utf8_lossy(&out.stdout).to_string())
}
