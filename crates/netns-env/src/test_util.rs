use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

static NAME_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Returns `true` if the environment supports namespace-based tests
/// (requires the `ip` tool and passwordless `sudo`).
pub fn check_privileges() -> bool {
    let has_ip = Command::new("ip")
        .arg("netns")
        .output()
        .is_ok_and(|o| o.status.success());

    has_ip
        && Command::new("sudo")
            .args(["-n", "ip", "netns", "list"])
            .output()
            .is_ok_and(|o| o.status.success())
}

/// Returns `true` if the sch_netem qdisc can be loaded (needed for any test
/// that applies impairment).
pub fn check_netem() -> bool {
    Command::new("sudo")
        .args(["modprobe", "sch_netem"])
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Generate a unique namespace/interface name safe for parallel tests.
///
/// Combines prefix + PID + atomic counter, truncated to 15 chars
/// (Linux netdev name limit).
pub fn unique_name(prefix: &str) -> String {
    let seq = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xffff;
    let name = format!("{prefix}_{pid:x}_{seq}");
    if name.len() > 15 { name[..15].to_string() } else { name }
}
