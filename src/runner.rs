//! Process lifecycle seam.
//!
//! Every external process the experiment touches (captures, traffic
//! generators, streaming producers) goes through [`ProcessRunner`], so the
//! graceful-stop handshake and the single-owner handle discipline are uniform
//! across all of them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::error::ProcessStartError;

/// A command to launch, with a human-readable label for logs and reports.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommandSpec {
    pub label: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(label: impl Into<String>, program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Signal kinds used by the graceful-stop handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGINT. Used for captures so tcpdump flushes its write buffer.
    Interrupt,
    /// SIGTERM. Default graceful stop.
    Terminate,
    /// SIGKILL. Escalation after the grace period.
    Kill,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ExitStatus {
    /// Exit code, or `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Opaque reference to a started process.
///
/// Cloneable so the coordinator can keep a teardown list, but by convention
/// exactly one task signals or waits on a given handle.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub id: u64,
    pub pid: Option<u32>,
    pub label: String,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Launch a process. Failure here is fatal to the acquiring step.
    async fn start(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessStartError>;

    /// Deliver a stop signal to the process (and its group, where possible).
    async fn signal(&self, handle: &ProcessHandle, signal: StopSignal) -> Result<()>;

    /// Wait up to `timeout` for the process to exit.
    ///
    /// `Ok(Some(_))` once exited, `Ok(None)` if still running when the
    /// timeout elapses.
    async fn wait(&self, handle: &ProcessHandle, timeout: Duration) -> Result<Option<ExitStatus>>;

    /// Poll exit status without blocking.
    async fn try_status(&self, handle: &ProcessHandle) -> Result<Option<ExitStatus>>;
}

/// Result of a [`graceful_stop`].
#[derive(Debug, Clone, Copy)]
pub struct StopOutcome {
    pub exit: Option<ExitStatus>,
    /// True when the grace period elapsed and the process had to be killed.
    pub forced: bool,
}

/// Request-stop / bounded-wait / escalate handshake.
///
/// A process that already exited counts as stopped (no signal is sent); the
/// caller can distinguish that case via [`ProcessRunner::try_status`] before
/// calling this if it matters.
pub async fn graceful_stop(
    runner: &dyn ProcessRunner,
    handle: &ProcessHandle,
    signal: StopSignal,
    grace: Duration,
) -> Result<StopOutcome> {
    if let Some(exit) = runner.try_status(handle).await? {
        return Ok(StopOutcome {
            exit: Some(exit),
            forced: false,
        });
    }

    runner.signal(handle, signal).await?;
    if let Some(exit) = runner.wait(handle, grace).await? {
        debug!(label = %handle.label, ?exit, "process stopped gracefully");
        return Ok(StopOutcome {
            exit: Some(exit),
            forced: false,
        });
    }

    warn!(label = %handle.label, ?grace, "grace period elapsed, killing");
    runner.signal(handle, StopSignal::Kill).await?;
    let exit = runner.wait(handle, grace).await?;
    Ok(StopOutcome { exit, forced: true })
}

// ---------------------------------------------------------------------------
// HostProcessRunner
// ---------------------------------------------------------------------------

/// Runs real processes on the host via `tokio::process`.
///
/// An optional argument prefix (e.g. `["sudo", "ip", "netns", "exec", NS]`)
/// is prepended to every command, which is how the netns integration tests
/// place captures and generators inside a namespace. Each child is spawned in
/// its own process group so stop signals reach the inner process even when
/// wrapped by sudo.
pub struct HostProcessRunner {
    prefix: Vec<String>,
    next_id: AtomicU64,
    children: Mutex<FxHashMap<u64, Arc<tokio::sync::Mutex<tokio::process::Child>>>>,
}

impl HostProcessRunner {
    pub fn new() -> Self {
        Self::with_prefix(Vec::new())
    }

    pub fn with_prefix(prefix: Vec<String>) -> Self {
        Self {
            prefix,
            next_id: AtomicU64::new(1),
            children: Mutex::new(FxHashMap::default()),
        }
    }

    fn child(&self, handle: &ProcessHandle) -> Result<Arc<tokio::sync::Mutex<tokio::process::Child>>> {
        self.children
            .lock()
            .expect("children lock")
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown process handle: {}", handle.label))
    }

    fn signal_name(signal: StopSignal) -> &'static str {
        match signal {
            StopSignal::Interrupt => "-INT",
            StopSignal::Terminate => "-TERM",
            StopSignal::Kill => "-KILL",
        }
    }
}

impl Default for HostProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRunner for HostProcessRunner {
    async fn start(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessStartError> {
        let mut argv = self.prefix.clone();
        argv.push(spec.program.clone());
        argv.extend(spec.args.iter().cloned());

        let mut cmd = tokio::process::Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| ProcessStartError::new(&spec.label, format!("spawn {}: {e}", argv[0])))?;

        let pid = child.id();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.children
            .lock()
            .expect("children lock")
            .insert(id, Arc::new(tokio::sync::Mutex::new(child)));

        debug!(label = %spec.label, pid, "spawned process");
        Ok(ProcessHandle {
            id,
            pid,
            label: spec.label.clone(),
        })
    }

    async fn signal(&self, handle: &ProcessHandle, signal: StopSignal) -> Result<()> {
        let Some(pid) = handle.pid else {
            return Ok(());
        };

        // Signal the whole process group (negative PID). Route through sudo
        // when the runner itself launches via sudo, otherwise plain kill.
        let group = format!("-{pid}");
        let name = Self::signal_name(signal);
        let output = if self.prefix.first().is_some_and(|p| p == "sudo") {
            tokio::process::Command::new("sudo")
                .args(["kill", name, "--", &group])
                .output()
                .await
        } else {
            tokio::process::Command::new("kill")
                .args([name, "--", &group])
                .output()
                .await
        }
        .with_context(|| format!("kill {name} {group}"))?;

        if !output.status.success() {
            // Group may already be gone; fall back to the direct child.
            let child = self.child(handle)?;
            let mut child = child.lock().await;
            if child.try_wait().context("try_wait")?.is_none() && signal == StopSignal::Kill {
                child.start_kill().context("start_kill")?;
            }
        }
        Ok(())
    }

    async fn wait(&self, handle: &ProcessHandle, timeout: Duration) -> Result<Option<ExitStatus>> {
        let child = self.child(handle)?;
        let mut child = child.lock().await;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                let status = status.with_context(|| format!("wait on {}", handle.label))?;
                Ok(Some(ExitStatus {
                    code: status.code(),
                }))
            }
            Err(_) => Ok(None),
        }
    }

    async fn try_status(&self, handle: &ProcessHandle) -> Result<Option<ExitStatus>> {
        let child = self.child(handle)?;
        let mut child = child.lock().await;
        let status = child
            .try_wait()
            .with_context(|| format!("poll {}", handle.label))?;
        Ok(status.map(|s| ExitStatus { code: s.code() }))
    }
}
