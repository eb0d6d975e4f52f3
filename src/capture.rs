//! Bracketed packet captures.
//!
//! `acquire` starts one tcpdump per requested interface and only returns once
//! every capture is confirmed running, so capture start happens-before any
//! measured traffic. `release` is the single stop path: graceful SIGINT (so
//! tcpdump flushes), bounded grace wait, SIGKILL escalation, and a session
//! state machine that makes a second release a no-op.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::error::ProcessStartError;
use crate::runner::{CommandSpec, ProcessHandle, ProcessRunner, StopSignal, graceful_stop};

pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// One interface to capture and where to write its artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub interface: String,
    pub output_path: PathBuf,
}

/// Capture session lifecycle. Exactly one transition into `Stopped` or
/// `Failed` per session; sessions are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CaptureState {
    Starting,
    Running,
    Stopped,
    /// The process exited on its own before release (degraded capture).
    Failed,
}

#[derive(Debug)]
pub struct CaptureSession {
    pub interface: String,
    pub output_path: PathBuf,
    pub handle: ProcessHandle,
    pub state: CaptureState,
}

/// Scoped acquisition of capture processes.
pub struct CaptureBracket {
    runner: Arc<dyn ProcessRunner>,
    settle: Duration,
    grace: Duration,
}

impl CaptureBracket {
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            settle: DEFAULT_SETTLE,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_timing(runner: Arc<dyn ProcessRunner>, settle: Duration, grace: Duration) -> Self {
        Self {
            runner,
            settle,
            grace,
        }
    }

    /// Start one capture per request and confirm each is running.
    ///
    /// A process that fails to start, or dies during the settle window, is a
    /// fatal acquisition error: captures already started are released before
    /// the error returns, so the caller never inherits half a bracket.
    pub async fn acquire(
        &self,
        requests: &[CaptureRequest],
    ) -> Result<SmallVec<CaptureSession, 4>, ProcessStartError> {
        let mut sessions: SmallVec<CaptureSession, 4> = SmallVec::new();

        for request in requests {
            let spec = capture_command(request);
            match self.runner.start(&spec).await {
                Ok(handle) => {
                    debug!(interface = %request.interface, "capture starting");
                    sessions.push(CaptureSession {
                        interface: request.interface.clone(),
                        output_path: request.output_path.clone(),
                        handle,
                        state: CaptureState::Starting,
                    });
                }
                Err(err) => {
                    warn!(interface = %request.interface, "capture start failed, rolling back");
                    self.release(&mut sessions).await;
                    return Err(err);
                }
            }
        }

        // Settle so tcpdump is attached before any measured traffic flows.
        tokio::time::sleep(self.settle).await;

        for i in 0..sessions.len() {
            match self.runner.try_status(&sessions[i].handle).await {
                Ok(None) => sessions[i].state = CaptureState::Running,
                Ok(Some(exit)) => {
                    let label = sessions[i].handle.label.clone();
                    warn!(interface = %sessions[i].interface, ?exit, "capture died during settle");
                    sessions[i].state = CaptureState::Failed;
                    self.release(&mut sessions).await;
                    return Err(ProcessStartError::new(
                        label,
                        format!("capture exited during settle window ({exit:?})"),
                    ));
                }
                Err(err) => {
                    let label = sessions[i].handle.label.clone();
                    self.release(&mut sessions).await;
                    return Err(ProcessStartError::new(label, format!("{err:#}")));
                }
            }
        }

        info!(count = sessions.len(), "captures running");
        Ok(sessions)
    }

    /// Stop every session that is still live. Runs on every exit path of the
    /// owning scope; per-session stop happens exactly once, so calling this
    /// twice (or after a partial acquire rollback) is safe.
    pub async fn release(&self, sessions: &mut SmallVec<CaptureSession, 4>) {
        for session in sessions.iter_mut() {
            match session.state {
                CaptureState::Stopped | CaptureState::Failed => continue,
                CaptureState::Starting | CaptureState::Running => {}
            }

            // A capture that already exited crashed on its own: degraded
            // capture, but the run goes on.
            match self.runner.try_status(&session.handle).await {
                Ok(Some(exit)) => {
                    warn!(
                        interface = %session.interface,
                        ?exit,
                        "capture exited before release, marking failed"
                    );
                    session.state = CaptureState::Failed;
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(interface = %session.interface, "capture status poll failed: {err:#}");
                    session.state = CaptureState::Failed;
                    continue;
                }
            }

            match graceful_stop(
                &*self.runner,
                &session.handle,
                StopSignal::Interrupt,
                self.grace,
            )
            .await
            {
                Ok(outcome) => {
                    if outcome.forced {
                        warn!(interface = %session.interface, "capture killed after grace period");
                    } else {
                        debug!(interface = %session.interface, "capture stopped");
                    }
                    session.state = CaptureState::Stopped;
                }
                Err(err) => {
                    warn!(interface = %session.interface, "capture stop failed: {err:#}");
                    session.state = CaptureState::Failed;
                }
            }
        }
    }
}

/// tcpdump invocation for one interface: unbuffered writes, full packets.
fn capture_command(request: &CaptureRequest) -> CommandSpec {
    CommandSpec::new(
        format!("tcpdump {}", request.interface),
        "tcpdump",
        [
            "-U".to_string(),
            "-s0".to_string(),
            "-i".to_string(),
            request.interface.clone(),
            "-w".to_string(),
            request.output_path.display().to_string(),
        ],
    )
}

/// Artifact path `<dir>/<iface>_<unix-seconds>.pcap`.
pub fn timestamped_pcap(dir: &Path, interface: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(format!("{interface}_{ts}.pcap"))
}
