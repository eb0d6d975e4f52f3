//! Final run reports for external consumers.
//!
//! Everything here is raw outcome data, serializable for the `--json` output
//! path; interpretation (graphing, pass/fail policies) is left to whoever
//! reads it.

use std::path::PathBuf;

use serde::Serialize;

use crate::capture::{CaptureSession, CaptureState};
use crate::runner::ExitStatus;
use crate::timeline::{TimelineOutcome, TimelineReport};
use crate::traffic::{TrafficOutcome, TrafficReport};

/// What ended the measured interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopTrigger {
    /// The configured total duration elapsed.
    DurationElapsed,
    /// Every producer process exited on its own.
    ProducersFinished,
    /// Cancellation was requested externally (interrupt).
    Interrupted,
}

/// Overall run verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub interface: String,
    pub output_path: PathBuf,
    pub state: CaptureState,
}

impl From<&CaptureSession> for CaptureSummary {
    fn from(session: &CaptureSession) -> Self {
        Self {
            interface: session.interface.clone(),
            output_path: session.output_path.clone(),
            state: session.state,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProducerSummary {
    pub label: String,
    pub exit: Option<ExitStatus>,
    /// True when the grace period elapsed and the producer had to be killed.
    pub forced: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub trigger: StopTrigger,
    pub outcome: RunOutcome,
    /// True when any capture or pair failed along the way; the run still ran
    /// to a clean teardown, but its artifacts are suspect.
    pub degraded: bool,
    pub timeline: TimelineReport,
    pub traffic: TrafficReport,
    pub captures: Vec<CaptureSummary>,
    pub producers: Vec<ProducerSummary>,
}

impl RunReport {
    pub fn build(
        trigger: StopTrigger,
        timeline: TimelineReport,
        traffic: TrafficReport,
        captures: Vec<CaptureSummary>,
        producers: Vec<ProducerSummary>,
    ) -> Self {
        let outcome = match trigger {
            StopTrigger::Interrupted => RunOutcome::Cancelled,
            _ => RunOutcome::Completed,
        };
        let degraded = captures.iter().any(|c| c.state == CaptureState::Failed)
            || timeline.outcome == TimelineOutcome::PartiallyFailed
            || traffic.outcome == TrafficOutcome::PartiallyFailed
            || traffic.pairs.iter().any(|p| !p.failures.is_empty());
        Self {
            trigger,
            outcome,
            degraded,
            timeline,
            traffic,
            captures,
            producers,
        }
    }

    /// One-line human summary for the log tail.
    pub fn summary(&self) -> String {
        let mode = match (self.outcome, self.degraded) {
            (RunOutcome::Cancelled, _) => "cancelled",
            (RunOutcome::Completed, true) => "completed (degraded)",
            (RunOutcome::Completed, false) => "completed",
        };
        format!(
            "run {mode}: {} events applied, {} capture(s), {} pair(s), trigger {:?}",
            self.timeline.applied,
            self.captures.len(),
            self.traffic.pairs.len(),
            self.trigger
        )
    }
}
