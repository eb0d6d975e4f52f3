//! Error taxonomy for experiment runs.
//!
//! Only [`ProcessStartError`] aborts a run, and only during resource
//! acquisition. Everything else is contained in the task where it happened
//! and reported upward as part of that task's completion report.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// A process needed by the run failed to start.
///
/// Fatal to the acquiring step: the coordinator rolls back resources already
/// acquired and returns this error.
#[derive(Debug, Error)]
#[error("failed to start {label}: {message}")]
pub struct ProcessStartError {
    pub label: String,
    pub message: String,
}

impl ProcessStartError {
    pub fn new(label: impl Into<String>, message: impl ToString) -> Self {
        Self {
            label: label.into(),
            message: message.to_string(),
        }
    }
}

/// A link mutation failed. Non-fatal: the timeline records it and proceeds
/// to the next event.
#[derive(Debug, Clone, Error, Serialize)]
#[error("apply to {link} at {offset:?} failed: {message}")]
pub struct ImpairmentApplyError {
    pub offset: Duration,
    pub link: String,
    pub message: String,
}

/// A traffic generator start or stop failed for one host pair. Non-fatal:
/// other pairs are unaffected.
#[derive(Debug, Clone, Error, Serialize)]
#[error("{pair}: {transition} at {at:?} failed: {message}")]
pub struct GeneratorTransitionError {
    pub pair: String,
    /// Which transition failed ("start baseline", "stop spike", ...).
    pub transition: String,
    pub at: Duration,
    pub message: String,
}
