//! Ordered, cancellable application of link-impairment mutations.
//!
//! The timeline consumes its sorted event list once. Each wait is computed
//! from the shared clock against the event's absolute offset, never chained
//! from the previous wake, so a slow `apply` call delays at most the events
//! it overlaps and never shifts the rest of the schedule.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::{ExperimentClock, Wait};
use crate::error::ImpairmentApplyError;
use crate::link::{ImpairmentSpec, LinkController};

/// One scheduled mutation of a target link.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkImpairmentEvent {
    /// Absolute offset from experiment start.
    pub offset: Duration,
    pub link: String,
    pub change: ImpairmentSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimelineOutcome {
    /// Every event was applied.
    Completed,
    /// Cancellation stopped the timeline early; applied events stay applied.
    Cancelled,
    /// Every offset was reached but one or more applies errored.
    PartiallyFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineReport {
    pub outcome: TimelineOutcome,
    /// Number of events successfully applied.
    pub applied: usize,
    pub failures: Vec<ImpairmentApplyError>,
}

/// Sorted sequence of impairment events for one run.
pub struct EventTimeline {
    events: Vec<LinkImpairmentEvent>,
}

impl EventTimeline {
    /// `events` must be sorted ascending by offset with unique offsets per
    /// link; `config::validate` enforces that before a run is built.
    pub fn new(events: Vec<LinkImpairmentEvent>) -> Self {
        debug_assert!(events.windows(2).all(|w| w[0].offset <= w[1].offset));
        Self { events }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Apply all events in order against the shared clock.
    ///
    /// Apply failures are non-fatal: they are recorded and the timeline
    /// proceeds to the next event. Cancellation stops further processing
    /// without rolling back anything already applied.
    pub async fn run(
        self,
        clock: ExperimentClock,
        link: Arc<dyn LinkController>,
        cancel: CancelToken,
    ) -> TimelineReport {
        let mut applied = 0usize;
        let mut failures = Vec::new();

        for event in self.events {
            if clock.wait_until(event.offset, &cancel).await == Wait::Cancelled {
                info!(
                    applied,
                    at = ?clock.elapsed(),
                    "timeline cancelled, remaining events skipped"
                );
                return TimelineReport {
                    outcome: TimelineOutcome::Cancelled,
                    applied,
                    failures,
                };
            }

            debug!(
                link = %event.link,
                offset = ?event.offset,
                elapsed = ?clock.elapsed(),
                change = ?event.change,
                "applying scheduled impairment"
            );
            match link.apply(&event.link, &event.change).await {
                Ok(()) => applied += 1,
                Err(err) => {
                    warn!(link = %event.link, offset = ?event.offset, "apply failed: {err:#}");
                    failures.push(ImpairmentApplyError {
                        offset: event.offset,
                        link: event.link,
                        message: format!("{err:#}"),
                    });
                }
            }
        }

        let outcome = if failures.is_empty() {
            TimelineOutcome::Completed
        } else {
            TimelineOutcome::PartiallyFailed
        };
        TimelineReport {
            outcome,
            applied,
            failures,
        }
    }
}
