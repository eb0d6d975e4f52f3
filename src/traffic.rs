//! Baseline/spike background traffic generation.
//!
//! Each host pair runs its own task: a baseline generator for the whole
//! experiment, interrupted by scheduled spikes at elevated rates. Spike
//! offsets are absolute from experiment start (the same basis the impairment
//! timeline uses), not relative to the pair or the previous spike.
//!
//! Transitions are strictly stop-before-start so at most one generator
//! process exists per pair at any instant — two iperf clients fighting over
//! the same port is exactly the contention this exists to avoid.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::{ExperimentClock, Wait};
use crate::error::GeneratorTransitionError;
use crate::runner::{
    CommandSpec, ExitStatus, ProcessHandle, ProcessRunner, StopSignal, graceful_stop,
};
use crate::topology::{HostPair, TopologyProvider};

/// A temporary elevated-rate interval superimposed on baseline traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrafficSpike {
    /// Absolute offset from experiment start.
    pub offset: Duration,
    pub duration: Duration,
    pub rate_kbit: u64,
}

impl TrafficSpike {
    pub fn end(&self) -> Duration {
        self.offset + self.duration
    }
}

/// Baseline rate, target pairs, and the shared spike schedule.
#[derive(Debug, Clone)]
pub struct TrafficPattern {
    pub baseline_rate_kbit: u64,
    pub pairs: Vec<HostPair>,
    /// Sorted ascending by offset; intervals never overlap
    /// (`config::validate` enforces both).
    pub spikes: Vec<TrafficSpike>,
}

/// How a generator stop concluded.
///
/// A generator that died before its scheduled stop did not deliver the
/// traffic pattern, so the two success shapes are kept apart: `Clean` is a
/// real transition, `SelfExited` is a pair failure that nonetheless leaves
/// the pair clear for its next start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDisposition {
    /// Stopped through the graceful-stop handshake.
    Clean,
    /// Already dead when the stop came due.
    SelfExited(ExitStatus),
}

/// Starts and stops one generator process per host pair.
///
/// Implemented for real traffic by [`IperfTrafficController`]; tests
/// substitute an in-memory recorder that checks the single-generator
/// invariant.
#[async_trait]
pub trait TrafficController: Send + Sync {
    async fn start(&self, pair: &HostPair, rate_kbit: u64) -> Result<ProcessHandle>;
    async fn stop(&self, handle: ProcessHandle) -> Result<StopDisposition>;
}

/// Per-pair generator state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PairPhase {
    Idle,
    Baseline,
    Spiking,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrafficOutcome {
    Completed,
    Cancelled,
    /// All offsets were reached but one or more pair transitions errored.
    PartiallyFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub pair: String,
    /// Completed generator transitions (starts + stops).
    pub transitions: usize,
    pub failures: Vec<GeneratorTransitionError>,
    pub cancelled: bool,
    /// Phase the pair was in when it wound down.
    pub last_phase: PairPhase,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrafficReport {
    pub outcome: TrafficOutcome,
    pub pairs: Vec<PairReport>,
}

impl TrafficReport {
    pub fn failed_pairs(&self) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|p| !p.failures.is_empty())
            .map(|p| p.pair.as_str())
            .collect()
    }
}

/// Drives the full pattern across all pairs for one run.
pub struct TrafficPatternGenerator {
    pattern: TrafficPattern,
    /// Absolute end of traffic generation (the experiment duration).
    total: Duration,
}

impl TrafficPatternGenerator {
    pub fn new(pattern: TrafficPattern, total: Duration) -> Self {
        debug_assert!(
            pattern.spikes.windows(2).all(|w| w[0].end() <= w[1].offset),
            "spikes must be sorted and non-overlapping"
        );
        Self { pattern, total }
    }

    /// Run every pair's state machine to completion or cancellation.
    ///
    /// Pairs are independent tasks: a failed start or stop on one pair is
    /// recorded in that pair's report and does not block the others.
    pub async fn run(
        self,
        clock: ExperimentClock,
        controller: Arc<dyn TrafficController>,
        cancel: CancelToken,
    ) -> TrafficReport {
        let mut tasks: JoinSet<PairReport> = JoinSet::new();
        for pair in self.pattern.pairs.clone() {
            let driver = PairDriver {
                pair,
                baseline_rate_kbit: self.pattern.baseline_rate_kbit,
                spikes: self.pattern.spikes.clone(),
                total: self.total,
                clock,
                controller: controller.clone(),
                cancel: cancel.clone(),
            };
            tasks.spawn(driver.run());
        }

        let mut pairs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => pairs.push(report),
                Err(err) => warn!("pair task panicked: {err}"),
            }
        }
        pairs.sort_by(|a, b| a.pair.cmp(&b.pair));

        let outcome = if pairs.iter().any(|p| p.cancelled) {
            TrafficOutcome::Cancelled
        } else if pairs.iter().any(|p| !p.failures.is_empty()) {
            TrafficOutcome::PartiallyFailed
        } else {
            TrafficOutcome::Completed
        };
        TrafficReport { outcome, pairs }
    }
}

/// State machine for a single pair: Idle → Baseline → (Spiking → Baseline)* → Stopped.
struct PairDriver {
    pair: HostPair,
    baseline_rate_kbit: u64,
    spikes: Vec<TrafficSpike>,
    total: Duration,
    clock: ExperimentClock,
    controller: Arc<dyn TrafficController>,
    cancel: CancelToken,
}

impl PairDriver {
    async fn run(mut self) -> PairReport {
        let label = self.pair.label();
        let mut report = PairReport {
            pair: label.clone(),
            transitions: 0,
            failures: Vec::new(),
            cancelled: false,
            last_phase: PairPhase::Idle,
        };
        let mut current: Option<ProcessHandle> = None;

        // Baseline starts immediately and covers the whole run outside spikes.
        self.start_into(
            &mut current,
            &mut report,
            self.baseline_rate_kbit,
            "start baseline",
        )
        .await;
        report.last_phase = PairPhase::Baseline;

        let spikes = std::mem::take(&mut self.spikes);
        for spike in spikes {
            if self.clock.wait_until(spike.offset, &self.cancel).await == Wait::Cancelled {
                return self.finish_cancelled(current, report).await;
            }

            // Strict stop-before-start: the pair must never have two live
            // generators, so the current one goes down first. A failed stop
            // leaves the old process in an unknown state; starting another
            // generator could double up on the pair's port, so the pair makes
            // no further transitions and rides out the run.
            if !self.stop_from(&mut current, &mut report, "stop baseline").await {
                break;
            }
            info!(
                pair = %label,
                rate_kbit = spike.rate_kbit,
                at = ?self.clock.elapsed(),
                "spike begins"
            );
            self.start_into(&mut current, &mut report, spike.rate_kbit, "start spike")
                .await;
            report.last_phase = PairPhase::Spiking;

            if self.clock.wait_until(spike.end(), &self.cancel).await == Wait::Cancelled {
                return self.finish_cancelled(current, report).await;
            }

            if !self.stop_from(&mut current, &mut report, "stop spike").await {
                break;
            }
            debug!(pair = %label, at = ?self.clock.elapsed(), "spike over, baseline resumes");
            self.start_into(
                &mut current,
                &mut report,
                self.baseline_rate_kbit,
                "restart baseline",
            )
            .await;
            report.last_phase = PairPhase::Baseline;
        }

        if self.clock.wait_until(self.total, &self.cancel).await == Wait::Cancelled {
            return self.finish_cancelled(current, report).await;
        }

        self.stop_from(&mut current, &mut report, "stop baseline").await;
        report.last_phase = PairPhase::Stopped;
        report
    }

    async fn finish_cancelled(
        &self,
        current: Option<ProcessHandle>,
        mut report: PairReport,
    ) -> PairReport {
        report.cancelled = true;
        let mut current = current;
        self.stop_from(&mut current, &mut report, "stop on cancel").await;
        report
    }

    async fn start_into(
        &self,
        current: &mut Option<ProcessHandle>,
        report: &mut PairReport,
        rate_kbit: u64,
        what: &str,
    ) {
        debug_assert!(current.is_none(), "stop-before-start violated");
        match self.controller.start(&self.pair, rate_kbit).await {
            Ok(handle) => {
                *current = Some(handle);
                report.transitions += 1;
            }
            Err(err) => {
                warn!(pair = %report.pair, "{what} failed: {err:#}");
                report.failures.push(GeneratorTransitionError {
                    pair: report.pair.clone(),
                    transition: what.to_string(),
                    at: self.clock.elapsed(),
                    message: format!("{err:#}"),
                });
            }
        }
    }

    /// Returns whether the pair is clear to start its next generator.
    async fn stop_from(
        &self,
        current: &mut Option<ProcessHandle>,
        report: &mut PairReport,
        what: &str,
    ) -> bool {
        let Some(handle) = current.take() else {
            return true;
        };
        match self.controller.stop(handle).await {
            Ok(StopDisposition::Clean) => {
                report.transitions += 1;
                true
            }
            Ok(StopDisposition::SelfExited(exit)) => {
                warn!(pair = %report.pair, ?exit, "generator exited before {what}");
                report.failures.push(GeneratorTransitionError {
                    pair: report.pair.clone(),
                    transition: what.to_string(),
                    at: self.clock.elapsed(),
                    message: format!("generator exited on its own (exit {:?})", exit.code),
                });
                // The process is gone, so the next start is safe.
                true
            }
            Err(err) => {
                warn!(pair = %report.pair, "{what} failed: {err:#}");
                report.failures.push(GeneratorTransitionError {
                    pair: report.pair.clone(),
                    transition: what.to_string(),
                    at: self.clock.elapsed(),
                    message: format!("{err:#}"),
                });
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// IperfTrafficController
// ---------------------------------------------------------------------------

/// Generates UDP background load with iperf clients.
///
/// The generator process is launched with a runtime bound well past the
/// experiment duration; lifetime is controlled by explicit stops, the `-t`
/// bound is only a leak backstop.
pub struct IperfTrafficController {
    runner: Arc<dyn ProcessRunner>,
    topology: Arc<dyn TopologyProvider>,
    /// Upper bound handed to iperf's `-t`.
    max_runtime: Duration,
    grace: Duration,
}

impl IperfTrafficController {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        topology: Arc<dyn TopologyProvider>,
        max_runtime: Duration,
    ) -> Self {
        Self {
            runner,
            topology,
            max_runtime,
            grace: Duration::from_secs(2),
        }
    }

    fn command(&self, pair: &HostPair, rate_kbit: u64, dest: &str) -> CommandSpec {
        CommandSpec::new(
            format!("iperf {}", pair.label()),
            "iperf",
            [
                "-c".to_string(),
                dest.to_string(),
                "-p".to_string(),
                pair.port.to_string(),
                "-u".to_string(),
                "-b".to_string(),
                format!("{rate_kbit}K"),
                "-t".to_string(),
                (self.max_runtime.as_secs() + 60).to_string(),
            ],
        )
    }
}

#[async_trait]
impl TrafficController for IperfTrafficController {
    async fn start(&self, pair: &HostPair, rate_kbit: u64) -> Result<ProcessHandle> {
        let dest = self
            .topology
            .resolve(&pair.destination)
            .ok_or_else(|| anyhow!("unknown destination host '{}'", pair.destination))?
            .to_string();
        let spec = self.command(pair, rate_kbit, &dest);
        self.runner
            .start(&spec)
            .await
            .map_err(|e| anyhow!(e).context("start traffic generator"))
    }

    async fn stop(&self, handle: ProcessHandle) -> Result<StopDisposition> {
        // A generator found dead at its scheduled stop never signalled and
        // never delivered its segment; report that instead of folding it into
        // the already-exited-counts-as-stopped path of the handshake.
        if let Some(exit) = self
            .runner
            .try_status(&handle)
            .await
            .context("poll traffic generator")?
        {
            return Ok(StopDisposition::SelfExited(exit));
        }
        graceful_stop(&*self.runner, &handle, StopSignal::Terminate, self.grace)
            .await
            .context("stop traffic generator")?;
        Ok(StopDisposition::Clean)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockTraffic;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn one_pair_pattern(spikes: Vec<TrafficSpike>) -> TrafficPattern {
        TrafficPattern {
            baseline_rate_kbit: 8_000,
            pairs: vec![HostPair::new("h3", "h6", 5001)],
            spikes,
        }
    }

    /// 8 Mbit baseline with two 5 s spikes at 90 Mbit.
    #[tokio::test(start_paused = true)]
    async fn spike_schedule_produces_expected_rate_segments() {
        let clock = ExperimentClock::start_now();
        let traffic = Arc::new(MockTraffic::with_clock(clock));
        let cancel = CancelToken::new();

        let pattern = one_pair_pattern(vec![
            TrafficSpike { offset: secs(15), duration: secs(5), rate_kbit: 90_000 },
            TrafficSpike { offset: secs(40), duration: secs(5), rate_kbit: 90_000 },
        ]);
        let report = TrafficPatternGenerator::new(pattern, secs(60))
            .run(clock, traffic.clone(), cancel)
            .await;

        assert_eq!(report.outcome, TrafficOutcome::Completed);
        let segments = traffic.segments("h3->h6:5001");
        let expected = vec![
            (secs(0), secs(15), 8_000),
            (secs(15), secs(20), 90_000),
            (secs(20), secs(40), 8_000),
            (secs(40), secs(45), 90_000),
            (secs(45), secs(60), 8_000),
        ];
        assert_eq!(segments, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_generator_per_pair() {
        let clock = ExperimentClock::start_now();
        let traffic = Arc::new(MockTraffic::with_clock(clock));
        let cancel = CancelToken::new();

        let pattern = TrafficPattern {
            baseline_rate_kbit: 1_000,
            pairs: vec![
                HostPair::new("h3", "h6", 5001),
                HostPair::new("h4", "h5", 5001),
            ],
            spikes: vec![
                TrafficSpike { offset: secs(2), duration: secs(3), rate_kbit: 9_000 },
                TrafficSpike { offset: secs(8), duration: secs(2), rate_kbit: 9_000 },
            ],
        };
        TrafficPatternGenerator::new(pattern, secs(15))
            .run(clock, traffic.clone(), cancel)
            .await;

        assert_eq!(traffic.max_concurrent_per_pair(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_generators_and_skips_spikes() {
        let clock = ExperimentClock::start_now();
        let traffic = Arc::new(MockTraffic::with_clock(clock));
        let cancel = CancelToken::new();

        let pattern = one_pair_pattern(vec![TrafficSpike {
            offset: secs(30),
            duration: secs(5),
            rate_kbit: 90_000,
        }]);
        let task = {
            let traffic = traffic.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                TrafficPatternGenerator::new(pattern, secs(60))
                    .run(clock, traffic, cancel)
                    .await
            })
        };

        tokio::time::advance(secs(12)).await;
        cancel.cancel();
        let report = task.await.expect("join traffic");

        assert_eq!(report.outcome, TrafficOutcome::Cancelled);
        assert_eq!(traffic.active_count(), 0, "generator leaked past cancel");
        // The spike never started.
        let segments = traffic.segments("h3->h6:5001");
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].2, 8_000);
    }

    #[tokio::test(start_paused = true)]
    async fn pair_failure_does_not_block_other_pairs() {
        let clock = ExperimentClock::start_now();
        let traffic = Arc::new(
            MockTraffic::with_clock(clock).fail_starts_for("h3->h6:5001"),
        );
        let cancel = CancelToken::new();

        let pattern = TrafficPattern {
            baseline_rate_kbit: 2_000,
            pairs: vec![
                HostPair::new("h3", "h6", 5001),
                HostPair::new("h4", "h5", 5001),
            ],
            spikes: vec![TrafficSpike { offset: secs(3), duration: secs(2), rate_kbit: 9_000 }],
        };
        let report = TrafficPatternGenerator::new(pattern, secs(10))
            .run(clock, traffic.clone(), cancel)
            .await;

        assert_eq!(report.outcome, TrafficOutcome::PartiallyFailed);
        assert_eq!(report.failed_pairs(), vec!["h3->h6:5001"]);

        // The healthy pair saw its full schedule.
        let healthy = traffic.segments("h4->h5:5001");
        assert_eq!(healthy.len(), 3);
        assert_eq!(healthy[1].2, 9_000);
    }

    /// A generator dying mid-run is a pair failure, not a clean stop.
    #[tokio::test(start_paused = true)]
    async fn crashed_generator_degrades_the_traffic_report() {
        let clock = ExperimentClock::start_now();
        let runner = Arc::new(crate::test_support::MockRunner::new());
        let topo = Arc::new(crate::topology::StaticTopology::new(
            [("h6", "10.0.0.6")],
            vec![],
        ));
        let ctl: Arc<dyn TrafficController> = Arc::new(IperfTrafficController::new(
            runner.clone(),
            topo,
            secs(10),
        ));
        let cancel = CancelToken::new();

        let pattern = one_pair_pattern(vec![]);
        let task = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                TrafficPatternGenerator::new(pattern, secs(10))
                    .run(clock, ctl, cancel)
                    .await
            })
        };

        tokio::time::sleep(secs(3)).await;
        runner.force_exit("iperf h3->h6:5001", 1);
        let report = task.await.expect("join traffic");

        assert_eq!(report.outcome, TrafficOutcome::PartiallyFailed);
        assert_eq!(report.failed_pairs(), vec!["h3->h6:5001"]);
        let failure = &report.pairs[0].failures[0];
        assert_eq!(failure.transition, "stop baseline");
        // The dead process was never signalled.
        assert_eq!(runner.stop_signals_for("iperf h3->h6:5001"), 0);
    }

    /// When a stop fails the old process state is unknown, so the elevated
    /// generator must not be started on top of it.
    #[tokio::test(start_paused = true)]
    async fn failed_stop_blocks_the_spike_start() {
        let clock = ExperimentClock::start_now();
        let traffic = Arc::new(
            MockTraffic::with_clock(clock).fail_stops_for("h3->h6:5001"),
        );
        let cancel = CancelToken::new();

        let pattern = one_pair_pattern(vec![TrafficSpike {
            offset: secs(3),
            duration: secs(2),
            rate_kbit: 9_000,
        }]);
        let report = TrafficPatternGenerator::new(pattern, secs(10))
            .run(clock, traffic.clone(), cancel)
            .await;

        assert_eq!(report.outcome, TrafficOutcome::PartiallyFailed);
        assert_eq!(traffic.max_concurrent_per_pair(), 1);
        // The baseline generator was never replaced.
        assert!(traffic.segments("h3->h6:5001").is_empty());
        assert!(
            report.pairs[0]
                .failures
                .iter()
                .any(|f| f.transition == "stop baseline")
        );
    }

    /// A stop request landing exactly at the run deadline is a completed
    /// run, not a cancelled one.
    #[tokio::test(start_paused = true)]
    async fn stop_at_the_deadline_reports_completion() {
        let clock = ExperimentClock::start_now();
        let traffic = Arc::new(MockTraffic::with_clock(clock));
        let cancel = CancelToken::new();

        let pattern = one_pair_pattern(vec![]);
        let task = {
            let traffic = traffic.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                TrafficPatternGenerator::new(pattern, secs(10))
                    .run(clock, traffic, cancel)
                    .await
            })
        };

        tokio::time::sleep(secs(10)).await;
        cancel.cancel();
        let report = task.await.expect("join traffic");

        assert_eq!(report.outcome, TrafficOutcome::Completed);
        assert_eq!(
            traffic.segments("h3->h6:5001"),
            vec![(secs(0), secs(10), 8_000)]
        );
    }

    #[test]
    fn iperf_command_uses_udp_and_rate() {
        let runner: Arc<dyn ProcessRunner> = Arc::new(crate::test_support::MockRunner::new());
        let topo = Arc::new(crate::topology::StaticTopology::new(
            [("h6", "10.0.0.6")],
            vec![],
        ));
        let ctl = IperfTrafficController::new(runner, topo, secs(120));
        let spec = ctl.command(&HostPair::new("h3", "h6", 5001), 10, "10.0.0.6");
        assert_eq!(spec.program, "iperf");
        assert!(spec.args.contains(&"-u".to_string()));
        assert!(spec.args.contains(&"10K".to_string()));
        assert!(spec.args.contains(&"5001".to_string()));
    }
}
