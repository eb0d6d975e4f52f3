//! One experiment run, end to end.
//!
//! Startup order: captures, then producers, then the timeline and traffic
//! tasks against a freshly captured clock. Teardown order is the reverse
//! dependency order and is the single cleanup path: traffic generators, then
//! producers, then the capture bracket. The same teardown runs when startup
//! fails partway, so nothing acquired in steps 1-2 outlives an error.

use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::capture::{CaptureBracket, CaptureSession};
use crate::clock::ExperimentClock;
use crate::config::ExperimentConfig;
use crate::error::ProcessStartError;
use crate::link::LinkController;
use crate::report::{CaptureSummary, ProducerSummary, RunReport, StopTrigger};
use crate::runner::{ProcessHandle, ProcessRunner, StopSignal, graceful_stop};
use crate::timeline::{EventTimeline, TimelineOutcome, TimelineReport};
use crate::traffic::{TrafficController, TrafficOutcome, TrafficPatternGenerator, TrafficReport};

/// Grace period for producer teardown.
const PRODUCER_GRACE: Duration = Duration::from_secs(5);

pub struct ExperimentCoordinator {
    config: ExperimentConfig,
    runner: Arc<dyn ProcessRunner>,
    link: Arc<dyn LinkController>,
    traffic: Arc<dyn TrafficController>,
    bracket: CaptureBracket,
}

impl ExperimentCoordinator {
    pub fn new(
        config: ExperimentConfig,
        runner: Arc<dyn ProcessRunner>,
        link: Arc<dyn LinkController>,
        traffic: Arc<dyn TrafficController>,
    ) -> Self {
        let bracket = CaptureBracket::new(runner.clone());
        Self {
            config,
            runner,
            link,
            traffic,
            bracket,
        }
    }

    /// Override the capture bracket timings (tests use short windows).
    pub fn with_bracket(mut self, bracket: CaptureBracket) -> Self {
        self.bracket = bracket;
        self
    }

    /// Run the experiment to completion, cancellation, or startup failure.
    ///
    /// `cancel` is the run's token: external interrupts set it, and the
    /// coordinator sets it itself once the stop condition is met so every
    /// task winds down through the same path. Only resource-acquisition
    /// failures return an error; everything else lands in the report.
    pub async fn run(&self, cancel: CancelToken) -> Result<RunReport, ProcessStartError> {
        // (1) Captures first: their start happens-before any measured traffic.
        let mut sessions = self.bracket.acquire(&self.config.captures).await?;

        // (2) Opaque producers (streaming server/client, ...). A failure here
        // rolls the whole startup back.
        let mut producers: SmallVec<ProcessHandle, 4> = SmallVec::new();
        for spec in &self.config.producers {
            match self.runner.start(spec).await {
                Ok(handle) => producers.push(handle),
                Err(err) => {
                    warn!(label = %spec.label, "producer start failed, rolling back startup");
                    self.stop_producers(&producers).await;
                    self.bracket.release(&mut sessions).await;
                    return Err(err);
                }
            }
        }

        // (3) The measured interval starts now: one clock, shared read-only.
        let clock = ExperimentClock::start_now();
        info!(
            duration_secs = self.config.duration_secs,
            producers = producers.len(),
            captures = sessions.len(),
            "experiment started"
        );

        let timeline_task = tokio::spawn(
            EventTimeline::new(self.config.timeline_events()).run(
                clock,
                self.link.clone(),
                cancel.clone(),
            ),
        );
        let traffic_task = tokio::spawn(
            TrafficPatternGenerator::new(self.config.traffic_pattern(), self.config.duration())
                .run(clock, self.traffic.clone(), cancel.clone()),
        );

        // (4) Wait for whichever comes first: the configured duration, all
        // producers exiting, or an external interrupt.
        let trigger = self.wait_for_stop(clock, &producers, &cancel).await;
        info!(?trigger, elapsed = ?clock.elapsed(), "measured interval over");

        // (5) One token, set once; every wait in the system unblocks.
        cancel.cancel();

        // (6) Fixed teardown order: traffic, timeline, producers, captures.
        let traffic_report = join_traffic(traffic_task).await;
        let timeline_report = join_timeline(timeline_task).await;
        let producer_summaries = self.stop_producers(&producers).await;
        self.bracket.release(&mut sessions).await;

        let report = RunReport::build(
            trigger,
            timeline_report,
            traffic_report,
            sessions.iter().map(CaptureSummary::from).collect(),
            producer_summaries,
        );
        info!("{}", report.summary());
        Ok(report)
    }

    async fn wait_for_stop(
        &self,
        clock: ExperimentClock,
        producers: &[ProcessHandle],
        cancel: &CancelToken,
    ) -> StopTrigger {
        let total = self.config.duration();
        let producers_done = async {
            for handle in producers {
                // Bounded by the run duration plus slack; the duration branch
                // wins the select long before this limit matters.
                let _ = self.runner.wait(handle, total + PRODUCER_GRACE).await;
                debug!(label = %handle.label, "producer exited");
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => StopTrigger::Interrupted,
            _ = producers_done, if !producers.is_empty() => StopTrigger::ProducersFinished,
            _ = tokio::time::sleep(total.saturating_sub(clock.elapsed())) => {
                StopTrigger::DurationElapsed
            }
        }
    }

    /// Stop every producer exactly once, gracefully then forcibly.
    async fn stop_producers(&self, producers: &[ProcessHandle]) -> Vec<ProducerSummary> {
        let mut summaries = Vec::with_capacity(producers.len());
        for handle in producers {
            match graceful_stop(
                &*self.runner,
                handle,
                StopSignal::Terminate,
                PRODUCER_GRACE,
            )
            .await
            {
                Ok(outcome) => summaries.push(ProducerSummary {
                    label: handle.label.clone(),
                    exit: outcome.exit,
                    forced: outcome.forced,
                }),
                Err(err) => {
                    warn!(label = %handle.label, "producer stop failed: {err:#}");
                    summaries.push(ProducerSummary {
                        label: handle.label.clone(),
                        exit: None,
                        forced: true,
                    });
                }
            }
        }
        summaries
    }
}

async fn join_traffic(task: tokio::task::JoinHandle<TrafficReport>) -> TrafficReport {
    match task.await {
        Ok(report) => report,
        Err(err) => {
            warn!("traffic task panicked: {err}");
            TrafficReport {
                outcome: TrafficOutcome::PartiallyFailed,
                pairs: Vec::new(),
            }
        }
    }
}

async fn join_timeline(task: tokio::task::JoinHandle<TimelineReport>) -> TimelineReport {
    match task.await {
        Ok(report) => report,
        Err(err) => {
            warn!("timeline task panicked: {err}");
            TimelineReport {
                outcome: TimelineOutcome::PartiallyFailed,
                applied: 0,
                failures: Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use crate::capture::{CaptureRequest, CaptureState};
    use crate::config::{EventConfig, LinkConfig, TrafficConfig};
    use crate::link::ImpairmentSpec;
    use crate::report::RunOutcome;
    use crate::runner::CommandSpec;
    use crate::test_support::{MockLink, MockRunner, MockTraffic};
    use crate::topology::HostPair;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn capture(iface: &str) -> CaptureRequest {
        CaptureRequest {
            interface: iface.to_string(),
            output_path: PathBuf::from(format!("/tmp/{iface}.pcap")),
        }
    }

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            duration_secs: 60,
            hosts: vec![("h6".into(), "10.0.0.6".into())],
            links: vec![LinkConfig {
                name: "mid0".into(),
                initial: ImpairmentSpec::default(),
            }],
            captures: vec![capture("mid0"), capture("mid1")],
            producers: vec![
                CommandSpec::new("server", "server-cmd", Vec::<String>::new()),
                CommandSpec::new("client", "client-cmd", Vec::<String>::new()),
            ],
            events: vec![EventConfig {
                offset_secs: 5.0,
                link: "mid0".into(),
                change: ImpairmentSpec {
                    rate_kbit: Some(5_000),
                    ..Default::default()
                },
            }],
            traffic: TrafficConfig {
                baseline_rate_kbit: 8_000,
                pairs: vec![HostPair::new("h3", "h6", 5001)],
                spikes: Vec::new(),
            },
        }
    }

    struct World {
        runner: Arc<MockRunner>,
        link: Arc<MockLink>,
        traffic: Arc<MockTraffic>,
        coordinator: ExperimentCoordinator,
    }

    fn world(config: ExperimentConfig) -> World {
        let runner = Arc::new(MockRunner::new());
        let link = Arc::new(MockLink::new());
        let traffic = Arc::new(MockTraffic::new());
        let bracket = CaptureBracket::with_timing(
            runner.clone() as Arc<dyn ProcessRunner>,
            Duration::from_millis(10),
            secs(1),
        );
        let coordinator = ExperimentCoordinator::new(
            config,
            runner.clone(),
            link.clone(),
            traffic.clone(),
        )
        .with_bracket(bracket);
        World {
            runner,
            link,
            traffic,
            coordinator,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_run_completes_and_tears_down_in_order() {
        let w = world(config());
        let cancel = CancelToken::new();

        let report = w.coordinator.run(cancel).await.expect("run");
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.trigger, StopTrigger::DurationElapsed);
        assert!(!report.degraded);
        assert_eq!(report.timeline.applied, 1);
        assert!(report.captures.iter().all(|c| c.state == CaptureState::Stopped));

        // Nothing left running anywhere.
        assert_eq!(w.runner.running_count(), 0);
        assert_eq!(w.traffic.active_count(), 0);
        // Captures stopped exactly once each.
        assert_eq!(w.runner.stop_signals_for("tcpdump mid0"), 1);
        assert_eq!(w.runner.stop_signals_for("tcpdump mid1"), 1);
        assert_eq!(w.link.apply_count(), 1);
    }

    /// Interrupt at t=12s of a 60s run.
    #[tokio::test(start_paused = true)]
    async fn interrupt_mid_run_stops_everything_exactly_once() {
        let w = world(config());
        let cancel = CancelToken::new();

        let run = {
            let cancel = cancel.clone();
            let coordinator = w.coordinator;
            tokio::spawn(async move { coordinator.run(cancel).await })
        };

        // Let startup (settle window) pass, then interrupt at ~t=12s.
        tokio::time::sleep(secs(12)).await;
        cancel.cancel();

        let report = run.await.expect("join").expect("run");
        assert_eq!(report.trigger, StopTrigger::Interrupted);
        assert_eq!(report.outcome, RunOutcome::Cancelled);

        assert_eq!(w.runner.running_count(), 0, "leaked process handles");
        assert_eq!(w.traffic.active_count(), 0, "leaked generators");
        for label in ["tcpdump mid0", "tcpdump mid1", "server", "client"] {
            assert!(
                w.runner.stop_signals_for(label) <= 1,
                "{label} double-signalled"
            );
        }
        assert!(report.captures.iter().all(|c| c.state == CaptureState::Stopped));
    }

    /// A capture start failure aborts before producers or tasks exist.
    #[tokio::test(start_paused = true)]
    async fn capture_start_failure_aborts_and_rolls_back() {
        let runner = Arc::new(MockRunner::new().fail_starts_matching("tcpdump mid1"));
        let link = Arc::new(MockLink::new());
        let traffic = Arc::new(MockTraffic::new());
        let coordinator =
            ExperimentCoordinator::new(config(), runner.clone(), link.clone(), traffic.clone())
                .with_bracket(CaptureBracket::with_timing(
                    runner.clone() as Arc<dyn ProcessRunner>,
                    Duration::from_millis(10),
                    secs(1),
                ));

        let err = coordinator
            .run(CancelToken::new())
            .await
            .expect_err("startup must fail");
        assert!(err.label.contains("mid1"));

        // No producers were started, no impairment applied, no generators.
        assert_eq!(runner.starts_of("server"), 0);
        assert_eq!(runner.starts_of("client"), 0);
        assert_eq!(link.apply_count(), 0);
        assert_eq!(traffic.active_count(), 0);
        // The capture that did start was rolled back.
        assert_eq!(runner.stop_signals_for("tcpdump mid0"), 1);
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn producer_start_failure_releases_captures() {
        let runner = Arc::new(MockRunner::new().fail_starts_matching("client"));
        let link = Arc::new(MockLink::new());
        let traffic = Arc::new(MockTraffic::new());
        let coordinator =
            ExperimentCoordinator::new(config(), runner.clone(), link.clone(), traffic.clone())
                .with_bracket(CaptureBracket::with_timing(
                    runner.clone() as Arc<dyn ProcessRunner>,
                    Duration::from_millis(10),
                    secs(1),
                ));

        let err = coordinator
            .run(CancelToken::new())
            .await
            .expect_err("startup must fail");
        assert_eq!(err.label, "client");

        assert_eq!(runner.running_count(), 0, "captures or server leaked");
        // The server producer that did start was stopped once.
        assert_eq!(runner.stop_signals_for("server"), 1);
        assert_eq!(runner.stop_signals_for("tcpdump mid0"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn all_producers_exiting_ends_the_run_early() {
        let runner = Arc::new(
            MockRunner::new()
                .exit_after("server", secs(20))
                .exit_after("client", secs(25)),
        );
        let link = Arc::new(MockLink::new());
        let traffic = Arc::new(MockTraffic::new());
        let coordinator =
            ExperimentCoordinator::new(config(), runner.clone(), link.clone(), traffic.clone())
                .with_bracket(CaptureBracket::with_timing(
                    runner.clone() as Arc<dyn ProcessRunner>,
                    Duration::from_millis(10),
                    secs(1),
                ));

        let report = coordinator.run(CancelToken::new()).await.expect("run");
        assert_eq!(report.trigger, StopTrigger::ProducersFinished);
        assert_eq!(report.outcome, RunOutcome::Completed);
        // Producers exited on their own; they were not signalled.
        assert_eq!(runner.stop_signals_for("server"), 0);
        assert_eq!(runner.stop_signals_for("client"), 0);
        assert_eq!(runner.running_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_capture_degrades_but_does_not_abort() {
        let w = world(config());
        let cancel = CancelToken::new();
        let runner = w.runner.clone();

        let run = {
            let coordinator = w.coordinator;
            tokio::spawn(async move { coordinator.run(cancel).await })
        };

        // Let the run get going, then crash one capture mid-run.
        tokio::time::sleep(secs(10)).await;
        runner.force_exit("tcpdump mid1", 137);
        let report = run.await.expect("join").expect("run");

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.degraded);
        let states: Vec<CaptureState> = report.captures.iter().map(|c| c.state).collect();
        assert!(states.contains(&CaptureState::Failed));
        assert!(states.contains(&CaptureState::Stopped));
        assert_eq!(runner.stop_signals_for("tcpdump mid1"), 0, "crashed capture signalled");
    }
}
