//! End-to-end coordinator runs with real host processes.
//!
//! These stay unprivileged: no captures, no links, and `sleep` standing in
//! for the streaming producers. They pin the stop-condition and teardown
//! behavior against the real `tokio::process` runner rather than mocks.

use std::sync::Arc;
use std::time::Duration;

use linkrun::cancel::CancelToken;
use linkrun::config::{ExperimentConfig, TrafficConfig};
use linkrun::coordinator::ExperimentCoordinator;
use linkrun::link::TcLinkController;
use linkrun::report::{RunOutcome, StopTrigger};
use linkrun::runner::{CommandSpec, HostProcessRunner};
use linkrun::topology::StaticTopology;
use linkrun::traffic::IperfTrafficController;

fn bare_config(duration_secs: u64, producers: Vec<CommandSpec>) -> ExperimentConfig {
    ExperimentConfig {
        duration_secs,
        hosts: Vec::new(),
        links: Vec::new(),
        captures: Vec::new(),
        producers,
        events: Vec::new(),
        traffic: TrafficConfig {
            baseline_rate_kbit: 1_000,
            pairs: Vec::new(),
            spikes: Vec::new(),
        },
    }
}

fn coordinator(config: ExperimentConfig) -> ExperimentCoordinator {
    let runner = Arc::new(HostProcessRunner::new());
    let topology = Arc::new(StaticTopology::new(
        Vec::<(String, String)>::new(),
        Vec::new(),
    ));
    let traffic = Arc::new(IperfTrafficController::new(
        runner.clone(),
        topology,
        config.duration(),
    ));
    let link = Arc::new(TcLinkController::new());
    ExperimentCoordinator::new(config, runner, link, traffic)
}

#[tokio::test]
async fn producers_exiting_ends_the_run_before_the_deadline() {
    let config = bare_config(
        600,
        vec![
            CommandSpec::new("short", "sleep", ["1"]),
            CommandSpec::new("shorter", "sleep", ["0.5"]),
        ],
    );

    let report = coordinator(config)
        .run(CancelToken::new())
        .await
        .expect("run");

    assert_eq!(report.trigger, StopTrigger::ProducersFinished);
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(!report.degraded);
    for producer in &report.producers {
        assert!(!producer.forced, "{} had to be killed", producer.label);
        assert!(
            producer.exit.is_some_and(|e| e.success()),
            "{} did not exit cleanly",
            producer.label
        );
    }
}

#[tokio::test]
async fn interrupt_tears_down_long_lived_producers() {
    let config = bare_config(600, vec![CommandSpec::new("stream", "sleep", ["600"])]);
    let cancel = CancelToken::new();

    let run = {
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator(config).run(cancel).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    let report = run.await.expect("join").expect("run");

    assert_eq!(report.trigger, StopTrigger::Interrupted);
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(report.producers.len(), 1);
    // sleep dies on SIGTERM; the kill escalation must not have fired.
    assert!(!report.producers[0].forced);
}
