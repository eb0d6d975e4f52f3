//! In-memory doubles for the process, link, and traffic seams.
//!
//! All three record enough to let tests assert the invariants the real
//! backends cannot check cheaply: exactly-once stop signals, the merged
//! link-state view, and the one-generator-per-pair rule. Everything is
//! driven by the test's own clock, so they compose with paused-time tests.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::watch;

use crate::clock::ExperimentClock;
use crate::error::ProcessStartError;
use crate::link::{ImpairmentSpec, LinkController};
use crate::runner::{CommandSpec, ExitStatus, ProcessHandle, ProcessRunner, StopSignal};
use crate::topology::HostPair;
use crate::traffic::{StopDisposition, TrafficController};

// ---------------------------------------------------------------------------
// MockRunner
// ---------------------------------------------------------------------------

struct MockProcess {
    label: String,
    /// `None` while "running"; set exactly once on exit.
    exit: watch::Sender<Option<ExitStatus>>,
    ignore_graceful: bool,
}

#[derive(Default)]
struct RunnerInner {
    next_id: u64,
    fail_matching: Vec<String>,
    exit_immediately: FxHashMap<String, i32>,
    exit_after: FxHashMap<String, Duration>,
    ignore_stop: Vec<String>,
    procs: FxHashMap<u64, MockProcess>,
    starts: FxHashMap<String, usize>,
    graceful_signals: FxHashMap<String, usize>,
    kill_signals: FxHashMap<String, usize>,
    total_signals: usize,
}

/// [`ProcessRunner`] double. Processes "run" until signalled, force-exited,
/// or their scripted lifetime elapses.
#[derive(Default)]
pub struct MockRunner {
    inner: Mutex<RunnerInner>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every start whose label contains `pattern` fails.
    pub fn fail_starts_matching(self, pattern: &str) -> Self {
        self.inner
            .lock()
            .expect("mock runner lock")
            .fail_matching
            .push(pattern.to_string());
        self
    }

    /// The process with this label exits with `code` as soon as it starts.
    pub fn exit_immediately(self, label: &str, code: i32) -> Self {
        self.inner
            .lock()
            .expect("mock runner lock")
            .exit_immediately
            .insert(label.to_string(), code);
        self
    }

    /// The process with this label exits cleanly `after` its start.
    pub fn exit_after(self, label: &str, after: Duration) -> Self {
        self.inner
            .lock()
            .expect("mock runner lock")
            .exit_after
            .insert(label.to_string(), after);
        self
    }

    /// The process with this label survives Interrupt/Terminate; only Kill
    /// takes it down.
    pub fn ignore_stop_signals(self, label: &str) -> Self {
        self.inner
            .lock()
            .expect("mock runner lock")
            .ignore_stop
            .push(label.to_string());
        self
    }

    /// Simulate a crash: the labelled process exits with `code` on its own.
    pub fn force_exit(&self, label: &str, code: i32) {
        let inner = self.inner.lock().expect("mock runner lock");
        for proc in inner.procs.values() {
            if proc.label == label {
                proc.exit.send_modify(|exit| {
                    if exit.is_none() {
                        *exit = Some(ExitStatus { code: Some(code) });
                    }
                });
            }
        }
    }

    /// Total signals delivered, of any kind.
    pub fn signal_count(&self) -> usize {
        self.inner.lock().expect("mock runner lock").total_signals
    }

    /// Graceful (Interrupt/Terminate) signals delivered to this label.
    pub fn stop_signals_for(&self, label: &str) -> usize {
        self.inner
            .lock()
            .expect("mock runner lock")
            .graceful_signals
            .get(label)
            .copied()
            .unwrap_or(0)
    }

    pub fn was_killed(&self, label: &str) -> bool {
        self.inner
            .lock()
            .expect("mock runner lock")
            .kill_signals
            .get(label)
            .copied()
            .unwrap_or(0)
            > 0
    }

    pub fn starts_of(&self, label: &str) -> usize {
        self.inner
            .lock()
            .expect("mock runner lock")
            .starts
            .get(label)
            .copied()
            .unwrap_or(0)
    }

    /// Processes started and not yet exited.
    pub fn running_count(&self) -> usize {
        self.inner
            .lock()
            .expect("mock runner lock")
            .procs
            .values()
            .filter(|p| p.exit.borrow().is_none())
            .count()
    }

    fn exit_channel(&self, handle: &ProcessHandle) -> Result<watch::Receiver<Option<ExitStatus>>> {
        self.inner
            .lock()
            .expect("mock runner lock")
            .procs
            .get(&handle.id)
            .map(|p| p.exit.subscribe())
            .ok_or_else(|| anyhow!("unknown mock process: {}", handle.label))
    }
}

#[async_trait]
impl ProcessRunner for MockRunner {
    async fn start(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessStartError> {
        let (id, scripted_exit) = {
            let mut inner = self.inner.lock().expect("mock runner lock");
            *inner.starts.entry(spec.label.clone()).or_default() += 1;

            if inner
                .fail_matching
                .iter()
                .any(|pattern| spec.label.contains(pattern.as_str()))
            {
                return Err(ProcessStartError::new(&spec.label, "scripted start failure"));
            }

            inner.next_id += 1;
            let id = inner.next_id;
            let initial = inner
                .exit_immediately
                .get(&spec.label)
                .map(|&code| ExitStatus { code: Some(code) });
            let (tx, _rx) = watch::channel(initial);
            let scripted_exit = inner.exit_after.get(&spec.label).map(|&after| (after, tx.clone()));
            let ignore_graceful = inner.ignore_stop.contains(&spec.label);
            inner.procs.insert(
                id,
                MockProcess {
                    label: spec.label.clone(),
                    exit: tx,
                    ignore_graceful,
                },
            );
            (id, scripted_exit)
        };

        if let Some((after, tx)) = scripted_exit {
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                tx.send_modify(|exit| {
                    if exit.is_none() {
                        *exit = Some(ExitStatus { code: Some(0) });
                    }
                });
            });
        }

        Ok(ProcessHandle {
            id,
            pid: Some(10_000 + id as u32),
            label: spec.label.clone(),
        })
    }

    async fn signal(&self, handle: &ProcessHandle, signal: StopSignal) -> Result<()> {
        let mut inner = self.inner.lock().expect("mock runner lock");
        inner.total_signals += 1;
        let label = handle.label.clone();
        let Some(proc) = inner.procs.get(&handle.id) else {
            bail!("signal to unknown mock process: {label}");
        };
        let ignore_graceful = proc.ignore_graceful;
        let exit = proc.exit.clone();
        match signal {
            StopSignal::Interrupt | StopSignal::Terminate => {
                *inner.graceful_signals.entry(label).or_default() += 1;
                if !ignore_graceful {
                    exit.send_modify(|e| {
                        if e.is_none() {
                            *e = Some(ExitStatus { code: Some(0) });
                        }
                    });
                }
            }
            StopSignal::Kill => {
                *inner.kill_signals.entry(label).or_default() += 1;
                exit.send_modify(|e| {
                    if e.is_none() {
                        // Killed by signal: no exit code.
                        *e = Some(ExitStatus { code: None });
                    }
                });
            }
        }
        Ok(())
    }

    async fn wait(&self, handle: &ProcessHandle, timeout: Duration) -> Result<Option<ExitStatus>> {
        let mut rx = self.exit_channel(handle)?;
        match tokio::time::timeout(timeout, rx.wait_for(|exit| exit.is_some())).await {
            Ok(Ok(exit)) => Ok(*exit),
            // Channel closed or timeout: still running as far as the caller
            // can tell.
            Ok(Err(_)) | Err(_) => Ok(None),
        }
    }

    async fn try_status(&self, handle: &ProcessHandle) -> Result<Option<ExitStatus>> {
        let rx = self.exit_channel(handle)?;
        Ok(*rx.borrow())
    }
}

// ---------------------------------------------------------------------------
// MockLink
// ---------------------------------------------------------------------------

/// One successful apply, with the elapsed time it landed at.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub at: Duration,
    pub link: String,
    pub change: ImpairmentSpec,
}

#[derive(Default)]
struct LinkInner {
    state: FxHashMap<String, ImpairmentSpec>,
    log: Vec<AppliedChange>,
    calls: usize,
}

/// [`LinkController`] double with the same merged-state semantics as the
/// `tc` backend, minus the shelling out.
#[derive(Default)]
pub struct MockLink {
    clock: Option<ExperimentClock>,
    apply_delay: Option<Duration>,
    fail_on_call: Option<usize>,
    inner: Mutex<LinkInner>,
}

impl MockLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamp applies against the experiment clock.
    pub fn with_clock(clock: ExperimentClock) -> Self {
        Self {
            clock: Some(clock),
            ..Self::default()
        }
    }

    /// Every apply consumes this much (simulated) time.
    pub fn with_apply_delay(mut self, delay: Duration) -> Self {
        self.apply_delay = Some(delay);
        self
    }

    /// The `index`-th apply call (zero-based) fails.
    pub fn fail_on_apply(mut self, index: usize) -> Self {
        self.fail_on_call = Some(index);
        self
    }

    /// Seed the initial state of `link`, as the topology layer would.
    pub fn seed(&self, link: &str, initial: ImpairmentSpec) {
        self.inner
            .lock()
            .expect("mock link lock")
            .state
            .insert(link.to_string(), initial);
    }

    /// Current merged state of `link`.
    pub fn state(&self, link: &str) -> Option<ImpairmentSpec> {
        self.inner
            .lock()
            .expect("mock link lock")
            .state
            .get(link)
            .copied()
    }

    /// Successful applies, in order.
    pub fn log(&self) -> Vec<AppliedChange> {
        self.inner.lock().expect("mock link lock").log.clone()
    }

    /// Total apply calls, including failed ones.
    pub fn apply_count(&self) -> usize {
        self.inner.lock().expect("mock link lock").calls
    }

    fn now(&self) -> Duration {
        self.clock.map(|c| c.elapsed()).unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
impl LinkController for MockLink {
    async fn apply(&self, link: &str, change: &ImpairmentSpec) -> Result<()> {
        // Timestamp at invocation, before any simulated apply latency.
        let at = self.now();
        let call = {
            let mut inner = self.inner.lock().expect("mock link lock");
            let call = inner.calls;
            inner.calls += 1;
            call
        };

        if let Some(delay) = self.apply_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on_call == Some(call) {
            bail!("scripted apply failure on {link}");
        }

        let mut inner = self.inner.lock().expect("mock link lock");
        inner
            .state
            .entry(link.to_string())
            .or_default()
            .merge(change);
        inner.log.push(AppliedChange {
            at,
            link: link.to_string(),
            change: *change,
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockTraffic
// ---------------------------------------------------------------------------

struct ActiveGenerator {
    pair: String,
    rate_kbit: u64,
    started_at: Duration,
}

#[derive(Default)]
struct TrafficInner {
    next_id: u64,
    fail_pairs: Vec<String>,
    fail_stops: Vec<String>,
    active: FxHashMap<u64, ActiveGenerator>,
    /// Closed `(start, stop, rate)` segments per pair label.
    segments: FxHashMap<String, Vec<(Duration, Duration, u64)>>,
    /// Peak simultaneous generators observed per pair.
    peak: FxHashMap<String, usize>,
}

/// [`TrafficController`] double that records rate segments per pair and the
/// peak generator concurrency, which is how tests pin the stop-before-start
/// rule.
#[derive(Default)]
pub struct MockTraffic {
    clock: Option<ExperimentClock>,
    inner: Mutex<TrafficInner>,
}

impl MockTraffic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: ExperimentClock) -> Self {
        Self {
            clock: Some(clock),
            inner: Mutex::default(),
        }
    }

    /// Every start for this pair label fails.
    pub fn fail_starts_for(self, pair: &str) -> Self {
        self.inner
            .lock()
            .expect("mock traffic lock")
            .fail_pairs
            .push(pair.to_string());
        self
    }

    /// Every stop for this pair label fails, with the generator left live.
    pub fn fail_stops_for(self, pair: &str) -> Self {
        self.inner
            .lock()
            .expect("mock traffic lock")
            .fail_stops
            .push(pair.to_string());
        self
    }

    /// Closed `(start, stop, rate_kbit)` segments for a pair, in order.
    pub fn segments(&self, pair: &str) -> Vec<(Duration, Duration, u64)> {
        self.inner
            .lock()
            .expect("mock traffic lock")
            .segments
            .get(pair)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest number of simultaneously live generators seen on any pair.
    pub fn max_concurrent_per_pair(&self) -> usize {
        self.inner
            .lock()
            .expect("mock traffic lock")
            .peak
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Generators started and not yet stopped.
    pub fn active_count(&self) -> usize {
        self.inner.lock().expect("mock traffic lock").active.len()
    }

    fn now(&self) -> Duration {
        self.clock.map(|c| c.elapsed()).unwrap_or(Duration::ZERO)
    }
}

#[async_trait]
impl TrafficController for MockTraffic {
    async fn start(&self, pair: &HostPair, rate_kbit: u64) -> Result<ProcessHandle> {
        let label = pair.label();
        let now = self.now();
        let mut inner = self.inner.lock().expect("mock traffic lock");
        if inner.fail_pairs.contains(&label) {
            bail!("scripted generator start failure for {label}");
        }

        inner.next_id += 1;
        let id = inner.next_id;
        inner.active.insert(
            id,
            ActiveGenerator {
                pair: label.clone(),
                rate_kbit,
                started_at: now,
            },
        );
        let live = inner
            .active
            .values()
            .filter(|g| g.pair == label)
            .count();
        let peak = inner.peak.entry(label.clone()).or_default();
        *peak = (*peak).max(live);

        Ok(ProcessHandle {
            id,
            pid: None,
            label: format!("generator {label}"),
        })
    }

    async fn stop(&self, handle: ProcessHandle) -> Result<StopDisposition> {
        let now = self.now();
        let mut inner = self.inner.lock().expect("mock traffic lock");
        let pair = inner
            .active
            .get(&handle.id)
            .map(|g| g.pair.clone())
            .ok_or_else(|| anyhow!("stop of unknown generator: {}", handle.label))?;
        if inner.fail_stops.contains(&pair) {
            // The generator stays live: the caller must treat it as unknown.
            bail!("scripted generator stop failure for {pair}");
        }
        let generator = inner.active.remove(&handle.id).expect("generator present");
        inner
            .segments
            .entry(generator.pair)
            .or_default()
            .push((generator.started_at, now, generator.rate_kbit));
        Ok(StopDisposition::Clean)
    }
}
