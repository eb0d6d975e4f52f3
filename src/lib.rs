//! Timed link-impairment experiment orchestration.
//!
//! This library runs one experiment at a time against an already-built
//! emulated topology: packet captures bracket the measured interval, a
//! timeline of `tc netem` mutations degrades links at absolute offsets, and
//! baseline/spike UDP background traffic runs per host pair. A single
//! coordinator owns startup order, the stop condition, and teardown.

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cancel;
pub mod capture;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod link;
pub mod report;
pub mod runner;
pub mod timeline;
pub mod topology;
pub mod traffic;

// Mock collaborators - available when the test-internals feature is enabled
#[cfg(any(test, feature = "test-internals"))]
pub mod test_support;

// Re-export commonly used items
pub use cancel::CancelToken;
pub use capture::{CaptureBracket, CaptureRequest};
pub use clock::ExperimentClock;
pub use config::ExperimentConfig;
pub use coordinator::ExperimentCoordinator;
pub use link::{ImpairmentSpec, LinkController, TcLinkController};
pub use report::RunReport;
pub use runner::{CommandSpec, HostProcessRunner, ProcessRunner};
pub use topology::{HostPair, StaticTopology, TopologyProvider};
pub use traffic::{IperfTrafficController, StopDisposition, TrafficController};
