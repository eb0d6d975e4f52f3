//! Read-only topology lookups.
//!
//! The core never provisions nodes or links; it is handed host/interface
//! identifiers by whatever built the network (mininet-style emulation,
//! namespaces, real hardware) and treats them as opaque values.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// A source/destination/port triple for background traffic.
///
/// Identifiers are opaque host names resolved through the
/// [`TopologyProvider`]; the pair itself is a value, not a live object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostPair {
    pub source: String,
    pub destination: String,
    pub port: u16,
}

impl HostPair {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            port,
        }
    }

    /// Short label for logs and per-pair reports.
    pub fn label(&self) -> String {
        format!("{}->{}:{}", self.source, self.destination, self.port)
    }
}

/// Read-only lookup of host addresses and interface names.
pub trait TopologyProvider: Send + Sync {
    /// Resolve a host identifier to an address, if known.
    fn resolve(&self, host: &str) -> Option<&str>;

    /// Interfaces available for capture/impairment.
    fn interfaces(&self) -> &[String];
}

/// Topology backed by a fixed table handed in as configuration.
pub struct StaticTopology {
    addresses: FxHashMap<String, String>,
    interfaces: Vec<String>,
}

impl StaticTopology {
    pub fn new<I, K, V>(hosts: I, interfaces: Vec<String>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            addresses: hosts
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            interfaces,
        }
    }
}

impl TopologyProvider for StaticTopology {
    fn resolve(&self, host: &str) -> Option<&str> {
        self.addresses.get(host).map(String::as_str)
    }

    fn interfaces(&self) -> &[String] {
        &self.interfaces
    }
}
