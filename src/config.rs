//! Experiment configuration.
//!
//! The core consumes already-parsed values; this module is the boundary where
//! a JSON description (or the built-in default mirroring the classic
//! audio-streaming experiment) becomes validated core types. Validation fixes
//! everything the scheduling engine assumes: events sorted with unique
//! offsets per link, spikes sorted and non-overlapping, schedules inside the
//! run duration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureRequest;
use crate::link::ImpairmentSpec;
use crate::runner::CommandSpec;
use crate::timeline::LinkImpairmentEvent;
use crate::topology::HostPair;
use crate::traffic::{TrafficPattern, TrafficSpike};

/// One emulated link the experiment may mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    /// Shaping already in place when the run starts (set up by the topology
    /// layer). Partial events merge into this.
    #[serde(default)]
    pub initial: ImpairmentSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    pub offset_secs: f64,
    pub link: String,
    #[serde(flatten)]
    pub change: ImpairmentSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpikeConfig {
    pub offset_secs: f64,
    pub duration_secs: f64,
    pub rate_kbit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficConfig {
    pub baseline_rate_kbit: u64,
    #[serde(default)]
    pub pairs: Vec<HostPair>,
    #[serde(default)]
    pub spikes: Vec<SpikeConfig>,
}

/// Full experiment description as handed in by the CLI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub duration_secs: u64,
    /// Host name -> address table for the topology provider.
    #[serde(default)]
    pub hosts: Vec<(String, String)>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub captures: Vec<CaptureRequest>,
    /// Opaque streaming/producer commands started for the run's duration.
    #[serde(default)]
    pub producers: Vec<CommandSpec>,
    #[serde(default)]
    pub events: Vec<EventConfig>,
    pub traffic: TrafficConfig,
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Check every invariant the scheduling engine assumes.
    pub fn validate(&self) -> Result<()> {
        if self.duration_secs == 0 {
            bail!("duration must be positive");
        }

        for link in &self.links {
            let mut offsets: Vec<f64> = self
                .events
                .iter()
                .filter(|e| e.link == link.name)
                .map(|e| e.offset_secs)
                .collect();
            let before = offsets.len();
            offsets.sort_by(f64::total_cmp);
            offsets.dedup();
            if offsets.len() != before {
                bail!("duplicate event offsets on link '{}'", link.name);
            }
        }
        for event in &self.events {
            if !self.links.iter().any(|l| l.name == event.link) {
                bail!("event targets unknown link '{}'", event.link);
            }
            if event.change.is_empty() {
                bail!(
                    "event at {}s on '{}' changes nothing",
                    event.offset_secs,
                    event.link
                );
            }
            if event.offset_secs < 0.0 || event.offset_secs > self.duration_secs as f64 {
                bail!("event offset {}s outside run duration", event.offset_secs);
            }
        }

        let mut last_end = 0.0f64;
        let mut sorted = self.traffic.spikes.clone();
        sorted.sort_by(|a, b| a.offset_secs.total_cmp(&b.offset_secs));
        for spike in &sorted {
            if spike.duration_secs <= 0.0 {
                bail!("spike at {}s has no duration", spike.offset_secs);
            }
            if spike.offset_secs < last_end {
                bail!("spike at {}s overlaps the previous spike", spike.offset_secs);
            }
            last_end = spike.offset_secs + spike.duration_secs;
            if last_end > self.duration_secs as f64 {
                bail!("spike at {}s runs past the experiment end", spike.offset_secs);
            }
        }

        for pair in &self.traffic.pairs {
            if !self.hosts.iter().any(|(name, _)| *name == pair.destination) {
                bail!("pair destination '{}' not in hosts table", pair.destination);
            }
        }

        Ok(())
    }

    /// Events in ascending offset order, as core types.
    pub fn timeline_events(&self) -> Vec<LinkImpairmentEvent> {
        let mut events: Vec<LinkImpairmentEvent> = self
            .events
            .iter()
            .map(|e| LinkImpairmentEvent {
                offset: Duration::from_secs_f64(e.offset_secs),
                link: e.link.clone(),
                change: e.change,
            })
            .collect();
        events.sort_by_key(|e| e.offset);
        events
    }

    /// Traffic pattern with spikes in ascending offset order, as core types.
    pub fn traffic_pattern(&self) -> TrafficPattern {
        let mut spikes: Vec<TrafficSpike> = self
            .traffic
            .spikes
            .iter()
            .map(|s| TrafficSpike {
                offset: Duration::from_secs_f64(s.offset_secs),
                duration: Duration::from_secs_f64(s.duration_secs),
                rate_kbit: s.rate_kbit,
            })
            .collect();
        spikes.sort_by_key(|s| s.offset);
        TrafficPattern {
            baseline_rate_kbit: self.traffic.baseline_rate_kbit,
            pairs: self.traffic.pairs.clone(),
            spikes,
        }
    }
}

/// The classic audio-streaming experiment: a 10 Mbit / 5 ms middle link that
/// degrades on a fixed schedule while low-rate UDP background traffic runs
/// between two host pairs.
pub fn default_experiment(middle_link: &str, pcap_dir: &Path) -> ExperimentConfig {
    let mid = middle_link.to_string();
    ExperimentConfig {
        duration_secs: 120,
        hosts: vec![
            ("h5".into(), "10.0.0.8".into()),
            ("h6".into(), "10.0.0.6".into()),
        ],
        links: vec![LinkConfig {
            name: mid.clone(),
            initial: ImpairmentSpec {
                rate_kbit: Some(10_000),
                delay_ms: Some(5),
                ..Default::default()
            },
        }],
        captures: vec![CaptureRequest {
            interface: mid.clone(),
            output_path: crate::capture::timestamped_pcap(pcap_dir, middle_link),
        }],
        producers: Vec::new(),
        events: vec![
            EventConfig {
                offset_secs: 5.0,
                link: mid.clone(),
                change: ImpairmentSpec {
                    rate_kbit: Some(5_000),
                    ..Default::default()
                },
            },
            EventConfig {
                offset_secs: 15.0,
                link: mid.clone(),
                change: ImpairmentSpec {
                    loss_percent: Some(10.0),
                    ..Default::default()
                },
            },
            EventConfig {
                offset_secs: 25.0,
                link: mid.clone(),
                change: ImpairmentSpec {
                    delay_ms: Some(50),
                    ..Default::default()
                },
            },
            EventConfig {
                offset_secs: 35.0,
                link: mid,
                change: ImpairmentSpec {
                    rate_kbit: Some(20_000),
                    loss_percent: Some(0.0),
                    ..Default::default()
                },
            },
        ],
        traffic: TrafficConfig {
            baseline_rate_kbit: 10,
            pairs: vec![
                HostPair::new("h3", "h6", 5001),
                HostPair::new("h4", "h5", 5001),
            ],
            spikes: Vec::new(),
        },
    }
}
