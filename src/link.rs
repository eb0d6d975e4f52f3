//! Link impairment control.
//!
//! [`ImpairmentSpec`] is a partial change: only the set fields are modified
//! on the target link, everything else stays as it was. `tc netem`'s own
//! `change` verb does NOT work that way (omitted parameters are reset to
//! defaults), so [`TcLinkController`] keeps a merged per-interface view and
//! always replays the full parameter set.

use std::sync::Mutex;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Partial link-shaping change. Unset fields are left untouched on the
/// target; `Some(0)` / `Some(0.0)` is an explicit reset of that parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ImpairmentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_kbit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u32>,
}

impl ImpairmentSpec {
    /// True if no parameter is set (the change would be a no-op).
    pub fn is_empty(&self) -> bool {
        self.rate_kbit.is_none() && self.loss_percent.is_none() && self.delay_ms.is_none()
    }

    /// Overlay `change` onto `self`. Fields unset in `change` keep their
    /// current value, which is what makes repeated or partial application
    /// idempotent.
    pub fn merge(&mut self, change: &ImpairmentSpec) {
        if let Some(rate) = change.rate_kbit {
            self.rate_kbit = Some(rate);
        }
        if let Some(loss) = change.loss_percent {
            self.loss_percent = Some(loss);
        }
        if let Some(delay) = change.delay_ms {
            self.delay_ms = Some(delay);
        }
    }

    /// Build the full netem parameter list for the merged state.
    fn netem_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(delay) = self.delay_ms {
            args.push("delay".into());
            args.push(format!("{delay}ms"));
        }
        if let Some(loss) = self.loss_percent {
            args.push("loss".into());
            args.push(format!("{loss}%"));
        }
        if let Some(rate) = self.rate_kbit {
            args.push("rate".into());
            args.push(format!("{rate}kbit"));
        }
        args
    }
}

/// Single writer for live link state. Implemented for real links by
/// [`TcLinkController`]; tests substitute an in-memory recorder.
#[async_trait]
pub trait LinkController: Send + Sync {
    /// Apply a partial change to `link`. Change semantics: unset fields are
    /// left untouched at the target.
    async fn apply(&self, link: &str, change: &ImpairmentSpec) -> Result<()>;
}

/// `tc netem` backend.
///
/// Holds the merged impairment view per interface and issues
/// `tc qdisc replace dev <iface> root netem <full args>` on every apply, so
/// partial changes compose the way the contract requires. Seed the view with
/// [`TcLinkController::seed`] for links whose initial shaping was set up by
/// the topology layer.
pub struct TcLinkController {
    /// Argument prefix prepended to every `tc` invocation
    /// (e.g. `["sudo", "ip", "netns", "exec", NS]`).
    prefix: Vec<String>,
    state: Mutex<FxHashMap<String, ImpairmentSpec>>,
}

impl TcLinkController {
    pub fn new() -> Self {
        Self::with_prefix(Vec::new())
    }

    pub fn with_prefix(prefix: Vec<String>) -> Self {
        Self {
            prefix,
            state: Mutex::new(FxHashMap::default()),
        }
    }

    /// Record the initial shaping state of `link` as set up by the topology
    /// layer, so the first partial change merges into it instead of
    /// clobbering it.
    pub fn seed(&self, link: &str, initial: ImpairmentSpec) {
        self.state
            .lock()
            .expect("link state lock")
            .insert(link.to_string(), initial);
    }

    /// Current merged view of `link` (what the controller believes is live).
    pub fn view(&self, link: &str) -> Option<ImpairmentSpec> {
        self.state
            .lock()
            .expect("link state lock")
            .get(link)
            .copied()
    }
}

impl Default for TcLinkController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LinkController for TcLinkController {
    async fn apply(&self, link: &str, change: &ImpairmentSpec) -> Result<()> {
        let merged = {
            let mut state = self.state.lock().expect("link state lock");
            let entry = state.entry(link.to_string()).or_default();
            entry.merge(change);
            *entry
        };

        let mut argv = self.prefix.clone();
        argv.extend(
            ["tc", "qdisc", "replace", "dev", link, "root", "netem"]
                .into_iter()
                .map(String::from),
        );
        argv.extend(merged.netem_args());

        debug!(link, ?merged, "applying impairment");
        let output = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .output()
            .await
            .with_context(|| format!("run {}", argv.join(" ")))?;

        if !output.status.success() {
            bail!(
                "tc failed on {link}: {}\n{}",
                argv.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
