use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use linkrun::cancel::CancelToken;
use linkrun::config::{self, ExperimentConfig};
use linkrun::coordinator::ExperimentCoordinator;
use linkrun::link::TcLinkController;
use linkrun::runner::HostProcessRunner;
use linkrun::topology::StaticTopology;
use linkrun::traffic::IperfTrafficController;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "linkrun",
    author,
    version,
    disable_version_flag = true,
    about = "Timed link-impairment experiment runner",
    override_usage = "linkrun [OPTIONS] [--config experiment.json | --interface IFACE]"
)]
struct Cli {
    /// Print the version and exit
    #[arg(short = 'v', long = "version", action = clap::ArgAction::SetTrue)]
    print_version: bool,

    /// JSON experiment description; omit to run the built-in default
    /// experiment against --interface
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// Middle-link interface for the built-in default experiment
    #[arg(long = "interface", conflicts_with = "config")]
    interface: Option<String>,

    /// Override the experiment duration in seconds
    #[arg(long = "duration")]
    duration_secs: Option<u64>,

    /// Directory for pcap artifacts of the built-in experiment
    #[arg(long = "pcap-dir", default_value = "/tmp")]
    pcap_dir: PathBuf,

    /// Network namespace to run captures, traffic, and tc inside
    /// (wraps every command in `sudo ip netns exec NS`)
    #[arg(long = "netns")]
    netns: Option<String>,

    /// Emit the final run report as JSON on stdout
    #[arg(long = "json")]
    json: bool,
}

fn load_config(args: &Cli) -> Result<ExperimentConfig> {
    let mut config = match (&args.config, &args.interface) {
        (Some(path), _) => ExperimentConfig::load(path)?,
        (None, Some(interface)) => config::default_experiment(interface, &args.pcap_dir),
        (None, None) => {
            anyhow::bail!("either --config or --interface is required");
        }
    };
    if let Some(duration) = args.duration_secs {
        config.duration_secs = duration;
        config.validate().context("duration override")?;
    }
    Ok(config)
}

fn exec_prefix(netns: &Option<String>) -> Vec<String> {
    match netns {
        Some(ns) => ["sudo", "ip", "netns", "exec", ns.as_str()]
            .into_iter()
            .map(String::from)
            .collect(),
        None => Vec::new(),
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args = Cli::parse();
    if args.print_version {
        println!(
            "{} ({}@{}{}) [{}]",
            env!("CARGO_PKG_VERSION"),
            env!("GIT_BRANCH"),
            env!("GIT_HASH"),
            env!("GIT_DIRTY"),
            env!("CARGO_PKG_NAME")
        );
        return Ok(());
    }

    let config = load_config(&args)?;
    let prefix = exec_prefix(&args.netns);

    let runner = Arc::new(HostProcessRunner::with_prefix(prefix.clone()));
    let link = Arc::new(TcLinkController::with_prefix(prefix));
    for link_config in &config.links {
        link.seed(&link_config.name, link_config.initial);
    }
    let topology = Arc::new(StaticTopology::new(
        config.hosts.iter().cloned(),
        config.links.iter().map(|l| l.name.clone()).collect(),
    ));
    let traffic = Arc::new(IperfTrafficController::new(
        runner.clone(),
        topology,
        config.duration(),
    ));

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("interrupt received, winding the experiment down");
            cancel.cancel();
        });
    }

    let coordinator = ExperimentCoordinator::new(config, runner, link, traffic);
    let report = coordinator
        .run(cancel)
        .await
        .context("experiment startup failed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.summary());
        for capture in &report.captures {
            println!(
                "  capture {}: {:?} -> {}",
                capture.interface,
                capture.state,
                capture.output_path.display()
            );
        }
    }
    Ok(())
}
