use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use eksforge::cloud::memory::InMemoryCloud;
use eksforge::config::{load_config, parse_network_cidr, ConfigFile, ZoneSelection};
use eksforge::controller::cidr::subnet_layout;
use eksforge::controller::{ReconcileReport, Reconciler};
use eksforge::telemetry::{init_telemetry, TelemetryConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log as JSON lines
    #[arg(long, global = true, env = "EKSFORGE_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load and validate a configuration file
    Validate(ValidateArgs),
    /// Run reconcile passes against the in-memory provider
    Simulate(SimulateArgs),
    /// Show version and build information
    Version,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    /// Configuration file (YAML, or TOML by extension)
    #[arg(long, short, env = "EKSFORGE_CONFIG")]
    config: PathBuf,
}

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Configuration file (YAML, or TOML by extension)
    #[arg(long, short, env = "EKSFORGE_CONFIG")]
    config: PathBuf,

    /// Number of reconcile passes; every pass after the first should be a no-op
    #[arg(long, default_value_t = 1)]
    runs: u32,

    /// Destroy everything after the last pass
    #[arg(long)]
    destroy: bool,

    /// Describe calls before a simulated resource settles
    #[arg(long, default_value_t = 0)]
    settle_polls: u32,

    /// Poll interval used by the simulation, in milliseconds
    #[arg(long, default_value_t = 20)]
    poll_interval_ms: u64,

    /// Print the metrics registry after the run
    #[cfg(feature = "metrics")]
    #[arg(long)]
    metrics: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("eksforge v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            Ok(())
        }
        Commands::Validate(validate_args) => {
            let _guard = init_telemetry(&TelemetryConfig {
                json: args.log_json,
                otlp_endpoint: None,
            })?;
            run_validate(validate_args)
        }
        Commands::Simulate(simulate_args) => {
            let _guard = init_telemetry(&TelemetryConfig {
                json: args.log_json,
                ..Default::default()
            })?;
            run_simulate(simulate_args).await
        }
    }
}

fn run_validate(args: ValidateArgs) -> anyhow::Result<()> {
    let file = load_config(&args.config)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;
    let cluster = &file.cluster;
    let network = parse_network_cidr(&cluster.network_cidr).map_err(anyhow::Error::msg)?;

    let zones: Vec<String> = match &cluster.availability_zones {
        ZoneSelection::Explicit(zones) => zones.clone(),
        ZoneSelection::Auto => (1..=file.engine.default_zone_count)
            .map(|i| format!("<auto zone {i}>"))
            .collect(),
    };

    println!("Configuration OK: cluster {} in {}", cluster.name, cluster.region);
    println!("Kubernetes version: {}", cluster.kubernetes_version);
    println!("Network: {network}");
    for zone in subnet_layout(network, &zones) {
        println!(
            "  {:<20} public {:<18} private {}",
            zone.zone, zone.public, zone.private
        );
    }
    for (name, pool) in &cluster.node_pools {
        println!(
            "Node pool {name}: {} x {}..{}{}{}",
            pool.instance_type,
            pool.effective_min(),
            pool.effective_max(),
            if pool.spot { ", spot" } else { "" },
            if pool.gpu { ", gpu" } else { "" },
        );
    }
    Ok(())
}

fn print_report(report: &ReconcileReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

async fn run_simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let ConfigFile { cluster, mut engine } = load_config(&args.config)
        .with_context(|| format!("invalid configuration {}", args.config.display()))?;
    engine.timeouts.poll_interval = Duration::from_millis(args.poll_interval_ms.max(1));

    let cloud = Arc::new(InMemoryCloud::new(cluster.region.clone()));
    cloud.set_settle_polls(args.settle_polls);

    let reconciler = Reconciler::new(cloud.clone(), engine);
    #[cfg(feature = "metrics")]
    let mut registry = prometheus_client::registry::Registry::default();
    #[cfg(feature = "metrics")]
    let reconciler = reconciler.with_metrics(Arc::new(
        eksforge::controller::metrics::Metrics::new(&mut registry),
    ));

    for run in 1..=args.runs.max(1) {
        info!(run, "Reconcile pass");
        let report = reconciler.reconcile(&cluster).await?;
        print_report(&report)?;
        info!(run, mutations = report.mutations, "Pass complete");
    }

    if args.destroy {
        let report = reconciler.destroy(&cluster.name).await?;
        print_report(&report)?;
    }

    println!("Simulated inventory: {:?}", cloud.inventory_counts());

    #[cfg(feature = "metrics")]
    {
        if args.metrics {
            print!("{}", eksforge::controller::metrics::render(&registry)?);
        }
    }
    Ok(())
}
