//! DYMO Routing Command-Line Interface
//!
//! This CLI provides tools for:
//! - Simulating DYMO route discovery and forwarding over a virtual network
//! - Printing and validating engine configuration files
//! - Showing protocol parameters

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dymo_core::simulation::{Network, SimConfig};
use dymo_core::time::Timestamp;
use dymo_core::wire::{KIND_DATA, KIND_RERR, KIND_RREP, KIND_RREQ, KIND_UERR};
use dymo_core::{DymoConfig, EngineStats};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "dymo")]
#[command(author, version, about = "DYMO reactive routing CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a discrete-event simulation of a DYMO network
    Simulate {
        /// Number of nodes
        #[arg(short, long, default_value = "5")]
        nodes: usize,

        /// Number of data packets to send between random node pairs
        #[arg(short, long, default_value = "10")]
        packets: usize,

        /// Link topology
        #[arg(short, long, value_enum, default_value = "chain")]
        topology: Topology,

        /// Engine configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Take the link between two node indices down halfway, e.g. "1-2"
        #[arg(long)]
        break_link: Option<String>,

        /// Random seed for traffic and jitter
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Milliseconds between packets
        #[arg(long, default_value = "500")]
        interval: u64,

        /// Print the final statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration, or validate a configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Topology {
    /// Nodes in a line, each linked to its predecessor
    Chain,
    /// Every node linked to every other node
    Mesh,
}

fn parse_link(spec: &str) -> Result<(usize, usize)> {
    let (a, b) = spec
        .split_once('-')
        .with_context(|| format!("Invalid link '{}', expected A-B", spec))?;
    let a = a
        .trim()
        .parse()
        .with_context(|| format!("Invalid node index '{}'", a))?;
    let b = b
        .trim()
        .parse()
        .with_context(|| format!("Invalid node index '{}'", b))?;
    Ok((a, b))
}

fn load_config(path: Option<&PathBuf>) -> Result<DymoConfig> {
    match path {
        Some(path) => DymoConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(SimConfig::default().dymo),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_simulate(
    num_nodes: usize,
    num_packets: usize,
    topology: Topology,
    config: Option<PathBuf>,
    break_link: Option<String>,
    seed: u64,
    interval_ms: u64,
    json: bool,
) -> Result<()> {
    if num_nodes < 2 {
        anyhow::bail!("Need at least 2 nodes, got {}", num_nodes);
    }

    let dymo = load_config(config.as_ref())?;
    let sim_config = SimConfig::default()
        .with_node_count(num_nodes)
        .with_seed(seed)
        .with_dymo(dymo);

    let mut net = match topology {
        Topology::Chain => Network::chain(sim_config),
        Topology::Mesh => Network::full_mesh(sim_config),
    }
    .context("Failed to build network")?;

    let interval = Duration::from_millis(interval_ms);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut at = Timestamp::ZERO;
    for _ in 0..num_packets {
        let src = rng.gen_range(0..num_nodes);
        let mut dst = rng.gen_range(0..num_nodes - 1);
        if dst >= src {
            dst += 1;
        }
        let payload = format!("{} -> {}", src, dst).into_bytes();
        net.schedule_send(at, src, dst, payload)?;
        at += interval;
    }

    if let Some(spec) = &break_link {
        let (a, b) = parse_link(spec)?;
        let when = Timestamp::from_micros(at.as_micros() / 2);
        if !net.is_linked(a, b) {
            warn!("Nodes {} and {} are not linked, nothing to break", a, b);
        }
        net.schedule_link_down(when, a, b)
            .with_context(|| format!("Cannot break link {}", spec))?;
        info!("Link {}-{} will go down at {}", a, b, when);
    }

    if !json {
        println!("=== DYMO Network Simulation ===");
        println!();
        println!("Nodes:    {}", num_nodes);
        println!("Packets:  {}", num_packets);
        println!("Topology: {:?}", topology);
        println!("Seed:     {}", seed);
        if let Some(spec) = &break_link {
            println!("Break:    {}", spec);
        }
        println!();
    }

    // Leave room for every discovery retry to run out
    let settle = Duration::from_secs(30);
    net.run_until(at + settle).context("Simulation failed")?;

    let per_node: Vec<(String, usize, EngineStats)> = (0..net.len())
        .filter_map(|i| net.node(i))
        .map(|n| (n.address().to_string(), n.table().len(), n.stats().clone()))
        .collect();
    let stats = net.finish();

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("=== Simulation Results ===");
    println!();
    println!("Packets sent:       {}", stats.messages_sent);
    println!("Packets delivered:  {}", stats.messages_delivered);
    println!("Delivery rate:      {:.1}%", stats.delivery_rate() * 100.0);
    if let Some(latency) = stats.mean_latency() {
        println!("Mean latency:       {:.2} ms", latency * 1000.0);
    }
    println!("Unreachable:        {}", stats.unreachable_reports);
    println!("Frames transmitted: {}", stats.frames_transmitted);
    println!("Frames lost:        {}", stats.frames_lost);
    println!("Control bytes:      {}", stats.control_bytes);
    println!();

    println!("Per-Node Statistics:");
    println!(
        "{:<14} {:<8} {:<8} {:<8} {:<8} {:<8} {:<8}",
        "Address", "Routes", "Sent", "Rcvd", "Fwd", "RREQ", "RERR"
    );
    println!("{}", "-".repeat(68));
    for (address, routes, s) in &per_node {
        println!(
            "{:<14} {:<8} {:<8} {:<8} {:<8} {:<8} {:<8}",
            address, routes, s.traffic_sent, s.traffic_received, s.traffic_forwarded, s.rreq_sent, s.rerr_sent
        );
    }

    Ok(())
}

fn cmd_config(file: Option<PathBuf>) -> Result<()> {
    match file {
        Some(path) => {
            let config = DymoConfig::from_file(&path)
                .with_context(|| format!("Invalid configuration {}", path.display()))?;
            println!("{} is valid", path.display());
            println!("{}", config.to_json()?);
        }
        None => {
            println!("{}", DymoConfig::default().to_json()?);
        }
    }
    Ok(())
}

fn cmd_info() -> Result<()> {
    let defaults = DymoConfig::default();

    println!("=== DYMO Reactive Routing ===");
    println!();
    println!("Message Kinds:");
    println!("  {}  RREQ  - Route request, flooded with expanding hop limit", KIND_RREQ);
    println!("  {}  RREP  - Route reply, unicast back along the reverse path", KIND_RREP);
    println!("  {}  RERR  - Route error, lists unreachable destinations", KIND_RERR);
    println!("  {}  UERR  - Unsupported element error", KIND_UERR);
    println!("  {}  DATA  - Application payload", KIND_DATA);
    println!();
    println!("Default Parameters:");
    println!("  Hop limits:        {} - {}", defaults.min_hop_limit, defaults.max_hop_limit);
    println!("  RREQ tries:        {}", defaults.rreq_tries);
    println!("  RREQ wait:         {} ms (doubles per retry)", defaults.rreq_wait_time_ms);
    println!(
        "  RREQ rate limit:   {:.1}/s, burst {}",
        defaults.rreq_rate_limit, defaults.rreq_burst_limit
    );
    println!(
        "  Route age:         {} - {} ms",
        defaults.route_age_min_timeout_ms, defaults.route_age_max_timeout_ms
    );
    println!("  Route new/used:    {} / {} ms", defaults.route_new_timeout_ms, defaults.route_used_timeout_ms);
    println!("  Route delete:      {} ms", defaults.route_delete_timeout_ms);
    println!("  Seq num loss:      {} ms", defaults.seqnum_loss_timeout_ms);
    println!();
    println!("Examples:");
    println!("  dymo simulate --nodes 8 --packets 20");
    println!("  dymo simulate --nodes 6 --topology mesh --seed 7");
    println!("  dymo simulate --nodes 5 --break-link 2-3 -v");
    println!("  dymo config > dymo.json");
    println!("  dymo config --file dymo.json");

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Simulate {
            nodes,
            packets,
            topology,
            config,
            break_link,
            seed,
            interval,
            json,
        } => cmd_simulate(nodes, packets, topology, config, break_link, seed, interval, json),

        Commands::Config { file } => cmd_config(file),

        Commands::Info => cmd_info(),
    }
}
