//! Domset Node - simulated CASU arena runner
//!
//! - `sim` - run a group of simulated CASUs with random IR activity
//! - `config` - print the default (or a validated) controller configuration

use clap::{Parser, Subcommand};
use domset_core::sim::{IR_ACTIVE, SimArena, SimCasu};
use domset_core::{
    casu_name, ControllerConfig, DomsetController, EventLog, NodeId, RunSummary, Topology,
    IR_CHANNELS,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "domset-node")]
#[command(about = "Domset group temperature controller for CASU arenas")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated arena
    Sim {
        /// Number of CASUs (ids 1..=N)
        #[arg(short, long, default_value = "3")]
        nodes: u32,

        /// Undirected neighbor edges, e.g. "1-2,1-3" (default: star around casu 1)
        #[arg(short, long, value_delimiter = ',')]
        edges: Vec<String>,

        /// Run length in seconds (overrides the config file)
        #[arg(short, long)]
        duration: Option<f64>,

        /// Controller configuration (TOML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Probability that an IR channel detects a bee on a sample
        #[arg(short, long, default_value = "0.5", value_parser = probability)]
        activity: f64,

        /// Random seed
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Simulated seconds per real second
        #[arg(long, default_value = "50", value_parser = positive_f64)]
        speedup: f64,

        /// Run IR calibration before the experiment
        #[arg(long)]
        calibrate: bool,

        /// Directory for per-node CSV event logs
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Print controller configuration as TOML
    Config {
        /// Validate and print this file instead of the defaults
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    match cli.command {
        Commands::Config { file } => {
            let config = match file {
                Some(path) => ControllerConfig::from_file(path)?,
                None => ControllerConfig::default(),
            };
            print!("{}", config.to_toml_string()?);
        }

        Commands::Sim {
            nodes,
            edges,
            duration,
            config,
            activity,
            seed,
            speedup,
            calibrate,
            log_dir,
        } => {
            let mut config = match config {
                Some(path) => ControllerConfig::from_file(path)?,
                None => ControllerConfig::default(),
            };
            if let Some(d) = duration {
                config = config.with_time_length(d);
            }
            let graph = neighbor_graph(nodes, &edges)?;
            if let Some(dir) = &log_dir {
                std::fs::create_dir_all(dir)?;
            }

            info!(
                "Starting arena: {} nodes, {:.0}s at {}x, activity {:.2}",
                graph.len(),
                config.time_length,
                speedup,
                activity
            );

            let stop = Arc::new(AtomicBool::new(false));
            {
                let stop = stop.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Ctrl-C received, stopping arena");
                        stop.store(true, Ordering::Relaxed);
                    }
                });
            }

            let arena = SimArena::new();
            let mut handles = Vec::new();
            for (&id, neighbors) in &graph {
                let name = casu_name(id);
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(u64::from(id)));
                let casu = SimCasu::new(name.clone(), arena.clone())
                    .with_wall_clock(speedup)
                    .with_ir_script(move |_| random_ir(&mut rng, activity));

                let peer_names: Vec<String> = neighbors
                    .iter()
                    .map(|n| casu_name(*n))
                    .chain(std::iter::once(config.bridge_peer.clone()))
                    .collect();
                let topology = Topology::from_peer_names(
                    id,
                    peer_names.iter().map(String::as_str),
                    &config.bridge_peer,
                );

                let log = match &log_dir {
                    Some(dir) => EventLog::create(dir, &name)?,
                    None => EventLog::sink(),
                };
                let mut node = DomsetController::new(casu, topology, config.clone())?
                    .with_event_log(log);
                let stop = stop.clone();

                handles.push((
                    id,
                    tokio::task::spawn_blocking(move || -> domset_core::Result<RunSummary> {
                        if calibrate {
                            node.calibrate_ir_thresholds()?;
                        }
                        node.initialize_temperature()?;
                        node.run(&stop)
                    }),
                ));
            }

            println!("{:<10} {:>8} {:>8} {:>10} {:>10}", "node", "ticks", "control", "t_ref", "stop");
            for (id, handle) in handles {
                match handle.await? {
                    Ok(summary) => println!(
                        "{:<10} {:>8} {:>8} {:>10.2} {:>10}",
                        casu_name(id),
                        summary.ticks,
                        summary.control_ticks,
                        summary.final_temp_ref,
                        format!("{:?}", summary.stop_reason)
                    ),
                    Err(e) => error!("{} failed: {}", casu_name(id), e),
                }
            }
        }
    }

    Ok(())
}

fn positive_f64(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(format!("expected a positive number, got {}", s))
    }
}

fn probability(s: &str) -> Result<f64, String> {
    let v: f64 = s.parse().map_err(|e| format!("{}", e))?;
    if (0.0..=1.0).contains(&v) {
        Ok(v)
    } else {
        Err(format!("expected a probability in [0, 1], got {}", s))
    }
}

/// Node id -> neighbor ids
fn neighbor_graph(
    nodes: u32,
    edges: &[String],
) -> Result<BTreeMap<NodeId, BTreeSet<NodeId>>, Box<dyn std::error::Error>> {
    let mut graph: BTreeMap<NodeId, BTreeSet<NodeId>> =
        (1..=nodes).map(|id| (id, BTreeSet::new())).collect();

    let pairs: Vec<(NodeId, NodeId)> = if edges.is_empty() {
        (2..=nodes).map(|id| (1, id)).collect()
    } else {
        edges
            .iter()
            .map(|e| -> Result<(NodeId, NodeId), Box<dyn std::error::Error>> {
                let (a, b) = e
                    .trim()
                    .split_once('-')
                    .ok_or_else(|| format!("edge '{}' is not of the form A-B", e))?;
                Ok((a.trim().parse()?, b.trim().parse()?))
            })
            .collect::<Result<_, _>>()?
    };

    for (a, b) in pairs {
        if a == b {
            continue;
        }
        graph.entry(a).or_default().insert(b);
        graph.entry(b).or_default().insert(a);
    }
    Ok(graph)
}

/// Each channel detects with probability `activity`, otherwise reads background noise
fn random_ir(rng: &mut StdRng, activity: f64) -> [u16; IR_CHANNELS] {
    let mut raw = [0u16; IR_CHANNELS];
    for v in raw.iter_mut() {
        *v = if rng.gen_bool(activity) {
            IR_ACTIVE
        } else {
            rng.gen_range(0..2_000)
        };
    }
    raw
}
