//! Bulk write router CLI

use anyhow::Context;
use clap::{Parser, Subcommand};
use minibulk::command::BulkWriteRequest;
use minibulk::common::{Config, RouterStats};
use minibulk::router::{
    execute, BatchLimits, BulkWriteOp, ChunkMapTargeter, HttpShardClient, RoutingCatalog, Targeter,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minibulk")]
#[command(about = "Route bulk writes across shards")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./minibulk.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a bulk write request against the configured shards
    Exec {
        /// Request file (JSON)
        #[arg(long)]
        request: PathBuf,

        /// Routing catalog file (JSON array of routing tables)
        #[arg(long)]
        catalog: PathBuf,

        /// Print router statistics after the reply
        #[arg(long)]
        stats: bool,
    },

    /// Print the batches of the first round without dispatching them
    Explain {
        /// Request file (JSON)
        #[arg(long)]
        request: PathBuf,

        /// Routing catalog file (JSON array of routing tables)
        #[arg(long)]
        catalog: PathBuf,
    },
}

fn load_inputs(
    request: &Path,
    catalog: &Path,
) -> anyhow::Result<(BulkWriteRequest, Vec<Arc<dyn Targeter>>)> {
    let raw = std::fs::read_to_string(request)
        .with_context(|| format!("reading request {}", request.display()))?;
    let request: BulkWriteRequest = serde_json::from_str(&raw)?;
    request.validate()?;

    let raw = std::fs::read_to_string(catalog)
        .with_context(|| format!("reading catalog {}", catalog.display()))?;
    let catalog = RoutingCatalog::from_json(&raw)?;

    let mut targeters: Vec<Arc<dyn Targeter>> = Vec::with_capacity(request.ns_info.len());
    for info in &request.ns_info {
        targeters.push(Arc::new(ChunkMapTargeter::new(info.ns.clone(), catalog.clone())?));
    }
    Ok((request, targeters))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    let log_level = config.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Exec {
            request,
            catalog,
            stats,
        } => {
            let (request, targeters) = load_inputs(&request, &catalog)?;
            let client = HttpShardClient::new(&config.shards, config.router.shard_timeout())?;
            let router_stats = RouterStats::new();

            let reply =
                execute(&client, &targeters, &request, &config.router, &router_stats).await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);

            if stats {
                print!("{}", router_stats.to_prometheus());
            }
        }

        Commands::Explain { request, catalog } => {
            let (request, targeters) = load_inputs(&request, &catalog)?;
            let mut bulk = BulkWriteOp::new(&request, BatchLimits::from(&config.router));
            let (batches, write_type) = bulk.target(&targeters, true)?;

            println!("Round 1 ({:?}):", write_type);
            for batch in batches.values() {
                println!(
                    "  {} <- ops {:?} (~{} bytes)",
                    batch.shard_id,
                    batch.op_indexes(),
                    batch.estimated_size_bytes
                );
                let child = bulk.build_child_request(batch);
                for info in &child.ns_info {
                    if let Some(version) = &info.routing_version {
                        println!("    {} @ {}", info.ns, version);
                    }
                }
            }
            let untargeted: Vec<usize> = (0..request.ops.len())
                .filter(|&i| bulk.write_op(i).and_then(|op| op.error()).is_some())
                .collect();
            if !untargeted.is_empty() {
                println!("  could not target ops {:?}", untargeted);
            }
        }
    }

    Ok(())
}
