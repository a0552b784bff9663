//! routegridd: the RouteGrid daemon.
//!
//! Loads a cluster document, registers its nodes and runs the scheduling
//! engine. Execution goes through the dry-run adapter, which completes
//! every task after a fixed delay; a heartbeat loop keeps the nodes fresh.
//!
//! # Usage
//!
//! ```text
//! routegridd check --config cluster.toml
//! routegridd run --config cluster.toml --tasks tasks.json
//! ```

mod dry_run;
mod heartbeat;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use routegrid_core::{ClusterDocument, TaskSpec};
use routegrid_scheduler::{AdapterSet, Engine, EngineHandle};
use routegrid_state::{ClusterState, WarmStateTracker};

use crate::dry_run::DryRunAdapter;
use crate::heartbeat::{heartbeat_interval, run_heartbeat};

#[derive(Parser)]
#[command(name = "routegridd", about = "RouteGrid scheduling daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a cluster document and print the resolved nodes as JSON.
    Check {
        #[arg(long, default_value = "cluster.toml")]
        config: PathBuf,
    },
    /// Run the engine until interrupted.
    Run {
        #[arg(long, default_value = "cluster.toml")]
        config: PathBuf,

        /// JSON array of task specs to submit at startup.
        #[arg(long)]
        tasks: Option<PathBuf>,

        /// How long a dry-run task takes, in milliseconds.
        #[arg(long, default_value = "500")]
        dry_run_ms: u64,

        /// Log as JSON lines.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Check { config } => {
            init_tracing(false);
            check(&config)
        }
        Command::Run {
            config,
            tasks,
            dry_run_ms,
            json,
        } => {
            init_tracing(json);
            run(&config, tasks.as_deref(), Duration::from_millis(dry_run_ms)).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,routegrid=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn check(path: &Path) -> anyhow::Result<()> {
    let doc = ClusterDocument::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let nodes = doc.node_specs()?;
    println!("{}", serde_json::to_string_pretty(&nodes)?);
    info!(cluster = %doc.cluster.name, nodes = nodes.len(), "cluster document is valid");
    Ok(())
}

async fn run(path: &Path, tasks: Option<&Path>, dry_run: Duration) -> anyhow::Result<()> {
    let doc = ClusterDocument::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;
    info!(cluster = %doc.cluster.name, "RouteGrid daemon starting");

    let cluster = Arc::new(ClusterState::new().with_staleness_window(doc.engine.cluster.staleness_window));
    let warm = Arc::new(WarmStateTracker::new().with_ttl(doc.engine.cluster.warm_ttl));
    let adapters = AdapterSet::new(Arc::new(DryRunAdapter::new(dry_run)));

    let (handle, engine) = Engine::start(&doc.engine, cluster, warm, adapters);

    let mut node_ids = Vec::new();
    for spec in doc.node_specs()? {
        let id = spec.id.clone();
        handle
            .register_node(spec)
            .await
            .with_context(|| format!("registering node {id}"))?;
        node_ids.push(id);
    }
    info!(nodes = node_ids.len(), "nodes registered");

    let (beat_stop, beat_rx) = watch::channel(false);
    let beats = tokio::spawn(run_heartbeat(
        handle.clone(),
        node_ids,
        heartbeat_interval(doc.engine.cluster.staleness_window),
        beat_rx,
    ));

    if let Some(tasks) = tasks {
        submit_file(&handle, tasks).await?;
    }

    tokio::signal::ctrl_c().await.context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    let depth = handle.queue_depth().await.unwrap_or_default();
    if depth > 0 {
        warn!(queued = depth, "stopping with tasks still queued");
    }
    let _ = beat_stop.send(true);
    beats.await?;
    handle.shutdown();
    engine.await?;

    info!("RouteGrid daemon stopped");
    Ok(())
}

async fn submit_file(handle: &EngineHandle, path: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let specs: Vec<TaskSpec> =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;

    for spec in specs {
        match handle.submit(spec).await {
            Ok(id) => info!(task = %id, "submitted"),
            Err(e) => warn!(error = %e, "submission rejected"),
        }
    }
    Ok(())
}
