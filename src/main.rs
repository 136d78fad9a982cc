//! Namespace Repository Load Driver
//!
//! Runs the repository against a simulated cluster: a pool of execution
//! shards, each hammering a set of namespaces with concurrent accessors,
//! with a namespace deleted halfway through.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Load Driver                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Metadata   │───▶│  Namespace   │◀───│  Shard Pool  │       │
//! │  │  Publisher   │    │     Repo     │    │ (accessors)  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future::join_all;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nsrepo::adapters::{LoggingEventPublisher, LoopbackMessenger, SimulatedFactory};
use nsrepo::metadata::{DirectoryMetadata, NamespaceConfig, NamespacesMetadata};
use nsrepo::{
    Error, KeyRange, MetadataView, NamespaceAccess, NamespaceId, NamespaceRepo, PeerId, RepoConfig,
    Result, ShardPool,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Namespace repository load driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of execution shards
    #[arg(long, env = "NSREPO_SHARDS", default_value = "4")]
    shards: usize,

    /// Number of namespaces to generate (ignored with --topology)
    #[arg(long, env = "NSREPO_NAMESPACES", default_value = "8")]
    namespaces: usize,

    /// Concurrent accessors per shard
    #[arg(long, env = "NSREPO_ACCESSORS", default_value = "32")]
    accessors: usize,

    /// Lookups per accessor in each phase
    #[arg(long, env = "NSREPO_ROUNDS", default_value = "50")]
    rounds: usize,

    /// Simulated construction latency in milliseconds
    #[arg(long, env = "NSREPO_BUILD_LATENCY_MS", default_value = "5")]
    build_latency_ms: u64,

    /// Grace period before an unused interface is torn down
    #[arg(long, env = "NSREPO_DRAIN_GRACE_MS", default_value = "0")]
    drain_grace_ms: u64,

    /// Construction timeout in milliseconds
    #[arg(long, env = "NSREPO_CONSTRUCTION_TIMEOUT_MS")]
    construction_timeout_ms: Option<u64>,

    /// JSON file with initial namespaces and directory metadata
    #[arg(long, env = "NSREPO_TOPOLOGY")]
    topology: Option<PathBuf>,

    /// Log repository events at info level
    #[arg(long, env = "NSREPO_LOG_EVENTS")]
    log_events: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// On-disk topology description.
#[derive(Debug, Default, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    namespaces: NamespacesMetadata,
    #[serde(default)]
    directory: DirectoryMetadata,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting namespace repository load driver");
    info!("  Shards: {}", args.shards);
    info!("  Accessors per shard: {}", args.accessors);
    info!("  Build latency: {} ms", args.build_latency_ms);
    info!("  Drain grace: {} ms", args.drain_grace_ms);

    let topology = load_topology(&args)?;
    let namespaces: Vec<NamespaceId> = {
        let mut ids: Vec<_> = topology.namespaces.live_namespaces().map(|(id, _)| *id).collect();
        ids.sort();
        ids
    };
    if namespaces.is_empty() {
        return Err(Error::Config("topology has no live namespaces".to_string()));
    }
    info!("  Namespaces: {}", namespaces.len());

    let (publisher, view) = MetadataView::channel(topology.namespaces, topology.directory);

    let config = RepoConfig {
        drain_grace: Duration::from_millis(args.drain_grace_ms),
        construction_timeout: args.construction_timeout_ms.map(Duration::from_millis),
    };
    let factory = SimulatedFactory::new().with_latency(Duration::from_millis(args.build_latency_ms));
    let events = if args.log_events {
        LoggingEventPublisher::info_level()
    } else {
        LoggingEventPublisher::debug_level()
    };

    let repo = Arc::new(
        NamespaceRepo::builder(factory, view, Arc::new(LoopbackMessenger::new()))
            .config(config)
            .event_publisher(Arc::new(events))
            .build(),
    );
    let watcher = repo.spawn_topology_watcher();

    let pool = ShardPool::new(args.shards)?;
    let cancel = CancellationToken::new();

    // Phase one: every namespace is live
    let (ok, failed) = run_phase(&pool, &repo, &namespaces, &args, &cancel).await?;
    info!(ok, failed, "Phase one complete");

    // Delete one namespace and keep going; its lookups should start failing
    // once its cached interfaces have drained
    let deleted = namespaces[0];
    publisher.update_namespaces(|metadata| {
        if let Some(config) = metadata.namespaces.get_mut(&deleted) {
            config.deleted = true;
        }
    });
    info!(namespace = %deleted, "Deleted namespace");

    let (ok, failed) = run_phase(&pool, &repo, &namespaces, &args, &cancel).await?;
    info!(ok, failed, "Phase two complete");

    let snapshot = repo.metrics();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    info!(
        builds = repo.factory().builds_completed(),
        teardowns = repo.factory().teardowns(),
        "Simulated factory totals"
    );

    cancel.cancel();
    repo.shutdown().await;
    if let Err(e) = watcher.await {
        error!("Topology watcher failed: {}", e);
    }
    pool.shutdown().await?;

    info!("Load driver finished");
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

/// Run one round of accessors on every shard; returns (succeeded, failed).
async fn run_phase(
    pool: &ShardPool,
    repo: &Arc<NamespaceRepo<SimulatedFactory>>,
    namespaces: &[NamespaceId],
    args: &Args,
    cancel: &CancellationToken,
) -> Result<(u64, u64)> {
    let runs = pool.shards().map(|shard| {
        let repo = Arc::clone(repo);
        let namespaces = namespaces.to_vec();
        let cancel = cancel.clone();
        let accessors = args.accessors;
        let rounds = args.rounds;

        pool.run_on(shard, move || async move {
            let tasks = (0..accessors).map(|accessor| {
                let repo = Arc::clone(&repo);
                let namespaces = namespaces.clone();
                let cancel = cancel.clone();
                tokio::task::spawn_local(async move {
                    let mut outcome = (0u64, 0u64);
                    for round in 0..rounds {
                        let namespace_id = namespaces[(accessor + round) % namespaces.len()];
                        match lookup(&repo, namespace_id, &format!("key-{}", round), &cancel).await {
                            Ok(()) => outcome.0 += 1,
                            Err(_) => outcome.1 += 1,
                        }
                    }
                    outcome
                })
            });

            join_all(tasks).await.into_iter().fold((0, 0), |acc, joined| match joined {
                Ok((ok, failed)) => (acc.0 + ok, acc.1 + failed),
                Err(e) => {
                    error!("Accessor task failed: {}", e);
                    acc
                }
            })
        })
    });

    let mut totals = (0, 0);
    for result in join_all(runs).await {
        let (ok, failed) = result?;
        totals.0 += ok;
        totals.1 += failed;
    }
    Ok(totals)
}

async fn lookup(
    repo: &Arc<NamespaceRepo<SimulatedFactory>>,
    namespace_id: NamespaceId,
    key: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let access = NamespaceAccess::new(repo, namespace_id, cancel).await?;
    let interface = access.namespace_if().await?;

    if interface.route(key).is_none() {
        warn!(namespace = %namespace_id, key, "No master serves key");
    }
    tokio::task::yield_now().await;
    Ok(())
}

// =============================================================================
// Topology Setup
// =============================================================================

fn load_topology(args: &Args) -> Result<TopologyFile> {
    if let Some(path) = &args.topology {
        let raw = std::fs::read_to_string(path)?;
        let topology: TopologyFile = serde_json::from_str(&raw)?;
        info!("Loaded topology from {}", path.display());
        return Ok(topology);
    }

    let peers = [PeerId::new_v4(), PeerId::new_v4()];
    let split = KeyRange::new("", Some("m".to_string()));
    let rest = KeyRange::new("m", None);

    let mut topology = TopologyFile::default();
    for index in 0..args.namespaces {
        let id = NamespaceId::new_v4();
        topology.namespaces.namespaces.insert(
            id,
            NamespaceConfig::new(format!("table_{}", index))
                .with_primary(split.clone(), peers[0])
                .with_primary(rest.clone(), peers[1]),
        );
        topology.directory = std::mem::take(&mut topology.directory)
            .with_master(peers[0], id, split.clone())
            .with_master(peers[1], id, rest.clone());
    }
    Ok(topology)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
