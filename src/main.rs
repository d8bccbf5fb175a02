use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relaysync::broadcast::Broadcaster;
use relaysync::config::ServerConfig;
use relaysync::dispatch::Dispatcher;
use relaysync::job::JobStore;
use relaysync::reconcile::Reconciler;
use relaysync::server::{self, ServerContext};
use relaysync::ssh::SshConnector;
use relaysync::strategy::StrategyKind;
use relaysync::worker::{TaskRegistry, Worker};

#[derive(Parser, Debug)]
#[command(name = "relaysyncd", about = "Remote-to-remote transfer daemon", version)]
struct Opts {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "relaysync.toml")]
    config: PathBuf,

    /// Address the control service listens on
    #[arg(short, long, default_value = "127.0.0.1:9440")]
    bind: String,

    /// Log filter, e.g. "info" or "relaysync=debug"
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&opts.log)),
        )
        .init();

    let config = Arc::new(ServerConfig::load(&opts.config)?);
    println!("Starting relaysync daemon:");
    println!("  Config: {}", opts.config.display());
    println!("  Bind:   {}", opts.bind);
    println!("  Route:  {} -> {}", config.source, config.dest);
    info!(
        source = %config.source,
        dest = %config.dest,
        "configuration loaded"
    );

    let store = Arc::new(match &config.journal {
        Some(path) => JobStore::open(path)
            .with_context(|| format!("open journal {}", path.display()))?,
        None => JobStore::in_memory(),
    });
    let registry = Arc::new(TaskRegistry::new());
    let broadcaster = Arc::new(Broadcaster::new());
    let connector = Arc::new(SshConnector::new(Arc::clone(&config)));

    let (queue_tx, queue_rx) = tokio::sync::mpsc::channel(config.queue_depth);
    let strategy = StrategyKind::for_platform(config.dest_platform());
    info!(?strategy, "transfer strategy selected");

    let dispatcher = Dispatcher::new(Arc::clone(&store), queue_tx, strategy);
    let worker = Worker::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&broadcaster),
        connector,
        &config.source,
        &config.dest,
        config.chunk_size,
        Duration::from_millis(config.progress_interval_ms),
    );
    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&broadcaster),
        Duration::from_millis(config.poll_interval_ms),
    );

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })
    .context("install signal handler")?;

    let ctx = Arc::new(ServerContext {
        dispatcher,
        store,
        broadcaster,
    });

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        tokio::spawn(worker.run(queue_rx));
        tokio::spawn(reconciler.run(stop_rx.clone()));
        server::serve(&opts.bind, ctx, stop_rx).await
    })
}
