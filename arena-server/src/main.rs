//! TaskArena ingress server: accepts jobs over HTTP and runs the worker pool
//! and the scoreboard drain in the same process.

mod error;
mod routes;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use arena::drain::run_drain_loop;
use arena::io::agent::{ClaudeCli, CliSettings};
use arena::io::config::{ArenaConfig, load_runtime_config};
use arena::io::paths::{ArenaPaths, default_state_dir};
use arena::io::store::JobStore;
use arena::pool::{PoolConfig, run_pool};
use arena::worker::WorkerContext;
use clap::Parser;
use tracing::{error, info};

use crate::state::AppState;

const LOG_FILTER: &str = "arena=info,arena_server=info";

#[derive(Parser)]
#[command(name = "arena-server")]
#[command(about = "HTTP ingress and worker host for a TaskArena state directory")]
struct Args {
    /// State directory (default: $TASKARENA_HOME or ~/.taskarena)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Address to bind the server to (overrides config)
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Worker thread count (overrides config and TA_WORKERS)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    arena::logging::init(LOG_FILTER);
    let args = Args::parse();

    let root = match args.state_dir {
        Some(dir) => dir,
        None => default_state_dir()?,
    };
    let paths = ArenaPaths::new(root);
    paths.ensure_layout()?;
    let mut cfg = load_runtime_config(&paths.config_path)?;
    if let Some(bind) = args.bind {
        cfg.server.bind = bind;
    }
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(workers) = args.workers {
        cfg.workers = workers;
    }
    cfg.validate()?;
    info!(state_dir = %paths.root.display(), workers = cfg.workers, "starting arena-server");

    let shutdown = Arc::new(AtomicBool::new(false));
    let background = spawn_background(&paths, &cfg, &shutdown)?;

    let app = routes::router(AppState::new(
        JobStore::new(paths.clone()),
        cfg.server.max_body_bytes,
    ));
    let listener = tokio::net::TcpListener::bind((cfg.server.bind.as_str(), cfg.server.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.store(true, Ordering::Relaxed);
    info!("waiting for in-flight jobs to finish");
    for handle in background {
        if handle.join().is_err() {
            error!("background thread panicked");
        }
    }
    Ok(())
}

/// Start the worker pool and the drain loop on their own threads.
fn spawn_background(
    paths: &ArenaPaths,
    cfg: &ArenaConfig,
    shutdown: &Arc<AtomicBool>,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let ctx = WorkerContext::new(paths.clone(), ClaudeCli::new(CliSettings::from_config(cfg)))?;
    let pool_config = PoolConfig::from_config(cfg);
    let pool_shutdown = Arc::clone(shutdown);
    let pool = thread::Builder::new()
        .name("arena-pool".to_string())
        .spawn(move || {
            run_pool(&ctx, &pool_config, &pool_shutdown);
        })?;

    let drain_paths = paths.clone();
    let interval = cfg.drain_interval();
    let drain_shutdown = Arc::clone(shutdown);
    let drain = thread::Builder::new()
        .name("arena-drain".to_string())
        .spawn(move || run_drain_loop(&drain_paths, interval, &drain_shutdown))?;

    Ok(vec![pool, drain])
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(err) => {
            error!("failed to listen for ctrl-c: {err}");
            std::future::pending::<()>().await;
        }
    }
}
