/*
[INPUT]:  CLI arguments, job database path, OS shutdown signals
[OUTPUT]: Recovery sweep followed by a running push gateway
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup ordering, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docuflow_server::{JobStore, PushGateway, recover_stuck_jobs};

#[derive(Parser, Debug)]
#[command(name = "docuflow-server", version, about = "Docuflow task push gateway")]
struct Cli {
    #[arg(long = "db", value_name = "PATH", default_value = "docuflow-jobs.db")]
    db_path: PathBuf,
    #[arg(long = "bind", value_name = "ADDR", default_value = "127.0.0.1:9100")]
    bind: String,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    info!(db_path = %args.db_path.display(), bind = %args.bind, "starting docuflow-server");

    let store = Arc::new(JobStore::new(&args.db_path).context("open job store")?);

    // The sweep must finish before the listener opens: once a client can
    // subscribe, every job it observes is either owned by a live worker or
    // already failed with a recovery reason.
    let report = recover_stuck_jobs(&store);
    if report.errors.is_empty() {
        info!(recovered = report.recovered_count, "recovery sweep complete");
    } else {
        warn!(
            recovered = report.recovered_count,
            errors = report.errors.len(),
            "recovery sweep finished with errors"
        );
    }

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());

    let listener = TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;

    let gateway = PushGateway::new(store, shutdown.clone());
    gateway.serve(listener).await;

    info!("docuflow-server stopped");
    Ok(())
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
