use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use metrics_collector::{
    accumulator::Accumulator,
    config::{parse_duration, Config},
    flush::Flusher,
    logging,
    server::{self, Server},
    sink::ClickHouseWriter,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Receives metric frames over TCP and bulk-writes them on a timer.
#[derive(Debug, Parser)]
#[command(name = "metrics-collector", version)]
struct Args {
    /// TOML config file; `./config.toml` is used if present.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long, env = "ADDR")]
    addr: Option<String>,

    #[arg(long, env = "DB_URL")]
    db_url: Option<String>,

    /// Seconds, or a duration such as `500ms`.
    #[arg(long, env = "FLUSH_INTERVAL", value_parser = parse_duration)]
    flush_interval: Option<std::time::Duration>,

    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref()).context("loading config")?;
    if let Some(addr) = args.addr {
        config.addr = addr;
    }
    if let Some(db_url) = args.db_url {
        config.db_url = db_url;
    }
    if let Some(flush_interval) = args.flush_interval {
        config.flush_interval = flush_interval;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate().context("validating config")?;
    logging::init(&config.logging);

    let accumulator = Arc::new(Accumulator::new());
    let writer = ClickHouseWriter::new(config.db_url.clone(), config.flush_timeout);
    let flusher = Arc::new(Flusher::new(accumulator, writer, config.flush_config()));

    let listener = server::bind(&config.listen_addr()).await?;
    info!(
        addr = %listener.local_addr()?,
        store = %config.db_host(),
        table = %config.table,
        flush_interval = %humantime::format_duration(config.flush_interval),
        "listening"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        }
    });

    Server::new(listener, flusher, config.shutdown_grace)
        .run(shutdown)
        .await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
