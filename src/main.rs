//! news-ingest
//!
//! Probes the news feed, subscribes to every symbol and stores each news
//! item in PostgreSQL until interrupted.
//!
//! Exit codes: 0 on operator shutdown, 1 on configuration or probe failure,
//! 2 when the feed connection is lost.

#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(unused_must_use)]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use news_ingest::config::Config;
use news_ingest::endpoints;
use news_ingest::probe::AlpacaProbe;
use news_ingest::sink::memory::MemorySink;
use news_ingest::sink::postgres::PostgresSink;
use news_ingest::sink::PersistenceSink;
use news_ingest::state::StateHandle;
use news_ingest::streaming::{AlpacaNewsStream, StreamProvider};
use news_ingest::supervisor::{FeedFactory, Supervisor, SupervisorSettings};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "news-ingest.toml")]
    config: String,

    /// Feed API key (overrides config and ALPACA_API_KEY from .env)
    #[arg(long, env = "ALPACA_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Feed secret key
    #[arg(long, env = "ALPACA_SECRET_KEY", hide_env_values = true)]
    secret_key: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Keep events in memory instead of writing to PostgreSQL
    #[arg(long)]
    dry_run: bool,

    /// Serve /metrics and /health on this port
    #[arg(long)]
    metrics_port: Option<u16>,

    /// Re-probe and resubscribe when the feed connection drops
    #[arg(long)]
    reconnect: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    init_logging(args.verbose, args.json_logs)?;

    info!("Starting news-ingest {}", env!("CARGO_PKG_VERSION"));

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {:#}", e);
            return Ok(ExitCode::from(1));
        }
    };

    let state = StateHandle::new();

    if config.monitoring.enable_metrics {
        let port = config.monitoring.metrics_port;
        let endpoint_state = state.clone();
        info!("Starting metrics server on port {}", port);
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(port, endpoint_state).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let probe = match AlpacaProbe::new(&config.alpaca, config.probe.request_timeout()) {
        Ok(probe) => Arc::new(probe),
        Err(e) => {
            error!("Failed to build probe client: {}", e);
            return Ok(ExitCode::from(1));
        }
    };

    let sink: Arc<dyn PersistenceSink> = if args.dry_run {
        warn!("Dry run: events are kept in memory and discarded on exit");
        Arc::new(MemorySink::new())
    } else {
        Arc::new(PostgresSink::new(&config.postgres).context("Failed to set up the datastore")?)
    };

    let alpaca = config.alpaca.clone();
    let feed_factory: FeedFactory = Box::new(move || {
        Box::new(AlpacaNewsStream::from_config(&alpaca)) as Box<dyn StreamProvider>
    });

    let supervisor = Supervisor::new(
        probe,
        feed_factory,
        sink,
        state,
        SupervisorSettings::from(&config),
    );
    let reason = supervisor.run(shutdown_signal()).await;

    info!("Exiting: {:?}", reason);
    Ok(ExitCode::from(reason.exit_code()))
}

/// Initialize logging
fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let env_filter = if verbose {
        "news_ingest=debug,info"
    } else {
        "news_ingest=info,warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| env_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }

    Ok(())
}

/// File, then environment, then command line
fn load_config(args: &Args) -> Result<Config> {
    let mut config = Config::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config))?;

    if let Some(key) = &args.api_key {
        config.alpaca.api_key = key.clone();
    }
    if let Some(secret) = &args.secret_key {
        config.alpaca.secret_key = secret.clone();
    }
    if let Some(port) = args.metrics_port {
        config.monitoring.enable_metrics = true;
        config.monitoring.metrics_port = port;
    }
    if args.reconnect {
        config.session.reconnect_on_drop = true;
    }

    config.validate_with(!args.dry_run)?;
    info!("Configuration loaded: {:?}", config);
    Ok(config)
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
