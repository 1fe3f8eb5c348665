//! Gateway dispatch server.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net listener ──▶ http server ──▶ Dispatcher
//!                                                   │
//!                         routing (RouteTable) ◀────┤ resolve
//!                         proxy::headers      ◀────┤ rewrite
//!                         proxy::classify     ◀────┤ classify
//!                                                   ▼
//!                          ┌───────────── engine ─────────────┐
//!                          │ buffered (+gzip) ──▶ transport   │──▶ Backend
//!                          │ tunnel ───────────▶ raw TCP      │
//!                          └──────────────────────────────────┘
//!                                                   │
//!                         observability ◀───────────┘ timers, status, access log
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;

use gateway_dispatch::config::loader::load_config;
use gateway_dispatch::config::validation::validate_config;
use gateway_dispatch::config::watcher::ConfigWatcher;
use gateway_dispatch::config::ProxyConfig;
use gateway_dispatch::lifecycle::signals::wait_for_signal;
use gateway_dispatch::lifecycle::Shutdown;
use gateway_dispatch::net::{listener, tls};
use gateway_dispatch::observability::logging::init_logging;
use gateway_dispatch::observability::metrics::{init_metrics, Registry};
use gateway_dispatch::HttpServer;

#[derive(Parser)]
#[command(name = "gateway-dispatch")]
#[command(about = "Reverse-proxy gateway request dispatcher", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };

    if cli.check {
        if let Err(errors) = validate_config(&config) {
            for e in &errors {
                eprintln!("error: {e}");
            }
            std::process::exit(1);
        }
        println!("configuration ok");
        return Ok(());
    }

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gateway-dispatch starting");

    if let Err(errors) = validate_config(&config) {
        for e in &errors {
            tracing::error!(error = %e, "Invalid configuration");
        }
        return Err(format!("{} configuration error(s)", errors.len()).into());
    }

    tracing::info!(
        bind_address = %config.listener.bind_address,
        routes = config.routes.len(),
        tls = config.listener.tls.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    // The watcher handle must outlive the server.
    let (config_updates, _watcher) = match &cli.config {
        Some(path) => {
            let (watcher, updates) = ConfigWatcher::new(path);
            (updates, Some(watcher.run()?))
        }
        None => (mpsc::unbounded_channel().1, None),
    };

    let shutdown = Shutdown::new();
    let registry = Arc::new(Registry::new());
    let server = HttpServer::with_registry(config.clone(), registry.clone())?;
    let server_shutdown = shutdown.subscribe();

    let serve = async {
        match &config.listener.tls {
            Some(tls_config) => {
                let addr = listener::bind_address(&config.listener)?;
                let rustls = tls::load_tls_config(tls_config).await?;
                server.run_tls(addr, rustls, config_updates, server_shutdown).await?;
            }
            None => {
                let tcp = listener::bind(&config.listener).await?;
                server.run(tcp, config_updates, server_shutdown).await?;
            }
        }
        Ok::<_, Box<dyn std::error::Error>>(())
    };

    tokio::pin!(serve);
    tokio::select! {
        result = &mut serve => result?,
        _ = wait_for_signal() => {
            shutdown.trigger();
            serve.await?;
        }
    }

    for (name, timer) in registry.timers() {
        tracing::info!(metric = %name, count = timer.count, mean = ?timer.mean, max = ?timer.max, "Timer summary");
    }
    for (name, count) in registry.counters() {
        tracing::info!(metric = %name, count, "Counter summary");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
