//! Event server
//!
//! Runs the HTTP engine with an event driver site mounted, so clients can
//! attach to channels over WebSocket, SSE or long polling.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────────────┐
//!                     │                    EVENT SERVER                      │
//!                     │                                                      │
//!   Client ───────────┼─▶ net listener ─▶ http queue ─▶ worker pool          │
//!                     │                                    │                 │
//!                     │                                    ▼                 │
//!                     │                         site handler (HttpMessage)   │
//!                     │                          │          │          │     │
//!                     │                     WebSocket     SSE     long poll  │
//!                     │                          └──────────┼──────────┘     │
//!                     │                                     ▼                │
//!                     │                    EventDriver ─▶ EventChannel       │
//!                     │                                                      │
//!                     │   config · observability · lifecycle · admin API     │
//!                     └──────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use event_server::admin::{serve_admin, AdminState};
use event_server::config::{load_config, ServerConfig};
use event_server::events::EventDriver;
use event_server::http::{HttpMessage, HttpServer, SiteHandler};
use event_server::http::site::ChannelType;
use event_server::lifecycle::wait_for_signal;
use event_server::observability::{init_logging, metrics};

#[derive(Parser)]
#[command(name = "event-server")]
#[command(about = "HTTP/WebSocket server with server-push event channels", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port of the event driver site
    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Base path of the event driver site
    #[arg(short, long, default_value = "/events")]
    base: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    init_logging(&config.observability);

    tracing::info!(
        name = %config.server.name,
        bind_host = %config.server.bind_host,
        workers = config.server.worker_threads,
        "event-server v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = HttpServer::new(config.clone());
    if !server.initialize() {
        return Err("server initialization failed".into());
    }

    let index: Arc<dyn SiteHandler> = Arc::new(|message: &mut HttpMessage| {
        message.set_text(format!("event-server {}", env!("CARGO_PKG_VERSION")));
    });
    if server
        .create_site(ChannelType::Strong, false, cli.port, "/", false, index)
        .await
        .is_none()
    {
        return Err(format!("cannot create site on port {}", cli.port).into());
    }

    let driver = EventDriver::new(&config);
    if !driver.register_sites(&server, cli.port, &cli.base).await {
        return Err(format!("cannot mount event driver at {}", cli.base).into());
    }

    if !server.run().await {
        tracing::warn!("Some ports failed to bind");
    }

    if config.admin.enabled {
        let state = AdminState::new(Arc::clone(&server), Some(Arc::clone(&driver)));
        let shutdown = server.shutdown().clone();
        let admin = config.admin.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_admin(&admin, state, shutdown).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    wait_for_signal().await;

    driver.stop();
    server.stop_server().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
