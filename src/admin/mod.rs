//! Admin API: read-only status of the server, its sites and channels.
//!
//! Served on its own listener, separate from the request queue, and
//! guarded by a bearer token.

pub mod auth;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::schema::AdminConfig;
use crate::events::EventDriver;
use crate::http::HttpServer;
use crate::lifecycle::Shutdown;

use self::auth::admin_auth_middleware;
use self::handlers::{get_channels, get_sites, get_status};

/// State shared by the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    pub server: Arc<HttpServer>,
    pub driver: Option<Arc<EventDriver>>,
    pub api_key: Arc<str>,
}

impl AdminState {
    pub fn new(server: Arc<HttpServer>, driver: Option<Arc<EventDriver>>) -> Self {
        let api_key: Arc<str> = Arc::from(server.config().admin.api_key.as_str());
        Self {
            server,
            driver,
            api_key,
        }
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/sites", get(get_sites))
        .route("/admin/channels", get(get_channels))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve_admin(config: &AdminConfig, state: AdminState, shutdown: Shutdown) -> std::io::Result<()> {
    let addr: SocketAddr = config
        .bind_address
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, setup_admin_router(state))
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}
