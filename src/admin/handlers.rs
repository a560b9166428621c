use axum::{extract::State, Json};
use serde::Serialize;

use crate::admin::AdminState;
use crate::events::ChannelStatus;
use crate::http::server::ServerStatus;
use crate::http::site::SiteStatus;

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub server: ServerStatus,
    pub channels: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        server: state.server.status(),
        channels: state.driver.as_ref().map(|d| d.channel_count()).unwrap_or(0),
    })
}

pub async fn get_sites(State(state): State<AdminState>) -> Json<Vec<SiteStatus>> {
    Json(state.server.sites())
}

pub async fn get_channels(State(state): State<AdminState>) -> Json<Vec<ChannelStatus>> {
    Json(state.driver.as_ref().map(|d| d.statuses()).unwrap_or_default())
}
