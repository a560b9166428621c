//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;

use event_server::config::ServerConfig;
use event_server::events::EventDriver;
use event_server::http::site::ChannelType;
use event_server::http::{HttpMessage, HttpServer, SiteHandler};

/// A port nothing listens on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.name = "test-server".to_string();
    config.server.bind_host = "127.0.0.1".to_string();
    config.server.worker_threads = 4;
    config.websocket.keepalive_ms = 0;
    config.events.monitor_interval_ms = 20;
    config
}

/// Answers `<method> <path> <body>`.
pub struct Echo;

impl SiteHandler for Echo {
    fn handle<'a>(&'a self, message: &'a mut HttpMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let body = message.body().await.unwrap_or_default();
            let text = format!(
                "{} {} {}",
                message.method(),
                message.path(),
                String::from_utf8_lossy(&body)
            );
            message.set_text(text);
        })
    }
}

/// A running server with an echo site on `/` and the event driver on
/// `/events/`.
pub struct TestServer {
    pub server: Arc<HttpServer>,
    pub driver: Arc<EventDriver>,
    pub port: u16,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let port = free_port();
        let server = HttpServer::new(config.clone());
        assert!(server.initialize());
        server
            .create_site(ChannelType::Strong, false, port, "/", false, Arc::new(Echo))
            .await
            .expect("echo site");
        let driver = EventDriver::new(&config);
        assert!(driver.register_sites(&server, port, "/events").await);
        assert!(server.run().await);
        Self { server, driver, port }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://127.0.0.1:{}{}", self.port, path)
    }

    pub async fn stop(&self) {
        self.driver.stop();
        self.server.stop_server().await;
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
