//! HTTP server engine.
//!
//! # Responsibilities
//! - Own the request queue, the worker pool and the site/URL group registries
//! - Drive the request lifecycle: start hook, site handler, cleanup hook
//! - Hand upgraded connections to WebSockets, keep event streams open
//! - Tear everything down in a fixed order on `stop_server`
//!
//! # State machine
//! ```text
//! Uninitialized ─initialize─▶ Initialized ─run─▶ Running ─stop_server─▶ Stopping ─▶ Uninitialized
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use hyper::StatusCode;
use hyper_util::rt::TokioIo;
use serde::Serialize;

use crate::config::schema::ServerConfig;
use crate::config::validate_config;
use crate::events::sse::{EventStream, ServerEvent};
use crate::http::message::{HttpMessage, PendingUpgrade};
use crate::http::pool::{PoolStatus, ThreadPool, WorkHandler, WorkItem, WorkSubmitter};
use crate::http::queue::{QueuedRequest, RequestQueue};
use crate::http::request::{Request, RequestId, RequestTable};
use crate::http::site::{is_allowed_port, normalize_base, ChannelType, Site, SiteHandler, SiteRegistry, SiteStatus, UrlPrefix};
use crate::http::url_group::{AuthConfig, UrlGroup};
use crate::lifecycle::Shutdown;
use crate::net::listener::ListenerError;
use crate::observability::logging;
use crate::websocket::frame::CLOSE_GOINGAWAY;
use crate::websocket::handshake::HandshakeError;
use crate::websocket::socket::WebSocket;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server is not initialized")]
    NotInitialized,

    #[error("Port {0} is not allowed for a site")]
    PortNotAllowed(u16),

    #[error("Main site not found for port {port} base {base}")]
    MainSiteNotFound { port: u16, base: String },

    #[error("Site already registered: {0}")]
    SiteExists(String),

    #[error("URL group '{0}' failed to start")]
    GroupStart(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read request body: {0}")]
    Body(String),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("Lock poisoned: {0}")]
    Poisoned(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Uninitialized,
    Initialized,
    Running,
    Stopping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub ports: Vec<u16>,
    pub sites: usize,
    pub groups: usize,
    pub requests: usize,
    pub sockets: usize,
    pub streams: usize,
    pub connections: u64,
    pub pool: PoolStatus,
}

pub struct HttpServer {
    config: ServerConfig,
    state: RwLock<ServerState>,
    queue: RwLock<Option<Arc<RequestQueue>>>,
    pool: ThreadPool,
    sites: RwLock<SiteRegistry>,
    groups: RwLock<Vec<Arc<UrlGroup>>>,
    requests: RequestTable,
    sockets: DashMap<u64, Arc<WebSocket>>,
    streams: DashMap<u64, Arc<EventStream>>,
    next_socket: AtomicU64,
    running: AtomicBool,
    shutdown: Shutdown,
    me: Weak<HttpServer>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("name", &self.config.server.name)
            .field("state", &self.state())
            .finish()
    }
}

impl HttpServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let workers = config.server.worker_threads;
        Arc::new_cyclic(|me| Self {
            config,
            state: RwLock::new(ServerState::Uninitialized),
            queue: RwLock::new(None),
            pool: ThreadPool::new(workers),
            sites: RwLock::new(SiteRegistry::new()),
            groups: RwLock::new(Vec::new()),
            requests: RequestTable::new(),
            sockets: DashMap::new(),
            streams: DashMap::new(),
            next_socket: AtomicU64::new(1),
            running: AtomicBool::new(false),
            shutdown: Shutdown::new(),
            me: me.clone(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Fires when `stop_server` begins; background tasks tied to the
    /// server subscribe here.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn state(&self) -> ServerState {
        self.state.read().map(|s| *s).unwrap_or(ServerState::Uninitialized)
    }

    fn set_state(&self, state: ServerState) {
        if let Ok(mut current) = self.state.write() {
            *current = state;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> Option<Arc<RequestQueue>> {
        self.queue.read().ok().and_then(|q| q.clone())
    }

    /// Bring the server to `Initialized`. Succeeds at once if it already is.
    pub fn initialize(&self) -> bool {
        match self.state() {
            ServerState::Uninitialized => {}
            ServerState::Stopping => return false,
            _ => return true,
        }

        logging::init_logging(&self.config.observability);

        if let Err(errors) = validate_config(&self.config) {
            for error in &errors {
                tracing::error!(error = %error, "Invalid configuration");
            }
            return false;
        }

        let settings = &self.config.server;
        let queue = match RequestQueue::create(&settings.name, &settings.bind_host, settings.max_connections) {
            Ok(queue) => queue,
            Err(e) => {
                tracing::error!(operation = "create_queue", error = %e, "Failed to create request queue");
                self.cleanup();
                return false;
            }
        };
        match self.queue.write() {
            Ok(mut slot) => *slot = Some(Arc::clone(&queue)),
            Err(_) => {
                tracing::error!(operation = "create_queue", "Queue slot poisoned");
                queue.close();
                return false;
            }
        }

        self.pool.associate(&queue);

        let applied = queue.set_queue_length(settings.queue_length);
        if !queue.set_verbosity(settings.verbosity_503) {
            tracing::warn!(operation = "set_verbosity", "Could not set 503 verbosity, keeping default");
        }

        let handler: Weak<dyn WorkHandler> = self.me.clone();
        if !self.pool.start(handler) {
            tracing::debug!(operation = "start_pool", "Thread pool already running");
        }

        self.shutdown.reset();
        self.set_state(ServerState::Initialized);
        tracing::info!(
            name = %settings.name,
            queue_length = applied,
            workers = self.pool.workers(),
            "HTTP server initialized"
        );
        true
    }

    /// Start listening on every port with a registered site.
    pub async fn run(&self) -> bool {
        if !self.initialize() {
            return false;
        }
        let Some(queue) = self.queue() else {
            return false;
        };
        let ok = queue.start_listening().await;
        self.running.store(true, Ordering::SeqCst);
        self.set_state(ServerState::Running);
        tracing::info!(ports = ?queue.ports(), "HTTP server running");
        ok
    }

    /// Register a site with anonymous authentication.
    pub async fn create_site(
        self: &Arc<Self>,
        channel_type: ChannelType,
        secure: bool,
        port: u16,
        base: &str,
        subsite: bool,
        handler: Arc<dyn SiteHandler>,
    ) -> Option<Arc<Site>> {
        self.create_site_with_auth(channel_type, secure, port, base, subsite, handler, AuthConfig::default())
            .await
    }

    /// Register a site. Configured overrides win over the arguments.
    /// Nothing stays registered when this returns `None`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_site_with_auth(
        self: &Arc<Self>,
        channel_type: ChannelType,
        secure: bool,
        port: u16,
        base: &str,
        subsite: bool,
        handler: Arc<dyn SiteHandler>,
        auth: AuthConfig,
    ) -> Option<Arc<Site>> {
        match self
            .try_create_site(channel_type, secure, port, base, subsite, handler, auth)
            .await
        {
            Ok(site) => Some(site),
            Err(e) => {
                tracing::error!(port, base, error = %e, "Failed to create site");
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn try_create_site(
        &self,
        channel_type: ChannelType,
        secure: bool,
        port: u16,
        base: &str,
        subsite: bool,
        handler: Arc<dyn SiteHandler>,
        auth: AuthConfig,
    ) -> Result<Arc<Site>, ServerError> {
        let settings = &self.config.server;
        let channel_type = settings.channel_type.unwrap_or(channel_type);
        let secure = settings.secure.unwrap_or(secure);
        let base = normalize_base(settings.base_url.as_deref().unwrap_or(base));
        let port = match settings.port {
            Some(configured) if is_allowed_port(configured) => configured,
            _ => port,
        };
        if !is_allowed_port(port) {
            return Err(ServerError::PortNotAllowed(port));
        }

        let queue = self.queue().ok_or(ServerError::NotInitialized)?;

        let main = if subsite {
            let sites = self.sites.read().map_err(|_| ServerError::Poisoned("sites"))?;
            let main = sites.find_main_site(port, &base).ok_or_else(|| ServerError::MainSiteNotFound {
                port,
                base: base.clone(),
            })?;
            Some(main)
        } else {
            None
        };

        let prefix = UrlPrefix::new(channel_type, secure, port, &base, &queue.bind_host().to_string());
        let group = self
            .find_url_group(&auth)
            .ok_or_else(|| ServerError::GroupStart(auth.name.clone()))?;
        let site = Arc::new(Site::new(prefix.clone(), main.as_ref(), Arc::clone(&group), handler));

        {
            let mut sites = self.sites.write().map_err(|_| ServerError::Poisoned("sites"))?;
            if !sites.insert(Arc::clone(&site)) {
                drop(sites);
                self.release_group(&group);
                return Err(ServerError::SiteExists(prefix.to_string()));
            }
        }

        if !queue.add_url(prefix.clone(), Arc::clone(&group)) {
            self.rollback_site(&queue, &site, false);
            return Err(ServerError::SiteExists(prefix.to_string()));
        }
        if !site.start() {
            self.rollback_site(&queue, &site, true);
            return Err(ServerError::GroupStart(group.auth().name.clone()));
        }

        if queue.is_listening() {
            if let Err(e) = queue.listen(port).await {
                self.rollback_site(&queue, &site, true);
                return Err(e);
            }
        }

        tracing::info!(
            prefix = %prefix,
            subsite,
            authentication = group.scheme().as_str(),
            "Site registered"
        );
        Ok(site)
    }

    fn rollback_site(&self, queue: &RequestQueue, site: &Arc<Site>, bound: bool) {
        site.stop();
        if bound {
            queue.remove_url(site.prefix());
        }
        if let Ok(mut sites) = self.sites.write() {
            sites.remove(site.port(), site.base());
        }
        self.release_group(site.group());
    }

    /// Delete a site. A main site with sub-sites needs `force`.
    pub fn delete_site(&self, port: u16, base: &str, force: bool) -> bool {
        let site = {
            let Ok(mut sites) = self.sites.write() else {
                return false;
            };
            let Some(site) = sites.get(port, base) else {
                tracing::warn!(port, base, "Site not found");
                return false;
            };
            if !force && sites.has_dependents(&site) {
                tracing::warn!(prefix = %site.prefix(), "Site still has sub-sites");
                return false;
            }
            sites.remove(port, base);
            site
        };
        site.stop();
        if let Some(queue) = self.queue() {
            queue.remove_url(site.prefix());
        }
        self.release_group(site.group());
        tracing::info!(prefix = %site.prefix(), forced = force, "Site deleted");
        true
    }

    pub fn site(&self, port: u16, base: &str) -> Option<Arc<Site>> {
        self.sites.read().ok().and_then(|sites| sites.get(port, base))
    }

    pub fn sites(&self) -> Vec<SiteStatus> {
        self.sites
            .read()
            .map(|sites| sites.all().iter().map(|s| s.status()).collect())
            .unwrap_or_default()
    }

    /// Group with exactly this authentication, created and started on
    /// first use. `None` if a new group fails to start.
    pub fn find_url_group(&self, auth: &AuthConfig) -> Option<Arc<UrlGroup>> {
        let mut groups = self.groups.write().ok()?;
        if let Some(group) = groups.iter().find(|g| g.matches(auth)) {
            return Some(Arc::clone(group));
        }
        let group = Arc::new(UrlGroup::new(auth.clone()));
        if !group.start() {
            return None;
        }
        groups.push(Arc::clone(&group));
        tracing::debug!(group = %auth.name, scheme = auth.scheme.as_str(), "URL group created");
        Some(group)
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().map(|g| g.len()).unwrap_or(0)
    }

    /// Drop a group once no prefix uses it.
    fn release_group(&self, group: &Arc<UrlGroup>) {
        if group.prefix_count() > 0 {
            return;
        }
        let in_use = self
            .sites
            .read()
            .map(|sites| sites.all().iter().any(|s| Arc::ptr_eq(s.group(), group)))
            .unwrap_or(true);
        if in_use {
            return;
        }
        if let Ok(mut groups) = self.groups.write() {
            groups.retain(|g| !Arc::ptr_eq(g, group));
        }
        group.stop();
    }

    pub fn status(&self) -> ServerStatus {
        let queue = self.queue();
        ServerStatus {
            name: self.config.server.name.clone(),
            state: self.state(),
            ports: queue.as_ref().map(|q| q.ports()).unwrap_or_default(),
            sites: self.sites.read().map(|s| s.len()).unwrap_or(0),
            groups: self.group_count(),
            requests: self.requests.len(),
            sockets: self.sockets.len(),
            streams: self.streams.len(),
            connections: queue.as_ref().map(|q| q.active_connections()).unwrap_or(0),
            pool: self.pool.status(),
        }
    }

    /// One request, from the worker that picked it up until its response
    /// is out. Upgraded connections continue in their own task.
    async fn serve_request(self: Arc<Self>, queued: QueuedRequest) {
        let QueuedRequest {
            id,
            request,
            remote,
            prefix,
            reply,
            ..
        } = queued;
        let entry = self.requests.register(id, &prefix);
        let site = self.sites.read().ok().and_then(|sites| sites.find_by_prefix(&prefix));

        let mut message = HttpMessage::new(id, request, Some(remote));
        let settings = &self.config.server;
        message.attach(reply, &prefix, settings.max_body_size, settings.max_json_depth);

        match site {
            Some(site) if site.is_started() => {
                site.record_request();
                if let Some(handler) = site.handler() {
                    handler.handle(&mut message).await;
                }
            }
            Some(_) => message.set_status(StatusCode::SERVICE_UNAVAILABLE),
            None => {
                tracing::debug!(request_id = %id, prefix = %prefix, "No site for prefix");
                message.set_status(StatusCode::NOT_FOUND);
            }
        }

        let upgrade = message.take_upgrade();
        if !message.is_answered() && !message.send_response() {
            tracing::debug!(request_id = %id, "Client went away before the response");
        }

        if let Some(upgrade) = upgrade {
            entry.mark_upgraded();
            self.spawn_socket(entry, upgrade);
        } else if let Some(stream) = message.event_stream().cloned() {
            entry.mark_upgraded();
            self.spawn_stream(entry, stream);
        } else {
            entry.set_active(false);
        }
    }

    fn spawn_socket(&self, entry: Arc<Request>, upgrade: PendingUpgrade) {
        let key = self.next_socket.fetch_add(1, Ordering::Relaxed);
        self.sockets.insert(key, Arc::clone(&upgrade.socket));
        let server = self.me.clone();
        tokio::spawn(async move {
            let PendingUpgrade {
                socket,
                outbound,
                on_upgrade,
            } = upgrade;
            match on_upgrade.await {
                Ok(upgraded) => Arc::clone(&socket).serve(TokioIo::new(upgraded), outbound).await,
                Err(e) => {
                    tracing::warn!(uri = %socket.uri(), error = %e, "WebSocket upgrade failed");
                    socket.close_socket(CLOSE_GOINGAWAY, "upgrade failed");
                }
            }
            if let Some(server) = server.upgrade() {
                server.sockets.remove(&key);
                server.finish_request(&entry);
            }
        });
    }

    fn spawn_stream(&self, entry: Arc<Request>, stream: Arc<EventStream>) {
        self.streams.insert(stream.id(), Arc::clone(&stream));
        let server = self.me.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stream.wait_closed() => {}
                _ = entry.aborted() => stream.close(),
            }
            if let Some(server) = server.upgrade() {
                server.streams.remove(&stream.id());
                server.finish_request(&entry);
            }
        });
    }

    /// The transport of an upgraded request is gone; hand it back to the
    /// cleanup hook.
    fn finish_request(&self, entry: &Request) {
        entry.set_active(false);
        let id = entry.id();
        if !self.submit_work(WorkItem::CancelRequest { id, forced: false }) {
            self.requests.cleanup(id, false, false);
        }
    }

    /// Stop the server. Only the first call does anything.
    pub async fn stop_server(&self) -> bool {
        {
            let Ok(mut state) = self.state.write() else {
                return false;
            };
            match *state {
                ServerState::Uninitialized | ServerState::Stopping => return false,
                _ => *state = ServerState::Stopping,
            }
        }
        tracing::info!(name = %self.config.server.name, "Stopping HTTP server");

        let sockets: Vec<Arc<WebSocket>> = self.sockets.iter().map(|s| Arc::clone(s.value())).collect();
        for socket in &sockets {
            socket.close_socket(CLOSE_GOINGAWAY, "Server shutting down");
        }

        let streams: Vec<Arc<EventStream>> = self.streams.iter().map(|s| Arc::clone(s.value())).collect();
        for stream in &streams {
            stream.send_event(&ServerEvent::new("close", stream.last_event() + 1, "Server shutting down"));
            stream.close();
        }

        self.shutdown.trigger();
        self.running.store(false, Ordering::SeqCst);

        if let Some(queue) = self.queue() {
            let dropped = queue.cancel_all().await;
            if dropped > 0 {
                tracing::info!(dropped, "Queued requests cancelled");
            }
            queue.shutdown().await;
        }
        self.pool.stop().await;
        self.cleanup();
        tracing::info!(
            sockets = sockets.len(),
            streams = streams.len(),
            "HTTP server stopped"
        );
        true
    }

    /// Release sites, groups, requests and the queue. Safe to call any
    /// number of times.
    pub fn cleanup(&self) {
        let queue = self.queue.write().ok().and_then(|mut q| q.take());
        let sites = self.sites.write().map(|mut s| s.drain()).unwrap_or_default();
        for site in &sites {
            site.stop();
            if let Some(queue) = &queue {
                queue.remove_url(site.prefix());
            }
        }
        if let Ok(mut groups) = self.groups.write() {
            for group in groups.drain(..) {
                group.stop();
            }
        }
        let aborted = self.requests.abort_all();
        if aborted > 0 {
            tracing::debug!(aborted, "Outstanding requests aborted");
        }
        if let Some(queue) = queue {
            queue.close();
        }
        self.running.store(false, Ordering::SeqCst);
        self.set_state(ServerState::Uninitialized);
    }
}

impl WorkHandler for HttpServer {
    fn start_request(&self, request: QueuedRequest) -> BoxFuture<'static, ()> {
        let server = self.me.upgrade();
        Box::pin(async move {
            if let Some(server) = server {
                server.serve_request(request).await;
            }
        })
    }

    fn cleanup_request(&self, id: RequestId, stay: bool, forced: bool) -> bool {
        self.requests.cleanup(id, stay, forced)
    }
}

impl WorkSubmitter for HttpServer {
    fn submit_work(&self, item: WorkItem) -> bool {
        self.pool.submit_work(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::url_group::AuthScheme;

    fn handler() -> Arc<dyn SiteHandler> {
        Arc::new(|message: &mut HttpMessage| message.set_text("ok"))
    }

    fn server() -> Arc<HttpServer> {
        let mut config = ServerConfig::default();
        config.server.bind_host = "127.0.0.1".to_string();
        config.server.worker_threads = 2;
        HttpServer::new(config)
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let server = server();
        assert_eq!(server.state(), ServerState::Uninitialized);
        assert!(server.initialize());
        assert!(server.initialize());
        assert_eq!(server.state(), ServerState::Initialized);
        server.cleanup();
        server.cleanup();
        assert_eq!(server.state(), ServerState::Uninitialized);
    }

    #[tokio::test]
    async fn test_initialize_rejects_invalid_config() {
        let mut config = ServerConfig::default();
        config.server.worker_threads = 0;
        let server = HttpServer::new(config);
        assert!(!server.initialize());
        assert!(server.queue().is_none());
    }

    #[tokio::test]
    async fn test_site_ports() {
        let server = server();
        assert!(server.initialize());
        assert!(server
            .create_site(ChannelType::Strong, false, 80, "/", false, handler())
            .await
            .is_some());
        assert!(server
            .create_site(ChannelType::Strong, false, 500, "/other", false, handler())
            .await
            .is_none());
        assert_eq!(server.sites().len(), 1);
        server.cleanup();
    }

    #[tokio::test]
    async fn test_subsite_needs_main_site() {
        let server = server();
        assert!(server.initialize());
        assert!(server
            .create_site(ChannelType::Strong, false, 8080, "/app/sub", true, handler())
            .await
            .is_none());
        let main = server
            .create_site(ChannelType::Strong, false, 8080, "/app", false, handler())
            .await
            .unwrap();
        let sub = server
            .create_site(ChannelType::Strong, false, 8080, "/app/sub", true, handler())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&sub.main_site().unwrap(), &main));

        assert!(!server.delete_site(8080, "/app", false));
        assert!(server.delete_site(8080, "/app/sub", false));
        assert!(server.delete_site(8080, "/app", false));
        assert!(!server.delete_site(8080, "/app", false));
        assert_eq!(server.group_count(), 0);
        server.cleanup();
    }

    #[tokio::test]
    async fn test_duplicate_site_leaves_nothing_behind() {
        let server = server();
        assert!(server.initialize());
        assert!(server
            .create_site(ChannelType::Strong, false, 8080, "/app", false, handler())
            .await
            .is_some());
        assert!(server
            .create_site(ChannelType::Strong, false, 8080, "app/", false, handler())
            .await
            .is_none());
        assert_eq!(server.sites().len(), 1);
        assert_eq!(server.group_count(), 1);
        server.cleanup();
    }

    #[tokio::test]
    async fn test_url_groups_are_shared_by_auth() {
        let server = server();
        assert!(server.initialize());
        let basic = AuthConfig {
            name: "users".to_string(),
            scheme: AuthScheme::Basic,
            realm: "events".to_string(),
            ..AuthConfig::default()
        };
        let first = server.find_url_group(&basic).unwrap();
        let second = server.find_url_group(&basic).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &server.find_url_group(&AuthConfig::default()).unwrap()));

        let no_realm = AuthConfig {
            scheme: AuthScheme::Basic,
            ..AuthConfig::default()
        };
        assert!(server.find_url_group(&no_realm).is_none());
        assert_eq!(server.group_count(), 2);
        server.cleanup();
    }

    #[tokio::test]
    async fn test_site_override_from_config() {
        let mut config = ServerConfig::default();
        config.server.bind_host = "127.0.0.1".to_string();
        config.server.port = Some(8085);
        config.server.base_url = Some("/events".to_string());
        let server = HttpServer::new(config);
        assert!(server.initialize());
        let site = server
            .create_site(ChannelType::Strong, false, 8080, "/ignored", false, handler())
            .await
            .unwrap();
        assert_eq!(site.port(), 8085);
        assert_eq!(site.base(), "/events/");
        server.cleanup();
    }

    #[tokio::test]
    async fn test_stop_server_is_one_shot() {
        let server = server();
        assert!(!server.stop_server().await);
        assert!(server.initialize());
        assert!(server.stop_server().await);
        assert!(!server.stop_server().await);
        assert_eq!(server.state(), ServerState::Uninitialized);
        assert!(server.shutdown().is_triggered());
    }
}
