//! Request queue: listening ports, prefix matching and the backlog.
//!
//! # Responsibilities
//! - Bind one listener per port carrying registered URL prefixes
//! - Serve HTTP/1.1 (with upgrades) through hyper on each connection
//! - Route each request to the best prefix, enforce Basic authentication
//! - Queue accepted requests for the worker pool; 503 when the backlog is full
//! - Cancel everything outstanding on shutdown
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → hyper http1 (per connection task)
//!     → dispatch (prefix match, auth, backlog check)
//!     → QueuedRequest over mpsc → worker pool (read_next)
//!     → response back through a oneshot
//! ```

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use axum::body::Body;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::schema::{Verbosity503, MAX_QUEUE_LENGTH, MIN_QUEUE_LENGTH};
use crate::http::request::RequestId;
use crate::http::server::ServerError;
use crate::http::site::UrlPrefix;
use crate::http::url_group::UrlGroup;
use crate::net::{ConnectionTracker, Listener};
use crate::net::listener::ConnectionPermit;
use crate::observability::metrics;

/// Sends the response of one queued request back to its connection.
#[derive(Debug)]
pub struct ResponseHandle(oneshot::Sender<Response<Body>>);

impl ResponseHandle {
    pub fn channel() -> (Self, oneshot::Receiver<Response<Body>>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    /// Returns false if the connection is gone.
    pub fn send(self, response: Response<Body>) -> bool {
        self.0.send(response).is_ok()
    }
}

/// A request accepted by the queue, waiting for a worker.
#[derive(Debug)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub request: Request<Body>,
    pub remote: SocketAddr,
    pub local_port: u16,
    pub prefix: String,
    pub reply: ResponseHandle,
    pub queued_at: Instant,
}

#[derive(Debug, Clone)]
struct PrefixEntry {
    prefix: UrlPrefix,
    group: Arc<UrlGroup>,
}

struct PortListener {
    task: JoinHandle<()>,
    tracker: ConnectionTracker,
}

/// Resolve once `rx` reports cancellation.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancelled| *cancelled).await;
}

fn plain_response(status: StatusCode, text: String) -> Response<Body> {
    let mut response = Response::new(Body::from(text));
    *response.status_mut() = status;
    response
}

/// Host name of a request without the port.
fn request_host(request: &Request<Body>) -> String {
    let raw = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().host())
        .unwrap_or_default();
    if let Some(rest) = raw.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default().to_string();
    }
    raw.split(':').next().unwrap_or_default().to_string()
}

pub struct RequestQueue {
    name: String,
    bind_host: IpAddr,
    max_connections: usize,
    tx: mpsc::UnboundedSender<QueuedRequest>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueuedRequest>>,
    pending: AtomicUsize,
    queue_length: AtomicU32,
    verbosity: RwLock<Verbosity503>,
    prefixes: RwLock<Vec<PrefixEntry>>,
    listeners: Mutex<HashMap<u16, PortListener>>,
    listening: AtomicBool,
    cancelled: watch::Sender<bool>,
    me: Weak<RequestQueue>,
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl RequestQueue {
    pub fn create(name: &str, bind_host: &str, max_connections: usize) -> Result<Arc<Self>, ServerError> {
        let bind_host: IpAddr = bind_host
            .parse()
            .map_err(|_| ServerError::Config(format!("invalid bind host '{bind_host}'")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancelled, _) = watch::channel(false);
        let queue = Arc::new_cyclic(|me| Self {
            name: name.to_string(),
            bind_host,
            max_connections,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            pending: AtomicUsize::new(0),
            queue_length: AtomicU32::new(64),
            verbosity: RwLock::new(Verbosity503::Basic),
            prefixes: RwLock::new(Vec::new()),
            listeners: Mutex::new(HashMap::new()),
            listening: AtomicBool::new(false),
            cancelled,
            me: me.clone(),
        });
        tracing::debug!(queue = %name, "Request queue created");
        Ok(queue)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind_host(&self) -> IpAddr {
        self.bind_host
    }

    /// Set the backlog length, clamped to the supported range. Returns
    /// the value applied.
    pub fn set_queue_length(&self, length: u32) -> u32 {
        let clamped = length.clamp(MIN_QUEUE_LENGTH, MAX_QUEUE_LENGTH);
        if clamped != length {
            tracing::warn!(requested = length, applied = clamped, "Queue length clamped");
        }
        self.queue_length.store(clamped, Ordering::SeqCst);
        clamped
    }

    pub fn queue_length(&self) -> u32 {
        self.queue_length.load(Ordering::SeqCst)
    }

    pub fn set_verbosity(&self, verbosity: Verbosity503) -> bool {
        match self.verbosity.write() {
            Ok(mut current) => {
                *current = verbosity;
                true
            }
            Err(_) => false,
        }
    }

    pub fn verbosity(&self) -> Verbosity503 {
        self.verbosity.read().map(|v| *v).unwrap_or_default()
    }

    /// Requests waiting for a worker.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.prefixes
            .read()
            .map(|p| p.iter().map(|e| e.prefix.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self
            .prefixes
            .read()
            .map(|p| p.iter().map(|e| e.prefix.port).collect())
            .unwrap_or_default();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub fn active_connections(&self) -> u64 {
        self.listeners
            .lock()
            .map(|l| l.values().map(|p| p.tracker.active_count()).sum())
            .unwrap_or(0)
    }

    /// Register a prefix. Returns false if it is already registered.
    pub fn add_url(&self, prefix: UrlPrefix, group: Arc<UrlGroup>) -> bool {
        let Ok(mut prefixes) = self.prefixes.write() else {
            return false;
        };
        if prefixes.iter().any(|e| e.prefix == prefix) {
            tracing::warn!(prefix = %prefix, "URL prefix already registered");
            return false;
        }
        group.add_prefix(prefix.clone());
        tracing::info!(prefix = %prefix, queue = %self.name, "URL prefix registered");
        prefixes.push(PrefixEntry { prefix, group });
        true
    }

    /// Unregister a prefix; stops the port listener once its last prefix is gone.
    pub fn remove_url(&self, prefix: &UrlPrefix) -> bool {
        let (removed, port_in_use) = match self.prefixes.write() {
            Ok(mut prefixes) => {
                let before = prefixes.len();
                prefixes.retain(|e| {
                    if e.prefix == *prefix {
                        e.group.remove_prefix(prefix);
                        false
                    } else {
                        true
                    }
                });
                let in_use = prefixes.iter().any(|e| e.prefix.port == prefix.port);
                (prefixes.len() != before, in_use)
            }
            Err(_) => (false, true),
        };
        if removed && !port_in_use {
            self.stop_listener(prefix.port);
        }
        removed
    }

    fn stop_listener(&self, port: u16) {
        if let Ok(mut listeners) = self.listeners.lock() {
            if let Some(listener) = listeners.remove(&port) {
                listener.task.abort();
                tracing::info!(port, "Listener stopped");
            }
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Bind every port with registered prefixes and keep binding ports
    /// added later. Returns false if any port failed to bind.
    pub async fn start_listening(&self) -> bool {
        self.listening.store(true, Ordering::SeqCst);
        let mut ok = true;
        for port in self.ports() {
            if let Err(e) = self.listen(port).await {
                tracing::error!(port, error = %e, "Failed to listen");
                ok = false;
            }
        }
        ok
    }

    /// Bind `port` unless it is bound already.
    pub async fn listen(&self, port: u16) -> Result<(), ServerError> {
        if self.listeners.lock().map(|l| l.contains_key(&port)).unwrap_or(false) {
            return Ok(());
        }
        let listener = Listener::bind(SocketAddr::new(self.bind_host, port), self.max_connections).await?;
        let tracker = ConnectionTracker::new();
        let task = tokio::spawn(accept_loop(
            self.me.clone(),
            listener,
            port,
            tracker.clone(),
            self.cancelled.subscribe(),
        ));
        match self.listeners.lock() {
            Ok(mut listeners) => {
                if let Some(previous) = listeners.insert(port, PortListener { task, tracker }) {
                    previous.task.abort();
                }
                Ok(())
            }
            Err(_) => {
                task.abort();
                Err(ServerError::Poisoned("listeners"))
            }
        }
    }

    /// Best prefix for a request, by precedence then base length.
    fn match_prefix(&self, host: &str, port: u16, path: &str) -> Option<PrefixEntry> {
        let prefixes = self.prefixes.read().ok()?;
        prefixes
            .iter()
            .filter_map(|e| e.prefix.rank(host, port, path).map(|rank| (rank, e)))
            .max_by_key(|(rank, _)| *rank)
            .map(|(_, e)| e.clone())
    }

    fn unavailable(&self, reason: &'static str) -> Response<Body> {
        metrics::record_queue_rejection(reason);
        let text = match self.verbosity() {
            Verbosity503::Basic => String::new(),
            Verbosity503::Limited => "Service unavailable".to_string(),
            Verbosity503::Full => format!(
                "Service unavailable: {} (queue '{}', {} pending of {})",
                reason,
                self.name,
                self.pending(),
                self.queue_length()
            ),
        };
        plain_response(StatusCode::SERVICE_UNAVAILABLE, text)
    }

    /// Route one request and wait for the worker's response.
    pub async fn dispatch(&self, request: Request<Body>, remote: SocketAddr, local_port: u16) -> Response<Body> {
        let start = Instant::now();
        let response = self.route(request, remote, local_port).await;
        metrics::record_request(response.status().as_u16(), start);
        response
    }

    async fn route(&self, request: Request<Body>, remote: SocketAddr, local_port: u16) -> Response<Body> {
        if self.is_cancelled() {
            return self.unavailable("shutting down");
        }

        let host = request_host(&request);
        let Some(entry) = self.match_prefix(&host, local_port, request.uri().path()) else {
            metrics::record_queue_rejection("not_found");
            tracing::debug!(host = %host, path = %request.uri().path(), "No URL prefix matched");
            return plain_response(StatusCode::NOT_FOUND, String::new());
        };

        let authorization = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !entry.group.authorize(authorization) {
            metrics::record_queue_rejection("unauthorized");
            let mut response = plain_response(StatusCode::UNAUTHORIZED, String::new());
            if let Ok(challenge) = HeaderValue::from_str(&entry.group.challenge()) {
                response.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
            }
            return response;
        }

        let limit = self.queue_length() as usize;
        if self.pending.fetch_add(1, Ordering::SeqCst) >= limit {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(queue = %self.name, limit, "Request queue full");
            return self.unavailable("queue full");
        }

        let (reply, rx) = ResponseHandle::channel();
        let queued = QueuedRequest {
            id: RequestId::new(),
            request,
            remote,
            local_port,
            prefix: entry.prefix.to_string(),
            reply,
            queued_at: Instant::now(),
        };
        if self.tx.send(queued).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return self.unavailable("queue closed");
        }

        match rx.await {
            Ok(response) => response,
            Err(_) => self.unavailable("request cancelled"),
        }
    }

    /// Next queued request, or `None` once the queue is cancelled.
    pub async fn read_next(&self) -> Option<QueuedRequest> {
        let mut cancel = self.cancelled.subscribe();
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => None,
            item = rx.recv() => {
                let item = item?;
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Some(item)
            }
        }
    }

    /// Cancel all outstanding I/O: waiting requests get 503, readers and
    /// connections wind down. Returns the number of requests dropped.
    pub async fn cancel_all(&self) -> usize {
        self.cancelled.send_replace(true);
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while let Ok(item) = rx.try_recv() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!(request_id = %item.id, "Queued request cancelled");
            dropped += 1;
        }
        dropped
    }

    /// Stop every listener and wait briefly for connections to drain.
    pub async fn shutdown(&self) {
        self.listening.store(false, Ordering::SeqCst);
        let listeners: Vec<PortListener> = match self.listeners.lock() {
            Ok(mut listeners) => listeners.drain().map(|(_, l)| l).collect(),
            Err(_) => Vec::new(),
        };
        for listener in listeners {
            listener.task.abort();
            if !listener.tracker.wait_for_drain(Duration::from_secs(5)).await {
                tracing::warn!(
                    remaining = listener.tracker.active_count(),
                    "Connections still open after shutdown"
                );
            }
        }
        tracing::info!(queue = %self.name, "Request queue shut down");
    }

    /// Drop all prefixes. The queue cannot be used afterwards.
    pub fn close(&self) {
        if let Ok(mut prefixes) = self.prefixes.write() {
            for entry in prefixes.drain(..) {
                entry.group.remove_prefix(&entry.prefix);
            }
        }
        if let Ok(mut listeners) = self.listeners.lock() {
            for (_, listener) in listeners.drain() {
                listener.task.abort();
            }
        }
        self.cancelled.send_replace(true);
    }
}

async fn accept_loop(
    queue: Weak<RequestQueue>,
    listener: Listener,
    port: u16,
    tracker: ConnectionTracker,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote, permit)) => {
                    tokio::spawn(serve_connection(
                        queue.clone(),
                        stream,
                        remote,
                        port,
                        permit,
                        tracker.clone(),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(port, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
    tracing::debug!(port, "Accept loop finished");
}

async fn serve_connection(
    queue: Weak<RequestQueue>,
    stream: TcpStream,
    remote: SocketAddr,
    port: u16,
    _permit: ConnectionPermit,
    tracker: ConnectionTracker,
    mut cancel: watch::Receiver<bool>,
) {
    let guard = tracker.track();
    let service = service_fn(move |request: Request<Incoming>| {
        let queue = queue.clone();
        async move {
            let response = match queue.upgrade() {
                Some(queue) => queue.dispatch(request.map(Body::new), remote, port).await,
                None => plain_response(StatusCode::SERVICE_UNAVAILABLE, String::new()),
            };
            Ok::<_, Infallible>(response)
        }
    });

    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(connection);

    tokio::select! {
        result = connection.as_mut() => {
            if let Err(e) = result {
                tracing::debug!(connection_id = %guard.id(), error = %e, "Connection error");
            }
        }
        _ = cancelled(&mut cancel) => {
            connection.as_mut().graceful_shutdown();
            if tokio::time::timeout(Duration::from_secs(5), connection.as_mut()).await.is_err() {
                tracing::debug!(connection_id = %guard.id(), "Connection did not drain in time");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ChannelType;
    use crate::http::url_group::{AuthConfig, AuthScheme};

    fn queue() -> Arc<RequestQueue> {
        RequestQueue::create("test", "127.0.0.1", 16).unwrap()
    }

    fn prefix(base: &str) -> UrlPrefix {
        UrlPrefix::new(ChannelType::Strong, false, 8080, base, "127.0.0.1")
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(header::HOST, "localhost:8080")
            .body(Body::empty())
            .unwrap()
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_queue_length_clamped() {
        let queue = queue();
        assert_eq!(queue.set_queue_length(0), 1);
        assert_eq!(queue.set_queue_length(100_000), 65_535);
        assert_eq!(queue.set_queue_length(10), 10);
    }

    #[test]
    fn test_duplicate_prefix_rejected() {
        let queue = queue();
        let group = Arc::new(UrlGroup::new(AuthConfig::default()));
        assert!(queue.add_url(prefix("/app"), group.clone()));
        assert!(!queue.add_url(prefix("/app/"), group.clone()));
        assert_eq!(group.prefix_count(), 1);
        assert!(queue.remove_url(&prefix("/app")));
        assert!(group.is_empty());
        assert!(!queue.remove_url(&prefix("/app")));
    }

    #[test]
    fn test_request_host() {
        assert_eq!(request_host(&request("/")), "localhost");
        let v6 = Request::builder()
            .header(header::HOST, "[::1]:8080")
            .body(Body::empty())
            .unwrap();
        assert_eq!(request_host(&v6), "::1");
    }

    #[tokio::test]
    async fn test_unmatched_request_is_404() {
        let queue = queue();
        queue.add_url(prefix("/app"), Arc::new(UrlGroup::new(AuthConfig::default())));
        let response = queue.dispatch(request("/other"), remote(), 8080).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_basic_auth_challenge() {
        let queue = queue();
        let group = Arc::new(UrlGroup::new(AuthConfig {
            name: "basic".to_string(),
            scheme: AuthScheme::Basic,
            realm: "events".to_string(),
            ..AuthConfig::default()
        }));
        queue.add_url(prefix("/"), group);
        let response = queue.dispatch(request("/x"), remote(), 8080).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Basic realm=\"events\"");
    }

    #[tokio::test]
    async fn test_dispatch_and_read_next() {
        let queue = queue();
        queue.add_url(prefix("/"), Arc::new(UrlGroup::new(AuthConfig::default())));

        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let item = queue.read_next().await.unwrap();
                assert_eq!(item.prefix, "http://+:8080/");
                item.reply.send(plain_response(StatusCode::ACCEPTED, String::new()));
            })
        };
        let response = queue.dispatch(request("/hello"), remote(), 8080).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        worker.await.unwrap();
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_full_backlog_is_503() {
        let queue = queue();
        queue.set_queue_length(1);
        queue.set_verbosity(Verbosity503::Full);
        queue.add_url(prefix("/"), Arc::new(UrlGroup::new(AuthConfig::default())));

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dispatch(request("/a"), remote(), 8080).await })
        };
        while queue.pending() == 0 {
            tokio::task::yield_now().await;
        }
        let second = queue.dispatch(request("/b"), remote(), 8080).await;
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(second.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("queue full"));

        assert_eq!(queue.cancel_all().await, 1);
        assert_eq!(first.await.unwrap().status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(queue.read_next().await.is_none());
    }
}
