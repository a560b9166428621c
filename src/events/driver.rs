//! Event driver: owns the channels of a server and keeps them moving.
//!
//! # Responsibilities
//! - Register channels per session, each with its own token
//! - Serve the driver site: WebSocket, SSE and long-poll clients
//! - Run the monitor: check, send and receive on every channel
//!
//! # Data Flow
//! ```text
//! application ── post_event ──▶ EventChannel.out_queue ──(monitor)──▶ sockets / streams
//! long-poll POST ─────────────▶ EventChannel (oldest queued event in the response)
//! client messages ─▶ EventChannel.in_queue ──(monitor, pool)──▶ application callback
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use hyper::header;
use hyper::{Method, StatusCode};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::schema::{EventsConfig, ServerConfig, WebSocketConfig};
use crate::events::brute_force::BruteForceGuard;
use crate::events::channel::{ChannelStatus, EventChannel};
use crate::events::event::{EventCallback, EventType};
use crate::events::long_poll::LongPollRequest;
use crate::events::policy::EventPolicy;
use crate::http::message::HttpMessage;
use crate::http::pool::WorkSubmitter;
use crate::http::server::HttpServer;
use crate::http::site::{ChannelType, SiteHandler};
use crate::lifecycle::Shutdown;
use crate::websocket::handshake::is_websocket_upgrade;
use crate::websocket::socket::AppData;

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stopped| *stopped).await;
}

#[derive(Default)]
struct Channels {
    by_number: BTreeMap<u64, Arc<EventChannel>>,
    by_name: HashMap<String, u64>,
    next: u64,
}

pub struct EventDriver {
    config: EventsConfig,
    websocket: WebSocketConfig,
    guard: Arc<BruteForceGuard>,
    wake: Arc<Notify>,
    channels: RwLock<Channels>,
    submitter: RwLock<Option<Weak<dyn WorkSubmitter>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    active: AtomicBool,
    me: Weak<EventDriver>,
}

impl std::fmt::Debug for EventDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDriver")
            .field("channels", &self.channel_count())
            .field("active", &self.is_active())
            .finish()
    }
}

impl EventDriver {
    pub fn new(config: &ServerConfig) -> Arc<Self> {
        let events = config.events.clone();
        let guard = BruteForceGuard::new(
            Duration::from_secs(events.brute_force_window_secs),
            events.brute_force_max_attempts,
        );
        Arc::new_cyclic(|me| Self {
            config: events,
            websocket: config.websocket.clone(),
            guard: Arc::new(guard),
            wake: Arc::new(Notify::new()),
            channels: RwLock::new(Channels::default()),
            submitter: RwLock::new(None),
            monitor: Mutex::new(None),
            active: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Route inbound events through this pool.
    pub fn set_submitter(&self, submitter: Weak<dyn WorkSubmitter>) {
        if let Ok(mut slot) = self.submitter.write() {
            *slot = Some(submitter);
        }
    }

    /// Create the driver site on `server` and start the monitor.
    pub async fn register_sites(&self, server: &Arc<HttpServer>, port: u16, base: &str) -> bool {
        let weak: Weak<HttpServer> = Arc::downgrade(server);
        let submitter: Weak<dyn WorkSubmitter> = weak;
        self.set_submitter(submitter);

        let handler = Arc::new(DriverSite {
            driver: self.me.clone(),
        });
        let Some(site) = server
            .create_site(ChannelType::Strong, false, port, base, false, handler)
            .await
        else {
            tracing::error!(port, base = %base, "Event driver site could not be created");
            return false;
        };
        tracing::info!(prefix = %site.prefix(), "Event driver site registered");
        self.start_monitor(server.shutdown());
        true
    }

    /// Start the monitor loop; it ends when `shutdown` triggers.
    pub fn start_monitor(&self, shutdown: &Shutdown) {
        let Ok(mut monitor) = self.monitor.lock() else {
            return;
        };
        if monitor.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        self.active.store(true, Ordering::SeqCst);
        let interval = Duration::from_millis(self.config.monitor_interval_ms.max(1));
        *monitor = Some(tokio::spawn(run_monitor(
            self.me.clone(),
            Arc::clone(&self.wake),
            interval,
            shutdown.subscribe(),
        )));
    }

    /// Wake the monitor for new inbound or outbound work.
    pub fn incoming_event(&self) {
        self.wake.notify_one();
    }

    /// Channel number for a session, created on first use.
    pub fn register_channel(&self, session: &str) -> u64 {
        let Ok(mut channels) = self.channels.write() else {
            return 0;
        };
        if let Some(number) = channels.by_name.get(&session.to_lowercase()) {
            return *number;
        }
        channels.next += 1;
        let number = channels.next;
        let token = uuid::Uuid::new_v4().to_string();
        let channel = EventChannel::new(
            number,
            session,
            &self.config.cookie_name,
            &token,
            Arc::clone(&self.guard),
            Arc::clone(&self.wake),
        );
        channels.by_name.insert(session.to_lowercase(), number);
        channels.by_number.insert(number, channel);
        tracing::info!(channel = number, session = %session, "Event channel registered");
        number
    }

    /// Close and forget a channel.
    pub fn unregister_channel(&self, number: u64) -> bool {
        let channel = match self.channels.write() {
            Ok(mut channels) => {
                let channel = channels.by_number.remove(&number);
                if let Some(channel) = &channel {
                    channels.by_name.remove(&channel.name().to_lowercase());
                }
                channel
            }
            Err(_) => None,
        };
        match channel {
            Some(channel) => {
                channel.close_channel();
                true
            }
            None => false,
        }
    }

    pub fn channel(&self, number: u64) -> Option<Arc<EventChannel>> {
        self.channels.read().ok()?.by_number.get(&number).cloned()
    }

    pub fn channel_by_name(&self, session: &str) -> Option<Arc<EventChannel>> {
        let channels = self.channels.read().ok()?;
        let number = channels.by_name.get(&session.to_lowercase())?;
        channels.by_number.get(number).cloned()
    }

    fn all_channels(&self) -> Vec<Arc<EventChannel>> {
        self.channels
            .read()
            .map(|c| c.by_number.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().map(|c| c.by_number.len()).unwrap_or(0)
    }

    pub fn statuses(&self) -> Vec<ChannelStatus> {
        self.all_channels().iter().map(|c| c.status()).collect()
    }

    /// Cookie a client must present, as `name=token`.
    pub fn cookie_token(&self, number: u64) -> Option<String> {
        self.channel(number).map(|c| c.cookie_token())
    }

    /// Queue an event on a channel. Returns its number, 0 if the channel
    /// does not exist.
    pub fn post_event(
        &self,
        number: u64,
        payload: impl Into<Bytes>,
        sender: Option<&str>,
        event_type: EventType,
        type_name: &str,
    ) -> u64 {
        match self.channel(number) {
            Some(channel) => channel.post_event(payload, sender, event_type, type_name),
            None => {
                tracing::warn!(channel = number, "Event posted to unknown channel");
                0
            }
        }
    }

    pub fn change_event_policy(
        &self,
        number: u64,
        policy: EventPolicy,
        application: Option<EventCallback>,
        data: Option<AppData>,
    ) -> bool {
        self.channel(number)
            .map(|c| c.change_event_policy(policy, application, data))
            .unwrap_or(false)
    }

    pub fn flush_channel(&self, number: u64) -> bool {
        self.channel(number).map(|c| c.flush_channel()).unwrap_or(false)
    }

    fn submitter(&self) -> Option<Arc<dyn WorkSubmitter>> {
        self.submitter.read().ok()?.as_ref()?.upgrade()
    }

    /// One monitor round over every channel. Returns events sent.
    pub fn monitor_pass(&self) -> usize {
        let submitter = self.submitter();
        let mut sent = 0;
        for channel in self.all_channels() {
            channel.check_channel();
            sent += channel.send_channel();
            if let Some(pool) = &submitter {
                channel.receiving(pool.as_ref());
            }
        }
        self.guard.sweep();
        sent
    }

    /// Close every channel and stop the monitor.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        if let Ok(mut monitor) = self.monitor.lock() {
            if let Some(task) = monitor.take() {
                task.abort();
            }
        }
        let channels = match self.channels.write() {
            Ok(mut channels) => {
                channels.by_name.clear();
                std::mem::take(&mut channels.by_number)
            }
            Err(_) => BTreeMap::new(),
        };
        for channel in channels.values() {
            channel.close_channel();
        }
        tracing::info!(channels = channels.len(), "Event driver stopped");
    }

    /// Serve one request on the driver site. The channel is picked by
    /// the `channel` query parameter.
    pub async fn handle(&self, message: &mut HttpMessage) {
        let Some(session) = message.query_param("channel") else {
            message.set_status(StatusCode::BAD_REQUEST);
            message.set_text("missing channel parameter");
            return;
        };
        let Some(channel) = self.channel_by_name(&session) else {
            message.set_status(StatusCode::NOT_FOUND);
            message.set_text("unknown channel");
            return;
        };
        let cookies = message.cookies();
        let check = self.config.require_auth;

        if is_websocket_upgrade(message.headers()) {
            let socket = match message.accept_websocket(&self.websocket) {
                Ok(socket) => socket,
                Err(e) => {
                    tracing::debug!(channel = %session, error = %e, "WebSocket upgrade refused");
                    message.set_status(StatusCode::BAD_REQUEST);
                    message.set_text(e.to_string());
                    return;
                }
            };
            if !channel.register_new_socket(&cookies, socket, check) {
                message.reject(StatusCode::FORBIDDEN);
            }
            return;
        }

        let wants_stream = message
            .header(header::ACCEPT.as_str())
            .is_some_and(|accept| accept.contains("text/event-stream"));
        if wants_stream && *message.method() == Method::GET {
            // Checked up front: the stream's headers go out as soon as it starts.
            if !channel.admit(&message.sender(), &cookies, check, "sse") {
                message.set_status(StatusCode::FORBIDDEN);
                return;
            }
            let Some(stream) = message.start_event_stream() else {
                return;
            };
            if !channel.register_new_stream(&cookies, Arc::clone(&stream), false) {
                stream.close();
            }
            return;
        }

        if *message.method() == Method::POST {
            let body = match message.json_body().await {
                Ok(body) => body,
                Err(e) => {
                    message.set_status(StatusCode::PAYLOAD_TOO_LARGE);
                    message.set_text(e.to_string());
                    return;
                }
            };
            if let Some(error) = body.error() {
                message.set_status(StatusCode::BAD_REQUEST);
                message.set_text(error.to_string());
                return;
            }
            let request = LongPollRequest::from_json(&body);
            let sender = message.sender();
            match channel.handle_long_polling(&sender, &cookies, &request, check) {
                Some(response) => message.set_json(&response.to_json()),
                None => message.set_status(StatusCode::FORBIDDEN),
            }
            return;
        }

        message.set_status(StatusCode::METHOD_NOT_ALLOWED);
    }
}

async fn run_monitor(
    driver: Weak<EventDriver>,
    wake: Arc<Notify>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::debug!(interval_ms = interval.as_millis() as u64, "Event monitor started");
    loop {
        tokio::select! {
            _ = cancelled(&mut shutdown) => break,
            _ = wake.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(driver) = driver.upgrade() else {
            break;
        };
        driver.monitor_pass();
    }
    tracing::debug!("Event monitor stopped");
}

struct DriverSite {
    driver: Weak<EventDriver>,
}

impl SiteHandler for DriverSite {
    fn handle<'a>(&'a self, message: &'a mut HttpMessage) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self.driver.upgrade() {
                Some(driver) => driver.handle(message).await,
                None => message.set_status(StatusCode::SERVICE_UNAVAILABLE),
            }
        })
    }
}
