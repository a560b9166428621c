//! One server-push channel.
//!
//! # Responsibilities
//! - Number outbound events and keep them queued until delivered
//! - Deliver through the current transport: sockets, SSE streams or long polling
//! - Prune on acknowledgment and track the low-water mark
//! - Queue inbound client events and hand them to the application via the pool
//!
//! All state lives behind one mutex per channel. Sockets and streams are
//! only ever closed after that mutex is released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::Notify;

use crate::events::brute_force::BruteForceGuard;
use crate::events::event::{sender_hash, ChannelEvent, Event, EventCallback, EventType};
use crate::events::long_poll::{LongPollRequest, LongPollResponse};
use crate::events::policy::{DriverType, EventPolicy};
use crate::events::sse::{EventStream, ServerEvent};
use crate::http::pool::{WorkItem, WorkSubmitter};
use crate::observability::metrics;
use crate::websocket::frame::CLOSE_NORMAL;
use crate::websocket::socket::{AppData, SocketHandler, SocketState, WebSocket};

struct SocketEntry {
    socket: Arc<WebSocket>,
    url: String,
    sender: u32,
    open: bool,
}

struct StreamEntry {
    stream: Arc<EventStream>,
    url: String,
    sender: u32,
}

struct ChannelState {
    policy: EventPolicy,
    current: DriverType,
    sockets: Vec<SocketEntry>,
    streams: Vec<StreamEntry>,
    application: Option<EventCallback>,
    app_data: Option<AppData>,
    out_queue: VecDeque<Event>,
    in_queue: VecDeque<ChannelEvent>,
    max_number: u64,
    min_number: u64,
    open_seen: bool,
    close_seen: bool,
    closed: bool,
    last_sending: Instant,
}

impl ChannelState {
    /// Drop every event numbered `number` or lower. No-op outside the
    /// (low, high] window.
    fn remove_events(&mut self, number: u64) -> usize {
        if number <= self.min_number || number > self.max_number {
            return 0;
        }
        let mut removed = 0;
        while self.out_queue.front().is_some_and(|e| e.number <= number) {
            self.out_queue.pop_front();
            removed += 1;
        }
        self.min_number = match self.out_queue.front() {
            Some(front) => front.number - 1,
            None => self.max_number,
        };
        removed
    }
}

/// Snapshot for status pages.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub number: u64,
    pub name: String,
    pub mode: DriverType,
    pub policy: EventPolicy,
    pub queued: usize,
    pub inbound: usize,
    pub clients: usize,
    pub low_water: u64,
    pub high_water: u64,
}

pub struct EventChannel {
    number: u64,
    name: String,
    cookie: String,
    token: String,
    guard: Arc<BruteForceGuard>,
    wake: Arc<Notify>,
    state: Mutex<ChannelState>,
    me: Weak<EventChannel>,
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannel")
            .field("number", &self.number)
            .field("name", &self.name)
            .finish()
    }
}

impl EventChannel {
    /// `wake` is notified whenever there is something for the monitor to do.
    pub fn new(
        number: u64,
        name: &str,
        cookie: &str,
        token: &str,
        guard: Arc<BruteForceGuard>,
        wake: Arc<Notify>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            number,
            name: name.to_string(),
            cookie: cookie.to_string(),
            token: token.to_string(),
            guard,
            wake,
            state: Mutex::new(ChannelState {
                policy: EventPolicy::default(),
                current: DriverType::NotConnected,
                sockets: Vec::new(),
                streams: Vec::new(),
                application: None,
                app_data: None,
                out_queue: VecDeque::new(),
                in_queue: VecDeque::new(),
                max_number: 0,
                min_number: 0,
                open_seen: false,
                close_seen: false,
                closed: false,
                last_sending: Instant::now(),
            }),
            me: me.clone(),
        })
    }

    fn lock(&self) -> Option<MutexGuard<'_, ChannelState>> {
        match self.state.lock() {
            Ok(state) => Some(state),
            Err(_) => {
                tracing::error!(channel = %self.name, "Channel state poisoned");
                None
            }
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// `name=token`, ready for a `Cookie` header.
    pub fn cookie_token(&self) -> String {
        format!("{}={}", self.cookie, self.token)
    }

    pub fn queue_count(&self) -> usize {
        self.lock().map(|s| s.out_queue.len()).unwrap_or(0)
    }

    pub fn inbound_count(&self) -> usize {
        self.lock().map(|s| s.in_queue.len()).unwrap_or(0)
    }

    /// Open sockets plus live streams.
    pub fn client_count(&self) -> usize {
        self.lock()
            .map(|s| {
                s.sockets.iter().filter(|e| e.socket.is_open_for_reading()).count()
                    + s.streams.iter().filter(|e| e.stream.is_open()).count()
            })
            .unwrap_or(0)
    }

    pub fn driver_type(&self) -> DriverType {
        self.lock().map(|s| s.current).unwrap_or_default()
    }

    pub fn policy(&self) -> EventPolicy {
        self.lock().map(|s| s.policy).unwrap_or_default()
    }

    /// (low-water, high-water) event numbers.
    pub fn bounds(&self) -> (u64, u64) {
        self.lock().map(|s| (s.min_number, s.max_number)).unwrap_or((0, 0))
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|s| s.closed).unwrap_or(true)
    }

    pub fn last_sending(&self) -> Option<Instant> {
        self.lock().map(|s| s.last_sending)
    }

    /// Sent counter of a queued event.
    pub fn sent_count(&self, number: u64) -> Option<u32> {
        let state = self.lock()?;
        state.out_queue.iter().find(|e| e.number == number).map(|e| e.sent)
    }

    pub fn status(&self) -> ChannelStatus {
        let clients = self.client_count();
        let state = self.lock();
        ChannelStatus {
            number: self.number,
            name: self.name.clone(),
            mode: state.as_ref().map(|s| s.current).unwrap_or_default(),
            policy: state.as_ref().map(|s| s.policy).unwrap_or_default(),
            queued: state.as_ref().map(|s| s.out_queue.len()).unwrap_or(0),
            inbound: state.as_ref().map(|s| s.in_queue.len()).unwrap_or(0),
            clients,
            low_water: state.as_ref().map(|s| s.min_number).unwrap_or(0),
            high_water: state.as_ref().map(|s| s.max_number).unwrap_or(0),
        }
    }

    /// Queue an event for the client(s). With a sender only that client
    /// receives it. Returns the event number, 0 if the channel is closed.
    pub fn post_event(
        &self,
        payload: impl Into<Bytes>,
        sender: Option<&str>,
        event_type: EventType,
        type_name: &str,
    ) -> u64 {
        let Some(mut state) = self.lock() else {
            return 0;
        };
        if state.closed {
            tracing::warn!(channel = %self.name, "Event posted to a closed channel");
            return 0;
        }
        state.max_number += 1;
        let mut event = Event::new(state.max_number, event_type, payload);
        event.type_name = type_name.to_string();
        if let Some(sender) = sender.filter(|s| !s.is_empty()) {
            event.filter = sender_hash(sender);
        }
        let number = event.number;
        state.out_queue.push_back(event);
        drop(state);

        metrics::record_event_posted();
        tracing::trace!(channel = %self.name, number, "Event posted");
        self.wake.notify_one();
        number
    }

    /// Prune acknowledged events. Returns how many were dropped.
    pub fn remove_events(&self, number: u64) -> usize {
        self.lock().map(|mut s| s.remove_events(number)).unwrap_or(0)
    }

    fn inbound(&self, state: &mut ChannelState, event_type: EventType, payload: Bytes) {
        if event_type == EventType::Open {
            state.open_seen = true;
        }
        state.in_queue.push_back(ChannelEvent {
            channel: self.name.clone(),
            channel_number: self.number,
            event_type,
            payload,
            app_data: state.app_data.clone(),
        });
    }

    fn push_inbound(&self, event_type: EventType, payload: Bytes) {
        if let Some(mut state) = self.lock() {
            if event_type == EventType::Binary && !state.open_seen {
                self.inbound(&mut state, EventType::Open, Bytes::from_static(b"OpenChannel"));
            }
            self.inbound(&mut state, event_type, payload);
        }
        self.wake.notify_one();
    }

    pub fn on_open(&self, message: &str) {
        self.push_inbound(EventType::Open, Bytes::from(message.to_string()));
    }

    pub fn on_message(&self, message: &str) {
        self.push_inbound(EventType::Message, Bytes::from(message.to_string()));
    }

    pub fn on_binary(&self, data: &[u8]) {
        self.push_inbound(EventType::Binary, Bytes::copy_from_slice(data));
    }

    pub fn on_error(&self, message: &str) {
        self.push_inbound(EventType::Error, Bytes::from(message.to_string()));
    }

    pub fn on_close(&self, message: &str) {
        self.push_inbound(EventType::Close, Bytes::from(message.to_string()));
    }

    fn on_open_socket(&self, socket: &WebSocket) {
        let Some(mut state) = self.lock() else {
            return;
        };
        let mut found = false;
        for entry in state.sockets.iter_mut() {
            if std::ptr::eq(Arc::as_ptr(&entry.socket), socket) {
                entry.open = true;
                found = true;
            }
        }
        if !found {
            return;
        }
        state.close_seen = false;
        if !state.open_seen {
            self.inbound(&mut state, EventType::Open, Bytes::from(socket.uri().to_string()));
            drop(state);
            self.wake.notify_one();
        }
    }

    fn on_close_socket(&self, socket: &WebSocket) {
        let Some(mut state) = self.lock() else {
            return;
        };
        for entry in state.sockets.iter_mut() {
            if std::ptr::eq(Arc::as_ptr(&entry.socket), socket) {
                entry.open = false;
                state.close_seen = true;
                break;
            }
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Cookie check: the channel cookie must carry the channel token.
    /// Names and values compare case-insensitively.
    pub fn authenticate(&self, cookies: &[(String, String)]) -> bool {
        cookies.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case(&self.cookie) && value.eq_ignore_ascii_case(&self.token)
        })
    }

    /// Brute-force and (with `check`) cookie gate in front of every
    /// transport registration.
    pub fn admit(&self, sender: &str, cookies: &[(String, String)], check: bool, what: &str) -> bool {
        if self.guard.is_blocked(sender) {
            return false;
        }
        if check && !self.authenticate(cookies) {
            self.guard.record_failure(sender);
            tracing::warn!(
                channel = %self.name,
                sender = %sender,
                transport = what,
                "Registration without proper authentication"
            );
            return false;
        }
        true
    }

    /// Attach an accepted WebSocket. The channel becomes its handler.
    pub fn register_new_socket(
        &self,
        cookies: &[(String, String)],
        socket: Arc<WebSocket>,
        check: bool,
    ) -> bool {
        let sender = socket.sender().to_string();
        if !self.admit(&sender, cookies, check, "websocket") {
            return false;
        }
        let Some(mut state) = self.lock() else {
            return false;
        };
        if state.closed {
            return false;
        }
        if !state.policy.allows_sockets() {
            tracing::warn!(channel = %self.name, policy = ?state.policy, "Policy does not allow WebSockets");
            return false;
        }

        socket.set_handler(Arc::new(ChannelSocketHandler {
            channel: self.me.clone(),
        }));
        socket.set_app_data(state.app_data.clone());
        if !state.sockets.iter().any(|e| Arc::ptr_eq(&e.socket, &socket)) {
            let url = format!("ws://{}{}", sender, socket.uri()).to_lowercase();
            tracing::debug!(channel = %self.name, url = %url, "WebSocket registered");
            state.sockets.push(SocketEntry {
                open: socket.is_open_for_writing(),
                socket,
                url,
                sender: sender_hash(&sender),
            });
        }
        state.current = DriverType::Sockets;
        true
    }

    /// Attach an SSE stream. SSE clients never send, so an open event is
    /// generated here.
    pub fn register_new_stream(
        &self,
        cookies: &[(String, String)],
        stream: Arc<EventStream>,
        check: bool,
    ) -> bool {
        let sender = stream.sender().to_string();
        if !self.admit(&sender, cookies, check, "sse") {
            return false;
        }
        let Some(mut state) = self.lock() else {
            return false;
        };
        if state.closed {
            return false;
        }
        if !state.policy.allows_streams() {
            tracing::warn!(channel = %self.name, policy = ?state.policy, "Policy does not allow SSE streams");
            return false;
        }

        let url = format!("http://{}{}", sender, stream.uri()).to_lowercase();
        stream.set_app_data(state.app_data.clone());
        if !state.streams.iter().any(|e| Arc::ptr_eq(&e.stream, &stream)) {
            tracing::debug!(channel = %self.name, url = %url, "Event stream registered");
            state.streams.push(StreamEntry {
                stream,
                url: url.clone(),
                sender: sender_hash(&sender),
            });
        }
        state.current = DriverType::ServerEvents;
        self.inbound(&mut state, EventType::Open, Bytes::from(format!("Started: {url}")));
        drop(state);
        self.wake.notify_one();
        true
    }

    /// One long-polling exchange. `None` means the client was refused.
    pub fn handle_long_polling(
        &self,
        sender: &str,
        cookies: &[(String, String)],
        request: &LongPollRequest,
        check: bool,
    ) -> Option<LongPollResponse> {
        if !self.admit(sender, cookies, check, "long_polling") {
            return None;
        }
        let mut state = self.lock()?;
        if state.closed {
            return Some(LongPollResponse::ChannelClosed);
        }

        let mut incoming = false;
        if !request.message.is_empty() {
            let event_type = request.event_type.unwrap_or(EventType::Message);
            if event_type == EventType::Binary && !state.open_seen {
                self.inbound(&mut state, EventType::Open, Bytes::from_static(b"OpenChannel"));
            }
            self.inbound(&mut state, event_type, Bytes::from(request.message.clone()));
            incoming = true;
        }

        if request.acknowledged > 0 {
            state.remove_events(request.acknowledged);
        }

        let response = if request.close_channel {
            if state.current == DriverType::LongPolling {
                state.current = DriverType::NotConnected;
            }
            LongPollResponse::ChannelClosed
        } else {
            state.current = DriverType::LongPolling;
            if !state.open_seen {
                self.inbound(&mut state, EventType::Open, Bytes::new());
                incoming = true;
            }
            match state.out_queue.front_mut() {
                Some(event) => {
                    event.sent += 1;
                    metrics::record_event_delivered("long_poll");
                    LongPollResponse::event(event)
                }
                None => LongPollResponse::Empty,
            }
        };
        state.last_sending = Instant::now();
        drop(state);

        if incoming {
            self.wake.notify_one();
        }
        Some(response)
    }

    /// Deliver what the current transport can take. Called by the monitor.
    /// Returns the number of events fully sent.
    pub fn send_channel(&self) -> usize {
        let mut dead_sockets = Vec::new();
        let mut dead_streams = Vec::new();
        let sent = {
            let Some(mut state) = self.lock() else {
                return 0;
            };
            let sent = match state.current {
                DriverType::Sockets => self.send_queue_to_socket(&mut state, &mut dead_sockets),
                DriverType::ServerEvents => self.send_queue_to_stream(&mut state, &mut dead_streams),
                DriverType::LongPolling => {
                    tracing::trace!(
                        channel = %self.name,
                        queued = state.out_queue.len(),
                        "Long polling active"
                    );
                    0
                }
                DriverType::NotConnected => {
                    tracing::trace!(
                        channel = %self.name,
                        queued = state.out_queue.len(),
                        "No connection yet"
                    );
                    0
                }
            };
            state.last_sending = Instant::now();
            sent
        };
        self.close_transports(dead_sockets, dead_streams, "Event channel transport failed");
        sent
    }

    fn send_queue_to_socket(&self, state: &mut ChannelState, dead: &mut Vec<Arc<WebSocket>>) -> usize {
        if !state.sockets.iter().any(|e| e.open) {
            return 0;
        }
        let immediate = !state.policy.requires_delivery();
        let mut queue = std::mem::take(&mut state.out_queue);
        let mut sent = 0;
        let mut last_sent = 0;

        for event in queue.iter_mut() {
            let mut all_ok = true;
            let mut i = 0;
            while i < state.sockets.len() {
                let entry = &state.sockets[i];
                if !entry.open || !event.matches(entry.sender) {
                    i += 1;
                    continue;
                }
                let socket = Arc::clone(&entry.socket);
                if !socket.is_open_for_writing() {
                    dead.push(state.sockets.remove(i).socket);
                    continue;
                }
                if !state.open_seen {
                    self.inbound(state, EventType::Open, Bytes::new());
                }
                let ok = match event.event_type {
                    EventType::Binary => socket.write_binary(&event.payload),
                    _ => socket.write_string(&event.text()),
                };
                if !ok {
                    all_ok = false;
                    metrics::record_transport_failure("websocket");
                    let entry = state.sockets.remove(i);
                    tracing::debug!(channel = %self.name, url = %entry.url, "WebSocket write failed");
                    dead.push(entry.socket);
                    continue;
                }
                metrics::record_event_delivered("websocket");
                i += 1;
            }
            if all_ok {
                event.sent += 1;
                last_sent = event.number;
                sent += 1;
            } else if immediate {
                last_sent = event.number;
            }
            if state.sockets.is_empty() {
                self.inbound(state, EventType::Close, Bytes::new());
                state.current = DriverType::NotConnected;
                break;
            }
        }

        state.out_queue = queue;
        if last_sent > 0 {
            state.remove_events(last_sent);
        }
        sent
    }

    fn send_queue_to_stream(&self, state: &mut ChannelState, dead: &mut Vec<Arc<EventStream>>) -> usize {
        if state.streams.is_empty() {
            return 0;
        }
        let immediate = !state.policy.requires_delivery();
        let mut queue = std::mem::take(&mut state.out_queue);
        let mut sent = 0;
        let mut last_sent = 0;

        for event in queue.iter_mut() {
            let mut all_ok = true;
            let mut i = 0;
            while i < state.streams.len() {
                let entry = &state.streams[i];
                if !event.matches(entry.sender) {
                    i += 1;
                    continue;
                }
                let stream = Arc::clone(&entry.stream);
                let server_event = match event.event_type {
                    EventType::Binary => ServerEvent::binary(event.event_type.as_str(), event.number, &event.payload),
                    EventType::Message if !event.type_name.is_empty() => {
                        ServerEvent::new(&event.type_name, event.number, &event.text())
                    }
                    _ => ServerEvent::new(event.event_type.as_str(), event.number, &event.text()),
                };
                if !state.open_seen {
                    self.inbound(state, EventType::Open, Bytes::new());
                }
                if !stream.send_event(&server_event) {
                    all_ok = false;
                    metrics::record_transport_failure("sse");
                    let entry = state.streams.remove(i);
                    tracing::debug!(channel = %self.name, url = %entry.url, "Event stream send failed");
                    dead.push(entry.stream);
                    if state.streams.is_empty() {
                        self.inbound(state, EventType::Close, Bytes::new());
                        state.current = DriverType::NotConnected;
                    }
                    continue;
                }
                metrics::record_event_delivered("sse");
                i += 1;
            }
            if all_ok {
                event.sent += 1;
                last_sent = event.number;
                sent += 1;
            } else if immediate {
                last_sent = event.number;
            }
            if state.streams.is_empty() {
                break;
            }
        }

        state.out_queue = queue;
        if last_sent > 0 {
            state.remove_events(last_sent);
        }
        sent
    }

    /// Send everything now. True if the queue drained.
    pub fn flush_channel(&self) -> bool {
        self.send_channel();
        self.queue_count() == 0
    }

    /// Drop transports that went away. One close event is raised when the
    /// last of them disappears.
    pub fn check_channel(&self) {
        let mut dead_sockets = Vec::new();
        let mut dead_streams = Vec::new();
        let mut incoming = false;
        if let Some(mut state) = self.lock() {
            match state.current {
                DriverType::Sockets => {
                    let before = state.sockets.len();
                    let mut i = 0;
                    while i < state.sockets.len() {
                        let socket = &state.sockets[i].socket;
                        if socket.state() == SocketState::Connecting || socket.is_open_for_writing() {
                            i += 1;
                        } else {
                            dead_sockets.push(state.sockets.remove(i).socket);
                        }
                    }
                    if before > 0 && state.sockets.is_empty() {
                        self.inbound(&mut state, EventType::Close, Bytes::new());
                        state.current = DriverType::NotConnected;
                        incoming = true;
                    }
                }
                DriverType::ServerEvents => {
                    let before = state.streams.len();
                    let mut i = 0;
                    while i < state.streams.len() {
                        if state.streams[i].stream.is_open() {
                            i += 1;
                        } else {
                            dead_streams.push(state.streams.remove(i).stream);
                        }
                    }
                    if before > 0 && state.streams.is_empty() {
                        self.inbound(&mut state, EventType::Close, Bytes::new());
                        state.current = DriverType::NotConnected;
                        incoming = true;
                    }
                }
                DriverType::LongPolling | DriverType::NotConnected => {}
            }
        }
        if !dead_sockets.is_empty() || !dead_streams.is_empty() {
            tracing::debug!(
                channel = %self.name,
                sockets = dead_sockets.len(),
                streams = dead_streams.len(),
                "Closed transports removed"
            );
        }
        self.close_transports(dead_sockets, dead_streams, "Event channel closing transport");
        if incoming {
            self.wake.notify_one();
        }
    }

    fn close_transports(&self, sockets: Vec<Arc<WebSocket>>, streams: Vec<Arc<EventStream>>, reason: &str) {
        for socket in sockets {
            tracing::debug!(channel = %self.name, uri = %socket.uri(), "Closing WebSocket");
            socket.close_socket(CLOSE_NORMAL, reason);
        }
        for stream in streams {
            tracing::debug!(channel = %self.name, uri = %stream.uri(), "Closing event stream");
            stream.close();
        }
    }

    /// Close the channel: tell the application once, close every
    /// transport, drop both queues. Safe to call repeatedly.
    pub fn close_channel(&self) {
        let (notify, sockets, streams) = {
            let Some(mut state) = self.lock() else {
                return;
            };
            let notify = if state.close_seen {
                None
            } else {
                state.close_seen = true;
                state.application.clone().map(|callback| {
                    let event = ChannelEvent {
                        channel: self.name.clone(),
                        channel_number: self.number,
                        event_type: EventType::Close,
                        payload: Bytes::from_static(b"Channel closed"),
                        app_data: state.app_data.clone(),
                    };
                    (callback, event)
                })
            };
            state.closed = true;
            state.current = DriverType::NotConnected;
            let sockets: Vec<_> = state.sockets.drain(..).map(|e| e.socket).collect();
            let streams: Vec<_> = state.streams.drain(..).map(|e| e.stream).collect();
            state.out_queue.clear();
            state.in_queue.clear();
            state.min_number = state.max_number;
            (notify, sockets, streams)
        };

        if let Some((callback, event)) = notify {
            if let Err(e) = callback(event) {
                tracing::error!(channel = %self.name, error = %e, "Application failed on channel close");
            }
        }
        self.close_transports(sockets, streams, "Event channel closed");
        tracing::info!(channel = %self.name, "Event channel closed");
    }

    /// Switch policy and application callback. Refused while transports
    /// the new policy forbids are attached.
    pub fn change_event_policy(
        &self,
        policy: EventPolicy,
        application: Option<EventCallback>,
        data: Option<AppData>,
    ) -> bool {
        let Some(mut state) = self.lock() else {
            return false;
        };
        let refused = match policy {
            EventPolicy::TwoWayMessages | EventPolicy::Binary => !state.streams.is_empty(),
            EventPolicy::HighSecurity => !state.sockets.is_empty(),
            EventPolicy::Disconnected => !state.streams.is_empty() || !state.sockets.is_empty(),
            EventPolicy::Immediate | EventPolicy::SureDelivery => false,
        };
        if refused {
            tracing::warn!(channel = %self.name, policy = ?policy, "Policy change refused, transports attached");
            return false;
        }
        state.policy = policy;
        state.application = application;
        state.app_data = data.clone();
        for entry in &state.sockets {
            entry.socket.set_app_data(data.clone());
        }
        for entry in &state.streams {
            entry.stream.set_app_data(data.clone());
        }
        true
    }

    /// Hand inbound events to the application through the pool, in order.
    /// Stops at the first refused submission and keeps the rest.
    pub fn receiving(&self, pool: &dyn WorkSubmitter) -> usize {
        let Some(mut state) = self.lock() else {
            return 0;
        };
        let Some(callback) = state.application.clone() else {
            return 0;
        };
        let mut received = 0;
        while let Some(event) = state.in_queue.front().cloned() {
            if !state.open_seen && event.event_type != EventType::Open {
                let open = ChannelEvent {
                    channel: self.name.clone(),
                    channel_number: self.number,
                    event_type: EventType::Open,
                    payload: Bytes::new(),
                    app_data: state.app_data.clone(),
                };
                if !pool.submit_work(WorkItem::ChannelEvent {
                    callback: Arc::clone(&callback),
                    event: open,
                }) {
                    break;
                }
                state.open_seen = true;
            }
            if !pool.submit_work(WorkItem::ChannelEvent {
                callback: Arc::clone(&callback),
                event,
            }) {
                break;
            }
            state.in_queue.pop_front();
            received += 1;
        }
        received
    }
}

/// Routes socket callbacks into the owning channel.
struct ChannelSocketHandler {
    channel: Weak<EventChannel>,
}

impl SocketHandler for ChannelSocketHandler {
    fn on_open(&self, socket: &WebSocket) {
        if let Some(channel) = self.channel.upgrade() {
            channel.on_open_socket(socket);
        }
    }

    fn on_message(&self, _socket: &WebSocket, text: &str) {
        if let Some(channel) = self.channel.upgrade() {
            channel.on_message(text);
        }
    }

    fn on_binary(&self, _socket: &WebSocket, data: &[u8]) {
        if let Some(channel) = self.channel.upgrade() {
            channel.on_binary(data);
        }
    }

    fn on_error(&self, _socket: &WebSocket, error: &str) {
        if let Some(channel) = self.channel.upgrade() {
            channel.on_error(error);
        }
    }

    fn on_close(&self, socket: &WebSocket, _code: u16, _reason: &str) {
        if let Some(channel) = self.channel.upgrade() {
            channel.on_close_socket(socket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::schema::WebSocketConfig;
    use crate::websocket::frame::{decode_frame, Opcode};
    use crate::events::event::BoxError;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn channel() -> Arc<EventChannel> {
        EventChannel::new(
            1,
            "session",
            "EventChannel",
            "secret",
            Arc::new(BruteForceGuard::new(Duration::from_secs(60), 3)),
            Arc::new(Notify::new()),
        )
    }

    /// Records submitted work; refuses everything after `limit` items.
    struct Collector {
        limit: usize,
        items: Mutex<Vec<ChannelEvent>>,
    }

    impl Collector {
        fn new(limit: usize) -> Self {
            Self {
                limit,
                items: Mutex::new(Vec::new()),
            }
        }

        fn types(&self) -> Vec<EventType> {
            self.items.lock().unwrap().iter().map(|e| e.event_type).collect()
        }
    }

    impl WorkSubmitter for Collector {
        fn submit_work(&self, item: WorkItem) -> bool {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.limit {
                return false;
            }
            if let WorkItem::ChannelEvent { event, .. } = item {
                items.push(event);
            }
            true
        }
    }

    fn noop_callback() -> EventCallback {
        Arc::new(|_event: ChannelEvent| -> Result<(), BoxError> { Ok(()) })
    }

    /// Client end of a served socket.
    struct Peer {
        io: DuplexStream,
        buffer: Vec<u8>,
    }

    impl Peer {
        async fn read_text(&mut self) -> String {
            loop {
                if let Ok(Some((frame, used))) = decode_frame(&self.buffer, 1 << 20) {
                    self.buffer.drain(..used);
                    if frame.opcode == Opcode::Text {
                        return String::from_utf8(frame.payload.to_vec()).unwrap();
                    }
                    continue;
                }
                let mut chunk = [0u8; 4096];
                let n = tokio::time::timeout(Duration::from_secs(2), self.io.read(&mut chunk))
                    .await
                    .expect("frame in time")
                    .unwrap();
                assert!(n > 0, "connection closed");
                self.buffer.extend_from_slice(&chunk[..n]);
            }
        }
    }

    async fn open_socket(sender: &str) -> (Arc<WebSocket>, Peer) {
        let (socket, rx) = WebSocket::new("/events?channel=session", sender, None, WebSocketConfig::default());
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let served = Arc::clone(&socket);
        tokio::spawn(async move {
            served.serve(server_io, rx).await;
        });
        for _ in 0..50 {
            if socket.is_open_for_writing() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (
            socket,
            Peer {
                io: client_io,
                buffer: Vec::new(),
            },
        )
    }

    #[test]
    fn test_post_event_numbers_increase() {
        let channel = channel();
        assert_eq!(channel.post_event("a", None, EventType::Message, ""), 1);
        assert_eq!(channel.post_event("b", None, EventType::Message, ""), 2);
        assert_eq!(channel.queue_count(), 2);
        assert_eq!(channel.bounds(), (0, 2));
    }

    #[test]
    fn test_remove_events_is_idempotent() {
        let channel = channel();
        for i in 0..5 {
            channel.post_event(format!("e{i}"), None, EventType::Message, "");
        }
        assert_eq!(channel.remove_events(3), 3);
        assert_eq!(channel.bounds(), (3, 5));
        assert_eq!(channel.remove_events(3), 0);
        assert_eq!(channel.bounds(), (3, 5));
        assert_eq!(channel.queue_count(), 2);

        // Outside the window.
        assert_eq!(channel.remove_events(9), 0);
        assert_eq!(channel.remove_events(5), 2);
        assert_eq!(channel.bounds(), (5, 5));
    }

    #[test]
    fn test_long_poll_cycle() {
        let channel = channel();
        for i in 1..=3 {
            channel.post_event(format!("event {i}"), None, EventType::Message, "");
        }
        let poll = LongPollRequest::default();
        for round in 1..=2 {
            let response = channel.handle_long_polling("10.0.0.1", &[], &poll, false).unwrap();
            match response {
                LongPollResponse::Event { number, message, .. } => {
                    assert_eq!(number, 1);
                    assert_eq!(message, "event 1");
                }
                other => panic!("unexpected {other:?}"),
            }
            assert_eq!(channel.sent_count(1), Some(round));
        }
        assert_eq!(channel.queue_count(), 3);
        assert_eq!(channel.driver_type(), DriverType::LongPolling);

        let ack = LongPollRequest {
            acknowledged: 2,
            ..LongPollRequest::default()
        };
        match channel.handle_long_polling("10.0.0.1", &[], &ack, false).unwrap() {
            LongPollResponse::Event { number, .. } => assert_eq!(number, 3),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(channel.queue_count(), 1);

        let done = LongPollRequest {
            acknowledged: 3,
            ..LongPollRequest::default()
        };
        assert_eq!(
            channel.handle_long_polling("10.0.0.1", &[], &done, false),
            Some(LongPollResponse::Empty)
        );

        let close = LongPollRequest {
            close_channel: true,
            ..LongPollRequest::default()
        };
        assert_eq!(
            channel.handle_long_polling("10.0.0.1", &[], &close, false),
            Some(LongPollResponse::ChannelClosed)
        );
        assert_eq!(channel.driver_type(), DriverType::NotConnected);
    }

    #[test]
    fn test_long_poll_requires_cookie() {
        let channel = channel();
        let poll = LongPollRequest::default();
        assert!(channel.handle_long_polling("10.0.0.2", &[], &poll, true).is_none());
        let cookies = vec![("eventchannel".to_string(), "SECRET".to_string())];
        assert!(channel.handle_long_polling("10.0.0.2", &cookies, &poll, true).is_some());
    }

    #[test]
    fn test_brute_force_blocks_after_failures() {
        let channel = channel();
        let poll = LongPollRequest::default();
        let wrong = vec![("EventChannel".to_string(), "guess".to_string())];
        for _ in 0..3 {
            assert!(channel.handle_long_polling("10.9.9.9", &wrong, &poll, true).is_none());
        }
        let right = vec![("EventChannel".to_string(), "secret".to_string())];
        assert!(channel.handle_long_polling("10.9.9.9", &right, &poll, true).is_none());
        assert!(channel.handle_long_polling("10.9.9.8", &right, &poll, true).is_some());
    }

    #[test]
    fn test_inbound_long_poll_message_reaches_application() {
        let channel = channel();
        assert!(channel.change_event_policy(EventPolicy::TwoWayMessages, Some(noop_callback()), None));
        let request = LongPollRequest {
            message: "hello".to_string(),
            event_type: Some(EventType::Message),
            ..LongPollRequest::default()
        };
        channel.handle_long_polling("10.0.0.1", &[], &request, false);
        let pool = Collector::new(usize::MAX);
        assert_eq!(channel.receiving(&pool), 2);
        assert_eq!(pool.types(), vec![EventType::Message, EventType::Open]);
        assert_eq!(channel.inbound_count(), 0);
    }

    #[test]
    fn test_receiving_keeps_order_when_pool_refuses() {
        let channel = channel();
        channel.on_open("");
        channel.on_message("one");
        channel.on_message("two");

        // Nothing is handed out without an application.
        assert_eq!(channel.receiving(&Collector::new(usize::MAX)), 0);
        assert_eq!(channel.inbound_count(), 3);

        assert!(channel.change_event_policy(EventPolicy::SureDelivery, Some(noop_callback()), None));
        let pool = Collector::new(2);
        assert_eq!(channel.receiving(&pool), 2);
        assert_eq!(channel.inbound_count(), 1);
        let pool = Collector::new(usize::MAX);
        assert_eq!(channel.receiving(&pool), 1);
        let items = pool.items.lock().unwrap();
        assert_eq!(items[0].text(), "two");
    }

    #[test]
    fn test_synthetic_open_precedes_first_event() {
        let channel = channel();
        assert!(channel.change_event_policy(EventPolicy::SureDelivery, Some(noop_callback()), None));
        channel.on_error("boom");
        let pool = Collector::new(usize::MAX);
        assert_eq!(channel.receiving(&pool), 1);
        assert_eq!(pool.types(), vec![EventType::Open, EventType::Error]);
    }

    #[test]
    fn test_close_channel_notifies_once() {
        let channel = channel();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let callback: EventCallback = Arc::new(move |event: ChannelEvent| -> Result<(), BoxError> {
            assert_eq!(event.event_type, EventType::Close);
            *counter.lock().unwrap() += 1;
            Err("application failure".into())
        });
        assert!(channel.change_event_policy(EventPolicy::SureDelivery, Some(callback), None));
        channel.post_event("x", None, EventType::Message, "");
        channel.close_channel();
        channel.close_channel();
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(channel.queue_count(), 0);
        assert!(channel.is_closed());
        assert_eq!(channel.post_event("y", None, EventType::Message, ""), 0);
    }

    #[tokio::test]
    async fn test_policy_change_respects_transports() {
        let channel = channel();
        let (stream, _body) = EventStream::new("/events", "127.0.0.1");
        assert!(channel.register_new_stream(&[], stream, false));
        assert!(!channel.change_event_policy(EventPolicy::Binary, None, None));
        assert!(!channel.change_event_policy(EventPolicy::TwoWayMessages, None, None));
        assert!(!channel.change_event_policy(EventPolicy::Disconnected, None, None));
        assert!(channel.change_event_policy(EventPolicy::HighSecurity, None, None));
        assert_eq!(channel.policy(), EventPolicy::HighSecurity);
    }

    #[tokio::test]
    async fn test_send_to_streams_and_prune() {
        let channel = channel();
        let (first, first_body) = EventStream::new("/events", "10.0.0.1");
        let (second, second_body) = EventStream::new("/events", "10.0.0.2");
        assert!(channel.register_new_stream(&[], Arc::clone(&first), false));
        assert!(channel.register_new_stream(&[], Arc::clone(&second), false));
        assert_eq!(channel.driver_type(), DriverType::ServerEvents);

        channel.post_event("hello", None, EventType::Message, "");
        channel.post_event("only one", Some("10.0.0.2"), EventType::Message, "greeting");
        assert_eq!(channel.send_channel(), 2);
        assert_eq!(channel.queue_count(), 0);
        assert_eq!(channel.bounds(), (2, 2));

        first.close();
        second.close();
        let first_text = axum::body::to_bytes(first_body, 4096).await.unwrap();
        let second_text = axum::body::to_bytes(second_body, 4096).await.unwrap();
        assert_eq!(first_text, Bytes::from("event: message\nid: 1\ndata: hello\n\n"));
        assert_eq!(
            second_text,
            Bytes::from("event: message\nid: 1\ndata: hello\n\nevent: greeting\nid: 2\ndata: only one\n\n")
        );
    }

    #[tokio::test]
    async fn test_failed_stream_is_removed() {
        let channel = channel();
        let (alive, _alive_body) = EventStream::new("/events", "10.0.0.1");
        let (gone, gone_body) = EventStream::new("/events", "10.0.0.2");
        channel.register_new_stream(&[], Arc::clone(&alive), false);
        channel.register_new_stream(&[], Arc::clone(&gone), false);
        drop(gone_body);

        channel.post_event("x", None, EventType::Message, "");
        assert_eq!(channel.send_channel(), 0);
        assert_eq!(channel.client_count(), 1);
        // Retained for the next pass, which reaches the remaining stream.
        assert_eq!(channel.queue_count(), 1);
        assert_eq!(channel.send_channel(), 1);
        assert_eq!(channel.queue_count(), 0);
        assert_eq!(alive.last_event(), 1);
    }

    #[tokio::test]
    async fn test_immediate_policy_drops_after_one_pass() {
        let channel = channel();
        assert!(channel.change_event_policy(EventPolicy::Immediate, None, None));
        let (alive, _alive_body) = EventStream::new("/events", "10.0.0.1");
        let (gone, gone_body) = EventStream::new("/events", "10.0.0.2");
        channel.register_new_stream(&[], alive, false);
        channel.register_new_stream(&[], gone, false);
        drop(gone_body);
        channel.post_event("x", None, EventType::Message, "");
        channel.send_channel();
        assert_eq!(channel.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_send_to_every_socket() {
        let channel = channel();
        let (a, mut a_peer) = open_socket("10.0.0.1").await;
        let (b, mut b_peer) = open_socket("10.0.0.2").await;
        assert!(channel.register_new_socket(&[], Arc::clone(&a), false));
        assert!(channel.register_new_socket(&[], Arc::clone(&b), false));
        // Serving started before registration, so on_open went nowhere.
        channel.on_open_socket(&a);
        channel.on_open_socket(&b);

        channel.post_event("to all", None, EventType::Message, "");
        assert_eq!(channel.send_channel(), 1);
        assert_eq!(a_peer.read_text().await, "to all");
        assert_eq!(b_peer.read_text().await, "to all");
        assert_eq!(channel.queue_count(), 0);

        // A socket whose connection is gone is dropped, the other keeps receiving.
        b.close_socket(CLOSE_NORMAL, "bye");
        channel.post_event("second", None, EventType::Message, "");
        assert_eq!(channel.send_channel(), 1);
        assert_eq!(a_peer.read_text().await, "second");
        assert_eq!(channel.client_count(), 1);
    }

    #[tokio::test]
    async fn test_last_socket_failing_disconnects_channel() {
        let channel = channel();
        let (socket, _peer) = open_socket("10.0.0.1").await;
        channel.register_new_socket(&[], Arc::clone(&socket), false);
        channel.on_open_socket(&socket);
        socket.close_socket(CLOSE_NORMAL, "gone");

        channel.post_event("lost", None, EventType::Message, "");
        assert_eq!(channel.send_channel(), 0);
        assert_eq!(channel.driver_type(), DriverType::NotConnected);
        assert_eq!(channel.client_count(), 0);
        assert_eq!(channel.queue_count(), 1);

        // Nothing left for the next sweep to tear down.
        channel.check_channel();
        assert!(channel.change_event_policy(EventPolicy::SureDelivery, Some(noop_callback()), None));
        let pool = Collector::new(usize::MAX);
        channel.receiving(&pool);
        let closes = pool.types().into_iter().filter(|t| *t == EventType::Close).count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn test_last_stream_failing_disconnects_channel() {
        let channel = channel();
        let (stream, body) = EventStream::new("/events", "10.0.0.1");
        channel.register_new_stream(&[], stream, false);
        drop(body);
        channel.post_event("lost", None, EventType::Message, "");
        assert_eq!(channel.send_channel(), 0);
        assert_eq!(channel.driver_type(), DriverType::NotConnected);
        assert_eq!(channel.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_socket_policy_and_auth() {
        let channel = channel();
        assert!(channel.change_event_policy(EventPolicy::HighSecurity, None, None));
        let (socket, _rx) = WebSocket::new("/events", "10.0.0.5", None, WebSocketConfig::default());
        assert!(!channel.register_new_socket(&[], Arc::clone(&socket), false));

        let channel = self::channel();
        assert!(!channel.register_new_socket(&[], Arc::clone(&socket), true));
        let cookies = vec![("EventChannel".to_string(), "secret".to_string())];
        assert!(channel.register_new_socket(&cookies, socket, true));
        assert_eq!(channel.driver_type(), DriverType::Sockets);
    }

    #[tokio::test]
    async fn test_check_channel_drops_closed_socket() {
        let channel = channel();
        let (socket, _peer) = open_socket("10.0.0.1").await;
        channel.register_new_socket(&[], Arc::clone(&socket), false);
        channel.on_open_socket(&socket);
        socket.close_socket(CLOSE_NORMAL, "done");
        channel.check_channel();
        assert_eq!(channel.driver_type(), DriverType::NotConnected);
        assert_eq!(channel.client_count(), 0);
        assert!(channel.change_event_policy(EventPolicy::SureDelivery, Some(noop_callback()), None));
        let pool = Collector::new(usize::MAX);
        channel.receiving(&pool);
        assert!(pool.types().contains(&EventType::Close));
    }
}
