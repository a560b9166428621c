//! Server side WebSocket runtime.
//!
//! # Responsibilities
//! - Own one upgraded connection: read loop, writer task, keepalive
//! - Reassemble fragmented messages and answer control frames
//! - Dispatch open/message/binary/error/close to a [`SocketHandler`]
//! - Run the close handshake with a bounded wait for the peer
//!
//! Writes never block: frames go into an unbounded queue drained by the
//! writer task, so `write_*` may be called while other locks are held.
//! `close_socket` only sends the close frame; `on_close` is raised from
//! the serving task once the connection is really gone.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;

use crate::config::schema::WebSocketConfig;
use crate::observability::metrics;
use crate::websocket::frame::{
    clamp_fragment_size, decode_close_payload, decode_frame, encode_close_payload, encode_frame,
    fragment_message, is_valid_close_code, validate_frame, Frame, FrameError, FragmentQueue,
    Opcode, CLOSE_ABNORMAL, CLOSE_BYERROR, CLOSE_NOCLOSE, CLOSE_NORMAL,
};

/// Opaque application data attached to a socket.
pub type AppData = Arc<dyn Any + Send + Sync>;

/// Callbacks raised by a socket. All have empty defaults.
pub trait SocketHandler: Send + Sync {
    fn on_open(&self, _socket: &WebSocket) {}
    fn on_message(&self, _socket: &WebSocket, _text: &str) {}
    fn on_binary(&self, _socket: &WebSocket, _data: &[u8]) {}
    fn on_error(&self, _socket: &WebSocket, _error: &str) {}
    fn on_close(&self, _socket: &WebSocket, _code: u16, _reason: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    /// Our close frame is out, waiting for the peer's.
    Closing,
    Closed,
}

/// Item for the writer task.
#[derive(Debug)]
pub enum Outbound {
    Data(Bytes),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SocketStatistics {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub struct WebSocket {
    uri: String,
    sender: String,
    protocol: Option<String>,
    parameters: Vec<(String, String)>,
    config: WebSocketConfig,
    tx: mpsc::UnboundedSender<Outbound>,
    state: Mutex<SocketState>,
    close_started: Mutex<Option<Instant>>,
    close_info: Mutex<Option<(u16, String)>>,
    fragments: Mutex<FragmentQueue>,
    handler: RwLock<Option<Arc<dyn SocketHandler>>>,
    app_data: RwLock<Option<AppData>>,
    pong: Notify,
    closing: Notify,
    closed: watch::Sender<bool>,
    served: AtomicBool,
    counters: Counters,
}

impl std::fmt::Debug for WebSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocket")
            .field("uri", &self.uri)
            .field("sender", &self.sender)
            .field("state", &self.state())
            .finish()
    }
}

/// Outcome of the read loop.
enum Ending {
    Peer(u16, String),
    Timeout,
    Eof,
    /// Protocol error already reported through `on_error`.
    Protocol(u16, String),
    Failed(String),
}

impl WebSocket {
    /// A socket for an accepted upgrade of `uri` from `sender`. The
    /// receiver must be handed to [`WebSocket::serve`].
    pub fn new(
        uri: &str,
        sender: &str,
        protocol: Option<String>,
        config: WebSocketConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let parameters = uri
            .split_once('?')
            .map(|(_, query)| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();
        let fragments = FragmentQueue::new(config.max_message_size);
        let socket = Arc::new(Self {
            uri: uri.to_string(),
            sender: sender.to_string(),
            protocol,
            parameters,
            config,
            tx,
            state: Mutex::new(SocketState::Connecting),
            close_started: Mutex::new(None),
            close_info: Mutex::new(None),
            fragments: Mutex::new(fragments),
            handler: RwLock::new(None),
            app_data: RwLock::new(None),
            pong: Notify::new(),
            closing: Notify::new(),
            closed,
            served: AtomicBool::new(false),
            counters: Counters::default(),
        });
        (socket, rx)
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Identity of the remote party, used for event filtering.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Query parameter from the upgrade URL.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn set_handler(&self, handler: Arc<dyn SocketHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    fn handler(&self) -> Option<Arc<dyn SocketHandler>> {
        self.handler.read().ok().and_then(|h| h.clone())
    }

    pub fn set_app_data(&self, data: Option<AppData>) {
        if let Ok(mut slot) = self.app_data.write() {
            *slot = data;
        }
    }

    pub fn app_data(&self) -> Option<AppData> {
        self.app_data.read().ok().and_then(|d| d.clone())
    }

    pub fn state(&self) -> SocketState {
        self.state.lock().map(|s| *s).unwrap_or(SocketState::Closed)
    }

    fn set_state(&self, state: SocketState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    pub fn is_open_for_writing(&self) -> bool {
        self.state() == SocketState::Open
    }

    pub fn is_open_for_reading(&self) -> bool {
        matches!(self.state(), SocketState::Open | SocketState::Closing)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SocketState::Closed
    }

    /// Code and reason of the close frame the peer sent, if any.
    pub fn get_close(&self) -> Option<(u16, String)> {
        self.close_info.lock().ok().and_then(|c| c.clone())
    }

    /// Fragments held for the message currently being received.
    pub fn number_of_fragments(&self) -> usize {
        self.fragments.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn statistics(&self) -> SocketStatistics {
        SocketStatistics {
            frames_in: self.counters.frames_in.load(Ordering::Relaxed),
            frames_out: self.counters.frames_out.load(Ordering::Relaxed),
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
        }
    }

    fn push(&self, frame: Bytes) -> bool {
        let len = frame.len() as u64;
        if self.tx.send(Outbound::Data(frame)).is_err() {
            return false;
        }
        self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_out.fetch_add(len, Ordering::Relaxed);
        metrics::record_frame("out");
        true
    }

    fn write_message(&self, opcode: Opcode, payload: &[u8]) -> bool {
        if !self.is_open_for_writing() {
            return false;
        }
        let size = clamp_fragment_size(self.config.fragment_size);
        fragment_message(opcode, payload, size, false)
            .into_iter()
            .all(|frame| self.push(frame))
    }

    pub fn write_string(&self, text: &str) -> bool {
        self.write_message(Opcode::Text, text.as_bytes())
    }

    pub fn write_binary(&self, data: &[u8]) -> bool {
        self.write_message(Opcode::Binary, data)
    }

    /// Send a ping. With `wait` set, resolve to whether a pong arrived
    /// within the ping timeout.
    pub async fn send_ping(&self, wait: bool) -> bool {
        if !self.is_open_for_writing() {
            return false;
        }
        let notified = self.pong.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.push(encode_frame(Opcode::Ping, b"keepalive", true, None)) {
            return false;
        }
        if !wait {
            return true;
        }
        let timeout = Duration::from_millis(self.config.ping_timeout_ms);
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    /// Start the close handshake. Returns false if it already started.
    pub fn close_socket(&self, code: u16, reason: &str) -> bool {
        {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            match *state {
                SocketState::Open => *state = SocketState::Closing,
                SocketState::Connecting => {
                    *state = SocketState::Closed;
                    drop(state);
                    let _ = self.tx.send(Outbound::Shutdown);
                    self.closed.send_replace(true);
                    return true;
                }
                SocketState::Closing | SocketState::Closed => return false,
            }
        }
        if let Ok(mut started) = self.close_started.lock() {
            *started = Some(Instant::now());
        }
        self.push(encode_frame(Opcode::Close, &encode_close_payload(code, reason), true, None));
        tracing::debug!(uri = %self.uri, code, reason, "WebSocket close sent");
        self.closing.notify_waiters();
        true
    }

    /// Resolve once the connection is torn down.
    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn close_deadline(&self) -> Option<Instant> {
        let started = self.close_started.lock().ok().and_then(|s| *s)?;
        Some(started + Duration::from_millis(self.config.close_timeout_ms))
    }

    fn protocol_error(&self, error: &FrameError) {
        tracing::debug!(uri = %self.uri, error = %error, "WebSocket protocol error");
        if let Some(handler) = self.handler() {
            handler.on_error(self, &error.to_string());
        }
        if let Ok(mut fragments) = self.fragments.lock() {
            fragments.clear();
        }
        self.close_socket(error.close_code(), &error.to_string());
    }

    /// Handle one received frame. Returns the peer's close when it arrives.
    fn handle_frame(&self, frame: Frame) -> Option<(u16, String)> {
        self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes_in.fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
        metrics::record_frame("in");

        if let Err(e) = validate_frame(&frame, true) {
            self.protocol_error(&e);
            return None;
        }

        match frame.opcode {
            Opcode::Ping => {
                self.push(encode_frame(Opcode::Pong, &frame.payload, true, None));
                None
            }
            Opcode::Pong => {
                self.pong.notify_waiters();
                None
            }
            Opcode::Close => Some(decode_close_payload(&frame.payload)),
            _ => {
                // Closing: data still in flight from the peer is dropped.
                if self.state() != SocketState::Open {
                    return None;
                }
                let complete = match self.fragments.lock() {
                    Ok(mut fragments) => fragments.push(frame),
                    Err(_) => return None,
                };
                match complete {
                    Ok(Some((Opcode::Text, payload))) => match std::str::from_utf8(&payload) {
                        Ok(text) => {
                            if let Some(handler) = self.handler() {
                                handler.on_message(self, text);
                            }
                        }
                        Err(_) => self.protocol_error(&FrameError::InvalidUtf8),
                    },
                    Ok(Some((_, payload))) => {
                        if let Some(handler) = self.handler() {
                            handler.on_binary(self, &payload);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => self.protocol_error(&e),
                }
                None
            }
        }
    }

    /// Serve the upgraded connection until it closes.
    pub async fn serve<IO>(self: Arc<Self>, io: IO, mut rx: mpsc::UnboundedReceiver<Outbound>)
    where
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.served.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if *state != SocketState::Connecting {
                return;
            }
            *state = SocketState::Open;
        }

        let (mut reader, mut writer) = tokio::io::split(io);
        let uri = self.uri.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                match item {
                    Outbound::Data(bytes) => {
                        if let Err(e) = writer.write_all(&bytes).await {
                            tracing::debug!(uri = %uri, error = %e, "WebSocket write failed");
                            break;
                        }
                    }
                    Outbound::Shutdown => break,
                }
            }
            let _ = writer.shutdown().await;
        });

        if let Some(handler) = self.handler() {
            handler.on_open(&self);
        }

        let ending = self.read_loop(&mut reader).await;

        self.set_state(SocketState::Closed);
        let _ = self.tx.send(Outbound::Shutdown);
        let linger = Duration::from_millis(self.config.close_timeout_ms.max(100));
        if tokio::time::timeout(linger, writer_task).await.is_err() {
            tracing::debug!(uri = %self.uri, "WebSocket writer did not finish in time");
        }

        let (code, reason) = match ending {
            Ending::Peer(code, reason) | Ending::Protocol(code, reason) => (code, reason),
            Ending::Timeout | Ending::Eof => (CLOSE_ABNORMAL, String::new()),
            Ending::Failed(error) => {
                if let Some(handler) = self.handler() {
                    handler.on_error(&self, &error);
                }
                (CLOSE_ABNORMAL, error)
            }
        };
        tracing::debug!(uri = %self.uri, code, reason = %reason, "WebSocket closed");
        if let Some(handler) = self.handler() {
            handler.on_close(&self, code, &reason);
        }
        self.closed.send_replace(true);
    }

    async fn read_loop<R>(&self, reader: &mut R) -> Ending
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::with_capacity(8192);
        let keepalive = Duration::from_millis(self.config.keepalive_ms);
        let ping_timeout = Duration::from_millis(self.config.ping_timeout_ms);
        let mut next_ping = (!keepalive.is_zero()).then(|| Instant::now() + keepalive);
        let mut pong_deadline: Option<Instant> = None;
        let far = Instant::now() + Duration::from_secs(86_400 * 365);

        loop {
            loop {
                match decode_frame(&buffer, self.config.max_message_size) {
                    Ok(Some((frame, used))) => {
                        buffer.advance(used);
                        if frame.opcode == Opcode::Pong {
                            pong_deadline = None;
                        }
                        if let Some((code, reason)) = self.handle_frame(frame) {
                            return self.finish_close(code, reason);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.protocol_error(&e);
                        return Ending::Protocol(e.close_code(), e.to_string());
                    }
                }
            }

            let close_deadline = self.close_deadline();
            tokio::select! {
                read = reader.read_buf(&mut buffer) => match read {
                    Ok(0) => return Ending::Eof,
                    Ok(_) => {}
                    Err(e) => return Ending::Failed(e.to_string()),
                },
                _ = tokio::time::sleep_until(close_deadline.unwrap_or(far)), if close_deadline.is_some() => {
                    tracing::debug!(uri = %self.uri, "No close frame from peer");
                    return Ending::Timeout;
                }
                _ = tokio::time::sleep_until(pong_deadline.unwrap_or(far)), if pong_deadline.is_some() => {
                    tracing::info!(uri = %self.uri, "WebSocket ping timed out");
                    return Ending::Failed("ping timeout".to_string());
                }
                _ = tokio::time::sleep_until(next_ping.unwrap_or(far)), if next_ping.is_some() => {
                    if self.is_open_for_writing()
                        && self.push(encode_frame(Opcode::Ping, b"keepalive", true, None))
                        && pong_deadline.is_none()
                    {
                        pong_deadline = Some(Instant::now() + ping_timeout);
                    }
                    next_ping = Some(Instant::now() + keepalive);
                }
                _ = self.closing.notified() => {}
            }
        }
    }

    /// The peer's close frame arrived: answer it if we did not start.
    fn finish_close(&self, code: u16, reason: String) -> Ending {
        if let Ok(mut info) = self.close_info.lock() {
            *info = Some((code, reason.clone()));
        }
        if self.state() == SocketState::Open {
            self.set_state(SocketState::Closing);
            let reply = if code == CLOSE_NOCLOSE {
                CLOSE_NORMAL
            } else if is_valid_close_code(code) {
                code
            } else {
                CLOSE_BYERROR
            };
            self.push(encode_frame(Opcode::Close, &encode_close_payload(reply, ""), true, None));
        }
        Ending::Peer(code, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::frame::{mask_key, CLOSE_DATA, CLOSE_GOINGAWAY};
    use tokio::io::DuplexStream;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl SocketHandler for Recorder {
        fn on_open(&self, _socket: &WebSocket) {
            self.events.lock().unwrap().push("open".to_string());
        }
        fn on_message(&self, _socket: &WebSocket, text: &str) {
            self.events.lock().unwrap().push(format!("text:{text}"));
        }
        fn on_binary(&self, _socket: &WebSocket, data: &[u8]) {
            self.events.lock().unwrap().push(format!("binary:{}", data.len()));
        }
        fn on_close(&self, _socket: &WebSocket, code: u16, _reason: &str) {
            self.events.lock().unwrap().push(format!("close:{code}"));
        }
    }

    fn config() -> WebSocketConfig {
        WebSocketConfig {
            keepalive_ms: 0,
            close_timeout_ms: 200,
            ..WebSocketConfig::default()
        }
    }

    fn start(config: WebSocketConfig) -> (Arc<WebSocket>, Arc<Recorder>, DuplexStream) {
        let (socket, rx) = WebSocket::new("/ws?channel=news&x=1", "127.0.0.1", None, config);
        let recorder = Arc::new(Recorder::default());
        socket.set_handler(recorder.clone());
        let (server_io, client_io) = tokio::io::duplex(1 << 16);
        tokio::spawn(socket.clone().serve(server_io, rx));
        (socket, recorder, client_io)
    }

    async fn read_frame(client: &mut DuplexStream, buffer: &mut BytesMut) -> Frame {
        loop {
            if let Some((frame, used)) = decode_frame(buffer, 1 << 20).unwrap() {
                buffer.advance(used);
                return frame;
            }
            let n = client.read_buf(buffer).await.unwrap();
            assert!(n > 0, "connection closed before a frame arrived");
        }
    }

    async fn send(client: &mut DuplexStream, opcode: Opcode, payload: &[u8], fin: bool) {
        let frame = encode_frame(opcode, payload, fin, Some(mask_key()));
        client.write_all(&frame).await.unwrap();
    }

    #[test]
    fn test_query_parameters() {
        let (socket, _rx) = WebSocket::new("/ws?channel=news&x=1", "peer", None, config());
        assert_eq!(socket.parameter("channel"), Some("news"));
        assert_eq!(socket.parameter("x"), Some("1"));
        assert_eq!(socket.parameter("y"), None);
        assert!(!socket.is_open_for_writing());
    }

    #[tokio::test]
    async fn test_message_dispatch_and_fragments() {
        let (_socket, recorder, mut client) = start(config());
        send(&mut client, Opcode::Text, b"hel", false).await;
        send(&mut client, Opcode::Ping, b"p", true).await;
        send(&mut client, Opcode::Continuation, b"lo", true).await;
        send(&mut client, Opcode::Binary, &[1, 2, 3], true).await;

        let mut buffer = BytesMut::new();
        let pong = read_frame(&mut client, &mut buffer).await;
        assert_eq!(pong.opcode, Opcode::Pong);
        assert_eq!(&pong.payload[..], b"p");

        send(&mut client, Opcode::Close, &encode_close_payload(CLOSE_GOINGAWAY, "bye"), true).await;
        let close = read_frame(&mut client, &mut buffer).await;
        assert_eq!(close.opcode, Opcode::Close);
        assert_eq!(decode_close_payload(&close.payload).0, CLOSE_GOINGAWAY);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events, vec!["open", "text:hello", "binary:3", "close:1001"]);
    }

    #[tokio::test]
    async fn test_server_initiated_close() {
        let (socket, recorder, mut client) = start(config());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(socket.write_string("hi"));
        assert!(socket.close_socket(CLOSE_NORMAL, "done"));
        assert!(!socket.close_socket(CLOSE_NORMAL, "again"));
        assert!(!socket.write_string("late"));

        let mut buffer = BytesMut::new();
        let text = read_frame(&mut client, &mut buffer).await;
        assert_eq!(&text.payload[..], b"hi");
        let close = read_frame(&mut client, &mut buffer).await;
        assert_eq!(decode_close_payload(&close.payload), (CLOSE_NORMAL, "done".to_string()));

        send(&mut client, Opcode::Close, &encode_close_payload(CLOSE_NORMAL, ""), true).await;
        tokio::time::timeout(Duration::from_secs(1), socket.wait_closed()).await.unwrap();
        assert_eq!(socket.get_close(), Some((CLOSE_NORMAL, String::new())));
        assert!(recorder.events.lock().unwrap().contains(&"close:1000".to_string()));
    }

    #[tokio::test]
    async fn test_close_timeout_without_peer_reply() {
        let (socket, recorder, _client) = start(config());
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.close_socket(CLOSE_NORMAL, "");
        tokio::time::timeout(Duration::from_secs(2), socket.wait_closed()).await.unwrap();
        assert!(recorder.events.lock().unwrap().contains(&"close:1006".to_string()));
    }

    #[tokio::test]
    async fn test_unmasked_frame_is_protocol_error() {
        let (_socket, _recorder, mut client) = start(config());
        client
            .write_all(&encode_frame(Opcode::Text, b"x", true, None))
            .await
            .unwrap();
        let mut buffer = BytesMut::new();
        let close = read_frame(&mut client, &mut buffer).await;
        assert_eq!(decode_close_payload(&close.payload).0, CLOSE_BYERROR);
    }

    #[tokio::test]
    async fn test_invalid_utf8_closes_with_1007() {
        let (_socket, _recorder, mut client) = start(config());
        send(&mut client, Opcode::Text, &[0xC3, 0x28], true).await;
        let mut buffer = BytesMut::new();
        let close = read_frame(&mut client, &mut buffer).await;
        assert_eq!(decode_close_payload(&close.payload).0, CLOSE_DATA);
    }

    #[tokio::test]
    async fn test_ping_waits_for_pong() {
        let (socket, _recorder, mut client) = start(config());
        tokio::time::sleep(Duration::from_millis(20)).await;
        let pinger = {
            let socket = socket.clone();
            tokio::spawn(async move { socket.send_ping(true).await })
        };
        let mut buffer = BytesMut::new();
        let ping = read_frame(&mut client, &mut buffer).await;
        assert_eq!(ping.opcode, Opcode::Ping);
        send(&mut client, Opcode::Pong, &ping.payload, true).await;
        assert!(pinger.await.unwrap());
    }

    #[tokio::test]
    async fn test_ping_timeout() {
        let config = WebSocketConfig {
            ping_timeout_ms: 50,
            ..config()
        };
        let (socket, _recorder, _client) = start(config);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!socket.send_ping(true).await);
    }
}
