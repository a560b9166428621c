//! Server-Sent Events transport.
//!
//! Events are written as
//! ```text
//! event: <type>
//! id: <n>
//! data: <line>
//!
//! ```
//! into a response body that stays open until the stream is closed or the
//! client goes away.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use axum::body::Body;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::websocket::socket::AppData;

static STREAM_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// One event in SSE wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEvent {
    pub event: String,
    pub id: u64,
    pub data: String,
}

impl ServerEvent {
    pub fn new(event: &str, id: u64, data: &str) -> Self {
        Self {
            event: event.to_string(),
            id,
            data: data.to_string(),
        }
    }

    /// Binary payloads travel base64 encoded.
    pub fn binary(event: &str, id: u64, data: &[u8]) -> Self {
        Self::new(event, id, &base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn encode(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 32);
        if !self.event.is_empty() {
            out.push_str("event: ");
            out.push_str(&self.event);
            out.push('\n');
        }
        if self.id > 0 {
            out.push_str(&format!("id: {}\n", self.id));
        }
        if self.data.is_empty() {
            out.push_str("data: \n");
        }
        for line in self.data.lines() {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// Marks the stream closed once the response body is dropped.
struct BodyGuard(watch::Sender<bool>);

impl Drop for BodyGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

/// A live event stream towards one client.
pub struct EventStream {
    id: u64,
    uri: String,
    sender: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    closed: watch::Sender<bool>,
    last_event: AtomicU64,
    app_data: RwLock<Option<AppData>>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("id", &self.id)
            .field("uri", &self.uri)
            .field("open", &self.is_open())
            .finish()
    }
}

impl EventStream {
    /// A stream plus the response body feeding it to the client.
    pub fn new(uri: &str, sender: &str) -> (Arc<Self>, Body) {
        let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
        let (closed, _) = watch::channel(false);
        let guard = BodyGuard(closed.clone());
        let stream = Arc::new(Self {
            id: STREAM_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            uri: uri.to_string(),
            sender: sender.to_string(),
            tx: Mutex::new(Some(tx)),
            closed,
            last_event: AtomicU64::new(0),
            app_data: RwLock::new(None),
        });
        let body = Body::from_stream(futures_util::stream::unfold(
            (rx, guard),
            |(mut rx, guard)| async move {
                let chunk = rx.recv().await?;
                Some((Ok::<_, Infallible>(chunk), (rx, guard)))
            },
        ));
        (stream, body)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn is_open(&self) -> bool {
        !*self.closed.borrow()
            && self.tx.lock().map(|tx| tx.is_some()).unwrap_or(false)
    }

    fn write(&self, chunk: Bytes) -> bool {
        let Ok(mut slot) = self.tx.lock() else {
            return false;
        };
        let Some(tx) = slot.as_ref() else {
            return false;
        };
        if tx.send(chunk).is_err() {
            *slot = None;
            drop(slot);
            self.closed.send_replace(true);
            return false;
        }
        true
    }

    pub fn send_event(&self, event: &ServerEvent) -> bool {
        if *self.closed.borrow() {
            return false;
        }
        let ok = self.write(event.encode());
        if ok && event.id > 0 {
            self.last_event.store(event.id, Ordering::Relaxed);
        }
        ok
    }

    /// Comment line, used as keepalive.
    pub fn send_comment(&self, text: &str) -> bool {
        self.write(Bytes::from(format!(": {text}\n\n")))
    }

    pub fn last_event(&self) -> u64 {
        self.last_event.load(Ordering::Relaxed)
    }

    /// End the response body. Idempotent.
    pub fn close(&self) {
        if let Ok(mut slot) = self.tx.lock() {
            *slot = None;
        }
        self.closed.send_replace(true);
    }

    pub async fn wait_closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub fn set_app_data(&self, data: Option<AppData>) {
        if let Ok(mut slot) = self.app_data.write() {
            *slot = data;
        }
    }

    pub fn app_data(&self) -> Option<AppData> {
        self.app_data.read().ok().and_then(|d| d.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_format() {
        let event = ServerEvent::new("message", 3, "hello");
        assert_eq!(event.encode(), Bytes::from("event: message\nid: 3\ndata: hello\n\n"));
        let multi = ServerEvent::new("message", 0, "a\nb");
        assert_eq!(multi.encode(), Bytes::from("event: message\ndata: a\ndata: b\n\n"));
    }

    #[test]
    fn test_binary_is_base64() {
        let event = ServerEvent::binary("binary", 1, &[0, 1, 2]);
        assert_eq!(event.data, "AAEC");
    }

    #[tokio::test]
    async fn test_stream_body_and_close() {
        let (stream, body) = EventStream::new("/events", "127.0.0.1");
        assert!(stream.send_event(&ServerEvent::new("open", 1, "")));
        assert_eq!(stream.last_event(), 1);
        stream.close();
        assert!(!stream.is_open());
        assert!(!stream.send_event(&ServerEvent::new("message", 2, "x")));

        let bytes = axum::body::to_bytes(body, 1024).await.unwrap();
        assert_eq!(bytes, Bytes::from("event: open\nid: 1\ndata: \n\n"));
    }

    #[tokio::test]
    async fn test_dropped_body_closes_stream() {
        let (stream, body) = EventStream::new("/events", "127.0.0.1");
        drop(body);
        assert!(!stream.is_open());
        assert!(!stream.send_comment("ping"));
        stream.wait_closed().await;
    }
}
