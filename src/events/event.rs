//! Events travelling through a channel, in both directions.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;

use crate::websocket::socket::AppData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Open,
    Message,
    Binary,
    Error,
    Close,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Open => "open",
            EventType::Message => "message",
            EventType::Binary => "binary",
            EventType::Error => "error",
            EventType::Close => "close",
        }
    }

    /// Case-insensitive; anything unknown is a plain message.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "open" => EventType::Open,
            "binary" => EventType::Binary,
            "error" => EventType::Error,
            "close" => EventType::Close,
            _ => EventType::Message,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 32-bit routing hash of a sender identity. Never zero, since zero
/// means broadcast.
pub fn sender_hash(sender: &str) -> u32 {
    let mut hasher = DefaultHasher::new();
    sender.to_ascii_lowercase().hash(&mut hasher);
    let hash = hasher.finish();
    let folded = (hash as u32) ^ ((hash >> 32) as u32);
    if folded == 0 {
        1
    } else {
        folded
    }
}

/// An outbound event in a channel queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub number: u64,
    /// Delivery passes that included this event.
    pub sent: u32,
    /// 0 for broadcast, otherwise [`sender_hash`] of the one recipient.
    pub filter: u32,
    pub event_type: EventType,
    /// Application event name for SSE `event:` lines.
    pub type_name: String,
    pub payload: Bytes,
}

impl Event {
    pub fn new(number: u64, event_type: EventType, payload: impl Into<Bytes>) -> Self {
        Self {
            number,
            sent: 0,
            filter: 0,
            event_type,
            type_name: String::new(),
            payload: payload.into(),
        }
    }

    /// Whether a client with this sender hash should receive the event.
    pub fn matches(&self, sender: u32) -> bool {
        self.filter == 0 || self.filter == sender
    }

    /// Payload as text; binary payloads are lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// An inbound event handed to the application.
#[derive(Clone)]
pub struct ChannelEvent {
    pub channel: String,
    pub channel_number: u64,
    pub event_type: EventType,
    pub payload: Bytes,
    pub app_data: Option<AppData>,
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEvent")
            .field("channel", &self.channel)
            .field("event_type", &self.event_type)
            .field("len", &self.payload.len())
            .finish()
    }
}

impl ChannelEvent {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback receiving inbound channel events on a worker.
pub type EventCallback = Arc<dyn Fn(ChannelEvent) -> Result<(), BoxError> + Send + Sync>;
