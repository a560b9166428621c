//! Long-polling exchange bodies.
//!
//! Client → server: `{"Message": "...", "Type": "message", "Acknowledged": 3, "CloseChannel": false}`,
//! every field optional.
//! Server → client: `{"Number": 4, "Message": "...", "Type": "message"}`,
//! `{"Empty": true}` or `{"ChannelClosed": true}`.

use base64::Engine;
use bigdecimal::{BigDecimal, ToPrimitive};

use crate::events::event::{Event, EventType};
use crate::json::{JsonMessage, JsonPair, JsonValue};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LongPollRequest {
    pub message: String,
    pub event_type: Option<EventType>,
    pub acknowledged: u64,
    pub close_channel: bool,
}

fn field_u64(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Int(n) => u64::try_from(*n).ok(),
        JsonValue::Decimal(d) => d.to_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn field_bool(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(b) => *b,
        JsonValue::Int(n) => *n != 0,
        JsonValue::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        _ => false,
    }
}

impl LongPollRequest {
    /// Read the fields from a parsed body. An empty body is a plain poll.
    pub fn from_json(message: &JsonMessage) -> Self {
        let value = message.value();
        Self {
            message: value
                .get("Message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            event_type: value.get("Type").and_then(|v| v.as_str()).map(EventType::parse),
            acknowledged: value.get("Acknowledged").and_then(field_u64).unwrap_or(0),
            close_channel: value.get("CloseChannel").map(field_bool).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LongPollResponse {
    Event {
        number: u64,
        event_type: EventType,
        message: String,
    },
    Empty,
    ChannelClosed,
}

impl LongPollResponse {
    /// Binary payloads are sent base64 encoded.
    pub fn event(event: &Event) -> Self {
        let message = match event.event_type {
            EventType::Binary => base64::engine::general_purpose::STANDARD.encode(&event.payload),
            _ => event.text(),
        };
        LongPollResponse::Event {
            number: event.number,
            event_type: event.event_type,
            message,
        }
    }

    pub fn to_json(&self) -> JsonMessage {
        let pairs = match self {
            LongPollResponse::Event {
                number,
                event_type,
                message,
            } => {
                let number = match i32::try_from(*number) {
                    Ok(n) => JsonValue::Int(n),
                    Err(_) => JsonValue::Decimal(BigDecimal::from(*number)),
                };
                vec![
                    JsonPair::new("Number", number),
                    JsonPair::new("Message", JsonValue::String(message.clone())),
                    JsonPair::new("Type", JsonValue::String(event_type.as_str().to_string())),
                ]
            }
            LongPollResponse::Empty => vec![JsonPair::new("Empty", JsonValue::Bool(true))],
            LongPollResponse::ChannelClosed => {
                vec![JsonPair::new("ChannelClosed", JsonValue::Bool(true))]
            }
        };
        JsonMessage::from_value(JsonValue::Object(pairs))
    }
}
