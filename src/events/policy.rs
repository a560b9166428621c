//! Channel delivery policies and transport modes.

use serde::Serialize;

/// What a channel promises its application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPolicy {
    /// Every event is kept until a transport delivered it.
    #[default]
    SureDelivery,
    /// Client messages flow back; needs sockets or long polling.
    TwoWayMessages,
    /// Binary payloads; SSE cannot carry them natively.
    Binary,
    /// No WebSockets, only authenticated streams and polls.
    HighSecurity,
    /// Server to client, dropped after one delivery pass.
    Immediate,
    /// No live transport may be attached.
    Disconnected,
}

impl EventPolicy {
    pub fn allows_streams(&self) -> bool {
        !matches!(
            self,
            EventPolicy::TwoWayMessages | EventPolicy::Binary | EventPolicy::Disconnected
        )
    }

    pub fn allows_sockets(&self) -> bool {
        !matches!(self, EventPolicy::HighSecurity | EventPolicy::Disconnected)
    }

    /// Events stay queued until fully delivered.
    pub fn requires_delivery(&self) -> bool {
        !matches!(self, EventPolicy::Immediate)
    }
}

/// The one transport class a channel currently delivers through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverType {
    #[default]
    NotConnected,
    Sockets,
    ServerEvents,
    LongPolling,
}

impl DriverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverType::NotConnected => "not_connected",
            DriverType::Sockets => "sockets",
            DriverType::ServerEvents => "server_events",
            DriverType::LongPolling => "long_polling",
        }
    }
}
