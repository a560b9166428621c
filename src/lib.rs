//! Embeddable HTTP/WebSocket server runtime with server-push event
//! channels, a WebSocket frame codec, and JSON/XML documents with
//! JSONPath and XPath queries.

pub mod admin;
pub mod config;
pub mod events;
pub mod http;
pub mod json;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod websocket;
pub mod xml;

pub use config::schema::ServerConfig;
pub use events::{EventChannel, EventDriver};
pub use http::{HttpMessage, HttpServer};
pub use json::JsonMessage;
pub use lifecycle::Shutdown;
pub use xml::XmlMessage;
