//! HTTP engine subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → queue.rs (hyper http1, prefix match, Basic auth, backlog)
//!     → pool.rs (worker picks the request up)
//!     → server.rs (start hook: request table, site lookup)
//!     → site.rs handler with a message.rs HttpMessage
//!     → response, or an upgraded WebSocket / event stream
//!     → server.rs cleanup hook (request.rs table)
//! ```

pub mod message;
pub mod pool;
pub mod queue;
pub mod request;
pub mod server;
pub mod site;
pub mod url_group;

pub use message::HttpMessage;
pub use pool::{ThreadPool, WorkItem, WorkSubmitter};
pub use request::RequestId;
pub use server::{HttpServer, ServerError, ServerState, ServerStatus};
pub use site::{ChannelType, Site, SiteHandler};
pub use url_group::{AuthConfig, AuthScheme, UrlGroup};
