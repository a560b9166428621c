//! Server-push event channels.
//!
//! A channel multiplexes WebSockets, SSE streams and long-poll exchanges
//! for one client session. Events posted by the application are numbered
//! and stay queued until every transport has them (or the client
//! acknowledges them); client messages queue up until the monitor hands
//! them to the application callback through the worker pool.
//!
//! # Data Flow
//! ```text
//! post_event ─▶ channel.rs out queue ─▶ socket / sse.rs stream / long_poll.rs
//! client ─▶ channel.rs in queue ─▶ WorkItem::ChannelEvent ─▶ EventCallback
//! driver.rs: registry, driver site, monitor loop
//! ```

pub mod brute_force;
pub mod channel;
pub mod driver;
pub mod event;
pub mod long_poll;
pub mod policy;
pub mod sse;

pub use brute_force::BruteForceGuard;
pub use channel::{ChannelStatus, EventChannel};
pub use driver::EventDriver;
pub use event::{BoxError, ChannelEvent, Event, EventCallback, EventType};
pub use long_poll::{LongPollRequest, LongPollResponse};
pub use policy::{DriverType, EventPolicy};
pub use sse::{EventStream, ServerEvent};
