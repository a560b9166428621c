//! WebSocket support.
//!
//! # Data Flow
//! ```text
//! HTTP upgrade request
//!     → handshake.rs (validate, accept key, subprotocol)
//!     → socket.rs (read loop + writer task over the upgraded stream)
//!     → frame.rs (encode/decode, fragments, close payloads)
//!     → SocketHandler callbacks (application or event channel)
//! ```

pub mod frame;
pub mod handshake;
pub mod socket;

pub use frame::{Frame, FrameError, FragmentQueue, Opcode};
pub use handshake::HandshakeError;
pub use socket::{AppData, Outbound, SocketHandler, SocketState, SocketStatistics, WebSocket};
