//! JSON message subsystem.
//!
//! # Data Flow
//! ```text
//! raw body bytes
//!     → cursor.rs (byte cursor with rewind)
//!     → parser.rs (recursive descent, first error wins)
//!     → JsonMessage (value tree + last error)
//!     → path.rs (JSONPath over Arc<JsonMessage>)
//!     → serialize.rs (compact or pretty text)
//! ```
//!
//! # Design Decisions
//! - Object members are an ordered list, not a map
//! - Integers outside the i32 range become arbitrary-precision decimals
//! - Path results are positions into the tree, never copies

pub mod cursor;
pub mod parser;
pub mod path;
pub mod serialize;
pub mod value;

pub use parser::{JsonError, JsonErrorCode};
pub use path::{JsonPath, NodeRef, PathStatus};
pub use value::{JsonKind, JsonMessage, JsonPair, JsonValue};
