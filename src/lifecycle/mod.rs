//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (HttpServer::initialize):
//!     Load config → Validate → Logging → Queue → Worker pool
//!
//! Shutdown (shutdown.rs):
//!     stop_server → Cancel queue → Close sockets and streams → Stop workers
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → stop_server
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_signal;
