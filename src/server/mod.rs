//! TCP chat server implementation
//!
//! ## Components
//!
//! - **Directory**: the shared client/room registry, the only
//!   synchronized state in the system
//! - **Broadcaster**: fan-out delivery with per-recipient failure
//!   isolation
//! - **Connection handler**: one per accepted connection, running the
//!   protocol state machine
//! - **Listener**: accept loop, live-session tracking, and the
//!   shutdown sequence

pub mod broadcaster;
pub mod connection_handler;
pub mod directory;
pub mod listener;

pub use connection_handler::{ConnectionHandler, SessionCommand, SessionSender};
pub use directory::Directory;
pub use listener::{ChatServer, ServerHandle};
