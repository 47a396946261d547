//! Multi-room TCP text chat server
//!
//! This library provides a chat server where clients claim a unique
//! display name over a persistent connection, join named rooms, and
//! exchange text broadcast to the current room membership. The wire
//! protocol is newline-delimited text frames with a backslash command
//! grammar (`\insert{name}`, `\join{room}`, ...).

pub mod error;
pub mod protocol;
pub mod server;

pub use error::{ChatError, Result};
pub use server::{ChatServer, Directory, ServerHandle};

use std::net::SocketAddr;

/// Chat server configuration
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Server listen address
    pub bind_addr: SocketAddr,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Idle read timeout in seconds before a session is dropped
    pub idle_timeout_secs: u64,
    /// Maximum inbound frame size in bytes
    pub max_frame_size: usize,
    /// How long shutdown waits for handler tasks, in seconds
    pub shutdown_grace_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7878".parse().unwrap(),
            max_connections: 1000,
            idle_timeout_secs: 300,
            max_frame_size: 1024,
            shutdown_grace_secs: 5,
        }
    }
}
