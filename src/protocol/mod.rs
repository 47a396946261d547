//! Protocol layer for the chat server
//!
//! This module provides:
//! - Newline-delimited frame encoding/decoding
//! - The tagged command grammar and reply rendering

pub mod command;
pub mod frame;

// Re-export commonly used types
pub use command::{format_chat, Command, Reply};
pub use frame::{LineCodec, DEFAULT_MAX_FRAME_SIZE};
