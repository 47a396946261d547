//! Broadcast fan-out with per-recipient failure isolation
//!
//! Delivery pushes a rendered line into each recipient's outbound
//! channel. A recipient whose session is gone is logged and skipped;
//! one dead peer never aborts delivery to the rest.

use tracing::warn;

use crate::protocol::format_chat;
use crate::server::connection_handler::SessionCommand;
use crate::server::directory::Member;

/// Deliver a message to each recipient independently
///
/// When `prefix` is set the line is sent as `[prefix]: message`,
/// otherwise verbatim.
pub fn broadcast(message: &str, recipients: &[Member], prefix: Option<&str>) {
    let line = format_chat(message, prefix);

    for recipient in recipients {
        if recipient
            .session
            .send(SessionCommand::Deliver(line.clone()))
            .is_err()
        {
            warn!(
                "Failed to deliver to '{}': session closed, skipping",
                recipient.name
            );
        }
    }
}
