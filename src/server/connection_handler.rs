//! Per-connection protocol state machine
//!
//! One handler runs per accepted connection, translating wire frames
//! into directory and broadcaster operations. Session states:
//!
//! ```text
//! AwaitingName --insert--> Active --quit/disconnect--> terminated
//! ```
//!
//! All outbound traffic for a session (replies and broadcasts alike)
//! goes through one mpsc channel drained by a dedicated writer task,
//! so a fixed recipient sees a fixed sender's messages in send order
//! and a slow peer never blocks another handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::{Command, LineCodec, Reply};
use crate::server::broadcaster;
use crate::server::directory::{Directory, RosterUpdate};
use crate::ChatConfig;

/// Commands that can be sent to a session's writer task
#[derive(Debug)]
pub enum SessionCommand {
    /// Deliver one frame to the client
    Deliver(String),

    /// Flush and close the connection
    Close,
}

/// Outbound channel of a session
pub type SessionSender = mpsc::UnboundedSender<SessionCommand>;

/// Protocol state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Waiting for the client to claim a display name
    AwaitingName,
    /// Name registered, full command grammar available
    Active,
}

/// What the handler should do after processing a frame
enum Flow {
    Continue,
    Terminate,
}

/// Per-connection handler running the protocol state machine
pub struct ConnectionHandler {
    /// Session ID for tracking and logging
    session_id: String,

    /// Remote peer address
    remote_addr: SocketAddr,

    /// Shared directory
    directory: Arc<Directory>,

    /// Server configuration
    config: ChatConfig,

    /// Outbound channel (shared with the server's session table)
    command_tx: SessionSender,

    /// Receiver handed to the writer task on startup
    command_rx: Option<mpsc::UnboundedReceiver<SessionCommand>>,

    /// Registered display name, set on successful insert
    name: Option<String>,

    /// Current protocol state
    state: SessionState,
}

impl ConnectionHandler {
    /// Create a new connection handler
    pub fn new(
        directory: Arc<Directory>,
        config: ChatConfig,
        session_id: String,
        remote_addr: SocketAddr,
        command_tx: SessionSender,
        command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) -> Self {
        Self {
            session_id,
            remote_addr,
            directory,
            config,
            command_tx,
            command_rx: Some(command_rx),
            name: None,
            state: SessionState::AwaitingName,
        }
    }

    /// Run the session to completion
    ///
    /// This is the main entry point that should be spawned as a task.
    /// Cleanup is unconditional: whatever ends the session (quit, EOF,
    /// reset, idle timeout, shutdown), the client is detached from its
    /// room, remaining members get a roster update, and the name is
    /// released.
    pub async fn run(mut self, stream: TcpStream, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Session {} opened from {}",
            self.session_id, self.remote_addr
        );

        let (read_half, write_half) = stream.into_split();

        let command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| ChatError::connection("Session already started"))?;
        let writer = tokio::spawn(Self::write_loop(write_half, command_rx));

        let result = self.read_loop(read_half, &mut shutdown).await;

        // Release directory state and notify the rest of the room
        if let Some(name) = self.name.take() {
            if let Some(update) = self.directory.remove_client(&name).await {
                Self::broadcast_roster(&update);
            }
            info!("Session {}: '{}' left the directory", self.session_id, name);
        }

        let _ = self.command_tx.send(SessionCommand::Close);
        let _ = writer.await;

        match result {
            Ok(()) => {
                info!("Session {} closed", self.session_id);
                Ok(())
            }
            Err(e) if e.is_disconnect() => {
                // Ungraceful quit: same cleanup as above, not a crash
                info!("Session {} disconnected: {}", self.session_id, e);
                Ok(())
            }
            Err(e) => {
                warn!("Session {} failed: {}", self.session_id, e);
                Err(e)
            }
        }
    }

    /// Read frames until quit, disconnect, or shutdown
    async fn read_loop(
        &mut self,
        mut read: OwnedReadHalf,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut codec = LineCodec::with_max_frame_size(self.config.max_frame_size);
        let mut buf = vec![0u8; 1024];
        let idle = Duration::from_secs(self.config.idle_timeout_secs);

        loop {
            let n = tokio::select! {
                res = timeout(idle, read.read(&mut buf)) => match res {
                    Ok(Ok(0)) => return Err(ChatError::connection("Peer closed connection")),
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        return Err(ChatError::connection(format!(
                            "Idle for more than {:?}",
                            idle
                        )));
                    }
                },
                _ = shutdown.changed() => {
                    debug!("Session {} stopping for shutdown", self.session_id);
                    return Ok(());
                }
            };

            codec.feed(&buf[..n]);
            while let Some(line) = codec
                .decode_next()
                .map_err(|e| ChatError::protocol(e.to_string()))?
            {
                let flow = match self.state {
                    SessionState::AwaitingName => self.handle_awaiting_name(&line).await?,
                    SessionState::Active => self.handle_active(&line).await?,
                };
                if let Flow::Terminate = flow {
                    return Ok(());
                }
            }
        }
    }

    /// Handle one frame in the `AwaitingName` state
    ///
    /// Grammar here is `quit | insert{name}`; everything else draws an
    /// invalid-nickname reply and the state is unchanged.
    async fn handle_awaiting_name(&mut self, line: &str) -> Result<Flow> {
        match Command::parse(line) {
            Command::Quit => {
                self.reply(Reply::QuitOk)?;
                Ok(Flow::Terminate)
            }
            Command::Insert(name) => {
                if self
                    .directory
                    .register_client(&name, self.command_tx.clone())
                    .await
                {
                    info!(
                        "Session {}: registered as '{}'",
                        self.session_id, name
                    );
                    self.name = Some(name);
                    self.state = SessionState::Active;
                    // Success is implicit: no reply
                } else {
                    debug!(
                        "Session {}: name '{}' rejected",
                        self.session_id, name
                    );
                    self.reply(Reply::InsertInvalid)?;
                }
                Ok(Flow::Continue)
            }
            _ => {
                self.reply(Reply::InsertInvalid)?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Handle one frame in the `Active` state
    async fn handle_active(&mut self, line: &str) -> Result<Flow> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| ChatError::protocol("Active session without a name"))?;

        match Command::parse(line) {
            Command::Quit => {
                // Leave semantics without the leave reply
                if let Some(update) = self.directory.remove_client(&name).await {
                    Self::broadcast_roster(&update);
                }
                self.name = None;
                self.reply(Reply::QuitOk)?;
                Ok(Flow::Terminate)
            }
            Command::Rooms => {
                let rooms = self.directory.list_rooms().await;
                self.reply(Reply::Rooms(rooms))?;
                Ok(Flow::Continue)
            }
            Command::Online(Some(room)) => {
                match self.directory.list_members(&room).await {
                    Some(members) => self.reply(Reply::Online(members))?,
                    None => self.reply(Reply::OnlineNoRoom)?,
                }
                Ok(Flow::Continue)
            }
            Command::Online(None) => {
                self.reply(Reply::OnlineNoRoom)?;
                Ok(Flow::Continue)
            }
            Command::Join(room) => {
                match self.directory.join_room(&name, &room).await {
                    Some(outcome) => {
                        debug!(
                            "Session {}: '{}' joined room '{}'",
                            self.session_id, name, room
                        );
                        self.reply(Reply::JoinOk)?;
                        if let Some(departed) = &outcome.departed {
                            Self::broadcast_roster(departed);
                        }
                        Self::broadcast_roster(&outcome.joined);
                    }
                    None => self.reply(Reply::JoinFailed)?,
                }
                Ok(Flow::Continue)
            }
            Command::Leave => {
                match self.directory.leave_room(&name).await {
                    Some(update) => {
                        debug!(
                            "Session {}: '{}' left room '{}'",
                            self.session_id, name, update.room
                        );
                        self.reply(Reply::LeaveOk)?;
                        Self::broadcast_roster(&update);
                    }
                    None => self.reply(Reply::LeaveNoRoom)?,
                }
                Ok(Flow::Continue)
            }
            Command::Create(room) => {
                if self.directory.create_room(&room).await {
                    debug!(
                        "Session {}: '{}' created room '{}'",
                        self.session_id, name, room
                    );
                    self.reply(Reply::CreateOk)?;
                } else {
                    self.reply(Reply::CreateFailed)?;
                }
                Ok(Flow::Continue)
            }
            // Insert is not part of the Active grammar, so it falls
            // through to chat like any other unmatched input
            Command::Insert(_) | Command::Chat(_) => {
                self.handle_chat(&name, line).await;
                Ok(Flow::Continue)
            }
        }
    }

    /// Broadcast a chat line to the sender's current room
    ///
    /// A client with no current room has its message dropped silently;
    /// the protocol defines no error reply for this case.
    async fn handle_chat(&self, name: &str, line: &str) {
        match self.directory.chat_targets(name).await {
            Some(roster) => {
                broadcaster::broadcast(line, &roster.members, Some(name));
            }
            None => {
                debug!(
                    "Session {}: dropping chat from '{}' outside any room",
                    self.session_id, name
                );
            }
        }
    }

    /// Send the updated member list to everyone still in the room
    fn broadcast_roster(update: &RosterUpdate) {
        if update.members.is_empty() {
            return;
        }
        let names: Vec<String> = update.members.iter().map(|m| m.name.clone()).collect();
        let line = Reply::Online(names).render();
        broadcaster::broadcast(&line, &update.members, None);
    }

    /// Queue a reply frame for the writer task
    fn reply(&self, reply: Reply) -> Result<()> {
        self.command_tx
            .send(SessionCommand::Deliver(reply.render()))
            .map_err(|_| ChatError::connection("Writer task gone"))
    }

    /// Drain the session's outbound channel onto the socket
    async fn write_loop(
        mut write: OwnedWriteHalf,
        mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        while let Some(cmd) = command_rx.recv().await {
            match cmd {
                SessionCommand::Deliver(line) => {
                    if let Err(e) = write.write_all(&LineCodec::encode(&line)).await {
                        debug!("Write failed, stopping writer: {}", e);
                        break;
                    }
                }
                SessionCommand::Close => {
                    let _ = write.shutdown().await;
                    break;
                }
            }
        }
    }
}
