//! TCP listener and server lifecycle
//!
//! The server binds a listening socket, spawns one connection handler
//! task per accepted connection, and tracks live sessions so shutdown
//! can close every client, wait a bounded grace period for handler
//! tasks to finish, and release the directory. Shutdown is idempotent:
//! sessions that already self-terminated are simply absent, and a
//! second call is a no-op.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{ChatError, Result};
use crate::server::connection_handler::{ConnectionHandler, SessionCommand, SessionSender};
use crate::server::directory::Directory;
use crate::ChatConfig;

/// State shared between the accept loop and shutdown handles
struct ServerShared {
    /// Server configuration
    config: ChatConfig,
    /// The shared client/room directory
    directory: Arc<Directory>,
    /// Outbound channels of live sessions, by session ID
    sessions: RwLock<HashMap<String, SessionSender>>,
    /// Handler tasks, joined during shutdown
    tasks: Mutex<JoinSet<()>>,
    /// Shutdown flag watched by every handler
    shutdown_tx: watch::Sender<bool>,
}

impl ServerShared {
    /// Spawn a handler task for an accepted connection
    async fn spawn_session(self: &Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.config.max_connections {
                warn!(
                    "Connection limit reached ({}), rejecting {}",
                    self.config.max_connections, remote_addr
                );
                drop(stream);
                return;
            }
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        self.sessions
            .write()
            .await
            .insert(session_id.clone(), command_tx.clone());

        let handler = ConnectionHandler::new(
            Arc::clone(&self.directory),
            self.config.clone(),
            session_id.clone(),
            remote_addr,
            command_tx,
            command_rx,
        );

        let shutdown_rx = self.shutdown_tx.subscribe();
        let shared = Arc::clone(self);
        self.tasks.lock().await.spawn(async move {
            if let Err(e) = handler.run(stream, shutdown_rx).await {
                debug!("Session {} ended with error: {}", session_id, e);
            }
            shared.sessions.write().await.remove(&session_id);
        });
    }

    /// Stop the server: close sessions, wait for handlers, release state
    async fn shutdown(&self) {
        // send_replace returns the previous value; true means another
        // caller already ran the sequence
        if self.shutdown_tx.send_replace(true) {
            debug!("Shutdown already in progress");
            return;
        }

        let sessions: Vec<(String, SessionSender)> =
            self.sessions.write().await.drain().collect();
        info!("Shutting down, closing {} live session(s)", sessions.len());

        for (session_id, tx) in sessions {
            if tx.send(SessionCommand::Close).is_err() {
                debug!("Session {} already terminated", session_id);
            }
        }

        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let deadline = Instant::now() + grace;
        let mut tasks = self.tasks.lock().await;
        while !tasks.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "{} handler task(s) did not finish within {:?}, aborting",
                        tasks.len(),
                        grace
                    );
                    tasks.abort_all();
                    break;
                }
            }
        }

        info!("Shutdown complete");
    }
}

/// A cloneable handle for triggering shutdown from another task
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    /// Stop the server; safe to call more than once
    pub async fn shutdown(&self) {
        self.shared.shutdown().await;
    }
}

/// Multi-room TCP chat server
pub struct ChatServer {
    shared: Arc<ServerShared>,
    listener: Option<TcpListener>,
}

impl ChatServer {
    /// Create a new chat server with the given configuration
    pub fn new(config: ChatConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(ServerShared {
                config,
                directory: Arc::new(Directory::new()),
                sessions: RwLock::new(HashMap::new()),
                tasks: Mutex::new(JoinSet::new()),
                shutdown_tx,
            }),
            listener: None,
        }
    }

    /// Get the shared directory
    pub fn directory(&self) -> Arc<Directory> {
        Arc::clone(&self.shared.directory)
    }

    /// Get a handle for shutting the server down from another task
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Bind the listening socket, returning the local address
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.shared.config.bind_addr)
            .await
            .map_err(|e| {
                ChatError::network(format!(
                    "Failed to bind {}: {}",
                    self.shared.config.bind_addr, e
                ))
            })?;
        let addr = listener.local_addr()?;
        info!("Chat server listening on {}", addr);
        self.listener = Some(listener);
        Ok(addr)
    }

    /// Bind (if not already bound) and run the accept loop
    pub async fn start(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        self.run().await
    }

    /// Accept connections until shutdown is triggered
    pub async fn run(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| ChatError::config("Server is not bound"))?;
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();

        if *shutdown_rx.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, remote_addr)) => {
                        debug!("Accepted connection from {}", remote_addr);
                        self.shared.spawn_session(stream, remote_addr).await;
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!("Accept loop stopping");
                    break;
                }
            }
        }

        // Dropping the listener closes the listening socket
        drop(listener);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::task::JoinHandle;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    async fn start_server() -> (ServerHandle, SocketAddr, JoinHandle<()>) {
        let config = ChatConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let mut server = ChatServer::new(config);
        let addr = server.bind().await.unwrap();
        let handle = server.handle();
        let task = tokio::spawn(async move {
            server.run().await.unwrap();
        });
        (handle, addr, task)
    }

    struct TestClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        write: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, write) = stream.into_split();
            Self {
                lines: BufReader::new(read).lines(),
                write,
            }
        }

        async fn send(&mut self, frame: &str) {
            self.write
                .write_all(format!("{}\n", frame).as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> String {
            timeout(RECV_TIMEOUT, self.lines.next_line())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .expect("connection closed unexpectedly")
        }

        async fn recv_closed(&mut self) -> bool {
            matches!(
                timeout(RECV_TIMEOUT, self.lines.next_line()).await,
                Ok(Ok(None)) | Ok(Err(_))
            )
        }

        /// Register a name and prove the registration landed by
        /// creating a throwaway room (insert success has no reply).
        async fn register(&mut self, name: &str, sync_room: &str) {
            self.send(&format!("\\insert{{{}}}", name)).await;
            self.send(&format!("\\create{{{}}}", sync_room)).await;
            assert_eq!(self.recv().await, "\\create=success");
        }
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.register("alice", "sync-a").await;

        let mut imposter = TestClient::connect(addr).await;
        imposter.send("\\insert{alice}").await;
        assert_eq!(imposter.recv().await, "\\insert=not_valid_nickname");

        // The rejected session can claim another name
        imposter.send("\\insert{bob}").await;
        imposter.send("\\rooms").await;
        assert_eq!(imposter.recv().await, "\\rooms=sync-a");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_awaiting_name_rejects_everything_else() {
        let (handle, addr, _task) = start_server().await;

        let mut client = TestClient::connect(addr).await;
        client.send("hello there").await;
        assert_eq!(client.recv().await, "\\insert=not_valid_nickname");
        client.send("\\join{lobby}").await;
        assert_eq!(client.recv().await, "\\insert=not_valid_nickname");
        client.send("\\insert{}").await;
        assert_eq!(client.recv().await, "\\insert=not_valid_nickname");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_quit_before_registration() {
        let (handle, addr, _task) = start_server().await;

        let mut client = TestClient::connect(addr).await;
        client.send("\\quit").await;
        assert_eq!(client.recv().await, "\\quit=success");
        assert!(client.recv_closed().await);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_join_roundtrip() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.send("\\insert{alice}").await;
        alice.send("\\create{lobby}").await;
        assert_eq!(alice.recv().await, "\\create=success");

        // Duplicate and empty room names fail
        alice.send("\\create{lobby}").await;
        assert_eq!(alice.recv().await, "\\create=failure");
        alice.send("\\create{}").await;
        assert_eq!(alice.recv().await, "\\create=failure");

        alice.send("\\join{lobby}").await;
        assert_eq!(alice.recv().await, "\\join=success");
        assert_eq!(alice.recv().await, "\\online=alice");

        // A second member sees the room and its roster
        let mut bob = TestClient::connect(addr).await;
        bob.register("bob", "sync-b").await;
        bob.send("\\rooms").await;
        assert_eq!(bob.recv().await, "\\rooms=lobby|sync-b");
        bob.send("\\online{lobby}").await;
        assert_eq!(bob.recv().await, "\\online=alice");

        bob.send("\\join{lobby}").await;
        assert_eq!(bob.recv().await, "\\join=success");
        assert_eq!(bob.recv().await, "\\online=alice|bob");

        // The updated roster reaches the existing member too
        assert_eq!(alice.recv().await, "\\online=alice|bob");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_unknown_room_fails() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.register("alice", "sync-a").await;

        alice.send("\\join{nope}").await;
        assert_eq!(alice.recv().await, "\\join=failure");

        // Client state unchanged: still not in any room
        alice.send("\\leave").await;
        assert_eq!(alice.recv().await, "\\leave=no_room");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_online_without_room_argument() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.register("alice", "sync-a").await;

        alice.send("\\online").await;
        assert_eq!(alice.recv().await, "\\online=no_room");
        alice.send("\\online{nope}").await;
        assert_eq!(alice.recv().await, "\\online=no_room");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_leave_is_idempotent_and_deletes_empty_room() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.send("\\insert{alice}").await;
        alice.send("\\create{lobby}").await;
        assert_eq!(alice.recv().await, "\\create=success");
        alice.send("\\join{lobby}").await;
        assert_eq!(alice.recv().await, "\\join=success");
        assert_eq!(alice.recv().await, "\\online=alice");

        alice.send("\\leave").await;
        assert_eq!(alice.recv().await, "\\leave=success");
        alice.send("\\leave").await;
        assert_eq!(alice.recv().await, "\\leave=no_room");

        // The emptied room is gone
        alice.send("\\rooms").await;
        assert_eq!(alice.recv().await, "\\rooms=");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_chat_broadcast_with_sender_tag() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.send("\\insert{alice}").await;
        alice.send("\\create{lobby}").await;
        assert_eq!(alice.recv().await, "\\create=success");
        alice.send("\\join{lobby}").await;
        assert_eq!(alice.recv().await, "\\join=success");
        assert_eq!(alice.recv().await, "\\online=alice");

        let mut bob = TestClient::connect(addr).await;
        bob.send("\\insert{bob}").await;
        bob.send("\\join{lobby}").await;
        assert_eq!(bob.recv().await, "\\join=success");
        assert_eq!(bob.recv().await, "\\online=alice|bob");
        assert_eq!(alice.recv().await, "\\online=alice|bob");

        alice.send("hello everyone").await;
        assert_eq!(bob.recv().await, "[alice]: hello everyone");
        // Every room member receives the broadcast, the sender included
        assert_eq!(alice.recv().await, "[alice]: hello everyone");

        // Per-sender ordering holds for a fixed recipient
        alice.send("one").await;
        alice.send("two").await;
        assert_eq!(bob.recv().await, "[alice]: one");
        assert_eq!(bob.recv().await, "[alice]: two");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_chat_without_room_is_dropped_silently() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.register("alice", "sync-a").await;

        alice.send("is anyone there").await;
        // No error reply: the next frame's reply arrives first
        alice.send("\\rooms").await;
        assert_eq!(alice.recv().await, "\\rooms=sync-a");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_quit_leaves_room_and_releases_name() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.send("\\insert{alice}").await;
        alice.send("\\create{lobby}").await;
        assert_eq!(alice.recv().await, "\\create=success");
        alice.send("\\join{lobby}").await;
        assert_eq!(alice.recv().await, "\\join=success");
        assert_eq!(alice.recv().await, "\\online=alice");

        let mut bob = TestClient::connect(addr).await;
        bob.send("\\insert{bob}").await;
        bob.send("\\join{lobby}").await;
        assert_eq!(bob.recv().await, "\\join=success");
        assert_eq!(bob.recv().await, "\\online=alice|bob");
        assert_eq!(alice.recv().await, "\\online=alice|bob");

        alice.send("\\quit").await;
        assert_eq!(alice.recv().await, "\\quit=success");
        assert!(alice.recv_closed().await);

        // Remaining member sees the shrunken roster,
        // and the freed name can be claimed again
        assert_eq!(bob.recv().await, "\\online=bob");
        let mut successor = TestClient::connect(addr).await;
        successor.register("alice", "sync-s").await;

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_abrupt_disconnect_cleans_up() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.send("\\insert{alice}").await;
        alice.send("\\create{lobby}").await;
        assert_eq!(alice.recv().await, "\\create=success");
        alice.send("\\join{lobby}").await;
        assert_eq!(alice.recv().await, "\\join=success");
        assert_eq!(alice.recv().await, "\\online=alice");

        let mut bob = TestClient::connect(addr).await;
        bob.send("\\insert{bob}").await;
        bob.send("\\join{lobby}").await;
        assert_eq!(bob.recv().await, "\\join=success");
        assert_eq!(bob.recv().await, "\\online=alice|bob");
        assert_eq!(alice.recv().await, "\\online=alice|bob");

        // Bob vanishes without a quit
        drop(bob);

        // Alice gets the roster update once the EOF is processed
        assert_eq!(alice.recv().await, "\\online=alice");
        alice.send("\\online{lobby}").await;
        assert_eq!(alice.recv().await, "\\online=alice");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_last_member_disconnect_deletes_room() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.send("\\insert{alice}").await;
        alice.send("\\create{lobby}").await;
        assert_eq!(alice.recv().await, "\\create=success");
        alice.send("\\join{lobby}").await;
        assert_eq!(alice.recv().await, "\\join=success");
        assert_eq!(alice.recv().await, "\\online=alice");
        drop(alice);

        // Poll until the handler's cleanup lands
        let mut observer = TestClient::connect(addr).await;
        observer.register("observer", "sync-o").await;
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            observer.send("\\rooms").await;
            let reply = observer.recv().await;
            if reply == "\\rooms=sync-o" {
                break;
            }
            assert!(Instant::now() < deadline, "room was never deleted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_moves_between_rooms() {
        let (handle, addr, _task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.send("\\insert{alice}").await;
        alice.send("\\create{red}").await;
        assert_eq!(alice.recv().await, "\\create=success");
        alice.send("\\create{blue}").await;
        assert_eq!(alice.recv().await, "\\create=success");

        alice.send("\\join{red}").await;
        assert_eq!(alice.recv().await, "\\join=success");
        assert_eq!(alice.recv().await, "\\online=alice");

        alice.send("\\join{blue}").await;
        assert_eq!(alice.recv().await, "\\join=success");
        assert_eq!(alice.recv().await, "\\online=alice");

        // Red was emptied by the move and deleted
        alice.send("\\rooms").await;
        assert_eq!(alice.recv().await, "\\rooms=blue");

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_is_idempotent() {
        let (handle, addr, task) = start_server().await;

        let mut alice = TestClient::connect(addr).await;
        alice.register("alice", "sync-a").await;

        handle.shutdown().await;
        assert!(alice.recv_closed().await);

        // Second call is a no-op, and the accept loop has stopped
        handle.shutdown().await;
        timeout(RECV_TIMEOUT, task).await.unwrap().unwrap();
    }
}
