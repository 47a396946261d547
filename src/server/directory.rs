//! Shared client/room registry for the chat server
//!
//! The directory is the only state shared across connection handlers.
//! Both maps live behind a single lock and every compound operation
//! (register, create, join, leave, remove) runs as one atomic unit, so
//! concurrent inserts of the same name or creates of the same room can
//! never both succeed.
//!
//! Mutating operations hand back membership snapshots (name plus
//! outbound channel) so callers broadcast roster updates without
//! holding the lock.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::server::connection_handler::SessionSender;

/// Longest accepted display name or room name
pub const MAX_NAME_LEN: usize = 50;

/// A room member snapshot handed out for broadcasting
#[derive(Debug, Clone)]
pub struct Member {
    /// Display name
    pub name: String,
    /// Outbound channel of the member's session
    pub session: SessionSender,
}

/// Snapshot of a room's membership after a mutation
///
/// An empty member list means the room was deleted by the mutation.
#[derive(Debug, Clone)]
pub struct RosterUpdate {
    /// Room name
    pub room: String,
    /// Current members, sorted by name
    pub members: Vec<Member>,
}

/// Result of a successful join
#[derive(Debug)]
pub struct JoinOutcome {
    /// Roster of the room the client implicitly left, if any
    pub departed: Option<RosterUpdate>,
    /// Roster of the joined room, including the new member
    pub joined: RosterUpdate,
}

/// A registered client
#[derive(Debug)]
struct ClientEntry {
    session: SessionSender,
    room: Option<String>,
}

#[derive(Debug, Default)]
struct DirectoryInner {
    /// Registered clients indexed by display name
    clients: HashMap<String, ClientEntry>,
    /// Room member sets indexed by room name
    rooms: HashMap<String, HashSet<String>>,
}

/// The shared directory of clients and rooms
#[derive(Debug, Default)]
pub struct Directory {
    inner: RwLock<DirectoryInner>,
}

impl Directory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically register a display name
    ///
    /// Returns false when the name is already taken or fails validation.
    pub async fn register_client(&self, name: &str, session: SessionSender) -> bool {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return false;
        }

        let mut inner = self.inner.write().await;
        if inner.clients.contains_key(name) {
            return false;
        }
        inner.clients.insert(
            name.to_string(),
            ClientEntry {
                session,
                room: None,
            },
        );
        true
    }

    /// Remove a client, detaching it from its room first
    ///
    /// No-op when the name is not registered. Returns the roster of the
    /// room the client was in, for broadcasting to remaining members.
    pub async fn remove_client(&self, name: &str) -> Option<RosterUpdate> {
        let mut inner = self.inner.write().await;
        if !inner.clients.contains_key(name) {
            return None;
        }
        let departed = Self::detach_locked(&mut inner, name);
        inner.clients.remove(name);
        departed
    }

    /// Check whether a display name is registered
    pub async fn is_registered(&self, name: &str) -> bool {
        self.inner.read().await.clients.contains_key(name)
    }

    /// Atomically create an empty room
    ///
    /// Returns false when the name is already used or fails validation.
    pub async fn create_room(&self, room: &str) -> bool {
        if room.is_empty() || room.len() > MAX_NAME_LEN {
            return false;
        }

        let mut inner = self.inner.write().await;
        if inner.rooms.contains_key(room) {
            return false;
        }
        inner.rooms.insert(room.to_string(), HashSet::new());
        true
    }

    /// Move a client into a room
    ///
    /// Returns None when the room does not exist or the client is not
    /// registered; the client's state is unchanged in that case. A
    /// client already in another room is detached from it first, so the
    /// member sets and room references stay consistent.
    pub async fn join_room(&self, name: &str, room: &str) -> Option<JoinOutcome> {
        let mut inner = self.inner.write().await;
        if !inner.rooms.contains_key(room) {
            return None;
        }

        let current = inner.clients.get(name)?.room.clone();
        let departed = if current.as_deref() == Some(room) {
            // Re-joining the current room is a no-op move
            None
        } else {
            Self::detach_locked(&mut inner, name)
        };

        if let Some(members) = inner.rooms.get_mut(room) {
            members.insert(name.to_string());
        }
        if let Some(entry) = inner.clients.get_mut(name) {
            entry.room = Some(room.to_string());
        }

        let joined = Self::roster_locked(&inner, room);
        Some(JoinOutcome { departed, joined })
    }

    /// Remove a client from its current room
    ///
    /// Returns None when the client has no current room. An emptied
    /// room is deleted inside the same critical section.
    pub async fn leave_room(&self, name: &str) -> Option<RosterUpdate> {
        let mut inner = self.inner.write().await;
        Self::detach_locked(&mut inner, name)
    }

    /// Get the room a client is currently in
    pub async fn room_of(&self, name: &str) -> Option<String> {
        let inner = self.inner.read().await;
        inner.clients.get(name)?.room.clone()
    }

    /// Get the members of the sender's current room, for chat fan-out
    ///
    /// Returns None when the client has no current room.
    pub async fn chat_targets(&self, name: &str) -> Option<RosterUpdate> {
        let inner = self.inner.read().await;
        let room = inner.clients.get(name)?.room.clone()?;
        Some(Self::roster_locked(&inner, &room))
    }

    /// List all room names, sorted
    pub async fn list_rooms(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner.rooms.keys().cloned().collect();
        names.sort();
        names
    }

    /// List the member names of a room, sorted
    ///
    /// Returns None when the room does not exist.
    pub async fn list_members(&self, room: &str) -> Option<Vec<String>> {
        let inner = self.inner.read().await;
        let members = inner.rooms.get(room)?;
        let mut names: Vec<String> = members.iter().cloned().collect();
        names.sort();
        Some(names)
    }

    /// Get registered client count
    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    /// Get room count
    pub async fn room_count(&self) -> usize {
        self.inner.read().await.rooms.len()
    }

    /// Detach a client from its room under the lock, deleting the room
    /// when its member set becomes empty.
    fn detach_locked(inner: &mut DirectoryInner, name: &str) -> Option<RosterUpdate> {
        let room = inner.clients.get_mut(name)?.room.take()?;

        let now_empty = match inner.rooms.get_mut(&room) {
            Some(members) => {
                members.remove(name);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.rooms.remove(&room);
            return Some(RosterUpdate {
                room,
                members: Vec::new(),
            });
        }

        Some(Self::roster_locked(inner, &room))
    }

    /// Snapshot a room's membership under the lock, sorted by name
    fn roster_locked(inner: &DirectoryInner, room: &str) -> RosterUpdate {
        let mut members: Vec<Member> = inner
            .rooms
            .get(room)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| {
                        inner.clients.get(n).map(|entry| Member {
                            name: n.clone(),
                            session: entry.session.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.name.cmp(&b.name));

        RosterUpdate {
            room: room.to_string(),
            members,
        }
    }
}
