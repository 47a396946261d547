//! Tagged command parser and reply rendering
//!
//! Inbound frames carry a backslash-prefixed keyword with an optional
//! brace-delimited argument (`\insert{alice}`, `\rooms`). Anything that
//! does not match the grammar is a chat line. Replies mirror the same
//! shape with an `=` separator (`\join=success`).

/// A parsed inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `\quit` — terminate the session
    Quit,
    /// `\insert{name}` — claim a display name
    Insert(String),
    /// `\join{room}` — join an existing room
    Join(String),
    /// `\leave` — leave the current room
    Leave,
    /// `\rooms` — list all room names
    Rooms,
    /// `\online{room}` — list members of a room; the argument may be absent
    Online(Option<String>),
    /// `\create{room}` — create a new empty room
    Create(String),
    /// Anything outside the grammar, kept verbatim
    Chat(String),
}

impl Command {
    /// Parse one frame into a command
    ///
    /// Never fails: unmatched input becomes [`Command::Chat`] carrying
    /// the raw line, and the caller decides what that means for its
    /// current state.
    pub fn parse(line: &str) -> Self {
        let Some(rest) = line.strip_prefix('\\') else {
            return Command::Chat(line.to_string());
        };

        if let Some(open) = rest.find('{') {
            if !rest.ends_with('}') {
                return Command::Chat(line.to_string());
            }
            let keyword = &rest[..open];
            let arg = rest[open + 1..rest.len() - 1].to_string();
            match keyword {
                "insert" => Command::Insert(arg),
                "join" => Command::Join(arg),
                "online" => Command::Online(Some(arg)),
                "create" => Command::Create(arg),
                _ => Command::Chat(line.to_string()),
            }
        } else {
            match rest {
                "quit" => Command::Quit,
                "leave" => Command::Leave,
                "rooms" => Command::Rooms,
                "online" => Command::Online(None),
                _ => Command::Chat(line.to_string()),
            }
        }
    }
}

/// A server reply frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `\insert=not_valid_nickname`
    InsertInvalid,
    /// `\quit=success`
    QuitOk,
    /// `\rooms=a|b|c`
    Rooms(Vec<String>),
    /// `\online=u1|u2`
    Online(Vec<String>),
    /// `\online=no_room`
    OnlineNoRoom,
    /// `\join=success`
    JoinOk,
    /// `\join=failure`
    JoinFailed,
    /// `\leave=success`
    LeaveOk,
    /// `\leave=no_room`
    LeaveNoRoom,
    /// `\create=success`
    CreateOk,
    /// `\create=failure`
    CreateFailed,
}

impl Reply {
    /// Render the reply as a wire frame (without terminator)
    pub fn render(&self) -> String {
        match self {
            Reply::InsertInvalid => "\\insert=not_valid_nickname".to_string(),
            Reply::QuitOk => "\\quit=success".to_string(),
            Reply::Rooms(names) => format!("\\rooms={}", names.join("|")),
            Reply::Online(names) => format!("\\online={}", names.join("|")),
            Reply::OnlineNoRoom => "\\online=no_room".to_string(),
            Reply::JoinOk => "\\join=success".to_string(),
            Reply::JoinFailed => "\\join=failure".to_string(),
            Reply::LeaveOk => "\\leave=success".to_string(),
            Reply::LeaveNoRoom => "\\leave=no_room".to_string(),
            Reply::CreateOk => "\\create=success".to_string(),
            Reply::CreateFailed => "\\create=failure".to_string(),
        }
    }
}

/// Format a chat line for broadcast, tagging the sender when present
pub fn format_chat(message: &str, sender: Option<&str>) -> String {
    match sender {
        Some(name) => format!("[{}]: {}", name, message),
        None => message.to_string(),
    }
}
