//! Domain types for sessions, messages and parts
//!
//! These are the normalized shapes the reconciliation core works with.
//! Wire payloads are mapped onto them by [`crate::event::decoder`], which
//! absorbs every historical field-name variant so nothing downstream has
//! to.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Finish reason marking a terminal assistant turn.
pub const FINISH_STOP: &str = "stop";

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Prompt written by the user
    User,
    /// Reply streamed by the agent
    Assistant,
}

impl Role {
    /// Parse a wire role string
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }

    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Creation and completion timestamps (milliseconds since epoch)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    /// When the message was created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    /// When the message finished streaming; absent while streaming
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

/// Message metadata without its parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    /// Message identifier
    pub id: String,
    /// Owning session
    #[serde(rename = "sessionID")]
    pub session_id: String,
    /// Author
    pub role: Role,
    /// Timestamps
    #[serde(default)]
    pub time: MessageTime,
    /// Finish reason (`stop`, `tool-calls`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<String>,
    /// Marks a compaction summary message
    #[serde(default)]
    pub summary: bool,
    /// Marks a message injected by the server rather than typed by the user
    #[serde(default)]
    pub synthetic: bool,
    /// Fields the core does not interpret, preserved for consumers
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageInfo {
    /// Minimal info for a message first seen through one of its parts
    pub fn placeholder(id: &str, session_id: &str, role: Role) -> Self {
        Self {
            id: id.to_string(),
            session_id: session_id.to_string(),
            role,
            time: MessageTime::default(),
            finish: None,
            summary: false,
            synthetic: false,
            extra: Map::new(),
        }
    }

    /// Whether the finish reason is the terminal `stop` marker
    pub fn has_stop_marker(&self) -> bool {
        self.finish.as_deref() == Some(FINISH_STOP)
    }

    /// A message is finished once it has a completion time or a stop marker
    pub fn is_finished(&self) -> bool {
        self.time.completed.is_some() || self.has_stop_marker()
    }

    /// Patch `self` with the fields present in `incoming`.
    ///
    /// Absent fields never clear existing values, and a completion time
    /// once set is never removed.
    pub fn merge_from(&mut self, incoming: &MessageInfo) {
        self.role = incoming.role;
        if incoming.time.created.is_some() {
            self.time.created = incoming.time.created;
        }
        if incoming.time.completed.is_some() {
            self.time.completed = incoming.time.completed;
        }
        if incoming.finish.is_some() {
            self.finish = incoming.finish.clone();
        }
        self.summary |= incoming.summary;
        self.synthetic |= incoming.synthetic;
        for (key, value) in &incoming.extra {
            self.extra.insert(key.clone(), value.clone());
        }
    }
}

/// Kind of a message part
///
/// Unknown kinds are carried through verbatim so newer servers do not
/// break older clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PartKind {
    /// Streamed assistant or user text
    Text,
    /// Tool invocation with its state
    Tool,
    /// Model reasoning trace
    Reasoning,
    /// File attachment
    File,
    /// Start of an agent step
    StepStart,
    /// End of an agent step
    StepFinish,
    /// Any other part type
    Other(String),
}

impl From<String> for PartKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "text" => PartKind::Text,
            "tool" => PartKind::Tool,
            "reasoning" => PartKind::Reasoning,
            "file" => PartKind::File,
            "step-start" => PartKind::StepStart,
            "step-finish" => PartKind::StepFinish,
            _ => PartKind::Other(value),
        }
    }
}

impl From<PartKind> for String {
    fn from(kind: PartKind) -> Self {
        kind.as_str().to_string()
    }
}

impl PartKind {
    /// Wire representation
    pub fn as_str(&self) -> &str {
        match self {
            PartKind::Text => "text",
            PartKind::Tool => "tool",
            PartKind::Reasoning => "reasoning",
            PartKind::File => "file",
            PartKind::StepStart => "step-start",
            PartKind::StepFinish => "step-finish",
            PartKind::Other(other) => other,
        }
    }
}

/// One part of a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    /// Part identifier
    pub id: String,
    /// Owning message
    #[serde(rename = "messageID")]
    pub message_id: String,
    /// Owning session
    #[serde(rename = "sessionID")]
    pub session_id: String,
    /// Part type
    #[serde(rename = "type")]
    pub kind: PartKind,
    /// Running text accumulator for text and reasoning parts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Tool call identifier for tool parts
    #[serde(rename = "callID", default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Server-injected part (e.g. echoed file contents on user prompts)
    #[serde(default)]
    pub synthetic: bool,
    /// Remaining payload (tool state, file metadata, timings)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    /// Length in characters of the text this part contributes to the
    /// rendered message. Only `text` parts count.
    pub fn text_len(&self) -> usize {
        match (&self.kind, &self.text) {
            (PartKind::Text, Some(text)) => text.chars().count(),
            _ => 0,
        }
    }

    /// Whether `other` refers to the same logical part
    fn same_identity(&self, other: &Part) -> bool {
        if self.id == other.id {
            return true;
        }
        self.kind == PartKind::Tool
            && other.kind == PartKind::Tool
            && self.call_id.is_some()
            && self.call_id == other.call_id
    }
}

/// A message together with its ordered parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message metadata
    pub info: MessageInfo,
    /// Parts in arrival order
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl MessageRecord {
    /// Record with no parts yet
    pub fn new(info: MessageInfo) -> Self {
        Self {
            info,
            parts: Vec::new(),
        }
    }

    /// Total rendered text length: the sum over all `text` parts
    pub fn text_len(&self) -> usize {
        total_text_len(&self.parts)
    }

    /// Concatenated text of all `text` parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.kind == PartKind::Text)
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Insert or replace a part, keyed by part identity.
    ///
    /// Returns `true` when the stored parts changed.
    pub fn merge_part(&mut self, part: Part) -> bool {
        match self.parts.iter_mut().find(|p| p.same_identity(&part)) {
            Some(existing) if *existing == part => false,
            Some(existing) => {
                *existing = part;
                true
            }
            None => {
                self.parts.push(part);
                true
            }
        }
    }

    /// Remove a part by id. Returns `true` when a part was removed.
    pub fn remove_part(&mut self, part_id: &str) -> bool {
        let before = self.parts.len();
        self.parts.retain(|p| p.id != part_id);
        before != self.parts.len()
    }
}

/// Sum of text lengths over a slice of parts
pub fn total_text_len(parts: &[Part]) -> usize {
    parts.iter().map(Part::text_len).sum()
}

/// Cached session metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier
    pub id: String,
    /// Display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Change summary (additions, deletions, files)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Value>,
    /// Working-tree path that scopes the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    /// Set while the server is compacting history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacting: Option<i64>,
    /// Parent session for child (subagent) sessions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Last server-side update time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
}

/// Partial session update; `None` means "field absent, keep current value"
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    /// Session identifier
    pub id: String,
    /// New title
    pub title: Option<String>,
    /// New change summary
    pub summary: Option<Value>,
    /// New directory
    pub directory: Option<String>,
    /// `Some(None)` clears the compaction marker, `Some(Some(t))` sets it
    pub compacting: Option<Option<i64>>,
    /// Parent session
    pub parent_id: Option<String>,
    /// Server-side update time
    pub updated: Option<i64>,
}

impl SessionPatch {
    /// Patch touching only the compaction marker
    pub fn clear_compaction(id: &str) -> Self {
        Self {
            id: id.to_string(),
            compacting: Some(None),
            ..Self::default()
        }
    }

    /// Apply the present fields to `session`. Returns `true` on change.
    pub fn apply_to(&self, session: &mut Session) -> bool {
        let before = session.clone();
        if let Some(title) = &self.title {
            session.title = Some(title.clone());
        }
        if let Some(summary) = &self.summary {
            session.summary = Some(summary.clone());
        }
        if let Some(directory) = &self.directory {
            session.directory = Some(directory.clone());
        }
        if let Some(compacting) = self.compacting {
            session.compacting = compacting;
        }
        if let Some(parent) = &self.parent_id {
            session.parent_id = Some(parent.clone());
        }
        if let Some(updated) = self.updated {
            session.updated = Some(updated);
        }
        *session != before
    }
}

/// Server-reported session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    /// Nothing running
    Idle,
    /// A turn is in progress
    Busy,
    /// The server is retrying a failed model call
    Retry,
}

impl StatusKind {
    /// Parse a wire status; unknown values count as idle
    pub fn parse(value: &str) -> Self {
        match value {
            "busy" => StatusKind::Busy,
            "retry" => StatusKind::Retry,
            _ => StatusKind::Idle,
        }
    }

    /// Busy and retry both mean "a turn is running"
    pub fn is_active(&self) -> bool {
        matches!(self, StatusKind::Busy | StatusKind::Retry)
    }
}

/// Normalized domain event produced by the decoder
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// `session.created` / `session.updated`
    SessionUpserted(SessionPatch),
    /// `session.deleted`
    SessionDeleted {
        /// Deleted session
        session_id: String,
    },
    /// `session.compacted`
    SessionCompacted {
        /// Compacted session
        session_id: String,
    },
    /// `message.updated`
    MessageUpdated {
        /// Message metadata
        info: MessageInfo,
        /// Parts bundled with the update, if any
        parts: Vec<Part>,
    },
    /// `message.removed`
    MessageRemoved {
        /// Owning session
        session_id: String,
        /// Removed message
        message_id: String,
    },
    /// `message.part.updated`
    PartUpdated {
        /// Part payload
        part: Part,
        /// Incremental text to append when the payload omits `text`
        delta: Option<String>,
    },
    /// `message.part.removed`
    PartRemoved {
        /// Owning session
        session_id: String,
        /// Owning message
        message_id: String,
        /// Removed part
        part_id: String,
    },
    /// `session.status` / `session.idle`
    SessionStatus {
        /// Session the status applies to
        session_id: String,
        /// Reported status
        status: StatusKind,
    },
    /// `session.abort` / `session.error` with an abort error
    SessionAborted {
        /// Aborted session
        session_id: String,
        /// Message being generated when the turn was aborted, if known
        message_id: Option<String>,
    },
    /// `permission.*` and `question.*` requests and replies
    Interaction {
        /// Session asking for input
        session_id: String,
        /// Raw event type
        event_type: String,
        /// Raw payload
        properties: Value,
    },
    /// `todo.updated`
    TodoUpdated {
        /// Session owning the todo list
        session_id: String,
        /// Todo entries
        todos: Value,
    },
    /// `server.connected` / `server.heartbeat`
    Heartbeat,
    /// Anything the core does not reconcile
    Unknown {
        /// Raw event type
        event_type: String,
    },
}

impl StreamEvent {
    /// Short label used for logging and metrics
    pub fn label(&self) -> &str {
        match self {
            StreamEvent::SessionUpserted(_) => "session.updated",
            StreamEvent::SessionDeleted { .. } => "session.deleted",
            StreamEvent::SessionCompacted { .. } => "session.compacted",
            StreamEvent::MessageUpdated { .. } => "message.updated",
            StreamEvent::MessageRemoved { .. } => "message.removed",
            StreamEvent::PartUpdated { .. } => "message.part.updated",
            StreamEvent::PartRemoved { .. } => "message.part.removed",
            StreamEvent::SessionStatus { .. } => "session.status",
            StreamEvent::SessionAborted { .. } => "session.abort",
            StreamEvent::Interaction { event_type, .. } => event_type,
            StreamEvent::TodoUpdated { .. } => "todo.updated",
            StreamEvent::Heartbeat => "server.heartbeat",
            StreamEvent::Unknown { event_type } => event_type,
        }
    }
}
