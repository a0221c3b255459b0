//! Process-wide session store
//!
//! The store is the single source of truth for sessions, messages, parts
//! and trimmed-head markers. Writers (the reconciliation engine, the
//! resync coordinator, UI code) go through its operations; readers get
//! snapshots and a change feed. Locks are never held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;
use tokio::sync::broadcast;

use crate::event::types::{MessageInfo, MessageRecord, Part, Role, Session, SessionPatch};
use crate::ids;

/// Capacity of the change broadcast channel
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Change notification emitted after every store mutation
#[derive(Debug, Clone, PartialEq)]
pub enum StoreChange {
    /// Session inserted or patched
    SessionUpdated(String),
    /// Session removed
    SessionRemoved(String),
    /// Message info or parts changed
    MessageUpdated {
        /// Owning session
        session_id: String,
        /// Changed message
        message_id: String,
    },
    /// Message removed (explicitly or by trimming)
    MessageRemoved {
        /// Owning session
        session_id: String,
        /// Removed message
        message_id: String,
    },
    /// Message history for a session was replaced wholesale by a resync
    HistoryReplaced(String),
    /// Permission or question request/reply
    Interaction {
        /// Session concerned
        session_id: String,
        /// Raw event type
        event_type: String,
        /// Raw payload
        properties: Value,
    },
    /// Todo list replaced
    Todos {
        /// Session concerned
        session_id: String,
        /// Todo entries
        todos: Value,
    },
}

#[derive(Debug, Default)]
struct StoreState {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<MessageRecord>>,
    trimmed_head: HashMap<String, String>,
    current_session: Option<String>,
}

/// Shared, cloneable handle to the session store
#[derive(Debug, Clone)]
pub struct SessionStore {
    state: Arc<RwLock<StoreState>>,
    changes: broadcast::Sender<StoreChange>,
    max_retained_messages: usize,
}

impl SessionStore {
    /// Create an empty store that keeps at most `max_retained_messages`
    /// messages per session.
    pub fn new(max_retained_messages: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(StoreState::default())),
            changes,
            max_retained_messages: max_retained_messages.max(1),
        }
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Session snapshot
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.read().sessions.get(session_id).cloned()
    }

    /// All known session ids
    pub fn session_ids(&self) -> Vec<String> {
        self.read().sessions.keys().cloned().collect()
    }

    /// Insert or patch a session. Returns `true` when anything changed.
    pub fn apply_session_patch(&self, patch: &SessionPatch) -> bool {
        let changed = {
            let mut state = self.write();
            match state.sessions.get_mut(&patch.id) {
                Some(session) => patch.apply_to(session),
                None => {
                    let mut session = Session {
                        id: patch.id.clone(),
                        ..Session::default()
                    };
                    patch.apply_to(&mut session);
                    state.sessions.insert(patch.id.clone(), session);
                    true
                }
            }
        };
        if changed {
            self.notify(StoreChange::SessionUpdated(patch.id.clone()));
        }
        changed
    }

    /// Remove a session together with its messages and marker
    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = {
            let mut state = self.write();
            state.messages.remove(session_id);
            state.trimmed_head.remove(session_id);
            if state.current_session.as_deref() == Some(session_id) {
                state.current_session = None;
            }
            state.sessions.remove(session_id).is_some()
        };
        if removed {
            self.notify(StoreChange::SessionRemoved(session_id.to_string()));
        }
        removed
    }

    /// Remove every session not listed in `keep`
    pub fn retain_sessions(&self, keep: &HashSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .read()
            .sessions
            .keys()
            .filter(|id| !keep.contains(*id))
            .cloned()
            .collect();
        for id in &stale {
            self.remove_session(id);
        }
        stale
    }

    /// Session the user is looking at
    pub fn current_session(&self) -> Option<String> {
        self.read().current_session.clone()
    }

    /// Select the session the user is looking at; returns the previous one
    pub fn set_current_session(&self, session_id: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.write().current_session, session_id)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Message snapshot
    pub fn message(&self, session_id: &str, message_id: &str) -> Option<MessageRecord> {
        self.read()
            .messages
            .get(session_id)
            .and_then(|list| list.iter().find(|m| m.info.id == message_id))
            .cloned()
    }

    /// Ordered message history snapshot
    pub fn messages(&self, session_id: &str) -> Vec<MessageRecord> {
        self.read()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Last message in local history
    pub fn last_message(&self, session_id: &str) -> Option<MessageRecord> {
        self.read()
            .messages
            .get(session_id)
            .and_then(|list| list.last())
            .cloned()
    }

    /// Whether any assistant message in the session is provably newer
    /// than `message_id`.
    pub fn has_newer_assistant(&self, session_id: &str, message_id: &str) -> bool {
        self.read().messages.get(session_id).is_some_and(|list| {
            list.iter().any(|m| {
                m.info.role == Role::Assistant && ids::is_strictly_newer(&m.info.id, message_id)
            })
        })
    }

    /// Newest assistant message without a completion time
    pub fn latest_incomplete_assistant(&self, session_id: &str) -> Option<MessageRecord> {
        self.read().messages.get(session_id).and_then(|list| {
            list.iter()
                .rev()
                .find(|m| m.info.role == Role::Assistant && m.info.time.completed.is_none())
                .cloned()
        })
    }

    /// Trimmed-head marker of a session
    pub fn trimmed_head(&self, session_id: &str) -> Option<String> {
        self.read().trimmed_head.get(session_id).cloned()
    }

    /// Whether `message_id` refers to history evicted from memory
    pub fn is_trimmed(&self, session_id: &str, message_id: &str) -> bool {
        self.read()
            .trimmed_head
            .get(session_id)
            .is_some_and(|marker| !ids::is_newer(message_id, marker))
    }

    /// Replace or patch a message's info, inserting the message if needed.
    ///
    /// With `replace` the incoming info overwrites the stored one;
    /// otherwise only present fields are applied.
    pub fn upsert_message_info(&self, info: &MessageInfo, replace: bool) -> bool {
        let (changed, evicted) = {
            let mut state = self.write();
            let list = state.messages.entry(info.session_id.clone()).or_default();
            match list.iter_mut().find(|m| m.info.id == info.id) {
                Some(existing) => {
                    let before = existing.info.clone();
                    if replace {
                        existing.info = info.clone();
                    } else {
                        existing.info.merge_from(info);
                    }
                    (existing.info != before, Vec::new())
                }
                None => {
                    insert_ordered(list, MessageRecord::new(info.clone()));
                    let evicted = self.evict_overflow(&mut state, &info.session_id);
                    (true, evicted)
                }
            }
        };
        if changed {
            self.notify(StoreChange::MessageUpdated {
                session_id: info.session_id.clone(),
                message_id: info.id.clone(),
            });
        }
        self.notify_evicted(&info.session_id, evicted);
        changed
    }

    /// Insert or replace a part. Parts for an unknown message create a
    /// placeholder message with the given role.
    pub fn upsert_part(&self, part: Part, placeholder_role: Role) -> bool {
        let session_id = part.session_id.clone();
        let message_id = part.message_id.clone();
        let (changed, evicted) = {
            let mut state = self.write();
            let list = state.messages.entry(session_id.clone()).or_default();
            match list.iter_mut().find(|m| m.info.id == message_id) {
                Some(existing) => (existing.merge_part(part), Vec::new()),
                None => {
                    let mut record = MessageRecord::new(MessageInfo::placeholder(
                        &message_id,
                        &session_id,
                        placeholder_role,
                    ));
                    record.merge_part(part);
                    insert_ordered(list, record);
                    let evicted = self.evict_overflow(&mut state, &session_id);
                    (true, evicted)
                }
            }
        };
        if changed {
            self.notify(StoreChange::MessageUpdated {
                session_id: session_id.clone(),
                message_id,
            });
        }
        self.notify_evicted(&session_id, evicted);
        changed
    }

    /// Append a streaming delta to an existing part's text accumulator.
    ///
    /// Returns `false` when the part is unknown.
    pub fn append_part_text(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: &str,
        delta: &str,
    ) -> bool {
        let appended = {
            let mut state = self.write();
            state
                .messages
                .get_mut(session_id)
                .and_then(|list| list.iter_mut().find(|m| m.info.id == message_id))
                .and_then(|m| m.parts.iter_mut().find(|p| p.id == part_id))
                .map(|p| p.text.get_or_insert_with(String::new).push_str(delta))
                .is_some()
        };
        if appended {
            self.notify(StoreChange::MessageUpdated {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        appended
    }

    /// Stamp a completion time on a message that lacks one
    pub fn mark_complete(&self, session_id: &str, message_id: &str, completed_at: i64) -> bool {
        let changed = {
            let mut state = self.write();
            state
                .messages
                .get_mut(session_id)
                .and_then(|list| list.iter_mut().find(|m| m.info.id == message_id))
                .filter(|m| m.info.time.completed.is_none())
                .map(|m| m.info.time.completed = Some(completed_at))
                .is_some()
        };
        if changed {
            self.notify(StoreChange::MessageUpdated {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        changed
    }

    /// Remove one message
    pub fn remove_message(&self, session_id: &str, message_id: &str) -> bool {
        let removed = {
            let mut state = self.write();
            state.messages.get_mut(session_id).is_some_and(|list| {
                let before = list.len();
                list.retain(|m| m.info.id != message_id);
                before != list.len()
            })
        };
        if removed {
            self.notify(StoreChange::MessageRemoved {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        removed
    }

    /// Remove one part
    pub fn remove_part(&self, session_id: &str, message_id: &str, part_id: &str) -> bool {
        let removed = {
            let mut state = self.write();
            state
                .messages
                .get_mut(session_id)
                .and_then(|list| list.iter_mut().find(|m| m.info.id == message_id))
                .is_some_and(|m| m.remove_part(part_id))
        };
        if removed {
            self.notify(StoreChange::MessageUpdated {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        removed
    }

    /// Append records to the end of local history, skipping ids already
    /// present.
    pub fn append_messages(&self, session_id: &str, records: Vec<MessageRecord>) -> usize {
        let (added, evicted) = {
            let mut state = self.write();
            let list = state.messages.entry(session_id.to_string()).or_default();
            let mut added = 0;
            for record in records {
                if list.iter().any(|m| m.info.id == record.info.id) {
                    continue;
                }
                list.push(record);
                added += 1;
            }
            let evicted = self.evict_overflow(&mut state, session_id);
            (added, evicted)
        };
        if added > 0 {
            self.notify(StoreChange::HistoryReplaced(session_id.to_string()));
        }
        self.notify_evicted(session_id, evicted);
        added
    }

    /// Replace the last local message with an authoritative copy
    pub fn replace_last_message(&self, session_id: &str, record: MessageRecord) -> bool {
        let replaced = {
            let mut state = self.write();
            match state.messages.get_mut(session_id).and_then(|l| l.last_mut()) {
                Some(last) if *last != record => {
                    *last = record;
                    true
                }
                _ => false,
            }
        };
        if replaced {
            self.notify(StoreChange::HistoryReplaced(session_id.to_string()));
        }
        replaced
    }

    /// Replace the whole local history of a session
    pub fn replace_messages(&self, session_id: &str, records: Vec<MessageRecord>) {
        {
            let mut state = self.write();
            state.messages.insert(session_id.to_string(), records);
            self.evict_overflow(&mut state, session_id);
        }
        self.notify(StoreChange::HistoryReplaced(session_id.to_string()));
    }

    /// Evict the oldest messages so at most `keep` remain, advancing the
    /// trimmed-head marker to the greatest evicted id.
    pub fn trim_history(&self, session_id: &str, keep: usize) -> Vec<String> {
        let evicted = {
            let mut state = self.write();
            trim_state(&mut state, session_id, keep)
        };
        self.notify_evicted(session_id, evicted.clone());
        evicted
    }

    /// Publish a permission/question event to subscribers
    pub fn publish_interaction(&self, session_id: &str, event_type: &str, properties: Value) {
        self.notify(StoreChange::Interaction {
            session_id: session_id.to_string(),
            event_type: event_type.to_string(),
            properties,
        });
    }

    /// Publish a todo list update to subscribers
    pub fn publish_todos(&self, session_id: &str, todos: Value) {
        self.notify(StoreChange::Todos {
            session_id: session_id.to_string(),
            todos,
        });
    }

    fn evict_overflow(&self, state: &mut StoreState, session_id: &str) -> Vec<String> {
        trim_state(state, session_id, self.max_retained_messages)
    }

    fn notify_evicted(&self, session_id: &str, evicted: Vec<String>) {
        for message_id in evicted {
            self.notify(StoreChange::MessageRemoved {
                session_id: session_id.to_string(),
                message_id,
            });
        }
    }
}

fn trim_state(state: &mut StoreState, session_id: &str, keep: usize) -> Vec<String> {
    let Some(list) = state.messages.get_mut(session_id) else {
        return Vec::new();
    };
    if list.len() <= keep {
        return Vec::new();
    }
    let overflow = list.len() - keep;
    let evicted: Vec<String> = list.drain(..overflow).map(|m| m.info.id).collect();

    let mut marker = state.trimmed_head.get(session_id).cloned();
    for id in &evicted {
        let advance = match &marker {
            Some(current) => ids::is_strictly_newer(id, current),
            None => ids::compare_ids(id, id).is_some(),
        };
        if advance {
            marker = Some(id.clone());
        }
    }
    if let Some(marker) = marker {
        tracing::debug!(session_id, trimmed_head = %marker, evicted = evicted.len(), "Trimmed session history");
        state.trimmed_head.insert(session_id.to_string(), marker);
    }
    evicted
}

/// Insert keeping creation order where ids are comparable; otherwise
/// append.
fn insert_ordered(list: &mut Vec<MessageRecord>, record: MessageRecord) {
    let position = list
        .iter()
        .position(|m| ids::is_strictly_newer(&m.info.id, &record.info.id))
        .unwrap_or(list.len());
    list.insert(position, record);
}
