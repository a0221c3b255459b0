//! Envelope normalization
//!
//! OpenCode has shipped several payload shapes over time. The decoder
//! accepts all of them and produces a single [`StreamEvent`]:
//!
//! - `{type, properties}` (per-directory `/event` stream)
//! - `{directory, payload: {type, properties}}` (global stream)
//! - properties flattened next to `type`
//! - entity payloads nested under `info`, `sessionInfo`, `session`,
//!   `message` or `part`
//! - identifiers under `id`, `sessionID`/`sessionId`, `messageID`
//!
//! Events that need a session or message id and carry none are rejected
//! with [`DecodeError::MissingIdentifier`]; they must never reach the
//! reconciliation engine with an empty identifier.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::event::types::{
    MessageInfo, MessageRecord, MessageTime, Part, PartKind, Role, SessionPatch, StatusKind,
    StreamEvent,
};

/// Maximum number of `payload` wrappers unwrapped before giving up.
const MAX_ENVELOPE_DEPTH: usize = 3;

const SESSION_ID_KEYS: &[&str] = &["sessionID", "sessionId", "session_id"];
const MESSAGE_ID_KEYS: &[&str] = &["messageID", "messageId", "message_id"];
const PART_ID_KEYS: &[&str] = &["partID", "partId", "part_id"];

/// Info keys interpreted by [`decode_message_info`]; everything else is
/// preserved in `extra`.
const MESSAGE_INFO_KEYS: &[&str] = &[
    "id",
    "sessionID",
    "sessionId",
    "session_id",
    "messageID",
    "role",
    "time",
    "createdAt",
    "completedAt",
    "finish",
    "summary",
    "synthetic",
    "parts",
];

const PART_KEYS: &[&str] = &[
    "id",
    "partID",
    "messageID",
    "messageId",
    "sessionID",
    "sessionId",
    "type",
    "text",
    "callID",
    "callId",
    "synthetic",
];

/// A decoded event together with the directory scope its envelope named
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    /// Directory from the global-stream envelope, when present
    pub directory: Option<String>,
    /// Normalized event
    pub event: StreamEvent,
}

/// Decode one SSE `data:` payload.
pub fn decode_frame(data: &str) -> Result<DecodedEvent, DecodeError> {
    let raw: Value =
        serde_json::from_str(data).map_err(|e| DecodeError::NotJson(e.to_string()))?;
    decode_value(&raw)
}

/// Decode an already-parsed envelope.
pub fn decode_value(raw: &Value) -> Result<DecodedEvent, DecodeError> {
    let (directory, inner) = unwrap_envelope(raw);
    let event_type = inner
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;

    let properties = match inner.get("properties") {
        Some(Value::Object(props)) => props.clone(),
        _ => flattened_properties(inner),
    };

    let event = decode_typed(event_type, &properties)?;
    Ok(DecodedEvent { directory, event })
}

fn unwrap_envelope(raw: &Value) -> (Option<String>, &Value) {
    let mut directory = None;
    let mut current = raw;
    for _ in 0..MAX_ENVELOPE_DEPTH {
        match current.get("payload") {
            Some(payload @ Value::Object(_))
                if payload.get("type").is_some() || current.get("type").is_none() =>
            {
                if let Some(dir) = str_field(current, &["directory"]) {
                    directory = Some(dir);
                }
                current = payload;
            }
            _ => break,
        }
    }
    if directory.is_none() {
        directory = str_field(current, &["directory"]);
    }
    (directory, current)
}

fn flattened_properties(inner: &Value) -> Map<String, Value> {
    let mut props = match inner {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    props.remove("type");
    props
}

fn decode_typed(event_type: &str, props: &Map<String, Value>) -> Result<StreamEvent, DecodeError> {
    let props_value = Value::Object(props.clone());
    let missing = || DecodeError::MissingIdentifier {
        event_type: event_type.to_string(),
    };

    let event = match event_type {
        "session.created" | "session.updated" => {
            let patch = decode_session_patch(&props_value).map_err(|_| missing())?;
            StreamEvent::SessionUpserted(patch)
        }
        "session.deleted" => {
            let patch = decode_session_patch(&props_value).map_err(|_| missing())?;
            StreamEvent::SessionDeleted {
                session_id: patch.id,
            }
        }
        "session.compacted" => StreamEvent::SessionCompacted {
            session_id: str_field(&props_value, SESSION_ID_KEYS).ok_or_else(missing)?,
        },
        "message.updated" => {
            let info_value = nested(&props_value, &["info", "message"]);
            let info = decode_message_info(info_value, str_field(&props_value, SESSION_ID_KEYS))?;
            let parts = parts_array(&props_value)
                .or_else(|| parts_array(info_value))
                .map(|parts| decode_parts(parts, &info))
                .unwrap_or_default();
            StreamEvent::MessageUpdated { info, parts }
        }
        "message.removed" => StreamEvent::MessageRemoved {
            session_id: str_field(&props_value, SESSION_ID_KEYS).ok_or_else(missing)?,
            message_id: str_field(&props_value, MESSAGE_ID_KEYS).ok_or_else(missing)?,
        },
        "message.part.updated" => {
            let part_value = nested(&props_value, &["part"]);
            let part = decode_part(
                part_value,
                str_field(&props_value, SESSION_ID_KEYS).as_deref(),
                str_field(&props_value, MESSAGE_ID_KEYS).as_deref(),
            )?;
            let delta = props
                .get("delta")
                .and_then(Value::as_str)
                .map(str::to_string);
            StreamEvent::PartUpdated { part, delta }
        }
        "message.part.removed" => StreamEvent::PartRemoved {
            session_id: str_field(&props_value, SESSION_ID_KEYS).ok_or_else(missing)?,
            message_id: str_field(&props_value, MESSAGE_ID_KEYS).ok_or_else(missing)?,
            part_id: str_field(&props_value, PART_ID_KEYS)
                .or_else(|| str_field(&props_value, &["id"]))
                .ok_or_else(missing)?,
        },
        "session.status" => StreamEvent::SessionStatus {
            session_id: str_field(&props_value, SESSION_ID_KEYS).ok_or_else(missing)?,
            status: status_from(props.get("status").unwrap_or(&Value::Null)),
        },
        "session.idle" => StreamEvent::SessionStatus {
            session_id: str_field(&props_value, SESSION_ID_KEYS).ok_or_else(missing)?,
            status: StatusKind::Idle,
        },
        "session.abort" => StreamEvent::SessionAborted {
            session_id: str_field(&props_value, SESSION_ID_KEYS).ok_or_else(missing)?,
            message_id: str_field(&props_value, MESSAGE_ID_KEYS),
        },
        "session.error" => {
            let aborted = props
                .get("error")
                .and_then(|e| e.get("name"))
                .and_then(Value::as_str)
                == Some("MessageAbortedError");
            match (aborted, str_field(&props_value, SESSION_ID_KEYS)) {
                (true, Some(session_id)) => StreamEvent::SessionAborted {
                    session_id,
                    message_id: str_field(&props_value, MESSAGE_ID_KEYS),
                },
                _ => StreamEvent::Unknown {
                    event_type: event_type.to_string(),
                },
            }
        }
        t if t.starts_with("permission.") || t.starts_with("question.") => {
            let session_id = str_field(&props_value, SESSION_ID_KEYS)
                .or_else(|| str_field(nested(&props_value, &["permission", "request"]), SESSION_ID_KEYS))
                .ok_or_else(missing)?;
            StreamEvent::Interaction {
                session_id,
                event_type: t.to_string(),
                properties: props_value.clone(),
            }
        }
        "todo.updated" => StreamEvent::TodoUpdated {
            session_id: str_field(&props_value, SESSION_ID_KEYS).ok_or_else(missing)?,
            todos: props.get("todos").cloned().unwrap_or(Value::Array(Vec::new())),
        },
        "server.connected" | "server.heartbeat" => StreamEvent::Heartbeat,
        other => StreamEvent::Unknown {
            event_type: other.to_string(),
        },
    };
    Ok(event)
}

/// Decode message metadata from any of the known shapes.
///
/// `fallback_session` is used when the info object itself omits the
/// session id but the surrounding properties carry it.
pub fn decode_message_info(
    value: &Value,
    fallback_session: Option<String>,
) -> Result<MessageInfo, DecodeError> {
    let missing = || DecodeError::MissingIdentifier {
        event_type: "message.updated".to_string(),
    };
    let id = str_field(value, &["id"])
        .or_else(|| str_field(value, MESSAGE_ID_KEYS))
        .ok_or_else(missing)?;
    let session_id = str_field(value, SESSION_ID_KEYS)
        .or(fallback_session)
        .ok_or_else(missing)?;
    let role = value
        .get("role")
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .ok_or(DecodeError::InvalidPayload {
            what: "message info",
        })?;

    let time = value.get("time");
    let created = time
        .and_then(|t| t.get("created"))
        .or_else(|| value.get("createdAt"))
        .and_then(Value::as_i64);
    let completed = time
        .and_then(|t| t.get("completed"))
        .or_else(|| value.get("completedAt"))
        .and_then(Value::as_i64);

    let extra = match value {
        Value::Object(map) => map
            .iter()
            .filter(|(k, v)| {
                // User messages carry a `summary` object; only the flag form is typed
                !MESSAGE_INFO_KEYS.contains(&k.as_str()) || (*k == "summary" && !v.is_boolean())
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Map::new(),
    };

    Ok(MessageInfo {
        id,
        session_id,
        role,
        time: MessageTime { created, completed },
        finish: value
            .get("finish")
            .and_then(Value::as_str)
            .map(str::to_string),
        summary: value.get("summary").and_then(Value::as_bool).unwrap_or(false),
        synthetic: value
            .get("synthetic")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        extra,
    })
}

/// Decode a part, borrowing ids from the surrounding payload when the
/// part object omits them.
pub fn decode_part(
    value: &Value,
    fallback_session: Option<&str>,
    fallback_message: Option<&str>,
) -> Result<Part, DecodeError> {
    let missing = || DecodeError::MissingIdentifier {
        event_type: "message.part.updated".to_string(),
    };
    let id = str_field(value, &["id"])
        .or_else(|| str_field(value, PART_ID_KEYS))
        .ok_or_else(missing)?;
    let message_id = str_field(value, MESSAGE_ID_KEYS)
        .or_else(|| fallback_message.map(str::to_string))
        .ok_or_else(missing)?;
    let session_id = str_field(value, SESSION_ID_KEYS)
        .or_else(|| fallback_session.map(str::to_string))
        .ok_or_else(missing)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(|t| PartKind::from(t.to_string()))
        .ok_or(DecodeError::InvalidPayload { what: "part" })?;

    let extra = match value {
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| !PART_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        _ => Map::new(),
    };

    Ok(Part {
        id,
        message_id,
        session_id,
        kind,
        text: value.get("text").and_then(Value::as_str).map(str::to_string),
        call_id: str_field(value, &["callID", "callId"]),
        synthetic: value
            .get("synthetic")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        extra,
    })
}

/// Decode a session payload into a patch carrying only present fields.
pub fn decode_session_patch(value: &Value) -> Result<SessionPatch, DecodeError> {
    let info = nested(value, &["info", "sessionInfo", "session"]);
    let id = str_field(info, &["id"])
        .or_else(|| str_field(info, SESSION_ID_KEYS))
        .or_else(|| str_field(value, SESSION_ID_KEYS))
        .ok_or_else(|| DecodeError::MissingIdentifier {
            event_type: "session".to_string(),
        })?;

    let time = info.get("time");
    let compacting = match time.and_then(|t| t.get("compacting")) {
        None => None,
        Some(Value::Null) => Some(None),
        Some(v) => Some(v.as_i64()),
    };

    Ok(SessionPatch {
        id,
        title: str_field(info, &["title"]),
        summary: info.get("summary").filter(|v| !v.is_null()).cloned(),
        directory: str_field(info, &["directory"]),
        compacting,
        parent_id: str_field(info, &["parentID", "parentId"]),
        updated: time.and_then(|t| t.get("updated")).and_then(Value::as_i64),
    })
}

/// Decode a `{info, parts}` snapshot entry returned by the messages API.
pub fn decode_message_record(value: &Value) -> Result<MessageRecord, DecodeError> {
    let info_value = nested(value, &["info"]);
    let info = decode_message_info(info_value, None)?;
    let parts = parts_array(value)
        .or_else(|| parts_array(info_value))
        .map(|parts| decode_parts(parts, &info))
        .unwrap_or_default();
    Ok(MessageRecord { info, parts })
}

/// Decode a status map (`{sessionID: {type}}`) into typed statuses.
pub fn decode_status_map(value: &Value) -> HashMap<String, StatusKind> {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(session_id, status)| (session_id.clone(), status_from(status)))
            .collect(),
        _ => HashMap::new(),
    }
}

fn status_from(value: &Value) -> StatusKind {
    match value {
        Value::String(s) => StatusKind::parse(s),
        Value::Object(_) => value
            .get("type")
            .and_then(Value::as_str)
            .map(StatusKind::parse)
            .unwrap_or(StatusKind::Idle),
        _ => StatusKind::Idle,
    }
}

fn decode_parts(parts: &[Value], info: &MessageInfo) -> Vec<Part> {
    parts
        .iter()
        .filter_map(
            |p| match decode_part(p, Some(&info.session_id), Some(&info.id)) {
                Ok(part) => Some(part),
                Err(e) => {
                    tracing::debug!(message_id = %info.id, error = %e, "Skipping undecodable part");
                    None
                }
            },
        )
        .collect()
}

fn parts_array(value: &Value) -> Option<&Vec<Value>> {
    value.get("parts").and_then(Value::as_array)
}

/// First nested object found under `keys`, or `value` itself.
fn nested<'a>(value: &'a Value, keys: &[&str]) -> &'a Value {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find(|v| v.is_object())
        .unwrap_or(value)
}

/// First non-empty string found under `keys`.
fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
