//! Stream event model and decoding
//!
//! - `types`: sessions, messages, parts and the normalized [`StreamEvent`]
//! - `decoder`: shape-tolerant normalization of raw envelopes and
//!   snapshot payloads

pub mod decoder;
pub mod types;

pub use decoder::{decode_frame, decode_value, DecodedEvent};
pub use types::{
    MessageInfo, MessageRecord, MessageTime, Part, PartKind, Role, Session, SessionPatch,
    StatusKind, StreamEvent, FINISH_STOP,
};
