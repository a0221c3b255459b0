//! Transport abstraction for the OpenCode server
//!
//! The reconciliation core needs two things from the network:
//!
//! - [`EventSource`]: subscribe to the server-sent event stream and probe
//!   liveness. Each subscription yields raw frame bodies; decoding happens
//!   in [`crate::event::decoder`].
//! - [`OpenCodeApi`]: pull snapshots on demand (recent messages, session
//!   metadata, session lists, status maps).
//!
//! [`http::HttpOpenCodeClient`] implements both over reqwest. Tests use the
//! in-crate fakes from `test_utils`.

use std::collections::HashMap;
use std::pin::Pin;

use futures::Stream;

use crate::error::Result;
use crate::event::types::{MessageRecord, SessionPatch, StatusKind};

pub mod http;
pub mod sse;

pub use http::HttpOpenCodeClient;

/// One open subscription: raw `data:` payloads in delivery order.
///
/// An `Err` item reports a transport failure; the stream ends after it.
/// A stream that ends without an error means the server closed it.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Source of server-sent events
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    /// Open a new subscription.
    ///
    /// Resolving successfully is the "open" notification. Dropping the
    /// returned stream unsubscribes.
    async fn subscribe(&self) -> Result<EventStream>;

    /// Lightweight liveness probe used for staleness recovery
    async fn health_check(&self) -> bool;
}

/// Snapshot endpoints used by resync, metadata refresh and status polling
#[async_trait::async_trait]
pub trait OpenCodeApi: Send + Sync {
    /// Most recent `limit` messages of a session with their parts.
    ///
    /// Order is whatever the server returns; callers sort.
    async fn fetch_recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>>;

    /// Current metadata of one session
    async fn fetch_session(&self, session_id: &str) -> Result<SessionPatch>;

    /// Every session the server knows about
    async fn list_sessions(&self) -> Result<Vec<SessionPatch>>;

    /// Status of all non-idle sessions across projects
    async fn fetch_global_status(&self) -> Result<HashMap<String, StatusKind>>;

    /// Status of non-idle sessions within one working directory
    async fn fetch_directory_status(&self, directory: &str)
        -> Result<HashMap<String, StatusKind>>;
}
