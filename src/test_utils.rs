//! Test utilities for openchamber-sync
//!
//! In-process doubles for the transport traits plus builders for the
//! domain types most tests need.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Map;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Result, SyncError};
use crate::event::types::{
    MessageInfo, MessageRecord, MessageTime, Part, PartKind, Role, SessionPatch, StatusKind,
    FINISH_STOP,
};
use crate::supervisor::{CatchUpKind, StreamHandler};
use crate::transport::{EventSource, EventStream, OpenCodeApi};

/// Sortable message id for sequence number `n`
pub fn msg_id(n: u32) -> String {
    format!("msg_01J9Z{:016}", n)
}

/// Sortable part id for sequence number `n`
pub fn part_id(n: u32) -> String {
    format!("prt_01J9Z{:016}", n)
}

/// Message info with the given role in session `ses_1`
pub fn info(message_id: &str, role: Role) -> MessageInfo {
    MessageInfo::placeholder(message_id, "ses_1", role)
}

/// Completed assistant info with a stop marker
pub fn finished_info(message_id: &str, completed_at: i64) -> MessageInfo {
    MessageInfo {
        time: MessageTime {
            created: Some(completed_at - 1),
            completed: Some(completed_at),
        },
        finish: Some(FINISH_STOP.to_string()),
        ..info(message_id, Role::Assistant)
    }
}

/// Text part belonging to `message_id` in session `ses_1`
pub fn text_part(message_id: &str, id: &str, text: &str) -> Part {
    Part {
        id: id.to_string(),
        message_id: message_id.to_string(),
        session_id: "ses_1".to_string(),
        kind: PartKind::Text,
        text: Some(text.to_string()),
        call_id: None,
        synthetic: false,
        extra: Map::new(),
    }
}

/// Message record with one text part
pub fn record(info: MessageInfo, text: &str) -> MessageRecord {
    let part = text_part(&info.id, &format!("{}_p", info.id), text);
    MessageRecord {
        info,
        parts: vec![part],
    }
}

/// Assert that an error's message contains `expected`
pub fn assert_error_contains<T: std::fmt::Debug>(result: Result<T>, expected: &str) {
    match result {
        Ok(value) => panic!(
            "Expected error containing '{}' but got Ok({:?})",
            expected, value
        ),
        Err(e) => {
            let error_msg = format!("{:#}", e);
            assert!(
                error_msg.contains(expected),
                "Error message '{}' does not contain '{}'",
                error_msg,
                expected
            );
        }
    }
}

#[derive(Default)]
struct FakeSourceState {
    subscribe_count: usize,
    failing_subscribes: usize,
    unhealthy: bool,
    health_checks: usize,
    current: Option<mpsc::UnboundedSender<Result<String>>>,
}

/// Scriptable [`EventSource`]
///
/// Every successful `subscribe` replaces the current subscription; tests
/// push frames into whichever one is live.
#[derive(Default)]
pub struct FakeEventSource {
    state: Mutex<FakeSourceState>,
}

impl FakeEventSource {
    /// Healthy source that accepts subscriptions
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeSourceState> {
        self.state.lock().expect("fake source state poisoned")
    }

    /// Number of `subscribe` calls so far
    pub fn subscribe_count(&self) -> usize {
        self.state().subscribe_count
    }

    /// Number of health probes so far
    pub fn health_checks(&self) -> usize {
        self.state().health_checks
    }

    /// Make the next `n` subscribe calls fail
    pub fn fail_next_subscribes(&self, n: usize) {
        self.state().failing_subscribes = n;
    }

    /// Control the health probe result
    pub fn set_healthy(&self, healthy: bool) {
        self.state().unhealthy = !healthy;
    }

    /// Deliver a frame to the live subscription. Returns `false` when no
    /// subscriber is listening.
    pub fn push(&self, data: &str) -> bool {
        match &self.state().current {
            Some(tx) => tx.send(Ok(data.to_string())).is_ok(),
            None => false,
        }
    }

    /// Fail the live subscription with a transport error
    pub fn fail_stream(&self, reason: &str) {
        if let Some(tx) = self.state().current.take() {
            let _ = tx.send(Err(SyncError::Transport(reason.to_string()).into()));
        }
    }

    /// End the live subscription as if the server closed it
    pub fn close_stream(&self) {
        self.state().current = None;
    }

    /// Whether a subscriber still holds the live subscription
    pub fn is_streaming(&self) -> bool {
        self.state()
            .current
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait::async_trait]
impl EventSource for FakeEventSource {
    async fn subscribe(&self) -> Result<EventStream> {
        let mut state = self.state();
        state.subscribe_count += 1;
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(SyncError::Transport("connection refused".into()).into());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.current = Some(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> bool {
        let mut state = self.state();
        state.health_checks += 1;
        !state.unhealthy
    }
}

/// [`StreamHandler`] that records what it receives
#[derive(Default)]
pub struct RecordingHandler {
    frames: Mutex<Vec<String>>,
    catch_ups: Mutex<Vec<CatchUpKind>>,
}

impl RecordingHandler {
    /// Frames delivered so far
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().expect("frames poisoned").clone()
    }

    /// Catch-up requests so far
    pub fn catch_ups(&self) -> Vec<CatchUpKind> {
        self.catch_ups.lock().expect("catch-ups poisoned").clone()
    }
}

impl StreamHandler for RecordingHandler {
    fn on_frame(&self, data: String) {
        self.frames.lock().expect("frames poisoned").push(data);
    }

    fn on_catch_up(&self, kind: CatchUpKind) {
        self.catch_ups.lock().expect("catch-ups poisoned").push(kind);
    }
}

#[derive(Default)]
struct FakeApiState {
    messages: HashMap<String, Vec<MessageRecord>>,
    sessions: Vec<SessionPatch>,
    status: HashMap<String, StatusKind>,
    failing: bool,
    delay: Option<Duration>,
    calls: Vec<String>,
}

/// Scriptable [`OpenCodeApi`]
///
/// Messages are returned newest first, like the server's windowed
/// endpoint; every call is recorded by name.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<FakeApiState>,
}

impl FakeApi {
    /// Empty API
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeApiState> {
        self.state.lock().expect("fake api state poisoned")
    }

    /// Server-side history of a session, oldest first
    pub fn set_messages(&self, session_id: &str, messages: Vec<MessageRecord>) {
        self.state()
            .messages
            .insert(session_id.to_string(), messages);
    }

    /// Server-side session list
    pub fn set_sessions(&self, sessions: Vec<SessionPatch>) {
        self.state().sessions = sessions;
    }

    /// Server-side status map
    pub fn set_status(&self, status: HashMap<String, StatusKind>) {
        self.state().status = status;
    }

    /// Make every call fail
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Delay every call (use with paused time)
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    /// Names of the calls made so far
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Number of calls whose name starts with `prefix`
    pub fn call_count(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    async fn begin(&self, call: String) -> Result<()> {
        let (delay, failing) = {
            let mut state = self.state();
            state.calls.push(call.clone());
            (state.delay, state.failing)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if failing {
            return Err(SyncError::Transport(format!("{} failed", call)).into());
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl OpenCodeApi for FakeApi {
    async fn fetch_recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        self.begin(format!("messages:{}:{}", session_id, limit)).await?;
        let all = self
            .state()
            .messages
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        Ok(all.into_iter().rev().take(limit).collect())
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionPatch> {
        self.begin(format!("session:{}", session_id)).await?;
        let found = self
            .state()
            .sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned();
        found.ok_or_else(|| SyncError::Transport(format!("no session {}", session_id)).into())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionPatch>> {
        self.begin("sessions".to_string()).await?;
        Ok(self.state().sessions.clone())
    }

    async fn fetch_global_status(&self) -> Result<HashMap<String, StatusKind>> {
        self.begin("status".to_string()).await?;
        Ok(self.state().status.clone())
    }

    async fn fetch_directory_status(
        &self,
        directory: &str,
    ) -> Result<HashMap<String, StatusKind>> {
        self.begin(format!("status:{}", directory)).await?;
        Ok(self.state().status.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_ids_are_sortable() {
        assert!(crate::ids::is_strictly_newer(&msg_id(2), &msg_id(1)));
        assert!(crate::ids::is_strictly_newer(&part_id(10), &part_id(9)));
    }

    #[tokio::test]
    async fn test_fake_source_delivers_to_live_subscription() {
        let source = FakeEventSource::new();
        assert!(!source.push("nobody"));
        let mut stream = source.subscribe().await.unwrap();
        assert!(source.push("hello"));
        assert_eq!(stream.next().await.unwrap().unwrap(), "hello");
        source.close_stream();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_fake_source_fails_requested_subscribes() {
        let source = FakeEventSource::new();
        source.fail_next_subscribes(1);
        assert!(source.subscribe().await.is_err());
        assert!(source.subscribe().await.is_ok());
        assert_eq!(source.subscribe_count(), 2);
    }

    #[tokio::test]
    async fn test_fake_api_returns_newest_first() {
        let api = FakeApi::new();
        api.set_messages(
            "ses_1",
            (1..=3)
                .map(|n| record(info(&msg_id(n), Role::User), "hi"))
                .collect(),
        );
        let window = api.fetch_recent_messages("ses_1", 2).await.unwrap();
        let ids: Vec<String> = window.into_iter().map(|m| m.info.id).collect();
        assert_eq!(ids, vec![msg_id(3), msg_id(2)]);
        assert_eq!(api.calls(), vec!["messages:ses_1:2"]);
    }

    #[tokio::test]
    async fn test_fake_api_failure() {
        let api = FakeApi::new();
        api.set_failing(true);
        assert_error_contains(api.list_sessions().await, "sessions failed");
    }
}
