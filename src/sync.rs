//! Sync service
//!
//! Wires the pieces together: frames from the supervised stream are
//! decoded, scoped to the configured directory and handed to the
//! reconciliation engine; catch-up requests run a bootstrap or a resync;
//! follow-ups from the engine become rate-limited metadata refreshes.
//!
//! The service is explicitly constructed and owns every shared component.
//! Consumers get the store, the activity tracker and the connection
//! status through accessors.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityTracker, PhaseChange};
use crate::config::Config;
use crate::error::Result;
use crate::event::decode_frame;
use crate::metrics;
use crate::reconcile::{FollowUp, ReconciliationEngine};
use crate::resync::{ResyncCoordinator, Resynced};
use crate::storage::{CursorStore, SqliteCursorStore};
use crate::store::SessionStore;
use crate::supervisor::{
    CatchUpKind, ConnectionStatus, StreamHandler, StreamSupervisor, SupervisorHandle,
};
use crate::transport::{EventSource, HttpOpenCodeClient, OpenCodeApi};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct PollState {
    in_flight: bool,
    last_started: Option<Instant>,
}

struct PollGuard<'a>(&'a Mutex<PollState>);

impl Drop for PollGuard<'_> {
    fn drop(&mut self) {
        lock(self.0).in_flight = false;
    }
}

struct CurrentSession {
    session_id: String,
    cancel: CancellationToken,
}

struct SyncInner {
    config: Config,
    store: SessionStore,
    activity: ActivityTracker,
    engine: ReconciliationEngine,
    resync: ResyncCoordinator,
    api: Arc<dyn OpenCodeApi>,
    refreshes: Mutex<HashMap<String, Instant>>,
    status_poll: Mutex<PollState>,
    current: Mutex<Option<CurrentSession>>,
    shutdown: CancellationToken,
}

impl SyncInner {
    fn in_scope(&self, directory: Option<&str>) -> bool {
        match (self.config.server.directory.as_deref(), directory) {
            (Some(wanted), Some(got)) => {
                wanted.trim_end_matches('/') == got.trim_end_matches('/')
            }
            _ => true,
        }
    }

    fn ingest(self: &Arc<Self>, data: &str) {
        let decoded = match decode_frame(data) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed frame");
                metrics::record_dropped("malformed");
                return;
            }
        };
        if !self.in_scope(decoded.directory.as_deref()) {
            metrics::record_dropped("other_directory");
            return;
        }

        metrics::record_event(decoded.event.label());
        let reconciled = self.engine.apply(decoded.event);
        for follow_up in reconciled.follow_ups {
            match follow_up {
                FollowUp::RefreshSession(session_id) => {
                    self.request_metadata_refresh(&session_id);
                }
                FollowUp::Resync(session_id) => self.spawn_resync(session_id),
            }
        }
    }

    /// Schedule a metadata refresh unless one ran recently
    fn request_metadata_refresh(self: &Arc<Self>, session_id: &str) -> bool {
        let interval = Duration::from_millis(self.config.reconcile.metadata_refresh_interval_ms);
        {
            let mut refreshes = lock(&self.refreshes);
            if refreshes
                .get(session_id)
                .is_some_and(|last| last.elapsed() < interval)
            {
                return false;
            }
            refreshes.insert(session_id.to_string(), Instant::now());
        }

        let inner = Arc::clone(self);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let fetched = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                result = inner.api.fetch_session(&session_id) => result,
            };
            match fetched {
                Ok(patch) => {
                    inner.store.apply_session_patch(&patch);
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Session metadata refresh failed");
                }
            }
        });
        true
    }

    fn token_for(&self, session_id: &str) -> CancellationToken {
        match lock(&self.current).as_ref() {
            Some(current) if current.session_id == session_id => current.cancel.clone(),
            _ => self.shutdown.child_token(),
        }
    }

    fn spawn_resync(self: &Arc<Self>, session_id: String) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let token = inner.token_for(&session_id);
            inner.resync.resync(&session_id, &token).await;
        });
    }

    async fn resync_current(&self) -> Option<Resynced> {
        let (session_id, token) = {
            let current = lock(&self.current);
            let current = current.as_ref()?;
            (current.session_id.clone(), current.cancel.clone())
        };
        Some(self.resync.resync(&session_id, &token).await)
    }

    async fn poll_status(&self) -> bool {
        let min_interval = Duration::from_millis(self.config.activity.status_poll_min_interval_ms);
        {
            let mut poll = lock(&self.status_poll);
            if poll.in_flight
                || poll
                    .last_started
                    .is_some_and(|started| started.elapsed() < min_interval)
            {
                return false;
            }
            poll.in_flight = true;
            poll.last_started = Some(Instant::now());
        }
        let _guard = PollGuard(&self.status_poll);

        let fetched = match self.config.server.directory.as_deref() {
            Some(directory) => self.api.fetch_directory_status(directory).await,
            None => self.api.fetch_global_status().await,
        };
        match fetched {
            Ok(statuses) => {
                let known = self.store.session_ids();
                let changed = self.activity.reconcile_status_map(&known, &statuses);
                tracing::debug!(reported = statuses.len(), changed, "Status poll reconciled");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "Status poll failed");
                false
            }
        }
    }

    async fn bootstrap(&self) {
        match self.api.list_sessions().await {
            Ok(sessions) => {
                let mut keep = HashSet::new();
                for patch in sessions {
                    if !self.in_scope(patch.directory.as_deref()) {
                        continue;
                    }
                    self.store.apply_session_patch(&patch);
                    keep.insert(patch.id);
                }
                let removed = self.store.retain_sessions(&keep);
                for session_id in &removed {
                    self.activity.forget(session_id);
                }
                tracing::info!(
                    sessions = keep.len(),
                    removed = removed.len(),
                    "Session list reloaded"
                );
            }
            Err(e) => tracing::warn!(error = %e, "Failed to reload session list"),
        }
        self.resync_current().await;
        self.poll_status().await;
    }

    fn spawn_catch_up(self: &Arc<Self>, kind: CatchUpKind) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let work = async {
                match kind {
                    CatchUpKind::Full => inner.bootstrap().await,
                    CatchUpKind::Light => {
                        inner.resync_current().await;
                    }
                }
            };
            tokio::select! {
                _ = inner.shutdown.cancelled() => {}
                _ = work => {}
            }
        });
    }
}

/// Bridges supervisor callbacks to the service without keeping it alive
struct StreamBridge {
    inner: Weak<SyncInner>,
}

impl StreamHandler for StreamBridge {
    fn on_frame(&self, data: String) {
        if let Some(inner) = self.inner.upgrade() {
            inner.ingest(&data);
        }
    }

    fn on_catch_up(&self, kind: CatchUpKind) {
        if let Some(inner) = self.inner.upgrade() {
            tracing::info!(kind = ?kind, "Catching up after stream (re)open");
            inner.spawn_catch_up(kind);
        }
    }
}

/// Session-state service driving the reconciliation core
///
/// Must be created inside a tokio runtime; construction spawns the
/// connection supervisor.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<SyncInner>,
    supervisor: SupervisorHandle,
}

impl SyncService {
    /// Build a service from its collaborators.
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `source` - Event stream transport
    /// * `api` - Snapshot endpoints
    /// * `cursors` - Durable cursor storage
    pub fn new(
        config: Config,
        source: Arc<dyn EventSource>,
        api: Arc<dyn OpenCodeApi>,
        cursors: Arc<dyn CursorStore>,
    ) -> Self {
        let store = SessionStore::new(config.reconcile.max_retained_messages);
        let activity = ActivityTracker::new(Duration::from_millis(config.activity.cooldown_ms));
        let engine = ReconciliationEngine::new(
            store.clone(),
            activity.clone(),
            cursors.clone(),
            config.reconcile.shrink_tolerance_chars,
        );
        let resync = ResyncCoordinator::new(
            api.clone(),
            store.clone(),
            cursors,
            activity.clone(),
            config.resync.clone(),
        );

        let inner = Arc::new(SyncInner {
            store,
            activity,
            engine,
            resync,
            api,
            refreshes: Mutex::new(HashMap::new()),
            status_poll: Mutex::new(PollState::default()),
            current: Mutex::new(None),
            shutdown: CancellationToken::new(),
            config,
        });

        let bridge = Arc::new(StreamBridge {
            inner: Arc::downgrade(&inner),
        });
        let supervisor = StreamSupervisor::spawn(source, bridge, &inner.config.stream);

        Self { inner, supervisor }
    }

    /// Build a service talking HTTP to the configured server with a
    /// SQLite cursor store.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client or the cursor database cannot
    /// be created.
    pub fn from_config(config: Config) -> Result<Self> {
        let client = Arc::new(HttpOpenCodeClient::from_config(&config.server)?);
        let cursors: Arc<dyn CursorStore> = match &config.storage.cursor_db {
            Some(path) => Arc::new(SqliteCursorStore::new_with_path(path.clone())?),
            None => Arc::new(SqliteCursorStore::new()?),
        };
        Ok(Self::new(config, client.clone(), client, cursors))
    }

    /// Session store
    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    /// Activity tracker
    pub fn activity(&self) -> &ActivityTracker {
        &self.inner.activity
    }

    /// Subscribe to activity phase changes
    pub fn subscribe_activity(&self) -> broadcast::Receiver<PhaseChange> {
        self.inner.activity.subscribe()
    }

    /// Connection status snapshot
    pub fn connection_status(&self) -> ConnectionStatus {
        self.supervisor.status()
    }

    /// Watch connection status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.supervisor.subscribe_status()
    }

    /// Open the stream. Safe to call repeatedly.
    pub fn start_stream(&self) {
        self.supervisor.start();
    }

    /// Close the stream. Safe to call repeatedly.
    pub fn stop_stream(&self) {
        self.supervisor.stop();
    }

    /// Report whether the consumer is visible
    pub fn set_visibility(&self, visible: bool) {
        self.supervisor.set_visible(visible);
    }

    /// Report network reachability
    pub fn set_online(&self, online: bool) {
        self.supervisor.set_online(online);
    }

    /// Report that the window regained focus
    pub fn focus_gained(&self) {
        self.supervisor.focus_gained();
    }

    /// Feed one raw frame through decoding and reconciliation
    pub fn ingest_frame(&self, data: &str) {
        self.inner.ingest(data);
    }

    /// Select the session the user is looking at.
    ///
    /// Any in-flight resync for the previous session is cancelled and the
    /// new session's history is resynced in the background. Returns the
    /// previously selected session.
    pub fn set_current_session(&self, session_id: Option<String>) -> Option<String> {
        let previous = self.inner.store.set_current_session(session_id.clone());
        {
            let mut current = lock(&self.inner.current);
            if current.as_ref().map(|c| &c.session_id) == session_id.as_ref() {
                return previous;
            }
            if let Some(old) = current.take() {
                tracing::debug!(session_id = %old.session_id, "Cancelling resync of previous session");
                old.cancel.cancel();
            }
            *current = session_id.clone().map(|session_id| CurrentSession {
                session_id,
                cancel: self.inner.shutdown.child_token(),
            });
        }
        if let Some(session_id) = session_id {
            self.inner.spawn_resync(session_id);
        }
        previous
    }

    /// Resync one session now and return its local history
    pub async fn resync_session(&self, session_id: &str) -> Resynced {
        let token = self.inner.token_for(session_id);
        self.inner.resync.resync(session_id, &token).await
    }

    /// Reload the session list, resync the current session and poll status
    pub async fn bootstrap(&self) {
        self.inner.bootstrap().await;
    }

    /// Reconcile activity against the server status map.
    ///
    /// Returns `false` when skipped (in flight or polled too recently) or
    /// when the fetch failed.
    pub async fn poll_status(&self) -> bool {
        self.inner.poll_status().await
    }

    /// Poll status every `status_poll_interval_ms` until shutdown
    pub fn spawn_status_poll_loop(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let period = Duration::from_millis(inner.config.activity.status_poll_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        inner.poll_status().await;
                    }
                }
            }
        })
    }

    /// Stop the supervisor and cancel all background work
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.supervisor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityPhase;
    use crate::event::types::{Role, SessionPatch, StatusKind};
    use crate::storage::MemoryCursorStore;
    use crate::supervisor::ConnectionState;
    use crate::test_utils::{info, msg_id, record, FakeApi, FakeEventSource};
    use serde_json::json;

    struct Harness {
        service: SyncService,
        source: Arc<FakeEventSource>,
        api: Arc<FakeApi>,
    }

    fn harness_with(config: Config) -> Harness {
        let source = Arc::new(FakeEventSource::new());
        let api = Arc::new(FakeApi::new());
        let service = SyncService::new(
            config,
            source.clone(),
            api.clone(),
            Arc::new(MemoryCursorStore::new()),
        );
        Harness {
            service,
            source,
            api,
        }
    }

    fn harness() -> Harness {
        harness_with(Config::default())
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn part_frame(directory: Option<&str>, message: &str, text: &str) -> String {
        let payload = json!({
            "type": "message.part.updated",
            "properties": {
                "part": {
                    "id": format!("{}_p", message),
                    "messageID": message,
                    "sessionID": "ses_1",
                    "type": "text",
                    "text": text
                }
            }
        });
        match directory {
            Some(dir) => json!({ "directory": dir, "payload": payload }).to_string(),
            None => payload.to_string(),
        }
    }

    fn completion_frame(message: &str) -> String {
        json!({
            "type": "message.updated",
            "properties": {
                "info": {
                    "id": message,
                    "sessionID": "ses_1",
                    "role": "assistant",
                    "time": { "created": 1, "completed": 2 },
                    "finish": "stop"
                }
            }
        })
        .to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_frames_reach_the_store() {
        let h = harness();
        h.service.start_stream();
        settle().await;
        assert_eq!(h.service.connection_status().state, ConnectionState::Connected);

        assert!(h.source.push(&part_frame(None, &msg_id(1), "hello")));
        settle().await;
        assert_eq!(
            h.service.store().message("ses_1", &msg_id(1)).unwrap().text(),
            "hello"
        );
        h.service.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_open_bootstraps() {
        let h = harness();
        h.api.set_sessions(vec![SessionPatch {
            id: "ses_1".to_string(),
            title: Some("First".to_string()),
            ..SessionPatch::default()
        }]);
        h.service.start_stream();
        settle().await;

        assert_eq!(h.api.call_count("sessions"), 1);
        assert_eq!(h.api.call_count("status"), 1);
        assert_eq!(
            h.service.store().session("ses_1").unwrap().title.as_deref(),
            Some("First")
        );
        h.service.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_from_other_directories_are_dropped() {
        let mut config = Config::default();
        config.server.directory = Some("/repo".to_string());
        let h = harness_with(config);

        h.service
            .ingest_frame(&part_frame(Some("/elsewhere"), &msg_id(1), "nope"));
        h.service
            .ingest_frame(&part_frame(Some("/repo/"), &msg_id(2), "yes"));
        assert!(h.service.store().message("ses_1", &msg_id(1)).is_none());
        assert!(h.service.store().message("ses_1", &msg_id(2)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_are_ignored() {
        let h = harness();
        h.service.ingest_frame("not json");
        h.service.ingest_frame(r#"{"properties":{}}"#);
        assert!(h.service.store().session_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_metadata_refresh_is_rate_limited() {
        let h = harness();
        h.api.set_sessions(vec![SessionPatch {
            id: "ses_1".to_string(),
            title: Some("Refreshed".to_string()),
            ..SessionPatch::default()
        }]);

        h.service.ingest_frame(&completion_frame(&msg_id(1)));
        settle().await;
        h.service.ingest_frame(&completion_frame(&msg_id(2)));
        settle().await;
        assert_eq!(h.api.call_count("session:ses_1"), 1);
        assert_eq!(
            h.service.store().session("ses_1").unwrap().title.as_deref(),
            Some("Refreshed")
        );

        tokio::time::advance(Duration::from_millis(3_000)).await;
        h.service.ingest_frame(&completion_frame(&msg_id(3)));
        settle().await;
        assert_eq!(h.api.call_count("session:ses_1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_poll_is_rate_limited_and_reconciles() {
        let h = harness();
        h.service.store().apply_session_patch(&SessionPatch {
            id: "ses_1".to_string(),
            ..SessionPatch::default()
        });
        h.service.activity().apply_status("ses_1", StatusKind::Busy);

        assert!(h.service.poll_status().await);
        assert_eq!(h.service.activity().phase("ses_1"), ActivityPhase::Idle);
        assert!(!h.service.poll_status().await);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(h.service.poll_status().await);
        assert_eq!(h.api.call_count("status"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_poll_uses_directory_scope() {
        let mut config = Config::default();
        config.server.directory = Some("/repo".to_string());
        let h = harness_with(config);
        h.service.poll_status().await;
        assert_eq!(h.api.calls(), vec!["status:/repo"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_switch_cancels_previous_resync() {
        let h = harness();
        h.api
            .set_messages("ses_1", vec![record(info(&msg_id(1), Role::User), "a")]);
        h.api.set_delay(Duration::from_secs(2));

        h.service.set_current_session(Some("ses_1".to_string()));
        settle().await;
        let previous = h.service.set_current_session(Some("ses_2".to_string()));
        assert_eq!(previous.as_deref(), Some("ses_1"));

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert!(h.service.store().messages("ses_1").is_empty());
        assert_eq!(h.api.call_count("messages:ses_2"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_session_adopts_server_history() {
        let h = harness();
        h.api.set_messages(
            "ses_1",
            (1..=3)
                .map(|n| record(info(&msg_id(n), Role::Assistant), "x"))
                .collect(),
        );
        let resynced = h.service.resync_session("ses_1").await;
        assert_eq!(resynced.messages.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_status_loop() {
        let h = harness();
        let handle = h.service.spawn_status_poll_loop();
        settle().await;
        assert_eq!(h.api.call_count("status"), 1);
        h.service.shutdown();
        handle.await.unwrap();
    }
}
