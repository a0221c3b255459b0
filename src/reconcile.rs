//! Reconciliation engine
//!
//! Decides, for one normalized [`StreamEvent`], what the local store
//! should do with it. Out-of-order, duplicated and truncated deliveries
//! are expected; they are dropped here rather than surfaced as errors.
//!
//! The engine never performs network I/O. Work that needs the server
//! (metadata refresh, history resync) is returned as [`FollowUp`]s for
//! the caller to schedule.

use std::sync::Arc;

use crate::activity::ActivityTracker;
use crate::event::types::{total_text_len, MessageInfo, Part, Role, SessionPatch, StreamEvent};
use crate::metrics;
use crate::storage::{CursorStore, SessionCursor};
use crate::store::SessionStore;

/// Why an event was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Session or message id missing
    Unresolved,
    /// References history evicted behind the trimmed-head marker
    TrimmedHead,
    /// Server echo of a synthetic user part
    SyntheticEcho,
    /// Would shrink text already shown without a stop marker
    Regressive,
    /// Assistant update with neither parts nor completion
    NothingActionable,
    /// Event type the engine does not reconcile
    Unknown,
}

impl DropReason {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Unresolved => "unresolved",
            DropReason::TrimmedHead => "trimmed_head",
            DropReason::SyntheticEcho => "synthetic_echo",
            DropReason::Regressive => "regressive",
            DropReason::NothingActionable => "nothing_actionable",
            DropReason::Unknown => "unknown",
        }
    }
}

/// Result of applying one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Local state changed
    Applied,
    /// Accepted, but local state already reflected it
    Unchanged,
    /// Rejected
    Dropped(DropReason),
    /// Carries no state (heartbeats)
    Ignored,
}

/// Server work requested by an applied event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// Refresh session metadata (rate-limited by the caller)
    RefreshSession(String),
    /// Re-fetch message history for the session
    Resync(String),
}

/// Outcome plus follow-ups
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// What happened to local state
    pub outcome: Outcome,
    /// Work for the caller to schedule
    pub follow_ups: Vec<FollowUp>,
}

impl Reconciled {
    fn outcome(outcome: Outcome) -> Self {
        Self {
            outcome,
            follow_ups: Vec::new(),
        }
    }

    fn changed(changed: bool) -> Self {
        Self::outcome(if changed {
            Outcome::Applied
        } else {
            Outcome::Unchanged
        })
    }

    fn dropped(reason: DropReason) -> Self {
        Self::outcome(Outcome::Dropped(reason))
    }

    fn with(mut self, follow_up: FollowUp) -> Self {
        self.follow_ups.push(follow_up);
        self
    }
}

/// Per-event merge decisions against the session store
pub struct ReconciliationEngine {
    store: SessionStore,
    activity: ActivityTracker,
    cursors: Arc<dyn CursorStore>,
    shrink_tolerance: usize,
}

impl ReconciliationEngine {
    /// Create an engine writing to `store`
    pub fn new(
        store: SessionStore,
        activity: ActivityTracker,
        cursors: Arc<dyn CursorStore>,
        shrink_tolerance: usize,
    ) -> Self {
        Self {
            store,
            activity,
            cursors,
            shrink_tolerance,
        }
    }

    /// Apply one event and report what happened
    pub fn apply(&self, event: StreamEvent) -> Reconciled {
        let label = event.label().to_string();
        let result = match event {
            StreamEvent::SessionUpserted(patch) => self.apply_session_patch(&patch),
            StreamEvent::SessionDeleted { session_id } => {
                self.activity.forget(&session_id);
                Reconciled::changed(self.store.remove_session(&session_id))
            }
            StreamEvent::SessionCompacted { session_id } => {
                let changed = self
                    .store
                    .apply_session_patch(&SessionPatch::clear_compaction(&session_id));
                Reconciled::changed(changed).with(FollowUp::Resync(session_id))
            }
            StreamEvent::MessageUpdated { info, parts } => self.apply_message(info, parts),
            StreamEvent::MessageRemoved {
                session_id,
                message_id,
            } => Reconciled::changed(self.store.remove_message(&session_id, &message_id)),
            StreamEvent::PartUpdated { part, delta } => self.apply_part(part, delta),
            StreamEvent::PartRemoved {
                session_id,
                message_id,
                part_id,
            } => Reconciled::changed(self.store.remove_part(&session_id, &message_id, &part_id)),
            StreamEvent::SessionStatus { session_id, status } => {
                Reconciled::changed(self.activity.apply_status(&session_id, status))
            }
            StreamEvent::SessionAborted {
                session_id,
                message_id,
            } => self.apply_abort(&session_id, message_id.as_deref()),
            StreamEvent::Interaction {
                session_id,
                event_type,
                properties,
            } => {
                self.store
                    .publish_interaction(&session_id, &event_type, properties);
                Reconciled::outcome(Outcome::Applied)
            }
            StreamEvent::TodoUpdated { session_id, todos } => {
                self.store.publish_todos(&session_id, todos);
                Reconciled::outcome(Outcome::Applied)
            }
            StreamEvent::Heartbeat => Reconciled::outcome(Outcome::Ignored),
            StreamEvent::Unknown { .. } => Reconciled::dropped(DropReason::Unknown),
        };

        if let Outcome::Dropped(reason) = result.outcome {
            tracing::debug!(event = %label, reason = reason.as_str(), "Dropped stream event");
            metrics::record_dropped(reason.as_str());
        }
        result
    }

    fn apply_session_patch(&self, patch: &SessionPatch) -> Reconciled {
        if patch.id.is_empty() {
            return Reconciled::dropped(DropReason::Unresolved);
        }
        Reconciled::changed(self.store.apply_session_patch(patch))
    }

    fn apply_part(&self, mut part: Part, delta: Option<String>) -> Reconciled {
        if part.session_id.is_empty() || part.message_id.is_empty() || part.id.is_empty() {
            return Reconciled::dropped(DropReason::Unresolved);
        }
        if self.store.is_trimmed(&part.session_id, &part.message_id) {
            return Reconciled::dropped(DropReason::TrimmedHead);
        }

        let owner = self.store.message(&part.session_id, &part.message_id);
        if part.synthetic && owner.as_ref().map_or(true, |m| m.info.role == Role::User) {
            return Reconciled::dropped(DropReason::SyntheticEcho);
        }

        if part.text.is_none() {
            if let Some(delta) = delta {
                if self.store.append_part_text(
                    &part.session_id,
                    &part.message_id,
                    &part.id,
                    &delta,
                ) {
                    return Reconciled::outcome(Outcome::Applied);
                }
                part.text = Some(delta);
            }
        }

        Reconciled::changed(self.store.upsert_part(part, Role::Assistant))
    }

    fn apply_message(&self, info: MessageInfo, parts: Vec<Part>) -> Reconciled {
        if info.session_id.is_empty() || info.id.is_empty() {
            return Reconciled::dropped(DropReason::Unresolved);
        }
        if self.store.is_trimmed(&info.session_id, &info.id) {
            return Reconciled::dropped(DropReason::TrimmedHead);
        }
        match info.role {
            Role::User => self.apply_user_message(info, parts),
            Role::Assistant => self.apply_assistant_message(info, parts),
        }
    }

    /// User messages are finalized atomically; the incoming copy replaces
    /// the stored info and contributes every non-synthetic part.
    fn apply_user_message(&self, info: MessageInfo, parts: Vec<Part>) -> Reconciled {
        let mut changed = self.store.upsert_message_info(&info, true);
        for part in parts.into_iter().filter(|p| !p.synthetic) {
            changed |= self.store.upsert_part(part, Role::User);
        }
        Reconciled::changed(changed)
    }

    fn apply_assistant_message(&self, info: MessageInfo, parts: Vec<Part>) -> Reconciled {
        if parts.is_empty() && info.time.completed.is_none() {
            return Reconciled::dropped(DropReason::NothingActionable);
        }

        let existing = self.store.message(&info.session_id, &info.id);
        if !parts.is_empty() {
            let existing_len = existing.as_ref().map_or(0, |m| m.text_len());
            let incoming_len = total_text_len(&parts);
            if incoming_len + self.shrink_tolerance < existing_len && !info.has_stop_marker() {
                tracing::debug!(
                    session_id = %info.session_id,
                    message_id = %info.id,
                    existing_len,
                    incoming_len,
                    "Discarding shrinking assistant update"
                );
                return Reconciled::dropped(DropReason::Regressive);
            }
        }

        let was_complete = existing.is_some_and(|m| m.info.time.completed.is_some());
        let mut changed = self.store.upsert_message_info(&info, false);
        for part in parts {
            changed |= self.store.upsert_part(part, Role::Assistant);
        }

        let mut result = Reconciled::changed(changed);
        if info.is_finished() && !was_complete {
            if let Some(follow_up) = self.complete(&info) {
                result.outcome = Outcome::Applied;
                result = result.with(follow_up);
            }
        }
        result
    }

    /// Completion side effects for a finished assistant message. Returns
    /// `None` when the message was superseded by a newer assistant turn.
    fn complete(&self, info: &MessageInfo) -> Option<FollowUp> {
        let session_id = &info.session_id;
        if self.store.has_newer_assistant(session_id, &info.id) {
            tracing::debug!(
                session_id = %session_id,
                message_id = %info.id,
                "Ignoring completion of superseded message"
            );
            return None;
        }

        let completed_at = info
            .time
            .completed
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        self.store.mark_complete(session_id, &info.id, completed_at);

        let cursor = SessionCursor {
            session_id: session_id.clone(),
            message_id: info.id.clone(),
            completed_at,
        };
        if let Err(e) = self.cursors.write_cursor(&cursor) {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to persist session cursor");
        }

        self.activity
            .message_finished(session_id, info.has_stop_marker());
        if info.summary {
            self.store
                .apply_session_patch(&SessionPatch::clear_compaction(session_id));
        }
        tracing::debug!(session_id = %session_id, message_id = %info.id, "Assistant message completed");
        Some(FollowUp::RefreshSession(session_id.clone()))
    }

    fn apply_abort(&self, session_id: &str, message_id: Option<&str>) -> Reconciled {
        if session_id.is_empty() {
            return Reconciled::dropped(DropReason::Unresolved);
        }
        let target = match message_id {
            Some(id) if self.store.is_trimmed(session_id, id) => {
                return Reconciled::dropped(DropReason::TrimmedHead);
            }
            // A named message is never retargeted onto another one
            Some(id) => self.store.message(session_id, id),
            None => self.store.latest_incomplete_assistant(session_id),
        };

        let mut changed = false;
        if let Some(target) = target {
            changed |= self.store.mark_complete(
                session_id,
                &target.info.id,
                chrono::Utc::now().timestamp_millis(),
            );
        }
        changed |= self.activity.force_idle(session_id);
        Reconciled::changed(changed).with(FollowUp::RefreshSession(session_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityPhase;
    use crate::event::types::StatusKind;
    use crate::storage::MemoryCursorStore;
    use crate::test_utils::{finished_info, info, msg_id, part_id, text_part};
    use std::time::Duration;

    struct Harness {
        engine: ReconciliationEngine,
        store: SessionStore,
        activity: ActivityTracker,
        cursors: Arc<MemoryCursorStore>,
    }

    fn harness() -> Harness {
        harness_with_capacity(100)
    }

    fn harness_with_capacity(capacity: usize) -> Harness {
        let store = SessionStore::new(capacity);
        let activity = ActivityTracker::new(Duration::from_millis(2_000));
        let cursors = Arc::new(MemoryCursorStore::new());
        let engine = ReconciliationEngine::new(
            store.clone(),
            activity.clone(),
            cursors.clone(),
            50,
        );
        Harness {
            engine,
            store,
            activity,
            cursors,
        }
    }

    fn assistant_update(message: &str, text: &str, finish: Option<&str>) -> StreamEvent {
        let mut info = info(message, Role::Assistant);
        info.finish = finish.map(str::to_string);
        StreamEvent::MessageUpdated {
            info,
            parts: vec![text_part(message, &format!("{}_p", message), text)],
        }
    }

    #[tokio::test]
    async fn test_message_update_is_idempotent() {
        let h = harness();
        let event = StreamEvent::MessageUpdated {
            info: finished_info(&msg_id(1), 500),
            parts: vec![text_part(&msg_id(1), &part_id(1), "done")],
        };

        assert_eq!(h.engine.apply(event.clone()).outcome, Outcome::Applied);
        let first = h.store.messages("ses_1");
        assert_eq!(h.engine.apply(event).outcome, Outcome::Unchanged);
        assert_eq!(h.store.messages("ses_1"), first);
    }

    #[tokio::test]
    async fn test_shrinking_update_without_stop_is_rejected() {
        let h = harness();
        let long = "x".repeat(200);
        h.engine.apply(assistant_update(&msg_id(1), &long, None));

        let short = "x".repeat(100);
        let result = h.engine.apply(assistant_update(&msg_id(1), &short, None));
        assert_eq!(result.outcome, Outcome::Dropped(DropReason::Regressive));
        assert_eq!(h.store.message("ses_1", &msg_id(1)).unwrap().text_len(), 200);
    }

    #[tokio::test]
    async fn test_shrinking_update_with_stop_is_accepted() {
        let h = harness();
        h.engine
            .apply(assistant_update(&msg_id(1), &"x".repeat(200), None));

        let result = h
            .engine
            .apply(assistant_update(&msg_id(1), &"x".repeat(100), Some("stop")));
        assert_eq!(result.outcome, Outcome::Applied);
        assert_eq!(h.store.message("ses_1", &msg_id(1)).unwrap().text_len(), 100);
    }

    #[tokio::test]
    async fn test_shrink_within_tolerance_is_accepted() {
        let h = harness();
        h.engine
            .apply(assistant_update(&msg_id(1), &"x".repeat(200), None));
        let result = h
            .engine
            .apply(assistant_update(&msg_id(1), &"x".repeat(150), None));
        assert_eq!(result.outcome, Outcome::Applied);
    }

    #[tokio::test]
    async fn test_assistant_update_without_parts_or_completion_is_dropped() {
        let h = harness();
        let result = h.engine.apply(StreamEvent::MessageUpdated {
            info: info(&msg_id(1), Role::Assistant),
            parts: Vec::new(),
        });
        assert_eq!(
            result.outcome,
            Outcome::Dropped(DropReason::NothingActionable)
        );
        assert!(h.store.messages("ses_1").is_empty());
    }

    #[tokio::test]
    async fn test_events_behind_trimmed_head_are_dropped() {
        let h = harness_with_capacity(2);
        for n in 1..=4 {
            h.engine
                .apply(assistant_update(&msg_id(n), "hello", None));
        }
        assert_eq!(h.store.trimmed_head("ses_1"), Some(msg_id(2)));

        let result = h.engine.apply(assistant_update(&msg_id(2), "late", None));
        assert_eq!(result.outcome, Outcome::Dropped(DropReason::TrimmedHead));
        let result = h.engine.apply(StreamEvent::PartUpdated {
            part: text_part(&msg_id(1), &part_id(9), "late"),
            delta: None,
        });
        assert_eq!(result.outcome, Outcome::Dropped(DropReason::TrimmedHead));
    }

    #[tokio::test]
    async fn test_short_ids_are_never_trimmed() {
        let h = harness_with_capacity(2);
        for n in 1..=4 {
            h.engine
                .apply(assistant_update(&msg_id(n), "hello", None));
        }
        let result = h.engine.apply(assistant_update("msg_x", "short id", None));
        assert_eq!(result.outcome, Outcome::Applied);
    }

    #[tokio::test]
    async fn test_superseded_finish_skips_side_effects() {
        let h = harness();
        h.activity.apply_status("ses_1", StatusKind::Busy);
        h.engine
            .apply(assistant_update(&msg_id(1), "first", None));
        h.engine
            .apply(assistant_update(&msg_id(2), "second", None));

        let result = h.engine.apply(StreamEvent::MessageUpdated {
            info: finished_info(&msg_id(1), 900),
            parts: Vec::new(),
        });
        assert!(result.follow_ups.is_empty());
        assert_eq!(h.activity.phase("ses_1"), ActivityPhase::Busy);
        assert_eq!(h.cursors.read_cursor("ses_1").unwrap(), None);
    }

    #[tokio::test]
    async fn test_finish_writes_cursor_and_enters_cooldown() {
        let h = harness();
        h.activity.apply_status("ses_1", StatusKind::Busy);
        h.engine
            .apply(assistant_update(&msg_id(1), "partial", None));

        let result = h.engine.apply(StreamEvent::MessageUpdated {
            info: finished_info(&msg_id(1), 900),
            parts: Vec::new(),
        });
        assert_eq!(result.outcome, Outcome::Applied);
        assert_eq!(
            result.follow_ups,
            vec![FollowUp::RefreshSession("ses_1".to_string())]
        );
        assert_eq!(h.activity.phase("ses_1"), ActivityPhase::Cooldown);
        assert_eq!(
            h.cursors.read_cursor("ses_1").unwrap(),
            Some(SessionCursor {
                session_id: "ses_1".to_string(),
                message_id: msg_id(1),
                completed_at: 900,
            })
        );
    }

    #[tokio::test]
    async fn test_stop_marker_without_completion_time_is_stamped() {
        let h = harness();
        h.engine
            .apply(assistant_update(&msg_id(1), "done", Some("stop")));
        let stored = h.store.message("ses_1", &msg_id(1)).unwrap();
        assert!(stored.info.time.completed.is_some());
        assert!(h.cursors.read_cursor("ses_1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_summary_completion_clears_compaction() {
        let h = harness();
        h.store.apply_session_patch(&SessionPatch {
            id: "ses_1".to_string(),
            compacting: Some(Some(10)),
            ..SessionPatch::default()
        });
        let mut summary = finished_info(&msg_id(1), 900);
        summary.summary = true;
        h.engine.apply(StreamEvent::MessageUpdated {
            info: summary,
            parts: vec![text_part(&msg_id(1), &part_id(1), "summary")],
        });
        assert_eq!(h.store.session("ses_1").unwrap().compacting, None);
    }

    #[tokio::test]
    async fn test_user_message_skips_synthetic_parts() {
        let h = harness();
        let mut synthetic = text_part(&msg_id(1), &part_id(2), "file contents");
        synthetic.synthetic = true;
        h.engine.apply(StreamEvent::MessageUpdated {
            info: info(&msg_id(1), Role::User),
            parts: vec![text_part(&msg_id(1), &part_id(1), "fix bug"), synthetic],
        });
        let stored = h.store.message("ses_1", &msg_id(1)).unwrap();
        assert_eq!(stored.parts.len(), 1);
        assert_eq!(stored.text(), "fix bug");
    }

    #[tokio::test]
    async fn test_synthetic_part_for_user_message_is_dropped() {
        let h = harness();
        h.engine.apply(StreamEvent::MessageUpdated {
            info: info(&msg_id(1), Role::User),
            parts: vec![text_part(&msg_id(1), &part_id(1), "fix bug")],
        });
        let mut echo = text_part(&msg_id(1), &part_id(2), "echo");
        echo.synthetic = true;
        let result = h.engine.apply(StreamEvent::PartUpdated {
            part: echo,
            delta: None,
        });
        assert_eq!(result.outcome, Outcome::Dropped(DropReason::SyntheticEcho));
    }

    #[tokio::test]
    async fn test_part_deltas_accumulate() {
        let h = harness();
        let mut part = text_part(&msg_id(1), &part_id(1), "");
        part.text = None;
        h.engine.apply(StreamEvent::PartUpdated {
            part: part.clone(),
            delta: Some("hel".to_string()),
        });
        h.engine.apply(StreamEvent::PartUpdated {
            part,
            delta: Some("lo".to_string()),
        });
        assert_eq!(h.store.message("ses_1", &msg_id(1)).unwrap().text(), "hello");
    }

    #[tokio::test]
    async fn test_abort_completes_latest_and_goes_idle() {
        let h = harness();
        h.activity.apply_status("ses_1", StatusKind::Busy);
        h.engine
            .apply(assistant_update(&msg_id(1), "working", None));

        let result = h.engine.apply(StreamEvent::SessionAborted {
            session_id: "ses_1".to_string(),
            message_id: None,
        });
        assert_eq!(result.outcome, Outcome::Applied);
        assert!(h
            .store
            .message("ses_1", &msg_id(1))
            .unwrap()
            .info
            .time
            .completed
            .is_some());
        assert_eq!(h.activity.phase("ses_1"), ActivityPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_status_after_finish_keeps_cooldown() {
        let h = harness();
        h.engine.apply(StreamEvent::SessionStatus {
            session_id: "ses_1".to_string(),
            status: StatusKind::Busy,
        });
        h.engine.apply(StreamEvent::MessageUpdated {
            info: finished_info(&msg_id(1), 900),
            parts: vec![text_part(&msg_id(1), &part_id(1), "done")],
        });
        h.engine.apply(StreamEvent::SessionStatus {
            session_id: "ses_1".to_string(),
            status: StatusKind::Idle,
        });

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(h.activity.phase("ses_1"), ActivityPhase::Cooldown);

        tokio::time::advance(Duration::from_millis(1_600)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.activity.phase("ses_1"), ActivityPhase::Idle);
    }

    #[tokio::test]
    async fn test_abort_behind_trimmed_head_is_dropped() {
        let h = harness_with_capacity(1);
        h.activity.apply_status("ses_1", StatusKind::Busy);
        h.engine
            .apply(assistant_update(&msg_id(1), "old", None));
        h.engine
            .apply(assistant_update(&msg_id(2), "streaming", None));
        assert_eq!(h.store.trimmed_head("ses_1"), Some(msg_id(1)));

        let result = h.engine.apply(StreamEvent::SessionAborted {
            session_id: "ses_1".to_string(),
            message_id: Some(msg_id(1)),
        });
        assert_eq!(result.outcome, Outcome::Dropped(DropReason::TrimmedHead));
        assert!(result.follow_ups.is_empty());
        assert_eq!(
            h.store.message("ses_1", &msg_id(2)).unwrap().info.time.completed,
            None
        );
        assert_eq!(h.activity.phase("ses_1"), ActivityPhase::Busy);
    }

    #[tokio::test]
    async fn test_abort_of_unknown_message_does_not_complete_another() {
        let h = harness();
        h.engine
            .apply(assistant_update(&msg_id(2), "streaming", None));

        h.engine.apply(StreamEvent::SessionAborted {
            session_id: "ses_1".to_string(),
            message_id: Some(msg_id(5)),
        });
        assert_eq!(
            h.store.message("ses_1", &msg_id(2)).unwrap().info.time.completed,
            None
        );
    }

    #[tokio::test]
    async fn test_session_patch_and_delete() {
        let h = harness();
        let patch = SessionPatch {
            id: "ses_1".to_string(),
            title: Some("Title".to_string()),
            ..SessionPatch::default()
        };
        assert_eq!(
            h.engine.apply(StreamEvent::SessionUpserted(patch)).outcome,
            Outcome::Applied
        );
        let result = h.engine.apply(StreamEvent::SessionDeleted {
            session_id: "ses_1".to_string(),
        });
        assert_eq!(result.outcome, Outcome::Applied);
        assert!(h.store.session("ses_1").is_none());
    }

    #[tokio::test]
    async fn test_compaction_requests_resync() {
        let h = harness();
        let result = h.engine.apply(StreamEvent::SessionCompacted {
            session_id: "ses_1".to_string(),
        });
        assert_eq!(result.follow_ups, vec![FollowUp::Resync("ses_1".to_string())]);
    }

    #[tokio::test]
    async fn test_unknown_and_heartbeat() {
        let h = harness();
        assert_eq!(
            h.engine.apply(StreamEvent::Heartbeat).outcome,
            Outcome::Ignored
        );
        assert_eq!(
            h.engine
                .apply(StreamEvent::Unknown {
                    event_type: "lsp.updated".to_string()
                })
                .outcome,
            Outcome::Dropped(DropReason::Unknown)
        );
    }
}
