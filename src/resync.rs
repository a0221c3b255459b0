//! Resync coordinator
//!
//! Pull-based reconciliation used when the stream can't be trusted: on
//! reconnect, after staleness, when switching sessions. A bounded window
//! of recent server messages is spliced against local history by the
//! pure [`splice`] function; the coordinator adds single-flight, rate
//! limiting and cancellation around it.
//!
//! Failures never reach the caller. A failed fetch leaves local state
//! untouched and the next health probe or catch-up tries again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityPhase, ActivityTracker};
use crate::config::ResyncConfig;
use crate::event::types::{MessageRecord, Role};
use crate::ids;
use crate::metrics;
use crate::storage::{CursorStore, SessionCursor};
use crate::store::SessionStore;
use crate::transport::OpenCodeApi;

/// How local history should change to agree with a server window
#[derive(Debug, Clone, PartialEq)]
pub enum SplicePlan {
    /// Local history already agrees
    Unchanged,
    /// Local tail was found in the window
    Extend {
        /// Authoritative copy of the local tail (new id or completion)
        replace_tail: Option<MessageRecord>,
        /// Server messages after the matched tail
        append: Vec<MessageRecord>,
    },
    /// Replace local history with these messages
    Adopt(Vec<MessageRecord>),
}

/// Decide how to splice a chronological server `window` into local
/// history.
///
/// `local_last` is the newest local message; `cursor` is consulted only
/// when local history is empty.
pub fn splice(
    local_last: Option<&MessageRecord>,
    cursor: Option<&SessionCursor>,
    window: &[MessageRecord],
    target_window: usize,
    fuzzy_tolerance_ms: i64,
) -> SplicePlan {
    if window.is_empty() {
        return SplicePlan::Unchanged;
    }

    if let Some(local) = local_last {
        return match find_match(local, window, fuzzy_tolerance_ms) {
            Some(index) => {
                let server = &window[index];
                let authoritative = server.info.id != local.info.id
                    || (server.info.time.completed.is_some()
                        && local.info.time.completed.is_none());
                let replace_tail = authoritative.then(|| server.clone());
                let append = window[index + 1..].to_vec();
                if replace_tail.is_none() && append.is_empty() {
                    SplicePlan::Unchanged
                } else {
                    SplicePlan::Extend {
                        replace_tail,
                        append,
                    }
                }
            }
            // Local tail newer than the whole window (or incomparable):
            // the server has not caught up with us.
            None if window
                .iter()
                .all(|m| ids::is_newer(&local.info.id, &m.info.id)) =>
            {
                SplicePlan::Unchanged
            }
            None => SplicePlan::Adopt(most_recent(window, target_window)),
        };
    }

    if let Some(cursor) = cursor {
        if let Some(index) = window.iter().position(|m| m.info.id == cursor.message_id) {
            let after = &window[index + 1..];
            if !after.is_empty() {
                return SplicePlan::Adopt(most_recent(after, target_window));
            }
        }
    }

    SplicePlan::Adopt(most_recent(window, target_window))
}

/// Locate `local` in `window`: exact id first, then (for user messages)
/// same normalized text or creation time within tolerance, searching
/// from the newest entry.
fn find_match(local: &MessageRecord, window: &[MessageRecord], tolerance_ms: i64) -> Option<usize> {
    if let Some(index) = window.iter().rposition(|m| m.info.id == local.info.id) {
        return Some(index);
    }
    if local.info.role != Role::User {
        return None;
    }

    let local_text = normalize_text(&local.text());
    window.iter().rposition(|m| {
        if m.info.role != Role::User {
            return false;
        }
        let same_text = !local_text.is_empty() && normalize_text(&m.text()) == local_text;
        let close_in_time = match (local.info.time.created, m.info.time.created) {
            (Some(a), Some(b)) => (a - b).abs() <= tolerance_ms,
            _ => false,
        };
        same_text || close_in_time
    })
}

fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn most_recent(messages: &[MessageRecord], limit: usize) -> Vec<MessageRecord> {
    let start = messages.len().saturating_sub(limit);
    messages[start..].to_vec()
}

/// Put a fetched window into chronological order.
///
/// The server returns newest first; ordering by creation time when every
/// entry has one, otherwise by id direction.
pub fn chronological(mut window: Vec<MessageRecord>) -> Vec<MessageRecord> {
    if window.iter().all(|m| m.info.time.created.is_some()) {
        window.sort_by_key(|m| m.info.time.created);
    } else if let (Some(first), Some(last)) = (window.first(), window.last()) {
        if ids::is_strictly_newer(&first.info.id, &last.info.id) {
            window.reverse();
        }
    }
    window
}

/// What a resync did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// Messages appended after the local tail
    Appended(usize),
    /// Local tail replaced with the server copy
    ReplacedTail,
    /// Local history replaced with this many messages
    Adopted(usize),
    /// Local history already agreed
    Unchanged,
    /// Skipped: another resync for the session ran too recently
    RateLimited,
    /// Skipped: a resync for the session is running
    InFlight,
    /// Result discarded because the token was cancelled
    Cancelled,
    /// Fetch failed; local state untouched
    Failed,
}

impl ResyncOutcome {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncOutcome::Appended(_) => "appended",
            ResyncOutcome::ReplacedTail => "replaced_tail",
            ResyncOutcome::Adopted(_) => "adopted",
            ResyncOutcome::Unchanged => "unchanged",
            ResyncOutcome::RateLimited => "rate_limited",
            ResyncOutcome::InFlight => "in_flight",
            ResyncOutcome::Cancelled => "cancelled",
            ResyncOutcome::Failed => "failed",
        }
    }
}

/// Outcome plus the local history after the resync
#[derive(Debug, Clone)]
pub struct Resynced {
    /// What happened
    pub outcome: ResyncOutcome,
    /// Local message list after the resync
    pub messages: Vec<MessageRecord>,
}

#[derive(Debug, Default)]
struct Slot {
    in_flight: bool,
    last_started: Option<Instant>,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<String, Slot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Clears the in-flight flag when the resync finishes or is dropped
struct InFlightGuard {
    slots: Slots,
    session_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(slot) = lock_slots(&self.slots).get_mut(&self.session_id) {
            slot.in_flight = false;
        }
    }
}

/// Single-flight, rate-limited history resync
#[derive(Clone)]
pub struct ResyncCoordinator {
    api: Arc<dyn OpenCodeApi>,
    store: SessionStore,
    cursors: Arc<dyn CursorStore>,
    activity: ActivityTracker,
    config: ResyncConfig,
    slots: Slots,
}

impl ResyncCoordinator {
    /// Create a coordinator writing into `store`
    pub fn new(
        api: Arc<dyn OpenCodeApi>,
        store: SessionStore,
        cursors: Arc<dyn CursorStore>,
        activity: ActivityTracker,
        config: ResyncConfig,
    ) -> Self {
        Self {
            api,
            store,
            cursors,
            activity,
            config,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of messages local history should hold for `session_id`
    pub fn target_window(&self, session_id: &str) -> usize {
        if self.activity.phase(session_id) == ActivityPhase::Busy {
            self.config.viewport_window
        } else {
            self.config.history_window
        }
    }

    fn try_begin(&self, session_id: &str) -> Result<InFlightGuard, ResyncOutcome> {
        let mut slots = lock_slots(&self.slots);
        let slot = slots.entry(session_id.to_string()).or_default();
        if slot.in_flight {
            return Err(ResyncOutcome::InFlight);
        }
        let min_interval = Duration::from_millis(self.config.min_interval_ms);
        if slot
            .last_started
            .is_some_and(|started| started.elapsed() < min_interval)
        {
            return Err(ResyncOutcome::RateLimited);
        }
        slot.in_flight = true;
        slot.last_started = Some(Instant::now());
        Ok(InFlightGuard {
            slots: self.slots.clone(),
            session_id: session_id.to_string(),
        })
    }

    /// Resync `session_id` against the server and return local history.
    ///
    /// Results are discarded once `cancel` fires.
    pub async fn resync(&self, session_id: &str, cancel: &CancellationToken) -> Resynced {
        let outcome = self.run(session_id, cancel).await;
        metrics::record_resync(outcome.as_str());
        tracing::debug!(session_id, outcome = outcome.as_str(), "Resync finished");
        Resynced {
            outcome,
            messages: self.store.messages(session_id),
        }
    }

    async fn run(&self, session_id: &str, cancel: &CancellationToken) -> ResyncOutcome {
        let _guard = match self.try_begin(session_id) {
            Ok(guard) => guard,
            Err(skipped) => return skipped,
        };

        let target = self.target_window(session_id);
        let limit = target + self.config.fetch_buffer;
        let cursor = match self.cursors.read_cursor(session_id) {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Failed to read session cursor");
                None
            }
        };

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return ResyncOutcome::Cancelled,
            result = self.api.fetch_recent_messages(session_id, limit) => result,
        };
        let window = match fetched {
            Ok(window) => chronological(window),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Resync fetch failed");
                return ResyncOutcome::Failed;
            }
        };
        if cancel.is_cancelled() {
            return ResyncOutcome::Cancelled;
        }

        // Local history may have moved while the fetch was in flight.
        let local_last = self.store.last_message(session_id);
        let plan = splice(
            local_last.as_ref(),
            cursor.as_ref(),
            &window,
            target,
            self.config.fuzzy_match_tolerance_ms,
        );
        self.apply_plan(session_id, plan)
    }

    fn apply_plan(&self, session_id: &str, plan: SplicePlan) -> ResyncOutcome {
        match plan {
            SplicePlan::Unchanged => ResyncOutcome::Unchanged,
            SplicePlan::Extend {
                replace_tail,
                append,
            } => {
                let replaced = replace_tail
                    .map(|record| self.store.replace_last_message(session_id, record))
                    .unwrap_or(false);
                let appended = self.store.append_messages(session_id, append);
                match (appended, replaced) {
                    (0, true) => ResyncOutcome::ReplacedTail,
                    (0, false) => ResyncOutcome::Unchanged,
                    (n, _) => ResyncOutcome::Appended(n),
                }
            }
            SplicePlan::Adopt(records) => {
                let count = records.len();
                self.store.replace_messages(session_id, records);
                ResyncOutcome::Adopted(count)
            }
        }
    }
}
