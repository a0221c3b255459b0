//! Session activity tracker
//!
//! Derives a per-session phase (`idle`, `busy`, `cooldown`) from status
//! signals and message completion. `cooldown` is a short buffer between
//! a finished turn and `idle`; it reverts on its own after the settle
//! delay unless another transition happens first.
//!
//! Every transition bumps a per-session generation. A settle timer only
//! applies if the generation it was armed with is still current, so a
//! timer that loses the race with a newer transition is harmless.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::event::types::StatusKind;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Activity phase of one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityPhase {
    /// Nothing running
    #[default]
    Idle,
    /// A turn is running
    Busy,
    /// A turn just finished; reverts to idle after the settle delay
    Cooldown,
}

impl ActivityPhase {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityPhase::Idle => "idle",
            ActivityPhase::Busy => "busy",
            ActivityPhase::Cooldown => "cooldown",
        }
    }
}

/// Phase change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseChange {
    /// Session whose phase changed
    pub session_id: String,
    /// New phase
    pub phase: ActivityPhase,
}

#[derive(Debug, Default)]
struct Entry {
    phase: ActivityPhase,
    generation: u64,
    settle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    sessions: HashMap<String, Entry>,
    changes: broadcast::Sender<PhaseChange>,
}

/// Cloneable handle to the per-session phase table
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    inner: Arc<Mutex<Inner>>,
    cooldown: Duration,
}

impl ActivityTracker {
    /// Tracker whose cooldown lasts `cooldown`
    pub fn new(cooldown: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sessions: HashMap::new(),
                changes,
            })),
            cooldown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Subscribe to phase changes
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseChange> {
        self.lock().changes.subscribe()
    }

    /// Current phase; unknown sessions are idle
    pub fn phase(&self, session_id: &str) -> ActivityPhase {
        self.lock()
            .sessions
            .get(session_id)
            .map(|e| e.phase)
            .unwrap_or_default()
    }

    /// Sessions whose phase is not idle
    pub fn active_sessions(&self) -> Vec<String> {
        self.lock()
            .sessions
            .iter()
            .filter(|(_, e)| e.phase != ActivityPhase::Idle)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Apply a server status signal: busy/retry → busy, idle → idle.
    ///
    /// An idle signal leaves `cooldown` alone; only a new busy signal,
    /// [`force_idle`](Self::force_idle) or the settle timer end it.
    pub fn apply_status(&self, session_id: &str, status: StatusKind) -> bool {
        if status.is_active() {
            return self.transition(session_id, ActivityPhase::Busy);
        }
        if self.phase(session_id) == ActivityPhase::Cooldown {
            return false;
        }
        self.transition(session_id, ActivityPhase::Idle)
    }

    /// A message finished. Moves `busy` to `cooldown` when the turn ended
    /// with a stop marker; otherwise leaves the phase alone.
    pub fn message_finished(&self, session_id: &str, has_stop_marker: bool) -> bool {
        if !has_stop_marker || self.phase(session_id) != ActivityPhase::Busy {
            return false;
        }
        self.transition(session_id, ActivityPhase::Cooldown)
    }

    /// Jump straight to idle (turn aborted)
    pub fn force_idle(&self, session_id: &str) -> bool {
        self.transition(session_id, ActivityPhase::Idle)
    }

    /// Drop all state for a deleted session
    pub fn forget(&self, session_id: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.sessions.remove(session_id) {
            if let Some(timer) = entry.settle {
                timer.abort();
            }
        }
    }

    /// Reconcile against a polled status map.
    ///
    /// Sessions in `statuses` take the reported status. Sessions in `known`
    /// that are absent from the map are busy sessions whose idle signal was
    /// missed and go idle; sessions already in cooldown finish on their own.
    pub fn reconcile_status_map(
        &self,
        known: &[String],
        statuses: &HashMap<String, StatusKind>,
    ) -> usize {
        let mut changed = 0;
        for (session_id, status) in statuses {
            if self.apply_status(session_id, *status) {
                changed += 1;
            }
        }

        let mut candidates: HashSet<String> = known.iter().cloned().collect();
        candidates.extend(self.active_sessions());
        for session_id in candidates {
            if statuses.contains_key(&session_id) {
                continue;
            }
            if self.phase(&session_id) == ActivityPhase::Busy
                && self.transition(&session_id, ActivityPhase::Idle)
            {
                tracing::debug!(session_id = %session_id, "Session absent from status map; marking idle");
                changed += 1;
            }
        }
        changed
    }

    fn transition(&self, session_id: &str, phase: ActivityPhase) -> bool {
        let mut inner = self.lock();
        let entry = inner.sessions.entry(session_id.to_string()).or_default();
        if entry.phase == phase {
            return false;
        }

        entry.generation += 1;
        if let Some(timer) = entry.settle.take() {
            timer.abort();
        }
        entry.phase = phase;
        let generation = entry.generation;

        if phase == ActivityPhase::Cooldown {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let tracker = self.clone();
                    let session = session_id.to_string();
                    let delay = self.cooldown;
                    entry.settle = Some(handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        tracker.settle(&session, generation);
                    }));
                }
                Err(_) => {
                    tracing::debug!(session_id, "No runtime for settle timer; settling immediately");
                    entry.phase = ActivityPhase::Idle;
                    entry.generation += 1;
                }
            }
        }

        let final_phase = entry.phase;
        tracing::debug!(session_id, phase = final_phase.as_str(), "Session activity changed");
        let _ = inner.changes.send(PhaseChange {
            session_id: session_id.to_string(),
            phase: final_phase,
        });
        true
    }

    fn settle(&self, session_id: &str, generation: u64) {
        let mut inner = self.lock();
        let Some(entry) = inner.sessions.get_mut(session_id) else {
            return;
        };
        if entry.generation != generation || entry.phase != ActivityPhase::Cooldown {
            return;
        }
        entry.generation += 1;
        entry.phase = ActivityPhase::Idle;
        entry.settle = None;
        let _ = inner.changes.send(PhaseChange {
            session_id: session_id.to_string(),
            phase: ActivityPhase::Idle,
        });
    }
}
