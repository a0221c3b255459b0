//! Pure connection state machine
//!
//! [`ConnectionMachine::handle`] takes one [`Input`] and returns the
//! [`Action`]s the driver must perform. The machine never touches the
//! network or the clock; delays come back as values.
//!
//! Hold condition: a stream may only be open while the consumer is
//! visible and the network is online. Inputs that break the condition
//! close the stream and leave a pending-resume flag; inputs that restore
//! it reconnect with a fresh attempt counter and request a catch-up.

use std::time::Duration;

use super::backoff::BackoffPolicy;
use super::{CatchUpKind, ConnectionState, ConnectionStatus};
use crate::config::StreamConfig;

/// Something that happened to the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    /// `start()` called
    Start,
    /// `stop()` called
    Stop,
    /// The in-flight subscription resolved successfully
    Opened,
    /// The in-flight subscription failed
    ConnectFailed(String),
    /// The open stream reported a transport error
    StreamError(String),
    /// The open stream ended
    StreamEnded,
    /// The reconnect deadline passed
    ReconnectTimerFired,
    /// Consumer visibility changed
    VisibilityChanged(bool),
    /// The debounced pause deadline passed
    PauseCheckFired,
    /// Network reachability changed
    NetworkChanged(bool),
    /// Window focus regained
    FocusGained,
    /// Periodic staleness check with time since the last frame
    StaleCheck {
        /// Time since the last observed frame or successful probe
        idle_for: Duration,
    },
    /// Liveness probe completed
    ProbeResult(bool),
}

/// Side effect requested by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open a new subscription, discarding any current one
    Connect,
    /// Drop the open stream and any in-flight connect or probe
    Disconnect,
    /// Arm the reconnect deadline
    ScheduleReconnect(Duration),
    /// Disarm the reconnect deadline
    CancelReconnect,
    /// Arm the debounced pause deadline
    SchedulePauseCheck(Duration),
    /// Disarm the debounced pause deadline
    CancelPauseCheck,
    /// Run a liveness probe
    ProbeHealth,
    /// Restart the staleness clock
    ResetStaleClock,
    /// Reload state that may have been missed
    CatchUp(CatchUpKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Down,
    Connecting,
    Up,
}

/// Connection lifecycle state machine
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: BackoffPolicy,
    stale_after: Duration,
    hidden_pause_delay: Duration,
    status: ConnectionStatus,
    link: Link,
    started: bool,
    visible: bool,
    online: bool,
    attempt: u32,
    pending_resume: bool,
    replay_gap: bool,
    probing: bool,
}

impl ConnectionMachine {
    /// Machine for the given stream settings; starts idle, visible and online
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            policy: BackoffPolicy::from(config),
            stale_after: Duration::from_millis(config.stale_after_ms),
            hidden_pause_delay: Duration::from_millis(config.hidden_pause_delay_ms),
            status: ConnectionStatus::default(),
            link: Link::Down,
            started: false,
            visible: true,
            online: true,
            attempt: 0,
            pending_resume: false,
            replay_gap: false,
            probing: false,
        }
    }

    /// Current status
    pub fn status(&self) -> &ConnectionStatus {
        &self.status
    }

    /// Reconnect attempts since the last successful open
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Whether a resume is owed because the hold condition blocked the stream
    pub fn pending_resume(&self) -> bool {
        self.pending_resume
    }

    /// Visible and online
    pub fn hold_condition(&self) -> bool {
        self.visible && self.online
    }

    /// Apply one input and return the actions to perform, in order
    pub fn handle(&mut self, input: Input) -> Vec<Action> {
        match input {
            Input::Start => self.start(),
            Input::Stop => self.stop(),
            Input::Opened => self.opened(),
            Input::ConnectFailed(reason) => self.connection_lost(reason, true),
            Input::StreamError(reason) => self.connection_lost(reason, false),
            Input::StreamEnded => self.connection_lost("stream closed by server".into(), false),
            Input::ReconnectTimerFired => self.reconnect_fired(),
            Input::VisibilityChanged(visible) => self.visibility_changed(visible),
            Input::PauseCheckFired => self.pause_check_fired(),
            Input::NetworkChanged(online) => self.network_changed(online),
            Input::FocusGained => self.focus_gained(),
            Input::StaleCheck { idle_for } => self.stale_check(idle_for),
            Input::ProbeResult(healthy) => self.probe_result(healthy),
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            tracing::info!(from = %self.status, to = %status, "Stream connection state changed");
            self.status = status;
        }
    }

    /// Status to show while the hold condition is false. Offline wins.
    fn held_status(&self) -> ConnectionStatus {
        if !self.online {
            ConnectionStatus::with_hint(ConnectionState::Offline, "network unavailable")
        } else {
            ConnectionStatus::with_hint(ConnectionState::Paused, "window hidden")
        }
    }

    fn hold(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.link != Link::Down {
            self.replay_gap = true;
        }
        self.link = Link::Down;
        self.probing = false;
        self.pending_resume = true;
        actions.push(Action::Disconnect);
        actions.push(Action::CancelReconnect);
        self.set_status(self.held_status());
        actions
    }

    fn start(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.started {
            actions.extend([Action::Disconnect, Action::CancelReconnect]);
        }
        self.started = true;
        self.attempt = 0;
        self.link = Link::Down;
        self.probing = false;
        // A fresh subscription has no replay of what happened before it.
        self.replay_gap = true;

        if !self.hold_condition() {
            self.pending_resume = true;
            self.set_status(self.held_status());
            return actions;
        }

        self.link = Link::Connecting;
        self.set_status(ConnectionStatus::new(ConnectionState::Connecting));
        actions.push(Action::Connect);
        actions
    }

    fn stop(&mut self) -> Vec<Action> {
        self.started = false;
        self.link = Link::Down;
        self.attempt = 0;
        self.pending_resume = false;
        self.replay_gap = false;
        self.probing = false;
        self.set_status(ConnectionStatus::new(ConnectionState::Idle));
        vec![
            Action::Disconnect,
            Action::CancelReconnect,
            Action::CancelPauseCheck,
        ]
    }

    fn opened(&mut self) -> Vec<Action> {
        if !self.started || self.link != Link::Connecting {
            return vec![Action::Disconnect];
        }
        self.link = Link::Up;
        self.attempt = 0;
        self.set_status(ConnectionStatus::new(ConnectionState::Connected));

        let mut actions = vec![Action::ResetStaleClock];
        if self.replay_gap {
            self.replay_gap = false;
            actions.push(Action::CatchUp(CatchUpKind::Full));
        }
        actions
    }

    fn connection_lost(&mut self, reason: String, during_connect: bool) -> Vec<Action> {
        let expected = if during_connect {
            Link::Connecting
        } else {
            Link::Up
        };
        if !self.started || self.link != expected {
            return Vec::new();
        }

        tracing::warn!(reason = %reason, attempt = self.attempt, "Event stream connection lost");
        self.link = Link::Down;
        self.probing = false;
        self.replay_gap = true;

        let mut actions = vec![Action::Disconnect];
        if !self.hold_condition() {
            actions.extend(self.hold());
            return actions;
        }

        self.attempt = self.attempt.saturating_add(1);
        let delay = self.policy.next_delay(self.attempt);
        let hint = format!("retrying in {}ms", delay.as_millis());
        let state = if during_connect {
            ConnectionState::Error
        } else {
            ConnectionState::Reconnecting
        };
        let hint = if during_connect {
            format!("{}; {}", reason, hint)
        } else {
            hint
        };
        self.set_status(ConnectionStatus::with_hint(state, hint));
        actions.push(Action::ScheduleReconnect(delay));
        actions
    }

    fn reconnect_fired(&mut self) -> Vec<Action> {
        if !self.started || self.link != Link::Down {
            return Vec::new();
        }
        if !self.hold_condition() {
            return self.hold();
        }
        self.link = Link::Connecting;
        self.set_status(ConnectionStatus::with_hint(
            ConnectionState::Reconnecting,
            format!("attempt {}", self.attempt),
        ));
        vec![Action::Connect]
    }

    fn visibility_changed(&mut self, visible: bool) -> Vec<Action> {
        self.visible = visible;
        if !visible {
            if !self.started {
                return Vec::new();
            }
            return vec![Action::SchedulePauseCheck(self.hidden_pause_delay)];
        }
        let mut actions = vec![Action::CancelPauseCheck];
        actions.extend(self.resume());
        actions
    }

    fn pause_check_fired(&mut self) -> Vec<Action> {
        if !self.started || self.visible {
            return Vec::new();
        }
        tracing::debug!("Consumer still hidden; pausing event stream");
        self.hold()
    }

    fn network_changed(&mut self, online: bool) -> Vec<Action> {
        self.online = online;
        if !self.started {
            return Vec::new();
        }
        if !online {
            let mut actions = self.hold();
            actions.push(Action::CancelPauseCheck);
            return actions;
        }
        self.resume()
    }

    fn focus_gained(&mut self) -> Vec<Action> {
        self.visible = true;
        let mut actions = vec![Action::CancelPauseCheck];
        actions.extend(self.resume());
        actions
    }

    fn resume(&mut self) -> Vec<Action> {
        if !self.started {
            return Vec::new();
        }
        if !self.hold_condition() {
            self.set_status(self.held_status());
            return Vec::new();
        }

        self.attempt = 0;
        let mut actions = vec![Action::CancelReconnect];
        match self.link {
            Link::Down => {
                self.link = Link::Connecting;
                self.set_status(ConnectionStatus::new(ConnectionState::Connecting));
                actions.push(Action::Connect);
            }
            Link::Connecting | Link::Up => {}
        }

        let kind = if self.pending_resume || self.replay_gap {
            CatchUpKind::Full
        } else {
            CatchUpKind::Light
        };
        self.pending_resume = false;
        self.replay_gap = false;
        actions.push(Action::CatchUp(kind));
        actions
    }

    fn stale_check(&mut self, idle_for: Duration) -> Vec<Action> {
        if !self.started
            || self.link != Link::Up
            || !self.hold_condition()
            || self.probing
            || idle_for <= self.stale_after
        {
            return Vec::new();
        }
        tracing::debug!(idle_ms = idle_for.as_millis() as u64, "Event stream quiet; probing server health");
        self.probing = true;
        vec![Action::ProbeHealth]
    }

    fn probe_result(&mut self, healthy: bool) -> Vec<Action> {
        if !self.probing {
            return Vec::new();
        }
        self.probing = false;
        crate::metrics::record_health_probe(healthy);
        if !self.started || self.link != Link::Up {
            return Vec::new();
        }
        if healthy {
            return vec![Action::ResetStaleClock];
        }
        self.connection_lost("health probe failed".into(), false)
    }
}
