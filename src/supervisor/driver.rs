//! Async driver for the connection state machine
//!
//! [`StreamSupervisor::spawn`] starts one actor task that owns the open
//! stream, the in-flight connect and probe futures, and the reconnect,
//! pause and staleness deadlines. Everything else talks to it through a
//! cloneable [`SupervisorHandle`].
//!
//! Frames are only delivered from inside the actor loop, so once a
//! `Disconnect` drops the stream nothing from that subscription can reach
//! the handler again.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::machine::{Action, ConnectionMachine, Input};
use super::{CatchUpKind, ConnectionStatus};
use crate::config::StreamConfig;
use crate::error::Result;
use crate::transport::{EventSource, EventStream};

/// Receiver of everything the supervisor delivers
///
/// Both callbacks run on the supervisor task and must not block; long
/// work (fetches) should be spawned.
pub trait StreamHandler: Send + Sync {
    /// One raw frame from the open stream, in delivery order
    fn on_frame(&self, data: String);

    /// The supervisor regained the stream and state may have been missed
    fn on_catch_up(&self, kind: CatchUpKind);
}

#[derive(Debug)]
enum Command {
    Input(Input),
    Shutdown,
}

/// Cloneable control handle for a running supervisor
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    shut_down: Arc<AtomicBool>,
}

impl SupervisorHandle {
    fn send(&self, input: Input) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        // The actor only goes away after shutdown.
        let _ = self.commands.send(Command::Input(input));
    }

    /// Open the subscription (tearing down any previous one)
    pub fn start(&self) {
        self.send(Input::Start);
    }

    /// Close the subscription and cancel pending retries
    pub fn stop(&self) {
        self.send(Input::Stop);
    }

    /// Report consumer visibility
    pub fn set_visible(&self, visible: bool) {
        self.send(Input::VisibilityChanged(visible));
    }

    /// Report network reachability
    pub fn set_online(&self, online: bool) {
        self.send(Input::NetworkChanged(online));
    }

    /// Report that the window regained focus
    pub fn focus_gained(&self) {
        self.send(Input::FocusGained);
    }

    /// Current status snapshot
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stop the actor. Repeated calls are no-ops.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.commands.send(Command::Shutdown);
    }

    /// Whether `shutdown` has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// Actor running a [`ConnectionMachine`] against an [`EventSource`]
pub struct StreamSupervisor {
    machine: ConnectionMachine,
    source: Arc<dyn EventSource>,
    handler: Arc<dyn StreamHandler>,
    status_tx: watch::Sender<ConnectionStatus>,
    stale_check_interval: Duration,

    connecting: Option<BoxFuture<'static, Result<EventStream>>>,
    stream: Option<EventStream>,
    probe: Option<BoxFuture<'static, bool>>,
    reconnect_at: Option<Instant>,
    pause_check_at: Option<Instant>,
    last_activity: Instant,
}

impl StreamSupervisor {
    /// Spawn the supervisor task. It stays idle until `start` is called.
    ///
    /// # Arguments
    ///
    /// * `source` - Transport used for subscriptions and health probes
    /// * `handler` - Receives frames and catch-up requests
    /// * `config` - Staleness, pause and backoff settings
    ///
    /// # Returns
    ///
    /// A handle controlling the spawned task
    pub fn spawn(
        source: Arc<dyn EventSource>,
        handler: Arc<dyn StreamHandler>,
        config: &StreamConfig,
    ) -> SupervisorHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::default());

        let supervisor = Self {
            machine: ConnectionMachine::new(config),
            source,
            handler,
            status_tx,
            stale_check_interval: Duration::from_millis(config.stale_check_interval_ms.max(1)),
            connecting: None,
            stream: None,
            probe: None,
            reconnect_at: None,
            pause_check_at: None,
            last_activity: Instant::now(),
        };
        tokio::spawn(supervisor.run(command_rx));

        SupervisorHandle {
            commands,
            status,
            shut_down: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut stale_tick = tokio::time::interval(self.stale_check_interval);
        stale_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let input = tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Input(input)) => input,
                    Some(Command::Shutdown) | None => break,
                },
                opened = next_output(&mut self.connecting) => {
                    self.connecting = None;
                    match opened {
                        Ok(stream) => {
                            self.stream = Some(stream);
                            self.last_activity = Instant::now();
                            Input::Opened
                        }
                        Err(e) => Input::ConnectFailed(e.to_string()),
                    }
                }
                item = next_frame(&mut self.stream) => match item {
                    Some(Ok(data)) => {
                        self.last_activity = Instant::now();
                        self.handler.on_frame(data);
                        continue;
                    }
                    Some(Err(e)) => {
                        self.stream = None;
                        Input::StreamError(e.to_string())
                    }
                    None => {
                        self.stream = None;
                        Input::StreamEnded
                    }
                },
                healthy = next_output(&mut self.probe) => {
                    self.probe = None;
                    Input::ProbeResult(healthy)
                }
                _ = sleep_until_opt(self.reconnect_at) => {
                    self.reconnect_at = None;
                    Input::ReconnectTimerFired
                }
                _ = sleep_until_opt(self.pause_check_at) => {
                    self.pause_check_at = None;
                    Input::PauseCheckFired
                }
                _ = stale_tick.tick() => Input::StaleCheck {
                    idle_for: self.last_activity.elapsed(),
                },
            };

            let actions = self.machine.handle(input);
            for action in actions {
                self.execute(action);
            }
            self.publish_status();
        }

        self.connecting = None;
        self.stream = None;
        self.probe = None;
        self.status_tx.send_replace(ConnectionStatus::default());
        tracing::debug!("Stream supervisor shut down");
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Connect => {
                self.stream = None;
                self.probe = None;
                let source = Arc::clone(&self.source);
                self.connecting = Some(Box::pin(async move { source.subscribe().await }));
            }
            Action::Disconnect => {
                self.connecting = None;
                self.stream = None;
                self.probe = None;
            }
            Action::ScheduleReconnect(delay) => {
                tracing::info!(
                    attempt = self.machine.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling event stream reconnect"
                );
                crate::metrics::record_reconnect(self.machine.attempt());
                self.reconnect_at = Some(Instant::now() + delay);
            }
            Action::CancelReconnect => self.reconnect_at = None,
            Action::SchedulePauseCheck(delay) => {
                self.pause_check_at = Some(Instant::now() + delay);
            }
            Action::CancelPauseCheck => self.pause_check_at = None,
            Action::ProbeHealth => {
                let source = Arc::clone(&self.source);
                self.probe = Some(Box::pin(async move { source.health_check().await }));
            }
            Action::ResetStaleClock => self.last_activity = Instant::now(),
            Action::CatchUp(kind) => {
                tracing::info!(?kind, "Requesting state catch-up");
                self.handler.on_catch_up(kind);
            }
        }
    }

    fn publish_status(&self) {
        let status = self.machine.status().clone();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            crate::metrics::set_connection_state(status.state);
            *current = status;
            true
        });
    }
}

async fn next_output<T>(slot: &mut Option<BoxFuture<'static, T>>) -> T {
    match slot {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_frame(slot: &mut Option<EventStream>) -> Option<Result<String>> {
    match slot {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

fn sleep_until_opt(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}
