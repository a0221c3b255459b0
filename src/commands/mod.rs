/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `watch`  - Follow the stream and print connection and activity changes
- `resync` - One-shot history pull for a session
- `status` - Server status map and liveness probe
- `cursor` - Stored cursor lookup

These handlers are intentionally small and use the library components:
the sync service, the HTTP transport and the cursor store.
*/

use crate::config::Config;
use crate::error::Result;
use crate::storage::SqliteCursorStore;

// Status map and health probe
pub mod status;

// Cursor inspection
pub mod cursor;

/// Open the cursor store named by the configuration
pub(crate) fn open_cursor_store(config: &Config) -> Result<SqliteCursorStore> {
    match &config.storage.cursor_db {
        Some(path) => SqliteCursorStore::new_with_path(path.clone()),
        None => SqliteCursorStore::new(),
    }
}

// Watch command handler
pub mod watch {
    //! Long-running watch mode.
    //!
    //! Starts the supervised stream and the periodic status poll, then
    //! prints every connection status and activity phase change until
    //! Ctrl-C.

    use colored::Colorize;
    use tokio::sync::broadcast::error::RecvError;

    use crate::activity::{ActivityPhase, PhaseChange};
    use crate::config::Config;
    use crate::error::Result;
    use crate::supervisor::{ConnectionState, ConnectionStatus};
    use crate::sync::SyncService;

    /// Follow the event stream until interrupted
    ///
    /// # Arguments
    ///
    /// * `config` - Validated configuration
    /// * `session` - Session to treat as the one on screen
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot be constructed.
    pub async fn run_watch(config: Config, session: Option<String>) -> Result<()> {
        let server = config.server.base_url.clone();
        let service = SyncService::from_config(config)?;
        if let Some(session) = session {
            tracing::info!(session_id = %session, "Following session");
            service.set_current_session(Some(session));
        }

        let mut status_rx = service.subscribe_status();
        let mut activity_rx = service.subscribe_activity();
        let poller = service.spawn_status_poll_loop();
        service.start_stream();

        println!("Watching {} (Ctrl-C to stop)\n", server.cyan());

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    break;
                }
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = status_rx.borrow_and_update().clone();
                    println!("{}", format_status(&status));
                }
                change = activity_rx.recv() => match change {
                    Ok(change) => println!("{}", format_phase(&change)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Activity feed lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        service.shutdown();
        poller.abort();
        println!("{}", "Stopped.".yellow());
        Ok(())
    }

    pub(crate) fn format_status(status: &ConnectionStatus) -> String {
        let state = match status.state {
            ConnectionState::Connected => status.state.as_str().green(),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                status.state.as_str().yellow()
            }
            ConnectionState::Error | ConnectionState::Offline => status.state.as_str().red(),
            ConnectionState::Idle | ConnectionState::Paused => status.state.as_str().dimmed(),
        };
        match &status.hint {
            Some(hint) => format!("[stream] {} ({})", state, hint),
            None => format!("[stream] {}", state),
        }
    }

    pub(crate) fn format_phase(change: &PhaseChange) -> String {
        let phase = match change.phase {
            ActivityPhase::Busy => change.phase.as_str().yellow(),
            ActivityPhase::Cooldown => change.phase.as_str().cyan(),
            ActivityPhase::Idle => change.phase.as_str().dimmed(),
        };
        format!("[{}] {}", change.session_id, phase)
    }

}

// Resync command handler
pub mod resync {
    //! One-shot resync.
    //!
    //! Pulls the recent history of a session into an empty store using
    //! the same splice rules as the live service, then prints it.

    use colored::Colorize;

    use crate::config::Config;
    use crate::error::Result;
    use crate::event::types::{MessageRecord, Role};
    use crate::resync::ResyncOutcome;
    use crate::sync::SyncService;

    const PREVIEW_CHARS: usize = 80;

    /// Resync `session` and print the resulting messages
    ///
    /// # Errors
    ///
    /// Returns an error if the service cannot be constructed or the fetch
    /// failed.
    pub async fn run_resync(config: Config, session: String) -> Result<()> {
        let service = SyncService::from_config(config)?;
        let resynced = service.resync_session(&session).await;
        service.shutdown();

        if resynced.outcome == ResyncOutcome::Failed {
            return Err(crate::error::SyncError::Transport(format!(
                "could not fetch messages for {}",
                session
            ))
            .into());
        }

        if resynced.messages.is_empty() {
            println!("{}", "No messages found.".yellow());
            return Ok(());
        }

        println!("\nSession {} ({} messages):\n", session.cyan(), resynced.messages.len());
        for message in &resynced.messages {
            println!("{}", format_message(message));
        }
        println!();
        Ok(())
    }

    pub(crate) fn format_message(message: &MessageRecord) -> String {
        let role = match message.info.role {
            Role::User => "user".blue(),
            Role::Assistant => "assistant".magenta(),
        };
        let marker = if message.info.time.completed.is_some() || message.info.role == Role::User {
            " "
        } else {
            "…"
        };
        let text = message.text();
        let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let preview: String = if flattened.chars().count() > PREVIEW_CHARS {
            let cut: String = flattened.chars().take(PREVIEW_CHARS - 3).collect();
            format!("{}...", cut)
        } else {
            flattened
        };
        format!("{}{:>10} {} {}", marker, role, message.info.id.dimmed(), preview)
    }

}
