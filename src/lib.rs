//! openchamber-sync - Event-stream reconciliation core for OpenCode clients
//!
//! This library consumes an OpenCode server's event stream and reconciles
//! it into a locally consistent, monotonically advancing session and
//! message state, despite an unreliable transport and a server that may
//! deliver out-of-order, duplicate, partial or regressive updates.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `event`: domain types and the shape-tolerant event decoder
//! - `supervisor`: connection lifecycle (pause, resume, backoff, staleness)
//! - `reconcile`: per-event merge decisions
//! - `activity`: per-session `idle`/`busy`/`cooldown` phase
//! - `resync`: pull-based history splice
//! - `sync`: the service wiring everything together
//! - `store`: in-memory session store and change feed
//! - `storage`: durable session cursors
//! - `transport`: HTTP/SSE client for the OpenCode server
//! - `config`, `error`, `logging`, `metrics`, `cli`: ambient plumbing
//!
//! # Example
//!
//! ```no_run
//! use openchamber_sync::{Config, SyncService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let service = SyncService::from_config(config)?;
//!     service.set_current_session(Some("ses_123".to_string()));
//!     service.start_stream();
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod reconcile;
pub mod resync;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod sync;
pub mod transport;

// Re-export commonly used types
pub use activity::{ActivityPhase, ActivityTracker};
pub use config::Config;
pub use error::{DecodeError, Result, SyncError};
pub use event::{decode_frame, StreamEvent};
pub use reconcile::{Outcome, ReconciliationEngine};
pub use resync::{ResyncCoordinator, ResyncOutcome};
pub use store::{SessionStore, StoreChange};
pub use supervisor::{ConnectionState, ConnectionStatus};
pub use sync::SyncService;

#[cfg(test)]
pub mod test_utils;
