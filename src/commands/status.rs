use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::event::types::StatusKind;
use crate::transport::{EventSource, HttpOpenCodeClient, OpenCodeApi};
use colored::Colorize;
use prettytable::{format, Table};
use std::collections::HashMap;

/// Print the server's status map for the configured scope
pub async fn show_status(config: &Config) -> Result<()> {
    let client = HttpOpenCodeClient::from_config(&config.server)?;
    let statuses = match config.server.directory.as_deref() {
        Some(directory) => client.fetch_directory_status(directory).await?,
        None => client.fetch_global_status().await?,
    };

    if statuses.is_empty() {
        println!("{}", "All sessions idle.".green());
        return Ok(());
    }

    println!("\nSession Status:");
    build_table(&statuses).printstd();
    println!();
    Ok(())
}

fn status_label(status: StatusKind) -> colored::ColoredString {
    match status {
        StatusKind::Idle => "idle".normal(),
        StatusKind::Busy => "busy".yellow(),
        StatusKind::Retry => "retry".red(),
    }
}

fn build_table(statuses: &HashMap<String, StatusKind>) -> Table {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BORDERS_ONLY);
    table.add_row(prettytable::row!["Session".bold(), "Status".bold()]);

    let mut rows: Vec<_> = statuses.iter().collect();
    rows.sort_by(|a, b| a.0.cmp(b.0));
    for (session_id, status) in rows {
        table.add_row(prettytable::row![session_id.cyan(), status_label(*status)]);
    }
    table
}

/// Probe server liveness
///
/// # Errors
///
/// Returns [`SyncError::Transport`] when the server is unreachable or
/// reports itself unhealthy, so the process exits non-zero.
pub async fn check_health(config: &Config) -> Result<()> {
    let client = HttpOpenCodeClient::from_config(&config.server)?;
    if client.health_check().await {
        println!("{} {}", "healthy".green(), config.server.base_url);
        Ok(())
    } else {
        println!("{} {}", "unhealthy".red(), config.server.base_url);
        Err(SyncError::Transport(format!("{} is not healthy", config.server.base_url)).into())
    }
}
