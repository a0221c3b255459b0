use crate::config::Config;
use crate::error::Result;
use crate::storage::{CursorStore, SessionCursor};
use colored::Colorize;

/// Print the stored cursor for `session`
pub fn show_cursor(config: &Config, session: &str) -> Result<()> {
    let store = super::open_cursor_store(config)?;
    match store.read_cursor(session)? {
        Some(cursor) => println!("{}", describe(&cursor)),
        None => println!("{}", format!("No cursor stored for {}", session).yellow()),
    }
    Ok(())
}

fn describe(cursor: &SessionCursor) -> String {
    let completed = chrono::DateTime::from_timestamp_millis(cursor.completed_at)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| cursor.completed_at.to_string());
    format!(
        "Session:    {}\nMessage:    {}\nCompleted:  {}",
        cursor.session_id, cursor.message_id, completed
    )
}
