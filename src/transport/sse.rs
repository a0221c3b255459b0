//! Server-sent events frame parser
//!
//! Splits a byte stream into events on blank lines and forwards each
//! event's joined `data:` value. `id:` values are remembered so a later
//! subscription can send `Last-Event-ID`. Comment lines (`:`) and
//! `event: ping` frames are dropped.

use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, RwLock};

use crate::error::{Result, SyncError};

/// Parse an SSE byte stream and forward complete `data:` payloads to `tx`.
///
/// Intended to run inside `tokio::spawn`. Returns when the byte stream
/// ends, a chunk fails (the failure is forwarded as an `Err` item), or
/// the receiving side is dropped.
///
/// # Arguments
///
/// * `byte_stream` - Raw HTTP response body
/// * `tx` - Channel receiving one item per event
/// * `last_event_id` - Updated whenever an event carries an `id:` field
pub async fn parse_sse_stream<S>(
    byte_stream: S,
    tx: mpsc::UnboundedSender<Result<String>>,
    last_event_id: Arc<RwLock<Option<String>>>,
) where
    S: Stream<Item = reqwest::Result<Bytes>>,
{
    let mut buffer: Vec<u8> = Vec::new();

    tokio::pin!(byte_stream);

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(SyncError::Transport(format!(
                    "event stream read failed: {}",
                    e
                ))
                .into()));
                return;
            }
        };

        buffer.extend_from_slice(&chunk);

        while let Some((end, delimiter_len)) = find_event_boundary(&buffer) {
            let block: Vec<u8> = buffer.drain(..end + delimiter_len).take(end).collect();
            if !process_sse_event(&String::from_utf8_lossy(&block), &tx, &last_event_id).await {
                return;
            }
        }
    }

    if !buffer.is_empty() {
        process_sse_event(&String::from_utf8_lossy(&buffer), &tx, &last_event_id).await;
    }
}

/// Locate the first blank line, accepting both `\n\n` and `\r\n\r\n`.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Handle one event block. Returns `false` once the receiver is gone.
async fn process_sse_event(
    event_block: &str,
    tx: &mpsc::UnboundedSender<Result<String>>,
    last_event_id: &Arc<RwLock<Option<String>>>,
) -> bool {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;
    let mut event_id: Option<&str> = None;

    for line in event_block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("id:") {
            event_id = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
    }

    if let Some(id) = event_id {
        *last_event_id.write().await = Some(id.to_string());
    }

    if event_type.is_some_and(|et| et.eq_ignore_ascii_case("ping")) {
        return !tx.is_closed();
    }

    let data = data_lines.join("\n");
    if data.trim().is_empty() {
        return !tx.is_closed();
    }

    tx.send(Ok(data)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(chunks: &[&[u8]]) -> (Vec<String>, Option<String>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let last_event_id = Arc::new(RwLock::new(None::<String>));
        let byte_stream = futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok::<_, reqwest::Error>(Bytes::copy_from_slice(c)))
                .collect::<Vec<_>>(),
        );

        parse_sse_stream(byte_stream, tx, Arc::clone(&last_event_id)).await;

        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item.expect("unexpected error item"));
        }
        let id = last_event_id.read().await.clone();
        (out, id)
    }

    #[tokio::test]
    async fn test_parse_single_data_event() {
        let (events, _) = collect(&[&b"data: {\"type\":\"server.connected\"}\n\n"[..]]).await;
        assert_eq!(events, vec![r#"{"type":"server.connected"}"#]);
    }

    #[tokio::test]
    async fn test_parse_event_split_across_chunks() {
        let (events, _) = collect(&[&b"data: {\"ty"[..], &b"pe\":\"a\"}\n"[..], &b"\ndata: b\n\n"[..]]).await;
        assert_eq!(events, vec![r#"{"type":"a"}"#, "b"]);
    }

    #[tokio::test]
    async fn test_parse_multibyte_char_split_across_chunks() {
        // "é" is 0xC3 0xA9
        let (events, _) = collect(&[&b"data: caf\xC3"[..], &b"\xA9\n\n"[..]]).await;
        assert_eq!(events, vec!["café"]);
    }

    #[tokio::test]
    async fn test_parse_crlf_delimiters() {
        let (events, _) = collect(&[&b"data: one\r\n\r\ndata: two\r\n\r\n"[..]]).await;
        assert_eq!(events, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_parse_joins_multiline_data() {
        let (events, _) = collect(&[&b"data: line1\ndata: line2\n\n"[..]]).await;
        assert_eq!(events, vec!["line1\nline2"]);
    }

    #[tokio::test]
    async fn test_parse_drops_ping_and_comments() {
        let (events, _) =
            collect(&[&b": keepalive\n\nevent: ping\ndata: x\n\ndata: real\n\n"[..]]).await;
        assert_eq!(events, vec!["real"]);
    }

    #[tokio::test]
    async fn test_parse_stores_last_event_id() {
        let (_, id) = collect(&[&b"id: evt-42\ndata: payload\n\n"[..]]).await;
        assert_eq!(id.as_deref(), Some("evt-42"));
    }

    #[tokio::test]
    async fn test_parse_flushes_trailing_event_without_delimiter() {
        let (events, _) = collect(&[&b"data: tail"[..]]).await;
        assert_eq!(events, vec!["tail"]);
    }

    #[tokio::test]
    async fn test_parse_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let byte_stream = futures::stream::iter(vec![Ok::<_, reqwest::Error>(
            Bytes::from_static(b"data: a\n\ndata: b\n\n"),
        )]);
        // Completes without panicking even though nobody listens.
        parse_sse_stream(byte_stream, tx, Arc::new(RwLock::new(None))).await;
    }
}
