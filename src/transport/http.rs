//! HTTP/SSE client for the OpenCode server
//!
//! [`HttpOpenCodeClient`] implements [`EventSource`] over the global event
//! stream (`GET {prefix}/global/event`) and [`OpenCodeApi`] over the REST
//! snapshot endpoints. Directory scoping of the stream happens client-side;
//! snapshot requests carry the configured directory as a query parameter.
//!
//! Two reqwest clients are kept: snapshot requests use the configured
//! request timeout, while the event stream only bounds the connect phase
//! (a whole-request timeout would cut long-lived streams).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::sse::parse_sse_stream;
use super::{EventSource, EventStream, OpenCodeApi};
use crate::config::ServerConfig;
use crate::error::{Result, SyncError};
use crate::event::decoder::{decode_message_record, decode_session_patch, decode_status_map};
use crate::event::types::{MessageRecord, SessionPatch, StatusKind};

/// Connect timeout for the event stream
const STREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the liveness probe
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// reqwest-backed OpenCode client
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use openchamber_sync::transport::HttpOpenCodeClient;
///
/// let client = HttpOpenCodeClient::new(
///     url::Url::parse("http://127.0.0.1:4096").unwrap(),
///     "",
///     Duration::from_secs(30),
/// )
/// .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct HttpOpenCodeClient {
    http_client: reqwest::Client,
    stream_client: reqwest::Client,
    base_url: url::Url,
    api_prefix: String,
    directory: Option<String>,
    /// Last SSE event id, sent as `Last-Event-ID` when resubscribing
    last_event_id: Arc<RwLock<Option<String>>>,
}

impl HttpOpenCodeClient {
    /// Build a client for the server at `base_url`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Server origin, e.g. `http://127.0.0.1:4096`
    /// * `api_prefix` - Path prefix the API is mounted under (may be empty)
    /// * `timeout` - Per-request timeout for snapshot endpoints
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: url::Url, api_prefix: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to build HTTP client: {}", e)))?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(STREAM_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to build stream client: {}", e)))?;

        Ok(Self {
            http_client,
            stream_client,
            base_url,
            api_prefix: normalize_prefix(api_prefix),
            directory: None,
            last_event_id: Arc::new(RwLock::new(None)),
        })
    }

    /// Build a client from the `server` configuration section
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let base_url = url::Url::parse(&config.base_url)
            .map_err(|e| SyncError::Config(format!("invalid server.base_url: {}", e)))?;
        Ok(Self::new(
            base_url,
            &config.api_prefix,
            Duration::from_secs(config.request_timeout_secs),
        )?
        .with_directory(config.directory.clone()))
    }

    /// Scope snapshot requests to a working directory
    pub fn with_directory(mut self, directory: Option<String>) -> Self {
        self.directory = directory.filter(|d| !d.is_empty());
        self
    }

    fn endpoint(&self, path: &str) -> Result<url::Url> {
        let raw = format!(
            "{}{}{}",
            self.base_url.as_str().trim_end_matches('/'),
            self.api_prefix,
            path
        );
        url::Url::parse(&raw)
            .map_err(|e| SyncError::Config(format!("invalid endpoint {}: {}", raw, e)).into())
    }

    /// `/session/{id}/{tail..}` with the id pushed as a single escaped segment
    fn session_endpoint(&self, session_id: &str, tail: &[&str]) -> Result<url::Url> {
        let mut url = self.endpoint("/session")?;
        url.path_segments_mut()
            .map_err(|_| SyncError::Config("server.base_url cannot take a path".to_string()))?
            .pop_if_empty()
            .push(session_id)
            .extend(tail);
        Ok(url)
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = self.endpoint(path)?;
        self.get_json_url(url, query).await
    }

    async fn get_json_url(&self, url: url::Url, query: &[(&str, String)]) -> Result<Value> {
        let path = url.path().to_string();
        let mut req = self.http_client.get(url).header("Accept", "application/json");
        if !query.is_empty() {
            req = req.query(query);
        }

        let response = req.send().await.map_err(|e| {
            SyncError::Transport(format!("GET {} failed: {}", path, e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SyncError::Transport(format!("GET {} returned HTTP {}", path, status)).into());
        }

        let body = response.json::<Value>().await?;
        Ok(body)
    }

    fn directory_query(&self) -> Vec<(&'static str, String)> {
        self.directory
            .iter()
            .map(|d| ("directory", d.clone()))
            .collect()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

#[async_trait::async_trait]
impl EventSource for HttpOpenCodeClient {
    async fn subscribe(&self) -> Result<EventStream> {
        let url = self.endpoint("/global/event")?;
        let mut req = self
            .stream_client
            .get(url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache");

        if let Some(id) = self.last_event_id.read().await.as_deref() {
            req = req.header("Last-Event-ID", id);
        }

        let response = req
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("event stream request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(
                SyncError::Transport(format!("event stream returned HTTP {}", status)).into(),
            );
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let byte_stream = response.bytes_stream();
        let last_event_id = Arc::clone(&self.last_event_id);

        tokio::spawn(async move {
            let closed = tx.clone();
            tokio::select! {
                _ = parse_sse_stream(byte_stream, tx, last_event_id) => {}
                _ = closed.closed() => {
                    tracing::debug!("Event stream receiver dropped; closing connection");
                }
            }
        });

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn health_check(&self) -> bool {
        let url = match self.endpoint("/global/health") {
            Ok(url) => url,
            Err(_) => return false,
        };
        let response = match self.http_client.get(url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(error = %e, "Health probe failed");
                return false;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), "Health probe returned error status");
            return false;
        }
        // Older servers answer with an empty body; only an explicit
        // `healthy: false` counts as unhealthy.
        match response.json::<Value>().await {
            Ok(body) => body.get("healthy").and_then(Value::as_bool) != Some(false),
            Err(_) => true,
        }
    }
}

#[async_trait::async_trait]
impl OpenCodeApi for HttpOpenCodeClient {
    async fn fetch_recent_messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let mut query = self.directory_query();
        query.push(("limit", limit.to_string()));
        let body = self
            .get_json_url(self.session_endpoint(session_id, &["message"])?, &query)
            .await?;

        let items = body.as_array().ok_or_else(|| {
            SyncError::Transport(format!("unexpected message list shape for {}", session_id))
        })?;

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match decode_message_record(item) {
                Ok(record) => records.push(record),
                Err(e) => tracing::debug!(session_id, error = %e, "Skipping undecodable message"),
            }
        }
        Ok(records)
    }

    async fn fetch_session(&self, session_id: &str) -> Result<SessionPatch> {
        let body = self
            .get_json_url(self.session_endpoint(session_id, &[])?, &self.directory_query())
            .await?;
        Ok(decode_session_patch(&body)?)
    }

    async fn list_sessions(&self) -> Result<Vec<SessionPatch>> {
        let body = self.get_json("/session", &self.directory_query()).await?;
        let items = body
            .as_array()
            .ok_or_else(|| SyncError::Transport("unexpected session list shape".into()))?;
        Ok(items
            .iter()
            .filter_map(|item| match decode_session_patch(item) {
                Ok(patch) => Some(patch),
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping undecodable session");
                    None
                }
            })
            .collect())
    }

    async fn fetch_global_status(&self) -> Result<HashMap<String, StatusKind>> {
        let body = self.get_json("/session/status", &[]).await?;
        Ok(decode_status_map(&body))
    }

    async fn fetch_directory_status(
        &self,
        directory: &str,
    ) -> Result<HashMap<String, StatusKind>> {
        let body = self
            .get_json("/session/status", &[("directory", directory.to_string())])
            .await?;
        Ok(decode_status_map(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(prefix: &str) -> HttpOpenCodeClient {
        HttpOpenCodeClient::new(
            url::Url::parse("http://localhost:4096/").unwrap(),
            prefix,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("/"), "");
        assert_eq!(normalize_prefix("api"), "/api");
        assert_eq!(normalize_prefix("/api/"), "/api");
    }

    #[test]
    fn test_endpoint_joins_prefix() {
        assert_eq!(
            client("/api").endpoint("/global/event").unwrap().as_str(),
            "http://localhost:4096/api/global/event"
        );
        assert_eq!(
            client("").endpoint("/session").unwrap().as_str(),
            "http://localhost:4096/session"
        );
    }

    #[test]
    fn test_session_id_is_escaped_as_one_segment() {
        let c = client("/api");
        assert_eq!(
            c.session_endpoint("ses_1", &["message"]).unwrap().as_str(),
            "http://localhost:4096/api/session/ses_1/message"
        );
        assert_eq!(
            c.session_endpoint("a/b?c#d", &[]).unwrap().as_str(),
            "http://localhost:4096/api/session/a%2Fb%3Fc%23d"
        );
    }

    #[test]
    fn test_empty_directory_is_ignored() {
        let c = client("").with_directory(Some(String::new()));
        assert!(c.directory_query().is_empty());
        let c = client("").with_directory(Some("/repo".into()));
        assert_eq!(c.directory_query(), vec![("directory", "/repo".to_string())]);
    }

    #[tokio::test]
    async fn test_health_check_unreachable_server_is_false() {
        let c = HttpOpenCodeClient::new(
            url::Url::parse("http://127.0.0.1:1").unwrap(),
            "",
            Duration::from_millis(200),
        )
        .unwrap();
        assert!(!c.health_check().await);
    }
}
