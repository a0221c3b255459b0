//! End-to-end tests for `SyncService` over HTTP
//!
//! A `wiremock` server plays the OpenCode server: it serves a short SSE
//! stream plus the snapshot endpoints used by bootstrap and resync.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use openchamber_sync::config::Config;
use openchamber_sync::storage::{CursorStore, MemoryCursorStore};
use openchamber_sync::{ConnectionState, SyncService};

use common::{client_for, sse_body, wait_for};

fn config_for(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.server.base_url = server.uri();
    config
}

async fn mount_snapshots(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/session"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "id": "ses_1", "directory": "/repo" }
        ])))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/session/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/session/ses_1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": "ses_1", "title": "Fix the parser (done)" })),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_stream_events_are_reconciled_into_the_store() {
    let server = MockServer::start().await;
    mount_snapshots(&server).await;

    let message = "msg_01J9Z0000000000000000001";
    let frames = [
        json!({
            "type": "message.part.updated",
            "properties": { "part": {
                "id": "prt_01J9Z0000000000000000001", "messageID": message,
                "sessionID": "ses_1", "type": "text", "text": "All tests pass."
            }}
        })
        .to_string(),
        json!({
            "type": "message.updated",
            "properties": { "info": {
                "id": message, "sessionID": "ses_1", "role": "assistant",
                "time": { "created": 1, "completed": 2 }, "finish": "stop"
            }}
        })
        .to_string(),
    ];
    let frame_refs: Vec<&str> = frames.iter().map(String::as_str).collect();
    Mock::given(method("GET"))
        .and(path("/global/event"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&frame_refs).into_bytes(), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let client = Arc::new(client_for(&server.uri(), ""));
    let cursors = Arc::new(MemoryCursorStore::new());
    let service = SyncService::new(config_for(&server), client.clone(), client, cursors.clone());
    service.start_stream();

    let store = service.store().clone();
    let completed = wait_for(Duration::from_secs(5), || {
        store
            .message("ses_1", message)
            .is_some_and(|m| m.info.time.completed == Some(2))
    })
    .await;
    assert!(completed, "message should be reconciled and completed");
    assert_eq!(store.message("ses_1", message).unwrap().text(), "All tests pass.");

    let cursor = cursors.read_cursor("ses_1").unwrap().expect("cursor written");
    assert_eq!(cursor.message_id, message);

    let refreshed = wait_for(Duration::from_secs(5), || {
        store
            .session("ses_1")
            .and_then(|s| s.title)
            .is_some_and(|t| t == "Fix the parser (done)")
    })
    .await;
    assert!(refreshed, "metadata refresh should update the title");

    service.shutdown();
}

#[tokio::test]
async fn test_refused_stream_reports_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/global/event"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = Arc::new(client_for(&server.uri(), ""));
    let service = SyncService::new(
        config_for(&server),
        client.clone(),
        client,
        Arc::new(MemoryCursorStore::new()),
    );
    service.start_stream();

    let errored = wait_for(Duration::from_secs(5), || {
        service.connection_status().state == ConnectionState::Error
    })
    .await;
    assert!(errored);
    assert!(service.connection_status().hint.is_some());
    service.shutdown();
}

#[tokio::test]
async fn test_resync_session_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/session/ses_1/message"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "info": { "id": "msg_01J9Z0000000000000000002", "sessionID": "ses_1",
                        "role": "assistant", "time": { "created": 20, "completed": 21 } },
              "parts": [] },
            { "info": { "id": "msg_01J9Z0000000000000000001", "sessionID": "ses_1",
                        "role": "user", "time": { "created": 10 } },
              "parts": [] }
        ])))
        .mount(&server)
        .await;

    let client = Arc::new(client_for(&server.uri(), ""));
    let service = SyncService::new(
        config_for(&server),
        client.clone(),
        client,
        Arc::new(MemoryCursorStore::new()),
    );

    let resynced = service.resync_session("ses_1").await;
    let ids: Vec<&str> = resynced.messages.iter().map(|m| m.info.id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["msg_01J9Z0000000000000000001", "msg_01J9Z0000000000000000002"]
    );
    service.shutdown();
}
