use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use openchamber_sync::storage::SqliteCursorStore;
use openchamber_sync::transport::HttpOpenCodeClient;

#[allow(dead_code)]
pub fn create_temp_cursor_store() -> (SqliteCursorStore, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let db_path = tmp.path().join("cursors.db");
    let store =
        SqliteCursorStore::new_with_path(db_path).expect("failed to create cursor store with path");
    (store, tmp)
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Client pointing at a wiremock server
#[allow(dead_code)]
pub fn client_for(base_url: &str, prefix: &str) -> HttpOpenCodeClient {
    HttpOpenCodeClient::new(
        url::Url::parse(base_url).expect("valid url"),
        prefix,
        Duration::from_secs(5),
    )
    .expect("client builds")
}

/// Build an SSE body from `data:` payloads
#[allow(dead_code)]
pub fn sse_body(frames: &[&str]) -> String {
    frames
        .iter()
        .map(|frame| format!("data: {}\n\n", frame))
        .collect()
}

/// Poll `check` until it holds or `timeout` elapses
#[allow(dead_code)]
pub async fn wait_for<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
