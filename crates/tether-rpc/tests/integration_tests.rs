//! Integration tests for the tether-rpc binary.
//!
//! These start the real process, read its `RPC_PORT=` line and talk to it
//! the way a launcher would.

use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tether_core::ipc::call_unary;
use tether_core::ConnectionManager;
use tokio::io::AsyncBufReadExt;

/// Whether `/health` answers `{"status": "ok"}` within `deadline`.
async fn wait_healthy(port: u16, deadline: Duration) -> bool {
    let url = format!("http://127.0.0.1:{}/health", port);
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if let Ok(response) = reqwest::get(&url).await {
            if let Ok(body) = response.json::<Value>().await {
                if body["status"] == "ok" {
                    return true;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// A running `tether-rpc` child. Killed when dropped.
struct RpcProcess {
    _child: tokio::process::Child,
    port: u16,
}

impl RpcProcess {
    fn websocket_url(&self) -> String {
        format!("ws://127.0.0.1:{}/api/websocket", self.port)
    }
}

/// Start the binary, read its `RPC_PORT=` line and wait for `/health`.
async fn start_rpc_server(data_dir: &Path, apps: &Path) -> RpcProcess {
    let mut child = tokio::process::Command::new(env!("CARGO_BIN_EXE_tether-rpc"))
        .args(["--host", "127.0.0.1", "--port", "0"])
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--apps")
        .arg(apps)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .expect("failed to spawn tether-rpc");

    let stdout = child.stdout.take().expect("stdout is piped");
    let mut lines = tokio::io::BufReader::new(stdout).lines();
    let port = tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(line) = lines.next_line().await.unwrap() {
            if let Some(value) = line.strip_prefix("RPC_PORT=") {
                return value.trim().parse::<u16>().unwrap();
            }
        }
        panic!("tether-rpc exited before printing RPC_PORT");
    })
    .await
    .expect("RPC_PORT line not emitted");

    // Keep the pipe drained so the child never blocks on stdout.
    tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    assert!(
        wait_healthy(port, Duration::from_secs(15)).await,
        "tether-rpc failed health check on port {port}"
    );
    RpcProcess {
        _child: child,
        port,
    }
}

/// Write a manifest with one app whose daemon is never spawned here.
fn write_manifest(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("apps.json");
    std::fs::write(
        &path,
        json!({"notes": {"program": "notes-daemon", "target": "notes/main"}}).to_string(),
    )
    .unwrap();
    path
}

async fn connect(server: &RpcProcess) -> ConnectionManager {
    let conn = ConnectionManager::new(&server.websocket_url()).unwrap();
    tokio::time::timeout(Duration::from_secs(10), conn.wait_open())
        .await
        .expect("connection did not open")
        .unwrap();
    conn
}

#[tokio::test]
async fn test_server_starts_and_lists_apps() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp);
    let server = start_rpc_server(&temp.path().join("data"), &manifest).await;

    let conn = connect(&server).await;
    let apps = call_unary(&conn, "GetApps", json!({})).await.unwrap();
    assert_eq!(
        apps,
        json!([{"appId": "notes", "running": false, "port": null}])
    );

    // Manifest apps have their settings topic before anyone asks.
    let topics = call_unary(&conn, "GetTopics", json!({})).await.unwrap();
    assert!(topics.get("app-settings/notes").is_some(), "{}", topics);

    conn.shutdown();
}

#[tokio::test]
async fn test_settings_persist_across_restart() {
    let temp = TempDir::new().unwrap();
    let manifest = write_manifest(&temp);
    let data_dir = temp.path().join("data");

    let server = start_rpc_server(&data_dir, &manifest).await;
    let conn = connect(&server).await;
    let reply = call_unary(
        &conn,
        "UpdateAppSettings",
        json!({"appId": "notes", "settings": {"fontSize": 14}}),
    )
    .await
    .unwrap();
    assert_eq!(reply, json!({"changed": true}));
    conn.shutdown();
    drop(server);

    let server = start_rpc_server(&data_dir, &manifest).await;
    let conn = connect(&server).await;
    let snapshot = call_unary(&conn, "GetAppSettings", json!({"appId": "notes"}))
        .await
        .unwrap();
    assert_eq!(snapshot["state"], json!({"fontSize": 14}));
    // Counters restart with the process; the document does not.
    assert_eq!(snapshot["counter"], 0);

    conn.shutdown();
}
