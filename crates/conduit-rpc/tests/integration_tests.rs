//! Integration tests for the conduit-rpc binary.
//!
//! Each test spawns the binary, reads the `RPC_PORT=` line from stdout and
//! talks to the backend over the wire.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

/// Check health endpoint.
async fn check_health(port: u16) -> bool {
    let client = reqwest::Client::new();
    if let Ok(response) = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        if let Ok(json) = response.json::<Value>().await {
            return json.get("status").and_then(|v| v.as_str()) == Some("ok");
        }
    }
    false
}

/// Wait for server to be ready.
async fn wait_for_server(port: u16, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if check_health(port).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

fn binary_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_conduit-rpc") {
        return Ok(PathBuf::from(path));
    }
    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

    let mut fallback = target_debug_dir.join("conduit-rpc");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_conduit-rpc not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

struct RpcServerHandle {
    child: tokio::process::Child,
    port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

/// Start the binary with `transport` and wait for its `RPC_PORT=` line.
async fn start_rpc_server(transport: &str) -> Result<RpcServerHandle, String> {
    let binary = binary_path()?;
    let mut child = tokio::process::Command::new(&binary)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--transport")
        .arg(transport)
        .arg("--max-message-size")
        .arg("65536")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to spawn conduit-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut discovered_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(value) = line.strip_prefix("RPC_PORT=") {
                    let parsed = value
                        .trim()
                        .parse::<u16>()
                        .map_err(|e| format!("invalid RPC_PORT value '{value}': {e}"))?;
                    discovered_port = Some(parsed);
                    break;
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read conduit-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let port =
        discovered_port.ok_or_else(|| "RPC_PORT line not emitted by conduit-rpc".to_string())?;
    if transport == "polling" && !wait_for_server(port, 15).await {
        return Err(format!("conduit-rpc failed health check on port {port}"));
    }

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(RpcServerHandle {
        child,
        port,
        stdout_drain: Some(stdout_drain),
    })
}

/// Submit over raw HTTP, then poll until terminal.
async fn submit_and_poll(port: u16, id: &str, operation: &str, objects: Value) -> Value {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/requests", port))
        .json(&json!({
            "requestId": id,
            "operation": operation,
            "version": "1.0",
            "params": { "objects": objects, "chunks": [] }
        }))
        .timeout(Duration::from_secs(10))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success(), "submit failed: {}", response.status());
    let mut body: Value = response.json().await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while body["status"] == "pending" {
        assert!(std::time::Instant::now() < deadline, "request never finished");
        tokio::time::sleep(Duration::from_millis(50)).await;
        body = client
            .get(format!("http://127.0.0.1:{}/requests/{}", port, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    }
    body
}

#[tokio::test]
async fn test_polling_backend_health_and_operations() {
    let server = start_rpc_server("polling").await.expect("server start");

    let listing: Value = reqwest::get(format!("http://127.0.0.1:{}/operations", server.port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listing = listing.as_array().expect("listing is an array");
    let names: Vec<&str> = listing
        .iter()
        .flat_map(|iface| iface["operationNames"].as_array().into_iter().flatten())
        .filter_map(Value::as_str)
        .collect();
    assert!(names.contains(&"Add"));
    assert!(names.contains(&"Echo"));
    assert!(names.contains(&"Divide"));

    server.stop().await;
}

#[tokio::test]
async fn test_polling_backend_raw_wire() {
    let server = start_rpc_server("polling").await.expect("server start");

    let body = submit_and_poll(server.port, "raw-add", "Add", json!([2, 3])).await;
    assert_eq!(body["status"], "resolved");
    assert_eq!(body["fulfillment"]["result"]["objects"], json!(5));

    let body = submit_and_poll(server.port, "raw-sleep", "Sleep", json!({"ms": 300})).await;
    assert_eq!(body["status"], "resolved");

    server.stop().await;
}

#[tokio::test]
async fn test_polling_backend_with_client() {
    let server = start_rpc_server("polling").await.expect("server start");
    let client = conduit_core::RpcClient::over_polling(
        &format!("http://127.0.0.1:{}", server.port),
        &conduit_core::Settings::default(),
    )
    .unwrap();

    let sum = client
        .call(
            "Add",
            "1.0",
            conduit_core::RpcValue::from_json(json!([40, 2])),
        )
        .await
        .unwrap();
    assert_eq!(sum.as_i64(), Some(42));

    let err = client
        .call("Missing", "1.0", conduit_core::RpcValue::Null)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), conduit_core::ErrorKind::IncompatibleInterface);

    server.stop().await;
}

#[tokio::test]
async fn test_channel_backend_with_client() {
    let server = start_rpc_server("channel").await.expect("server start");
    let settings = conduit_core::Settings {
        max_message_size: Some(65536),
        ..conduit_core::Settings::default()
    };
    let addr = format!("127.0.0.1:{}", server.port).parse().unwrap();
    let client = conduit_core::RpcClient::connect_channel(addr, &settings)
        .await
        .unwrap();

    let payload = bytes_of(256 * 1024);
    let echoed = client
        .call("Echo", "1.0", conduit_core::RpcValue::from(payload.clone()))
        .await
        .unwrap();
    assert_eq!(echoed.as_binary().map(|b| b.to_vec()), Some(payload));

    server.stop().await;
}

fn bytes_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
