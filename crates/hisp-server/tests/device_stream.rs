use std::time::Duration;

use futures::{Stream, StreamExt};
use hisp_core::DeviceId;
use hisp_server::{start, ServerConfig, ServerHandle};
use hisp_settings::PresenceSettings;
use hisp_store::devices::DeviceRepo;
use hisp_store::Database;
use serde_json::Value;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server() -> (ServerHandle, String) {
    let db = Database::in_memory().unwrap();
    DeviceRepo::new(db.clone())
        .register(DeviceId::new(42), 7, "porch lamp")
        .unwrap();
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        presence: PresenceSettings {
            keepalive_interval_ms: 100,
            ..Default::default()
        },
    };
    let handle = start(config, db, None).await.unwrap();
    let base = format!("http://127.0.0.1:{}", handle.port);
    (handle, base)
}

/// Read from an event stream until the buffer contains `needle`.
async fn read_until<S, B>(stream: &mut S, buf: &mut String, needle: &str)
where
    S: Stream<Item = reqwest::Result<B>> + Unpin,
    B: AsRef<[u8]>,
{
    tokio::time::timeout(WAIT, async {
        while !buf.contains(needle) {
            let chunk = stream.next().await.expect("stream ended").unwrap();
            buf.push_str(&String::from_utf8_lossy(chunk.as_ref()));
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never saw {needle:?}, got {buf:?}"));
}

async fn device(base: &str) -> Value {
    reqwest::get(format!("{base}/devices/42"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for_device<F: Fn(&Value) -> bool>(base: &str, check: F) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let info = device(base).await;
            if check(&info) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap()
}

async fn action(base: &str) -> String {
    let body: Value = reqwest::Client::new()
        .post(format!("{base}/devices/42/action"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["outcome"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn stream_lifecycle_tracks_presence() {
    let (_handle, base) = start_server().await;

    let resp = reqwest::get(format!("{base}/devices/42/events")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "text/event-stream");
    assert_eq!(resp.headers()["cache-control"], "no-cache");

    let mut stream = Box::pin(resp.bytes_stream());
    let mut buf = String::new();
    read_until(&mut stream, &mut buf, "data: open\n\n").await;

    let info = wait_for_device(&base, |d| d["online"] == true).await;
    assert_eq!(info["connection"], "active");
    assert!(info["connectedSince"].is_string());

    assert_eq!(action(&base).await, "delivered");
    read_until(&mut stream, &mut buf, "data: action\n\n").await;

    drop(stream);
    let info = wait_for_device(&base, |d| d["online"] == false && d["connection"].is_null()).await;
    assert_eq!(info["name"], "porch lamp");
    assert!(info["connectedSince"].is_null());
    assert_eq!(action(&base).await, "offline");

    let activity: Value = reqwest::get(format!("{base}/devices/42/log"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(activity[0]["kind"], "disconnected");
    assert_eq!(activity[1]["kind"], "connected");
}

#[tokio::test]
async fn second_stream_supersedes_first() {
    let (handle, base) = start_server().await;

    let first = reqwest::get(format!("{base}/devices/42/events")).await.unwrap();
    let mut first = Box::pin(first.bytes_stream());
    let mut first_buf = String::new();
    read_until(&mut first, &mut first_buf, "data: open\n\n").await;

    let second = reqwest::get(format!("{base}/devices/42/events")).await.unwrap();
    let mut second = Box::pin(second.bytes_stream());
    let mut second_buf = String::new();
    read_until(&mut second, &mut second_buf, "data: open\n\n").await;

    // The superseded stream is ended by the server.
    tokio::time::timeout(WAIT, async {
        while let Some(chunk) = first.next().await {
            if chunk.is_err() {
                break;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(action(&base).await, "delivered");
    read_until(&mut second, &mut second_buf, "data: action\n\n").await;
    assert_eq!(handle.registry().active_count().await, 1);

    let info = device(&base).await;
    assert_eq!(info["online"], true);
}

#[tokio::test]
async fn shutdown_takes_devices_offline() {
    let (handle, base) = start_server().await;

    let resp = reqwest::get(format!("{base}/devices/42/events")).await.unwrap();
    let mut stream = Box::pin(resp.bytes_stream());
    let mut buf = String::new();
    read_until(&mut stream, &mut buf, "data: open\n\n").await;
    wait_for_device(&base, |d| d["online"] == true).await;

    let registry = std::sync::Arc::clone(handle.registry());
    handle.shutdown().await;
    assert_eq!(registry.active_count().await, 0);
}
