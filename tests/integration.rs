//! Integration tests for multigate
//!
//! These tests spin up real TCP listeners and HTTP/WebSocket backends to
//! verify end-to-end request flow through the gateway.

use futures_util::{SinkExt, StreamExt};
use multigate::config::{GatewayConfig, RewriteRule, ServiceConfig};
use multigate::Gateway;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Spawn a minimal HTTP backend answering every request with
/// `<name> <request-target>`.
async fn spawn_backend(name: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let head = String::from_utf8_lossy(&buf[..n]);
                let target = head
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("?");
                let body = format!("{} {}", name, target);
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

/// Spawn a WebSocket backend that echoes every text frame prefixed with `echo:`
async fn spawn_ws_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Text(text) => {
                            let reply = format!("echo:{}", text.as_str());
                            if ws.send(Message::text(reply)).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    addr
}

fn service(prefix: &str, port: u16) -> ServiceConfig {
    ServiceConfig {
        path_prefix: prefix.to_string(),
        upstream_host: "127.0.0.1".to_string(),
        upstream_port: port,
        health_path: "/health".to_string(),
        command: None,
        args: vec![],
        env: BTreeMap::new(),
        forward_env: vec![],
        working_dir: None,
        autostart: false,
        rewrite: RewriteRule::StripPrefix,
    }
}

fn build_config(services: Vec<(&str, ServiceConfig)>) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listen.host = "127.0.0.1".to_string();
    config.listen.port = 0;
    config.health.timeout_ms = 500;
    config.proxy.timeout_secs = 5;
    for (name, svc) in services {
        config.services.insert(name.to_string(), svc);
    }
    config
}

async fn start(config: GatewayConfig) -> (Gateway, SocketAddr) {
    let gateway = Gateway::new(config).unwrap();
    let addr = gateway.start().await.unwrap();
    (gateway, addr)
}

async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for a hub message")
        .expect("socket closed")
        .expect("socket error");
    match msg {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_proxy_strips_prefix() {
    let brands = spawn_backend("brands").await;
    let (gateway, addr) = start(build_config(vec![("brands", service("/brands", brands.port()))])).await;

    let resp = reqwest::get(format!("http://{}/brands/items?page=2", addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "brands /items?page=2");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_three_services_with_one_down() {
    let brands = spawn_backend("brands").await;
    let app3 = spawn_backend("app3").await;
    let wallet_port = closed_port().await;

    let (gateway, addr) = start(build_config(vec![
        ("brands", service("/brands", brands.port())),
        ("wallet", service("/wallet", wallet_port)),
        ("app3", service("/app3", app3.port())),
    ]))
    .await;

    let client = reqwest::Client::new();
    let (wallet, brands) = tokio::join!(
        client.get(format!("http://{}/wallet/health", addr)).send(),
        client.get(format!("http://{}/brands", addr)).send(),
    );

    let wallet = wallet.unwrap();
    assert_eq!(wallet.status(), 502);
    assert_eq!(wallet.headers()["x-proxied-by"], multigate_proxied_by());
    let body: serde_json::Value = wallet.json().await.unwrap();
    assert_eq!(body["service"], "wallet");
    assert!(!body["detail"].as_str().unwrap().is_empty());

    let brands = brands.unwrap();
    assert_eq!(brands.status(), 200);
    assert_eq!(brands.text().await.unwrap(), "brands /");

    // Composite health: two of three reachable
    let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["services"]["brands"], "running");
    assert_eq!(health["services"]["wallet"], "unreachable");
    assert_eq!(health["services"]["app3"], "running");

    gateway.shutdown().await;
}

fn multigate_proxied_by() -> String {
    format!("multigate/{}", env!("CARGO_PKG_VERSION"))
}

#[tokio::test]
async fn test_longest_prefix_wins() {
    let root = spawn_backend("root").await;
    let wallet = spawn_backend("wallet").await;

    let mut wallet_svc = service("/wallet", wallet.port());
    wallet_svc.rewrite = RewriteRule::Preserve;
    let (gateway, addr) = start(build_config(vec![
        ("root", service("/", root.port())),
        ("wallet", wallet_svc),
    ]))
    .await;

    let body = reqwest::get(format!("http://{}/wallet/assets/app.js", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "wallet /wallet/assets/app.js");

    // Not a whole segment: falls through to the catch-all
    let body = reqwest::get(format!("http://{}/walletfoo", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "root /walletfoo");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_path_is_404() {
    let brands = spawn_backend("brands").await;
    let (gateway, addr) = start(build_config(vec![("brands", service("/brands", brands.port()))])).await;

    let resp = reqwest::get(format!("http://{}/nowhere", addr)).await.unwrap();
    assert_eq!(resp.status(), 404);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_websocket_proxied_to_service() {
    let echo = spawn_ws_echo_backend().await;
    let (gateway, addr) = start(build_config(vec![("chat", service("/chat", echo.port()))])).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/chat/socket", addr))
        .await
        .unwrap();
    ws.send(Message::text("hello")).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply, Message::text("echo:hello"));

    ws.close(None).await.unwrap();
    gateway.shutdown().await;
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_hub_welcome_ping_subscribe() {
    let (gateway, addr) = start(build_config(vec![])).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(
        welcome["availableSubscriptions"],
        serde_json::json!(["system", "database", "services", "notifications"])
    );
    assert!(gateway.hub().is_ticking());

    ws.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "pong");

    ws.send(Message::text(r#"{"type":"subscribe","channels":["system","bogus"]}"#))
        .await
        .unwrap();
    let snapshot = next_json(&mut ws).await;
    assert_eq!(snapshot["type"], "system-stats");
    assert!(snapshot["data"]["pid"].as_u64().unwrap() > 0);
    let update = next_json(&mut ws).await;
    assert_eq!(update["type"], "subscription-update");
    assert_eq!(update["subscriptions"], serde_json::json!(["system"]));

    ws.send(Message::text("not json")).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "error");

    ws.send(Message::text(r#"{"type":"get-services-status"}"#))
        .await
        .unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "services-status");

    ws.close(None).await.unwrap();
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_hub_ticker_stops_after_last_disconnect() {
    let (gateway, addr) = start(build_config(vec![])).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();
    next_json(&mut ws).await;
    ws.send(Message::text(r#"{"type":"subscribe","channels":["database"]}"#))
        .await
        .unwrap();
    let status = next_json(&mut ws).await;
    assert_eq!(status["type"], "database-status");
    assert_eq!(status["data"]["configured"], false);
    next_json(&mut ws).await;

    ws.close(None).await.unwrap();
    drop(ws);

    let hub = gateway.hub().clone();
    tokio::time::timeout(Duration::from_secs(5), async {
        while hub.connection_count() > 0 || hub.is_ticking() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("hub kept ticking with no connections");

    gateway.shutdown().await;
}

// ---------------------------------------------------------------------------
// Front-end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_port_fallback_when_preferred_taken() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = occupied.local_addr().unwrap().port();

    let mut config = build_config(vec![]);
    config.listen.port = taken;
    config.listen.max_port_retries = 5;

    let (gateway, addr) = start(config).await;
    assert!(addr.port() > taken);

    let status: serde_json::Value = reqwest::get(format!("http://{}/status", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["port"], addr.port());
    assert_eq!(status["state"], "running");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_ports_exhausted_fails_start() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = occupied.local_addr().unwrap().port();

    let mut config = build_config(vec![]);
    config.listen.port = taken;
    config.listen.max_port_retries = 0;

    let gateway = Gateway::new(config).unwrap();
    let err = gateway.start().await.unwrap_err();
    assert!(matches!(err, multigate::GatewayError::PortsExhausted { .. }));
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_status_api_from_hcl_config() {
    let brands = spawn_backend("brands").await;
    let hcl = format!(
        r#"
listen {{
  host = "127.0.0.1"
  port = 0
}}

services "brands" {{
  path_prefix   = "/brands"
  upstream_port = {}
  autostart     = false
  rewrite       = "replace:/v2"
}}
"#,
        brands.port()
    );
    let config = GatewayConfig::from_hcl(&hcl).unwrap();
    let (gateway, addr) = start(config).await;

    let body = reqwest::get(format!("http://{}/brands/items", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "brands /v2/items");

    let services: serde_json::Value = reqwest::get(format!("http://{}/status/services", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(services[0]["name"], "brands");
    assert_eq!(services[0]["rewrite"], "replace:/v2");
    assert_eq!(services[0]["managed"], false);

    let routes: serde_json::Value = reqwest::get(format!("http://{}/status/routes", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(routes[0]["pathPrefix"], "/brands");

    let status: serde_json::Value = reqwest::get(format!("http://{}/status", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["requests"]["byService"]["brands"], 1);

    gateway.shutdown().await;
}
