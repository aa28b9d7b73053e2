//! Drive one hub WebSocket: a writer task draining the connection's queue
//! and a sequential reader feeding the session state machine.

use super::session::{Action, Session};
use super::BroadcastHub;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// How long the writer may take to flush after the reader finishes
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve a hub connection until the client closes it or the hub shuts down
pub async fn serve_connection<S>(hub: Arc<BroadcastHub>, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (id, mut outbound) = hub.connect();

    let mut writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if sink.send(Message::text(msg.to_json())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new(id);
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            // Writer gone: queue closed by hub shutdown or the socket failed
            _ = &mut writer => break,
        };

        let actions = match frame {
            Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()),
            Some(Ok(Message::Binary(_))) => session.handle_binary(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                tracing::debug!(connection = id, error = %e, "Hub socket error");
                break;
            }
        };

        hub.set_topics(id, session.topics());
        if !perform(&hub, id, actions).await {
            break;
        }
    }

    session.close();
    hub.disconnect(id);
    if !writer.is_finished() {
        let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
    }
}

/// Carry out a session's actions in order; false once the connection is gone
async fn perform(hub: &BroadcastHub, id: u64, actions: Vec<Action>) -> bool {
    for action in actions {
        let msg = match action {
            Action::Send(msg) => Some(msg),
            Action::Snapshot(topic) => hub.snapshot(topic).await,
            Action::ServicesStatus => Some(hub.services_status().await),
        };
        if let Some(msg) = msg {
            if !hub.send_to(id, msg).await {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::CountingMetrics;
    use crate::hub::Topic;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn connected_client() -> (
        Arc<BroadcastHub>,
        WebSocketStream<DuplexStream>,
        tokio::task::JoinHandle<()>,
    ) {
        let hub = Arc::new(BroadcastHub::new(
            Arc::new(CountingMetrics::default()),
            Duration::from_secs(30),
        ));
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
        let task = tokio::spawn(serve_connection(hub.clone(), server));
        (hub, client, task)
    }

    async fn next_json(client: &mut WebSocketStream<DuplexStream>) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_welcome_then_ping_pong() {
        let (_hub, mut client, _task) = connected_client().await;
        assert_eq!(next_json(&mut client).await["type"], "welcome");

        client.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
        assert_eq!(next_json(&mut client).await["type"], "pong");
    }

    #[tokio::test]
    async fn test_subscribe_gets_immediate_snapshot() {
        let (hub, mut client, _task) = connected_client().await;
        next_json(&mut client).await;

        client
            .send(Message::text(r#"{"type":"subscribe","channels":["system","bogus"]}"#))
            .await
            .unwrap();
        let snapshot = next_json(&mut client).await;
        assert_eq!(snapshot["type"], "system-stats");
        assert_eq!(snapshot["data"]["pid"], 42);

        let update = next_json(&mut client).await;
        assert_eq!(update["type"], "subscription-update");
        assert_eq!(update["subscriptions"], serde_json::json!(["system"]));
        assert_eq!(hub.subscriber_count(Topic::System), 1);
    }

    #[tokio::test]
    async fn test_errors_keep_connection_open() {
        let (_hub, mut client, _task) = connected_client().await;
        next_json(&mut client).await;

        client.send(Message::text("hello")).await.unwrap();
        let err = next_json(&mut client).await;
        assert_eq!(err["type"], "error");
        assert!(err["message"].as_str().unwrap().contains("Invalid message format"));

        client.send(Message::text(r#"{"type":"launch"}"#)).await.unwrap();
        let err = next_json(&mut client).await;
        assert_eq!(err["message"], "Unknown message type: launch");

        client.send(Message::binary(vec![0u8, 1])).await.unwrap();
        assert_eq!(next_json(&mut client).await["type"], "error");

        client.send(Message::text(r#"{"type":"ping"}"#)).await.unwrap();
        assert_eq!(next_json(&mut client).await["type"], "pong");
    }

    #[tokio::test]
    async fn test_get_services_status() {
        let (_hub, mut client, _task) = connected_client().await;
        next_json(&mut client).await;

        client
            .send(Message::text(r#"{"type":"get-services-status"}"#))
            .await
            .unwrap();
        let status = next_json(&mut client).await;
        assert_eq!(status["type"], "services-status");
        assert!(status["data"].is_object());
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_and_stops_ticker() {
        let (hub, mut client, task) = connected_client().await;
        next_json(&mut client).await;
        client
            .send(Message::text(r#"{"type":"subscribe","channels":["database"]}"#))
            .await
            .unwrap();
        next_json(&mut client).await;
        next_json(&mut client).await;
        assert!(hub.is_ticking());

        client.close(None).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.subscriber_count(Topic::Database), 0);
        assert!(!hub.is_ticking());
        assert_eq!(hub.tick().await, 0);
    }

    #[tokio::test]
    async fn test_hub_shutdown_ends_connection() {
        let (hub, mut client, task) = connected_client().await;
        next_json(&mut client).await;
        hub.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
    }
}
