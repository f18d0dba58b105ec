//! HTTP surface: the `/call` signaling WebSocket plus health and stats.
//!
//! Per connection:
//!
//! 1. Client connects to `/call`
//! 2. A writer task takes ownership of the socket sink and drains the
//!    connection's outbound queue
//! 3. Each text frame is parsed as a [`ClientMessage`] and dispatched in order
//! 4. On close the connection's call is torn down and its name released

use crate::dispatcher::{Dispatcher, SignalingStats};
use crate::protocol::ClientMessage;
use crate::registry::Connection;
use axum::{
    Json, Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use tower_http::trace::TraceLayer;

pub fn build_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/call", get(ws_handler))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

async fn health() -> &'static str {
    "OK"
}

async fn stats(State(dispatcher): State<Dispatcher>) -> Json<SignalingStats> {
    Json(dispatcher.stats())
}

async fn ws_handler(ws: WebSocketUpgrade, State(dispatcher): State<Dispatcher>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, dispatcher))
}

async fn handle_connection(socket: WebSocket, dispatcher: Dispatcher) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut outbound) = Connection::open();
    let conn_id = conn.id();

    tracing::debug!(conn = %conn_id, "Signaling WebSocket connected");

    // Sole writer for this socket.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(conn = %conn_id, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    tracing::debug!(conn = %conn_id, message = message.label(), "Incoming message");
                    dispatcher.dispatch(&conn, message).await;
                }
                Err(e) => {
                    tracing::warn!(conn = %conn_id, error = %e, "Ignoring invalid message");
                }
            },
            Message::Close(_) => break,
            // Binary frames carry nothing we understand; pings are answered by axum.
            _ => {}
        }
    }

    dispatcher.disconnect(conn_id).await;
    // Candidate listeners may still hold clones of the sender.
    writer.abort();

    tracing::debug!(conn = %conn_id, "Signaling WebSocket closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMediaEngine;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{connect_async, tungstenite};

    async fn serve() -> (String, Dispatcher) {
        let dispatcher = Dispatcher::new(Arc::new(FakeMediaEngine::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(dispatcher.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{addr}/call"), dispatcher)
    }

    async fn next_json<S>(ws: &mut S) -> serde_json::Value
    where
        S: futures_util::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .unwrap();
            if let tungstenite::Message::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn registers_over_the_socket_and_skips_garbage() {
        let (url, dispatcher) = serve().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        ws.send(tungstenite::Message::Text("not json".into()))
            .await
            .unwrap();
        ws.send(tungstenite::Message::Text(r#"{"id":"dance"}"#.into()))
            .await
            .unwrap();
        ws.send(tungstenite::Message::Text(
            r#"{"id":"register","name":"alice"}"#.into(),
        ))
        .await
        .unwrap();

        let reply = next_json(&mut ws).await;
        assert_eq!(reply["id"], "registerResponse");
        assert_eq!(reply["response"], "accepted");
        assert!(dispatcher.sessions().exists("alice"));
    }

    #[tokio::test]
    async fn closing_the_socket_releases_the_name() {
        let (url, dispatcher) = serve().await;
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();

        ws.send(tungstenite::Message::Text(
            r#"{"id":"register","name":"bob"}"#.into(),
        ))
        .await
        .unwrap();
        next_json(&mut ws).await;
        ws.close(None).await.unwrap();

        for _ in 0..50 {
            if !dispatcher.sessions().exists("bob") {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session survived the closed socket");
    }
}
