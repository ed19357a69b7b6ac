// Client-facing WebSocket server (axum)
//
//   GET /ws?conversationId=<id>   upgrade to a relay socket for that conversation
//   GET /health                   upstream status and client counts

use std::future::Future;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::clients::ClientHandle;
use crate::error::RelayError;
use crate::relay::{Relay, RelayStatus};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectQuery {
    conversation_id: Option<String>,
}

pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(relay)
}

async fn health(State(relay): State<Arc<Relay>>) -> Json<RelayStatus> {
    Json(relay.status())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(relay): State<Arc<Relay>>,
) -> Response {
    let conversation_id = query
        .conversation_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty());

    match conversation_id {
        Some(conversation_id) => ws
            .on_upgrade(move |socket| handle_socket(socket, relay, conversation_id))
            .into_response(),
        None => (StatusCode::BAD_REQUEST, "conversationId is required").into_response(),
    }
}

async fn handle_socket(socket: WebSocket, relay: Arc<Relay>, conversation_id: String) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let client = ClientHandle::new(tx);
    let client_id = client.id;

    // Writer: exits when the socket fails, which marks the handle closed
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    relay.connect_client(client, &conversation_id);

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => relay.handle_client_text(client_id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                log::debug!("Server: Ignoring binary frame from {}", client_id);
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("Server: Socket error for {}: {}", client_id, e);
                break;
            }
        }
    }

    relay.disconnect_client(client_id);
    writer.abort();
}

/// Serve on an already bound listener until `shutdown` resolves
///
/// The relay is shut down (upstream closed, transcoder killed) as soon as the
/// signal fires, before open sockets drain.
pub async fn serve_on<F>(listener: TcpListener, relay: Arc<Relay>, shutdown: F) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    log::info!("Server: Listening on {}", listener.local_addr()?);

    let signal_relay = relay.clone();
    let app = router(relay.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("Server: Shutdown requested");
            signal_relay.shutdown();
        })
        .await?;

    relay.shutdown();
    Ok(())
}

pub async fn serve<F>(relay: Arc<Relay>, bind_address: &str, shutdown: F) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind_address).await?;
    serve_on(listener, relay, shutdown).await
}
