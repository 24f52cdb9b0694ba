use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::AppError;
use crate::protocol::{ClientCommand, CommandKind};
use crate::service::chat_service::ChatService;

const DEFAULT_USER: &str = "local";

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub user_id: Option<String>,
}

/// GET `/ws`: upgrades to the streaming websocket.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(svc): State<ChatService>,
) -> impl IntoResponse {
    let user_id = params
        .user_id
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_USER.to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, svc, user_id))
}

/// Handles a single websocket connection.
///
/// Protocol (JSON text frames, tagged by `type`):
/// - client: `submit`, `subscribe`, `stop`
/// - server: `connected`, `start`, `fragment`, `complete`, `error`,
///   `subscription_confirmed`, `no_active_stream`, `pending`, `rejected`
///
/// Closing the socket never cancels a generation.
async fn handle_socket(socket: WebSocket, svc: ChatService, user_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut events) = svc.connect(&user_id).await;
    info!("WebSocket connection {conn_id} opened for user {user_id}");

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize event: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket receive error on connection {conn_id}: {e}");
                break;
            }
        };

        let text = match &msg {
            Message::Text(t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientCommand>(&text) {
            Ok(command) => svc.handle_command(&user_id, conn_id, command).await,
            Err(e) => {
                let error = AppError::InvalidCommand(e.to_string());
                svc.reject(conn_id, None, CommandKind::Unknown, &error).await;
            }
        }
    }

    svc.disconnect(conn_id);
    writer.abort();
    info!("WebSocket connection {conn_id} closed for user {user_id}");
}
