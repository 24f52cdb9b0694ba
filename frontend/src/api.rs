use gloo_net::http::Request;

use crate::errors::ClientError;
use crate::models::{Conversation, CreateConversationRequest, Message};

/// Base URL of the backend API server.
const API_BASE: &str = "http://localhost:8080";
const WS_BASE: &str = "ws://localhost:8080";

/// Identity sent to the gateway; there is no login.
pub const USER_ID: &str = "local";

/// Fetches the list of all conversations, most recently active first.
pub async fn fetch_conversations() -> Result<Vec<Conversation>, ClientError> {
    let resp = Request::get(&format!("{API_BASE}/api/conversations"))
        .send()
        .await
        .map_err(|e| ClientError::Network(e.to_string()))?;

    if !resp.ok() {
        return Err(ClientError::Network(format!("Server error: {}", resp.status())));
    }

    resp.json::<Vec<Conversation>>()
        .await
        .map_err(|e| ClientError::Network(format!("Parse error: {e}")))
}

/// Fetches all persisted messages for a given conversation.
pub async fn fetch_messages(conversation_id: &str) -> Result<Vec<Message>, ClientError> {
    let resp = Request::get(&format!(
        "{API_BASE}/api/conversations/{conversation_id}/messages"
    ))
    .send()
    .await
    .map_err(|e| ClientError::Network(e.to_string()))?;

    if !resp.ok() {
        return Err(ClientError::Network(format!("Server error: {}", resp.status())));
    }

    resp.json::<Vec<Message>>()
        .await
        .map_err(|e| ClientError::Network(format!("Parse error: {e}")))
}

pub async fn create_conversation(title: Option<String>) -> Result<Conversation, ClientError> {
    let body = CreateConversationRequest { title };

    let resp = Request::post(&format!("{API_BASE}/api/conversations"))
        .json(&body)
        .map_err(|e| ClientError::Network(format!("Serialize error: {e}")))?
        .send()
        .await
        .map_err(|e| ClientError::Network(e.to_string()))?;

    if !resp.ok() {
        return Err(ClientError::Network(format!("Server error: {}", resp.status())));
    }

    resp.json::<Conversation>()
        .await
        .map_err(|e| ClientError::Network(format!("Parse error: {e}")))
}

/// Returns the gateway websocket URL for `user_id`.
pub fn ws_url(user_id: &str) -> String {
    format!("{WS_BASE}/ws?user_id={user_id}")
}
