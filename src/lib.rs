//! Streaming synchronization server for multi-conversation AI chat.
//!
//! Generations are delivered as indexed fragments over a websocket. The
//! [`registry::StreamRegistry`] keeps at most one in-flight stream per
//! conversation, and the [`gateway`] fans events out to every connection that
//! cares about them.

pub mod agent;
pub mod config;
pub mod db;
pub mod errors;
pub mod gateway;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod service;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::routes::api_routes::{
    create_conversation_handler, list_conversations_handler, list_messages_handler,
};
use crate::routes::ws_routes::ws_handler;
use crate::service::chat_service::ChatService;

/// Builds the HTTP router around a wired [`ChatService`].
pub fn app(chat_service: ChatService) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route(
            "/api/conversations",
            get(list_conversations_handler).post(create_conversation_handler),
        )
        .route("/api/conversations/{id}/messages", get(list_messages_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(chat_service)
}
