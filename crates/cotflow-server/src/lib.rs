//! HTTP front-end for cotflow.
//!
//! Streams each turn to the browser as server-sent events and keeps the last
//! turn's flow graph for `GET /conversation`.

pub mod dto;
pub mod error;
pub mod handlers;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::routing::{get, post};
use axum::Router;
use cotflow_config::Settings;
use cotflow_engine::{BackendConnector, ConversationState, Orchestrator, SegmenterConfig};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::AppError;

/// Shared server state accessible from all handlers.
pub struct ServerState {
    pub settings: Settings,
    pub orchestrator: Orchestrator,
    /// `None` while a turn has it checked out.
    conversation: Mutex<Option<ConversationState>>,
}

impl ServerState {
    pub fn new(settings: Settings, connector: Arc<dyn BackendConnector>) -> Self {
        let conversation = ConversationState::new(SegmenterConfig::from(&settings.segmenter));
        Self {
            settings,
            orchestrator: Orchestrator::new(connector),
            conversation: Mutex::new(Some(conversation)),
        }
    }

    /// Acquires the conversation lock, converting poison errors to AppError.
    pub fn conversation_lock(&self) -> Result<MutexGuard<'_, Option<ConversationState>>, AppError> {
        self.conversation.lock().map_err(|e| {
            tracing::error!("Conversation lock poisoned: {}", e);
            AppError::Internal("conversation lock error".into())
        })
    }

    /// Takes the conversation for a new turn, starting fresh if none is parked.
    pub fn checkout_conversation(&self) -> Result<ConversationState, AppError> {
        let parked = self.conversation_lock()?.take();
        Ok(parked.unwrap_or_else(|| ConversationState::new(SegmenterConfig::from(&self.settings.segmenter))))
    }

    pub fn park_conversation(&self, state: ConversationState) {
        if let Ok(mut slot) = self.conversation.lock() {
            *slot = Some(state);
        }
    }
}

/// Builds the application router.
pub fn router(state: Arc<ServerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|req: &Request<Body>| {
            tracing::info_span!(
                "request",
                method = %req.method(),
                uri = %req.uri(),
            )
        })
        .on_response(|res: &Response<Body>, latency: Duration, _span: &tracing::Span| {
            info!(
                latency = %format!("{} ms", latency.as_millis()),
                status = %res.status().as_u16(),
                "finished processing request"
            );
        });

    let logged_routes = Router::new()
        .route("/chat", post(handlers::chat::chat))
        .route("/chat/cancel", post(handlers::chat::cancel))
        .route("/conversation", get(handlers::chat::conversation))
        .route("/init", get(handlers::init::init))
        .route("/models/local", get(handlers::model::local_models))
        .layer(ServiceBuilder::new().layer(trace_layer));

    Router::new()
        .merge(logged_routes)
        .route("/health", get(handlers::health))
        .layer(cors)
        .with_state(state)
}
