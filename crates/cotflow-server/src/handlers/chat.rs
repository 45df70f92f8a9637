//! SSE-based turn streaming, cancellation, and the last turn's result.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use cotflow_config::BackendKind;
use cotflow_core::ChatError;
use cotflow_engine::{ConversationSnapshot, TurnInput, TurnUpdate};
use futures::stream::Stream;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use crate::dto::{CancelResponse, ChatTurnRequest, EndData};
use crate::error::AppError;
use crate::ServerState;

type EventSender = mpsc::Sender<Result<Event, Infallible>>;

/// Starts a turn and streams its updates.
///
/// Events: `started`, `step`, `answer`, `error`, `cancelled`, then `end`.
/// Refused with 409 while another turn is open.
pub async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(req): Json<ChatTurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let backend: BackendKind = req
        .backend
        .parse()
        .map_err(|e: cotflow_config::ConfigError| AppError::BadRequest(e.to_string()))?;
    if req.message.trim().is_empty() {
        return Err(AppError::BadRequest("message must not be empty".into()));
    }

    let permit = state.orchestrator.begin_turn()?;
    let conversation = state.checkout_conversation()?;

    info!(
        "Chat request ({}): {}...",
        backend,
        req.message.get(..50).unwrap_or(&req.message)
    );

    let input = TurnInput {
        backend,
        model: req.model,
        prompt: req.message,
        history: req.history,
        system_prompt: req.system_prompt,
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(100);
    let preview_chars = state.settings.segmenter.preview_chars;

    tokio::spawn(async move {
        let (update_tx, mut update_rx) = mpsc::channel::<TurnUpdate>(100);

        let turn = {
            let state = state.clone();
            let permit = &permit;
            async move {
                state
                    .orchestrator
                    .run_turn(permit, conversation, input, &update_tx)
                    .await
            }
        };
        // Owns the receiver so a disconnect drops it and the turn cancels.
        let events = &tx;
        let forward = async move {
            while let Some(update) = update_rx.recv().await {
                let Some(event) = update_event(&update, preview_chars) else { continue };
                if events.send(Ok(event)).await.is_err() {
                    debug!("SSE client disconnected");
                    break;
                }
            }
        };

        let (conversation, ()) = tokio::join!(turn, forward);

        let end = EndData {
            outcome: conversation.outcome().clone(),
            steps: conversation.graph().len(),
            answer_len: conversation.answer().chars().count(),
        };
        // Parked before the slot frees so the next turn checks this one out.
        state.park_conversation(conversation);
        drop(permit);
        send_event(&tx, "end", &end).await;
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

/// Maps a turn update to its SSE event. `Completed` is folded into `end`.
///
/// Step events carry a one-line preview for the node label.
fn update_event(update: &TurnUpdate, preview_chars: usize) -> Option<Event> {
    let name = match update {
        TurnUpdate::Started { .. } => "started",
        TurnUpdate::StepAdded { step, edge } => {
            let data = json!({ "step": step, "edge": edge, "preview": step.preview(preview_chars) });
            return Event::default().event("step").json_data(data).ok();
        }
        TurnUpdate::Answer { .. } => "answer",
        TurnUpdate::Failed { .. } => "error",
        TurnUpdate::Cancelled => "cancelled",
        TurnUpdate::Completed { .. } => return None,
    };
    Event::default().event(name).json_data(update).ok()
}

async fn send_event<T: Serialize>(tx: &EventSender, name: &str, data: &T) {
    if let Ok(event) = Event::default().event(name).json_data(data) {
        let _ = tx.send(Ok(event)).await;
    }
}

/// Cancels the active turn, if any.
pub async fn cancel(State(state): State<Arc<ServerState>>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.orchestrator.cancel(),
    })
}

/// The last finished turn's graph, answer, and outcome.
pub async fn conversation(State(state): State<Arc<ServerState>>) -> Result<Json<ConversationSnapshot>, AppError> {
    let slot = state.conversation_lock()?;
    match slot.as_ref() {
        Some(conversation) => Ok(Json(conversation.snapshot())),
        None => Err(ChatError::TurnInProgress.into()),
    }
}
