//! Data transfer objects for HTTP message serialization.

use cotflow_config::BackendKind;
use cotflow_core::Message;
use cotflow_engine::TurnOutcome;
use serde::{Deserialize, Serialize};

// === Chat ===

/// Request body for `POST /chat`.
#[derive(Debug, Deserialize)]
pub struct ChatTurnRequest {
    /// `cloud` or `local` (aliases `deepseek`, `ollama`).
    pub backend: String,
    pub message: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Final SSE event of every turn.
#[derive(Debug, Serialize)]
pub struct EndData {
    pub outcome: TurnOutcome,
    pub steps: usize,
    pub answer_len: usize,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

// === Models ===

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub kind: BackendKind,
    pub name: &'static str,
}

/// Response from `GET /init`.
#[derive(Debug, Serialize)]
pub struct InitResponse {
    pub backends: Vec<BackendInfo>,
    pub cloud_model: String,
    pub local_models: Vec<ModelInfo>,
}
