//! Init endpoint returning backends and models.

use std::sync::Arc;

use axum::{extract::State, Json};
use cotflow_config::BackendKind;
use tracing::{info, warn};

use crate::dto::{BackendInfo, InitResponse};
use crate::handlers::model::discover_local;
use crate::ServerState;

/// Returns initialization data for the frontend.
///
/// Discovery failure is not fatal: the model list is empty and the user
/// types a model id instead.
pub async fn init(State(state): State<Arc<ServerState>>) -> Json<InitResponse> {
    let local_models = match discover_local(&state).await {
        Ok(models) => {
            info!("Found {} local models", models.len());
            models
        }
        Err(e) => {
            warn!("Local model discovery failed (is Ollama running?): {}", e);
            Vec::new()
        }
    };

    Json(InitResponse {
        backends: vec![
            BackendInfo { kind: BackendKind::Cloud, name: "DeepSeek (cloud)" },
            BackendInfo { kind: BackendKind::Local, name: "Ollama (local)" },
        ],
        cloud_model: state.settings.cloud.model.clone(),
        local_models,
    })
}
