//! Local model discovery endpoint.

use std::sync::Arc;

use axum::{extract::State, Json};
use cotflow_config::BackendKind;
use cotflow_core::ChatError;
use cotflow_llm::display_name;

use crate::dto::ModelInfo;
use crate::error::AppError;
use crate::ServerState;

/// Asks the local server which models it has installed.
pub async fn discover_local(state: &ServerState) -> Result<Vec<ModelInfo>, ChatError> {
    let client = state.orchestrator.connector().connect(BackendKind::Local)?;
    let models = client.list_models().await?;
    Ok(models
        .into_iter()
        .map(|id| ModelInfo { name: display_name(&id), id })
        .collect())
}

/// Lists local models; 503 when the local server is down or has none.
pub async fn local_models(State(state): State<Arc<ServerState>>) -> Result<Json<Vec<ModelInfo>>, AppError> {
    Ok(Json(discover_local(&state).await?))
}
