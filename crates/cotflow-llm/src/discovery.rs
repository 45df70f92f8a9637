//! Discovery of models installed on the local model server.

use std::time::Duration;

use cotflow_core::ChatError;
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

/// Response from the `/api/tags` endpoint.
#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelInfo>,
}

/// Information about a single installed model.
#[derive(Debug, Deserialize)]
struct ModelInfo {
    #[serde(default)]
    name: String,
}

/// Lists installed model identifiers in server order.
///
/// Any failure, including an empty model list, is
/// [`ChatError::BackendUnavailable`]; callers fall back to a manually entered
/// identifier.
pub async fn discover_models(client: &Client, host: &str, timeout: Duration) -> Result<Vec<String>, ChatError> {
    let url = format!("{}/api/tags", host.trim_end_matches('/'));

    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| ChatError::BackendUnavailable(format!("model discovery failed: {e}")))?;

    if !response.status().is_success() {
        return Err(ChatError::BackendUnavailable(format!(
            "model discovery failed: HTTP {}",
            response.status()
        )));
    }

    let tags: TagsResponse = response
        .json()
        .await
        .map_err(|e| ChatError::BackendUnavailable(format!("failed to parse model list: {e}")))?;

    let models: Vec<String> = tags
        .models
        .into_iter()
        .map(|m| m.name)
        .filter(|name| !name.trim().is_empty())
        .collect();

    if models.is_empty() {
        return Err(ChatError::BackendUnavailable("no local models installed".into()));
    }

    info!("Discovered {} local models", models.len());
    Ok(models)
}

/// Formats a model name for display (e.g., "deepseek-r1:8b" -> "Deepseek-r1:8b (Local)").
pub fn display_name(model_name: &str) -> String {
    let last_segment = model_name.rsplit('/').next().unwrap_or(model_name);
    let (base, tag) = last_segment.split_once(':').unwrap_or((last_segment, ""));

    let mut chars = base.chars();
    let display_base: String = match chars.next() {
        Some(c) => c.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };

    let tag_suffix = if tag.is_empty() { String::new() } else { format!(":{tag}") };
    format!("{display_base}{tag_suffix} (Local)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_formats_namespaced_models() {
        assert_eq!(display_name("deepseek-r1:8b"), "Deepseek-r1:8b (Local)");
        assert_eq!(display_name("library/qwen3"), "Qwen3 (Local)");
    }
}
