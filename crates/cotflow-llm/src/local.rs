//! Local model client over Ollama's native `/api/chat` endpoint.
//!
//! Reasoning-capable models return chain-of-thought in `message.thinking` when
//! asked with `think: true`. Older servers and non-reasoning models reject that
//! flag with a 400, in which case the request is retried without it and any
//! inline `<think>` block is split out of `message.content` instead.

use std::time::Duration;

use async_trait::async_trait;
use cotflow_config::{BackendKind, LocalSettings};
use cotflow_core::{ChatError, ChatRequest, ChatToken, Message, TokenStream};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::discovery::discover_models;
use crate::framing::{decode_stream, LineDecoder};
use crate::think::ThinkTagSplitter;
use crate::BackendClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct LocalChatRequest<'a> {
    model: &'a str,
    messages: &'a [LocalMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<bool>,
}

#[derive(Debug, Serialize)]
struct LocalMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct LocalChatChunk {
    message: Option<LocalResponseMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocalResponseMessage {
    #[serde(default)]
    content: String,
    thinking: Option<String>,
    /// Cloud-style field some OpenAI-compatible local servers emit instead.
    reasoning_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LocalErrorBody {
    error: Option<String>,
}

/// Removes control characters the server rejects; keeps newlines and tabs.
fn sanitize(content: &str) -> String {
    let cleaned: String = content
        .trim()
        .chars()
        .filter(|c| matches!(c, '\n' | '\r' | '\t') || !c.is_control())
        .collect();
    match cleaned.is_empty() {
        true => " ".to_string(),
        false => cleaned,
    }
}

/// Converts and truncates the message list to the most recent `max_context`.
fn build_messages(messages: &[Message], max_context: usize) -> Vec<LocalMessage> {
    let skip = messages.len().saturating_sub(max_context);
    messages
        .iter()
        .skip(skip)
        .map(|m| LocalMessage {
            role: m.role.as_str(),
            content: sanitize(&m.content),
        })
        .collect()
}

/// Parses newline-delimited JSON chunks.
#[derive(Debug, Default)]
struct NdjsonDecoder {
    splitter: ThinkTagSplitter,
    done: bool,
}

impl LineDecoder for NdjsonDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<ChatToken>, ChatError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }

        let chunk: LocalChatChunk = match serde_json::from_str(line) {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping unparsable local chunk: {} - {}", e, line);
                return Ok(Vec::new());
            }
        };

        if let Some(error) = chunk.error {
            return Err(ChatError::Network(format!("local model error: {error}")));
        }

        let mut tokens = Vec::new();
        if let Some(message) = chunk.message {
            let reasoning = message
                .thinking
                .filter(|t| !t.is_empty())
                .or(message.reasoning_content.filter(|t| !t.is_empty()));
            if let Some(text) = reasoning {
                tokens.push(ChatToken::ReasoningDelta(text));
            }
            if !message.content.is_empty() {
                tokens.extend(self.splitter.push(&message.content));
            }
        }

        if chunk.done && !self.done {
            self.done = true;
            tokens.extend(self.splitter.finish());
            tokens.push(ChatToken::Done);
        }
        Ok(tokens)
    }

    fn finish(&mut self) -> Result<Vec<ChatToken>, ChatError> {
        match self.done {
            true => Ok(Vec::new()),
            false => Err(ChatError::Network("local stream closed before completion".into())),
        }
    }

    fn reached_end(&self) -> bool {
        self.done
    }
}

/// Client for a model server on this machine.
pub struct LocalClient {
    client: Client,
    host: String,
    think: bool,
    max_context: usize,
    idle_timeout: Duration,
    discovery_timeout: Duration,
}

impl LocalClient {
    /// Creates a client for the configured host. No request is made yet.
    pub fn new(settings: &LocalSettings) -> Result<Self, ChatError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ChatError::Network(e.to_string()))?;

        Ok(Self {
            client,
            host: settings.host.trim_end_matches('/').to_string(),
            think: settings.think,
            max_context: settings.max_context,
            idle_timeout: Duration::from_secs(settings.timeout_secs),
            discovery_timeout: Duration::from_secs(settings.discovery_timeout_secs),
        })
    }

    async fn post_chat(&self, model: &str, messages: &[LocalMessage], think: bool) -> Result<Response, ChatError> {
        let body = LocalChatRequest {
            model,
            messages,
            stream: true,
            think: think.then_some(true),
        };

        let send = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&body)
            .send();

        tokio::time::timeout(self.idle_timeout, send)
            .await
            .map_err(|_| ChatError::Network("local request timed out".into()))?
            .map_err(|e| self.request_error(e))
    }

    fn request_error(&self, e: reqwest::Error) -> ChatError {
        match e.is_connect() {
            true => ChatError::BackendUnavailable(format!(
                "cannot reach local model service at {}; is `ollama serve` running?",
                self.host
            )),
            false => ChatError::Network(format!("local request failed: {e}")),
        }
    }
}

#[async_trait]
impl BackendClient for LocalClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn send(&self, request: &ChatRequest) -> Result<TokenStream, ChatError> {
        let model = request.model.trim();
        if model.is_empty() {
            return Err(ChatError::BackendUnavailable("no local model selected".into()));
        }

        let messages = build_messages(&request.messages(), self.max_context);
        let mut response = self.post_chat(model, &messages, self.think).await?;

        if self.think && response.status() == StatusCode::BAD_REQUEST {
            warn!("Model {} rejected think mode, retrying without it", model);
            response = self.post_chat(model, &messages, false).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<LocalErrorBody>(&body)
                .ok()
                .and_then(|b| b.error)
                .unwrap_or_else(|| body.chars().take(200).collect());
            return Err(ChatError::Network(format!("local request failed ({status}): {detail}")));
        }

        info!("Local stream opened (model: {}, {} messages)", model, messages.len());
        Ok(decode_stream(response.bytes_stream(), NdjsonDecoder::default(), self.idle_timeout))
    }

    async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        discover_models(&self.client, &self.host, self.discovery_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_control_chars() {
        assert_eq!(sanitize("a\u{0007}b\tc\nd"), "ab\tc\nd");
        assert_eq!(sanitize("   "), " ");
    }

    #[test]
    fn keeps_most_recent_messages() {
        let history: Vec<Message> = (0..20).map(|i| Message::user(format!("m{i}"))).collect();
        let built = build_messages(&history, 12);
        assert_eq!(built.len(), 12);
        assert_eq!(built[0].content, "m8");
        assert_eq!(built[11].content, "m19");
    }

    #[test]
    fn think_flag_omitted_when_off() {
        let body = LocalChatRequest { model: "m", messages: &[], stream: true, think: None };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("think").is_none());
        assert_eq!(json["stream"], true);
    }

    #[test]
    fn decoder_falls_back_to_reasoning_content() {
        let mut decoder = NdjsonDecoder::default();
        let tokens = decoder
            .decode_line(r#"{"message":{"content":"","reasoning_content":"Let me see"},"done":false}"#)
            .unwrap();
        assert_eq!(tokens, vec![ChatToken::reasoning("Let me see")]);

        let tokens = decoder
            .decode_line(r#"{"message":{"content":"","thinking":"first","reasoning_content":"second"},"done":false}"#)
            .unwrap();
        assert_eq!(tokens, vec![ChatToken::reasoning("first")]);
    }

    #[test]
    fn decoder_uses_thinking_field() {
        let mut decoder = NdjsonDecoder::default();
        let tokens = decoder
            .decode_line(r#"{"message":{"role":"assistant","content":"","thinking":"Let me see"},"done":false}"#)
            .unwrap();
        assert_eq!(tokens, vec![ChatToken::reasoning("Let me see")]);

        let tokens = decoder
            .decode_line(r#"{"message":{"role":"assistant","content":"42"},"done":false}"#)
            .unwrap();
        assert_eq!(tokens, vec![ChatToken::answer("42")]);

        let tokens = decoder.decode_line(r#"{"done":true,"eval_count":12}"#).unwrap();
        assert_eq!(tokens, vec![ChatToken::Done]);
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn decoder_splits_inline_think_tags() {
        let mut decoder = NdjsonDecoder::default();
        let mut tokens = Vec::new();
        for line in [
            r#"{"message":{"content":"<think>"},"done":false}"#,
            r#"{"message":{"content":"check units"},"done":false}"#,
            r#"{"message":{"content":"</think>\n\nIt is 5 m."},"done":false}"#,
            r#"{"message":{"content":""},"done":true}"#,
        ] {
            tokens.extend(decoder.decode_line(line).unwrap());
        }
        assert_eq!(
            tokens,
            vec![
                ChatToken::reasoning("check units"),
                ChatToken::answer("It is 5 m."),
                ChatToken::Done,
            ]
        );
    }

    #[test]
    fn decoder_surfaces_server_error() {
        let mut decoder = NdjsonDecoder::default();
        let err = decoder.decode_line(r#"{"error":"model 'x' not found"}"#).unwrap_err();
        assert!(matches!(err, ChatError::Network(m) if m.contains("not found")));
    }

    #[test]
    fn malformed_line_is_skipped() {
        let mut decoder = NdjsonDecoder::default();
        assert!(decoder.decode_line(r#"{"message":{"content":"#).unwrap().is_empty());
        let tokens = decoder.decode_line(r#"{"message":{"content":"ok"},"done":true}"#).unwrap();
        assert_eq!(tokens, vec![ChatToken::answer("ok"), ChatToken::Done]);
    }

    #[test]
    fn early_close_is_network_error() {
        let mut decoder = NdjsonDecoder::default();
        decoder.decode_line(r#"{"message":{"content":"partial"},"done":false}"#).unwrap();
        assert!(matches!(decoder.finish(), Err(ChatError::Network(_))));
    }
}
