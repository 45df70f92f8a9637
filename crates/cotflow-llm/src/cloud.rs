//! Cloud chat client for OpenAI-compatible APIs with separate reasoning fields.
//!
//! Reasoning models such as `deepseek-reasoner` stream their chain-of-thought
//! in `delta.reasoning_content` and the answer in `delta.content`, so no
//! heuristic splitting is needed on this path.

use std::time::Duration;

use async_trait::async_trait;
use cotflow_config::{BackendKind, CloudSettings};
use cotflow_core::{ChatError, ChatRequest, ChatToken, TokenStream};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::framing::{decode_stream, LineDecoder};
use crate::BackendClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const PLACEHOLDER_KEYS: [&str; 4] = ["your_api_key", "your-api-key", "你的API_Key", "你的API Key"];

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct StreamDelta {
    reasoning_content: Option<String>,
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamEvent {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ApiError>,
}

/// Checks a raw credential before it is ever sent anywhere.
pub fn validate_credential(raw: Option<&str>) -> Result<String, ChatError> {
    let key = raw.map(str::trim).filter(|k| !k.is_empty()).ok_or_else(|| {
        ChatError::Auth("no API key configured; set DEEPSEEK_API_KEY".into())
    })?;

    if PLACEHOLDER_KEYS.iter().any(|p| p.eq_ignore_ascii_case(key)) {
        return Err(ChatError::Auth("API key is a placeholder; use a real key".into()));
    }
    if !key.is_ascii() {
        return Err(ChatError::Auth("API key must contain only ASCII characters".into()));
    }
    Ok(key.to_string())
}

/// Parses `data:` lines of the completion event stream.
#[derive(Debug, Default)]
struct SseDecoder {
    done: bool,
}

impl LineDecoder for SseDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<ChatToken>, ChatError> {
        let Some(payload) = line.trim().strip_prefix("data:") else {
            return Ok(Vec::new());
        };
        let payload = payload.trim_start();

        if payload == "[DONE]" {
            self.done = true;
            return Ok(vec![ChatToken::Done]);
        }

        let event: StreamEvent = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(e) => {
                warn!("Skipping unparsable cloud event: {} - {}", e, payload);
                return Ok(Vec::new());
            }
        };

        if let Some(err) = event.error {
            let message = err.message.unwrap_or_else(|| "unknown error".into());
            return Err(ChatError::Network(format!("cloud stream error: {message}")));
        }

        let Some(delta) = event.choices.into_iter().next().and_then(|c| c.delta) else {
            return Ok(Vec::new());
        };

        let mut tokens = Vec::new();
        if let Some(text) = delta.reasoning_content.filter(|t| !t.is_empty()) {
            tokens.push(ChatToken::ReasoningDelta(text));
        }
        if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
            tokens.push(ChatToken::AnswerDelta(text));
        }
        Ok(tokens)
    }

    fn finish(&mut self) -> Result<Vec<ChatToken>, ChatError> {
        match self.done {
            true => Ok(Vec::new()),
            false => Err(ChatError::Network("cloud stream closed before [DONE]".into())),
        }
    }

    fn reached_end(&self) -> bool {
        self.done
    }
}

/// Client for the cloud reasoning API.
pub struct CloudClient {
    client: Client,
    api_base: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    idle_timeout: Duration,
}

impl CloudClient {
    /// Creates a client, rejecting a missing or malformed credential up front.
    pub fn new(settings: &CloudSettings, credential: Option<&str>) -> Result<Self, ChatError> {
        let api_key = validate_credential(credential)?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ChatError::Network(e.to_string()))?;

        info!(
            "CloudClient: base={}, model={}, api_key_len={}",
            settings.api_base,
            settings.model,
            api_key.len()
        );

        Ok(Self {
            client,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            api_key,
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            idle_timeout: Duration::from_secs(settings.timeout_secs),
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base)
    }
}

#[async_trait]
impl BackendClient for CloudClient {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    async fn send(&self, request: &ChatRequest) -> Result<TokenStream, ChatError> {
        let messages = request.messages();
        let model = match request.model.trim() {
            "" => self.model.as_str(),
            m => m,
        };

        let body = CompletionRequest {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage { role: m.role.as_str(), content: &m.content })
                .collect(),
            stream: true,
            max_tokens: self.max_tokens,
        };

        let send = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(self.idle_timeout, send)
            .await
            .map_err(|_| ChatError::Network("cloud request timed out".into()))?
            .map_err(|e| ChatError::Network(format!("cloud request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        info!("Cloud stream opened (model: {})", model);
        Ok(decode_stream(response.bytes_stream(), SseDecoder::default(), self.idle_timeout))
    }

    async fn list_models(&self) -> Result<Vec<String>, ChatError> {
        Ok(vec![self.model.clone()])
    }
}

/// Maps a non-success HTTP status to the error taxonomy.
fn status_error(status: StatusCode, body: &str) -> ChatError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ChatError::Auth(format!("API key rejected ({status}): {detail}"))
        }
        StatusCode::PAYMENT_REQUIRED => {
            ChatError::Network(format!("insufficient account balance ({status}): {detail}"))
        }
        _ => ChatError::Network(format!("cloud API error {status}: {detail}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_validation() {
        assert!(matches!(validate_credential(None), Err(ChatError::Auth(_))));
        assert!(matches!(validate_credential(Some("   ")), Err(ChatError::Auth(_))));
        assert!(matches!(validate_credential(Some("your_api_key")), Err(ChatError::Auth(_))));
        assert!(matches!(validate_credential(Some("sk-密钥")), Err(ChatError::Auth(_))));
        assert_eq!(validate_credential(Some(" sk-abc123 ")).unwrap(), "sk-abc123");
    }

    #[test]
    fn decoder_maps_reasoning_and_content() {
        let mut decoder = SseDecoder::default();
        let reasoning = decoder
            .decode_line(r#"data: {"choices":[{"delta":{"reasoning_content":"Think","content":null}}]}"#)
            .unwrap();
        assert_eq!(reasoning, vec![ChatToken::reasoning("Think")]);

        let answer = decoder
            .decode_line(r#"data: {"choices":[{"delta":{"reasoning_content":null,"content":"Hi"}}]}"#)
            .unwrap();
        assert_eq!(answer, vec![ChatToken::answer("Hi")]);

        assert_eq!(decoder.decode_line("data: [DONE]").unwrap(), vec![ChatToken::Done]);
        assert!(decoder.finish().unwrap().is_empty());
    }

    #[test]
    fn decoder_skips_noise() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.decode_line("").unwrap().is_empty());
        assert!(decoder.decode_line(": keep-alive").unwrap().is_empty());
        assert!(decoder.decode_line("data: {garbage").unwrap().is_empty());
        assert!(decoder.decode_line(r#"data: {"choices":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn decoder_surfaces_inline_errors() {
        let mut decoder = SseDecoder::default();
        let err = decoder
            .decode_line(r#"data: {"error":{"message":"overloaded"}}"#)
            .unwrap_err();
        assert_eq!(err, ChatError::Network("cloud stream error: overloaded".into()));
    }

    #[test]
    fn missing_done_is_network_error() {
        let mut decoder = SseDecoder::default();
        assert!(matches!(decoder.finish(), Err(ChatError::Network(_))));
    }

    #[test]
    fn status_mapping() {
        let body = r#"{"error":{"message":"Authentication Fails"}}"#;
        assert!(matches!(status_error(StatusCode::UNAUTHORIZED, body), ChatError::Auth(m) if m.contains("Authentication Fails")));
        assert!(matches!(status_error(StatusCode::PAYMENT_REQUIRED, ""), ChatError::Network(m) if m.contains("balance")));
        assert!(matches!(status_error(StatusCode::BAD_GATEWAY, "upstream"), ChatError::Network(m) if m.contains("upstream")));
    }
}
