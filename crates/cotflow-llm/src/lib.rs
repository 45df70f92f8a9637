//! Streaming chat clients for the cloud and local backends.
//!
//! Both clients implement [`BackendClient`] and translate a [`ChatRequest`]
//! into a lazy stream of [`ChatToken`](cotflow_core::ChatToken)s:
//!
//! - [`CloudClient`] — OpenAI-compatible API that streams `reasoning_content`
//!   and `content` separately
//! - [`LocalClient`] — Ollama native API; reasoning comes from the `thinking`
//!   field or from inline `<think>` tags ([`ThinkTagSplitter`])
//!
//! [`connect`] picks the implementation for a [`BackendKind`].
//!
//! # Streaming
//!
//! ```rust,ignore
//! use cotflow_config::{BackendKind, EnvCredentials, Settings};
//! use cotflow_core::{ChatRequest, ChatToken};
//! use futures::StreamExt;
//!
//! let settings = Settings::load()?;
//! let client = cotflow_llm::connect(BackendKind::Cloud, &settings, &EnvCredentials)?;
//! let mut tokens = client.send(&ChatRequest::new("deepseek-reasoner", "2+2?")).await?;
//!
//! while let Some(token) = tokens.next().await {
//!     match token? {
//!         ChatToken::ReasoningDelta(text) => eprint!("{}", text),
//!         ChatToken::AnswerDelta(text) => print!("{}", text),
//!         ChatToken::Done => break,
//!     }
//! }
//! ```

use async_trait::async_trait;
use cotflow_config::{BackendKind, CredentialProvider, Settings};
use cotflow_core::{ChatError, ChatRequest, TokenStream};
use tracing::debug;

mod cloud;
mod discovery;
mod framing;
mod local;
mod think;

pub use cloud::{validate_credential, CloudClient};
pub use discovery::display_name;
pub use local::LocalClient;
pub use think::ThinkTagSplitter;

/// Uniform contract over both backends.
#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Which backend this client talks to.
    fn kind(&self) -> BackendKind;

    /// Starts a streamed completion. The stream is single-pass; call again
    /// to restart.
    async fn send(&self, request: &ChatRequest) -> Result<TokenStream, ChatError>;

    /// Model identifiers the backend can serve.
    async fn list_models(&self) -> Result<Vec<String>, ChatError>;
}

/// Creates the client for `kind`.
///
/// The cloud credential is checked here, so a missing key fails before any
/// network call is attempted.
pub fn connect(
    kind: BackendKind,
    settings: &Settings,
    credentials: &dyn CredentialProvider,
) -> Result<Box<dyn BackendClient>, ChatError> {
    debug!("Connecting {} backend", kind);
    match kind {
        BackendKind::Cloud => {
            let key = credentials.get_credential();
            Ok(Box::new(CloudClient::new(&settings.cloud, key.as_deref())?))
        }
        BackendKind::Local => Ok(Box::new(LocalClient::new(&settings.local)?)),
    }
}

#[cfg(test)]
mod tests {
    use cotflow_config::StaticCredential;

    use super::*;

    #[test]
    fn cloud_without_credential_is_auth_error() {
        let result = connect(BackendKind::Cloud, &Settings::default(), &StaticCredential::none());
        assert!(matches!(result, Err(ChatError::Auth(_))));
    }

    #[test]
    fn connect_selects_variant() {
        let settings = Settings::default();
        let cloud = connect(BackendKind::Cloud, &settings, &StaticCredential::new("sk-test")).unwrap();
        assert_eq!(cloud.kind(), BackendKind::Cloud);

        let local = connect(BackendKind::Local, &settings, &StaticCredential::none()).unwrap();
        assert_eq!(local.kind(), BackendKind::Local);
    }

    #[tokio::test]
    async fn cloud_lists_its_configured_model() {
        let client = connect(BackendKind::Cloud, &Settings::default(), &StaticCredential::new("sk-test")).unwrap();
        assert_eq!(client.list_models().await.unwrap(), vec!["deepseek-reasoner".to_string()]);
    }
}
