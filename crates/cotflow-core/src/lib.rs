//! Core domain types and error definitions for cotflow.
//!
//! This crate provides the fundamental types shared across the workspace:
//!
//! - [`ChatError`] — Error taxonomy for backend and stream failures
//! - [`Message`] and [`Role`] — Conversation message types
//! - [`ChatRequest`] — One user turn's request to a backend
//! - [`ChatToken`] and [`TokenStream`] — Streamed backend output
//! - [`ReasoningStep`], [`FlowEdge`], [`FlowGraph`] — Segmented reasoning
//!
//! # Example
//!
//! ```rust
//! use cotflow_core::{ChatRequest, Message, Role};
//!
//! let request = ChatRequest::new("deepseek-reasoner", "Why is the sky blue?")
//!     .with_history(vec![Message::user("Hi"), Message::assistant("Hello!")]);
//!
//! let messages = request.messages();
//! assert_eq!(messages.len(), 3);
//! assert_eq!(messages[2].role, Role::User);
//! ```

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while talking to a backend or consuming its stream.
///
/// All variants are scoped to a single turn. None of them are retried by the
/// pipeline itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// Credential missing, malformed, or rejected by the cloud service.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Local model service unreachable or has no models.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Transient I/O failure, timeout, or malformed HTTP response.
    #[error("Network error: {0}")]
    Network(String),

    /// Tokens violated the stream contract (e.g. tokens after `done`).
    #[error("Stream protocol violation: {0}")]
    StreamProtocol(String),

    /// A turn is already streaming on this conversation.
    #[error("A turn is already in progress")]
    TurnInProgress,
}

impl ChatError {
    /// Short machine-readable name for the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Auth(_) => "auth",
            ChatError::BackendUnavailable(_) => "backend_unavailable",
            ChatError::Network(_) => "network",
            ChatError::StreamProtocol(_) => "stream_protocol",
            ChatError::TurnInProgress => "turn_in_progress",
        }
    }
}

// ============================================================================
// Messages and requests
// ============================================================================

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions for the model.
    System,
    /// Message from the user.
    User,
    /// Message from the assistant/LLM.
    Assistant,
}

impl Role {
    /// Wire name used by both backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// A single message in a conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// The role of the message sender.
    pub role: Role,
    /// The content of the message.
    pub content: String,
}

impl Message {
    /// Creates a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into() }
    }

    /// Creates a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    /// Creates a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

/// The request for one user turn.
///
/// Built once per turn and never mutated afterwards; the builder methods
/// consume `self`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model identifier understood by the selected backend.
    pub model: String,
    /// The user's prompt for this turn.
    pub prompt: String,
    /// Prior exchanges, oldest first.
    #[serde(default)]
    pub history: Vec<Message>,
    /// Optional system prompt sent ahead of the history.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl ChatRequest {
    /// Creates a request with no history.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            history: Vec::new(),
            system_prompt: None,
        }
    }

    /// Sets the conversation history.
    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    /// Sets the system prompt. Blank prompts are ignored.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        self.system_prompt = (!system_prompt.trim().is_empty()).then_some(system_prompt);
        self
    }

    /// Full message list: system prompt, history, then the prompt as a user message.
    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(Message::user(self.prompt.clone()));
        messages
    }
}

// ============================================================================
// Streaming
// ============================================================================

/// One unit of streamed backend output.
///
/// Tokens must be consumed in arrival order. `Done` is terminal and appears
/// exactly once per well-formed stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum ChatToken {
    /// Fragment of chain-of-thought text.
    ReasoningDelta(String),
    /// Fragment of the final answer.
    AnswerDelta(String),
    /// End of stream.
    Done,
}

impl ChatToken {
    /// Creates a reasoning fragment.
    pub fn reasoning(text: impl Into<String>) -> Self {
        ChatToken::ReasoningDelta(text.into())
    }

    /// Creates an answer fragment.
    pub fn answer(text: impl Into<String>) -> Self {
        ChatToken::AnswerDelta(text.into())
    }
}

/// A lazy, single-pass stream of tokens from a backend.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<ChatToken, ChatError>> + Send>>;

// ============================================================================
// Reasoning flow
// ============================================================================

/// A closed, discrete step of the model's reasoning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasoningStep {
    /// Position in the flow, starting at 1.
    pub step_id: u32,
    /// Display label, e.g. "Step 3".
    pub label: String,
    /// The step's reasoning text.
    pub text: String,
}

impl ReasoningStep {
    /// Creates a step with the default "Step N" label.
    pub fn new(step_id: u32, text: impl Into<String>) -> Self {
        Self {
            step_id,
            label: format!("Step {step_id}"),
            text: text.into(),
        }
    }

    /// Single-line abbreviation of the text, cut after `max_chars` characters.
    ///
    /// ```rust
    /// use cotflow_core::ReasoningStep;
    ///
    /// let step = ReasoningStep::new(1, "First, recall\nthe definition of a prime.");
    /// assert_eq!(step.preview(13), "First, recall…");
    /// assert_eq!(step.preview(100), "First, recall the definition of a prime.");
    /// ```
    pub fn preview(&self, max_chars: usize) -> String {
        let flat = self.text.trim().replace('\n', " ");
        match flat.char_indices().nth(max_chars) {
            Some((cut, _)) => format!("{}…", &flat[..cut]),
            None => flat,
        }
    }
}

/// A directed edge between two consecutive steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: u32,
    pub to: u32,
}

/// Linear flow of reasoning steps handed to the renderer.
///
/// Edges connect consecutive nodes in arrival order; there is no branching
/// and no cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub nodes: Vec<ReasoningStep>,
    pub edges: Vec<FlowEdge>,
}

impl FlowGraph {
    /// Returns `true` if the model produced no visible reasoning.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of steps in the flow.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// The most recently added step.
    pub fn last(&self) -> Option<&ReasoningStep> {
        self.nodes.last()
    }
}
