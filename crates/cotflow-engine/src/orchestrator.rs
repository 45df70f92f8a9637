//! Turn orchestration: one request, one token stream, one flow graph.

use std::sync::{Arc, Mutex};

use cotflow_config::{BackendKind, CredentialProvider, Settings};
use cotflow_core::{ChatError, ChatRequest, FlowEdge, FlowGraph, Message, ReasoningStep};
use cotflow_llm::BackendClient;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::graph::FlowGraphBuilder;
use crate::segmenter::{SegmentEvent, Segmenter, SegmenterConfig};

/// Produces the backend client for a turn.
pub trait BackendConnector: Send + Sync {
    fn connect(&self, kind: BackendKind) -> Result<Box<dyn BackendClient>, ChatError>;

    /// Model used when the turn names none.
    fn default_model(&self, kind: BackendKind) -> Option<String>;
}

/// Connects through [`cotflow_llm::connect`] using loaded settings.
pub struct DefaultConnector {
    settings: Settings,
    credentials: Arc<dyn CredentialProvider>,
}

impl DefaultConnector {
    pub fn new(settings: Settings, credentials: Arc<dyn CredentialProvider>) -> Self {
        Self { settings, credentials }
    }
}

impl BackendConnector for DefaultConnector {
    fn connect(&self, kind: BackendKind) -> Result<Box<dyn BackendClient>, ChatError> {
        cotflow_llm::connect(kind, &self.settings, self.credentials.as_ref())
    }

    fn default_model(&self, kind: BackendKind) -> Option<String> {
        match kind {
            BackendKind::Cloud => Some(self.settings.cloud.model.clone()),
            BackendKind::Local => self.settings.local.default_model.clone(),
        }
    }
}

/// What the user submitted for one turn.
#[derive(Debug, Clone)]
pub struct TurnInput {
    pub backend: BackendKind,
    pub model: Option<String>,
    pub prompt: String,
    pub history: Vec<Message>,
    pub system_prompt: Option<String>,
}

impl TurnInput {
    pub fn new(backend: BackendKind, prompt: impl Into<String>) -> Self {
        Self {
            backend,
            model: None,
            prompt: prompt.into(),
            history: Vec::new(),
            system_prompt: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

/// Incremental output delivered to the renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnUpdate {
    Started {
        turn_id: Uuid,
        backend: BackendKind,
        model: String,
    },
    StepAdded {
        step: ReasoningStep,
        edge: Option<FlowEdge>,
    },
    /// Newly streamed answer text; the renderer appends it.
    Answer { delta: String },
    Failed { kind: String, message: String },
    Cancelled,
    Completed { steps: usize, answer_len: usize },
}

/// How the last turn ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    #[default]
    Idle,
    Completed,
    Cancelled,
    Failed { kind: String, message: String },
}

impl TurnOutcome {
    fn failed(err: &ChatError) -> Self {
        Self::Failed {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Everything one turn produces, passed into and returned from
/// [`Orchestrator::run_turn`].
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turn_id: Option<Uuid>,
    request: Option<ChatRequest>,
    segmenter: Segmenter,
    graph: FlowGraphBuilder,
    answer: String,
    outcome: TurnOutcome,
}

/// Serializable view of a [`ConversationState`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSnapshot {
    pub turn_id: Option<Uuid>,
    pub graph: FlowGraph,
    pub answer: String,
    pub outcome: TurnOutcome,
}

impl ConversationState {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            segmenter: Segmenter::new(config),
            ..Self::default()
        }
    }

    /// Clears the previous turn's output, keeping segmenter tuning.
    pub fn reset(&mut self) {
        self.turn_id = None;
        self.request = None;
        self.segmenter.reset();
        self.graph.clear();
        self.answer.clear();
        self.outcome = TurnOutcome::Idle;
    }

    pub fn turn_id(&self) -> Option<Uuid> {
        self.turn_id
    }

    pub fn request(&self) -> Option<&ChatRequest> {
        self.request.as_ref()
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    pub fn graph(&self) -> &FlowGraph {
        self.graph.graph()
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn outcome(&self) -> &TurnOutcome {
        &self.outcome
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            turn_id: self.turn_id,
            graph: self.graph().clone(),
            answer: self.answer.clone(),
            outcome: self.outcome.clone(),
        }
    }
}

type ActiveSlot = Arc<Mutex<Option<CancellationToken>>>;

/// Exclusive right to run a turn; releases the slot on drop.
#[derive(Debug)]
pub struct TurnPermit {
    slot: ActiveSlot,
    cancel: CancellationToken,
}

impl TurnPermit {
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        if let Ok(mut active) = self.slot.lock() {
            *active = None;
        }
    }
}

enum TurnEnd {
    Completed,
    Cancelled,
}

/// Drives turns against whichever backend each turn selects.
pub struct Orchestrator {
    connector: Arc<dyn BackendConnector>,
    active: ActiveSlot,
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            connector,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn connector(&self) -> &Arc<dyn BackendConnector> {
        &self.connector
    }

    /// Claims the single turn slot.
    pub fn begin_turn(&self) -> Result<TurnPermit, ChatError> {
        let mut active = self.active.lock().map_err(|_| ChatError::TurnInProgress)?;
        if active.is_some() {
            return Err(ChatError::TurnInProgress);
        }
        let cancel = CancellationToken::new();
        *active = Some(cancel.clone());
        Ok(TurnPermit {
            slot: self.active.clone(),
            cancel,
        })
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().map(|a| a.is_some()).unwrap_or(true)
    }

    /// Cancels the active turn. Returns `false` when none is running.
    pub fn cancel(&self) -> bool {
        let Ok(active) = self.active.lock() else {
            return false;
        };
        match active.as_ref() {
            Some(token) => {
                info!("Cancelling active turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Claims the slot and runs a turn; refuses with
    /// [`ChatError::TurnInProgress`] while another is open.
    pub async fn process(
        &self,
        state: ConversationState,
        input: TurnInput,
        updates: &mpsc::Sender<TurnUpdate>,
    ) -> Result<ConversationState, ChatError> {
        let permit = self.begin_turn()?;
        Ok(self.run_turn(&permit, state, input, updates).await)
    }

    /// Runs one turn to completion, failure, or cancellation.
    ///
    /// The outcome is recorded in the returned state; failures are also
    /// sent as [`TurnUpdate::Failed`]. Nothing is retried. The slot stays
    /// claimed until the caller drops `permit`, so the returned state can be
    /// stored before another turn starts.
    pub async fn run_turn(
        &self,
        permit: &TurnPermit,
        mut state: ConversationState,
        input: TurnInput,
        updates: &mpsc::Sender<TurnUpdate>,
    ) -> ConversationState {
        state.reset();
        let turn_id = Uuid::new_v4();
        state.turn_id = Some(turn_id);
        let cancel = permit.cancel.clone();

        info!("Turn {} starting on {} backend", turn_id, input.backend);

        match self.drive(&mut state, input, updates, &cancel).await {
            Ok(TurnEnd::Completed) => {
                let steps = state.graph().len();
                let answer_len = state.answer.chars().count();
                info!("Turn {} completed: {} steps, {} answer chars", turn_id, steps, answer_len);
                state.outcome = TurnOutcome::Completed;
                emit(updates, TurnUpdate::Completed { steps, answer_len }).await;
            }
            Ok(TurnEnd::Cancelled) => {
                info!("Turn {} cancelled", turn_id);
                state.segmenter.reset();
                state.outcome = TurnOutcome::Cancelled;
                emit(updates, TurnUpdate::Cancelled).await;
            }
            Err(err) => {
                error!("Turn {} failed: {}", turn_id, err);
                if let Some(step) = state.segmenter.close_open_step() {
                    let edge = state.graph.push(step.clone());
                    emit(updates, TurnUpdate::StepAdded { step, edge }).await;
                }
                state.outcome = TurnOutcome::failed(&err);
                emit(
                    updates,
                    TurnUpdate::Failed {
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    },
                )
                .await;
            }
        }

        state
    }

    async fn drive(
        &self,
        state: &mut ConversationState,
        input: TurnInput,
        updates: &mpsc::Sender<TurnUpdate>,
        cancel: &CancellationToken,
    ) -> Result<TurnEnd, ChatError> {
        let client = self.connector.connect(input.backend)?;

        let model = match input.model.filter(|m| !m.trim().is_empty()) {
            Some(model) => model,
            None => tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
                model = self.resolve_model(client.as_ref(), input.backend) => model?,
            },
        };

        let mut request = ChatRequest::new(model.clone(), input.prompt).with_history(input.history);
        if let Some(system_prompt) = input.system_prompt {
            request = request.with_system_prompt(system_prompt);
        }
        state.request = Some(request.clone());

        if !emit(
            updates,
            TurnUpdate::Started {
                turn_id: state.turn_id.unwrap_or(Uuid::nil()),
                backend: input.backend,
                model,
            },
        )
        .await
        {
            cancel.cancel();
        }

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
            stream = client.send(&request) => stream?,
        };

        let mut saw_done = false;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TurnEnd::Cancelled),
                next = stream.next() => next,
            };
            let Some(token) = next else { break };
            let token = token?;

            if token == cotflow_core::ChatToken::Done {
                saw_done = true;
            }
            for event in state.segmenter.push(token)? {
                let delivered = match event {
                    SegmentEvent::StepClosed(step) => {
                        let edge = state.graph.push(step.clone());
                        emit(updates, TurnUpdate::StepAdded { step, edge }).await
                    }
                    SegmentEvent::AnswerDelta(delta) => {
                        state.answer.push_str(&delta);
                        emit(updates, TurnUpdate::Answer { delta }).await
                    }
                    SegmentEvent::Finished => true,
                };
                if !delivered {
                    warn!("Update receiver dropped; cancelling turn");
                    cancel.cancel();
                }
            }
        }

        if !saw_done {
            return Err(ChatError::StreamProtocol("stream ended without done".into()));
        }
        Ok(TurnEnd::Completed)
    }

    /// Configured default, else the first model the backend reports.
    async fn resolve_model(&self, client: &dyn BackendClient, kind: BackendKind) -> Result<String, ChatError> {
        if let Some(model) = self.connector.default_model(kind).filter(|m| !m.trim().is_empty()) {
            return Ok(model);
        }
        let models = client.list_models().await?;
        let model = models
            .into_iter()
            .next()
            .ok_or_else(|| ChatError::BackendUnavailable("no model available".into()))?;
        debug!("No model selected; using discovered {}", model);
        Ok(model)
    }
}

/// Sends an update; `false` once the receiver is gone.
async fn emit(updates: &mpsc::Sender<TurnUpdate>, update: TurnUpdate) -> bool {
    updates.send(update).await.is_ok()
}
