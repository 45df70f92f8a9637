//! Turn engine for cotflow.
//!
//! - [`Segmenter`] — Splits a token stream into reasoning steps and answer text
//! - [`FlowGraphBuilder`] — Chains closed steps into a linear [`FlowGraph`](cotflow_core::FlowGraph)
//! - [`Orchestrator`] — Runs one turn at a time against the selected backend
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cotflow_config::{BackendKind, EnvCredentials, Settings};
//! use cotflow_engine::{ConversationState, DefaultConnector, Orchestrator, TurnInput};
//!
//! let settings = Settings::load()?;
//! let state = ConversationState::new((&settings.segmenter).into());
//! let orchestrator = Orchestrator::new(Arc::new(DefaultConnector::new(settings, Arc::new(EnvCredentials))));
//!
//! let (tx, mut rx) = tokio::sync::mpsc::channel(100);
//! let state = orchestrator
//!     .process(state, TurnInput::new(BackendKind::Cloud, "Why is the sky blue?"), &tx)
//!     .await?;
//! println!("{} steps", state.graph().len());
//! ```
//!
//! # Turn lifecycle
//!
//! 1. The connector builds the backend client (a missing cloud key fails here)
//! 2. Tokens are pulled one at a time and fed to the segmenter
//! 3. Each closed step becomes a node plus an edge from its predecessor
//! 4. The turn ends on `done`, an error, or cancellation
//!
//! Failures keep the partial graph and answer. Cancellation drops the stream
//! and discards the step that was still open.

mod graph;
mod orchestrator;
mod segmenter;

pub use graph::FlowGraphBuilder;
pub use orchestrator::{
    BackendConnector, ConversationSnapshot, ConversationState, DefaultConnector, Orchestrator, TurnInput,
    TurnOutcome, TurnPermit, TurnUpdate,
};
pub use segmenter::{SegmentEvent, SegmentedTurn, Segmenter, SegmenterConfig, SegmenterState};
