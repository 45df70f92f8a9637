//! Incremental segmentation of a token stream into reasoning steps.
//!
//! The segmenter is a four-state machine:
//!
//! | State | `reasoning_delta` | `answer_delta` | `done` |
//! |-------|-------------------|----------------|--------|
//! | `AwaitingFirst` | open step, → `InReasoning` | → `InAnswer` | → `Done` |
//! | `InReasoning` | append, split at boundaries | close step, → `InAnswer` | close step, → `Done` |
//! | `InAnswer` | ignored (anomaly) | append | → `Done` |
//! | `Done` | protocol error | protocol error | protocol error |
//!
//! Step boundaries are a blank line, a numbered-list marker at the start of a
//! line (`2.`, `3)`, `4、`), or an optional literal marker configured for
//! backends that emit one. Segmentation of free-form text is best-effort.

use std::sync::LazyLock;

use cotflow_config::SegmenterSettings;
use cotflow_core::{ChatError, ChatToken, ReasoningStep};
use regex::Regex;
use tracing::{debug, warn};

static BLANK_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t\r]*\n[ \t\r\n]*").expect("valid blank-line pattern"));

static NUMBERED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\n[ \t]*(?:\d{1,3}[.)][ \t]|\d{1,3}、)").expect("valid numbered-line pattern")
});

/// Segmenter position in the token stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    AwaitingFirst,
    InReasoning,
    InAnswer,
    Done,
}

/// Output of feeding one token to the segmenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    /// A reasoning step is complete and will not change again.
    StepClosed(ReasoningStep),
    /// Answer text to append.
    AnswerDelta(String),
    /// The stream reached `done`.
    Finished,
}

/// Boundary-detection tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmenterConfig {
    /// Once this many steps exist, further text joins the last one.
    pub max_steps: Option<usize>,
    /// Literal step separator; removed from step text.
    pub boundary_marker: Option<String>,
}

impl From<&SegmenterSettings> for SegmenterConfig {
    fn from(settings: &SegmenterSettings) -> Self {
        Self {
            max_steps: settings.max_steps,
            boundary_marker: settings.boundary_marker.clone().filter(|m| !m.is_empty()),
        }
    }
}

/// A located boundary: the step ends at `start`, the next begins at `resume`.
#[derive(Debug, Clone, Copy)]
struct Boundary {
    start: usize,
    resume: usize,
}

/// Everything a complete token sequence segments into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentedTurn {
    pub steps: Vec<ReasoningStep>,
    pub answer: String,
}

/// Splits one turn's tokens into reasoning steps and answer text.
///
/// Holds only the open step's text; closed steps are handed out as
/// [`SegmentEvent::StepClosed`] and not retained.
#[derive(Debug, Clone)]
pub struct Segmenter {
    config: SegmenterConfig,
    state: SegmenterState,
    open: String,
    emitted: u32,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(SegmenterConfig::default())
    }
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            state: SegmenterState::AwaitingFirst,
            open: String::new(),
            emitted: 0,
        }
    }

    pub fn state(&self) -> SegmenterState {
        self.state
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Number of steps closed so far this turn.
    pub fn steps_emitted(&self) -> u32 {
        self.emitted
    }

    /// Text of the step still being written, untrimmed.
    pub fn open_step_text(&self) -> &str {
        &self.open
    }

    /// Discards all per-turn state.
    pub fn reset(&mut self) {
        self.state = SegmenterState::AwaitingFirst;
        self.open.clear();
        self.emitted = 0;
    }

    /// Feeds the next token.
    ///
    /// After `done`, every token is rejected with
    /// [`ChatError::StreamProtocol`] and nothing changes.
    pub fn push(&mut self, token: ChatToken) -> Result<Vec<SegmentEvent>, ChatError> {
        let mut events = Vec::new();

        match (self.state, token) {
            (SegmenterState::Done, token) => {
                return Err(ChatError::StreamProtocol(format!(
                    "{} received after done",
                    token_name(&token)
                )));
            }
            (SegmenterState::AwaitingFirst | SegmenterState::InReasoning, ChatToken::ReasoningDelta(text)) => {
                self.state = SegmenterState::InReasoning;
                self.append_reasoning(&text, &mut events);
            }
            (SegmenterState::InReasoning, ChatToken::AnswerDelta(text)) => {
                self.close_open(&mut events);
                self.state = SegmenterState::InAnswer;
                push_answer(text, &mut events);
            }
            (SegmenterState::AwaitingFirst | SegmenterState::InAnswer, ChatToken::AnswerDelta(text)) => {
                self.state = SegmenterState::InAnswer;
                push_answer(text, &mut events);
            }
            (SegmenterState::InAnswer, ChatToken::ReasoningDelta(text)) => {
                warn!("Ignoring {} bytes of reasoning after the answer began", text.len());
            }
            (_, ChatToken::Done) => {
                self.close_open(&mut events);
                self.state = SegmenterState::Done;
                events.push(SegmentEvent::Finished);
            }
        }

        Ok(events)
    }

    /// Closes the open step without ending the stream.
    ///
    /// Used when a turn fails, so the reasoning produced so far is kept.
    pub fn close_open_step(&mut self) -> Option<ReasoningStep> {
        let mut events = Vec::new();
        self.close_open(&mut events);
        events.into_iter().find_map(|e| match e {
            SegmentEvent::StepClosed(step) => Some(step),
            _ => None,
        })
    }

    /// Segments a complete token sequence from a fresh state.
    pub fn segment_all<I>(&mut self, tokens: I) -> Result<SegmentedTurn, ChatError>
    where
        I: IntoIterator<Item = ChatToken>,
    {
        self.reset();
        let mut turn = SegmentedTurn::default();

        for token in tokens {
            for event in self.push(token)? {
                match event {
                    SegmentEvent::StepClosed(step) => turn.steps.push(step),
                    SegmentEvent::AnswerDelta(text) => turn.answer.push_str(&text),
                    SegmentEvent::Finished => {}
                }
            }
        }

        Ok(turn)
    }

    fn append_reasoning(&mut self, text: &str, events: &mut Vec<SegmentEvent>) {
        self.open.push_str(text);

        while let Some(boundary) = self.find_boundary() {
            let rest = self.open.split_off(boundary.resume);
            self.open.truncate(boundary.start);
            self.close_open(events);
            self.open = rest;
        }
    }

    /// Earliest boundary in the open text, unless the step cap is reached.
    fn find_boundary(&self) -> Option<Boundary> {
        let at_cap = self
            .config
            .max_steps
            .is_some_and(|max| self.emitted as usize + 1 >= max);
        if at_cap {
            return None;
        }

        let text = self.open.as_str();
        let blank = BLANK_LINE.find(text).map(|m| Boundary { start: m.start(), resume: m.end() });
        // The newline goes; the marker stays at the head of the next step.
        let numbered = NUMBERED_LINE
            .find(text)
            .map(|m| Boundary { start: m.start(), resume: m.start() + 1 });
        let marker = self.config.boundary_marker.as_deref().and_then(|marker| {
            text.find(marker).map(|pos| Boundary { start: pos, resume: pos + marker.len() })
        });

        [blank, numbered, marker]
            .into_iter()
            .flatten()
            .min_by(|a, b| a.start.cmp(&b.start).then(b.resume.cmp(&a.resume)))
    }

    /// Emits the open step if it has non-blank text; blank steps are dropped.
    fn close_open(&mut self, events: &mut Vec<SegmentEvent>) {
        let text = self.open.trim();
        if !text.is_empty() {
            self.emitted += 1;
            debug!("Closing reasoning step {} ({} chars)", self.emitted, text.len());
            events.push(SegmentEvent::StepClosed(ReasoningStep::new(self.emitted, text)));
        }
        self.open.clear();
    }
}

fn push_answer(text: String, events: &mut Vec<SegmentEvent>) {
    if !text.is_empty() {
        events.push(SegmentEvent::AnswerDelta(text));
    }
}

fn token_name(token: &ChatToken) -> &'static str {
    match token {
        ChatToken::ReasoningDelta(_) => "reasoning_delta",
        ChatToken::AnswerDelta(_) => "answer_delta",
        ChatToken::Done => "done",
    }
}
