//! Inline reasoning markers in local model output.
//!
//! Reasoning models served without a separate `thinking` field emit their
//! chain-of-thought inline, wrapped in `<think>…</think>` (or `<thinking>…`).
//! Tags may arrive split across chunks, so anything that could be the start
//! of a tag is held back until the next chunk decides it. Once answer text
//! has been emitted, later tags are passed through verbatim.

use cotflow_core::ChatToken;

const OPEN_TAGS: [&str; 2] = ["<think>", "<thinking>"];
const CLOSE_TAGS: [&str; 2] = ["</think>", "</thinking>"];

/// Splits streamed content into reasoning and answer tokens by inline tags.
#[derive(Debug, Default)]
pub struct ThinkTagSplitter {
    pending: String,
    inside: bool,
    answer_started: bool,
}

impl ThinkTagSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while inside an unclosed reasoning block.
    pub fn in_reasoning(&self) -> bool {
        self.inside
    }

    /// Feeds a content fragment, returning the tokens it resolves.
    pub fn push(&mut self, text: &str) -> Vec<ChatToken> {
        self.pending.push_str(text);
        let mut out = Vec::new();

        loop {
            // Tags are only honored before the answer; after that they are text.
            if !self.inside && self.answer_started {
                let rest = std::mem::take(&mut self.pending);
                self.emit(&rest, &mut out);
                break;
            }

            let tags: &[&str] = match self.inside {
                true => &CLOSE_TAGS,
                false => &OPEN_TAGS,
            };
            // ASCII lowercasing keeps byte offsets aligned with `pending`.
            let lower = self.pending.to_ascii_lowercase();

            match earliest_tag(&lower, tags) {
                Some((pos, len)) => {
                    let before: String = self.pending.drain(..pos).collect();
                    self.emit(&before, &mut out);
                    if !self.inside && self.answer_started {
                        continue;
                    }
                    self.pending.drain(..len);
                    self.inside = !self.inside;
                }
                None => {
                    let cut = self.pending.len() - partial_tag_len(&lower, tags);
                    let ready: String = self.pending.drain(..cut).collect();
                    self.emit(&ready, &mut out);
                    break;
                }
            }
        }

        out
    }

    /// Flushes held-back text at end of stream.
    pub fn finish(&mut self) -> Vec<ChatToken> {
        let rest = std::mem::take(&mut self.pending);
        let mut out = Vec::new();
        self.emit(&rest, &mut out);
        out
    }

    fn emit(&mut self, text: &str, out: &mut Vec<ChatToken>) {
        if self.inside {
            if !text.is_empty() {
                out.push(ChatToken::reasoning(text));
            }
            return;
        }

        // Whitespace around the reasoning block is not part of the answer.
        let text = match self.answer_started {
            true => text,
            false => text.trim_start(),
        };
        if !text.is_empty() {
            self.answer_started = true;
            out.push(ChatToken::answer(text));
        }
    }
}

/// Position and length of the first tag occurrence.
fn earliest_tag(haystack: &str, tags: &[&str]) -> Option<(usize, usize)> {
    tags.iter()
        .filter_map(|tag| haystack.find(tag).map(|pos| (pos, tag.len())))
        .min_by_key(|(pos, _)| *pos)
}

/// Length of the longest suffix that is a proper prefix of some tag.
fn partial_tag_len(haystack: &str, tags: &[&str]) -> usize {
    tags.iter()
        .flat_map(|tag| (1..tag.len()).rev().find(|k| haystack.ends_with(&tag[..*k])))
        .max()
        .unwrap_or(0)
}
