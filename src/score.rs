//! Extraction of the end-of-session score from the agent's streamed text.
//!
//! After every fragment the widest span from the first `{` to the last `}` is tried as
//! JSON. This is a heuristic: stray braces in conversation can hide a score until the
//! span parses again. The first object carrying `fluency_score` wins and is never
//! replaced.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionScore {
    pub fluency_score: f64,
    #[serde(default)]
    pub vocabulary_score: f64,
    #[serde(default)]
    pub confidence_score: f64,
    #[serde(default)]
    pub key_phrases: Vec<String>,
    #[serde(default)]
    pub feedback: String,
}

#[derive(Debug, Default)]
pub struct ScoreExtractor {
    buffer: String,
    score: Option<SessionScore>,
}

impl ScoreExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment. Returns the score the first time one becomes parseable.
    pub fn push(&mut self, fragment: &str) -> Option<SessionScore> {
        self.buffer.push_str(fragment);
        if self.score.is_some() {
            return None;
        }

        let score = widest_span(&self.buffer).and_then(parse_score)?;
        log::info!(
            "Session score: fluency={}, vocabulary={}, confidence={}",
            score.fluency_score,
            score.vocabulary_score,
            score.confidence_score
        );
        self.score = Some(score.clone());
        Some(score)
    }

    /// Everything received so far.
    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn score(&self) -> Option<&SessionScore> {
        self.score.as_ref()
    }

    /// Forget the text and the score, ready for a new session.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.score = None;
    }
}

fn widest_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

// Incomplete or foreign JSON is the normal state until the object is done.
fn parse_score(span: &str) -> Option<SessionScore> {
    let value: Value = serde_json::from_str(span).ok()?;
    if value.get("fluency_score").is_none() {
        return None;
    }
    serde_json::from_value(value).ok()
}
