//! Streaming transcript aggregation.
//!
//! Partial fragments from the service are merged into one growing record per
//! conversational turn. A turn is identified by its id and closes only when
//! the speaker changes; the remote `turnComplete` flag is recorded but does
//! not split turns.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::protocol::Speaker;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptTurn {
    pub id: Uuid,
    pub speaker: Speaker,
    pub text: String,
    pub started_at: DateTime<Utc>,
    /// The service marked this turn complete at least once.
    pub remote_complete: bool,
}

impl TranscriptTurn {
    fn new(speaker: Speaker, text: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            speaker,
            text: text.to_string(),
            started_at: Utc::now(),
            remote_complete: false,
        }
    }
}

/// Merge one fragment into `turns`.
///
/// Same speaker as the last turn: the fragment is appended to that turn.
/// Different speaker or no turns yet: a new turn is opened. Empty text is a
/// no-op. Returns the index of the touched turn.
pub fn merge(turns: &mut Vec<TranscriptTurn>, text: &str, speaker: Speaker) -> Option<usize> {
    if text.is_empty() {
        return None;
    }

    match turns.last_mut() {
        Some(last) if last.speaker == speaker => last.text.push_str(text),
        _ => turns.push(TranscriptTurn::new(speaker, text)),
    }
    Some(turns.len() - 1)
}

/// Per-session accumulator of transcript turns.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    turns: Vec<TranscriptTurn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[TranscriptTurn] {
        &self.turns
    }

    pub fn current(&self) -> Option<&TranscriptTurn> {
        self.turns.last()
    }

    /// Merge a fragment and return the turn it landed in.
    pub fn push(
        &mut self,
        text: &str,
        speaker: Speaker,
        turn_complete: bool,
    ) -> Option<&TranscriptTurn> {
        let idx = merge(&mut self.turns, text, speaker)?;
        let turn = &mut self.turns[idx];
        turn.remote_complete |= turn_complete;
        Some(turn)
    }
}
