//! Per-session turn buffer.
//!
//! A `SessionBuffer` holds the most recent turns of one conversation in
//! arrival order, bounded by `max_history` with FIFO eviction. It also
//! counts turns since the last reset, which drives compression.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::warn;

/// Instruction placed before the transcript when asking for a summary
pub const SUMMARY_PREAMBLE: &str = "Below is a conversation log. Each line is \"speaker: message\", oldest first.";

/// Instruction placed after the transcript when asking for a summary
pub const SUMMARY_POSTAMBLE: &str = "Summarize the conversation above in natural language, in at most 300 tokens. Keep who said what, the decisions and facts worth remembering, and preserve every time reference (dates, \"yesterday\", \"next week\") exactly as stated. Output only the summary.";

/// Whether a session is a one-to-one chat or a group chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Private,
    Group,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Group => write!(f, "group"),
        }
    }
}

/// Identifies one conversation: a user identity or a group identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub scope: ScopeKind,
    pub id: String,
}

impl SessionKey {
    pub fn private(user_id: impl Into<String>) -> Self {
        Self {
            scope: ScopeKind::Private,
            id: user_id.into(),
        }
    }

    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            scope: ScopeKind::Group,
            id: group_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope, self.id)
    }
}

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

/// One message in a session. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub speaker_label: String,
    pub content: String,
    /// Assigned by the buffer on append; unique and increasing per session
    pub sequence_no: u64,
    pub at: DateTime<Utc>,
}

impl Turn {
    pub fn is_assistant(&self) -> bool {
        self.speaker == Speaker::Assistant
    }
}

/// Turns drained from a buffer for compression, together with the prompt
/// rendered from them.
#[derive(Debug, Clone)]
pub struct BufferSnapshot {
    pub prompt: String,
    pub turns: Vec<Turn>,
    pub turn_count: usize,
}

impl BufferSnapshot {
    /// Sequence number of the oldest drained turn
    pub fn first_sequence_no(&self) -> Option<u64> {
        self.turns.first().map(|t| t.sequence_no)
    }
}

/// Bounded, ordered log of the recent turns of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBuffer {
    key: SessionKey,
    max_history: usize,
    turns: VecDeque<Turn>,
    turn_count_since_reset: usize,
    next_seq: u64,
}

impl SessionBuffer {
    pub fn new(key: SessionKey, max_history: usize) -> Self {
        Self {
            key,
            max_history: max_history.max(1),
            turns: VecDeque::new(),
            turn_count_since_reset: 0,
            next_seq: 0,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn turns(&self) -> impl Iterator<Item = &Turn> {
        self.turns.iter()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Change the bound, evicting immediately if the buffer is now over it
    pub fn set_max_history(&mut self, max_history: usize) {
        self.max_history = max_history.max(1);
        self.evict_overflow();
    }

    pub fn turn_count_since_reset(&self) -> usize {
        self.turn_count_since_reset
    }

    /// Sequence number the next appended turn will receive
    pub fn next_sequence_no(&self) -> u64 {
        self.next_seq
    }

    /// Append a turn, evicting the oldest ones past `max_history`.
    ///
    /// Returns the sequence number assigned to the new turn.
    pub fn append(
        &mut self,
        speaker: Speaker,
        speaker_label: impl Into<String>,
        content: impl Into<String>,
    ) -> u64 {
        let sequence_no = self.next_seq;
        self.next_seq += 1;
        self.turns.push_back(Turn {
            speaker,
            speaker_label: speaker_label.into(),
            content: content.into(),
            sequence_no,
            at: Utc::now(),
        });
        self.turn_count_since_reset += 1;
        self.evict_overflow();
        sequence_no
    }

    /// Render the buffer as a summarization prompt.
    ///
    /// Depends only on the turn list: rendering twice without an append in
    /// between yields the same text.
    pub fn render_for_summary(&self) -> String {
        let transcript = self
            .turns
            .iter()
            .map(|t| format!("{}: {}", t.speaker_label, t.content))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "{}\n\n{}\n\n{}",
            SUMMARY_PREAMBLE, transcript, SUMMARY_POSTAMBLE
        )
    }

    /// Drop all turns and zero the counter. Sequence numbers keep counting.
    pub fn reset(&mut self) {
        self.turns.clear();
        self.turn_count_since_reset = 0;
    }

    /// Render the prompt, then drain the buffer in one step.
    pub fn take_snapshot(&mut self) -> BufferSnapshot {
        let prompt = self.render_for_summary();
        let turn_count = self.turn_count_since_reset;
        let turns: Vec<Turn> = self.turns.drain(..).collect();
        self.turn_count_since_reset = 0;
        BufferSnapshot {
            prompt,
            turns,
            turn_count,
        }
    }

    /// Put back the turns of a snapshot whose compression failed.
    ///
    /// Snapshot turns are older than anything appended since, so they go in
    /// front. The counter resumes where it would have been without the
    /// snapshot. Returns how many turns had to be evicted to stay within
    /// `max_history`.
    pub fn restore(&mut self, snapshot: BufferSnapshot) -> usize {
        let mut restored: VecDeque<Turn> = snapshot.turns.into();
        restored.extend(self.turns.drain(..));
        self.turns = restored;
        self.turn_count_since_reset += snapshot.turn_count;

        let dropped = self.evict_overflow();
        if dropped > 0 {
            warn!(
                "{}: {} turns from a failed compression exceeded max_history ({}) and were dropped",
                self.key, dropped, self.max_history
            );
        }
        dropped
    }

    /// Oldest first. Returns the number of turns evicted.
    fn evict_overflow(&mut self) -> usize {
        let excess = self.turns.len().saturating_sub(self.max_history);
        self.turns.drain(..excess);
        excess
    }
}
