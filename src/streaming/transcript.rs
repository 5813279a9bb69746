//! Incremental transcript rendering
//!
//! Partials are full-text snapshots of the utterance so far, so each one
//! replaces the live line. A final or turn-boundary event commits the text.
//!
//! The backend sends `final_transcript` and then `turn_end` for the same
//! utterance. The second event is absorbed so one utterance yields one turn.
//! With turn formatting enabled the pair arrives twice, unformatted first;
//! events tagged with the committed `turn_order` revise that turn instead.

use crate::conversation::normalize_utterance;

/// What a transcript event did to the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptOutcome {
    /// Live partial line replaced
    Partial(String),
    /// A new user turn must be committed with this text
    Committed(String),
    /// The committed utterance arrived again with different text
    Revised(String),
    /// Boundary for an utterance that was already committed
    AlreadyCommitted,
    /// Turn boundary with no text at all
    NoSpeech,
}

/// Tracks the live partial line and the last committed utterance
#[derive(Debug, Clone, Default)]
pub struct TranscriptRenderer {
    /// Latest partial snapshot (empty when no live line)
    live_partial: String,
    /// Text of the last `final_transcript`, awaiting its `turn_end`
    awaiting_boundary: Option<String>,
    last_commit: Option<CommittedUtterance>,
    /// A partial arrived after the last commit
    heard_since_commit: bool,
    partial_count: u64,
    committed_count: u64,
}

#[derive(Debug, Clone)]
struct CommittedUtterance {
    turn_order: Option<u64>,
    text: String,
}

impl TranscriptRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the live partial line
    pub fn on_partial(&mut self, text: &str) -> TranscriptOutcome {
        self.live_partial.clear();
        self.live_partial.push_str(text);
        // A partial means a new utterance has begun
        self.awaiting_boundary = None;
        self.heard_since_commit = true;
        self.partial_count += 1;

        if self.partial_count % 10 == 0 {
            log::debug!(
                "Transcript: {} partials, live line {} chars",
                self.partial_count,
                self.live_partial.len()
            );
        }
        TranscriptOutcome::Partial(self.live_partial.clone())
    }

    /// Handle `final_transcript`. Empty final text falls back to the live
    /// partial; if that is empty too, nothing was heard.
    pub fn on_final(&mut self, text: &str, turn_order: Option<u64>) -> TranscriptOutcome {
        let text = Self::pick_text(text, &self.live_partial);
        self.live_partial.clear();
        if let Some(outcome) = self.revisit(turn_order, &text) {
            self.awaiting_boundary = Some(text);
            return outcome;
        }
        if text.is_empty() {
            self.awaiting_boundary = None;
            return TranscriptOutcome::NoSpeech;
        }
        self.awaiting_boundary = Some(text.clone());
        self.commit(text, turn_order)
    }

    /// Handle `turn_end`. Commits unless the same utterance was already
    /// committed by a preceding `final_transcript`.
    pub fn on_turn_end(&mut self, final_transcript: &str, turn_order: Option<u64>) -> TranscriptOutcome {
        let trimmed = final_transcript.trim();

        let pending = self.awaiting_boundary.take();
        if let Some(outcome) = self.revisit(turn_order, trimmed) {
            self.live_partial.clear();
            return outcome;
        }
        if let Some(pending) = pending {
            if trimmed.is_empty() || trimmed == pending {
                self.live_partial.clear();
                return TranscriptOutcome::AlreadyCommitted;
            }
        }

        let text = Self::pick_text(trimmed, &self.live_partial);
        self.live_partial.clear();
        if text.is_empty() {
            log::info!("Transcript: turn ended with no speech");
            return TranscriptOutcome::NoSpeech;
        }
        self.commit(text, turn_order)
    }

    /// Match an event against the last committed utterance. The turn order
    /// decides when both sides carry one; otherwise the normalized text must
    /// match and no partial may have arrived in between.
    fn revisit(&mut self, turn_order: Option<u64>, text: &str) -> Option<TranscriptOutcome> {
        let heard_since_commit = self.heard_since_commit;
        let last = self.last_commit.as_mut()?;
        let same_turn = match (turn_order, last.turn_order) {
            (Some(order), Some(committed)) => order == committed,
            _ => {
                !heard_since_commit
                    && !text.is_empty()
                    && normalize_utterance(text) == normalize_utterance(&last.text)
            }
        };
        if !same_turn {
            return None;
        }
        if text.is_empty() || text == last.text {
            return Some(TranscriptOutcome::AlreadyCommitted);
        }
        log::debug!("Transcript: revised utterance #{}", self.committed_count);
        last.text = text.to_string();
        Some(TranscriptOutcome::Revised(last.text.clone()))
    }

    fn commit(&mut self, text: String, turn_order: Option<u64>) -> TranscriptOutcome {
        self.committed_count += 1;
        log::info!(
            "Transcript: committed utterance #{} ({} chars, after {} partials)",
            self.committed_count,
            text.len(),
            self.partial_count
        );
        self.partial_count = 0;
        self.heard_since_commit = false;
        self.last_commit = Some(CommittedUtterance {
            turn_order,
            text: text.clone(),
        });
        TranscriptOutcome::Committed(text)
    }

    fn pick_text(primary: &str, fallback: &str) -> String {
        let primary = primary.trim();
        if primary.is_empty() {
            fallback.trim().to_string()
        } else {
            primary.to_string()
        }
    }

    /// Current live partial, if any
    pub fn live_partial(&self) -> Option<&str> {
        if self.live_partial.is_empty() {
            None
        } else {
            Some(&self.live_partial)
        }
    }

    /// Drop the live line (recording stopped or connection lost)
    pub fn reset(&mut self) {
        self.live_partial.clear();
        self.awaiting_boundary = None;
        self.heard_since_commit = false;
        self.partial_count = 0;
    }
}
