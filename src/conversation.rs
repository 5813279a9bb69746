//! Turn model for the chat transcript
//!
//! A turn pairs one committed user utterance with an optional assistant reply.
//! The reply is append-only while pending and immutable once sealed, apart
//! from the `saved` annotation.

use chrono::{DateTime, Local};
use serde::Serialize;

/// Lifecycle of the assistant half of a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyState {
    /// Assistant text still streaming
    Pending,
    /// Terminal `complete` received
    Complete,
    /// Sealed by an upstream `*_error`; content holds the error message
    Failed,
    /// Connection dropped while pending
    Incomplete,
}

impl ReplyState {
    pub fn is_sealed(&self) -> bool {
        !matches!(self, ReplyState::Pending)
    }
}

/// Assistant half of a turn
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantReply {
    pub content: String,
    pub state: ReplyState,
    /// Persistence acknowledgment received
    pub saved: bool,
    pub started_at: DateTime<Local>,
    pub sealed_at: Option<DateTime<Local>>,
}

/// One user utterance and its assistant reply
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub user_text: String,
    pub user_at: DateTime<Local>,
    pub reply: Option<AssistantReply>,
}

impl Turn {
    pub fn new(user_text: impl Into<String>) -> Self {
        Self {
            user_text: user_text.into(),
            user_at: Local::now(),
            reply: None,
        }
    }

    /// True while the assistant reply is still accepting chunks
    pub fn is_pending(&self) -> bool {
        matches!(
            self.reply,
            Some(AssistantReply {
                state: ReplyState::Pending,
                ..
            })
        )
    }
}

/// Errors for operations that would violate the turn invariants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnRejection {
    /// No pending reply to append to
    NotPending,
    /// The reply is sealed and can no longer change
    Sealed,
}

/// Ordered list of turns for the current page
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    turns: Vec<Turn>,
    /// Turns before this index came from history
    restored: usize,
}

/// Comparison form of an utterance: lowercased, outer punctuation stripped
pub fn normalize_utterance(text: &str) -> String {
    text.trim_matches(|c: char| c.is_whitespace() || ".,!?;:".contains(c))
        .to_lowercase()
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Commit a finalized user utterance as a new turn, returning its index
    pub fn commit_user(&mut self, text: impl Into<String>) -> usize {
        self.turns.push(Turn::new(text));
        self.turns.len() - 1
    }

    /// Append a turn restored from history; it is already sealed and saved
    pub fn push_restored(&mut self, user_text: String, assistant_text: Option<String>) {
        let now = Local::now();
        self.turns.push(Turn {
            user_text,
            user_at: now,
            reply: assistant_text.map(|content| AssistantReply {
                content,
                state: ReplyState::Complete,
                saved: true,
                started_at: now,
                sealed_at: Some(now),
            }),
        });
        self.restored = self.turns.len();
    }

    /// Replace the user text of turn `idx`, e.g. with its formatted form
    pub fn revise_user(&mut self, idx: usize, text: impl Into<String>) -> bool {
        match self.turns.get_mut(idx) {
            Some(turn) if idx >= self.restored => {
                turn.user_text = text.into();
                true
            }
            _ => false,
        }
    }

    /// Attach a new pending reply.
    ///
    /// It pairs with a live turn that has no reply yet, preferring one whose
    /// text matches `user_text` once normalized and otherwise the most recent.
    /// A new turn is opened only when every live turn already has a reply.
    pub fn open_reply(&mut self, user_text: &str) -> usize {
        let wanted = normalize_utterance(user_text);
        let unreplied = || {
            self.turns
                .iter()
                .enumerate()
                .skip(self.restored)
                .rev()
                .filter(|(_, t)| t.reply.is_none())
        };
        let paired = unreplied()
            .find(|(_, t)| !wanted.is_empty() && normalize_utterance(&t.user_text) == wanted)
            .or_else(|| unreplied().next())
            .map(|(idx, _)| idx);
        let idx = match paired {
            Some(idx) => idx,
            None => self.commit_user(user_text.to_string()),
        };
        self.turns[idx].reply = Some(AssistantReply {
            content: String::new(),
            state: ReplyState::Pending,
            saved: false,
            started_at: Local::now(),
            sealed_at: None,
        });
        idx
    }

    fn pending_reply_mut(&mut self) -> Option<&mut AssistantReply> {
        self.turns
            .iter_mut()
            .rev()
            .filter_map(|t| t.reply.as_mut())
            .find(|r| r.state == ReplyState::Pending)
    }

    /// Append a delta to the pending reply; returns the accumulated content
    pub fn append_reply(&mut self, delta: &str) -> Result<&str, TurnRejection> {
        let reply = self.pending_reply_mut().ok_or(TurnRejection::NotPending)?;
        reply.content.push_str(delta);
        Ok(&reply.content)
    }

    /// Seal the pending reply in `state`. `replacement` overwrites the content
    /// (used for failures and for a chunk-less completion).
    pub fn seal_reply(
        &mut self,
        state: ReplyState,
        replacement: Option<String>,
    ) -> Result<&AssistantReply, TurnRejection> {
        debug_assert!(state.is_sealed());
        let reply = self.pending_reply_mut().ok_or(TurnRejection::NotPending)?;
        if let Some(content) = replacement {
            reply.content = content;
        }
        reply.state = state;
        reply.sealed_at = Some(Local::now());
        Ok(reply)
    }

    /// Mark the most recently sealed reply as persisted
    pub fn mark_last_saved(&mut self) -> bool {
        let sealed = self
            .turns
            .iter_mut()
            .rev()
            .filter_map(|t| t.reply.as_mut())
            .find(|r| r.state.is_sealed());
        match sealed {
            Some(reply) => {
                reply.saved = true;
                true
            }
            None => false,
        }
    }

    /// Seal any pending reply as incomplete (connection lost)
    pub fn abandon_pending(&mut self) -> bool {
        self.seal_reply(ReplyState::Incomplete, None).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_reply_pairs_with_committed_user_turn() {
        let mut conv = Conversation::new();
        conv.commit_user("hello there");
        let idx = conv.open_reply("hello there");
        assert_eq!(idx, 0);
        assert_eq!(conv.len(), 1);
        assert!(conv.turns()[0].is_pending());
    }

    #[test]
    fn test_open_reply_without_committed_turn_opens_one() {
        let mut conv = Conversation::new();
        conv.open_reply("typed question");
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.turns()[0].user_text, "typed question");
    }

    #[test]
    fn test_open_reply_ignores_case_and_punctuation_differences() {
        let mut conv = Conversation::new();
        conv.commit_user("What time is it?");
        let idx = conv.open_reply("what time is it");
        assert_eq!(idx, 0);
        assert_eq!(conv.len(), 1);
        assert_eq!(conv.turns()[0].user_text, "What time is it?");
        assert!(conv.turns()[0].is_pending());
    }

    #[test]
    fn test_open_reply_pairs_with_latest_unreplied_turn_whatever_its_text() {
        let mut conv = Conversation::new();
        conv.commit_user("first");
        conv.open_reply("first");
        conv.seal_reply(ReplyState::Complete, None).unwrap();
        conv.commit_user("tell me a joke");

        let idx = conv.open_reply("tell me a different joke");
        assert_eq!(idx, 1);
        assert_eq!(conv.len(), 2);

        conv.seal_reply(ReplyState::Complete, None).unwrap();
        assert_eq!(conv.open_reply("typed"), 2);
        assert_eq!(conv.len(), 3);
    }

    #[test]
    fn test_open_reply_never_pairs_with_restored_turn() {
        let mut conv = Conversation::new();
        conv.push_restored("old question".to_string(), None);
        assert_eq!(conv.open_reply("old question"), 1);
        assert!(!conv.revise_user(0, "edited"));
    }

    #[test]
    fn test_normalize_utterance() {
        assert_eq!(normalize_utterance("  What time is it?! "), "what time is it");
        assert_eq!(normalize_utterance("..."), "");
    }

    #[test]
    fn test_sealed_reply_rejects_chunks() {
        let mut conv = Conversation::new();
        conv.open_reply("q");
        conv.append_reply("a").unwrap();
        conv.seal_reply(ReplyState::Complete, None).unwrap();

        assert_eq!(conv.append_reply("more"), Err(TurnRejection::NotPending));
        assert_eq!(conv.turns()[0].reply.as_ref().unwrap().content, "a");
    }

    #[test]
    fn test_mark_last_saved_targets_sealed_reply() {
        let mut conv = Conversation::new();
        assert!(!conv.mark_last_saved());

        conv.open_reply("q");
        conv.append_reply("answer").unwrap();
        assert!(!conv.mark_last_saved());

        conv.seal_reply(ReplyState::Complete, None).unwrap();
        assert!(conv.mark_last_saved());
        assert!(conv.turns()[0].reply.as_ref().unwrap().saved);
    }

    #[test]
    fn test_abandon_pending_keeps_turn_visible() {
        let mut conv = Conversation::new();
        conv.open_reply("q");
        conv.append_reply("partial ans").unwrap();
        assert!(conv.abandon_pending());

        let reply = conv.turns()[0].reply.as_ref().unwrap();
        assert_eq!(reply.state, ReplyState::Incomplete);
        assert_eq!(reply.content, "partial ans");
        assert!(!conv.abandon_pending());
    }

    #[test]
    fn test_restored_turns_are_saved() {
        let mut conv = Conversation::new();
        conv.push_restored("hi".to_string(), Some("hello".to_string()));
        let reply = conv.turns()[0].reply.as_ref().unwrap();
        assert!(reply.saved);
        assert_eq!(reply.state, ReplyState::Complete);
    }
}
