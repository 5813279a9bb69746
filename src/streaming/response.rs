//! Incremental assistant response rendering
//!
//! Chunks are deltas and are appended verbatim, the opposite convention from
//! transcript partials. A reply accepts chunks only between `start` and its
//! terminal event; a new `start` is required for the next one.

use crate::conversation::{Conversation, ReplyState, TurnRejection};

/// Result of feeding an assistant-generation event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// A pending reply was opened on turn `turn`
    Started { turn: usize },
    /// Full accumulated text after appending a chunk
    Updated(String),
    /// Reply sealed successfully with its final content
    Completed(String),
    /// Reply sealed as failed with the error message as content
    Failed(String),
    /// Event arrived with no pending reply and was dropped
    Rejected(TurnRejection),
}

#[derive(Debug, Clone, Default)]
pub struct ResponseRenderer {
    chunk_count: u64,
}

impl ResponseRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `llm_streaming_start`: seed a new pending reply paired with the just
    /// committed user text. A reply left pending by a previous start is
    /// sealed as incomplete first.
    pub fn start(&mut self, conversation: &mut Conversation, user_text: &str) -> ResponseOutcome {
        if conversation.abandon_pending() {
            log::warn!("Response: new start while a reply was pending; sealed it as incomplete");
        }
        self.chunk_count = 0;
        let turn = conversation.open_reply(user_text);
        log::info!("Response: streaming started on turn {}", turn);
        ResponseOutcome::Started { turn }
    }

    /// `llm_streaming_chunk`: append a delta
    pub fn chunk(&mut self, conversation: &mut Conversation, delta: &str) -> ResponseOutcome {
        match conversation.append_reply(delta) {
            Ok(content) => {
                self.chunk_count += 1;
                if self.chunk_count % 10 == 0 {
                    log::debug!(
                        "Response: {} chunks, {} chars accumulated",
                        self.chunk_count,
                        content.len()
                    );
                }
                ResponseOutcome::Updated(content.to_string())
            }
            Err(rejection) => {
                log::warn!("Response: chunk dropped ({:?})", rejection);
                ResponseOutcome::Rejected(rejection)
            }
        }
    }

    /// `llm_streaming_complete`: seal the reply.
    ///
    /// The sealed content is the concatenation of chunks. `complete_response`
    /// is used only when no chunk arrived at all.
    pub fn complete(
        &mut self,
        conversation: &mut Conversation,
        complete_response: &str,
    ) -> ResponseOutcome {
        let replacement = if self.chunk_count == 0 && !complete_response.is_empty() {
            Some(complete_response.to_string())
        } else {
            None
        };
        match conversation.seal_reply(ReplyState::Complete, replacement) {
            Ok(reply) => {
                log::info!(
                    "Response: completed ({} chunks, {} chars)",
                    self.chunk_count,
                    reply.content.len()
                );
                ResponseOutcome::Completed(reply.content.clone())
            }
            Err(rejection) => ResponseOutcome::Rejected(rejection),
        }
    }

    /// `llm_streaming_error`: seal the reply as failed, keeping it visible.
    /// With no pending reply the conversation is untouched.
    pub fn error(&mut self, conversation: &mut Conversation, message: &str) -> ResponseOutcome {
        match conversation.seal_reply(ReplyState::Failed, Some(message.to_string())) {
            Ok(reply) => {
                log::warn!("Response: generation failed: {}", message);
                ResponseOutcome::Failed(reply.content.clone())
            }
            Err(rejection) => {
                log::warn!("Response: generation error with no pending reply: {}", message);
                ResponseOutcome::Rejected(rejection)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(chunks: &[&str]) -> String {
        let mut conv = Conversation::new();
        let mut r = ResponseRenderer::new();
        conv.commit_user("say hello");
        r.start(&mut conv, "say hello");
        for c in chunks {
            r.chunk(&mut conv, c);
        }
        match r.complete(&mut conv, "ignored") {
            ResponseOutcome::Completed(text) => text,
            other => panic!("Expected Completed, got {:?}", other),
        }
    }

    #[test]
    fn test_content_is_independent_of_chunk_boundaries() {
        assert_eq!(run(&["he", "llo wor", "ld"]), "hello world");
        assert_eq!(run(&["hello world"]), "hello world");
    }

    #[test]
    fn test_chunks_after_complete_are_rejected() {
        let mut conv = Conversation::new();
        let mut r = ResponseRenderer::new();
        r.start(&mut conv, "q");
        r.chunk(&mut conv, "a");
        r.complete(&mut conv, "a");

        assert_eq!(
            r.chunk(&mut conv, "b"),
            ResponseOutcome::Rejected(TurnRejection::NotPending)
        );
        assert_eq!(conv.turns()[0].reply.as_ref().unwrap().content, "a");
    }

    #[test]
    fn test_error_seals_pending_reply_as_failed() {
        let mut conv = Conversation::new();
        let mut r = ResponseRenderer::new();
        r.start(&mut conv, "q");
        r.chunk(&mut conv, "partial");

        let outcome = r.error(&mut conv, "Error generating LLM response: quota");
        assert!(matches!(outcome, ResponseOutcome::Failed(_)));

        let turn = &conv.turns()[0];
        assert!(!turn.is_pending());
        let reply = turn.reply.as_ref().unwrap();
        assert_eq!(reply.state, ReplyState::Failed);
        assert_eq!(reply.content, "Error generating LLM response: quota");
    }

    #[test]
    fn test_error_without_pending_reply_is_rejected() {
        let mut conv = Conversation::new();
        let mut r = ResponseRenderer::new();
        conv.commit_user("q");

        assert_eq!(
            r.error(&mut conv, "boom"),
            ResponseOutcome::Rejected(TurnRejection::NotPending)
        );
        assert!(conv.turns()[0].reply.is_none());
    }

    #[test]
    fn test_complete_without_chunks_uses_complete_response() {
        let mut conv = Conversation::new();
        let mut r = ResponseRenderer::new();
        r.start(&mut conv, "q");
        assert_eq!(
            r.complete(&mut conv, "whole answer"),
            ResponseOutcome::Completed("whole answer".to_string())
        );
    }

    #[test]
    fn test_restart_seals_previous_as_incomplete() {
        let mut conv = Conversation::new();
        let mut r = ResponseRenderer::new();
        conv.commit_user("one");
        r.start(&mut conv, "one");
        r.chunk(&mut conv, "half");
        conv.commit_user("two");
        r.start(&mut conv, "two");

        assert_eq!(
            conv.turns()[0].reply.as_ref().unwrap().state,
            ReplyState::Incomplete
        );
        assert!(conv.turns()[1].is_pending());
    }
}
